//! No-op central block.

use std::fmt;

use crate::blocks::{
    BlockContext, Capabilities, CentralBlock, CentralBlockType, CommonParameters, SaberBlock,
};
use crate::error::SaberResult;
use crate::field::FieldSet;
use crate::geometry::Geometry;
use crate::variables::Variables;

pub struct Id {
    geometry: Geometry,
    vars: Variables,
    active: Variables,
}

impl SaberBlock for Id {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::MULTIPLY | Capabilities::RANDOMIZE
    }

    fn active_vars(&self) -> &Variables {
        &self.active
    }
}

impl CentralBlock for Id {
    fn multiply(&self, _fset: &mut FieldSet) -> SaberResult<()> {
        Ok(())
    }

    fn randomize(&self, fset: &mut FieldSet, seed: u64) -> SaberResult<()> {
        *fset = FieldSet::random(&self.geometry, &self.vars, seed);
        Ok(())
    }
}

impl CentralBlockType for Id {
    const NAME: &'static str = "ID";
    type Parameters = CommonParameters;

    fn new(
        ctx: &BlockContext<'_>,
        vars: &Variables,
        active: Variables,
        _params: CommonParameters,
    ) -> SaberResult<Self> {
        Ok(Self {
            geometry: ctx.geometry.clone(),
            vars: vars.clone(),
            active,
        })
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ID on {}", self.active)
    }
}
