//! Standard-deviation outer block: x ↦ σ ⊙ x.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::blocks::parameters::ParameterKey;
use crate::blocks::{
    BlockContext, BlockParameters, Capabilities, OuterBlock, OuterBlockType, ParameterKind,
    SaberBlock, SaberBlockParameters,
};
use crate::error::{SaberError, SaberResult};
use crate::field::FieldSet;
use crate::geometry::Geometry;
use crate::io;
use crate::moments::Moments;
use crate::variables::Variables;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StdDevParameters {
    #[serde(flatten)]
    pub base: SaberBlockParameters,
    #[serde(default = "default_value")]
    pub value: f64,
}

fn default_value() -> f64 {
    1.0
}

impl Default for StdDevParameters {
    fn default() -> Self {
        Self {
            base: SaberBlockParameters::default(),
            value: 1.0,
        }
    }
}

impl BlockParameters for StdDevParameters {
    const KEYS: &'static [ParameterKey] = &[ParameterKey::optional(
        "value",
        ParameterKind::Float,
        Some("1.0"),
        "uniform standard deviation",
    )];

    fn base(&self) -> &SaberBlockParameters {
        &self.base
    }

    fn validate(&self) -> SaberResult<()> {
        if self.value.is_nan() || self.value <= 0.0 {
            return Err(SaberError::config(&self.base.name, "value must be positive"));
        }
        Ok(())
    }
}

pub struct StdDev {
    geometry: Geometry,
    vars: Variables,
    active: Variables,
    params: StdDevParameters,
    std_dev: FieldSet,
}

impl StdDev {
    fn set_std_dev(&mut self, std_dev: FieldSet) -> SaberResult<()> {
        let std_dev = std_dev.subset(&self.active)?;
        for f in &std_dev {
            if f.values().iter().any(|v| v.is_nan() || *v <= 0.0) {
                return Err(SaberError::config(
                    Self::NAME,
                    format!("standard deviation of {} must be positive", f.name()),
                ));
            }
        }
        self.std_dev = std_dev;
        Ok(())
    }
}

impl SaberBlock for StdDev {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::MULTIPLY
            | Capabilities::MULTIPLY_AD
            | Capabilities::INVERSE_MULTIPLY
            | Capabilities::INVERSE_MULTIPLY_AD
            | Capabilities::READ
            | Capabilities::WRITE
            | Capabilities::DIRECT_CALIBRATION
    }

    fn active_vars(&self) -> &Variables {
        &self.active
    }

    fn skip_inverse_test(&self) -> bool {
        self.params.base.skip_inverse_test
    }
}

impl OuterBlock for StdDev {
    fn inner_geometry(&self) -> &Geometry {
        &self.geometry
    }

    fn inner_vars(&self) -> &Variables {
        &self.vars
    }

    fn multiply(&self, fset: &mut FieldSet) -> SaberResult<()> {
        fset.multiply_by(&self.std_dev)
    }

    fn multiply_ad(&self, fset: &mut FieldSet) -> SaberResult<()> {
        fset.multiply_by(&self.std_dev)
    }

    fn inverse_multiply(&self, fset: &mut FieldSet) -> SaberResult<()> {
        fset.divide_by(&self.std_dev)
    }

    fn inverse_multiply_ad(&self, fset: &mut FieldSet) -> SaberResult<()> {
        fset.divide_by(&self.std_dev)
    }

    fn read(&mut self) -> SaberResult<()> {
        let path = match &self.params.base.read {
            Some(read) => read.filepath.clone(),
            None => return Err(SaberError::config(Self::NAME, "read requires a filepath")),
        };
        let std_dev = io::read_fieldset(&path, &self.geometry, &self.active)?;
        self.set_std_dev(std_dev)
    }

    fn write(&self) -> SaberResult<()> {
        match &self.params.base.write {
            Some(write) => io::write_fieldset(&write.filepath, &self.std_dev, &self.geometry),
            None => Err(SaberError::config(Self::NAME, "write requires a filepath")),
        }
    }

    fn direct_calibration(&mut self, members: &[FieldSet]) -> SaberResult<()> {
        let mut moments = Moments::new(&self.std_dev);
        for member in members {
            moments.update(&member.subset(&self.active)?)?;
        }
        self.set_std_dev(moments.std_dev()?)
    }
}

impl OuterBlockType for StdDev {
    const NAME: &'static str = "StdDev";
    type Parameters = StdDevParameters;

    fn new(
        ctx: &BlockContext<'_>,
        outer_vars: &Variables,
        active: Variables,
        params: StdDevParameters,
    ) -> SaberResult<Self> {
        let std_dev = FieldSet::filled(ctx.geometry, &active, params.value);
        Ok(Self {
            geometry: ctx.geometry.clone(),
            vars: outer_vars.clone(),
            active,
            params,
            std_dev,
        })
    }
}

impl fmt::Display for StdDev {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StdDev on {}", self.active)
    }
}
