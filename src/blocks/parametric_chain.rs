//! Chain around a parameterized central block.

use std::fmt;

use tracing::info;

use super::chain::{feed_members, BlockChain, ChainCore};
use super::{BlockContext, OuterBlockChain};
use crate::error::{SaberError, SaberResult};
use crate::field::FieldSet;
use crate::geometry::Geometry;
use crate::variables::Variables;
use crate::verification::{adjoint_test_central, TestRecord};

pub struct ParametricChain {
    core: ChainCore,
}

impl ParametricChain {
    /// Assembly order: outer chain, central block, `read`, calibration,
    /// `write`, then the optional self-adjointness test.
    pub fn new(
        ctx: &BlockContext<'_>,
        outer_vars: &Variables,
        central_table: &toml::Table,
        outer_tables: &[toml::Table],
    ) -> SaberResult<Self> {
        let members = ctx.covariance.ensemble.as_deref();
        let outer = OuterBlockChain::new(ctx, outer_vars, outer_tables, members)?;

        let params = ctx.factory.central_parameters(central_table)?;
        let base = params.base().clone();
        let (xb, fg) = outer.inner_background();
        let central_ctx = BlockContext {
            geometry: outer.inner_geometry(),
            xb,
            fg,
            ..*ctx
        };
        let mut central = ctx
            .factory
            .make_central(&central_ctx, outer.inner_vars(), params.as_ref())?;

        if base.read.is_some() {
            central.read()?;
        }
        if base.calibration.is_some() {
            let source = members
                .ok_or_else(|| SaberError::config(&base.name, "calibration requires an ensemble"))?;
            feed_members(
                central.as_mut(),
                &outer,
                source,
                ctx.covariance.iterative_ensemble_loading,
            )?;
        }
        if base.write.is_some() {
            central.write()?;
        }

        let mut records = Vec::new();
        if ctx.covariance.adjoint_test {
            records.push(adjoint_test_central(
                central.as_ref(),
                outer.inner_geometry(),
                outer.inner_vars(),
                ctx.covariance.adjoint_tolerance,
                ctx.covariance.seeds.next_seed(),
            )?);
        }
        info!(central = %central, outer_blocks = outer.len(), "parametric chain ready");
        Ok(Self {
            core: ChainCore {
                outer,
                central,
                records,
            },
        })
    }

    pub fn inner_geometry(&self) -> &Geometry {
        self.core.outer.inner_geometry()
    }

    pub fn inner_vars(&self) -> &Variables {
        self.core.outer.inner_vars()
    }
}

impl BlockChain for ParametricChain {
    fn kind(&self) -> &'static str {
        "Parametric"
    }

    fn outer_geometry(&self) -> &Geometry {
        self.core.outer.outer_geometry()
    }

    fn outer_vars(&self) -> &Variables {
        self.core.outer.outer_vars()
    }

    fn multiply_3d(&self, fset: &mut FieldSet) -> SaberResult<()> {
        self.core.multiply(fset)
    }

    fn randomize_3d(&self, fset: &mut FieldSet, seed: u64) -> SaberResult<()> {
        self.core.randomize(fset, seed)
    }

    fn records(&self) -> Vec<TestRecord> {
        self.core.records()
    }
}

impl fmt::Display for ParametricChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.core.fmt_with(f, self.kind())
    }
}
