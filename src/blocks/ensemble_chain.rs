//! Chain around a localized sample covariance.

use std::fmt;

use tracing::info;

use super::chain::{feed_members, BlockChain, ChainCore};
use super::{BlockContext, OuterBlockChain};
use crate::ensemble::MemberSource;
use crate::error::{SaberError, SaberResult};
use crate::field::FieldSet;
use crate::geometry::Geometry;
use crate::variables::Variables;
use crate::verification::{adjoint_test_central, TestRecord};

pub struct EnsembleChain {
    core: ChainCore,
    members: usize,
    dual_resolution: bool,
}

impl EnsembleChain {
    /// The central block receives the members in control space. When the
    /// chain ends on the dual-resolution geometry, the dual ensemble is used.
    pub fn new(
        ctx: &BlockContext<'_>,
        outer_vars: &Variables,
        central_table: &toml::Table,
        outer_tables: &[toml::Table],
    ) -> SaberResult<Self> {
        let covariance = ctx.covariance;
        let outer =
            OuterBlockChain::new(ctx, outer_vars, outer_tables, covariance.ensemble.as_deref())?;

        let dual_resolution = match (&covariance.dual_geometry, &covariance.dual_ensemble) {
            (Some(dual), Some(_)) => outer.inner_geometry().aliases(dual),
            _ => false,
        };
        let source: &dyn MemberSource = if dual_resolution {
            covariance.dual_ensemble.as_deref()
        } else {
            covariance.ensemble.as_deref()
        }
        .ok_or_else(|| SaberError::config("Ensemble", "no ensemble members available"))?;

        let params = ctx.factory.central_parameters(central_table)?;
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
        feed_members(
            central.as_mut(),
            &outer,
            source,
            covariance.iterative_ensemble_loading,
        )?;

        let mut records = Vec::new();
        if covariance.adjoint_test {
            records.push(adjoint_test_central(
                central.as_ref(),
                outer.inner_geometry(),
                outer.inner_vars(),
                covariance.adjoint_tolerance,
                covariance.seeds.next_seed(),
            )?);
        }
        info!(
            members = source.len(),
            dual_resolution,
            outer_blocks = outer.len(),
            "ensemble chain ready"
        );
        Ok(Self {
            members: source.len(),
            dual_resolution,
            core: ChainCore {
                outer,
                central,
                records,
            },
        })
    }

    pub fn members(&self) -> usize {
        self.members
    }

    pub fn is_dual_resolution(&self) -> bool {
        self.dual_resolution
    }
}

impl BlockChain for EnsembleChain {
    fn kind(&self) -> &'static str {
        "Ensemble"
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

impl fmt::Display for EnsembleChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.core.fmt_with(f, self.kind())?;
        writeln!(
            f,
            " Members: {}{}",
            self.members,
            if self.dual_resolution { " (dual resolution)" } else { "" }
        )
    }
}
