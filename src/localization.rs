//! Localization: a parametric chain applied to Schur products of ensemble
//! members.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::blocks::{BlockChain, BlockContext, CovarianceConfig, ParametricChain};
use crate::error::{SaberError, SaberResult};
use crate::field::FieldSet;
use crate::geometry::Geometry;
use crate::variables::Variables;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LocalizationParameters {
    #[serde(rename = "saber central block")]
    pub central: toml::Table,
    #[serde(rename = "saber outer blocks", default)]
    pub outer: Vec<toml::Table>,
}

impl LocalizationParameters {
    pub fn from_table(table: &toml::Table) -> SaberResult<Self> {
        toml::Value::Table(table.clone())
            .try_into()
            .map_err(|e: toml::de::Error| {
                SaberError::config("localization", e.message().to_string())
            })
    }
}

pub struct Localization {
    chain: ParametricChain,
}

impl Localization {
    /// The localization chain never calibrates from the ensemble it localizes.
    pub fn new(ctx: &BlockContext<'_>, vars: &Variables, table: &toml::Table) -> SaberResult<Self> {
        let params = LocalizationParameters::from_table(table)?;
        let covariance = CovarianceConfig {
            ensemble: None,
            dual_ensemble: None,
            ..ctx.covariance.clone()
        };
        let loc_ctx = BlockContext {
            covariance: &covariance,
            ..*ctx
        };
        let chain = ParametricChain::new(&loc_ctx, vars, &params.central, &params.outer)?;
        debug!(localization = %chain, "localization ready");
        Ok(Self { chain })
    }

    pub fn geometry(&self) -> &Geometry {
        self.chain.outer_geometry()
    }

    pub fn vars(&self) -> &Variables {
        self.chain.outer_vars()
    }

    pub fn multiply(&self, fset: &mut FieldSet) -> SaberResult<()> {
        self.chain.multiply_3d(fset)
    }

    /// Draw from N(0, L).
    pub fn randomize(&self, fset: &mut FieldSet, seed: u64) -> SaberResult<()> {
        self.chain.randomize_3d(fset, seed)
    }

    pub fn chain(&self) -> &ParametricChain {
        &self.chain
    }
}

impl fmt::Display for Localization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Localization: {}", self.chain)
    }
}
