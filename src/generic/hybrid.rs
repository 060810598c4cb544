//! `Hybrid` is resolved by the covariance operator into weighted components.
//! The registered block only carries the schema; it is never built.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::blocks::parameters::ParameterKey;
use crate::blocks::{
    BlockContext, BlockParameters, Capabilities, CentralBlock, CentralBlockType, FileParameters,
    ParameterKind, SaberBlock, SaberBlockParameters,
};
use crate::config::{EnsembleKeys, GeometryParameters};
use crate::error::{SaberError, SaberResult};
use crate::field::FieldSet;
use crate::variables::Variables;

/// Covariance of one component.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ComponentCovariance {
    #[serde(rename = "saber central block")]
    pub central: toml::Table,
    #[serde(rename = "saber outer blocks", default)]
    pub outer: Vec<toml::Table>,
    #[serde(flatten)]
    pub ensembles: EnsembleKeys,
    #[serde(rename = "iterative ensemble loading", default)]
    pub iterative_ensemble_loading: Option<bool>,
}

/// Scalar weight, field weight read from file, or neither (weight 1).
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct WeightParameters {
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub file: Option<FileParameters>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ComponentParameters {
    pub covariance: ComponentCovariance,
    #[serde(default)]
    pub weight: WeightParameters,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct HybridParameters {
    #[serde(flatten)]
    pub base: SaberBlockParameters,
    pub components: Vec<ComponentParameters>,
    /// Grid of the components, their ensembles and weight files.
    #[serde(default)]
    pub geometry: Option<GeometryParameters>,
    #[serde(rename = "run in parallel", default)]
    pub run_in_parallel: bool,
}

impl HybridParameters {
    pub fn from_table(table: &toml::Table) -> SaberResult<Self> {
        let params: Self = toml::Value::Table(table.clone())
            .try_into()
            .map_err(|e: toml::de::Error| {
                SaberError::config(Hybrid::NAME, e.message().to_string())
            })?;
        BlockParameters::validate(&params)?;
        Ok(params)
    }
}

impl BlockParameters for HybridParameters {
    const KEYS: &'static [ParameterKey] = &[
        ParameterKey::required(
            "components",
            ParameterKind::TableList,
            "weighted covariance components",
        ),
        ParameterKey::optional(
            "geometry",
            ParameterKind::Table,
            None,
            "component geometry; must be the inner geometry of the common outer blocks",
        ),
        ParameterKey::optional(
            "run in parallel",
            ParameterKind::Bool,
            Some("false"),
            "evaluate components concurrently",
        ),
    ];

    fn base(&self) -> &SaberBlockParameters {
        &self.base
    }

    fn validate(&self) -> SaberResult<()> {
        if self.components.is_empty() {
            return Err(SaberError::config(Hybrid::NAME, "components must not be empty"));
        }
        if let Some(g) = &self.geometry {
            g.validate()?;
        }
        for (jj, component) in self.components.iter().enumerate() {
            let weight = &component.weight;
            if weight.value.is_some() && weight.file.is_some() {
                return Err(SaberError::config(
                    Hybrid::NAME,
                    format!("component {jj}: weight value and file are exclusive"),
                ));
            }
            if weight.value.is_some_and(|v| v.is_nan() || v < 0.0) {
                return Err(SaberError::config(
                    Hybrid::NAME,
                    format!("component {jj}: weight value must be nonnegative"),
                ));
            }
        }
        Ok(())
    }
}

pub struct Hybrid {
    active: Variables,
}

fn fake() -> SaberError {
    SaberError::Internal(
        "Hybrid is a placeholder; the covariance operator builds its components".into(),
    )
}

impl SaberBlock for Hybrid {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::empty()
    }

    fn active_vars(&self) -> &Variables {
        &self.active
    }
}

impl CentralBlock for Hybrid {
    fn multiply(&self, _fset: &mut FieldSet) -> SaberResult<()> {
        Err(fake())
    }
}

impl CentralBlockType for Hybrid {
    const NAME: &'static str = "Hybrid";
    type Parameters = HybridParameters;

    fn new(
        _ctx: &BlockContext<'_>,
        _vars: &Variables,
        _active: Variables,
        _params: HybridParameters,
    ) -> SaberResult<Self> {
        Err(fake())
    }
}

impl fmt::Display for Hybrid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hybrid on {}", self.active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weight_value_and_file_are_exclusive() {
        let table: toml::Table = toml::from_str(
            r#"
"saber block name" = "Hybrid"

[[components]]
weight = { value = 0.5, file = { filepath = "w.json" } }
[components.covariance]
"saber central block" = { "saber block name" = "ID" }
"#,
        )
        .unwrap();
        let err = HybridParameters::from_table(&table).unwrap_err();
        assert!(err.is_user_error());
        assert!(err.to_string().contains("exclusive"));
    }

    #[test]
    fn test_components_parse() {
        let table: toml::Table = toml::from_str(
            r#"
"saber block name" = "Hybrid"

[[components]]
weight = { value = 0.25 }
[components.covariance]
"saber central block" = { "saber block name" = "ID" }

[[components]]
[components.covariance]
"saber central block" = { "saber block name" = "Diagonal", variance = 2.0 }
"saber outer blocks" = [{ "saber block name" = "StdDev" }]
"#,
        )
        .unwrap();
        let params = HybridParameters::from_table(&table).unwrap();
        assert_eq!(params.components.len(), 2);
        assert_eq!(params.components[0].weight.value, Some(0.25));
        assert_eq!(params.components[1].weight, WeightParameters::default());
        assert_eq!(params.components[1].covariance.outer.len(), 1);
    }
}
