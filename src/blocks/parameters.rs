//! Typed, self-describing block parameter records.

use std::any::Any;
use std::fmt;
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{SaberError, SaberResult};
use crate::variables::{Variable, Variables};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKind {
    Bool,
    Integer,
    Float,
    String,
    StringList,
    Table,
    TableList,
    FloatMap,
}

impl fmt::Display for ParameterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ParameterKind::Bool => "bool",
            ParameterKind::Integer => "integer",
            ParameterKind::Float => "float",
            ParameterKind::String => "string",
            ParameterKind::StringList => "string list",
            ParameterKind::Table => "table",
            ParameterKind::TableList => "table list",
            ParameterKind::FloatMap => "float map",
        };
        f.write_str(s)
    }
}

/// One entry of a parameter schema.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ParameterKey {
    pub name: &'static str,
    pub kind: ParameterKind,
    pub required: bool,
    pub default: Option<&'static str>,
    pub description: &'static str,
}

impl ParameterKey {
    pub const fn required(
        name: &'static str,
        kind: ParameterKind,
        description: &'static str,
    ) -> Self {
        Self {
            name,
            kind,
            required: true,
            default: None,
            description,
        }
    }

    pub const fn optional(
        name: &'static str,
        kind: ParameterKind,
        default: Option<&'static str>,
        description: &'static str,
    ) -> Self {
        Self {
            name,
            kind,
            required: false,
            default,
            description,
        }
    }
}

/// Keys every block accepts.
pub const COMMON_KEYS: &[ParameterKey] = &[
    ParameterKey::required("saber block name", ParameterKind::String, "registered block name"),
    ParameterKey::optional(
        "active variables",
        ParameterKind::StringList,
        None,
        "variables the block acts on; others pass through",
    ),
    ParameterKey::optional("read", ParameterKind::Table, None, "read coefficients from file"),
    ParameterKey::optional("write", ParameterKind::Table, None, "write coefficients to file"),
    ParameterKey::optional(
        "calibration",
        ParameterKind::Table,
        None,
        "compute coefficients from the ensemble",
    ),
    ParameterKey::optional(
        "output inner variables",
        ParameterKind::StringList,
        None,
        "inner names for the active variables",
    ),
    ParameterKey::optional(
        "skip inverse test",
        ParameterKind::Bool,
        Some("false"),
        "exclude the block from the inverse test",
    ),
];

/// File location for the `read` and `write` hooks.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FileParameters {
    pub filepath: PathBuf,
}

/// Options shared by every block.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct SaberBlockParameters {
    #[serde(rename = "saber block name")]
    pub name: String,
    #[serde(rename = "active variables", default)]
    pub active_variables: Option<Vec<String>>,
    #[serde(default)]
    pub read: Option<FileParameters>,
    #[serde(default)]
    pub write: Option<FileParameters>,
    #[serde(default)]
    pub calibration: Option<toml::Table>,
    #[serde(rename = "output inner variables", default)]
    pub output_inner_variables: Option<Vec<String>>,
    #[serde(rename = "skip inverse test", default)]
    pub skip_inverse_test: bool,
}

impl SaberBlockParameters {
    /// Active variables taken from `outer`: the explicit list, else the
    /// mandatory ones, else everything.
    pub fn active_vars(&self, outer: &Variables, mandatory: &Variables) -> SaberResult<Variables> {
        let wanted: Vec<String> = match &self.active_variables {
            Some(list) => list.clone(),
            None if !mandatory.is_empty() => mandatory.names(),
            None => return Ok(outer.clone()),
        };
        let mut active = Variables::default();
        for name in &wanted {
            let var: &Variable = outer.get(name).ok_or_else(|| {
                SaberError::config(
                    &self.name,
                    format!("active variable {name} is not in the block input {outer}"),
                )
            })?;
            active.push(var.clone());
        }
        if !active.contains_all(mandatory) {
            return Err(SaberError::config(
                &self.name,
                format!("active variables must include {mandatory}"),
            ));
        }
        Ok(active)
    }
}

/// Statically typed parameter record of one block type.
pub trait BlockParameters:
    DeserializeOwned + Default + Clone + fmt::Debug + Send + Sync + 'static
{
    /// Block-specific keys, on top of `COMMON_KEYS`.
    const KEYS: &'static [ParameterKey];

    fn base(&self) -> &SaberBlockParameters;

    fn validate(&self) -> SaberResult<()> {
        Ok(())
    }

    fn mandatory_active_vars(&self) -> Variables {
        Variables::default()
    }
}

/// Object-safe view of a parameter record, as returned by the factory.
pub trait ParametersRecord: fmt::Debug + Send + Sync {
    fn base(&self) -> &SaberBlockParameters;

    /// Replaces the record with the content of `table`, rejecting unknown keys.
    fn deserialize(&mut self, table: &toml::Table) -> SaberResult<()>;

    fn schema(&self) -> Vec<ParameterKey>;

    fn mandatory_active_vars(&self) -> Variables;

    fn as_any(&self) -> &dyn Any;
}

/// Full schema of a record type.
pub fn schema_of<P: BlockParameters>() -> Vec<ParameterKey> {
    COMMON_KEYS.iter().chain(P::KEYS.iter()).copied().collect()
}

impl<P: BlockParameters> ParametersRecord for P {
    fn base(&self) -> &SaberBlockParameters {
        BlockParameters::base(self)
    }

    fn deserialize(&mut self, table: &toml::Table) -> SaberResult<()> {
        let context = match table.get("saber block name") {
            Some(toml::Value::String(s)) => s.clone(),
            _ => "saber block".to_string(),
        };
        let schema = schema_of::<P>();
        if let Some(key) = table
            .keys()
            .find(|k| !schema.iter().any(|s| s.name == k.as_str()))
        {
            return Err(SaberError::config(context, format!("unknown key {key}")));
        }
        for key in schema.iter().filter(|k| k.required) {
            if !table.contains_key(key.name) {
                return Err(SaberError::config(
                    context,
                    format!("missing required key {}", key.name),
                ));
            }
        }
        let parsed: P = toml::Value::Table(table.clone())
            .try_into()
            .map_err(|e: toml::de::Error| SaberError::config(&context, e.message().to_string()))?;
        BlockParameters::validate(&parsed)?;
        *self = parsed;
        Ok(())
    }

    fn schema(&self) -> Vec<ParameterKey> {
        schema_of::<P>()
    }

    fn mandatory_active_vars(&self) -> Variables {
        BlockParameters::mandatory_active_vars(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Record with only the common keys, for blocks without options.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct CommonParameters {
    #[serde(flatten)]
    pub base: SaberBlockParameters,
}

impl BlockParameters for CommonParameters {
    const KEYS: &'static [ParameterKey] = &[];

    fn base(&self) -> &SaberBlockParameters {
        &self.base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(text: &str) -> toml::Table {
        toml::from_str(text).unwrap()
    }

    #[test]
    fn test_common_record_deserializes() {
        let mut rec = CommonParameters::default();
        ParametersRecord::deserialize(
            &mut rec,
            &table(
                r#"
"saber block name" = "ID"
"active variables" = ["psi"]
"skip inverse test" = true
"#,
            ),
        )
        .unwrap();
        assert_eq!(rec.base.name, "ID");
        assert_eq!(rec.base.active_variables, Some(vec!["psi".to_string()]));
        assert!(rec.base.skip_inverse_test);
    }

    #[test]
    fn test_unknown_key_names_the_block() {
        let mut rec = CommonParameters::default();
        let err = ParametersRecord::deserialize(
            &mut rec,
            &table(
                r#"
"saber block name" = "ID"
"no such key" = 1
"#,
            ),
        )
        .unwrap_err();
        assert!(err.is_user_error());
        assert_eq!(err.to_string(), "ID: unknown key no such key");
    }

    #[test]
    fn test_active_vars_resolution() {
        let outer = Variables::new(vec![Variable::new("psi", 2), Variable::new("chi", 2)]);
        let mut base = SaberBlockParameters {
            name: "X".to_string(),
            ..SaberBlockParameters::default()
        };
        assert_eq!(base.active_vars(&outer, &Variables::default()).unwrap(), outer);

        base.active_variables = Some(vec!["chi".to_string()]);
        let active = base.active_vars(&outer, &Variables::default()).unwrap();
        assert_eq!(active.names(), vec!["chi".to_string()]);
        assert_eq!(active.get("chi").map(|v| v.levels), Some(2));

        let mandatory = Variables::from_names(&["psi"]);
        assert!(base.active_vars(&outer, &mandatory).is_err());

        base.active_variables = Some(vec!["t".to_string()]);
        assert!(base.active_vars(&outer, &Variables::default()).is_err());
    }
}
