use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{SaberError, SaberResult};

/// Reads and deserializes a TOML file.
pub fn load<T: DeserializeOwned>(path: &Path) -> SaberResult<T> {
    let text = fs::read_to_string(path).map_err(|e| SaberError::io(path, e))?;
    toml::from_str(&text).map_err(|e| SaberError::Format {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Geometry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct GeometryParameters {
    pub nx: usize,
    pub ny: usize,
    /// Default level count for every variable.
    #[serde(default = "default_levels")]
    pub levels: usize,
    /// Per-variable level count overrides.
    #[serde(rename = "variable levels", default)]
    pub variable_levels: BTreeMap<String, usize>,
    #[serde(rename = "lon min", default)]
    pub lon_min: f64,
    #[serde(rename = "lon max", default = "default_one")]
    pub lon_max: f64,
    #[serde(rename = "lat min", default)]
    pub lat_min: f64,
    #[serde(rename = "lat max", default = "default_one")]
    pub lat_max: f64,
    /// Number of ghost points appended after the owned points.
    #[serde(default)]
    pub halo: usize,
    #[serde(default)]
    pub name: Option<String>,
}

fn default_levels() -> usize {
    1
}
fn default_one() -> f64 {
    1.0
}

impl Default for GeometryParameters {
    fn default() -> Self {
        Self {
            nx: 1,
            ny: 1,
            levels: 1,
            variable_levels: BTreeMap::new(),
            lon_min: 0.0,
            lon_max: 1.0,
            lat_min: 0.0,
            lat_max: 1.0,
            halo: 0,
            name: None,
        }
    }
}

impl GeometryParameters {
    pub fn validate(&self) -> SaberResult<()> {
        if self.nx == 0 || self.ny == 0 {
            return Err(SaberError::config("geometry", "nx and ny must be >= 1"));
        }
        if self.levels == 0 {
            return Err(SaberError::config("geometry", "levels must be >= 1"));
        }
        if let Some((name, _)) = self.variable_levels.iter().find(|(_, l)| **l == 0) {
            return Err(SaberError::config(
                "geometry",
                format!("variable levels for {name} must be >= 1"),
            ));
        }
        if self.lon_min > self.lon_max || self.lat_min > self.lat_max {
            return Err(SaberError::config("geometry", "domain bounds are inverted"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// States and ensembles
// ---------------------------------------------------------------------------

/// A state read from a field-set file, or filled with a constant.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct StateParameters {
    #[serde(default)]
    pub filepath: Option<PathBuf>,
    #[serde(default)]
    pub value: f64,
}

/// Background (and first guess): one state, or several time slots.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct BackgroundParameters {
    #[serde(flatten)]
    pub state: StateParameters,
    #[serde(rename = "time slots", default)]
    pub slots: Vec<StateParameters>,
}

impl BackgroundParameters {
    pub fn states(&self) -> Vec<StateParameters> {
        if self.slots.is_empty() {
            vec![self.state.clone()]
        } else {
            self.slots.clone()
        }
    }
}

/// Member files generated from a template, `pattern` replaced by the member index.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MembersTemplate {
    pub template: String,
    pub pattern: String,
    pub nmembers: usize,
    #[serde(default = "default_start")]
    pub start: usize,
    #[serde(rename = "zero padding", default)]
    pub zero_padding: usize,
}

fn default_start() -> usize {
    1
}

impl MembersTemplate {
    pub fn paths(&self) -> Vec<PathBuf> {
        (self.start..self.start + self.nmembers)
            .map(|ie| {
                let index = format!("{:0width$}", ie, width = self.zero_padding);
                PathBuf::from(self.template.replace(&self.pattern, &index))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct EnsembleFiles {
    #[serde(default)]
    pub members: Vec<PathBuf>,
    #[serde(rename = "members from template", default)]
    pub template: Option<MembersTemplate>,
}

impl EnsembleFiles {
    pub fn paths(&self) -> Vec<PathBuf> {
        let mut out = self.members.clone();
        if let Some(t) = &self.template {
            out.extend(t.paths());
        }
        out
    }

    pub fn len(&self) -> usize {
        self.paths().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// How an ensemble of perturbations is obtained.
#[derive(Debug, Clone, PartialEq)]
pub enum EnsembleSource {
    /// States; perturbations are deviations from the ensemble mean.
    States(EnsembleFiles),
    /// Perturbations read as they are.
    Perturbations(EnsembleFiles),
    /// Differences `base[i] - pairs[i]`.
    Pairs { base: EnsembleFiles, pairs: EnsembleFiles },
}

impl EnsembleSource {
    pub fn size(&self) -> usize {
        match self {
            EnsembleSource::States(f) | EnsembleSource::Perturbations(f) => f.len(),
            EnsembleSource::Pairs { base, .. } => base.len(),
        }
    }
}

/// The four ensemble keys shared by the covariance, hybrid components and training.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct EnsembleKeys {
    #[serde(default)]
    pub ensemble: Option<EnsembleFiles>,
    #[serde(rename = "ensemble pert", default)]
    pub ensemble_pert: Option<EnsembleFiles>,
    #[serde(rename = "ensemble base", default)]
    pub ensemble_base: Option<EnsembleFiles>,
    #[serde(rename = "ensemble pairs", default)]
    pub ensemble_pairs: Option<EnsembleFiles>,
}

impl EnsembleKeys {
    /// Resolves the keys into a single source; `None` when no key is set.
    pub fn source(&self, context: &str) -> SaberResult<Option<EnsembleSource>> {
        let set = [
            self.ensemble.is_some(),
            self.ensemble_pert.is_some(),
            self.ensemble_base.is_some() || self.ensemble_pairs.is_some(),
        ]
        .iter()
        .filter(|b| **b)
        .count();
        if set > 1 {
            return Err(SaberError::config(
                context,
                "only one of ensemble, ensemble pert or ensemble base/pairs may be given",
            ));
        }
        if let Some(f) = &self.ensemble {
            return Ok(Some(EnsembleSource::States(f.clone())));
        }
        if let Some(f) = &self.ensemble_pert {
            return Ok(Some(EnsembleSource::Perturbations(f.clone())));
        }
        match (&self.ensemble_base, &self.ensemble_pairs) {
            (Some(base), Some(pairs)) => {
                if base.len() != pairs.len() {
                    return Err(SaberError::config(
                        context,
                        format!(
                            "ensemble base has {} members, ensemble pairs has {}",
                            base.len(),
                            pairs.len()
                        ),
                    ));
                }
                Ok(Some(EnsembleSource::Pairs {
                    base: base.clone(),
                    pairs: pairs.clone(),
                }))
            }
            (None, None) => Ok(None),
            _ => Err(SaberError::config(
                context,
                "ensemble base and ensemble pairs must be given together",
            )),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ensemble.is_none()
            && self.ensemble_pert.is_none()
            && self.ensemble_base.is_none()
            && self.ensemble_pairs.is_none()
    }
}

// ---------------------------------------------------------------------------
// Background error covariance
// ---------------------------------------------------------------------------

/// The `background error` subtree.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ErrorCovarianceParameters {
    #[serde(rename = "saber central block")]
    pub central: toml::Table,
    /// Outer block descriptors, outermost first.
    #[serde(rename = "saber outer blocks", default)]
    pub outer: Vec<toml::Table>,
    #[serde(rename = "adjoint test", default)]
    pub adjoint_test: bool,
    #[serde(rename = "adjoint tolerance", default = "default_adjoint_tolerance")]
    pub adjoint_tolerance: f64,
    #[serde(rename = "inverse test", default)]
    pub inverse_test: bool,
    #[serde(rename = "inverse tolerance", default = "default_inverse_tolerance")]
    pub inverse_tolerance: f64,
    #[serde(rename = "iterative ensemble loading", default)]
    pub iterative_ensemble_loading: bool,
    #[serde(rename = "time covariance", default)]
    pub time_covariance: bool,
    #[serde(flatten)]
    pub ensembles: EnsembleKeys,
    /// Geometry of the dual-resolution ensemble.
    #[serde(rename = "dual resolution geometry", default)]
    pub dual_geometry: Option<GeometryParameters>,
    /// Perturbations living on the dual-resolution geometry.
    #[serde(rename = "dual resolution ensemble", default)]
    pub dual_ensemble: Option<EnsembleFiles>,
    #[serde(rename = "randomization size", default)]
    pub randomization_size: usize,
}

fn default_adjoint_tolerance() -> f64 {
    1.0e-12
}
fn default_inverse_tolerance() -> f64 {
    1.0e-6
}

impl ErrorCovarianceParameters {
    /// Name of the top-level central block.
    pub fn central_name(&self) -> SaberResult<&str> {
        block_name(&self.central, "saber central block")
    }

    pub fn validate(&self) -> SaberResult<()> {
        self.central_name()?;
        for (i, table) in self.outer.iter().enumerate() {
            block_name(table, &format!("saber outer blocks[{i}]"))?;
        }
        if self.adjoint_tolerance <= 0.0 {
            return Err(SaberError::config("adjoint tolerance", "must be positive"));
        }
        if self.inverse_tolerance <= 0.0 {
            return Err(SaberError::config("inverse tolerance", "must be positive"));
        }
        self.ensembles.source("background error")?;
        if let Some(g) = &self.dual_geometry {
            g.validate()?;
        }
        if self.dual_ensemble.is_some() && self.dual_geometry.is_none() {
            return Err(SaberError::config(
                "dual resolution ensemble",
                "requires dual resolution geometry",
            ));
        }
        Ok(())
    }
}

/// Reads `saber block name` from a block descriptor.
pub fn block_name<'a>(table: &'a toml::Table, context: &str) -> SaberResult<&'a str> {
    match table.get("saber block name") {
        Some(toml::Value::String(s)) => Ok(s.as_str()),
        Some(_) => Err(SaberError::config(context, "saber block name must be a string")),
        None => Err(SaberError::config(context, "missing key saber block name")),
    }
}

// ---------------------------------------------------------------------------
// Toolbox
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DiracPoint {
    pub ix: usize,
    pub iy: usize,
    #[serde(default)]
    pub level: usize,
    pub variable: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolboxConfig {
    pub geometry: GeometryParameters,
    #[serde(default)]
    pub background: BackgroundParameters,
    #[serde(rename = "input variables")]
    pub input_variables: Vec<String>,
    #[serde(rename = "background error")]
    pub background_error: ErrorCovarianceParameters,
    #[serde(default)]
    pub dirac: Vec<DiracPoint>,
    #[serde(rename = "output dirac", default)]
    pub output_dirac: Option<PathBuf>,
    /// Template for randomized samples; `%member%` is replaced by the index.
    #[serde(rename = "output randomization", default)]
    pub output_randomization: Option<String>,
    #[serde(rename = "inverse multiply", default)]
    pub inverse_multiply: bool,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_seed() -> u64 {
    42
}

impl ToolboxConfig {
    pub fn validate(&self) -> SaberResult<()> {
        self.geometry.validate()?;
        if self.input_variables.is_empty() {
            return Err(SaberError::config("input variables", "must not be empty"));
        }
        self.background_error.validate()?;
        let (nx, ny) = (self.geometry.nx, self.geometry.ny);
        for d in &self.dirac {
            if d.ix >= nx || d.iy >= ny {
                return Err(SaberError::config(
                    "dirac",
                    format!("point ({}, {}) outside {}x{} grid", d.ix, d.iy, nx, ny),
                ));
            }
            if !self.input_variables.contains(&d.variable) {
                return Err(SaberError::config(
                    "dirac",
                    format!("variable {} is not an input variable", d.variable),
                ));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Training
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct OutputParameters {
    pub parameter: String,
    #[serde(default = "default_component")]
    pub component: usize,
    /// Output path; `_MPI_` and `_OMP_` are substituted.
    pub file: String,
}

fn default_component() -> usize {
    1
}

impl OutputParameters {
    pub fn resolved_file(&self, mpi: usize, omp: usize) -> PathBuf {
        PathBuf::from(
            self.file
                .replace("_MPI_", &mpi.to_string())
                .replace("_OMP_", &omp.to_string()),
        )
    }
}

/// Auxiliary field set fed to the calibration kernel.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct InputFieldParameters {
    pub parameter: String,
    #[serde(default = "default_component")]
    pub component: usize,
    pub file: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct MomentsParameters {
    /// Lower bound applied to computed variances.
    #[serde(rename = "variance floor", default)]
    pub variance_floor: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrainingConfig {
    pub geometry: GeometryParameters,
    #[serde(default)]
    pub background: BackgroundParameters,
    #[serde(rename = "input variables")]
    pub input_variables: Vec<String>,
    #[serde(flatten)]
    pub ensembles: EnsembleKeys,
    #[serde(rename = "background error", default)]
    pub background_error: Option<ErrorCovarianceParameters>,
    #[serde(rename = "randomized ensemble output", default)]
    pub randomized_ensemble_output: Option<String>,
    #[serde(rename = "lowres geometry", default)]
    pub lowres_geometry: Option<GeometryParameters>,
    #[serde(rename = "lowres ensemble", default)]
    pub lowres_ensemble: Option<EnsembleFiles>,
    #[serde(rename = "lowres ensemble pert", default)]
    pub lowres_ensemble_pert: Option<EnsembleFiles>,
    #[serde(rename = "lowres ensemble base", default)]
    pub lowres_ensemble_base: Option<EnsembleFiles>,
    #[serde(rename = "lowres ensemble pairs", default)]
    pub lowres_ensemble_pairs: Option<EnsembleFiles>,
    #[serde(rename = "input fields", default)]
    pub input_fields: Vec<InputFieldParameters>,
    #[serde(rename = "lowres input fields", default)]
    pub lowres_input_fields: Vec<InputFieldParameters>,
    #[serde(rename = "iterative ensemble loading", default)]
    pub iterative_ensemble_loading: bool,
    #[serde(default)]
    pub moments: MomentsParameters,
    #[serde(default)]
    pub output: Vec<OutputParameters>,
}

impl TrainingConfig {
    pub fn lowres_keys(&self) -> EnsembleKeys {
        EnsembleKeys {
            ensemble: self.lowres_ensemble.clone(),
            ensemble_pert: self.lowres_ensemble_pert.clone(),
            ensemble_base: self.lowres_ensemble_base.clone(),
            ensemble_pairs: self.lowres_ensemble_pairs.clone(),
        }
    }

    pub fn validate(&self) -> SaberResult<()> {
        self.geometry.validate()?;
        if self.input_variables.is_empty() {
            return Err(SaberError::config("input variables", "must not be empty"));
        }
        self.ensembles.source("ensemble")?;
        let lowres = self.lowres_keys().source("lowres ensemble")?;
        if let Some(g) = &self.lowres_geometry {
            g.validate()?;
        }
        if let Some(b) = &self.background_error {
            b.validate()?;
            if lowres.is_some() {
                return Err(SaberError::config(
                    "background error",
                    "ensemble 2 cannot be both read and randomized",
                ));
            }
            if b.randomization_size == 0 {
                return Err(SaberError::config(
                    "randomization size",
                    "must be >= 1 to randomize ensemble 2",
                ));
            }
        }
        if self.variance_floor_invalid() {
            return Err(SaberError::config("variance floor", "must be nonnegative"));
        }
        for out in &self.output {
            if out.component == 0 {
                return Err(SaberError::config(
                    &out.parameter,
                    "component indices start at 1",
                ));
            }
        }
        Ok(())
    }

    fn variance_floor_invalid(&self) -> bool {
        self.moments.variance_floor < 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOOLBOX: &str = r#"
"input variables" = ["psi", "chi"]
dirac = [{ ix = 1, iy = 1, level = 0, variable = "psi" }]

[geometry]
nx = 4
ny = 3
levels = 2

[background]
value = 280.0

["background error"]
"adjoint test" = true
"ensemble pert" = { members = ["m1.json", "m2.json"] }

["background error"."saber central block"]
"saber block name" = "ID"

[["background error"."saber outer blocks"]]
"saber block name" = "Identity"
"#;

    #[test]
    fn test_toolbox_config_parses_with_defaults() {
        let cfg: ToolboxConfig = toml::from_str(TOOLBOX).unwrap();
        cfg.validate().unwrap();
        let b = &cfg.background_error;
        assert!(b.adjoint_test);
        assert_eq!(b.adjoint_tolerance, 1.0e-12);
        assert!(!b.inverse_test);
        assert_eq!(b.inverse_tolerance, 1.0e-6);
        assert_eq!(b.central_name().unwrap(), "ID");
        assert_eq!(b.outer.len(), 1);
        assert_eq!(cfg.seed, 42);
        match b.ensembles.source("test").unwrap() {
            Some(EnsembleSource::Perturbations(f)) => assert_eq!(f.len(), 2),
            other => panic!("unexpected source {other:?}"),
        }
    }

    #[test]
    fn test_missing_block_name_is_reported() {
        let mut cfg: ToolboxConfig = toml::from_str(TOOLBOX).unwrap();
        cfg.background_error.central.remove("saber block name");
        let err = cfg.validate().unwrap_err();
        assert!(err.is_user_error());
        assert!(err.to_string().starts_with("saber central block"));
    }

    #[test]
    fn test_member_template_expansion() {
        let t = MembersTemplate {
            template: "ens/mem%mem%.json".to_string(),
            pattern: "%mem%".to_string(),
            nmembers: 2,
            start: 1,
            zero_padding: 3,
        };
        assert_eq!(
            t.paths(),
            vec![PathBuf::from("ens/mem001.json"), PathBuf::from("ens/mem002.json")]
        );
    }

    #[test]
    fn test_conflicting_ensemble_sources() {
        let keys = EnsembleKeys {
            ensemble: Some(EnsembleFiles::default()),
            ensemble_pert: Some(EnsembleFiles::default()),
            ..EnsembleKeys::default()
        };
        assert!(keys.source("ensemble").is_err());

        let keys = EnsembleKeys {
            ensemble_base: Some(EnsembleFiles::default()),
            ..EnsembleKeys::default()
        };
        assert!(keys.source("ensemble").is_err());
    }

    #[test]
    fn test_output_substitution() {
        let out = OutputParameters {
            parameter: "var".to_string(),
            component: 1,
            file: "out/var__MPI_-_OMP_.json".to_string(),
        };
        assert_eq!(out.resolved_file(1, 2), PathBuf::from("out/var_1-2.json"));
    }
}
