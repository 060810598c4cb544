//! Crate-level tests: covariance assembly from configuration, hybrid
//! composition, ensemble covariances, time slots and randomization.

use std::path::PathBuf;
use std::sync::Arc;

use approx::assert_relative_eq;

use crate::blocks::{CovarianceConfig, SeedStream};
use crate::config::{
    ErrorCovarianceParameters, GeometryParameters, ToolboxConfig, TrainingConfig,
};
use crate::covariance::ErrorCovariance;
use crate::ensemble::InMemoryEnsemble;
use crate::error::{SaberError, SaberResult};
use crate::field::{FieldSet, FieldSet4D};
use crate::geometry::{Communicator, Geometry};
use crate::io;
use crate::training::TrainingDriver;
use crate::variables::Variables;
use crate::verification::{TestKind, TestStatus};

fn geometry() -> Geometry {
    Geometry::serial(&GeometryParameters {
        nx: 6,
        ny: 5,
        levels: 2,
        halo: 2,
        ..GeometryParameters::default()
    })
    .unwrap()
}

fn variables(geom: &Geometry) -> Variables {
    geom.variables_with_levels(&Variables::from_names(&["psi", "chi"]))
}

fn background(geom: &Geometry, vars: &Variables, slots: usize) -> FieldSet4D {
    FieldSet4D::new((0..slots).map(|_| FieldSet::filled(geom, vars, 1.0)).collect())
}

fn random_increment(geom: &Geometry, vars: &Variables, slots: usize, seed: u64) -> FieldSet4D {
    FieldSet4D::new(
        (0..slots as u64)
            .map(|it| FieldSet::random(geom, vars, seed + 10 * it))
            .collect(),
    )
}

fn parameters(text: &str) -> ErrorCovarianceParameters {
    toml::from_str(text).unwrap()
}

/// Operator with `slots` time slots and, optionally, in-memory ensemble members.
fn build(
    geom: &Geometry,
    vars: &Variables,
    text: &str,
    slots: usize,
    members: Option<Vec<FieldSet>>,
    seed: u64,
) -> SaberResult<ErrorCovariance> {
    let params = parameters(text);
    let mut covariance = ErrorCovariance::load_config(geom, vars, &params)?;
    covariance.seeds = Arc::new(SeedStream::new(seed));
    if let Some(members) = members {
        covariance.ensemble = Some(Arc::new(InMemoryEnsemble::new(geom.clone(), members)));
    }
    let xb = background(geom, vars, slots);
    ErrorCovariance::from_config(geom, vars, &params, covariance, &xb, &xb)
}

fn distance(a: &FieldSet4D, b: &FieldSet4D, geom: &Geometry) -> f64 {
    let mut d = a.clone();
    d.sub(b).unwrap();
    d.norm(geom).unwrap()
}

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("saber_tests_{}_{}", std::process::id(), name))
}

fn members(geom: &Geometry, vars: &Variables, n: usize) -> Vec<FieldSet> {
    (0..n as u64).map(|ie| FieldSet::random(geom, vars, 100 + ie)).collect()
}

/// Writes `fsets` to temporary files and returns them as a TOML string array.
fn member_files(geom: &Geometry, fsets: &[FieldSet], prefix: &str) -> (Vec<PathBuf>, String) {
    let paths: Vec<PathBuf> = (0..fsets.len())
        .map(|ie| temp_path(&format!("{prefix}_{}.json", ie + 1)))
        .collect();
    for (path, fset) in paths.iter().zip(fsets) {
        io::write_fieldset(path, fset, geom).unwrap();
    }
    let list = paths
        .iter()
        .map(|p| format!("\"{}\"", p.display()))
        .collect::<Vec<_>>()
        .join(", ");
    (paths, format!("[{list}]"))
}

fn remove_files(paths: &[PathBuf]) {
    for path in paths {
        let _ = std::fs::remove_file(path);
    }
}

/// Owned values of one variable, level-major within each point.
fn owned_values(fset: &FieldSet, name: &str, geom: &Geometry) -> Vec<f64> {
    let owned = geom.function_space().owned();
    let field = fset.require(name).unwrap();
    field
        .values()
        .rows()
        .into_iter()
        .take(owned)
        .flat_map(|r| r.to_vec())
        .collect()
}

// =============================================================================
// Parametric chains
// =============================================================================

#[test]
fn test_identity_chain_is_bit_exact() {
    let geom = geometry();
    let vars = variables(&geom);
    let b = build(
        &geom,
        &vars,
        r#"
"saber central block" = { "saber block name" = "ID" }
"saber outer blocks" = [{ "saber block name" = "Identity" }]
"#,
        1,
        None,
        1,
    )
    .unwrap();
    let x = random_increment(&geom, &vars, 1, 5);
    let y = b.multiply(&x).unwrap();
    assert_eq!(x, y);
}

#[test]
fn test_diagonal_adjoint_test_passes() {
    let geom = geometry();
    let vars = variables(&geom);
    let b = build(
        &geom,
        &vars,
        r#"
"adjoint test" = true
"saber central block" = { "saber block name" = "Diagonal", variance = 3.0, "variance per variable" = { chi = 0.5 } }
"saber outer blocks" = [{ "saber block name" = "StdDev", value = 2.0 }]
"#,
        1,
        None,
        42,
    )
    .unwrap();
    let records = b.verification_records();
    assert!(records.iter().all(|r| r.kind == TestKind::Adjoint));
    assert!(records.iter().any(|r| r.block == "Diagonal"));
    let whole = records.iter().find(|r| r.block == "ErrorCovariance").unwrap();
    assert_eq!(whole.status, TestStatus::Passed);
    assert!(records.iter().all(|r| r.metric < 1e-12));
}

#[test]
fn test_diagonal_scales_each_variable() {
    let geom = geometry();
    let vars = variables(&geom);
    let b = build(
        &geom,
        &vars,
        r#"
"saber central block" = { "saber block name" = "Diagonal", variance = 3.0, "variance per variable" = { chi = 0.5 } }
"#,
        1,
        None,
        1,
    )
    .unwrap();
    let x = FieldSet4D::single(FieldSet::filled(&geom, &vars, 2.0));
    let y = b.multiply(&x).unwrap();
    assert!(y[0].require("psi").unwrap().values().iter().all(|v| *v == 6.0));
    assert!(y[0].require("chi").unwrap().values().iter().all(|v| *v == 1.0));
}

#[test]
fn test_unknown_central_block_is_a_user_error() {
    let geom = geometry();
    let vars = variables(&geom);
    let err = build(
        &geom,
        &vars,
        r#""saber central block" = { "saber block name" = "NoSuchBlock" }"#,
        1,
        None,
        1,
    )
    .err()
    .unwrap();
    assert!(err.is_user_error());
    assert!(err.to_string().starts_with("NoSuchBlock"));
}

#[test]
fn test_unknown_block_key_is_rejected() {
    let geom = geometry();
    let vars = variables(&geom);
    let err = build(
        &geom,
        &vars,
        r#""saber central block" = { "saber block name" = "Diagonal", varience = 2.0 }"#,
        1,
        None,
        1,
    )
    .err()
    .unwrap();
    assert!(err.is_user_error());
    assert!(err.to_string().contains("varience"));
}

#[test]
fn test_scaled_identity_inverse_converges_in_one_iteration() {
    let geom = geometry();
    let vars = variables(&geom);
    let b = build(
        &geom,
        &vars,
        r#""saber central block" = { "saber block name" = "Diagonal", variance = 2.0 }"#,
        1,
        None,
        1,
    )
    .unwrap();
    let y = random_increment(&geom, &vars, 1, 9);
    let (x, outcome) = b.inverse_multiply(&y).unwrap();
    assert!(outcome.converged);
    assert_eq!(outcome.iterations, 1);
    let mut expected = y.clone();
    expected.scale(0.5);
    assert!(distance(&x, &expected, &geom) < 1e-12 * y.norm(&geom).unwrap());
}

#[test]
fn test_interpolation_chain_is_symmetric() {
    let geom = geometry();
    let vars = variables(&geom);
    let b = build(
        &geom,
        &vars,
        r#"
"adjoint test" = true
"saber central block" = { "saber block name" = "ID" }

[["saber outer blocks"]]
"saber block name" = "Interpolation"
geometry = { nx = 3, ny = 3, levels = 2 }
"#,
        1,
        None,
        3,
    )
    .unwrap();
    let records = b.verification_records();
    assert!(records.iter().any(|r| r.block == "Interpolation" && r.passed()));
    assert!(records.iter().any(|r| r.block == "ErrorCovariance" && r.passed()));
}

#[test]
fn test_diagonal_rejects_unknown_variable_names() {
    let geom = geometry();
    let vars = variables(&geom);
    let err = build(
        &geom,
        &vars,
        r#""saber central block" = { "saber block name" = "Diagonal", "variance per variable" = { tracer = 1.0 } }"#,
        1,
        None,
        1,
    )
    .err()
    .unwrap();
    assert!(err.is_user_error());
    let message = err.to_string();
    assert!(message.contains("Diagonal") && message.contains("tracer"), "{message}");

    // A variable outside the active set is just as unknown.
    let err = build(
        &geom,
        &vars,
        r#""saber central block" = { "saber block name" = "Diagonal", "active variables" = ["psi"], "variance per variable" = { chi = 1.0 } }"#,
        1,
        None,
        1,
    )
    .err()
    .unwrap();
    assert!(err.to_string().contains("chi"));
}

#[test]
fn test_nan_parameters_are_rejected() {
    let geom = geometry();
    let vars = variables(&geom);
    for text in [
        r#""saber central block" = { "saber block name" = "Diagonal", variance = nan }"#,
        r#""saber central block" = { "saber block name" = "Diagonal", "variance per variable" = { psi = nan } }"#,
        r#"
"saber central block" = { "saber block name" = "ID" }
"saber outer blocks" = [{ "saber block name" = "StdDev", value = nan }]
"#,
    ] {
        let err = build(&geom, &vars, text, 1, None, 1).err().unwrap();
        assert!(err.is_user_error(), "{text}: {err}");
    }
}

// =============================================================================
// Hybrid composition
// =============================================================================

const HYBRID_QUARTERS: &str = r#"
["saber central block"]
"saber block name" = "Hybrid"

[["saber central block".components]]
weight = { value = 0.25 }
["saber central block".components.covariance]
"saber central block" = { "saber block name" = "ID" }

[["saber central block".components]]
weight = { value = 0.75 }
["saber central block".components.covariance]
"saber central block" = { "saber block name" = "ID" }
"#;

#[test]
fn test_hybrid_weights_sum_to_identity() {
    let geom = geometry();
    let vars = variables(&geom);
    let b = build(&geom, &vars, HYBRID_QUARTERS, 1, None, 1).unwrap();
    assert_eq!(b.components().len(), 2);
    assert_relative_eq!(b.components()[0].scalar_sqrt(), 0.5);
    let x = random_increment(&geom, &vars, 1, 11);
    let y = b.multiply(&x).unwrap();
    assert!(distance(&x, &y, &geom) < 1e-14 * x.norm(&geom).unwrap());
}

#[test]
fn test_hybrid_with_common_chain_is_symmetric() {
    let geom = geometry();
    let vars = variables(&geom);
    let text = r#"
"adjoint test" = true

[["saber outer blocks"]]
"saber block name" = "StdDev"
value = 1.5

["saber central block"]
"saber block name" = "Hybrid"
"run in parallel" = true

[["saber central block".components]]
weight = { value = 0.3 }
["saber central block".components.covariance]
"saber central block" = { "saber block name" = "Diagonal", variance = 2.0 }
"saber outer blocks" = [{ "saber block name" = "StdDev", value = 0.5, "active variables" = ["psi"] }]

[["saber central block".components]]
["saber central block".components.covariance]
"saber central block" = { "saber block name" = "ID" }
"#;
    let b = build(&geom, &vars, text, 1, None, 17).unwrap();
    let whole = b
        .verification_records()
        .into_iter()
        .find(|r| r.block == "ErrorCovariance")
        .unwrap();
    assert!(whole.passed());
    assert!(b.to_string().contains("Common outer blocks"));

    // psi: 1.5² (0.3 · 0.5² · 2 + 1), chi: 1.5² (0.3 · 2 + 1)
    let x = FieldSet4D::single(FieldSet::filled(&geom, &vars, 1.0));
    let y = b.multiply(&x).unwrap();
    let psi = y[0].require("psi").unwrap().values()[[0, 0]];
    let chi = y[0].require("chi").unwrap().values()[[0, 1]];
    assert_relative_eq!(psi, 2.25 * (0.3 * 0.25 * 2.0 + 1.0), max_relative = 1e-14);
    assert_relative_eq!(chi, 2.25 * (0.3 * 2.0 + 1.0), max_relative = 1e-14);
}

#[test]
fn test_hybrid_field_weight_from_file() {
    let geom = geometry();
    let vars = variables(&geom);
    let path = temp_path("weight.json");
    io::write_fieldset(&path, &FieldSet::filled(&geom, &vars, 4.0), &geom).unwrap();
    let text = format!(
        r#"
["saber central block"]
"saber block name" = "Hybrid"

[["saber central block".components]]
weight = {{ file = {{ filepath = "{}" }} }}
["saber central block".components.covariance]
"saber central block" = {{ "saber block name" = "ID" }}
"#,
        path.display()
    );
    let b = build(&geom, &vars, &text, 1, None, 1).unwrap();
    let x = random_increment(&geom, &vars, 1, 2);
    let y = b.multiply(&x).unwrap();
    let mut expected = x.clone();
    expected.scale(4.0);
    assert!(distance(&y, &expected, &geom) < 1e-13 * expected.norm(&geom).unwrap());

    io::write_fieldset(&path, &FieldSet::filled(&geom, &vars, -1.0), &geom).unwrap();
    let err = build(&geom, &vars, &text, 1, None, 1).err().unwrap();
    assert!(err.is_user_error());
    let _ = std::fs::remove_file(&path);
}

#[test]
fn test_nested_hybrid_is_rejected() {
    let geom = geometry();
    let vars = variables(&geom);
    let text = r#"
["saber central block"]
"saber block name" = "Hybrid"

[["saber central block".components]]
["saber central block".components.covariance]
"saber central block" = { "saber block name" = "Hybrid", components = [] }
"#;
    let err = build(&geom, &vars, text, 1, None, 1).err().unwrap();
    assert!(err.is_user_error());
}

/// Two-rank group seen from rank 0 of a single process; the other rank
/// contributes nothing to reductions.
#[derive(Debug)]
struct TwoRanks;

impl Communicator for TwoRanks {
    fn name(&self) -> &str {
        "two ranks"
    }

    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        2
    }

    fn all_reduce_sum(&self, value: f64) -> f64 {
        value
    }
}

#[test]
fn test_parallel_components_only_on_a_single_rank() {
    let text = HYBRID_QUARTERS.replace(
        "\"saber block name\" = \"Hybrid\"",
        "\"saber block name\" = \"Hybrid\"\n\"run in parallel\" = true",
    );
    let serial = geometry();
    let vars = variables(&serial);
    let b = build(&serial, &vars, &text, 1, None, 1).unwrap();
    assert!(b.runs_components_in_parallel());

    let params = serial.parameters().clone();
    let shared = Geometry::new(&params, Arc::new(TwoRanks)).unwrap();
    let b = build(&shared, &vars, &text, 1, None, 1).unwrap();
    assert!(!b.runs_components_in_parallel());
    let x = random_increment(&shared, &vars, 1, 13);
    let y = b.multiply(&x).unwrap();
    assert!(distance(&x, &y, &shared) < 1e-14 * x.norm(&shared).unwrap());
}

const HYBRID_ON_COARSE_GRID: &str = r#"
[["saber outer blocks"]]
"saber block name" = "Interpolation"
geometry = { nx = 3, ny = 3, levels = 2 }

["saber central block"]
"saber block name" = "Hybrid"
geometry = { nx = NX, ny = 3, levels = 2 }

[["saber central block".components]]
["saber central block".components.covariance]
"saber central block" = { "saber block name" = "Diagonal", variance = 2.0 }
"#;

#[test]
fn test_hybrid_geometry_must_match_common_inner_grid() {
    let geom = geometry();
    let vars = variables(&geom);
    let text = format!("\"adjoint test\" = true\n{}", HYBRID_ON_COARSE_GRID.replace("NX", "3"));
    let b = build(&geom, &vars, &text, 1, None, 1).unwrap();
    let chain = b.components()[0].chain();
    assert_eq!(chain.outer_geometry().parameters().nx, 3);
    assert_eq!(chain.outer_geometry().function_space().size(), 9);
    assert!(b.verification_records().iter().all(|r| r.passed()));

    // Bilinear weights are nonnegative and every coarse point is reached.
    let x = FieldSet4D::single(FieldSet::filled(&geom, &vars, 1.0));
    let y = b.multiply(&x).unwrap();
    assert!(owned_values(&y[0], "psi", &geom).iter().all(|v| *v > 0.0));

    let err = build(&geom, &vars, &HYBRID_ON_COARSE_GRID.replace("NX", "4"), 1, None, 1)
        .err()
        .unwrap();
    assert!(err.is_user_error());
    assert!(err.to_string().contains("Hybrid"), "{err}");
}

// =============================================================================
// Ensemble covariances
// =============================================================================

#[test]
fn test_ensemble_covariance_without_localization() {
    let geom = geometry();
    let vars = variables(&geom);
    let ens = members(&geom, &vars, 3);
    let b = build(
        &geom,
        &vars,
        r#""saber central block" = { "saber block name" = "Ensemble" }"#,
        1,
        Some(ens.clone()),
        1,
    )
    .unwrap();
    let x = random_increment(&geom, &vars, 1, 21);
    let y = b.multiply(&x).unwrap();

    let mut expected = FieldSet::zeros(&geom, &vars);
    for e in &ens {
        let alpha = e.dot(&x[0], &vars, &geom).unwrap();
        expected.axpy(0.5 * alpha, e).unwrap();
    }
    let expected = FieldSet4D::single(expected);
    assert!(distance(&y, &expected, &geom) < 1e-12 * expected.norm(&geom).unwrap());
}

#[test]
fn test_localized_ensemble_with_unit_localization() {
    let geom = geometry();
    let vars = variables(&geom);
    let ens = members(&geom, &vars, 4);
    let b = build(
        &geom,
        &vars,
        r#"
["saber central block"]
"saber block name" = "Ensemble"
inflation = 1.5
localization = { "saber central block" = { "saber block name" = "ID" } }
"#,
        1,
        Some(ens.clone()),
        1,
    )
    .unwrap();
    let x = random_increment(&geom, &vars, 1, 23);
    let y = b.multiply(&x).unwrap();

    // Σ ẽ ⊙ ẽ ⊙ x with ẽ = e √(1.5 / 3)
    let mut expected = FieldSet::zeros(&geom, &vars);
    for e in &ens {
        let mut t = e.clone();
        t.multiply(&x[0]).unwrap();
        t.multiply(e).unwrap();
        expected.axpy(0.5, &t).unwrap();
    }
    let expected = FieldSet4D::single(expected);
    assert!(distance(&y, &expected, &geom) < 1e-12 * expected.norm(&geom).unwrap());
}

#[test]
fn test_ensemble_needs_two_members() {
    let geom = geometry();
    let vars = variables(&geom);
    let err = build(
        &geom,
        &vars,
        r#""saber central block" = { "saber block name" = "Ensemble" }"#,
        1,
        Some(members(&geom, &vars, 1)),
        1,
    )
    .err()
    .unwrap();
    assert!(err.is_user_error());
}

#[test]
fn test_inherited_ensemble_goes_through_common_chain() {
    let geom = geometry();
    let vars = variables(&geom);
    let ens = members(&geom, &vars, 3);
    let plain = build(
        &geom,
        &vars,
        r#""saber central block" = { "saber block name" = "Ensemble" }"#,
        1,
        Some(ens.clone()),
        1,
    )
    .unwrap();
    // Members are divided by the common standard deviation before calibration,
    // so the common chain cancels out.
    let hybrid = build(
        &geom,
        &vars,
        r#"
"saber outer blocks" = [{ "saber block name" = "StdDev", value = 2.0 }]

["saber central block"]
"saber block name" = "Hybrid"

[["saber central block".components]]
["saber central block".components.covariance]
"saber central block" = { "saber block name" = "Ensemble" }
"#,
        1,
        Some(ens),
        1,
    )
    .unwrap();
    let x = random_increment(&geom, &vars, 1, 29);
    let a = plain.multiply(&x).unwrap();
    let b = hybrid.multiply(&x).unwrap();
    assert!(distance(&a, &b, &geom) < 1e-12 * a.norm(&geom).unwrap());
}

#[test]
fn test_dual_resolution_ensemble_behind_interpolation() {
    let geom = geometry();
    let vars = variables(&geom);
    let dual = Geometry::serial(&GeometryParameters {
        nx: 3,
        ny: 3,
        levels: 2,
        ..GeometryParameters::default()
    })
    .unwrap();
    let dual_vars = dual.variables_with_levels(&vars);
    let ones = FieldSet::filled(&dual, &dual_vars, 1.0);
    let mut minus = ones.clone();
    minus.scale(-1.0);
    let (paths, list) = member_files(&dual, &[ones, minus], "dual");
    let text = format!(
        r#"
"adjoint test" = true
"dual resolution geometry" = {{ nx = 3, ny = 3, levels = 2 }}
"dual resolution ensemble" = {{ members = {list} }}
"saber central block" = {{ "saber block name" = "Ensemble" }}
"saber outer blocks" = [{{ "saber block name" = "Interpolation" }}]
"#
    );
    let b = build(&geom, &vars, &text, 1, None, 1).unwrap();
    remove_files(&paths);
    assert!(b.to_string().contains("dual resolution"), "{b}");
    assert!(b.verification_records().iter().all(|r| r.passed()));

    // Bilinear weights sum to one: Iᵀδ meets each member with ±1, so the
    // response is 2 on every outer point, level and variable.
    let mut dirac = b.zero_increment();
    dirac[0].require_mut("psi").unwrap().values_mut()[[7, 0]] = 1.0;
    let y = b.multiply(&dirac).unwrap();
    for name in ["psi", "chi"] {
        for v in owned_values(&y[0], name, &geom) {
            assert_relative_eq!(v, 2.0, max_relative = 1e-12);
        }
    }
}

#[test]
fn test_iterative_loading_matches_bulk_loading() {
    let geom = geometry();
    let vars = variables(&geom);
    let ens = members(&geom, &vars, 4);
    let (paths, list) = member_files(&geom, &ens, "iterative");
    for central in [
        r#"{ "saber block name" = "Diagonal", calibration = {} }"#,
        r#"{ "saber block name" = "Ensemble" }"#,
        r#"{ "saber block name" = "Ensemble", localization = { "saber central block" = { "saber block name" = "ID" } } }"#,
    ] {
        let operator = |iterative: bool| {
            let text = format!(
                r#"
"iterative ensemble loading" = {iterative}
"ensemble pert" = {{ members = {list} }}
"saber central block" = {central}
"saber outer blocks" = [{{ "saber block name" = "StdDev", value = 2.0 }}]
"#
            );
            build(&geom, &vars, &text, 1, None, 1).unwrap()
        };
        let x = random_increment(&geom, &vars, 1, 31);
        let bulk = operator(false).multiply(&x).unwrap();
        let iterative = operator(true).multiply(&x).unwrap();
        assert!(bulk.norm(&geom).unwrap() > 0.0);
        assert!(
            distance(&bulk, &iterative, &geom) < 1e-12 * bulk.norm(&geom).unwrap(),
            "{central}"
        );
    }

    // Members are divided by the standard deviation before calibration,
    // so the diagonal recovers the plain unbiased variance.
    let text = format!(
        r#"
"iterative ensemble loading" = true
"ensemble pert" = {{ members = {list} }}
"saber central block" = {{ "saber block name" = "Diagonal", calibration = {{}} }}
"#
    );
    let b = build(&geom, &vars, &text, 1, None, 1).unwrap();
    remove_files(&paths);
    let y = b.multiply(&FieldSet4D::single(FieldSet::filled(&geom, &vars, 1.0))).unwrap();
    let samples: Vec<f64> = ens
        .iter()
        .map(|e| e.require("chi").unwrap().values()[[3, 1]])
        .collect();
    let mean = samples.iter().sum::<f64>() / 4.0;
    let variance = samples.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / 3.0;
    assert_relative_eq!(
        y[0].require("chi").unwrap().values()[[3, 1]],
        variance,
        max_relative = 1e-12
    );
}

// =============================================================================
// Time slots
// =============================================================================

#[test]
fn test_slot_count_mismatch_is_a_shape_error() {
    let geom = geometry();
    let vars = variables(&geom);
    let b = build(
        &geom,
        &vars,
        r#""saber central block" = { "saber block name" = "ID" }"#,
        1,
        None,
        1,
    )
    .unwrap();
    let x = random_increment(&geom, &vars, 2, 1);
    let err = b.multiply(&x).unwrap_err();
    assert!(matches!(err, SaberError::Shape { .. }));
}

#[test]
fn test_multiple_slots_need_time_covariance() {
    let geom = geometry();
    let vars = variables(&geom);
    let err = build(
        &geom,
        &vars,
        r#""saber central block" = { "saber block name" = "Diagonal", variance = 2.0 }"#,
        2,
        None,
        1,
    )
    .err()
    .unwrap();
    assert!(err.is_user_error());

    let b = build(
        &geom,
        &vars,
        r#"
"time covariance" = true
"saber central block" = { "saber block name" = "Diagonal", variance = 2.0 }
"#,
        2,
        None,
        1,
    )
    .unwrap();
    assert_eq!(b.time_slots(), 2);
    let x = random_increment(&geom, &vars, 2, 3);
    let y = b.multiply(&x).unwrap();
    let mut expected = x.clone();
    expected.scale(2.0);
    assert!(distance(&y, &expected, &geom) < 1e-14 * expected.norm(&geom).unwrap());
}

// =============================================================================
// Randomization
// =============================================================================

#[test]
fn test_randomize_is_deterministic_for_a_seed() {
    let geom = geometry();
    let vars = variables(&geom);
    let text = r#"
"saber central block" = { "saber block name" = "ID" }
"saber outer blocks" = [{ "saber block name" = "StdDev", value = 3.0 }]
"#;
    let a = build(&geom, &vars, text, 1, None, 7).unwrap();
    let b = build(&geom, &vars, text, 1, None, 7).unwrap();
    let c = build(&geom, &vars, text, 1, None, 8).unwrap();
    let sa = a.randomize().unwrap();
    let sb = b.randomize().unwrap();
    let sc = c.randomize().unwrap();
    assert_eq!(sa, sb);
    assert_ne!(sa, sc);
    // Successive draws differ.
    assert_ne!(sa, a.randomize().unwrap());
}

#[test]
fn test_randomized_sample_variance() {
    let geom = Geometry::serial(&GeometryParameters {
        nx: 40,
        ny: 40,
        levels: 4,
        ..GeometryParameters::default()
    })
    .unwrap();
    let vars = variables(&geom);
    let b = build(
        &geom,
        &vars,
        r#"
"saber outer blocks" = [{ "saber block name" = "StdDev", value = 2.0 }]

["saber central block"]
"saber block name" = "Hybrid"

[["saber central block".components]]
weight = { value = 0.5 }
["saber central block".components.covariance]
"saber central block" = { "saber block name" = "ID" }

[["saber central block".components]]
weight = { value = 0.5 }
["saber central block".components.covariance]
"saber central block" = { "saber block name" = "ID" }
"#,
        1,
        None,
        5,
    )
    .unwrap();
    // Var = 2² (0.5 + 0.5) = 4 per element.
    let s = b.randomize().unwrap();
    let n = (2 * 40 * 40 * 4) as f64;
    let variance = s.dot(&s, &geom).unwrap() / n;
    assert!((variance - 4.0).abs() < 0.2, "sample variance {variance}");
}

#[test]
fn test_localized_ensemble_slots_are_independent() {
    let geom = Geometry::serial(&GeometryParameters {
        nx: 20,
        ny: 20,
        levels: 2,
        ..GeometryParameters::default()
    })
    .unwrap();
    let vars = variables(&geom);
    // Identical unit members: each slot is the sum of the localization draws.
    let ones = FieldSet::filled(&geom, &vars, 1.0);
    let b = build(
        &geom,
        &vars,
        r#"
"time covariance" = true

["saber central block"]
"saber block name" = "Ensemble"
localization = { "saber central block" = { "saber block name" = "ID" } }
"#,
        2,
        Some(vec![ones.clone(), ones]),
        11,
    )
    .unwrap();
    let s = b.randomize().unwrap();
    let (a, c) = (&s[0], &s[1]);
    let corr = a.dot_all(c, &geom).unwrap()
        / (a.dot_all(a, &geom).unwrap() * c.dot_all(c, &geom).unwrap()).sqrt();
    assert!(corr.abs() < 0.15, "slot correlation {corr}");
}

#[test]
fn test_passive_noise_is_independent_of_member_weights() {
    let geom = geometry();
    // chi first, so the passive noise starts the draw.
    let vars = geom.variables_with_levels(&Variables::from_names(&["chi", "psi"]));
    let ones = FieldSet::filled(&geom, &vars, 1.0);
    let zeros = FieldSet::zeros(&geom, &vars);
    let text = r#""saber central block" = { "saber block name" = "Ensemble", "active variables" = ["psi"] }"#;
    for seed in 1..6 {
        let b = build(&geom, &vars, text, 1, Some(vec![ones.clone(), zeros.clone()]), seed)
            .unwrap();
        let s = b.randomize().unwrap();
        // psi is the first member weight everywhere.
        let weight = s[0].require("psi").unwrap().values()[[0, 0]];
        let noise = s[0].require("chi").unwrap().values()[[0, 0]];
        assert!(weight != 0.0);
        assert!(weight != noise, "seed {seed}: weight {weight} reused as passive noise");
    }
}

#[test]
fn test_diagonal_randomize_follows_variance() {
    let geom = geometry();
    let vars = variables(&geom);
    let b = build(
        &geom,
        &vars,
        r#""saber central block" = { "saber block name" = "Diagonal", variance = 1.0, "variance per variable" = { chi = 0.0 } }"#,
        1,
        None,
        1,
    )
    .unwrap();
    let s = b.randomize().unwrap();
    assert_eq!(s[0].require("chi").unwrap().values().iter().map(|v| v.abs()).sum::<f64>(), 0.0);
    assert!(s[0].require("psi").unwrap().values().iter().any(|v| *v != 0.0));
}

#[test]
fn test_diagonal_calibration_from_ensemble() {
    let geom = geometry();
    let vars = variables(&geom);
    let ens = members(&geom, &vars, 5);
    let b = build(
        &geom,
        &vars,
        r#""saber central block" = { "saber block name" = "Diagonal", calibration = {} }"#,
        1,
        Some(ens.clone()),
        1,
    )
    .unwrap();
    let x = FieldSet4D::single(FieldSet::filled(&geom, &vars, 1.0));
    let y = b.multiply(&x).unwrap();

    // Unbiased sample variance at the first point and level of psi.
    let samples: Vec<f64> = ens
        .iter()
        .map(|e| e.require("psi").unwrap().values()[[0, 0]])
        .collect();
    let mean = samples.iter().sum::<f64>() / 5.0;
    let variance = samples.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / 4.0;
    assert_relative_eq!(
        y[0].require("psi").unwrap().values()[[0, 0]],
        variance,
        max_relative = 1e-12
    );
}

// =============================================================================
// Configuration end to end
// =============================================================================

#[test]
fn test_toolbox_config_builds_operator() {
    let cfg: ToolboxConfig = toml::from_str(
        r#"
"input variables" = ["psi", "chi"]
dirac = [{ ix = 2, iy = 1, level = 1, variable = "chi" }]
seed = 3

[geometry]
nx = 5
ny = 4
levels = 2

[background]
value = 1.0

["background error"]
"adjoint test" = true
"inverse test" = true

["background error"."saber central block"]
"saber block name" = "Diagonal"
variance = 4.0

[["background error"."saber outer blocks"]]
"saber block name" = "Identity"
"#,
    )
    .unwrap();
    cfg.validate().unwrap();
    let geom = Geometry::serial(&cfg.geometry).unwrap();
    let vars = Variables::from_names(&cfg.input_variables);
    let xb = FieldSet4D::new(
        cfg.background
            .states()
            .iter()
            .map(|s| io::read_state(s, &geom, &vars))
            .collect::<SaberResult<Vec<_>>>()
            .unwrap(),
    );
    let b = ErrorCovariance::new(&geom, &vars, &cfg.background_error, &xb, &xb).unwrap();
    assert!(b.verification_records().iter().all(|r| r.passed()));
    assert_eq!(b.outer_variables().get("chi").map(|v| v.levels), Some(2));

    let mut dirac = b.zero_increment();
    let point = &cfg.dirac[0];
    let index = point.iy * cfg.geometry.nx + point.ix;
    dirac[0].require_mut(&point.variable).unwrap().values_mut()[[index, point.level]] = 1.0;
    let response = b.multiply(&dirac).unwrap();
    assert_eq!(response[0].require("chi").unwrap().values()[[index, 1]], 4.0);
    assert_relative_eq!(response.norm(&geom).unwrap(), 4.0);
}

#[test]
fn test_covariance_config_defaults_are_quiet() {
    let cfg = CovarianceConfig::default();
    assert!(!cfg.adjoint_test);
    assert!(!cfg.inverse_test);
    assert!(cfg.ensemble.is_none());
}

#[test]
fn test_training_moments_end_to_end() {
    let params = GeometryParameters {
        nx: 6,
        ny: 5,
        levels: 2,
        ..GeometryParameters::default()
    };
    let geom = Geometry::serial(&params).unwrap();
    let vars = geom.variables_with_levels(&Variables::from_names(&["psi"]));
    let ens: Vec<FieldSet> = (0..3).map(|ie| FieldSet::random(&geom, &vars, 300 + ie)).collect();
    let (paths, list) = member_files(&geom, &ens, "train");
    let output = |name: &str| {
        temp_path(&format!("{name}__MPI_-_OMP_.json"))
            .display()
            .to_string()
    };
    let randomized = temp_path("train_random_%member%.json").display().to_string();
    let text = format!(
        r#"
"input variables" = ["psi"]
"ensemble pert" = {{ members = {list} }}
"randomized ensemble output" = "{randomized}"

[geometry]
nx = 6
ny = 5
levels = 2

[background]
value = 1.0

["background error"]
"randomization size" = 4
"saber central block" = {{ "saber block name" = "Diagonal", variance = 4.0 }}

[[output]]
parameter = "var"
file = "{}"

[[output]]
parameter = "mean_lr"
file = "{}"

[[output]]
parameter = "stddev_lr"
file = "{}"
"#,
        output("var"),
        output("mean_lr"),
        output("stddev_lr"),
    );
    let cfg: TrainingConfig = toml::from_str(&text).unwrap();
    let report = TrainingDriver::new(cfg).unwrap().run().unwrap();
    remove_files(&paths);

    assert_eq!(report.ensemble1_members, 3);
    assert_eq!(report.ensemble2_members, 4);
    assert_eq!(report.outputs.len(), 3);
    for out in &report.outputs {
        let file = out.file.display().to_string();
        assert!(file.ends_with("_1-1.json"), "{file}");
        assert!(out.file.exists(), "{file}");
    }

    // Unbiased variance of the file ensemble.
    let var = io::read_fieldset(&report.outputs[0].file, &geom, &vars).unwrap();
    let samples: Vec<f64> = ens
        .iter()
        .map(|e| e.require("psi").unwrap().values()[[4, 1]])
        .collect();
    let mean = samples.iter().sum::<f64>() / 3.0;
    let variance = samples.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / 2.0;
    assert_relative_eq!(
        var.require("psi").unwrap().values()[[4, 1]],
        variance,
        max_relative = 1e-12
    );

    // The randomized ensemble has its sample mean removed.
    let mean_lr = io::read_fieldset(&report.outputs[1].file, &geom, &vars).unwrap();
    assert!(mean_lr.max_abs() < 1e-12);
    assert!(report.outputs[1].norm < 1e-12);
    assert!(report.outputs[2].norm > 0.0);

    let members: Vec<PathBuf> = (1..=4)
        .map(|ie| PathBuf::from(randomized.replace("%member%", &ie.to_string())))
        .collect();
    let mut sum = FieldSet::zeros(&geom, &vars);
    for path in &members {
        sum.add(&io::read_fieldset(path, &geom, &vars).unwrap()).unwrap();
    }
    assert!(sum.max_abs() < 1e-12);
    remove_files(&members);
    remove_files(&report.outputs.iter().map(|o| o.file.clone()).collect::<Vec<_>>());
}
