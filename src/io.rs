//! Field-set files, ensemble readers and the CSV norm report.
//!
//! Field sets are stored as JSON: `{"variables": [{"name", "levels", "values"}]}`
//! with `values` laid out point-major over owned points only.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{EnsembleSource, StateParameters};
use crate::error::{SaberError, SaberResult};
use crate::field::{Field, FieldSet};
use crate::geometry::GeometryData;
use crate::variables::Variables;

#[derive(Debug, Serialize, Deserialize)]
struct FieldRecord {
    name: String,
    levels: usize,
    values: Vec<Vec<f64>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FieldSetFile {
    variables: Vec<FieldRecord>,
}

fn ensure_parent(path: &Path) -> SaberResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| SaberError::io(parent, e))?;
        }
    }
    Ok(())
}

/// Writes the owned points of every field.
pub fn write_fieldset(path: &Path, fset: &FieldSet, geom: &GeometryData) -> SaberResult<()> {
    let owned = geom.function_space().owned();
    let variables = fset
        .iter()
        .map(|f| FieldRecord {
            name: f.name().to_string(),
            levels: f.levels(),
            values: f
                .values()
                .rows()
                .into_iter()
                .take(owned)
                .map(|r| r.to_vec())
                .collect(),
        })
        .collect();
    ensure_parent(path)?;
    let file = File::create(path).map_err(|e| SaberError::io(path, e))?;
    serde_json::to_writer(BufWriter::new(file), &FieldSetFile { variables }).map_err(|e| {
        SaberError::Format {
            path: path.to_path_buf(),
            message: e.to_string(),
        }
    })?;
    debug!(path = %path.display(), fields = fset.len(), "wrote field set");
    Ok(())
}

/// Reads the requested variables onto `geom`; halo points are synchronized.
/// Extra variables in the file are ignored; missing ones are an error.
pub fn read_fieldset(path: &Path, geom: &GeometryData, vars: &Variables) -> SaberResult<FieldSet> {
    let format_err = |message: String| SaberError::Format {
        path: path.to_path_buf(),
        message,
    };
    let file = File::open(path).map_err(|e| SaberError::io(path, e))?;
    let content: FieldSetFile =
        serde_json::from_reader(BufReader::new(file)).map_err(|e| format_err(e.to_string()))?;

    let fs = geom.function_space();
    let mut out = FieldSet::new();
    for var in vars {
        let rec = content
            .variables
            .iter()
            .find(|r| r.name == var.name)
            .ok_or_else(|| format_err(format!("variable {} not found", var.name)))?;
        let levels = geom.levels(&var.name);
        if rec.levels != levels || rec.values.len() != fs.owned() {
            return Err(format_err(format!(
                "variable {} has {} points x {} levels, geometry {} expects {} x {}",
                rec.name,
                rec.values.len(),
                rec.levels,
                geom.id(),
                fs.owned(),
                levels
            )));
        }
        let mut values = Array2::zeros((fs.size(), levels));
        for (jnode, row) in rec.values.iter().enumerate() {
            if row.len() != levels {
                return Err(format_err(format!(
                    "variable {} point {jnode} has {} levels",
                    rec.name,
                    row.len()
                )));
            }
            for (jlev, v) in row.iter().enumerate() {
                values[[jnode, jlev]] = *v;
            }
        }
        out.insert(Field::new(var.name.clone(), values));
    }
    out.synchronize(fs);
    Ok(out)
}

/// A state from file or a constant fill.
pub fn read_state(
    params: &StateParameters,
    geom: &GeometryData,
    vars: &Variables,
) -> SaberResult<FieldSet> {
    match &params.filepath {
        Some(path) => read_fieldset(path, geom, vars),
        None => Ok(FieldSet::filled(geom, vars, params.value)),
    }
}

/// Reads member `index` of an ensemble source as a perturbation.
/// For states the ensemble mean must be supplied.
pub fn read_member(
    source: &EnsembleSource,
    index: usize,
    mean: Option<&FieldSet>,
    geom: &GeometryData,
    vars: &Variables,
) -> SaberResult<FieldSet> {
    let nth = |files: &crate::config::EnsembleFiles| {
        files.paths().into_iter().nth(index).ok_or_else(|| {
            SaberError::config("ensemble", format!("member {index} out of range"))
        })
    };
    match source {
        EnsembleSource::Perturbations(files) => read_fieldset(&nth(files)?, geom, vars),
        EnsembleSource::States(files) => {
            let mut member = read_fieldset(&nth(files)?, geom, vars)?;
            if let Some(m) = mean {
                member.sub(m)?;
            }
            Ok(member)
        }
        EnsembleSource::Pairs { base, pairs } => {
            let mut member = read_fieldset(&nth(base)?, geom, vars)?;
            member.sub(&read_fieldset(&nth(pairs)?, geom, vars)?)?;
            Ok(member)
        }
    }
}

/// Mean of an ensemble of states, read one member at a time.
pub fn ensemble_mean(
    source: &EnsembleSource,
    geom: &GeometryData,
    vars: &Variables,
) -> SaberResult<Option<FieldSet>> {
    let EnsembleSource::States(files) = source else {
        return Ok(None);
    };
    let paths = files.paths();
    if paths.is_empty() {
        return Ok(None);
    }
    let mut mean = FieldSet::zeros(geom, vars);
    for path in &paths {
        mean.add(&read_fieldset(path, geom, vars)?)?;
    }
    mean.scale(1.0 / paths.len() as f64);
    Ok(Some(mean))
}

/// Reads every member of an ensemble as perturbations.
pub fn read_ensemble(
    source: &EnsembleSource,
    geom: &GeometryData,
    vars: &Variables,
) -> SaberResult<Vec<FieldSet>> {
    let mean = ensemble_mean(source, geom, vars)?;
    let members = (0..source.size())
        .map(|ie| read_member(source, ie, mean.as_ref(), geom, vars))
        .collect::<SaberResult<Vec<_>>>()?;
    info!(members = members.len(), geometry = geom.id(), "ensemble read");
    Ok(members)
}

/// CSV report of norms, one row per output.
pub struct NormWriter {
    w: BufWriter<File>,
}

impl NormWriter {
    pub fn create(path: &Path) -> SaberResult<Self> {
        ensure_parent(path)?;
        let f = File::create(path).map_err(|e| SaberError::io(path, e))?;
        Ok(Self { w: BufWriter::new(f) })
    }

    pub fn write_header(&mut self) -> SaberResult<()> {
        writeln!(self.w, "kind,label,index,norm").map_err(|e| SaberError::io("norm report", e))
    }

    pub fn write_row(
        &mut self,
        kind: &str,
        label: &str,
        index: usize,
        norm: f64,
    ) -> SaberResult<()> {
        writeln!(self.w, "{},{},{},{:.12e}", kind, label, index, norm)
            .map_err(|e| SaberError::io("norm report", e))
    }

    pub fn flush(&mut self) -> SaberResult<()> {
        self.w.flush().map_err(|e| SaberError::io("norm report", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EnsembleFiles, GeometryParameters};
    use crate::geometry::Geometry;
    use std::path::PathBuf;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("saber_io_{}_{}", std::process::id(), name))
    }

    fn geometry() -> Geometry {
        Geometry::serial(&GeometryParameters {
            nx: 3,
            ny: 2,
            levels: 2,
            halo: 1,
            ..GeometryParameters::default()
        })
        .unwrap()
    }

    #[test]
    fn test_fieldset_file_preserves_owned_values() {
        let geom = geometry();
        let vars = Variables::from_names(&["t", "q"]);
        let x = FieldSet::random(&geom, &vars, 3);
        let path = temp_path("roundtrip.json");
        write_fieldset(&path, &x, &geom).unwrap();
        let y = read_fieldset(&path, &geom, &vars).unwrap();
        assert_eq!(x, y);
        let only_q = read_fieldset(&path, &geom, &Variables::from_names(&["q"])).unwrap();
        assert_eq!(only_q.names(), vec!["q".to_string()]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_missing_variable_is_a_format_error() {
        let geom = geometry();
        let path = temp_path("missing.json");
        let zeros = FieldSet::zeros(&geom, &Variables::from_names(&["t"]));
        write_fieldset(&path, &zeros, &geom).unwrap();
        let err = read_fieldset(&path, &geom, &Variables::from_names(&["u"])).unwrap_err();
        assert!(matches!(err, SaberError::Format { .. }));
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_state_ensemble_has_zero_mean() {
        let geom = geometry();
        let vars = Variables::from_names(&["t"]);
        let paths: Vec<PathBuf> = (0..3).map(|i| temp_path(&format!("state{i}.json"))).collect();
        for (i, p) in paths.iter().enumerate() {
            write_fieldset(p, &FieldSet::filled(&geom, &vars, i as f64), &geom).unwrap();
        }
        let source = EnsembleSource::States(EnsembleFiles {
            members: paths.clone(),
            template: None,
        });
        let members = read_ensemble(&source, &geom, &vars).unwrap();
        let mut sum = FieldSet::zeros(&geom, &vars);
        for m in &members {
            sum.add(m).unwrap();
        }
        assert!(sum.max_abs() < 1e-14);
        assert!((members[0].max_abs() - 1.0).abs() < 1e-14);
        for p in &paths {
            let _ = fs::remove_file(p);
        }
    }
}
