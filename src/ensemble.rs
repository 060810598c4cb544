//! Ensemble member sources: held in memory, or read from disk on demand.

use std::fmt;
use std::sync::Arc;

use tracing::info;

use crate::config::EnsembleSource;
use crate::error::SaberResult;
use crate::field::FieldSet;
use crate::geometry::Geometry;
use crate::io;
use crate::variables::Variables;

/// Ensemble perturbations laid out on one geometry.
pub trait MemberSource: fmt::Debug + Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn geometry(&self) -> &Geometry;

    /// Member `index`, as a fresh bundle.
    fn member(&self, index: usize) -> SaberResult<FieldSet>;

    /// Every member at once.
    fn members(&self) -> SaberResult<Vec<FieldSet>> {
        (0..self.len()).map(|ie| self.member(ie)).collect()
    }
}

#[derive(Debug, Clone)]
pub struct InMemoryEnsemble {
    geometry: Geometry,
    members: Vec<FieldSet>,
}

impl InMemoryEnsemble {
    pub fn new(geometry: Geometry, members: Vec<FieldSet>) -> Self {
        Self { geometry, members }
    }
}

impl MemberSource for InMemoryEnsemble {
    fn len(&self) -> usize {
        self.members.len()
    }

    fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    fn member(&self, index: usize) -> SaberResult<FieldSet> {
        self.members.get(index).cloned().ok_or_else(|| {
            crate::error::SaberError::config("ensemble", format!("member {index} out of range"))
        })
    }

    fn members(&self) -> SaberResult<Vec<FieldSet>> {
        Ok(self.members.clone())
    }
}

/// Members read from files each time they are requested. For ensembles of
/// states the mean is computed once at construction.
#[derive(Debug)]
pub struct FileEnsemble {
    geometry: Geometry,
    source: EnsembleSource,
    vars: Variables,
    mean: Option<FieldSet>,
}

impl FileEnsemble {
    pub fn new(geometry: Geometry, source: EnsembleSource, vars: Variables) -> SaberResult<Self> {
        let mean = io::ensemble_mean(&source, &geometry, &vars)?;
        info!(
            members = source.size(),
            geometry = geometry.id(),
            "ensemble members will be read on demand"
        );
        Ok(Self {
            geometry,
            source,
            vars,
            mean,
        })
    }
}

impl MemberSource for FileEnsemble {
    fn len(&self) -> usize {
        self.source.size()
    }

    fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    fn member(&self, index: usize) -> SaberResult<FieldSet> {
        io::read_member(&self.source, index, self.mean.as_ref(), &self.geometry, &self.vars)
    }
}

/// Ensemble source from configuration: read now, or lazily when `iterative`.
pub fn load(
    source: EnsembleSource,
    geometry: &Geometry,
    vars: &Variables,
    iterative: bool,
) -> SaberResult<Arc<dyn MemberSource>> {
    if iterative {
        Ok(Arc::new(FileEnsemble::new(geometry.clone(), source, vars.clone())?))
    } else {
        let members = io::read_ensemble(&source, geometry, vars)?;
        Ok(Arc::new(InMemoryEnsemble::new(geometry.clone(), members)))
    }
}
