//! Offline calibration from ensembles.
//!
//! The driver assembles up to two ensembles (the second one possibly on a
//! low-resolution geometry, or drawn from a covariance), hands their members
//! to a calibration kernel, and writes the requested parameters.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::config::{InputFieldParameters, MomentsParameters, TrainingConfig};
use crate::covariance::ErrorCovariance;
use crate::ensemble::{self, InMemoryEnsemble, MemberSource};
use crate::error::{SaberError, SaberResult};
use crate::field::{FieldSet, FieldSet4D};
use crate::geometry::{Communicator, Geometry, SerialComm};
use crate::io;
use crate::logging::test_line;
use crate::moments::Moments;
use crate::variables::Variables;

/// Suffix of parameters computed from ensemble 2.
pub const LOWRES_SUFFIX: &str = "_lr";

/// Which ensemble a member or parameter belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EnsembleIndex {
    First,
    Second,
}

impl EnsembleIndex {
    /// Ensemble 2 for `_lr` parameters, ensemble 1 otherwise.
    pub fn of_parameter(parameter: &str) -> Self {
        if parameter.ends_with(LOWRES_SUFFIX) {
            EnsembleIndex::Second
        } else {
            EnsembleIndex::First
        }
    }
}

/// A named auxiliary field set handed to the kernel.
#[derive(Debug, Clone)]
pub struct InputField {
    pub parameter: String,
    pub component: usize,
    pub fset: FieldSet,
}

pub trait CalibrationKernel {
    fn name(&self) -> &str;

    /// Bulk path: members delivered while the ensemble is in memory.
    fn add_member(
        &mut self,
        member: &FieldSet,
        index: usize,
        ensemble: EnsembleIndex,
    ) -> SaberResult<()>;

    /// Iterative path: members delivered one at a time as they are read.
    fn update_moments(
        &mut self,
        member: &FieldSet,
        index: usize,
        ensemble: EnsembleIndex,
    ) -> SaberResult<()>;

    /// Turns accumulated statistics into parameters.
    fn run_drivers(&mut self) -> SaberResult<()>;

    fn get_parameter(&self, parameter: &str, component: usize) -> SaberResult<FieldSet>;
}

#[derive(Debug, Default)]
struct Accumulator {
    bulk: Option<Moments>,
    iterative: Option<Moments>,
}

impl Accumulator {
    fn push(slot: &mut Option<Moments>, member: &FieldSet) -> SaberResult<()> {
        slot.get_or_insert_with(|| Moments::new(member)).update(member)
    }

    /// Both paths merged into one set of statistics.
    fn merged(&self) -> SaberResult<Option<Moments>> {
        match (&self.bulk, &self.iterative) {
            (None, None) => Ok(None),
            (Some(m), None) | (None, Some(m)) => Ok(Some(m.clone())),
            (Some(a), Some(b)) => {
                let mut m = a.clone();
                m.merge(b)?;
                Ok(Some(m))
            }
        }
    }
}

#[derive(Debug, Clone)]
struct Statistics {
    mean: FieldSet,
    variance: FieldSet,
    std_dev: FieldSet,
}

/// Mean, variance and standard deviation of each ensemble.
pub struct MomentsKernel {
    params: MomentsParameters,
    vars: Variables,
    mask: [Option<FieldSet>; 2],
    accumulators: [Accumulator; 2],
    statistics: [Option<Statistics>; 2],
}

fn slot(ensemble: EnsembleIndex) -> usize {
    match ensemble {
        EnsembleIndex::First => 0,
        EnsembleIndex::Second => 1,
    }
}

/// 1 where the mask is nonzero, 0 elsewhere.
fn indicator(mask: &FieldSet) -> FieldSet {
    let mut out = mask.clone();
    for f in out.iter_mut() {
        f.values_mut().mapv_inplace(|v| if v != 0.0 { 1.0 } else { 0.0 });
    }
    out
}

impl MomentsKernel {
    pub const NAME: &'static str = "Moments";
    pub const MASK: &'static str = "mask";

    pub fn new(
        params: MomentsParameters,
        vars: &Variables,
        inputs: &[InputField],
        lowres_inputs: &[InputField],
    ) -> Self {
        let mask_of = |inputs: &[InputField]| {
            inputs
                .iter()
                .find(|i| i.parameter == Self::MASK)
                .map(|i| indicator(&i.fset))
        };
        Self {
            params,
            vars: vars.clone(),
            mask: [mask_of(inputs), mask_of(lowres_inputs)],
            accumulators: [Accumulator::default(), Accumulator::default()],
            statistics: [None, None],
        }
    }

    pub fn members(&self, ensemble: EnsembleIndex) -> usize {
        let acc = &self.accumulators[slot(ensemble)];
        acc.bulk.as_ref().map_or(0, Moments::count)
            + acc.iterative.as_ref().map_or(0, Moments::count)
    }

    fn statistics(
        moments: &Moments,
        floor: f64,
        mask: Option<&FieldSet>,
    ) -> SaberResult<Statistics> {
        let mut mean = moments.mean().clone();
        let mut variance = moments.variance()?;
        if floor > 0.0 {
            for f in variance.iter_mut() {
                f.values_mut().mapv_inplace(|v| v.max(floor));
            }
        }
        if let Some(mask) = mask {
            mean.multiply_by(mask)?;
            variance.multiply_by(mask)?;
        }
        let mut std_dev = variance.clone();
        std_dev.sqrt()?;
        Ok(Statistics {
            mean,
            variance,
            std_dev,
        })
    }
}

impl CalibrationKernel for MomentsKernel {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn add_member(
        &mut self,
        member: &FieldSet,
        _index: usize,
        ensemble: EnsembleIndex,
    ) -> SaberResult<()> {
        let member = member.subset(&self.vars)?;
        Accumulator::push(&mut self.accumulators[slot(ensemble)].bulk, &member)
    }

    fn update_moments(
        &mut self,
        member: &FieldSet,
        _index: usize,
        ensemble: EnsembleIndex,
    ) -> SaberResult<()> {
        let member = member.subset(&self.vars)?;
        Accumulator::push(&mut self.accumulators[slot(ensemble)].iterative, &member)
    }

    fn run_drivers(&mut self) -> SaberResult<()> {
        for k in 0..2 {
            if let Some(moments) = self.accumulators[k].merged()? {
                info!(
                    kernel = Self::NAME,
                    ensemble = k + 1,
                    members = moments.count(),
                    "moments computed"
                );
                self.statistics[k] = Some(Self::statistics(
                    &moments,
                    self.params.variance_floor,
                    self.mask[k].as_ref(),
                )?);
            }
        }
        Ok(())
    }

    fn get_parameter(&self, parameter: &str, component: usize) -> SaberResult<FieldSet> {
        if component != 1 {
            return Err(SaberError::config(
                parameter,
                format!("{} has a single component, got {component}", Self::NAME),
            ));
        }
        let ensemble = EnsembleIndex::of_parameter(parameter);
        let base = parameter.strip_suffix(LOWRES_SUFFIX).unwrap_or(parameter);
        let stats = self.statistics[slot(ensemble)].as_ref().ok_or_else(|| {
            SaberError::config(parameter, "no ensemble members for this parameter")
        })?;
        match base {
            "mean" => Ok(stats.mean.clone()),
            "var" => Ok(stats.variance.clone()),
            "stddev" => Ok(stats.std_dev.clone()),
            _ => Err(SaberError::config(
                parameter,
                format!("unknown {} parameter", Self::NAME),
            )),
        }
    }
}

/// One written parameter.
#[derive(Debug, Clone, Serialize)]
pub struct OutputNorm {
    pub parameter: String,
    pub component: usize,
    pub file: PathBuf,
    pub norm: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TrainingReport {
    pub ensemble1_members: usize,
    pub ensemble2_members: usize,
    pub outputs: Vec<OutputNorm>,
}

pub struct TrainingDriver {
    config: TrainingConfig,
    geometry: Geometry,
    lowres_geometry: Geometry,
    vars: Variables,
    lowres_vars: Variables,
}

impl TrainingDriver {
    pub fn new(config: TrainingConfig) -> SaberResult<Self> {
        Self::with_comm(config, Arc::new(SerialComm))
    }

    pub fn with_comm(config: TrainingConfig, comm: Arc<dyn Communicator>) -> SaberResult<Self> {
        config.validate()?;
        let geometry = Geometry::new(&config.geometry, comm)?;
        let lowres_geometry = geometry.dual(config.lowres_geometry.as_ref())?;
        let names = Variables::from_names(&config.input_variables);
        let vars = geometry.variables_with_levels(&names);
        let lowres_vars = lowres_geometry.variables_with_levels(&names);
        Ok(Self {
            config,
            geometry,
            lowres_geometry,
            vars,
            lowres_vars,
        })
    }

    fn background(&self, geometry: &Geometry, vars: &Variables) -> SaberResult<FieldSet> {
        io::read_state(&self.config.background.state, geometry, vars)
    }

    fn first_ensemble(&self) -> SaberResult<Option<Arc<dyn MemberSource>>> {
        self.config
            .ensembles
            .source("ensemble")?
            .map(|source| {
                ensemble::load(
                    source,
                    &self.geometry,
                    &self.vars,
                    self.config.iterative_ensemble_loading,
                )
            })
            .transpose()
    }

    /// Read from the `lowres` keys, or drawn from `background error` with the
    /// sample mean removed.
    fn second_ensemble(&self) -> SaberResult<Option<Arc<dyn MemberSource>>> {
        let Some(params) = &self.config.background_error else {
            return self
                .config
                .lowres_keys()
                .source("lowres ensemble")?
                .map(|source| {
                    ensemble::load(
                        source,
                        &self.lowres_geometry,
                        &self.lowres_vars,
                        self.config.iterative_ensemble_loading,
                    )
                })
                .transpose();
        };

        let xb = FieldSet4D::single(self.background(&self.lowres_geometry, &self.lowres_vars)?);
        let bmat =
            ErrorCovariance::new(&self.lowres_geometry, &self.lowres_vars, params, &xb, &xb)?;
        let size = params.randomization_size;
        let mut members = Vec::with_capacity(size);
        let mut mean = FieldSet::zeros(&self.lowres_geometry, &self.lowres_vars);
        for ie in 0..size {
            info!(member = ie + 1, size, "generate randomized ensemble member");
            let draw = bmat
                .randomize()?
                .into_slots()
                .into_iter()
                .next()
                .ok_or_else(|| SaberError::Internal("randomized increment without slots".into()))?;
            mean.add(&draw)?;
            members.push(draw);
        }
        mean.scale(1.0 / size as f64);
        for member in members.iter_mut() {
            member.sub(&mean)?;
        }
        if let Some(template) = &self.config.randomized_ensemble_output {
            for (ie, member) in members.iter().enumerate() {
                let path = PathBuf::from(template.replace("%member%", &(ie + 1).to_string()));
                io::write_fieldset(&path, member, &self.lowres_geometry)?;
            }
        }
        Ok(Some(Arc::new(InMemoryEnsemble::new(self.lowres_geometry.clone(), members))))
    }

    fn input_fields(
        inputs: &[InputFieldParameters],
        geometry: &Geometry,
        vars: &Variables,
    ) -> SaberResult<Vec<InputField>> {
        inputs
            .iter()
            .map(|input| {
                Ok(InputField {
                    parameter: input.parameter.clone(),
                    component: input.component,
                    fset: io::read_fieldset(&input.file, geometry, vars)?,
                })
            })
            .collect()
    }

    fn feed(
        &self,
        kernel: &mut dyn CalibrationKernel,
        source: &dyn MemberSource,
        ensemble: EnsembleIndex,
    ) -> SaberResult<()> {
        if self.config.iterative_ensemble_loading {
            for ie in 0..source.len() {
                info!(member = ie + 1, size = source.len(), "load member");
                kernel.update_moments(&source.member(ie)?, ie, ensemble)?;
            }
        } else {
            for (ie, member) in source.members()?.iter().enumerate() {
                kernel.add_member(member, ie, ensemble)?;
            }
        }
        Ok(())
    }

    /// Runs the moments kernel.
    pub fn run(&self) -> SaberResult<TrainingReport> {
        let inputs = Self::input_fields(&self.config.input_fields, &self.geometry, &self.vars)?;
        let lowres_inputs = Self::input_fields(
            &self.config.lowres_input_fields,
            &self.lowres_geometry,
            &self.lowres_vars,
        )?;
        let mut kernel = MomentsKernel::new(
            self.config.moments.clone(),
            &self.vars,
            &inputs,
            &lowres_inputs,
        );
        self.run_with(&mut kernel)
    }

    /// Feeds both ensembles to `kernel` and writes the configured outputs.
    pub fn run_with(&self, kernel: &mut dyn CalibrationKernel) -> SaberResult<TrainingReport> {
        let mut report = TrainingReport::default();
        if let Some(ens1) = self.first_ensemble()? {
            info!(kernel = kernel.name(), members = ens1.len(), "add members of ensemble 1");
            self.feed(kernel, ens1.as_ref(), EnsembleIndex::First)?;
            report.ensemble1_members = ens1.len();
        }
        if let Some(ens2) = self.second_ensemble()? {
            info!(kernel = kernel.name(), members = ens2.len(), "add members of ensemble 2");
            self.feed(kernel, ens2.as_ref(), EnsembleIndex::Second)?;
            report.ensemble2_members = ens2.len();
        }
        kernel.run_drivers()?;

        let mpi = self.geometry.comm().size();
        for output in &self.config.output {
            let (geometry, vars) = match EnsembleIndex::of_parameter(&output.parameter) {
                EnsembleIndex::First => (&self.geometry, &self.vars),
                EnsembleIndex::Second => (&self.lowres_geometry, &self.lowres_vars),
            };
            let mut fset = kernel.get_parameter(&output.parameter, output.component)?.subset(vars)?;
            fset.synchronize(geometry.function_space());
            let file = output.resolved_file(mpi, 1);
            io::write_fieldset(&file, &fset, geometry)?;
            let norm = fset.norm(geometry)?;
            test_line(&format!(
                "Norm of output parameter {} - {}: {:.12e}",
                output.parameter, output.component, norm
            ));
            report.outputs.push(OutputNorm {
                parameter: output.parameter.clone(),
                component: output.component,
                file,
                norm,
            });
        }
        Ok(report)
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn lowres_geometry(&self) -> &Geometry {
        &self.lowres_geometry
    }
}
