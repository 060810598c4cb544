//! The background error covariance operator B.
//!
//! B = O_c (Σ_k W_k^{1/2} B_k W_k^{1/2}) O_cᵀ where O_c is the common outer
//! chain of a `Hybrid` configuration and each B_k is a central block chain.
//! A non-hybrid configuration is a single component of weight 1 with no
//! common chain.

mod hybrid;

pub use hybrid::HybridComponent;

use std::fmt;
use std::sync::Arc;

use tracing::{info, trace, warn};

use crate::blocks::{
    substream_seed, BlockChain, BlockContext, BlockFactory, CentralBlockType, CovarianceConfig,
    EnsembleChain, OuterBlockChain, ParametricChain,
};
use crate::config::{
    block_name, EnsembleKeys, EnsembleSource, ErrorCovarianceParameters, GeometryParameters,
};
use crate::ensemble::{self, InMemoryEnsemble, MemberSource};
use crate::error::{SaberError, SaberResult};
use crate::field::{FieldSet, FieldSet4D};
use crate::generic::{ComponentParameters, Ensemble, Hybrid, HybridParameters};
use crate::geometry::Geometry;
use crate::gmresr::{
    gmresr, GmresrOutcome, IdentityOperator, LinearOperator, GMRESR_MAX_ITERATIONS,
    GMRESR_TOLERANCE,
};
use crate::io;
use crate::variables::Variables;
use crate::verification::{adjoint_test_operator, TestRecord};

const OPERATOR_LABEL: &str = "ErrorCovariance";

pub struct ErrorCovariance {
    geometry: Geometry,
    vars: Variables,
    covariance: CovarianceConfig,
    common: Option<OuterBlockChain>,
    components: Vec<HybridComponent>,
    run_in_parallel: bool,
    slots: usize,
    records: Vec<TestRecord>,
}

/// Whether any block of a chain description calibrates from the ensemble.
fn needs_members(central: &toml::Table, outer: &[toml::Table]) -> bool {
    matches!(block_name(central, "saber central block"), Ok(name) if name == Ensemble::NAME)
        || central.contains_key("calibration")
        || outer.iter().any(|t| t.contains_key("calibration"))
}

/// Ensemble chain for an `Ensemble` central block, parametric chain otherwise.
fn build_chain(
    ctx: &BlockContext<'_>,
    vars: &Variables,
    central: &toml::Table,
    outer: &[toml::Table],
) -> SaberResult<Box<dyn BlockChain>> {
    let name = block_name(central, "saber central block")?;
    trace!(central = name, "central chain construction");
    if name == Hybrid::NAME {
        return Err(SaberError::config(
            Hybrid::NAME,
            "a hybrid component cannot itself be Hybrid",
        ));
    }
    if name == Ensemble::NAME {
        Ok(Box::new(EnsembleChain::new(ctx, vars, central, outer)?))
    } else {
        Ok(Box::new(ParametricChain::new(ctx, vars, central, outer)?))
    }
}

fn load_source(
    keys: &EnsembleKeys,
    context: &str,
    geometry: &Geometry,
    vars: &Variables,
    iterative: bool,
) -> SaberResult<Option<Arc<dyn MemberSource>>> {
    keys.source(context)?
        .map(|source| ensemble::load(source, geometry, vars, iterative))
        .transpose()
}

impl ErrorCovariance {
    /// Reads the ensembles and dual geometry a configuration refers to.
    pub fn load_config(
        geometry: &Geometry,
        vars: &Variables,
        params: &ErrorCovarianceParameters,
    ) -> SaberResult<CovarianceConfig> {
        params.validate()?;
        let mut covariance = CovarianceConfig::from_parameters(params);
        covariance.ensemble = load_source(
            &params.ensembles,
            "background error",
            geometry,
            vars,
            params.iterative_ensemble_loading,
        )?;
        if let Some(dual_params) = &params.dual_geometry {
            let dual = geometry.dual(Some(dual_params))?;
            if let Some(files) = &params.dual_ensemble {
                let dual_vars = dual.variables_with_levels(vars);
                covariance.dual_ensemble = Some(ensemble::load(
                    EnsembleSource::Perturbations(files.clone()),
                    &dual,
                    &dual_vars,
                    params.iterative_ensemble_loading,
                )?);
            }
            covariance.dual_geometry = Some(dual);
        }
        Ok(covariance)
    }

    /// Reads ensembles from disk, then assembles the operator.
    pub fn new(
        geometry: &Geometry,
        vars: &Variables,
        params: &ErrorCovarianceParameters,
        xb: &FieldSet4D,
        fg: &FieldSet4D,
    ) -> SaberResult<Self> {
        let covariance = Self::load_config(geometry, vars, params)?;
        Self::from_config(geometry, vars, params, covariance, xb, fg)
    }

    /// Assembles the operator with ensembles and seeds already in `covariance`.
    pub fn from_config(
        geometry: &Geometry,
        vars: &Variables,
        params: &ErrorCovarianceParameters,
        covariance: CovarianceConfig,
        xb: &FieldSet4D,
        fg: &FieldSet4D,
    ) -> SaberResult<Self> {
        params.validate()?;
        let factory = BlockFactory::global()?;
        let slots = xb.len();
        if slots == 0 || fg.len() != slots {
            return Err(SaberError::config(
                "background",
                format!("{} background and {} first guess time slots", slots, fg.len()),
            ));
        }
        if slots > 1 && !covariance.time_covariance {
            return Err(SaberError::config(
                "time covariance",
                format!("a 3D covariance cannot act on {slots} time slots"),
            ));
        }
        let (xb3, fg3) = match (xb.first(), fg.first()) {
            (Some(a), Some(b)) => (a, b),
            _ => return Err(SaberError::Internal("empty background".into())),
        };
        let vars = geometry.variables_with_levels(vars);
        let ctx = BlockContext {
            factory,
            covariance: &covariance,
            geometry,
            xb: xb3,
            fg: fg3,
        };

        let central_name = params.central_name()?;
        let (common, components, run_in_parallel) = if central_name == Hybrid::NAME {
            let record = factory.central_parameters(&params.central)?;
            let hybrid = record
                .as_any()
                .downcast_ref::<HybridParameters>()
                .cloned()
                .ok_or_else(|| SaberError::Internal("Hybrid parameter record type".into()))?;
            let common =
                OuterBlockChain::new(&ctx, &vars, &params.outer, covariance.ensemble.as_deref())?;
            let hybrid_geometry = Self::hybrid_geometry(&common, hybrid.geometry.as_ref())?;
            let components = hybrid
                .components
                .iter()
                .enumerate()
                .map(|(jj, component)| {
                    Self::build_component(&ctx, &common, &hybrid_geometry, jj, component)
                })
                .collect::<SaberResult<Vec<_>>>()?;
            // Collectives must be issued in the same order on every rank.
            let ranks = geometry.comm().size();
            if hybrid.run_in_parallel && ranks > 1 {
                warn!(ranks, "components evaluated sequentially on a multi-rank communicator");
            }
            (Some(common), components, hybrid.run_in_parallel && ranks == 1)
        } else {
            let chain = build_chain(&ctx, &vars, &params.central, &params.outer)?;
            (None, vec![HybridComponent::new(central_name, chain, 1.0, None)], false)
        };

        let mut cov = Self {
            geometry: geometry.clone(),
            vars,
            covariance,
            common,
            components,
            run_in_parallel,
            slots,
            records: Vec::new(),
        };
        if cov.covariance.adjoint_test {
            let record = adjoint_test_operator(
                &cov,
                OPERATOR_LABEL,
                &cov.geometry,
                &cov.vars,
                slots,
                cov.covariance.adjoint_tolerance,
                cov.covariance.seeds.next_seed(),
            )?;
            cov.records.push(record);
        }
        info!(
            components = cov.components.len(),
            common_outer_blocks = cov.common.as_ref().map_or(0, OuterBlockChain::len),
            slots,
            "error covariance ready"
        );
        Ok(cov)
    }

    /// Geometry the components live on: the inner side of the common chain,
    /// which the hybrid `geometry` key must describe when given.
    fn hybrid_geometry(
        common: &OuterBlockChain,
        params: Option<&GeometryParameters>,
    ) -> SaberResult<Geometry> {
        let inner = common.inner_geometry();
        let Some(p) = params else {
            return Ok(inner.clone());
        };
        let geometry = inner.dual(Some(p))?;
        if !geometry.same_grid(inner) {
            let q = inner.parameters();
            return Err(SaberError::config(
                Hybrid::NAME,
                format!(
                    "geometry {}x{} ({} levels) differs from the {}x{} ({} levels) inner geometry \
                     of the common outer blocks",
                    p.nx, p.ny, p.levels, q.nx, q.ny, q.levels
                ),
            ));
        }
        Ok(geometry)
    }

    /// One component, built on the hybrid geometry.
    fn build_component(
        ctx: &BlockContext<'_>,
        common: &OuterBlockChain,
        geometry: &Geometry,
        jj: usize,
        component: &ComponentParameters,
    ) -> SaberResult<HybridComponent> {
        let label = format!("component {jj}");
        let cov_params = &component.covariance;
        let vars = common.inner_vars();
        let iterative = cov_params
            .iterative_ensemble_loading
            .unwrap_or(ctx.covariance.iterative_ensemble_loading);

        let mut covariance = CovarianceConfig {
            iterative_ensemble_loading: iterative,
            ..ctx.covariance.clone()
        };
        if let Some(own) = load_source(&cov_params.ensembles, &label, geometry, vars, iterative)? {
            covariance.ensemble = Some(own);
        } else if let Some(inherited) = &ctx.covariance.ensemble {
            if !common.is_empty() && needs_members(&cov_params.central, &cov_params.outer) {
                let mut members = inherited.members()?;
                for member in members.iter_mut() {
                    common.apply_inverse_from(inherited.geometry(), member)?;
                }
                covariance.ensemble =
                    Some(Arc::new(InMemoryEnsemble::new(geometry.clone(), members)));
            }
        }

        let (xb, fg) = common.inner_background();
        let component_ctx = BlockContext {
            covariance: &covariance,
            geometry,
            xb,
            fg,
            ..*ctx
        };
        let chain = build_chain(&component_ctx, vars, &cov_params.central, &cov_params.outer)?;

        let scalar_sqrt = component.weight.value.unwrap_or(1.0).sqrt();
        let field_sqrt = match &component.weight.file {
            Some(file) => {
                let mut weight = io::read_fieldset(&file.filepath, geometry, vars)?;
                weight.sqrt().map_err(|_| {
                    SaberError::config(
                        &label,
                        format!("negative weight in {}", file.filepath.display()),
                    )
                })?;
                Some(weight)
            }
            None => None,
        };
        info!(
            component = %label,
            weight = scalar_sqrt * scalar_sqrt,
            field_weight = field_sqrt.is_some(),
            "hybrid component ready"
        );
        Ok(HybridComponent::new(label, chain, scalar_sqrt, field_sqrt))
    }

    fn check_slots(&self, x: &FieldSet4D) -> SaberResult<()> {
        if x.len() != self.slots {
            return Err(SaberError::shape(
                OPERATOR_LABEL,
                format!("increment has {} time slots, operator has {}", x.len(), self.slots),
            ));
        }
        Ok(())
    }

    fn component_products(&self, z: &FieldSet4D) -> SaberResult<Vec<FieldSet4D>> {
        if !self.run_in_parallel || self.components.len() < 2 {
            return self.components.iter().map(|c| c.multiply(z)).collect();
        }
        std::thread::scope(|scope| {
            let handles: Vec<_> = self
                .components
                .iter()
                .map(|c| scope.spawn(move || c.multiply(z)))
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join()
                        .unwrap_or_else(|_| {
                            Err(SaberError::Internal("component thread panicked".into()))
                        })
                })
                .collect()
        })
    }

    /// y = B x.
    pub fn multiply(&self, x: &FieldSet4D) -> SaberResult<FieldSet4D> {
        self.check_slots(x)?;
        trace!("ErrorCovariance::multiply starting");
        let mut z = x.clone();
        if let Some(common) = &self.common {
            z.iter_mut().try_for_each(|slot| common.apply_ad(slot))?;
        }
        let mut products = self.component_products(&z)?.into_iter();
        let mut y = products
            .next()
            .ok_or_else(|| SaberError::Internal("covariance without components".into()))?;
        for p in products {
            y.add(&p)?;
        }
        if let Some(common) = &self.common {
            y.iter_mut().try_for_each(|slot| common.apply(slot))?;
        }
        trace!("ErrorCovariance::multiply done");
        Ok(y)
    }

    /// A draw from N(0, B).
    pub fn randomize(&self) -> SaberResult<FieldSet4D> {
        let seed = self.covariance.seeds.next_seed();
        let mut y: Option<FieldSet4D> = None;
        for (jj, component) in self.components.iter().enumerate() {
            let s = component.randomize(self.slots, substream_seed(seed, jj as u64))?;
            match y.as_mut() {
                Some(acc) => acc.add(&s)?,
                None => y = Some(s),
            }
        }
        let mut y = y.ok_or_else(|| SaberError::Internal("covariance without components".into()))?;
        if let Some(common) = &self.common {
            y.iter_mut().try_for_each(|slot| common.apply(slot))?;
        }
        Ok(y)
    }

    /// x = B⁻¹ y by GMRESR; running out of iterations only warns.
    pub fn inverse_multiply(&self, y: &FieldSet4D) -> SaberResult<(FieldSet4D, GmresrOutcome)> {
        self.check_slots(y)?;
        gmresr(
            self,
            &IdentityOperator,
            y,
            &self.geometry,
            GMRESR_MAX_ITERATIONS,
            GMRESR_TOLERANCE,
        )
    }

    /// Every adjoint and inverse test run during assembly, outermost first.
    pub fn verification_records(&self) -> Vec<TestRecord> {
        let mut out: Vec<TestRecord> = self
            .common
            .as_ref()
            .map(|c| c.records().to_vec())
            .unwrap_or_default();
        for component in &self.components {
            out.extend(component.chain().records());
        }
        out.extend(self.records.iter().cloned());
        out
    }

    pub fn outer_variables(&self) -> &Variables {
        &self.vars
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn components(&self) -> &[HybridComponent] {
        &self.components
    }

    /// Whether hybrid components are evaluated on concurrent threads.
    pub fn runs_components_in_parallel(&self) -> bool {
        self.run_in_parallel
    }

    pub fn time_slots(&self) -> usize {
        self.slots
    }

    /// Zero increment laid out like the operator's input.
    pub fn zero_increment(&self) -> FieldSet4D {
        FieldSet4D::new(
            (0..self.slots)
                .map(|_| FieldSet::zeros(&self.geometry, &self.vars))
                .collect(),
        )
    }
}

impl LinearOperator for ErrorCovariance {
    fn apply(&self, x: &FieldSet4D) -> SaberResult<FieldSet4D> {
        self.multiply(x)
    }
}

impl fmt::Display for ErrorCovariance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{OPERATOR_LABEL} on {} ({} time slot{})",
            self.vars,
            self.slots,
            if self.slots == 1 { "" } else { "s" }
        )?;
        if let Some(common) = self.common.as_ref().filter(|c| !c.is_empty()) {
            writeln!(f, "Common outer blocks:")?;
            write!(f, "{common}")?;
        }
        for component in &self.components {
            write!(f, "{component}")?;
        }
        Ok(())
    }
}
