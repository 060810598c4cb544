//! Localized sample covariance of ensemble perturbations.

use std::fmt;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use tracing::{info, trace};

use crate::blocks::parameters::ParameterKey;
use crate::blocks::{
    substream_seed, BlockContext, BlockParameters, Capabilities, CentralBlock, CentralBlockType,
    ParameterKind, SaberBlock, SaberBlockParameters,
};
use crate::error::{SaberError, SaberResult};
use crate::field::FieldSet;
use crate::geometry::Geometry;
use crate::localization::Localization;
use crate::variables::Variables;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EnsembleParameters {
    #[serde(flatten)]
    pub base: SaberBlockParameters,
    #[serde(default)]
    pub localization: Option<toml::Table>,
    #[serde(default = "default_inflation")]
    pub inflation: f64,
}

fn default_inflation() -> f64 {
    1.0
}

impl Default for EnsembleParameters {
    fn default() -> Self {
        Self {
            base: SaberBlockParameters::default(),
            localization: None,
            inflation: 1.0,
        }
    }
}

impl BlockParameters for EnsembleParameters {
    const KEYS: &'static [ParameterKey] = &[
        ParameterKey::optional(
            "localization",
            ParameterKind::Table,
            None,
            "central block (and outer blocks) of the localization chain",
        ),
        ParameterKey::optional(
            "inflation",
            ParameterKind::Float,
            Some("1.0"),
            "multiplicative variance inflation",
        ),
    ];

    fn base(&self) -> &SaberBlockParameters {
        &self.base
    }

    fn validate(&self) -> SaberResult<()> {
        if self.inflation.is_nan() || self.inflation <= 0.0 {
            return Err(SaberError::config(&self.base.name, "inflation must be positive"));
        }
        Ok(())
    }
}

/// C = Σ ẽ_i ẽ_iᵀ with ẽ_i = e_i √(inflation / (N - 1)), Schur-localized by L
/// when a localization chain is configured:
/// C x = Σ ẽ_i ⊙ L (ẽ_i ⊙ x).
pub struct Ensemble {
    geometry: Geometry,
    vars: Variables,
    active: Variables,
    inflation: f64,
    localization: Option<Localization>,
    members: Vec<FieldSet>,
    pending: Vec<FieldSet>,
}

impl Ensemble {
    pub fn size(&self) -> usize {
        self.members.len()
    }

    fn set_members(&mut self, members: Vec<FieldSet>) -> SaberResult<()> {
        let n = members.len();
        if n < 2 {
            return Err(SaberError::config(
                Self::NAME,
                format!("a sample covariance needs at least 2 members, got {n}"),
            ));
        }
        let factor = (self.inflation / (n - 1) as f64).sqrt();
        self.members = members
            .iter()
            .map(|m| {
                let mut m = m.subset(&self.active)?;
                m.scale(factor);
                Ok(m)
            })
            .collect::<SaberResult<_>>()?;
        info!(block = Self::NAME, members = n, inflation = self.inflation, "ensemble calibrated");
        Ok(())
    }

    fn require_members(&self) -> SaberResult<()> {
        if self.members.is_empty() {
            return Err(SaberError::config(Self::NAME, "no ensemble members received"));
        }
        Ok(())
    }
}

impl SaberBlock for Ensemble {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::MULTIPLY | Capabilities::RANDOMIZE | Capabilities::DIRECT_CALIBRATION
    }

    fn active_vars(&self) -> &Variables {
        &self.active
    }
}

impl CentralBlock for Ensemble {
    fn multiply(&self, fset: &mut FieldSet) -> SaberResult<()> {
        self.require_members()?;
        trace!(members = self.members.len(), "ensemble multiply");
        let x = fset.subset(&self.active)?;
        let mut y = x.zero_like();
        for member in &self.members {
            match &self.localization {
                None => {
                    let alpha = member.dot(&x, &self.active, &self.geometry)?;
                    y.axpy(alpha, member)?;
                }
                Some(loc) => {
                    let mut t = member.clone();
                    t.multiply(&x)?;
                    loc.multiply(&mut t)?;
                    t.multiply(member)?;
                    y.add(&t)?;
                }
            }
        }
        for field in y.iter() {
            fset.insert(field.clone());
        }
        Ok(())
    }

    /// Passive variables receive white noise.
    fn randomize(&self, fset: &mut FieldSet, seed: u64) -> SaberResult<()> {
        self.require_members()?;
        let mut out = FieldSet::random(&self.geometry, &self.vars, substream_seed(seed, 0));
        let mut y = FieldSet::zeros(&self.geometry, &self.active);
        match &self.localization {
            None => {
                let mut rng = ChaCha8Rng::seed_from_u64(seed);
                for member in &self.members {
                    let alpha: f64 = StandardNormal.sample(&mut rng);
                    y.axpy(alpha, member)?;
                }
            }
            Some(loc) => {
                for (ie, member) in self.members.iter().enumerate() {
                    let mut xi = FieldSet::zeros(&self.geometry, &self.active);
                    loc.randomize(&mut xi, substream_seed(seed, ie as u64 + 1))?;
                    xi.multiply(member)?;
                    y.add(&xi)?;
                }
            }
        }
        for field in y.iter() {
            out.insert(field.clone());
        }
        *fset = out;
        Ok(())
    }

    fn direct_calibration(&mut self, members: &[FieldSet]) -> SaberResult<()> {
        self.set_members(members.to_vec())
    }

    fn iterative_calibration_update(&mut self, member: &FieldSet) -> SaberResult<()> {
        self.pending.push(member.subset(&self.active)?);
        Ok(())
    }

    fn iterative_calibration_final(&mut self) -> SaberResult<()> {
        let pending = std::mem::take(&mut self.pending);
        self.set_members(pending)
    }
}

impl CentralBlockType for Ensemble {
    const NAME: &'static str = "Ensemble";
    type Parameters = EnsembleParameters;

    fn new(
        ctx: &BlockContext<'_>,
        vars: &Variables,
        active: Variables,
        params: EnsembleParameters,
    ) -> SaberResult<Self> {
        let localization = params
            .localization
            .as_ref()
            .map(|table| Localization::new(ctx, &active, table))
            .transpose()?;
        Ok(Self {
            geometry: ctx.geometry.clone(),
            vars: vars.clone(),
            active,
            inflation: params.inflation,
            localization,
            members: Vec::new(),
            pending: Vec::new(),
        })
    }
}

impl fmt::Display for Ensemble {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ensemble of {} members on {}", self.members.len(), self.active)?;
        if self.inflation != 1.0 {
            write!(f, ", inflation {}", self.inflation)?;
        }
        if self.localization.is_some() {
            write!(f, ", localized")?;
        }
        Ok(())
    }
}
