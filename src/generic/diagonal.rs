//! Diagonal variance central block.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::blocks::parameters::ParameterKey;
use crate::blocks::{
    BlockContext, BlockParameters, Capabilities, CentralBlock, CentralBlockType, ParameterKind,
    SaberBlock, SaberBlockParameters,
};
use crate::error::{SaberError, SaberResult};
use crate::field::FieldSet;
use crate::geometry::Geometry;
use crate::io;
use crate::moments::Moments;
use crate::variables::Variables;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DiagonalParameters {
    #[serde(flatten)]
    pub base: SaberBlockParameters,
    #[serde(default = "default_variance")]
    pub variance: f64,
    #[serde(rename = "variance per variable", default)]
    pub per_variable: BTreeMap<String, f64>,
}

fn default_variance() -> f64 {
    1.0
}

impl Default for DiagonalParameters {
    fn default() -> Self {
        Self {
            base: SaberBlockParameters::default(),
            variance: 1.0,
            per_variable: BTreeMap::new(),
        }
    }
}

impl BlockParameters for DiagonalParameters {
    const KEYS: &'static [ParameterKey] = &[
        ParameterKey::optional(
            "variance",
            ParameterKind::Float,
            Some("1.0"),
            "variance of every active variable",
        ),
        ParameterKey::optional(
            "variance per variable",
            ParameterKind::FloatMap,
            None,
            "variance overrides by variable name",
        ),
    ];

    fn base(&self) -> &SaberBlockParameters {
        &self.base
    }

    fn validate(&self) -> SaberResult<()> {
        if self.variance.is_nan() || self.variance < 0.0 {
            return Err(SaberError::config(&self.base.name, "variance must be nonnegative"));
        }
        if let Some((name, _)) = self.per_variable.iter().find(|(_, v)| v.is_nan() || **v < 0.0) {
            return Err(SaberError::config(
                &self.base.name,
                format!("variance of {name} must be nonnegative"),
            ));
        }
        Ok(())
    }
}

/// C x = v ⊙ x on the active variables.
pub struct Diagonal {
    geometry: Geometry,
    vars: Variables,
    active: Variables,
    params: DiagonalParameters,
    variance: FieldSet,
    moments: Option<Moments>,
}

impl Diagonal {
    pub fn variance(&self) -> &FieldSet {
        &self.variance
    }

    fn set_variance(&mut self, variance: FieldSet) -> SaberResult<()> {
        self.variance = variance.subset(&self.active)?;
        info!(
            block = Self::NAME,
            max = self.variance.max_abs(),
            "variance updated"
        );
        Ok(())
    }
}

impl SaberBlock for Diagonal {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::MULTIPLY
            | Capabilities::RANDOMIZE
            | Capabilities::READ
            | Capabilities::WRITE
            | Capabilities::DIRECT_CALIBRATION
    }

    fn active_vars(&self) -> &Variables {
        &self.active
    }
}

impl CentralBlock for Diagonal {
    fn multiply(&self, fset: &mut FieldSet) -> SaberResult<()> {
        fset.multiply_by(&self.variance)
    }

    fn randomize(&self, fset: &mut FieldSet, seed: u64) -> SaberResult<()> {
        let mut std_dev = self.variance.clone();
        std_dev.sqrt()?;
        let mut noise = FieldSet::random(&self.geometry, &self.vars, seed);
        noise.multiply_by(&std_dev)?;
        *fset = noise;
        Ok(())
    }

    fn read(&mut self) -> SaberResult<()> {
        let path = match &self.params.base.read {
            Some(read) => read.filepath.clone(),
            None => return Err(SaberError::config(Self::NAME, "read requires a filepath")),
        };
        let variance = io::read_fieldset(&path, &self.geometry, &self.active)?;
        if variance.iter().any(|f| f.values().iter().any(|v| v.is_nan() || *v < 0.0)) {
            return Err(SaberError::config(
                Self::NAME,
                format!("negative variance in {}", path.display()),
            ));
        }
        self.set_variance(variance)
    }

    fn write(&self) -> SaberResult<()> {
        match &self.params.base.write {
            Some(write) => io::write_fieldset(&write.filepath, &self.variance, &self.geometry),
            None => Err(SaberError::config(Self::NAME, "write requires a filepath")),
        }
    }

    fn direct_calibration(&mut self, members: &[FieldSet]) -> SaberResult<()> {
        let mut moments = Moments::new(&self.variance);
        for member in members {
            moments.update(&member.subset(&self.active)?)?;
        }
        self.set_variance(moments.variance()?)
    }

    fn iterative_calibration_update(&mut self, member: &FieldSet) -> SaberResult<()> {
        let member = member.subset(&self.active)?;
        self.moments
            .get_or_insert_with(|| Moments::new(&member))
            .update(&member)
    }

    fn iterative_calibration_final(&mut self) -> SaberResult<()> {
        let moments = self
            .moments
            .take()
            .ok_or_else(|| SaberError::config(Self::NAME, "no ensemble member received"))?;
        self.set_variance(moments.variance()?)
    }
}

impl CentralBlockType for Diagonal {
    const NAME: &'static str = "Diagonal";
    type Parameters = DiagonalParameters;

    fn new(
        ctx: &BlockContext<'_>,
        vars: &Variables,
        active: Variables,
        params: DiagonalParameters,
    ) -> SaberResult<Self> {
        let mut variance = FieldSet::filled(ctx.geometry, &active, params.variance);
        for (name, value) in &params.per_variable {
            let field = variance.field_mut(name).ok_or_else(|| {
                SaberError::config(
                    Self::NAME,
                    format!("variance per variable names {name}, which is not an active variable"),
                )
            })?;
            field.values_mut().fill(*value);
        }
        Ok(Self {
            geometry: ctx.geometry.clone(),
            vars: vars.clone(),
            active,
            params,
            variance,
            moments: None,
        })
    }
}

impl fmt::Display for Diagonal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Diagonal on {}", self.active)
    }
}
