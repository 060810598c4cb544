//! One weighted term of a hybrid covariance.

use std::fmt;

use tracing::trace;

use crate::blocks::BlockChain;
use crate::error::SaberResult;
use crate::field::{FieldSet, FieldSet4D};

/// `W^{1/2} B W^{1/2}` with `W^{1/2}` a scalar times an optional field.
pub struct HybridComponent {
    pub(crate) chain: Box<dyn BlockChain>,
    scalar_sqrt: f64,
    field_sqrt: Option<FieldSet>,
    label: String,
}

impl HybridComponent {
    /// Weights must already be square-rooted.
    pub fn new(
        label: impl Into<String>,
        chain: Box<dyn BlockChain>,
        scalar_sqrt: f64,
        field_sqrt: Option<FieldSet>,
    ) -> Self {
        Self {
            chain,
            scalar_sqrt,
            field_sqrt,
            label: label.into(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn chain(&self) -> &dyn BlockChain {
        self.chain.as_ref()
    }

    pub fn scalar_sqrt(&self) -> f64 {
        self.scalar_sqrt
    }

    pub fn field_sqrt(&self) -> Option<&FieldSet> {
        self.field_sqrt.as_ref()
    }

    fn apply_weight(&self, fset: &mut FieldSet4D) -> SaberResult<()> {
        if self.scalar_sqrt != 1.0 {
            fset.scale(self.scalar_sqrt);
        }
        if let Some(weight) = &self.field_sqrt {
            for slot in fset.iter_mut() {
                slot.multiply_by(weight)?;
            }
        }
        Ok(())
    }

    /// `W^{1/2} B W^{1/2} x`.
    pub fn multiply(&self, x: &FieldSet4D) -> SaberResult<FieldSet4D> {
        trace!(component = %self.label, "component multiply");
        let mut w = x.clone();
        self.apply_weight(&mut w)?;
        self.chain.multiply(&mut w)?;
        self.apply_weight(&mut w)?;
        Ok(w)
    }

    /// `W^{1/2} s` with `s` drawn from N(0, B); `slots` independent time slots.
    pub fn randomize(&self, slots: usize, seed: u64) -> SaberResult<FieldSet4D> {
        let geometry = self.chain.outer_geometry();
        let vars = self.chain.outer_vars();
        let mut s = FieldSet4D::new((0..slots).map(|_| FieldSet::zeros(geometry, vars)).collect());
        self.chain.randomize(&mut s, seed)?;
        self.apply_weight(&mut s)?;
        Ok(s)
    }
}

impl fmt::Display for HybridComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (weight {}", self.label, self.scalar_sqrt * self.scalar_sqrt)?;
        if self.field_sqrt.is_some() {
            write!(f, " with field weight")?;
        }
        writeln!(f, ")")?;
        write!(f, "{}", self.chain)
    }
}
