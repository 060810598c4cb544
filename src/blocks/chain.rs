//! Central chain contract and the skeleton both chain kinds share.

use std::fmt;

use tracing::trace;

use super::{substream_seed, Capabilities, CentralBlock, OuterBlockChain};
use crate::ensemble::MemberSource;
use crate::error::{SaberError, SaberResult};
use crate::field::{FieldSet, FieldSet4D};
use crate::geometry::Geometry;
use crate::variables::Variables;
use crate::verification::TestRecord;

/// A covariance expressed as an inner outer-block chain around one central block.
pub trait BlockChain: fmt::Display + Send + Sync {
    /// `Parametric` or `Ensemble`.
    fn kind(&self) -> &'static str;

    fn outer_geometry(&self) -> &Geometry;

    fn outer_vars(&self) -> &Variables;

    /// y = O C Oᵀ x, in place.
    fn multiply_3d(&self, fset: &mut FieldSet) -> SaberResult<()>;

    /// Overwrites `fset` with a draw from N(0, O C Oᵀ).
    fn randomize_3d(&self, fset: &mut FieldSet, seed: u64) -> SaberResult<()>;

    fn records(&self) -> Vec<TestRecord>;

    /// Every time slot through the same blocks.
    fn multiply(&self, fset: &mut FieldSet4D) -> SaberResult<()> {
        fset.iter_mut().try_for_each(|slot| self.multiply_3d(slot))
    }

    /// Independent draws per time slot.
    fn randomize(&self, fset: &mut FieldSet4D, seed: u64) -> SaberResult<()> {
        fset.iter_mut()
            .enumerate()
            .try_for_each(|(it, slot)| self.randomize_3d(slot, substream_seed(seed, it as u64)))
    }
}

/// Outer chain plus central block.
pub struct ChainCore {
    pub outer: OuterBlockChain,
    pub central: Box<dyn CentralBlock>,
    pub records: Vec<TestRecord>,
}

impl ChainCore {
    pub fn multiply(&self, fset: &mut FieldSet) -> SaberResult<()> {
        trace!(central = self.central.name(), "chain multiply");
        self.outer.apply_ad(fset)?;
        self.central.multiply(fset)?;
        self.outer.apply(fset)
    }

    pub fn randomize(&self, fset: &mut FieldSet, seed: u64) -> SaberResult<()> {
        if !self.central.capabilities().contains(Capabilities::RANDOMIZE) {
            return Err(SaberError::not_supported(self.central.name(), "randomize"));
        }
        let mut control = FieldSet::zeros(self.outer.inner_geometry(), self.outer.inner_vars());
        self.central.randomize(&mut control, seed)?;
        self.outer.apply(&mut control)?;
        *fset = control;
        Ok(())
    }

    pub fn records(&self) -> Vec<TestRecord> {
        self.outer
            .records()
            .iter()
            .chain(self.records.iter())
            .cloned()
            .collect()
    }

    pub fn fmt_with(&self, f: &mut fmt::Formatter<'_>, kind: &str) -> fmt::Result {
        writeln!(f, "{kind} chain")?;
        if !self.outer.is_empty() {
            writeln!(f, " Outer blocks:")?;
            write!(f, "{}", self.outer)?;
        }
        writeln!(f, " Central block:")?;
        writeln!(f, "  {}", self.central)
    }
}

/// Hands ensemble members to a central block in control space, all at once
/// or one at a time.
pub(crate) fn feed_members(
    central: &mut dyn CentralBlock,
    outer: &OuterBlockChain,
    source: &dyn MemberSource,
    iterative: bool,
) -> SaberResult<()> {
    if iterative {
        for ie in 0..source.len() {
            let mut member = source.member(ie)?;
            outer.apply_inverse_from(source.geometry(), &mut member)?;
            central.iterative_calibration_update(&member)?;
        }
        central.iterative_calibration_final()
    } else {
        let mut members = source.members()?;
        for member in members.iter_mut() {
            outer.apply_inverse_from(source.geometry(), member)?;
        }
        central.direct_calibration(&members)
    }
}
