//! Pairwise-combinable ensemble moments.
//!
//! Updates follow Welford; merges follow Chan et al., so feeding members one
//! at a time or in batches gives the same statistics up to rounding.

use ndarray::Zip;

use crate::error::{SaberError, SaberResult};
use crate::field::FieldSet;

#[derive(Debug, Clone)]
pub struct Moments {
    count: usize,
    mean: FieldSet,
    m2: FieldSet,
}

impl Moments {
    /// Empty accumulator shaped like `template`.
    pub fn new(template: &FieldSet) -> Self {
        Self {
            count: 0,
            mean: template.zero_like(),
            m2: template.zero_like(),
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn update(&mut self, member: &FieldSet) -> SaberResult<()> {
        self.count += 1;
        let n = self.count as f64;
        for (mean, m2) in self.mean.iter_mut().zip(self.m2.iter_mut()) {
            let x = member.require(mean.name())?;
            if x.values().dim() != mean.values().dim() {
                return Err(SaberError::shape(
                    "moments",
                    format!("member field {} has shape {:?}", x.name(), x.values().dim()),
                ));
            }
            Zip::from(mean.values_mut())
                .and(m2.values_mut())
                .and(x.values())
                .for_each(|mu, s, &v| {
                    let delta = v - *mu;
                    *mu += delta / n;
                    *s += delta * (v - *mu);
                });
        }
        Ok(())
    }

    /// Combines with statistics gathered over a disjoint set of members.
    pub fn merge(&mut self, other: &Moments) -> SaberResult<()> {
        if other.count == 0 {
            return Ok(());
        }
        if self.count == 0 {
            *self = other.clone();
            return Ok(());
        }
        let (na, nb) = (self.count as f64, other.count as f64);
        let n = na + nb;
        for (mean, m2) in self.mean.iter_mut().zip(self.m2.iter_mut()) {
            let mb = other.mean.require(mean.name())?;
            let sb = other.m2.require(mean.name())?;
            Zip::from(mean.values_mut())
                .and(m2.values_mut())
                .and(mb.values())
                .and(sb.values())
                .for_each(|mu, s, &mu_b, &s_b| {
                    let delta = mu_b - *mu;
                    *mu += delta * nb / n;
                    *s += s_b + delta * delta * na * nb / n;
                });
        }
        self.count += other.count;
        Ok(())
    }

    pub fn mean(&self) -> &FieldSet {
        &self.mean
    }

    /// Unbiased sample variance; needs at least two members.
    pub fn variance(&self) -> SaberResult<FieldSet> {
        if self.count < 2 {
            return Err(SaberError::config(
                "calibration",
                format!("variance needs at least 2 members, got {}", self.count),
            ));
        }
        let mut var = self.m2.clone();
        var.scale(1.0 / (self.count - 1) as f64);
        Ok(var)
    }

    pub fn std_dev(&self) -> SaberResult<FieldSet> {
        let mut sd = self.variance()?;
        sd.sqrt()?;
        Ok(sd)
    }
}
