//! Matrix-free GMRESR for `inverseMultiply` of a covariance operator.

use serde::Serialize;
use tracing::{info, warn};

use crate::error::SaberResult;
use crate::field::FieldSet4D;
use crate::geometry::GeometryData;

pub const GMRESR_MAX_ITERATIONS: usize = 10;
pub const GMRESR_TOLERANCE: f64 = 1.0e-3;

/// Linear map on time-slotted field bundles.
pub trait LinearOperator {
    fn apply(&self, x: &FieldSet4D) -> SaberResult<FieldSet4D>;
}

/// Identity preconditioner.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityOperator;

impl LinearOperator for IdentityOperator {
    fn apply(&self, x: &FieldSet4D) -> SaberResult<FieldSet4D> {
        Ok(x.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GmresrOutcome {
    pub iterations: usize,
    pub initial_norm: f64,
    pub residual_norm: f64,
    pub converged: bool,
}

impl GmresrOutcome {
    /// Residual norm relative to the right-hand side.
    pub fn reduction(&self) -> f64 {
        if self.initial_norm == 0.0 {
            0.0
        } else {
            self.residual_norm / self.initial_norm
        }
    }
}

/// Solves `A x = b` starting from zero. Returns the best iterate; running out
/// of iterations is logged, not raised.
pub fn gmresr<A, P>(
    a: &A,
    precond: &P,
    b: &FieldSet4D,
    geom: &GeometryData,
    max_iterations: usize,
    tolerance: f64,
) -> SaberResult<(FieldSet4D, GmresrOutcome)>
where
    A: LinearOperator + ?Sized,
    P: LinearOperator + ?Sized,
{
    let mut xx = b.zero_like();
    let mut rr = b.clone();
    let normb = b.norm(geom)?;
    let mut outcome = GmresrOutcome {
        iterations: 0,
        initial_norm: normb,
        residual_norm: normb,
        converged: normb == 0.0,
    };
    if outcome.converged {
        return Ok((xx, outcome));
    }

    let mut cs: Vec<FieldSet4D> = Vec::with_capacity(max_iterations);
    let mut us: Vec<FieldSet4D> = Vec::with_capacity(max_iterations);
    for iteration in 1..=max_iterations {
        let mut zz = precond.apply(&rr)?;
        let mut cc = a.apply(&zz)?;
        for (c, u) in cs.iter().zip(us.iter()) {
            let beta = c.dot(&cc, geom)?;
            cc.axpy(-beta, c)?;
            zz.axpy(-beta, u)?;
        }
        let cnorm = cc.norm(geom)?;
        if cnorm == 0.0 {
            warn!(iteration, "GMRESR breakdown: search direction vanished");
            break;
        }
        cc.scale(1.0 / cnorm);
        zz.scale(1.0 / cnorm);

        let alpha = cc.dot(&rr, geom)?;
        xx.axpy(alpha, &zz)?;
        rr.axpy(-alpha, &cc)?;
        cs.push(cc);
        us.push(zz);

        outcome.iterations = iteration;
        outcome.residual_norm = rr.norm(geom)?;
        info!(
            iteration,
            reduction = outcome.reduction(),
            "GMRESR residual"
        );
        if outcome.reduction() < tolerance {
            outcome.converged = true;
            break;
        }
    }

    if !outcome.converged {
        warn!(
            iterations = outcome.iterations,
            reduction = outcome.reduction(),
            tolerance,
            "GMRESR did not converge, returning best iterate"
        );
    }
    Ok((xx, outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GeometryParameters;
    use crate::field::FieldSet;
    use crate::geometry::Geometry;
    use crate::variables::Variables;

    struct Diagonal(f64, f64);

    impl LinearOperator for Diagonal {
        // Scales the first variable by .0, the second by .1.
        fn apply(&self, x: &FieldSet4D) -> SaberResult<FieldSet4D> {
            let mut y = x.clone();
            for slot in y.iter_mut() {
                let mut fields = slot.iter_mut();
                if let Some(f) = fields.next() {
                    f.values_mut().mapv_inplace(|v| v * self.0);
                }
                if let Some(f) = fields.next() {
                    f.values_mut().mapv_inplace(|v| v * self.1);
                }
            }
            Ok(y)
        }
    }

    fn geometry() -> Geometry {
        Geometry::serial(&GeometryParameters {
            nx: 5,
            ny: 4,
            levels: 3,
            ..GeometryParameters::default()
        })
        .unwrap()
    }

    #[test]
    fn test_scaled_identity_converges_in_one_iteration() {
        let geom = geometry();
        let vars = Variables::from_names(&["a", "b"]);
        let b = FieldSet4D::single(FieldSet::random(&geom, &vars, 42));
        let (x, outcome) =
            gmresr(&Diagonal(2.0, 2.0), &IdentityOperator, &b, &geom, 10, 1e-3).unwrap();
        assert_eq!(outcome.iterations, 1);
        assert!(outcome.converged);
        let mut expected = b.clone();
        expected.scale(0.5);
        expected.sub(&x).unwrap();
        assert!(expected.norm(&geom).unwrap() < 1e-12 * b.norm(&geom).unwrap());
    }

    #[test]
    fn test_two_eigenvalues_need_two_iterations() {
        let geom = geometry();
        let vars = Variables::from_names(&["a", "b"]);
        let b = FieldSet4D::single(FieldSet::random(&geom, &vars, 7));
        let (_, outcome) =
            gmresr(&Diagonal(1.0, 4.0), &IdentityOperator, &b, &geom, 10, 1e-6).unwrap();
        assert!(outcome.converged);
        assert_eq!(outcome.iterations, 2);
    }

    #[test]
    fn test_non_convergence_is_not_an_error() {
        let geom = geometry();
        let vars = Variables::from_names(&["a", "b"]);
        let b = FieldSet4D::single(FieldSet::random(&geom, &vars, 7));
        let (_, outcome) =
            gmresr(&Diagonal(1.0, 4.0), &IdentityOperator, &b, &geom, 1, 1e-6).unwrap();
        assert!(!outcome.converged);
        assert_eq!(outcome.iterations, 1);
        assert!(outcome.reduction() > 1e-6);
    }

    #[test]
    fn test_zero_right_hand_side() {
        let geom = geometry();
        let b = FieldSet4D::single(FieldSet::zeros(&geom, &Variables::from_names(&["a"])));
        let (x, outcome) =
            gmresr(&Diagonal(2.0, 2.0), &IdentityOperator, &b, &geom, 10, 1e-3).unwrap();
        assert_eq!(outcome.iterations, 0);
        assert!(outcome.converged);
        assert_eq!(x, b);
    }
}
