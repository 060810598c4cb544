//! Adjoint and inverse tests.
//!
//! Every test writes exactly one line on the test stream and returns a
//! `TestRecord`; a failure is also returned as a `Verification` error.

use std::fmt;

use serde::Serialize;
use tracing::trace;

use crate::blocks::{Capabilities, CentralBlock, OuterBlock};
use crate::error::{SaberError, SaberResult};
use crate::field::{FieldSet, FieldSet4D};
use crate::geometry::GeometryData;
use crate::gmresr::LinearOperator;
use crate::logging::test_line;
use crate::variables::Variables;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TestKind {
    Adjoint,
    Inverse,
}

impl fmt::Display for TestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TestKind::Adjoint => "Adjoint",
            TestKind::Inverse => "Inverse",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Passed,
    Failed,
    Skipped,
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TestStatus::Passed => "passed",
            TestStatus::Failed => "failed",
            TestStatus::Skipped => "skipped",
        })
    }
}

/// Outcome of one test. For adjoint tests `lhs`/`rhs` are the two inner
/// products; for inverse tests they are the relative errors of `A⁻¹A` and `AA⁻¹`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestRecord {
    pub kind: TestKind,
    pub block: String,
    pub lhs: f64,
    pub rhs: f64,
    pub metric: f64,
    pub tolerance: f64,
    pub status: TestStatus,
}

impl TestRecord {
    pub fn passed(&self) -> bool {
        self.status != TestStatus::Failed
    }

    fn skipped(kind: TestKind, block: &str, tolerance: f64) -> Self {
        Self {
            kind,
            block: block.to_string(),
            lhs: 0.0,
            rhs: 0.0,
            metric: 0.0,
            tolerance,
            status: TestStatus::Skipped,
        }
    }

    /// Logs the test-stream line and turns a failure into an error.
    fn emit(self) -> SaberResult<TestRecord> {
        test_line(&self.to_string());
        trace!(
            kind = %self.kind,
            block = %self.block,
            lhs = self.lhs,
            rhs = self.rhs,
            metric = self.metric,
            "verification"
        );
        if self.status == TestStatus::Failed {
            let detail = match self.kind {
                TestKind::Adjoint => format!(
                    "<Au,v> = {:.16e}, <u,A^Tv> = {:.16e}, \
                     relative difference {:.6e} exceeds {:.1e}",
                    self.lhs, self.rhs, self.metric, self.tolerance
                ),
                TestKind::Inverse => format!(
                    "relative errors {:.6e} and {:.6e} exceed {:.1e}",
                    self.lhs, self.rhs, self.tolerance
                ),
            };
            return Err(SaberError::Verification {
                test: self.kind.to_string(),
                block: self.block,
                detail,
            });
        }
        Ok(self)
    }
}

impl fmt::Display for TestRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} test for block {} {}", self.kind, self.block, self.status)
    }
}

/// `|a - b| / |(a + b) / 2|`, zero when `a == b`.
pub fn relative_difference(a: f64, b: f64) -> f64 {
    if a == b {
        return 0.0;
    }
    (a - b).abs() / (0.5 * (a + b)).abs()
}

fn adjoint_record(block: &str, a: f64, b: f64, tolerance: f64) -> TestRecord {
    let metric = relative_difference(a, b);
    TestRecord {
        kind: TestKind::Adjoint,
        block: block.to_string(),
        lhs: a,
        rhs: b,
        metric,
        tolerance,
        status: if metric < tolerance {
            TestStatus::Passed
        } else {
            TestStatus::Failed
        },
    }
}

/// Self-adjointness of a central block: `<Cu,v>` against `<u,Cv>`.
pub fn adjoint_test_central(
    block: &dyn CentralBlock,
    geom: &GeometryData,
    vars: &Variables,
    tolerance: f64,
    seed: u64,
) -> SaberResult<TestRecord> {
    let u = FieldSet::random(geom, vars, seed);
    let v = FieldSet::random(geom, vars, seed.wrapping_add(1));
    let mut cu = u.clone();
    block.multiply(&mut cu)?;
    let mut cv = v.clone();
    block.multiply(&mut cv)?;
    let a = cu.dot(&v, vars, geom)?;
    let b = u.dot(&cv, vars, geom)?;
    adjoint_record(block.name(), a, b, tolerance).emit()
}

/// Adjoint pairing of an outer block: `<Ou,v>` on the outer side against
/// `<u,Oᵀv>` on the inner side.
pub fn adjoint_test_outer(
    block: &dyn OuterBlock,
    outer_geom: &GeometryData,
    outer_vars: &Variables,
    tolerance: f64,
    seed: u64,
) -> SaberResult<TestRecord> {
    let inner_geom = block.inner_geometry();
    let inner_vars = block.inner_vars();
    let u = FieldSet::random(inner_geom, inner_vars, seed);
    let v = FieldSet::random(outer_geom, outer_vars, seed.wrapping_add(1));
    let mut ou = u.clone();
    block.multiply(&mut ou)?;
    let mut otv = v.clone();
    block.multiply_ad(&mut otv)?;
    let a = ou.dot(&v, outer_vars, outer_geom)?;
    let b = u.dot(&otv, inner_vars, inner_geom)?;
    adjoint_record(block.name(), a, b, tolerance).emit()
}

/// Left and right inverse of an outer block. Skipped when the block has no
/// inverse or opts out.
pub fn inverse_test_outer(
    block: &dyn OuterBlock,
    outer_geom: &GeometryData,
    outer_vars: &Variables,
    tolerance: f64,
    seed: u64,
) -> SaberResult<TestRecord> {
    if block.skip_inverse_test()
        || !block.capabilities().contains(Capabilities::INVERSE_MULTIPLY)
    {
        return TestRecord::skipped(TestKind::Inverse, block.name(), tolerance).emit();
    }
    let inner_geom = block.inner_geometry();
    let inner_vars = block.inner_vars();

    let x = FieldSet::random(inner_geom, inner_vars, seed);
    let mut y = x.clone();
    block.multiply(&mut y)?;
    block.inverse_multiply(&mut y)?;
    y.sub(&x)?;
    let left =
        y.dot(&y, inner_vars, inner_geom)?.sqrt() / x.dot(&x, inner_vars, inner_geom)?.sqrt();

    let z = FieldSet::random(outer_geom, outer_vars, seed.wrapping_add(1));
    let mut w = z.clone();
    block.inverse_multiply(&mut w)?;
    block.multiply(&mut w)?;
    w.sub(&z)?;
    let right =
        w.dot(&w, outer_vars, outer_geom)?.sqrt() / z.dot(&z, outer_vars, outer_geom)?.sqrt();

    let metric = left.max(right);
    TestRecord {
        kind: TestKind::Inverse,
        block: block.name().to_string(),
        lhs: left,
        rhs: right,
        metric,
        tolerance,
        status: if metric < tolerance {
            TestStatus::Passed
        } else {
            TestStatus::Failed
        },
    }
    .emit()
}

/// Self-adjointness of a whole operator acting on `FieldSet4D`.
pub fn adjoint_test_operator<A: LinearOperator + ?Sized>(
    op: &A,
    label: &str,
    geom: &GeometryData,
    vars: &Variables,
    slots: usize,
    tolerance: f64,
    seed: u64,
) -> SaberResult<TestRecord> {
    let draw = |offset: u64| {
        FieldSet4D::new(
            (0..slots as u64)
                .map(|it| FieldSet::random(geom, vars, seed.wrapping_add(offset + 2 * it)))
                .collect(),
        )
    };
    let u = draw(0);
    let v = draw(1);
    let bu = op.apply(&u)?;
    let bv = op.apply(&v)?;
    let a = bu.dot(&v, geom)?;
    let b = u.dot(&bv, geom)?;
    adjoint_record(label, a, b, tolerance).emit()
}
