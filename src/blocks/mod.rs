//! Block contract: capabilities, the central and outer block traits, and the
//! assembly context handed to block constructors.

pub mod chain;
pub mod ensemble_chain;
pub mod factory;
pub mod outer_chain;
pub mod parameters;
pub mod parametric_chain;

use std::fmt;
use std::ops::BitOr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::ErrorCovarianceParameters;
use crate::ensemble::MemberSource;
use crate::error::{SaberError, SaberResult};
use crate::field::FieldSet;
use crate::geometry::Geometry;
use crate::variables::Variables;

pub use chain::{BlockChain, ChainCore};
pub use ensemble_chain::EnsembleChain;
pub use factory::BlockFactory;
pub use outer_chain::OuterBlockChain;
pub use parameters::{
    BlockParameters, CommonParameters, FileParameters, ParameterKey, ParameterKind,
    ParametersRecord, SaberBlockParameters,
};
pub use parametric_chain::ParametricChain;

/// Operations a block implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities(u16);

impl Capabilities {
    pub const MULTIPLY: Self = Self(1);
    pub const MULTIPLY_AD: Self = Self(1 << 1);
    pub const INVERSE_MULTIPLY: Self = Self(1 << 2);
    pub const INVERSE_MULTIPLY_AD: Self = Self(1 << 3);
    pub const RANDOMIZE: Self = Self(1 << 4);
    pub const READ: Self = Self(1 << 5);
    pub const WRITE: Self = Self(1 << 6);
    pub const DIRECT_CALIBRATION: Self = Self(1 << 7);

    const NAMES: [(Self, &'static str); 8] = [
        (Self::MULTIPLY, "multiply"),
        (Self::MULTIPLY_AD, "multiplyAD"),
        (Self::INVERSE_MULTIPLY, "inverseMultiply"),
        (Self::INVERSE_MULTIPLY_AD, "inverseMultiplyAD"),
        (Self::RANDOMIZE, "randomize"),
        (Self::READ, "read"),
        (Self::WRITE, "write"),
        (Self::DIRECT_CALIBRATION, "directCalibration"),
    ];

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn names(self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(c, _)| self.contains(*c))
            .map(|(_, n)| *n)
            .collect()
    }
}

impl BitOr for Capabilities {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}", self.names().join(", "))
    }
}

fn splitmix64(mut state: u64) -> u64 {
    state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Seed of the independent sub-stream `index` of `seed`. Sub-streams of
/// different parents do not overlap.
pub fn substream_seed(seed: u64, index: u64) -> u64 {
    splitmix64(splitmix64(seed) ^ index.wrapping_mul(0xD6E8_FEB8_6659_FD93))
}

/// Monotonic seed source shared by one covariance operator.
#[derive(Debug)]
pub struct SeedStream {
    base: u64,
    counter: AtomicU64,
}

impl SeedStream {
    pub fn new(base: u64) -> Self {
        Self {
            base,
            counter: AtomicU64::new(0),
        }
    }

    pub fn next_seed(&self) -> u64 {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        self.base.wrapping_add(n.wrapping_mul(0x9E37_79B9_7F4A_7C15))
    }
}

impl Default for SeedStream {
    fn default() -> Self {
        Self::new(1)
    }
}

/// Covariance-level options and shared inputs seen by every block.
#[derive(Debug, Clone)]
pub struct CovarianceConfig {
    pub adjoint_test: bool,
    pub adjoint_tolerance: f64,
    pub inverse_test: bool,
    pub inverse_tolerance: f64,
    pub iterative_ensemble_loading: bool,
    pub time_covariance: bool,
    /// Ensemble perturbations on the primary geometry.
    pub ensemble: Option<Arc<dyn MemberSource>>,
    pub dual_geometry: Option<Geometry>,
    /// Ensemble perturbations on the dual-resolution geometry.
    pub dual_ensemble: Option<Arc<dyn MemberSource>>,
    pub seeds: Arc<SeedStream>,
}

impl Default for CovarianceConfig {
    fn default() -> Self {
        Self {
            adjoint_test: false,
            adjoint_tolerance: 1.0e-12,
            inverse_test: false,
            inverse_tolerance: 1.0e-6,
            iterative_ensemble_loading: false,
            time_covariance: false,
            ensemble: None,
            dual_geometry: None,
            dual_ensemble: None,
            seeds: Arc::new(SeedStream::default()),
        }
    }
}

impl CovarianceConfig {
    /// Flags from the `background error` subtree; ensembles are attached separately.
    pub fn from_parameters(params: &ErrorCovarianceParameters) -> Self {
        Self {
            adjoint_test: params.adjoint_test,
            adjoint_tolerance: params.adjoint_tolerance,
            inverse_test: params.inverse_test,
            inverse_tolerance: params.inverse_tolerance,
            iterative_ensemble_loading: params.iterative_ensemble_loading,
            time_covariance: params.time_covariance,
            ..Self::default()
        }
    }
}

/// What a block constructor may read. `geometry` is the geometry the block's
/// outer side lives on; `xb`/`fg` are laid out on it.
#[derive(Clone, Copy)]
pub struct BlockContext<'a> {
    pub factory: &'a BlockFactory,
    pub covariance: &'a CovarianceConfig,
    pub geometry: &'a Geometry,
    pub xb: &'a FieldSet,
    pub fg: &'a FieldSet,
}

/// Shared base of every block.
pub trait SaberBlock: fmt::Display + Send + Sync {
    /// Registered block name.
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    fn active_vars(&self) -> &Variables;

    fn skip_inverse_test(&self) -> bool {
        false
    }
}

/// Terminal symmetric positive semi-definite operator, `in = out`.
pub trait CentralBlock: SaberBlock {
    /// Applies the covariance in place.
    fn multiply(&self, fset: &mut FieldSet) -> SaberResult<()>;

    /// Overwrites `fset` with a draw from N(0, C).
    fn randomize(&self, _fset: &mut FieldSet, _seed: u64) -> SaberResult<()> {
        Err(SaberError::not_supported(self.name(), "randomize"))
    }

    fn read(&mut self) -> SaberResult<()> {
        Err(SaberError::not_supported(self.name(), "read"))
    }

    fn write(&self) -> SaberResult<()> {
        Err(SaberError::not_supported(self.name(), "write"))
    }

    /// Calibration from control-space ensemble members, all at once.
    fn direct_calibration(&mut self, _members: &[FieldSet]) -> SaberResult<()> {
        Err(SaberError::not_supported(self.name(), "directCalibration"))
    }

    /// Calibration one member at a time; closed by `iterative_calibration_final`.
    fn iterative_calibration_update(&mut self, _member: &FieldSet) -> SaberResult<()> {
        Err(SaberError::not_supported(self.name(), "iterativeCalibrationUpdate"))
    }

    fn iterative_calibration_final(&mut self) -> SaberResult<()> {
        Err(SaberError::not_supported(self.name(), "iterativeCalibrationFinal"))
    }
}

/// Change of variables between an outer (model-side) and an inner
/// (control-side) variable set, possibly across geometries.
pub trait OuterBlock: SaberBlock {
    fn inner_geometry(&self) -> &Geometry;

    fn inner_vars(&self) -> &Variables;

    /// Inner to outer.
    fn multiply(&self, fset: &mut FieldSet) -> SaberResult<()>;

    /// Outer to inner, adjoint of `multiply`.
    fn multiply_ad(&self, fset: &mut FieldSet) -> SaberResult<()>;

    /// Outer to inner, inverse of `multiply`.
    fn inverse_multiply(&self, _fset: &mut FieldSet) -> SaberResult<()> {
        Err(SaberError::not_supported(self.name(), "inverseMultiply"))
    }

    fn inverse_multiply_ad(&self, _fset: &mut FieldSet) -> SaberResult<()> {
        Err(SaberError::not_supported(self.name(), "inverseMultiplyAD"))
    }

    fn read(&mut self) -> SaberResult<()> {
        Err(SaberError::not_supported(self.name(), "read"))
    }

    fn write(&self) -> SaberResult<()> {
        Err(SaberError::not_supported(self.name(), "write"))
    }

    /// Calibration from ensemble members expressed at the block's outer side.
    fn direct_calibration(&mut self, _members: &[FieldSet]) -> SaberResult<()> {
        Err(SaberError::not_supported(self.name(), "directCalibration"))
    }

    /// Background or first guess as seen by the blocks inside this one.
    fn transfer_background(&self, fset: &FieldSet) -> SaberResult<FieldSet> {
        Ok(fset.clone())
    }
}

/// Central block type with a static name and parameter record.
pub trait CentralBlockType: CentralBlock + Sized + 'static {
    const NAME: &'static str;
    type Parameters: BlockParameters;

    fn new(
        ctx: &BlockContext<'_>,
        vars: &Variables,
        active: Variables,
        params: Self::Parameters,
    ) -> SaberResult<Self>;
}

/// Outer block type with a static name and parameter record.
pub trait OuterBlockType: OuterBlock + Sized + 'static {
    const NAME: &'static str;
    type Parameters: BlockParameters;

    fn new(
        ctx: &BlockContext<'_>,
        outer_vars: &Variables,
        active: Variables,
        params: Self::Parameters,
    ) -> SaberResult<Self>;
}
