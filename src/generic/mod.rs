//! Blocks shipped with the crate.

pub mod diagonal;
pub mod ensemble;
pub mod hybrid;
pub mod id;
pub mod identity;
pub mod interpolation;
pub mod std_dev;

pub use diagonal::{Diagonal, DiagonalParameters};
pub use ensemble::{Ensemble, EnsembleParameters};
pub use hybrid::{
    ComponentCovariance, ComponentParameters, Hybrid, HybridParameters, WeightParameters,
};
pub use id::Id;
pub use identity::Identity;
pub use interpolation::{Interpolation, InterpolationParameters};
pub use std_dev::{StdDev, StdDevParameters};

use crate::blocks::BlockFactory;
use crate::error::SaberResult;

pub fn register(factory: &mut BlockFactory) -> SaberResult<()> {
    factory.register_central::<Id>()?;
    factory.register_central::<Diagonal>()?;
    factory.register_central::<Ensemble>()?;
    factory.register_central::<Hybrid>()?;
    factory.register_outer::<Identity>()?;
    factory.register_outer::<StdDev>()?;
    factory.register_outer::<Interpolation>()?;
    Ok(())
}
