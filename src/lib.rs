//! SABER: background-error covariance operators assembled from chains of
//! configurable blocks.
//!
//! An [`ErrorCovariance`] is built from a `background error` configuration:
//! one central block (or a `Hybrid` of weighted component chains) wrapped by
//! outer blocks that change variables and resolution. The [`training`]
//! driver computes ensemble statistics offline.

pub mod blocks;
pub mod config;
pub mod covariance;
pub mod ensemble;
pub mod error;
pub mod field;
pub mod generic;
pub mod geometry;
pub mod gmresr;
pub mod io;
pub mod localization;
pub mod logging;
pub mod moments;
pub mod training;
pub mod variables;
pub mod verification;

pub use blocks::{BlockFactory, CovarianceConfig, SeedStream};
pub use config::{ErrorCovarianceParameters, ToolboxConfig, TrainingConfig};
pub use covariance::{ErrorCovariance, HybridComponent};
pub use error::{SaberError, SaberResult};
pub use field::{Field, FieldSet, FieldSet4D};
pub use geometry::Geometry;
pub use training::{TrainingDriver, TrainingReport};
pub use variables::{Variable, Variables};
pub use verification::TestRecord;

/// Crate version reported by the CLI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests;
