//! Error hierarchy for block-chain assembly and application.

use std::path::PathBuf;

use thiserror::Error;

/// Root error type for all SABER failures.
#[derive(Error, Debug)]
pub enum SaberError {
    /// Bad configuration: unknown block, missing key, type mismatch,
    /// incompatible variables between adjacent blocks.
    #[error("{context}: {message}")]
    Configuration { context: String, message: String },

    /// A block was asked for an operation it does not implement.
    #[error("{block}: {operation} not supported")]
    NotSupported { block: String, operation: String },

    /// Adjoint or inverse test outside tolerance.
    #[error("{test} test failure for block {block}: {detail}")]
    Verification {
        test: String,
        block: String,
        detail: String,
    },

    /// File could not be opened, read or written.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File content does not match what was expected.
    #[error("format error in {}: {message}", path.display())]
    Format { path: PathBuf, message: String },

    /// Field bundles with mismatched variables or shapes met in the algebra.
    #[error("shape mismatch in {context}: {message}")]
    Shape { context: String, message: String },

    /// Programmer mistake, such as a duplicate registration or a broken invariant.
    #[error("internal error: {0}")]
    Internal(String),
}

pub type SaberResult<T> = Result<T, SaberError>;

impl SaberError {
    pub fn config(context: impl Into<String>, message: impl Into<String>) -> Self {
        SaberError::Configuration {
            context: context.into(),
            message: message.into(),
        }
    }

    pub fn not_supported(block: impl Into<String>, operation: impl Into<String>) -> Self {
        SaberError::NotSupported {
            block: block.into(),
            operation: operation.into(),
        }
    }

    pub fn shape(context: impl Into<String>, message: impl Into<String>) -> Self {
        SaberError::Shape {
            context: context.into(),
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SaberError::Io {
            path: path.into(),
            source,
        }
    }

    /// True for errors caused by the user's configuration rather than by the code.
    pub fn is_user_error(&self) -> bool {
        matches!(self, SaberError::Configuration { .. })
    }

    /// True for the distinguished capability signal.
    pub fn is_not_supported(&self) -> bool {
        matches!(self, SaberError::NotSupported { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_are_prefixed_by_context() {
        let err = SaberError::config("NoSuchBlock", "does not exist in the central block factory");
        assert_eq!(
            err.to_string(),
            "NoSuchBlock: does not exist in the central block factory"
        );
        assert!(err.is_user_error());
        assert!(!err.is_not_supported());

        let err = SaberError::not_supported("Diagonal", "inverseMultiply");
        assert_eq!(err.to_string(), "Diagonal: inverseMultiply not supported");
        assert!(err.is_not_supported());
        assert!(!err.is_user_error());
    }
}
