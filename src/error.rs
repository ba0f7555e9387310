//! Error types for the fragment stripe engine

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while encoding, decoding or managing stripes.
///
/// Every variant maps to a stable negative numeric code via [`Error::code`]
/// so callers that persist or transport error codes across process
/// boundaries see the same values from release to release.
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// Nil, out-of-range or otherwise malformed argument; also covers
    /// unknown and destroyed instance descriptors.
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// The requested backend is not registered, or its native kernel
    /// could not be loaded.
    #[error("backend not available: {0}")]
    BackendNotAvailable(String),

    /// Fragment magic absent, header truncated, or header checksum wrong.
    #[error("bad fragment header: {0}")]
    BadHeader(String),

    /// Fewer than k valid fragments remained after validation.
    #[error("insufficient fragments: have {available}, need {required}")]
    InsufficientFragments { available: usize, required: usize },

    /// The backend kernel reported a failure (e.g. a singular decoding
    /// matrix).
    #[error("backend error: {0}")]
    BackendError(String),

    /// A reserved feature was requested (e.g. the MD5 checksum type).
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Buffer allocation failed.
    #[error("out of memory: allocation of {0} bytes failed")]
    OutOfMemory(usize),
}

// =============================================================================
// Stable Error Codes
// =============================================================================

/// Numeric code for [`Error::InvalidParams`].
pub const CODE_INVALID_PARAMS: i32 = -201;
/// Numeric code for [`Error::BackendNotAvailable`].
pub const CODE_BACKEND_NOT_AVAILABLE: i32 = -202;
/// Numeric code for [`Error::BadHeader`].
pub const CODE_BAD_HEADER: i32 = -203;
/// Numeric code for [`Error::InsufficientFragments`].
pub const CODE_INSUFFICIENT_FRAGMENTS: i32 = -204;
/// Numeric code for [`Error::BackendError`].
pub const CODE_BACKEND_ERROR: i32 = -205;
/// Numeric code for [`Error::NotImplemented`].
pub const CODE_NOT_IMPLEMENTED: i32 = -206;
/// Numeric code for [`Error::OutOfMemory`].
pub const CODE_OUT_OF_MEMORY: i32 = -207;

impl Error {
    /// Stable numeric code for this error, always negative.
    pub fn code(&self) -> i32 {
        match self {
            Error::InvalidParams(_) => CODE_INVALID_PARAMS,
            Error::BackendNotAvailable(_) => CODE_BACKEND_NOT_AVAILABLE,
            Error::BadHeader(_) => CODE_BAD_HEADER,
            Error::InsufficientFragments { .. } => CODE_INSUFFICIENT_FRAGMENTS,
            Error::BackendError(_) => CODE_BACKEND_ERROR,
            Error::NotImplemented(_) => CODE_NOT_IMPLEMENTED,
            Error::OutOfMemory(_) => CODE_OUT_OF_MEMORY,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_negative_and_distinct() {
        let errors = [
            Error::InvalidParams("x".into()),
            Error::BackendNotAvailable("shss".into()),
            Error::BadHeader("magic".into()),
            Error::InsufficientFragments {
                available: 3,
                required: 4,
            },
            Error::BackendError("singular matrix".into()),
            Error::NotImplemented("md5".into()),
            Error::OutOfMemory(1024),
        ];

        let mut seen = std::collections::HashSet::new();
        for e in &errors {
            assert!(e.code() < 0);
            assert!(seen.insert(e.code()), "duplicate code {}", e.code());
        }
    }

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(Error::InvalidParams("".into()).code(), -201);
        assert_eq!(
            Error::InsufficientFragments {
                available: 0,
                required: 1
            }
            .code(),
            -204
        );
    }

    #[test]
    fn test_display_includes_context() {
        let e = Error::InsufficientFragments {
            available: 9,
            required: 10,
        };
        assert_eq!(e.to_string(), "insufficient fragments: have 9, need 10");
    }
}
