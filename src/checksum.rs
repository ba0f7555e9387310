//! Payload Checksum Service
//!
//! Computes and verifies the per-fragment payload checksum under a
//! selected algorithm. CRC32 uses the standard zlib polynomial via
//! `crc32fast`; MD5 is a reserved type id and is rejected at instance
//! creation.

use crate::error::{Error, Result};

// =============================================================================
// Checksum Type
// =============================================================================

/// Checksum algorithm applied to fragment payloads.
///
/// The numeric values are part of the fragment wire format and must
/// never be reassigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ChecksumType {
    /// No payload checksum; the stored value is 0 and the mismatch flag
    /// stays clear.
    #[default]
    None = 0,
    /// CRC32 (zlib polynomial, zero seed) over the payload bytes.
    Crc32 = 1,
    /// Reserved for MD5; not implemented.
    Md5 = 2,
}

impl ChecksumType {
    /// Decode a wire-format type id.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ChecksumType::None),
            1 => Ok(ChecksumType::Crc32),
            2 => Ok(ChecksumType::Md5),
            other => Err(Error::BadHeader(format!(
                "unknown checksum type id {}",
                other
            ))),
        }
    }

    /// Wire-format type id.
    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Compute the checksum of `payload` under this algorithm.
    ///
    /// Returns 0 for [`ChecksumType::None`]. MD5 is reserved and yields
    /// `Error::NotImplemented`.
    pub fn compute(self, payload: &[u8]) -> Result<u32> {
        match self {
            ChecksumType::None => Ok(0),
            ChecksumType::Crc32 => Ok(crc32fast::hash(payload)),
            ChecksumType::Md5 => Err(Error::NotImplemented(
                "md5 payload checksums are reserved but not implemented".into(),
            )),
        }
    }

    /// Recompute the checksum of `payload` and compare it against the
    /// `stored` value.
    ///
    /// Returns `true` when the payload does NOT match. For
    /// [`ChecksumType::None`] the answer is always `false`; for the
    /// reserved MD5 type the payload cannot be checked and the fragment
    /// is not accused.
    pub fn mismatch(self, stored: u32, payload: &[u8]) -> bool {
        match self {
            ChecksumType::None | ChecksumType::Md5 => false,
            ChecksumType::Crc32 => crc32fast::hash(payload) != stored,
        }
    }
}

/// CRC32 (zlib polynomial) of `data`; also used for the fragment header
/// integrity checksum.
#[inline]
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

// =============================================================================
// Tests
// =============================================================================
