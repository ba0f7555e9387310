//! Fragment Codec
//!
//! Serialises and parses the self-describing fragment envelope:
//!
//! ```text
//! ┌────────────────────┬───────────────────────┬──────────────────────┐
//! │  Header (72 B)     │  Payload (aligned)    │  Backend trailer     │
//! │  magic, version,   │  backend-produced     │  opaque per-backend  │
//! │  metadata, crc     │  symbols              │  metadata (optional) │
//! └────────────────────┴───────────────────────┴──────────────────────┘
//! ```
//!
//! All header fields are little-endian. The trailing header checksum is a
//! CRC32 over every preceding header byte and is distinct from the payload
//! checksum stored inside the metadata substruct.

use bytes::{Buf, BufMut};
use once_cell::sync::Lazy;

use crate::checksum::{self, ChecksumType};
use crate::error::{Error, Result};

// =============================================================================
// Wire Constants
// =============================================================================

/// Well-known constant identifying a fragment header.
pub const FRAGMENT_MAGIC: u32 = 0x0B0C_5ECC;

/// Fixed header size in bytes (magic + library version + metadata
/// substruct + header checksum).
pub const FRAGMENT_HEADER_SIZE: usize = 72;

/// Number of fixed-width checksum slots in the metadata substruct. CRC32
/// uses slot 0; the rest are reserved (sized for MD5).
pub const MAX_CHECKSUM_SLOTS: usize = 8;

/// Byte offset of the metadata substruct within the header.
const METADATA_OFFSET: usize = 8;
/// Byte offset of the checksum-mismatch flag within the header.
const CHKSUM_MISMATCH_OFFSET: usize = 66;
/// Byte offset of the trailing header checksum.
const HEADER_CRC_OFFSET: usize = 68;

/// Packed library version stamped into every fragment
/// (`major << 16 | minor << 8 | patch`).
pub fn library_version() -> u32 {
    static VERSION: Lazy<u32> = Lazy::new(|| {
        let major: u32 = env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0);
        let minor: u32 = env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0);
        let patch: u32 = env!("CARGO_PKG_VERSION_PATCH").parse().unwrap_or(0);
        (major << 16) | (minor << 8) | patch
    });
    *VERSION
}

// =============================================================================
// Fragment Metadata
// =============================================================================

/// Metadata substruct carried by every fragment, returned by value from
/// [`parse`]; never aliases the caller's buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentMetadata {
    /// Fragment index within the stripe, in `[0, k + m)`.
    pub idx: i32,
    /// Original input length; identical across all fragments of a stripe
    /// and the sole authority for decode truncation.
    pub orig_data_size: u64,
    /// Payload length in bytes.
    pub size: u64,
    /// Stable numeric id of the backend that produced the stripe.
    pub backend_id: u8,
    /// Declared version of that backend.
    pub backend_version: u32,
    /// Payload checksum algorithm.
    pub chksum_type: ChecksumType,
    /// Stored checksum values; slot 0 holds the CRC32.
    pub chksum: [u32; MAX_CHECKSUM_SLOTS],
    /// Populated on read: true when the recomputed payload checksum does
    /// not match the stored one.
    pub chksum_mismatch: bool,
    /// Distinguishes parity fragments from data fragments.
    pub is_parity: bool,
}

// =============================================================================
// Fragment
// =============================================================================

/// An owned, self-describing coded fragment (header + payload + optional
/// backend trailer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    buf: Vec<u8>,
    payload_len: usize,
}

impl Fragment {
    /// Adopt a serialized fragment buffer, validating its header.
    pub fn from_bytes(buf: Vec<u8>) -> Result<Self> {
        let meta = parse(&buf)?;
        Ok(Self {
            buf,
            payload_len: meta.size as usize,
        })
    }

    /// The full serialized fragment.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Mutable view of the serialized fragment. Header edits invalidate
    /// the header checksum unless restamped.
    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Consume the fragment, returning the serialized buffer.
    #[inline]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Total serialized length.
    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The payload region.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.buf[FRAGMENT_HEADER_SIZE..FRAGMENT_HEADER_SIZE + self.payload_len]
    }

    /// Parse this fragment's metadata (recomputes the payload checksum).
    pub fn metadata(&self) -> Result<FragmentMetadata> {
        parse(&self.buf)
    }
}

// =============================================================================
// Codec Operations
// =============================================================================

/// Serialise `payload` and `meta` into a fragment, appending a zeroed
/// backend trailer of `backend_meta_size` bytes and stamping the header
/// checksum.
pub fn wrap(payload: &[u8], meta: &FragmentMetadata, backend_meta_size: usize) -> Result<Fragment> {
    if meta.size as usize != payload.len() {
        return Err(Error::InvalidParams(format!(
            "metadata size {} does not match payload length {}",
            meta.size,
            payload.len()
        )));
    }

    let total = FRAGMENT_HEADER_SIZE + payload.len() + backend_meta_size;
    let mut buf = Vec::with_capacity(total);

    buf.put_u32_le(FRAGMENT_MAGIC);
    buf.put_u32_le(library_version());
    buf.put_i32_le(meta.idx);
    buf.put_u64_le(meta.orig_data_size);
    buf.put_u64_le(meta.size);
    buf.put_u8(meta.backend_id);
    buf.put_u32_le(meta.backend_version);
    buf.put_u8(meta.chksum_type.as_u8());
    for slot in &meta.chksum {
        buf.put_u32_le(*slot);
    }
    buf.put_u8(meta.chksum_mismatch as u8);
    buf.put_u8(meta.is_parity as u8);

    let header_crc = checksum::crc32(&buf[..HEADER_CRC_OFFSET]);
    buf.put_u32_le(header_crc);

    buf.extend_from_slice(payload);
    buf.resize(total, 0);

    Ok(Fragment {
        buf,
        payload_len: payload.len(),
    })
}

/// Validate the envelope of `frag` without touching the payload: length,
/// magic and header checksum.
fn check_header(frag: &[u8]) -> Result<()> {
    if frag.len() < FRAGMENT_HEADER_SIZE {
        return Err(Error::BadHeader(format!(
            "fragment of {} bytes is shorter than the {} byte header",
            frag.len(),
            FRAGMENT_HEADER_SIZE
        )));
    }
    let magic = (&frag[..4]).get_u32_le();
    if magic != FRAGMENT_MAGIC {
        return Err(Error::BadHeader(format!(
            "bad magic {:#010x} (expected {:#010x})",
            magic, FRAGMENT_MAGIC
        )));
    }
    let stored = (&frag[HEADER_CRC_OFFSET..FRAGMENT_HEADER_SIZE]).get_u32_le();
    let computed = checksum::crc32(&frag[..HEADER_CRC_OFFSET]);
    if stored != computed {
        return Err(Error::BadHeader(format!(
            "header checksum mismatch: stored {:#010x}, computed {:#010x}",
            stored, computed
        )));
    }
    Ok(())
}

/// Parse the metadata of a serialized fragment.
///
/// Validates magic and header checksum, bounds-checks the declared payload
/// length against the buffer, recomputes the payload checksum and
/// populates `chksum_mismatch` accordingly. The stored checksum value is
/// returned untouched.
pub fn parse(frag: &[u8]) -> Result<FragmentMetadata> {
    check_header(frag)?;

    let mut cur = &frag[METADATA_OFFSET..];
    let idx = cur.get_i32_le();
    let orig_data_size = cur.get_u64_le();
    let size = cur.get_u64_le();
    let backend_id = cur.get_u8();
    let backend_version = cur.get_u32_le();
    let chksum_type = ChecksumType::from_u8(cur.get_u8())?;
    let mut chksum = [0u32; MAX_CHECKSUM_SLOTS];
    for slot in chksum.iter_mut() {
        *slot = cur.get_u32_le();
    }
    let stored_mismatch = cur.get_u8() != 0;
    let is_parity = cur.get_u8() != 0;

    let payload_end = FRAGMENT_HEADER_SIZE as u64 + size;
    if payload_end > frag.len() as u64 {
        return Err(Error::BadHeader(format!(
            "declared payload of {} bytes extends past the {} byte buffer",
            size,
            frag.len()
        )));
    }
    let payload = &frag[FRAGMENT_HEADER_SIZE..payload_end as usize];
    let chksum_mismatch = stored_mismatch || chksum_type.mismatch(chksum[0], payload);

    Ok(FragmentMetadata {
        idx,
        orig_data_size,
        size,
        backend_id,
        backend_version,
        chksum_type,
        chksum,
        chksum_mismatch,
        is_parity,
    })
}

/// Locate the payload region of a serialized fragment.
pub fn payload_of(frag: &[u8]) -> Result<&[u8]> {
    check_header(frag)?;
    let size = (&frag[20..28]).get_u64_le();
    let payload_end = FRAGMENT_HEADER_SIZE as u64 + size;
    if payload_end > frag.len() as u64 {
        return Err(Error::BadHeader(format!(
            "declared payload of {} bytes extends past the {} byte buffer",
            size,
            frag.len()
        )));
    }
    Ok(&frag[FRAGMENT_HEADER_SIZE..payload_end as usize])
}

/// Set the persisted checksum-mismatch flag in place, restamping the
/// header checksum so the header stays self-consistent. Payload bytes are
/// never touched.
pub fn set_checksum_mismatch(frag: &mut [u8], mismatch: bool) -> Result<()> {
    check_header(frag)?;
    frag[CHKSUM_MISMATCH_OFFSET] = mismatch as u8;
    let crc = checksum::crc32(&frag[..HEADER_CRC_OFFSET]);
    frag[HEADER_CRC_OFFSET..FRAGMENT_HEADER_SIZE].copy_from_slice(&crc.to_le_bytes());
    Ok(())
}

// =============================================================================
// Header Peek Accessors
// =============================================================================

/// Read the stamped library version without a full metadata parse.
pub fn library_version_of(frag: &[u8]) -> Result<u32> {
    peek_magic(frag)?;
    Ok((&frag[4..8]).get_u32_le())
}

/// Read the stamped backend id without a full metadata parse.
pub fn backend_id_of(frag: &[u8]) -> Result<u8> {
    peek_magic(frag)?;
    Ok(frag[28])
}

/// Read the stamped backend version without a full metadata parse.
pub fn backend_version_of(frag: &[u8]) -> Result<u32> {
    peek_magic(frag)?;
    Ok((&frag[29..33]).get_u32_le())
}

fn peek_magic(frag: &[u8]) -> Result<()> {
    if frag.len() < FRAGMENT_HEADER_SIZE {
        return Err(Error::BadHeader(format!(
            "fragment of {} bytes is shorter than the {} byte header",
            frag.len(),
            FRAGMENT_HEADER_SIZE
        )));
    }
    if (&frag[..4]).get_u32_le() != FRAGMENT_MAGIC {
        return Err(Error::BadHeader("bad magic".into()));
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn sample_meta(payload: &[u8]) -> FragmentMetadata {
        let mut chksum = [0u32; MAX_CHECKSUM_SLOTS];
        chksum[0] = ChecksumType::Crc32.compute(payload).unwrap();
        FragmentMetadata {
            idx: 3,
            orig_data_size: 4096,
            size: payload.len() as u64,
            backend_id: 1,
            backend_version: (2 << 16) | 4,
            chksum_type: ChecksumType::Crc32,
            chksum,
            chksum_mismatch: false,
            is_parity: false,
        }
    }

    #[test]
    fn test_wrap_parse_roundtrip() {
        let payload = vec![0xA7u8; 128];
        let meta = sample_meta(&payload);

        let frag = wrap(&payload, &meta, 0).unwrap();
        assert_eq!(frag.len(), FRAGMENT_HEADER_SIZE + payload.len());
        assert_eq!(frag.payload(), payload.as_slice());

        let parsed = frag.metadata().unwrap();
        assert_eq!(parsed, meta);
    }

    #[test]
    fn test_wrap_appends_backend_trailer() {
        let payload = vec![1u8; 16];
        let meta = sample_meta(&payload);
        let frag = wrap(&payload, &meta, 8).unwrap();
        assert_eq!(frag.len(), FRAGMENT_HEADER_SIZE + 16 + 8);
        // trailer starts zeroed
        assert!(frag.as_bytes()[FRAGMENT_HEADER_SIZE + 16..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_wrap_rejects_size_mismatch() {
        let payload = vec![1u8; 16];
        let mut meta = sample_meta(&payload);
        meta.size = 17;
        assert_matches!(wrap(&payload, &meta, 0), Err(Error::InvalidParams(_)));
    }

    #[test]
    fn test_parse_rejects_short_buffer() {
        assert_matches!(parse(&[0u8; 10]), Err(Error::BadHeader(_)));
    }

    #[test]
    fn test_parse_rejects_bad_magic() {
        let payload = vec![2u8; 32];
        let meta = sample_meta(&payload);
        let mut bytes = wrap(&payload, &meta, 0).unwrap().into_bytes();
        bytes[0] ^= 0xFF;
        assert_matches!(parse(&bytes), Err(Error::BadHeader(_)));
    }

    #[test]
    fn test_parse_rejects_corrupted_header() {
        let payload = vec![2u8; 32];
        let meta = sample_meta(&payload);
        let mut bytes = wrap(&payload, &meta, 0).unwrap().into_bytes();
        // flip a bit inside the metadata substruct; the header CRC catches it
        bytes[12] ^= 0x01;
        assert_matches!(parse(&bytes), Err(Error::BadHeader(_)));
    }

    #[test]
    fn test_parse_rejects_payload_past_buffer() {
        let payload = vec![2u8; 32];
        let meta = sample_meta(&payload);
        let mut bytes = wrap(&payload, &meta, 0).unwrap().into_bytes();
        bytes.truncate(FRAGMENT_HEADER_SIZE + 16);
        assert_matches!(parse(&bytes), Err(Error::BadHeader(_)));
    }

    #[test]
    fn test_payload_corruption_sets_mismatch_on_read_only() {
        let payload = vec![0x55u8; 64];
        let meta = sample_meta(&payload);
        let mut bytes = wrap(&payload, &meta, 0).unwrap().into_bytes();

        bytes[FRAGMENT_HEADER_SIZE + 5] ^= 0x10;

        let parsed = parse(&bytes).unwrap();
        assert!(parsed.chksum_mismatch);
        // the stored checksum value itself is untouched
        assert_eq!(parsed.chksum[0], meta.chksum[0]);
    }

    #[test]
    fn test_none_checksum_never_mismatches() {
        let payload = vec![9u8; 48];
        let mut meta = sample_meta(&payload);
        meta.chksum_type = ChecksumType::None;
        meta.chksum = [0u32; MAX_CHECKSUM_SLOTS];
        let mut bytes = wrap(&payload, &meta, 0).unwrap().into_bytes();
        bytes[FRAGMENT_HEADER_SIZE] ^= 0xFF;
        let parsed = parse(&bytes).unwrap();
        assert!(!parsed.chksum_mismatch);
    }

    #[test]
    fn test_set_checksum_mismatch_restamps_header() {
        let payload = vec![7u8; 32];
        let meta = sample_meta(&payload);
        let mut bytes = wrap(&payload, &meta, 0).unwrap().into_bytes();

        set_checksum_mismatch(&mut bytes, true).unwrap();
        // header still parses cleanly and the flag persists
        let parsed = parse(&bytes).unwrap();
        assert!(parsed.chksum_mismatch);

        set_checksum_mismatch(&mut bytes, false).unwrap();
        let parsed = parse(&bytes).unwrap();
        assert!(!parsed.chksum_mismatch);
    }

    #[test]
    fn test_peek_accessors() {
        let payload = vec![3u8; 16];
        let meta = sample_meta(&payload);
        let frag = wrap(&payload, &meta, 0).unwrap();
        let bytes = frag.as_bytes();

        assert_eq!(library_version_of(bytes).unwrap(), library_version());
        assert_eq!(backend_id_of(bytes).unwrap(), meta.backend_id);
        assert_eq!(backend_version_of(bytes).unwrap(), meta.backend_version);
    }

    #[test]
    fn test_from_bytes_roundtrip() {
        let payload = vec![4u8; 24];
        let meta = sample_meta(&payload);
        let bytes = wrap(&payload, &meta, 4).unwrap().into_bytes();
        let frag = Fragment::from_bytes(bytes).unwrap();
        assert_eq!(frag.payload(), payload.as_slice());
    }

    #[test]
    fn test_library_version_is_packed() {
        let v = library_version();
        let major: u32 = env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap();
        assert_eq!(v >> 16, major);
    }
}
