//! Backend Registry & Dispatch
//!
//! Every coding backend is described by a static [`BackendDescriptor`]
//! carrying its stable id, declared version, alignment requirements and an
//! init hook that instantiates a per-instance capability object. The
//! stripe engine only ever talks through the [`BackendCodec`] trait; it
//! never branches on backend identity.
//!
//! # Components
//!
//! - **null** (`null.rs`): pass-through backend, no parity arithmetic
//! - **reed_solomon** (`reed_solomon.rs`): shared systematic RS kernel
//!   backing the jerasure-style and built-in Vandermonde/Cauchy backends
//! - **flat_xor** (`flat_xor.rs`): flat-XOR codes with declared Hamming
//!   distance
//! - **isa_l** (`isa_l.rs`): Intel ISA-L accelerated RS, behind the
//!   `isa-l` feature

use crate::error::{Error, Result};

pub mod flat_xor;
pub mod isa_l;
pub mod null;
pub mod reed_solomon;

pub use flat_xor::FlatXorCodec;
pub use null::NullCodec;
pub use reed_solomon::RsCodec;

// =============================================================================
// Backend Identity
// =============================================================================

/// Stable numeric backend ids. New backends append; ids are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BackendId {
    /// Pass-through backend without parity arithmetic.
    Null = 0,
    /// Reed-Solomon, Vandermonde construction (jerasure-compatible
    /// parameters).
    JerasureRsVand = 1,
    /// Reed-Solomon, Cauchy construction (jerasure-compatible
    /// parameters).
    JerasureRsCauchy = 2,
    /// Flat-XOR codes with declared Hamming distance.
    FlatXorHd = 3,
    /// Reed-Solomon on the native Intel ISA-L kernel.
    IsaLRsVand = 4,
    /// SHSS secret-sharing (native library, not shippable here).
    Shss = 5,
    /// The library's own built-in Reed-Solomon Vandermonde backend.
    BuiltinRsVand = 6,
}

impl BackendId {
    /// Decode a wire-format backend id.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(BackendId::Null),
            1 => Ok(BackendId::JerasureRsVand),
            2 => Ok(BackendId::JerasureRsCauchy),
            3 => Ok(BackendId::FlatXorHd),
            4 => Ok(BackendId::IsaLRsVand),
            5 => Ok(BackendId::Shss),
            6 => Ok(BackendId::BuiltinRsVand),
            other => Err(Error::InvalidParams(format!(
                "unknown backend id {}",
                other
            ))),
        }
    }

    /// Wire-format backend id.
    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Human-readable backend name.
    pub fn name(self) -> &'static str {
        match self {
            BackendId::Null => "null",
            BackendId::JerasureRsVand => "jerasure_rs_vand",
            BackendId::JerasureRsCauchy => "jerasure_rs_cauchy",
            BackendId::FlatXorHd => "flat_xor_hd",
            BackendId::IsaLRsVand => "isa_l_rs_vand",
            BackendId::Shss => "shss",
            BackendId::BuiltinRsVand => "stripecode_rs_vand",
        }
    }
}

/// Pack a backend version triple into the wire-format u32.
pub(crate) const fn pack_version(major: u32, minor: u32, patch: u32) -> u32 {
    (major << 16) | (minor << 8) | patch
}

// =============================================================================
// Coding Arguments
// =============================================================================

/// User-supplied coding parameters for an instance.
#[derive(Debug, Clone, Default)]
pub struct CodingArgs {
    /// Number of data fragments per stripe, >= 1.
    pub k: usize,
    /// Number of parity fragments per stripe, >= 1.
    pub m: usize,
    /// Symbol width in bits; 0 selects the backend default.
    pub w: u32,
    /// Hamming distance, used by XOR-style codes.
    pub hd: u32,
    /// Payload checksum algorithm.
    pub checksum: crate::checksum::ChecksumType,
    /// Optional backend-private argument.
    pub backend_arg: Option<i64>,
}

impl CodingArgs {
    /// Total fragment count (k + m).
    #[inline]
    pub fn total_fragments(&self) -> usize {
        self.k + self.m
    }
}

/// Reject k or m of zero before any backend-specific validation.
pub(crate) fn validate_common(args: &CodingArgs) -> Result<()> {
    if args.k == 0 {
        return Err(Error::InvalidParams("k must be >= 1".into()));
    }
    if args.m == 0 {
        return Err(Error::InvalidParams("m must be >= 1".into()));
    }
    Ok(())
}

// =============================================================================
// Capability Set
// =============================================================================

/// Per-instance capability object every backend implements.
///
/// Buffer contracts: `data` has k rows and `parity` m rows, all exactly
/// `blocksize` bytes; rows listed in `missing` arrive zeroed and are
/// filled in by `decode`/`reconstruct`. Missing indices are given as an
/// explicit slice over `[0, k + m)` rather than a sentinel-terminated
/// list.
pub trait BackendCodec: Send + Sync + std::fmt::Debug {
    /// Fill the parity rows from the data rows.
    fn encode(&self, data: &mut [Vec<u8>], parity: &mut [Vec<u8>], blocksize: usize) -> Result<()>;

    /// Recover the rows listed in `missing`.
    fn decode(
        &self,
        data: &mut [Vec<u8>],
        parity: &mut [Vec<u8>],
        missing: &[usize],
        blocksize: usize,
    ) -> Result<()>;

    /// Recover exactly the row at `dst_idx` (which is listed in
    /// `missing`).
    fn reconstruct(
        &self,
        data: &mut [Vec<u8>],
        parity: &mut [Vec<u8>],
        missing: &[usize],
        dst_idx: usize,
        blocksize: usize,
    ) -> Result<()>;

    /// Minimum set of fragment indices required to rebuild
    /// `to_reconstruct` without touching `to_exclude`.
    fn fragments_needed(&self, to_reconstruct: &[usize], to_exclude: &[usize])
        -> Result<Vec<usize>>;

    /// Payload granule in bits; drives fragment alignment.
    fn element_size(&self) -> u32;
}

/// Fragments needed for an MDS code: any k fragments outside the excluded
/// and to-be-rebuilt sets suffice.
pub(crate) fn mds_fragments_needed(
    k: usize,
    m: usize,
    to_reconstruct: &[usize],
    to_exclude: &[usize],
) -> Result<Vec<usize>> {
    let n = k + m;
    let needed: Vec<usize> = (0..n)
        .filter(|i| !to_reconstruct.contains(i) && !to_exclude.contains(i))
        .take(k)
        .collect();
    if needed.len() < k {
        return Err(Error::InsufficientFragments {
            available: needed.len(),
            required: k,
        });
    }
    Ok(needed)
}

// =============================================================================
// Backend Descriptors & Registry
// =============================================================================

/// Static description of a registered backend.
pub struct BackendDescriptor {
    /// Stable numeric id.
    pub id: BackendId,
    /// Display name.
    pub name: &'static str,
    /// Declared backend version, stamped into every fragment.
    pub backend_version: u32,
    /// Size of the opaque per-fragment backend trailer.
    pub backend_metadata_size: usize,
    /// SIMD-friendly payload multiple, when the kernel wants one.
    pub simd_multiple: Option<usize>,
    /// Symbol width selected when the caller passes w = 0.
    pub default_w: u32,
    probe: fn() -> bool,
    init: fn(&CodingArgs) -> Result<Box<dyn BackendCodec>>,
}

impl BackendDescriptor {
    /// Whether this backend can be instantiated in this process.
    #[inline]
    pub fn available(&self) -> bool {
        (self.probe)()
    }

    /// Instantiate the per-instance capability object.
    pub(crate) fn instantiate(&self, args: &CodingArgs) -> Result<Box<dyn BackendCodec>> {
        (self.init)(args)
    }
}

impl std::fmt::Debug for BackendDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("backend_version", &self.backend_version)
            .finish()
    }
}

fn probe_always() -> bool {
    true
}

fn probe_never() -> bool {
    false
}

fn init_shss(_args: &CodingArgs) -> Result<Box<dyn BackendCodec>> {
    Err(Error::BackendNotAvailable(
        "shss requires a native secret-sharing library that is not bundled".into(),
    ))
}

/// Process-wide backend table, ordered by id and read-only after startup.
static REGISTRY: [BackendDescriptor; 7] = [
    BackendDescriptor {
        id: BackendId::Null,
        name: "null",
        backend_version: pack_version(1, 0, 0),
        backend_metadata_size: 0,
        simd_multiple: None,
        default_w: 8,
        probe: probe_always,
        init: null::init,
    },
    BackendDescriptor {
        id: BackendId::JerasureRsVand,
        name: "jerasure_rs_vand",
        backend_version: pack_version(2, 0, 0),
        backend_metadata_size: 0,
        simd_multiple: Some(16),
        default_w: 16,
        probe: probe_always,
        init: reed_solomon::init_jerasure_rs_vand,
    },
    BackendDescriptor {
        id: BackendId::JerasureRsCauchy,
        name: "jerasure_rs_cauchy",
        backend_version: pack_version(2, 0, 0),
        backend_metadata_size: 0,
        simd_multiple: Some(16),
        default_w: 4,
        probe: probe_always,
        init: reed_solomon::init_jerasure_rs_cauchy,
    },
    BackendDescriptor {
        id: BackendId::FlatXorHd,
        name: "flat_xor_hd",
        backend_version: pack_version(1, 3, 0),
        backend_metadata_size: 0,
        simd_multiple: None,
        default_w: 8,
        probe: probe_always,
        init: flat_xor::init,
    },
    BackendDescriptor {
        id: BackendId::IsaLRsVand,
        name: "isa_l_rs_vand",
        backend_version: pack_version(2, 30, 0),
        backend_metadata_size: 0,
        simd_multiple: Some(32),
        default_w: 8,
        probe: isa_l::probe,
        init: isa_l::init,
    },
    BackendDescriptor {
        id: BackendId::Shss,
        name: "shss",
        backend_version: pack_version(1, 0, 0),
        backend_metadata_size: 0,
        simd_multiple: None,
        default_w: 8,
        probe: probe_never,
        init: init_shss,
    },
    BackendDescriptor {
        id: BackendId::BuiltinRsVand,
        name: "stripecode_rs_vand",
        backend_version: pack_version(1, 0, 0),
        backend_metadata_size: 0,
        simd_multiple: Some(16),
        default_w: 16,
        probe: probe_always,
        init: reed_solomon::init_builtin_rs_vand,
    },
];

/// Look up the descriptor for a backend id. The registry covers every
/// [`BackendId`] by construction.
pub fn lookup(id: BackendId) -> &'static BackendDescriptor {
    &REGISTRY[id.as_u8() as usize]
}

/// All registered backends.
pub fn registry() -> &'static [BackendDescriptor] {
    &REGISTRY
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_backend_ids_stable() {
        assert_eq!(BackendId::Null.as_u8(), 0);
        assert_eq!(BackendId::JerasureRsVand.as_u8(), 1);
        assert_eq!(BackendId::JerasureRsCauchy.as_u8(), 2);
        assert_eq!(BackendId::FlatXorHd.as_u8(), 3);
        assert_eq!(BackendId::IsaLRsVand.as_u8(), 4);
        assert_eq!(BackendId::Shss.as_u8(), 5);
        assert_eq!(BackendId::BuiltinRsVand.as_u8(), 6);
    }

    #[test]
    fn test_registry_ordered_by_id() {
        for (i, desc) in registry().iter().enumerate() {
            assert_eq!(desc.id.as_u8() as usize, i);
            assert_eq!(desc.name, desc.id.name());
        }
    }

    #[test]
    fn test_from_u8_rejects_unknown() {
        assert_matches!(BackendId::from_u8(7), Err(Error::InvalidParams(_)));
        assert_matches!(BackendId::from_u8(255), Err(Error::InvalidParams(_)));
    }

    #[test]
    fn test_shss_is_registered_but_unavailable() {
        let desc = lookup(BackendId::Shss);
        assert!(!desc.available());
        let args = CodingArgs {
            k: 6,
            m: 3,
            hd: 3,
            ..Default::default()
        };
        assert_matches!(
            desc.instantiate(&args),
            Err(Error::BackendNotAvailable(_))
        );
    }

    #[test]
    fn test_mds_fragments_needed_skips_excluded() {
        let needed = mds_fragments_needed(10, 4, &[7], &[3]).unwrap();
        assert_eq!(needed.len(), 10);
        assert!(!needed.contains(&3));
        assert!(!needed.contains(&7));
    }

    #[test]
    fn test_mds_fragments_needed_insufficient() {
        // k=4, m=1: excluding two fragments besides the target leaves 2
        let err = mds_fragments_needed(4, 1, &[0], &[1, 2]).unwrap_err();
        assert_matches!(
            err,
            Error::InsufficientFragments {
                available: 2,
                required: 4
            }
        );
    }

    #[test]
    fn test_validate_common() {
        assert!(validate_common(&CodingArgs {
            k: 1,
            m: 1,
            ..Default::default()
        })
        .is_ok());
        assert_matches!(
            validate_common(&CodingArgs {
                k: 0,
                m: 1,
                ..Default::default()
            }),
            Err(Error::InvalidParams(_))
        );
    }
}
