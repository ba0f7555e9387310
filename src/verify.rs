//! Stripe Verifier
//!
//! Cross-checks fragments against a live instance: identity (library
//! version, backend id and version, index range) and integrity (payload
//! checksum). Verification never mutates payload bytes; per-fragment
//! invalidity is surfaced in-band via the checksum-mismatch flag and the
//! boolean result.

use tracing::debug;

use crate::engine::Instance;
use crate::error::{Error, Result};
use crate::fragment;

/// True when `frag` fails any of the identity or integrity checks for
/// `inst`: wrong magic or malformed header, library version mismatch,
/// foreign backend id or version, index out of `[0, k + m)`, or a payload
/// checksum mismatch.
pub(crate) fn fragment_is_invalid(inst: &Instance, frag: &[u8]) -> bool {
    let meta = match fragment::parse(frag) {
        Ok(meta) => meta,
        Err(e) => {
            debug!("fragment failed to parse: {}", e);
            return true;
        }
    };

    let lib_version = match fragment::library_version_of(frag) {
        Ok(v) => v,
        Err(_) => return true,
    };
    if lib_version != fragment::library_version() {
        return true;
    }
    if meta.backend_id != inst.backend.id.as_u8() {
        return true;
    }
    if meta.backend_version != inst.backend.backend_version {
        return true;
    }
    if meta.idx < 0 || meta.idx as usize >= inst.args.total_fragments() {
        return true;
    }
    meta.chksum_mismatch
}

/// Verify that every fragment is valid for `inst` and that all fragments
/// pairwise agree on (library version, backend id, backend version,
/// original data length).
pub(crate) fn verify_stripe(inst: &Instance, frags: &[&[u8]]) -> Result<()> {
    if frags.is_empty() {
        return Err(Error::InvalidParams("no fragments to verify".into()));
    }

    let mut expected: Option<(u32, u8, u32, u64)> = None;
    for (i, frag) in frags.iter().enumerate() {
        if fragment_is_invalid(inst, frag) {
            return Err(Error::InvalidParams(format!(
                "fragment {} failed stripe verification",
                i
            )));
        }
        let meta = fragment::parse(frag)?;
        let lib_version = fragment::library_version_of(frag)?;
        let key = (
            lib_version,
            meta.backend_id,
            meta.backend_version,
            meta.orig_data_size,
        );
        match expected {
            None => expected = Some(key),
            Some(e) if e != key => {
                return Err(Error::InvalidParams(format!(
                    "fragment {} does not belong to this stripe",
                    i
                )))
            }
            Some(_) => {}
        }
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
