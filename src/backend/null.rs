//! Null Backend
//!
//! Pass-through backend without parity arithmetic. Parity rows stay
//! zeroed, so a stripe survives only as long as every data fragment does.
//! Useful for wiring tests and for measuring the fixed cost of the
//! fragment envelope.

use crate::backend::{mds_fragments_needed, validate_common, BackendCodec, CodingArgs};
use crate::error::{Error, Result};

/// Upper bound on fragments for the null backend.
const NULL_MAX_FRAGMENTS: usize = 32;

/// Capability object of the null backend.
#[derive(Debug)]
pub struct NullCodec {
    k: usize,
    m: usize,
}

pub(crate) fn init(args: &CodingArgs) -> Result<Box<dyn BackendCodec>> {
    validate_common(args)?;
    if args.total_fragments() > NULL_MAX_FRAGMENTS {
        return Err(Error::InvalidParams(format!(
            "k + m = {} exceeds the null backend ceiling of {}",
            args.total_fragments(),
            NULL_MAX_FRAGMENTS
        )));
    }
    Ok(Box::new(NullCodec {
        k: args.k,
        m: args.m,
    }))
}

impl BackendCodec for NullCodec {
    fn encode(&self, _data: &mut [Vec<u8>], _parity: &mut [Vec<u8>], _blocksize: usize) -> Result<()> {
        // parity rows are left zeroed
        Ok(())
    }

    fn decode(
        &self,
        _data: &mut [Vec<u8>],
        _parity: &mut [Vec<u8>],
        missing: &[usize],
        _blocksize: usize,
    ) -> Result<()> {
        if missing.iter().any(|&idx| idx < self.k) {
            return Err(Error::BackendError(
                "null backend cannot recover missing data fragments".into(),
            ));
        }
        Ok(())
    }

    fn reconstruct(
        &self,
        _data: &mut [Vec<u8>],
        parity: &mut [Vec<u8>],
        _missing: &[usize],
        dst_idx: usize,
        _blocksize: usize,
    ) -> Result<()> {
        if dst_idx < self.k {
            return Err(Error::BackendError(
                "null backend cannot recover missing data fragments".into(),
            ));
        }
        // parity was never computed; its true content is all zeroes
        for b in parity[dst_idx - self.k].iter_mut() {
            *b = 0;
        }
        Ok(())
    }

    fn fragments_needed(
        &self,
        to_reconstruct: &[usize],
        to_exclude: &[usize],
    ) -> Result<Vec<usize>> {
        mds_fragments_needed(self.k, self.m, to_reconstruct, to_exclude)
    }

    fn element_size(&self) -> u32 {
        8
    }
}

// =============================================================================
// Tests
// =============================================================================
