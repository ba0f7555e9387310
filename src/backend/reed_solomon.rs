//! Shared Reed-Solomon Kernel
//!
//! Systematic Reed-Solomon arithmetic over GF(2^8) via the
//! `reed-solomon-erasure` crate, backing the Vandermonde- and
//! Cauchy-parameterised backends as well as the library's built-in RS
//! backend. The backends differ in their accepted symbol widths, fragment
//! ceilings and declared element sizes; the recovery arithmetic is one
//! kernel.

use reed_solomon_erasure::galois_8::ReedSolomon;

use crate::backend::{mds_fragments_needed, validate_common, BackendCodec, CodingArgs};
use crate::error::{Error, Result};

/// Fragment ceiling of the built-in RS backend.
const BUILTIN_MAX_FRAGMENTS: usize = 32;

/// GF(2^8) limits every kernel instance to 255 total shards regardless of
/// the declared symbol width.
const KERNEL_MAX_FRAGMENTS: usize = 255;

/// Cauchy codes operate on packets of 8 symbol words per element.
const CAUCHY_PACKET_SIZE: u32 = 8;

// =============================================================================
// RS Codec
// =============================================================================

/// Capability object shared by the Reed-Solomon family backends.
pub struct RsCodec {
    rs: ReedSolomon,
    k: usize,
    m: usize,
    element_bits: u32,
}

impl std::fmt::Debug for RsCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RsCodec")
            .field("k", &self.k)
            .field("m", &self.m)
            .field("element_bits", &self.element_bits)
            .finish()
    }
}

impl RsCodec {
    fn new(k: usize, m: usize, element_bits: u32) -> Result<Self> {
        let rs = ReedSolomon::new(k, m).map_err(|e| {
            Error::InvalidParams(format!("reed-solomon kernel rejected k={}, m={}: {}", k, m, e))
        })?;
        Ok(Self {
            rs,
            k,
            m,
            element_bits,
        })
    }

    /// Move all rows into the Option layout the kernel reconstructs in
    /// place, leaving `None` holes for missing fragments.
    fn take_shards(
        &self,
        data: &mut [Vec<u8>],
        parity: &mut [Vec<u8>],
        missing: &[usize],
    ) -> Vec<Option<Vec<u8>>> {
        let mut shards = Vec::with_capacity(self.k + self.m);
        for (i, row) in data.iter_mut().enumerate() {
            shards.push(if missing.contains(&i) {
                None
            } else {
                Some(std::mem::take(row))
            });
        }
        for (j, row) in parity.iter_mut().enumerate() {
            shards.push(if missing.contains(&(self.k + j)) {
                None
            } else {
                Some(std::mem::take(row))
            });
        }
        shards
    }

    /// Move recovered rows back into the caller's buffers.
    fn restore_shards(
        &self,
        shards: Vec<Option<Vec<u8>>>,
        data: &mut [Vec<u8>],
        parity: &mut [Vec<u8>],
    ) -> Result<()> {
        for (i, shard) in shards.into_iter().enumerate() {
            let row = shard.ok_or_else(|| {
                Error::BackendError(format!("kernel left shard {} unrecovered", i))
            })?;
            if i < self.k {
                data[i] = row;
            } else {
                parity[i - self.k] = row;
            }
        }
        Ok(())
    }

    fn recover(
        &self,
        data: &mut [Vec<u8>],
        parity: &mut [Vec<u8>],
        missing: &[usize],
    ) -> Result<()> {
        let mut shards = self.take_shards(data, parity, missing);
        let available = shards.iter().filter(|s| s.is_some()).count();
        let result = self.rs.reconstruct(&mut shards);
        match result {
            Ok(()) => self.restore_shards(shards, data, parity),
            Err(reed_solomon_erasure::Error::TooFewShardsPresent) => {
                // rows move back even on failure so the caller's buffers
                // stay usable
                self.refill_present(shards, data, parity);
                Err(Error::InsufficientFragments {
                    available,
                    required: self.k,
                })
            }
            Err(e) => {
                self.refill_present(shards, data, parity);
                Err(Error::BackendError(format!(
                    "reed-solomon reconstruction failed: {}",
                    e
                )))
            }
        }
    }

    fn refill_present(
        &self,
        shards: Vec<Option<Vec<u8>>>,
        data: &mut [Vec<u8>],
        parity: &mut [Vec<u8>],
    ) {
        for (i, shard) in shards.into_iter().enumerate() {
            if let Some(row) = shard {
                if i < self.k {
                    data[i] = row;
                } else {
                    parity[i - self.k] = row;
                }
            }
        }
    }
}

impl BackendCodec for RsCodec {
    fn encode(&self, data: &mut [Vec<u8>], parity: &mut [Vec<u8>], _blocksize: usize) -> Result<()> {
        self.rs
            .encode_sep(&*data, parity)
            .map_err(|e| Error::BackendError(format!("reed-solomon encode failed: {}", e)))
    }

    fn decode(
        &self,
        data: &mut [Vec<u8>],
        parity: &mut [Vec<u8>],
        missing: &[usize],
        _blocksize: usize,
    ) -> Result<()> {
        if missing.is_empty() {
            return Ok(());
        }
        self.recover(data, parity, missing)
    }

    fn reconstruct(
        &self,
        data: &mut [Vec<u8>],
        parity: &mut [Vec<u8>],
        missing: &[usize],
        dst_idx: usize,
        _blocksize: usize,
    ) -> Result<()> {
        if dst_idx >= self.k + self.m {
            return Err(Error::InvalidParams(format!(
                "destination index {} out of range for k+m={}",
                dst_idx,
                self.k + self.m
            )));
        }
        self.recover(data, parity, missing)
    }

    fn fragments_needed(
        &self,
        to_reconstruct: &[usize],
        to_exclude: &[usize],
    ) -> Result<Vec<usize>> {
        mds_fragments_needed(self.k, self.m, to_reconstruct, to_exclude)
    }

    fn element_size(&self) -> u32 {
        self.element_bits
    }
}

// =============================================================================
// Backend Init Hooks
// =============================================================================

fn validate_symbol_width(w: u32, accepted: &[u32]) -> Result<()> {
    if !accepted.contains(&w) {
        return Err(Error::InvalidParams(format!(
            "unsupported symbol width w={} (accepted: {:?})",
            w, accepted
        )));
    }
    Ok(())
}

fn validate_ceiling(args: &CodingArgs, ceiling: usize) -> Result<()> {
    let total = args.total_fragments();
    if total > ceiling {
        return Err(Error::InvalidParams(format!(
            "k + m = {} exceeds the backend ceiling of {}",
            total, ceiling
        )));
    }
    Ok(())
}

/// Ceiling imposed by the symbol width: k + m fragments must each map to
/// a distinct field symbol.
fn symbol_ceiling(w: u32) -> usize {
    let symbols = 1u64 << w;
    std::cmp::min(symbols, KERNEL_MAX_FRAGMENTS as u64) as usize
}

/// Declared fragment ceiling of the Vandermonde backend per symbol
/// width. Narrow symbols keep the conservative ceiling of 32; wider
/// symbols are bounded only by the kernel field.
fn vand_width_ceiling(w: u32) -> usize {
    match w {
        8 => 32,
        _ => KERNEL_MAX_FRAGMENTS,
    }
}

pub(crate) fn init_jerasure_rs_vand(args: &CodingArgs) -> Result<Box<dyn BackendCodec>> {
    validate_common(args)?;
    validate_symbol_width(args.w, &[8, 16, 32])?;
    validate_ceiling(
        args,
        std::cmp::min(symbol_ceiling(args.w), vand_width_ceiling(args.w)),
    )?;
    Ok(Box::new(RsCodec::new(args.k, args.m, args.w)?))
}

pub(crate) fn init_jerasure_rs_cauchy(args: &CodingArgs) -> Result<Box<dyn BackendCodec>> {
    validate_common(args)?;
    validate_symbol_width(args.w, &[4, 8, 16, 32])?;
    validate_ceiling(args, symbol_ceiling(args.w))?;
    // element = w words of one packet, in bits
    let element_bits = args.w * CAUCHY_PACKET_SIZE * 8;
    Ok(Box::new(RsCodec::new(args.k, args.m, element_bits)?))
}

pub(crate) fn init_builtin_rs_vand(args: &CodingArgs) -> Result<Box<dyn BackendCodec>> {
    validate_common(args)?;
    validate_symbol_width(args.w, &[8, 16, 32])?;
    validate_ceiling(args, std::cmp::min(BUILTIN_MAX_FRAGMENTS, symbol_ceiling(args.w)))?;
    Ok(Box::new(RsCodec::new(args.k, args.m, args.w)?))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn rows(pattern: &[u8], count: usize, len: usize) -> Vec<Vec<u8>> {
        (0..count)
            .map(|i| {
                (0..len)
                    .map(|j| pattern[(i + j) % pattern.len()])
                    .collect()
            })
            .collect()
    }

    #[test]
    fn test_encode_fills_parity() {
        let codec = RsCodec::new(4, 2, 16).unwrap();
        let mut data = rows(b"stripe data", 4, 32);
        let mut parity = vec![vec![0u8; 32]; 2];

        codec.encode(&mut data, &mut parity, 32).unwrap();
        assert!(parity.iter().any(|row| row.iter().any(|&b| b != 0)));
    }

    #[test]
    fn test_recover_missing_data_and_parity() {
        let codec = RsCodec::new(4, 2, 16).unwrap();
        let mut data = rows(b"0123456789abcdef", 4, 64);
        let mut parity = vec![vec![0u8; 64]; 2];
        codec.encode(&mut data, &mut parity, 64).unwrap();

        let original_data = data.clone();
        let original_parity = parity.clone();

        // lose one data and one parity row
        data[1] = vec![0u8; 64];
        parity[0] = vec![0u8; 64];

        codec.decode(&mut data, &mut parity, &[1, 4], 64).unwrap();
        assert_eq!(data, original_data);
        assert_eq!(parity, original_parity);
    }

    #[test]
    fn test_reconstruct_single_destination() {
        let codec = RsCodec::new(3, 2, 8).unwrap();
        let mut data = rows(b"xyz", 3, 16);
        let mut parity = vec![vec![0u8; 16]; 2];
        codec.encode(&mut data, &mut parity, 16).unwrap();
        let want = parity[1].clone();

        parity[1] = vec![0u8; 16];
        codec
            .reconstruct(&mut data, &mut parity, &[4], 4, 16)
            .unwrap();
        assert_eq!(parity[1], want);
    }

    #[test]
    fn test_too_many_missing_is_insufficient() {
        let codec = RsCodec::new(4, 2, 16).unwrap();
        let mut data = rows(b"abc", 4, 16);
        let mut parity = vec![vec![0u8; 16]; 2];
        codec.encode(&mut data, &mut parity, 16).unwrap();

        data[0] = vec![0u8; 16];
        data[1] = vec![0u8; 16];
        data[2] = vec![0u8; 16];

        assert_matches!(
            codec.decode(&mut data, &mut parity, &[0, 1, 2], 16),
            Err(Error::InsufficientFragments {
                available: 3,
                required: 4
            })
        );
    }

    #[test]
    fn test_vand_width_validation() {
        let args = CodingArgs {
            k: 4,
            m: 2,
            w: 7,
            ..Default::default()
        };
        assert_matches!(init_jerasure_rs_vand(&args), Err(Error::InvalidParams(_)));
    }

    #[test]
    fn test_vand_width_ceilings() {
        // 30 + 20 fragments fit the wide-symbol ceiling
        let wide = CodingArgs {
            k: 30,
            m: 20,
            w: 16,
            ..Default::default()
        };
        assert!(init_jerasure_rs_vand(&wide).is_ok());

        // but exceed the declared ceiling for 8-bit symbols
        let narrow = CodingArgs {
            k: 30,
            m: 20,
            w: 8,
            ..Default::default()
        };
        assert_matches!(init_jerasure_rs_vand(&narrow), Err(Error::InvalidParams(_)));
    }

    #[test]
    fn test_builtin_ceiling_is_32() {
        let args = CodingArgs {
            k: 30,
            m: 20,
            w: 16,
            ..Default::default()
        };
        assert_matches!(init_builtin_rs_vand(&args), Err(Error::InvalidParams(_)));

        let ok = CodingArgs {
            k: 28,
            m: 4,
            w: 16,
            ..Default::default()
        };
        assert!(init_builtin_rs_vand(&ok).is_ok());
    }

    #[test]
    fn test_cauchy_element_size() {
        let args = CodingArgs {
            k: 4,
            m: 2,
            w: 4,
            ..Default::default()
        };
        let codec = init_jerasure_rs_cauchy(&args).unwrap();
        assert_eq!(codec.element_size(), 4 * 8 * 8);
    }
}
