//! Flat-XOR Backend
//!
//! XOR-based codes with a declared Hamming distance `hd`: the stripe
//! tolerates any hd-1 erasures. Each data fragment is assigned a distinct
//! (hd-1)-subset of the parity set; every parity fragment is the XOR of
//! the data fragments whose subset contains it. Recovery solves the
//! parity equations over GF(2).

use crate::backend::{validate_common, BackendCodec, CodingArgs};
use crate::error::{Error, Result};

/// Bitmaps and elimination masks cap the total fragment count.
const FLAT_XOR_MAX_FRAGMENTS: usize = 32;

// =============================================================================
// Code Construction
// =============================================================================

fn binomial(n: usize, r: usize) -> usize {
    if r > n {
        return 0;
    }
    let r = r.min(n - r);
    let mut acc = 1usize;
    for i in 0..r {
        acc = acc * (n - i) / (i + 1);
    }
    acc
}

/// First `count` r-subsets of `0..m` in lexicographic order.
fn lex_subsets(m: usize, r: usize, count: usize) -> Vec<Vec<usize>> {
    let mut out = Vec::with_capacity(count);
    let mut combo: Vec<usize> = (0..r).collect();
    while out.len() < count {
        out.push(combo.clone());
        // advance to the next combination
        let mut i = r;
        loop {
            if i == 0 {
                return out;
            }
            i -= 1;
            if combo[i] != i + m - r {
                break;
            }
        }
        combo[i] += 1;
        for j in i + 1..r {
            combo[j] = combo[j - 1] + 1;
        }
    }
    out
}

#[inline]
fn xor_into(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src.iter()) {
        *d ^= s;
    }
}

// =============================================================================
// Flat-XOR Codec
// =============================================================================

/// Capability object of the flat-XOR backend.
#[derive(Debug)]
pub struct FlatXorCodec {
    k: usize,
    m: usize,
    /// parity_members[p] = data indices XORed into parity p
    parity_members: Vec<Vec<usize>>,
    /// data_parities[j] = parity indices covering data fragment j
    data_parities: Vec<Vec<usize>>,
}

pub(crate) fn init(args: &CodingArgs) -> Result<Box<dyn BackendCodec>> {
    validate_common(args)?;
    let hd = args.hd as usize;
    if hd != 3 && hd != 4 {
        return Err(Error::InvalidParams(format!(
            "flat_xor_hd supports hd of 3 or 4, got {}",
            args.hd
        )));
    }
    if args.m < hd - 1 {
        return Err(Error::InvalidParams(format!(
            "flat_xor_hd with hd={} needs m >= {}",
            hd,
            hd - 1
        )));
    }
    if args.k > binomial(args.m, hd - 1) {
        return Err(Error::InvalidParams(format!(
            "flat_xor_hd with m={}, hd={} supports at most k={}",
            args.m,
            hd,
            binomial(args.m, hd - 1)
        )));
    }
    if args.total_fragments() > FLAT_XOR_MAX_FRAGMENTS {
        return Err(Error::InvalidParams(format!(
            "k + m = {} exceeds the flat_xor_hd ceiling of {}",
            args.total_fragments(),
            FLAT_XOR_MAX_FRAGMENTS
        )));
    }

    let data_parities = lex_subsets(args.m, hd - 1, args.k);
    let mut parity_members = vec![Vec::new(); args.m];
    for (j, subset) in data_parities.iter().enumerate() {
        for &p in subset {
            parity_members[p].push(j);
        }
    }

    Ok(Box::new(FlatXorCodec {
        k: args.k,
        m: args.m,
        parity_members,
        data_parities,
    }))
}

impl FlatXorCodec {
    /// Solve the parity equations over GF(2) for the rows in `missing`.
    fn solve(
        &self,
        data: &mut [Vec<u8>],
        parity: &mut [Vec<u8>],
        missing: &[usize],
        blocksize: usize,
    ) -> Result<()> {
        if missing.is_empty() {
            return Ok(());
        }
        let n = self.k + self.m;
        let mut unknowns = missing.to_vec();
        unknowns.sort_unstable();
        unknowns.dedup();

        let mut unknown_pos = vec![None; n];
        for (u, &idx) in unknowns.iter().enumerate() {
            if idx >= n {
                return Err(Error::InvalidParams(format!(
                    "missing index {} out of range for k+m={}",
                    idx, n
                )));
            }
            unknown_pos[idx] = Some(u);
        }

        // One equation per parity: p XOR (members of p) = 0. Rows carrying
        // at least one unknown enter Gaussian elimination, keyed by their
        // lowest unknown bit.
        let mut pivots: Vec<Option<(u64, Vec<u8>)>> = (0..unknowns.len()).map(|_| None).collect();
        for p in 0..self.m {
            let mut mask = 0u64;
            let mut rhs = vec![0u8; blocksize];
            match unknown_pos[self.k + p] {
                Some(u) => mask |= 1 << u,
                None => xor_into(&mut rhs, &parity[p]),
            }
            for &j in &self.parity_members[p] {
                match unknown_pos[j] {
                    Some(u) => mask |= 1 << u,
                    None => xor_into(&mut rhs, &data[j]),
                }
            }
            while mask != 0 {
                let low = mask.trailing_zeros() as usize;
                match &pivots[low] {
                    Some((pivot_mask, pivot_rhs)) => {
                        mask ^= pivot_mask;
                        xor_into(&mut rhs, pivot_rhs);
                    }
                    None => {
                        pivots[low] = Some((mask, rhs));
                        break;
                    }
                }
            }
        }

        // Back-substitution, highest unknown first: a pivot's other bits
        // are all higher than its own and therefore already solved.
        let mut solved: Vec<Option<Vec<u8>>> = (0..unknowns.len()).map(|_| None).collect();
        for u in (0..unknowns.len()).rev() {
            let (mask, mut rhs) = match pivots[u].take() {
                Some(row) => row,
                None => {
                    return Err(Error::InsufficientFragments {
                        available: n - unknowns.len(),
                        required: self.k,
                    })
                }
            };
            let mut rest = mask & !(1u64 << u);
            while rest != 0 {
                let v = rest.trailing_zeros() as usize;
                rest &= rest - 1;
                match &solved[v] {
                    Some(row) => xor_into(&mut rhs, row),
                    None => {
                        return Err(Error::BackendError(
                            "flat-xor elimination produced an unordered pivot".into(),
                        ))
                    }
                }
            }
            solved[u] = Some(rhs);
        }

        for (u, &idx) in unknowns.iter().enumerate() {
            let row = match solved[u].take() {
                Some(row) => row,
                None => {
                    return Err(Error::BackendError(format!(
                        "flat-xor solver left fragment {} unrecovered",
                        idx
                    )))
                }
            };
            if idx < self.k {
                data[idx] = row;
            } else {
                parity[idx - self.k] = row;
            }
        }
        Ok(())
    }
}

impl BackendCodec for FlatXorCodec {
    fn encode(&self, data: &mut [Vec<u8>], parity: &mut [Vec<u8>], _blocksize: usize) -> Result<()> {
        for (p, members) in self.parity_members.iter().enumerate() {
            for &j in members {
                let (row, src) = (&mut parity[p], &data[j]);
                xor_into(row, src);
            }
        }
        Ok(())
    }

    fn decode(
        &self,
        data: &mut [Vec<u8>],
        parity: &mut [Vec<u8>],
        missing: &[usize],
        blocksize: usize,
    ) -> Result<()> {
        self.solve(data, parity, missing, blocksize)
    }

    fn reconstruct(
        &self,
        data: &mut [Vec<u8>],
        parity: &mut [Vec<u8>],
        missing: &[usize],
        dst_idx: usize,
        blocksize: usize,
    ) -> Result<()> {
        if dst_idx >= self.k + self.m {
            return Err(Error::InvalidParams(format!(
                "destination index {} out of range for k+m={}",
                dst_idx,
                self.k + self.m
            )));
        }
        self.solve(data, parity, missing, blocksize)
    }

    fn fragments_needed(
        &self,
        to_reconstruct: &[usize],
        to_exclude: &[usize],
    ) -> Result<Vec<usize>> {
        let n = self.k + self.m;
        let unavailable =
            |idx: usize| to_reconstruct.contains(&idx) || to_exclude.contains(&idx);

        let mut needed: Vec<usize> = Vec::new();
        let push = |idx: usize, needed: &mut Vec<usize>| {
            if !needed.contains(&idx) {
                needed.push(idx);
            }
        };

        for &target in to_reconstruct {
            if target >= n {
                return Err(Error::InvalidParams(format!(
                    "reconstruction index {} out of range for k+m={}",
                    target, n
                )));
            }
            if target < self.k {
                // pick the first parity equation whose other members are
                // all available
                let usable = self.data_parities[target].iter().find(|&&p| {
                    !unavailable(self.k + p)
                        && self.parity_members[p]
                            .iter()
                            .all(|&j| j == target || !unavailable(j))
                });
                match usable {
                    Some(&p) => {
                        push(self.k + p, &mut needed);
                        for &j in &self.parity_members[p] {
                            if j != target {
                                push(j, &mut needed);
                            }
                        }
                    }
                    None => {
                        return Err(Error::InsufficientFragments {
                            available: n.saturating_sub(to_reconstruct.len() + to_exclude.len()),
                            required: self.k,
                        })
                    }
                }
            } else {
                let p = target - self.k;
                for &j in &self.parity_members[p] {
                    if unavailable(j) {
                        return Err(Error::InsufficientFragments {
                            available: n.saturating_sub(to_reconstruct.len() + to_exclude.len()),
                            required: self.k,
                        });
                    }
                    push(j, &mut needed);
                }
            }
        }

        needed.sort_unstable();
        Ok(needed)
    }

    fn element_size(&self) -> u32 {
        8
    }
}

// =============================================================================
// Tests
// =============================================================================
