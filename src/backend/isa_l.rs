//! Intel ISA-L Backend
//!
//! Reed-Solomon (Vandermonde) coding on Intel's ISA-L library through a
//! narrow FFI shim. Only compiled against the native library when the
//! `isa-l` cargo feature is enabled; otherwise the backend stays
//! registered but reports itself unavailable, and instance creation
//! fails with *backend-not-available*.

use crate::backend::{BackendCodec, CodingArgs};
use crate::error::{Error, Result};

/// Whether the native kernel was linked into this build.
pub(crate) fn probe() -> bool {
    cfg!(feature = "isa-l")
}

#[cfg(not(feature = "isa-l"))]
pub(crate) fn init(_args: &CodingArgs) -> Result<Box<dyn BackendCodec>> {
    Err(Error::BackendNotAvailable(
        "isa_l_rs_vand requires the `isa-l` feature and the native libisal".into(),
    ))
}

#[cfg(feature = "isa-l")]
pub(crate) fn init(args: &CodingArgs) -> Result<Box<dyn BackendCodec>> {
    native::init(args)
}

#[cfg(feature = "isa-l")]
mod native {
    use super::*;
    use crate::backend::{mds_fragments_needed, validate_common};

    // Minimal bindings for the specific ISA-L entry points we need.
    #[link(name = "isal")]
    extern "C" {
        /// Generate a (rows x k) Vandermonde matrix; the top k rows are
        /// the identity.
        fn gf_gen_rs_matrix(a: *mut u8, rows: i32, k: i32);

        /// Expand coefficient rows into the table layout ec_encode_data
        /// consumes (32 * k * rows bytes).
        fn ec_init_tables(k: i32, rows: i32, a: *const u8, gftbls: *mut u8);

        /// Multiply k source buffers through the tables into `rows`
        /// output buffers.
        fn ec_encode_data(
            len: i32,
            k: i32,
            rows: i32,
            gftbls: *mut u8,
            data: *mut *mut u8,
            coding: *mut *mut u8,
        );

        /// Invert an n x n matrix in GF(2^8); non-zero when singular.
        fn gf_invert_matrix(input: *mut u8, output: *mut u8, n: i32) -> i32;

        /// Scalar GF(2^8) multiply.
        fn gf_mul(a: u8, b: u8) -> u8;
    }

    /// Capability object of the ISA-L backend.
    #[derive(Debug)]
    pub(super) struct IsaLCodec {
        k: usize,
        m: usize,
        /// (k + m) x k generator matrix; top k rows are the identity.
        encode_matrix: Vec<u8>,
        /// Pre-expanded tables for the parity rows.
        encode_tables: Vec<u8>,
    }

    pub(super) fn init(args: &CodingArgs) -> Result<Box<dyn BackendCodec>> {
        validate_common(args)?;
        if args.w != 8 {
            return Err(Error::InvalidParams(format!(
                "isa_l_rs_vand runs over GF(2^8); w must be 8, got {}",
                args.w
            )));
        }
        if args.total_fragments() > 255 {
            return Err(Error::InvalidParams(format!(
                "k + m = {} exceeds the GF(2^8) ceiling of 255",
                args.total_fragments()
            )));
        }

        let k = args.k;
        let m = args.m;
        let n = k + m;

        let mut encode_matrix = vec![0u8; n * k];
        unsafe {
            gf_gen_rs_matrix(encode_matrix.as_mut_ptr(), n as i32, k as i32);
        }

        let mut encode_tables = vec![0u8; 32 * k * m];
        unsafe {
            ec_init_tables(
                k as i32,
                m as i32,
                encode_matrix[k * k..].as_ptr(),
                encode_tables.as_mut_ptr(),
            );
        }

        Ok(Box::new(IsaLCodec {
            k,
            m,
            encode_matrix,
            encode_tables,
        }))
    }

    impl IsaLCodec {
        /// Recover the rows in `missing` by inverting the surviving
        /// sub-matrix and multiplying the erased generator rows through
        /// the inverse.
        fn recover(
            &self,
            data: &mut [Vec<u8>],
            parity: &mut [Vec<u8>],
            missing: &[usize],
            blocksize: usize,
        ) -> Result<()> {
            if missing.is_empty() {
                return Ok(());
            }
            let k = self.k;
            let n = self.k + self.m;

            let surviving: Vec<usize> = (0..n).filter(|i| !missing.contains(i)).take(k).collect();
            if surviving.len() < k {
                return Err(Error::InsufficientFragments {
                    available: surviving.len(),
                    required: k,
                });
            }

            let mut sub_matrix = vec![0u8; k * k];
            for (row, &idx) in surviving.iter().enumerate() {
                sub_matrix[row * k..(row + 1) * k]
                    .copy_from_slice(&self.encode_matrix[idx * k..(idx + 1) * k]);
            }

            let mut inverse = vec![0u8; k * k];
            let rc = unsafe {
                gf_invert_matrix(sub_matrix.as_mut_ptr(), inverse.as_mut_ptr(), k as i32)
            };
            if rc != 0 {
                return Err(Error::BackendError(
                    "isa-l decode matrix is singular".into(),
                ));
            }

            // recovery row for erased index e = generator row e x inverse
            let nerrs = missing.len();
            let mut recovery = vec![0u8; nerrs * k];
            for (row, &e) in missing.iter().enumerate() {
                let gen_row = &self.encode_matrix[e * k..(e + 1) * k];
                for col in 0..k {
                    let mut acc = 0u8;
                    for (i, &g) in gen_row.iter().enumerate() {
                        acc ^= unsafe { gf_mul(g, inverse[i * k + col]) };
                    }
                    recovery[row * k + col] = acc;
                }
            }

            let mut tables = vec![0u8; 32 * k * nerrs];
            unsafe {
                ec_init_tables(
                    k as i32,
                    nerrs as i32,
                    recovery.as_ptr(),
                    tables.as_mut_ptr(),
                );
            }

            let mut src_ptrs: Vec<*mut u8> = surviving
                .iter()
                .map(|&i| {
                    let row: &[u8] = if i < k { &data[i] } else { &parity[i - k] };
                    row.as_ptr() as *mut u8
                })
                .collect();
            let mut dst_ptrs: Vec<*mut u8> = missing
                .iter()
                .map(|&i| {
                    if i < k {
                        data[i].as_mut_ptr()
                    } else {
                        parity[i - k].as_mut_ptr()
                    }
                })
                .collect();

            unsafe {
                ec_encode_data(
                    blocksize as i32,
                    k as i32,
                    nerrs as i32,
                    tables.as_mut_ptr(),
                    src_ptrs.as_mut_ptr(),
                    dst_ptrs.as_mut_ptr(),
                );
            }
            Ok(())
        }
    }

    impl BackendCodec for IsaLCodec {
        fn encode(
            &self,
            data: &mut [Vec<u8>],
            parity: &mut [Vec<u8>],
            blocksize: usize,
        ) -> Result<()> {
            let mut data_ptrs: Vec<*mut u8> = data.iter_mut().map(|r| r.as_mut_ptr()).collect();
            let mut parity_ptrs: Vec<*mut u8> =
                parity.iter_mut().map(|r| r.as_mut_ptr()).collect();
            let mut tables = self.encode_tables.clone();
            unsafe {
                ec_encode_data(
                    blocksize as i32,
                    self.k as i32,
                    self.m as i32,
                    tables.as_mut_ptr(),
                    data_ptrs.as_mut_ptr(),
                    parity_ptrs.as_mut_ptr(),
                );
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
            self.recover(data, parity, missing, blocksize)
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
            self.recover(data, parity, missing, blocksize)
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
}

// =============================================================================
// Tests
// =============================================================================
