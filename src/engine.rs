//! Stripe Engine
//!
//! Orchestrates encode, decode, reconstruct and minimum-fragments queries
//! over live coding instances. The engine owns the instance table, maps
//! input buffers onto aligned fragment rows, partitions available
//! fragments into data / parity / missing, and drives the selected
//! backend purely through its capability set.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info, instrument};

use crate::backend::{self, BackendCodec, BackendDescriptor, BackendId, CodingArgs};
use crate::checksum::ChecksumType;
use crate::error::{Error, Result};
use crate::fragment::{self, Fragment, FragmentMetadata, FRAGMENT_HEADER_SIZE, MAX_CHECKSUM_SLOTS};
use crate::geometry;
use crate::verify;

// =============================================================================
// Instance Handles
// =============================================================================

/// Opaque handle to a live coding instance. Descriptors are assigned
/// monotonically and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceDesc(u64);

impl InstanceDesc {
    /// Raw numeric value of the descriptor.
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for InstanceDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "desc#{}", self.0)
    }
}

/// A live coding configuration: resolved parameters, the backend
/// descriptor and the per-instance capability object.
pub(crate) struct Instance {
    pub(crate) backend: &'static BackendDescriptor,
    pub(crate) args: CodingArgs,
    pub(crate) codec: Box<dyn BackendCodec>,
}

impl Instance {
    #[inline]
    pub(crate) fn k(&self) -> usize {
        self.args.k
    }

    #[inline]
    pub(crate) fn m(&self) -> usize {
        self.args.m
    }
}

/// Instance table slot. The destroyed state is kept so descriptors are
/// never resurrected and cleanup stays callable after destruction.
enum InstanceSlot {
    Live(Arc<Instance>),
    Destroyed,
}

// =============================================================================
// Owned Results
// =============================================================================

/// The k + m fragments produced by one encode, owned by the caller until
/// handed back via [`StripeEngine::encode_cleanup`].
#[derive(Debug)]
pub struct EncodedStripe {
    /// Data fragments, in index order 0..k.
    pub data: Vec<Fragment>,
    /// Parity fragments, in index order k..k+m.
    pub parity: Vec<Fragment>,
    /// Serialized length of every fragment in the stripe.
    pub fragment_len: usize,
}

impl EncodedStripe {
    /// All fragments in stripe order (data, then parity).
    pub fn fragments(&self) -> impl Iterator<Item = &Fragment> {
        self.data.iter().chain(self.parity.iter())
    }

    /// Total number of fragments (k + m).
    pub fn total_fragments(&self) -> usize {
        self.data.len() + self.parity.len()
    }
}

// =============================================================================
// Fragment Partition
// =============================================================================

/// Available fragments split by stripe position.
#[derive(Debug)]
pub(crate) struct StripePartition<'a> {
    /// Payload of each data fragment, by index.
    pub(crate) data: Vec<Option<&'a [u8]>>,
    /// Payload of each parity fragment, by index - k.
    pub(crate) parity: Vec<Option<&'a [u8]>>,
    /// Indices in `[0, k + m)` with no fragment available.
    pub(crate) missing: Vec<usize>,
}

impl StripePartition<'_> {
    pub(crate) fn available(&self, total: usize) -> usize {
        total - self.missing.len()
    }

    pub(crate) fn all_data_present(&self) -> bool {
        self.data.iter().all(|d| d.is_some())
    }
}

/// Partition parsed fragments into data-present / parity-present /
/// missing-index form. Duplicate indices keep the first occurrence.
pub(crate) fn partition_fragments<'a>(
    k: usize,
    m: usize,
    frags: &[(FragmentMetadata, &'a [u8])],
) -> Result<StripePartition<'a>> {
    let n = k + m;
    let mut data: Vec<Option<&[u8]>> = vec![None; k];
    let mut parity: Vec<Option<&[u8]>> = vec![None; m];

    for (meta, payload) in frags {
        if meta.idx < 0 || meta.idx as usize >= n {
            return Err(Error::InvalidParams(format!(
                "fragment index {} out of range for k+m={}",
                meta.idx, n
            )));
        }
        let idx = meta.idx as usize;
        let slot = if idx < k {
            &mut data[idx]
        } else {
            &mut parity[idx - k]
        };
        if slot.is_none() {
            *slot = Some(*payload);
        }
    }

    let missing = (0..n)
        .filter(|&i| {
            if i < k {
                data[i].is_none()
            } else {
                parity[i - k].is_none()
            }
        })
        .collect();

    Ok(StripePartition {
        data,
        parity,
        missing,
    })
}

// =============================================================================
// Stripe Engine
// =============================================================================

/// The fragment stripe engine. Holds the process-wide instance table;
/// operations on distinct live instances may run in parallel.
pub struct StripeEngine {
    instances: DashMap<u64, InstanceSlot>,
    next_desc: AtomicU64,
}

impl Default for StripeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StripeEngine {
    /// Create an engine with an empty instance table.
    pub fn new() -> Self {
        Self {
            instances: DashMap::new(),
            next_desc: AtomicU64::new(1),
        }
    }

    /// Whether a backend can be instantiated in this process.
    pub fn backend_available(&self, backend_id: BackendId) -> bool {
        backend::lookup(backend_id).available()
    }

    // -------------------------------------------------------------------------
    // Instance Lifecycle
    // -------------------------------------------------------------------------

    /// Create a live coding instance for `backend_id` with `args`.
    #[instrument(skip(self, args), fields(backend = backend_id.name()))]
    pub fn instance_create(
        &self,
        backend_id: BackendId,
        args: &CodingArgs,
    ) -> Result<InstanceDesc> {
        if args.checksum == ChecksumType::Md5 {
            return Err(Error::NotImplemented(
                "md5 payload checksums are reserved but not implemented".into(),
            ));
        }

        let descriptor = backend::lookup(backend_id);
        if !descriptor.available() {
            return Err(Error::BackendNotAvailable(descriptor.name.into()));
        }

        let mut resolved = args.clone();
        if resolved.w == 0 {
            resolved.w = descriptor.default_w;
        }

        let codec = descriptor.instantiate(&resolved)?;
        let desc = InstanceDesc(self.next_desc.fetch_add(1, Ordering::SeqCst));
        self.instances.insert(
            desc.raw(),
            InstanceSlot::Live(Arc::new(Instance {
                backend: descriptor,
                args: resolved,
                codec,
            })),
        );

        info!(desc = desc.raw(), "created coding instance");
        Ok(desc)
    }

    /// Destroy a live instance. One-way; the descriptor is never reused.
    #[instrument(skip(self))]
    pub fn instance_destroy(&self, desc: InstanceDesc) -> Result<()> {
        let mut slot = self
            .instances
            .get_mut(&desc.raw())
            .ok_or_else(|| Error::InvalidParams(format!("unknown instance {}", desc)))?;
        match *slot {
            InstanceSlot::Live(_) => {
                *slot = InstanceSlot::Destroyed;
                info!(desc = desc.raw(), "destroyed coding instance");
                Ok(())
            }
            InstanceSlot::Destroyed => Err(Error::InvalidParams(format!(
                "instance {} already destroyed",
                desc
            ))),
        }
    }

    /// Fetch a live instance or fail with *invalid-params*.
    fn live(&self, desc: InstanceDesc) -> Result<Arc<Instance>> {
        match self.instances.get(&desc.raw()).as_deref() {
            Some(InstanceSlot::Live(inst)) => Ok(Arc::clone(inst)),
            Some(InstanceSlot::Destroyed) => Err(Error::InvalidParams(format!(
                "instance {} is destroyed",
                desc
            ))),
            None => Err(Error::InvalidParams(format!("unknown instance {}", desc))),
        }
    }

    /// Require that a descriptor was ever valid (live or destroyed).
    /// Cleanup entry points only need the buffer topology, which the
    /// buffers themselves carry, so they accept destroyed instances.
    fn known(&self, desc: InstanceDesc) -> Result<()> {
        if self.instances.contains_key(&desc.raw()) {
            Ok(())
        } else {
            Err(Error::InvalidParams(format!("unknown instance {}", desc)))
        }
    }

    // -------------------------------------------------------------------------
    // Encode
    // -------------------------------------------------------------------------

    /// Encode `buf` into k data and m parity fragments.
    #[instrument(skip(self, buf), fields(desc = desc.raw(), len = buf.len()))]
    pub fn encode(&self, desc: InstanceDesc, buf: &[u8]) -> Result<EncodedStripe> {
        let inst = self.live(desc)?;
        if buf.is_empty() {
            return Err(Error::InvalidParams("cannot encode an empty buffer".into()));
        }

        let (k, m) = (inst.k(), inst.m());
        let blocksize = geometry::fragment_payload_len(
            buf.len(),
            k,
            inst.codec.element_size(),
            inst.backend.simd_multiple,
        )?;

        let mut data_rows: Vec<Vec<u8>> = (0..k)
            .map(|i| {
                let mut row = vec![0u8; blocksize];
                let (start, end) = geometry::data_range(i, blocksize, buf.len());
                row[..end - start].copy_from_slice(&buf[start..end]);
                row
            })
            .collect();
        let mut parity_rows: Vec<Vec<u8>> = vec![vec![0u8; blocksize]; m];

        inst.codec
            .encode(&mut data_rows, &mut parity_rows, blocksize)?;

        let fragment_len =
            FRAGMENT_HEADER_SIZE + blocksize + inst.backend.backend_metadata_size;

        let mut data = Vec::with_capacity(k);
        for (i, row) in data_rows.iter().enumerate() {
            let meta = stamp_metadata(&inst, i, buf.len(), row)?;
            data.push(fragment::wrap(row, &meta, inst.backend.backend_metadata_size)?);
        }
        let mut parity = Vec::with_capacity(m);
        for (j, row) in parity_rows.iter().enumerate() {
            let meta = stamp_metadata(&inst, k + j, buf.len(), row)?;
            parity.push(fragment::wrap(row, &meta, inst.backend.backend_metadata_size)?);
        }

        debug!(
            desc = desc.raw(),
            fragments = k + m,
            fragment_len,
            "encoded stripe"
        );
        Ok(EncodedStripe {
            data,
            parity,
            fragment_len,
        })
    }

    /// Release the fragment buffers produced by [`StripeEngine::encode`].
    /// Callable on a destroyed (but once-valid) instance.
    pub fn encode_cleanup(&self, desc: InstanceDesc, stripe: EncodedStripe) -> Result<()> {
        self.known(desc)?;
        drop(stripe);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Decode
    // -------------------------------------------------------------------------

    /// Rebuild the original buffer from any sufficient subset of
    /// fragments.
    ///
    /// With `force_metadata_checks` every fragment is validated against
    /// the instance and the stripe; invalid fragments are dropped, and
    /// decode fails with *insufficient-fragments* unless at least k
    /// well-formed fragments remain. Without it, the first malformed
    /// header aborts with *bad-header*.
    #[instrument(skip(self, frags), fields(desc = desc.raw(), n = frags.len()))]
    pub fn decode(
        &self,
        desc: InstanceDesc,
        frags: &[&[u8]],
        force_metadata_checks: bool,
    ) -> Result<Vec<u8>> {
        let inst = self.live(desc)?;
        let (k, m) = (inst.k(), inst.m());
        if frags.is_empty() {
            return Err(Error::InvalidParams("no fragments supplied".into()));
        }

        let accepted = collect_stripe_fragments(&inst, frags, force_metadata_checks)?;
        if accepted.len() < k {
            return Err(Error::InsufficientFragments {
                available: accepted.len(),
                required: k,
            });
        }

        let orig_len = accepted[0].0.orig_data_size as usize;
        let blocksize = accepted[0].0.size as usize;
        let part = partition_fragments(k, m, &accepted)?;

        // fast path: every data fragment is present and clean
        if part.all_data_present() {
            let mut out = Vec::with_capacity(orig_len);
            for payload in part.data.iter().flatten() {
                out.extend_from_slice(payload);
            }
            out.truncate(orig_len);
            return Ok(out);
        }

        if part.available(k + m) < k {
            return Err(Error::InsufficientFragments {
                available: part.available(k + m),
                required: k,
            });
        }

        let mut data_rows: Vec<Vec<u8>> = part
            .data
            .iter()
            .map(|p| p.map(<[u8]>::to_vec).unwrap_or_else(|| vec![0u8; blocksize]))
            .collect();
        let mut parity_rows: Vec<Vec<u8>> = part
            .parity
            .iter()
            .map(|p| p.map(<[u8]>::to_vec).unwrap_or_else(|| vec![0u8; blocksize]))
            .collect();

        debug!(
            desc = desc.raw(),
            missing = ?part.missing,
            "recovering stripe via backend"
        );
        inst.codec
            .decode(&mut data_rows, &mut parity_rows, &part.missing, blocksize)?;

        let mut out = Vec::with_capacity(orig_len);
        for row in &data_rows {
            out.extend_from_slice(row);
        }
        out.truncate(orig_len);
        Ok(out)
    }

    /// Release a buffer produced by [`StripeEngine::decode`]. Callable on
    /// a destroyed (but once-valid) instance.
    pub fn decode_cleanup(&self, desc: InstanceDesc, out: Vec<u8>) -> Result<()> {
        self.known(desc)?;
        drop(out);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Reconstruct
    // -------------------------------------------------------------------------

    /// Rebuild exactly the fragment at `dst_idx`, returning a fragment
    /// byte-identical to the originally encoded one, header included.
    #[instrument(skip(self, frags), fields(desc = desc.raw(), dst_idx))]
    pub fn reconstruct_fragment(
        &self,
        desc: InstanceDesc,
        frags: &[&[u8]],
        dst_idx: usize,
    ) -> Result<Fragment> {
        let inst = self.live(desc)?;
        let (k, m) = (inst.k(), inst.m());
        if frags.is_empty() {
            return Err(Error::InvalidParams("no fragments supplied".into()));
        }
        if dst_idx >= k + m {
            return Err(Error::InvalidParams(format!(
                "destination index {} out of range for k+m={}",
                dst_idx,
                k + m
            )));
        }

        let accepted = collect_stripe_fragments(&inst, frags, false)?;
        if accepted.is_empty() {
            return Err(Error::InsufficientFragments {
                available: 0,
                required: k,
            });
        }
        let orig_len = accepted[0].0.orig_data_size as usize;
        let blocksize = accepted[0].0.size as usize;
        let part = partition_fragments(k, m, &accepted)?;

        // the fragment may still be present in the available set
        let existing = if dst_idx < k {
            part.data[dst_idx]
        } else {
            part.parity[dst_idx - k]
        };
        if let Some(payload) = existing {
            let meta = stamp_metadata(&inst, dst_idx, orig_len, payload)?;
            return fragment::wrap(payload, &meta, inst.backend.backend_metadata_size);
        }

        if part.available(k + m) < k {
            return Err(Error::InsufficientFragments {
                available: part.available(k + m),
                required: k,
            });
        }

        let mut data_rows: Vec<Vec<u8>> = part
            .data
            .iter()
            .map(|p| p.map(<[u8]>::to_vec).unwrap_or_else(|| vec![0u8; blocksize]))
            .collect();
        let mut parity_rows: Vec<Vec<u8>> = part
            .parity
            .iter()
            .map(|p| p.map(<[u8]>::to_vec).unwrap_or_else(|| vec![0u8; blocksize]))
            .collect();

        inst.codec.reconstruct(
            &mut data_rows,
            &mut parity_rows,
            &part.missing,
            dst_idx,
            blocksize,
        )?;

        let row = if dst_idx < k {
            &data_rows[dst_idx]
        } else {
            &parity_rows[dst_idx - k]
        };
        let meta = stamp_metadata(&inst, dst_idx, orig_len, row)?;
        fragment::wrap(row, &meta, inst.backend.backend_metadata_size)
    }

    // -------------------------------------------------------------------------
    // Fragments Needed
    // -------------------------------------------------------------------------

    /// Which fragments must be supplied to rebuild `to_reconstruct`
    /// without using `to_exclude`. The result is disjoint from both
    /// input sets.
    #[instrument(skip(self), fields(desc = desc.raw()))]
    pub fn fragments_needed(
        &self,
        desc: InstanceDesc,
        to_reconstruct: &[usize],
        to_exclude: &[usize],
    ) -> Result<Vec<usize>> {
        let inst = self.live(desc)?;
        let n = inst.args.total_fragments();
        if to_reconstruct.is_empty() {
            return Err(Error::InvalidParams(
                "nothing to reconstruct".into(),
            ));
        }
        for &idx in to_reconstruct.iter().chain(to_exclude.iter()) {
            if idx >= n {
                return Err(Error::InvalidParams(format!(
                    "fragment index {} out of range for k+m={}",
                    idx, n
                )));
            }
        }

        let needed = inst.codec.fragments_needed(to_reconstruct, to_exclude)?;

        for &idx in &needed {
            if idx >= n || to_reconstruct.contains(&idx) || to_exclude.contains(&idx) {
                return Err(Error::BackendError(format!(
                    "backend returned needed index {} overlapping its inputs",
                    idx
                )));
            }
        }
        Ok(needed)
    }

    // -------------------------------------------------------------------------
    // Verification
    // -------------------------------------------------------------------------

    /// True when the fragment fails any identity or integrity check
    /// against this instance (or the descriptor itself is not live).
    pub fn is_invalid_fragment(&self, desc: InstanceDesc, frag: &[u8]) -> bool {
        match self.live(desc) {
            Ok(inst) => verify::fragment_is_invalid(&inst, frag),
            Err(_) => true,
        }
    }

    /// Cross-check a set of fragments for validity and pairwise identity.
    pub fn verify_stripe_metadata(&self, desc: InstanceDesc, frags: &[&[u8]]) -> Result<()> {
        let inst = self.live(desc)?;
        verify::verify_stripe(&inst, frags)
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Stamp the metadata for fragment `idx` of a stripe carrying `orig_len`
/// input bytes. Deterministic, so reconstruction reproduces the original
/// header bit-for-bit.
fn stamp_metadata(
    inst: &Instance,
    idx: usize,
    orig_len: usize,
    payload: &[u8],
) -> Result<FragmentMetadata> {
    let mut chksum = [0u32; MAX_CHECKSUM_SLOTS];
    chksum[0] = inst.args.checksum.compute(payload)?;
    Ok(FragmentMetadata {
        idx: idx as i32,
        orig_data_size: orig_len as u64,
        size: payload.len() as u64,
        backend_id: inst.backend.id.as_u8(),
        backend_version: inst.backend.backend_version,
        chksum_type: inst.args.checksum,
        chksum,
        chksum_mismatch: false,
        is_parity: idx >= inst.k(),
    })
}

/// Parse and filter the caller's fragment list for one stripe operation.
///
/// Fragments whose payload checksum mismatches are always unusable and
/// are dropped. Under `force`, malformed or foreign fragments are dropped
/// as well; otherwise a malformed header aborts and a fragment
/// disagreeing with the stripe is an argument error.
fn collect_stripe_fragments<'a>(
    inst: &Instance,
    frags: &[&'a [u8]],
    force: bool,
) -> Result<Vec<(FragmentMetadata, &'a [u8])>> {
    let mut accepted: Vec<(FragmentMetadata, &'a [u8])> = Vec::with_capacity(frags.len());
    let mut expected: Option<(u64, u64)> = None;

    for frag in frags {
        let meta = match fragment::parse(frag) {
            Ok(meta) => meta,
            Err(e) => {
                if force {
                    debug!("dropping malformed fragment: {}", e);
                    continue;
                }
                return Err(e);
            }
        };

        if force && verify::fragment_is_invalid(inst, frag) {
            debug!(idx = meta.idx, "dropping invalid fragment");
            continue;
        }
        if meta.chksum_mismatch {
            debug!(idx = meta.idx, "dropping fragment with payload checksum mismatch");
            continue;
        }

        let key = (meta.orig_data_size, meta.size);
        match expected {
            None => expected = Some(key),
            Some(e) if e != key => {
                if force {
                    debug!(idx = meta.idx, "dropping fragment from a different stripe");
                    continue;
                }
                return Err(Error::InvalidParams(
                    "fragments disagree on stripe geometry".into(),
                ));
            }
            Some(_) => {}
        }

        let payload = fragment::payload_of(frag)?;
        accepted.push((meta, payload));
    }

    Ok(accepted)
}

// =============================================================================
// Tests
// =============================================================================
