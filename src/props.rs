//! Property-Based Tests for the Stripe Engine
//!
//! Uses proptest to verify engine correctness across backends, coding
//! configurations and inputs.
//!
//! # Test Properties
//!
//! 1. **Roundtrip Correctness**: decode(encode(data)) = data
//! 2. **Fault Tolerance**: any m erasures recover (hd-1 for XOR codes)
//! 3. **Reconstruction Fidelity**: rebuilt fragments are byte-identical
//! 4. **Geometry Determinism**: layout depends only on (N, k, alignment)

#![cfg(test)]

use proptest::prelude::*;

use crate::backend::{BackendId, CodingArgs};
use crate::checksum::ChecksumType;
use crate::engine::StripeEngine;
use crate::fragment::Fragment;
use crate::geometry;

// =============================================================================
// Strategies
// =============================================================================

/// MDS backends that recover from any m erasures.
fn mds_backend_strategy() -> impl Strategy<Value = BackendId> {
    prop_oneof![
        Just(BackendId::BuiltinRsVand),
        Just(BackendId::JerasureRsVand),
        Just(BackendId::JerasureRsCauchy),
    ]
}

/// Small k+m configurations: k in 2..=6, m in 1..=3.
fn ec_config_strategy() -> impl Strategy<Value = (usize, usize)> {
    (2usize..=6, 1usize..=3)
}

fn data_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..2048)
}

fn stripe_views(frags: &[Fragment], skip: &[usize]) -> Vec<Vec<u8>> {
    frags
        .iter()
        .enumerate()
        .filter(|(i, _)| !skip.contains(i))
        .map(|(_, f)| f.as_bytes().to_vec())
        .collect()
}

fn as_slices(views: &[Vec<u8>]) -> Vec<&[u8]> {
    views.iter().map(|v| v.as_slice()).collect()
}

// =============================================================================
// Roundtrip Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: encoding then decoding with every fragment present
    /// returns the original data.
    #[test]
    fn prop_roundtrip_no_loss(
        backend in mds_backend_strategy(),
        (k, m) in ec_config_strategy(),
        data in data_strategy(),
    ) {
        let engine = StripeEngine::new();
        let desc = engine.instance_create(backend, &CodingArgs {
            k, m, ..Default::default()
        })?;

        let stripe = engine.encode(desc, &data)?;
        prop_assert_eq!(stripe.total_fragments(), k + m);

        let frags: Vec<Fragment> = stripe.fragments().cloned().collect();
        let views = stripe_views(&frags, &[]);
        let recovered = engine.decode(desc, &as_slices(&views), true)?;
        prop_assert_eq!(recovered, data);
    }

    /// Property: any m erasures still decode to the original data.
    #[test]
    fn prop_roundtrip_any_m_erasures(
        backend in mds_backend_strategy(),
        (k, m) in ec_config_strategy(),
        data in data_strategy(),
        seed in any::<u64>(),
    ) {
        let engine = StripeEngine::new();
        let desc = engine.instance_create(backend, &CodingArgs {
            k, m, ..Default::default()
        })?;

        let stripe = engine.encode(desc, &data)?;
        let frags: Vec<Fragment> = stripe.fragments().cloned().collect();

        // deterministic pseudo-random erasure pattern of exactly m indices
        let mut skip = Vec::new();
        let mut state = seed;
        while skip.len() < m {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let idx = (state >> 33) as usize % (k + m);
            if !skip.contains(&idx) {
                skip.push(idx);
            }
        }

        let views = stripe_views(&frags, &skip);
        let recovered = engine.decode(desc, &as_slices(&views), true)?;
        prop_assert_eq!(recovered, data, "failed for erasures {:?}", skip);
    }

    /// Property: flat-XOR stripes with hd=3 survive any two erasures.
    #[test]
    fn prop_flat_xor_two_erasures(
        data in data_strategy(),
        a in 0usize..6,
        b in 0usize..6,
    ) {
        prop_assume!(a != b);

        let engine = StripeEngine::new();
        let desc = engine.instance_create(BackendId::FlatXorHd, &CodingArgs {
            k: 3, m: 3, hd: 3, ..Default::default()
        })?;

        let stripe = engine.encode(desc, &data)?;
        let frags: Vec<Fragment> = stripe.fragments().cloned().collect();
        let views = stripe_views(&frags, &[a, b]);
        let recovered = engine.decode(desc, &as_slices(&views), true)?;
        prop_assert_eq!(recovered, data, "failed for erasures {{{}, {}}}", a, b);
    }
}

// =============================================================================
// Reconstruction Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Property: a rebuilt fragment is byte-identical to the original,
    /// header included.
    #[test]
    fn prop_reconstruct_byte_identical(
        backend in mds_backend_strategy(),
        (k, m) in ec_config_strategy(),
        data in data_strategy(),
        target in any::<prop::sample::Index>(),
    ) {
        let engine = StripeEngine::new();
        let desc = engine.instance_create(backend, &CodingArgs {
            k, m, checksum: ChecksumType::Crc32, ..Default::default()
        })?;

        let stripe = engine.encode(desc, &data)?;
        let frags: Vec<Fragment> = stripe.fragments().cloned().collect();
        let dst = target.index(k + m);

        let views = stripe_views(&frags, &[dst]);
        let rebuilt = engine.reconstruct_fragment(desc, &as_slices(&views), dst)?;
        prop_assert_eq!(rebuilt.as_bytes(), frags[dst].as_bytes());
    }

    /// Property: the fragments reported by fragments_needed are
    /// sufficient to reconstruct the target.
    #[test]
    fn prop_fragments_needed_suffice(
        (k, m) in ec_config_strategy(),
        data in data_strategy(),
        target in any::<prop::sample::Index>(),
    ) {
        let engine = StripeEngine::new();
        let desc = engine.instance_create(BackendId::BuiltinRsVand, &CodingArgs {
            k, m, ..Default::default()
        })?;

        let stripe = engine.encode(desc, &data)?;
        let frags: Vec<Fragment> = stripe.fragments().cloned().collect();
        let dst = target.index(k + m);

        let needed = engine.fragments_needed(desc, &[dst], &[])?;
        prop_assert!(!needed.contains(&dst));

        let views: Vec<Vec<u8>> = needed
            .iter()
            .map(|&i| frags[i].as_bytes().to_vec())
            .collect();
        let rebuilt = engine.reconstruct_fragment(desc, &as_slices(&views), dst)?;
        prop_assert_eq!(rebuilt.as_bytes(), frags[dst].as_bytes());
    }
}

// =============================================================================
// Geometry Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Property: payload length is deterministic, aligned and covers the
    /// input.
    #[test]
    fn prop_geometry_covers_input(
        data_len in 1usize..1_000_000,
        k in 1usize..=16,
        element_bits in prop_oneof![Just(8u32), Just(16), Just(32), Just(256)],
        simd in prop_oneof![Just(None::<usize>), Just(Some(16usize)), Just(Some(32usize))],
    ) {
        let l = geometry::fragment_payload_len(data_len, k, element_bits, simd)?;
        let again = geometry::fragment_payload_len(data_len, k, element_bits, simd)?;
        prop_assert_eq!(l, again);

        // alignment
        let element_bytes = std::cmp::max(1, element_bits as usize / 8);
        prop_assert_eq!(l % element_bytes, 0);
        if let Some(s) = simd {
            prop_assert_eq!(l % s, 0);
        }

        // coverage
        prop_assert!(l * k >= data_len);
        let (start, end) = geometry::data_range(k - 1, l, data_len);
        prop_assert!(end == data_len || start >= data_len);
    }
}
