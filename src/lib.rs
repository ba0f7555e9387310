//! stripecode - Uniform Erasure Coding over Pluggable Backends
//!
//! A fragment stripe engine: given a buffer and coding parameters
//! (k, m, w, hd, checksum type) it produces k + m self-describing
//! fragments such that any sufficient subset reconstructs the original
//! data, a single lost fragment can be rebuilt in isolation, and every
//! fragment carries enough metadata to be validated on its own.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         Stripe Engine                            │
//! │     encode / decode / reconstruct / fragments_needed             │
//! ├──────────────┬───────────────┬───────────────┬───────────────────┤
//! │   Fragment   │    Stripe     │   Checksum    │     Verifier      │
//! │    Codec     │   Geometry    │    Service    │                   │
//! ├──────────────┴───────────────┴───────────────┴───────────────────┤
//! │                  Backend Registry & Dispatch                     │
//! │   null │ jerasure_rs_* │ flat_xor_hd │ isa_l_rs_vand │ shss │ …  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`backend`] - Backend capability trait, descriptors and registry
//! - [`checksum`] - Payload checksum service (none / CRC32)
//! - [`engine`] - Stripe engine: instance table and the operation surface
//! - [`error`] - Error taxonomy with stable numeric codes
//! - [`fragment`] - Fragment envelope wire format
//! - [`geometry`] - Input-to-fragment layout mathematics
//! - [`verify`] - Stripe and fragment verification
//!
//! # Example
//!
//! ```rust
//! use stripecode::{BackendId, CodingArgs, StripeEngine};
//!
//! let engine = StripeEngine::new();
//! let desc = engine.instance_create(
//!     BackendId::BuiltinRsVand,
//!     &CodingArgs { k: 4, m: 2, ..Default::default() },
//! )?;
//!
//! let stripe = engine.encode(desc, b"some application data")?;
//!
//! // lose up to m fragments and still decode
//! let survivors: Vec<&[u8]> = stripe
//!     .fragments()
//!     .skip(2)
//!     .map(|f| f.as_bytes())
//!     .collect();
//! let recovered = engine.decode(desc, &survivors, true)?;
//! assert_eq!(recovered, b"some application data");
//! # stripecode::Result::Ok(())
//! ```

pub mod backend;
pub mod checksum;
pub mod engine;
pub mod error;
pub mod fragment;
pub mod geometry;
pub mod verify;

#[cfg(test)]
mod props;

// Re-export the operation surface
pub use backend::{BackendCodec, BackendDescriptor, BackendId, CodingArgs};
pub use checksum::ChecksumType;
pub use engine::{EncodedStripe, InstanceDesc, StripeEngine};
pub use error::{Error, Result};
pub use fragment::{
    library_version, parse as get_fragment_metadata, Fragment, FragmentMetadata,
    FRAGMENT_HEADER_SIZE, FRAGMENT_MAGIC,
};
