//! Affresco
//!
//! A memory-bounded, deduplicating client-side cache for network-fetched
//! images and animations:
//!
//! - **Registry**: one shared [`CacheService`] maps urls to entries; all
//!   consumers of the same url converge on the same [`CacheEntry`].
//! - **Lifecycle**: each entry runs `Unloaded → Loading → {Loaded | Error}`
//!   with at most one fetch in flight per key, conditional revalidation
//!   against persisted etags, and a disk-first reload path.
//! - **Budget**: loaded payloads are weighed in bytes and evicted on demand
//!   by policy once the configured budget is exceeded.
//!
//! ## Configuration
//!
//! Cache behavior is controlled by [`CacheConfig`], deserializable from any
//! serde source:
//!
//! ```toml
//! [cache]
//! max_cache_bytes = 5242880
//! budget_mode = "value"
//! max_concurrent_loads = 20
//! # ... see config.rs for all options
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use affresco::{CacheService, CacheConfig, EntryParams, LoadOptions, Owner};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let cache = CacheService::new(CacheConfig::default(), "/tmp/app-cache")?;
//! let owner = Owner::new();
//! if let Some(entry) = cache.lookup_or_create(
//!     "https://cdn.example.com/img/logo.png",
//!     EntryParams::default(),
//! ) {
//!     entry.request(Some(&owner), &LoadOptions::default()).await;
//!     println!("{}x{}", entry.width(), entry.height());
//!     entry.release(Some(&owner), true);
//! }
//! # Ok(())
//! # }
//! ```

mod config;
mod decimate;
mod entry;
mod error;
mod evict;
mod fetch;
mod keys;
mod lock;
mod media;
mod owner;
mod registry;
mod store;

pub use config::{BudgetMode, CacheConfig, CONCURRENT_LOADS_CEILING};
pub use decimate::{MIN_DELAY_FOLD, Timed, decimate};
pub use entry::{CacheEntry, EntryState, LoadOptions, Payload, SizePressure};
pub use error::{CODE_DECODE, CODE_UNEXPECTED, DecodeError, LoadError, StoreError, TransportError};
pub use evict::EvictionPolicy;
pub use fetch::{ConditionalFetch, FetchOutcome, HttpTransport, Transport, TransportResponse};
pub use keys::CacheKey;
pub use media::{
    AtlasBuilder, AtlasLayout, Frame, FrameSequence, GridAtlasBuilder, ImageFormat, MediaDecoder,
    ProbeDecoder, StillImage, is_gif_signature, is_webp_signature,
};
pub use owner::Owner;
pub use registry::{CacheService, EntryParams};
pub use store::{DEFAULT_FRAME_DELAY_SECONDS, Metadata};
