//! Per-resource cache entry: state machine, ownership, loading pipeline.
//!
//! An entry owns one resource's lifecycle: `Unloaded → Loading → {Loaded |
//! Error}`, then `Loaded → ToBeDisposed → Disposed` under eviction or an
//! explicit release. All pipeline faults are captured into the entry's error
//! slot; nothing escapes `request` as a Rust error.
//!
//! At most one fetch is ever in flight per entry: the pipeline runs under an
//! async in-flight mutex, so late callers suspend on the mutex and observe
//! the completed result instead of starting a duplicate fetch. Progress is
//! observable mid-flight through a watch channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::decimate::{Timed, decimate};
use crate::error::LoadError;
use crate::evict;
use crate::keys::CacheKey;
use crate::lock;
use crate::media::{AtlasLayout, Frame, ImageFormat, StillImage};
use crate::owner::{Owner, OwnerRef};
use crate::registry::Shared;
use crate::store::{DiskStore, Metadata};

/// Lifecycle states of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Unloaded,
    Loading,
    Loaded,
    ToBeDisposed,
    Disposed,
    Error,
}

/// Post-load memory pressure test.
///
/// When set, a successful `request` that leaves the total cache size above
/// the selected target triggers an eviction pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SizePressure {
    #[default]
    None,
    /// Evict until the total is at or below the full byte budget.
    MatchBudget,
    /// Evict until the total is at or below half the byte budget.
    MatchHalfBudget,
}

/// Options for one `request` call.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Optional namespace under the cache root, e.g. an application version.
    pub cache_subdir: String,
    pub pressure: SizePressure,
    /// Best-effort transport deadline. Not a cooperative cancellation: the
    /// pipeline itself runs to completion.
    pub timeout: Option<std::time::Duration>,
}

/// Decoded payload handle.
#[derive(Debug, Clone)]
pub enum Payload {
    Still(StillImage),
    Atlas {
        layout: AtlasLayout,
        delays: Vec<f32>,
    },
}

impl Payload {
    pub fn width(&self) -> u32 {
        match self {
            Self::Still(still) => still.width,
            Self::Atlas { layout, .. } => layout.frame_width,
        }
    }

    pub fn height(&self) -> u32 {
        match self {
            Self::Still(still) => still.height,
            Self::Atlas { layout, .. } => layout.frame_height,
        }
    }

    /// Memory footprint: surface dimensions at four bytes per pixel. For an
    /// atlas the surface is the packed sheet, not one frame.
    pub fn weight_bytes(&self) -> u64 {
        let (w, h) = match self {
            Self::Still(still) => (still.width, still.height),
            Self::Atlas { layout, .. } => (layout.width, layout.height),
        };
        u64::from(w) * u64::from(h) * 4
    }
}

/// One cached resource.
pub struct CacheEntry {
    url: String,
    key: CacheKey,
    max_frames: usize,
    shared: Arc<Shared>,
    state: RwLock<EntryState>,
    format: RwLock<ImageFormat>,
    payload: RwLock<Option<Payload>>,
    metadata: RwLock<Option<Metadata>>,
    error: RwLock<Option<LoadError>>,
    owners: Mutex<Vec<OwnerRef>>,
    in_flight: tokio::sync::Mutex<()>,
    /// Bumped when a load attempt finishes. Lets a caller queued on the
    /// in-flight mutex tell "the load I attached to just completed" apart
    /// from "this entry was already in a terminal state when I arrived".
    load_generation: AtomicU64,
    progress: watch::Sender<f32>,
}

impl CacheEntry {
    pub(crate) fn new(
        url: String,
        key: CacheKey,
        format: ImageFormat,
        max_frames: usize,
        shared: Arc<Shared>,
    ) -> Self {
        let (progress, _) = watch::channel(0.0);
        Self {
            url,
            key,
            max_frames,
            shared,
            state: RwLock::new(EntryState::Unloaded),
            format: RwLock::new(format),
            payload: RwLock::new(None),
            metadata: RwLock::new(None),
            error: RwLock::new(None),
            owners: Mutex::new(Vec::new()),
            in_flight: tokio::sync::Mutex::new(()),
            load_generation: AtomicU64::new(0),
            progress,
        }
    }

    // ========================================================================
    // Observers
    // ========================================================================

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn key(&self) -> CacheKey {
        self.key
    }

    pub fn state(&self) -> EntryState {
        *lock::read(&self.state, "entry.state")
    }

    pub fn format(&self) -> ImageFormat {
        *lock::read(&self.format, "entry.format")
    }

    pub fn error(&self) -> Option<LoadError> {
        lock::read(&self.error, "entry.error").clone()
    }

    pub fn payload(&self) -> Option<Payload> {
        lock::read(&self.payload, "entry.payload").clone()
    }

    pub fn metadata(&self) -> Option<Metadata> {
        lock::read(&self.metadata, "entry.metadata").clone()
    }

    pub fn width(&self) -> u32 {
        self.payload().map_or(0, |p| p.width())
    }

    pub fn height(&self) -> u32 {
        self.payload().map_or(0, |p| p.height())
    }

    pub fn horizontal_ratio(&self) -> f32 {
        match self.payload() {
            Some(p) if p.height() > 0 => p.width() as f32 / p.height() as f32,
            _ => 1.0,
        }
    }

    pub fn vertical_ratio(&self) -> f32 {
        match self.payload() {
            Some(p) if p.width() > 0 => p.height() as f32 / p.width() as f32,
            _ => 1.0,
        }
    }

    /// Per-frame delays in seconds; empty for still images.
    pub fn delays(&self) -> Vec<f32> {
        match self.payload() {
            Some(Payload::Atlas { delays, .. }) => delays,
            _ => Vec::new(),
        }
    }

    /// Frame rectangles on the atlas surface; empty for still images.
    pub fn frame_rects(&self) -> Vec<i32> {
        match self.payload() {
            Some(Payload::Atlas { layout, .. }) => layout.frame_rects,
            _ => Vec::new(),
        }
    }

    pub fn weight_bytes(&self) -> u64 {
        self.payload().map_or(0, |p| p.weight_bytes())
    }

    /// Count of live owners, pruning dead references as a side effect.
    pub fn use_count(&self) -> usize {
        let mut owners = lock::lock(&self.owners, "entry.use_count");
        owners.retain(OwnerRef::is_live);
        owners.len()
    }

    /// Load progress in `0.0..=1.0`, observable while a load is in flight.
    pub fn progress(&self) -> watch::Receiver<f32> {
        self.progress.subscribe()
    }

    // ========================================================================
    // Ownership
    // ========================================================================

    fn bind_owner(&self, owner: Option<&Owner>) {
        let mut owners = lock::lock(&self.owners, "entry.bind_owner");
        match owner {
            Some(owner) => {
                // Idempotent: re-binding an existing owner is a no-op.
                if !owners.iter().any(|r| r.id() == owner.id()) {
                    owners.push(owner.downgrade());
                }
            }
            None => owners.retain(OwnerRef::is_live),
        }
    }

    fn unbind_owner(&self, owner: Option<&Owner>) {
        let mut owners = lock::lock(&self.owners, "entry.unbind_owner");
        match owner {
            Some(owner) => owners.retain(|r| r.id() != owner.id()),
            None => owners.retain(OwnerRef::is_live),
        }
    }

    /// Unbind `owner` (or prune dead owners when `None`). With
    /// `dispose_if_unowned`, disposes synchronously once no live owner
    /// remains.
    pub fn release(&self, owner: Option<&Owner>, dispose_if_unowned: bool) {
        let unowned = {
            let mut owners = lock::lock(&self.owners, "entry.release");
            match owner {
                Some(owner) => owners.retain(|r| r.id() != owner.id()),
                None => owners.retain(OwnerRef::is_live),
            }
            owners.retain(OwnerRef::is_live);
            owners.is_empty()
        };
        if dispose_if_unowned && unowned {
            self.dispose();
        }
    }

    /// Prune owners whose tokens were dropped without a release.
    pub fn clear_invalid_owners(&self, dispose_if_unowned: bool) {
        self.release(None, dispose_if_unowned);
    }

    // ========================================================================
    // Request / loading pipeline
    // ========================================================================

    /// Load the resource, binding `owner` for the duration of its interest.
    ///
    /// Attaches to an in-flight load if one exists; otherwise dispatches the
    /// format-specific pipeline. On terminal error the caller's owner is
    /// unbound so a failed load never holds a phantom reference. A no-op on
    /// disposed entries.
    pub async fn request(&self, owner: Option<&Owner>, opts: &LoadOptions) {
        if self.state() == EntryState::Disposed {
            return;
        }
        self.bind_owner(owner);

        let generation = self.load_generation.load(Ordering::Acquire);
        {
            let _in_flight = self.in_flight.lock().await;
            match self.state() {
                EntryState::Loaded | EntryState::ToBeDisposed | EntryState::Disposed => {}
                // A bumped generation means this caller was queued behind an
                // in-flight load that just failed: observe that outcome, do
                // not start a duplicate fetch.
                EntryState::Error
                    if self.load_generation.load(Ordering::Acquire) != generation => {}
                // Unloaded, or Error from an earlier attempt: errored
                // entries are retryable by a fresh request.
                _ => {
                    self.set_state(EntryState::Loading);
                    *lock::write(&self.error, "entry.request.clear_error") = None;
                    let _ = self.progress.send(0.0);
                    if let Err(err) = self.dispatch(opts).await {
                        warn!(
                            url = %self.url,
                            code = err.code,
                            message = %err.message,
                            "Image load failed"
                        );
                        *lock::write(&self.error, "entry.request.set_error") = Some(err);
                        self.set_state(EntryState::Error);
                    }
                    self.load_generation.fetch_add(1, Ordering::AcqRel);
                }
            }
        }

        if self.state() == EntryState::Error {
            self.unbind_owner(owner);
        } else if opts.pressure != SizePressure::None {
            let target = match opts.pressure {
                SizePressure::MatchHalfBudget => self.shared.max_budget_bytes() / 2,
                _ => self.shared.max_budget_bytes(),
            };
            if self.shared.total_bytes() > target {
                evict::reclaim(&self.shared, opts.pressure.into());
            }
        }

        let _ = self.progress.send(1.0);
    }

    async fn dispatch(&self, opts: &LoadOptions) -> Result<(), LoadError> {
        let store = self
            .shared
            .store(&opts.cache_subdir)
            .map_err(|err| LoadError::unexpected(err.to_string()))?;
        match self.format() {
            ImageFormat::Unknown => self.load_unknown(&store, opts).await,
            ImageFormat::Bin => self.load_known(&store, opts, ImageFormat::Bin).await,
            ImageFormat::Gif => self.load_known(&store, opts, ImageFormat::Gif).await,
            ImageFormat::Webp => Err(self.unsupported_format()),
        }
    }

    fn unsupported_format(&self) -> LoadError {
        LoadError::decode(format!(
            "loading image format [{}] is not implemented",
            self.format().extension()
        ))
    }

    /// Unknown format: probe persisted payloads first, then fetch and sniff
    /// the body signature.
    async fn load_unknown(&self, store: &DiskStore, opts: &LoadOptions) -> Result<(), LoadError> {
        if let Some(found) = store.find_payload_format(self.key).await {
            self.set_format(found);
            return match found {
                ImageFormat::Webp => Err(self.unsupported_format()),
                known => self.load_known(store, opts, known).await,
            };
        }

        let _permit = self.shared.acquire_load_slot().await?;
        match self
            .shared
            .fetcher()
            .fetch(&self.url, None, opts.timeout)
            .await
        {
            crate::fetch::FetchOutcome::Fresh { body, etag } => {
                if self.shared.decoder.is_animated_signature(&body) {
                    self.set_format(ImageFormat::Gif);
                    self.complete_animated_from_body(store, &body, etag).await
                } else if let Ok(still) = self.shared.decoder.decode_still(&body) {
                    self.set_format(ImageFormat::Bin);
                    self.complete_still(store, still, &body, etag).await
                } else {
                    self.set_format(ImageFormat::Webp);
                    Err(self.unsupported_format())
                }
            }
            crate::fetch::FetchOutcome::NotModified => Err(LoadError::unexpected(format!(
                "not-modified response for url [{}] without a stored precondition",
                self.url
            ))),
            crate::fetch::FetchOutcome::Failed { code, message } => {
                Err(LoadError::transport(code, message))
            }
        }
    }

    /// Known still/animated format: conditional fetch against persisted
    /// metadata, falling back to the legacy etag sidecar, then to a plain
    /// fetch.
    async fn load_known(
        &self,
        store: &DiskStore,
        opts: &LoadOptions,
        format: ImageFormat,
    ) -> Result<(), LoadError> {
        let _permit = self.shared.acquire_load_slot().await?;

        let metadata = match store.read_metadata(self.key).await {
            Ok(meta) => meta,
            Err(err) => {
                warn!(url = %self.url, error = %err, "Ignoring unreadable cache metadata");
                None
            }
        };

        let etag = match &metadata {
            Some(meta) => meta.etag.clone().filter(|tag| !tag.is_empty()),
            None => store.read_etag_sidecar(self.key, format).await,
        };
        if let Some(meta) = metadata {
            *lock::write(&self.metadata, "entry.load_known.metadata") = Some(meta);
        }

        match etag {
            Some(tag) => {
                match self
                    .shared
                    .fetcher()
                    .fetch(&self.url, Some(&tag), opts.timeout)
                    .await
                {
                    crate::fetch::FetchOutcome::NotModified => {
                        debug!(url = %self.url, "Precondition held; loading payload from disk");
                        self.complete_from_disk(store).await
                    }
                    crate::fetch::FetchOutcome::Fresh { body, etag } => {
                        self.complete_fresh(store, format, &body, etag).await
                    }
                    crate::fetch::FetchOutcome::Failed { code, message } => {
                        Err(LoadError::transport(code, message))
                    }
                }
            }
            // Persisted payload without a usable etag loads straight from
            // disk; a cold entry fetches unconditionally.
            None if store.payload_exists(self.key).await => self.complete_from_disk(store).await,
            None => {
                match self
                    .shared
                    .fetcher()
                    .fetch(&self.url, None, opts.timeout)
                    .await
                {
                    crate::fetch::FetchOutcome::Fresh { body, etag } => {
                        self.complete_fresh(store, format, &body, etag).await
                    }
                    crate::fetch::FetchOutcome::NotModified => {
                        Err(LoadError::unexpected(format!(
                            "not-modified response for url [{}] without a stored precondition",
                            self.url
                        )))
                    }
                    crate::fetch::FetchOutcome::Failed { code, message } => {
                        Err(LoadError::transport(code, message))
                    }
                }
            }
        }
    }

    async fn complete_fresh(
        &self,
        store: &DiskStore,
        format: ImageFormat,
        body: &bytes::Bytes,
        etag: Option<String>,
    ) -> Result<(), LoadError> {
        match format {
            ImageFormat::Gif => self.complete_animated_from_body(store, body, etag).await,
            _ => {
                let still = self.shared.decoder.decode_still(body).map_err(|err| {
                    LoadError::decode(format!("decode error for url [{}]: {err}", self.url))
                })?;
                self.complete_still(store, still, body, etag).await
            }
        }
    }

    /// Rebuild the payload from persisted bytes and metadata without
    /// consuming any network payload. The persisted etag stays unchanged.
    async fn complete_from_disk(&self, store: &DiskStore) -> Result<(), LoadError> {
        let metadata = self.metadata();
        if let Some(meta) = &metadata {
            if meta.has_frames() {
                let layout = AtlasLayout::from_rects(meta.frame_rects.clone()).ok_or_else(|| {
                    LoadError::decode(format!(
                        "persisted frame layout for url [{}] is malformed",
                        self.url
                    ))
                })?;
                self.install_payload(Payload::Atlas {
                    layout,
                    delays: meta.delays.clone(),
                });
                return Ok(());
            }
        }

        let format = store.find_payload_format(self.key).await.ok_or_else(|| {
            LoadError::unexpected(format!("no persisted payload for url [{}]", self.url))
        })?;
        let body = store
            .read_payload(self.key, format)
            .await
            .map_err(|err| LoadError::unexpected(err.to_string()))?;

        if self.shared.decoder.is_animated_signature(&body) {
            // Animated payload persisted without frame metadata: decode and
            // regenerate the layout.
            let etag = metadata.and_then(|m| m.etag);
            return self.complete_animated_from_body(store, &body, etag).await;
        }
        let still = self.shared.decoder.decode_still(&body).map_err(|err| {
            LoadError::decode(format!("decode error for url [{}]: {err}", self.url))
        })?;
        self.install_payload(Payload::Still(still));
        Ok(())
    }

    async fn complete_still(
        &self,
        store: &DiskStore,
        still: StillImage,
        body: &[u8],
        etag: Option<String>,
    ) -> Result<(), LoadError> {
        let metadata = Metadata {
            etag,
            frame_rects: Vec::new(),
            delays: Vec::new(),
        };
        self.persist(store, ImageFormat::Bin, body, &metadata).await;
        *lock::write(&self.metadata, "entry.complete_still") = Some(metadata);
        self.install_payload(Payload::Still(still));
        Ok(())
    }

    async fn complete_animated_from_body(
        &self,
        store: &DiskStore,
        body: &bytes::Bytes,
        etag: Option<String>,
    ) -> Result<(), LoadError> {
        let decoded = self
            .shared
            .decoder
            .decode_frames(body, self.max_frames)
            .map_err(|err| {
                LoadError::decode(format!("animated decode error for url [{}]: {err}", self.url))
            })?;
        if decoded.frames.is_empty() {
            return Err(LoadError::decode(format!(
                "animated decode for url [{}] produced zero frames",
                self.url
            )));
        }

        let frames: Vec<Frame> = if self.max_frames > 0 && decoded.frames.len() > self.max_frames {
            let timed: Vec<Timed<bytes::Bytes>> = decoded
                .frames
                .into_iter()
                .map(|f| Timed::new(f.pixels, f.delay))
                .collect();
            decimate(&timed, self.max_frames)
                .into_iter()
                .map(|t| Frame {
                    pixels: t.value,
                    delay: t.delay,
                })
                .collect()
        } else {
            decoded.frames
        };

        let layout = self
            .shared
            .atlas
            .build(
                frames.len(),
                decoded.width,
                decoded.height,
                self.shared.config.atlas_max_width,
                self.shared.config.atlas_padding_clamped(),
            )
            .map_err(|err| {
                LoadError::decode(format!("atlas layout error for url [{}]: {err}", self.url))
            })?;

        let delays: Vec<f32> = frames.iter().map(Frame::delay_seconds).collect();
        let mut metadata = Metadata {
            etag,
            frame_rects: layout.frame_rects.clone(),
            delays: Vec::new(),
        };
        metadata.set_delays(delays.clone());

        self.persist(store, ImageFormat::Gif, body, &metadata).await;
        *lock::write(&self.metadata, "entry.complete_animated") = Some(metadata);
        self.install_payload(Payload::Atlas { layout, delays });
        Ok(())
    }

    /// Persist payload and metadata. Persistence failures degrade the entry
    /// to memory-only for this load; they never fail it.
    async fn persist(
        &self,
        store: &DiskStore,
        format: ImageFormat,
        body: &[u8],
        metadata: &Metadata,
    ) {
        if let Err(err) = store.write_payload(self.key, format, body).await {
            warn!(url = %self.url, error = %err, "Failed to persist cache payload");
            return;
        }
        if let Err(err) = store.write_metadata(self.key, metadata).await {
            warn!(url = %self.url, error = %err, "Failed to persist cache metadata");
        }
    }

    fn install_payload(&self, payload: Payload) {
        let weight = payload.weight_bytes();
        *lock::write(&self.payload, "entry.install_payload") = Some(payload);
        self.set_state(EntryState::Loaded);
        // Exactly once per successful load: the pipeline only runs while the
        // entry is not Loaded, under the in-flight mutex.
        self.shared.add_loaded_bytes(weight);
    }

    // ========================================================================
    // Disposal
    // ========================================================================

    pub(crate) fn mark_for_disposal(&self) {
        self.set_state(EntryState::ToBeDisposed);
    }

    /// Free the payload, subtract its weight, and remove the entry from the
    /// registry. Only `Loaded` and `ToBeDisposed` entries can be disposed;
    /// anything else logs and is a no-op. Subsequent lookups for the same
    /// key create a fresh entry.
    pub fn dispose(&self) {
        let state = self.state();
        if state != EntryState::Loaded && state != EntryState::ToBeDisposed {
            warn!(url = %self.url, state = ?state, "Cannot dispose an entry in this state");
            return;
        }

        let removed = self
            .shared
            .entries
            .get(&self.key.provider_key)
            .is_some_and(|inner| inner.remove(&self.key.file_key).is_some());
        if !removed {
            warn!(url = %self.url, key = %self.key, "Entry missing from registry during disposal");
            return;
        }

        let weight = self.weight_bytes();
        self.set_state(EntryState::Disposed);
        *lock::write(&self.payload, "entry.dispose.payload") = None;
        if weight > 0 {
            self.shared.sub_loaded_bytes(weight);
        }
        debug!(url = %self.url, weight, "Disposed cache entry");
    }

    fn set_state(&self, state: EntryState) {
        *lock::write(&self.state, "entry.set_state") = state;
    }

    fn set_format(&self, format: ImageFormat) {
        *lock::write(&self.format, "entry.set_format") = format;
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("url", &self.url)
            .field("key", &self.key)
            .field("state", &self.state())
            .field("format", &self.format())
            .finish_non_exhaustive()
    }
}
