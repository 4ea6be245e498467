//! Persisted payload and metadata storage.
//!
//! Layout per cache root (optionally namespaced by a sub-directory, e.g. to
//! separate application versions):
//!
//! ```text
//! <base>[/<subdir>]/webimages/<provider_key>/<file_key>.bin|gif|webp
//!                             /<provider_key>/<file_key>.meta
//!                             /<provider_key>/<file_key>.etag
//! ```
//!
//! `.meta` is a little-endian binary record of the entity tag and the frame
//! layout; `.etag` is a plain-text legacy sidecar consulted when no `.meta`
//! exists. Presence queries are gated on the provider directory existing.

use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::fs;
use tracing::debug;

use crate::error::StoreError;
use crate::keys::CacheKey;
use crate::media::ImageFormat;

const CACHE_DIR_NAME: &str = "webimages";

/// Per-frame delay (seconds) substituted when delay data is missing or does
/// not match the frame count.
pub const DEFAULT_FRAME_DELAY_SECONDS: f32 = 0.012;

/// Persisted resource metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    pub etag: Option<String>,
    /// Four values per frame: `x0, y0, x1, y1`. Empty for still images.
    pub frame_rects: Vec<i32>,
    /// One delay (seconds) per frame. `delays.len() == frame_rects.len() / 4`
    /// whenever frames are present, empty otherwise.
    pub delays: Vec<f32>,
}

impl Metadata {
    pub fn has_frames(&self) -> bool {
        !self.frame_rects.is_empty()
    }

    /// Install per-frame delays, enforcing the `rects/4` invariant: a
    /// mismatched or empty list is replaced by the default delay per frame,
    /// and a frameless record always carries an empty list.
    pub fn set_delays(&mut self, delays: Vec<f32>) {
        if !self.has_frames() {
            self.delays = Vec::new();
            return;
        }
        let count = self.frame_rects.len() / 4;
        self.delays = if delays.len() == count {
            delays
        } else {
            vec![DEFAULT_FRAME_DELAY_SECONDS; count]
        };
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        let etag = self.etag.as_deref().unwrap_or_default();
        buf.put_u32_le(etag.len() as u32);
        buf.put_slice(etag.as_bytes());
        buf.put_u32_le(self.frame_rects.len() as u32);
        for value in &self.frame_rects {
            buf.put_i32_le(*value);
        }
        for delay in &self.delays {
            buf.put_f32_le(*delay);
        }
        buf.freeze()
    }

    pub fn decode(mut bytes: &[u8]) -> Result<Self, StoreError> {
        let corrupt = |what: &str| StoreError::CorruptMetadata(what.to_string());

        if bytes.remaining() < 4 {
            return Err(corrupt("truncated etag length"));
        }
        let etag_len = bytes.get_u32_le() as usize;
        if bytes.remaining() < etag_len {
            return Err(corrupt("truncated etag"));
        }
        let etag_bytes = bytes.copy_to_bytes(etag_len);
        let etag = match std::str::from_utf8(&etag_bytes) {
            Ok("") => None,
            Ok(tag) => Some(tag.to_string()),
            Err(_) => return Err(corrupt("etag is not valid utf-8")),
        };

        if bytes.remaining() < 4 {
            return Err(corrupt("truncated rect count"));
        }
        let rect_values = bytes.get_u32_le() as usize;
        if rect_values % 4 != 0 {
            return Err(corrupt("rect count is not a multiple of four"));
        }
        if bytes.remaining() < rect_values * 4 {
            return Err(corrupt("truncated frame rects"));
        }
        let mut frame_rects = Vec::with_capacity(rect_values);
        for _ in 0..rect_values {
            frame_rects.push(bytes.get_i32_le());
        }

        let delay_count = rect_values / 4;
        if bytes.remaining() < delay_count * 4 {
            return Err(corrupt("truncated delays"));
        }
        let mut delays = Vec::with_capacity(delay_count);
        for _ in 0..delay_count {
            delays.push(bytes.get_f32_le());
        }

        Ok(Self {
            etag,
            frame_rects,
            delays,
        })
    }
}

/// Filesystem-backed blob store for one cache root and namespace.
#[derive(Debug, Clone)]
pub struct DiskStore {
    dir: PathBuf,
}

impl DiskStore {
    /// Root the store at `base[/subdir]/webimages`. The sub-directory must be
    /// a single plain path component.
    pub fn new(base: &Path, subdir: &str) -> Result<Self, StoreError> {
        if subdir.contains(['/', '\\']) || subdir == ".." {
            return Err(StoreError::InvalidPath);
        }
        let dir = if subdir.is_empty() {
            base.join(CACHE_DIR_NAME)
        } else {
            base.join(subdir).join(CACHE_DIR_NAME)
        };
        Ok(Self { dir })
    }

    /// The resolved cache directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn provider_dir(&self, key: CacheKey) -> PathBuf {
        self.dir.join(key.provider_key.to_string())
    }

    fn file_stem(&self, key: CacheKey) -> PathBuf {
        self.provider_dir(key).join(key.file_key.to_string())
    }

    fn payload_path(&self, key: CacheKey, format: ImageFormat) -> PathBuf {
        self.file_stem(key).with_extension(format.extension())
    }

    async fn provider_dir_exists(&self, key: CacheKey) -> bool {
        fs::try_exists(self.provider_dir(key)).await.unwrap_or(false)
    }

    pub async fn write_payload(
        &self,
        key: CacheKey,
        format: ImageFormat,
        bytes: &[u8],
    ) -> Result<(), StoreError> {
        fs::create_dir_all(self.provider_dir(key)).await?;
        fs::write(self.payload_path(key, format), bytes).await?;
        Ok(())
    }

    pub async fn read_payload(
        &self,
        key: CacheKey,
        format: ImageFormat,
    ) -> Result<Bytes, StoreError> {
        let data = fs::read(self.payload_path(key, format)).await?;
        Ok(Bytes::from(data))
    }

    /// Probe the known payload extensions in dispatch order and return the
    /// first format with a persisted file.
    pub async fn find_payload_format(&self, key: CacheKey) -> Option<ImageFormat> {
        if !self.provider_dir_exists(key).await {
            return None;
        }
        for format in ImageFormat::PROBE_ORDER {
            if fs::try_exists(self.payload_path(key, format))
                .await
                .unwrap_or(false)
            {
                return Some(format);
            }
        }
        None
    }

    pub async fn payload_exists(&self, key: CacheKey) -> bool {
        self.find_payload_format(key).await.is_some()
    }

    pub async fn write_metadata(&self, key: CacheKey, metadata: &Metadata) -> Result<(), StoreError> {
        fs::create_dir_all(self.provider_dir(key)).await?;
        fs::write(self.file_stem(key).with_extension("meta"), metadata.encode()).await?;
        Ok(())
    }

    /// Read persisted metadata, if any. A missing provider directory or
    /// `.meta` file is `None`; a corrupt record is an error the caller may
    /// choose to treat as absent.
    pub async fn read_metadata(&self, key: CacheKey) -> Result<Option<Metadata>, StoreError> {
        if !self.provider_dir_exists(key).await {
            return Ok(None);
        }
        let path = self.file_stem(key).with_extension("meta");
        match fs::read(&path).await {
            Ok(bytes) => Metadata::decode(&bytes).map(Some),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::Io(err)),
        }
    }

    /// Legacy plain-text etag sidecar, honored only when the payload file it
    /// describes also exists.
    pub async fn read_etag_sidecar(&self, key: CacheKey, format: ImageFormat) -> Option<String> {
        let payload = self.payload_path(key, format);
        if !fs::try_exists(&payload).await.unwrap_or(false) {
            return None;
        }
        fs::read_to_string(self.file_stem(key).with_extension("etag"))
            .await
            .ok()
    }

    pub async fn write_etag_sidecar(&self, key: CacheKey, etag: &str) -> Result<(), StoreError> {
        fs::create_dir_all(self.provider_dir(key)).await?;
        fs::write(self.file_stem(key).with_extension("etag"), etag).await?;
        Ok(())
    }

    /// Remove the whole cache directory. Missing directory is success.
    pub async fn delete_all(&self) -> Result<(), StoreError> {
        match fs::remove_dir_all(&self.dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::Io(err)),
        }
    }

    /// Remove every persisted file for one provider.
    pub async fn delete_for_provider(&self, provider_key: u64) -> Result<(), StoreError> {
        let path = self.dir.join(provider_key.to_string());
        match fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::Io(err)),
        }
    }

    /// Remove the persisted payload and sidecars for one key. Missing files
    /// are success.
    pub async fn delete_for_key(&self, key: CacheKey) -> Result<(), StoreError> {
        if !self.provider_dir_exists(key).await {
            return Ok(());
        }
        for format in ImageFormat::PROBE_ORDER {
            let path = self.payload_path(key, format);
            if fs::try_exists(&path).await.unwrap_or(false) {
                fs::remove_file(&path).await?;
                break;
            }
        }
        for extension in ["etag", "meta"] {
            let path = self.file_stem(key).with_extension(extension);
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(StoreError::Io(err)),
            }
        }
        debug!(key = %key, "Deleted persisted cache files");
        Ok(())
    }
}
