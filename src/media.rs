//! Image formats, byte-signature probing, and collaborator seams.
//!
//! Pixel-level decoding and atlas blitting are external concerns. This module
//! defines the traits the loading pipeline consumes ([`MediaDecoder`],
//! [`AtlasBuilder`]), the data they exchange, and lightweight defaults: a
//! still-image probe backed by `imagesize` and a grid atlas layout that
//! computes frame rectangles without touching pixels.

use bytes::Bytes;

use crate::error::DecodeError;

/// Persisted/detected payload format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageFormat {
    #[default]
    Unknown,
    /// Still image in any container a still decoder accepts (png, jpg, ...).
    Bin,
    /// Animated GIF sequence.
    Gif,
    /// Reserved; decoding is not implemented and dispatch fails fast.
    Webp,
}

impl ImageFormat {
    /// Extensions probed on disk, in dispatch order.
    pub const PROBE_ORDER: [ImageFormat; 3] = [Self::Bin, Self::Gif, Self::Webp];

    pub fn extension(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Bin => "bin",
            Self::Gif => "gif",
            Self::Webp => "webp",
        }
    }
}

/// True if `bytes` starts with a GIF87a or GIF89a signature.
pub fn is_gif_signature(bytes: &[u8]) -> bool {
    matches!(bytes, [b'G', b'I', b'F', b'8', b'7' | b'9', b'a', ..])
}

/// True if `bytes` starts with a RIFF/WEBP container signature.
pub fn is_webp_signature(bytes: &[u8]) -> bool {
    bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP"
}

/// One decoded frame of an animated sequence. `delay` is in milliseconds.
#[derive(Debug, Clone)]
pub struct Frame {
    pub pixels: Bytes,
    pub delay: u32,
}

impl Frame {
    pub fn delay_seconds(&self) -> f32 {
        self.delay as f32 / 1000.0
    }
}

/// Ordered decoded animation with uniform frame dimensions.
#[derive(Debug, Clone)]
pub struct FrameSequence {
    pub frames: Vec<Frame>,
    pub width: u32,
    pub height: u32,
}

/// Dimensions of a decoded still image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StillImage {
    pub width: u32,
    pub height: u32,
}

/// Frame placement on an atlas surface.
///
/// `frame_rects` holds four values per frame: `x0, y0, x1, y1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtlasLayout {
    pub width: u32,
    pub height: u32,
    pub frame_width: u32,
    pub frame_height: u32,
    pub frame_rects: Vec<i32>,
}

impl AtlasLayout {
    pub fn frame_count(&self) -> usize {
        self.frame_rects.len() / 4
    }

    /// Reconstruct a layout from persisted frame rectangles. Returns `None`
    /// for an empty or malformed rect list.
    pub fn from_rects(frame_rects: Vec<i32>) -> Option<Self> {
        if frame_rects.is_empty() || frame_rects.len() % 4 != 0 {
            return None;
        }
        let frame_width = (frame_rects[2] - frame_rects[0]).max(0) as u32;
        let frame_height = (frame_rects[3] - frame_rects[1]).max(0) as u32;
        let mut width = 0i32;
        let mut height = 0i32;
        for rect in frame_rects.chunks_exact(4) {
            width = width.max(rect[2]);
            height = height.max(rect[3]);
        }
        Some(Self {
            width: width.max(0) as u32,
            height: height.max(0) as u32,
            frame_width,
            frame_height,
            frame_rects,
        })
    }
}

/// Decoder seam consumed by the loading pipeline.
pub trait MediaDecoder: Send + Sync {
    /// Signature check used to pick the animated branch for unknown formats.
    fn is_animated_signature(&self, bytes: &[u8]) -> bool {
        is_gif_signature(bytes)
    }

    /// Dimensions of a still image, without necessarily decoding pixels.
    fn decode_still(&self, bytes: &[u8]) -> Result<StillImage, DecodeError>;

    /// Decode an animated sequence. `max_frames == 0` means unbounded; the
    /// pipeline decimates afterwards, so implementations may return the full
    /// sequence.
    fn decode_frames(&self, bytes: &[u8], max_frames: usize) -> Result<FrameSequence, DecodeError>;
}

/// Atlas packing seam. Only the rectangle layout is consumed here; pixel
/// blitting belongs to the rendering layer.
pub trait AtlasBuilder: Send + Sync {
    fn build(
        &self,
        frame_count: usize,
        frame_width: u32,
        frame_height: u32,
        max_width: u32,
        padding: u32,
    ) -> Result<AtlasLayout, DecodeError>;
}

/// Default decoder: still-image dimensions via `imagesize`, no animation
/// support. Callers that cache GIFs inject a real decoder.
#[derive(Debug, Default)]
pub struct ProbeDecoder;

impl MediaDecoder for ProbeDecoder {
    fn decode_still(&self, bytes: &[u8]) -> Result<StillImage, DecodeError> {
        let size =
            imagesize::blob_size(bytes).map_err(|err| DecodeError::Malformed(err.to_string()))?;
        Ok(StillImage {
            width: size.width as u32,
            height: size.height as u32,
        })
    }

    fn decode_frames(&self, _bytes: &[u8], _max_frames: usize) -> Result<FrameSequence, DecodeError> {
        Err(DecodeError::Unsupported("gif"))
    }
}

/// Default atlas layout: frames packed row-major into a grid no wider than
/// `max_width`.
#[derive(Debug, Default)]
pub struct GridAtlasBuilder;

impl AtlasBuilder for GridAtlasBuilder {
    fn build(
        &self,
        frame_count: usize,
        frame_width: u32,
        frame_height: u32,
        max_width: u32,
        padding: u32,
    ) -> Result<AtlasLayout, DecodeError> {
        if frame_count == 0 {
            return Err(DecodeError::EmptyAnimation);
        }
        if frame_width == 0 || frame_height == 0 {
            return Err(DecodeError::Malformed("zero frame dimensions".into()));
        }
        let cell_w = frame_width + padding;
        let cell_h = frame_height + padding;
        let columns = (max_width / cell_w).max(1).min(frame_count as u32);
        let rows = (frame_count as u32).div_ceil(columns);

        let mut frame_rects = Vec::with_capacity(frame_count * 4);
        for index in 0..frame_count as u32 {
            let col = index % columns;
            let row = index / columns;
            let x0 = (col * cell_w) as i32;
            let y0 = (row * cell_h) as i32;
            frame_rects.extend_from_slice(&[
                x0,
                y0,
                x0 + frame_width as i32,
                y0 + frame_height as i32,
            ]);
        }

        Ok(AtlasLayout {
            width: columns * cell_w,
            height: rows * cell_h,
            frame_width,
            frame_height,
            frame_rects,
        })
    }
}
