//! Shared fakes for cache integration tests: a scripted transport and a
//! text-protocol decoder, so scenarios run without network or codecs.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use affresco::{
    DecodeError, Frame, FrameSequence, MediaDecoder, StillImage, Transport, TransportError,
    TransportResponse,
};
use async_trait::async_trait;
use bytes::Bytes;

/// One scripted reply for a url.
pub enum Scripted {
    Ok {
        status: u16,
        etag: Option<String>,
        body: Vec<u8>,
    },
    Err(String),
}

/// Transport fake that replays scripted responses per url, records every
/// call, and tracks peak concurrency.
#[derive(Default)]
pub struct ScriptedTransport {
    responses: Mutex<HashMap<String, VecDeque<Scripted>>>,
    calls: Mutex<Vec<(String, Option<String>)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    pub delay: Option<Duration>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn script(&self, url: &str, reply: Scripted) {
        self.responses
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn script_ok(&self, url: &str, status: u16, etag: Option<&str>, body: &[u8]) {
        self.script(
            url,
            Scripted::Ok {
                status,
                etag: etag.map(str::to_owned),
                body: body.to_vec(),
            },
        );
    }

    /// `(url, etag)` pairs, one per transport call, in order.
    pub fn calls(&self) -> Vec<(String, Option<String>)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn get(
        &self,
        url: &str,
        etag: Option<&str>,
        _timeout: Option<Duration>,
    ) -> Result<TransportResponse, TransportError> {
        self.calls
            .lock()
            .unwrap()
            .push((url.to_string(), etag.map(str::to_owned)));

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let reply = self
            .responses
            .lock()
            .unwrap()
            .get_mut(url)
            .and_then(VecDeque::pop_front);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match reply {
            Some(Scripted::Ok { status, etag, body }) => Ok(TransportResponse {
                status,
                etag,
                body: Bytes::from(body),
            }),
            Some(Scripted::Err(message)) => Err(TransportError::Other(message)),
            None => Ok(TransportResponse {
                status: 404,
                etag: None,
                body: Bytes::new(),
            }),
        }
    }
}

/// Text-protocol payloads: `STILL <w> <h>` for stills, `ANIM <w> <h> <d>...`
/// for one frame per delay (milliseconds).
pub fn still_body(width: u32, height: u32) -> Vec<u8> {
    format!("STILL {width} {height}").into_bytes()
}

pub fn anim_body(width: u32, height: u32, delays: &[u32]) -> Vec<u8> {
    let mut text = format!("ANIM {width} {height}");
    for delay in delays {
        text.push_str(&format!(" {delay}"));
    }
    text.into_bytes()
}

/// Decoder fake for the text protocol above.
#[derive(Default)]
pub struct TextDecoder;

impl TextDecoder {
    fn parse(bytes: &[u8]) -> Option<Vec<String>> {
        let text = std::str::from_utf8(bytes).ok()?;
        Some(text.split_whitespace().map(str::to_owned).collect())
    }
}

impl MediaDecoder for TextDecoder {
    fn is_animated_signature(&self, bytes: &[u8]) -> bool {
        bytes.starts_with(b"ANIM")
    }

    fn decode_still(&self, bytes: &[u8]) -> Result<StillImage, DecodeError> {
        let parts = Self::parse(bytes)
            .filter(|p| p.len() == 3 && p[0] == "STILL")
            .ok_or_else(|| DecodeError::Malformed("not a STILL payload".into()))?;
        let width = parts[1]
            .parse()
            .map_err(|_| DecodeError::Malformed("bad width".into()))?;
        let height = parts[2]
            .parse()
            .map_err(|_| DecodeError::Malformed("bad height".into()))?;
        Ok(StillImage { width, height })
    }

    fn decode_frames(&self, bytes: &[u8], _max_frames: usize) -> Result<FrameSequence, DecodeError> {
        let parts = Self::parse(bytes)
            .filter(|p| p.len() >= 3 && p[0] == "ANIM")
            .ok_or_else(|| DecodeError::Malformed("not an ANIM payload".into()))?;
        let width: u32 = parts[1]
            .parse()
            .map_err(|_| DecodeError::Malformed("bad width".into()))?;
        let height: u32 = parts[2]
            .parse()
            .map_err(|_| DecodeError::Malformed("bad height".into()))?;
        let frames = parts[3..]
            .iter()
            .map(|delay| {
                delay
                    .parse()
                    .map(|delay| Frame {
                        pixels: Bytes::new(),
                        delay,
                    })
                    .map_err(|_| DecodeError::Malformed("bad delay".into()))
            })
            .collect::<Result<Vec<Frame>, DecodeError>>()?;
        Ok(FrameSequence {
            frames,
            width,
            height,
        })
    }
}
