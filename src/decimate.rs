//! Frame decimation for long animated sequences.
//!
//! Reduces a sequence to at most `target` frames while redistributing the
//! skipped frames' delays onto the following kept frame, so total displayed
//! duration is approximately preserved. The redistribution per merge point is
//! capped by a minimum-delay floor, so the approximation is lossy by a
//! bounded amount, not exact.

/// Floor (in delay units, milliseconds) applied when folding skipped delays
/// into a kept frame.
pub const MIN_DELAY_FOLD: u32 = 12;

/// A frame payload with its display delay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timed<T> {
    pub value: T,
    pub delay: u32,
}

impl<T> Timed<T> {
    pub fn new(value: T, delay: u32) -> Self {
        Self { value, delay }
    }
}

/// Reduce `frames` to at most `target` frames.
///
/// The first and last source frames are always kept verbatim, so a `target`
/// of 1 still yields two frames. In between, a running step counter walks
/// the sequence with step size `(n - 2) / target`; skipped delays accumulate
/// and fold (capped at [`MIN_DELAY_FOLD`]) into the next kept frame. Returns
/// the input unchanged when `target` is zero or not smaller than the
/// sequence.
pub fn decimate<T: Clone>(frames: &[Timed<T>], target: usize) -> Vec<Timed<T>> {
    let n = frames.len();
    if target == 0 || target >= n {
        return frames.to_vec();
    }

    let count = n.min(target);
    let step = (n.saturating_sub(2)) as f32 / target as f32;
    let mut kept = vec![frames[0].clone()];
    let mut k = 0u32;
    let mut emitted = 1usize;
    let mut skipped_delay = 0u32;

    for frame in frames {
        if k as f32 >= step {
            let mut keep = frame.clone();
            keep.delay += skipped_delay.min(MIN_DELAY_FOLD);
            kept.push(keep);
            k = 0;
            emitted += 1;
            skipped_delay = 0;
            if emitted >= count {
                break;
            }
        } else {
            skipped_delay += frame.delay;
        }
        k += 1;
    }

    // Exact endpoint preservation: the final slot is always the true last
    // source frame.
    if let Some(last) = kept.last_mut() {
        *last = frames[n - 1].clone();
    }
    kept
}
