//! Lock-free jitter buffer for one speaker's PCM
//!
//! Single producer (the inbound dispatch path) and single consumer (the
//! output device callback). Capacity is fixed; on overflow the oldest
//! samples are discarded so playback latency never exceeds the buffer
//! length.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use crossbeam::queue::ArrayQueue;

use crate::audio::AudioFormat;

/// Decode little-endian 16-bit PCM. A trailing odd byte is ignored.
pub fn pcm_samples(bytes: &[u8]) -> impl Iterator<Item = i16> + '_ {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
}

/// Encode samples as little-endian 16-bit PCM
pub fn samples_to_pcm(samples: &[i16]) -> Bytes {
    let mut out = BytesMut::with_capacity(samples.len() * 2);
    for sample in samples {
        out.put_i16_le(*sample);
    }
    out.freeze()
}

/// Bounded sample queue that drops oldest data on overflow
pub struct JitterBuffer {
    queue: ArrayQueue<i16>,
    discarded: AtomicUsize,
    underrun_count: AtomicUsize,
}

impl JitterBuffer {
    /// Create a buffer holding at most `capacity` samples
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            discarded: AtomicUsize::new(0),
            underrun_count: AtomicUsize::new(0),
        }
    }

    /// Create a buffer holding `duration` of audio at `format`
    pub fn for_duration(format: AudioFormat, duration: Duration) -> Self {
        Self::new(format.samples_for(duration))
    }

    /// Append a PCM chunk. Returns how many old samples were discarded.
    pub fn push_pcm(&self, bytes: &[u8]) -> usize {
        let mut dropped = 0;
        for sample in pcm_samples(bytes) {
            if self.queue.force_push(sample).is_some() {
                dropped += 1;
            }
        }
        if dropped > 0 {
            self.discarded.fetch_add(dropped, Ordering::Relaxed);
        }
        dropped
    }

    /// Pop one sample
    pub fn pop(&self) -> Option<i16> {
        self.queue.pop()
    }

    /// Fill `out` from the buffer, padding with silence.
    /// Returns the number of real samples written.
    pub fn fill(&self, out: &mut [i16]) -> usize {
        let mut written = 0;
        for slot in out.iter_mut() {
            match self.queue.pop() {
                Some(sample) => {
                    *slot = sample;
                    written += 1;
                }
                None => *slot = 0,
            }
        }
        if written < out.len() {
            self.record_underrun();
        }
        written
    }

    /// Note that a consumer ran out of data
    pub fn record_underrun(&self) {
        self.underrun_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn clear(&self) {
        while self.queue.pop().is_some() {}
    }

    /// Check if buffer is empty
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Get current buffer length in samples
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Get buffer capacity in samples
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Samples dropped to make room for newer audio
    pub fn discarded_count(&self) -> usize {
        self.discarded.load(Ordering::Relaxed)
    }

    /// Output callbacks that ran out of data
    pub fn underrun_count(&self) -> usize {
        self.underrun_count.load(Ordering::Relaxed)
    }
}

/// Thread-safe handle to a jitter buffer
pub type SharedJitterBuffer = Arc<JitterBuffer>;
