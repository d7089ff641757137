//! Audio subsystem module

pub mod buffer;
pub mod capture;
pub mod device;
pub mod playback;

pub use buffer::JitterBuffer;
pub use capture::AudioCaptureSource;
pub use device::{list_devices, AudioDeviceInfo, DeviceSelector};
pub use playback::{AudioOutcome, PlaybackMultiplexer};

use std::time::Duration;

use crate::constants::{DEFAULT_CHANNELS, DEFAULT_SAMPLE_RATE};

/// PCM stream format. Samples are always signed 16-bit little endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    /// 16 kHz / 16-bit / mono
    pub fn speech() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
        }
    }

    /// Number of interleaved samples covering `duration`
    pub fn samples_for(&self, duration: Duration) -> usize {
        let per_second = u128::from(self.sample_rate) * u128::from(self.channels);
        (per_second * duration.as_millis() / 1000) as usize
    }

    /// Bytes per second of PCM at this format
    pub fn byte_rate(&self) -> u32 {
        self.sample_rate * u32::from(self.channels) * 2
    }

    pub fn stream_config(&self) -> cpal::StreamConfig {
        cpal::StreamConfig {
            channels: self.channels,
            sample_rate: cpal::SampleRate(self.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        }
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::speech()
    }
}
