//! Audio device enumeration and selection

use cpal::traits::{DeviceTrait, HostTrait};
use serde::{Deserialize, Serialize};

/// How the UI picks a capture or playback device
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceSelector {
    /// Host default device
    #[default]
    Default,
    /// Position in the host's device list for that direction
    Index(usize),
    /// Exact device name
    Name(String),
}

/// Device description for selection UIs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioDeviceInfo {
    /// Position within its direction's list, usable with [`DeviceSelector::Index`]
    pub index: usize,
    pub name: String,
    pub is_input: bool,
    pub is_default: bool,
    pub sample_rates: Vec<u32>,
    pub channels: Vec<u16>,
}

/// Stream direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

/// List all available audio devices, inputs first
pub fn list_devices() -> Vec<AudioDeviceInfo> {
    let mut devices = list_direction(Direction::Input);
    devices.extend(list_direction(Direction::Output));
    devices
}

/// List devices for one direction in host order
pub fn list_direction(direction: Direction) -> Vec<AudioDeviceInfo> {
    let host = cpal::default_host();
    let default_name = default_device(&host, direction).and_then(|d| d.name().ok());

    let devices = match devices_for(&host, direction) {
        Ok(devices) => devices,
        Err(e) => {
            tracing::warn!("Failed to enumerate {:?} devices: {}", direction, e);
            return Vec::new();
        }
    };

    devices
        .enumerate()
        .filter_map(|(index, device)| {
            let name = device.name().ok()?;
            let (sample_rates, channels) = get_device_capabilities(&device, direction);
            Some(AudioDeviceInfo {
                index,
                is_default: default_name.as_ref() == Some(&name),
                name,
                is_input: direction == Direction::Input,
                sample_rates,
                channels,
            })
        })
        .collect()
}

type DeviceIter = Box<dyn Iterator<Item = cpal::Device>>;

fn devices_for(host: &cpal::Host, direction: Direction) -> Result<DeviceIter, cpal::DevicesError> {
    let devices: DeviceIter = match direction {
        Direction::Input => Box::new(host.input_devices()?),
        Direction::Output => Box::new(host.output_devices()?),
    };
    Ok(devices)
}

fn default_device(host: &cpal::Host, direction: Direction) -> Option<cpal::Device> {
    match direction {
        Direction::Input => host.default_input_device(),
        Direction::Output => host.default_output_device(),
    }
}

/// Get device capabilities
fn get_device_capabilities(device: &cpal::Device, direction: Direction) -> (Vec<u32>, Vec<u16>) {
    let configs: Vec<cpal::SupportedStreamConfigRange> = match direction {
        Direction::Input => device.supported_input_configs().map(|c| c.collect()),
        Direction::Output => device.supported_output_configs().map(|c| c.collect()),
    }
    .unwrap_or_default();

    let mut sample_rates = Vec::new();
    let mut channels = Vec::new();

    for config in configs {
        // Common sample rates
        for rate_val in [8000u32, 16000, 22050, 44100, 48000, 96000] {
            let rate = cpal::SampleRate(rate_val);
            if rate >= config.min_sample_rate()
                && rate <= config.max_sample_rate()
                && !sample_rates.contains(&rate_val)
            {
                sample_rates.push(rate_val);
            }
        }

        let ch = config.channels();
        if !channels.contains(&ch) {
            channels.push(ch);
        }
    }

    sample_rates.sort();
    channels.sort();

    (sample_rates, channels)
}

/// Resolve a selector to a device, `None` if nothing matches
pub fn select_device(selector: &DeviceSelector, direction: Direction) -> Option<cpal::Device> {
    let host = cpal::default_host();

    if let DeviceSelector::Default = selector {
        return default_device(&host, direction);
    }

    let mut devices = devices_for(&host, direction).ok()?;

    match selector {
        DeviceSelector::Index(index) => devices.nth(*index),
        DeviceSelector::Name(name) => {
            devices.find(|device| device.name().map(|n| &n == name).unwrap_or(false))
        }
        DeviceSelector::Default => None,
    }
}

impl std::fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceSelector::Default => f.write_str("default device"),
            DeviceSelector::Index(index) => write!(f, "device #{}", index),
            DeviceSelector::Name(name) => write!(f, "device \"{}\"", name),
        }
    }
}
