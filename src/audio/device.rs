//! Output device enumeration and lookup

use cpal::traits::{DeviceTrait, HostTrait};
use serde::Serialize;

use crate::error::AudioError;

/// Output device as listed to the user
#[derive(Debug, Clone, Serialize)]
pub struct OutputDeviceInfo {
    pub name: String,
    pub is_default: bool,
    pub sample_rates: Vec<u32>,
    pub channels: Vec<u16>,
}

/// Wrapper around cpal device
pub struct AudioDevice {
    inner: cpal::Device,
    pub name: String,
}

impl AudioDevice {
    pub fn from_cpal(device: cpal::Device) -> Self {
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        Self { inner: device, name }
    }

    pub fn into_inner(self) -> cpal::Device {
        self.inner
    }

    /// Get default output config
    pub fn default_output_config(&self) -> Result<cpal::SupportedStreamConfig, AudioError> {
        self.inner
            .default_output_config()
            .map_err(|e| AudioError::DeviceNotFound(e.to_string()))
    }
}

/// List all output devices of the default host
pub fn list_output_devices() -> Vec<OutputDeviceInfo> {
    let host = cpal::default_host();
    let default_name = host.default_output_device().and_then(|d| d.name().ok());

    let Ok(devices) = host.output_devices() else {
        return Vec::new();
    };

    devices
        .filter_map(|device| {
            let name = device.name().ok()?;
            let (sample_rates, channels) = device_capabilities(&device);
            Some(OutputDeviceInfo {
                is_default: default_name.as_ref() == Some(&name),
                name,
                sample_rates,
                channels,
            })
        })
        .collect()
}

fn device_capabilities(device: &cpal::Device) -> (Vec<u32>, Vec<u16>) {
    let mut sample_rates = Vec::new();
    let mut channels = Vec::new();

    if let Ok(configs) = device.supported_output_configs() {
        for config in configs {
            // Common sample rates
            for rate_val in [44100u32, 48000, 88200, 96000] {
                let rate = cpal::SampleRate(rate_val);
                if rate >= config.min_sample_rate()
                    && rate <= config.max_sample_rate()
                    && !sample_rates.contains(&rate_val)
                {
                    sample_rates.push(rate_val);
                }
            }
            if !channels.contains(&config.channels()) {
                channels.push(config.channels());
            }
        }
    }

    sample_rates.sort();
    channels.sort();
    (sample_rates, channels)
}

/// Output device by name, or the host default when `name` is `None`
pub fn find_output_device(name: Option<&str>) -> Result<AudioDevice, AudioError> {
    let host = cpal::default_host();

    let Some(name) = name else {
        return host
            .default_output_device()
            .map(AudioDevice::from_cpal)
            .ok_or_else(|| AudioError::DeviceNotFound("No default output device".to_string()));
    };

    let devices = host
        .output_devices()
        .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;

    for device in devices {
        if device.name().map(|n| n == name).unwrap_or(false) {
            return Ok(AudioDevice::from_cpal(device));
        }
    }

    Err(AudioError::DeviceNotFound(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_device_not_found() {
        // Holds with or without audio hardware
        let result = find_output_device(Some("no-such-device-7f3a"));
        assert!(matches!(result, Err(AudioError::DeviceNotFound(_))));
    }

    #[test]
    fn test_listing_is_consistent() {
        for device in list_output_devices() {
            assert!(device.channels.windows(2).all(|w| w[0] < w[1]));
            assert!(device.sample_rates.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
