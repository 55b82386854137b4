//! # Audio Device Detection and Selection
//!
//! Finds the microphone and speaker to use and picks a stream configuration
//! that is as close as possible to the rates the pipelines want.
//!
//! Devices are never cached: a cpal device handle is not `Send` on every
//! platform, so each pipeline looks its device up on its own thread.

use crate::error::{AppError, AppResult};
use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{SampleFormat, SampleRate, SupportedStreamConfig, SupportedStreamConfigRange};
use tracing::{debug, info, warn};

/// Which device the user asked for.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DeviceSelector {
    /// The host's default device
    #[default]
    Default,
    /// The device whose name matches exactly
    Named(String),
}

impl std::str::FromStr for DeviceSelector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed.to_lowercase().as_str() {
            "" | "default" | "auto" => Ok(DeviceSelector::Default),
            _ => Ok(DeviceSelector::Named(trimmed.to_string())),
        }
    }
}

impl From<&str> for DeviceSelector {
    fn from(s: &str) -> Self {
        // FromStr above never fails
        s.parse().unwrap_or_default()
    }
}

/// Sample formats the pipelines know how to convert, in order of preference.
const SUPPORTED_FORMATS: [SampleFormat; 3] = [SampleFormat::F32, SampleFormat::I16, SampleFormat::U16];

/// Device detection and selection utilities
pub struct DeviceManager;

impl DeviceManager {
    /// Names of all capture devices, for the startup log and the device picker.
    pub fn list_input_devices() -> AppResult<Vec<String>> {
        let host = cpal::default_host();
        let names = host
            .input_devices()?
            .filter_map(|device| device.name().ok())
            .collect();
        Ok(names)
    }

    /// Names of all output devices.
    pub fn list_output_devices() -> AppResult<Vec<String>> {
        let host = cpal::default_host();
        let names = host
            .output_devices()?
            .filter_map(|device| device.name().ok())
            .collect();
        Ok(names)
    }

    pub fn input_device(selector: &DeviceSelector) -> AppResult<cpal::Device> {
        let host = cpal::default_host();
        let device = match selector {
            DeviceSelector::Default => host
                .default_input_device()
                .ok_or_else(|| AppError::DeviceUnavailable("no default input device".to_string()))?,
            DeviceSelector::Named(name) => host
                .input_devices()?
                .find(|d| d.name().map(|n| &n == name).unwrap_or(false))
                .ok_or_else(|| AppError::DeviceUnavailable(format!("input device '{}' not found", name)))?,
        };
        info!("Using input device: {}", Self::device_name(&device));
        Ok(device)
    }

    pub fn output_device(selector: &DeviceSelector) -> AppResult<cpal::Device> {
        let host = cpal::default_host();
        let device = match selector {
            DeviceSelector::Default => host
                .default_output_device()
                .ok_or_else(|| AppError::DeviceUnavailable("no default output device".to_string()))?,
            DeviceSelector::Named(name) => host
                .output_devices()?
                .find(|d| d.name().map(|n| &n == name).unwrap_or(false))
                .ok_or_else(|| AppError::DeviceUnavailable(format!("output device '{}' not found", name)))?,
        };
        info!("Using output device: {}", Self::device_name(&device));
        Ok(device)
    }

    pub fn device_name(device: &cpal::Device) -> String {
        device.name().unwrap_or_else(|_| "Unknown Device".to_string())
    }

    /// Capture configuration closest to `target_rate`, preferring mono.
    pub fn input_config(device: &cpal::Device, target_rate: u32) -> AppResult<SupportedStreamConfig> {
        let ranges: Vec<_> = device.supported_input_configs()?.collect();
        match pick_config(&ranges, target_rate) {
            Some(config) => Ok(config),
            None => {
                warn!("No convertible input config near {}Hz, using device default", target_rate);
                Ok(device.default_input_config()?)
            }
        }
    }

    /// Playback configuration closest to `target_rate`, preferring mono.
    pub fn output_config(device: &cpal::Device, target_rate: u32) -> AppResult<SupportedStreamConfig> {
        let ranges: Vec<_> = device.supported_output_configs()?.collect();
        match pick_config(&ranges, target_rate) {
            Some(config) => Ok(config),
            None => {
                warn!("No convertible output config near {}Hz, using device default", target_rate);
                Ok(device.default_output_config()?)
            }
        }
    }
}

/// Rate inside `[min, max]` nearest to `target`.
pub fn clamp_rate(target: u32, min: u32, max: u32) -> u32 {
    target.clamp(min, max.max(min))
}

/// Choose among supported ranges: convertible format first, then the
/// smallest distance to `target_rate`, then fewer channels, then format preference.
fn pick_config(ranges: &[SupportedStreamConfigRange], target_rate: u32) -> Option<SupportedStreamConfig> {
    let best = ranges
        .iter()
        .filter_map(|range| {
            let format_rank = SUPPORTED_FORMATS
                .iter()
                .position(|f| *f == range.sample_format())?;
            let rate = clamp_rate(target_rate, range.min_sample_rate().0, range.max_sample_rate().0);
            let distance = rate.abs_diff(target_rate);
            Some(((distance, range.channels(), format_rank), range, rate))
        })
        .min_by_key(|(key, _, _)| *key)?;

    let (_, range, rate) = best;
    debug!(
        "Selected {:?} {}ch at {}Hz (wanted {}Hz)",
        range.sample_format(),
        range.channels(),
        rate,
        target_rate
    );
    Some(range.clone().with_sample_rate(SampleRate(rate)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_selector_parsing() {
        assert_eq!("".parse::<DeviceSelector>().unwrap(), DeviceSelector::Default);
        assert_eq!("Default".parse::<DeviceSelector>().unwrap(), DeviceSelector::Default);
        assert_eq!(
            DeviceSelector::from(" USB Mic "),
            DeviceSelector::Named("USB Mic".to_string())
        );
    }

    #[test]
    fn test_clamp_rate() {
        assert_eq!(clamp_rate(16000, 8000, 48000), 16000);
        assert_eq!(clamp_rate(16000, 44100, 48000), 44100);
        assert_eq!(clamp_rate(96000, 44100, 48000), 48000);
    }

    #[test]
    fn test_pick_config_prefers_exact_mono() {
        use cpal::SupportedBufferSize;
        let range = |channels, min, max, format| {
            SupportedStreamConfigRange::new(
                channels,
                SampleRate(min),
                SampleRate(max),
                SupportedBufferSize::Unknown,
                format,
            )
        };
        let ranges = vec![
            range(2, 44100, 48000, SampleFormat::F32),
            range(2, 8000, 48000, SampleFormat::F32),
            range(1, 8000, 48000, SampleFormat::I16),
            range(1, 8000, 48000, SampleFormat::I8),
        ];

        let config = pick_config(&ranges, 16000).unwrap();
        assert_eq!(config.channels(), 1);
        assert_eq!(config.sample_rate(), SampleRate(16000));
        assert_eq!(config.sample_format(), SampleFormat::I16);

        assert!(pick_config(&ranges[3..], 16000).is_none());
    }
}
