//! Acquisition options consumed by the streaming core.
//!
//! These mirror the option store a host application keeps per device:
//! sample rate, sample and time limits, capture ratio, trigger and the set of
//! enabled channels. Validation happens against a [`DeviceProfile`] right
//! before an acquisition starts.

use std::time::Duration;

use crate::device::{DeviceProfile, SampleWidth};
use crate::trigger_config::{TriggerParseError, TriggerSpec};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Sample rate must be greater than zero")]
    ZeroSamplerate,

    #[error("Sample rate {rate} Hz exceeds the device maximum of {max} Hz")]
    SamplerateTooHigh { rate: u64, max: u64 },

    #[error("Unable to derive a sample clock for {0} Hz")]
    UnsupportedSamplerate(u64),

    #[error("Unable to sample at {0} Hz when collecting 16-bit samples")]
    WideSamplerateTooHigh(u64),

    #[error("Capture ratio {0}% is out of range (0-100)")]
    CaptureRatioOutOfRange(u8),

    #[error("No channels enabled")]
    NoChannelsEnabled,

    #[error("Channel mask {mask:#06x} enables channels the device does not have")]
    ChannelMaskOutOfRange { mask: u16 },

    #[error("Trigger references disabled channel {0}")]
    TriggerOnDisabledChannel(usize),

    #[error("Invalid trigger: {0}")]
    Trigger(#[from] TriggerParseError),
}

/// The limits an acquisition runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AcquisitionLimits {
    pub max_samples: Option<u64>,
    pub max_duration: Option<Duration>,
    /// Percentage of `max_samples` reserved for pre-trigger history.
    pub capture_ratio: u8,
}

impl AcquisitionLimits {
    /// Number of pre-trigger samples to retain, before any hardware cap.
    pub fn pre_trigger_samples(&self) -> u64 {
        self.max_samples
            .map_or(0, |max| max * u64::from(self.capture_ratio.min(100)) / 100)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquisitionConfig {
    pub samplerate: u64,
    pub limit_samples: Option<u64>,
    pub limit_msec: Option<u64>,
    pub capture_ratio: u8,
    pub trigger: Option<TriggerSpec>,
    pub channel_enable_mask: u16,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            samplerate: 1_000_000,
            limit_samples: None,
            limit_msec: None,
            capture_ratio: 20,
            trigger: None,
            channel_enable_mask: 0x00ff,
        }
    }
}

impl AcquisitionConfig {
    pub fn new(samplerate: u64) -> Self {
        Self {
            samplerate,
            ..Self::default()
        }
    }

    pub fn limit_samples(mut self, samples: u64) -> Self {
        self.limit_samples = Some(samples);
        self
    }

    pub fn limit_msec(mut self, msec: u64) -> Self {
        self.limit_msec = Some(msec);
        self
    }

    pub fn capture_ratio(mut self, percent: u8) -> Self {
        self.capture_ratio = percent;
        self
    }

    pub fn trigger(mut self, trigger: TriggerSpec) -> Self {
        self.trigger = Some(trigger);
        self
    }

    /// Sets the trigger from its textual form, e.g. `"0=r,1=1"`.
    pub fn trigger_str(mut self, trigger: &str) -> Result<Self, ConfigError> {
        self.trigger = Some(trigger.parse()?);
        Ok(self)
    }

    pub fn channels(mut self, mask: u16) -> Self {
        self.channel_enable_mask = mask;
        self
    }

    pub fn limits(&self) -> AcquisitionLimits {
        AcquisitionLimits {
            max_samples: self.limit_samples.filter(|&n| n > 0),
            max_duration: self
                .limit_msec
                .filter(|&ms| ms > 0)
                .map(Duration::from_millis),
            capture_ratio: self.capture_ratio,
        }
    }

    /// Wide (16-bit) sampling is needed as soon as any of the upper eight
    /// channels is enabled.
    pub fn sample_width(&self, profile: &DeviceProfile) -> SampleWidth {
        if self.channel_enable_mask > 0xff && profile.logic_width() == SampleWidth::Wide {
            SampleWidth::Wide
        } else {
            SampleWidth::Narrow
        }
    }

    pub fn validate(&self, profile: &DeviceProfile) -> Result<(), ConfigError> {
        if self.samplerate == 0 {
            return Err(ConfigError::ZeroSamplerate);
        }
        if self.samplerate > profile.max_samplerate {
            return Err(ConfigError::SamplerateTooHigh {
                rate: self.samplerate,
                max: profile.max_samplerate,
            });
        }
        if self.capture_ratio > 100 {
            return Err(ConfigError::CaptureRatioOutOfRange(self.capture_ratio));
        }
        if self.channel_enable_mask == 0 {
            return Err(ConfigError::NoChannelsEnabled);
        }
        let supported = profile.channel_mask();
        if self.channel_enable_mask & !supported != 0 {
            return Err(ConfigError::ChannelMaskOutOfRange {
                mask: self.channel_enable_mask,
            });
        }
        if let Some(trigger) = &self.trigger {
            let disabled = trigger.channel_mask() & !self.channel_enable_mask;
            if disabled != 0 {
                return Err(ConfigError::TriggerOnDisabledChannel(
                    disabled.trailing_zeros() as usize,
                ));
            }
        }
        Ok(())
    }
}
