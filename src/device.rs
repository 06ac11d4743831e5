//! Device capability trait and the command encoding shared by the
//! fx2lafw-style streaming analyzers.

use std::io::{Read, Write};

use crate::config::ConfigError;
use crate::stream_decoder::DecodeMode;
use crate::transport::{StreamTransport, Transport, TransportError};
use crate::trigger_matcher::DEFAULT_MAX_PRE_TRIGGER;

/// Upper bound of the GPIF sample delay counter.
pub const MAX_SAMPLE_DELAY: u32 = 6 * 256;

/// Highest sample rate supported when collecting 16-bit samples.
pub const MAX_16BIT_SAMPLE_RATE: u64 = 12_000_000;

/// Bulk transfer block size; buffers are rounded up to a multiple of it.
pub const DEFAULT_BLOCK_SIZE: usize = 512;

/// Consecutive empty transfers tolerated before the stream is considered
/// stalled.
pub const DEFAULT_MAX_EMPTY_TRANSFERS: u32 = 64;

const CLOCK_48MHZ: u64 = 48_000_000;
const CLOCK_30MHZ: u64 = 30_000_000;

const START_FLAG_CLK_48MHZ: u8 = 1 << 6;
const START_FLAG_SAMPLE_16BIT: u8 = 1 << 5;
const START_FLAG_CLK_CTL2: u8 = 1 << 4;

/// Command byte opening a start frame on a serial bridge.
pub const CMD_START: u8 = 0xb1;
/// Command byte that halts streaming on a serial bridge.
pub const CMD_STOP: u8 = 0x00;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleWidth {
    /// 8 channels, one byte per sample.
    Narrow,
    /// 16 channels, two little endian bytes per sample.
    Wide,
}

impl SampleWidth {
    pub fn unit_size(self) -> usize {
        match self {
            SampleWidth::Narrow => 1,
            SampleWidth::Wide => 2,
        }
    }

    pub fn num_channels(self) -> usize {
        self.unit_size() * 8
    }
}

/// Static description of a device model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProfile {
    pub model: String,
    pub decode_mode: DecodeMode,
    /// Widest sample the device can produce.
    pub sample_width: SampleWidth,
    pub max_samplerate: u64,
    pub block_size: usize,
    /// Hardware pre-roll limit; `None` means unbounded.
    pub max_pre_trigger: Option<u64>,
    pub max_empty_transfers: u32,
}

impl DeviceProfile {
    pub fn new(model: &str, decode_mode: DecodeMode, sample_width: SampleWidth) -> Self {
        Self {
            model: model.to_string(),
            decode_mode,
            sample_width,
            max_samplerate: 24_000_000,
            block_size: DEFAULT_BLOCK_SIZE,
            max_pre_trigger: Some(DEFAULT_MAX_PRE_TRIGGER),
            max_empty_transfers: DEFAULT_MAX_EMPTY_TRANSFERS,
        }
    }

    pub fn max_samplerate(mut self, rate: u64) -> Self {
        self.max_samplerate = rate;
        self
    }

    pub fn max_pre_trigger(mut self, samples: Option<u64>) -> Self {
        self.max_pre_trigger = samples;
        self
    }

    pub fn max_empty_transfers(mut self, count: u32) -> Self {
        self.max_empty_transfers = count;
        self
    }

    /// Widest logic sample actually delivered. Interleaved logic/analog
    /// streams carry a single logic byte per sample.
    pub fn logic_width(&self) -> SampleWidth {
        match self.decode_mode {
            DecodeMode::Deinterleave => SampleWidth::Narrow,
            DecodeMode::Plain | DecodeMode::RunLength => self.sample_width,
        }
    }

    pub fn num_logic_channels(&self) -> usize {
        self.logic_width().num_channels()
    }

    /// Bit mask of the logic channels this model has.
    pub fn channel_mask(&self) -> u16 {
        match self.logic_width() {
            SampleWidth::Narrow => 0x00ff,
            SampleWidth::Wide => 0xffff,
        }
    }

    pub fn has_analog(&self) -> bool {
        self.decode_mode == DecodeMode::Deinterleave
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockSource {
    Mhz30,
    Mhz48,
}

impl ClockSource {
    pub fn hz(self) -> u64 {
        match self {
            ClockSource::Mhz30 => CLOCK_30MHZ,
            ClockSource::Mhz48 => CLOCK_48MHZ,
        }
    }
}

/// Parameters of the start command sent before streaming begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartCommand {
    pub clock_source: ClockSource,
    pub sample_delay: u16,
    pub sample_width: SampleWidth,
    pub channel_mask: u16,
    pub analog: bool,
}

impl StartCommand {
    /// Derives clock source and delay for `samplerate`. The 48 MHz clock is
    /// preferred whenever it divides the rate within the delay range.
    pub fn for_samplerate(
        samplerate: u64,
        sample_width: SampleWidth,
        channel_mask: u16,
        analog: bool,
    ) -> Result<Self, ConfigError> {
        if samplerate == 0 {
            return Err(ConfigError::ZeroSamplerate);
        }
        if sample_width == SampleWidth::Wide && samplerate > MAX_16BIT_SAMPLE_RATE {
            return Err(ConfigError::WideSamplerateTooHigh(samplerate));
        }

        let delay_for = |clock: ClockSource| {
            (clock.hz() % samplerate == 0)
                .then(|| clock.hz() / samplerate - 1)
                .filter(|&delay| delay > 0 && delay <= u64::from(MAX_SAMPLE_DELAY))
        };

        let (clock_source, delay) = delay_for(ClockSource::Mhz48)
            .map(|delay| (ClockSource::Mhz48, delay))
            .or_else(|| delay_for(ClockSource::Mhz30).map(|delay| (ClockSource::Mhz30, delay)))
            .ok_or(ConfigError::UnsupportedSamplerate(samplerate))?;

        log::debug!(
            "GPIF delay = {delay}, clocksource = {}MHz",
            clock_source.hz() / 1_000_000
        );

        Ok(Self {
            clock_source,
            sample_delay: delay as u16,
            sample_width,
            channel_mask,
            analog,
        })
    }

    pub fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.clock_source == ClockSource::Mhz48 {
            flags |= START_FLAG_CLK_48MHZ;
        }
        if self.sample_width == SampleWidth::Wide {
            flags |= START_FLAG_SAMPLE_16BIT;
        }
        if self.analog {
            flags |= START_FLAG_CLK_CTL2;
        }
        flags
    }

    /// Wire form: `[flags, delay_hi, delay_lo]`.
    pub fn encode(&self) -> [u8; 3] {
        let [hi, lo] = self.sample_delay.to_be_bytes();
        [self.flags(), hi, lo]
    }

    /// Effective sample rate produced by this clock and delay.
    pub fn samplerate(&self) -> u64 {
        self.clock_source.hz() / (u64::from(self.sample_delay) + 1)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Device is not open")]
    NotOpen,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What the acquisition core needs from a device family.
pub trait Device {
    type Transport: Transport;

    fn profile(&self) -> &DeviceProfile;

    fn is_open(&self) -> bool;

    fn start_acquisition(&mut self, command: &StartCommand) -> Result<(), DeviceError>;

    fn stop_acquisition(&mut self) -> Result<(), DeviceError>;

    fn transport(&mut self) -> &mut Self::Transport;
}

/// A streaming analyzer behind a bidirectional byte stream such as a serial
/// bridge. Commands go out over the same stream the samples come in on.
#[derive(Debug)]
pub struct SerialLogicDevice<R> {
    profile: DeviceProfile,
    transport: StreamTransport<R>,
    open: bool,
}

impl<R: Read + Write> SerialLogicDevice<R> {
    pub fn new(profile: DeviceProfile, stream: R) -> Self {
        Self {
            profile,
            transport: StreamTransport::new(stream),
            open: true,
        }
    }

    pub fn close(&mut self) {
        self.open = false;
    }

    pub fn into_inner(self) -> R {
        self.transport.into_inner()
    }
}

impl SerialLogicDevice<Box<dyn serialport::SerialPort>> {
    /// Opens `port` and wraps it with the given model profile.
    pub fn open(
        port: &str,
        baud_rate: u32,
        profile: DeviceProfile,
    ) -> Result<Self, DeviceError> {
        log::debug!("Opening {} on port {port}", profile.model);
        let transport = StreamTransport::open_serial(port, baud_rate)?;
        Ok(Self {
            profile,
            transport,
            open: true,
        })
    }
}

impl<R: Read + Write> Device for SerialLogicDevice<R> {
    type Transport = StreamTransport<R>;

    fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn start_acquisition(&mut self, command: &StartCommand) -> Result<(), DeviceError> {
        if !self.open {
            return Err(DeviceError::NotOpen);
        }
        let [flags, delay_hi, delay_lo] = command.encode();
        let [mask_lo, mask_hi] = command.channel_mask.to_le_bytes();
        self.transport
            .write_command(&[CMD_START, flags, delay_hi, delay_lo, mask_lo, mask_hi])?;
        Ok(())
    }

    fn stop_acquisition(&mut self) -> Result<(), DeviceError> {
        if !self.open {
            return Err(DeviceError::NotOpen);
        }
        self.transport.write_command(&[CMD_STOP])?;
        Ok(())
    }

    fn transport(&mut self) -> &mut Self::Transport {
        &mut self.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_prefers_48mhz_clock() {
        let cmd = StartCommand::for_samplerate(1_000_000, SampleWidth::Narrow, 0xff, false).unwrap();
        assert_eq!(cmd.clock_source, ClockSource::Mhz48);
        assert_eq!(cmd.sample_delay, 47);
        assert_eq!(cmd.samplerate(), 1_000_000);
        assert_eq!(cmd.encode(), [0x40, 0, 47]);
    }

    #[test]
    fn test_falls_back_to_30mhz_clock() {
        // 48 MHz / 20 kHz needs a delay beyond the counter range.
        let cmd = StartCommand::for_samplerate(20_000, SampleWidth::Narrow, 0xff, false).unwrap();
        assert_eq!(cmd.clock_source, ClockSource::Mhz30);
        assert_eq!(cmd.sample_delay, 1499);
        assert_eq!(cmd.encode(), [0x00, 0x05, 0xdb]);

        // 7.5 MHz does not divide 48 MHz.
        let cmd = StartCommand::for_samplerate(7_500_000, SampleWidth::Narrow, 0xff, false).unwrap();
        assert_eq!(cmd.clock_source, ClockSource::Mhz30);
        assert_eq!(cmd.sample_delay, 3);
    }

    #[test]
    fn test_unsupported_rates() {
        assert_eq!(
            StartCommand::for_samplerate(7_000_000, SampleWidth::Narrow, 0xff, false),
            Err(ConfigError::UnsupportedSamplerate(7_000_000))
        );
        assert_eq!(
            StartCommand::for_samplerate(1_000, SampleWidth::Narrow, 0xff, false),
            Err(ConfigError::UnsupportedSamplerate(1_000))
        );
        assert_eq!(
            StartCommand::for_samplerate(16_000_000, SampleWidth::Wide, 0xffff, false),
            Err(ConfigError::WideSamplerateTooHigh(16_000_000))
        );
    }

    #[test]
    fn test_flags() {
        let cmd = StartCommand::for_samplerate(12_000_000, SampleWidth::Wide, 0xffff, true).unwrap();
        assert_eq!(cmd.flags(), 0x40 | 0x20 | 0x10);
    }

    #[test]
    fn test_serial_device_writes_command_frames() {
        let mut device = SerialLogicDevice::new(
            DeviceProfile::new("bridge", DecodeMode::Plain, SampleWidth::Wide),
            Cursor::new(Vec::new()),
        );
        let cmd = StartCommand::for_samplerate(4_000_000, SampleWidth::Wide, 0x0f0f, false).unwrap();
        device.start_acquisition(&cmd).unwrap();
        device.stop_acquisition().unwrap();
        device.close();
        assert!(matches!(
            device.stop_acquisition(),
            Err(DeviceError::NotOpen)
        ));

        let written = device.into_inner().into_inner();
        assert_eq!(written, vec![CMD_START, 0x60, 0, 11, 0x0f, 0x0f, CMD_STOP]);
    }
}
