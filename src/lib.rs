//! # logic-stream
//!
//! Continuous acquisition engine for streaming USB and serial logic analyzers.
//!
//! The crate keeps a pool of asynchronous reads saturated, decodes the raw
//! byte stream into samples, evaluates a software trigger, enforces sample and
//! time limits exactly, and tears everything down cleanly however the
//! acquisition ends.
//!
//! ## Features
//!
//! - **Transfer pool**: up to 32 reads in flight, delivered strictly in submission order
//! - **Stream decoding**: plain 8/16-bit samples, run-length tokens and interleaved logic/analog pairs
//! - **Software trigger**: multi-stage level and edge triggers with pre-trigger history
//! - **Exact limits**: never forwards a sample past the configured limit
//! - **DataFrame output**: collects captures into `polars` frames with one column per channel
//! - **Serial devices**: drives fx2lafw-style analyzers over `serialport`
//!
//! ## Examples
//!
//! ### Trigger Configuration
//!
//! ```rust
//! use logic_stream::TriggerSpec;
//!
//! // Rising edge on channel 0 while channel 3 is high
//! let trigger: TriggerSpec = "0=r,3=1".parse()?;
//!
//! let same = TriggerSpec::fire_when().rising(0).high(3).build()?;
//! assert_eq!(trigger, same);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Capturing From a Serial Analyzer
//!
//! ```rust,no_run
//! use logic_stream::{
//!     AcquisitionConfig, AcquisitionController, CaptureFrame, DecodeMode, DeviceProfile,
//!     SampleWidth, SerialLogicDevice,
//! };
//!
//! let profile = DeviceProfile::new("fx2 bridge", DecodeMode::Plain, SampleWidth::Narrow);
//! let device = SerialLogicDevice::open("/dev/ttyUSB0", 3_000_000, profile)?;
//!
//! let config = AcquisitionConfig::new(1_000_000)
//!     .limit_samples(100_000)
//!     .capture_ratio(10)
//!     .trigger_str("0=r")?;
//!
//! let mut acquisition = AcquisitionController::new(device, CaptureFrame::new(), config);
//! let summary = acquisition.run()?;
//!
//! let (_, capture) = acquisition.into_parts();
//! let df = capture.to_dataframe()?;
//! println!("Captured {} samples ({:?})", df.height(), summary.reason);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Streaming to Another Thread
//!
//! ```rust,no_run
//! use logic_stream::{
//!     AcquisitionConfig, AcquisitionController, DecodeMode, DeviceProfile, FeedEvent,
//!     SampleWidth, SerialLogicDevice,
//! };
//!
//! let profile = DeviceProfile::new("fx2 bridge", DecodeMode::Plain, SampleWidth::Wide);
//! let device = SerialLogicDevice::open("/dev/ttyUSB0", 3_000_000, profile)?;
//! let (tx, rx) = flume::unbounded::<FeedEvent>();
//!
//! let mut acquisition =
//!     AcquisitionController::new(device, tx, AcquisitionConfig::new(4_000_000).channels(0xffff));
//! let stop = acquisition.stop_handle();
//!
//! let consumer = std::thread::spawn(move || {
//!     let mut samples = 0;
//!     for event in rx.iter() {
//!         match event {
//!             FeedEvent::Logic { unit_size, data } => samples += data.len() / unit_size,
//!             FeedEvent::End => break,
//!             _ => {}
//!         }
//!         if samples > 1_000_000 {
//!             stop.request_stop();
//!         }
//!     }
//!     samples
//! });
//!
//! acquisition.run()?;
//! println!("Received {} samples", consumer.join().unwrap_or(0));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod acquisition;
pub mod capture_frame;
pub mod config;
pub mod device;
pub mod limit_gate;
pub mod session_feed;
pub mod stream_decoder;
pub mod transfer_pool;
pub mod transport;
pub mod trigger_config;
pub mod trigger_matcher;

#[cfg(test)]
mod test_support;

// Re-export the main types for convenience
pub use acquisition::{
    AcquisitionController, AcquisitionError, AcquisitionState, SessionSummary, StopHandle,
    StopReason,
};

pub use capture_frame::CaptureFrame;

pub use config::{AcquisitionConfig, AcquisitionLimits, ConfigError};

pub use device::{
    ClockSource, Device, DeviceError, DeviceProfile, SampleWidth, SerialLogicDevice, StartCommand,
};

pub use limit_gate::{Admission, LimitGate};

pub use session_feed::{FeedEvent, FeedHeader, Packet, RecordingFeed, SessionFeed};

pub use stream_decoder::{DecodeMode, DecoderState, SampleBatch, StreamDecoder};

pub use transfer_pool::{PoolError, PoolGeometry, TransferPool};

pub use transport::{Completion, ReadRequest, StreamTransport, Transport, TransportError};

pub use trigger_config::{TriggerCondition, TriggerParseError, TriggerSpec};

pub use trigger_matcher::{TriggerMatcher, TriggerState};
