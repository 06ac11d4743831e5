//! The acquisition state machine.
//!
//! ```text
//! Idle -> Configuring -> Streaming -> Draining -> Stopped
//!                                                    |
//!                    Configuring <-------------------+  (start again)
//! ```
//!
//! Every way out of `Streaming` (limit reached, stop requested, stall,
//! device gone, transport failure) takes the same path: stop the device,
//! abort the transfer pool and keep servicing completions until none are
//! outstanding. Only then are `FrameEnd` and `End` emitted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use crate::config::{AcquisitionConfig, ConfigError};
use crate::device::{Device, DeviceError, StartCommand};
use crate::limit_gate::LimitGate;
use crate::session_feed::{FeedHeader, Packet, SessionFeed};
use crate::stream_decoder::{DecodeMode, DecoderState, SampleBatch, StreamDecoder};
use crate::transfer_pool::{Delivery, PoolError, PoolGeometry, TransferPool};
use crate::transport::{Completion, CompletionReceiver, Transport};
use crate::trigger_matcher::TriggerMatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    Idle,
    Configuring,
    Streaming,
    Draining,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    LimitReached,
    Requested,
    Stalled,
    DeviceGone,
    TransportFailure,
}

#[derive(Debug, thiserror::Error)]
pub enum AcquisitionError {
    #[error("Device is not open")]
    DeviceClosed,

    #[error("An acquisition is already running")]
    AlreadyRunning,

    #[error("No acquisition in progress")]
    NotRunning,

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Transfer setup failed: {0}")]
    Pool(#[from] PoolError),
}

/// Requests a stop from anywhere, including other threads.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    stop_requested: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    fn clear(&self) {
        self.stop_requested.store(false, Ordering::SeqCst);
    }
}

/// How an acquisition went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub samples_sent: u64,
    pub frames: u32,
    pub trigger_fired: bool,
    pub reason: StopReason,
    pub malformed_tokens: u64,
}

/// Everything that lives exactly as long as one acquisition.
#[derive(Debug)]
struct AcquisitionSession {
    pool: TransferPool,
    decoder: StreamDecoder,
    decoder_state: DecoderState,
    matcher: TriggerMatcher,
    gate: LimitGate,
    receiver: CompletionReceiver,
    poll_timeout: Duration,
    samples_sent: u64,
    frames: u32,
    frame_open: bool,
    trigger_fired: bool,
    reason: Option<StopReason>,
    stop_sent: bool,
}

impl AcquisitionSession {
    fn is_draining(&self) -> bool {
        self.reason.is_some()
    }

    /// Moves finished reads from the completion queue into the pool and
    /// forwards whatever is next in sequence.
    fn service<D: Device, F: SessionFeed>(
        &mut self,
        device: &mut D,
        feed: &mut F,
        stop: &StopHandle,
        timeout: Duration,
    ) {
        let events = device.transport().handle_events(timeout);
        for completion in self.receiver.try_iter() {
            self.pool.enqueue(completion);
        }
        if let Err(e) = events {
            log::error!("Transport failure: {e}");
            self.begin_drain(StopReason::TransportFailure, device, feed);
            self.pool.abandon_in_flight();
            return;
        }

        while !self.is_draining() {
            if stop.is_stop_requested() {
                self.begin_drain(StopReason::Requested, device, feed);
                break;
            }
            let Some(delivery) = self.pool.next_delivery(device.transport()) else {
                break;
            };
            match delivery {
                Delivery::Data(completion) => self.dispatch(completion, device, feed),
                Delivery::Empty => {}
                Delivery::Stalled => self.begin_drain(StopReason::Stalled, device, feed),
                Delivery::DeviceGone => self.begin_drain(StopReason::DeviceGone, device, feed),
                Delivery::ResubmitFailed(e) => {
                    log::error!("{e}");
                    self.begin_drain(StopReason::TransportFailure, device, feed);
                }
            }
        }
    }

    fn dispatch<D: Device, F: SessionFeed>(
        &mut self,
        completion: Completion,
        device: &mut D,
        feed: &mut F,
    ) {
        #[cfg(feature = "cpu-profiling")]
        let _zone = tracy_client::span!("dispatch");

        let batch = self.decoder.decode(completion.data(), &mut self.decoder_state);
        if self.forward(batch, feed) {
            self.begin_drain(StopReason::LimitReached, device, feed);
        }
        if let Err(e) = self.pool.recycle(completion, device.transport()) {
            log::error!("{e}");
            self.begin_drain(StopReason::TransportFailure, device, feed);
        }
    }

    /// Runs a batch through the trigger and the limit gate. Returns `true`
    /// once the limits are exhausted.
    fn forward<F: SessionFeed>(&mut self, mut batch: SampleBatch, feed: &mut F) -> bool {
        if !self.matcher.is_fired() {
            let Some(hit) = self.matcher.check(&batch) else {
                return self.gate.is_exhausted();
            };
            batch = batch.split_off(hit.offset);

            feed.push(Packet::FrameBegin);
            self.frames += 1;
            self.frame_open = true;
            self.trigger_fired = true;

            log::debug!(
                "Trigger fired with {} pre-trigger samples",
                hit.pre_trigger_samples()
            );
            self.send_samples(hit.pre_trigger, feed);
            feed.push(Packet::Trigger);
        }
        self.send_samples(batch, feed);
        self.gate.is_exhausted()
    }

    fn send_samples<F: SessionFeed>(&mut self, mut batch: SampleBatch, feed: &mut F) {
        let requested = batch.len();
        if requested == 0 {
            return;
        }
        let admitted = self.gate.admit(requested).admitted(requested);
        if admitted == 0 {
            return;
        }
        batch.truncate(admitted);

        feed.push(Packet::Logic {
            unit_size: batch.unit_size(),
            data: batch.logic(),
        });
        if let Some(volts) = batch.analog_volts() {
            feed.push(Packet::Analog(&volts));
        }
        self.samples_sent += admitted as u64;
    }

    /// Enters draining. Only the first reason counts; later calls only make
    /// sure every submitted transfer has been cancelled.
    fn begin_drain<D: Device, F: SessionFeed>(
        &mut self,
        reason: StopReason,
        device: &mut D,
        feed: &mut F,
    ) {
        if self.reason.is_none() {
            tracing::info!(
                ?reason,
                samples_sent = self.samples_sent,
                outstanding = self.pool.outstanding(),
                "Stopping acquisition"
            );
            self.reason = Some(reason);
            self.decoder.finish(&mut self.decoder_state);
        }

        if !self.stop_sent {
            self.stop_sent = true;
            if let Err(e) = device.stop_acquisition() {
                log::warn!("Failed to send stop command: {e}");
            }
        }
        self.pool.abort(device.transport());
    }
}

/// Drives one device through acquisitions, forwarding decoded samples to a
/// [`SessionFeed`].
#[derive(Debug)]
pub struct AcquisitionController<D, F> {
    device: D,
    feed: F,
    config: AcquisitionConfig,
    state: AcquisitionState,
    stop: StopHandle,
    session: Option<AcquisitionSession>,
    summary: Option<SessionSummary>,
}

impl<D: Device, F: SessionFeed> AcquisitionController<D, F> {
    pub fn new(device: D, feed: F, config: AcquisitionConfig) -> Self {
        Self {
            device,
            feed,
            config,
            state: AcquisitionState::Idle,
            stop: StopHandle::default(),
            session: None,
            summary: None,
        }
    }

    pub fn state(&self) -> AcquisitionState {
        self.state
    }

    pub fn config(&self) -> &AcquisitionConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: AcquisitionConfig) -> Result<(), AcquisitionError> {
        if self.session.is_some() {
            return Err(AcquisitionError::AlreadyRunning);
        }
        self.config = config;
        Ok(())
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Summary of the last finished acquisition.
    pub fn summary(&self) -> Option<&SessionSummary> {
        self.summary.as_ref()
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn feed(&self) -> &F {
        &self.feed
    }

    pub fn feed_mut(&mut self) -> &mut F {
        &mut self.feed
    }

    pub fn into_parts(self) -> (D, F) {
        (self.device, self.feed)
    }

    /// Configures the device and fills the transfer pool. Setup failures
    /// are returned and leave the controller idle with nothing in flight.
    pub fn start(&mut self) -> Result<(), AcquisitionError> {
        if self.session.is_some() {
            return Err(AcquisitionError::AlreadyRunning);
        }
        if !self.device.is_open() {
            return Err(AcquisitionError::DeviceClosed);
        }

        self.state = AcquisitionState::Configuring;
        let session = match self.configure() {
            Ok(session) => session,
            Err(e) => {
                log::error!("Unable to start acquisition: {e}");
                self.state = AcquisitionState::Idle;
                return Err(e);
            }
        };

        let profile = self.device.profile();
        let width = self.config.sample_width(profile);
        let header = FeedHeader {
            samplerate: self.config.samplerate,
            num_logic_channels: width.num_channels(),
            num_analog_channels: usize::from(profile.has_analog()),
            start_time: SystemTime::now(),
        };
        self.feed.push(Packet::Header(&header));

        let mut session = session;
        if session.matcher.is_fired() {
            self.feed.push(Packet::FrameBegin);
            session.frames = 1;
            session.frame_open = true;
        }

        self.summary = None;
        self.session = Some(session);
        self.state = AcquisitionState::Streaming;
        Ok(())
    }

    fn configure(&mut self) -> Result<AcquisitionSession, AcquisitionError> {
        let profile = self.device.profile().clone();
        self.config.validate(&profile)?;
        self.stop.clear();

        let width = self.config.sample_width(&profile);
        let analog = profile.has_analog();
        let command = StartCommand::for_samplerate(
            self.config.samplerate,
            width,
            self.config.channel_enable_mask,
            analog,
        )?;

        let decoder = StreamDecoder::new(profile.decode_mode, width);
        let bytes_per_sample = match profile.decode_mode {
            DecodeMode::Deinterleave => 2,
            DecodeMode::Plain | DecodeMode::RunLength => decoder.unit_size(),
        };
        let geometry =
            PoolGeometry::for_rate(self.config.samplerate, bytes_per_sample, profile.block_size);

        let limits = self.config.limits();
        let pre_trigger = if self.config.trigger.is_some() {
            let wanted = limits.pre_trigger_samples();
            profile.max_pre_trigger.map_or(wanted, |max| wanted.min(max))
        } else {
            0
        };
        let matcher = TriggerMatcher::new(
            self.config.trigger.as_ref(),
            decoder.unit_size(),
            analog,
            usize::try_from(pre_trigger).unwrap_or(usize::MAX),
        );

        tracing::info!(
            model = %profile.model,
            samplerate = self.config.samplerate,
            unit_size = decoder.unit_size(),
            pre_trigger,
            "Starting acquisition"
        );

        let (sender, receiver) = flume::unbounded();
        self.device.transport().attach(sender);
        self.device.start_acquisition(&command)?;

        let mut pool = TransferPool::new(geometry, profile.max_empty_transfers);
        if let Err(e) = pool.submit_all(self.device.transport()) {
            if let Err(stop_err) = self.device.stop_acquisition() {
                log::warn!("Failed to send stop command: {stop_err}");
            }
            Self::unwind(&mut pool, &mut self.device, &receiver, geometry.timeout);
            return Err(e.into());
        }

        let mut gate = LimitGate::new(&limits);
        gate.start(Instant::now());

        Ok(AcquisitionSession {
            pool,
            decoder,
            decoder_state: DecoderState::new(),
            matcher,
            gate,
            receiver,
            poll_timeout: geometry.timeout,
            samples_sent: 0,
            frames: 0,
            frame_open: false,
            trigger_fired: false,
            reason: None,
            stop_sent: false,
        })
    }

    /// Waits for the transfers of an aborted setup to come back.
    fn unwind(
        pool: &mut TransferPool,
        device: &mut D,
        receiver: &CompletionReceiver,
        timeout: Duration,
    ) {
        let deadline = Instant::now() + timeout * 2;
        while pool.outstanding() > 0 {
            if Instant::now() >= deadline {
                pool.abandon_in_flight();
                break;
            }
            let events = device.transport().handle_events(timeout);
            for completion in receiver.try_iter() {
                pool.enqueue(completion);
            }
            if let Err(e) = events {
                log::warn!("Transport failure while unwinding: {e}");
                pool.abandon_in_flight();
            }
        }
    }

    /// Makes one round of progress and returns the resulting state.
    pub fn poll(&mut self, timeout: Duration) -> AcquisitionState {
        #[cfg(feature = "cpu-profiling")]
        let _zone = tracy_client::span!("acquisition_poll");

        let Some(session) = self.session.as_mut() else {
            return self.state;
        };

        if !session.is_draining() {
            if self.stop.is_stop_requested() {
                session.begin_drain(StopReason::Requested, &mut self.device, &mut self.feed);
            } else if session.gate.is_exhausted() {
                session.begin_drain(StopReason::LimitReached, &mut self.device, &mut self.feed);
            }
        }

        session.service(&mut self.device, &mut self.feed, &self.stop, timeout);
        self.settle();
        self.state
    }

    /// Stops the running acquisition. The session ends once every transfer
    /// has come back; keep polling (or call [`Self::run`]) until `Stopped`.
    pub fn stop(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.begin_drain(StopReason::Requested, &mut self.device, &mut self.feed);
            self.settle();
        }
    }

    /// Starts an acquisition if none is running and polls until it ends.
    pub fn run(&mut self) -> Result<SessionSummary, AcquisitionError> {
        if self.session.is_none() {
            self.start()?;
        }
        loop {
            let Some(timeout) = self.session.as_ref().map(|s| s.poll_timeout) else {
                return self.summary.clone().ok_or(AcquisitionError::NotRunning);
            };
            self.poll(timeout);
        }
    }

    fn settle(&mut self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if session.is_draining() {
            self.state = AcquisitionState::Draining;
        }
        if session.pool.is_drained() {
            self.finish();
        }
    }

    fn finish(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        if session.frame_open {
            self.feed.push(Packet::FrameEnd);
        }
        self.feed.push(Packet::End);

        let summary = SessionSummary {
            samples_sent: session.samples_sent,
            frames: session.frames,
            trigger_fired: session.trigger_fired,
            reason: session.reason.unwrap_or(StopReason::Requested),
            malformed_tokens: session.decoder_state.malformed_tokens(),
        };
        tracing::info!(
            samples_sent = summary.samples_sent,
            frames = summary.frames,
            reason = ?summary.reason,
            "Acquisition finished"
        );
        self.summary = Some(summary);
        self.state = AcquisitionState::Stopped;
    }
}
