//! Scripted transport and device for exercising the acquisition core
//! without hardware.

use std::collections::VecDeque;
use std::time::Duration;

use crate::device::{Device, DeviceError, DeviceProfile, StartCommand};
use crate::transport::{
    Completion, CompletionReceiver, CompletionSender, ReadRequest, SlotId, SubmitError,
    TransferStatus, Transport, TransportError,
};

/// What the next read completes with.
#[derive(Debug, Clone)]
pub enum Step {
    Data(Vec<u8>),
    /// Timed out after transferring the given bytes.
    Timeout(Vec<u8>),
    Empty,
    NoDevice,
    Error,
}

/// Completes every in-flight read on each `handle_events` call, taking one
/// step of the script per read in submission order. Once the script runs out
/// reads are held until cancelled, unless `when_exhausted` is set.
#[derive(Debug)]
pub struct ScriptedTransport {
    script: VecDeque<Step>,
    when_exhausted: Option<Step>,
    sender: CompletionSender,
    receiver: CompletionReceiver,
    in_flight: VecDeque<ReadRequest>,
    cancelled: Vec<ReadRequest>,
    reversed: bool,
    fail_submit_after: Option<usize>,
    fail_events_after_cancel: bool,
    submissions: usize,
    cancels: Vec<SlotId>,
}

impl ScriptedTransport {
    pub fn new(script: Vec<Step>) -> Self {
        let (sender, receiver) = flume::unbounded();
        Self {
            script: script.into(),
            when_exhausted: None,
            sender,
            receiver,
            in_flight: VecDeque::new(),
            cancelled: Vec::new(),
            reversed: false,
            fail_submit_after: None,
            fail_events_after_cancel: false,
            submissions: 0,
            cancels: Vec::new(),
        }
    }

    /// Sends each round of completions in reverse submission order.
    pub fn reversed(mut self) -> Self {
        self.reversed = true;
        self
    }

    pub fn when_exhausted(mut self, step: Step) -> Self {
        self.when_exhausted = Some(step);
        self
    }

    /// Accepts `n` submissions, then rejects every further one.
    pub fn fail_submit_after(mut self, n: usize) -> Self {
        self.fail_submit_after = Some(n);
        self
    }

    /// Event handling fails as soon as a cancel has been requested.
    pub fn fail_events_after_cancel(mut self) -> Self {
        self.fail_events_after_cancel = true;
        self
    }

    pub fn submissions(&self) -> usize {
        self.submissions
    }

    pub fn cancels(&self) -> &[SlotId] {
        &self.cancels
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len() + self.cancelled.len()
    }

    /// Completions sent to the transport's own queue, for tests that drive
    /// the pool directly.
    pub fn drain_completions(&self) -> Vec<Completion> {
        self.receiver.try_iter().collect()
    }

    fn next_step(&mut self) -> Option<Step> {
        self.script
            .pop_front()
            .or_else(|| self.when_exhausted.clone())
    }

    fn complete(request: ReadRequest, step: Step) -> Completion {
        let (status, payload) = match step {
            Step::Data(bytes) => (TransferStatus::Completed, bytes),
            Step::Timeout(bytes) => (TransferStatus::TimedOut, bytes),
            Step::Empty => (TransferStatus::Completed, Vec::new()),
            Step::NoDevice => (TransferStatus::NoDevice, Vec::new()),
            Step::Error => (TransferStatus::Error, Vec::new()),
        };
        let mut request = request;
        let n = payload.len().min(request.buffer.len());
        request.buffer[..n].copy_from_slice(&payload[..n]);
        Completion::with_status(request, status, n)
    }
}

impl Transport for ScriptedTransport {
    fn attach(&mut self, sender: CompletionSender) {
        self.sender = sender;
    }

    fn submit(&mut self, request: ReadRequest) -> Result<(), SubmitError> {
        if self
            .fail_submit_after
            .is_some_and(|limit| self.submissions >= limit)
        {
            return Err(SubmitError {
                request,
                source: TransportError::NoDevice,
            });
        }
        self.submissions += 1;
        self.in_flight.push_back(request);
        Ok(())
    }

    fn cancel(&mut self, slot: SlotId) {
        self.cancels.push(slot);
        if let Some(index) = self.in_flight.iter().position(|r| r.slot == slot) {
            if let Some(request) = self.in_flight.remove(index) {
                self.cancelled.push(request);
            }
        }
    }

    fn handle_events(&mut self, _timeout: Duration) -> Result<(), TransportError> {
        if self.fail_events_after_cancel && !self.cancels.is_empty() {
            return Err(TransportError::NoDevice);
        }

        let mut round: Vec<Completion> = std::mem::take(&mut self.cancelled)
            .into_iter()
            .map(Completion::cancelled)
            .collect();

        while let Some(request) = self.in_flight.pop_front() {
            match self.next_step() {
                Some(step) => round.push(Self::complete(request, step)),
                None => {
                    self.in_flight.push_front(request);
                    break;
                }
            }
        }

        if self.reversed {
            round.reverse();
        }
        for completion in round {
            self.sender
                .send(completion)
                .map_err(|_| TransportError::Detached)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct ScriptedDevice {
    profile: DeviceProfile,
    transport: ScriptedTransport,
    open: bool,
    pub starts: Vec<StartCommand>,
    pub stops: usize,
}

impl ScriptedDevice {
    pub fn new(profile: DeviceProfile, transport: ScriptedTransport) -> Self {
        Self {
            profile,
            transport,
            open: true,
            starts: Vec::new(),
            stops: 0,
        }
    }

    pub fn closed(mut self) -> Self {
        self.open = false;
        self
    }

    pub fn scripted(&self) -> &ScriptedTransport {
        &self.transport
    }
}

impl Device for ScriptedDevice {
    type Transport = ScriptedTransport;

    fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn start_acquisition(&mut self, command: &StartCommand) -> Result<(), DeviceError> {
        self.starts.push(*command);
        Ok(())
    }

    fn stop_acquisition(&mut self) -> Result<(), DeviceError> {
        self.stops += 1;
        Ok(())
    }

    fn transport(&mut self) -> &mut Self::Transport {
        &mut self.transport
    }
}
