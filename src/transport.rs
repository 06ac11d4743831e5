//! Asynchronous read plumbing between a device and the transfer pool.
//!
//! A transport accepts [`ReadRequest`]s that own their buffer and hands the
//! buffer back inside exactly one [`Completion`] per accepted request, pushed
//! into the channel given to [`Transport::attach`]. Cancelled requests also
//! complete, with [`TransferStatus::Cancelled`].

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

/// Index of a slot within the transfer pool.
pub type SlotId = usize;

pub type CompletionSender = flume::Sender<Completion>;
pub type CompletionReceiver = flume::Receiver<Completion>;

/// One read handed to the transport. The buffer travels with the request.
#[derive(Debug)]
pub struct ReadRequest {
    pub slot: SlotId,
    pub seq: u64,
    pub buffer: Vec<u8>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    TimedOut,
    Cancelled,
    NoDevice,
    Error,
}

#[derive(Debug)]
pub struct Completion {
    pub slot: SlotId,
    pub seq: u64,
    pub status: TransferStatus,
    buffer: Vec<u8>,
    actual_length: usize,
}

impl Completion {
    pub fn cancelled(request: ReadRequest) -> Self {
        Self::with_status(request, TransferStatus::Cancelled, 0)
    }

    pub fn with_status(request: ReadRequest, status: TransferStatus, actual_length: usize) -> Self {
        Self {
            slot: request.slot,
            seq: request.seq,
            status,
            actual_length: actual_length.min(request.buffer.len()),
            buffer: request.buffer,
        }
    }

    /// The bytes actually transferred.
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.actual_length]
    }

    pub fn actual_length(&self) -> usize {
        self.actual_length
    }

    /// Hands the buffer back, e.g. to resubmit it.
    pub fn into_buffer(self) -> Vec<u8> {
        self.buffer
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Device is gone")]
    NoDevice,

    #[error("No completion queue attached")]
    Detached,

    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A rejected submission. The request, and with it the buffer, is handed back.
#[derive(Debug, thiserror::Error)]
#[error("Failed to submit transfer for slot {}: {source}", .request.slot)]
pub struct SubmitError {
    pub request: ReadRequest,
    pub source: TransportError,
}

pub trait Transport {
    /// Directs all future completions into `sender`, replacing any previous
    /// queue.
    fn attach(&mut self, sender: CompletionSender);

    fn submit(&mut self, request: ReadRequest) -> Result<(), SubmitError>;

    /// Requests cancellation of the in-flight read for `slot`. The request
    /// still completes, possibly later, with `Cancelled` or with whatever
    /// status it had already reached.
    fn cancel(&mut self, slot: SlotId);

    /// Makes progress on outstanding reads, waiting at most `timeout`.
    fn handle_events(&mut self, timeout: Duration) -> Result<(), TransportError>;
}

/// Transport over any blocking byte stream.
///
/// Requests are served in submission order, one read per call to
/// [`Transport::handle_events`]. The stream's own read timeout bounds how long
/// that read may block.
#[derive(Debug)]
pub struct StreamTransport<R> {
    stream: R,
    sender: Option<CompletionSender>,
    pending: VecDeque<ReadRequest>,
    cancelled: Vec<ReadRequest>,
}

impl<R: Read + Write> StreamTransport<R> {
    pub fn new(stream: R) -> Self {
        Self {
            stream,
            sender: None,
            pending: VecDeque::new(),
            cancelled: Vec::new(),
        }
    }

    pub fn get_ref(&self) -> &R {
        &self.stream
    }

    pub fn into_inner(self) -> R {
        self.stream
    }

    /// Number of accepted requests that have not completed yet.
    pub fn in_flight(&self) -> usize {
        self.pending.len() + self.cancelled.len()
    }

    pub fn write_command(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.stream.write_all(bytes)?;
        self.stream.flush()?;
        Ok(())
    }

    fn complete(&self, completion: Completion) -> Result<(), TransportError> {
        let sender = self.sender.as_ref().ok_or(TransportError::Detached)?;
        sender
            .send(completion)
            .map_err(|_| TransportError::Detached)
    }
}

impl StreamTransport<Box<dyn serialport::SerialPort>> {
    pub fn open_serial(port: &str, baud_rate: u32) -> Result<Self, TransportError> {
        let serial = serialport::new(port, baud_rate)
            .timeout(Duration::from_millis(10))
            .open()?;
        serial.clear(serialport::ClearBuffer::All)?;
        Ok(Self::new(serial))
    }
}

impl<R: Read + Write> Transport for StreamTransport<R> {
    fn attach(&mut self, sender: CompletionSender) {
        self.sender = Some(sender);
    }

    fn submit(&mut self, request: ReadRequest) -> Result<(), SubmitError> {
        if self.sender.is_none() {
            return Err(SubmitError {
                request,
                source: TransportError::Detached,
            });
        }
        self.pending.push_back(request);
        Ok(())
    }

    fn cancel(&mut self, slot: SlotId) {
        if let Some(index) = self.pending.iter().position(|r| r.slot == slot) {
            if let Some(request) = self.pending.remove(index) {
                self.cancelled.push(request);
            }
        }
    }

    fn handle_events(&mut self, _timeout: Duration) -> Result<(), TransportError> {
        for request in std::mem::take(&mut self.cancelled) {
            self.complete(Completion::cancelled(request))?;
        }

        let Some(mut request) = self.pending.pop_front() else {
            return Ok(());
        };

        let completion = match self.stream.read(&mut request.buffer) {
            Ok(n) => Completion::with_status(request, TransferStatus::Completed, n),
            Err(e) => match e.kind() {
                ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted => {
                    Completion::with_status(request, TransferStatus::TimedOut, 0)
                }
                ErrorKind::BrokenPipe | ErrorKind::NotConnected | ErrorKind::NotFound => {
                    log::warn!("Stream read failed, device is gone: {e}");
                    Completion::with_status(request, TransferStatus::NoDevice, 0)
                }
                _ => {
                    log::warn!("Stream read failed: {e}");
                    Completion::with_status(request, TransferStatus::Error, 0)
                }
            },
        };
        self.complete(completion)
    }
}
