//! Packets an acquisition emits and the sinks that receive them.
//!
//! Every acquisition produces `Header`, then optionally a frame
//! (`FrameBegin`, any mix of `Logic`, `Analog` and `Trigger`, `FrameEnd`), and
//! finally exactly one `End`.

use std::time::SystemTime;

#[derive(Debug, Clone, PartialEq)]
pub struct FeedHeader {
    pub samplerate: u64,
    pub num_logic_channels: usize,
    pub num_analog_channels: usize,
    pub start_time: SystemTime,
}

/// A packet borrowed from the acquisition's buffers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Packet<'a> {
    Header(&'a FeedHeader),
    FrameBegin,
    /// Marks the position of the trigger: the next logic sample is the first
    /// post-trigger sample.
    Trigger,
    /// `data.len() / unit_size` samples, little endian.
    Logic { unit_size: usize, data: &'a [u8] },
    /// Volts, one value per sample of the matching logic packet.
    Analog(&'a [f32]),
    FrameEnd,
    End,
}

pub trait SessionFeed {
    fn push(&mut self, packet: Packet<'_>);
}

impl<F: SessionFeed + ?Sized> SessionFeed for &mut F {
    fn push(&mut self, packet: Packet<'_>) {
        (**self).push(packet);
    }
}

impl<F: SessionFeed + ?Sized> SessionFeed for Box<F> {
    fn push(&mut self, packet: Packet<'_>) {
        (**self).push(packet);
    }
}

/// Owned copy of a [`Packet`].
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Header(FeedHeader),
    FrameBegin,
    Trigger,
    Logic { unit_size: usize, data: Vec<u8> },
    Analog(Vec<f32>),
    FrameEnd,
    End,
}

impl From<Packet<'_>> for FeedEvent {
    fn from(packet: Packet<'_>) -> Self {
        match packet {
            Packet::Header(header) => FeedEvent::Header(header.clone()),
            Packet::FrameBegin => FeedEvent::FrameBegin,
            Packet::Trigger => FeedEvent::Trigger,
            Packet::Logic { unit_size, data } => FeedEvent::Logic {
                unit_size,
                data: data.to_vec(),
            },
            Packet::Analog(volts) => FeedEvent::Analog(volts.to_vec()),
            Packet::FrameEnd => FeedEvent::FrameEnd,
            Packet::End => FeedEvent::End,
        }
    }
}

/// Forwards packets to another thread. Packets sent after the receiver is
/// gone are dropped.
impl SessionFeed for flume::Sender<FeedEvent> {
    fn push(&mut self, packet: Packet<'_>) {
        if self.send(packet.into()).is_err() {
            log::debug!("Feed receiver dropped, discarding packet");
        }
    }
}

/// Keeps every packet in memory.
#[derive(Debug, Default, Clone)]
pub struct RecordingFeed {
    events: Vec<FeedEvent>,
}

impl RecordingFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[FeedEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<FeedEvent> {
        self.events
    }

    /// All logic payload bytes, concatenated in arrival order.
    pub fn logic_bytes(&self) -> Vec<u8> {
        self.events
            .iter()
            .filter_map(|event| match event {
                FeedEvent::Logic { data, .. } => Some(data.as_slice()),
                _ => None,
            })
            .flatten()
            .copied()
            .collect()
    }

    pub fn logic_samples(&self) -> usize {
        self.events
            .iter()
            .map(|event| match event {
                FeedEvent::Logic { unit_size, data } => data.len() / unit_size,
                _ => 0,
            })
            .sum()
    }

    /// Headers in arrival order, one per started acquisition.
    pub fn headers(&self) -> impl Iterator<Item = &FeedHeader> {
        self.events.iter().filter_map(|event| match event {
            FeedEvent::Header(header) => Some(header),
            _ => None,
        })
    }

    /// Counts events of the same kind as `wanted`. Only meaningful for the
    /// unit variants; use [`Self::headers`] for headers.
    pub fn count(&self, wanted: &FeedEvent) -> usize {
        self.events
            .iter()
            .filter(|event| std::mem::discriminant(*event) == std::mem::discriminant(wanted))
            .count()
    }
}

impl SessionFeed for RecordingFeed {
    fn push(&mut self, packet: Packet<'_>) {
        self.events.push(packet.into());
    }
}
