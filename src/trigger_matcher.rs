//! Software trigger evaluated over decoded sample batches.

use std::collections::VecDeque;

use crate::stream_decoder::SampleBatch;
use crate::trigger_config::{TriggerSpec, TriggerStage};

/// Pre-roll limit for devices that do not state their own.
pub const DEFAULT_MAX_PRE_TRIGGER: u64 = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerState {
    WaitingForTrigger,
    Fired,
}

/// Where the trigger fired and what preceded it.
#[derive(Debug)]
pub struct TriggerHit {
    /// Index within the checked batch of the sample that completed the
    /// trigger. That sample is the first post-trigger sample.
    pub offset: usize,
    /// Retained history immediately preceding `offset`, oldest first.
    pub pre_trigger: SampleBatch,
}

impl TriggerHit {
    pub fn pre_trigger_samples(&self) -> usize {
        self.pre_trigger.len()
    }
}

/// Ring of the most recent samples seen while waiting for the trigger.
#[derive(Debug)]
struct PreTriggerBuffer {
    unit_size: usize,
    capacity: usize,
    logic: VecDeque<u8>,
    analog: Option<VecDeque<u8>>,
}

impl PreTriggerBuffer {
    fn new(unit_size: usize, with_analog: bool, capacity: usize) -> Self {
        Self {
            unit_size,
            capacity,
            logic: VecDeque::new(),
            analog: with_analog.then(VecDeque::new),
        }
    }

    /// Appends samples `[0, upto)` of `batch`, dropping the oldest beyond
    /// capacity.
    fn push(&mut self, batch: &SampleBatch, upto: usize) {
        if self.capacity == 0 || upto == 0 {
            return;
        }
        let start = upto.saturating_sub(self.capacity);
        let unit = self.unit_size;

        self.logic
            .extend(&batch.logic()[start * unit..upto * unit]);
        let excess = self.logic.len().saturating_sub(self.capacity * unit);
        self.logic.drain(..excess);

        if let (Some(lane), Some(src)) = (self.analog.as_mut(), batch.analog()) {
            lane.extend(&src[start..upto]);
            let excess = lane.len().saturating_sub(self.capacity);
            lane.drain(..excess);
        }
    }

    fn take(&mut self) -> SampleBatch {
        let history = SampleBatch::from_logic(self.unit_size, self.logic.drain(..).collect());
        match self.analog.as_mut() {
            Some(lane) => history.with_analog(lane.drain(..).collect()),
            None => history,
        }
    }
}

#[derive(Debug)]
pub struct TriggerMatcher {
    stages: Vec<TriggerStage>,
    state: TriggerState,
    cur_stage: usize,
    previous: Option<u16>,
    history: PreTriggerBuffer,
}

impl TriggerMatcher {
    /// Creates a matcher for one acquisition. Without a trigger the matcher
    /// starts out fired.
    pub fn new(
        trigger: Option<&TriggerSpec>,
        unit_size: usize,
        with_analog: bool,
        pre_trigger_capacity: usize,
    ) -> Self {
        let stages = trigger.map(|t| t.stages().to_vec()).unwrap_or_default();
        let state = if stages.is_empty() {
            TriggerState::Fired
        } else {
            TriggerState::WaitingForTrigger
        };
        Self {
            stages,
            state,
            cur_stage: 0,
            previous: None,
            history: PreTriggerBuffer::new(unit_size, with_analog, pre_trigger_capacity),
        }
    }

    pub fn state(&self) -> TriggerState {
        self.state
    }

    pub fn is_fired(&self) -> bool {
        self.state == TriggerState::Fired
    }

    pub fn pre_trigger_capacity(&self) -> usize {
        self.history.capacity
    }

    /// Scans `batch` for the trigger. Returns the hit on the sample that
    /// completes the last stage; otherwise the batch goes into the
    /// pre-trigger history.
    pub fn check(&mut self, batch: &SampleBatch) -> Option<TriggerHit> {
        #[cfg(feature = "cpu-profiling")]
        let _zone = tracy_client::span!("trigger_check");

        if self.is_fired() {
            return None;
        }

        let previous_batch_sample = self.previous;
        let len = batch.len();
        let mut i = 0;
        while i < len {
            let sample = batch.sample(i);
            let matched = self.stages[self.cur_stage].is_satisfied(sample, self.previous);
            self.previous = Some(sample);

            if matched {
                if self.cur_stage + 1 < self.stages.len() {
                    self.cur_stage += 1;
                } else {
                    self.history.push(batch, i);
                    self.state = TriggerState::Fired;
                    log::debug!("Trigger fired at batch offset {i}");
                    return Some(TriggerHit {
                        offset: i,
                        pre_trigger: self.history.take(),
                    });
                }
            } else if self.cur_stage > 0 {
                // A partial match broke off. Restart stage 0 on the sample
                // after the one that matched it.
                let restart = (i + 1).saturating_sub(self.cur_stage);
                self.cur_stage = 0;
                self.previous = if restart > 0 {
                    Some(batch.sample(restart - 1))
                } else {
                    previous_batch_sample
                };
                i = restart;
                continue;
            }
            i += 1;
        }

        self.history.push(batch, len);
        None
    }
}
