//! Turns raw transfer bytes into logic samples.
//!
//! Three wire formats are understood:
//!
//! - [`DecodeMode::Plain`]: every 1- or 2-byte little endian unit is a sample.
//! - [`DecodeMode::RunLength`]: tokens of `[count][value]`, where a count of
//!   [`RLE_MAX_COUNT`] rolls the run over into the next token.
//! - [`DecodeMode::Deinterleave`]: `[logic][analog]` byte pairs, split into a
//!   logic lane and a parallel analog lane.
//!
//! Tokens split across transfer boundaries are carried in [`DecoderState`]
//! and completed by the next call, so the output never depends on how the
//! transport chunked the stream.

use crate::device::SampleWidth;

/// Largest count a run-length token can carry. A token with this count does
/// not end the run.
pub const RLE_MAX_COUNT: u8 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMode {
    Plain,
    RunLength,
    Deinterleave,
}

/// Converts an analog lane byte to volts (0..=255 spans -10 V..+10 V).
pub fn analog_to_volts(raw: u8) -> f32 {
    (f32::from(raw) - 128.0) / 12.8
}

/// A run of decoded samples, optionally with a parallel analog lane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleBatch {
    unit_size: usize,
    logic: Vec<u8>,
    analog: Option<Vec<u8>>,
}

impl SampleBatch {
    pub fn new(unit_size: usize, with_analog: bool) -> Self {
        Self {
            unit_size,
            logic: Vec::new(),
            analog: with_analog.then(Vec::new),
        }
    }

    pub fn from_logic(unit_size: usize, logic: Vec<u8>) -> Self {
        Self {
            unit_size,
            logic,
            analog: None,
        }
    }

    /// Attaches a parallel analog lane; it must hold one byte per sample.
    pub fn with_analog(mut self, analog: Vec<u8>) -> Self {
        self.analog = Some(analog);
        self
    }

    pub fn unit_size(&self) -> usize {
        self.unit_size
    }

    pub fn logic(&self) -> &[u8] {
        &self.logic
    }

    pub fn analog(&self) -> Option<&[u8]> {
        self.analog.as_deref()
    }

    pub fn analog_volts(&self) -> Option<Vec<f32>> {
        self.analog
            .as_ref()
            .map(|lane| lane.iter().copied().map(analog_to_volts).collect())
    }

    /// Number of samples in the batch.
    pub fn len(&self) -> usize {
        self.logic.len() / self.unit_size
    }

    pub fn is_empty(&self) -> bool {
        self.logic.is_empty()
    }

    /// Logic value of the sample at `index`.
    pub fn sample(&self, index: usize) -> u16 {
        let start = index * self.unit_size;
        match self.unit_size {
            1 => u16::from(self.logic[start]),
            _ => u16::from_le_bytes([self.logic[start], self.logic[start + 1]]),
        }
    }

    pub fn push_sample(&mut self, value: u16) {
        self.push_run(value, 1);
    }

    fn push_run(&mut self, value: u16, count: u64) {
        let count = usize::try_from(count).unwrap_or(usize::MAX);
        match self.unit_size {
            1 => self
                .logic
                .extend(std::iter::repeat_n(value as u8, count)),
            _ => self
                .logic
                .extend(std::iter::repeat_n(value.to_le_bytes(), count).flatten()),
        }
    }

    /// Splits the batch at sample `at`; `self` keeps `[0, at)`.
    pub fn split_off(&mut self, at: usize) -> Self {
        let at = at.min(self.len());
        Self {
            unit_size: self.unit_size,
            logic: self.logic.split_off(at * self.unit_size),
            analog: self.analog.as_mut().map(|lane| lane.split_off(at)),
        }
    }

    /// Keeps only the first `samples` samples.
    pub fn truncate(&mut self, samples: usize) {
        self.logic.truncate(samples * self.unit_size);
        if let Some(lane) = self.analog.as_mut() {
            lane.truncate(samples);
        }
    }

    pub fn append(&mut self, mut other: Self) {
        self.logic.append(&mut other.logic);
        match (self.analog.as_mut(), other.analog.as_mut()) {
            (Some(lane), Some(more)) => lane.append(more),
            (None, Some(more)) => self.analog = Some(std::mem::take(more)),
            _ => {}
        }
    }
}

/// State carried between successive [`StreamDecoder::decode`] calls.
#[derive(Debug, Clone, Default)]
pub struct DecoderState {
    carry: Vec<u8>,
    rolled_over: Option<u16>,
    malformed_tokens: u64,
}

impl DecoderState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes of an incomplete token waiting for the next chunk.
    pub fn carried(&self) -> &[u8] {
        &self.carry
    }

    /// Value of a run whose last token rolled over, if the next token may
    /// still continue it.
    pub fn rolled_over(&self) -> Option<u16> {
        self.rolled_over
    }

    pub fn malformed_tokens(&self) -> u64 {
        self.malformed_tokens
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StreamDecoder {
    mode: DecodeMode,
    unit_size: usize,
}

impl StreamDecoder {
    pub fn new(mode: DecodeMode, width: SampleWidth) -> Self {
        let unit_size = match mode {
            DecodeMode::Deinterleave => 1,
            DecodeMode::Plain | DecodeMode::RunLength => width.unit_size(),
        };
        Self { mode, unit_size }
    }

    pub fn mode(&self) -> DecodeMode {
        self.mode
    }

    pub fn unit_size(&self) -> usize {
        self.unit_size
    }

    /// Number of raw bytes making up one token on the wire.
    pub fn token_width(&self) -> usize {
        match self.mode {
            DecodeMode::Plain => self.unit_size,
            DecodeMode::RunLength => 1 + self.unit_size,
            DecodeMode::Deinterleave => 2,
        }
    }

    pub fn decode(&self, raw: &[u8], state: &mut DecoderState) -> SampleBatch {
        #[cfg(feature = "cpu-profiling")]
        let _zone = tracy_client::span!("decode");

        let width = self.token_width();
        let mut batch = SampleBatch::new(self.unit_size, self.mode == DecodeMode::Deinterleave);
        let mut input = raw;

        if !state.carry.is_empty() {
            let take = (width - state.carry.len()).min(input.len());
            state.carry.extend_from_slice(&input[..take]);
            input = &input[take..];
            if state.carry.len() < width {
                return batch;
            }
            let token = std::mem::take(&mut state.carry);
            self.decode_token(&token, state, &mut batch);
        }

        let mut tokens = input.chunks_exact(width);
        for token in &mut tokens {
            self.decode_token(token, state, &mut batch);
        }
        state.carry.extend_from_slice(tokens.remainder());

        batch
    }

    /// Ends the stream. An incomplete trailing token cannot be decoded and is
    /// discarded. Every decoded sample has already been returned by
    /// [`Self::decode`], rolled-over runs included.
    pub fn finish(&self, state: &mut DecoderState) {
        state.rolled_over = None;
        if !state.carry.is_empty() {
            log::debug!(
                "Discarding {} bytes of an incomplete trailing token",
                state.carry.len()
            );
            state.carry.clear();
        }
    }

    fn decode_token(&self, token: &[u8], state: &mut DecoderState, batch: &mut SampleBatch) {
        match self.mode {
            DecodeMode::Plain => batch.logic.extend_from_slice(token),
            DecodeMode::Deinterleave => {
                batch.logic.push(token[0]);
                if let Some(lane) = batch.analog.as_mut() {
                    lane.push(token[1]);
                }
            }
            DecodeMode::RunLength => {
                let count = token[0];
                let value = match self.unit_size {
                    1 => u16::from(token[1]),
                    _ => u16::from_le_bytes([token[1], token[2]]),
                };
                Self::decode_run(count, value, state, batch);
            }
        }
    }

    fn decode_run(count: u8, value: u16, state: &mut DecoderState, batch: &mut SampleBatch) {
        let continues = state.rolled_over.take() == Some(value);
        match count {
            // Terminates a run that was an exact multiple of the rollover.
            0 if continues => {}
            0 => {
                state.malformed_tokens += 1;
                log::warn!(
                    "Skipping zero-length run token for value {value:#06x} (no run to terminate)"
                );
            }
            RLE_MAX_COUNT => {
                batch.push_run(value, u64::from(count));
                state.rolled_over = Some(value);
            }
            _ => batch.push_run(value, u64::from(count)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Encodes `count` repetitions of `value` as narrow run-length tokens.
    fn encode_run(value: u8, count: u64) -> Vec<u8> {
        let mut out = Vec::new();
        let mut left = count;
        while left >= u64::from(RLE_MAX_COUNT) {
            out.extend_from_slice(&[RLE_MAX_COUNT, value]);
            left -= u64::from(RLE_MAX_COUNT);
        }
        // A zero count terminates a run that was an exact multiple.
        out.extend_from_slice(&[left as u8, value]);
        out
    }

    fn decode_in_chunks(decoder: &StreamDecoder, raw: &[u8], chunk: usize) -> SampleBatch {
        let mut state = DecoderState::new();
        let mut out = SampleBatch::new(
            decoder.unit_size(),
            decoder.mode() == DecodeMode::Deinterleave,
        );
        for piece in raw.chunks(chunk) {
            out.append(decoder.decode(piece, &mut state));
        }
        decoder.finish(&mut state);
        out
    }

    #[test]
    fn test_plain_narrow_passthrough() {
        let decoder = StreamDecoder::new(DecodeMode::Plain, SampleWidth::Narrow);
        let mut state = DecoderState::new();
        let batch = decoder.decode(&[1, 2, 3], &mut state);
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.logic(), &[1, 2, 3]);
        assert!(batch.analog().is_none());
    }

    #[test]
    fn test_plain_wide_carries_partial_unit() {
        let decoder = StreamDecoder::new(DecodeMode::Plain, SampleWidth::Wide);
        let mut state = DecoderState::new();

        let first = decoder.decode(&[0x34, 0x12, 0x78], &mut state);
        assert_eq!(first.len(), 1);
        assert_eq!(first.sample(0), 0x1234);
        assert_eq!(state.carried(), &[0x78]);

        let second = decoder.decode(&[0x56], &mut state);
        assert_eq!(second.len(), 1);
        assert_eq!(second.sample(0), 0x5678);
        assert!(state.carried().is_empty());
    }

    #[test]
    fn test_chunking_does_not_change_output() {
        let raw: Vec<u8> = (0..=255u8).cycle().take(1001).collect();
        for (mode, width) in [
            (DecodeMode::Plain, SampleWidth::Narrow),
            (DecodeMode::Plain, SampleWidth::Wide),
            (DecodeMode::Deinterleave, SampleWidth::Narrow),
        ] {
            let decoder = StreamDecoder::new(mode, width);
            let whole = decode_in_chunks(&decoder, &raw, raw.len());
            for chunk in [1, 3, 7, 64] {
                assert_eq!(decode_in_chunks(&decoder, &raw, chunk), whole);
            }
        }
    }

    #[test]
    fn test_rle_chunking_does_not_change_output() {
        let mut raw = encode_run(0xaa, 775);
        raw.extend(encode_run(0x55, 3));
        raw.extend(encode_run(0xaa, 510));
        raw.extend(encode_run(0x01, 1));
        let decoder = StreamDecoder::new(DecodeMode::RunLength, SampleWidth::Narrow);
        let whole = decode_in_chunks(&decoder, &raw, raw.len());
        assert_eq!(whole.len(), 775 + 3 + 510 + 1);
        for chunk in [1, 2, 3, 5] {
            assert_eq!(decode_in_chunks(&decoder, &raw, chunk), whole);
        }
    }

    #[test]
    fn test_rle_rollover_scenario() {
        let decoder = StreamDecoder::new(DecodeMode::RunLength, SampleWidth::Narrow);
        let mut state = DecoderState::new();
        let raw = [255, 0xaa, 255, 0xaa, 255, 0xaa, 10, 0xaa];
        let batch = decoder.decode(&raw, &mut state);
        assert_eq!(batch.len(), 255 * 3 + 10);
        assert!(batch.logic().iter().all(|&b| b == 0xaa));
        assert_eq!(state.rolled_over(), None);
    }

    #[test]
    fn test_rle_round_trip() {
        let decoder = StreamDecoder::new(DecodeMode::RunLength, SampleWidth::Narrow);
        for n in [1u64, 7, 254, 255, 256, 509, 510, 511, 2000] {
            let mut state = DecoderState::new();
            let batch = decoder.decode(&encode_run(0x3c, n), &mut state);
            assert_eq!(batch.len() as u64, n, "run of {n}");
            assert!(batch.logic().iter().all(|&b| b == 0x3c));
        }
    }

    #[test]
    fn test_rle_rollover_is_emitted_immediately() {
        let decoder = StreamDecoder::new(DecodeMode::RunLength, SampleWidth::Narrow);
        let mut state = DecoderState::new();

        let first = decoder.decode(&[255, 0x01], &mut state);
        assert_eq!(first.len(), 255);
        assert_eq!(state.rolled_over(), Some(0x01));

        let second = decoder.decode(&[2, 0x02], &mut state);
        assert_eq!(second.logic(), &[0x02, 0x02]);
        assert_eq!(state.rolled_over(), None);
    }

    #[test]
    fn test_rle_constant_line_never_holds_samples() {
        let decoder = StreamDecoder::new(DecodeMode::RunLength, SampleWidth::Narrow);
        let mut state = DecoderState::new();
        for _ in 0..4 {
            let batch = decoder.decode(&[255, 0xaa, 255, 0xaa], &mut state);
            assert_eq!(batch.len(), 510);
        }
        decoder.finish(&mut state);
        assert_eq!(state.rolled_over(), None);
    }

    #[test]
    fn test_rle_zero_count_terminates_rollover() {
        let decoder = StreamDecoder::new(DecodeMode::RunLength, SampleWidth::Narrow);
        let mut state = DecoderState::new();
        let batch = decoder.decode(&[255, 0x07, 0, 0x07, 0, 0x07], &mut state);
        assert_eq!(batch.len(), 255);
        // The second zero count has no run left to terminate.
        assert_eq!(state.malformed_tokens(), 1);
    }

    #[test]
    fn test_rle_wide_tokens() {
        let decoder = StreamDecoder::new(DecodeMode::RunLength, SampleWidth::Wide);
        let mut state = DecoderState::new();
        let batch = decoder.decode(&[3, 0x01, 0x80, 1, 0xff, 0x00], &mut state);
        assert_eq!(batch.len(), 4);
        assert_eq!(batch.sample(0), 0x8001);
        assert_eq!(batch.sample(3), 0x00ff);
    }

    #[test]
    fn test_rle_malformed_token_is_skipped() {
        let decoder = StreamDecoder::new(DecodeMode::RunLength, SampleWidth::Narrow);
        let mut state = DecoderState::new();
        let batch = decoder.decode(&[2, 0x10, 0, 0x20, 1, 0x30], &mut state);
        assert_eq!(batch.logic(), &[0x10, 0x10, 0x30]);
        assert_eq!(state.malformed_tokens(), 1);
    }

    #[test]
    fn test_deinterleave_splits_lanes() {
        let decoder = StreamDecoder::new(DecodeMode::Deinterleave, SampleWidth::Wide);
        let mut state = DecoderState::new();
        let batch = decoder.decode(&[0x01, 128, 0x02, 0, 0x03], &mut state);
        assert_eq!(batch.unit_size(), 1);
        assert_eq!(batch.logic(), &[0x01, 0x02]);
        assert_eq!(batch.analog(), Some(&[128u8, 0][..]));
        assert_eq!(state.carried(), &[0x03]);

        let volts = batch.analog_volts().unwrap();
        assert!(volts[0].abs() < f32::EPSILON);
        assert!((volts[1] + 10.0).abs() < 1e-5);
    }

    #[test]
    fn test_split_and_truncate_keep_lanes_aligned() {
        let decoder = StreamDecoder::new(DecodeMode::Deinterleave, SampleWidth::Narrow);
        let mut state = DecoderState::new();
        let mut batch = decoder.decode(&[1, 11, 2, 12, 3, 13, 4, 14], &mut state);
        let mut tail = batch.split_off(1);
        assert_eq!(batch.logic(), &[1]);
        assert_eq!(batch.analog(), Some(&[11u8][..]));
        tail.truncate(2);
        assert_eq!(tail.logic(), &[2, 3]);
        assert_eq!(tail.analog(), Some(&[12u8, 13][..]));
    }
}
