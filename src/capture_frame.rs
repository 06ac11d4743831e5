//! Collects a session feed into a polars [`DataFrame`].

use polars::prelude::*;

use crate::session_feed::{Packet, SessionFeed};

const TIME_COLUMN_NAME: &str = "time";
const LOGIC_COLUMN_NAME: &str = "logic";
const ANALOG_COLUMN_NAME: &str = "analog";
const ROW_INDEX_NAME: &str = "row_index";

/// A [`SessionFeed`] that keeps every sample so the capture can be turned
/// into a table afterwards.
#[derive(Debug, Default, Clone)]
pub struct CaptureFrame {
    samplerate: u64,
    num_logic_channels: usize,
    logic: Vec<u32>,
    analog: Vec<f32>,
    trigger_index: Option<usize>,
    frames: usize,
    ended: bool,
}

impl CaptureFrame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn samplerate(&self) -> u64 {
        self.samplerate
    }

    pub fn len(&self) -> usize {
        self.logic.len()
    }

    pub fn is_empty(&self) -> bool {
        self.logic.is_empty()
    }

    /// Row of the first post-trigger sample.
    pub fn trigger_index(&self) -> Option<usize> {
        self.trigger_index
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Whether the acquisition has ended.
    pub fn is_complete(&self) -> bool {
        self.ended
    }

    /// Builds a frame with a `time` column in seconds, the raw `logic`
    /// word, one boolean `bit_<n>` column per logic channel and, for devices
    /// with an analog lane, `analog` in volts.
    pub fn to_dataframe(&self) -> Result<DataFrame, PolarsError> {
        #[cfg(feature = "cpu-profiling")]
        let _zone = tracy_client::span!("to_dataframe");

        let mut columns: Vec<Column> =
            vec![Series::new(LOGIC_COLUMN_NAME.into(), &self.logic).into()];
        let mut names = vec![LOGIC_COLUMN_NAME.to_string()];

        for bit in 0..self.num_logic_channels {
            let values: Vec<bool> = self.logic.iter().map(|v| (v >> bit) & 1 == 1).collect();
            let name = format!("bit_{bit}");
            columns.push(Series::new(name.as_str().into(), values).into());
            names.push(name);
        }

        if !self.analog.is_empty() {
            if self.analog.len() == self.logic.len() {
                columns.push(Series::new(ANALOG_COLUMN_NAME.into(), &self.analog).into());
                names.push(ANALOG_COLUMN_NAME.to_string());
            } else {
                log::warn!(
                    "Dropping analog lane: {} values for {} logic samples",
                    self.analog.len(),
                    self.logic.len()
                );
            }
        }

        let period = if self.samplerate == 0 {
            0.0
        } else {
            1.0 / self.samplerate as f64
        };

        let mut order = vec![col(TIME_COLUMN_NAME)];
        order.extend(names.iter().map(|name| col(name.as_str())));

        DataFrame::new(columns)?
            .lazy()
            .with_row_index(ROW_INDEX_NAME, Some(0))
            .with_columns([(col(ROW_INDEX_NAME).cast(DataType::Float64) * lit(period))
                .alias(TIME_COLUMN_NAME)])
            .select(order)
            .collect()
    }
}

impl SessionFeed for CaptureFrame {
    fn push(&mut self, packet: Packet<'_>) {
        match packet {
            Packet::Header(header) => {
                self.samplerate = header.samplerate;
                self.num_logic_channels = header.num_logic_channels;
            }
            Packet::FrameBegin => self.frames += 1,
            Packet::Trigger => {
                if self.trigger_index.is_none() {
                    self.trigger_index = Some(self.logic.len());
                }
            }
            Packet::Logic { unit_size, data } => match unit_size {
                1 => self.logic.extend(data.iter().map(|&b| u32::from(b))),
                _ => self.logic.extend(
                    data.chunks_exact(unit_size)
                        .map(|unit| u32::from(u16::from_le_bytes([unit[0], unit[1]]))),
                ),
            },
            Packet::Analog(volts) => self.analog.extend_from_slice(volts),
            Packet::FrameEnd => {}
            Packet::End => self.ended = true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session_feed::FeedHeader;
    use std::time::SystemTime;

    fn header(samplerate: u64, channels: usize, analog: usize) -> FeedHeader {
        FeedHeader {
            samplerate,
            num_logic_channels: channels,
            num_analog_channels: analog,
            start_time: SystemTime::now(),
        }
    }

    #[test]
    fn test_builds_bit_columns() {
        let mut frame = CaptureFrame::new();
        frame.push(Packet::Header(&header(1000, 8, 0)));
        frame.push(Packet::FrameBegin);
        frame.push(Packet::Logic {
            unit_size: 1,
            data: &[0b01, 0b10, 0b11],
        });
        frame.push(Packet::Trigger);
        frame.push(Packet::Logic {
            unit_size: 1,
            data: &[0],
        });
        frame.push(Packet::FrameEnd);
        frame.push(Packet::End);

        assert!(frame.is_complete());
        assert_eq!(frame.trigger_index(), Some(3));

        let df = frame.to_dataframe().unwrap();
        assert_eq!(df.height(), 4);
        assert_eq!(df.width(), 2 + 8);
        assert_eq!(df.get_column_names()[0].as_str(), TIME_COLUMN_NAME);

        let time = df.column(TIME_COLUMN_NAME).unwrap().f64().unwrap();
        assert!((time.get(1).unwrap() - 0.001).abs() < 1e-12);

        let bit0: Vec<Option<bool>> = df.column("bit_0").unwrap().bool().unwrap().into_iter().collect();
        assert_eq!(bit0, vec![Some(true), Some(false), Some(true), Some(false)]);
    }

    #[test]
    fn test_wide_samples_and_analog_lane() {
        let mut frame = CaptureFrame::new();
        frame.push(Packet::Header(&header(500, 16, 1)));
        frame.push(Packet::Logic {
            unit_size: 2,
            data: &[0x00, 0x80, 0x01, 0x00],
        });
        frame.push(Packet::Analog(&[1.0, -1.0]));

        let df = frame.to_dataframe().unwrap();
        assert_eq!(df.width(), 2 + 16 + 1);
        let bit15: Vec<Option<bool>> = df.column("bit_15").unwrap().bool().unwrap().into_iter().collect();
        assert_eq!(bit15, vec![Some(true), Some(false)]);
        let analog = df.column(ANALOG_COLUMN_NAME).unwrap().f32().unwrap();
        assert_eq!(analog.get(1), Some(-1.0));
    }
}
