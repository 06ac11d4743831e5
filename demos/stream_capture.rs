// Streaming capture example
//
// Captures from a serial logic analyzer bridge, or from a built-in synthetic
// analyzer when no port is given, and prints the result as a DataFrame.

use clap::Parser;
use logic_stream::device::{CMD_START, CMD_STOP};
use logic_stream::{
    AcquisitionConfig, AcquisitionController, CaptureFrame, DecodeMode, DeviceProfile,
    SampleWidth, SerialLogicDevice,
};
use std::io::{Read, Write};

#[derive(Parser)]
#[command(name = "stream_capture")]
#[command(version = "1.0")]
#[command(about = "Capture a stream of logic samples into a DataFrame")]
struct Args {
    /// Serial port of the analyzer bridge; omit to use the synthetic analyzer
    #[arg(short, long)]
    port: Option<String>,

    #[arg(short, long, default_value_t = 3_000_000)]
    baud: u32,

    /// Sample rate in Hz
    #[arg(short, long, default_value_t = 1_000_000)]
    samplerate: u64,

    /// Number of samples to capture
    #[arg(short = 'n', long, default_value_t = 10_000)]
    samples: u64,

    /// Time limit in milliseconds (0 for none)
    #[arg(short = 't', long, default_value_t = 0)]
    limit_msec: u64,

    /// Trigger, e.g. "0=r" or "2=1,3=f;2=0"
    #[arg(long)]
    trigger: Option<String>,

    /// Percentage of the capture taken before the trigger
    #[arg(long, default_value_t = 20)]
    capture_ratio: u8,

    /// Wire format of the analyzer
    #[arg(short, long, default_value = "plain", value_parser = ["plain", "rle"])]
    mode: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Counts up one value per sample, so bit `n` toggles every `2^n` samples.
struct SyntheticAnalyzer {
    running: bool,
    run_length: bool,
    counter: u8,
}

impl SyntheticAnalyzer {
    fn new(run_length: bool) -> Self {
        Self {
            running: false,
            run_length,
            counter: 0,
        }
    }
}

impl Read for SyntheticAnalyzer {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if !self.running {
            return Ok(0);
        }
        if self.run_length {
            // Each value held for 10 samples.
            let tokens = buf.len() / 2;
            for token in buf.chunks_exact_mut(2) {
                token[0] = 10;
                token[1] = self.counter;
                self.counter = self.counter.wrapping_add(1);
            }
            Ok(tokens * 2)
        } else {
            for byte in buf.iter_mut() {
                *byte = self.counter;
                self.counter = self.counter.wrapping_add(1);
            }
            Ok(buf.len())
        }
    }
}

impl Write for SyntheticAnalyzer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match buf.first() {
            Some(&CMD_START) => self.running = true,
            Some(&CMD_STOP) => self.running = false,
            _ => {}
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn capture<R: Read + Write>(
    device: SerialLogicDevice<R>,
    config: AcquisitionConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut acquisition = AcquisitionController::new(device, CaptureFrame::new(), config);
    let summary = acquisition.run()?;

    println!("Stopped: {:?}", summary.reason);
    println!("Samples sent: {}", summary.samples_sent);
    println!("Trigger fired: {}", summary.trigger_fired);
    if summary.malformed_tokens > 0 {
        println!("Malformed tokens skipped: {}", summary.malformed_tokens);
    }

    let (_, frame) = acquisition.into_parts();
    if let Some(index) = frame.trigger_index() {
        println!("Trigger at row {index}");
    }

    let df = frame.to_dataframe()?;
    println!("\n{}", df.head(Some(10)));
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    let mode = match args.mode.as_str() {
        "rle" => DecodeMode::RunLength,
        _ => DecodeMode::Plain,
    };

    let mut config = AcquisitionConfig::new(args.samplerate)
        .limit_samples(args.samples)
        .limit_msec(args.limit_msec)
        .capture_ratio(args.capture_ratio);
    if let Some(trigger) = &args.trigger {
        config = config.trigger_str(trigger)?;
    }

    println!("Logic Stream Capture");
    println!("====================");
    println!("Sample rate: {} Hz", args.samplerate);
    println!("Samples: {}", args.samples);
    if let Some(trigger) = &config.trigger {
        println!("Trigger: {trigger}");
    }

    let profile = DeviceProfile::new("fx2 bridge", mode, SampleWidth::Narrow);
    match &args.port {
        Some(port) => {
            println!("Port: {port}\n");
            capture(SerialLogicDevice::open(port, args.baud, profile)?, config)
        }
        None => {
            println!("Port: synthetic\n");
            let analyzer = SyntheticAnalyzer::new(mode == DecodeMode::RunLength);
            capture(SerialLogicDevice::new(profile, analyzer), config)
        }
    }
}
