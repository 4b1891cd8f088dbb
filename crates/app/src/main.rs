use anyhow::Result;
use clap::{Parser, Subcommand};
use crossbeam_channel::bounded;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

mod config;
mod sim;

use config::AppConfig;
use driftmic_core::constants::{FRAME_ADVANCE, PIPELINE_CHANNELS, SAMPLE_FULL_SCALE};
use driftmic_core::{
    linear_kernel_factory, AudioPipeline, ClockRecovery, FrameAssembler, GainController,
    PipelineConfig, PlaybackBlock, PlaybackBridge, SampleRate, WindowedRateEstimator,
};
use sim::{
    SimClockGenerator, SimEdgeCounter, SimLineOut, SimMicrophone, SimReferenceInput,
    SimSendBuffer, SimUsbHost,
};

#[derive(Parser)]
#[command(name = "driftmic")]
#[command(about = "DriftMic: clock-drift tolerant voice capture", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// List supported sample rates
    Rates,
    /// Run the capture front-end against simulated devices (press Ctrl+C to stop)
    Run {
        /// Read configuration from this file instead of the user default
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Stop after this many delivered frames (0 = run until interrupted)
        #[arg(short, long)]
        frames: Option<u64>,
        /// Reference clock offset in parts per million
        #[arg(long)]
        ppm: Option<i32>,
    },
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Rates) => {
            println!("Supported sample rates:");
            for rate in SampleRate::ALL {
                println!("  {:>6} Hz (code {})", rate.hz(), rate.code() as u8);
            }
        }
        Some(Commands::Run { config, frames, ppm }) => {
            run(config, frames, ppm)?;
        }
        None => {
            println!("Use 'driftmic run' to start a simulated capture session.");
            println!("See 'driftmic --help' for the full command list.");
        }
    }

    Ok(())
}

fn run(config_path: Option<PathBuf>, frames: Option<u64>, ppm: Option<i32>) -> Result<()> {
    let mut app_cfg = match config_path {
        Some(path) => AppConfig::load_from(&path),
        None => AppConfig::load(),
    };
    if let Some(frames) = frames {
        app_cfg.frames = frames;
    }
    if let Some(ppm) = ppm {
        app_cfg.reference_trim_ppm = ppm;
    }

    let reference_rate = SampleRate::try_from(app_cfg.reference_rate_hz)?;
    let pipeline_rate = SampleRate::try_from(app_cfg.pipeline_rate_hz)?;

    let pipe_cfg = PipelineConfig {
        reference_rate,
        pipeline_rate,
        fs_ratio_trim_ppm: app_cfg.reference_trim_ppm,
        ..PipelineConfig::default()
    };
    let profile = pipe_cfg.profile();

    // Capture side: microphone in the pipeline domain, reference at its own
    // rate, and the two clocks the assembler snapshots each frame. The bit
    // clock runs at 64 fs of the reference; the master clock at 24.576 MHz.
    let frame_seconds = FRAME_ADVANCE as f64 / pipeline_rate.hz() as f64;
    let bclk_step = (64.0 * reference_rate.hz() as f64 * frame_seconds) as u32;
    let mclk_step = (24_576_000.0 * frame_seconds) as u32;

    let mut assembler = FrameAssembler::new(
        &profile,
        PIPELINE_CHANNELS,
        FRAME_ADVANCE,
        Box::new(SimMicrophone::new(pipeline_rate.hz())),
        Box::new(SimReferenceInput::new(
            reference_rate.hz(),
            app_cfg.reference_trim_ppm,
        )),
        Box::new(SimEdgeCounter::new(0x1000, bclk_step)),
        Box::new(SimEdgeCounter::new(0x8000, mclk_step)),
        linear_kernel_factory(profile),
    )?;
    assembler.set_fs_ratio(pipe_cfg.trimmed_fs_ratio());

    let (line_out, delivered_samples) = SimLineOut::new();
    let gain = Box::new(GainController::new(app_cfg.agc_target_level));
    let pipeline = AudioPipeline::start(assembler, Box::new(line_out), gain)?;
    let telemetry = pipeline.telemetry().clone();

    // Clock recovery fed by a simulated host running a configurable offset
    // away from nominal.
    let nominal_bytes = pipeline_rate.hz() * PIPELINE_CHANNELS as u32 * 4 / 1000;
    let estimator = Box::new(WindowedRateEstimator::new(nominal_bytes, 64));
    let (producer, recovery) = ClockRecovery::start(estimator, Box::new(SimClockGenerator))?;
    let usb_host = SimUsbHost::start(producer, nominal_bytes, app_cfg.usb_offset_ppm)?;

    // Playback path: a feeder stands in for the host's stream, the bridge
    // gates it into the send buffer.
    let send_buffer = Box::new(SimSendBuffer::new(
        app_cfg.send_buffer_frames * PIPELINE_CHANNELS,
        PIPELINE_CHANNELS,
        pipeline_rate.hz(),
    )?);
    let bridge = PlaybackBridge::new(send_buffer, PIPELINE_CHANNELS, pipeline_rate.hz());
    let (play_tx, play_rx) = bounded::<PlaybackBlock>(4);
    let bridge_thread = thread::Builder::new()
        .name("driftmic-bridge".into())
        .spawn(move || bridge.run(play_rx))?;

    let running = Arc::new(AtomicBool::new(true));
    let feeder = spawn_playback_feeder(
        play_tx,
        running.clone(),
        app_cfg.playback_packet_frames,
        pipeline_rate.hz(),
    )?;

    println!(
        "DriftMic active ({} -> {}). Press Ctrl+C to stop.",
        reference_rate, pipeline_rate
    );

    // Graceful shutdown handling
    let r = running.clone();
    ctrlc::set_handler(move || {
        println!("\nShutting down gracefully...");
        r.store(false, Ordering::Relaxed);
    })?;

    while running.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(500));
        let delivered = telemetry.frames_delivered.load(Ordering::Relaxed) as u64;
        log::info!(
            "frames {} carryover {} bclk {:#06x} mclk {:#06x} gain {:.2} pll {} ({} writes)",
            delivered,
            telemetry.carryover_samples.load(Ordering::Relaxed),
            telemetry.bit_clock_delta.load(Ordering::Relaxed),
            telemetry.master_clock_delta.load(Ordering::Relaxed),
            telemetry.current_gain(),
            recovery.last_numerator(),
            recovery.numerator_writes(),
        );
        if app_cfg.frames > 0 && delivered >= app_cfg.frames {
            running.store(false, Ordering::Relaxed);
        }
    }

    // Stop the event stream first so the control loop sees its producer
    // disconnect, then let the recovery drop join it.
    usb_host.stop();
    let final_numerator = recovery.last_numerator();
    let final_writes = recovery.numerator_writes();
    drop(recovery);

    let _ = feeder.join();
    let _ = bridge_thread.join();
    // Capture threads stay parked on their sources; they die with the
    // process.
    drop(pipeline);

    println!(
        "DriftMic stopped. {} frames delivered ({} samples), pll numerator {} after {} writes.",
        telemetry.frames_delivered.load(Ordering::Relaxed),
        delivered_samples.load(Ordering::Relaxed),
        final_numerator,
        final_writes,
    );

    Ok(())
}

/// Paces playback packets at roughly the transport's service interval, with
/// an interface reopen scripted a little into the session to exercise the
/// bridge's drain-and-prime cycle.
fn spawn_playback_feeder(
    play_tx: crossbeam_channel::Sender<PlaybackBlock>,
    running: Arc<AtomicBool>,
    packet_frames: usize,
    rate_hz: u32,
) -> Result<thread::JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("driftmic-play".into())
        .spawn(move || {
            let mut clock = 0u64;
            let mut packet = 0u64;
            while running.load(Ordering::Relaxed) {
                let mut samples = vec![0i32; packet_frames * PIPELINE_CHANNELS];
                for pair in samples.chunks_exact_mut(PIPELINE_CHANNELS) {
                    let t = clock as f64 / rate_hz as f64;
                    let angle = std::f64::consts::TAU * 330.0 * t;
                    let s = (0.1 * SAMPLE_FULL_SCALE * angle.sin()) as i32;
                    pair.fill(s);
                    clock += 1;
                }
                packet += 1;
                let block = PlaybackBlock {
                    samples,
                    rate_hz,
                    interface_reopened: packet == 1500,
                };
                if play_tx.send(block).is_err() {
                    break;
                }
                thread::sleep(Duration::from_millis(1));
            }
        })?;
    Ok(handle)
}
