//! vartap server - standalone headless demo runtime.
//!
//! Runs a synthetic audio host (a plain thread ticking the watcher manager
//! at block rate), a small oscillator DSP writing watched variables, and
//! the WebSocket control/data server. Hosts can list, watch, log, monitor
//! and control the variables, and push amplitude frames back into the
//! runtime over the binary channel.

mod config;
mod dsp;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use parking_lot::Mutex;
use tokio::signal;
use vartap_core::{AppState, InboundRegistry, TimestampMode, ValueKind, Watched, Watcher};

use crate::config::ServerConfig;
use crate::dsp::Oscillator;

/// Buffer id hosts push amplitude frames to.
const AMP_BUFFER_ID: u32 = 0;

/// Amplitude ring capacity, in samples.
const AMP_RING_CAPACITY: usize = 30 * 1024;

/// Write-side head start so the reader never catches the writer while the
/// host is still warming up.
const AMP_RING_PREFILL: usize = 2560;

/// vartap server - headless watched-variable instrumentation demo.
#[derive(Parser, Debug)]
#[command(name = "vartap-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "VARTAP_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Bind port (overrides config file).
    #[arg(short = 'p', long, env = "VARTAP_BIND_PORT")]
    port: Option<u16>,

    /// Directory for binary log files.
    #[arg(short = 'd', long, env = "VARTAP_LOG_DIR")]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("vartap server v{}", env!("CARGO_PKG_VERSION"));

    let mut config = ServerConfig::load(args.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(port) = args.port {
        config.bind_port = port;
    }
    if let Some(log_dir) = args.log_dir {
        config.log_dir = Some(log_dir);
    }

    log::info!(
        "Configuration: bind_port={}, sample_rate={}, block_frames={}",
        config.bind_port,
        config.sample_rate,
        config.block_frames
    );

    // Manager, transport and inbound table
    let (mut watcher, hub) = Watcher::new(config.to_watcher_config()?);
    let inbound = Arc::new(InboundRegistry::new());
    let state = AppState::new(Arc::clone(&hub), Arc::clone(&inbound));
    watcher.bind_transport(state.transport.clone());

    // Host-pushed amplitude frames land in a lock-free ring the audio
    // thread drains; the prefill keeps the reader behind the writer.
    let (mut amp_producer, amp_consumer) = rtrb::RingBuffer::<f32>::new(AMP_RING_CAPACITY);
    for _ in 0..AMP_RING_PREFILL {
        let _ = amp_producer.push(0.0);
    }
    let amp_producer = Mutex::new(amp_producer);
    inbound.register(AMP_BUFFER_ID, ValueKind::F32, move |frame| {
        let mut producer = amp_producer.lock();
        for value in frame.values_as::<f32>() {
            if producer.push(value).is_err() {
                log::warn!("[Inbound] amplitude ring full, dropping rest of frame");
                break;
            }
        }
    });

    // Watched variables (registered from the setup scope)
    let osc: Watched<f32> = watcher
        .register("osc", TimestampMode::Block)
        .context("registering 'osc'")?;
    let lfo: Watched<f32> = watcher
        .register("lfo", TimestampMode::Sample)
        .context("registering 'lfo'")?;
    let blocks: Watched<u32> = watcher
        .register("blocks", TimestampMode::Block)
        .context("registering 'blocks'")?;

    // Synthetic audio host thread
    let stop = Arc::new(AtomicBool::new(false));
    let audio = std::thread::Builder::new().name("vartap-audio".into()).spawn({
        let stop = Arc::clone(&stop);
        let sample_rate = config.sample_rate;
        let block_frames = config.block_frames;
        move || audio_loop(watcher, osc, lfo, blocks, amp_consumer, stop, sample_rate, block_frames)
    })?;

    // HTTP/WebSocket server
    let port = config.bind_port;
    let server_state = state.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = vartap_core::start_server(server_state, port).await {
            log::error!("Server error: {}", e);
        }
    });

    shutdown_signal().await;
    log::info!("Shutdown signal received, cleaning up...");

    stop.store(true, Ordering::Relaxed);
    if audio.join().is_err() {
        log::error!("Audio thread panicked");
    }
    state.connections.close_all();
    hub.shutdown();
    server_handle.abort();

    log::info!("Shutdown complete");
    Ok(())
}

/// The synthetic audio callback loop: one manager tick per block, per-frame
/// DSP writing the watched variables.
#[allow(clippy::too_many_arguments)]
fn audio_loop(
    mut watcher: Watcher,
    mut osc: Watched<f32>,
    mut lfo: Watched<f32>,
    mut blocks: Watched<u32>,
    mut amp: rtrb::Consumer<f32>,
    stop: Arc<AtomicBool>,
    sample_rate: f32,
    block_frames: u64,
) {
    let mut carrier = Oscillator::new(440.0, sample_rate);
    let mut slow = Oscillator::new(2.0, sample_rate);
    let block = Duration::from_secs_f64(block_frames as f64 / sample_rate as f64);
    let mut frames_elapsed: u64 = 0;
    let mut last_amp = 0.0f32;

    while !stop.load(Ordering::Relaxed) {
        watcher.tick(frames_elapsed);
        blocks.set(&mut watcher, (frames_elapsed / block_frames) as u32);

        for _ in 0..block_frames {
            last_amp = amp.pop().unwrap_or(last_amp);
            osc.set(&mut watcher, carrier.next() * last_amp);
            lfo.set(&mut watcher, slow.next());
        }

        frames_elapsed += block_frames;
        std::thread::sleep(block);
    }
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
