//! Neurophase Application
//!
//! Command-line entry point for the neurophase analysis pipeline. Drives
//! the phase and coherence pipelines with simulated multi-channel data so
//! the whole two-thread machinery can be exercised without an acquisition
//! host.
//!
//! # Usage
//!
//! ```bash
//! # Phase pipeline on a simulated 6 Hz theta rhythm
//! neurophase phase --freq 6 --seconds 5
//!
//! # Coherence between two 4-channel groups with one correlated pair
//! neurophase coherence --freq 12 --segments 4
//! ```

use std::f64::consts::PI;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use neurophase_core::types::Weighting;
use neurophase_native::processing::spectral::CoherenceConfig;
use neurophase_native::stream::host::StaticHost;
use neurophase_native::stream::phase::{ChannelBlock, PhaseConfig, PhaseStream};
use neurophase_native::CoherenceStream;

/// Neurophase real-time analysis pipeline
#[derive(Parser, Debug)]
#[command(name = "neurophase")]
#[command(author, version, about = "Real-time neural phase and coherence analysis", long_about = None)]
struct Cli {
    /// Logging verbosity level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the phase pipeline on a simulated sinusoid
    Phase {
        /// Simulated oscillation frequency in Hz
        #[arg(long, default_value = "6.0")]
        freq: f64,

        /// Sample rate in Hz (must be a multiple of 500)
        #[arg(long, default_value = "500.0")]
        rate: f64,

        /// Seconds of simulated signal
        #[arg(long, default_value = "5.0")]
        seconds: f64,

        /// Bandpass low cutoff in Hz
        #[arg(long, default_value = "4.0")]
        low: f64,

        /// Bandpass high cutoff in Hz
        #[arg(long, default_value = "8.0")]
        high: f64,
    },

    /// Run the coherence pipeline on two simulated channel groups
    Coherence {
        /// Frequency of the injected correlated tone in Hz
        #[arg(long, default_value = "12.0")]
        freq: f64,

        /// Sample rate in Hz
        #[arg(long, default_value = "1000.0")]
        rate: f64,

        /// Channels per group
        #[arg(long, default_value = "4")]
        group_size: usize,

        /// Number of segments to accumulate
        #[arg(long, default_value = "3")]
        segments: usize,

        /// Exponential weighting decay (0 = plain running mean)
        #[arg(long, default_value = "0.0")]
        alpha: f64,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("neurophase v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Phase {
            freq,
            rate,
            seconds,
            low,
            high,
        } => run_phase(freq, rate, seconds, low, high),
        Commands::Coherence {
            freq,
            rate,
            group_size,
            segments,
            alpha,
        } => run_coherence(freq, rate, group_size, segments, alpha),
    }
}

/// Feed a simulated sinusoid through the phase pipeline and report the
/// estimated instantaneous frequency once per second.
fn run_phase(freq: f64, rate: f64, seconds: f64, low: f64, high: f64) -> anyhow::Result<()> {
    let cfg = PhaseConfig {
        low_cut_hz: low,
        high_cut_hz: high,
        ..PhaseConfig::default()
    };
    let host = Arc::new(StaticHost::new(1, rate));
    let mut stream = PhaseStream::new(cfg, host)?;
    stream.start().map_err(|e| anyhow::anyhow!("{e}"))?;

    info!("simulating {seconds} s of a {freq} Hz oscillation at {rate} Hz");

    let block_len = (rate / 10.0) as usize;
    let total_blocks = (seconds * rate / block_len as f64) as usize;
    let mut phases: Vec<f32> = Vec::new();
    let started = Instant::now();

    for block_idx in 0..total_blocks {
        let start = block_idx * block_len;
        let mut samples: Vec<f32> = (start..start + block_len)
            .map(|i| (2.0 * PI * freq * i as f64 / rate).sin() as f32)
            .collect();

        let mut blocks = [ChannelBlock {
            samples: &mut samples,
            magnitude: None,
        }];
        stream.process_block(&mut blocks);
        phases.extend_from_slice(&samples);

        // Pace the simulation roughly at real time
        std::thread::sleep(Duration::from_millis(5));

        if phases.len() >= rate as usize {
            let est = estimate_frequency(&phases, rate);
            if est > 0.0 {
                info!(
                    "t = {:>4.1} s  estimated frequency {est:.2} Hz",
                    started.elapsed().as_secs_f64()
                );
            } else {
                info!("model warming up");
            }
            phases.clear();
        }
    }

    stream.stop();
    Ok(())
}

/// Mean instantaneous frequency implied by the wrapped phase stream, in Hz.
fn estimate_frequency(phases: &[f32], rate: f64) -> f64 {
    let mut total_step = 0.0f64;
    let mut count = 0usize;
    for pair in phases.windows(2) {
        if pair[0] == 0.0 && pair[1] == 0.0 {
            continue;
        }
        let mut step = f64::from(pair[1] - pair[0]);
        if step < -180.0 {
            step += 360.0;
        }
        total_step += step;
        count += 1;
    }
    if count == 0 {
        return 0.0;
    }
    (total_step / count as f64) * rate / 360.0
}

/// Feed correlated and uncorrelated simulated channels through the
/// coherence pipeline and print the resulting matrix peak.
fn run_coherence(
    freq: f64,
    rate: f64,
    group_size: usize,
    segments: usize,
    alpha: f64,
) -> anyhow::Result<()> {
    let cfg = CoherenceConfig {
        n_group1: group_size,
        n_group2: group_size,
        sample_rate_hz: rate,
        weighting: if alpha > 0.0 {
            Weighting::Exponential { alpha }
        } else {
            Weighting::Linear
        },
        ..CoherenceConfig::default()
    };
    let n_channels = cfg.n_channels();
    let seg_samples = cfg.segment_samples();
    let freqs: Vec<f64> = (0..cfg.n_freqs())
        .map(|k| cfg.freq_start_hz + k as f64 * cfg.freq_step_hz)
        .collect();

    let host = Arc::new(StaticHost::new(n_channels, rate));
    let mut stream = CoherenceStream::new(cfg, host)?;
    stream.start().map_err(|e| anyhow::anyhow!("{e}"))?;

    info!(
        "accumulating {segments} segments over {n_channels} channels; \
         channel 0 and channel {group_size} share a {freq} Hz tone"
    );

    let block_len = (rate / 10.0) as usize;
    let mut seed = 0x5eed_u64;

    for segment in 0..segments {
        let mut fed = 0;
        while fed < seg_samples {
            let n = block_len.min(seg_samples - fed);
            let start = segment * seg_samples + fed;
            let tone: Vec<f32> = (start..start + n)
                .map(|i| (2.0 * PI * freq * i as f64 / rate).sin() as f32)
                .collect();

            let channels: Vec<Vec<f32>> = (0..n_channels)
                .map(|chan| {
                    if chan == 0 || chan == group_size {
                        tone.iter()
                            .map(|&t| t + 0.05 * lcg_noise(&mut seed))
                            .collect()
                    } else {
                        (0..n).map(|_| lcg_noise(&mut seed)).collect()
                    }
                })
                .collect();
            let blocks: Vec<&[f32]> = channels.iter().map(Vec::as_slice).collect();
            stream.process_block(&blocks);
            fed += n;
        }

        while stream.has_pending_segment() {
            std::thread::sleep(Duration::from_millis(10));
        }
        info!("segment {} accumulated", segment + 1);
    }

    // Give the background thread a moment to publish the final matrix
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(matrix) = stream.latest_coherence() {
            let (comb, f, peak) = matrix
                .iter()
                .enumerate()
                .flat_map(|(comb, row)| {
                    row.iter().enumerate().map(move |(f, &c)| (comb, f, c))
                })
                .fold((0, 0, 0.0), |best, cur| if cur.2 > best.2 { cur } else { best });

            info!(
                "peak coherence {peak:.3} at {} Hz (combination {comb})",
                freqs[f]
            );
            break;
        }
        if Instant::now() > deadline {
            anyhow::bail!("coherence matrix never arrived");
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    stream.stop();
    Ok(())
}

fn lcg_noise(seed: &mut u64) -> f32 {
    *seed = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
    (((*seed >> 33) as f64 / f64::from(1u32 << 31)) - 0.5) as f32
}
