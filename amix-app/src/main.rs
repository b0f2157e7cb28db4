//! amixd - stream mixer daemon
//!
//! Plays a media tone through the mixer on the default output device, rings
//! an alarm chime over it while media is ducked, and logs what comes out of
//! the loopback tap.

mod cpal_output;
mod tone;

use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use crossbeam_channel::{select, tick, unbounded};
use tracing::info;
use tracing_subscriber::EnvFilter;

use amix_audio::{
    AudioContentType, LoopbackEvent, LoopbackHandler, MixerConfig, MixerOutputStream, NullOutputStream, StreamMixer,
};
use cpal_output::CpalOutputStream;
use tone::ToneSource;

/// How often loopback levels are logged
const REPORT_INTERVAL: Duration = Duration::from_millis(500);
/// Media limit while the chime plays
const DUCKED_LIMIT: f32 = 0.3;

struct Args {
    seconds: u64,
    null_output: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        seconds: 5,
        null_output: false,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--seconds" => {
                let value = iter.next().context("--seconds needs a value")?;
                args.seconds = value.parse().with_context(|| format!("invalid --seconds '{value}'"))?;
            }
            "--null-output" => args.null_output = true,
            other => bail!("unknown argument '{other}' (usage: amixd [--seconds N] [--null-output])"),
        }
    }
    Ok(args)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = parse_args()?;
    let config = MixerConfig::load();
    info!(path = %config.pipeline_path().display(), "using pipeline description");

    let loopback = LoopbackHandler::new();
    let loopback_rx = loopback.subscribe(256);
    let (counts_tx, counts_rx) = unbounded();

    let null_output = args.null_output;
    let mixer = StreamMixer::builder()
        .config(config)
        .loopback(loopback.clone())
        .stream_count_observer(counts_tx)
        .output_factory(move || -> Box<dyn MixerOutputStream> {
            if null_output {
                Box::new(NullOutputStream::new())
            } else {
                Box::new(CpalOutputStream::new())
            }
        })
        .build()?;

    let media = mixer.add_input(ToneSource::media(220.0, 0.5));

    let run_for = Duration::from_secs(args.seconds);
    let chime_at = run_for / 3;
    let unduck_at = chime_at * 2;
    let started = Instant::now();
    let ticker = tick(REPORT_INTERVAL);
    let mut peak = 0.0f32;
    let mut chimed = false;
    let mut unducked = false;

    while started.elapsed() < run_for {
        select! {
            recv(loopback_rx) -> event => match event {
                Ok(LoopbackEvent::Data(data)) => peak = peak.max(data.peak()),
                Ok(LoopbackEvent::Interrupt(reason)) => info!(%reason, "loopback interrupted"),
                Err(_) => bail!("loopback subscription closed"),
            },
            recv(counts_rx) -> counts => {
                if let Ok(counts) = counts {
                    info!(primary = counts.primary, sfx = counts.sfx, "active streams");
                }
            },
            recv(ticker) -> _ => {
                info!(peak_db = 20.0 * peak.max(1e-6).log10(), "loopback level");
                peak = 0.0;
            },
        }

        let elapsed = started.elapsed();
        if !chimed && elapsed >= chime_at {
            info!("ducking media for chime");
            mixer.set_output_limit(AudioContentType::Media, DUCKED_LIMIT);
            mixer.add_input(ToneSource::chime("alarm", 880.0, 0.4, 400));
            chimed = true;
        }
        if !unducked && elapsed >= unduck_at {
            info!("restoring media");
            mixer.set_output_limit(AudioContentType::Media, 1.0);
            unducked = true;
        }
    }

    mixer.remove_input(media);
    // Let the removal and the ringing tail play out before shutdown
    thread::sleep(Duration::from_millis(100));
    drop(mixer);
    info!("done");
    Ok(())
}
