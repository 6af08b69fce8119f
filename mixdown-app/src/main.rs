//! mixdown - command-line player for the mixing engine
//!
//! Loads one file as a looping voice and lets the rate be slid from stdin.

use std::io::{self, BufRead};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mixdown_audio::{AttributeKind, AttributeValue, OutputChannels, Session};
use mixdown_library::{Config, SampleLoader};

/// How long the `q`/`w` rate slides take
const SLIDE_TIME: Duration = Duration::from_secs(2);

struct Args {
    path: PathBuf,
    rate: f32,
    mono: bool,
}

fn parse_args() -> Result<Args> {
    let mut path = None;
    let mut rate = 1.0;
    let mut mono = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--rate" => {
                let value = args.next().context("--rate needs a value")?;
                rate = value
                    .parse()
                    .with_context(|| format!("invalid rate '{value}'"))?;
            }
            "--mono" => mono = true,
            _ if arg.starts_with("--") => bail!("unknown option {arg}"),
            _ => path = Some(PathBuf::from(arg)),
        }
    }

    let Some(path) = path else {
        bail!("usage: mixdown <file> [--rate R] [--mono]");
    };
    Ok(Args { path, rate, mono })
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = parse_args()?;

    let mut config = Config::load().session_config();
    if args.mono {
        config.channels = OutputChannels::Mono;
    }

    let session = Session::open(config).context("failed to open audio output")?;
    let rate = session.info().sample_rate;

    let sample = SampleLoader::with_sample_rate(rate)
        .load(&args.path)
        .with_context(|| format!("failed to load {}", args.path.display()))?;
    info!(
        "Playing {} ({:.1}s)",
        args.path.display(),
        sample.duration_secs()
    );

    let voice = session.create_voice(sample.source())?;
    session.set_attribute(voice, AttributeKind::Looping, AttributeValue::Bool(true))?;
    session.set_attribute(voice, AttributeKind::Rate, AttributeValue::Float(args.rate))?;
    session.play(voice, false)?;

    println!("q: speed up  w: normal speed  p: toggle pitch correction  s: restart  e: quit");

    for line in io::stdin().lock().lines() {
        let line = line?;
        for command in line.trim().chars() {
            match command {
                'q' => {
                    session.slide_attribute_async(voice, AttributeKind::Rate, 1.5, SLIDE_TIME)?;
                }
                'w' => {
                    session.slide_attribute_async(voice, AttributeKind::Rate, 1.0, SLIDE_TIME)?;
                }
                'p' => {
                    let enabled = session
                        .get_attribute(voice, AttributeKind::PitchCorrection)?
                        .as_bool()
                        .unwrap_or(false);
                    session.set_attribute(
                        voice,
                        AttributeKind::PitchCorrection,
                        AttributeValue::Bool(!enabled),
                    )?;
                    info!("Pitch correction {}", if enabled { "off" } else { "on" });
                }
                's' => session.seek(voice, 0)?,
                'e' => return finish(&session, voice),
                other => warn!("Unknown command '{}'", other),
            }
        }
    }

    finish(&session, voice)
}

fn finish(session: &Session, voice: mixdown_audio::VoiceHandle) -> Result<()> {
    session.stop(voice)?;
    session.free(voice)?;
    session.shutdown()?;
    Ok(())
}
