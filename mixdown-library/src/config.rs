//! Simple configuration persistence for mixdown
//!
//! Stores the session parameters the engine is opened with.

use mixdown_audio::{FftSize, OutputChannels, SessionConfig};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Engine settings persisted between runs
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub sample_rate: u32,
    pub channels: OutputChannels,
    pub max_period_frames: usize,
    pub max_voices: usize,
    pub stretch_fft_size: FftSize,
    pub drain_timeout: Duration,
    pub slide_step: Duration,
    pub command_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        let session = SessionConfig::default();
        Self {
            sample_rate: session.sample_rate,
            channels: session.channels,
            max_period_frames: session.max_period_frames,
            max_voices: session.max_voices,
            stretch_fft_size: session.stretch_fft_size,
            drain_timeout: session.drain_timeout,
            slide_step: session.slide_step,
            command_capacity: session.command_capacity,
        }
    }
}

impl Config {
    /// Settings from [`config_path`](Self::config_path), falling back to
    /// the engine defaults when there is nothing readable there.
    pub fn load() -> Self {
        let path = Self::config_path();
        Self::load_from(&path).unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> io::Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(Self::parse(&content))
    }

    pub fn save(&self) -> io::Result<()> {
        let path = Self::config_path();
        self.save_to(&path)
    }

    /// Write the settings, creating parent directories as needed
    pub fn save_to(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, self.serialize())
    }

    /// `<config dir>/mixdown/config.txt`
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mixdown")
            .join("config.txt")
    }

    /// Engine parameters for [`Session::open`](mixdown_audio::Session::open)
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            sample_rate: self.sample_rate,
            channels: self.channels,
            max_period_frames: self.max_period_frames,
            max_voices: self.max_voices,
            stretch_fft_size: self.stretch_fft_size,
            drain_timeout: self.drain_timeout,
            slide_step: self.slide_step,
            command_capacity: self.command_capacity,
            ..SessionConfig::default()
        }
    }

    /// One `key=value` per line, `#` starts a comment. Unknown keys are
    /// skipped and bad values keep their defaults.
    fn parse(content: &str) -> Self {
        let mut config = Self::default();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();

            match key {
                "sample_rate" => set(&mut config.sample_rate, key, value),
                "channels" => match value {
                    "mono" | "1" => config.channels = OutputChannels::Mono,
                    "stereo" | "2" => config.channels = OutputChannels::Stereo,
                    _ => warn!("Ignoring invalid channels value '{}'", value),
                },
                "max_period_frames" => set(&mut config.max_period_frames, key, value),
                "max_voices" => set(&mut config.max_voices, key, value),
                "stretch_fft_size" => {
                    match value.parse().ok().and_then(FftSize::from_len) {
                        Some(size) => config.stretch_fft_size = size,
                        None => warn!("Ignoring invalid stretch_fft_size '{}'", value),
                    }
                }
                "drain_timeout_ms" => set_millis(&mut config.drain_timeout, key, value),
                "slide_step_ms" => set_millis(&mut config.slide_step, key, value),
                "command_capacity" => set(&mut config.command_capacity, key, value),
                _ => {} // Ignore unknown keys
            }
        }

        config
    }

    fn serialize(&self) -> String {
        let channels = match self.channels {
            OutputChannels::Mono => "mono",
            OutputChannels::Stereo => "stereo",
        };

        let lines = [
            "# mixdown configuration".to_string(),
            format!("sample_rate={}", self.sample_rate),
            format!("channels={channels}"),
            format!("max_period_frames={}", self.max_period_frames),
            format!("max_voices={}", self.max_voices),
            format!("stretch_fft_size={}", self.stretch_fft_size.as_usize()),
            format!("drain_timeout_ms={}", self.drain_timeout.as_millis()),
            format!("slide_step_ms={}", self.slide_step.as_millis()),
            format!("command_capacity={}", self.command_capacity),
        ];
        lines.join("\n")
    }
}

fn set<T: FromStr>(field: &mut T, key: &str, value: &str) {
    match value.parse() {
        Ok(v) => *field = v,
        Err(_) => warn!("Ignoring invalid {} value '{}'", key, value),
    }
}

fn set_millis(field: &mut Duration, key: &str, value: &str) {
    match value.parse() {
        Ok(ms) => *field = Duration::from_millis(ms),
        Err(_) => warn!("Ignoring invalid {} value '{}'", key, value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty() {
        assert_eq!(Config::parse(""), Config::default());
    }

    #[test]
    fn test_parse_values() {
        let config = Config::parse(
            "sample_rate=44100\nchannels=mono\nstretch_fft_size=4096\nslide_step_ms=20",
        );
        assert_eq!(config.sample_rate, 44100);
        assert_eq!(config.channels, OutputChannels::Mono);
        assert_eq!(config.stretch_fft_size, FftSize::Large);
        assert_eq!(config.slide_step, Duration::from_millis(20));
        assert_eq!(config.max_voices, Config::default().max_voices);
    }

    #[test]
    fn test_parse_with_comments_and_garbage() {
        let content = "# Comment\nmax_voices=abc\nstretch_fft_size=1000\nunknown=1\nmax_period_frames = 512";
        let config = Config::parse(content);
        assert_eq!(config.max_voices, Config::default().max_voices);
        assert_eq!(config.stretch_fft_size, FftSize::Medium);
        assert_eq!(config.max_period_frames, 512);
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = Config {
            sample_rate: 96000,
            channels: OutputChannels::Mono,
            drain_timeout: Duration::from_millis(1500),
            ..Config::default()
        };

        let parsed = Config::parse(&config.serialize());
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_save_to_creates_dirs_and_loads_back() {
        let dir = std::env::temp_dir().join(format!("mixdown-config-{}", std::process::id()));
        let path = dir.join("nested").join("config.txt");
        let config = Config {
            max_voices: 32,
            ..Config::default()
        };

        config.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path).unwrap(), config);
        fs::remove_dir_all(&dir).unwrap();

        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn test_session_config_is_valid() {
        let session = Config::default().session_config();
        assert!(session.validate().is_ok());
        assert_eq!(session, SessionConfig::default());
    }
}
