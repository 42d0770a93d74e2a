use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, StreamerError};
use crate::spectrum::WINDOW_BYTES;

#[derive(Debug, Parser)]
#[command(name = "pcm-streamer", about = "Network PCM player with spectrum display")]
pub struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "streamer.yaml")]
    pub config: PathBuf,

    /// Streaming server address, overrides the config file
    #[arg(long)]
    pub host: Option<String>,

    /// Log status instead of drawing the terminal UI
    #[arg(long)]
    pub headless: bool,

    /// Append logs to this file instead of stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayMode {
    #[default]
    Tui,
    Headless,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamerConfig {
    pub host: String,
    pub stream_port: u16,
    pub http_port: u16,
    pub sample_rate: u32,

    /// Ring buffer size in bytes (power of two)
    pub buffer_capacity: usize,
    /// Bytes that must be buffered before playback resumes after a drought
    pub playback_threshold: usize,

    pub reconnect_backoff_ms: u64,
    pub ingest_poll_ms: u64,
    pub playback_idle_ms: u64,
    pub output_write_timeout_ms: u64,
    pub analysis_interval_ms: u64,

    pub sensor_poll_ms: u64,
    pub debounce_ms: u64,
    pub settle_delay_ms: u64,

    pub metadata_poll_ms: u64,
    pub display: DisplayMode,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            host: "192.168.1.3".to_string(),
            stream_port: 8888,
            http_port: 8889,
            sample_rate: 44_100,
            buffer_capacity: 65_536,
            playback_threshold: 32_768,
            reconnect_backoff_ms: 5_000,
            ingest_poll_ms: 10,
            playback_idle_ms: 10,
            output_write_timeout_ms: 10,
            analysis_interval_ms: 50,
            sensor_poll_ms: 100,
            debounce_ms: 100,
            settle_delay_ms: 200,
            metadata_poll_ms: 5_000,
            display: DisplayMode::Tui,
        }
    }
}

impl StreamerConfig {
    pub fn stream_addr(&self) -> String {
        format!("{}:{}", self.host, self.stream_port)
    }

    pub fn http_base(&self) -> String {
        format!("http://{}:{}", self.host, self.http_port)
    }

    pub fn apply_args(&mut self, args: &Args) {
        if let Some(host) = &args.host {
            self.host = host.clone();
        }
        if args.headless {
            self.display = DisplayMode::Headless;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let cap = self.buffer_capacity;
        if !cap.is_power_of_two() {
            return Err(StreamerError::Config(format!(
                "buffer_capacity {cap} is not a power of two"
            )));
        }
        if cap % 4 != 0 {
            return Err(StreamerError::Config(format!(
                "buffer_capacity {cap} does not hold whole stereo frames"
            )));
        }
        if cap <= self.playback_threshold {
            return Err(StreamerError::Config(format!(
                "buffer_capacity {cap} must exceed playback_threshold {}",
                self.playback_threshold
            )));
        }
        if cap <= WINDOW_BYTES {
            return Err(StreamerError::Config(format!(
                "buffer_capacity {cap} must exceed the analysis window of {WINDOW_BYTES} bytes"
            )));
        }
        if self.sample_rate == 0 {
            return Err(StreamerError::Config("sample_rate must be non-zero".into()));
        }
        Ok(())
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn ingest_poll(&self) -> Duration {
        Duration::from_millis(self.ingest_poll_ms)
    }

    pub fn playback_idle(&self) -> Duration {
        Duration::from_millis(self.playback_idle_ms)
    }

    pub fn output_write_timeout(&self) -> Duration {
        Duration::from_millis(self.output_write_timeout_ms)
    }

    pub fn analysis_interval(&self) -> Duration {
        Duration::from_millis(self.analysis_interval_ms)
    }

    pub fn sensor_poll(&self) -> Duration {
        Duration::from_millis(self.sensor_poll_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn metadata_poll(&self) -> Duration {
        Duration::from_millis(self.metadata_poll_ms)
    }
}

fn read_config(path: &Path) -> Result<StreamerConfig> {
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&contents)?)
}

/// Loads the configuration, falling back to defaults when the file is
/// missing or malformed.
pub fn load_config(path: &Path) -> StreamerConfig {
    match read_config(path) {
        Ok(config) => {
            log::info!("loaded configuration from {:?}", path);
            config
        }
        Err(e) => {
            log::warn!("using default configuration ({:?}: {})", path, e);
            StreamerConfig::default()
        }
    }
}
