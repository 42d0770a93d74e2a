use crossbeam_channel::Sender;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::{Result, StreamerError};
use crate::peripherals::OfflineNotifier;
use crate::task::StopSignal;
use crate::types::NowPlaying;

const FETCH_TIMEOUT: Duration = Duration::from_secs(3);
const RESTART_CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const RESTART_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Song(NowPlaying),
    /// Answered, but not with success.
    Status(u16),
    BadJson,
    Unreachable,
}

pub struct MetadataClient {
    client: Client,
    url: String,
}

impl MetadataClient {
    pub fn new(base: &str) -> Result<MetadataClient> {
        let client = Client::builder().timeout(FETCH_TIMEOUT).build()?;
        Ok(MetadataClient {
            client,
            url: format!("{base}/nowplaying"),
        })
    }

    pub fn fetch(&self) -> FetchOutcome {
        let response = match self.client.get(&self.url).send() {
            Ok(r) => r,
            Err(e) => {
                log::debug!("now playing fetch failed: {}", e);
                return FetchOutcome::Unreachable;
            }
        };

        if response.status() != StatusCode::OK {
            return FetchOutcome::Status(response.status().as_u16());
        }

        let body = match response.text() {
            Ok(body) => body,
            Err(_) => return FetchOutcome::Unreachable,
        };
        match serde_json::from_str::<NowPlaying>(&body) {
            Ok(song) => FetchOutcome::Song(song),
            Err(e) => {
                log::warn!("now playing payload rejected: {}", e);
                FetchOutcome::BadJson
            }
        }
    }
}

/// Picks what the display should show after a fetch attempt.
pub fn resolve(previous: &NowPlaying, outcome: FetchOutcome, network_up: bool) -> NowPlaying {
    if !network_up {
        return NowPlaying::new("No WiFi", "Connecting...");
    }
    match outcome {
        FetchOutcome::Song(song) => song,
        FetchOutcome::BadJson => NowPlaying::new("JSON Error", "Check Server"),
        FetchOutcome::Unreachable => NowPlaying::new("Server Offline", "TCP OK / HTTP Fail"),
        FetchOutcome::Status(code) => {
            log::debug!("now playing answered {}, keeping previous", code);
            previous.clone()
        }
    }
}

pub struct MetadataPoller {
    client: MetadataClient,
    network_up: Arc<AtomicBool>,
    tx: Sender<NowPlaying>,
    interval: Duration,
}

impl MetadataPoller {
    pub fn new(
        client: MetadataClient,
        network_up: Arc<AtomicBool>,
        tx: Sender<NowPlaying>,
        interval: Duration,
    ) -> MetadataPoller {
        MetadataPoller {
            client,
            network_up,
            tx,
            interval,
        }
    }

    pub fn run(self, stop: StopSignal) {
        let mut current = NowPlaying::default();
        loop {
            let up = self.network_up.load(Ordering::SeqCst);
            let outcome = if up {
                self.client.fetch()
            } else {
                FetchOutcome::Unreachable
            };

            let next = resolve(&current, outcome, up);
            if next != current {
                log::info!("now playing: {}", next.line());
                let _ = self.tx.try_send(next.clone());
                current = next;
            }

            if stop.sleep(self.interval) {
                break;
            }
        }
    }
}

/// Tells the server this device is going away so it can recycle its stream.
pub struct RestartNotifier {
    client: Client,
    url: String,
}

impl RestartNotifier {
    pub fn new(base: &str) -> Result<RestartNotifier> {
        let client = Client::builder()
            .connect_timeout(RESTART_CONNECT_TIMEOUT)
            .timeout(RESTART_TIMEOUT)
            .build()?;
        Ok(RestartNotifier {
            client,
            url: format!("{base}/restart"),
        })
    }
}

impl OfflineNotifier for RestartNotifier {
    fn notify_offline(&self) -> Result<()> {
        let response = self.client.get(&self.url).send()?;
        if !response.status().is_success() {
            return Err(StreamerError::HttpStatus(response.status().as_u16()));
        }
        Ok(())
    }
}
