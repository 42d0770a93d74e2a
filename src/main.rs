use clap::Parser;
use std::fs::OpenOptions;
use std::sync::{Arc, Mutex};

mod audio;
mod config;
mod error;
mod ingest;
mod lifecycle;
mod metadata;
mod peripherals;
mod playback;
mod ring;
mod spectrum;
mod task;
mod types;
mod ui;

use audio::CpalOutput;
use config::{Args, DisplayMode, load_config};
use ingest::{SharedSource, StreamIngest, TcpSource};
use lifecycle::{Peripherals, PowerLifecycle, ShutdownTiming, Tasks};
use metadata::{MetadataClient, MetadataPoller, RestartNotifier};
use peripherals::{
    Display, HostIndicators, HostNetwork, LatchSensor, NullOutput, OfflineNotifier, ProcessPower,
    StatusIndicators,
};
use playback::{Playback, SharedOutput};
use ring::RingBuffer;
use task::TaskHandle;
use ui::{DisplayInputs, spawn_headless, spawn_tui};

fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();

    let mut logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    logger.format_timestamp_millis();
    if let Some(path) = &args.log_file {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        logger.target(env_logger::Target::Pipe(Box::new(file)));
    }
    logger.init();

    let mut config = load_config(&args.config);
    config.apply_args(&args);
    config.validate()?;
    log::info!(
        "pcm-streamer starting, source {}, buffer {} bytes, threshold {} bytes",
        config.stream_addr(),
        config.buffer_capacity,
        config.playback_threshold
    );

    // indicators may still be latched from the previous sleep
    let mut indicators = HostIndicators::new();
    indicators.release();
    indicators.set(false, false);

    let sensor = LatchSensor::new();
    {
        let sensor = sensor.clone();
        ctrlc::set_handler(move || sensor.assert())?;
    }

    let network = HostNetwork::new();
    let ring = Arc::new(RingBuffer::new(config.buffer_capacity));

    let output: SharedOutput = match CpalOutput::open(config.sample_rate) {
        Ok(output) => Arc::new(Mutex::new(output)),
        Err(e) => {
            log::warn!("{}; continuing without audio output", e);
            Arc::new(Mutex::new(NullOutput::new(config.sample_rate)))
        }
    };
    let source: SharedSource = Arc::new(TcpSource::new(config.stream_addr()));

    let (song_tx, song_rx) = crossbeam_channel::bounded(4);
    let inputs = DisplayInputs {
        ring: ring.clone(),
        analysis_interval: config.analysis_interval(),
        now_playing: song_rx,
        sensor: sensor.clone(),
        indicators: indicators.clone(),
        network_up: network.status(),
        sample_rate: config.sample_rate,
    };
    let mut display: Box<dyn Display> = match config.display {
        DisplayMode::Tui => match ui::init_terminal() {
            Ok(terminal) => {
                // stderr would draw over the terminal UI
                if args.log_file.is_none() {
                    log::info!("terminal UI active, logging muted (use --log-file to keep logs)");
                    log::set_max_level(log::LevelFilter::Off);
                }
                Box::new(spawn_tui(terminal, inputs)?)
            }
            Err(e) => {
                log::warn!("terminal unavailable ({}), running headless", e);
                Box::new(spawn_headless(inputs)?)
            }
        },
        DisplayMode::Headless => Box::new(spawn_headless(inputs)?),
    };
    display.show_status("Connecting...");

    let mut handles = Vec::new();

    match MetadataClient::new(&config.http_base()) {
        Ok(client) => {
            let poller =
                MetadataPoller::new(client, network.status(), song_tx, config.metadata_poll());
            handles.push(TaskHandle::spawn("metadata", move |stop| poller.run(stop))?);
        }
        Err(e) => log::warn!("now playing unavailable: {}", e),
    }

    let playback = Playback::new(
        ring.clone(),
        output.clone(),
        config.playback_threshold,
        config.output_write_timeout(),
        config.playback_idle(),
    );
    let playing = playback.playing_flag();
    handles.push(TaskHandle::spawn("playback", move |stop| playback.run(stop))?);

    let ingest = StreamIngest::new(
        source.clone(),
        ring.clone(),
        config.ingest_poll(),
        config.reconnect_backoff(),
    );
    handles.push(TaskHandle::spawn("ingest", move |stop| ingest.run(stop))?);

    let notifier: Option<Box<dyn OfflineNotifier>> =
        match RestartNotifier::new(&config.http_base()) {
            Ok(n) => Some(Box::new(n)),
            Err(e) => {
                log::warn!("shutdown notification unavailable: {}", e);
                None
            }
        };

    let peripherals = Peripherals {
        source,
        output,
        sensor: Box::new(sensor),
        indicators: Box::new(indicators),
        network: Box::new(network),
        power: Box::new(ProcessPower::new()),
        display,
        notifier,
    };
    let tasks = Tasks {
        handles,
        playing: Some(playing),
    };
    let timing = ShutdownTiming::new(
        config.sensor_poll(),
        config.debounce(),
        config.settle_delay(),
    );

    match PowerLifecycle::new(peripherals, tasks, timing).run() {
        Ok(state) => log::info!("lifecycle finished in {:?}", state),
        Err(e) => log::error!("lifecycle finished with error: {}", e),
    }
    Ok(())
}
