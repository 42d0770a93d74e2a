use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    Device, FromSample, OutputCallbackInfo, Sample, SampleFormat, SampleRate, SizedSample, Stream,
    StreamConfig, StreamError,
};
use crossbeam_channel::{Receiver, SendTimeoutError, Sender, TrySendError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::{Result, StreamerError};
use crate::peripherals::AudioOutput;

/// Frames the bus can hold ahead of the device, like the DMA ring on the
/// board (8 buffers of 1024 frames).
const QUEUE_FRAMES: usize = 8 * 1024;
const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

type Frame = [i16; 2];

enum DeviceCommand {
    Pause,
    Close,
}

/// Stereo 16-bit output on the default cpal device.
///
/// The cpal stream lives on its own thread since streams cannot move between
/// threads on every platform. Writers feed it through a bounded frame queue;
/// the device callback plays silence whenever the queue runs dry.
pub struct CpalOutput {
    frames: Option<Sender<Frame>>,
    pending: [u8; 4],
    pending_len: usize,
    control: Option<Sender<DeviceCommand>>,
    device_thread: Option<JoinHandle<()>>,
    stopped: bool,
}

impl CpalOutput {
    pub fn open(sample_rate: u32) -> Result<CpalOutput> {
        let (frames_tx, frames_rx) = crossbeam_channel::bounded::<Frame>(QUEUE_FRAMES);
        let (control_tx, control_rx) = crossbeam_channel::bounded::<DeviceCommand>(4);
        let (ready_tx, ready_rx) =
            crossbeam_channel::bounded::<std::result::Result<String, String>>(1);

        let device_thread = std::thread::Builder::new()
            .name("audio-device".to_string())
            .spawn(move || {
                let stream = match open_stream(sample_rate, frames_rx) {
                    Ok((stream, name)) => {
                        let _ = ready_tx.send(Ok(name));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };

                while let Ok(command) = control_rx.recv() {
                    match command {
                        DeviceCommand::Pause => {
                            if let Err(e) = stream.pause() {
                                log::warn!("could not pause output stream: {}", e);
                            }
                        }
                        DeviceCommand::Close => break,
                    }
                }
                drop(stream);
                log::debug!("output stream closed");
            })?;

        match ready_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(name)) => {
                log::info!("audio output on '{}' at {} Hz", name, sample_rate);
                Ok(CpalOutput {
                    frames: Some(frames_tx),
                    pending: [0; 4],
                    pending_len: 0,
                    control: Some(control_tx),
                    device_thread: Some(device_thread),
                    stopped: false,
                })
            }
            Ok(Err(e)) => Err(StreamerError::Output(e)),
            Err(_) => Err(StreamerError::Output("device did not open in time".into())),
        }
    }
}

impl AudioOutput for CpalOutput {
    fn write(&mut self, bytes: &[u8], timeout: Duration) -> usize {
        if self.stopped {
            return 0;
        }
        let Some(tx) = self.frames.clone() else {
            return 0;
        };

        let deadline = Instant::now() + timeout;
        let mut accepted = 0;
        for &byte in bytes {
            self.pending[self.pending_len] = byte;
            if self.pending_len == 3 {
                let p = self.pending;
                let frame = [
                    i16::from_le_bytes([p[0], p[1]]),
                    i16::from_le_bytes([p[2], p[3]]),
                ];
                if !push_frame(&tx, frame, deadline) {
                    // the three earlier bytes stay pending for the next call
                    break;
                }
                self.pending_len = 0;
            } else {
                self.pending_len += 1;
            }
            accepted += 1;
        }
        accepted
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        if let Some(control) = &self.control {
            let _ = control.send(DeviceCommand::Pause);
        }
        log::info!("audio output stopped");
    }

    fn uninstall(&mut self) {
        self.stopped = true;
        self.frames = None;
        if let Some(control) = self.control.take() {
            let _ = control.send(DeviceCommand::Close);
        }
        if let Some(thread) = self.device_thread.take() {
            let _ = thread.join();
            log::info!("audio output released");
        }
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.uninstall();
    }
}

fn push_frame(tx: &Sender<Frame>, frame: Frame, deadline: Instant) -> bool {
    match tx.try_send(frame) {
        Ok(()) => true,
        Err(TrySendError::Full(frame)) => {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tx.send_timeout(frame, remaining) {
                Ok(()) => true,
                Err(SendTimeoutError::Timeout(_)) | Err(SendTimeoutError::Disconnected(_)) => {
                    false
                }
            }
        }
        Err(TrySendError::Disconnected(_)) => false,
    }
}

fn open_stream(sample_rate: u32, frames: Receiver<Frame>) -> Result<(Stream, String)> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| StreamerError::Output("no default output device".into()))?;
    let name = device.name().unwrap_or_else(|_| "Unknown Device".to_string());

    let sample_format = device
        .default_output_config()
        .map_err(|e| StreamerError::Output(e.to_string()))?
        .sample_format();

    let cfg = StreamConfig {
        channels: 2,
        sample_rate: SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = create_output_stream(&device, sample_format, &cfg, frames)?;
    Ok((stream, name))
}

pub fn build_output_stream<T>(
    device: &Device,
    cfg: &StreamConfig,
    frames: Receiver<Frame>,
) -> Result<Stream>
where
    T: Sample + SizedSample + FromSample<i16> + Send + 'static,
{
    let channels = cfg.channels as usize;
    let err_callback = |err: StreamError| log::error!("an error occurred on stream: {}", err);

    let output_callback = move |data: &mut [T], _info: &OutputCallbackInfo| {
        for slot in data.chunks_mut(channels) {
            let [left, right] = frames.try_recv().unwrap_or([0, 0]);
            for (ch, sample) in slot.iter_mut().enumerate() {
                *sample = match ch {
                    0 => T::from_sample(left),
                    1 => T::from_sample(right),
                    _ => T::EQUILIBRIUM,
                };
            }
        }
    };

    let latency = Some(Duration::from_millis(20));
    let stream = device
        .build_output_stream(cfg, output_callback, err_callback, latency)
        .map_err(|e| StreamerError::Output(e.to_string()))?;
    stream
        .play()
        .map_err(|e| StreamerError::Output(e.to_string()))?;
    Ok(stream)
}

pub fn create_output_stream(
    device: &Device,
    sample_format: SampleFormat,
    cfg: &StreamConfig,
    frames: Receiver<Frame>,
) -> Result<Stream> {
    match sample_format {
        SampleFormat::F32 => build_output_stream::<f32>(device, cfg, frames),
        SampleFormat::I16 => build_output_stream::<i16>(device, cfg, frames),
        SampleFormat::U16 => build_output_stream::<u16>(device, cfg, frames),
        _ => Err(StreamerError::Output(format!(
            "unsupported sample format: {:?}",
            sample_format
        ))),
    }
}
