use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::peripherals::AudioOutput;
use crate::ring::RingBuffer;
use crate::task::StopSignal;

pub type SharedOutput = Arc<Mutex<dyn AudioOutput>>;

/// Largest single hand-off to the bus, one DMA queue worth of bytes.
pub const MAX_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackStep {
    Transferred(usize),
    /// Below the start threshold, or just ran dry.
    Waiting,
    /// The bus took nothing within the write timeout.
    Stalled,
}

/// Starts once `threshold` bytes are buffered, then runs until the buffer is
/// empty.
pub struct Playback {
    ring: Arc<RingBuffer>,
    output: SharedOutput,
    threshold: usize,
    write_timeout: Duration,
    idle: Duration,
    scratch: Box<[u8]>,
    playing: Arc<AtomicBool>,
}

impl Playback {
    pub fn new(
        ring: Arc<RingBuffer>,
        output: SharedOutput,
        threshold: usize,
        write_timeout: Duration,
        idle: Duration,
    ) -> Playback {
        Playback {
            ring,
            output,
            threshold,
            write_timeout,
            idle,
            scratch: vec![0u8; MAX_CHUNK].into_boxed_slice(),
            playing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that is set while the buffer is being drained.
    pub fn playing_flag(&self) -> Arc<AtomicBool> {
        self.playing.clone()
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Relaxed)
    }

    pub fn step(&mut self) -> PlaybackStep {
        let count = self.ring.available_to_read();

        if !self.is_playing() {
            if count < self.threshold {
                return PlaybackStep::Waiting;
            }
            log::debug!("buffer primed with {} bytes, starting output", count);
            self.playing.store(true, Ordering::Relaxed);
        }

        if count == 0 {
            log::debug!("buffer underrun, waiting for {} bytes", self.threshold);
            self.playing.store(false, Ordering::Relaxed);
            return PlaybackStep::Waiting;
        }

        // the wrap is handled on the next turn rather than splitting here
        let run = self.ring.contiguous_readable().min(self.scratch.len());
        let n = self.ring.peek(0, &mut self.scratch[..run]);

        let written = {
            let mut output = self.output.lock().unwrap_or_else(PoisonError::into_inner);
            output.write(&self.scratch[..n], self.write_timeout)
        };
        if written == 0 {
            return PlaybackStep::Stalled;
        }

        self.ring.consume(written);
        PlaybackStep::Transferred(written)
    }

    pub fn run(mut self, stop: StopSignal) {
        log::info!("playback task started");
        loop {
            let exit = match self.step() {
                PlaybackStep::Transferred(_) => stop.is_stopped(),
                PlaybackStep::Waiting | PlaybackStep::Stalled => stop.sleep(self.idle),
            };
            if exit {
                break;
            }
        }
        self.playing.store(false, Ordering::Relaxed);
        log::info!("playback task exiting");
    }
}
