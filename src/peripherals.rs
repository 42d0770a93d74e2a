use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::Result;

/// Source of the raw PCM byte stream.
///
/// Shared between the ingest task and the lifecycle, so implementations keep
/// their own state behind short locks. `close` must return promptly even
/// while a `connect` is in progress on another thread.
pub trait StreamSource: Send + Sync {
    fn is_connected(&self) -> bool;
    fn connect(&self) -> io::Result<()>;
    /// Reads whatever is available right now, never waiting for more.
    /// `Ok(0)` means nothing is pending.
    fn read_available(&self, buf: &mut [u8]) -> io::Result<usize>;
    /// Drops a failed connection; a later `connect` may open a new one.
    fn drop_connection(&self);
    /// Closes the source for good.
    fn close(&self);
}

/// Synchronous audio bus.
pub trait AudioOutput: Send {
    /// Hands `bytes` to the bus, waiting at most `timeout` for room.
    /// Returns how many bytes were accepted.
    fn write(&mut self, bytes: &[u8], timeout: Duration) -> usize;
    fn stop(&mut self);
    fn uninstall(&mut self);
}

pub trait WakeSensor: Send {
    fn is_asserted(&self) -> bool;
}

pub trait StatusIndicators: Send {
    fn set(&mut self, state: bool, stream: bool);
    /// Holds the current levels through the low-power transition.
    fn latch(&mut self);
    fn release(&mut self);
}

pub trait NetworkInterface: Send {
    fn is_up(&self) -> bool;
    fn release(&mut self);
}

pub trait PowerControl: Send {
    fn arm_wake(&mut self) -> Result<()>;
    fn enter_low_power(&mut self);
}

/// Visualization consumer.
pub trait Display: Send {
    fn set_active(&mut self, active: bool);
    fn show_status(&mut self, message: &str);
    fn show_goodbye(&mut self);
    fn power_off(&mut self);
}

pub trait OfflineNotifier: Send {
    fn notify_offline(&self) -> Result<()>;
}

/// Output used when the audio device could not be opened. Discards what it
/// is given at the stereo 16-bit rate, so the buffer drains in real time.
pub struct NullOutput {
    bytes_per_sec: u64,
    stopped: bool,
}

impl NullOutput {
    pub fn new(sample_rate: u32) -> NullOutput {
        NullOutput {
            bytes_per_sec: sample_rate as u64 * 4,
            stopped: false,
        }
    }
}

impl AudioOutput for NullOutput {
    fn write(&mut self, bytes: &[u8], timeout: Duration) -> usize {
        if self.stopped {
            return 0;
        }
        let budget = (self.bytes_per_sec * timeout.as_micros() as u64 / 1_000_000) as usize;
        // whole frames only
        let accepted = bytes.len().min(budget) & !3;
        std::thread::sleep(timeout);
        accepted
    }

    fn stop(&mut self) {
        self.stopped = true;
    }

    fn uninstall(&mut self) {
        self.stopped = true;
    }
}

/// Level-triggered wake input driven by the terminal or a signal handler.
#[derive(Clone, Default)]
pub struct LatchSensor {
    level: Arc<AtomicBool>,
}

impl LatchSensor {
    pub fn new() -> LatchSensor {
        LatchSensor::default()
    }

    pub fn assert(&self) {
        if !self.level.swap(true, Ordering::SeqCst) {
            log::info!("wake sensor asserted");
        }
    }
}

impl WakeSensor for LatchSensor {
    fn is_asserted(&self) -> bool {
        self.level.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IndicatorLevels {
    pub state: bool,
    pub stream: bool,
    pub latched: bool,
}

/// Indicator pair whose levels are readable by the display.
#[derive(Clone, Default)]
pub struct HostIndicators {
    state: Arc<AtomicBool>,
    stream: Arc<AtomicBool>,
    latched: Arc<AtomicBool>,
}

impl HostIndicators {
    pub fn new() -> HostIndicators {
        HostIndicators::default()
    }

    pub fn levels(&self) -> IndicatorLevels {
        IndicatorLevels {
            state: self.state.load(Ordering::Relaxed),
            stream: self.stream.load(Ordering::Relaxed),
            latched: self.latched.load(Ordering::Relaxed),
        }
    }
}

impl StatusIndicators for HostIndicators {
    fn set(&mut self, state: bool, stream: bool) {
        if self.latched.load(Ordering::SeqCst) {
            log::warn!("indicator change ignored while latched");
            return;
        }
        self.state.store(state, Ordering::Relaxed);
        self.stream.store(stream, Ordering::Relaxed);
        log::debug!("indicators: state={} stream={}", state as u8, stream as u8);
    }

    fn latch(&mut self) {
        self.latched.store(true, Ordering::SeqCst);
    }

    fn release(&mut self) {
        self.latched.store(false, Ordering::SeqCst);
    }
}

/// The host is always online; releasing only records that the link is gone.
pub struct HostNetwork {
    up: Arc<AtomicBool>,
}

impl HostNetwork {
    pub fn new() -> HostNetwork {
        HostNetwork {
            up: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn status(&self) -> Arc<AtomicBool> {
        self.up.clone()
    }
}

impl NetworkInterface for HostNetwork {
    fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    fn release(&mut self) {
        if self.up.swap(false, Ordering::SeqCst) {
            log::info!("network interface released");
        }
    }
}

/// Low power on the host means leaving the process; the next start is the
/// wake-up.
pub struct ProcessPower {
    armed: bool,
}

impl ProcessPower {
    pub fn new() -> ProcessPower {
        ProcessPower { armed: false }
    }
}

impl PowerControl for ProcessPower {
    fn arm_wake(&mut self) -> Result<()> {
        self.armed = true;
        log::info!("wake source armed on sensor assertion");
        Ok(())
    }

    fn enter_low_power(&mut self) {
        if !self.armed {
            log::warn!("entering low power without an armed wake source");
        }
        log::info!("entering low-power state");
    }
}
