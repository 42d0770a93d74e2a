use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::ingest::SharedSource;
use crate::peripherals::{
    Display, NetworkInterface, OfflineNotifier, PowerControl, StatusIndicators, WakeSensor,
};
use crate::playback::SharedOutput;
use crate::task::TaskHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleState {
    Streaming,
    Draining,
    Stopped,
    Sleeping,
}

/// Reports a level only after it has held for the whole window.
pub struct Debounce {
    window: Duration,
    asserted_since: Option<Instant>,
}

impl Debounce {
    pub fn new(window: Duration) -> Debounce {
        Debounce {
            window,
            asserted_since: None,
        }
    }

    pub fn update(&mut self, asserted: bool, now: Instant) -> bool {
        if !asserted {
            self.asserted_since = None;
            return false;
        }
        let since = *self.asserted_since.get_or_insert(now);
        now.saturating_duration_since(since) >= self.window
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ShutdownTiming {
    pub sensor_poll: Duration,
    pub debounce: Duration,
    /// Pause before each teardown step.
    pub settle: Duration,
    pub display_settle: Duration,
    pub goodbye_hold: Duration,
    pub network_settle: Duration,
    pub sleep_hold: Duration,
}

impl ShutdownTiming {
    pub fn new(sensor_poll: Duration, debounce: Duration, settle: Duration) -> ShutdownTiming {
        ShutdownTiming {
            sensor_poll,
            debounce,
            settle,
            display_settle: Duration::from_millis(50),
            goodbye_hold: Duration::from_millis(500),
            network_settle: Duration::from_millis(50),
            sleep_hold: Duration::from_millis(500),
        }
    }
}

pub struct Peripherals {
    pub source: SharedSource,
    pub output: SharedOutput,
    pub sensor: Box<dyn WakeSensor>,
    pub indicators: Box<dyn StatusIndicators>,
    pub network: Box<dyn NetworkInterface>,
    pub power: Box<dyn PowerControl>,
    pub display: Box<dyn Display>,
    pub notifier: Option<Box<dyn OfflineNotifier>>,
}

/// Live tasks in the order they are terminated.
#[derive(Default)]
pub struct Tasks {
    pub handles: Vec<TaskHandle>,
    /// Set while playback is draining the buffer.
    pub playing: Option<Arc<AtomicBool>>,
}

/// Every teardown step is best effort, so the device always reaches low
/// power once the sensor fires. Waking is a fresh start.
pub struct PowerLifecycle {
    state: LifecycleState,
    debounce: Debounce,
    timing: ShutdownTiming,
    peripherals: Peripherals,
    tasks: Tasks,
    stream_indicator: bool,
}

impl PowerLifecycle {
    pub fn new(peripherals: Peripherals, tasks: Tasks, timing: ShutdownTiming) -> PowerLifecycle {
        PowerLifecycle {
            state: LifecycleState::Streaming,
            debounce: Debounce::new(timing.debounce),
            timing,
            peripherals,
            tasks,
            stream_indicator: false,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    fn advance(&mut self, next: LifecycleState) {
        debug_assert!(next > self.state, "{:?} -> {:?}", self.state, next);
        log::info!("lifecycle: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn settle(&self, delay: Duration) {
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }

    fn status(&mut self, message: &str) {
        log::info!("shutdown: {}", message);
        self.peripherals.display.show_status(message);
    }

    /// One sensor poll while streaming. Returns `true` once the sensor has
    /// held its wake level past the debounce window, moving to `Draining`.
    pub fn poll(&mut self, now: Instant) -> bool {
        if self.state != LifecycleState::Streaming {
            return false;
        }

        if let Some(playing) = &self.tasks.playing {
            let playing = playing.load(Ordering::Relaxed);
            if playing != self.stream_indicator {
                self.stream_indicator = playing;
                self.peripherals.indicators.set(false, playing);
            }
        }

        let asserted = self.peripherals.sensor.is_asserted();
        if self.debounce.update(asserted, now) {
            self.advance(LifecycleState::Draining);
            return true;
        }
        false
    }

    /// Ordered teardown of the data path and the network.
    pub fn drain(&mut self) {
        if self.state != LifecycleState::Draining {
            return;
        }

        self.peripherals.display.set_active(false);
        self.settle(self.timing.display_settle);
        self.peripherals.display.show_goodbye();
        self.settle(self.timing.goodbye_hold);

        self.status("Stop audio...");
        self.settle(self.timing.settle);
        self.peripherals
            .output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stop();

        self.status("Stop TCP...");
        self.settle(self.timing.settle);
        self.peripherals.source.close();

        self.status("Del tasks...");
        self.settle(self.timing.settle);
        for task in self.tasks.handles.iter_mut() {
            if task.is_running() {
                log::info!("terminating task '{}'", task.name());
            } else {
                log::warn!("task '{}' had already exited", task.name());
            }
            task.terminate();
        }

        self.status("Send restart...");
        self.settle(self.timing.settle);
        if self.peripherals.network.is_up() {
            if let Some(notifier) = &self.peripherals.notifier {
                match notifier.notify_offline() {
                    Ok(()) => log::info!("server notified of shutdown"),
                    Err(e) => log::warn!("shutdown notification failed: {}", e),
                }
            }
        }

        self.status("Shut network...");
        self.settle(self.timing.settle);
        self.peripherals.network.release();
        self.settle(self.timing.network_settle);

        self.advance(LifecycleState::Stopped);
    }

    /// Deinitializes the peripherals and latches the sleep pattern.
    pub fn stop(&mut self) {
        if self.state != LifecycleState::Stopped {
            return;
        }

        self.status("Deinit HW...");
        self.settle(self.timing.settle);
        self.peripherals
            .output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .uninstall();

        self.peripherals.indicators.set(true, false);
        self.peripherals.indicators.latch();

        self.status("Entering sleep..");
        self.settle(self.timing.sleep_hold);
        self.peripherals.display.power_off();
    }

    /// Arms the wake source and enters low power. An arming failure is
    /// reported but does not hold the device awake.
    pub fn sleep(&mut self) -> Result<()> {
        if self.state != LifecycleState::Stopped {
            return Ok(());
        }

        let armed = self.peripherals.power.arm_wake();
        if let Err(e) = &armed {
            log::error!("wake source not armed, device may not wake: {}", e);
        }
        self.advance(LifecycleState::Sleeping);
        self.peripherals.power.enter_low_power();
        armed
    }

    /// Runs the whole lifecycle on the calling thread until low power.
    pub fn run(mut self) -> Result<LifecycleState> {
        while !self.poll(Instant::now()) {
            std::thread::sleep(self.timing.sensor_poll);
        }
        self.drain();
        self.stop();
        self.sleep()?;
        Ok(self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StreamerError;
    use crate::peripherals::{AudioOutput, StreamSource};
    use std::io;
    use std::sync::Mutex;

    type Events = Arc<Mutex<Vec<String>>>;

    fn record(events: &Events, event: &str) {
        events.lock().unwrap().push(event.to_string());
    }

    struct FakeSource(Events);

    impl StreamSource for FakeSource {
        fn is_connected(&self) -> bool {
            false
        }
        fn connect(&self) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::ConnectionRefused, "unreachable"))
        }
        fn read_available(&self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
        fn drop_connection(&self) {}
        fn close(&self) {
            record(&self.0, "source.close");
        }
    }

    struct FakeOutput(Events);

    impl AudioOutput for FakeOutput {
        fn write(&mut self, _bytes: &[u8], _timeout: Duration) -> usize {
            0
        }
        fn stop(&mut self) {
            record(&self.0, "output.stop");
        }
        fn uninstall(&mut self) {
            record(&self.0, "output.uninstall");
        }
    }

    struct FakeSensor(Arc<AtomicBool>);

    impl WakeSensor for FakeSensor {
        fn is_asserted(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    struct FakeIndicators(Events);

    impl StatusIndicators for FakeIndicators {
        fn set(&mut self, state: bool, stream: bool) {
            record(&self.0, &format!("indicators.set({state},{stream})"));
        }
        fn latch(&mut self) {
            record(&self.0, "indicators.latch");
        }
        fn release(&mut self) {}
    }

    struct FakeNetwork {
        events: Events,
        up: bool,
    }

    impl NetworkInterface for FakeNetwork {
        fn is_up(&self) -> bool {
            self.up
        }
        fn release(&mut self) {
            record(&self.events, "network.release");
        }
    }

    struct FakePower {
        events: Events,
        arm_fails: bool,
    }

    impl PowerControl for FakePower {
        fn arm_wake(&mut self) -> Result<()> {
            record(&self.events, "power.arm");
            if self.arm_fails {
                return Err(io::Error::other("no wake source").into());
            }
            Ok(())
        }
        fn enter_low_power(&mut self) {
            record(&self.events, "power.sleep");
        }
    }

    struct FakeDisplay(Events);

    impl Display for FakeDisplay {
        fn set_active(&mut self, active: bool) {
            record(&self.0, &format!("display.active({active})"));
        }
        fn show_status(&mut self, message: &str) {
            record(&self.0, &format!("status({message})"));
        }
        fn show_goodbye(&mut self) {
            record(&self.0, "display.goodbye");
        }
        fn power_off(&mut self) {
            record(&self.0, "display.off");
        }
    }

    struct FailingNotifier(Events);

    impl OfflineNotifier for FailingNotifier {
        fn notify_offline(&self) -> Result<()> {
            record(&self.0, "notify");
            Err(StreamerError::HttpStatus(503))
        }
    }

    struct Rig {
        lifecycle: PowerLifecycle,
        events: Events,
        sensor: Arc<AtomicBool>,
        playing: Arc<AtomicBool>,
    }

    fn rig(network_up: bool, arm_fails: bool) -> Rig {
        let events: Events = Arc::new(Mutex::new(Vec::new()));
        let sensor = Arc::new(AtomicBool::new(false));
        let playing = Arc::new(AtomicBool::new(false));

        let peripherals = Peripherals {
            source: Arc::new(FakeSource(events.clone())),
            output: Arc::new(Mutex::new(FakeOutput(events.clone()))),
            sensor: Box::new(FakeSensor(sensor.clone())),
            indicators: Box::new(FakeIndicators(events.clone())),
            network: Box::new(FakeNetwork { events: events.clone(), up: network_up }),
            power: Box::new(FakePower { events: events.clone(), arm_fails }),
            display: Box::new(FakeDisplay(events.clone())),
            notifier: Some(Box::new(FailingNotifier(events.clone()))),
        };

        let mut handles = Vec::new();
        for name in ["playback", "ingest"] {
            let task_events = events.clone();
            let handle = TaskHandle::spawn(name, move |stop| {
                while !stop.sleep(Duration::from_secs(5)) {}
                record(&task_events, &format!("{name}.exit"));
            })
            .unwrap();
            handles.push(handle);
        }

        let timing = ShutdownTiming {
            sensor_poll: Duration::from_millis(1),
            debounce: Duration::from_millis(100),
            settle: Duration::ZERO,
            display_settle: Duration::ZERO,
            goodbye_hold: Duration::ZERO,
            network_settle: Duration::ZERO,
            sleep_hold: Duration::ZERO,
        };
        let tasks = Tasks {
            handles,
            playing: Some(playing.clone()),
        };

        Rig {
            lifecycle: PowerLifecycle::new(peripherals, tasks, timing),
            events,
            sensor,
            playing,
        }
    }

    #[test]
    fn debounce_requires_a_held_level() {
        let mut debounce = Debounce::new(Duration::from_millis(100));
        let t0 = Instant::now();
        assert!(!debounce.update(true, t0));
        assert!(!debounce.update(true, t0 + Duration::from_millis(60)));
        // glitch resets the window
        assert!(!debounce.update(false, t0 + Duration::from_millis(80)));
        assert!(!debounce.update(true, t0 + Duration::from_millis(120)));
        assert!(!debounce.update(true, t0 + Duration::from_millis(200)));
        assert!(debounce.update(true, t0 + Duration::from_millis(220)));
    }

    #[test]
    fn streams_until_sensor_holds() {
        let mut rig = rig(true, false);
        let t0 = Instant::now();
        assert!(!rig.lifecycle.poll(t0));

        rig.sensor.store(true, Ordering::SeqCst);
        assert!(!rig.lifecycle.poll(t0 + Duration::from_millis(100)));
        assert_eq!(rig.lifecycle.state(), LifecycleState::Streaming);
        assert!(rig.lifecycle.poll(t0 + Duration::from_millis(200)));
        assert_eq!(rig.lifecycle.state(), LifecycleState::Draining);

        // no further transitions from polling
        assert!(!rig.lifecycle.poll(t0 + Duration::from_millis(300)));
    }

    #[test]
    fn stream_indicator_follows_playback() {
        let mut rig = rig(true, false);
        let t0 = Instant::now();
        rig.playing.store(true, Ordering::Relaxed);
        rig.lifecycle.poll(t0);
        rig.lifecycle.poll(t0);
        rig.playing.store(false, Ordering::Relaxed);
        rig.lifecycle.poll(t0);

        let events = rig.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec!["indicators.set(false,true)", "indicators.set(false,false)"]
        );
    }

    #[test]
    fn shutdown_runs_in_order_despite_failures() {
        let rig = rig(true, false);
        rig.sensor.store(true, Ordering::SeqCst);

        let final_state = rig.lifecycle.run().unwrap();
        assert_eq!(final_state, LifecycleState::Sleeping);

        let events = rig.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                "display.active(false)",
                "display.goodbye",
                "status(Stop audio...)",
                "output.stop",
                "status(Stop TCP...)",
                "source.close",
                "status(Del tasks...)",
                "playback.exit",
                "ingest.exit",
                "status(Send restart...)",
                "notify",
                "status(Shut network...)",
                "network.release",
                "status(Deinit HW...)",
                "output.uninstall",
                "indicators.set(true,false)",
                "indicators.latch",
                "status(Entering sleep..)",
                "display.off",
                "power.arm",
                "power.sleep",
            ]
        );
    }

    #[test]
    fn display_outlives_the_data_tasks() {
        let rig = rig(true, false);
        rig.sensor.store(true, Ordering::SeqCst);
        rig.lifecycle.run().unwrap();

        let events = rig.events.lock().unwrap().clone();
        let at = |name: &str| events.iter().position(|e| e == name).unwrap();
        // inactive before any task stops, powered off only after the last status
        assert!(at("display.active(false)") < at("playback.exit"));
        assert!(at("ingest.exit") < at("display.off"));
        assert!(at("status(Entering sleep..)") < at("display.off"));
        assert!(at("display.off") < at("power.sleep"));
    }

    #[test]
    fn already_exited_tasks_are_reaped() {
        let mut rig = rig(true, false);
        let events = rig.events.clone();
        let dead = TaskHandle::spawn("metadata", move |_stop| record(&events, "metadata.exit"))
            .unwrap();
        while dead.is_running() {
            std::thread::sleep(Duration::from_millis(1));
        }
        rig.lifecycle.tasks.handles.insert(0, dead);
        rig.sensor.store(true, Ordering::SeqCst);

        assert_eq!(rig.lifecycle.run().unwrap(), LifecycleState::Sleeping);
        let events = rig.events.lock().unwrap().clone();
        assert_eq!(events.iter().filter(|e| *e == "metadata.exit").count(), 1);
        assert!(events.iter().any(|e| e == "ingest.exit"));
    }

    #[test]
    fn skips_notification_when_network_is_down() {
        let mut rig = rig(false, false);
        rig.sensor.store(true, Ordering::SeqCst);
        let t0 = Instant::now();
        rig.lifecycle.poll(t0);
        rig.lifecycle.poll(t0 + Duration::from_millis(150));

        rig.lifecycle.drain();
        assert_eq!(rig.lifecycle.state(), LifecycleState::Stopped);
        assert!(!rig.events.lock().unwrap().iter().any(|e| e == "notify"));
    }

    #[test]
    fn arming_failure_still_sleeps() {
        let mut rig = rig(true, true);
        rig.sensor.store(true, Ordering::SeqCst);
        let t0 = Instant::now();
        rig.lifecycle.poll(t0);
        rig.lifecycle.poll(t0 + Duration::from_millis(150));
        rig.lifecycle.drain();
        rig.lifecycle.stop();

        assert!(rig.lifecycle.sleep().is_err());
        assert_eq!(rig.lifecycle.state(), LifecycleState::Sleeping);
        assert_eq!(rig.events.lock().unwrap().last().unwrap(), "power.sleep");
    }

    #[test]
    fn steps_out_of_order_are_no_ops() {
        let mut rig = rig(true, false);
        rig.lifecycle.drain();
        rig.lifecycle.stop();
        assert!(rig.lifecycle.sleep().is_ok());
        assert_eq!(rig.lifecycle.state(), LifecycleState::Streaming);
        assert!(rig.events.lock().unwrap().is_empty());
    }
}
