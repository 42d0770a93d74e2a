use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Clone)]
pub struct StopSignal {
    rx: Receiver<()>,
}

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Sleeps for `interval` or until the task is terminated, whichever comes
    /// first. Returns `true` if the task should exit.
    pub fn sleep(&self, interval: Duration) -> bool {
        match self.rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => false,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        }
    }
}

/// Creates a signal pair. The returned sender must be kept alive for as long
/// as the task should run.
pub fn stop_signal() -> (Sender<()>, StopSignal) {
    let (tx, rx) = crossbeam_channel::bounded(0);
    (tx, StopSignal { rx })
}

pub struct TaskHandle {
    name: String,
    stop: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl TaskHandle {
    pub fn spawn<F>(name: &str, body: F) -> std::io::Result<TaskHandle>
    where
        F: FnOnce(StopSignal) + Send + 'static,
    {
        let (tx, signal) = stop_signal();
        let join = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(signal))?;

        Ok(TaskHandle {
            name: name.to_string(),
            stop: Some(tx),
            join: Some(join),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.join.as_ref().is_some_and(|j| !j.is_finished())
    }

    /// Signals the task and waits for its thread to exit. Calling this on a
    /// task that already ended is a no-op.
    pub fn terminate(&mut self) {
        drop(self.stop.take());
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::warn!("task '{}' panicked before termination", self.name);
            } else {
                log::debug!("task '{}' terminated", self.name);
            }
        }
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[test]
    fn sleep_times_out_while_running() {
        let (_tx, signal) = stop_signal();
        assert!(!signal.sleep(Duration::from_millis(1)));
        assert!(!signal.is_stopped());
    }

    #[test]
    fn dropping_sender_wakes_sleeper() {
        let (tx, signal) = stop_signal();
        drop(tx);
        let started = Instant::now();
        assert!(signal.sleep(Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(signal.is_stopped());
    }

    #[test]
    fn terminate_interrupts_long_backoff() {
        let loops = Arc::new(AtomicUsize::new(0));
        let counter = loops.clone();
        let mut task = TaskHandle::spawn("test-task", move |stop| {
            while !stop.sleep(Duration::from_secs(5)) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

        assert!(task.is_running());
        let started = Instant::now();
        task.terminate();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!task.is_running());
        assert_eq!(loops.load(Ordering::SeqCst), 0);

        // second call is a no-op
        task.terminate();
    }
}
