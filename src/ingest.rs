use std::io::{self, Read};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::peripherals::StreamSource;
use crate::ring::RingBuffer;
use crate::task::StopSignal;

pub type SharedSource = Arc<dyn StreamSource>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Outcome of one scheduling turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStep {
    Transferred(usize),
    /// Connected, but nothing arrived this turn.
    Idle,
    /// No free space; the consumer is behind.
    Full,
    /// The link failed during this turn.
    Disconnected,
    /// Reconnecting failed; wait out the backoff.
    Backoff,
}

/// Pulls the PCM byte stream off the network into the ring buffer and
/// reconnects when the link drops.
pub struct StreamIngest {
    source: SharedSource,
    ring: Arc<RingBuffer>,
    scratch: Box<[u8]>,
    poll: Duration,
    backoff: Duration,
}

impl StreamIngest {
    pub fn new(
        source: SharedSource,
        ring: Arc<RingBuffer>,
        poll: Duration,
        backoff: Duration,
    ) -> StreamIngest {
        let scratch = vec![0u8; ring.capacity()].into_boxed_slice();
        StreamIngest {
            source,
            ring,
            scratch,
            poll,
            backoff,
        }
    }

    pub fn step(&mut self) -> IngestStep {
        let source = &self.source;

        if !source.is_connected() {
            match source.connect() {
                Ok(()) => log::info!("stream connected"),
                Err(e) => {
                    log::warn!("stream connect failed: {}", e);
                    return IngestStep::Backoff;
                }
            }
        }

        let free = self.ring.available_to_write().min(self.scratch.len());
        if free == 0 {
            return IngestStep::Full;
        }

        match source.read_available(&mut self.scratch[..free]) {
            Ok(0) => IngestStep::Idle,
            Ok(n) => {
                // single producer, so the free space cannot shrink underneath us
                let accepted = self.ring.write(&self.scratch[..n]);
                debug_assert_eq!(accepted, n);
                IngestStep::Transferred(accepted)
            }
            Err(e) => {
                log::warn!("stream read failed: {}", e);
                source.drop_connection();
                IngestStep::Disconnected
            }
        }
    }

    pub fn run(mut self, stop: StopSignal) {
        log::info!("ingest task started");
        loop {
            let wait = match self.step() {
                IngestStep::Backoff => self.backoff,
                _ => self.poll,
            };
            if stop.sleep(wait) {
                break;
            }
        }
        log::info!("ingest task exiting");
    }
}

/// Raw TCP byte stream from the streaming server.
///
/// Resolving and connecting happen without holding the stream lock, which
/// only ever guards non-blocking reads.
pub struct TcpSource {
    addr: String,
    stream: Mutex<Option<TcpStream>>,
    closed: AtomicBool,
}

impl TcpSource {
    pub fn new(addr: impl Into<String>) -> TcpSource {
        TcpSource {
            addr: addr.into(),
            stream: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    fn stream(&self) -> MutexGuard<'_, Option<TcpStream>> {
        self.stream.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open(&self) -> io::Result<TcpStream> {
        let mut last_err = io::Error::new(io::ErrorKind::InvalidInput, "address did not resolve");
        for addr in self.addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
                Ok(stream) => {
                    stream.set_nonblocking(true)?;
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }
}

fn source_closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "source closed")
}

impl StreamSource for TcpSource {
    fn is_connected(&self) -> bool {
        self.stream().is_some()
    }

    fn connect(&self) -> io::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(source_closed());
        }
        let opened = self.open()?;

        let mut stream = self.stream();
        // close() may have run while we were dialing
        if self.closed.load(Ordering::SeqCst) {
            let _ = opened.shutdown(Shutdown::Both);
            return Err(source_closed());
        }
        *stream = Some(opened);
        log::debug!("tcp stream open to {}", self.addr);
        Ok(())
    }

    fn read_available(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut stream = self.stream();
        let Some(stream) = stream.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "not connected"));
        };

        match stream.read(buf) {
            Ok(0) if !buf.is_empty() => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "server closed the stream",
            )),
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn drop_connection(&self) {
        if let Some(stream) = self.stream().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.drop_connection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::stop_signal;
    use std::collections::VecDeque;
    use std::io::Write;
    use std::net::TcpListener;
    use std::time::Instant;

    #[derive(Default)]
    struct Script {
        connected: bool,
        failed_connects_left: usize,
        connect_calls: usize,
        pending: VecDeque<u8>,
        fail_next_read: bool,
    }

    #[derive(Default)]
    struct ScriptedSource {
        script: Mutex<Script>,
        connect_delay: Duration,
        closed: AtomicBool,
    }

    impl ScriptedSource {
        fn new(script: Script) -> ScriptedSource {
            ScriptedSource {
                script: Mutex::new(script),
                ..Default::default()
            }
        }

        fn script(&self) -> MutexGuard<'_, Script> {
            self.script.lock().unwrap()
        }
    }

    impl StreamSource for ScriptedSource {
        fn is_connected(&self) -> bool {
            self.script().connected
        }

        fn connect(&self) -> io::Result<()> {
            std::thread::sleep(self.connect_delay);
            let mut script = self.script();
            script.connect_calls += 1;
            if self.closed.load(Ordering::SeqCst) {
                return Err(source_closed());
            }
            if script.failed_connects_left > 0 {
                script.failed_connects_left -= 1;
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
            }
            script.connected = true;
            Ok(())
        }

        fn read_available(&self, buf: &mut [u8]) -> io::Result<usize> {
            let mut script = self.script();
            if script.fail_next_read {
                script.fail_next_read = false;
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
            }
            let n = buf.len().min(script.pending.len());
            for (slot, byte) in buf.iter_mut().zip(script.pending.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }

        fn drop_connection(&self) {
            self.script().connected = false;
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
            self.drop_connection();
        }
    }

    fn ingest_with(
        source: ScriptedSource,
        capacity: usize,
    ) -> (StreamIngest, Arc<ScriptedSource>, Arc<RingBuffer>) {
        let source = Arc::new(source);
        let ring = Arc::new(RingBuffer::new(capacity));
        let ingest = StreamIngest::new(
            source.clone(),
            ring.clone(),
            Duration::from_millis(1),
            Duration::from_secs(5),
        );
        (ingest, source, ring)
    }

    #[test]
    fn transfers_min_of_available_and_free() {
        let source = ScriptedSource::new(Script {
            connected: true,
            pending: (0..10u8).collect(),
            ..Default::default()
        });
        let (mut ingest, source, ring) = ingest_with(source, 16);

        assert_eq!(ingest.step(), IngestStep::Transferred(10));
        assert_eq!(ingest.step(), IngestStep::Idle);

        source.script().pending.extend(100..120u8);
        assert_eq!(ingest.step(), IngestStep::Transferred(6));
        assert_eq!(ingest.step(), IngestStep::Full);
        assert_eq!(source.script().pending.len(), 14);

        let mut out = [0u8; 16];
        ring.read(&mut out);
        assert_eq!(&out[..10], &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert_eq!(&out[10..], &[100, 101, 102, 103, 104, 105]);
    }

    #[test]
    fn backs_off_until_connect_succeeds() {
        let source = ScriptedSource::new(Script {
            failed_connects_left: 2,
            pending: VecDeque::from(vec![1, 2, 3]),
            ..Default::default()
        });
        let (mut ingest, source, ring) = ingest_with(source, 16);

        assert_eq!(ingest.step(), IngestStep::Backoff);
        assert_eq!(ingest.step(), IngestStep::Backoff);
        assert_eq!(ingest.step(), IngestStep::Transferred(3));
        assert_eq!(source.script().connect_calls, 3);
        assert_eq!(ring.available_to_read(), 3);
    }

    #[test]
    fn read_failure_drops_link_and_reconnects() {
        let source = ScriptedSource::new(Script {
            connected: true,
            fail_next_read: true,
            pending: VecDeque::from(vec![9, 9]),
            ..Default::default()
        });
        let (mut ingest, source, _ring) = ingest_with(source, 16);

        assert_eq!(ingest.step(), IngestStep::Disconnected);
        assert!(!source.is_connected());
        assert_eq!(ingest.step(), IngestStep::Transferred(2));
        assert_eq!(source.script().connect_calls, 1);
    }

    #[test]
    fn close_is_not_held_up_by_a_slow_connect() {
        let source = ScriptedSource {
            connect_delay: Duration::from_millis(500),
            ..Default::default()
        };
        let (mut ingest, source, _ring) = ingest_with(source, 16);

        let worker = std::thread::spawn(move || ingest.step());
        std::thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        source.close();
        assert!(started.elapsed() < Duration::from_millis(100));

        // the dial that was in flight does not reopen the link
        assert_eq!(worker.join().unwrap(), IngestStep::Backoff);
        assert!(!source.is_connected());
    }

    #[test]
    fn run_exits_during_backoff() {
        let source = ScriptedSource::new(Script {
            failed_connects_left: usize::MAX,
            ..Default::default()
        });
        let (ingest, _source, _ring) = ingest_with(source, 16);
        let (tx, stop) = stop_signal();

        let worker = std::thread::spawn(move || ingest.run(stop));
        std::thread::sleep(Duration::from_millis(20));
        let started = Instant::now();
        drop(tx);
        worker.join().unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn tcp_source_reads_what_the_server_sends() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            conn.write_all(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        });

        let source = TcpSource::new(addr.to_string());
        assert!(!source.is_connected());
        source.connect().unwrap();
        server.join().unwrap();

        let mut received = Vec::new();
        let mut buf = [0u8; 16];
        let deadline = Instant::now() + Duration::from_secs(2);
        while received.len() < 8 && Instant::now() < deadline {
            match source.read_available(&mut buf) {
                Ok(n) => received.extend_from_slice(&buf[..n]),
                Err(_) => break,
            }
        }
        assert_eq!(received, vec![1, 2, 3, 4, 5, 6, 7, 8]);

        source.close();
        assert!(!source.is_connected());
        assert!(source.connect().is_err());
    }

    #[test]
    fn tcp_source_close_does_not_wait_for_dialing() {
        // unroutable: the dial either hangs until its timeout or fails outright
        let source = Arc::new(TcpSource::new("10.255.255.1:8888"));
        let dialer = source.clone();
        let worker = std::thread::spawn(move || dialer.connect());
        std::thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        source.close();
        assert!(started.elapsed() < Duration::from_millis(100));
        assert!(worker.join().unwrap().is_err());
        assert!(!source.is_connected());
    }
}
