//! Lifecycle orchestration: the worker pool, signal handling, and the glue
//! between the application, the router, and the transceiver thread.

use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::{Arc, PoisonError, Weak};
use std::thread::JoinHandle;

use crate::request::{RequestCell, Responder};
use crate::router::Router;
use crate::sockets::{SocketGroup, WakeHandle};
use crate::transceiver::{Shared, Transceiver};
use crate::Config;


/// The FastCGI application: listeners, routes, workers, and shutdown.
///
/// Typical use from `main`:
///
/// ```no_run
/// # use fastcgi_responder::{Config, Manager};
/// # fn responder() -> Box<dyn fastcgi_responder::Responder> { unimplemented!() }
/// fn main() -> std::io::Result<()> {
///     let mut manager = Manager::new(Config::default())?;
///     manager.route("/hello", || responder());
///     manager.listen_tcp(Some("127.0.0.1"), "9000")?;
///     manager.setup_signals()?;
///     manager.start()?;
///     manager.join();
///     Ok(())
/// }
/// ```
pub struct Manager {
    config: Arc<Config>,
    router: Router,
    /// Present until `start` moves it onto the transceiver thread.
    group: Option<SocketGroup>,
    wake: WakeHandle,
    shared: Arc<Shared>,
    sched_tx: Option<crossbeam_channel::Sender<Weak<RequestCell>>>,
    sched_rx: crossbeam_channel::Receiver<Weak<RequestCell>>,
    addrs: Vec<SocketAddr>,
    threads: Vec<JoinHandle<()>>,
    started: bool,
}

impl Manager {
    /// Creates a new [`Manager`] with its poller and wake-up channel.
    ///
    /// # Errors
    /// Returns an error if the OS readiness facility cannot be created.
    pub fn new(config: Config) -> io::Result<Self> {
        let group = SocketGroup::new()?;
        let wake = group.wake_handle();
        let (sched_tx, sched_rx) = crossbeam_channel::unbounded();
        Ok(Self {
            config: Arc::new(config),
            router: Router::new(),
            group: Some(group),
            wake,
            shared: Shared::new(),
            sched_tx: Some(sched_tx),
            sched_rx,
            addrs: Vec::new(),
            threads: Vec::new(),
            started: false,
        })
    }

    /// Registers `factory` for requests whose path starts with `prefix`.
    ///
    /// The routing table is frozen once [`start`](Manager::start) runs.
    pub fn route<F>(&mut self, prefix: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Responder> + Send + Sync + 'static,
    {
        self.router.route(prefix, factory);
    }

    fn group_mut(&mut self) -> io::Result<&mut SocketGroup> {
        self.group.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "listeners must be set up before start()")
        })
    }

    /// Enables `SO_REUSEADDR` on listeners created afterwards.
    ///
    /// # Errors
    /// Returns an error after [`start`](Manager::start).
    pub fn set_reuse(&mut self, reuse: bool) -> io::Result<()> {
        self.group_mut()?.set_reuse(reuse);
        Ok(())
    }

    /// Adopts the listening socket inherited on descriptor 0 from a
    /// FastCGI-aware parent process.
    ///
    /// # Errors
    /// Returns an error if descriptor 0 is not a listening socket or the
    /// manager has already started.
    pub fn listen(&mut self) -> io::Result<()> {
        self.group_mut()?.listen_inherited()
    }

    /// Binds and listens on a local stream socket at `path`, optionally
    /// applying `permissions` (a raw mode like `0o660`) and an
    /// `owner`/`group` resolved by name.
    ///
    /// # Errors
    /// Returns an error on any bind, ownership, or permission failure.
    pub fn listen_unix(
        &mut self,
        path: impl AsRef<Path>,
        permissions: Option<u32>,
        owner: Option<&str>,
        group: Option<&str>,
    ) -> io::Result<()> {
        self.group_mut()?.listen_unix(path.as_ref(), permissions, owner, group)
    }

    /// Binds and listens on a TCP endpoint. `interface` defaults to the
    /// wildcard address; `service` is a numeric port.
    ///
    /// # Errors
    /// Returns an error if no resolved address accepts a bind.
    pub fn listen_tcp(&mut self, interface: Option<&str>, service: &str) -> io::Result<()> {
        let group = self.group_mut()?;
        group.listen_tcp(interface, service)?;
        self.addrs = group.local_addrs();
        Ok(())
    }

    /// The local addresses of all TCP listeners bound so far.
    #[must_use]
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }

    /// Installs signal handlers: SIGTERM/SIGINT trigger a graceful
    /// [`stop`](Manager::stop), SIGSEGV/SIGABRT print a best-effort
    /// back-trace before re-raising.
    ///
    /// # Errors
    /// Returns an error if a handler cannot be registered.
    pub fn setup_signals(&self) -> io::Result<()> {
        use signal_hook::consts::{SIGABRT, SIGINT, SIGSEGV, SIGTERM};

        let mut signals = signal_hook::iterator::Signals::new([SIGTERM, SIGINT])?;
        let shared = self.shared.clone();
        let wake = self.wake.clone();
        std::thread::Builder::new()
            .name("fcgi-signals".into())
            .spawn(move || {
                if let Some(signal) = signals.forever().next() {
                    tracing::info!(signal, "terminal signal received, draining");
                    shared.stop.store(true, Ordering::Release);
                    wake.wake();
                }
            })?;

        for signal in [SIGSEGV, SIGABRT] {
            install_fault_handler(signal)?;
        }
        Ok(())
    }

    /// Spawns the transceiver thread and the worker pool.
    ///
    /// The worker count is [`Config::workers`], defaulting to the machine's
    /// available parallelism.
    ///
    /// # Errors
    /// Returns an error if called twice or if a thread cannot be spawned.
    pub fn start(&mut self) -> io::Result<()> {
        let group = self.group.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "manager has already been started")
        })?;
        let router = Arc::new(std::mem::take(&mut self.router));
        let sched_tx = self
            .sched_tx
            .clone()
            .expect("scheduler sender lives until join()");

        let workers = self
            .config
            .workers
            .or_else(|| std::thread::available_parallelism().ok())
            .map_or(1, std::num::NonZeroUsize::get);

        let mut transceiver =
            Transceiver::new(group, self.shared.clone(), sched_tx, router, self.config.clone());

        for i in 0..workers {
            let sched_rx = self.sched_rx.clone();
            let worker = std::thread::Builder::new()
                .name(format!("fcgi-worker-{i}"))
                .spawn(move || worker_loop(&sched_rx))?;
            self.threads.push(worker);
        }
        let loop_thread = std::thread::Builder::new()
            .name("fcgi-transceiver".into())
            .spawn(move || transceiver.run())?;
        self.threads.push(loop_thread);

        tracing::info!(workers, "manager started");
        self.started = true;
        Ok(())
    }

    /// Requests a graceful shutdown: stop accepting, let in-flight
    /// requests finish, flush, exit.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.wake.wake();
    }

    /// Pauses (`false`) or resumes (`true`) acceptance of new connections
    /// without touching in-flight requests.
    pub fn accept(&self, status: bool) {
        self.shared.accepting.store(status, Ordering::Release);
        self.wake.wake();
    }

    /// Blocks until the transceiver has drained, then reaps all threads.
    ///
    /// Returns immediately if [`start`](Manager::start) never ran. Shutdown
    /// is initiated by [`stop`](Manager::stop) or a terminal signal (see
    /// [`setup_signals`](Manager::setup_signals)).
    pub fn join(&mut self) {
        if !self.started {
            return;
        }

        let mut done = self.shared.done.lock().unwrap_or_else(PoisonError::into_inner);
        while !*done {
            done = self
                .shared
                .done_cv
                .wait(done)
                .unwrap_or_else(PoisonError::into_inner);
        }
        drop(done);

        // Closing the channel releases the workers once the last request
        // cell (and with it, the last sender clone) is gone.
        self.sched_tx = None;
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                tracing::error!("a manager thread panicked");
            }
        }
        self.started = false;
        tracing::info!("manager drained");
    }
}


fn worker_loop(sched_rx: &crossbeam_channel::Receiver<Weak<RequestCell>>) {
    for token in sched_rx.iter() {
        let Some(cell) = token.upgrade() else { continue };
        // Panics inside responder hooks are handled closer to the request;
        // this is the backstop keeping the worker itself alive.
        if std::panic::catch_unwind(AssertUnwindSafe(|| cell.drive())).is_err() {
            tracing::error!("worker survived a panic while driving a request");
        }
    }
}

/// Best-effort fatal diagnostics; distinct from graceful shutdown.
#[allow(unsafe_code)] // signal handler registration
fn install_fault_handler(signal: i32) -> io::Result<()> {
    // SAFETY: the handler only runs on a crashing thread and ends in the
    // re-raised default handler. Capturing the trace is not async-signal
    // safe, which is acceptable for diagnostics of a dying process.
    unsafe {
        signal_hook::low_level::register(signal, move || {
            let trace = std::backtrace::Backtrace::force_capture();
            eprintln!("fatal signal {signal}\n{trace}");
            let _ = signal_hook::low_level::emulate_default_handler(signal);
        })?;
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::time::Duration;

    use crate::protocol::{
        self as fcgi, ProtocolStatus, RecordHeader, RecordType, NULL_REQUEST_ID,
    };
    use crate::request::Context;
    use super::*;

    struct Hello;
    impl Responder for Hello {
        fn respond(&mut self, cx: &mut Context<'_>) -> io::Result<bool> {
            write!(cx.out, "Content-Type: text/plain\r\n\r\nhi")?;
            Ok(true)
        }
    }

    fn started_manager() -> (Manager, SocketAddr) {
        let mut manager = Manager::new(Config::default()).expect("manager setup");
        manager.route("/hello", || Box::new(Hello));
        manager.listen_tcp(Some("127.0.0.1"), "0").expect("bind loopback");
        let addr = manager.local_addrs()[0];
        manager.start().expect("start");
        (manager, addr)
    }

    fn record(rtype: RecordType, request_id: u16, body: &[u8]) -> Vec<u8> {
        let mut head = RecordHeader::new(rtype, request_id);
        head.set_lengths(body.len() as u16);
        let mut wire = head.to_bytes().to_vec();
        wire.extend_from_slice(body);
        wire.extend_from_slice(head.padding_bytes());
        wire
    }

    fn begin(request_id: u16, role: fcgi::Role, keep: bool) -> Vec<u8> {
        let flags = if keep { fcgi::RequestFlags::KeepConn } else { fcgi::RequestFlags::empty() };
        record(
            RecordType::BeginRequest,
            request_id,
            &fcgi::BeginRequest { role, flags }.to_bytes(),
        )
    }

    fn params(request_id: u16, pairs: &[(&str, &str)]) -> Vec<u8> {
        let mut body = Vec::new();
        for &(n, v) in pairs {
            fcgi::nv::write(n.as_bytes(), v.as_bytes(), &mut body).unwrap();
        }
        record(RecordType::Params, request_id, &body)
    }

    /// Reads frames until the EndRequest for `request_id` arrives.
    fn read_until_end(stream: &mut TcpStream, request_id: u16) -> Vec<(RecordType, u16, Vec<u8>)> {
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("set timeout");
        let mut frames = Vec::new();
        loop {
            let mut raw = [0; RecordHeader::LEN];
            stream.read_exact(&mut raw).expect("record header");
            let head = RecordHeader::from_bytes(raw).expect("valid header");
            let mut body = vec![0; head.content_length.into()];
            stream.read_exact(&mut body).expect("record body");
            let mut padding = vec![0; head.padding_length.into()];
            stream.read_exact(&mut padding).expect("record padding");

            let done = head.rtype == RecordType::EndRequest && head.request_id == request_id;
            frames.push((head.rtype, head.request_id, body));
            if done {
                return frames;
            }
        }
    }

    fn stdout_of(frames: &[(RecordType, u16, Vec<u8>)], request_id: u16) -> Vec<u8> {
        frames
            .iter()
            .filter(|(t, id, _)| *t == RecordType::Stdout && *id == request_id)
            .flat_map(|(_, _, b)| b.clone())
            .collect()
    }

    fn end_status(frames: &[(RecordType, u16, Vec<u8>)]) -> ProtocolStatus {
        let (_, _, body) = frames.last().expect("frames end with EndRequest");
        fcgi::EndRequest::from_bytes(body[..8].try_into().unwrap())
            .expect("valid EndRequest")
            .protocol_status
    }

    fn drive_hello(stream: &mut TcpStream, request_id: u16, keep: bool) {
        stream.write_all(&begin(request_id, fcgi::Role::Responder, keep)).unwrap();
        stream
            .write_all(&params(request_id, &[("SCRIPT_NAME", "/hello"), ("REQUEST_URI", "/hello")]))
            .unwrap();
        stream.write_all(&params(request_id, &[])).unwrap();
        stream.write_all(&record(RecordType::Stdin, request_id, b"")).unwrap();

        let frames = read_until_end(stream, request_id);
        assert_eq!(stdout_of(&frames, request_id), b"Content-Type: text/plain\r\n\r\nhi");
        assert_eq!(end_status(&frames), ProtocolStatus::RequestComplete);
    }

    #[test]
    fn hello_over_tcp_closes_connection() {
        let (mut manager, addr) = started_manager();
        let mut stream = TcpStream::connect(addr).expect("connect");
        drive_hello(&mut stream, 1, false);

        // Without KeepConn the server closes once the response is flushed.
        let mut rest = Vec::new();
        assert_eq!(stream.read_to_end(&mut rest).expect("read close"), 0);

        manager.stop();
        manager.join();
    }

    #[test]
    fn keep_conn_serves_a_second_request() {
        let (mut manager, addr) = started_manager();
        let mut stream = TcpStream::connect(addr).expect("connect");
        drive_hello(&mut stream, 1, true);
        drive_hello(&mut stream, 2, true);

        manager.stop();
        manager.join();
    }

    #[test]
    fn unsupported_role_gets_unknown_role_without_output() {
        let (mut manager, addr) = started_manager();
        let mut stream = TcpStream::connect(addr).expect("connect");
        stream.write_all(&begin(1, fcgi::Role::Filter, false)).unwrap();

        let frames = read_until_end(&mut stream, 1);
        assert_eq!(frames.len(), 1, "only EndRequest may be emitted");
        assert_eq!(end_status(&frames), ProtocolStatus::UnknownRole);

        manager.stop();
        manager.join();
    }

    #[test]
    fn reserved_flag_bits_do_not_strand_the_request() {
        let (mut manager, addr) = started_manager();
        let mut stream = TcpStream::connect(addr).expect("connect");

        // keepConn plus reserved flag bits; only keepConn may be honored.
        let body = [0x00, 0x01, 0x81, 0x00, 0x00, 0x00, 0x00, 0x00];
        stream.write_all(&record(RecordType::BeginRequest, 1, &body)).unwrap();
        stream.write_all(&params(1, &[("REQUEST_URI", "/hello")])).unwrap();
        stream.write_all(&params(1, &[])).unwrap();
        stream.write_all(&record(RecordType::Stdin, 1, b"")).unwrap();

        let frames = read_until_end(&mut stream, 1);
        assert_eq!(stdout_of(&frames, 1), b"Content-Type: text/plain\r\n\r\nhi");
        assert_eq!(end_status(&frames), ProtocolStatus::RequestComplete);

        // keepConn was honored, so the connection serves a second request.
        drive_hello(&mut stream, 2, true);

        manager.stop();
        manager.join();
    }

    #[test]
    fn get_values_is_answered() {
        let (mut manager, addr) = started_manager();
        let mut stream = TcpStream::connect(addr).expect("connect");

        let mut query = Vec::new();
        fcgi::nv::write(b"FCGI_MAX_CONNS", b"", &mut query).unwrap();
        fcgi::nv::write(b"FCGI_MPXS_CONNS", b"", &mut query).unwrap();
        stream
            .write_all(&record(RecordType::GetValues, NULL_REQUEST_ID, &query))
            .unwrap();

        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut raw = [0; RecordHeader::LEN];
        stream.read_exact(&mut raw).expect("response header");
        let head = RecordHeader::from_bytes(raw).expect("valid header");
        assert_eq!(head.rtype, RecordType::GetValuesResult);
        assert_eq!(head.request_id, NULL_REQUEST_ID);

        let mut body = vec![0; usize::from(head.content_length) + usize::from(head.padding_length)];
        stream.read_exact(&mut body).expect("response body");
        let pairs: Vec<_> = fcgi::nv::NvIter::new(&body[..head.content_length.into()]).collect();
        assert!(pairs.contains(&(&b"FCGI_MPXS_CONNS"[..], &b"1"[..])));
        assert!(pairs.iter().any(|(n, _)| *n == b"FCGI_MAX_CONNS"));

        manager.stop();
        manager.join();
    }

    #[test]
    fn requests_multiplex_on_one_connection() {
        let (mut manager, addr) = started_manager();
        let mut stream = TcpStream::connect(addr).expect("connect");

        // Interleave two keep-alive requests at record granularity.
        stream.write_all(&begin(1, fcgi::Role::Responder, true)).unwrap();
        stream.write_all(&begin(2, fcgi::Role::Responder, true)).unwrap();
        stream.write_all(&params(1, &[("REQUEST_URI", "/hello")])).unwrap();
        stream.write_all(&params(2, &[("REQUEST_URI", "/hello")])).unwrap();
        stream.write_all(&params(2, &[])).unwrap();
        stream.write_all(&params(1, &[])).unwrap();
        stream.write_all(&record(RecordType::Stdin, 2, b"")).unwrap();
        stream.write_all(&record(RecordType::Stdin, 1, b"")).unwrap();

        let mut done = [false; 2];
        while !done.iter().all(|d| *d) {
            let frames = read_until_end_any(&mut stream);
            for (rtype, id, body) in frames {
                if rtype == RecordType::EndRequest {
                    let end = fcgi::EndRequest::from_bytes(body[..8].try_into().unwrap()).unwrap();
                    assert_eq!(end.protocol_status, ProtocolStatus::RequestComplete);
                    done[usize::from(id) - 1] = true;
                }
            }
        }

        manager.stop();
        manager.join();
    }

    /// Reads frames until any EndRequest arrives.
    fn read_until_end_any(stream: &mut TcpStream) -> Vec<(RecordType, u16, Vec<u8>)> {
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("set timeout");
        let mut frames = Vec::new();
        loop {
            let mut raw = [0; RecordHeader::LEN];
            stream.read_exact(&mut raw).expect("record header");
            let head = RecordHeader::from_bytes(raw).expect("valid header");
            let mut rest = vec![0; usize::from(head.content_length) + usize::from(head.padding_length)];
            stream.read_exact(&mut rest).expect("record body");
            rest.truncate(head.content_length.into());

            let done = head.rtype == RecordType::EndRequest;
            frames.push((head.rtype, head.request_id, rest));
            if done {
                return frames;
            }
        }
    }
}
