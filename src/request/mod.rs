//! The per-request protocol state machine and the responder contract.
//!
//! A request advances `Params -> In -> Out` purely on record arrivals. Its
//! mailbox decouples the transceiver thread (which enqueues decoded
//! records) from the worker that drives the state machine; a CAS latch
//! guarantees at most one worker runs a given request at a time.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use bytes::Bytes;
use smallvec::SmallVec;

use crate::protocol::{
    self as fcgi, ProtocolStatus, RecordHeader, RecordType, Role,
};
use crate::router::{NotFound, Router};
use crate::sockets::SocketId;
use crate::transceiver::{SendHandle, WriteOp};
use crate::Config;

pub(crate) mod environment;

use environment::Environment;


/// A synthetic message delivered to a request from outside the protocol.
///
/// `kind` is an application-chosen code, always non-zero (zero marks
/// protocol records internally). Deliver one through a [`Callback`] to
/// re-schedule a responder that yielded while waiting for external work.
#[derive(Debug, Clone)]
pub struct Message {
    /// Application-defined discriminator, at least 1.
    pub kind: u16,
    /// Opaque payload.
    pub body: Bytes,
}

/// One delivery into a request's mailbox.
#[derive(Debug)]
pub(crate) enum Mail {
    /// A decoded protocol record.
    Record { head: RecordHeader, body: Bytes },
    /// A synthetic message from a [`Callback`].
    Signal(Message),
}


/// The application's side of a request.
///
/// A responder is created by the factory registered with the
/// [`Router`](crate::Router) once the request's Params stream is complete.
/// The single required operation is [`respond`](Responder::respond); the
/// remaining hooks customize post-body handling and error pages.
pub trait Responder: Send {
    /// Produces (more of) the response.
    ///
    /// Invoked once the request body has been consumed, and again for every
    /// synthetic [`Message`] that arrives while the previous invocation
    /// returned `Ok(false)`. Return `Ok(true)` when the response is
    /// complete.
    ///
    /// # Errors
    /// An error ends the request with the built-in 500 page.
    fn respond(&mut self, cx: &mut Context<'_>) -> io::Result<bool>;

    /// Observes each chunk of the request body as it arrives.
    fn in_chunk(&mut self, _chunk: &[u8]) {}

    /// Consumes the raw request body at end-of-stream.
    ///
    /// Return `true` to claim the body and suppress the built-in decoding
    /// into `posts`/`files`.
    fn in_end(&mut self, _env: &Environment, _body: &[u8]) -> bool {
        false
    }

    /// Caps the request body size, overriding
    /// [`Config::max_post_size`](crate::Config).
    fn max_post_size(&self) -> Option<u64> {
        None
    }

    /// Writes the page answering an internal error.
    ///
    /// # Errors
    /// Propagates write errors; the request ends either way.
    fn error_page(&mut self, _env: &Environment, out: &mut OutStream) -> io::Result<()> {
        status_page(out, http::StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// Writes the page answering an oversized request body.
    ///
    /// # Errors
    /// Propagates write errors; the request ends either way.
    fn big_post_error_page(&mut self, _env: &Environment, out: &mut OutStream) -> io::Result<()> {
        status_page(out, http::StatusCode::PAYLOAD_TOO_LARGE)
    }

    /// Writes the page answering a request body of unknown content type.
    ///
    /// # Errors
    /// Propagates write errors; the request ends either way.
    fn unknown_content_error_page(
        &mut self,
        _env: &Environment,
        out: &mut OutStream,
    ) -> io::Result<()> {
        status_page(out, http::StatusCode::UNSUPPORTED_MEDIA_TYPE)
    }
}

/// Writes a minimal CGI/1.1 error document for `status`.
///
/// # Errors
/// Forwards write errors from the output stream.
pub fn status_page(out: &mut OutStream, status: http::StatusCode) -> io::Result<()> {
    let code = status.as_u16();
    let reason = status.canonical_reason().unwrap_or("Error");
    write!(out, "Status: {code} {reason}\nContent-Type: text/html; charset=utf-8\r\n\r\n")?;
    write!(
        out,
        "<!DOCTYPE html>\
         <html lang='en'>\
             <head><title>{code} {reason}</title></head>\
             <body><h1>{code} {reason}</h1></body>\
         </html>",
    )
}


/// Everything a [`Responder`] may touch while producing its response.
pub struct Context<'a> {
    /// The request's CGI environment, complete and frozen.
    pub env: &'a Environment,
    /// The response body stream, framed into `Stdout` records.
    pub out: &'a mut OutStream,
    /// The diagnostics stream, framed into `Stderr` records.
    pub err: &'a mut OutStream,
    /// The most recent synthetic message, if any arrived.
    pub message: Option<&'a Message>,
    callback: Callback,
}

impl Context<'_> {
    /// Returns a handle for delivering [`Message`]s to this request from
    /// other threads.
    #[must_use]
    pub fn callback(&self) -> Callback {
        self.callback.clone()
    }
}

/// A cloneable handle that injects a [`Message`] into a request's mailbox
/// and re-schedules it.
///
/// Harmless once the request has completed.
#[derive(Debug, Clone)]
pub struct Callback {
    cell: Weak<RequestCell>,
}

impl Callback {
    /// Delivers `message` and schedules the request for another
    /// [`Responder::respond`] round.
    pub fn send(&self, message: Message) {
        if let Some(cell) = self.cell.upgrade() {
            cell.enqueue(Mail::Signal(message));
            cell.schedule();
        }
    }
}


/// A buffering byte sink that frames its contents into stream records.
///
/// Writes accumulate until [`flush`](Write::flush) (or an internal
/// threshold) packages them into records of one type and submits them to
/// the transceiver's write queue.
pub struct OutStream {
    rtype: RecordType,
    request_id: u16,
    socket: SocketId,
    send: SendHandle,
    buf: Vec<u8>,
    dirty: bool,
}

impl OutStream {
    fn new(rtype: RecordType, request_id: u16, socket: SocketId, send: SendHandle) -> Self {
        Self { rtype, request_id, socket, send, buf: Vec::new(), dirty: false }
    }

    /// Sends `data` without copying it through the internal buffer.
    ///
    /// Buffered bytes are flushed first so output stays ordered. Useful for
    /// large blobs like uploaded file contents.
    pub fn dump(&mut self, data: &[u8]) {
        self.flush_buffer();
        if data.is_empty() {
            return;
        }
        let mut records = Vec::with_capacity(data.len() + fcgi::RecordHeader::LEN + 8);
        fcgi::append_stream(&mut records, self.rtype, self.request_id, data);
        self.submit(records);
    }

    fn flush_buffer(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        let mut records = Vec::with_capacity(self.buf.len() + fcgi::RecordHeader::LEN + 8);
        fcgi::append_stream(&mut records, self.rtype, self.request_id, &self.buf);
        self.buf.clear();
        self.submit(records);
    }

    fn submit(&mut self, records: Vec<u8>) {
        self.dirty = true;
        self.send.submit(WriteOp {
            socket: self.socket,
            data: records.into(),
            close: false,
            end_of: None,
        });
    }

    /// Whether this stream has ever emitted a record.
    fn dirty(&self) -> bool {
        self.dirty
    }
}

impl Write for OutStream {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        if self.buf.len() >= fcgi::MAX_CONTENT_LEN {
            self.flush_buffer();
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_buffer();
        Ok(())
    }
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Params,
    In,
    Out,
    Complete,
}

enum Flow {
    Continue,
    Respond,
    Stop,
}

enum Page {
    Internal,
    BigPost,
    UnknownContent,
}

struct Inner {
    state: State,
    env: Environment,
    /// Name-value pair split across Params record boundaries.
    partial_pair: SmallVec<[u8; 64]>,
    post: Vec<u8>,
    queue: VecDeque<Mail>,
    responder: Option<Box<dyn Responder>>,
    message: Option<Message>,
    status: ProtocolStatus,
    out: OutStream,
    err: OutStream,
}

/// Library-side state of one FastCGI request.
///
/// Shared between the transceiver (which owns the map of live requests and
/// enqueues mail) and at most one worker at a time (which holds the inner
/// mutex while driving the state machine).
pub(crate) struct RequestCell {
    /// Self-reference for worker tokens and [`Callback`]s.
    me: Weak<RequestCell>,
    socket: SocketId,
    request_id: u16,
    role: Role,
    keep_conn: bool,
    /// Set while a worker token for this request is queued or running.
    scheduled: AtomicBool,
    /// Set once the request has completed or its socket died.
    dead: AtomicBool,
    sched: crossbeam_channel::Sender<Weak<RequestCell>>,
    send: SendHandle,
    router: Arc<Router>,
    config: Arc<Config>,
    inner: Mutex<Inner>,
}

impl RequestCell {
    pub(crate) fn new(
        socket: SocketId,
        request_id: u16,
        begin: fcgi::BeginRequest,
        sched: crossbeam_channel::Sender<Weak<RequestCell>>,
        send: SendHandle,
        router: Arc<Router>,
        config: Arc<Config>,
    ) -> Arc<Self> {
        let out = OutStream::new(RecordType::Stdout, request_id, socket, send.clone());
        let err = OutStream::new(RecordType::Stderr, request_id, socket, send.clone());
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            socket, request_id,
            role: begin.role,
            keep_conn: begin.flags.contains(fcgi::RequestFlags::KeepConn),
            scheduled: AtomicBool::new(false),
            dead: AtomicBool::new(false),
            sched, send, router, config,
            inner: Mutex::new(Inner {
                state: State::Params,
                env: Environment::default(),
                partial_pair: SmallVec::new(),
                post: Vec::new(),
                queue: VecDeque::new(),
                responder: None,
                message: None,
                status: ProtocolStatus::RequestComplete,
                out, err,
            }),
        })
    }

    pub(crate) fn enqueue(&self, mail: Mail) {
        if self.dead.load(Ordering::Acquire) {
            return;
        }
        self.lock().queue.push_back(mail);
    }

    /// Hands the request to the worker pool unless a token is already out.
    pub(crate) fn schedule(&self) {
        if self.dead.load(Ordering::Acquire) {
            return;
        }
        if !self.scheduled.swap(true, Ordering::AcqRel) {
            if self.sched.send(self.me.clone()).is_err() {
                // Worker pool is gone; nothing will drive this request.
                self.scheduled.store(false, Ordering::Release);
            }
        }
    }

    /// Severs the request from the outside world after its socket died.
    pub(crate) fn kill(&self) {
        self.dead.store(true, Ordering::Release);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Worker entry point: consume queued mail until it runs out or the
    /// request completes.
    pub(crate) fn drive(&self) {
        let mut inner = self.lock();
        while !self.dead.load(Ordering::Acquire) {
            let Some(mail) = inner.queue.pop_front() else { break };
            let flow = match mail {
                Mail::Record { head, body } => self.on_record(&mut inner, head, &body),
                Mail::Signal(message) => {
                    inner.message = Some(message);
                    Flow::Respond
                },
            };
            match flow {
                Flow::Continue => (),
                Flow::Stop => break,
                Flow::Respond => match self.invoke_respond(&mut inner) {
                    Ok(false) => (),
                    Ok(true) => {
                        self.complete(&mut inner);
                        break;
                    },
                    Err(e) => {
                        tracing::error!(
                            request_id = self.request_id,
                            error = %e,
                            "responder failed, answering with an error page",
                        );
                        self.emit_page(&mut inner, &Page::Internal);
                        self.complete(&mut inner);
                        break;
                    },
                },
            }
        }

        self.scheduled.store(false, Ordering::Release);
        let again = !self.dead.load(Ordering::Acquire) && !inner.queue.is_empty();
        drop(inner);
        if again {
            // Mail arrived between the loop ending and the latch clearing.
            self.schedule();
        }
    }

    fn on_record(&self, inner: &mut Inner, head: RecordHeader, body: &Bytes) -> Flow {
        match head.rtype {
            RecordType::AbortRequest => {
                tracing::debug!(request_id = self.request_id, "request aborted by the web server");
                self.complete(inner);
                return Flow::Stop;
            },
            // Role and flags were captured at construction.
            RecordType::BeginRequest => return Flow::Continue,
            _ => (),
        }

        match (inner.state, head.rtype) {
            (State::Params, RecordType::Params) => self.on_params(inner, body),
            (State::In, RecordType::Stdin) => self.on_stdin(inner, body),
            (state, rtype) => {
                tracing::warn!(
                    request_id = self.request_id,
                    ?state,
                    ?rtype,
                    "records received out of order from the web server",
                );
                self.emit_page(inner, &Page::Internal);
                self.complete(inner);
                Flow::Stop
            },
        }
    }

    fn on_params(&self, inner: &mut Inner, body: &Bytes) -> Flow {
        if !self.role.is_supported() {
            tracing::warn!(request_id = self.request_id, role = ?self.role, "asked to fill an unsupported role");
            inner.status = ProtocolStatus::UnknownRole;
            self.complete(inner);
            return Flow::Stop;
        }

        if !body.is_empty() {
            fill_params(inner, body);
            return Flow::Continue;
        }

        // End of Params: the environment is frozen, bind the responder.
        if !inner.partial_pair.is_empty() {
            tracing::warn!(request_id = self.request_id, "Params stream ended inside a name-value pair");
            inner.partial_pair.clear();
        }
        let responder = self
            .router
            .dispatch(&inner.env.script_name, &inner.env.request_uri)
            .unwrap_or_else(|| Box::new(NotFound));
        let max_post = responder.max_post_size().unwrap_or(self.config.max_post_size);
        inner.responder = Some(responder);

        if inner.env.content_length > max_post {
            tracing::warn!(
                request_id = self.request_id,
                declared = inner.env.content_length,
                max_post,
                "declared request body exceeds the post limit",
            );
            self.emit_page(inner, &Page::BigPost);
            self.complete(inner);
            return Flow::Stop;
        }
        inner.state = State::In;
        Flow::Continue
    }

    fn on_stdin(&self, inner: &mut Inner, body: &Bytes) -> Flow {
        if body.is_empty() {
            inner.state = State::Out;
            return self.on_post_complete(inner);
        }

        if (inner.post.len() + body.len()) as u64 > inner.env.content_length {
            tracing::warn!(
                request_id = self.request_id,
                declared = inner.env.content_length,
                "request body exceeds its declared length",
            );
            self.emit_page(inner, &Page::BigPost);
            self.complete(inner);
            return Flow::Stop;
        }
        inner.post.extend_from_slice(body);

        let Inner { responder, .. } = &mut *inner;
        if let Some(responder) = responder {
            let hook = std::panic::catch_unwind(AssertUnwindSafe(|| responder.in_chunk(body)));
            if hook.is_err() {
                tracing::error!(request_id = self.request_id, "in_chunk hook panicked");
                self.emit_page(inner, &Page::Internal);
                self.complete(inner);
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    fn on_post_complete(&self, inner: &mut Inner) -> Flow {
        let body = Bytes::from(std::mem::take(&mut inner.post));

        let Inner { env, responder, .. } = &mut *inner;
        let claimed = match responder {
            Some(responder) => {
                match std::panic::catch_unwind(AssertUnwindSafe(|| responder.in_end(env, &body))) {
                    Ok(claimed) => claimed,
                    Err(_) => {
                        tracing::error!(request_id = self.request_id, "in_end hook panicked");
                        self.emit_page(inner, &Page::Internal);
                        self.complete(inner);
                        return Flow::Stop;
                    },
                }
            },
            None => false,
        };

        if !claimed && !inner.env.parse_post(&body) {
            tracing::warn!(
                request_id = self.request_id,
                content_type = %inner.env.content_type,
                "request body has an unknown content type",
            );
            self.emit_page(inner, &Page::UnknownContent);
            self.complete(inner);
            return Flow::Stop;
        }
        Flow::Respond
    }

    fn invoke_respond(&self, inner: &mut Inner) -> io::Result<bool> {
        let Inner { env, out, err, message, responder, .. } = &mut *inner;
        let Some(responder) = responder else {
            // A synthetic message raced ahead of the Params stream; keep it
            // for the first real respond round.
            return Ok(false);
        };

        let mut cx = Context {
            env, out, err,
            message: message.as_ref(),
            callback: Callback { cell: self.me.clone() },
        };
        match std::panic::catch_unwind(AssertUnwindSafe(|| responder.respond(&mut cx))) {
            Ok(result) => result,
            Err(_) => Err(io::Error::other("responder panicked")),
        }
    }

    fn emit_page(&self, inner: &mut Inner, page: &Page) {
        let Inner { env, out, responder, .. } = &mut *inner;
        let result = match responder {
            Some(responder) => {
                std::panic::catch_unwind(AssertUnwindSafe(|| match page {
                    Page::Internal => responder.error_page(env, out),
                    Page::BigPost => responder.big_post_error_page(env, out),
                    Page::UnknownContent => responder.unknown_content_error_page(env, out),
                }))
                .unwrap_or_else(|_| Err(io::Error::other("error page hook panicked")))
            },
            None => status_page(out, http::StatusCode::INTERNAL_SERVER_ERROR),
        };
        if let Err(e) = result {
            tracing::error!(request_id = self.request_id, error = %e, "unable to write error page");
        }
    }

    /// Flushes both streams, terminates them, and emits `EndRequest`.
    ///
    /// The connection is closed after the flush iff the web server did not
    /// ask for it to be kept.
    fn complete(&self, inner: &mut Inner) {
        if inner.state == State::Complete {
            return;
        }
        inner.state = State::Complete;
        let _ = inner.out.flush();
        let _ = inner.err.flush();

        let mut tail = Vec::with_capacity(2 * RecordHeader::LEN + 16);
        if inner.out.dirty() {
            fcgi::append_end_of_stream(&mut tail, RecordType::Stdout, self.request_id);
        }
        if inner.err.dirty() {
            fcgi::append_end_of_stream(&mut tail, RecordType::Stderr, self.request_id);
        }
        let end = fcgi::EndRequest { app_status: 0, protocol_status: inner.status };
        tail.extend_from_slice(&end.to_record(self.request_id));

        self.send.submit(WriteOp {
            socket: self.socket,
            data: tail.into(),
            close: !self.keep_conn,
            end_of: Some(self.request_id),
        });
        tracing::debug!(request_id = self.request_id, status = ?inner.status, "request complete");

        self.dead.store(true, Ordering::Release);
        inner.queue.clear();
    }
}


fn fill_params(inner: &mut Inner, body: &[u8]) {
    let Inner { env, partial_pair, .. } = inner;
    if partial_pair.is_empty() {
        let mut it = fcgi::nv::NvIter::new(body);
        for (name, value) in &mut it {
            env.fill(name, value);
        }
        partial_pair.extend_from_slice(it.remainder());
    } else {
        partial_pair.extend_from_slice(body);
        let carried = std::mem::take(partial_pair);
        let mut it = fcgi::nv::NvIter::new(&carried);
        for (name, value) in &mut it {
            env.fill(name, value);
        }
        partial_pair.extend_from_slice(it.remainder());
    }
}


#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    use crate::protocol::{BeginRequest, EndRequest, RequestFlags};
    use super::*;

    const SOCKET: SocketId = SocketId { fd: 9, gen: 1 };
    const REQ_ID: u16 = 1;

    struct Harness {
        cell: Arc<RequestCell>,
        ops: Arc<Mutex<VecDeque<WriteOp>>>,
        _sched: crossbeam_channel::Receiver<Weak<RequestCell>>,
    }

    fn harness(role: Role, flags: RequestFlags, router: Router) -> Harness {
        let (tx, rx) = crossbeam_channel::unbounded();
        let (send, ops) = SendHandle::sink();
        let begin = BeginRequest { role, flags };
        let cell = RequestCell::new(
            SOCKET, REQ_ID, begin, tx, send,
            Arc::new(router), Arc::new(Config::default()),
        );
        Harness { cell, ops, _sched: rx }
    }

    fn record(rtype: RecordType, body: &[u8]) -> Mail {
        let mut head = RecordHeader::new(rtype, REQ_ID);
        head.set_lengths(body.len() as u16);
        Mail::Record { head, body: Bytes::copy_from_slice(body) }
    }

    fn params(pairs: &[(&str, &str)]) -> Mail {
        let mut body = Vec::new();
        for &(n, v) in pairs {
            fcgi::nv::write(n.as_bytes(), v.as_bytes(), &mut body).unwrap();
        }
        record(RecordType::Params, &body)
    }

    /// Splits the submitted write ops back into (type, body) pairs.
    fn sent_records(h: &Harness) -> Vec<(RecordType, Vec<u8>)> {
        let mut wire = Vec::new();
        for op in h.ops.lock().unwrap().iter() {
            wire.extend_from_slice(&op.data);
        }
        let mut records = Vec::new();
        let mut rest = &wire[..];
        while rest.len() >= RecordHeader::LEN {
            let head = RecordHeader::from_bytes(rest[..8].try_into().unwrap()).unwrap();
            let end = 8 + usize::from(head.content_length);
            records.push((head.rtype, rest[8..end].to_vec()));
            rest = &rest[end + usize::from(head.padding_length)..];
        }
        assert!(rest.is_empty(), "trailing partial record in output");
        records
    }

    fn stdout_body(h: &Harness) -> Vec<u8> {
        sent_records(h)
            .into_iter()
            .filter(|(t, _)| *t == RecordType::Stdout)
            .flat_map(|(_, b)| b)
            .collect()
    }

    fn end_request(h: &Harness) -> EndRequest {
        let records = sent_records(h);
        let (rtype, body) = records.last().expect("no records were sent");
        assert_eq!(*rtype, RecordType::EndRequest, "EndRequest must come last");
        EndRequest::from_bytes(body[..8].try_into().unwrap()).unwrap()
    }

    struct Hello;
    impl Responder for Hello {
        fn respond(&mut self, cx: &mut Context<'_>) -> io::Result<bool> {
            write!(cx.out, "Content-Type: text/plain\r\n\r\nhi")?;
            Ok(true)
        }
    }

    fn hello_router() -> Router {
        let mut router = Router::new();
        router.route("/hello", || Box::new(Hello));
        router
    }

    #[test]
    fn responder_flow() {
        let h = harness(Role::Responder, RequestFlags::empty(), hello_router());
        h.cell.enqueue(params(&[("SCRIPT_NAME", "/hello"), ("REQUEST_URI", "/hello")]));
        h.cell.enqueue(params(&[]));
        h.cell.enqueue(record(RecordType::Stdin, b""));
        h.cell.drive();

        assert_eq!(stdout_body(&h), b"Content-Type: text/plain\r\n\r\nhi");
        let end = end_request(&h);
        assert_eq!(end.protocol_status, ProtocolStatus::RequestComplete);
        assert_eq!(end.app_status, 0);

        // The stream is terminated before EndRequest and the connection
        // closes since KeepConn was not requested.
        let records = sent_records(&h);
        let terminator = &records[records.len() - 2];
        assert_eq!(terminator.0, RecordType::Stdout);
        assert!(terminator.1.is_empty());
        let last_op = h.ops.lock().unwrap().back().unwrap().close;
        assert!(last_op);
    }

    #[test]
    fn keep_conn_leaves_connection_open() {
        let h = harness(Role::Responder, RequestFlags::KeepConn, hello_router());
        h.cell.enqueue(params(&[("REQUEST_URI", "/hello")]));
        h.cell.enqueue(params(&[]));
        h.cell.enqueue(record(RecordType::Stdin, b""));
        h.cell.drive();

        assert_eq!(end_request(&h).protocol_status, ProtocolStatus::RequestComplete);
        assert!(h.ops.lock().unwrap().iter().all(|op| !op.close));
        assert_eq!(h.ops.lock().unwrap().back().unwrap().end_of, Some(REQ_ID));
    }

    #[test]
    fn unsupported_role_ends_without_output() {
        let h = harness(Role::Filter, RequestFlags::empty(), hello_router());
        h.cell.enqueue(params(&[("REQUEST_URI", "/hello")]));
        h.cell.enqueue(params(&[]));
        h.cell.drive();

        let records = sent_records(&h);
        assert_eq!(records.len(), 1, "only EndRequest may be emitted");
        assert_eq!(end_request(&h).protocol_status, ProtocolStatus::UnknownRole);
    }

    #[test]
    fn router_miss_yields_404() {
        let h = harness(Role::Responder, RequestFlags::empty(), hello_router());
        h.cell.enqueue(params(&[("REQUEST_URI", "/elsewhere")]));
        h.cell.enqueue(params(&[]));
        h.cell.enqueue(record(RecordType::Stdin, b""));
        h.cell.drive();

        let body = stdout_body(&h);
        assert!(body.starts_with(b"Status: 404 Not Found\n"));
        assert_eq!(end_request(&h).protocol_status, ProtocolStatus::RequestComplete);
    }

    struct Untouchable(Arc<AtomicUsize>);
    impl Responder for Untouchable {
        fn respond(&mut self, _cx: &mut Context<'_>) -> io::Result<bool> {
            self.0.fetch_add(1, Ordering::Relaxed);
            Ok(true)
        }
    }

    #[test]
    fn oversize_declaration_answers_413_before_any_body() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut router = Router::new();
        router.route("/upload", move || Box::new(Untouchable(counter.clone())));

        let h = harness(Role::Responder, RequestFlags::empty(), router);
        let too_big = (Config::default().max_post_size + 1).to_string();
        h.cell.enqueue(params(&[
            ("REQUEST_URI", "/upload"),
            ("CONTENT_LENGTH", &too_big),
        ]));
        h.cell.enqueue(params(&[]));
        h.cell.drive();

        assert!(stdout_body(&h).starts_with(b"Status: 413 "));
        assert_eq!(end_request(&h).protocol_status, ProtocolStatus::RequestComplete);
        assert_eq!(calls.load(Ordering::Relaxed), 0, "respond must never run");
    }

    #[test]
    fn body_overrunning_declared_length_answers_413() {
        let h = harness(Role::Responder, RequestFlags::empty(), hello_router());
        h.cell.enqueue(params(&[("REQUEST_URI", "/hello"), ("CONTENT_LENGTH", "3")]));
        h.cell.enqueue(params(&[]));
        h.cell.enqueue(record(RecordType::Stdin, b"abcde"));
        h.cell.drive();

        assert!(stdout_body(&h).starts_with(b"Status: 413 "));
    }

    #[test]
    fn unknown_content_type_answers_415() {
        let h = harness(Role::Responder, RequestFlags::empty(), hello_router());
        h.cell.enqueue(params(&[
            ("REQUEST_URI", "/hello"),
            ("CONTENT_TYPE", "application/octet-stream"),
            ("CONTENT_LENGTH", "4"),
        ]));
        h.cell.enqueue(params(&[]));
        h.cell.enqueue(record(RecordType::Stdin, b"\x01\x02\x03\x04"));
        h.cell.enqueue(record(RecordType::Stdin, b""));
        h.cell.drive();

        assert!(stdout_body(&h).starts_with(b"Status: 415 "));
    }

    #[test]
    fn abort_ends_promptly_and_silences_the_request() {
        let h = harness(Role::Responder, RequestFlags::empty(), hello_router());
        h.cell.enqueue(params(&[("REQUEST_URI", "/hello"), ("CONTENT_LENGTH", "100")]));
        h.cell.enqueue(params(&[]));
        h.cell.enqueue(record(RecordType::Stdin, b"partial"));
        h.cell.enqueue(record(RecordType::AbortRequest, b""));
        h.cell.drive();

        let records = sent_records(&h);
        assert_eq!(records.len(), 1);
        assert_eq!(end_request(&h).protocol_status, ProtocolStatus::RequestComplete);

        // Records arriving after the abort are discarded.
        h.cell.enqueue(record(RecordType::Stdin, b"more"));
        h.cell.drive();
        assert_eq!(sent_records(&h).len(), records.len());
    }

    #[test]
    fn out_of_order_records_answer_500() {
        let h = harness(Role::Responder, RequestFlags::empty(), hello_router());
        h.cell.enqueue(record(RecordType::Stdin, b"too early"));
        h.cell.drive();

        assert!(stdout_body(&h).starts_with(b"Status: 500 "));
        assert_eq!(end_request(&h).protocol_status, ProtocolStatus::RequestComplete);
    }

    struct EnvProbe {
        seen: Arc<Mutex<Option<(String, Vec<u8>, String)>>>,
    }
    impl Responder for EnvProbe {
        fn respond(&mut self, cx: &mut Context<'_>) -> io::Result<bool> {
            let file = &cx.env.files["avatar"];
            *self.seen.lock().unwrap() = Some((
                cx.env.posts["name"].clone(),
                file.data.to_vec(),
                file.content_type.clone(),
            ));
            write!(cx.out, "Content-Type: text/plain\r\n\r\nok")?;
            Ok(true)
        }
    }

    #[test]
    fn multipart_upload_populates_posts_and_files() {
        let seen = Arc::new(Mutex::new(None));
        let probe = seen.clone();
        let mut router = Router::new();
        router.route("/upload", move || Box::new(EnvProbe { seen: probe.clone() }));

        let body: &[u8] =
            b"--xyz\r\n\
              Content-Disposition: form-data; name=\"name\"\r\n\r\n\
              alice\r\n\
              --xyz\r\n\
              Content-Disposition: form-data; name=\"avatar\"; filename=\"a.png\"\r\n\
              Content-Type: image/png\r\n\r\n\
              \x89PNGdata\r\n\
              --xyz--\r\n";

        let h = harness(Role::Responder, RequestFlags::empty(), router);
        h.cell.enqueue(params(&[
            ("REQUEST_URI", "/upload"),
            ("REQUEST_METHOD", "POST"),
            ("CONTENT_TYPE", "multipart/form-data; boundary=xyz"),
            ("CONTENT_LENGTH", &body.len().to_string()),
        ]));
        h.cell.enqueue(params(&[]));
        // Deliver the body in two chunks to exercise accumulation.
        h.cell.enqueue(record(RecordType::Stdin, &body[..20]));
        h.cell.enqueue(record(RecordType::Stdin, &body[20..]));
        h.cell.enqueue(record(RecordType::Stdin, b""));
        h.cell.drive();

        let guard = seen.lock().unwrap();
        let (name, data, ctype) = guard.as_ref().expect("respond never ran");
        assert_eq!(name, "alice");
        assert_eq!(data, b"\x89PNGdata");
        assert_eq!(ctype, "image/png");
        assert_eq!(end_request(&h).protocol_status, ProtocolStatus::RequestComplete);
    }

    struct Waiter {
        rounds: usize,
    }
    impl Responder for Waiter {
        fn respond(&mut self, cx: &mut Context<'_>) -> io::Result<bool> {
            self.rounds += 1;
            match cx.message {
                Some(msg) => {
                    write!(cx.out, "kind={} round={}", msg.kind, self.rounds)?;
                    Ok(true)
                },
                None => Ok(false),
            }
        }
    }

    #[test]
    fn responder_awaits_external_message() {
        let mut router = Router::new();
        router.route("/wait", || Box::new(Waiter { rounds: 0 }));

        let h = harness(Role::Responder, RequestFlags::empty(), router);
        h.cell.enqueue(params(&[("REQUEST_URI", "/wait")]));
        h.cell.enqueue(params(&[]));
        h.cell.enqueue(record(RecordType::Stdin, b""));
        h.cell.drive();
        assert!(sent_records(&h).is_empty(), "responder should be parked");

        h.cell.enqueue(Mail::Signal(Message { kind: 7, body: Bytes::new() }));
        h.cell.drive();
        assert_eq!(stdout_body(&h), b"kind=7 round=2");
        assert_eq!(end_request(&h).protocol_status, ProtocolStatus::RequestComplete);
    }

    struct Parked {
        slot: Arc<Mutex<Option<Callback>>>,
    }
    impl Responder for Parked {
        fn respond(&mut self, cx: &mut Context<'_>) -> io::Result<bool> {
            match cx.message {
                Some(_) => Ok(true),
                None => {
                    *self.slot.lock().unwrap() = Some(cx.callback());
                    Ok(false)
                },
            }
        }
    }

    #[test]
    fn callback_reschedules_request() {
        let slot = Arc::new(Mutex::new(None));
        let probe = slot.clone();
        let mut router = Router::new();
        router.route("/park", move || Box::new(Parked { slot: probe.clone() }));

        let h = harness(Role::Responder, RequestFlags::empty(), router);
        h.cell.enqueue(params(&[("REQUEST_URI", "/park")]));
        h.cell.enqueue(params(&[]));
        h.cell.enqueue(record(RecordType::Stdin, b""));
        h.cell.drive();

        let callback = slot.lock().unwrap().take().expect("responder stored no callback");
        callback.send(Message { kind: 1, body: Bytes::new() });
        let token = h._sched.try_recv().expect("callback should schedule the request");
        token.upgrade().expect("request is alive").drive();

        assert_eq!(end_request(&h).protocol_status, ProtocolStatus::RequestComplete);
    }

    struct Bomb;
    impl Responder for Bomb {
        fn respond(&mut self, _cx: &mut Context<'_>) -> io::Result<bool> {
            panic!("responder exploded");
        }
    }

    #[test]
    fn panicking_responder_answers_500() {
        let mut router = Router::new();
        router.route("/boom", || Box::new(Bomb));

        let h = harness(Role::Responder, RequestFlags::empty(), router);
        h.cell.enqueue(params(&[("REQUEST_URI", "/boom")]));
        h.cell.enqueue(params(&[]));
        h.cell.enqueue(record(RecordType::Stdin, b""));
        h.cell.drive();

        assert!(stdout_body(&h).starts_with(b"Status: 500 "));
        assert_eq!(end_request(&h).protocol_status, ProtocolStatus::RequestComplete);
    }

    #[test]
    fn params_pair_split_across_records() {
        let h = harness(Role::Responder, RequestFlags::empty(), hello_router());
        let mut encoded = Vec::new();
        fcgi::nv::write(b"REQUEST_URI", b"/hello", &mut encoded).unwrap();
        fcgi::nv::write(b"HTTP_HOST", b"example.com", &mut encoded).unwrap();

        let cut = encoded.len() - 5;
        h.cell.enqueue(record(RecordType::Params, &encoded[..cut]));
        h.cell.enqueue(record(RecordType::Params, &encoded[cut..]));
        h.cell.enqueue(params(&[]));
        h.cell.enqueue(record(RecordType::Stdin, b""));
        h.cell.drive();

        assert_eq!(stdout_body(&h), b"Content-Type: text/plain\r\n\r\nhi");
    }
}
