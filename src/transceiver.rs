//! The transceiver: the single thread that owns all socket I/O.
//!
//! Inbound, it reassembles the record stream per socket, answers the
//! management channel itself, and routes everything else into per-request
//! mailboxes, scheduling idle requests onto the worker pool. Outbound, it
//! drains the write queue that requests submit serialized records into,
//! honoring record boundaries and per-request ordering.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};

use bytes::{Buf, Bytes};

use crate::protocol::{self as fcgi, RecordHeader, RecordType, NULL_REQUEST_ID};
use crate::request::{Mail, RequestCell};
use crate::router::Router;
use crate::sockets::{FlushStatus, ReadStatus, SocketEvent, SocketGroup, SocketId, WakeHandle};
use crate::Config;


/// A batch of serialized records bound for one socket.
#[derive(Debug)]
pub(crate) struct WriteOp {
    pub(crate) socket: SocketId,
    pub(crate) data: Bytes,
    /// Close the socket once its outbox drains.
    pub(crate) close: bool,
    /// The record batch ends this request id; retire it on admission.
    pub(crate) end_of: Option<u16>,
}

/// The submission endpoint handed to requests.
///
/// Requests know nothing about sockets or the poller; they only push
/// serialized records here and the wake-up nudges the transceiver.
#[derive(Debug, Clone)]
pub(crate) struct SendHandle {
    queue: Arc<Mutex<VecDeque<WriteOp>>>,
    wake: Option<WakeHandle>,
}

impl SendHandle {
    pub(crate) fn submit(&self, op: WriteOp) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(op);
        if let Some(wake) = &self.wake {
            wake.wake();
        }
    }

    /// A handle whose submissions pile up for inspection. Test use only.
    #[cfg(test)]
    pub(crate) fn sink() -> (Self, Arc<Mutex<VecDeque<WriteOp>>>) {
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        (Self { queue: queue.clone(), wake: None }, queue)
    }
}


/// Control state shared between the manager and the transceiver thread.
pub(crate) struct Shared {
    /// Graceful shutdown requested.
    pub(crate) stop: AtomicBool,
    /// Desired accept state; false pauses new connections.
    pub(crate) accepting: AtomicBool,
    pub(crate) done: Mutex<bool>,
    pub(crate) done_cv: Condvar,
}

impl Shared {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            stop: AtomicBool::new(false),
            accepting: AtomicBool::new(true),
            done: Mutex::new(false),
            done_cv: Condvar::new(),
        })
    }
}


pub(crate) struct Transceiver {
    group: SocketGroup,
    requests: HashMap<(SocketId, u16), Arc<RequestCell>>,
    outbound: Arc<Mutex<VecDeque<WriteOp>>>,
    shared: Arc<Shared>,
    sched: crossbeam_channel::Sender<Weak<RequestCell>>,
    router: Arc<Router>,
    config: Arc<Config>,
}

impl Transceiver {
    pub(crate) fn new(
        group: SocketGroup,
        shared: Arc<Shared>,
        sched: crossbeam_channel::Sender<Weak<RequestCell>>,
        router: Arc<Router>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            group,
            requests: HashMap::new(),
            outbound: Arc::new(Mutex::new(VecDeque::new())),
            shared, sched, router, config,
        }
    }

    fn send_handle(&self) -> SendHandle {
        SendHandle {
            queue: self.outbound.clone(),
            wake: Some(self.group.wake_handle()),
        }
    }

    /// The transceiver thread's main loop.
    ///
    /// Exits once a stop was requested, all requests have retired, and all
    /// outboxes are flushed. The shared done flag is raised on the way out.
    pub(crate) fn run(&mut self) {
        tracing::debug!("transceiver loop starting");
        loop {
            let stopping = self.shared.stop.load(Ordering::Acquire);
            let accepting = self.shared.accepting.load(Ordering::Acquire) && !stopping;
            self.group.accept(accepting);
            self.pump_outbound();

            if stopping && self.requests.is_empty() && self.group.all_flushed() {
                break;
            }

            match self.group.poll(true) {
                Ok(None) | Ok(Some(SocketEvent::Woken)) => (),
                Ok(Some(SocketEvent::Readable(id))) => self.on_readable(id),
                Ok(Some(SocketEvent::Writable(id))) => {
                    if self.group.flush(id) == FlushStatus::Closed {
                        self.abandon(id);
                    }
                },
                Err(e) => {
                    tracing::error!(error = %e, "poll failed, shutting the transceiver down");
                    break;
                },
            }
        }

        for id in self.group.socket_ids() {
            self.group.close(id);
        }
        tracing::debug!("transceiver loop finished");
        *self.shared.done.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.shared.done_cv.notify_all();
    }

    /// Moves queued submissions into per-socket outboxes and flushes them.
    fn pump_outbound(&mut self) {
        let ops: Vec<WriteOp> = {
            let mut queue = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
            queue.drain(..).collect()
        };

        let mut touched = Vec::new();
        for op in ops {
            if let Some(request_id) = op.end_of {
                self.requests.remove(&(op.socket, request_id));
            }
            if !self.group.queue_write(op.socket, op.data) {
                tracing::trace!(fd = op.socket.fd, "dropping write for a departed socket");
                continue;
            }
            if op.close {
                self.group.close_after_flush(op.socket);
            }
            if !touched.contains(&op.socket) {
                touched.push(op.socket);
            }
        }
        for id in touched {
            if self.group.flush(id) == FlushStatus::Closed {
                self.abandon(id);
            }
        }
    }

    fn on_readable(&mut self, id: SocketId) {
        let mut eof = false;
        loop {
            match self.group.read_some(id) {
                Ok(ReadStatus::Data(_)) => (),
                Ok(ReadStatus::WouldBlock) => break,
                Ok(ReadStatus::Eof) => {
                    eof = true;
                    break;
                },
                Err(e) => {
                    tracing::warn!(fd = id.fd, error = %e, "socket read failed");
                    self.group.close(id);
                    self.abandon(id);
                    return;
                },
            }
        }

        if let Err(e) = self.drain_records(id) {
            tracing::error!(fd = id.fd, error = %e, "unrecoverable record stream, closing socket");
            self.group.close(id);
            self.abandon(id);
            return;
        }
        if eof {
            self.group.close(id);
            self.abandon(id);
            return;
        }

        // A write-readiness edge may have been folded into this event;
        // retry any blocked outbox now so it cannot stall.
        if self.group.contains(id) && self.group.flush(id) == FlushStatus::Closed {
            self.abandon(id);
        }
    }

    /// Extracts every complete record from the socket's reassembly buffer.
    ///
    /// # Errors
    /// An unknown protocol version is unrecoverable: without a trusted
    /// length field there is no next record boundary to resynchronize on.
    fn drain_records(&mut self, id: SocketId) -> Result<(), fcgi::Error> {
        loop {
            let Some(inbox) = self.group.inbox_mut(id) else { return Ok(()) };
            if inbox.len() < RecordHeader::LEN {
                return Ok(());
            }
            let raw: [u8; RecordHeader::LEN] = inbox[..RecordHeader::LEN]
                .try_into()
                .expect("slice length matches the array");

            match RecordHeader::from_bytes(raw) {
                Ok(head) => {
                    let content = usize::from(head.content_length);
                    let padding = usize::from(head.padding_length);
                    if inbox.len() < RecordHeader::LEN + content + padding {
                        return Ok(());
                    }
                    inbox.advance(RecordHeader::LEN);
                    let body = inbox.split_to(content).freeze();
                    inbox.advance(padding);
                    self.dispatch(id, head, body);
                },
                Err(fcgi::Error::UnknownRecordType(rtype)) => {
                    let (request_id, content, padding) = fcgi::raw_lengths(raw);
                    let total = RecordHeader::LEN + usize::from(content) + usize::from(padding);
                    if inbox.len() < total {
                        return Ok(());
                    }
                    inbox.advance(total);
                    tracing::debug!(rtype, request_id, "skipping record of unknown type");
                    let unknown = fcgi::UnknownType { rtype }.to_record();
                    self.answer(id, Bytes::copy_from_slice(&unknown));
                },
                Err(e) => return Err(e),
            }
        }
    }

    fn dispatch(&mut self, socket: SocketId, head: RecordHeader, body: Bytes) {
        if head.request_id == NULL_REQUEST_ID {
            return self.on_management(socket, &head, &body);
        }
        if head.rtype == RecordType::BeginRequest {
            return self.on_begin(socket, &head, &body);
        }

        match self.requests.get(&(socket, head.request_id)) {
            Some(cell) => {
                cell.enqueue(Mail::Record { head, body });
                cell.schedule();
            },
            None => {
                tracing::trace!(
                    request_id = head.request_id,
                    rtype = ?head.rtype,
                    "discarding record for an unknown request",
                );
            },
        }
    }

    fn on_management(&mut self, socket: SocketId, head: &RecordHeader, body: &Bytes) {
        match head.rtype {
            RecordType::GetValues => {
                let mut vars = fcgi::ProtocolVariables::empty();
                for (name, _) in fcgi::nv::NvIter::new(body) {
                    match fcgi::ProtocolVariables::parse_name(name) {
                        Ok(var) => vars |= var,
                        Err(_) => tracing::debug!(
                            name = %String::from_utf8_lossy(name),
                            "ignoring unknown GetValues variable",
                        ),
                    }
                }
                let mut response = Vec::new();
                vars.append_response(&mut response, self.config.max_conns.get());
                self.answer(socket, response.into());
            },
            rtype => {
                tracing::debug!(?rtype, "ignoring unexpected management record");
            },
        }
    }

    fn on_begin(&mut self, socket: SocketId, head: &RecordHeader, body: &Bytes) {
        let Some(raw) = body.get(..fcgi::BeginRequest::LEN) else {
            tracing::warn!(
                request_id = head.request_id,
                len = body.len(),
                "BeginRequest body is too short",
            );
            return;
        };
        let raw: [u8; fcgi::BeginRequest::LEN] =
            raw.try_into().expect("slice length matches the array");

        let begin = match fcgi::BeginRequest::from_bytes(raw) {
            Ok(begin) if begin.role.is_supported() => begin,
            Ok(begin) => {
                tracing::info!(request_id = head.request_id, role = ?begin.role, "rejecting unsupported role");
                return self.reject(socket, head.request_id);
            },
            Err(fcgi::Error::UnknownRole(role)) => {
                tracing::info!(request_id = head.request_id, role, "rejecting unknown role");
                return self.reject(socket, head.request_id);
            },
            // No other parse error exists today; should one appear, the id
            // must still be answered or the web server waits on it forever.
            Err(e) => {
                tracing::warn!(request_id = head.request_id, error = %e, "rejecting malformed BeginRequest");
                return self.reject(socket, head.request_id);
            },
        };

        let key = (socket, head.request_id);
        if self.requests.contains_key(&key) {
            tracing::warn!(request_id = head.request_id, "duplicate BeginRequest for an active id");
            return;
        }

        tracing::debug!(request_id = head.request_id, role = ?begin.role, "new request");
        let cell = RequestCell::new(
            socket,
            head.request_id,
            begin,
            self.sched.clone(),
            self.send_handle(),
            self.router.clone(),
            self.config.clone(),
        );
        cell.enqueue(Mail::Record { head: *head, body: body.clone() });
        self.requests.insert(key, cell.clone());
        cell.schedule();
    }

    fn reject(&mut self, socket: SocketId, request_id: u16) {
        let end = fcgi::EndRequest {
            app_status: 0,
            protocol_status: fcgi::ProtocolStatus::UnknownRole,
        };
        self.answer(socket, Bytes::copy_from_slice(&end.to_record(request_id)));
    }

    /// Queues a direct (non-request) response and flushes opportunistically.
    fn answer(&mut self, socket: SocketId, data: Bytes) {
        if self.group.queue_write(socket, data) && self.group.flush(socket) == FlushStatus::Closed {
            self.abandon(socket);
        }
    }

    /// Releases every request bound to a dead socket.
    fn abandon(&mut self, socket: SocketId) {
        self.requests.retain(|(sock, request_id), cell| {
            if *sock == socket {
                tracing::debug!(request_id = *request_id, "abandoning request on a dead socket");
                cell.kill();
                false
            } else {
                true
            }
        });
    }
}
