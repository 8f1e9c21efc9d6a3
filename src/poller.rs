//! A readiness poller over raw file descriptors.
//!
//! Thin wrapper around [`mio::Poll`] that reports one ready descriptor per
//! call, buffering the rest of a batch internally. Descriptors are
//! registered through [`mio::unix::SourceFd`], so inherited descriptors and
//! freshly created sockets are handled uniformly and the token is simply
//! the descriptor value.

use std::collections::VecDeque;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Interest, Token};


/// The pseudo-descriptor reported when the poll was interrupted by
/// [`Poller::waker`] rather than by socket readiness.
pub const WAKE_FD: RawFd = -1;

const WAKE_TOKEN: Token = Token(usize::MAX);

bitflags::bitflags! {
    /// Event flags reported for a ready descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Readiness: u8 {
        /// The descriptor is readable.
        const IN = 0x01;
        /// The descriptor is writable.
        const OUT = 0x02;
        /// The descriptor is in an error state.
        const ERR = 0x04;
        /// The peer hung up entirely.
        const HUP = 0x08;
        /// The peer shut down its writing half.
        const RDHUP = 0x10;
    }
}

/// One ready descriptor and the events observed on it.
#[derive(Debug, Clone, Copy)]
pub struct Ready {
    /// The ready descriptor, or [`WAKE_FD`] for a wake-up event.
    pub fd: RawFd,
    /// The observed event flags.
    pub events: Readiness,
}

impl Ready {
    /// Tests whether this event came from [`Poller::waker`].
    #[inline]
    #[must_use]
    pub fn is_wake(&self) -> bool {
        self.fd == WAKE_FD
    }
}


/// A readiness poller for a dynamic set of file descriptors.
#[derive(Debug)]
pub struct Poller {
    poll: mio::Poll,
    events: mio::Events,
    pending: VecDeque<Ready>,
}

impl Poller {
    /// Creates a new, empty [`Poller`].
    ///
    /// # Errors
    /// Returns an error if the OS readiness facility cannot be created.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: mio::Poll::new()?,
            events: mio::Events::with_capacity(64),
            pending: VecDeque::new(),
        })
    }

    /// Creates a waker which interrupts a blocked [`Poller::poll`] from
    /// another thread.
    ///
    /// # Errors
    /// Returns an error if the wake channel cannot be set up.
    pub fn waker(&self) -> io::Result<mio::Waker> {
        mio::Waker::new(self.poll.registry(), WAKE_TOKEN)
    }

    /// Starts watching `fd` for read readiness.
    ///
    /// # Errors
    /// Returns an error if `fd` cannot be registered, for example because it
    /// already is.
    pub fn add(&self, fd: RawFd) -> io::Result<()> {
        self.poll.registry().register(&mut SourceFd(&fd), Token(fd as usize), Interest::READABLE)
    }

    /// Additionally watches, or stops watching, `fd` for write readiness.
    ///
    /// # Errors
    /// Returns an error if `fd` is not currently registered.
    pub fn set_writable(&self, fd: RawFd, writable: bool) -> io::Result<()> {
        let interest = if writable {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        self.poll.registry().reregister(&mut SourceFd(&fd), Token(fd as usize), interest)
    }

    /// Stops watching `fd`.
    ///
    /// # Errors
    /// Returns an error if `fd` is not currently registered.
    pub fn del(&self, fd: RawFd) -> io::Result<()> {
        self.poll.registry().deregister(&mut SourceFd(&fd))
    }

    /// Waits for readiness and reports one ready descriptor.
    ///
    /// A [`None`] timeout blocks until an event or a wake-up arrives.
    /// Returns [`Ok(None)`] if the timeout elapsed or the underlying call
    /// was interrupted by a signal.
    ///
    /// # Errors
    /// Returns an error if the OS poll fails for any other reason.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Option<Ready>> {
        if let Some(ready) = self.pending.pop_front() {
            return Ok(Some(ready));
        }

        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(None);
            }
            return Err(e);
        }

        for ev in self.events.iter() {
            if ev.token() == WAKE_TOKEN {
                self.pending.push_back(Ready { fd: WAKE_FD, events: Readiness::IN });
                continue;
            }

            let mut events = Readiness::empty();
            if ev.is_readable() {
                events |= Readiness::IN;
            }
            if ev.is_writable() {
                events |= Readiness::OUT;
            }
            if ev.is_error() {
                events |= Readiness::ERR;
            }
            if ev.is_read_closed() {
                events |= Readiness::RDHUP;
            }
            if ev.is_write_closed() {
                events |= Readiness::HUP;
            }
            self.pending.push_back(Ready { fd: ev.token().0 as RawFd, events });
        }
        Ok(self.pending.pop_front())
    }
}
