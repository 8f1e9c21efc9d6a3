//! A multiplexing FastCGI responder library.
//!
//! The process accepts connections from a FastCGI-speaking web server,
//! demultiplexes concurrent requests per connection by request id, drives
//! each request through its protocol state machine on a worker pool, and
//! streams the generated response back as `Stdout`/`Stderr` records.
//!
//! One dedicated transceiver thread performs all socket I/O through a
//! readiness poller; worker threads only ever touch request state and
//! submit serialized records into the transceiver's write queue. Register
//! [`Responder`] factories on a [`Manager`] by URI prefix, point it at one
//! or more listeners, and call [`Manager::join`].
//!
//! Wire format reference:
//! <https://fastcgi-archives.github.io/FastCGI_Specification.html>

#![deny(unsafe_code, single_use_lifetimes, unused_lifetimes)]
#![warn(keyword_idents, let_underscore_drop, unreachable_pub, unused_import_braces)]

#![deny(clippy::suspicious, clippy::cargo)]
#![deny(clippy::exit, clippy::semicolon_inside_block, clippy::unwrap_used)]
#![warn(clippy::pedantic, clippy::multiple_crate_versions)]
#![allow(clippy::enum_glob_use, clippy::items_after_statements)]

use std::num::NonZeroUsize;

pub mod poller;
pub mod protocol;

mod manager;
mod request;
mod router;
mod sockets;
mod transceiver;

pub use manager::Manager;
pub use request::environment::{Environment, RequestMethod, UploadedFile};
pub use request::{status_page, Callback, Context, Message, OutStream, Responder};
pub use router::{ResponderFactory, Router};


const DEFAULT_MAX_CONNS: NonZeroUsize = match NonZeroUsize::new(1024) {
    Some(v) => v,
    None => unreachable!(),
};

/// Global settings of a [`Manager`].
#[derive(Debug, Clone)]
pub struct Config {
    /// The number of worker threads; defaults to the machine's available
    /// parallelism.
    pub workers: Option<NonZeroUsize>,
    /// The request body limit in bytes, unless a responder overrides it
    /// via [`Responder::max_post_size`]. Overruns answer with a 413 page.
    pub max_post_size: u64,
    /// The connection limit reported to `FCGI_MAX_CONNS`/`FCGI_MAX_REQS`
    /// queries. Informational; connections are not actively capped.
    pub max_conns: NonZeroUsize,
}

impl Config {
    /// The default [`Config::max_post_size`] of 2 MiB.
    pub const DEFAULT_MAX_POST_SIZE: u64 = 2 * 1024 * 1024;
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: None,
            max_post_size: Self::DEFAULT_MAX_POST_SIZE,
            max_conns: DEFAULT_MAX_CONNS,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = Config::default();
        assert!(config.workers.is_none());
        assert_eq!(config.max_post_size, 2 * 1024 * 1024);
        assert_eq!(config.max_conns.get(), 1024);
    }
}
