//! The FastCGI 1.0 wire format.
//!
//! Record framing, the validated field and body types, the name-value pair
//! codec, and the encoder that fragments logical output streams into
//! records. See the FastCGI specification, especially Appendix A:
//! <https://fastcgi-archives.github.io/FastCGI_Specification.html>

pub mod nv;
mod types;

pub use types::*;


/// The fixed FastCGI request ID of the management record channel.
pub const NULL_REQUEST_ID: u16 = 0;

/// The file descriptor of the listening socket inherited from a
/// FastCGI-aware parent process, per the FastCGI specification.
#[cfg(target_family = "unix")]
pub const LISTENSOCK_FILENO: std::os::fd::RawFd = 0;

/// The largest record body a 16-bit content length can describe.
pub const MAX_CONTENT_LEN: usize = u16::MAX as usize;


/// Error types that may occur while processing FastCGI protocol elements.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The FastCGI version field specifies an unknown version identifier.
    #[error("unknown FastCGI protocol version {0}")]
    UnknownVersion(u8),
    /// The FastCGI record type field specifies an unknown record type.
    #[error("unknown FastCGI record type {0}")]
    UnknownRecordType(u8),
    /// The FastCGI request role field specifies an unknown role identifier.
    #[error("unknown FastCGI role {0}")]
    UnknownRole(u16),
    /// The FastCGI request flags contain at least one unknown flag bit.
    #[error("unknown FastCGI request flags {0:#010b}")]
    UnknownFlags(u8),
    /// The FastCGI response protocol status specifies an unknown status.
    #[error("unknown FastCGI protocol status {0}")]
    UnknownStatus(u8),
    /// The FastCGI variable name did not match any well-known value.
    #[error("unknown FastCGI protocol variable name")]
    UnknownVariable,
    /// The input is too large for a FastCGI name-value length prefix.
    #[error("length {0} does not fit into a FastCGI name-value prefix")]
    OversizeLength(usize),
}


/// A FastCGI record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// The FastCGI version of this record.
    pub version: Version,
    /// The type of this record, defining its payload.
    pub rtype: RecordType,
    /// The ID of the request this record belongs to.
    pub request_id: u16,
    /// The length of this record's payload.
    pub content_length: u16,
    /// The number of discardable padding bytes following the payload.
    pub padding_length: u8,
}

impl RecordHeader {
    /// The number of bytes in the wire format of a [`RecordHeader`].
    pub const LEN: usize = 8;

    /// Creates a new [`RecordHeader`] with [`Version::V1`] and zero lengths.
    ///
    /// Use `RecordHeader::set_lengths` afterwards if the record has a body.
    #[inline]
    #[must_use]
    pub fn new(rtype: RecordType, request_id: u16) -> Self {
        Self { version: Version::V1, rtype, request_id, content_length: 0, padding_length: 0 }
    }

    /// Sets `content_length` and derives the matching `padding_length`.
    ///
    /// Padding rounds `content_length + padding_length` up to a multiple of
    /// 8, the alignment recommended by the FastCGI specification.
    #[inline]
    pub fn set_lengths(&mut self, content_length: u16) {
        self.content_length = content_length;
        self.padding_length = (content_length.wrapping_neg() % 8) as u8;
    }

    /// Tests whether this header describes a management record.
    #[inline]
    #[must_use]
    pub fn is_management(self) -> bool {
        self.rtype.is_management() && self.request_id == NULL_REQUEST_ID
    }

    /// Returns a slice of `self.padding_length` zero bytes.
    #[inline]
    #[must_use]
    pub fn padding_bytes(self) -> &'static [u8] {
        static PADDING: [u8; u8::MAX as usize] = [0; u8::MAX as usize];
        &PADDING[..self.padding_length.into()]
    }

    /// Parses the input bytes into a FastCGI [`RecordHeader`].
    ///
    /// # Errors
    /// Returns an error if the version or record type is invalid. The
    /// request ID and both lengths are still recoverable from the raw bytes
    /// via [`raw_lengths`] in that case, which lets a caller skip past an
    /// unrecognized record.
    pub fn from_bytes(data: [u8; Self::LEN]) -> Result<Self, Error> {
        Ok(Self {
            version: Version::try_from(data[0])?,
            rtype: RecordType::try_from(data[1])?,
            request_id: u16::from_be_bytes([data[2], data[3]]),
            content_length: u16::from_be_bytes([data[4], data[5]]),
            padding_length: data[6],
        })
    }

    /// Encodes the [`RecordHeader`] into its binary wire format.
    #[inline]
    #[must_use]
    pub fn to_bytes(self) -> [u8; Self::LEN] {
        let mut buf = [0; Self::LEN];
        buf[0] = self.version.into();
        buf[1] = self.rtype.into();
        buf[2..4].copy_from_slice(&self.request_id.to_be_bytes());
        buf[4..6].copy_from_slice(&self.content_length.to_be_bytes());
        buf[6] = self.padding_length;
        buf
    }
}

/// Extracts (request ID, content length, padding length) from raw header
/// bytes without validating the version or record type.
#[inline]
#[must_use]
pub fn raw_lengths(data: [u8; RecordHeader::LEN]) -> (u16, u16, u8) {
    (
        u16::from_be_bytes([data[2], data[3]]),
        u16::from_be_bytes([data[4], data[5]]),
        data[6],
    )
}


/// Appends `payload` to `out` as one or more stream records of type `rtype`.
///
/// The payload is fragmented into records of at most [`MAX_CONTENT_LEN`]
/// bytes each, padded to 8-byte alignment. An empty payload appends nothing;
/// the zero-length end-of-stream record is a separate, deliberate act via
/// [`append_end_of_stream`].
pub fn append_stream(out: &mut Vec<u8>, rtype: RecordType, request_id: u16, payload: &[u8]) {
    debug_assert!(rtype.is_stream());
    for chunk in payload.chunks(MAX_CONTENT_LEN) {
        let mut head = RecordHeader::new(rtype, request_id);
        head.set_lengths(chunk.len() as u16);
        out.extend_from_slice(&head.to_bytes());
        out.extend_from_slice(chunk);
        out.extend_from_slice(head.padding_bytes());
    }
}

/// Appends the zero-length record terminating a stream of type `rtype`.
pub fn append_end_of_stream(out: &mut Vec<u8>, rtype: RecordType, request_id: u16) {
    debug_assert!(rtype.is_stream());
    let head = RecordHeader::new(rtype, request_id);
    out.extend_from_slice(&head.to_bytes());
}


bitflags::bitflags! {
    /// The set of protocol variable names a web server may query with a
    /// `GetValues` management record.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct ProtocolVariables: u8 {
        /// The maximum number of concurrent connections accepted.
        const FCGI_MAX_CONNS = 0x01;
        /// The maximum number of concurrent requests accepted.
        const FCGI_MAX_REQS = 0x02;
        /// Whether requests are multiplexed over one connection ("1") or
        /// not ("0").
        const FCGI_MPXS_CONNS = 0x04;
    }
}

impl ProtocolVariables {
    /// Parses the input bytes into a well-known protocol variable name.
    ///
    /// # Errors
    /// Returns an error if the name is unknown, which includes names that
    /// are not valid ASCII.
    pub fn parse_name(name: &[u8]) -> Result<Self, Error> {
        match std::str::from_utf8(name) {
            Ok(s) => Self::from_name(s).ok_or(Error::UnknownVariable),
            Err(_) => Err(Error::UnknownVariable),
        }
    }

    /// Appends a `GetValuesResult` record answering this variable set.
    ///
    /// `max_conns` feeds both FCGI_MAX_CONNS and FCGI_MAX_REQS; this
    /// library multiplexes, so FCGI_MPXS_CONNS always reports "1".
    ///
    /// Returns the number of bytes appended.
    pub fn append_response(self, out: &mut Vec<u8>, max_conns: usize) -> usize {
        use compact_str::ToCompactString;

        let start = out.len();
        out.extend_from_slice(&[0; RecordHeader::LEN]);
        let mut len = 0;

        for (name, var) in self.iter_names() {
            let value = match var {
                Self::FCGI_MAX_CONNS | Self::FCGI_MAX_REQS => max_conns.to_compact_string(),
                Self::FCGI_MPXS_CONNS => compact_str::CompactString::const_new("1"),
                _ => unreachable!("all variable flags are handled above"),
            };
            len += nv::write(name.as_bytes(), value.as_bytes(), out)
                .expect("well-known names and numeric values fit any prefix");
        }

        // GetValuesResult is not a stream, so the pairs must fit one record
        // body and len cannot exceed u16::MAX.
        let mut head = RecordHeader::new(RecordType::GetValuesResult, NULL_REQUEST_ID);
        head.set_lengths(len as u16);
        out.extend_from_slice(head.padding_bytes());
        out[start..(start + RecordHeader::LEN)].copy_from_slice(&head.to_bytes());
        out.len() - start
    }
}
