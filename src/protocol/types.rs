use super::Error as ProtocolError;
use super::{RecordHeader, NULL_REQUEST_ID};


/// A validated FastCGI version number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    /// FastCGI Version 1, the only version ever specified.
    V1 = 1,
}

impl TryFrom<u8> for Version {
    type Error = ProtocolError;

    #[inline]
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Self::V1),
            _ => Err(ProtocolError::UnknownVersion(v)),
        }
    }
}

impl From<Version> for u8 {
    #[inline]
    fn from(v: Version) -> Self {
        v as Self
    }
}


/// A validated FastCGI record type.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum::EnumIter)]
pub enum RecordType {
    BeginRequest = 1,
    AbortRequest = 2,
    EndRequest = 3,
    Params = 4,
    Stdin = 5,
    Stdout = 6,
    Stderr = 7,
    Data = 8,
    GetValues = 9,
    GetValuesResult = 10,
    Unknown = 11,
}

impl TryFrom<u8> for RecordType {
    type Error = ProtocolError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Self::BeginRequest),
            2 => Ok(Self::AbortRequest),
            3 => Ok(Self::EndRequest),
            4 => Ok(Self::Params),
            5 => Ok(Self::Stdin),
            6 => Ok(Self::Stdout),
            7 => Ok(Self::Stderr),
            8 => Ok(Self::Data),
            9 => Ok(Self::GetValues),
            10 => Ok(Self::GetValuesResult),
            11 => Ok(Self::Unknown),
            _ => Err(ProtocolError::UnknownRecordType(v)),
        }
    }
}

impl From<RecordType> for u8 {
    #[inline]
    fn from(v: RecordType) -> Self {
        v as Self
    }
}

impl RecordType {
    /// Tests whether this [`RecordType`] belongs to the management channel.
    #[inline]
    #[must_use]
    pub fn is_management(self) -> bool {
        use RecordType::*;
        matches!(self, GetValues | GetValuesResult | Unknown)
    }

    /// Tests whether this [`RecordType`] carries stream data.
    #[inline]
    #[must_use]
    pub fn is_stream(self) -> bool {
        use RecordType::*;
        matches!(self, Params | Stdin | Stdout | Stderr | Data)
    }
}


/// A validated FastCGI role identifier.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
pub enum Role {
    Responder = 1,
    Authorizer = 2,
    Filter = 3,
}

impl TryFrom<u16> for Role {
    type Error = ProtocolError;

    #[inline]
    fn try_from(v: u16) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Self::Responder),
            2 => Ok(Self::Authorizer),
            3 => Ok(Self::Filter),
            _ => Err(ProtocolError::UnknownRole(v)),
        }
    }
}

impl From<Role> for u16 {
    #[inline]
    fn from(v: Role) -> Self {
        v as Self
    }
}

impl Role {
    /// Tests whether this library implements the given [`Role`].
    ///
    /// Only the responder and authorizer roles are supported. A
    /// `BeginRequest` for any other role is answered with
    /// [`ProtocolStatus::UnknownRole`].
    #[inline]
    #[must_use]
    pub fn is_supported(self) -> bool {
        matches!(self, Self::Responder | Self::Authorizer)
    }
}


bitflags::bitflags! {
    /// A validated set of FastCGI request flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RequestFlags: u8 {
        /// Keep the connection open after this request completes.
        const KeepConn = 1;
    }
}

impl TryFrom<u8> for RequestFlags {
    type Error = ProtocolError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        let f = Self::from_bits_truncate(v);
        if f.bits() == v {
            Ok(f)
        } else {
            Err(ProtocolError::UnknownFlags(v & !f.bits()))
        }
    }
}

impl From<RequestFlags> for u8 {
    #[inline]
    fn from(v: RequestFlags) -> Self {
        v.bits()
    }
}


/// A validated FastCGI response protocol status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
pub enum ProtocolStatus {
    /// The request ran to completion.
    RequestComplete = 0,
    /// A multiplexed request was rejected by an application that handles
    /// one request per connection.
    CantMpxConn = 1,
    /// The application is out of capacity for new requests.
    Overloaded = 2,
    /// The application does not implement the requested role.
    UnknownRole = 3,
}

impl TryFrom<u8> for ProtocolStatus {
    type Error = ProtocolError;

    #[inline]
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::RequestComplete),
            1 => Ok(Self::CantMpxConn),
            2 => Ok(Self::Overloaded),
            3 => Ok(Self::UnknownRole),
            _ => Err(ProtocolError::UnknownStatus(v)),
        }
    }
}

impl From<ProtocolStatus> for u8 {
    #[inline]
    fn from(v: ProtocolStatus) -> Self {
        v as Self
    }
}


/// The body of a `BeginRequest` FastCGI record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeginRequest {
    /// The role the application shall assume for this request.
    pub role: Role,
    /// The control flags for this request.
    pub flags: RequestFlags,
}

impl BeginRequest {
    /// The number of bytes in the wire format of a [`BeginRequest`] body.
    pub const LEN: usize = 8;

    /// Parses the input bytes into a FastCGI [`BeginRequest`] record body.
    ///
    /// The protocol reserves all flag bits except `keepConn` for future
    /// use, so unknown bits are masked off rather than rejected. The
    /// `TryFrom<u8>` impl on [`RequestFlags`] remains a strict parse.
    ///
    /// # Errors
    /// Returns an error if the role is invalid.
    pub fn from_bytes(data: [u8; Self::LEN]) -> Result<Self, ProtocolError> {
        Ok(Self {
            role: Role::try_from(u16::from_be_bytes([data[0], data[1]]))?,
            flags: RequestFlags::from_bits_truncate(data[2]),
        })
    }

    /// Encodes the [`BeginRequest`] record body into its binary wire format.
    #[must_use]
    pub fn to_bytes(self) -> [u8; Self::LEN] {
        let mut buf = [0; Self::LEN];
        buf[..2].copy_from_slice(&u16::to_be_bytes(self.role.into()));
        buf[2] = self.flags.into();
        buf
    }

    /// Encodes a full `BeginRequest` record, header included.
    #[must_use]
    pub fn to_record(self, request_id: u16) -> [u8; RecordHeader::LEN + 8] {
        to_record(RecordType::BeginRequest, request_id, self.to_bytes())
    }
}


/// The body of an `EndRequest` FastCGI record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndRequest {
    /// The application-level status code, as would be returned via exit(3)
    /// by a regular CGI program.
    pub app_status: u32,
    /// The protocol-level completion status.
    pub protocol_status: ProtocolStatus,
}

impl EndRequest {
    /// The number of bytes in the wire format of an [`EndRequest`] body.
    pub const LEN: usize = 8;

    /// Parses the input bytes into a FastCGI [`EndRequest`] record body.
    ///
    /// # Errors
    /// Returns an error if the protocol status is invalid.
    pub fn from_bytes(data: [u8; Self::LEN]) -> Result<Self, ProtocolError> {
        Ok(Self {
            app_status: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            protocol_status: ProtocolStatus::try_from(data[4])?,
        })
    }

    /// Encodes the [`EndRequest`] record body into its binary wire format.
    #[must_use]
    pub fn to_bytes(self) -> [u8; Self::LEN] {
        let mut buf = [0; Self::LEN];
        buf[..4].copy_from_slice(&u32::to_be_bytes(self.app_status));
        buf[4] = self.protocol_status.into();
        buf
    }

    /// Encodes a full `EndRequest` record, header included.
    #[must_use]
    pub fn to_record(self, request_id: u16) -> [u8; RecordHeader::LEN + 8] {
        to_record(RecordType::EndRequest, request_id, self.to_bytes())
    }
}


/// The body of an `Unknown` FastCGI record, reporting an unrecognized
/// record type back to the web server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownType {
    /// The raw type byte of the record we did not recognize.
    pub rtype: u8,
}

impl UnknownType {
    /// The number of bytes in the wire format of an [`UnknownType`] body.
    pub const LEN: usize = 8;

    /// Parses the input bytes into a FastCGI [`UnknownType`] record body.
    #[inline]
    #[must_use]
    pub fn from_bytes(data: [u8; Self::LEN]) -> Self {
        Self { rtype: data[0] }
    }

    /// Encodes the [`UnknownType`] record body into its binary wire format.
    #[inline]
    #[must_use]
    pub fn to_bytes(self) -> [u8; Self::LEN] {
        let mut buf = [0; Self::LEN];
        buf[0] = self.rtype;
        buf
    }

    /// Encodes a full `Unknown` record, header included.
    ///
    /// `Unknown` is a management record, so the request ID is fixed to 0.
    #[must_use]
    pub fn to_record(self) -> [u8; RecordHeader::LEN + 8] {
        to_record(RecordType::Unknown, NULL_REQUEST_ID, self.to_bytes())
    }
}


// All fixed-size bodies are 8 bytes, so padding is always zero here.
fn to_record(
    rtype: RecordType,
    request_id: u16,
    body: [u8; 8],
) -> [u8; RecordHeader::LEN + 8] {
    let mut head = RecordHeader::new(rtype, request_id);
    head.set_lengths(8);
    debug_assert_eq!(head.padding_length, 0);

    let mut buf = [0; RecordHeader::LEN + 8];
    buf[..RecordHeader::LEN].copy_from_slice(&head.to_bytes());
    buf[RecordHeader::LEN..].copy_from_slice(&body);
    buf
}


#[cfg(test)]
mod tests {
    use std::iter::repeat_with;
    use strum::IntoEnumIterator;
    use super::*;

    #[test]
    fn rtype_roundtrip() -> Result<(), ProtocolError> {
        for rtype in RecordType::iter() {
            assert_eq!(RecordType::try_from(u8::from(rtype))?, rtype);
        }
        assert!(matches!(
            RecordType::try_from(0x4c),
            Err(ProtocolError::UnknownRecordType(0x4c)),
        ));
        Ok(())
    }

    #[test]
    fn role_support() {
        assert!(Role::Responder.is_supported());
        assert!(Role::Authorizer.is_supported());
        assert!(!Role::Filter.is_supported());
    }

    #[test]
    fn flags_exact() {
        assert!(matches!(RequestFlags::try_from(0), Ok(f) if f.is_empty()));
        assert!(matches!(RequestFlags::try_from(1), Ok(RequestFlags::KeepConn)));
        assert!(matches!(
            RequestFlags::try_from(0x92),
            Err(ProtocolError::UnknownFlags(0x92)),
        ));
    }

    #[test]
    fn begin_roundtrip() -> Result<(), ProtocolError> {
        for role in Role::iter() {
            for flags in [RequestFlags::empty(), RequestFlags::KeepConn] {
                let orig = BeginRequest { role, flags };
                assert_eq!(BeginRequest::from_bytes(orig.to_bytes())?, orig);
            }
        }
        Ok(())
    }

    #[test]
    fn begin_wire() -> Result<(), ProtocolError> {
        const RAW: [u8; 8] = [0x00, 0x01, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00];
        let body = BeginRequest::from_bytes(RAW)?;
        assert_eq!(body.role, Role::Responder);
        assert_eq!(body.flags, RequestFlags::KeepConn);

        const BAD_ROLE: [u8; 8] = [0x61, 0x1f, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
        assert!(matches!(
            BeginRequest::from_bytes(BAD_ROLE),
            Err(ProtocolError::UnknownRole(0x611f)),
        ));
        Ok(())
    }

    #[test]
    fn begin_reserved_flag_bits_masked() -> Result<(), ProtocolError> {
        const RESERVED: [u8; 8] = [0x00, 0x02, 0x93, 0x00, 0x00, 0x00, 0x00, 0x00];
        let body = BeginRequest::from_bytes(RESERVED)?;
        assert_eq!(body.role, Role::Authorizer);
        assert_eq!(body.flags, RequestFlags::KeepConn);

        const RESERVED_ONLY: [u8; 8] = [0x00, 0x01, 0xfe, 0x00, 0x00, 0x00, 0x00, 0x00];
        let body = BeginRequest::from_bytes(RESERVED_ONLY)?;
        assert!(body.flags.is_empty());
        Ok(())
    }

    #[test]
    fn end_roundtrip() -> Result<(), ProtocolError> {
        let rand_status = repeat_with(|| fastrand::u32(..)).take(10);
        for app_status in rand_status.chain([0, 1, 255, u32::MAX]) {
            for protocol_status in ProtocolStatus::iter() {
                let orig = EndRequest { app_status, protocol_status };
                assert_eq!(EndRequest::from_bytes(orig.to_bytes())?, orig);
            }
        }
        Ok(())
    }

    #[test]
    fn end_record_wire() {
        let rec = EndRequest {
            app_status: 0x0102_0304,
            protocol_status: ProtocolStatus::UnknownRole,
        }.to_record(0x0a0b);
        assert_eq!(
            rec,
            [1, 3, 0x0a, 0x0b, 0, 8, 0, 0, 1, 2, 3, 4, 3, 0, 0, 0],
        );
    }

    #[test]
    fn unknown_record_wire() {
        let rec = UnknownType { rtype: 0xe7 }.to_record();
        assert_eq!(rec[..8], [1, 11, 0, 0, 0, 8, 0, 0]);
        assert_eq!(rec[8], 0xe7);
        assert!(rec[9..].iter().all(|&b| b == 0));
    }
}
