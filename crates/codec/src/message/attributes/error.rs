use bytes::{BufMut, BytesMut};
use num_enum::TryFromPrimitive;

use crate::Error;

/// The following error codes, along with their recommended reason
/// phrases, are defined:
///
/// 300  Try Alternate: The client should contact an alternate server for
///      this request.
///
/// 400  Bad Request: The request was malformed.  The client SHOULD NOT
///      retry the request without modification from the previous
///      attempt.
///
/// 401  Unauthenticated: The request did not contain the correct
///      credentials to proceed.  The client should retry the request
///      with proper credentials.
///
/// 420  Unknown Attribute: The server received a STUN packet containing
///      a comprehension-required attribute that it did not understand.
///
/// 438  Stale Nonce: The NONCE used by the client was no longer valid.
///      The client should retry, using the NONCE provided in the
///      response.
///
/// 500  Server Error: The server has suffered a temporary error.  The
///      client should try again.
#[repr(u16)]
#[derive(TryFromPrimitive, PartialEq, Eq, Copy, Clone, Debug)]
pub enum ErrKind {
    TryAlternate = 0x0300,
    BadRequest = 0x0400,
    Unauthorized = 0x0401,
    Forbidden = 0x0403,
    RequestTimedout = 0x0408,
    UnknownAttribute = 0x0414,
    AllocationMismatch = 0x0425,
    StaleNonce = 0x0426,
    AddressFamilyNotSupported = 0x0428,
    WrongCredentials = 0x0429,
    UnsupportedTransportAddress = 0x042A,
    AllocationQuotaReached = 0x0456,
    ServerError = 0x0500,
    InsufficientCapacity = 0x0508,
}

impl ErrKind {
    /// The error code as carried on the wire, class * 100 + number.
    ///
    /// # Test
    ///
    /// ```
    /// use turn_client_codec::message::attributes::error::ErrKind;
    ///
    /// assert_eq!(ErrKind::TryAlternate.code(), 300);
    /// assert_eq!(ErrKind::Unauthorized.code(), 401);
    /// assert_eq!(ErrKind::StaleNonce.code(), 438);
    /// ```
    pub fn code(&self) -> u16 {
        let raw = *self as u16;
        (raw >> 8) * 100 + (raw & 0xFF)
    }
}

/// The ERROR-CODE attribute is used in error response messages.  It
/// contains a numeric error code value in the range of 300 to 699 plus a
/// textual reason phrase encoded in UTF-8 [RFC3629].  The reason phrase
/// is meant for diagnostic purposes and can be anything appropriate for
/// the error code.
///
/// ```text
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |           Reserved, should be 0         |Class|     Number    |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |      Reason Phrase (variable)                                ..
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// To facilitate processing, the class of the error code (the hundreds
/// digit) is encoded separately from the rest of the code.
#[derive(Clone, Debug)]
pub struct StunError {
    pub code: u16,
    pub reason: String,
}

impl StunError {
    /// create error from error type.
    ///
    /// # Test
    ///
    /// ```
    /// use turn_client_codec::message::attributes::error::*;
    ///
    /// let error = StunError::from(ErrKind::TryAlternate);
    ///
    /// assert_eq!(error.code, 300);
    /// assert_eq!(error.reason, "Try Alternate");
    /// ```
    pub fn from(kind: ErrKind) -> Self {
        Self {
            code: kind.code(),
            reason: reason(kind).to_string(),
        }
    }

    pub fn kind(&self) -> Option<ErrKind> {
        let raw = ((self.code / 100) << 8) | (self.code % 100);
        ErrKind::try_from(raw).ok()
    }

    /// encode the error as bytes.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use turn_client_codec::message::attributes::error::*;
    ///
    /// let buffer = [
    ///     0x00u8, 0x00, 0x03, 0x00, 0x54, 0x72, 0x79, 0x20, 0x41, 0x6c, 0x74,
    ///     0x65, 0x72, 0x6e, 0x61, 0x74, 0x65,
    /// ];
    ///
    /// let mut buf = BytesMut::with_capacity(1280);
    /// StunError::from(ErrKind::TryAlternate).encode(&mut buf);
    /// assert_eq!(&buf[..], &buffer);
    /// ```
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(0x0000);
        buf.put_u8((self.code / 100) as u8);
        buf.put_u8((self.code % 100) as u8);
        buf.put(self.reason.as_bytes());
    }

    /// # Test
    ///
    /// ```
    /// use turn_client_codec::message::attributes::error::*;
    ///
    /// let buffer = [
    ///     0x00u8, 0x00, 0x03, 0x00, 0x54, 0x72, 0x79, 0x20, 0x41, 0x6c, 0x74,
    ///     0x65, 0x72, 0x6e, 0x61, 0x74, 0x65,
    /// ];
    ///
    /// let error = StunError::decode(&buffer).unwrap();
    /// assert_eq!(error.code, 300);
    /// assert_eq!(error.reason, "Try Alternate");
    /// ```
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < 4 {
            return Err(Error::InvalidInput);
        }

        Ok(Self {
            code: bytes[2] as u16 * 100 + bytes[3] as u16,
            reason: std::str::from_utf8(&bytes[4..])?.to_string(),
        })
    }
}

impl Eq for StunError {}
impl PartialEq for StunError {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code
    }
}

#[rustfmt::skip]
fn reason(kind: ErrKind) -> &'static str {
    match kind {
        ErrKind::TryAlternate => "Try Alternate",
        ErrKind::BadRequest => "Bad Request",
        ErrKind::Unauthorized => "Unauthorized",
        ErrKind::Forbidden => "Forbidden",
        ErrKind::RequestTimedout => "Request Timed out",
        ErrKind::UnknownAttribute => "Unknown Attribute",
        ErrKind::AllocationMismatch => "Allocation Mismatch",
        ErrKind::StaleNonce => "Stale Nonce",
        ErrKind::AddressFamilyNotSupported => "Address Family not Supported",
        ErrKind::WrongCredentials => "Wrong Credentials",
        ErrKind::UnsupportedTransportAddress => "Unsupported Transport Address",
        ErrKind::AllocationQuotaReached => "Allocation Quota Reached",
        ErrKind::ServerError => "Server Error",
        ErrKind::InsufficientCapacity => "Insufficient Capacity",
    }
}
