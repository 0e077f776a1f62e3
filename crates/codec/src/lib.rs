//! ## Session Traversal Utilities for NAT (STUN)
//!
//! [RFC5389]: https://tools.ietf.org/html/rfc5389
//! [RFC5766]: https://tools.ietf.org/html/rfc5766
//!
//! ### STUN Message Structure
//!
//! ```text
//! 0                   1                   2                   3
//! 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |0 0|     STUN Message Type     |         Message Length        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         Magic Cookie                          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                                                               |
//! |                     Transaction ID (96 bits)                  |
//! |                                                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! STUN is intended to be used in the context of one or more NAT
//! traversal solutions.  These solutions are known as "STUN Usages".
//! Each usage describes how STUN is utilized to achieve the NAT
//! traversal solution.  This crate implements the subset of [RFC5389]
//! (with the [RFC3489] legacy fallbacks) and [RFC5766] needed by a
//! STUN/TURN client: message encoding and decoding with message
//! integrity and fingerprint, and the ChannelData framing used by TURN
//! channels.

pub mod channel_data;
pub mod crypto;
pub mod message;

use std::{array::TryFromSliceError, str::Utf8Error};

pub use channel_data::ChannelData;
pub use message::{Packet, RfcVariant, TransactionId};

#[derive(Debug)]
pub enum Error {
    InvalidInput,
    UnknownMethod,
    NotFoundMagicNumber,
    NotFoundIntegrity,
    IntegrityFailed,
    FingerprintFailed,
    SummaryFailed,
    Utf8Error(Utf8Error),
    TryFromSliceError(TryFromSliceError),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<Utf8Error> for Error {
    fn from(value: Utf8Error) -> Self {
        Self::Utf8Error(value)
    }
}

impl From<TryFromSliceError> for Error {
    fn from(value: TryFromSliceError) -> Self {
        Self::TryFromSliceError(value)
    }
}

/// Classify the leading bytes of a datagram or stream.
///
/// The two most significant bits of the first byte are zero for a STUN
/// message and 0b01 for a ChannelData message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Message,
    ChannelData,
}

impl FrameKind {
    /// # Test
    ///
    /// ```
    /// use turn_client_codec::FrameKind;
    ///
    /// assert_eq!(FrameKind::detect(&[0x00, 0x01]), Some(FrameKind::Message));
    /// assert_eq!(FrameKind::detect(&[0x40, 0x00]), Some(FrameKind::ChannelData));
    /// assert_eq!(FrameKind::detect(&[0x80, 0x00]), None);
    /// assert_eq!(FrameKind::detect(&[]), None);
    /// ```
    pub fn detect(bytes: &[u8]) -> Option<Self> {
        match bytes.first()? >> 6 {
            0 => Some(Self::Message),
            1 => Some(Self::ChannelData),
            _ => None,
        }
    }
}

/// Total size in bytes of the next frame in the buffer.
///
/// Used to reassemble complete frames out of a TCP stream, where STUN
/// messages and ChannelData messages share the connection. Returns an
/// error if the leading byte belongs to neither.
///
/// # Test
///
/// ```
/// use turn_client_codec::frame_size;
///
/// // channel 0x4000 with a 5 byte payload, 3 bytes of padding on tcp.
/// let frame = [0x40u8, 0x00, 0x00, 0x05, 0x41, 0x42, 0x43, 0x44, 0x45];
///
/// assert_eq!(frame_size(&frame, true).unwrap(), 12);
/// assert_eq!(frame_size(&frame, false).unwrap(), 9);
/// ```
pub fn frame_size(bytes: &[u8], is_tcp: bool) -> Result<usize, Error> {
    match FrameKind::detect(bytes) {
        Some(FrameKind::Message) => Packet::message_size(bytes),
        Some(FrameKind::ChannelData) => ChannelData::message_size(bytes, is_tcp),
        None => Err(Error::InvalidInput),
    }
}
