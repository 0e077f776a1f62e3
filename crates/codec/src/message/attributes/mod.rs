pub mod address;
pub mod error;

use std::net::SocketAddr;

use bytes::{BufMut, BytesMut};
use num_enum::TryFromPrimitive;

use crate::Error;

pub use address::Addr;
pub use error::{ErrKind, StunError};

/// The requested transport protocol codepoint for UDP, from the IPv4
/// protocol number registry.  This specification only allows the use of
/// codepoint 17 (User Datagram Protocol).
pub const TRANSPORT_UDP: u8 = 0x11;

/// attribute type.
///
/// Attributes in the range 0x0000-0x7FFF are comprehension-required: an
/// agent that receives an unknown attribute in this range cannot
/// silently process the message as if the attribute were absent.
/// Attributes in the range 0x8000-0xFFFF are comprehension-optional.
#[repr(u16)]
#[derive(TryFromPrimitive, PartialEq, Eq, Hash, Debug, Clone, Copy)]
pub enum AttributeType {
    MappedAddress = 0x0001,
    UserName = 0x0006,
    MessageIntegrity = 0x0008,
    ErrorCode = 0x0009,
    ChannelNumber = 0x000C,
    Lifetime = 0x000D,
    XorPeerAddress = 0x0012,
    Data = 0x0013,
    Realm = 0x0014,
    Nonce = 0x0015,
    XorRelayedAddress = 0x0016,
    RequestedTransport = 0x0019,
    XorMappedAddress = 0x0020,
    Software = 0x8022,
    AlternateServer = 0x8023,
    Fingerprint = 0x8028,
    ResponseOrigin = 0x802B,
}

/// Whether an unknown attribute code is comprehension-required.
pub fn is_comprehension_required(code: u16) -> bool {
    code < 0x8000
}

/// A decoded stun/turn message attribute.
///
/// Address-valued attributes hold the plain transport address; the XOR
/// obfuscation is applied against the magic cookie and transaction id
/// during encoding and decoding only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    /// The MAPPED-ADDRESS attribute indicates a reflexive transport
    /// address of the client.  This attribute is used only by servers
    /// for achieving backwards compatibility with RFC3489 clients.
    MappedAddress(SocketAddr),
    /// The XOR-MAPPED-ADDRESS attribute is identical to the
    /// MAPPED-ADDRESS attribute, except that the reflexive transport
    /// address is obfuscated through the XOR function.
    XorMappedAddress(SocketAddr),
    /// The XOR-PEER-ADDRESS specifies the address and port of the peer
    /// as seen from the TURN server.  (For example, the peer's
    /// server-reflexive transport address if the peer is behind a NAT.)
    XorPeerAddress(SocketAddr),
    /// The XOR-RELAYED-ADDRESS is present in Allocate responses.  It
    /// specifies the address and port that the server allocated to the
    /// client.
    XorRelayedAddress(SocketAddr),
    /// The USERNAME attribute is used for message integrity.  It
    /// identifies the username and password combination used in the
    /// message-integrity check.
    UserName(String),
    /// The REALM attribute may be present in requests and responses.
    /// Presence of the REALM attribute in a request indicates that
    /// long-term credentials are being used for authentication.
    Realm(String),
    /// The NONCE attribute may be present in requests and responses.  It
    /// contains a sequence of qdtext or quoted-pair, without the
    /// surrounding quote characters.
    Nonce(String),
    /// The SOFTWARE attribute contains a textual description of the
    /// software being used by the agent sending the message.  The
    /// attribute has no impact on operation of the protocol and serves
    /// only as a tool for diagnostic and debugging purposes.
    Software(String),
    /// The MESSAGE-INTEGRITY attribute contains an HMAC-SHA1 of the STUN
    /// message.  Carried here only when decoded from the wire; outbound
    /// integrity is requested through the encoder, which has to compute
    /// the HMAC over the serialized prefix.
    MessageIntegrity([u8; 20]),
    /// The FINGERPRINT attribute MAY be present in all STUN messages.
    /// When present it MUST be the last attribute in the message.
    /// Carried here only when decoded from the wire.
    Fingerprint(u32),
    /// The ERROR-CODE attribute is used in error response messages.
    ErrorCode(StunError),
    /// The LIFETIME attribute represents the duration for which the
    /// server will maintain an allocation in the absence of a refresh,
    /// in seconds.
    Lifetime(u32),
    /// The CHANNEL-NUMBER attribute contains the number of the channel,
    /// a 16-bit unsigned integer followed by a two-octet RFFU field
    /// which MUST be set to 0 on transmission and ignored on reception.
    ChannelNumber(u16),
    /// This attribute is used by the client to request a specific
    /// transport protocol for the allocated transport address.
    RequestedTransport(u8),
    /// The alternate server the client should contact after a 300 (Try
    /// Alternate) error response.  Encoded in the plain MAPPED-ADDRESS
    /// format.
    AlternateServer(SocketAddr),
    /// The RESPONSE-ORIGIN attribute is inserted by the server and
    /// indicates the source IP address and port the response was sent
    /// from.  It is useful for detecting double NAT configurations.
    ResponseOrigin(SocketAddr),
    /// The DATA attribute is present in all Send and Data indications.
    /// It carries the application data, that is, the data that would
    /// immediately follow the UDP header if the data was sent directly
    /// between the client and the peer.
    Data(Vec<u8>),
}

impl Attribute {
    pub fn kind(&self) -> AttributeType {
        match self {
            Self::MappedAddress(_) => AttributeType::MappedAddress,
            Self::XorMappedAddress(_) => AttributeType::XorMappedAddress,
            Self::XorPeerAddress(_) => AttributeType::XorPeerAddress,
            Self::XorRelayedAddress(_) => AttributeType::XorRelayedAddress,
            Self::UserName(_) => AttributeType::UserName,
            Self::Realm(_) => AttributeType::Realm,
            Self::Nonce(_) => AttributeType::Nonce,
            Self::Software(_) => AttributeType::Software,
            Self::MessageIntegrity(_) => AttributeType::MessageIntegrity,
            Self::Fingerprint(_) => AttributeType::Fingerprint,
            Self::ErrorCode(_) => AttributeType::ErrorCode,
            Self::Lifetime(_) => AttributeType::Lifetime,
            Self::ChannelNumber(_) => AttributeType::ChannelNumber,
            Self::RequestedTransport(_) => AttributeType::RequestedTransport,
            Self::AlternateServer(_) => AttributeType::AlternateServer,
            Self::ResponseOrigin(_) => AttributeType::ResponseOrigin,
            Self::Data(_) => AttributeType::Data,
        }
    }

    /// write the attribute value to the buffer, without the TLV header.
    pub(crate) fn serialize(&self, buf: &mut BytesMut, token: &[u8; 12]) {
        match self {
            Self::MappedAddress(addr) => Addr::encode(addr, token, buf, false),
            Self::XorMappedAddress(addr) => Addr::encode(addr, token, buf, true),
            Self::XorPeerAddress(addr) => Addr::encode(addr, token, buf, true),
            Self::XorRelayedAddress(addr) => Addr::encode(addr, token, buf, true),
            Self::AlternateServer(addr) => Addr::encode(addr, token, buf, false),
            Self::ResponseOrigin(addr) => Addr::encode(addr, token, buf, false),
            Self::UserName(value) => buf.put(value.as_bytes()),
            Self::Realm(value) => buf.put(value.as_bytes()),
            Self::Nonce(value) => buf.put(value.as_bytes()),
            Self::Software(value) => buf.put(value.as_bytes()),
            Self::MessageIntegrity(digest) => buf.put(digest.as_slice()),
            Self::Fingerprint(value) => buf.put_u32(*value),
            Self::ErrorCode(error) => error.encode(buf),
            Self::Lifetime(value) => buf.put_u32(*value),
            Self::ChannelNumber(value) => {
                buf.put_u16(*value);
                buf.put_u16(0);
            }
            Self::RequestedTransport(protocol) => {
                buf.put_u8(*protocol);
                buf.put_bytes(0, 3);
            }
            Self::Data(value) => buf.put(value.as_slice()),
        }
    }

    /// convert an attribute value buffer to an attribute.
    pub(crate) fn deserialize(
        kind: AttributeType,
        bytes: &[u8],
        token: &[u8; 12],
    ) -> Result<Self, Error> {
        Ok(match kind {
            AttributeType::MappedAddress => {
                Self::MappedAddress(Addr::decode(bytes, token, false)?)
            }
            AttributeType::XorMappedAddress => {
                Self::XorMappedAddress(Addr::decode(bytes, token, true)?)
            }
            AttributeType::XorPeerAddress => {
                Self::XorPeerAddress(Addr::decode(bytes, token, true)?)
            }
            AttributeType::XorRelayedAddress => {
                Self::XorRelayedAddress(Addr::decode(bytes, token, true)?)
            }
            AttributeType::AlternateServer => {
                Self::AlternateServer(Addr::decode(bytes, token, false)?)
            }
            AttributeType::ResponseOrigin => {
                Self::ResponseOrigin(Addr::decode(bytes, token, false)?)
            }
            AttributeType::UserName => Self::UserName(std::str::from_utf8(bytes)?.to_string()),
            AttributeType::Realm => Self::Realm(std::str::from_utf8(bytes)?.to_string()),
            AttributeType::Nonce => Self::Nonce(std::str::from_utf8(bytes)?.to_string()),
            AttributeType::Software => Self::Software(std::str::from_utf8(bytes)?.to_string()),
            AttributeType::MessageIntegrity => {
                Self::MessageIntegrity(bytes.try_into().map_err(|_| Error::InvalidInput)?)
            }
            AttributeType::Fingerprint => {
                Self::Fingerprint(u32::from_be_bytes(bytes.try_into()?))
            }
            AttributeType::ErrorCode => Self::ErrorCode(StunError::decode(bytes)?),
            AttributeType::Lifetime => Self::Lifetime(u32::from_be_bytes(bytes.try_into()?)),
            AttributeType::ChannelNumber => {
                if bytes.len() < 2 {
                    return Err(Error::InvalidInput);
                }

                Self::ChannelNumber(u16::from_be_bytes(bytes[..2].try_into()?))
            }
            AttributeType::RequestedTransport => {
                if bytes.is_empty() {
                    return Err(Error::InvalidInput);
                }

                Self::RequestedTransport(bytes[0])
            }
            AttributeType::Data => Self::Data(bytes.to_vec()),
        })
    }
}
