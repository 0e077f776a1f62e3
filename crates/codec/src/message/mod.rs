pub mod attributes;
pub mod methods;

use std::net::SocketAddr;

use bytes::{BufMut, BytesMut};

use crate::{
    Error,
    crypto::{Credential, fingerprint, hmac_sha1},
    message::{
        attributes::{Attribute, AttributeType, StunError, is_comprehension_required},
        methods::Method,
    },
};

/// The magic cookie field MUST contain the fixed value 0x2112A442 in
/// network byte order.  In RFC3489, this field was part of the
/// transaction ID; placing the magic cookie in this location allows a
/// server to detect if the client will understand certain attributes
/// that were added in RFC5389.
pub const MAGIC_COOKIE: u32 = 0x2112A442;

/// The RFC revision the remote server is assumed to speak.
///
/// The variant controls whether the magic cookie is validated on decode
/// and which mapped-address attribute a response is expected to carry.
/// An RFC3489 server treats the cookie bytes as part of a 128-bit
/// transaction ID and echoes them back, so the encoded layout is
/// identical for both variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RfcVariant {
    Rfc3489,
    Rfc5389,
}

/// The transaction ID is a 96-bit identifier, used to uniquely identify
/// STUN transactions.  It primarily serves to correlate requests with
/// responses, and must be uniformly and randomly chosen from the
/// interval 0 .. 2**96-1, by a cryptographically strong source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId([u8; 12]);

impl TransactionId {
    /// A fresh identifier from the thread-local CSPRNG.
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl From<[u8; 12]> for TransactionId {
    fn from(value: [u8; 12]) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }

        Ok(())
    }
}

/// A STUN message with its attributes fully decoded.
///
/// Requests are built attribute by attribute and serialized with
/// [`Packet::encode`]; received datagrams are parsed with
/// [`Packet::decode`].  MessageIntegrity and Fingerprint are requested
/// on the encoding call rather than pushed as attributes, because both
/// are computed over the serialized prefix of the message.
#[derive(Debug, Clone)]
pub struct Packet {
    method: Method,
    transaction: TransactionId,
    attributes: Vec<Attribute>,
    // unknown comprehension-required attribute codes seen during decode.
    unknown_attributes: Vec<u16>,
}

impl Packet {
    pub fn new(method: Method, transaction: TransactionId) -> Self {
        Self {
            method,
            transaction,
            attributes: Vec::with_capacity(10),
            unknown_attributes: Vec::new(),
        }
    }

    /// A request with a freshly generated transaction identifier.
    pub fn request(method: Method) -> Self {
        Self::new(method, TransactionId::random())
    }

    #[inline]
    pub fn method(&self) -> Method {
        self.method
    }

    #[inline]
    pub fn transaction(&self) -> TransactionId {
        self.transaction
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    /// Unknown comprehension-required attribute codes encountered while
    /// decoding.  Reported rather than fatal: for responses the
    /// transaction outcome is still usable.
    pub fn unknown_attributes(&self) -> &[u16] {
        &self.unknown_attributes
    }

    pub fn push(&mut self, attribute: Attribute) {
        self.attributes.push(attribute);
    }

    pub fn with(mut self, attribute: Attribute) -> Self {
        self.push(attribute);
        self
    }

    /// first attribute of the given type.
    pub fn get(&self, kind: AttributeType) -> Option<&Attribute> {
        self.attributes.iter().find(|it| it.kind() == kind)
    }

    pub fn has(&self, kind: AttributeType) -> bool {
        self.get(kind).is_some()
    }

    /// The reflexive transport address of a response, preferring the
    /// XOR-obfuscated form over the legacy plain encoding.
    pub fn mapped_address(&self) -> Option<SocketAddr> {
        match self.get(AttributeType::XorMappedAddress) {
            Some(Attribute::XorMappedAddress(addr)) => Some(*addr),
            _ => match self.get(AttributeType::MappedAddress) {
                Some(Attribute::MappedAddress(addr)) => Some(*addr),
                _ => None,
            },
        }
    }

    pub fn relayed_address(&self) -> Option<SocketAddr> {
        match self.get(AttributeType::XorRelayedAddress)? {
            Attribute::XorRelayedAddress(addr) => Some(*addr),
            _ => None,
        }
    }

    pub fn peer_address(&self) -> Option<SocketAddr> {
        match self.get(AttributeType::XorPeerAddress)? {
            Attribute::XorPeerAddress(addr) => Some(*addr),
            _ => None,
        }
    }

    pub fn alternate_server(&self) -> Option<SocketAddr> {
        match self.get(AttributeType::AlternateServer)? {
            Attribute::AlternateServer(addr) => Some(*addr),
            _ => None,
        }
    }

    pub fn response_origin(&self) -> Option<SocketAddr> {
        match self.get(AttributeType::ResponseOrigin)? {
            Attribute::ResponseOrigin(addr) => Some(*addr),
            _ => None,
        }
    }

    pub fn username(&self) -> Option<&str> {
        match self.get(AttributeType::UserName)? {
            Attribute::UserName(value) => Some(value),
            _ => None,
        }
    }

    pub fn realm(&self) -> Option<&str> {
        match self.get(AttributeType::Realm)? {
            Attribute::Realm(value) => Some(value),
            _ => None,
        }
    }

    pub fn nonce(&self) -> Option<&str> {
        match self.get(AttributeType::Nonce)? {
            Attribute::Nonce(value) => Some(value),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&StunError> {
        match self.get(AttributeType::ErrorCode)? {
            Attribute::ErrorCode(error) => Some(error),
            _ => None,
        }
    }

    pub fn lifetime(&self) -> Option<u32> {
        match self.get(AttributeType::Lifetime)? {
            Attribute::Lifetime(value) => Some(*value),
            _ => None,
        }
    }

    pub fn channel_number(&self) -> Option<u16> {
        match self.get(AttributeType::ChannelNumber)? {
            Attribute::ChannelNumber(value) => Some(*value),
            _ => None,
        }
    }

    pub fn data(&self) -> Option<&[u8]> {
        match self.get(AttributeType::Data)? {
            Attribute::Data(value) => Some(value),
            _ => None,
        }
    }

    /// A response is valid for a request iff it is a success or error
    /// response of the same method and the transaction identifiers are
    /// byte-equal.
    ///
    /// # Test
    ///
    /// ```
    /// use turn_client_codec::message::methods::*;
    /// use turn_client_codec::message::*;
    ///
    /// let request = Packet::request(Method::Binding(MethodType::Request));
    ///
    /// let response = Packet::new(
    ///     Method::Binding(MethodType::Response),
    ///     request.transaction(),
    /// );
    ///
    /// assert!(response.is_valid_response_to(&request, RfcVariant::Rfc5389));
    /// assert!(!request.is_valid_response_to(&request, RfcVariant::Rfc5389));
    ///
    /// let other = Packet::request(Method::Binding(MethodType::Response));
    /// assert!(!other.is_valid_response_to(&request, RfcVariant::Rfc5389));
    /// ```
    pub fn is_valid_response_to(&self, request: &Packet, _rfc: RfcVariant) -> bool {
        self.method.is_response()
            && self.method.same_method(&request.method)
            && self.transaction == request.transaction
    }

    /// serialize the message into the buffer.
    ///
    /// When a credential is supplied the MessageIntegrity attribute is
    /// appended, with the HMAC computed over the message with its length
    /// adjusted as-if it ended after MessageIntegrity.  The Fingerprint,
    /// when requested, goes last, covering everything before it with the
    /// length adjusted the same way.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use turn_client_codec::crypto::long_term_credential;
    /// use turn_client_codec::message::methods::*;
    /// use turn_client_codec::message::*;
    ///
    /// let token: [u8; 12] = [
    ///     0x72, 0x6d, 0x49, 0x42, 0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b,
    /// ];
    ///
    /// let result = [
    ///     0, 1, 0, 32, 33, 18, 164, 66, 114, 109, 73, 66, 114, 82, 100, 72, 87,
    ///     98, 75, 43, 0, 8, 0, 20, 69, 14, 110, 68, 82, 30, 232, 222, 44, 240,
    ///     250, 182, 156, 92, 25, 23, 152, 198, 217, 222, 128, 40, 0, 4, 74, 165,
    ///     171, 86,
    /// ];
    ///
    /// let key = long_term_credential("panda", "raspberry", "panda");
    ///
    /// let packet = Packet::new(Method::Binding(MethodType::Request), token.into());
    ///
    /// let mut buf = BytesMut::with_capacity(1280);
    /// packet
    ///     .encode(RfcVariant::Rfc5389, Some(&key), true, &mut buf)
    ///     .unwrap();
    ///
    /// assert_eq!(&buf[..], &result);
    /// ```
    pub fn encode(
        &self,
        _rfc: RfcVariant,
        credential: Option<&Credential>,
        with_fingerprint: bool,
        buf: &mut BytesMut,
    ) -> Result<(), Error> {
        let token = self.transaction.0;

        buf.clear();
        buf.put_u16(self.method.into());
        buf.put_u16(0);
        buf.put_u32(MAGIC_COOKIE);
        buf.put(token.as_slice());

        for attribute in &self.attributes {
            // integrity and fingerprint only make sense computed over
            // the final serialized prefix; stray decoded copies are not
            // re-emitted.
            let kind = attribute.kind();
            if kind == AttributeType::MessageIntegrity || kind == AttributeType::Fingerprint {
                continue;
            }

            buf.put_u16(kind as u16);

            // reserve the length field, serialize, then backfill it.
            let os = buf.len();
            buf.put_u16(0);
            attribute.serialize(buf, &token);

            let size = buf.len() - os - 2;
            buf[os..os + 2].copy_from_slice(&(size as u16).to_be_bytes());

            let pad = pad32(size);
            if pad > 0 {
                buf.put_bytes(0, pad);
            }
        }

        if let Some(credential) = credential {
            // the length field counts the not-yet-written
            // MessageIntegrity attribute during the digest.
            let len = buf.len() - 20 + 24;
            set_len(buf, len);

            let digest = hmac_sha1(credential.as_slice(), &[&buf[..]])?;
            buf.put_u16(AttributeType::MessageIntegrity as u16);
            buf.put_u16(20);
            buf.put(digest.as_slice());
        }

        if with_fingerprint {
            let len = buf.len() - 20 + 8;
            set_len(buf, len);

            let value = fingerprint(&[&buf[..]]);
            buf.put_u16(AttributeType::Fingerprint as u16);
            buf.put_u16(4);
            buf.put_u32(value);
        }

        let len = buf.len() - 20;
        set_len(buf, len);
        Ok(())
    }

    /// try decode bytes as a message.
    ///
    /// # Test
    ///
    /// ```
    /// use turn_client_codec::message::methods::*;
    /// use turn_client_codec::message::*;
    ///
    /// let buffer = [
    ///     0x00u8, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42, 0x72, 0x6d, 0x49,
    ///     0x42, 0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b,
    /// ];
    ///
    /// let message = Packet::decode(&buffer, RfcVariant::Rfc5389).unwrap();
    ///
    /// assert_eq!(message.method(), Method::Binding(MethodType::Request));
    /// assert!(message.username().is_none());
    /// ```
    pub fn decode(bytes: &[u8], rfc: RfcVariant) -> Result<Self, Error> {
        Self::decode_inner(bytes, rfc, None)
    }

    /// decode and verify the MessageIntegrity attribute against the
    /// supplied credential.  Fails with `NotFoundIntegrity` when the
    /// message carries no integrity at all.
    pub fn decode_with_key(
        bytes: &[u8],
        rfc: RfcVariant,
        credential: &Credential,
    ) -> Result<Self, Error> {
        Self::decode_inner(bytes, rfc, Some(credential))
    }

    fn decode_inner(
        bytes: &[u8],
        rfc: RfcVariant,
        credential: Option<&Credential>,
    ) -> Result<Self, Error> {
        // There must be at least a complete header.
        if bytes.len() < 20 {
            return Err(Error::InvalidInput);
        }

        let method = Method::try_from(u16::from_be_bytes(bytes[..2].try_into()?))?;

        // The length field does not include the header itself.
        let size = u16::from_be_bytes(bytes[2..4].try_into()?) as usize + 20;
        if bytes.len() < size {
            return Err(Error::InvalidInput);
        }

        // An RFC3489 server echoes whatever occupied these bytes, so the
        // cookie is binding only for the modern variant.
        if rfc == RfcVariant::Rfc5389 && bytes[4..8] != MAGIC_COOKIE.to_be_bytes() {
            return Err(Error::NotFoundMagicNumber);
        }

        let token: [u8; 12] = bytes[8..20].try_into()?;

        let mut attributes = Vec::with_capacity(10);
        let mut unknown_attributes = Vec::new();
        let mut integrity_offset = None;
        let mut fingerprint_value = None;
        let mut fingerprint_offset = 0;
        let mut offset = 20;

        while offset + 4 <= size {
            let key = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);
            let value_size = u16::from_be_bytes([bytes[offset + 2], bytes[offset + 3]]) as usize;

            let value_offset = offset + 4;
            if size - value_offset < value_size {
                return Err(Error::InvalidInput);
            }

            let value = &bytes[value_offset..value_offset + value_size];

            let kind = match AttributeType::try_from(key) {
                Ok(kind) => kind,
                Err(_) => {
                    if is_comprehension_required(key) {
                        unknown_attributes.push(key);
                    }

                    offset = value_offset + value_size + pad32(value_size);
                    continue;
                }
            };

            if kind == AttributeType::MessageIntegrity && integrity_offset.is_none() {
                integrity_offset = Some(offset);
            }

            let attribute = Attribute::deserialize(kind, value, &token)?;
            if let Attribute::Fingerprint(value) = attribute {
                fingerprint_value = Some(value);
                fingerprint_offset = offset;
            }

            attributes.push(attribute);
            offset = value_offset + value_size + pad32(value_size);
        }

        // Verify the fingerprint first: it covers the integrity bytes,
        // and a mismatch means the packet is not even STUN.
        if let Some(value) = fingerprint_value {
            let len = ((fingerprint_offset - 20 + 8) as u16).to_be_bytes();
            let expected = fingerprint(&[&bytes[0..2], &len, &bytes[4..fingerprint_offset]]);
            if value != expected {
                return Err(Error::FingerprintFailed);
            }
        }

        if let Some(credential) = credential {
            let offset = integrity_offset.ok_or(Error::NotFoundIntegrity)?;

            // the HMAC input carries the length the message had when the
            // sender computed it: as-if it ended after MessageIntegrity.
            let len = ((offset - 20 + 24) as u16).to_be_bytes();
            let digest = hmac_sha1(
                credential.as_slice(),
                &[&bytes[0..2], &len, &bytes[4..offset]],
            )?;

            let stored = &bytes[offset + 4..offset + 24];
            if digest.as_slice() != stored {
                return Err(Error::IntegrityFailed);
            }
        }

        Ok(Self {
            method,
            transaction: token.into(),
            attributes,
            unknown_attributes,
        })
    }

    /// Total size of the next STUN message in the buffer.
    ///
    /// # Test
    ///
    /// ```
    /// use turn_client_codec::message::Packet;
    ///
    /// let buffer: [u8; 20] = [
    ///     0x00, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42, 0x72, 0x6d, 0x49, 0x42,
    ///     0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b,
    /// ];
    ///
    /// assert_eq!(Packet::message_size(&buffer).unwrap(), 20);
    /// ```
    pub fn message_size(bytes: &[u8]) -> Result<usize, Error> {
        if bytes.len() < 4 || bytes[0] >> 6 != 0 {
            return Err(Error::InvalidInput);
        }

        Ok(u16::from_be_bytes(bytes[2..4].try_into()?) as usize + 20)
    }
}

// set stun message header size.
fn set_len(buf: &mut BytesMut, len: usize) {
    buf[2..4].copy_from_slice((len as u16).to_be_bytes().as_slice());
}

/// compute padding size.
///
/// Attribute values are aligned on 4 byte boundaries; the padding is
/// not counted in the attribute length.
///
/// # Test
///
/// ```
/// use turn_client_codec::message::pad32;
///
/// assert_eq!(pad32(4), 0);
/// assert_eq!(pad32(0), 0);
/// assert_eq!(pad32(5), 3);
/// ```
#[inline(always)]
pub fn pad32(size: usize) -> usize {
    let rem = size % 4;
    if rem == 0 { 0 } else { 4 - rem }
}
