use anyhow::Result;
use bytes::BytesMut;
use turn_client_codec::{
    ChannelData, Error, FrameKind, frame_size,
    crypto::long_term_credential,
    message::{
        Packet, RfcVariant,
        attributes::{Attribute, AttributeType},
        methods::{Method, MethodType},
    },
};

/// An authenticated Allocate request captured from a live exchange:
/// RequestedTransport, UserName "panda", Realm "raspberry", a nonce and
/// the MessageIntegrity keyed by md5("panda:raspberry:panda").
#[rustfmt::skip]
const ALLOCATE_REQUEST: &[u8] = &[
    0x00, 0x03, 0x00, 0x50, 0x21, 0x12, 0xa4, 0x42, 0x64, 0x4f, 0x5a,
    0x78, 0x6a, 0x56, 0x33, 0x62, 0x4b, 0x52, 0x33, 0x31, 0x00, 0x19, 0x00,
    0x04, 0x11, 0x00, 0x00, 0x00, 0x00, 0x06, 0x00, 0x05, 0x70, 0x61, 0x6e,
    0x64, 0x61, 0x00, 0x00, 0x00, 0x00, 0x14, 0x00, 0x09, 0x72, 0x61, 0x73,
    0x70, 0x62, 0x65, 0x72, 0x72, 0x79, 0x00, 0x00, 0x00, 0x00, 0x15, 0x00,
    0x10, 0x31, 0x63, 0x31, 0x33, 0x64, 0x32, 0x62, 0x32, 0x34, 0x35, 0x62,
    0x33, 0x61, 0x37, 0x33, 0x34, 0x00, 0x08, 0x00, 0x14, 0xd6, 0x78, 0x26,
    0x99, 0x0e, 0x15, 0x56, 0x15, 0xe5, 0xf4, 0x24, 0x74, 0xe2, 0x3c, 0x26,
    0xc5, 0xb1, 0x03, 0xb2, 0x6d,
];

const ALLOCATE_TOKEN: [u8; 12] = [
    0x64, 0x4f, 0x5a, 0x78, 0x6a, 0x56, 0x33, 0x62, 0x4b, 0x52, 0x33, 0x31,
];

#[test]
fn decode_authenticated_allocate_request() -> Result<()> {
    let key = long_term_credential("panda", "raspberry", "panda");

    let message = Packet::decode_with_key(ALLOCATE_REQUEST, RfcVariant::Rfc5389, &key)?;

    assert_eq!(message.method(), Method::Allocate(MethodType::Request));
    assert_eq!(message.transaction().as_bytes(), &ALLOCATE_TOKEN);
    assert_eq!(message.username(), Some("panda"));
    assert_eq!(message.realm(), Some("raspberry"));
    assert_eq!(message.nonce(), Some("1c13d2b245b3a734"));
    assert!(message.has(AttributeType::RequestedTransport));
    assert!(message.unknown_attributes().is_empty());

    Ok(())
}

#[test]
fn encode_authenticated_allocate_request() -> Result<()> {
    let key = long_term_credential("panda", "raspberry", "panda");

    let request = Packet::new(
        Method::Allocate(MethodType::Request),
        ALLOCATE_TOKEN.into(),
    )
    .with(Attribute::RequestedTransport(0x11))
    .with(Attribute::UserName("panda".to_string()))
    .with(Attribute::Realm("raspberry".to_string()))
    .with(Attribute::Nonce("1c13d2b245b3a734".to_string()));

    let mut buf = BytesMut::with_capacity(1280);
    request.encode(RfcVariant::Rfc5389, Some(&key), false, &mut buf)?;

    assert_eq!(&buf[..], ALLOCATE_REQUEST);
    Ok(())
}

#[test]
fn integrity_mismatch_is_rejected() {
    let wrong = long_term_credential("panda", "raspberry", "bamboo");

    let result = Packet::decode_with_key(ALLOCATE_REQUEST, RfcVariant::Rfc5389, &wrong);
    assert!(matches!(result, Err(Error::IntegrityFailed)));

    // a flipped attribute byte breaks the digest too.
    let mut tampered = ALLOCATE_REQUEST.to_vec();
    tampered[33] ^= 0xFF;

    let key = long_term_credential("panda", "raspberry", "panda");
    let result = Packet::decode_with_key(&tampered, RfcVariant::Rfc5389, &key);
    assert!(matches!(result, Err(Error::IntegrityFailed)));
}

#[test]
fn response_round_trip_preserves_addresses() -> Result<()> {
    let request = Packet::request(Method::Binding(MethodType::Request));

    let response = Packet::new(
        Method::Binding(MethodType::Response),
        request.transaction(),
    )
    .with(Attribute::XorMappedAddress("5.6.7.8:40000".parse()?))
    .with(Attribute::MappedAddress("5.6.7.8:40000".parse()?))
    .with(Attribute::ResponseOrigin("1.2.3.4:3478".parse()?))
    .with(Attribute::Software("turn-client".to_string()));

    let mut buf = BytesMut::with_capacity(1280);
    response.encode(RfcVariant::Rfc5389, None, true, &mut buf)?;

    // the fingerprint is verified during decode.
    let decoded = Packet::decode(&buf, RfcVariant::Rfc5389)?;

    assert!(decoded.is_valid_response_to(&request, RfcVariant::Rfc5389));
    assert_eq!(decoded.mapped_address(), Some("5.6.7.8:40000".parse()?));
    assert_eq!(decoded.response_origin(), Some("1.2.3.4:3478".parse()?));

    // the 11 byte software value is padded with a single zero byte that
    // is not counted in its length; the fingerprint follows it.
    let software = b"turn-client";
    let pos = buf
        .windows(software.len())
        .position(|it| it == software)
        .unwrap();
    assert_eq!(&buf[pos - 2..pos], &[0x00, 0x0b]);
    assert_eq!(buf[pos + 11], 0x00);
    assert_eq!(&buf[pos + 12..pos + 14], &[0x80, 0x28]);

    Ok(())
}

#[test]
fn corrupted_fingerprint_is_rejected() -> Result<()> {
    let response = Packet::request(Method::Binding(MethodType::Response))
        .with(Attribute::XorMappedAddress("5.6.7.8:40000".parse()?));

    let mut buf = BytesMut::with_capacity(1280);
    response.encode(RfcVariant::Rfc5389, None, true, &mut buf)?;

    let last = buf.len() - 1;
    buf[last] ^= 0x01;

    assert!(matches!(
        Packet::decode(&buf, RfcVariant::Rfc5389),
        Err(Error::FingerprintFailed)
    ));

    Ok(())
}

#[test]
fn unknown_comprehension_required_attributes_are_reported() -> Result<()> {
    // a binding response carrying an attribute from the
    // comprehension-required range (0x7FFF) and one from the optional
    // range (0x8030), both unknown to the decoder.
    #[rustfmt::skip]
    let buffer = [
        0x01u8, 0x01, 0x00, 0x10, 0x21, 0x12, 0xa4, 0x42, 0x72, 0x6d, 0x49,
        0x42, 0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b,
        0x7F, 0xFF, 0x00, 0x02, 0xab, 0xcd, 0x00, 0x00,
        0x80, 0x30, 0x00, 0x04, 0x00, 0x00, 0x00, 0x01,
    ];

    let message = Packet::decode(&buffer, RfcVariant::Rfc5389)?;

    assert_eq!(message.method(), Method::Binding(MethodType::Response));
    assert_eq!(message.unknown_attributes(), &[0x7FFF]);

    Ok(())
}

#[test]
fn magic_cookie_is_checked_per_variant() {
    let mut buffer = [0u8; 20];
    buffer[1] = 0x01;

    // zeroed cookie: rejected as modern stun, accepted as legacy.
    assert!(matches!(
        Packet::decode(&buffer, RfcVariant::Rfc5389),
        Err(Error::NotFoundMagicNumber)
    ));
    assert!(Packet::decode(&buffer, RfcVariant::Rfc3489).is_ok());
}

#[test]
fn truncated_messages_are_rejected() {
    // header claims 8 bytes of attributes but the input ends early.
    let buffer = [
        0x01u8, 0x01, 0x00, 0x08, 0x21, 0x12, 0xa4, 0x42, 0x72, 0x6d, 0x49,
        0x42, 0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b,
    ];

    assert!(matches!(
        Packet::decode(&buffer, RfcVariant::Rfc5389),
        Err(Error::InvalidInput)
    ));
    assert!(matches!(
        Packet::decode(&buffer[..10], RfcVariant::Rfc5389),
        Err(Error::InvalidInput)
    ));
}

#[test]
fn channel_data_tcp_framing() -> Result<()> {
    // channel 0x4000, length 5, payload "ABCDE", three bytes of padding.
    let frame = [
        0x40u8, 0x00, 0x00, 0x05, 0x41, 0x42, 0x43, 0x44, 0x45, 0x00, 0x00, 0x00,
    ];

    assert_eq!(FrameKind::detect(&frame), Some(FrameKind::ChannelData));
    assert_eq!(frame_size(&frame, true)?, 12);
    assert_eq!(frame_size(&frame, false)?, 9);

    let data = ChannelData::decode(&frame)?;
    assert_eq!(data.number(), 0x4000);
    assert_eq!(data.as_bytes(), b"ABCDE");

    let mut buf = BytesMut::with_capacity(64);
    ChannelData {
        number: 0x4000,
        bytes: b"ABCDE",
    }
    .encode_tcp(&mut buf);
    assert_eq!(&buf[..], &frame);

    // numbers outside 0x4000..=0x7FFE are not channel data.
    let bogus = [0x3Fu8, 0xFF, 0x00, 0x00];
    assert!(ChannelData::decode(&bogus).is_err());

    Ok(())
}
