use bytes::{BufMut, BytesMut};

use super::Error;

/// Channel numbers usable for channel bindings.
///
/// Values 0x4000 through 0x7FFE are valid channel numbers; the rest of
/// the 0x4000-0x7FFF block is reserved.
pub const CHANNEL_NUMBER_RANGE: std::ops::RangeInclusive<u16> = 0x4000..=0x7FFE;

/// The ChannelData Message
///
/// The ChannelData message is used to carry application data between the
/// client and the server.
///
/// ```text
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |         Channel Number        |            Length             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                                                               |
/// |                       Application Data                        |
/// |                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// The Channel Number field specifies the number of the channel on which
/// the data is traveling, and thus, the address of the peer that is
/// sending or is to receive the data.
///
/// The Length field specifies the length in bytes of the application
/// data field (i.e., it does not include the size of the ChannelData
/// header).  Note that 0 is a valid length.
///
/// Over TCP the ChannelData message is padded to a multiple of four
/// bytes; over UDP the padding is omitted and the datagram boundary
/// delimits the message.
pub struct ChannelData<'a> {
    pub bytes: &'a [u8],
    pub number: u16,
}

impl<'a> ChannelData<'a> {
    pub fn number(&self) -> u16 {
        self.number
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.bytes
    }

    /// Total size of the next ChannelData message in the buffer,
    /// including the 4 byte header and, on TCP, the padding.
    ///
    /// # Test
    ///
    /// ```
    /// use turn_client_codec::channel_data::ChannelData;
    ///
    /// let frame = [0x40u8, 0x00, 0x00, 0x05, 0x41, 0x42, 0x43, 0x44, 0x45];
    ///
    /// assert_eq!(ChannelData::message_size(&frame, false).unwrap(), 9);
    /// assert_eq!(ChannelData::message_size(&frame, true).unwrap(), 12);
    /// ```
    pub fn message_size(bytes: &[u8], is_tcp: bool) -> Result<usize, Error> {
        if bytes.len() < 4 {
            return Err(Error::InvalidInput);
        }

        if bytes[0] >> 6 != 1 {
            return Err(Error::InvalidInput);
        }

        let mut size = (u16::from_be_bytes(bytes[2..4].try_into()?) + 4) as usize;
        if is_tcp && (size % 4) > 0 {
            size += 4 - (size % 4);
        }

        Ok(size)
    }

    /// Encode without padding, preserving the datagram size over UDP.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use turn_client_codec::channel_data::ChannelData;
    ///
    /// let data: [u8; 4] = [0x40, 0x00, 0x00, 0x40];
    /// let mut bytes = BytesMut::with_capacity(1500);
    ///
    /// ChannelData {
    ///     number: 16384,
    ///     bytes: &data[..],
    /// }
    /// .encode(&mut bytes);
    ///
    /// let ret = ChannelData::decode(&bytes[..]).unwrap();
    ///
    /// assert_eq!(ret.number, 16384);
    /// assert_eq!(ret.bytes, &data[..]);
    /// ```
    pub fn encode(&self, bytes: &mut BytesMut) {
        bytes.clear();
        bytes.put_u16(self.number);
        bytes.put_u16(self.bytes.len() as u16);
        bytes.extend_from_slice(self.bytes);
    }

    /// Encode padded to a 4 byte boundary for a TCP stream.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use turn_client_codec::channel_data::ChannelData;
    ///
    /// let mut bytes = BytesMut::with_capacity(1500);
    ///
    /// ChannelData {
    ///     number: 0x4000,
    ///     bytes: b"ABCDE",
    /// }
    /// .encode_tcp(&mut bytes);
    ///
    /// assert_eq!(
    ///     &bytes[..],
    ///     &[0x40, 0x00, 0x00, 0x05, 0x41, 0x42, 0x43, 0x44, 0x45, 0x00, 0x00, 0x00]
    /// );
    /// ```
    pub fn encode_tcp(&self, bytes: &mut BytesMut) {
        self.encode(bytes);

        let pad = bytes.len() % 4;
        if pad > 0 {
            bytes.put_bytes(0, 4 - pad);
        }
    }

    /// # Test
    ///
    /// ```
    /// use turn_client_codec::channel_data::ChannelData;
    ///
    /// let frame = [0x40u8, 0x00, 0x00, 0x05, 0x41, 0x42, 0x43, 0x44, 0x45];
    ///
    /// let ret = ChannelData::decode(&frame).unwrap();
    ///
    /// assert_eq!(ret.number, 0x4000);
    /// assert_eq!(ret.bytes, b"ABCDE");
    /// ```
    pub fn decode(bytes: &'a [u8]) -> Result<Self, Error> {
        if bytes.len() < 4 {
            return Err(Error::InvalidInput);
        }

        let number = u16::from_be_bytes(bytes[..2].try_into()?);
        if !CHANNEL_NUMBER_RANGE.contains(&number) {
            return Err(Error::InvalidInput);
        }

        let size = u16::from_be_bytes(bytes[2..4].try_into()?) as usize;
        if size > bytes.len() - 4 {
            return Err(Error::InvalidInput);
        }

        Ok(Self {
            bytes: &bytes[4..4 + size],
            number,
        })
    }
}
