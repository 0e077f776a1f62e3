use bytes::{BufMut, BytesMut};

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::Error;

pub const FAMILY_IPV4: u8 = 0x01;
pub const FAMILY_IPV6: u8 = 0x02;

/// Transport address attribute payload.
///
/// The address consists of an 8-bit address family and a 16-bit port,
/// followed by a fixed-length value representing the IP address.  If the
/// address family is IPv4, the address MUST be 32 bits.  If the address
/// family is IPv6, the address MUST be 128 bits.  All fields must be in
/// network byte order.
///
/// ```text
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |0 0 0 0 0 0 0 0|    Family     |           Port                |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                                                               |
/// |                 Address (32 bits or 128 bits)                 |
/// |                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// The XOR-mapped variants are identical except that the transport
/// address is obfuscated through the XOR function: X-Port is computed by
/// XOR'ing the mapped port with the most significant 16 bits of the
/// magic cookie.  If the IP address family is IPv4, X-Address is
/// computed by XOR'ing the mapped IP address with the magic cookie.  If
/// the IP address family is IPv6, X-Address is computed by XOR'ing the
/// mapped IP address with the concatenation of the magic cookie and the
/// 96-bit transaction ID.
pub struct Addr;

impl Addr {
    /// encode SocketAddr as bytes.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use turn_client_codec::message::attributes::address::Addr;
    ///
    /// let xor_addr_buf: [u8; 8] = [0x00, 0x01, 0xfc, 0xbe, 0xe1, 0xba, 0xa4, 0x29];
    ///
    /// let addr_buf: [u8; 8] = [0x00, 0x01, 0xdd, 0xac, 0xc0, 0xa8, 0x00, 0x6b];
    ///
    /// let token: [u8; 12] = [
    ///     0x6c, 0x46, 0x62, 0x54, 0x75, 0x4b, 0x44, 0x51, 0x46, 0x48, 0x4c, 0x71,
    /// ];
    ///
    /// let source = "192.168.0.107:56748".parse().unwrap();
    ///
    /// let mut buffer = BytesMut::with_capacity(1280);
    /// Addr::encode(&source, &token, &mut buffer, true);
    /// assert_eq!(&xor_addr_buf, &buffer[..]);
    ///
    /// let mut buffer = BytesMut::with_capacity(1280);
    /// Addr::encode(&source, &token, &mut buffer, false);
    /// assert_eq!(&addr_buf, &buffer[..]);
    /// ```
    pub fn encode(addr: &SocketAddr, token: &[u8; 12], buf: &mut BytesMut, is_xor: bool) {
        buf.put_u8(0);
        let addr = if is_xor { xor(addr, token) } else { *addr };

        buf.put_u8(if addr.is_ipv4() {
            FAMILY_IPV4
        } else {
            FAMILY_IPV6
        });

        buf.put_u16(addr.port());
        match addr.ip() {
            IpAddr::V4(ip) => buf.put(&ip.octets()[..]),
            IpAddr::V6(ip) => buf.put(&ip.octets()[..]),
        }
    }

    /// decode bytes as SocketAddr.
    ///
    /// # Test
    ///
    /// ```
    /// use turn_client_codec::message::attributes::address::Addr;
    ///
    /// let xor_addr_buf: [u8; 8] = [0x00, 0x01, 0xfc, 0xbe, 0xe1, 0xba, 0xa4, 0x29];
    ///
    /// let addr_buf: [u8; 8] = [0x00, 0x01, 0xdd, 0xac, 0xc0, 0xa8, 0x00, 0x6b];
    ///
    /// let token: [u8; 12] = [
    ///     0x6c, 0x46, 0x62, 0x54, 0x75, 0x4b, 0x44, 0x51, 0x46, 0x48, 0x4c, 0x71,
    /// ];
    ///
    /// let source: std::net::SocketAddr = "192.168.0.107:56748".parse().unwrap();
    ///
    /// let addr = Addr::decode(&xor_addr_buf, &token, true).unwrap();
    /// assert_eq!(addr, source);
    ///
    /// let addr = Addr::decode(&addr_buf, &token, false).unwrap();
    /// assert_eq!(addr, source);
    /// ```
    pub fn decode(bytes: &[u8], token: &[u8; 12], is_xor: bool) -> Result<SocketAddr, Error> {
        if bytes.len() < 4 {
            return Err(Error::InvalidInput);
        }

        let port = u16::from_be_bytes([bytes[2], bytes[3]]);
        let ip = match bytes[1] {
            FAMILY_IPV4 => from_bytes_v4(bytes)?,
            FAMILY_IPV6 => from_bytes_v6(bytes)?,
            _ => return Err(Error::InvalidInput),
        };

        let addr = SocketAddr::new(ip, port);
        Ok(if is_xor { xor(&addr, token) } else { addr })
    }
}

fn from_bytes_v4(bytes: &[u8]) -> Result<IpAddr, Error> {
    if bytes.len() != 8 {
        return Err(Error::InvalidInput);
    }

    let buf: [u8; 4] = bytes[4..8].try_into()?;
    Ok(IpAddr::V4(buf.into()))
}

fn from_bytes_v6(bytes: &[u8]) -> Result<IpAddr, Error> {
    if bytes.len() != 20 {
        return Err(Error::InvalidInput);
    }

    let buf: [u8; 16] = bytes[4..20].try_into()?;
    Ok(IpAddr::V6(buf.into()))
}

/// The XOR operation is symmetric, so the same function maps a transport
/// address into its obfuscated form and back.
pub fn xor(addr: &SocketAddr, token: &[u8; 12]) -> SocketAddr {
    let port = addr.port() ^ (0x2112A442u32 >> 16) as u16;
    let ip = match addr.ip() {
        IpAddr::V4(x) => xor_v4(x),
        IpAddr::V6(x) => xor_v6(x, token),
    };

    SocketAddr::new(ip, port)
}

fn xor_v4(addr: Ipv4Addr) -> IpAddr {
    let mut octets = addr.octets();
    for (i, b) in octets.iter_mut().enumerate() {
        *b ^= (0x2112A442u32 >> (24 - i * 8)) as u8;
    }

    IpAddr::V4(From::from(octets))
}

fn xor_v6(addr: Ipv6Addr, token: &[u8; 12]) -> IpAddr {
    let mut octets = addr.octets();
    for (i, b) in octets.iter_mut().enumerate().take(4) {
        *b ^= (0x2112A442u32 >> (24 - i * 8)) as u8;
    }

    for (i, b) in octets.iter_mut().enumerate().take(16).skip(4) {
        *b ^= token[i - 4];
    }

    IpAddr::V6(From::from(octets))
}
