use hmac::{Hmac, Mac};
use md5::{Digest, Md5};

use crate::Error;

/// Long-term credential key.
///
/// The key is used as-is for the HMAC-SHA1 message integrity of every
/// authenticated request on an allocation, so it is computed once when
/// the realm becomes known and cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credential(pub [u8; 16]);

impl Credential {
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for Credential {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// HMAC SHA1 digest.
///
/// # Test
///
/// ```
/// use turn_client_codec::crypto::hmac_sha1;
///
/// let buffer = [
///     0x00u8, 0x03, 0x00, 0x50, 0x21, 0x12, 0xa4, 0x42, 0x64, 0x4f, 0x5a,
///     0x78, 0x6a, 0x56, 0x33, 0x62, 0x4b, 0x52, 0x33, 0x31, 0x00, 0x19, 0x00,
///     0x04, 0x11, 0x00, 0x00, 0x00, 0x00, 0x06, 0x00, 0x05, 0x70, 0x61, 0x6e,
///     0x64, 0x61, 0x00, 0x00, 0x00, 0x00, 0x14, 0x00, 0x09, 0x72, 0x61, 0x73,
///     0x70, 0x62, 0x65, 0x72, 0x72, 0x79, 0x00, 0x00, 0x00, 0x00, 0x15, 0x00,
///     0x10, 0x31, 0x63, 0x31, 0x33, 0x64, 0x32, 0x62, 0x32, 0x34, 0x35, 0x62,
///     0x33, 0x61, 0x37, 0x33, 0x34,
/// ];
///
/// let key = [
///     0x3eu8, 0x2f, 0x79, 0x1e, 0x1f, 0x14, 0xd1, 0x73, 0xfc, 0x91, 0xff,
///     0x2f, 0x59, 0xb5, 0x0f, 0xd1,
/// ];
///
/// let sign = [
///     0xd6u8, 0x78, 0x26, 0x99, 0x0e, 0x15, 0x56, 0x15, 0xe5, 0xf4, 0x24,
///     0x74, 0xe2, 0x3c, 0x26, 0xc5, 0xb1, 0x03, 0xb2, 0x6d,
/// ];
///
/// let hmac_output = hmac_sha1(&key, &[&buffer]).unwrap();
///
/// assert_eq!(&hmac_output, &sign);
/// ```
pub fn hmac_sha1(key: &[u8], source: &[&[u8]]) -> Result<[u8; 20], Error> {
    match Hmac::<sha1::Sha1>::new_from_slice(key) {
        Err(_) => Err(Error::SummaryFailed),
        Ok(mut mac) => {
            for buf in source {
                mac.update(buf);
            }

            Ok(mac.finalize().into_bytes().into())
        }
    }
}

/// CRC32 Fingerprint.
///
/// The value of the attribute is computed as the CRC-32 of the STUN
/// message up to (but excluding) the FINGERPRINT attribute itself,
/// XOR'ed with the 32-bit value 0x5354554e.
///
/// # Test
///
/// ```
/// use turn_client_codec::crypto::fingerprint;
///
/// assert_eq!(fingerprint(&[b"1"]), 3498621689);
/// ```
pub fn fingerprint(source: &[&[u8]]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for buf in source {
        hasher.update(buf);
    }

    hasher.finalize() ^ 0x5354_554e
}

/// create long term credential.
///
/// > key = MD5(username ":" OpaqueString(realm) ":" OpaqueString(password))
///
/// # Test
///
/// ```
/// use turn_client_codec::crypto::long_term_credential;
///
/// let buffer = [
///     0x3eu8, 0x2f, 0x79, 0x1e, 0x1f, 0x14, 0xd1, 0x73, 0xfc, 0x91, 0xff,
///     0x2f, 0x59, 0xb5, 0x0f, 0xd1,
/// ];
///
/// let key = long_term_credential("panda", "raspberry", "panda");
///
/// assert_eq!(key.as_slice(), &buffer);
/// ```
pub fn long_term_credential(username: &str, realm: &str, password: &str) -> Credential {
    let mut hasher = Md5::new();
    hasher.update([username, realm, password].join(":"));
    Credential(hasher.finalize().into())
}
