//! IP version and length inference for decrypted payloads.
//!
//! Only the version nibble and the length field are read; the rest of the
//! packet is opaque to the engine.

use serde::{Deserialize, Serialize};

const IPV4_MIN_HEADER: usize = 20;
const IPV4_LEN_OFFSET: usize = 2;

const IPV6_HEADER: usize = 40;
const IPV6_LEN_OFFSET: usize = 4;

/// Address family of a decrypted packet, used by the host to pick the
/// interface queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressFamily {
    V4,
    V6,
}

/// Returns the family and the total length claimed by the IP header.
///
/// `None` if the buffer is not a plausible IPv4/IPv6 packet: unknown version,
/// truncated header, or a claimed length larger than the buffer. A claimed
/// length shorter than the buffer is fine; the remainder is padding.
pub fn inspect(packet: &[u8]) -> Option<(AddressFamily, usize)> {
    let version = packet.first()? >> 4;
    let (family, total) = match version {
        4 => {
            if packet.len() < IPV4_MIN_HEADER {
                return None;
            }
            (AddressFamily::V4, read_u16_be(packet, IPV4_LEN_OFFSET)? as usize)
        }
        6 => {
            if packet.len() < IPV6_HEADER {
                return None;
            }
            let payload = read_u16_be(packet, IPV6_LEN_OFFSET)? as usize;
            (AddressFamily::V6, payload + IPV6_HEADER)
        }
        _ => return None,
    };

    if total > packet.len() || (family == AddressFamily::V4 && total < IPV4_MIN_HEADER) {
        return None;
    }
    Some((family, total))
}

fn read_u16_be(src: &[u8], at: usize) -> Option<u16> {
    let b = src.get(at..at + 2)?;
    Some(u16::from_be_bytes([b[0], b[1]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ipv4(total: u16, buf_len: usize) -> Vec<u8> {
        let mut p = vec![0u8; buf_len];
        p[0] = 0x45;
        p[2..4].copy_from_slice(&total.to_be_bytes());
        p
    }

    #[test]
    fn test_ipv4_detected() {
        let p = ipv4(28, 28);
        assert_eq!(inspect(&p), Some((AddressFamily::V4, 28)));
    }

    #[test]
    fn test_ipv4_padding_trimmed() {
        let p = ipv4(24, 32);
        assert_eq!(inspect(&p), Some((AddressFamily::V4, 24)));
    }

    #[test]
    fn test_ipv4_claims_more_than_buffer() {
        let p = ipv4(100, 40);
        assert_eq!(inspect(&p), None);
    }

    #[test]
    fn test_ipv4_truncated_header() {
        let mut p = ipv4(20, 20);
        p.truncate(19);
        assert_eq!(inspect(&p), None);
    }

    #[test]
    fn test_ipv6_detected() {
        let mut p = vec![0u8; 48];
        p[0] = 0x60;
        p[4..6].copy_from_slice(&8u16.to_be_bytes());
        assert_eq!(inspect(&p), Some((AddressFamily::V6, 48)));
    }

    #[test]
    fn test_non_ip_rejected() {
        assert_eq!(inspect(&[]), None);
        assert_eq!(inspect(&[0x10; 64]), None);
        assert_eq!(inspect(b"hello world, this is not an ip packet"), None);
    }
}
