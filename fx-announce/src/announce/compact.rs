use byteorder::{BigEndian, ByteOrder};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;

pub(crate) const COMPACT_IPV4_ADDR_LEN: usize = 6;
pub(crate) const COMPACT_IPV6_ADDR_LEN: usize = 18;

#[derive(Debug, Error, PartialEq)]
pub enum CompactError {
    #[error("compact peer list of {0} bytes contains a truncated record")]
    InvalidLength(usize),
    #[error("peer address {0} doesn't match the compact format")]
    AddressFamily(SocketAddr),
}

pub type CompactResult<T> = Result<T, CompactError>;

/// The packed record format of a compact peer list.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CompactFormat {
    /// 4 address bytes followed by a 2 byte big-endian port.
    Ipv4,
    /// 16 address bytes followed by a 2 byte big-endian port.
    Ipv6,
}

impl CompactFormat {
    /// Returns the compact format matching the family of the given ip address.
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => CompactFormat::Ipv4,
            IpAddr::V6(_) => CompactFormat::Ipv6,
        }
    }

    /// Returns the byte length of a single peer record.
    pub fn record_len(&self) -> usize {
        match self {
            CompactFormat::Ipv4 => COMPACT_IPV4_ADDR_LEN,
            CompactFormat::Ipv6 => COMPACT_IPV6_ADDR_LEN,
        }
    }

    /// Decode the given packed peer records into socket addresses.
    /// The records are consumed in order until the bytes are exhausted.
    ///
    /// # Returns
    ///
    /// It returns an error when the last record is truncated.
    pub fn decode(&self, bytes: &[u8]) -> CompactResult<Vec<SocketAddr>> {
        let record_len = self.record_len();
        if bytes.len() % record_len != 0 {
            return Err(CompactError::InvalidLength(bytes.len()));
        }

        Ok(bytes
            .chunks_exact(record_len)
            .map(|record| self.decode_record(record))
            .collect())
    }

    /// Encode the given peer addresses into packed peer records.
    ///
    /// # Returns
    ///
    /// It returns an error when an address doesn't belong to this format's family.
    pub fn encode(&self, peers: &[SocketAddr]) -> CompactResult<Vec<u8>> {
        let mut buffer = Vec::with_capacity(peers.len() * self.record_len());

        for peer in peers {
            match (self, peer.ip()) {
                (CompactFormat::Ipv4, IpAddr::V4(ip)) => buffer.extend_from_slice(&ip.octets()),
                (CompactFormat::Ipv6, IpAddr::V6(ip)) => buffer.extend_from_slice(&ip.octets()),
                _ => return Err(CompactError::AddressFamily(*peer)),
            }
            buffer.extend_from_slice(&peer.port().to_be_bytes());
        }

        Ok(buffer)
    }

    fn decode_record(&self, record: &[u8]) -> SocketAddr {
        let (ip, port) = record.split_at(record.len() - 2);
        let port = BigEndian::read_u16(port);
        let ip = match self {
            CompactFormat::Ipv4 => IpAddr::V4(Ipv4Addr::from(BigEndian::read_u32(ip))),
            CompactFormat::Ipv6 => IpAddr::V6(Ipv6Addr::from(BigEndian::read_u128(ip))),
        };

        SocketAddr::new(ip, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_ipv4() {
        let bytes = [1, 2, 3, 4, 0, 101, 10, 121, 2, 9, 3, 231];
        let expected_result = vec![
            SocketAddr::from(([1, 2, 3, 4], 101)),
            SocketAddr::from(([10, 121, 2, 9], 999)),
        ];

        let result = CompactFormat::Ipv4.decode(&bytes).unwrap();

        assert_eq!(expected_result, result);
    }

    #[test]
    fn test_decode_ipv6() {
        let mut bytes = Ipv6Addr::LOCALHOST.octets().to_vec();
        bytes.extend_from_slice(&6881u16.to_be_bytes());

        let result = CompactFormat::Ipv6.decode(&bytes).unwrap();

        assert_eq!(
            vec![SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 6881)],
            result
        );
    }

    #[test]
    fn test_decode_empty() {
        let result = CompactFormat::Ipv4.decode(&[]).unwrap();

        assert_eq!(Vec::<SocketAddr>::new(), result);
    }

    #[test]
    fn test_decode_truncated_record() {
        let bytes = [1, 2, 3, 4, 0, 101, 10, 121, 2];

        let result = CompactFormat::Ipv4.decode(&bytes);

        assert_eq!(Err(CompactError::InvalidLength(9)), result);
    }

    #[test]
    fn test_encode_decode_preserves_order() {
        let peers = vec![
            SocketAddr::from(([192, 168, 0, 12], 6881)),
            SocketAddr::from(([1, 2, 3, 4], 101)),
            SocketAddr::from(([10, 121, 2, 9], 999)),
        ];

        let bytes = CompactFormat::Ipv4.encode(&peers).unwrap();
        assert_eq!(peers.len() * COMPACT_IPV4_ADDR_LEN, bytes.len());

        let result = CompactFormat::Ipv4.decode(&bytes).unwrap();
        assert_eq!(peers, result);
    }

    #[test]
    fn test_encode_address_family_mismatch() {
        let peer = SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 6881);

        let result = CompactFormat::Ipv4.encode(&[peer]);

        assert_eq!(Err(CompactError::AddressFamily(peer)), result);
    }
}
