use crate::announce::transport::{Action, UdpTransport};
use crate::announce::{
    AnnounceError, AnnounceRequest, AnnounceResult, AnnouncerConfig, CompactFormat, Fetch,
    Result, TtlCache,
};
use async_trait::async_trait;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, trace};
use std::io;
use std::io::{Cursor, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::lookup_host;
use tokio::select;
use tokio_util::sync::CancellationToken;
use url::{Host, Url};

/// The connection id of a connect request, see BEP15.
pub(crate) const PROTOCOL_ID: u64 = 0x41727101980;
/// The byte length of the announce payload following the request header.
const ANNOUNCE_PAYLOAD_LEN: usize = 82;
/// The byte length of the interval, leechers and seeders fields of an announce response.
const ANNOUNCE_RESPONSE_LEN: usize = 12;

/// Negotiates a new connection id with a UDP tracker.
#[derive(Debug)]
pub struct ConnectHandshake {
    transport: Arc<UdpTransport>,
}

impl ConnectHandshake {
    pub fn new(transport: Arc<UdpTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl Fetch<SocketAddr, u64> for ConnectHandshake {
    async fn fetch(&self, addr: &SocketAddr, cancel: &CancellationToken) -> Result<u64> {
        let response = self
            .transport
            .send_request(*addr, Action::Connect, &PROTOCOL_ID, &[], cancel)
            .await?;

        if response.action != Action::Connect {
            return Err(AnnounceError::Parse(format!(
                "expected a connect response, but got {} instead",
                response.action
            )));
        }

        let connection_id = Cursor::new(response.payload.as_slice())
            .read_u64::<BigEndian>()
            .map_err(|_| AnnounceError::Parse("connect response is too short".to_string()))?;
        debug!(
            "Udp tracker {} negotiated connection id {}",
            addr, connection_id
        );
        Ok(connection_id)
    }
}

/// The UDP tracker protocol, see BEP15.
#[derive(Debug)]
pub struct UdpTracker {
    transport: Arc<UdpTransport>,
    connections: TtlCache<SocketAddr, u64, ConnectHandshake>,
    announce_ip: Option<Ipv4Addr>,
    /// The random key which identifies this client across ip changes
    key: u32,
}

impl UdpTracker {
    pub fn new(transport: Arc<UdpTransport>, config: &AnnouncerConfig) -> Self {
        let connections = TtlCache::new(
            config.connection_id_ttl,
            ConnectHandshake::new(transport.clone()),
        );

        Self {
            transport,
            connections,
            announce_ip: config.announce_ip,
            key: rand::random::<u32>(),
        }
    }

    /// Announce the given request to the UDP tracker of the given url.
    pub async fn announce(
        &self,
        url: &Url,
        request: &AnnounceRequest,
        cancel: &CancellationToken,
    ) -> Result<AnnounceResult> {
        let addr = self.resolve(url, cancel).await?;
        let message = AnnounceMessage {
            request,
            ip: self.announce_ip.map(u32::from).unwrap_or(0),
            key: self.key,
        };
        let payload = message.to_bytes()?;

        trace!("Udp tracker {} is sending announce {:?}", addr, request);
        let response = self
            .transport
            .send_request(addr, Action::Announce, &self.connections, &payload, cancel)
            .await?;
        if response.action != Action::Announce {
            return Err(AnnounceError::Parse(format!(
                "expected an announce response, but got {} instead",
                response.action
            )));
        }

        let format = CompactFormat::of(&self.transport.addr().ip());
        let response = AnnounceResponse::parse(&response.payload, format)?;
        debug!(
            "Udp tracker {} returned {} peers (leechers {}, seeders {}), next announce in {}s",
            addr,
            response.peers.len(),
            response.leechers,
            response.seeders,
            response.interval
        );

        Ok(AnnounceResult::new(response.peers, response.interval))
    }

    /// Resolve the tracker address of the given url.
    /// Only addresses of the same family as the transport socket are considered.
    async fn resolve(&self, url: &Url, cancel: &CancellationToken) -> Result<SocketAddr> {
        let port = url
            .port()
            .ok_or_else(|| AnnounceError::InvalidUrl(url.to_string()))?;
        let local_ip = self.transport.addr().ip();
        let is_same_family = |addr: &SocketAddr| addr.is_ipv4() == local_ip.is_ipv4();

        let candidates: Vec<SocketAddr> = match url.host() {
            Some(Host::Ipv4(ip)) => vec![SocketAddr::new(IpAddr::V4(ip), port)],
            Some(Host::Ipv6(ip)) => vec![SocketAddr::new(IpAddr::V6(ip), port)],
            Some(Host::Domain(domain)) => select! {
                _ = cancel.cancelled() => return Err(AnnounceError::Cancelled),
                result = lookup_host((domain, port)) => result?.collect(),
            },
            None => return Err(AnnounceError::InvalidUrl(url.to_string())),
        };

        candidates
            .into_iter()
            .find(is_same_family)
            .ok_or_else(|| {
                AnnounceError::Unavailable(format!(
                    "{}:{}",
                    url.host_str().unwrap_or_default(),
                    port
                ))
            })
    }
}

/// The announce payload of a UDP tracker request.
#[derive(Debug)]
struct AnnounceMessage<'a> {
    request: &'a AnnounceRequest,
    ip: u32,
    key: u32,
}

impl AnnounceMessage<'_> {
    fn to_bytes(&self) -> io::Result<Vec<u8>> {
        let request = self.request;
        let mut buffer = Vec::with_capacity(ANNOUNCE_PAYLOAD_LEN);

        buffer.write_all(&request.info_hash)?;
        buffer.write_all(&request.peer_id)?;
        buffer.write_u64::<BigEndian>(request.downloaded)?;
        buffer.write_u64::<BigEndian>(request.left)?;
        buffer.write_u64::<BigEndian>(request.uploaded)?;
        buffer.write_u32::<BigEndian>(request.event as u32)?;
        buffer.write_u32::<BigEndian>(self.ip)?;
        buffer.write_u32::<BigEndian>(self.key)?;
        buffer.write_u32::<BigEndian>(request.num_want)?;
        buffer.write_u16::<BigEndian>(request.port)?;

        Ok(buffer)
    }
}

#[derive(Debug, PartialEq)]
struct AnnounceResponse {
    /// The interval in seconds between successive announcements
    interval: u32,
    /// The number of peers with incomplete downloads
    leechers: u32,
    /// The number of peers with complete downloads
    seeders: u32,
    peers: Vec<SocketAddr>,
}

impl AnnounceResponse {
    fn parse(payload: &[u8], format: CompactFormat) -> Result<Self> {
        if payload.len() < ANNOUNCE_RESPONSE_LEN {
            return Err(AnnounceError::Parse(format!(
                "announce response of {} bytes is too short",
                payload.len()
            )));
        }

        let mut cursor = Cursor::new(payload);
        let interval = cursor.read_u32::<BigEndian>()?;
        let leechers = cursor.read_u32::<BigEndian>()?;
        let seeders = cursor.read_u32::<BigEndian>()?;
        let peers = format.decode(&payload[ANNOUNCE_RESPONSE_LEN..])?;

        Ok(Self {
            interval,
            leechers,
            seeders,
            peers,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::announce::AnnounceEvent;
    use crate::{init_logger, timeout};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};
    use tokio::net::UdpSocket;

    pub(crate) const CONNECTION_ID: u64 = 0xdeadbeef;

    /// A tracker which accepts every announce and returns two IPv4 peers.
    #[derive(Debug)]
    pub(crate) struct FakeUdpTracker {
        pub addr: SocketAddr,
        pub connects: Arc<AtomicUsize>,
        pub announces: Arc<AtomicUsize>,
        cancellation_token: CancellationToken,
    }

    impl FakeUdpTracker {
        pub async fn start(error: Option<&'static str>) -> Self {
            let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
            let addr = socket.local_addr().unwrap();
            let connects = Arc::new(AtomicUsize::new(0));
            let announces = Arc::new(AtomicUsize::new(0));
            let cancellation_token = CancellationToken::new();

            let tracker_connects = connects.clone();
            let tracker_announces = announces.clone();
            let tracker_cancel = cancellation_token.clone();
            tokio::spawn(async move {
                let mut buffer = [0u8; 1024];
                loop {
                    let (len, addr) = select! {
                        _ = tracker_cancel.cancelled() => break,
                        result = socket.recv_from(&mut buffer) => result.unwrap(),
                    };
                    let request = &buffer[..len];
                    let mut cursor = Cursor::new(request);
                    let connection_id = cursor.read_u64::<BigEndian>().unwrap();
                    let action = cursor.read_u32::<BigEndian>().unwrap();
                    let transaction_id = cursor.read_u32::<BigEndian>().unwrap();

                    let mut response = Vec::new();
                    match (action, error) {
                        (0, _) => {
                            assert_eq!(PROTOCOL_ID, connection_id);
                            tracker_connects.fetch_add(1, Ordering::SeqCst);
                            response.write_u32::<BigEndian>(0).unwrap();
                            response.write_u32::<BigEndian>(transaction_id).unwrap();
                            response.write_u64::<BigEndian>(CONNECTION_ID).unwrap();
                        }
                        (1, None) => {
                            assert_eq!(CONNECTION_ID, connection_id);
                            assert_eq!(16 + ANNOUNCE_PAYLOAD_LEN, len);
                            tracker_announces.fetch_add(1, Ordering::SeqCst);
                            response.write_u32::<BigEndian>(1).unwrap();
                            response.write_u32::<BigEndian>(transaction_id).unwrap();
                            response.write_u32::<BigEndian>(2).unwrap();
                            response.write_u32::<BigEndian>(1).unwrap();
                            response.write_u32::<BigEndian>(1).unwrap();
                            response
                                .write_all(&[1, 2, 3, 4, 0, 101, 10, 121, 2, 9, 3, 231])
                                .unwrap();
                        }
                        (_, Some(message)) => {
                            response.write_u32::<BigEndian>(3).unwrap();
                            response.write_u32::<BigEndian>(transaction_id).unwrap();
                            response.write_all(message.as_bytes()).unwrap();
                        }
                        _ => continue,
                    }

                    socket.send_to(&response, addr).await.unwrap();
                }
            });

            Self {
                addr,
                connects,
                announces,
                cancellation_token,
            }
        }

        pub fn url(&self) -> Url {
            Url::parse(format!("udp://{}/announce", self.addr).as_str()).unwrap()
        }
    }

    impl Drop for FakeUdpTracker {
        fn drop(&mut self) {
            self.cancellation_token.cancel();
        }
    }

    pub(crate) fn create_request() -> AnnounceRequest {
        AnnounceRequest {
            info_hash: [0xaa; 20],
            peer_id: *b"-FX0100-123456789012",
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 1024,
            event: AnnounceEvent::Started,
            num_want: 50,
        }
    }

    #[test]
    fn test_announce_message_to_bytes() {
        let request = create_request();
        let message = AnnounceMessage {
            request: &request,
            ip: u32::from(Ipv4Addr::new(10, 0, 0, 1)),
            key: 0x01020304,
        };

        let result = message.to_bytes().unwrap();

        assert_eq!(ANNOUNCE_PAYLOAD_LEN, result.len());
        assert_eq!(&[0xaa; 20], &result[0..20]);
        assert_eq!(b"-FX0100-123456789012", &result[20..40]);
        assert_eq!(&1024u64.to_be_bytes(), &result[48..56]);
        assert_eq!(&2u32.to_be_bytes(), &result[64..68]);
        assert_eq!(&[10, 0, 0, 1], &result[68..72]);
        assert_eq!(&[1, 2, 3, 4], &result[72..76]);
        assert_eq!(&50u32.to_be_bytes(), &result[76..80]);
        assert_eq!(&6881u16.to_be_bytes(), &result[80..82]);
    }

    #[test]
    fn test_announce_response_parse() {
        let mut payload = vec![0, 0, 0, 60, 0, 0, 0, 3, 0, 0, 0, 7];
        payload.extend_from_slice(&[1, 2, 3, 4, 0, 101]);

        let result = AnnounceResponse::parse(&payload, CompactFormat::Ipv4).unwrap();

        assert_eq!(
            AnnounceResponse {
                interval: 60,
                leechers: 3,
                seeders: 7,
                peers: vec![SocketAddr::from(([1, 2, 3, 4], 101))],
            },
            result
        );
    }

    #[test]
    fn test_announce_response_parse_truncated() {
        let result = AnnounceResponse::parse(&[0, 0, 0, 60, 0, 0], CompactFormat::Ipv4);
        assert_eq!(Err(AnnounceError::Parse(String::new())), result);

        let result = AnnounceResponse::parse(
            &[0, 0, 0, 60, 0, 0, 0, 0, 0, 0, 0, 0, 1, 2, 3],
            CompactFormat::Ipv4,
        );
        assert_eq!(Err(AnnounceError::Parse(String::new())), result);
    }

    #[tokio::test]
    async fn test_announce() {
        init_logger!();
        let tracker = FakeUdpTracker::start(None).await;
        let udp_tracker = create_udp_tracker().await;
        let cancel = CancellationToken::new();
        let expected_peers = vec![
            SocketAddr::from(([1, 2, 3, 4], 101)),
            SocketAddr::from(([10, 121, 2, 9], 999)),
        ];

        let url = tracker.url();
        let request = create_request();

        let result = timeout!(
            udp_tracker.announce(&url, &request, &cancel),
            Duration::from_secs(5)
        )
        .unwrap();

        assert_eq!(expected_peers, result.peers);
        assert_eq!(Duration::from_secs(2), result.interval);
        assert!(result.next_announce > Instant::now() + Duration::from_secs(1));
        assert!(result.next_announce <= Instant::now() + Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_announce_reuses_connection_id() {
        init_logger!();
        let tracker = FakeUdpTracker::start(None).await;
        let udp_tracker = create_udp_tracker().await;
        let cancel = CancellationToken::new();

        let url = tracker.url();
        let request = create_request();

        for _ in 0..3 {
            timeout!(
                udp_tracker.announce(&url, &request, &cancel),
                Duration::from_secs(5)
            )
            .unwrap();
        }

        assert_eq!(1, tracker.connects.load(Ordering::SeqCst));
        assert_eq!(3, tracker.announces.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_announce_tracker_error() {
        init_logger!();
        let tracker = FakeUdpTracker::start(Some("torrent not registered")).await;
        let udp_tracker = create_udp_tracker().await;
        let cancel = CancellationToken::new();

        let url = tracker.url();
        let request = create_request();

        let result = timeout!(
            udp_tracker.announce(&url, &request, &cancel),
            Duration::from_secs(5)
        );

        if let Err(AnnounceError::TrackerFailure(message)) = result {
            assert_eq!("torrent not registered", message);
        } else {
            assert!(
                false,
                "expected AnnounceError::TrackerFailure, but got {:?}",
                result
            );
        }
    }

    #[tokio::test]
    async fn test_announce_missing_port() {
        init_logger!();
        let udp_tracker = create_udp_tracker().await;
        let url = Url::parse("udp://localhost/announce").unwrap();
        let cancel = CancellationToken::new();

        let result = udp_tracker
            .announce(&url, &create_request(), &cancel)
            .await;

        assert_eq!(Err(AnnounceError::InvalidUrl(String::new())), result);
    }

    #[tokio::test]
    async fn test_announce_address_family_unavailable() {
        init_logger!();
        let udp_tracker = create_udp_tracker().await;
        let url = Url::parse("udp://[::1]:6969/announce").unwrap();
        let cancel = CancellationToken::new();

        let result = udp_tracker
            .announce(&url, &create_request(), &cancel)
            .await;

        assert_eq!(Err(AnnounceError::Unavailable(String::new())), result);
    }

    async fn create_udp_tracker() -> UdpTracker {
        let config = AnnouncerConfig::default();
        let transport = UdpTransport::bind(
            SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            config.clone(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        UdpTracker::new(Arc::new(transport), &config)
    }
}
