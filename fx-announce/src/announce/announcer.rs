use crate::announce::http::HttpTracker;
use crate::announce::transport::UdpTransport;
use crate::announce::udp::UdpTracker;
use crate::announce::{AnnounceError, AnnounceRequest, AnnounceResult, AnnouncerConfig, Result};
use derive_more::Display;
use log::{debug, trace};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::select;
use tokio_util::sync::CancellationToken;
use url::Url;

/// The tracker announce client.
///
/// An announcer is bound to a single local ip address from which all HTTP and UDP tracker
/// requests originate. UDP trackers are reached through one shared socket, which is read by a
/// background listener until the announcer's cancellation token is cancelled or the announcer is
/// dropped.
///
/// # Examples
///
/// ```rust,no_run
/// use fx_announce::announce::{AnnounceEvent, AnnounceRequest, Announcer, AnnouncerConfig};
/// use std::net::{IpAddr, Ipv4Addr};
/// use tokio_util::sync::CancellationToken;
///
/// async fn example() -> fx_announce::announce::Result<()> {
///     let cancel = CancellationToken::new();
///     let announcer = Announcer::new(
///         IpAddr::V4(Ipv4Addr::UNSPECIFIED),
///         AnnouncerConfig::default(),
///         &cancel,
///     )
///     .await?;
///     let request = AnnounceRequest {
///         info_hash: [0u8; 20],
///         peer_id: *b"-FX0100-000000000000",
///         port: 6881,
///         uploaded: 0,
///         downloaded: 0,
///         left: 0,
///         event: AnnounceEvent::Started,
///         num_want: 50,
///     };
///
///     let result = announcer
///         .announce("udp://tracker.example.org:6969/announce", &request, &cancel)
///         .await?;
///     println!("received {} peers", result.peers.len());
///     Ok(())
/// }
/// ```
#[derive(Debug, Display)]
#[display("{}", addr)]
pub struct Announcer {
    addr: SocketAddr,
    http: HttpTracker,
    udp: UdpTracker,
    cancellation_token: CancellationToken,
}

impl Announcer {
    /// Create a new announcer which sends its requests from the given local ip address.
    /// The UDP socket of the announcer is bound to an ephemeral port.
    ///
    /// Cancelling the given token stops the announcer, every in-flight and future announce then
    /// fails with [AnnounceError::Cancelled].
    pub async fn new(ip: IpAddr, config: AnnouncerConfig, cancel: &CancellationToken) -> Result<Self> {
        let cancellation_token = cancel.child_token();
        let http = HttpTracker::new(ip, &config)?;
        let transport = Arc::new(
            UdpTransport::bind(SocketAddr::new(ip, 0), config.clone(), &cancellation_token).await?,
        );
        let addr = transport.addr();
        let udp = UdpTracker::new(transport, &config);

        debug!("Announcer {} has been created", addr);
        Ok(Self {
            addr,
            http,
            udp,
            cancellation_token,
        })
    }

    /// Get the local address of the UDP socket of the announcer.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Announce the given request to the tracker of the given url.
    /// The tracker protocol is selected by the url scheme, `http`, `https` or `udp`.
    ///
    /// # Returns
    ///
    /// It returns the peers and the next announce moment given by the tracker.
    /// It returns [AnnounceError::UnsupportedScheme] for any other scheme, without performing I/O.
    pub async fn announce(
        &self,
        url: &str,
        request: &AnnounceRequest,
        cancel: &CancellationToken,
    ) -> Result<AnnounceResult> {
        let url = Url::parse(url)?;

        trace!(
            "Announcer {} is announcing {:?} to {}",
            self,
            request.event,
            url
        );
        match url.scheme() {
            "http" | "https" | "udp" => {}
            scheme => return Err(AnnounceError::UnsupportedScheme(scheme.to_string())),
        }

        select! {
            _ = self.cancellation_token.cancelled() => Err(AnnounceError::Cancelled),
            result = self.dispatch(&url, request, cancel) => result,
        }
    }

    async fn dispatch(
        &self,
        url: &Url,
        request: &AnnounceRequest,
        cancel: &CancellationToken,
    ) -> Result<AnnounceResult> {
        if url.scheme() == "udp" {
            self.udp.announce(url, request, cancel).await
        } else {
            self.http.announce(url, request, cancel).await
        }
    }
}
