use crate::announce::bencode;
use crate::announce::{
    AnnounceError, AnnounceRequest, AnnounceResult, AnnouncerConfig, CompactFormat, Result,
};
use log::{debug, trace};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC};
use reqwest::redirect::Policy;
use reqwest::Client;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use tokio::net::lookup_host;
use tokio::select;
use tokio_util::sync::CancellationToken;
use url::Url;

const URL_ENCODE_RESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'~')
    .remove(b'.');

/// The announce response of a tracker which honoured the compact flag.
#[derive(Debug, Deserialize)]
struct CompactResponse {
    #[serde(rename = "failure reason", default)]
    failure_reason: Option<String>,
    #[serde(default)]
    interval: u32,
    #[serde(with = "serde_bytes")]
    peers: Vec<u8>,
    #[serde(default, with = "serde_bytes")]
    peers6: Option<Vec<u8>>,
}

/// The announce response of a tracker which returns the peers as a list of dictionaries.
#[derive(Debug, Deserialize)]
struct VerboseResponse {
    #[serde(rename = "failure reason", default)]
    failure_reason: Option<String>,
    #[serde(default)]
    interval: u32,
    #[serde(default)]
    peers: Vec<VerbosePeer>,
}

#[derive(Debug, Deserialize)]
struct VerbosePeer {
    #[serde(rename = "peer id", default, with = "serde_bytes")]
    peer_id: Option<Vec<u8>>,
    /// The ip address or hostname of the peer
    ip: String,
    port: u16,
}

/// The HTTP/HTTPS tracker protocol.
#[derive(Debug)]
pub struct HttpTracker {
    client: Client,
    /// The compact peer format matching the local address family
    format: CompactFormat,
}

impl HttpTracker {
    /// Create a new HTTP tracker client which sends its requests from the given local ip.
    pub fn new(ip: IpAddr, config: &AnnouncerConfig) -> Result<Self> {
        let client = Client::builder()
            .redirect(Policy::limited(3))
            .local_address(ip)
            .timeout(config.http_timeout)
            .user_agent(config.client_name())
            .build()?;

        Ok(Self {
            client,
            format: CompactFormat::of(&ip),
        })
    }

    /// Announce the given request to the HTTP tracker of the given url.
    pub async fn announce(
        &self,
        url: &Url,
        request: &AnnounceRequest,
        cancel: &CancellationToken,
    ) -> Result<AnnounceResult> {
        let url = Self::create_announce_url(url, request);

        trace!("Http tracker is sending request to {}", url);
        let bytes = select! {
            _ = cancel.cancelled() => return Err(AnnounceError::Cancelled),
            result = self.send(&url) => result?,
        };

        trace!(
            "Http tracker {} received {} bytes, {}",
            url,
            bytes.len(),
            String::from_utf8_lossy(&bytes)
        );
        self.parse_response(bytes.as_slice(), cancel).await
    }

    /// Send the announce request and read the complete response body.
    async fn send(&self, url: &Url) -> Result<Vec<u8>> {
        let response = self.client.get(url.clone()).send().await?;
        let status_code = response.status();
        let bytes = response.bytes().await?;

        // an unsuccessful response body is never parsed
        if !status_code.is_success() {
            debug!("Http tracker {} responded with status code {}", url, status_code);
            trace!(
                "Http tracker {} response: {}",
                url,
                String::from_utf8_lossy(bytes.as_ref())
            );
            return Err(AnnounceError::InvalidStatus(status_code.as_u16()));
        }

        Ok(bytes.to_vec())
    }

    /// Append the announce query parameters to the given tracker url.
    /// The binary info hash and peer id are percent-encoded byte by byte.
    fn create_announce_url(url: &Url, request: &AnnounceRequest) -> Url {
        let mut url = url.clone();

        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("port", request.port.to_string().as_str())
                .append_pair("uploaded", request.uploaded.to_string().as_str())
                .append_pair("downloaded", request.downloaded.to_string().as_str())
                .append_pair("left", request.left.to_string().as_str())
                .append_pair("numwant", request.num_want.to_string().as_str())
                .append_pair("compact", "1");
            if let Some(event) = request.event.query_value() {
                query.append_pair("event", event.as_str());
            }
        }

        let info_hash =
            percent_encoding::percent_encode(&request.info_hash, URL_ENCODE_RESERVED).to_string();
        let peer_id =
            percent_encoding::percent_encode(&request.peer_id, URL_ENCODE_RESERVED).to_string();
        let query = format!(
            "{}&info_hash={}&peer_id={}",
            url.query().unwrap_or_default(),
            info_hash,
            peer_id
        );
        url.set_query(Some(query.as_str()));

        url
    }

    /// Parse the announce response body.
    /// The compact schema is tried first, the verbose schema is used as fallback.
    async fn parse_response(
        &self,
        bytes: &[u8],
        cancel: &CancellationToken,
    ) -> Result<AnnounceResult> {
        match bencode::from_bytes::<CompactResponse>(bytes) {
            Ok(response) => {
                debug!("Http tracker received compact response {:?}", response);
                if let Some(failure) = response.failure_reason {
                    return Err(AnnounceError::TrackerFailure(failure));
                }

                let mut peers = self.format.decode(&response.peers)?;
                if let Some(peers6) = response.peers6 {
                    peers.extend(CompactFormat::Ipv6.decode(&peers6)?);
                }

                Ok(AnnounceResult::new(peers, response.interval))
            }
            Err(e) => {
                trace!(
                    "Http tracker response is not compact, trying verbose schema, {}",
                    e
                );
                let response = bencode::from_bytes::<VerboseResponse>(bytes)?;
                debug!("Http tracker received verbose response {:?}", response);
                if let Some(failure) = response.failure_reason {
                    return Err(AnnounceError::TrackerFailure(failure));
                }

                let mut peers = Vec::with_capacity(response.peers.len());
                for peer in response.peers {
                    peers.push(Self::resolve_peer(&peer, cancel).await?);
                }

                Ok(AnnounceResult::new(peers, response.interval))
            }
        }
    }

    async fn resolve_peer(peer: &VerbosePeer, cancel: &CancellationToken) -> Result<SocketAddr> {
        trace!(
            "Http tracker is resolving peer {}:{} (peer id {})",
            peer.ip,
            peer.port,
            peer.peer_id
                .as_deref()
                .map(String::from_utf8_lossy)
                .unwrap_or_default()
        );
        if let Ok(ip) = peer.ip.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, peer.port));
        }

        select! {
            _ = cancel.cancelled() => Err(AnnounceError::Cancelled),
            result = lookup_host((peer.ip.as_str(), peer.port)) => result?
                .next()
                .ok_or_else(|| AnnounceError::Unavailable(format!("{}:{}", peer.ip, peer.port))),
        }
    }
}
