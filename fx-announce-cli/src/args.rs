use clap::{Parser, ValueEnum};
use derive_more::Display;
use fx_announce::announce::{AnnounceEvent, AnnounceRequest, AnnouncerConfig, ID_LEN};
use log::LevelFilter;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

/// The peer id prefix of this client, in Azureus style.
const PEER_ID_PREFIX: &str = "-FX0100-";

#[derive(Debug, Display, Clone, Parser)]
#[command(name = "fx-announce", version, about)]
#[display("{} ({})", tracker, hex::encode(info_hash))]
pub struct AnnounceArgs {
    /// The announce url of the tracker, `http(s)://` or `udp://`.
    pub tracker: String,
    /// The hex encoded info hash of the torrent.
    #[arg(long, value_parser = parse_id)]
    pub info_hash: [u8; ID_LEN],
    /// The hex encoded peer id, a random id is generated when omitted.
    #[arg(long, value_parser = parse_id)]
    pub peer_id: Option<[u8; ID_LEN]>,
    /// The port on which peer connections are accepted.
    #[arg(long, default_value_t = 6881)]
    pub port: u16,
    #[arg(long, default_value_t = 0)]
    pub uploaded: u64,
    #[arg(long, default_value_t = 0)]
    pub downloaded: u64,
    #[arg(long, default_value_t = 0)]
    pub left: u64,
    #[arg(long, value_enum, default_value_t = EventArg::Started)]
    pub event: EventArg,
    #[arg(long, default_value_t = 50)]
    pub num_want: u32,
    /// The local address from which the tracker requests are sent.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,
    /// The public IPv4 address to advertise to UDP trackers.
    #[arg(long)]
    pub announce_ip: Option<Ipv4Addr>,
    /// The client name sent to HTTP trackers.
    #[arg(long)]
    pub client_name: Option<String>,
    /// The HTTP request timeout in seconds.
    #[arg(long)]
    pub http_timeout: Option<u64>,
    /// The initial UDP retransmission timeout in seconds.
    #[arg(long)]
    pub retransmit_timeout: Option<u64>,
    #[arg(long)]
    pub max_retransmits: Option<u32>,
    #[arg(long, default_value_t = LevelFilter::Info)]
    pub log_level: LevelFilter,
    /// Additionally write the log output to the given file.
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

impl AnnounceArgs {
    /// Create the announcer configuration from the arguments.
    pub fn config(&self) -> AnnouncerConfig {
        let mut builder = AnnouncerConfig::builder();

        if let Some(name) = &self.client_name {
            builder.client_name(name);
        }
        if let Some(seconds) = self.http_timeout {
            builder.http_timeout(Duration::from_secs(seconds));
        }
        if let Some(seconds) = self.retransmit_timeout {
            builder.retransmit_timeout(Duration::from_secs(seconds));
        }
        if let Some(retransmits) = self.max_retransmits {
            builder.max_retransmits(retransmits);
        }
        if let Some(ip) = self.announce_ip {
            builder.announce_ip(ip);
        }

        builder.build()
    }

    /// Create the announce request from the arguments.
    pub fn request(&self) -> AnnounceRequest {
        AnnounceRequest {
            info_hash: self.info_hash,
            peer_id: self.peer_id.unwrap_or_else(generate_peer_id),
            port: self.port,
            uploaded: self.uploaded,
            downloaded: self.downloaded,
            left: self.left,
            event: self.event.into(),
            num_want: self.num_want,
        }
    }
}

#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum EventArg {
    #[display("none")]
    None,
    #[display("started")]
    Started,
    #[display("stopped")]
    Stopped,
    #[display("completed")]
    Completed,
}

impl From<EventArg> for AnnounceEvent {
    fn from(value: EventArg) -> Self {
        match value {
            EventArg::None => AnnounceEvent::None,
            EventArg::Started => AnnounceEvent::Started,
            EventArg::Stopped => AnnounceEvent::Stopped,
            EventArg::Completed => AnnounceEvent::Completed,
        }
    }
}

fn parse_id(value: &str) -> Result<[u8; ID_LEN], String> {
    let bytes = hex::decode(value).map_err(|e| e.to_string())?;

    <[u8; ID_LEN]>::try_from(bytes.as_slice())
        .map_err(|_| format!("expected {} bytes, got {}", ID_LEN, bytes.len()))
}

fn generate_peer_id() -> [u8; ID_LEN] {
    let mut id = [0u8; ID_LEN];
    let suffix = format!("{:012}", rand::random::<u64>() % 1_000_000_000_000);

    id[..PEER_ID_PREFIX.len()].copy_from_slice(PEER_ID_PREFIX.as_bytes());
    id[PEER_ID_PREFIX.len()..].copy_from_slice(suffix.as_bytes());
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    const INFO_HASH: &str = "2c6b6858d61da9543d4231a71db4b1c9264b0685";

    #[test]
    fn test_parse_defaults() {
        let args =
            AnnounceArgs::try_parse_from(["fx-announce", "udp://localhost:6969", "--info-hash", INFO_HASH])
                .unwrap();

        let request = args.request();
        assert_eq!(hex::decode(INFO_HASH).unwrap(), request.info_hash.to_vec());
        assert_eq!(AnnounceEvent::Started, request.event);
        assert_eq!(6881, request.port);
        assert!(request.peer_id.starts_with(PEER_ID_PREFIX.as_bytes()));

        let config = args.config();
        assert_eq!(AnnouncerConfig::default(), config);
    }

    #[test]
    fn test_parse_config() {
        let args = AnnounceArgs::try_parse_from([
            "fx-announce",
            "http://localhost/announce",
            "--info-hash",
            INFO_HASH,
            "--event",
            "completed",
            "--client-name",
            "Lorem/1.0",
            "--retransmit-timeout",
            "2",
            "--max-retransmits",
            "3",
            "--announce-ip",
            "10.0.0.5",
        ])
        .unwrap();

        let config = args.config();
        assert_eq!("Lorem/1.0", config.client_name());
        assert_eq!(Duration::from_secs(2), config.retransmit_timeout);
        assert_eq!(3, config.max_retransmits);
        assert_eq!(Some(Ipv4Addr::new(10, 0, 0, 5)), config.announce_ip);
        assert_eq!(AnnounceEvent::Completed, args.request().event);
    }

    #[test]
    fn test_parse_invalid_info_hash() {
        let result =
            AnnounceArgs::try_parse_from(["fx-announce", "udp://localhost:6969", "--info-hash", "abcd"]);

        assert!(result.is_err(), "expected a short info hash to be rejected");
    }

    #[test]
    fn test_generate_peer_id() {
        let result = generate_peer_id();

        assert_eq!(PEER_ID_PREFIX.as_bytes(), &result[..PEER_ID_PREFIX.len()]);
        assert!(result[PEER_ID_PREFIX.len()..]
            .iter()
            .all(u8::is_ascii_digit));
    }
}
