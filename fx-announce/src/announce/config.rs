use crate::VERSION;
use std::net::Ipv4Addr;
use std::time::Duration;

pub(crate) const DEFAULT_CLIENT_NAME: &str = "FxAnnounce";
pub(crate) const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_RETRANSMIT_TIMEOUT: Duration = Duration::from_secs(15);
pub(crate) const DEFAULT_MAX_RETRANSMITS: u32 = 8;
pub(crate) const DEFAULT_CONNECTION_ID_TTL: Duration = Duration::from_secs(60);

/// The announcer configuration values.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnouncerConfig {
    client_name: String,
    /// The overall timeout of a single HTTP tracker request
    pub http_timeout: Duration,
    /// The base wait time of a UDP request, doubled on every retransmission
    pub retransmit_timeout: Duration,
    /// The highest zero-based retransmission attempt of a UDP request
    pub max_retransmits: u32,
    /// The lifetime of a negotiated UDP connection id
    pub connection_id_ttl: Duration,
    /// The public IPv4 address to advertise within UDP announces
    pub announce_ip: Option<Ipv4Addr>,
}

impl AnnouncerConfig {
    /// Create a new announcer configuration builder.
    pub fn builder() -> AnnouncerConfigBuilder {
        AnnouncerConfigBuilder::builder()
    }

    /// Get the client identifier sent to HTTP trackers.
    pub fn client_name(&self) -> &str {
        self.client_name.as_str()
    }

    /// Get the wait time for the given zero-based transmission attempt.
    /// The wait doubles for every attempt, starting at [AnnouncerConfig::retransmit_timeout].
    pub fn retransmit_timeout_for(&self, attempt: u32) -> Duration {
        self.retransmit_timeout
            .saturating_mul(2u32.saturating_pow(attempt))
    }
}

impl Default for AnnouncerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Default)]
pub struct AnnouncerConfigBuilder {
    client_name: Option<String>,
    http_timeout: Option<Duration>,
    retransmit_timeout: Option<Duration>,
    max_retransmits: Option<u32>,
    connection_id_ttl: Option<Duration>,
    announce_ip: Option<Ipv4Addr>,
}

impl AnnouncerConfigBuilder {
    /// Create a new announcer configuration builder.
    pub fn builder() -> Self {
        Self::default()
    }

    /// Set the client identifier sent to HTTP trackers.
    pub fn client_name<S: AsRef<str>>(&mut self, name: S) -> &mut Self {
        self.client_name = Some(name.as_ref().to_string());
        self
    }

    /// Set the timeout of HTTP tracker requests.
    pub fn http_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.http_timeout = Some(timeout);
        self
    }

    /// Set the base wait time before a UDP request is retransmitted.
    pub fn retransmit_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.retransmit_timeout = Some(timeout);
        self
    }

    /// Set the highest zero-based retransmission attempt.
    pub fn max_retransmits(&mut self, retransmits: u32) -> &mut Self {
        self.max_retransmits = Some(retransmits);
        self
    }

    /// Set the lifetime of cached UDP connection ids.
    pub fn connection_id_ttl(&mut self, ttl: Duration) -> &mut Self {
        self.connection_id_ttl = Some(ttl);
        self
    }

    /// Set the public IPv4 address which is advertised to UDP trackers.
    pub fn announce_ip(&mut self, ip: Ipv4Addr) -> &mut Self {
        self.announce_ip = Some(ip);
        self
    }

    /// Build the announcer configuration.
    pub fn build(&mut self) -> AnnouncerConfig {
        let client_name = self
            .client_name
            .take()
            .unwrap_or_else(|| format!("{}/{}", DEFAULT_CLIENT_NAME, VERSION));
        let http_timeout = self.http_timeout.take().unwrap_or(DEFAULT_HTTP_TIMEOUT);
        let retransmit_timeout = self
            .retransmit_timeout
            .take()
            .unwrap_or(DEFAULT_RETRANSMIT_TIMEOUT);
        let max_retransmits = self
            .max_retransmits
            .take()
            .unwrap_or(DEFAULT_MAX_RETRANSMITS);
        let connection_id_ttl = self
            .connection_id_ttl
            .take()
            .unwrap_or(DEFAULT_CONNECTION_ID_TTL);

        AnnouncerConfig {
            client_name,
            http_timeout,
            retransmit_timeout,
            max_retransmits,
            connection_id_ttl,
            announce_ip: self.announce_ip.take(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default() {
        let result = AnnouncerConfig::default();

        assert_eq!(format!("FxAnnounce/{}", VERSION), result.client_name());
        assert_eq!(Duration::from_secs(15), result.retransmit_timeout);
        assert_eq!(8, result.max_retransmits);
        assert_eq!(Duration::from_secs(60), result.connection_id_ttl);
        assert_eq!(None, result.announce_ip);
    }

    #[test]
    fn test_builder() {
        let result = AnnouncerConfig::builder()
            .client_name("cbv0")
            .retransmit_timeout(Duration::from_millis(50))
            .max_retransmits(2)
            .announce_ip(Ipv4Addr::new(10, 0, 0, 1))
            .build();

        assert_eq!("cbv0", result.client_name());
        assert_eq!(Duration::from_millis(50), result.retransmit_timeout);
        assert_eq!(2, result.max_retransmits);
        assert_eq!(Some(Ipv4Addr::new(10, 0, 0, 1)), result.announce_ip);
    }

    #[test]
    fn test_retransmit_timeout_for() {
        let config = AnnouncerConfig::default();
        let expected_seconds = [15, 30, 60, 120, 240, 480, 960, 1920, 3840];

        for (attempt, expected) in expected_seconds.into_iter().enumerate() {
            assert_eq!(
                Duration::from_secs(expected),
                config.retransmit_timeout_for(attempt as u32),
                "expected attempt {} to wait {}s",
                attempt,
                expected
            );
        }
    }
}
