//! Driver configuration with builder pattern.
//!
//! Covers retry/failover policy, connection timeouts, and the message
//! size ceilings applied to the channel (inbound) and to the local
//! outbound guard.

use std::time::Duration;

use snafu::ensure;

use crate::error::{InvalidConfigSnafu, Result};

/// Default number of dispatch attempts before a call fails over for good.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// Default delay between failover attempts, also the minimum age an
/// unhealthy endpoint must reach before the recovery sweep retries it.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Default connection establishment timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Driver configuration.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Identifier reported to the server in connection details.
    pub(crate) client_id: String,

    /// Dispatch attempt cap; `None` disables the cap (the delay stays).
    pub(crate) retry_attempts: Option<u32>,

    /// Delay between dispatch attempts and recovery probes.
    pub(crate) retry_delay: Duration,

    /// Connection establishment timeout.
    pub(crate) connect_timeout: Duration,

    /// Optional per-request deadline applied at the channel.
    pub(crate) request_timeout: Option<Duration>,

    /// Ceiling for locally serialized outbound messages.
    pub(crate) max_outbound_message_size: usize,

    /// Ceiling for inbound messages, set at channel construction.
    pub(crate) max_inbound_message_size: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            client_id: generated_client_id(),
            retry_attempts: Some(DEFAULT_RETRY_ATTEMPTS),
            retry_delay: DEFAULT_RETRY_DELAY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: None,
            max_outbound_message_size: ojp_proto::DEFAULT_MAX_MESSAGE_SIZE,
            max_inbound_message_size: ojp_proto::DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

fn generated_client_id() -> String {
    format!("ojp-{}", uuid::Uuid::new_v4())
}

impl DriverConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> DriverConfigBuilder {
        DriverConfigBuilder::default()
    }

    /// Returns the client identifier.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Returns the dispatch attempt cap; `None` means unlimited.
    #[must_use]
    pub fn retry_attempts(&self) -> Option<u32> {
        self.retry_attempts
    }

    /// Returns the delay between dispatch attempts.
    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    /// Returns the connection establishment timeout.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Returns the per-request deadline, if configured.
    #[must_use]
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    /// Returns the outbound message size ceiling.
    #[must_use]
    pub fn max_outbound_message_size(&self) -> usize {
        self.max_outbound_message_size
    }

    /// Returns the inbound message size ceiling.
    #[must_use]
    pub fn max_inbound_message_size(&self) -> usize {
        self.max_inbound_message_size
    }
}

/// Builder for [`DriverConfig`].
#[derive(Debug, Default)]
pub struct DriverConfigBuilder {
    client_id: Option<String>,
    retry_attempts: Option<Option<u32>>,
    retry_delay: Option<Duration>,
    connect_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
    max_outbound_message_size: Option<usize>,
    max_inbound_message_size: Option<usize>,
}

impl DriverConfigBuilder {
    /// Sets the client identifier reported to the server. A random one is
    /// generated when unset.
    #[must_use]
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Sets the dispatch attempt cap.
    #[must_use]
    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = Some(Some(attempts));
        self
    }

    /// Disables the attempt cap. The retry delay still applies between
    /// attempts.
    #[must_use]
    pub fn with_unlimited_retries(mut self) -> Self {
        self.retry_attempts = Some(None);
        self
    }

    /// Sets the delay between dispatch attempts and recovery probes.
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    /// Sets the connection establishment timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Sets a per-request deadline applied at the channel.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Sets the outbound message size ceiling.
    #[must_use]
    pub fn with_max_outbound_message_size(mut self, bytes: usize) -> Self {
        self.max_outbound_message_size = Some(bytes);
        self
    }

    /// Sets the inbound message size ceiling.
    #[must_use]
    pub fn with_max_inbound_message_size(mut self, bytes: usize) -> Self {
        self.max_inbound_message_size = Some(bytes);
        self
    }

    /// Switches both size ceilings to the 16 MiB large-message profile.
    #[must_use]
    pub fn with_large_messages(mut self) -> Self {
        self.max_outbound_message_size = Some(ojp_proto::LARGE_MAX_MESSAGE_SIZE);
        self.max_inbound_message_size = Some(ojp_proto::LARGE_MAX_MESSAGE_SIZE);
        self
    }

    /// Builds the configuration, validating all settings.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::InvalidConfig`](crate::DriverError::InvalidConfig)
    /// if the client id is empty, a duration is zero, an attempt cap of
    /// zero is given, or a size ceiling is smaller than one LOB block.
    pub fn build(self) -> Result<DriverConfig> {
        let defaults = DriverConfig::default();

        let client_id = self.client_id.unwrap_or(defaults.client_id);
        ensure!(!client_id.is_empty(), InvalidConfigSnafu { message: "client id cannot be empty" });

        let retry_attempts = self.retry_attempts.unwrap_or(defaults.retry_attempts);
        if let Some(attempts) = retry_attempts {
            ensure!(
                attempts > 0,
                InvalidConfigSnafu { message: "retry attempts must be at least 1" }
            );
        }

        let retry_delay = self.retry_delay.unwrap_or(defaults.retry_delay);
        ensure!(
            !retry_delay.is_zero(),
            InvalidConfigSnafu { message: "retry delay cannot be zero" }
        );

        let connect_timeout = self.connect_timeout.unwrap_or(defaults.connect_timeout);
        ensure!(
            !connect_timeout.is_zero(),
            InvalidConfigSnafu { message: "connect timeout cannot be zero" }
        );

        let max_outbound_message_size =
            self.max_outbound_message_size.unwrap_or(defaults.max_outbound_message_size);
        let max_inbound_message_size =
            self.max_inbound_message_size.unwrap_or(defaults.max_inbound_message_size);
        ensure!(
            max_outbound_message_size > 0 && max_inbound_message_size > 0,
            InvalidConfigSnafu { message: "message size ceilings must be positive" }
        );

        Ok(DriverConfig {
            client_id,
            retry_attempts,
            retry_delay,
            connect_timeout,
            request_timeout: self.request_timeout,
            max_outbound_message_size,
            max_inbound_message_size,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = DriverConfig::default();
        assert_eq!(config.retry_attempts(), Some(DEFAULT_RETRY_ATTEMPTS));
        assert_eq!(config.retry_delay(), DEFAULT_RETRY_DELAY);
        assert_eq!(config.connect_timeout(), DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.max_outbound_message_size(), ojp_proto::DEFAULT_MAX_MESSAGE_SIZE);
        assert_eq!(config.max_inbound_message_size(), ojp_proto::DEFAULT_MAX_MESSAGE_SIZE);
        assert!(config.request_timeout().is_none());
        assert!(config.client_id().starts_with("ojp-"));
    }

    #[test]
    fn generated_client_ids_are_unique() {
        let a = DriverConfig::default();
        let b = DriverConfig::default();
        assert_ne!(a.client_id(), b.client_id());
    }

    #[test]
    fn builder_overrides_apply() {
        let config = DriverConfig::builder()
            .with_client_id("app-7")
            .with_retry_attempts(5)
            .with_retry_delay(Duration::from_millis(200))
            .with_connect_timeout(Duration::from_secs(2))
            .with_request_timeout(Duration::from_secs(30))
            .build()
            .unwrap();

        assert_eq!(config.client_id(), "app-7");
        assert_eq!(config.retry_attempts(), Some(5));
        assert_eq!(config.retry_delay(), Duration::from_millis(200));
        assert_eq!(config.connect_timeout(), Duration::from_secs(2));
        assert_eq!(config.request_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn unlimited_retries_disable_the_cap() {
        let config = DriverConfig::builder().with_unlimited_retries().build().unwrap();
        assert_eq!(config.retry_attempts(), None);
    }

    #[test]
    fn large_message_profile_raises_both_ceilings() {
        let config = DriverConfig::builder().with_large_messages().build().unwrap();
        assert_eq!(config.max_outbound_message_size(), ojp_proto::LARGE_MAX_MESSAGE_SIZE);
        assert_eq!(config.max_inbound_message_size(), ojp_proto::LARGE_MAX_MESSAGE_SIZE);
    }

    #[test]
    fn zero_retry_delay_is_rejected() {
        let result = DriverConfig::builder().with_retry_delay(Duration::ZERO).build();
        assert!(result.is_err());
    }

    #[test]
    fn zero_retry_attempts_are_rejected() {
        let result = DriverConfig::builder().with_retry_attempts(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn empty_client_id_is_rejected() {
        let result = DriverConfig::builder().with_client_id("").build();
        assert!(result.is_err());
    }

    #[test]
    fn zero_size_ceiling_is_rejected() {
        let result = DriverConfig::builder().with_max_outbound_message_size(0).build();
        assert!(result.is_err());
    }
}
