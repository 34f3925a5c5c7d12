//! Client configuration
//!
//! Every timing constant of the session engine lives here. Values come from
//! `Default` and can be overridden with `STUDYRUN_*` environment variables.

use std::time::Duration;

/// Retry policy applied to each request of the delivery queue
#[derive(Debug, Clone, PartialEq)]
pub struct HttpConfig {
    pub timeout: Duration,
    pub retries: u32,
    pub retry_wait: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            retries: 5,
            retry_wait: Duration::from_secs(1),
        }
    }
}

/// Timing of a batch or group channel
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub closed_check_interval: Duration,
    /// Give up on a socket that is not up by then
    pub connect_timeout: Duration,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    pub sending_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(25),
            heartbeat_timeout: Duration::from_secs(10),
            closed_check_interval: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(20),
            backoff_min: Duration::from_secs(1),
            backoff_max: Duration::from_secs(120),
            sending_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub http: HttpConfig,
    pub channel: ChannelConfig,
    /// Period of the run heartbeat POST
    pub heartbeat_period: Duration,
    /// How long draining may take before the wait overlay is shown
    pub overlay_delay: Duration,
    pub overlay_text: String,
    /// How long `init` waits for the batch channel before returning
    pub batch_open_wait: Duration,
    pub before_unload_warning: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            channel: ChannelConfig::default(),
            heartbeat_period: Duration::from_secs(10),
            overlay_delay: Duration::from_secs(1),
            overlay_text: "Sending data. Please wait.".to_string(),
            batch_open_wait: Duration::from_secs(5),
            before_unload_warning: true,
        }
    }
}

impl ClientConfig {
    /// Load from environment with defaults
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let millis = |key: &str, current: Duration| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(current)
        };

        config.http.timeout = millis("STUDYRUN_HTTP_TIMEOUT_MS", config.http.timeout);
        config.http.retry_wait = millis("STUDYRUN_HTTP_RETRY_WAIT_MS", config.http.retry_wait);
        if let Some(retries) = lookup("STUDYRUN_HTTP_RETRIES").and_then(|v| v.trim().parse().ok()) {
            config.http.retries = retries;
        }

        let channel = &mut config.channel;
        channel.heartbeat_interval = millis(
            "STUDYRUN_CHANNEL_HEARTBEAT_INTERVAL_MS",
            channel.heartbeat_interval,
        );
        channel.heartbeat_timeout = millis(
            "STUDYRUN_CHANNEL_HEARTBEAT_TIMEOUT_MS",
            channel.heartbeat_timeout,
        );
        channel.closed_check_interval = millis(
            "STUDYRUN_CHANNEL_CLOSED_CHECK_MS",
            channel.closed_check_interval,
        );
        channel.connect_timeout = millis(
            "STUDYRUN_CHANNEL_CONNECT_TIMEOUT_MS",
            channel.connect_timeout,
        );
        channel.backoff_min = millis("STUDYRUN_CHANNEL_BACKOFF_MIN_MS", channel.backoff_min);
        channel.backoff_max = millis("STUDYRUN_CHANNEL_BACKOFF_MAX_MS", channel.backoff_max);
        channel.sending_timeout = millis(
            "STUDYRUN_CHANNEL_SENDING_TIMEOUT_MS",
            channel.sending_timeout,
        );

        config.heartbeat_period = millis("STUDYRUN_HEARTBEAT_PERIOD_MS", config.heartbeat_period);
        config.overlay_delay = millis("STUDYRUN_OVERLAY_DELAY_MS", config.overlay_delay);
        config.batch_open_wait = millis("STUDYRUN_BATCH_OPEN_WAIT_MS", config.batch_open_wait);
        if let Some(flag) = lookup("STUDYRUN_BEFORE_UNLOAD_WARNING") {
            config.before_unload_warning = !matches!(flag.trim(), "0" | "false" | "off");
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn env_overrides_replace_only_named_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("STUDYRUN_HTTP_RETRIES", "2"),
            ("STUDYRUN_CHANNEL_BACKOFF_MAX_MS", "8000"),
            ("STUDYRUN_BEFORE_UNLOAD_WARNING", "off"),
            ("STUDYRUN_OVERLAY_DELAY_MS", "not-a-number"),
            ("STUDYRUN_CHANNEL_CONNECT_TIMEOUT_MS", "1500"),
        ]);
        let config = ClientConfig::from_lookup(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.http.retries, 2);
        assert_eq!(config.channel.backoff_max, Duration::from_secs(8));
        assert!(!config.before_unload_warning);
        assert_eq!(config.overlay_delay, Duration::from_secs(1));
        assert_eq!(config.channel.backoff_min, Duration::from_secs(1));
        assert_eq!(config.channel.connect_timeout, Duration::from_millis(1500));
    }
}
