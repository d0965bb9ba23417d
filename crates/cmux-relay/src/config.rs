use std::time::Duration;

/// How long a peer may stay silent before it is considered gone.
pub const DEFAULT_PONG_WAIT: Duration = Duration::from_secs(60);
/// Upper bound on a single shell-detection probe.
pub const MAX_PROBE_TIMEOUT: Duration = Duration::from_secs(3);
/// Probing stops once this many usable commands were found.
pub const DEFAULT_MAX_AVAILABLE: usize = 10;
/// A command that outlives this window without failing is treated as started.
pub const DEFAULT_START_GRACE: Duration = Duration::from_millis(500);

/// Keepalive timing for one terminal session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    pub pong_wait: Duration,
    pub ping_period: Duration,
}

impl KeepaliveConfig {
    /// Ping period is derived as 9/10 of `pong_wait` so a ping is always in
    /// flight before the read deadline expires.
    pub fn new(pong_wait: Duration) -> Self {
        Self {
            pong_wait,
            ping_period: pong_wait * 9 / 10,
        }
    }
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self::new(DEFAULT_PONG_WAIT)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverConfig {
    pub probe_timeout: Duration,
    pub max_available: usize,
}

impl ResolverConfig {
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout.min(MAX_PROBE_TIMEOUT);
        self
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            probe_timeout: MAX_PROBE_TIMEOUT,
            max_available: DEFAULT_MAX_AVAILABLE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub keepalive: KeepaliveConfig,
    pub resolver: ResolverConfig,
    /// Until a candidate is confirmed started, its output is held back and
    /// the input it read can be replayed to the next candidate.
    pub start_grace: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            keepalive: KeepaliveConfig::default(),
            resolver: ResolverConfig::default(),
            start_grace: DEFAULT_START_GRACE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_period_is_nine_tenths() {
        let config = KeepaliveConfig::new(Duration::from_secs(60));
        assert_eq!(config.ping_period, Duration::from_secs(54));

        let config = KeepaliveConfig::new(Duration::from_millis(100));
        assert_eq!(config.ping_period, Duration::from_millis(90));
    }

    #[test]
    fn test_probe_timeout_is_capped() {
        let config = ResolverConfig::default().with_probe_timeout(Duration::from_secs(30));
        assert_eq!(config.probe_timeout, MAX_PROBE_TIMEOUT);

        let config = ResolverConfig::default().with_probe_timeout(Duration::from_millis(500));
        assert_eq!(config.probe_timeout, Duration::from_millis(500));
    }
}
