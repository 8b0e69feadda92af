use log::{error, info, warn};
use rand::{rngs::StdRng, SeedableRng};

use crate::{
    backoff::Backoff,
    config::{NetworkConfig, RetryConfig},
    error::{ConfigError, LinkError, TransportError},
    hal::LinkDriver,
    types::{LinkFault, LinkState},
};

/// Supervises the station link.
///
/// Disconnected -> Connecting -> Connected, with capped backoff between failed
/// attempts. After `max_consecutive_failures` failures the device falls back to
/// its own access point and only re-attempts on the slower fallback interval.
/// The failure count is only cleared once a link has stayed up for
/// `stable_link_ms`, so a flapping link backs off like one that never came up.
/// Malformed credentials park the manager in a persistent fault until
/// [`ConnectivityManager::reconfigure`] is called.
#[derive(Debug)]
pub struct ConnectivityManager {
    network: NetworkConfig,
    retry: RetryConfig,
    backoff: Backoff,
    rng: StdRng,

    state: LinkState,
    fault: Option<LinkFault>,

    consecutive_failures: u32,
    publish_failures: u32,

    next_attempt_ms: u64,
    next_fallback_retry_ms: u64,
    connect_started_ms: u64,
    connected_since_ms: u64,
    attempt_from_fallback: bool,
    access_point_active: bool,
}

impl ConnectivityManager {
    pub fn new(network: NetworkConfig, retry: RetryConfig) -> Self {
        Self::with_rng(network, retry, StdRng::from_entropy())
    }

    pub fn with_seed(network: NetworkConfig, retry: RetryConfig, seed: u64) -> Self {
        Self::with_rng(network, retry, StdRng::seed_from_u64(seed))
    }

    fn with_rng(network: NetworkConfig, retry: RetryConfig, rng: StdRng) -> Self {
        let fault = network.validate().err().map(|err| {
            error!("network configuration rejected: {err}");
            LinkFault::Configuration(err.to_string())
        });

        Self {
            backoff: Backoff::from(&retry),
            network,
            retry,
            rng,
            state: LinkState::Disconnected,
            fault,
            consecutive_failures: 0,
            publish_failures: 0,
            next_attempt_ms: 0,
            next_fallback_retry_ms: 0,
            connect_started_ms: 0,
            connected_since_ms: 0,
            attempt_from_fallback: false,
            access_point_active: false,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn fault(&self) -> Option<&LinkFault> {
        self.fault.as_ref()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn next_attempt_ms(&self) -> u64 {
        match self.state {
            LinkState::FallbackMode => self.next_fallback_retry_ms,
            _ => self.next_attempt_ms,
        }
    }

    pub fn network(&self) -> &NetworkConfig {
        &self.network
    }

    pub fn tick<D: LinkDriver>(&mut self, now_ms: u64, driver: &mut D) -> LinkState {
        if self.fault.is_some() {
            self.ensure_access_point(now_ms, driver);
            return self.state;
        }

        match self.state {
            LinkState::Disconnected => {
                if now_ms >= self.next_attempt_ms {
                    self.attempt(now_ms, driver, false);
                }
            }
            LinkState::Connecting => self.poll_attempt(now_ms, driver),
            LinkState::Connected => self.supervise(now_ms, driver),
            LinkState::FallbackMode => {
                if now_ms >= self.next_fallback_retry_ms {
                    info!("fallback retry window reached; re-attempting station link");
                    self.attempt(now_ms, driver, true);
                }
            }
        }

        self.state
    }

    /// Counts a failed publish. Enough of them in a row while nominally
    /// connected means the link is dead even though the driver says otherwise.
    pub fn report_publish_failure<D: LinkDriver>(&mut self, now_ms: u64, driver: &mut D) {
        self.publish_failures = self.publish_failures.saturating_add(1);

        if self.state == LinkState::Connected
            && self.publish_failures >= self.retry.publish_failure_threshold
        {
            warn!(
                "{} consecutive publish failures while connected; forcing reconnect",
                self.publish_failures
            );
            driver.disconnect();
            self.publish_failures = 0;
            self.next_attempt_ms = now_ms;
            self.transition(LinkState::Disconnected);
        }
    }

    pub fn report_publish_success(&mut self) {
        self.publish_failures = 0;
    }

    /// Parks the link in a configuration fault found outside the manager, such
    /// as stored network settings that could not be read. Only
    /// [`ConnectivityManager::reconfigure`] clears it.
    pub fn hold_fault(&mut self, err: ConfigError) {
        error!("network configuration is unusable, operator action required: {err}");
        self.fault = Some(LinkFault::Configuration(err.to_string()));
    }

    /// Replaces the network settings, clearing any configuration fault.
    pub fn reconfigure<D: LinkDriver>(
        &mut self,
        network: NetworkConfig,
        now_ms: u64,
        driver: &mut D,
    ) -> Result<(), ConfigError> {
        if let Err(err) = network.validate() {
            warn!("rejected network reconfiguration: {err}");
            return Err(err);
        }

        if self.state != LinkState::Disconnected {
            driver.disconnect();
        }

        info!("network reconfigured for `{}`", network.wifi_ssid);
        self.network = network;
        self.fault = None;
        self.consecutive_failures = 0;
        self.publish_failures = 0;
        self.next_attempt_ms = now_ms;
        self.access_point_active = false;
        self.transition(LinkState::Disconnected);
        Ok(())
    }

    fn attempt<D: LinkDriver>(&mut self, now_ms: u64, driver: &mut D, from_fallback: bool) {
        self.attempt_from_fallback = from_fallback;

        match driver.begin_connect(&self.network) {
            Ok(()) => {
                self.connect_started_ms = now_ms;
                self.transition(LinkState::Connecting);
                self.poll_attempt(now_ms, driver);
            }
            Err(LinkError::Config(err)) => self.enter_fault(err, now_ms, driver),
            Err(LinkError::Transport(err)) => self.on_failure(err, now_ms, driver),
        }
    }

    fn poll_attempt<D: LinkDriver>(&mut self, now_ms: u64, driver: &mut D) {
        match driver.poll_connected() {
            Ok(true) => {
                info!(
                    "station link up after {} failed attempt(s)",
                    self.consecutive_failures
                );
                self.connected_since_ms = now_ms;
                self.publish_failures = 0;
                self.access_point_active = false;
                self.transition(LinkState::Connected);
            }
            Ok(false) => {
                let elapsed = now_ms.saturating_sub(self.connect_started_ms);
                if elapsed >= self.retry.connect_timeout_ms {
                    driver.disconnect();
                    self.on_failure(TransportError::Timeout, now_ms, driver);
                }
            }
            Err(err) => {
                driver.disconnect();
                self.on_failure(err, now_ms, driver);
            }
        }
    }

    fn supervise<D: LinkDriver>(&mut self, now_ms: u64, driver: &mut D) {
        let lost = match driver.poll_connected() {
            Ok(up) => !up,
            Err(err) => {
                warn!("link health check failed: {err}");
                true
            }
        };

        let uptime_ms = now_ms.saturating_sub(self.connected_since_ms);
        let stable = uptime_ms >= self.retry.stable_link_ms;
        if stable && (self.consecutive_failures > 0 || self.attempt_from_fallback) {
            info!("station link stable for {uptime_ms} ms; clearing failure count");
            self.consecutive_failures = 0;
            self.attempt_from_fallback = false;
        }

        if !lost {
            return;
        }
        if stable {
            warn!("station link lost; reconnecting");
            self.next_attempt_ms = now_ms;
            self.transition(LinkState::Disconnected);
        } else {
            driver.disconnect();
            self.on_failure(
                TransportError::Unreachable(format!("link dropped after {uptime_ms} ms")),
                now_ms,
                driver,
            );
        }
    }

    fn on_failure<D: LinkDriver>(&mut self, err: TransportError, now_ms: u64, driver: &mut D) {
        if self.attempt_from_fallback {
            warn!("fallback reconnect attempt failed: {err}");
            self.enter_fallback(now_ms, driver);
            return;
        }

        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures >= self.retry.max_consecutive_failures {
            warn!(
                "link attempt {} failed ({err}); giving up on station mode for now",
                self.consecutive_failures
            );
            self.enter_fallback(now_ms, driver);
            return;
        }

        let delay = self.backoff.delay_ms(self.consecutive_failures, &mut self.rng);
        warn!(
            "link attempt {} failed ({err}); retrying in {delay} ms",
            self.consecutive_failures
        );
        self.next_attempt_ms = now_ms.saturating_add(delay);
        self.transition(LinkState::Disconnected);
    }

    fn enter_fallback<D: LinkDriver>(&mut self, now_ms: u64, driver: &mut D) {
        self.access_point_active = match driver.start_access_point() {
            Ok(()) => true,
            Err(err) => {
                warn!("failed to start fallback access point: {err}");
                false
            }
        };
        self.next_fallback_retry_ms = now_ms.saturating_add(self.retry.fallback_retry_interval_ms);
        self.transition(LinkState::FallbackMode);
    }

    fn enter_fault<D: LinkDriver>(&mut self, err: ConfigError, now_ms: u64, driver: &mut D) {
        error!("network configuration is unusable, operator action required: {err}");
        self.fault = Some(LinkFault::Configuration(err.to_string()));
        self.next_fallback_retry_ms = now_ms;
        self.transition(LinkState::Disconnected);
        self.ensure_access_point(now_ms, driver);
    }

    fn ensure_access_point<D: LinkDriver>(&mut self, now_ms: u64, driver: &mut D) {
        if self.access_point_active || now_ms < self.next_fallback_retry_ms {
            return;
        }

        match driver.start_access_point() {
            Ok(()) => {
                info!("configuration access point started");
                self.access_point_active = true;
            }
            Err(err) => {
                warn!("failed to start configuration access point: {err}");
                self.next_fallback_retry_ms =
                    now_ms.saturating_add(self.retry.fallback_retry_interval_ms);
            }
        }
    }

    fn transition(&mut self, next: LinkState) {
        if self.state != next {
            info!("link state {} -> {}", self.state.as_str(), next.as_str());
            self.state = next;
        }
    }
}
