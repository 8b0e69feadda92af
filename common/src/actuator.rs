use log::{debug, warn};

use crate::{error::HardwareError, hal::OutputPin, types::LinkState};

const CONNECTING_BLINK_MS: u64 = 1_000;
const FALLBACK_BLINK_MS: u64 = 2_000;

/// Output held high for a bounded time, released from the tick loop.
#[derive(Debug, Clone)]
pub struct TimedActuator {
    duration_ms: u64,
    active_since: Option<u64>,
}

impl TimedActuator {
    pub fn new(duration_ms: u64) -> Self {
        Self {
            duration_ms,
            active_since: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active_since.is_some()
    }

    /// Starts a pulse. Re-triggering while active restarts the duration.
    pub fn trigger<P: OutputPin>(&mut self, now_ms: u64, pin: &mut P) -> Result<(), HardwareError> {
        pin.set(true)?;
        self.active_since = Some(now_ms);
        Ok(())
    }

    pub fn tick<P: OutputPin>(&mut self, now_ms: u64, pin: &mut P) -> Result<(), HardwareError> {
        let Some(since) = self.active_since else {
            return Ok(());
        };
        if now_ms.saturating_sub(since) < self.duration_ms {
            return Ok(());
        }

        // Stays active on failure so the next tick retries the release.
        pin.set(false)?;
        self.active_since = None;
        debug!("actuator released after {} ms", now_ms.saturating_sub(since));
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Light {
    on: bool,
}

impl Light {
    pub fn is_on(&self) -> bool {
        self.on
    }

    pub fn set<P: OutputPin>(&mut self, on: bool, pin: &mut P) -> Result<(), HardwareError> {
        pin.set(on)?;
        self.on = on;
        Ok(())
    }

    pub fn toggle<P: OutputPin>(&mut self, pin: &mut P) -> Result<(), HardwareError> {
        self.set(!self.on, pin)
    }
}

/// Mirrors the link state on the status LED: solid when connected, fast
/// blink while connecting, slow blink in fallback, dark when disconnected.
#[derive(Debug, Clone, Default)]
pub struct StatusIndicator {
    lit: Option<bool>,
}

impl StatusIndicator {
    pub fn desired_level(state: LinkState, now_ms: u64) -> bool {
        match state {
            LinkState::Connected => true,
            LinkState::Connecting => (now_ms / CONNECTING_BLINK_MS) % 2 == 0,
            LinkState::FallbackMode => (now_ms / FALLBACK_BLINK_MS) % 2 == 0,
            LinkState::Disconnected => false,
        }
    }

    pub fn update<P: OutputPin>(&mut self, state: LinkState, now_ms: u64, pin: &mut P) {
        let desired = Self::desired_level(state, now_ms);
        if self.lit == Some(desired) {
            return;
        }

        match pin.set(desired) {
            Ok(()) => self.lit = Some(desired),
            Err(err) => warn!("failed to drive status LED: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::RecordingPin;

    struct BrokenPin;

    impl OutputPin for BrokenPin {
        fn set(&mut self, _on: bool) -> Result<(), HardwareError> {
            Err(HardwareError::Bus("gpio".to_string()))
        }
    }

    #[test]
    fn buzzer_pulse_is_bounded() {
        let mut buzzer = TimedActuator::new(5_000);
        let mut pin = RecordingPin::default();

        buzzer.trigger(10_000, &mut pin).unwrap();
        for now in (11_000..15_000).step_by(1_000) {
            buzzer.tick(now, &mut pin).unwrap();
            assert!(pin.level, "released early at {now}");
        }

        buzzer.tick(15_000, &mut pin).unwrap();
        assert!(!pin.level);
        assert!(!buzzer.is_active());
        assert_eq!(pin.writes, vec![true, false]);

        buzzer.tick(20_000, &mut pin).unwrap();
        assert_eq!(pin.writes.len(), 2);
    }

    #[test]
    fn retrigger_restarts_duration() {
        let mut buzzer = TimedActuator::new(5_000);
        let mut pin = RecordingPin::default();

        buzzer.trigger(0, &mut pin).unwrap();
        buzzer.trigger(4_000, &mut pin).unwrap();
        buzzer.tick(6_000, &mut pin).unwrap();
        assert!(pin.level);

        buzzer.tick(9_000, &mut pin).unwrap();
        assert!(!pin.level);
    }

    #[test]
    fn failed_trigger_leaves_actuator_idle() {
        let mut buzzer = TimedActuator::new(5_000);

        assert!(buzzer.trigger(0, &mut BrokenPin).is_err());
        assert!(!buzzer.is_active());
    }

    #[test]
    fn light_state_follows_successful_writes_only() {
        let mut light = Light::default();
        let mut pin = RecordingPin::default();

        light.toggle(&mut pin).unwrap();
        assert!(light.is_on());
        light.set(true, &mut pin).unwrap();
        light.toggle(&mut pin).unwrap();
        assert!(!light.is_on());
        assert_eq!(pin.writes, vec![true, true, false]);

        assert!(light.toggle(&mut BrokenPin).is_err());
        assert!(!light.is_on());
    }

    #[test]
    fn status_led_maps_link_state() {
        assert!(StatusIndicator::desired_level(LinkState::Connected, 1_500));
        assert!(!StatusIndicator::desired_level(LinkState::Disconnected, 0));

        let connecting: Vec<bool> = (0..4)
            .map(|second| StatusIndicator::desired_level(LinkState::Connecting, second * 1_000))
            .collect();
        assert_eq!(connecting, vec![true, false, true, false]);

        let fallback: Vec<bool> = (0..4)
            .map(|second| StatusIndicator::desired_level(LinkState::FallbackMode, second * 1_000))
            .collect();
        assert_eq!(fallback, vec![true, true, false, false]);
    }

    #[test]
    fn status_led_writes_only_on_change() {
        let mut indicator = StatusIndicator::default();
        let mut pin = RecordingPin::default();

        indicator.update(LinkState::Connected, 0, &mut pin);
        indicator.update(LinkState::Connected, 1_000, &mut pin);
        indicator.update(LinkState::Disconnected, 2_000, &mut pin);
        indicator.update(LinkState::Disconnected, 3_000, &mut pin);

        assert_eq!(pin.writes, vec![true, false]);
    }
}
