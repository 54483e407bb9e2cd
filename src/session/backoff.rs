use std::time::Duration;

use crate::config::ReconnectSettings;

/// Exponential reconnect delay: starts at `min`, doubles, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            max,
            current: min.min(max),
        }
    }

    /// Delay to wait before the next attempt. Advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }
}

impl From<&ReconnectSettings> for Backoff {
    fn from(settings: &ReconnectSettings) -> Self {
        Self::new(settings.min_delay(), settings.max_delay())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_double_until_capped() {
        let mut backoff = Backoff::from(&ReconnectSettings::default());
        let delays: Vec<u64> = (0..8).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 80, 120, 120, 120]);
    }

    #[test]
    fn should_follow_configured_bounds() {
        let settings = ReconnectSettings {
            min_delay_secs: 1,
            max_delay_secs: 4,
        };
        let mut backoff = Backoff::from(&settings);
        let delays: Vec<u64> = (0..4).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 4]);
    }

    #[test]
    fn should_never_exceed_max_even_when_min_is_larger() {
        let mut backoff = Backoff::new(Duration::from_secs(30), Duration::from_secs(10));
        assert_eq!(backoff.next_delay(), Duration::from_secs(10));
        assert_eq!(backoff.next_delay(), Duration::from_secs(10));
    }
}
