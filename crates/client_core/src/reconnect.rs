use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectSettings {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            max_attempts: None,
        }
    }
}

/// Exponential backoff between reconnect attempts.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    settings: ReconnectSettings,
    current_delay: Duration,
    attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(settings: ReconnectSettings) -> Self {
        Self {
            current_delay: settings.base_delay,
            settings,
            attempts: 0,
        }
    }

    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Called after a successful connect.
    pub fn reset(&mut self) {
        self.current_delay = self.settings.base_delay;
        self.attempts = 0;
    }

    /// Delay to wait before the next attempt, or `None` once the configured
    /// attempt budget is spent. Doubles the following delay up to the cap.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max_attempts) = self.settings.max_attempts {
            if self.attempts >= max_attempts {
                return None;
            }
        }
        let delay = self.current_delay;
        self.attempts += 1;
        self.current_delay = self
            .current_delay
            .saturating_mul(2)
            .min(self.settings.max_delay);
        Some(delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(ReconnectSettings::default())
    }
}

#[cfg(test)]
#[path = "tests/reconnect_tests.rs"]
mod tests;
