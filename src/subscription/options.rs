//! Subscriber delivery options

use std::time::Duration;

/// Delivery options for a subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberOptions {
    /// Minimum spacing between value deliveries per topic (zero = immediate)
    pub periodic: Duration,

    /// Skip values equal to the last one delivered
    pub changes_only: bool,

    /// Deliver the stored value of every matched topic on subscribe
    pub send_all: bool,

    /// Deliver announcements only, never values
    pub topics_only: bool,

    /// Treat every pattern as a prefix
    pub prefix_match: bool,
}

impl Default for SubscriberOptions {
    fn default() -> Self {
        Self {
            periodic: Duration::ZERO,
            changes_only: false,
            send_all: true,
            topics_only: false,
            prefix_match: false,
        }
    }
}

impl SubscriberOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rate-limit value deliveries
    pub fn periodic(mut self, period: Duration) -> Self {
        self.periodic = period;
        self
    }

    pub fn changes_only(mut self, enabled: bool) -> Self {
        self.changes_only = enabled;
        self
    }

    pub fn send_all(mut self, enabled: bool) -> Self {
        self.send_all = enabled;
        self
    }

    pub fn topics_only(mut self, enabled: bool) -> Self {
        self.topics_only = enabled;
        self
    }

    pub fn prefix_match(mut self, enabled: bool) -> Self {
        self.prefix_match = enabled;
        self
    }

    /// Whether value deliveries are coalesced
    pub fn is_rate_limited(&self) -> bool {
        !self.periodic.is_zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = SubscriberOptions::default();
        assert!(!options.is_rate_limited());
        assert!(options.send_all);
        assert!(!options.topics_only);
        assert!(!options.changes_only);
        assert!(!options.prefix_match);
    }

    #[test]
    fn test_builder_chaining() {
        let options = SubscriberOptions::new()
            .periodic(Duration::from_millis(100))
            .changes_only(true)
            .send_all(false)
            .topics_only(true)
            .prefix_match(true);

        assert!(options.is_rate_limited());
        assert_eq!(options.periodic, Duration::from_millis(100));
        assert!(options.changes_only);
        assert!(!options.send_all);
        assert!(options.topics_only);
        assert!(options.prefix_match);
    }
}
