//! Instance configuration

/// Configuration for a table instance
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    /// Maintain `$clients`, `$pub$...` and related metadata topics
    pub meta_topics: bool,

    /// Name used for listener threads and logging
    pub server_name: String,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            meta_topics: true,
            server_name: "nettables".to_string(),
        }
    }
}

impl InstanceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn meta_topics(mut self, enabled: bool) -> Self {
        self.meta_topics = enabled;
        self
    }

    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = InstanceConfig::new().meta_topics(false).server_name("robot");
        assert!(!config.meta_topics);
        assert_eq!(config.server_name, "robot");
        assert!(InstanceConfig::default().meta_topics);
    }
}
