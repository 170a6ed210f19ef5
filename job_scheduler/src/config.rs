use std::collections::HashMap;

/// Scheduler-wide defaults, mirroring the recognized configuration keys of
/// spec.md §6 (`misfire_grace_time`, `coalesce`, `timezone`). `logger` and
/// the per-alias `jobstore.<alias>.*`/`executor.<alias>.*` keys are an
/// external-resolution concern (spec.md's textual callable/class references
/// collapse to direct Rust values here) and are not represented in this
/// struct; embedders register concrete stores/executors directly through
/// `Scheduler::add_jobstore`/`add_executor` instead.
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub misfire_grace_time: i64,
    pub coalesce: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            misfire_grace_time: 1,
            coalesce: true,
        }
    }
}

impl SchedulerConfig {
    /// Builds a config from a flat dotted-key map, the compatibility
    /// adapter spec.md §9's design notes call for ("flat dotted keys are a
    /// source-ecosystem convention... offer the flat form only as a
    /// compatibility adapter"). Unrecognized keys are ignored.
    pub fn from_dotted(options: &HashMap<String, String>) -> Self {
        let mut config = Self::default();
        if let Some(value) = options.get("misfire_grace_time") {
            if let Ok(parsed) = value.parse() {
                config.misfire_grace_time = parsed;
            }
        }
        if let Some(value) = options.get("coalesce") {
            config.coalesce = matches!(value.as_str(), "true" | "1" | "yes");
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_dotted_ignores_unknown_keys() {
        let mut options = HashMap::new();
        options.insert("misfire_grace_time".to_string(), "5".to_string());
        options.insert("unused.key".to_string(), "whatever".to_string());

        let config = SchedulerConfig::from_dotted(&options);
        assert_eq!(config.misfire_grace_time, 5);
        assert!(config.coalesce);
    }
}
