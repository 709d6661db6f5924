use serde::Deserialize;

const DEFAULT_SESSION_MAP_LIMIT: usize = 100_000;

/// Collector settings, loaded once at process start.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CollectorConfig {
    /// Upper bound on concurrently tracked sessions in the counter cache.
    #[serde(default = "default_session_map_limit")]
    pub active_session_map_limit: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            active_session_map_limit: DEFAULT_SESSION_MAP_LIMIT,
        }
    }
}

fn default_session_map_limit() -> usize {
    DEFAULT_SESSION_MAP_LIMIT
}

#[derive(Debug, thiserror::Error)]
pub enum CollectorConfigError {
    #[error("error reading config file: `{0}`")]
    Io(#[from] std::io::Error),
    #[error("error deserializing YAML: `{0}`")]
    SerdeYaml(#[from] serde_yaml::Error),
}

impl CollectorConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    pub fn load(path: &std::path::Path) -> Result<Self, CollectorConfigError> {
        Ok(Self::from_yaml(&std::fs::read_to_string(path)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_apply() {
        let config = CollectorConfig::from_yaml("{}").unwrap();
        assert_eq!(config, CollectorConfig::default());
    }

    #[test]
    fn limit_overrides() {
        let config = CollectorConfig::from_yaml("active_session_map_limit: 16").unwrap();
        assert_eq!(config.active_session_map_limit, 16);
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "active_session_map_limit: 42").unwrap();
        let config = CollectorConfig::load(file.path()).unwrap();
        assert_eq!(config.active_session_map_limit, 42);

        assert!(CollectorConfig::load(std::path::Path::new("/no/such/file")).is_err());
    }
}
