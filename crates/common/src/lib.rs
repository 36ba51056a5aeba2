//! Shared utilities for Tusk Drift components

pub mod ci;
pub mod config;
pub mod paths;

pub use ci::CiMetadata;
pub use config::{DriftConfig, MatchingConfig, MockConfig, ServiceConfig, TimeoutConfig};

use std::collections::HashMap;

/// Environment variable the SDK inspects to decide it is replaying.
pub const DRIFT_MODE_ENV: &str = "DRIFT_MODE";
/// Value of [`DRIFT_MODE_ENV`] during replay runs.
pub const DRIFT_MODE_REPLAY: &str = "REPLAY";
/// Host the SDK should dial for mock lookups.
pub const MOCK_HOST_ENV: &str = "TUSK_MOCK_HOST";
/// Port the SDK should dial for mock lookups.
pub const MOCK_PORT_ENV: &str = "TUSK_MOCK_PORT";

/// Merge env-var maps for a service launch. Later maps win on key conflicts.
pub fn merge_env(layers: &[&HashMap<String, String>]) -> HashMap<String, String> {
    let mut merged = HashMap::new();
    for layer in layers {
        for (key, value) in layer.iter() {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_env_later_layers_win() {
        let base: HashMap<String, String> =
            [("REGION".to_string(), "us".to_string())].into_iter().collect();
        let group: HashMap<String, String> =
            [("REGION".to_string(), "eu".to_string())].into_iter().collect();

        let merged = merge_env(&[&base, &group]);
        assert_eq!(merged.get("REGION").map(String::as_str), Some("eu"));
    }
}
