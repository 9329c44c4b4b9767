use std::{io::Read, path::Path};

use anyhow::{Error, anyhow};
use dcgrind_core::WakePolicy;
use serde::{Deserialize, Serialize};

/// Settings of a single run. Every field has a default, so a config file
/// only needs to list what it changes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Which waiters become schedulable when a mutex is unlocked
    pub wake_policy: WakePolicy,

    /// Maximum number of instructions a run may commit before it is
    /// aborted
    pub max_steps: usize,

    /// End the run at the first fault of the analysed program instead of
    /// continuing past it
    pub stop_on_fault: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            wake_policy: WakePolicy::All,
            max_steps: 100_000,
            stop_on_fault: true,
        }
    }
}

impl Config {
    pub fn from_json<R: Read>(reader: R) -> Result<Self, Error> {
        serde_json::from_reader(reader).map_err(Error::from)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let file = std::fs::File::open(path.as_ref())
            .map_err(|e| anyhow!("Could not open config {}: {e}", path.as_ref().display()))?;

        Self::from_json(std::io::BufReader::new(file))
    }

    pub fn to_json(&self) -> Result<String, Error> {
        serde_json::to_string_pretty(&self).map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Error;
    use dcgrind_core::WakePolicy;

    use super::Config;

    #[test]
    fn partial_config_uses_defaults() -> Result<(), Error> {
        let config = Config::from_json(r#"{"wake_policy": "first"}"#.as_bytes())?;

        assert_eq!(config.wake_policy, WakePolicy::First);
        assert_eq!(config.max_steps, Config::default().max_steps);
        assert!(config.stop_on_fault);

        Ok(())
    }

    #[test]
    fn config_file_roundtrip() -> Result<(), Error> {
        let config = Config {
            wake_policy: WakePolicy::First,
            max_steps: 42,
            stop_on_fault: false,
        };

        let dir = tempfile::tempdir()?;
        let file = dir.path().join("config.json");
        std::fs::write(&file, config.to_json()?)?;

        assert_eq!(Config::load(&file)?, config);
        Config::load(dir.path().join("missing.json")).unwrap_err();

        Ok(())
    }
}
