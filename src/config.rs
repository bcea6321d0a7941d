//! Settings for the telemetry servers.
//!
//! Defaults cover a local deployment; an optional TOML file and
//! `ARMWATCH_`-prefixed environment variables override them:
//!
//! ```toml
//! [can]
//! host = "0.0.0.0"
//! port = 9877
//!
//! [arm]
//! port = 9878
//! idle_timeout_s = 1.0
//! drop_camera_when_idle = true
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use config::{Config, Environment, File};
use serde::Deserialize;

pub const DEFAULT_CAN_PORT: u16 = 9877;
pub const DEFAULT_ARM_PORT: u16 = 9878;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub can: ListenSettings,
    pub arm: ArmSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenSettings {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArmSettings {
    pub host: String,
    pub port: u16,
    /// Seconds without an arm sample before the arm counts as idle.
    /// Absent disables idle detection.
    pub idle_timeout_s: Option<f64>,
    pub drop_camera_when_idle: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            can: ListenSettings {
                host: "127.0.0.1".to_string(),
                port: DEFAULT_CAN_PORT,
            },
            arm: ArmSettings::default(),
        }
    }
}

impl Default for ListenSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_CAN_PORT,
        }
    }
}

impl Default for ArmSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_ARM_PORT,
            idle_timeout_s: None,
            drop_camera_when_idle: true,
        }
    }
}

impl Settings {
    /// Load settings from an optional file plus `ARMWATCH_` environment
    /// variables (e.g. `ARMWATCH_ARM__PORT=7000`).
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path));
        }
        let config = builder
            .add_source(Environment::with_prefix("ARMWATCH").separator("__"))
            .build()?;
        Ok(config.try_deserialize()?)
    }
}

impl ListenSettings {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl ArmSettings {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_s
            .filter(|s| *s > 0.0)
            .map(Duration::from_secs_f64)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    #[test]
    fn test_defaults_when_no_sources() {
        let settings = Settings::load(None).unwrap();
        assert_eq!(settings.can.addr(), "127.0.0.1:9877");
        assert_eq!(settings.arm.addr(), "127.0.0.1:9878");
        assert_eq!(settings.arm.idle_timeout(), None);
        assert!(settings.arm.drop_camera_when_idle);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[can]\nhost = \"0.0.0.0\"\nport = 7001\n\n[arm]\nidle_timeout_s = 2.5\n"
        )
        .unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.can.addr(), "0.0.0.0:7001");
        // Unset fields keep their defaults.
        assert_eq!(settings.arm.port, 9878);
        assert_eq!(settings.arm.idle_timeout(), Some(Duration::from_secs_f64(2.5)));
    }

    #[test]
    fn test_non_positive_idle_timeout_disables_detection() {
        let arm = ArmSettings {
            idle_timeout_s: Some(0.0),
            ..ArmSettings::default()
        };
        assert_eq!(arm.idle_timeout(), None);
    }
}
