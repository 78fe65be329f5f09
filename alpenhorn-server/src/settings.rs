//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment
//! variables with the `ALPENHORN` prefix, e.g.
//! `ALPENHORN_COORDINATOR__MIX_WAIT=30`.

use std::{path::Path, time::Duration};

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use validator::{Validate, ValidationErrors};

use alpenhorn_core::{noise::NoiseDistribution, ServiceName};

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize)]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically
/// named settings field.
pub struct Settings {
    /// The service this process serves.
    pub service: ServiceName,
    #[validate]
    pub coordinator: CoordinatorSettings,
    #[validate]
    pub noise: NoiseSettings,
    pub log: LoggingSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation
    /// failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(Environment::with_prefix("alpenhorn").separator("__"))
            .build()?
            .try_deserialize()
    }
}

mod duration_secs {
    //! (De)serializes `Duration`s as whole seconds.

    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
/// The operator-configured phase waits.
///
/// The lengths are not cryptographic parameters; they bound the worst-case
/// latency of one round.
pub struct CoordinatorWaits {
    /// Wait after announcing the PKG settings, in seconds. Clients extract
    /// their per-round identity keys during this window.
    #[serde(with = "duration_secs")]
    pub pkg_wait: Duration,
    /// The onion collection window after announcing the mix settings, in
    /// seconds.
    #[serde(with = "duration_secs")]
    pub mix_wait: Duration,
    /// Wait after publishing the mailboxes before the next round, in seconds.
    #[serde(with = "duration_secs")]
    pub round_wait: Duration,
    /// Deadline for a single server RPC, in seconds.
    #[serde(with = "duration_secs")]
    pub rpc_timeout: Duration,
}

#[derive(Debug, Validate, Deserialize)]
/// The coordinator settings.
pub struct CoordinatorSettings {
    /// The phase waits.
    pub waits: CoordinatorWaits,
    /// The number of mailboxes per round; ids range over
    /// `[0, num_mailboxes]` with `0` reserved for cover.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [coordinator]
    /// num_mailboxes = 8
    /// ```
    #[validate(range(min = 1))]
    pub num_mailboxes: u32,
    /// Path of the persisted round counter.
    pub round_state_path: String,
}

#[derive(Debug, Validate, Deserialize)]
/// The mix-server noise settings.
pub struct NoiseSettings {
    /// The location parameter of the Laplace noise distribution.
    #[validate(range(min = 0.0))]
    pub mu: f64,
    /// The scale parameter of the Laplace noise distribution.
    #[validate(range(min = 0.000001))]
    pub b: f64,
}

impl NoiseSettings {
    /// The distribution these settings describe.
    pub fn distribution(&self) -> NoiseDistribution {
        NoiseDistribution {
            mu: self.mu,
            b: self.b,
        }
    }
}

#[derive(Debug, Deserialize)]
/// The logging settings.
pub struct LoggingSettings {
    /// A filter directive in `tracing_subscriber::EnvFilter` syntax, e.g.
    /// `"alpenhorn_server=debug,info"`.
    pub filter: String,
}

impl LoggingSettings {
    /// Installs the global tracing subscriber.
    pub fn init_logging(&self) {
        let filter = tracing_subscriber::EnvFilter::try_new(&self.filter)
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_toml() -> &'static str {
        r#"
        service = "addfriend"

        [coordinator]
        num_mailboxes = 8
        round_state_path = "/var/lib/alpenhorn/rounds.state"

        [coordinator.waits]
        pkg_wait = 10
        mix_wait = 30
        round_wait = 5
        rpc_timeout = 15

        [noise]
        mu = 100.0
        b = 3.0

        [log]
        filter = "alpenhorn_server=debug,info"
        "#
    }

    fn write_settings(contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!(
            "alpenhorn-settings-{}-{}.toml",
            std::process::id(),
            contents.len()
        ));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn valid_settings_load() {
        let path = write_settings(settings_toml());
        let settings = Settings::new(&path).unwrap();
        assert_eq!(settings.service, ServiceName::AddFriend);
        assert_eq!(settings.coordinator.num_mailboxes, 8);
        assert_eq!(
            settings.coordinator.waits.mix_wait,
            Duration::from_secs(30)
        );
        assert_eq!(settings.noise.distribution().mu, 100.0);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn zero_mailboxes_fail_validation() {
        let contents = settings_toml().replace("num_mailboxes = 8", "num_mailboxes = 0");
        let path = write_settings(&contents);
        assert!(matches!(
            Settings::new(&path),
            Err(SettingsError::Validation(_))
        ));
        let _ = std::fs::remove_file(&path);
    }
}
