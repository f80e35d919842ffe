use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::dispatcher::Pacing;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [account]
//                    server = "10.20.25.111"
//
//   env var:         PHONE_ACCOUNT__SERVER=10.20.25.111   (double underscore = nesting)
//
//   (single underscore stays within field names: PHONE_TIMING__FORCED_HANGUP_SECS)

/// Top-level configuration, deserialized by figment.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PhoneConfig {
    #[serde(default)]
    pub account: AccountFileConfig,
    #[serde(default)]
    pub engine: EngineFileConfig,
    #[serde(default)]
    pub timing: TimingFileConfig,
}

/// Credentials (lives under `[account]` in config.toml).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccountFileConfig {
    #[serde(default = "default_server")]
    pub server: String,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default = "default_password")]
    pub password: String,
    /// Log in as soon as the console starts
    #[serde(default)]
    pub auto_login: bool,
}

impl Default for AccountFileConfig {
    fn default() -> Self {
        Self {
            server: default_server(),
            username: default_username(),
            password: default_password(),
            auto_login: false,
        }
    }
}

/// Engine executable and launch options (lives under `[engine]`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineFileConfig {
    #[serde(default = "default_engine_path")]
    pub path: String,
    #[serde(default = "default_local_port")]
    pub port: u16,
    /// Pick a fresh free port on every start instead of `port`
    #[serde(default = "default_randomize_port")]
    pub randomize_port: bool,
    #[serde(default = "default_log_level")]
    pub log_level: u8,
}

impl Default for EngineFileConfig {
    fn default() -> Self {
        Self {
            path: default_engine_path(),
            port: default_local_port(),
            randomize_port: default_randomize_port(),
            log_level: default_log_level(),
        }
    }
}

/// Controller delays and retry periods (lives under `[timing]`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimingFileConfig {
    #[serde(default = "default_dial_step_delay_ms")]
    pub dial_step_delay_ms: u64,
    #[serde(default = "default_hangup_confirm_delay_ms")]
    pub hangup_confirm_delay_ms: u64,
    #[serde(default = "default_forced_hangup_secs")]
    pub forced_hangup_secs: u64,
    #[serde(default = "default_login_confirm_secs")]
    pub login_confirm_secs: u64,
    #[serde(default = "default_status_poll_secs")]
    pub status_poll_secs: u64,
    #[serde(default = "default_call_tick_ms")]
    pub call_tick_ms: u64,
    #[serde(default = "default_unregister_settle_ms")]
    pub unregister_settle_ms: u64,
    #[serde(default = "default_quit_grace_ms")]
    pub quit_grace_ms: u64,
    #[serde(default = "default_terminate_grace_secs")]
    pub terminate_grace_secs: u64,
    /// Engine lines kept for the login re-check
    #[serde(default = "default_history_lines")]
    pub history_lines: usize,
}

impl Default for TimingFileConfig {
    fn default() -> Self {
        Self {
            dial_step_delay_ms: default_dial_step_delay_ms(),
            hangup_confirm_delay_ms: default_hangup_confirm_delay_ms(),
            forced_hangup_secs: default_forced_hangup_secs(),
            login_confirm_secs: default_login_confirm_secs(),
            status_poll_secs: default_status_poll_secs(),
            call_tick_ms: default_call_tick_ms(),
            unregister_settle_ms: default_unregister_settle_ms(),
            quit_grace_ms: default_quit_grace_ms(),
            terminate_grace_secs: default_terminate_grace_secs(),
            history_lines: default_history_lines(),
        }
    }
}

fn default_server() -> String {
    "10.20.25.111".to_string()
}
fn default_username() -> String {
    "1000".to_string()
}
fn default_password() -> String {
    "1234".to_string()
}
fn default_engine_path() -> String {
    "pjsua".to_string()
}
fn default_local_port() -> u16 {
    5070
}
fn default_randomize_port() -> bool {
    true
}
fn default_log_level() -> u8 {
    4
}
fn default_dial_step_delay_ms() -> u64 {
    100
}
fn default_hangup_confirm_delay_ms() -> u64 {
    100
}
fn default_forced_hangup_secs() -> u64 {
    5
}
fn default_login_confirm_secs() -> u64 {
    5
}
fn default_status_poll_secs() -> u64 {
    10
}
fn default_call_tick_ms() -> u64 {
    1000
}
fn default_unregister_settle_ms() -> u64 {
    1000
}
fn default_quit_grace_ms() -> u64 {
    500
}
fn default_terminate_grace_secs() -> u64 {
    2
}
fn default_history_lines() -> usize {
    200
}

/// Build a figment that layers: defaults → config.toml → PHONE_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `PHONE_ACCOUNT__AUTO_LOGIN=true`  →  `account.auto_login = true`
///   `PHONE_TIMING__FORCED_HANGUP_SECS=3`  →  `timing.forced_hangup_secs = 3`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(PhoneConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("PHONE_").split("__"))
}

// =============================================================================
// Runtime view (derived from TimingFileConfig, used by the controller)
// =============================================================================

#[derive(Clone, Debug, PartialEq)]
pub struct Timing {
    pub pacing: Pacing,
    pub forced_hangup: Duration,
    pub login_confirm: Duration,
    pub status_poll: Duration,
    pub call_tick: Duration,
    /// Wait after `ru` before quitting
    pub unregister_settle: Duration,
    /// Wait after `q` before terminating
    pub quit_grace: Duration,
    pub terminate_grace: Duration,
    pub history_lines: usize,
}

/// Floor for the self-rescheduling timers; zero would spin the control loop
const MIN_TIMER_SECS: u64 = 1;
const MIN_CALL_TICK_MS: u64 = 100;

impl Timing {
    /// Self-rescheduling timers are clamped to a floor, the rest are taken as-is
    pub fn from_file(fc: &TimingFileConfig) -> Self {
        Self {
            pacing: Pacing {
                dial_step: Duration::from_millis(fc.dial_step_delay_ms),
                hangup_confirm: Duration::from_millis(fc.hangup_confirm_delay_ms),
            },
            forced_hangup: Duration::from_secs(fc.forced_hangup_secs.max(MIN_TIMER_SECS)),
            login_confirm: Duration::from_secs(fc.login_confirm_secs.max(MIN_TIMER_SECS)),
            status_poll: Duration::from_secs(fc.status_poll_secs.max(MIN_TIMER_SECS)),
            call_tick: Duration::from_millis(fc.call_tick_ms.max(MIN_CALL_TICK_MS)),
            unregister_settle: Duration::from_millis(fc.unregister_settle_ms),
            quit_grace: Duration::from_millis(fc.quit_grace_ms),
            terminate_grace: Duration::from_secs(fc.terminate_grace_secs),
            history_lines: fc.history_lines.max(1),
        }
    }
}

impl Default for Timing {
    fn default() -> Self {
        Self::from_file(&TimingFileConfig::default())
    }
}

// =============================================================================
// Config store (get/set provider backed by <data_dir>/config.toml)
// =============================================================================

#[derive(Debug)]
pub struct ConfigStore {
    data_dir: PathBuf,
    config: PhoneConfig,
}

impl ConfigStore {
    /// Open the store in `custom_dir`, or `~/.softphone`
    pub fn open(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".softphone"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        let config = load_config(&data_dir)
            .extract()
            .with_context(|| format!("Invalid configuration in {:?}", data_dir))?;

        info!("Data directory: {}", data_dir.display());

        Ok(Self { data_dir, config })
    }

    pub fn get(&self) -> &PhoneConfig {
        &self.config
    }

    pub fn update(&mut self, f: impl FnOnce(&mut PhoneConfig)) {
        f(&mut self.config);
    }

    pub fn set_account(&mut self, server: &str, username: &str, password: &str) {
        self.update(|c| {
            c.account.server = server.to_string();
            c.account.username = username.to_string();
            c.account.password = password.to_string();
        });
    }

    pub fn set_engine_path(&mut self, path: &str) {
        self.update(|c| c.engine.path = path.to_string());
    }

    pub fn set_port(&mut self, port: u16) {
        self.update(|c| c.engine.port = port);
    }

    pub fn set_auto_login(&mut self, enabled: bool) {
        self.update(|c| c.account.auto_login = enabled);
    }

    /// Write the current values to config.toml
    pub fn save(&self) -> Result<()> {
        let text = toml::to_string_pretty(&self.config).context("Failed to serialize config")?;
        let path = self.config_toml_path();
        std::fs::write(&path, text).with_context(|| format!("Failed to write {:?}", path))?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}
