use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::time::Duration;

const DEFAULT_RESPONSE_TIMER_SECS: u64 = 60;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub smpps: SmppsConfig,
    pub log: LogConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SmppsConfig {
    /// Server identifier, echoed as system_id in bind responses.
    pub id: String,
    pub host: String,
    pub port: u16,
    /// Seconds a connection may stay unbound before it is closed. 0 disables.
    pub session_init_timer_secs: u64,
    /// Seconds between server-emitted enquire_link probes. 0 disables.
    pub enquire_link_timer_secs: u64,
    /// Seconds of silence before the server initiates an unbind. 0 disables.
    pub inactivity_timer_secs: u64,
    /// Seconds a server-originated request may wait for its response. 0 disables.
    pub response_timer_secs: u64,
    /// Upper bound on the declared command_length of inbound frames.
    pub max_pdu_size: u32,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

/// A user provisioned into the in-memory router at startup.
#[derive(Debug, Deserialize, Clone)]
pub struct AccountConfig {
    pub uid: String,
    pub username: String,
    pub password: String,
    pub max_bindings: Option<u32>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    pub level: String,
}

impl SmppsConfig {
    pub fn session_init_timeout(&self) -> Option<Duration> {
        timer(self.session_init_timer_secs)
    }

    pub fn enquire_link_interval(&self) -> Option<Duration> {
        timer(self.enquire_link_timer_secs)
    }

    pub fn inactivity_timeout(&self) -> Option<Duration> {
        timer(self.inactivity_timer_secs)
    }

    pub fn response_timeout(&self) -> Option<Duration> {
        timer(self.response_timer_secs)
    }

    /// How long a server-initiated unbind waits for unbind_resp before the
    /// connection is aborted. Never longer than the inactivity interval. A
    /// disabled timer imposes no bound of its own.
    pub fn unbind_grace(&self) -> Duration {
        match (self.response_timeout(), self.inactivity_timeout()) {
            (Some(response), Some(inactivity)) => response.min(inactivity),
            (Some(response), None) => response,
            (None, Some(inactivity)) => inactivity,
            (None, None) => Duration::from_secs(DEFAULT_RESPONSE_TIMER_SECS),
        }
    }
}

fn timer(secs: u64) -> Option<Duration> {
    if secs == 0 {
        None
    } else {
        Some(Duration::from_secs(secs))
    }
}

impl AppConfig {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            // Start with default values
            .set_default("smpps.id", "smpp_gate")?
            .set_default("smpps.host", "0.0.0.0")?
            .set_default("smpps.port", 2775)?
            .set_default("smpps.session_init_timer_secs", 30)?
            .set_default("smpps.enquire_link_timer_secs", 30)?
            .set_default("smpps.inactivity_timer_secs", 300)?
            .set_default("smpps.response_timer_secs", 60)?
            .set_default("smpps.max_pdu_size", 4096)?
            .set_default("log.level", "info")?
            // Add configuration file
            .add_source(File::with_name("config").required(false))
            .add_source(File::with_name(&format!("config.{}", run_mode)).required(false))
            // Add environment variables (prefix with SMPP_GATE__)
            .add_source(Environment::with_prefix("SMPP_GATE").separator("__"))
            // Allow explicit overrides for documented env vars
            .set_override_option(
                "smpps.port",
                env::var("SMPP_PORT")
                    .ok()
                    .map(|v| v.parse::<u16>().unwrap_or(2775)),
            )?
            .set_override_option("smpps.id", env::var("SMPP_ID").ok())?
            .set_override_option("log.level", env::var("LOG_LEVEL").ok())?
            .build()?;

        s.try_deserialize()
    }
}
