//! Agent configuration.
//!
//! [`AbciParams`] carries everything an agent needs to join a service: its
//! own address, the participant set, timing parameters and free-form skill
//! parameters handed to behaviours. It is read from a TOML file with `ABCI_`
//! prefixed environment overrides (`ABCI_TICK_INTERVAL_MS=50`); nested keys
//! are joined with `__` (`ABCI_SKILL__SUBGRAPH_URL`).

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::app::AppOptions;
use crate::synchronized_data::{SynchronizedData, PARTICIPANTS_KEY};
use crate::Address;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Parameters of one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AbciParams {
    pub service_id: String,
    pub agent_address: Address,
    pub participants: Vec<Address>,
    /// Overrides `ceil((2n + 1) / 3)`
    pub consensus_threshold: Option<usize>,
    pub tick_interval_ms: u64,
    pub round_timeout_seconds: f64,
    pub reset_timeout_seconds: f64,
    /// Periods kept after a reset; unlimited when unset
    pub history_depth: Option<usize>,
    pub transition_log_capacity: usize,
    /// Extra setup values written into the first period
    pub setup: BTreeMap<String, Value>,
    /// Skill specific parameters exposed to behaviours
    pub skill: Map<String, Value>,
}

impl Default for AbciParams {
    fn default() -> Self {
        Self {
            service_id: "round_abci".to_string(),
            agent_address: String::new(),
            participants: Vec::new(),
            consensus_threshold: None,
            tick_interval_ms: 100,
            round_timeout_seconds: 30.0,
            reset_timeout_seconds: 60.0,
            history_depth: Some(3),
            transition_log_capacity: 256,
            setup: BTreeMap::new(),
            skill: Map::new(),
        }
    }
}

impl AbciParams {
    pub fn new(agent_address: impl Into<Address>, participants: Vec<Address>) -> Self {
        Self {
            agent_address: agent_address.into(),
            participants,
            ..Self::default()
        }
    }

    pub fn with_service_id(mut self, service_id: impl Into<String>) -> Self {
        self.service_id = service_id.into();
        self
    }

    pub fn with_consensus_threshold(mut self, threshold: usize) -> Self {
        self.consensus_threshold = Some(threshold);
        self
    }

    pub fn with_tick_interval_ms(mut self, tick_interval_ms: u64) -> Self {
        self.tick_interval_ms = tick_interval_ms;
        self
    }

    pub fn with_round_timeout_seconds(mut self, seconds: f64) -> Self {
        self.round_timeout_seconds = seconds;
        self
    }

    pub fn with_reset_timeout_seconds(mut self, seconds: f64) -> Self {
        self.reset_timeout_seconds = seconds;
        self
    }

    pub fn with_history_depth(mut self, depth: Option<usize>) -> Self {
        self.history_depth = depth;
        self
    }

    pub fn with_setup_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.setup.insert(key.into(), value);
        self
    }

    pub fn with_skill_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.skill.insert(key.into(), value);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| Err(ConfigError::Invalid(message));

        if self.agent_address.is_empty() {
            return invalid("agent_address must be set".to_string());
        }
        if self.participants.is_empty() {
            return invalid("participants must not be empty".to_string());
        }
        let mut unique = self.participants.clone();
        unique.sort();
        unique.dedup();
        if unique.len() != self.participants.len() {
            return invalid("participants contain duplicates".to_string());
        }
        if !self.participants.contains(&self.agent_address) {
            return invalid(format!("agent {} is not a participant", self.agent_address));
        }

        let n = self.participants.len();
        if let Some(threshold) = self.consensus_threshold {
            if threshold > n || threshold * 2 <= n {
                return invalid(format!(
                    "consensus_threshold {threshold} must be a strict majority of {n} participants"
                ));
            }
        }
        if self.tick_interval_ms == 0 {
            return invalid("tick_interval_ms must be positive".to_string());
        }
        for (name, seconds) in [
            ("round_timeout_seconds", self.round_timeout_seconds),
            ("reset_timeout_seconds", self.reset_timeout_seconds),
        ] {
            if !seconds.is_finite() || seconds <= 0.0 {
                return invalid(format!("{name} must be a positive number of seconds"));
            }
        }
        if self.history_depth == Some(0) {
            return invalid("history_depth must keep at least one period".to_string());
        }
        if self.setup.contains_key(PARTICIPANTS_KEY) {
            return invalid(format!("setup must not override `{PARTICIPANTS_KEY}`"));
        }
        Ok(())
    }

    /// Load from a TOML file with `ABCI_` environment overrides, then validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let params: Self = ::config::Config::builder()
            .add_source(::config::File::from(path.as_ref()))
            .add_source(
                ::config::Environment::with_prefix("ABCI")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        params.validate()?;
        Ok(params)
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let params: Self = toml::from_str(source)?;
        params.validate()?;
        Ok(params)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn round_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.round_timeout_seconds).unwrap_or(Duration::from_secs(30))
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.reset_timeout_seconds).unwrap_or(Duration::from_secs(60))
    }

    /// Setup snapshot for the first period: `setup` plus the participant set
    pub fn setup_data(&self) -> SynchronizedData {
        let mut setup = self.setup.clone();
        setup.insert(PARTICIPANTS_KEY.to_string(), json!(self.participants));
        SynchronizedData::create(setup)
    }

    pub fn app_options(&self) -> AppOptions {
        AppOptions {
            consensus_threshold: self.consensus_threshold,
            history_depth: self.history_depth,
            transition_log_capacity: self.transition_log_capacity,
        }
    }
}
