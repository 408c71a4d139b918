use std::env;
use thiserror::Error;

use crate::client::ClientConfig;

/// Configuration errors with descriptive messages.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {message}")]
    InvalidValue { var: String, message: String },

    #[error("Invalid value for {var}: {message} (must be in [{min}, {max}])")]
    OutOfRange {
        var: String,
        message: String,
        min: String,
        max: String,
    },
}

/// Runtime-adjustable subset of `Config`, shared behind a single small mutex
/// so the rebalancer and health-monitor loops observe control-API changes on
/// their next tick without needing to be restarted.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeKnobs {
    pub tps_per_person: f64,
    pub target_latency_ms: u64,
    pub pre_warm_threshold: f64,
    pub power_of_two_exponent: f64,
    pub use_power_of_two: bool,
}

/// Router-wide configuration, loaded once at startup from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Comma-separated backend hosts, as given in `OLLAMA_HOSTS`.
    pub ollama_hosts: Vec<String>,
    /// Single-host alternative, from `OLLAMA_HOST`.
    pub ollama_host: Option<String>,
    /// Whether the router must refuse to start with zero reachable workers.
    pub ollama_required: bool,
    /// Model-candidate rotation list, from `LLM_MODELS`.
    pub llm_models: Vec<String>,
    /// Default/current model name, from `LLM_MODEL`.
    pub llm_model: String,

    pub tps_per_person: f64,
    pub target_latency_ms: u64,
    pub cancellation_timeout_ms: u64,
    pub pre_warm_threshold: f64,
    pub power_of_two_exponent: f64,
    pub use_power_of_two: bool,
    pub metrics_port: u16,

    pub custom_headers: Option<String>,
}

/// Helper to parse an environment variable with a default value.
fn env_parse_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(val) => val.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            var: name.into(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

/// Helper to parse a boolean environment variable.
fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

/// Splits a comma-separated list into trimmed, non-empty entries.
fn env_list(name: &str) -> Vec<String> {
    env::var(name)
        .map(|v| crate::utils::split_csv_env(&v))
        .unwrap_or_default()
}

fn clamp_cancellation_timeout(var: &str, value: u64) -> Result<u64, ConfigError> {
    const MIN: u64 = 5000;
    const MAX: u64 = 60000;
    if value < MIN || value > MAX {
        return Err(ConfigError::OutOfRange {
            var: var.into(),
            message: format!("{} is out of range", value),
            min: MIN.to_string(),
            max: MAX.to_string(),
        });
    }
    Ok(value)
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let ollama_hosts = env_list("OLLAMA_HOSTS");
        let ollama_host = env::var("OLLAMA_HOST").ok();
        let ollama_required = env_bool("OLLAMA_REQUIRED", false);

        let llm_models = env_list("LLM_MODELS");
        let llm_model = env::var("LLM_MODEL").unwrap_or_else(|_| "llama3".to_string());

        let tps_per_person: f64 = env_parse_or("TPS_PER_PERSON", 100.0)?;
        let target_latency_ms: u64 = env_parse_or("TARGET_LATENCY_MS", 3000)?;

        let cancellation_timeout_ms: u64 = env_parse_or("CANCELLATION_TIMEOUT_MS", 15000)?;
        let cancellation_timeout_ms =
            clamp_cancellation_timeout("CANCELLATION_TIMEOUT_MS", cancellation_timeout_ms)?;

        let pre_warm_threshold: f64 = env_parse_or("PRE_WARM_THRESHOLD", 2.0)?;
        let power_of_two_exponent: f64 = env_parse_or("POWER_OF_TWO_EXPONENT", 1.5)?;
        let use_power_of_two = env_bool("USE_POWER_OF_TWO", true);
        let metrics_port: u16 = env_parse_or("METRICS_PORT", 9091)?;

        let custom_headers = env::var("CUSTOM_HEADERS").ok();

        let config = Config {
            ollama_hosts,
            ollama_host,
            ollama_required,
            llm_models,
            llm_model,
            tps_per_person,
            target_latency_ms,
            cancellation_timeout_ms,
            pre_warm_threshold,
            power_of_two_exponent,
            use_power_of_two,
            metrics_port,
            custom_headers,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.tps_per_person <= 0.0 {
            return Err(ConfigError::InvalidValue {
                var: "TPS_PER_PERSON".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.target_latency_ms == 0 {
            return Err(ConfigError::InvalidValue {
                var: "TARGET_LATENCY_MS".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.pre_warm_threshold <= 0.0 {
            return Err(ConfigError::InvalidValue {
                var: "PRE_WARM_THRESHOLD".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.llm_model.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                var: "LLM_MODEL".into(),
                message: "must not be empty".into(),
            });
        }
        Ok(())
    }

    /// Every configured host/candidate, in the order a fresh `Registry`
    /// should seed them: defaults first, then `OLLAMA_HOSTS`, then
    /// `OLLAMA_HOST`. Deduplication/canonicalization happens in `registry`.
    pub fn seed_hosts(&self) -> Vec<String> {
        let mut hosts = vec!["http://localhost:11434".to_string()];
        hosts.extend(self.ollama_hosts.iter().cloned());
        if let Some(ref host) = self.ollama_host {
            hosts.push(host.clone());
        }
        hosts
    }

    /// The full model-candidate rotation list, with `llm_model` always first.
    pub fn model_candidates(&self) -> Vec<String> {
        let mut candidates = vec![self.llm_model.clone()];
        for m in &self.llm_models {
            if !candidates.contains(m) {
                candidates.push(m.clone());
            }
        }
        candidates
    }

    /// Creates a `ClientConfig` for the Backend Client's `reqwest::Client`.
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            custom_headers: self.custom_headers.clone(),
            pool_config: None,
        }
    }

    /// Creates a default Config for testing purposes.
    #[cfg(test)]
    pub fn for_testing() -> Self {
        Config {
            ollama_hosts: vec![],
            ollama_host: None,
            ollama_required: false,
            llm_models: vec![],
            llm_model: "llama3".into(),
            tps_per_person: 100.0,
            target_latency_ms: 3000,
            cancellation_timeout_ms: 15000,
            pre_warm_threshold: 2.0,
            power_of_two_exponent: 1.5,
            use_power_of_two: true,
            metrics_port: 9091,
            custom_headers: None,
        }
    }

    /// Snapshots the subset of configuration the control API can adjust at
    /// runtime (§6, Control/Observability API).
    pub fn runtime_knobs(&self) -> RuntimeKnobs {
        RuntimeKnobs {
            tps_per_person: self.tps_per_person,
            target_latency_ms: self.target_latency_ms,
            pre_warm_threshold: self.pre_warm_threshold,
            power_of_two_exponent: self.power_of_two_exponent,
            use_power_of_two: self.use_power_of_two,
        }
    }

    /// Logs the configuration summary at startup.
    pub fn log_summary(&self) {
        tracing::info!(
            ollama_hosts = ?self.seed_hosts(),
            ollama_required = self.ollama_required,
            model = %self.llm_model,
            candidates = ?self.model_candidates(),
            tps_per_person = self.tps_per_person,
            target_latency_ms = self.target_latency_ms,
            cancellation_timeout_ms = self.cancellation_timeout_ms,
            use_power_of_two = self.use_power_of_two,
            metrics_port = self.metrics_port,
            "router configuration loaded"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables,
    // since Rust runs tests in parallel within the same process.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn clear_env_vars() {
        let vars = [
            "OLLAMA_HOSTS",
            "OLLAMA_HOST",
            "OLLAMA_REQUIRED",
            "LLM_MODELS",
            "LLM_MODEL",
            "TPS_PER_PERSON",
            "TARGET_LATENCY_MS",
            "CANCELLATION_TIMEOUT_MS",
            "PRE_WARM_THRESHOLD",
            "POWER_OF_TWO_EXPONENT",
            "USE_POWER_OF_TWO",
            "METRICS_PORT",
            "CUSTOM_HEADERS",
        ];
        for var in vars {
            env::remove_var(var);
        }
    }

    #[test]
    fn defaults_with_no_env() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env_vars();

        let config = Config::from_env().unwrap();
        assert_eq!(config.llm_model, "llama3");
        assert!(!config.ollama_required);
        assert_eq!(config.tps_per_person, 100.0);
        assert_eq!(config.target_latency_ms, 3000);
        assert_eq!(config.cancellation_timeout_ms, 15000);
        assert_eq!(config.pre_warm_threshold, 2.0);
        assert_eq!(config.power_of_two_exponent, 1.5);
        assert!(config.use_power_of_two);
        assert_eq!(config.metrics_port, 9091);
        assert_eq!(config.seed_hosts(), vec!["http://localhost:11434".to_string()]);

        clear_env_vars();
    }

    #[test]
    fn ollama_hosts_parsed() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env_vars();

        env::set_var("OLLAMA_HOSTS", "host-a:11434, host-b:11434");
        env::set_var("OLLAMA_HOST", "host-c:11434");

        let config = Config::from_env().unwrap();
        assert_eq!(
            config.seed_hosts(),
            vec![
                "http://localhost:11434".to_string(),
                "host-a:11434".to_string(),
                "host-b:11434".to_string(),
                "host-c:11434".to_string(),
            ]
        );

        clear_env_vars();
    }

    #[test]
    fn ollama_required_truthy_values() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env_vars();

        for truthy in ["1", "true", "TRUE", "yes"] {
            env::set_var("OLLAMA_REQUIRED", truthy);
            let config = Config::from_env().unwrap();
            assert!(config.ollama_required, "expected {} to be truthy", truthy);
        }

        clear_env_vars();
    }

    #[test]
    fn model_candidates_default_first() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env_vars();

        env::set_var("LLM_MODEL", "mistral");
        env::set_var("LLM_MODELS", "llama3, mistral, phi3");

        let config = Config::from_env().unwrap();
        assert_eq!(
            config.model_candidates(),
            vec!["mistral".to_string(), "llama3".to_string(), "phi3".to_string()]
        );

        clear_env_vars();
    }

    #[test]
    fn cancellation_timeout_clamped_low() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env_vars();

        env::set_var("CANCELLATION_TIMEOUT_MS", "100");

        let result = Config::from_env();
        assert!(matches!(result, Err(ConfigError::OutOfRange { ref var, .. }) if var == "CANCELLATION_TIMEOUT_MS"));

        clear_env_vars();
    }

    #[test]
    fn cancellation_timeout_clamped_high() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env_vars();

        env::set_var("CANCELLATION_TIMEOUT_MS", "999999");

        let result = Config::from_env();
        assert!(matches!(result, Err(ConfigError::OutOfRange { .. })));

        clear_env_vars();
    }

    #[test]
    fn invalid_tps_per_person_returns_error() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env_vars();

        env::set_var("TPS_PER_PERSON", "0");

        let result = Config::from_env();
        assert!(matches!(result, Err(ConfigError::InvalidValue { ref var, .. }) if var == "TPS_PER_PERSON"));

        clear_env_vars();
    }

    #[test]
    fn to_client_config_maps_headers() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env_vars();

        env::set_var("CUSTOM_HEADERS", "X-Test:value");

        let config = Config::from_env().unwrap();
        let client_config = config.to_client_config();
        assert_eq!(client_config.custom_headers.unwrap(), "X-Test:value");

        clear_env_vars();
    }

    #[test]
    fn for_testing_creates_valid_config() {
        let config = Config::for_testing();
        assert_eq!(config.llm_model, "llama3");
        assert_eq!(config.metrics_port, 9091);
    }
}
