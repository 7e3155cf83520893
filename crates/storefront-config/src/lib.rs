use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    pub store: Store,
    pub transport: Transport,
    pub completion: Completion,
    #[serde(default)]
    pub gate: Gate,
    #[serde(default)]
    pub plans: Plans,
    #[serde(default)]
    pub journal: Journal,
    #[serde(default)]
    pub shop: Shop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data_dir: Option<String>,
    #[serde(default)]
    pub sqlite_path: Option<String>,
}

impl Default for Store {
    fn default() -> Self {
        Self {
            kind: "memory".to_string(),
            data_dir: None,
            sqlite_path: None,
        }
    }
}

/// How outbound chat messages leave the process. `recording` keeps them in memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transport {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_bot_token_env")]
    pub bot_token_env: String,
    #[serde(default = "default_transport_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for Transport {
    fn default() -> Self {
        Self {
            kind: "recording".to_string(),
            api_base: default_api_base(),
            bot_token_env: default_bot_token_env(),
            timeout_ms: default_transport_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    pub endpoint: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    pub operator_model: String,
    pub vision_model: String,
    #[serde(default = "default_completion_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_context_max_chars")]
    pub context_max_chars: usize,
}

impl Default for Completion {
    fn default() -> Self {
        Self {
            endpoint: "https://api.groq.com/openai/v1/chat/completions".to_string(),
            api_key_env: default_api_key_env(),
            operator_model: "llama-3.3-70b-versatile".to_string(),
            vision_model: "meta-llama/llama-4-scout-17b-16e-instruct".to_string(),
            timeout_ms: default_completion_timeout_ms(),
            context_max_chars: default_context_max_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gate {
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

impl Default for Gate {
    fn default() -> Self {
        Self {
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plans {
    #[serde(default = "default_plan_ttl_ms")]
    pub ttl_ms: u64,
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

impl Default for Plans {
    fn default() -> Self {
        Self {
            ttl_ms: default_plan_ttl_ms(),
            max_pending: default_max_pending(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Journal {
    #[serde(default = "default_journal_max_entries")]
    pub max_entries: usize,
}

impl Default for Journal {
    fn default() -> Self {
        Self {
            max_entries: default_journal_max_entries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shop {
    #[serde(default = "default_shop_name")]
    pub name: String,
    #[serde(default = "default_currency")]
    pub currency: String,
    /// Seeds the settings document when it carries no password yet.
    #[serde(default = "default_admin_password")]
    pub default_admin_password: String,
}

impl Default for Shop {
    fn default() -> Self {
        Self {
            name: default_shop_name(),
            currency: default_currency(),
            default_admin_password: default_admin_password(),
        }
    }
}

fn default_api_base() -> String {
    "https://api.telegram.org".to_string()
}

fn default_bot_token_env() -> String {
    "STOREFRONT_BOT_TOKEN".to_string()
}

fn default_transport_timeout_ms() -> u64 {
    10_000
}

fn default_api_key_env() -> String {
    "STOREFRONT_COMPLETION_API_KEY".to_string()
}

fn default_completion_timeout_ms() -> u64 {
    60_000
}

fn default_context_max_chars() -> usize {
    35_000
}

fn default_cooldown_ms() -> u64 {
    3_000
}

fn default_plan_ttl_ms() -> u64 {
    15 * 60 * 1000
}

fn default_max_pending() -> usize {
    256
}

fn default_journal_max_entries() -> usize {
    5_000
}

fn default_shop_name() -> String {
    "Storefront".to_string()
}

fn default_currency() -> String {
    "TMT".to_string()
}

fn default_admin_password() -> String {
    "1234".to_string()
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

pub fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    match cfg.store.kind.as_str() {
        "memory" => {
            if cfg.store.sqlite_path.is_some() || cfg.store.data_dir.is_some() {
                return Err(ConfigError::UnsupportedConfig(
                    "store.sqlite_path and store.data_dir are not supported when store.type=memory"
                        .to_string(),
                ));
            }
        }
        "json" => {
            if is_blank(cfg.store.data_dir.as_deref()) {
                return Err(ConfigError::UnsupportedConfig(
                    "store.data_dir is required when store.type=json".to_string(),
                ));
            }
        }
        "sqlite" => {
            if is_blank(cfg.store.sqlite_path.as_deref()) {
                return Err(ConfigError::UnsupportedConfig(
                    "store.sqlite_path is required when store.type=sqlite".to_string(),
                ));
            }
        }
        other => {
            return Err(ConfigError::UnsupportedConfig(format!(
                "store.type={other} is not implemented; supported: memory, json, sqlite"
            )));
        }
    }
    if cfg.transport.kind != "telegram" && cfg.transport.kind != "recording" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "transport.type={} is not implemented; supported: telegram, recording",
            cfg.transport.kind
        )));
    }
    if cfg.transport.timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "transport.timeout_ms must be >= 1".to_string(),
        ));
    }
    if cfg.completion.timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "completion.timeout_ms must be >= 1".to_string(),
        ));
    }
    if cfg.completion.context_max_chars == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "completion.context_max_chars must be >= 1".to_string(),
        ));
    }
    if cfg.plans.ttl_ms == 0 || cfg.plans.max_pending == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "plans.ttl_ms and plans.max_pending must be >= 1".to_string(),
        ));
    }
    if cfg.journal.max_entries == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "journal.max_entries must be >= 1".to_string(),
        ));
    }
    if cfg.shop.default_admin_password.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "shop.default_admin_password must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn is_blank(value: Option<&str>) -> bool {
    value.map(|v| v.trim().is_empty()).unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn write_temp_config(contents: &str) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("storefront-config-test-{nanos}.yaml"));
        std::fs::write(&path, contents).expect("write temp config");
        path.to_string_lossy().to_string()
    }

    fn base_yaml() -> String {
        r#"
server:
  listen_addr: "127.0.0.1:0"

store:
  type: "memory"

transport:
  type: "recording"

completion:
  endpoint: "http://127.0.0.1:9/v1/chat/completions"
  operator_model: "operator-test"
  vision_model: "vision-test"
"#
        .to_string()
    }

    #[test]
    fn fills_defaults_for_omitted_sections() {
        let path = write_temp_config(&base_yaml());
        let cfg = load_and_validate(&path).expect("minimal config should be accepted");
        assert_eq!(cfg.gate.cooldown_ms, 3_000);
        assert_eq!(cfg.journal.max_entries, 5_000);
        assert_eq!(cfg.completion.context_max_chars, 35_000);
        assert_eq!(cfg.plans.ttl_ms, 15 * 60 * 1000);
        assert_eq!(cfg.shop.currency, "TMT");
        assert_eq!(cfg.transport.bot_token_env, "STOREFRONT_BOT_TOKEN");
    }

    #[test]
    fn supports_json_store_with_data_dir() {
        let path = write_temp_config(&base_yaml().replace(
            "type: \"memory\"",
            "type: \"json\"\n  data_dir: \"./data\"",
        ));
        let cfg = load_and_validate(&path).expect("json config should be accepted");
        assert_eq!(cfg.store.kind, "json");
        assert_eq!(cfg.store.data_dir.as_deref(), Some("./data"));
    }

    #[test]
    fn supports_sqlite_store_type_with_path() {
        let path = write_temp_config(&base_yaml().replace(
            "type: \"memory\"",
            "type: \"sqlite\"\n  sqlite_path: \"./shop.db\"",
        ));
        let cfg = load_and_validate(&path).expect("sqlite config should be accepted");
        assert_eq!(cfg.store.kind, "sqlite");
        assert_eq!(cfg.store.sqlite_path.as_deref(), Some("./shop.db"));
    }

    #[test]
    fn rejects_sqlite_without_path() {
        let path = write_temp_config(&base_yaml().replace("type: \"memory\"", "type: \"sqlite\""));
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }

    #[test]
    fn rejects_unknown_transport() {
        let path = write_temp_config(&base_yaml().replace("type: \"recording\"", "type: \"irc\""));
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }

    #[test]
    fn rejects_zero_journal_cap_at_runtime() {
        let mut cfg = Config::default();
        cfg.journal.max_entries = 0;
        let err = validate_runtime_support(&cfg).expect_err("zero cap must be refused");
        assert!(matches!(err, ConfigError::UnsupportedConfig(_)));
    }

    #[test]
    fn default_config_passes_runtime_checks() {
        validate_runtime_support(&Config::default()).expect("defaults are runnable");
    }
}
