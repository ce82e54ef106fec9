//! Configuration resolution for the prerender runtime.
//!
//! Options are resolved from defaults, an optional TOML file, environment
//! variables, and caller-provided params, in that order (last write wins).
//! External option names are case-sensitive and match the deployment
//! surface (`ORG`, `SITE`, `JOURNALLING_URL`, ...).

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;

use crate::auth::admin_token::validate_admin_token;
use crate::queue::QueueConfig;
use crate::ratelimit::RateLimiterConfig;
use crate::types::RuntimeError;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration: {key}")]
    MissingRequired { key: String },

    #[error("invalid configuration value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("IO error reading config file: {message}")]
    IoError { message: String },

    #[error("configuration parsing error: {message}")]
    ParseError { message: String },
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub org: String,
    pub site: String,
    pub content_url: String,
    pub store_url: String,
    pub products_template: Option<String>,
    pub product_page_url_format: String,
    /// Empty means "default locale" (no locale path segment).
    pub locales: Vec<String>,
    pub admin_auth_token: Option<String>,
    pub admin_host: String,
    pub client_id: String,
    pub client_secret: String,
    pub ims_org_id: String,
    pub ims_endpoint: String,
    pub journalling_url: String,
    pub config_name: Option<String>,
    pub config_sheet: Option<String>,
    /// Direct catalog endpoint, used when no remote config document is
    /// configured.
    pub commerce_endpoint: Option<String>,
    pub log_level: String,
    pub log_ingestor_endpoint: Option<String>,
    pub rate_limit: RateLimiterConfig,
    pub queue: QueueConfig,
    pub queue_enabled: bool,
    pub journal_limit: usize,
    pub max_batches: usize,
    pub function_deadline: Duration,
}

impl RuntimeConfig {
    /// Build a configuration from a flat option map.
    pub fn from_options(options: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let get = |key: &str| options.get(key).map(|s| s.trim().to_string()).filter(|s| !s.is_empty());

        let org = get("ORG").unwrap_or_default();
        let site = get("SITE").unwrap_or_default();
        let content_url = match get("CONTENT_URL") {
            Some(url) => url,
            None if !org.is_empty() && !site.is_empty() => {
                format!("https://main--{site}--{org}.aem.live")
            }
            None => String::new(),
        };
        let store_url = get("STORE_URL").unwrap_or_else(|| content_url.clone());

        let locales = match get("LOCALES") {
            Some(raw) => raw
                .split(',')
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty())
                .collect(),
            None => Vec::new(),
        };

        let rate_limit = RateLimiterConfig {
            max_tokens: parse_or(options, "MAX_TOKENS", 20)?,
            refill_rate: parse_or(options, "REFILL_RATE", 20)?,
            acquire_timeout: Duration::from_secs(parse_or(options, "ACQUIRE_TIMEOUT", 30u64)?),
        };

        let queue = QueueConfig {
            max_queue_size: parse_or(options, "MAX_QUEUE_SIZE", 1000usize)?,
            batch_size: parse_or(options, "BATCH_SIZE", 5usize)?,
            max_retries: parse_or(options, "MAX_RETRIES", 3u32)?,
            dedup_window: Duration::from_millis(parse_or(options, "DEDUP_WINDOW", 300_000u64)?),
            queue_ttl: Duration::from_secs(parse_or(options, "QUEUE_TTL", 3600u64)?),
        };

        Ok(Self {
            org,
            site,
            content_url,
            store_url,
            products_template: get("PRODUCTS_TEMPLATE"),
            product_page_url_format: get("PRODUCT_PAGE_URL_FORMAT")
                .unwrap_or_else(|| "/products/{urlKey}/{sku}".to_string()),
            locales,
            admin_auth_token: get("AEM_ADMIN_API_AUTH_TOKEN"),
            admin_host: get("ADMIN_HOST").unwrap_or_else(|| "admin.hlx.page".to_string()),
            client_id: get("CLIENT_ID").unwrap_or_default(),
            client_secret: get("CLIENT_SECRET").unwrap_or_default(),
            ims_org_id: get("IMS_ORG_ID").unwrap_or_default(),
            ims_endpoint: get("IMS_ENDPOINT")
                .unwrap_or_else(|| "https://ims-na1.adobelogin.com/ims/token/v3".to_string()),
            journalling_url: get("JOURNALLING_URL").unwrap_or_default(),
            config_name: get("CONFIG_NAME"),
            config_sheet: get("CONFIG_SHEET"),
            commerce_endpoint: get("COMMERCE_ENDPOINT"),
            log_level: get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            log_ingestor_endpoint: get("LOG_INGESTOR_ENDPOINT"),
            rate_limit,
            queue,
            queue_enabled: parse_bool_or(options, "QUEUE_ENABLED", true)?,
            journal_limit: parse_or(options, "JOURNAL_LIMIT", 50usize)?,
            max_batches: parse_or(options, "MAX_BATCHES", 5usize)?,
            function_deadline: Duration::from_secs(parse_or(options, "FUNCTION_DEADLINE", 3600u64)?),
        })
    }

    /// Resolve from an optional TOML file, the process environment, and
    /// caller params, last write wins.
    pub fn resolve(
        file: Option<&Path>,
        params: &HashMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let mut options = HashMap::new();
        if let Some(path) = file {
            options.extend(load_toml_options(path)?);
        }
        options.extend(std::env::vars());
        options.extend(params.clone());
        Self::from_options(&options)
    }

    /// Check the hard preconditions the orchestrator fails fast on.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.journalling_url.is_empty() {
            return Err(RuntimeError::Validation(
                "JOURNALLING_URL is required".to_string(),
            ));
        }
        url::Url::parse(&self.journalling_url)
            .map_err(|e| RuntimeError::Validation(format!("JOURNALLING_URL is not a URL: {e}")))?;

        if self.content_url.is_empty() {
            return Err(RuntimeError::Validation(
                "ORG and SITE (or CONTENT_URL) are required".to_string(),
            ));
        }

        if !self.product_page_url_format.contains("{sku}")
            && !self.product_page_url_format.contains("{urlKey}")
        {
            return Err(RuntimeError::Validation(
                "PRODUCT_PAGE_URL_FORMAT must contain a {sku} or {urlKey} token".to_string(),
            ));
        }

        if self.config_name.is_none() && self.commerce_endpoint.is_none() {
            return Err(RuntimeError::Validation(
                "either CONFIG_NAME or COMMERCE_ENDPOINT is required".to_string(),
            ));
        }

        if let Some(token) = &self.admin_auth_token {
            validate_admin_token(token)?;
        }

        Ok(())
    }

    /// Locales to process; an empty configuration means one pass with the
    /// default locale.
    pub fn locales_or_default(&self) -> Vec<Option<String>> {
        if self.locales.is_empty() {
            vec![None]
        } else {
            self.locales.iter().cloned().map(Some).collect()
        }
    }
}

fn load_toml_options(path: &Path) -> Result<HashMap<String, String>, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
        message: format!("{}: {e}", path.display()),
    })?;
    let table: toml::Table = text.parse().map_err(|e| ConfigError::ParseError {
        message: format!("{}: {e}", path.display()),
    })?;
    let mut options = HashMap::new();
    for (key, value) in table {
        let value = match value {
            toml::Value::String(s) => s,
            toml::Value::Integer(i) => i.to_string(),
            toml::Value::Float(f) => f.to_string(),
            toml::Value::Boolean(b) => b.to_string(),
            other => {
                return Err(ConfigError::InvalidValue {
                    key,
                    reason: format!("unsupported TOML value: {other}"),
                })
            }
        };
        options.insert(key, value);
    }
    Ok(options)
}

fn parse_or<T: std::str::FromStr>(
    options: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match options.get(key).map(|s| s.trim()).filter(|s| !s.is_empty()) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn parse_bool_or(
    options: &HashMap<String, String>,
    key: &str,
    default: bool,
) -> Result<bool, ConfigError> {
    match options.get(key).map(|s| s.trim().to_ascii_lowercase()) {
        Some(raw) if raw.is_empty() => Ok(default),
        Some(raw) => match raw.as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            other => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                reason: format!("expected a boolean, got {other:?}"),
            }),
        },
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn content_url_falls_back_to_org_site() {
        let config = RuntimeConfig::from_options(&options(&[
            ("ORG", "acme"),
            ("SITE", "store"),
            ("JOURNALLING_URL", "https://journal.example/events"),
            ("COMMERCE_ENDPOINT", "https://catalog.example/graphql"),
        ]))
        .unwrap();
        assert_eq!(config.content_url, "https://main--store--acme.aem.live");
        assert_eq!(config.store_url, config.content_url);
        config.validate().unwrap();
    }

    #[test]
    fn locales_parse_from_comma_separated_string() {
        let config = RuntimeConfig::from_options(&options(&[("LOCALES", "en-us, fr-fr ,")])).unwrap();
        assert_eq!(config.locales, vec!["en-us", "fr-fr"]);
        assert_eq!(
            config.locales_or_default(),
            vec![Some("en-us".to_string()), Some("fr-fr".to_string())]
        );

        let empty = RuntimeConfig::from_options(&HashMap::new()).unwrap();
        assert_eq!(empty.locales_or_default(), vec![None]);
    }

    #[test]
    fn knob_defaults_match_deployment_surface() {
        let config = RuntimeConfig::from_options(&HashMap::new()).unwrap();
        assert_eq!(config.rate_limit.max_tokens, 20);
        assert_eq!(config.rate_limit.refill_rate, 20);
        assert_eq!(config.queue.max_queue_size, 1000);
        assert_eq!(config.queue.batch_size, 5);
        assert_eq!(config.queue.max_retries, 3);
        assert_eq!(config.queue.dedup_window, Duration::from_millis(300_000));
        assert_eq!(config.queue.queue_ttl, Duration::from_secs(3600));
        assert_eq!(config.journal_limit, 50);
        assert_eq!(config.max_batches, 5);
        assert!(config.queue_enabled);
    }

    #[test]
    fn missing_journal_url_fails_validation() {
        let config = RuntimeConfig::from_options(&options(&[
            ("ORG", "acme"),
            ("SITE", "store"),
            ("COMMERCE_ENDPOINT", "https://catalog.example/graphql"),
        ]))
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(RuntimeError::Validation(_))
        ));
    }

    #[test]
    fn path_format_without_tokens_fails_validation() {
        let config = RuntimeConfig::from_options(&options(&[
            ("ORG", "acme"),
            ("SITE", "store"),
            ("JOURNALLING_URL", "https://journal.example/events"),
            ("COMMERCE_ENDPOINT", "https://catalog.example/graphql"),
            ("PRODUCT_PAGE_URL_FORMAT", "/products/static"),
        ]))
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(RuntimeError::Validation(_))
        ));
    }

    #[test]
    fn bad_numeric_knob_is_invalid_value() {
        let result = RuntimeConfig::from_options(&options(&[("MAX_TOKENS", "plenty")]));
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn toml_file_options_are_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prerender.toml");
        std::fs::write(
            &path,
            "ORG = \"acme\"\nSITE = \"store\"\nMAX_TOKENS = 5\nQUEUE_ENABLED = false\n",
        )
        .unwrap();
        let config = RuntimeConfig::resolve(Some(&path), &HashMap::new()).unwrap();
        assert_eq!(config.org, "acme");
        assert_eq!(config.rate_limit.max_tokens, 5);
        assert!(!config.queue_enabled);
    }
}
