use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use panelsync_panel::{AuthScheme, Credentials, PanelConfig, PanelError, RetryPolicy};
use serde::Deserialize;

const CONFIG_PATHS: [&str; 2] = ["/etc/panelsync/panelsync.toml", "./panelsync.toml"];

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub database_url: String,
    #[serde(default)]
    pub panel: PanelSettings,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub pricing: PricingSettings,
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct PanelSettings {
    pub base_url: Option<String>,
    pub auth_type: String,
    pub api_key: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub secret_cookie: Option<String>,
    pub gateway_token: Option<String>,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub page_size: u32,
}

impl Default for PanelSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            auth_type: "api_key".to_string(),
            api_key: None,
            username: None,
            password: None,
            secret_cookie: None,
            gateway_token: None,
            connect_timeout_secs: 10,
            request_timeout_secs: 60,
            max_retries: 3,
            base_delay_ms: 1000,
            page_size: 100,
        }
    }
}

impl std::fmt::Debug for PanelSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PanelSettings")
            .field("base_url", &self.base_url)
            .field("auth_type", &self.auth_type)
            .field("credentials", &"<redacted>")
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeleteMode {
    #[default]
    Delete,
    Disable,
}

impl FromStr for DeleteMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "delete" => Ok(DeleteMode::Delete),
            "disable" => Ok(DeleteMode::Disable),
            other => Err(anyhow::anyhow!("unknown delete mode '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub default_traffic_strategy: String,
    pub trial_tag: Option<String>,
    pub paid_tag: Option<String>,
    pub username_template: String,
    pub description_template: String,
    pub delete_mode: DeleteMode,
    pub reset_devices_on_adopt: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            default_traffic_strategy: "MONTH".to_string(),
            trial_tag: None,
            paid_tag: None,
            username_template: "user_{telegram_id}".to_string(),
            description_template: "Bot user: {full_name} {username}".to_string(),
            delete_mode: DeleteMode::Delete,
            reset_devices_on_adopt: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PricingSettings {
    pub price_per_device: i64,
    pub default_device_limit: i32,
    /// 0 disables the check.
    pub max_device_limit: i32,
    /// `days:percent` pairs for the default promo group, e.g. `90:10,180:20`.
    pub base_period_discounts: String,
    pub catalog_ttl_secs: u64,
}

impl Default for PricingSettings {
    fn default() -> Self {
        Self {
            price_per_device: 5000,
            default_device_limit: 1,
            max_device_limit: 0,
            base_period_discounts: String::new(),
            catalog_ttl_secs: 300,
        }
    }
}

impl AppConfig {
    /// Explicit path, then the well-known paths, then the environment.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            tracing::info!("Loading config from {}", path.display());
            return Self::from_toml(&contents);
        }

        for path in CONFIG_PATHS {
            if let Ok(contents) = fs::read_to_string(path) {
                tracing::info!("Loading config from {}", path);
                return Self::from_toml(&contents);
            }
        }

        tracing::info!("Loading config from environment");
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("Invalid config file")
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let parsed = |key: &str| -> Result<Option<u64>> {
            var(key)
                .map(|v| v.trim().parse::<u64>())
                .transpose()
                .with_context(|| format!("{} must be a non-negative integer", key))
        };

        let mut config = AppConfig {
            database_url: var("DATABASE_URL").unwrap_or_default(),
            ..AppConfig::default()
        };

        let panel = &mut config.panel;
        panel.base_url = var("PANEL_API_URL");
        if let Some(auth_type) = var("PANEL_AUTH_TYPE") {
            panel.auth_type = auth_type;
        }
        panel.api_key = var("PANEL_API_KEY");
        panel.username = var("PANEL_USERNAME");
        panel.password = var("PANEL_PASSWORD");
        panel.secret_cookie = var("PANEL_SECRET_COOKIE");
        panel.gateway_token = var("PANEL_GATEWAY_TOKEN");

        let sync = &mut config.sync;
        if let Some(strategy) = var("DEFAULT_TRAFFIC_RESET_STRATEGY") {
            sync.default_traffic_strategy = strategy;
        }
        sync.trial_tag = var("TRIAL_USER_TAG");
        sync.paid_tag = var("PAID_SUBSCRIPTION_USER_TAG");
        if let Some(template) = var("PANEL_USERNAME_TEMPLATE") {
            sync.username_template = template;
        }
        if let Some(template) = var("PANEL_DESCRIPTION_TEMPLATE") {
            sync.description_template = template;
        }
        if let Some(mode) = var("PANEL_USER_DELETE_MODE") {
            sync.delete_mode = mode.parse()?;
        }

        let pricing = &mut config.pricing;
        if let Some(price) = parsed("PRICE_PER_DEVICE")? {
            pricing.price_per_device = i64::try_from(price).context("PRICE_PER_DEVICE is too large")?;
        }
        if let Some(limit) = parsed("DEFAULT_DEVICE_LIMIT")? {
            pricing.default_device_limit = i32::try_from(limit).context("DEFAULT_DEVICE_LIMIT is too large")?;
        }
        if let Some(limit) = parsed("MAX_DEVICES_LIMIT")? {
            pricing.max_device_limit = i32::try_from(limit).context("MAX_DEVICES_LIMIT is too large")?;
        }
        if let Some(discounts) = var("BASE_PROMO_GROUP_PERIOD_DISCOUNTS") {
            pricing.base_period_discounts = discounts;
        }
        if let Some(ttl) = parsed("CATALOG_TTL_SECS")? {
            pricing.catalog_ttl_secs = ttl;
        }

        Ok(config)
    }

    /// Validated panel connection settings.
    pub fn panel_config(&self) -> Result<PanelConfig, PanelError> {
        let panel = &self.panel;
        let credentials = Credentials {
            scheme: panel.auth_type.parse::<AuthScheme>()?,
            api_key: panel.api_key.clone(),
            username: panel.username.clone(),
            password: panel.password.clone(),
            secret_cookie: panel.secret_cookie.clone(),
            gateway_token: panel.gateway_token.clone(),
        };
        let base_url = panel.base_url.as_deref().unwrap_or_default();
        let retry = RetryPolicy::default()
            .with_max_retries(panel.max_retries)
            .with_base_delay(Duration::from_millis(panel.base_delay_ms));

        Ok(PanelConfig::new(base_url, credentials)?
            .with_timeouts(
                Duration::from_secs(panel.connect_timeout_secs),
                Duration::from_secs(panel.request_timeout_secs),
            )
            .with_retry(retry)
            .with_page_size(panel.page_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn toml_sections_fill_in_defaults() {
        let config = AppConfig::from_toml(
            r#"
            database_url = "postgres://localhost/panelsync"

            [panel]
            base_url = "https://panel.example.com"
            api_key = "k"

            [sync]
            paid_tag = "paid"
            delete_mode = "disable"
            "#,
        )
        .unwrap();

        assert_eq!(config.panel.max_retries, 3);
        assert_eq!(config.panel.request_timeout_secs, 60);
        assert_eq!(config.sync.default_traffic_strategy, "MONTH");
        assert_eq!(config.sync.delete_mode, DeleteMode::Disable);
        assert_eq!(config.pricing.price_per_device, 5000);
        assert!(config.panel_config().is_ok());
    }

    #[test]
    fn environment_fallback() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("DATABASE_URL", "postgres://db/panelsync"),
            ("PANEL_API_URL", "http://remnawave:3000"),
            ("PANEL_AUTH_TYPE", "basic"),
            ("PANEL_USERNAME", "admin"),
            ("PANEL_PASSWORD", "pw"),
            ("TRIAL_USER_TAG", "trial"),
            ("MAX_DEVICES_LIMIT", "5"),
            ("PANEL_USER_DELETE_MODE", "disable"),
        ]);
        let config = AppConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(config.database_url, "postgres://db/panelsync");
        assert_eq!(config.sync.trial_tag.as_deref(), Some("trial"));
        assert_eq!(config.pricing.max_device_limit, 5);
        assert_eq!(config.sync.delete_mode, DeleteMode::Disable);
        let panel = config.panel_config().unwrap();
        assert_eq!(panel.credentials.scheme, AuthScheme::Basic);
    }

    #[test]
    fn bad_numbers_are_rejected() {
        let result = AppConfig::from_lookup(|k| (k == "PRICE_PER_DEVICE").then(|| "cheap".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn missing_panel_url_is_a_configuration_error() {
        let config = AppConfig::from_lookup(|k| (k == "PANEL_API_KEY").then(|| "k".to_string())).unwrap();
        assert!(matches!(
            config.panel_config(),
            Err(PanelError::Configuration(_))
        ));
    }
}
