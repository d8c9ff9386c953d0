use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{BankConfig, ConfigError};
use crate::modules::proxy::ProxyGroup;

/// API keys for each supported solving service. Blank keys disable the
/// matching provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptchaSettings {
    pub two_captcha: Option<String>,
    pub anti_captcha: Option<String>,
    pub cap_monster: Option<String>,
}

impl CaptchaSettings {
    pub fn configured_keys(&self) -> usize {
        [&self.two_captcha, &self.anti_captcha, &self.cap_monster]
            .into_iter()
            .filter(|key| key.as_deref().is_some_and(|key| !key.trim().is_empty()))
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestSettings {
    pub workers: usize,
    pub max_outstanding: usize,
    /// Id of the proxy group handed to rotating providers.
    pub proxy_group: Option<String>,
}

impl Default for HarvestSettings {
    fn default() -> Self {
        Self {
            workers: 1,
            max_outstanding: 5,
            proxy_group: None,
        }
    }
}

/// Optional overrides of the bank's intervals, in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingSettings {
    pub token_ttl_ms: Option<u64>,
    pub harvest_interval_ms: Option<u64>,
    pub sweep_interval_ms: Option<u64>,
    pub empty_poll_backoff_ms: Option<u64>,
    pub max_empty_polls: Option<u32>,
}

impl TimingSettings {
    /// Overlay the configured values on `config`.
    pub fn apply(&self, mut config: BankConfig) -> BankConfig {
        let ms = Duration::from_millis;
        if let Some(value) = self.token_ttl_ms {
            config.token_ttl = ms(value);
        }
        if let Some(value) = self.harvest_interval_ms {
            config.harvest_interval = ms(value);
        }
        if let Some(value) = self.sweep_interval_ms {
            config.sweep_interval = ms(value);
        }
        if let Some(value) = self.empty_poll_backoff_ms {
            config.empty_poll_backoff = ms(value);
        }
        if let Some(value) = self.max_empty_polls {
            config.max_empty_polls = value;
        }
        config
    }
}

/// Everything the bank consumes from the outside world.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub captcha: CaptchaSettings,
    pub proxy_groups: Vec<ProxyGroup>,
    pub harvest: HarvestSettings,
    pub timing: Option<TimingSettings>,
}

impl Settings {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let settings: Settings = serde_json::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        log::debug!("loading settings from {}", path.display());
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.harvest.workers == 0 {
            return Err(ConfigError::Invalid("harvest.workers must be at least 1".into()));
        }
        if self.harvest.max_outstanding == 0 {
            return Err(ConfigError::Invalid(
                "harvest.max_outstanding must be at least 1".into(),
            ));
        }
        if let Some(id) = &self.harvest.proxy_group {
            if self.proxy_group(id).is_none() {
                return Err(ConfigError::UnknownProxyGroup(id.clone()));
            }
        }
        if let Some(timing) = &self.timing {
            if timing.harvest_interval_ms == Some(0) || timing.sweep_interval_ms == Some(0) {
                return Err(ConfigError::Invalid(
                    "harvest and sweep intervals must be non-zero".into(),
                ));
            }
        }
        for group in &self.proxy_groups {
            if let Some(proxy) = group.proxies.iter().find(|proxy| proxy.host.trim().is_empty()) {
                return Err(ConfigError::Invalid(format!(
                    "proxy group {} has an entry without a host (port {})",
                    group.id, proxy.port
                )));
            }
        }
        Ok(())
    }

    pub fn proxy_group(&self, id: &str) -> Option<&ProxyGroup> {
        self.proxy_groups.iter().find(|group| group.id == id)
    }

    /// The group named by `harvest.proxy_group`, if any.
    pub fn harvest_proxy_group(&self) -> Option<&ProxyGroup> {
        self.harvest
            .proxy_group
            .as_deref()
            .and_then(|id| self.proxy_group(id))
    }

    pub fn bank_config(&self) -> BankConfig {
        match &self.timing {
            Some(timing) => timing.apply(BankConfig::default()),
            None => BankConfig::default(),
        }
    }
}
