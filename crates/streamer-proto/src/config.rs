use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use super::platform;
use super::protocol::Action;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub volume: VolumeConfig,
    #[serde(default)]
    pub restart: RestartConfig,
    #[serde(default)]
    pub selection: SelectionConfig,
    #[serde(default)]
    pub source: SourceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_http_address")]
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// `host:port` of the broker.
    #[serde(default = "default_mqtt_address")]
    pub address: String,
    #[serde(default = "default_mqtt_credential")]
    pub user: String,
    #[serde(default = "default_mqtt_credential")]
    pub password: String,
    #[serde(default = "default_mqtt_topic")]
    pub topic: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Payload token → action. Tokens not listed here are ignored.
    #[serde(default = "default_actions")]
    pub actions: BTreeMap<String, Action>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeConfig {
    #[serde(default = "default_volume_step")]
    pub step: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartConfig {
    /// Hours between full teardown/rebuild cycles.
    #[serde(default = "default_interval_hours")]
    pub interval_hours: u32,
    #[serde(default = "default_recovery_delay_secs")]
    pub recovery_delay_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionConfig {
    /// Relative paths are resolved against the executable's directory.
    #[serde(default = "default_selection_file")]
    pub file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_response_timeout_secs")]
    pub response_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            address: default_http_address(),
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            address: default_mqtt_address(),
            user: default_mqtt_credential(),
            password: default_mqtt_credential(),
            topic: default_mqtt_topic(),
            client_id: default_client_id(),
            keep_alive_secs: default_keep_alive_secs(),
            actions: default_actions(),
        }
    }
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            step: default_volume_step(),
        }
    }
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            interval_hours: default_interval_hours(),
            recovery_delay_secs: default_recovery_delay_secs(),
        }
    }
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            file: default_selection_file(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            response_timeout_secs: default_response_timeout_secs(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_http_address() -> String {
    "0.0.0.0:7070".to_string()
}

fn default_mqtt_address() -> String {
    "localhost:1883".to_string()
}

fn default_mqtt_credential() -> String {
    "admin".to_string()
}

fn default_mqtt_topic() -> String {
    "zigbee2mqtt/0x00124b000cc8d641/action".to_string()
}

fn default_client_id() -> String {
    "radio-streamer".to_string()
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_actions() -> BTreeMap<String, Action> {
    [
        ("button_1_click", Action::Power),
        ("button_2_click", Action::NextStream),
        ("button_2_hold", Action::PrevStream),
        ("button_3_click", Action::VolumeDown),
        ("button_4_click", Action::VolumeUp),
    ]
    .into_iter()
    .map(|(token, action)| (token.to_string(), action))
    .collect()
}

fn default_volume_step() -> f64 {
    0.1
}

fn default_interval_hours() -> u32 {
    24
}

fn default_recovery_delay_secs() -> f64 {
    1.0
}

fn default_selection_file() -> PathBuf {
    PathBuf::from("config.yaml")
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_response_timeout_secs() -> u64 {
    15
}

impl MqttConfig {
    /// Splits `address` into host and port, defaulting the port to 1883.
    pub fn host_port(&self) -> anyhow::Result<(String, u16)> {
        match self.address.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse()
                    .map_err(|e| anyhow::anyhow!("invalid MQTT port in {:?}: {}", self.address, e))?;
                Ok((host.to_string(), port))
            }
            None => Ok((self.address.clone(), 1883)),
        }
    }
}

impl RestartConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.interval_hours.max(1)) * 3600)
    }

    pub fn recovery_delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.recovery_delay_secs).unwrap_or(Duration::ZERO)
    }
}

impl SelectionConfig {
    pub fn resolved_path(&self) -> PathBuf {
        platform::resolve_beside_exe(&self.file)
    }
}

impl SourceConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        let mut config = if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            config
        } else {
            let content = std::fs::read_to_string(&config_path)?;
            toml::from_str(&content)?
        };

        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }

    /// Applies the deployment's environment overrides on top of the file.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(address) = lookup("HTTP_SERVER_ADDRESS") {
            // ":7070" means every interface
            self.http.address = if address.starts_with(':') {
                format!("0.0.0.0{address}")
            } else {
                address
            };
        }
        if let Some(address) = lookup("MQTT_SERVER_ADDRESS") {
            self.mqtt.address = address;
        }
        if let Some(user) = lookup("MQTT_SERVER_USER") {
            self.mqtt.user = user;
        }
        if let Some(password) = lookup("MQTT_SERVER_PASSWORD") {
            self.mqtt.password = password;
        }
        if let Some(topic) = lookup("MQTT_SERVER_TOPIC") {
            self.mqtt.topic = topic;
        }
        if let Some(delay) = lookup("RECOVERY_DELAY_SECS") {
            match delay.trim().parse::<f64>() {
                Ok(secs) if secs >= 0.0 => self.restart.recovery_delay_secs = secs,
                _ => tracing::warn!("ignoring invalid RECOVERY_DELAY_SECS={:?}", delay),
            }
        }
    }
}
