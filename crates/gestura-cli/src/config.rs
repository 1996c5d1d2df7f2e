//! Configuration file – reads/writes `~/.gestura/config.toml`.

use gestura_middleware::BrokerConfig;
use gestura_middleware::registry::DEFAULT_CHANNEL_BUFFER;
use gestura_middleware::store::DEFAULT_HISTORY_LEN;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// `[server]` table: where the cockpit listens and how much it buffers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Outbound frames queued per push-channel before it is dropped as slow.
    #[serde(default = "default_channel_buffer")]
    pub channel_buffer: usize,

    /// Number of recent updates kept for `GET /api/history`.
    #[serde(default = "default_history_len")]
    pub history_len: usize,
}

fn default_host() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}
fn default_port() -> u16 {
    gestura_cockpit::DEFAULT_PORT
}
fn default_channel_buffer() -> usize {
    DEFAULT_CHANNEL_BUFFER
}
fn default_history_len() -> usize {
    DEFAULT_HISTORY_LEN
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            channel_buffer: default_channel_buffer(),
            history_len: default_history_len(),
        }
    }
}

/// Persisted configuration stored in `~/.gestura/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    /// Broker credentials are stored as plain text; the file is written
    /// owner-only on Unix.
    #[serde(default)]
    pub broker: BrokerConfig,
}

/// Return the path to `~/.gestura/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".gestura").join("config.toml")
}

/// Load the config from `path`, falling back to defaults when the file is
/// missing, then apply environment overrides and validate the result.
pub fn load_or_default(path: &Path) -> Result<Config, String> {
    let mut cfg = load_from(path)?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    validate(&cfg)?;
    Ok(cfg)
}

/// Load the config from a specific path.  Returns `None` if it does not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config = toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    Ok(Some(cfg))
}

/// Reject combinations the relay cannot run with.
pub fn validate(cfg: &Config) -> Result<(), String> {
    if cfg.server.channel_buffer == 0 {
        return Err("server.channel_buffer must be at least 1".to_string());
    }
    if cfg.broker.enabled {
        cfg.broker.validate()?;
    }
    Ok(())
}

/// Apply `GESTURA_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `GESTURA_HOST` | `server.host` |
/// | `GESTURA_PORT` | `server.port` |
/// | `GESTURA_MQTT_HOST` | `broker.host` (also sets `broker.enabled`) |
/// | `GESTURA_MQTT_PORT` | `broker.port` |
/// | `GESTURA_MQTT_TOPIC` | `broker.topic` |
/// | `GESTURA_MQTT_USERNAME` | `broker.username` |
/// | `GESTURA_MQTT_PASSWORD` | `broker.password` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides(cfg, |key| std::env::var(key).ok());
}

/// Override logic over an arbitrary variable lookup.
pub(crate) fn apply_overrides(cfg: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("GESTURA_HOST")
        && let Ok(host) = v.parse::<IpAddr>()
    {
        cfg.server.host = host;
    }
    if let Some(v) = var("GESTURA_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.server.port = port;
    }
    if let Some(v) = var("GESTURA_MQTT_HOST")
        && !v.is_empty()
    {
        cfg.broker.host = v;
        cfg.broker.enabled = true;
    }
    if let Some(v) = var("GESTURA_MQTT_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.broker.port = port;
    }
    if let Some(v) = var("GESTURA_MQTT_TOPIC")
        && !v.is_empty()
    {
        cfg.broker.topic = v;
    }
    if let Some(v) = var("GESTURA_MQTT_USERNAME") {
        cfg.broker.username = Some(v);
    }
    if let Some(v) = var("GESTURA_MQTT_PASSWORD") {
        cfg.broker.password = Some(v);
    }
}

/// Save the config to a specific path, creating the parent directory.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_match_producer_expectations() {
        let cfg = Config::default();
        assert_eq!(cfg.server.port, 5000);
        assert!(cfg.server.host.is_unspecified());
        assert_eq!(cfg.server.channel_buffer, 32);
        assert_eq!(cfg.server.history_len, 50);
        assert!(!cfg.broker.enabled);
        assert_eq!(cfg.broker.topic, "robot");
    }

    #[test]
    fn config_debug_redacts_broker_password() {
        let mut cfg = Config::default();
        cfg.broker.password = Some("hunter2".to_string());
        let debug_str = format!("{:?}", cfg);
        assert!(!debug_str.contains("hunter2"), "password must not appear in debug output");
        assert!(debug_str.contains("<redacted>"));
    }

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).expect("file metadata").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600, "config file must have 0o600 permissions");
        let dir_mode = std::fs::metadata(path.parent().unwrap())
            .expect("dir metadata")
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700, "config directory must have 0o700 permissions");
    }

    #[test]
    fn roundtrip_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let mut cfg = Config::default();
        cfg.server.port = 5050;
        cfg.broker.enabled = true;
        cfg.broker.host = "broker.local".to_string();
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.server, cfg.server);
        assert!(loaded.broker.enabled);
        assert_eq!(loaded.broker.host, "broker.local");
        assert_eq!(loaded.broker.port, 1883);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[broker]\nenabled = true\ntopic = \"arm\"\n").unwrap();

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.server, ServerConfig::default());
        assert_eq!(loaded.broker.topic, "arm");
        assert_eq!(loaded.broker.host, "localhost");
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server\nport = ").unwrap();
        assert!(load_from(&path).unwrap_err().contains("parse"));
    }

    #[test]
    fn config_path_points_to_gestura_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".gestura"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn overrides_change_server_fields() {
        let mut cfg = Config::default();
        apply_overrides(&mut cfg, lookup(&[("GESTURA_HOST", "127.0.0.1"), ("GESTURA_PORT", "8088")]));
        assert_eq!(cfg.server.host, IpAddr::from([127, 0, 0, 1]));
        assert_eq!(cfg.server.port, 8088);
    }

    #[test]
    fn mqtt_host_override_enables_broker() {
        let mut cfg = Config::default();
        apply_overrides(
            &mut cfg,
            lookup(&[
                ("GESTURA_MQTT_HOST", "10.0.0.7"),
                ("GESTURA_MQTT_PORT", "8883"),
                ("GESTURA_MQTT_TOPIC", "robot/arm"),
                ("GESTURA_MQTT_USERNAME", "lens"),
                ("GESTURA_MQTT_PASSWORD", "pw"),
            ]),
        );
        assert!(cfg.broker.enabled);
        assert_eq!(cfg.broker.host, "10.0.0.7");
        assert_eq!(cfg.broker.port, 8883);
        assert_eq!(cfg.broker.topic, "robot/arm");
        assert_eq!(cfg.broker.username.as_deref(), Some("lens"));
        assert_eq!(cfg.broker.password.as_deref(), Some("pw"));
    }

    #[test]
    fn overrides_ignore_invalid_values() {
        let mut cfg = Config::default();
        apply_overrides(
            &mut cfg,
            lookup(&[("GESTURA_PORT", "not-a-port"), ("GESTURA_HOST", "nowhere"), ("GESTURA_MQTT_PORT", "99999")]),
        );
        assert_eq!(cfg.server, ServerConfig::default());
        assert_eq!(cfg.broker.port, 1883);
        assert!(!cfg.broker.enabled);
    }

    #[test]
    fn validate_rejects_zero_buffer() {
        let mut cfg = Config::default();
        cfg.server.channel_buffer = 0;
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn validate_rejects_publishing_to_subscribed_topic() {
        let mut cfg = Config::default();
        cfg.broker.enabled = true;
        cfg.broker.subscribe_topic = Some(cfg.broker.topic.clone());
        assert!(validate(&cfg).is_err());
    }
}
