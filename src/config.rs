use crate::state::check_storable_path;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the tool settings file
pub const DEFAULT_SETTINGS_PATH: &str = "/etc/n8s/config.toml";

/// Environment variable that overrides the settings file location
pub const SETTINGS_ENV: &str = "N8S_CONFIG";

/// Tool-level settings for the router.
///
/// These describe *where* things live and *how* to talk to the host. The
/// per-host router state (ports, routes, flags) lives in the state file
/// named by `state_file` and is handled by [`crate::state`].
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// Path of the persisted router state
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Primary listening port used when no state exists yet
    #[serde(default = "default_primary_port")]
    pub primary_port: u16,

    /// How long to wait for another invocation to release the state lock
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_secs: u64,

    /// Run reconciliation against the live system on every load
    #[serde(default = "default_true")]
    pub reconcile_on_load: bool,

    #[serde(default)]
    pub paths: PathSettings,

    #[serde(default)]
    pub proxy: ProxySettings,

    #[serde(default)]
    pub app: AppSettings,

    #[serde(default)]
    pub network: NetworkSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathSettings {
    /// Directory holding one fragment per route
    #[serde(default = "default_routes_dir")]
    pub routes_dir: PathBuf,

    /// Generated main proxy configuration
    #[serde(default = "default_nginx_conf")]
    pub nginx_conf: PathBuf,

    /// Symlink that activates the generated configuration
    #[serde(default = "default_enabled_link")]
    pub enabled_link: PathBuf,

    /// Directory of the managed application's deployment descriptor
    #[serde(default = "default_app_dir")]
    pub app_dir: PathBuf,

    /// Artifacts written by format versions 1 and 2, removed on regeneration
    #[serde(default = "default_legacy_paths")]
    pub legacy_paths: Vec<PathBuf>,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            routes_dir: default_routes_dir(),
            nginx_conf: default_nginx_conf(),
            enabled_link: default_enabled_link(),
            app_dir: default_app_dir(),
            legacy_paths: default_legacy_paths(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxySettings {
    /// Proxy binary used for `-t` syntax checks and version probing
    #[serde(default = "default_proxy_binary")]
    pub binary: String,

    /// systemd unit name of the proxy
    #[serde(default = "default_proxy_service")]
    pub service: String,

    /// Command that reloads the running proxy
    #[serde(default = "default_reload_command")]
    pub reload_command: Vec<String>,

    /// Upper bound for any external command
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            binary: default_proxy_binary(),
            service: default_proxy_service(),
            reload_command: default_reload_command(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

impl ProxySettings {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppSettings {
    /// Name of the managed application's container
    #[serde(default = "default_container_name")]
    pub container_name: String,

    /// Docker host URL (default: DOCKER_HOST or common socket paths)
    pub docker_host: Option<String>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            container_name: default_container_name(),
            docker_host: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct NetworkSettings {
    /// Endpoint returning the caller's public address as plain text
    #[serde(default = "default_ip_lookup_url")]
    pub ip_lookup_url: String,

    #[serde(default = "default_ip_lookup_timeout")]
    pub ip_lookup_timeout_secs: u64,

    /// Literal used when the lookup fails
    #[serde(default = "default_fallback_host")]
    pub fallback_host: String,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            ip_lookup_url: default_ip_lookup_url(),
            ip_lookup_timeout_secs: default_ip_lookup_timeout(),
            fallback_host: default_fallback_host(),
        }
    }
}

impl NetworkSettings {
    pub fn ip_lookup_timeout(&self) -> Duration {
        Duration::from_secs(self.ip_lookup_timeout_secs)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            primary_port: default_primary_port(),
            lock_timeout_secs: default_lock_timeout(),
            reconcile_on_load: true,
            paths: PathSettings::default(),
            proxy: ProxySettings::default(),
            app: AppSettings::default(),
            network: NetworkSettings::default(),
        }
    }
}

// Default value functions
fn default_state_file() -> PathBuf {
    PathBuf::from("/etc/n8s/router.conf")
}

fn default_primary_port() -> u16 {
    1440
}

fn default_lock_timeout() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_routes_dir() -> PathBuf {
    PathBuf::from("/etc/nginx/n8s-routes")
}

fn default_nginx_conf() -> PathBuf {
    PathBuf::from("/etc/nginx/sites-available/n8s.conf")
}

fn default_enabled_link() -> PathBuf {
    PathBuf::from("/etc/nginx/sites-enabled/n8s.conf")
}

fn default_app_dir() -> PathBuf {
    PathBuf::from("/opt/n8n")
}

fn default_legacy_paths() -> Vec<PathBuf> {
    vec![
        // v1: single-port site
        PathBuf::from("/etc/nginx/sites-available/n8n"),
        PathBuf::from("/etc/nginx/sites-enabled/n8n"),
        // v2: multi-port config under conf.d
        PathBuf::from("/etc/nginx/conf.d/n8n-router.conf"),
    ]
}

fn default_proxy_binary() -> String {
    "nginx".to_string()
}

fn default_proxy_service() -> String {
    "nginx".to_string()
}

fn default_reload_command() -> Vec<String> {
    vec![
        "systemctl".to_string(),
        "reload".to_string(),
        "nginx".to_string(),
    ]
}

fn default_command_timeout() -> u64 {
    30
}

fn default_container_name() -> String {
    "n8n".to_string()
}

fn default_ip_lookup_url() -> String {
    "https://api.ipify.org".to_string()
}

fn default_ip_lookup_timeout() -> u64 {
    5
}

fn default_fallback_host() -> String {
    "YOUR_SERVER_IP".to_string()
}

impl Settings {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Resolve the settings file and load it.
    ///
    /// An explicit path must exist. Otherwise `N8S_CONFIG` or the default
    /// location is used, falling back to built-in defaults when absent.
    pub fn discover(explicit: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        let path = std::env::var_os(SETTINGS_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_PATH));

        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    /// Lock file guarding load-mutate-save sequences
    pub fn lock_file(&self) -> PathBuf {
        let mut name = self.state_file.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Validate all settings
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.primary_port == 0 {
            errors.push("'primary_port' must be greater than 0".to_string());
        }
        if self.proxy.reload_command.is_empty() {
            errors.push("'proxy.reload_command' must not be empty".to_string());
        }
        if self.proxy.binary.trim().is_empty() {
            errors.push("'proxy.binary' must not be empty".to_string());
        }
        if self.proxy.command_timeout_secs == 0 {
            errors.push("'proxy.command_timeout_secs' must be greater than 0".to_string());
        }
        for (field, path) in [
            ("state_file", &self.state_file),
            ("paths.routes_dir", &self.paths.routes_dir),
            ("paths.nginx_conf", &self.paths.nginx_conf),
            ("paths.enabled_link", &self.paths.enabled_link),
            ("paths.app_dir", &self.paths.app_dir),
        ] {
            if let Err(e) = check_storable_path(path) {
                errors.push(format!("'{}': {}", field, e));
            }
        }
        if self.paths.nginx_conf == self.paths.enabled_link {
            errors.push("'paths.nginx_conf' and 'paths.enabled_link' must differ".to_string());
        }
        if self.paths.legacy_paths.iter().any(|p| {
            p == &self.paths.nginx_conf || p == &self.paths.enabled_link
        }) {
            errors.push("'paths.legacy_paths' must not contain the active config paths".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_settings_use_defaults() {
        let settings: Settings = toml::from_str("").unwrap();

        assert_eq!(settings.state_file, PathBuf::from("/etc/n8s/router.conf"));
        assert_eq!(settings.primary_port, 1440);
        assert_eq!(settings.lock_timeout_secs, 10);
        assert!(settings.reconcile_on_load);
        assert_eq!(settings.proxy.binary, "nginx");
        assert_eq!(settings.proxy.reload_command, vec!["systemctl", "reload", "nginx"]);
        assert_eq!(settings.proxy.command_timeout(), Duration::from_secs(30));
        assert_eq!(settings.app.container_name, "n8n");
        assert!(settings.app.docker_host.is_none());
        assert_eq!(settings.network.fallback_host, "YOUR_SERVER_IP");
        assert_eq!(settings.network.ip_lookup_timeout(), Duration::from_secs(5));
        assert_eq!(settings.paths.legacy_paths.len(), 3);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_parse_settings() {
        let toml = r#"
state_file = "/var/lib/n8s/state.conf"
primary_port = 8443
reconcile_on_load = false

[paths]
routes_dir = "/srv/routes"
nginx_conf = "/srv/nginx/n8s.conf"
enabled_link = "/srv/nginx/enabled/n8s.conf"
legacy_paths = []

[proxy]
binary = "/usr/sbin/nginx"
reload_command = ["nginx", "-s", "reload"]
command_timeout_secs = 5

[app]
container_name = "automation"
docker_host = "unix:///run/docker.sock"

[network]
ip_lookup_url = "https://ifconfig.me/ip"
fallback_host = "127.0.0.1"
"#;
        let settings: Settings = toml::from_str(toml).unwrap();

        assert_eq!(settings.primary_port, 8443);
        assert!(!settings.reconcile_on_load);
        assert_eq!(settings.paths.routes_dir, PathBuf::from("/srv/routes"));
        assert!(settings.paths.legacy_paths.is_empty());
        assert_eq!(settings.proxy.reload_command, vec!["nginx", "-s", "reload"]);
        assert_eq!(settings.proxy.command_timeout(), Duration::from_secs(5));
        assert_eq!(settings.proxy.service, "nginx");
        assert_eq!(settings.app.container_name, "automation");
        assert_eq!(
            settings.app.docker_host,
            Some("unix:///run/docker.sock".to_string())
        );
        assert_eq!(settings.network.fallback_host, "127.0.0.1");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_lock_file_sits_next_to_state() {
        let settings = Settings::default();
        assert_eq!(settings.lock_file(), PathBuf::from("/etc/n8s/router.conf.lock"));
    }

    #[test]
    fn test_validate_multiple_errors() {
        let toml = r#"
primary_port = 0

[proxy]
reload_command = []
command_timeout_secs = 0
"#;
        let settings: Settings = toml::from_str(toml).unwrap();
        let err = settings.validate().unwrap_err().to_string();

        assert!(err.contains("'primary_port' must be greater than 0"));
        assert!(err.contains("'proxy.reload_command' must not be empty"));
        assert!(err.contains("'proxy.command_timeout_secs' must be greater than 0"));
    }

    #[test]
    fn test_validate_rejects_legacy_overlap() {
        let mut settings = Settings::default();
        settings.paths.legacy_paths.push(settings.paths.nginx_conf.clone());

        let err = settings.validate().unwrap_err().to_string();
        assert!(err.contains("legacy_paths"));
    }

    #[test]
    fn test_validate_rejects_unstorable_paths() {
        let mut settings = Settings::default();
        settings.paths.app_dir = PathBuf::from("/opt/n8n\nINJECTED=1");
        settings.paths.routes_dir = PathBuf::from("/etc/nginx/routes\u{7}");

        let err = settings.validate().unwrap_err().to_string();
        assert!(err.contains("'paths.app_dir'"));
        assert!(err.contains("'paths.routes_dir'"));
        assert!(!err.contains("'paths.nginx_conf'"));
    }

    #[test]
    fn test_load_from_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "primary_port = 9000\n").unwrap();

        let settings = Settings::discover(Some(&path)).unwrap();
        assert_eq!(settings.primary_port, 9000);

        let missing = tmp.path().join("missing.toml");
        assert!(Settings::discover(Some(&missing)).is_err());
    }
}
