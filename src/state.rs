//! Persisted router state
//!
//! The state file is a flat `KEY=value` document that stays readable by the
//! older shell tooling, but it is only ever *parsed* here: values go through
//! a quoting-aware tokenizer and are never evaluated.

use crate::error::{Result, RouterError};
use crate::route::{
    check_path, normalize_path, parse_fragment, parse_fragment_file_name, sanitize_name,
};
use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Current state file format version
pub const STATE_VERSION: u32 = 3;

/// Provisioned component tracked by an installed flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    /// The managed application container
    App,
    /// Docker engine
    Docker,
    /// The reverse proxy
    Proxy,
}

impl Component {
    pub const ALL: [Component; 3] = [Component::App, Component::Docker, Component::Proxy];

    /// Key used in the state file
    pub fn state_key(&self) -> &'static str {
        match self {
            Component::App => "N8N_INSTALLED",
            Component::Docker => "DOCKER_INSTALLED",
            Component::Proxy => "NGINX_INSTALLED",
        }
    }

    fn from_state_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.state_key() == key)
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Component::App => "app",
            Component::Docker => "docker",
            Component::Proxy => "proxy",
        };
        f.write_str(label)
    }
}

/// Composite route key `(listening port, normalized path)`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RouteKey {
    pub port: u16,
    pub path: String,
}

impl RouteKey {
    pub fn new(port: u16, path: impl Into<String>) -> Self {
        Self {
            port,
            path: path.into(),
        }
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.port, self.path)
    }
}

impl FromStr for RouteKey {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (port, path) = s
            .split_once(':')
            .ok_or_else(|| format!("route key '{}' is not <port>:<path>", s))?;
        let port: u16 = port
            .parse()
            .map_err(|_| format!("route key '{}' has an invalid port", s))?;
        if path.is_empty() {
            return Err(format!("route key '{}' has an empty path", s));
        }
        Ok(Self::new(port, path))
    }
}

impl Serialize for RouteKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Backend target of a route
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    pub backend_port: u16,
    /// Fragment name; unique across all routes
    pub name: String,
}

/// The persisted aggregate: one per host.
///
/// `ports` is insertion ordered and never empty; its first element is the
/// primary port. Every route key references a port in `ports`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouterConfig {
    ports: Vec<u16>,
    /// Host or IP printed in URLs; has no effect on proxy behavior
    pub public_host: String,
    pub routes_dir: PathBuf,
    pub app_dir: PathBuf,
    pub nginx_conf: PathBuf,
    installed: BTreeMap<Component, bool>,
    routes: BTreeMap<RouteKey, Route>,
}

impl RouterConfig {
    pub fn new(
        primary_port: u16,
        public_host: impl Into<String>,
        routes_dir: impl Into<PathBuf>,
        app_dir: impl Into<PathBuf>,
        nginx_conf: impl Into<PathBuf>,
    ) -> Self {
        Self {
            ports: vec![primary_port],
            public_host: public_host.into(),
            routes_dir: routes_dir.into(),
            app_dir: app_dir.into(),
            nginx_conf: nginx_conf.into(),
            installed: Component::ALL.into_iter().map(|c| (c, false)).collect(),
            routes: BTreeMap::new(),
        }
    }

    pub fn primary_port(&self) -> u16 {
        self.ports[0]
    }

    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    pub fn has_port(&self, port: u16) -> bool {
        self.ports.contains(&port)
    }

    pub(crate) fn push_port(&mut self, port: u16) {
        if !self.has_port(port) {
            self.ports.push(port);
        }
    }

    /// Remove a port; refuses to empty the list
    pub(crate) fn remove_port(&mut self, port: u16) -> bool {
        if self.ports.len() > 1 {
            let before = self.ports.len();
            self.ports.retain(|p| *p != port);
            return self.ports.len() != before;
        }
        false
    }

    /// Make `port` the primary port, inserting it if new
    pub(crate) fn set_primary_port(&mut self, port: u16) {
        self.ports.retain(|p| *p != port);
        self.ports.insert(0, port);
    }

    pub fn is_installed(&self, component: Component) -> bool {
        self.installed.get(&component).copied().unwrap_or(false)
    }

    pub(crate) fn set_installed(&mut self, component: Component, installed: bool) {
        self.installed.insert(component, installed);
    }

    pub fn installed_flags(&self) -> &BTreeMap<Component, bool> {
        &self.installed
    }

    pub fn routes(&self) -> &BTreeMap<RouteKey, Route> {
        &self.routes
    }

    pub fn route(&self, key: &RouteKey) -> Option<&Route> {
        self.routes.get(key)
    }

    pub fn route_by_name(&self, name: &str) -> Option<(&RouteKey, &Route)> {
        self.routes.iter().find(|(_, route)| route.name == name)
    }

    pub fn routes_on_port(&self, port: u16) -> impl Iterator<Item = (&RouteKey, &Route)> {
        self.routes.iter().filter(move |(key, _)| key.port == port)
    }

    pub(crate) fn insert_route(&mut self, key: RouteKey, route: Route) -> Option<Route> {
        self.push_port(key.port);
        self.routes.insert(key, route)
    }

    pub(crate) fn remove_route(&mut self, key: &RouteKey) -> Option<Route> {
        self.routes.remove(key)
    }

    /// Public URL of a route, for display
    pub fn route_url(&self, key: &RouteKey) -> String {
        format!("http://{}:{}{}", self.public_host, key.port, key.path)
    }
}

/// Serialize the full state; every field is re-derived from `config`
pub fn encode(config: &RouterConfig) -> String {
    let mut out = String::new();
    let mut line = |s: String| {
        out.push_str(&s);
        out.push('\n');
    };

    line("# n8s router state. Parsed by n8s, never sourced.".to_string());
    line(format!("CONFIG_VERSION={}", STATE_VERSION));
    line(format!("NGINX_PORT={}", config.primary_port()));
    line(format!("SERVER_IP={}", shell_words::quote(&config.public_host)));
    for component in Component::ALL {
        line(format!(
            "{}={}",
            component.state_key(),
            config.is_installed(component)
        ));
    }
    line(format!("N8N_DIR={}", quote_path(&config.app_dir)));
    line(format!("ROUTES_DIR={}", quote_path(&config.routes_dir)));
    line(format!("NGINX_CONF={}", quote_path(&config.nginx_conf)));

    let ports: Vec<String> = config.ports.iter().map(u16::to_string).collect();
    line(format!("NGINX_PORTS=( {} )", ports.join(" ")));

    line("declare -A PORT_MAPPINGS ROUTE_NAMES".to_string());
    for (key, route) in &config.routes {
        line(format!("PORT_MAPPINGS[\"{}\"]={}", key, route.backend_port));
    }
    for (key, route) in &config.routes {
        line(format!(
            "ROUTE_NAMES[\"{}\"]={}",
            key,
            shell_words::quote(&route.name)
        ));
    }

    out
}

/// Paths must be UTF-8 without control characters to survive a round trip
/// through the line-oriented state file
pub fn check_storable_path(path: &Path) -> std::result::Result<(), String> {
    let text = path
        .to_str()
        .ok_or_else(|| format!("path {} is not valid UTF-8", path.display()))?;
    if let Some(c) = text.chars().find(|c| c.is_control()) {
        return Err(format!("path {:?} contains control character {:?}", text, c));
    }
    Ok(())
}

fn quote_path(path: &Path) -> String {
    shell_words::quote(&path.to_string_lossy()).into_owned()
}

/// Result of decoding a state file
#[derive(Debug)]
pub struct DecodedState {
    pub config: RouterConfig,
    /// Format version the file was written with
    pub version: u32,
    /// Routes whose names were not recorded (files older than v3)
    pub unnamed_routes: Vec<RouteKey>,
}

/// Parse state text. Fields absent from the text keep the value from
/// `template`.
pub fn decode(text: &str, source: &Path, template: RouterConfig) -> Result<DecodedState> {
    let mut config = template;
    let mut version = None;
    let mut primary = None;
    let mut ports: Option<Vec<u16>> = None;
    let mut mappings: BTreeMap<RouteKey, u16> = BTreeMap::new();
    let mut names: BTreeMap<RouteKey, String> = BTreeMap::new();

    for (idx, raw) in text.lines().enumerate() {
        let lineno = idx + 1;
        let line = raw.trim();
        let err = |message: String| RouterError::State {
            path: source.to_path_buf(),
            line: lineno,
            message,
        };

        if line.is_empty() || line.starts_with('#') || line.starts_with("declare ") {
            continue;
        }

        if let Some((map, key, value)) = split_map_entry(line).map_err(&err)? {
            let key = checked_key(key).map_err(&err)?;
            match map {
                "PORT_MAPPINGS" => {
                    let value = unquote(value).map_err(&err)?;
                    let port = parse_port(&value).map_err(&err)?;
                    mappings.insert(key, port);
                }
                "ROUTE_NAMES" => {
                    names.insert(key, unquote(value).map_err(&err)?);
                }
                other => warn!(map = other, line = lineno, "Ignoring unknown map in state file"),
            }
            continue;
        }

        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| err(format!("expected KEY=value, got '{}'", line)))?;

        match key {
            "NGINX_PORTS" => {
                let inner = value
                    .trim()
                    .strip_prefix('(')
                    .and_then(|v| v.strip_suffix(')'))
                    .ok_or_else(|| err("NGINX_PORTS must be a ( ... ) list".to_string()))?;
                let tokens = shell_words::split(inner).map_err(|e| err(e.to_string()))?;
                let parsed = tokens
                    .iter()
                    .map(|t| parse_port(t))
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(&err)?;
                ports = Some(parsed);
            }
            "CONFIG_VERSION" => {
                let value = unquote(value).map_err(&err)?;
                version = Some(
                    value
                        .parse::<u32>()
                        .map_err(|_| err(format!("invalid version '{}'", value)))?,
                );
            }
            "NGINX_PORT" => primary = Some(parse_port(&unquote(value).map_err(&err)?).map_err(&err)?),
            "SERVER_IP" => config.public_host = unquote(value).map_err(&err)?,
            "N8N_DIR" => config.app_dir = PathBuf::from(unquote(value).map_err(&err)?),
            "ROUTES_DIR" => config.routes_dir = PathBuf::from(unquote(value).map_err(&err)?),
            "NGINX_CONF" => config.nginx_conf = PathBuf::from(unquote(value).map_err(&err)?),
            other => match Component::from_state_key(other) {
                Some(component) => {
                    let value = unquote(value).map_err(&err)?;
                    config.set_installed(component, parse_bool(&value).map_err(&err)?);
                }
                None => warn!(key = other, line = lineno, "Ignoring unknown key in state file"),
            },
        }
    }

    let has_ports_list = ports.is_some();
    match (primary, ports) {
        (_, Some(list)) if !list.is_empty() => {
            config.ports = Vec::new();
            for port in list {
                config.push_port(port);
            }
            if let Some(primary) = primary {
                config.set_primary_port(primary);
            }
        }
        (Some(primary), _) => config.ports = vec![primary],
        (None, _) => {
            debug!(path = %source.display(), "No ports recorded, keeping defaults");
        }
    }

    let mut unnamed_routes = Vec::new();
    let mut seen_names: BTreeSet<String> = BTreeSet::new();
    for (key, backend_port) in mappings {
        if !config.has_port(key.port) {
            warn!(route = %key, "Route references an unlisted port, adding it");
        }
        let usable = names.remove(&key).filter(|name| {
            let ok = !name.is_empty() && sanitize_name(name) == *name && !seen_names.contains(name);
            if !ok {
                warn!(route = %key, name = %name, "Discarding unusable route name");
            }
            ok
        });
        let name = match usable {
            Some(name) => {
                seen_names.insert(name.clone());
                name
            }
            None => {
                unnamed_routes.push(key.clone());
                String::new()
            }
        };
        config.insert_route(key, Route { backend_port, name });
    }
    for key in names.keys() {
        warn!(route = %key, "Ignoring route name without a mapping");
    }

    let version = version.unwrap_or(if has_ports_list { 2 } else { 1 });

    Ok(DecodedState {
        config,
        version,
        unnamed_routes,
    })
}

/// Parse a persisted route key, holding its path to the same rules as
/// newly added routes
fn checked_key(raw: &str) -> std::result::Result<RouteKey, String> {
    let key: RouteKey = raw.parse()?;
    if key.port == 0 {
        return Err(format!("route key '{}' has an invalid port", raw));
    }
    check_path(&key.path).map_err(|e| format!("route key '{}': {}", raw, e))?;
    Ok(RouteKey::new(key.port, normalize_path(&key.path)))
}

/// Split `NAME["key"]=value` into its parts; `Ok(None)` for plain lines
fn split_map_entry(line: &str) -> std::result::Result<Option<(&str, &str, &str)>, String> {
    let (Some(open), Some(eq)) = (line.find('['), line.find('=')) else {
        return Ok(None);
    };
    if open > eq {
        return Ok(None);
    }

    let map = &line[..open];
    let rest = &line[open + 1..];
    let rest = rest
        .strip_prefix('"')
        .ok_or_else(|| format!("map key in '{}' must be double-quoted", line))?;
    let close = rest
        .find('"')
        .ok_or_else(|| format!("unterminated map key in '{}'", line))?;
    let key = &rest[..close];
    let value = rest[close + 1..]
        .strip_prefix("]=")
        .ok_or_else(|| format!("expected ]= after map key in '{}'", line))?;

    Ok(Some((map, key, value)))
}

fn unquote(value: &str) -> std::result::Result<String, String> {
    let mut tokens = shell_words::split(value).map_err(|e| format!("{}: {}", e, value))?;
    match tokens.len() {
        0 => Ok(String::new()),
        1 => Ok(tokens.remove(0)),
        _ => Err(format!("value {} must be a single word", value)),
    }
}

fn parse_port(value: &str) -> std::result::Result<u16, String> {
    match value.trim().parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(format!("invalid port '{}'", value)),
    }
}

fn parse_bool(value: &str) -> std::result::Result<bool, String> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" | "" => Ok(false),
        other => Err(format!("invalid boolean '{}'", other)),
    }
}

/// Fill in names of routes that predate the ROUTE_NAMES block.
///
/// Fragments in the routes directory are matched by port and path; routes
/// without a matching fragment get a name derived from their path.
pub fn recover_route_names(config: &mut RouterConfig, unnamed: &[RouteKey]) {
    if unnamed.is_empty() {
        return;
    }

    let mut on_disk: BTreeMap<RouteKey, String> = BTreeMap::new();
    if let Ok(entries) = std::fs::read_dir(&config.routes_dir) {
        for entry in entries.flatten() {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let Some((port, name)) = parse_fragment_file_name(&file_name) else {
                continue;
            };
            if let Some(parsed) = std::fs::read_to_string(entry.path())
                .ok()
                .and_then(|text| parse_fragment(&text))
            {
                on_disk.insert(RouteKey::new(port, parsed.path), name);
            }
        }
    }

    for key in unnamed {
        let name = on_disk
            .remove(key)
            .filter(|name| config.route_by_name(name).is_none())
            .unwrap_or_else(|| unique_name(config, &derive_name(key)));
        if let Some(route) = config.routes.get_mut(key) {
            info!(route = %key, name = %name, "Recovered route name");
            route.name = name;
        }
    }
}

fn derive_name(key: &RouteKey) -> String {
    let name = sanitize_name(&key.path.trim_matches('/').replace('/', "-"));
    if name.is_empty() {
        "root".to_string()
    } else {
        name
    }
}

fn unique_name(config: &RouterConfig, base: &str) -> String {
    if config.route_by_name(base).is_none() {
        return base.to_string();
    }
    (2..)
        .map(|n| format!("{}-{}", base, n))
        .find(|candidate| config.route_by_name(candidate).is_none())
        .unwrap_or_else(|| base.to_string())
}

/// Read and decode the state file; `Ok(None)` when it does not exist
pub fn load_file(path: &Path, template: RouterConfig) -> Result<Option<DecodedState>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(RouterError::io("Failed to read", path, e)),
    };
    decode(&text, path, template).map(Some)
}

/// Atomically replace the state file, readable by the owner only
pub fn save_file(path: &Path, config: &RouterConfig) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent)
        .map_err(|e| RouterError::io("Failed to create", &parent, e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(&parent)
        .map_err(|e| RouterError::io("Failed to create temp file in", &parent, e))?;
    tmp.write_all(encode(config).as_bytes())
        .map_err(|e| RouterError::io("Failed to write", tmp.path().to_path_buf(), e))?;

    // NamedTempFile is created 0600 on Unix; keep it that way after rename
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o600))
            .map_err(|e| RouterError::io("Failed to set permissions on", tmp.path().to_path_buf(), e))?;
    }

    tmp.persist(path)
        .map_err(|e| RouterError::io("Failed to replace", path, e.error))?;

    debug!(path = %path.display(), "Saved router state");
    Ok(())
}
