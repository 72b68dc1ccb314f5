//! The router configuration store
//!
//! [`RouterStore`] owns no router state itself. Each operation takes the
//! [`RouterConfig`] by exclusive reference, touches the filesystem and the
//! proxy, and persists the config only once the proxy has accepted the
//! generated configuration. Callers serialize invocations with
//! [`RouterStore::lock`].

use crate::config::Settings;
use crate::error::{Result, RouterError};
use crate::exec::{CommandRunner, SystemRunner};
use crate::lock::StateLock;
use crate::nginx::{remove_if_present, render_main_config, ConfigSnapshot, ProxyControl, ProxyLayout};
use crate::probe::{self, HostProbe, ReconcileReport, SystemProbe};
use crate::publicip::{HttpResolver, PublicHostResolver};
use crate::route::{
    check_path, fragment_path, normalize_path, parse_fragment_file_name, render_fragment,
    sanitize_name,
};
use crate::state::{self, Route, RouteKey, RouterConfig, STATE_VERSION};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A route as shown to the operator
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteView {
    pub port: u16,
    pub path: String,
    pub name: String,
    pub backend_port: u16,
    pub url: String,
}

pub struct RouterStore {
    settings: Settings,
    runner: Arc<dyn CommandRunner>,
    probe: Arc<dyn SystemProbe>,
    resolver: Arc<dyn PublicHostResolver>,
}

impl RouterStore {
    /// Store wired to the real host: processes, systemd, Docker, HTTP lookup
    pub fn new(settings: Settings) -> Self {
        let runner: Arc<dyn CommandRunner> =
            Arc::new(SystemRunner::new(settings.proxy.command_timeout()));
        let probe = Arc::new(HostProbe::new(
            Arc::clone(&runner),
            settings.proxy.clone(),
            settings.app.clone(),
        ));
        let resolver = Arc::new(HttpResolver::new(&settings.network));

        Self {
            settings,
            runner,
            probe,
            resolver,
        }
    }

    /// Replace the command runner (builder pattern)
    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Replace the system probe (builder pattern)
    pub fn with_probe(mut self, probe: Arc<dyn SystemProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Replace the public host resolver (builder pattern)
    pub fn with_resolver(mut self, resolver: Arc<dyn PublicHostResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Take the advisory lock guarding load-mutate-save
    pub async fn lock(&self) -> Result<StateLock> {
        StateLock::acquire(&self.settings.lock_file(), self.settings.lock_timeout()).await
    }

    /// Whether a persisted state file exists
    pub fn exists(&self) -> bool {
        self.settings.state_file.exists()
    }

    fn template(&self, public_host: impl Into<String>) -> RouterConfig {
        RouterConfig::new(
            self.settings.primary_port,
            public_host,
            &self.settings.paths.routes_dir,
            &self.settings.paths.app_dir,
            &self.settings.paths.nginx_conf,
        )
    }

    /// Load the persisted config, creating and persisting defaults on first
    /// run, then reconcile installed flags with the live system.
    pub async fn load(&self) -> Result<RouterConfig> {
        let path = &self.settings.state_file;
        let fallback = self.template(self.settings.network.fallback_host.clone());

        let mut config = match state::load_file(path, fallback)? {
            Some(decoded) => {
                let mut config = decoded.config;
                state::recover_route_names(&mut config, &decoded.unnamed_routes);
                if decoded.version < STATE_VERSION {
                    info!(
                        path = %path.display(),
                        from = decoded.version,
                        to = STATE_VERSION,
                        "Upgrading router state format"
                    );
                    self.save(&config)?;
                } else if !decoded.unnamed_routes.is_empty() {
                    self.save(&config)?;
                }
                debug!(path = %path.display(), ports = ?config.ports(), routes = config.routes().len(), "Loaded router state");
                config
            }
            None => {
                let public_host = self.resolver.resolve().await;
                let config = self.template(public_host);
                self.save(&config)?;
                info!(path = %path.display(), port = config.primary_port(), "Created router state");
                config
            }
        };

        if self.settings.reconcile_on_load {
            self.reconcile(&mut config).await?;
        }

        Ok(config)
    }

    /// Create the state for a first run with operator-chosen values
    pub async fn create(&self, primary_port: u16, app_dir: &Path) -> Result<RouterConfig> {
        if self.exists() {
            return Err(RouterError::validation(format!(
                "router state already exists at {}",
                self.settings.state_file.display()
            )));
        }
        check_port(primary_port)?;
        check_app_dir(app_dir)?;

        let public_host = self.resolver.resolve().await;
        let mut config = self.template(public_host);
        config.set_primary_port(primary_port);
        config.remove_port(self.settings.primary_port);
        config.app_dir = app_dir.to_path_buf();

        self.save(&config)?;
        info!(port = primary_port, app_dir = %app_dir.display(), "Created router state");
        Ok(config)
    }

    /// Persist the full config, replacing the previous file
    pub fn save(&self, config: &RouterConfig) -> Result<()> {
        state::save_file(&self.settings.state_file, config)
    }

    /// Correct installed flags from live observations; persists on change
    pub async fn reconcile(&self, config: &mut RouterConfig) -> Result<ReconcileReport> {
        let report = probe::reconcile(config, self.probe.as_ref()).await;
        if !report.is_empty() {
            self.save(config)?;
        }
        Ok(report)
    }

    fn layout(&self, config: &RouterConfig) -> ProxyLayout {
        ProxyLayout {
            nginx_conf: config.nginx_conf.clone(),
            enabled_link: self.settings.paths.enabled_link.clone(),
            legacy_paths: self.settings.paths.legacy_paths.clone(),
        }
    }

    fn control(&self) -> ProxyControl<'_> {
        ProxyControl::new(self.runner.as_ref(), &self.settings.proxy)
    }

    /// Render and write the main proxy config for `config`
    pub fn regenerate(&self, config: &RouterConfig) -> Result<ConfigSnapshot> {
        self.layout(config).write(&render_main_config(config))
    }

    /// Put back the main config captured before a [`regenerate`](Self::regenerate)
    pub fn restore(&self, config: &RouterConfig, snapshot: ConfigSnapshot) -> Result<()> {
        self.layout(config).restore(snapshot)
    }

    /// Syntax-check the proxy config and reload on success
    pub async fn validate_and_apply(&self) -> Result<()> {
        self.control().validate_and_apply().await
    }

    /// Regenerate, then apply; the previous main config is restored if the
    /// proxy rejects the new one
    pub async fn rebuild(&self, config: &RouterConfig) -> Result<()> {
        let snapshot = self.regenerate(config)?;
        if let Err(e) = self.control().check_syntax().await {
            self.restore_or_warn(config, snapshot);
            return Err(e);
        }
        self.control().reload().await
    }

    fn restore_or_warn(&self, config: &RouterConfig, snapshot: ConfigSnapshot) {
        if let Err(e) = self.restore(config, snapshot) {
            warn!(error = %e, "Failed to restore previous proxy configuration");
        }
    }

    /// Swap in a config with a changed port list once the proxy accepts it
    async fn commit_ports(&self, config: &mut RouterConfig, candidate: RouterConfig) -> Result<()> {
        let snapshot = self.regenerate(&candidate)?;
        if let Err(e) = self.control().check_syntax().await {
            self.restore_or_warn(&candidate, snapshot);
            return Err(e);
        }

        *config = candidate;
        self.save(config)?;
        self.control().reload().await
    }

    pub async fn add_port(&self, config: &mut RouterConfig, port: u16) -> Result<()> {
        check_port(port)?;
        if config.has_port(port) {
            return Err(RouterError::validation(format!(
                "port {} is already a listening port",
                port
            )));
        }

        let mut candidate = config.clone();
        candidate.push_port(port);
        self.commit_ports(config, candidate).await?;

        info!(port, ports = ?config.ports(), "Listening port added");
        Ok(())
    }

    /// Remove a port that carries no routes
    pub async fn remove_port(&self, config: &mut RouterConfig, port: u16) -> Result<()> {
        if !config.has_port(port) {
            return Err(RouterError::not_found(format!("port {} is not a listening port", port)));
        }
        let live = config.routes_on_port(port).count();
        if live > 0 {
            return Err(RouterError::validation(format!(
                "port {} still has {} route(s); remove them first",
                port, live
            )));
        }

        let mut candidate = config.clone();
        if !candidate.remove_port(port) {
            return Err(RouterError::validation(format!(
                "port {} is the only listening port",
                port
            )));
        }
        self.commit_ports(config, candidate).await?;

        info!(port, ports = ?config.ports(), "Listening port removed");
        Ok(())
    }

    /// Make `port` the primary (default) listener, adding it if new
    pub async fn set_primary_port(&self, config: &mut RouterConfig, port: u16) -> Result<()> {
        check_port(port)?;
        if config.primary_port() == port {
            return Ok(());
        }

        let mut candidate = config.clone();
        candidate.set_primary_port(port);
        self.commit_ports(config, candidate).await?;

        info!(port, "Primary port changed");
        Ok(())
    }

    pub fn set_public_host(&self, config: &mut RouterConfig, host: &str) -> Result<()> {
        let host = host.trim();
        if host.is_empty() || host.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(RouterError::validation(format!("invalid public host '{}'", host)));
        }
        config.public_host = host.to_string();
        self.save(config)?;
        info!(host, "Public host changed");
        Ok(())
    }

    pub fn set_app_dir(&self, config: &mut RouterConfig, dir: &Path) -> Result<()> {
        check_app_dir(dir)?;
        config.app_dir = dir.to_path_buf();
        self.save(config)?;
        info!(app_dir = %dir.display(), "Application directory changed");
        Ok(())
    }

    /// Add or replace the route `(port, path)`.
    ///
    /// The fragment is provisional until the proxy accepts the regenerated
    /// config. On rejection every file touched is restored and `config` is
    /// left unchanged, in memory and on disk.
    pub async fn add_route(
        &self,
        config: &mut RouterConfig,
        port: u16,
        path: &str,
        name: &str,
        backend_port: u16,
    ) -> Result<RouteKey> {
        if !config.has_port(port) {
            return Err(RouterError::validation(format!(
                "port {} is not a listening port; add it first",
                port
            )));
        }
        check_path(path)?;
        if backend_port == 0 {
            return Err(RouterError::validation("backend port must be greater than 0"));
        }
        if name.trim().is_empty() {
            return Err(RouterError::validation("route name must not be empty"));
        }
        let clean = sanitize_name(name);
        if clean.is_empty() {
            return Err(RouterError::validation(format!(
                "route name '{}' has no usable characters (allowed: A-Z a-z 0-9 - _)",
                name
            )));
        }
        if clean != name {
            warn!(given = name, used = %clean, "Stripped disallowed characters from route name");
        }

        let key = RouteKey::new(port, normalize_path(path));
        if let Some((existing, _)) = config.route_by_name(&clean) {
            if existing != &key {
                return Err(RouterError::validation(format!(
                    "route name '{}' is already used by {}",
                    clean, existing
                )));
            }
        }

        std::fs::create_dir_all(&config.routes_dir)
            .map_err(|e| RouterError::io("Failed to create", &config.routes_dir, e))?;

        let mut changes = FragmentChanges::default();
        let staged = self.stage_route(config, &key, &clean, backend_port, &mut changes).await;
        if let Err(e) = staged {
            changes.rollback();
            return Err(e);
        }

        config.insert_route(
            key.clone(),
            Route {
                backend_port,
                name: clean.clone(),
            },
        );
        self.save(config)?;
        info!(route = %key, name = %clean, backend_port, "Route added");

        self.control().reload().await?;
        Ok(key)
    }

    /// Write fragments and the main config, then syntax-check
    async fn stage_route(
        &self,
        config: &RouterConfig,
        key: &RouteKey,
        name: &str,
        backend_port: u16,
        changes: &mut FragmentChanges,
    ) -> Result<()> {
        if let Some(old) = config.route(key).filter(|old| old.name != name) {
            changes.remove(&fragment_path(&config.routes_dir, key.port, &old.name))?;
        }
        changes.write(
            &fragment_path(&config.routes_dir, key.port, name),
            &render_fragment(name, &key.path, backend_port),
        )?;

        let snapshot = self.regenerate(config)?;
        if let Err(e) = self.control().check_syntax().await {
            self.restore_or_warn(config, snapshot);
            return Err(e);
        }
        Ok(())
    }

    /// Remove the route called `name`.
    ///
    /// A fragment left behind without a route record is deleted too. Returns
    /// the key of the removed route, if there was one.
    pub async fn remove_route(&self, config: &mut RouterConfig, name: &str) -> Result<Option<RouteKey>> {
        let found = config
            .route_by_name(name)
            .map(|(key, route)| (key.clone(), route.clone()));

        let removed = match found {
            Some((key, route)) => {
                remove_if_present(&fragment_path(&config.routes_dir, key.port, &route.name))?;
                config.remove_route(&key);
                self.save(config)?;
                info!(route = %key, name, "Route removed");
                Some(key)
            }
            None => {
                let orphans = orphan_fragments(&config.routes_dir, name);
                if orphans.is_empty() {
                    return Err(RouterError::not_found(format!("no route named '{}'", name)));
                }
                for path in orphans {
                    remove_if_present(&path)?;
                    info!(path = %path.display(), "Removed orphan route fragment");
                }
                None
            }
        };

        self.rebuild(config).await?;
        Ok(removed)
    }

    /// Routes in key order with their public URLs
    pub fn list_routes(&self, config: &RouterConfig) -> Vec<RouteView> {
        config
            .routes()
            .iter()
            .map(|(key, route)| RouteView {
                port: key.port,
                path: key.path.clone(),
                name: route.name.clone(),
                backend_port: route.backend_port,
                url: config.route_url(key),
            })
            .collect()
    }
}

fn check_port(port: u16) -> Result<()> {
    if port == 0 {
        return Err(RouterError::validation("port must be greater than 0"));
    }
    Ok(())
}

fn check_app_dir(dir: &Path) -> Result<()> {
    if dir.as_os_str().is_empty() || !dir.is_absolute() {
        return Err(RouterError::validation(format!(
            "application directory '{}' must be an absolute path",
            dir.display()
        )));
    }
    state::check_storable_path(dir).map_err(RouterError::validation)
}

/// Fragments `<any port>-<name>.conf` in the routes directory
fn orphan_fragments(routes_dir: &Path, name: &str) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(routes_dir) else {
        return Vec::new();
    };
    let mut found: Vec<PathBuf> = entries
        .flatten()
        .filter(|entry| {
            parse_fragment_file_name(&entry.file_name().to_string_lossy())
                .is_some_and(|(_, fragment_name)| fragment_name == name)
        })
        .map(|entry| entry.path())
        .collect();
    found.sort();
    found
}

/// Fragment writes that can be undone
#[derive(Default)]
struct FragmentChanges {
    undo: Vec<(PathBuf, Option<String>)>,
}

impl FragmentChanges {
    fn previous(path: &Path) -> Result<Option<String>> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RouterError::io("Failed to read", path, e)),
        }
    }

    fn write(&mut self, path: &Path, content: &str) -> Result<()> {
        let previous = Self::previous(path)?;
        std::fs::write(path, content).map_err(|e| RouterError::io("Failed to write", path, e))?;
        self.undo.push((path.to_path_buf(), previous));
        Ok(())
    }

    fn remove(&mut self, path: &Path) -> Result<()> {
        let previous = Self::previous(path)?;
        remove_if_present(path)?;
        self.undo.push((path.to_path_buf(), previous));
        Ok(())
    }

    fn rollback(self) {
        for (path, previous) in self.undo.into_iter().rev() {
            let result = match previous {
                Some(content) => std::fs::write(&path, content)
                    .map_err(|e| RouterError::io("Failed to restore", &path, e)),
                None => remove_if_present(&path).map(|_| ()),
            };
            match result {
                Ok(()) => debug!(path = %path.display(), "Rolled back fragment"),
                Err(e) => warn!(error = %e, "Failed to roll back fragment"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{display_command, CommandOutput};
    use crate::state::Component;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Accepts every config whose fragments do not contain "BROKEN"
    struct FakeNginx {
        routes_dir: PathBuf,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CommandRunner for FakeNginx {
        async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
            self.calls.lock().unwrap().push(display_command(program, args));
            let broken = args.first().map(String::as_str) == Some("-t")
                && std::fs::read_dir(&self.routes_dir)
                    .map(|entries| {
                        entries.flatten().any(|e| {
                            std::fs::read_to_string(e.path())
                                .map(|t| t.contains("BROKEN"))
                                .unwrap_or(false)
                        })
                    })
                    .unwrap_or(false);
            Ok(CommandOutput {
                status: Some(if broken { 1 } else { 0 }),
                stdout: String::new(),
                stderr: if broken { "nginx: [emerg] unknown directive \"BROKEN\"".to_string() } else { String::new() },
            })
        }
    }

    struct NoProbe;

    #[async_trait]
    impl SystemProbe for NoProbe {
        async fn observe(&self, _component: Component) -> Option<bool> {
            None
        }
    }

    fn store(dir: &Path) -> (RouterStore, Arc<FakeNginx>) {
        let mut settings = Settings::default();
        settings.state_file = dir.join("router.conf");
        settings.paths.routes_dir = dir.join("routes");
        settings.paths.nginx_conf = dir.join("sites-available/n8s.conf");
        settings.paths.enabled_link = dir.join("sites-enabled/n8s.conf");
        settings.paths.app_dir = dir.join("n8n");
        settings.paths.legacy_paths = Vec::new();

        let runner = Arc::new(FakeNginx {
            routes_dir: settings.paths.routes_dir.clone(),
            calls: Mutex::new(Vec::new()),
        });
        let store = RouterStore::new(settings)
            .with_runner(runner.clone())
            .with_probe(Arc::new(NoProbe))
            .with_resolver(Arc::new(crate::publicip::StaticResolver("198.51.100.4".to_string())));
        (store, runner)
    }

    #[tokio::test]
    async fn test_add_route_rejects_unknown_port_before_writing() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (store, runner) = store(tmp.path());
        let mut config = store.load().await.unwrap();

        let err = store
            .add_route(&mut config, 9999, "/api/", "api", 8080)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
        assert!(!config.routes_dir.exists());
        assert!(runner.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_add_route_validation() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (store, _) = store(tmp.path());
        let mut config = store.load().await.unwrap();

        assert!(store.add_route(&mut config, 1440, "", "a", 80).await.is_err());
        assert!(store.add_route(&mut config, 1440, "/a/", "", 80).await.is_err());
        assert!(store.add_route(&mut config, 1440, "/a/", "!!", 80).await.is_err());
        assert!(store.add_route(&mut config, 1440, "/a/", "a", 0).await.is_err());
        assert!(store.add_route(&mut config, 1440, "/a b/", "a", 80).await.is_err());
        assert!(config.routes().is_empty());
    }

    #[tokio::test]
    async fn test_add_route_strips_name() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (store, _) = store(tmp.path());
        let mut config = store.load().await.unwrap();

        let key = store
            .add_route(&mut config, 1440, "hooks", "../web hooks", 5678)
            .await
            .unwrap();

        assert_eq!(key, RouteKey::new(1440, "/hooks/"));
        assert_eq!(config.route(&key).unwrap().name, "webhooks");
        assert!(config.routes_dir.join("1440-webhooks.conf").exists());
    }

    #[tokio::test]
    async fn test_duplicate_name_on_other_key_rejected() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (store, _) = store(tmp.path());
        let mut config = store.load().await.unwrap();

        store.add_route(&mut config, 1440, "/a/", "svc", 8080).await.unwrap();
        let err = store
            .add_route(&mut config, 1440, "/b/", "svc", 8081)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already used by 1440:/a/"));
    }

    #[tokio::test]
    async fn test_replacing_key_with_new_name_drops_old_fragment() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (store, _) = store(tmp.path());
        let mut config = store.load().await.unwrap();

        store.add_route(&mut config, 1440, "/a/", "old", 8080).await.unwrap();
        store.add_route(&mut config, 1440, "/a/", "new", 9090).await.unwrap();

        let route = config.route(&RouteKey::new(1440, "/a/")).unwrap();
        assert_eq!(route.name, "new");
        assert_eq!(route.backend_port, 9090);
        assert!(!config.routes_dir.join("1440-old.conf").exists());
        assert!(config.routes_dir.join("1440-new.conf").exists());
        assert_eq!(config.routes().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_replacement_restores_old_fragment() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (store, _) = store(tmp.path());
        let mut config = store.load().await.unwrap();

        store.add_route(&mut config, 1440, "/a/", "old", 8080).await.unwrap();
        let old_fragment = std::fs::read_to_string(config.routes_dir.join("1440-old.conf")).unwrap();

        // an unrelated broken file makes the syntax check fail
        std::fs::write(config.routes_dir.join("manual.conf"), "BROKEN").unwrap();
        let before = config.clone();
        let err = store
            .add_route(&mut config, 1440, "/a/", "new", 9090)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), crate::error::ErrorKind::ConfigInvalid);
        assert_eq!(config, before);
        assert_eq!(
            std::fs::read_to_string(config.routes_dir.join("1440-old.conf")).unwrap(),
            old_fragment
        );
        assert!(!config.routes_dir.join("1440-new.conf").exists());
    }

    #[tokio::test]
    async fn test_remove_port_guards() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (store, _) = store(tmp.path());
        let mut config = store.load().await.unwrap();

        // last port
        let err = store.remove_port(&mut config, 1440).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);

        store.add_port(&mut config, 9443).await.unwrap();
        store.add_route(&mut config, 9443, "/x/", "x1", 9000).await.unwrap();

        // live routes
        let err = store.remove_port(&mut config, 9443).await.unwrap_err();
        assert!(err.to_string().contains("still has 1 route"));

        store.remove_route(&mut config, "x1").await.unwrap();
        store.remove_port(&mut config, 9443).await.unwrap();
        assert_eq!(config.ports(), &[1440]);

        let err = store.remove_port(&mut config, 9443).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_set_primary_port() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (store, _) = store(tmp.path());
        let mut config = store.load().await.unwrap();

        store.add_port(&mut config, 9443).await.unwrap();
        store.set_primary_port(&mut config, 9443).await.unwrap();
        assert_eq!(config.ports(), &[9443, 1440]);

        let text = std::fs::read_to_string(&config.nginx_conf).unwrap();
        assert!(text.contains("listen 9443 default_server;"));
        assert!(text.contains("listen 1440;"));

        store.set_primary_port(&mut config, 8000).await.unwrap();
        assert_eq!(config.ports(), &[8000, 9443, 1440]);
        assert!(store.set_primary_port(&mut config, 0).await.is_err());
    }

    #[tokio::test]
    async fn test_settings_changes_persist() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (store, _) = store(tmp.path());
        let mut config = store.load().await.unwrap();

        store.set_public_host(&mut config, " router.example.com ").unwrap();
        store.set_app_dir(&mut config, Path::new("/srv/n8n")).unwrap();
        assert!(store.set_app_dir(&mut config, Path::new("relative")).is_err());
        assert!(store.set_public_host(&mut config, "two words").is_err());

        let reloaded = store.load().await.unwrap();
        assert_eq!(reloaded.public_host, "router.example.com");
        assert_eq!(reloaded.app_dir, PathBuf::from("/srv/n8n"));
    }

    #[tokio::test]
    async fn test_app_dir_must_round_trip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (router, _) = store(tmp.path());
        let mut config = router.load().await.unwrap();

        let err = router
            .set_app_dir(&mut config, Path::new("/srv/a\nb"))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
        assert!(router.set_app_dir(&mut config, Path::new("/srv/a\tb")).is_err());

        let fresh = tempfile::TempDir::new().unwrap();
        let (fresh_store, _) = store(fresh.path());
        let err = fresh_store
            .create(5000, Path::new("/srv/x\ny"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("control character"));
        assert!(!fresh_store.exists());

        #[cfg(unix)]
        {
            use std::os::unix::ffi::OsStrExt;
            let raw = std::ffi::OsStr::from_bytes(b"/srv/\xff");
            assert!(router.set_app_dir(&mut config, Path::new(raw)).is_err());
        }

        // the file on disk still loads
        let reloaded = router.load().await.unwrap();
        assert_eq!(reloaded, config);
    }

    #[tokio::test]
    async fn test_create_with_chosen_port() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (store, _) = store(tmp.path());

        let config = store.create(5000, Path::new("/srv/app")).await.unwrap();
        assert_eq!(config.ports(), &[5000]);
        assert_eq!(config.public_host, "198.51.100.4");

        let err = store.create(5000, Path::new("/srv/app")).await.unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn test_list_routes_includes_urls() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (store, _) = store(tmp.path());
        let mut config = store.load().await.unwrap();

        store.add_route(&mut config, 1440, "/api", "api1", 8080).await.unwrap();
        let views = store.list_routes(&config);

        assert_eq!(
            views,
            vec![RouteView {
                port: 1440,
                path: "/api/".to_string(),
                name: "api1".to_string(),
                backend_port: 8080,
                url: "http://198.51.100.4:1440/api/".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_remove_orphan_fragment() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (store, _) = store(tmp.path());
        let mut config = store.load().await.unwrap();

        std::fs::create_dir_all(&config.routes_dir).unwrap();
        let orphan = config.routes_dir.join("1440-stale.conf");
        std::fs::write(&orphan, render_fragment("stale", "/stale/", 3000)).unwrap();

        let removed = store.remove_route(&mut config, "stale").await.unwrap();
        assert!(removed.is_none());
        assert!(!orphan.exists());
    }
}
