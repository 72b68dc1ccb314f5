//! Main proxy configuration: rendering, activation and apply
//!
//! The main file holds one `server` block per listening port. Route
//! fragments are pulled in by a per-port include glob, so adding or removing
//! a route only touches the routes directory; the main file changes when
//! the port list does.

use crate::config::ProxySettings;
use crate::error::{Result, RouterError};
use crate::exec::{display_command, CommandRunner};
use crate::route::fragment_glob;
use crate::state::RouterConfig;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Fixed health-check location served on every port
pub const HEALTH_PATH: &str = "/healthz";

/// Render the main configuration. Output depends only on `config`.
pub fn render_main_config(config: &RouterConfig) -> String {
    let mut out = String::from("# Generated by n8s. Manual edits are overwritten.\n");

    for (idx, port) in config.ports().iter().enumerate() {
        let default_server = if idx == 0 { " default_server" } else { "" };
        let include = fragment_glob(&config.routes_dir, *port);

        let _ = write!(
            out,
            r#"
server {{
    listen {port}{default_server};
    server_name _;

    location = {health} {{
        access_log off;
        default_type text/plain;
        return 200 "ok\n";
    }}

    location = / {{
        default_type text/plain;
        return 200 "n8s router on port {port}\n";
    }}

    include {include};
}}
"#,
            port = port,
            default_server = default_server,
            health = HEALTH_PATH,
            include = include.display(),
        );
    }

    out
}

/// Where the generated configuration lives on disk
#[derive(Debug, Clone)]
pub struct ProxyLayout {
    pub nginx_conf: PathBuf,
    pub enabled_link: PathBuf,
    /// Artifacts of format versions 1 and 2
    pub legacy_paths: Vec<PathBuf>,
}

/// Main config content before a write, used to undo it
#[derive(Debug)]
#[must_use = "a snapshot is the only way to undo a config write"]
pub struct ConfigSnapshot {
    previous: Option<String>,
}

impl ProxyLayout {
    /// Write the rendered text, activate it and clean up legacy artifacts
    pub fn write(&self, text: &str) -> Result<ConfigSnapshot> {
        let previous = match std::fs::read_to_string(&self.nginx_conf) {
            Ok(content) => Some(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(RouterError::io("Failed to read", &self.nginx_conf, e)),
        };

        let snapshot = ConfigSnapshot { previous };
        write_file(&self.nginx_conf, text)?;
        if let Err(e) = self.activate() {
            if let Err(restore_err) = self.restore(snapshot) {
                warn!(error = %restore_err, "Failed to restore previous proxy configuration");
            }
            return Err(e);
        }
        self.remove_legacy();

        debug!(path = %self.nginx_conf.display(), "Wrote proxy configuration");
        Ok(snapshot)
    }

    /// Put back the content captured in `snapshot`
    pub fn restore(&self, snapshot: ConfigSnapshot) -> Result<()> {
        match snapshot.previous {
            Some(content) => write_file(&self.nginx_conf, &content),
            None => {
                remove_if_present(&self.nginx_conf)?;
                remove_if_present(&self.enabled_link).map(|_| ())
            }
        }
    }

    /// Point the enabled link at the generated file, replacing any prior link
    fn activate(&self) -> Result<()> {
        if let Ok(target) = std::fs::read_link(&self.enabled_link) {
            if target == self.nginx_conf {
                return Ok(());
            }
        }

        if let Some(parent) = self.enabled_link.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| RouterError::io("Failed to create", parent, e))?;
        }
        remove_if_present(&self.enabled_link)?;

        #[cfg(unix)]
        std::os::unix::fs::symlink(&self.nginx_conf, &self.enabled_link)
            .map_err(|e| RouterError::io("Failed to link", &self.enabled_link, e))?;

        #[cfg(not(unix))]
        std::fs::copy(&self.nginx_conf, &self.enabled_link)
            .map(|_| ())
            .map_err(|e| RouterError::io("Failed to copy to", &self.enabled_link, e))?;

        info!(
            link = %self.enabled_link.display(),
            target = %self.nginx_conf.display(),
            "Activated proxy configuration"
        );
        Ok(())
    }

    fn remove_legacy(&self) {
        for path in &self.legacy_paths {
            if path == &self.nginx_conf || path == &self.enabled_link {
                continue;
            }
            match remove_if_present(path) {
                Ok(true) => info!(path = %path.display(), "Removed legacy proxy config"),
                Ok(false) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove legacy proxy config"),
            }
        }
    }
}

fn write_file(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| RouterError::io("Failed to create", parent, e))?;
    }
    std::fs::write(path, content).map_err(|e| RouterError::io("Failed to write", path, e))
}

/// Remove a file or symlink; returns whether anything was removed
pub(crate) fn remove_if_present(path: &Path) -> Result<bool> {
    match std::fs::symlink_metadata(path) {
        Ok(_) => std::fs::remove_file(path)
            .map(|_| true)
            .map_err(|e| RouterError::io("Failed to remove", path, e)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(RouterError::io("Failed to inspect", path, e)),
    }
}

/// Syntax check and reload through the proxy's own tooling
pub struct ProxyControl<'a> {
    runner: &'a dyn CommandRunner,
    settings: &'a ProxySettings,
}

impl<'a> ProxyControl<'a> {
    pub fn new(runner: &'a dyn CommandRunner, settings: &'a ProxySettings) -> Self {
        Self { runner, settings }
    }

    /// Run `<proxy> -t`; a rejection becomes [`RouterError::ConfigInvalid`]
    pub async fn check_syntax(&self) -> Result<()> {
        let args = vec!["-t".to_string()];
        let output = self.runner.run(&self.settings.binary, &args).await?;

        if output.success() {
            debug!("Proxy configuration syntax is valid");
            Ok(())
        } else {
            let diagnostic = output.diagnostic();
            warn!(diagnostic = %diagnostic, "Proxy configuration rejected");
            Err(RouterError::ConfigInvalid { diagnostic })
        }
    }

    /// Ask the service manager to reload the proxy
    pub async fn reload(&self) -> Result<()> {
        let (program, args) = self
            .settings
            .reload_command
            .split_first()
            .ok_or_else(|| RouterError::validation("reload command is empty"))?;

        let output = self.runner.run(program, args).await?;
        if !output.success() {
            return Err(RouterError::ExternalCommand {
                command: display_command(program, args),
                message: output.diagnostic(),
            });
        }

        info!("Proxy reloaded");
        Ok(())
    }

    /// Check, then reload. A failed check leaves the running proxy untouched.
    pub async fn validate_and_apply(&self) -> Result<()> {
        self.check_syntax().await?;
        self.reload().await
    }
}
