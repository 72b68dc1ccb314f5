//! Observing the live system and correcting stale installed flags
//!
//! Stored flags can be invalidated out of band (a manual `systemctl stop`,
//! a removed container). Reconciliation trusts the live system: wherever an
//! observation is available and disagrees with the stored flag, the flag is
//! corrected and the change is reported.

use crate::config::{AppSettings, ProxySettings};
use crate::docker::{lookup_timeout, ContainerLookup};
use crate::exec::CommandRunner;
use crate::state::{Component, RouterConfig};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

/// Source of truth for what is actually installed and running
#[async_trait]
pub trait SystemProbe: Send + Sync {
    /// Observed state of `component`, or `None` if it cannot be determined
    async fn observe(&self, component: Component) -> Option<bool>;
}

/// One corrected flag
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlagChange {
    pub component: Component,
    pub stored: bool,
    pub observed: bool,
}

/// Flags corrected by a reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub changes: Vec<FlagChange>,
    /// Components whose state could not be observed
    pub unknown: Vec<Component>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Compare every installed flag with the probe and correct disagreements
pub async fn reconcile(config: &mut RouterConfig, probe: &dyn SystemProbe) -> ReconcileReport {
    let mut report = ReconcileReport::default();

    for component in Component::ALL {
        let stored = config.is_installed(component);
        match probe.observe(component).await {
            Some(observed) if observed != stored => {
                info!(%component, stored, observed, "Correcting stale installed flag");
                config.set_installed(component, observed);
                report.changes.push(FlagChange {
                    component,
                    stored,
                    observed,
                });
            }
            Some(_) => {}
            None => {
                debug!(%component, "Component state unknown, keeping stored flag");
                report.unknown.push(component);
            }
        }
    }

    report
}

/// Probe backed by the host's proxy binary, systemd and Docker daemon
pub struct HostProbe {
    runner: Arc<dyn CommandRunner>,
    proxy: ProxySettings,
    app: AppSettings,
}

impl HostProbe {
    pub fn new(runner: Arc<dyn CommandRunner>, proxy: ProxySettings, app: AppSettings) -> Self {
        Self { runner, proxy, app }
    }

    /// A probe command that fails or cannot start counts as "no"
    async fn succeeds(&self, program: &str, args: &[&str]) -> bool {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        match self.runner.run(program, &args).await {
            Ok(output) => output.success(),
            Err(e) => {
                debug!(program, error = %e, "Probe command failed");
                false
            }
        }
    }

    async fn proxy_running(&self) -> bool {
        self.succeeds(&self.proxy.binary, &["-v"]).await
            && self
                .succeeds("systemctl", &["is-active", "--quiet", self.proxy.service.as_str()])
                .await
    }

    async fn app_container_present(&self) -> Option<bool> {
        let lookup = async {
            let docker = ContainerLookup::connect(self.app.docker_host.as_deref()).await?;
            docker.exists(&self.app.container_name).await
        };

        match tokio::time::timeout(lookup_timeout(), lookup).await {
            Ok(Ok(present)) => Some(present),
            Ok(Err(e)) => {
                debug!(error = %e, "Docker lookup failed");
                None
            }
            Err(_) => {
                debug!("Docker lookup timed out");
                None
            }
        }
    }
}

#[async_trait]
impl SystemProbe for HostProbe {
    async fn observe(&self, component: Component) -> Option<bool> {
        match component {
            Component::Proxy => Some(self.proxy_running().await),
            Component::Docker => Some(self.succeeds("docker", &["--version"]).await),
            Component::App => self.app_container_present().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::exec::{display_command, CommandOutput};
    use std::collections::HashMap;

    struct FixedProbe(HashMap<Component, Option<bool>>);

    #[async_trait]
    impl SystemProbe for FixedProbe {
        async fn observe(&self, component: Component) -> Option<bool> {
            self.0.get(&component).copied().flatten()
        }
    }

    fn config() -> RouterConfig {
        RouterConfig::new(1440, "h", "/r", "/a", "/n.conf")
    }

    #[tokio::test]
    async fn test_reconcile_corrects_disagreements() {
        let mut config = config();
        config.set_installed(Component::Proxy, true);
        config.set_installed(Component::App, true);

        let probe = FixedProbe(HashMap::from([
            (Component::Proxy, Some(false)),
            (Component::Docker, Some(true)),
            (Component::App, Some(true)),
        ]));
        let report = reconcile(&mut config, &probe).await;

        assert_eq!(
            report.changes,
            vec![
                FlagChange {
                    component: Component::Docker,
                    stored: false,
                    observed: true
                },
                FlagChange {
                    component: Component::Proxy,
                    stored: true,
                    observed: false
                },
            ]
        );
        assert!(!config.is_installed(Component::Proxy));
        assert!(config.is_installed(Component::Docker));
        assert!(config.is_installed(Component::App));
    }

    #[tokio::test]
    async fn test_reconcile_keeps_unknown_flags() {
        let mut config = config();
        config.set_installed(Component::App, true);

        let probe = FixedProbe(HashMap::from([
            (Component::Proxy, Some(false)),
            (Component::Docker, Some(false)),
            (Component::App, None),
        ]));
        let report = reconcile(&mut config, &probe).await;

        assert!(report.is_empty());
        assert_eq!(report.unknown, vec![Component::App]);
        assert!(config.is_installed(Component::App));
    }

    struct ListRunner {
        ok: Vec<String>,
    }

    #[async_trait]
    impl CommandRunner for ListRunner {
        async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
            let line = display_command(program, args);
            Ok(CommandOutput {
                status: Some(if self.ok.contains(&line) { 0 } else { 1 }),
                ..Default::default()
            })
        }
    }

    #[tokio::test]
    async fn test_host_probe_requires_running_proxy() {
        let runner = Arc::new(ListRunner {
            ok: vec!["nginx -v".to_string(), "docker --version".to_string()],
        });
        let probe = HostProbe::new(runner, ProxySettings::default(), AppSettings::default());

        // binary present but service inactive
        assert_eq!(probe.observe(Component::Proxy).await, Some(false));
        assert_eq!(probe.observe(Component::Docker).await, Some(true));

        let runner = Arc::new(ListRunner {
            ok: vec![
                "nginx -v".to_string(),
                "systemctl is-active --quiet nginx".to_string(),
            ],
        });
        let probe = HostProbe::new(runner, ProxySettings::default(), AppSettings::default());
        assert_eq!(probe.observe(Component::Proxy).await, Some(true));
        assert_eq!(probe.observe(Component::Docker).await, Some(false));
    }
}
