use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use n8s::config::Settings;
use n8s::probe::ReconcileReport;
use n8s::{RouterConfig, RouterStore, VERSION};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// n8s - multi-port nginx router for a self-hosted n8n host
#[derive(Parser)]
#[command(name = "n8s")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to the settings file (overrides N8S_CONFIG and /etc/n8s/config.toml)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the router state, prompting for the primary port and app directory
    Init {
        /// Primary listening port (prompted if omitted)
        #[arg(long)]
        port: Option<u16>,

        /// Application directory (prompted if omitted)
        #[arg(long, value_name = "DIR")]
        app_dir: Option<PathBuf>,
    },

    /// Show the router state
    Show {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Manage routes
    #[command(subcommand)]
    Route(RouteCommand),

    /// Manage listening ports
    #[command(subcommand)]
    Port(PortCommand),

    /// Rewrite the main proxy config from state, then check and reload
    Regenerate,

    /// Check the proxy config on disk and reload
    Apply,

    /// Correct installed flags from the live system
    Reconcile,

    /// Change a stored setting
    #[command(subcommand)]
    Set(SetCommand),
}

#[derive(Subcommand)]
enum RouteCommand {
    /// Add or replace a route
    Add {
        /// Listening port the route is served on
        port: u16,
        /// URL path prefix, e.g. /api/
        path: String,
        /// Unique route name
        name: String,
        /// Backend port on 127.0.0.1
        backend_port: u16,
    },

    /// Remove a route by name
    Remove { name: String },

    /// List routes
    List {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum PortCommand {
    /// Add a listening port
    Add { port: u16 },

    /// Remove a listening port without routes
    Remove { port: u16 },
}

#[derive(Subcommand)]
enum SetCommand {
    /// Host or IP printed in route URLs
    Host { host: String },

    /// Application directory
    AppDir { dir: PathBuf },

    /// Primary (default) listening port
    PrimaryPort { port: u16 },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let directive = if cli.verbose { "n8s=debug" } else { "n8s=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(directive.parse().context("invalid log directive")?),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut settings = Settings::discover(cli.config.as_deref())?;
    if matches!(cli.command, Commands::Reconcile) {
        settings.reconcile_on_load = false;
    }
    debug!(version = VERSION, state = %settings.state_file.display(), "Starting");

    let store = RouterStore::new(settings);
    let _lock = store.lock().await.context("Failed to lock router state")?;

    match cli.command {
        Commands::Init { port, app_dir } => init(&store, port, app_dir).await,
        Commands::Show { json } => {
            let config = load(&store).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                print_config(&store, &config);
            }
            Ok(())
        }
        Commands::Route(command) => route(&store, command).await,
        Commands::Port(command) => {
            let mut config = load(&store).await?;
            match command {
                PortCommand::Add { port } => {
                    store
                        .add_port(&mut config, port)
                        .await
                        .with_context(|| format!("Failed to add port {}", port))?;
                    println!("Listening on port {}", port);
                }
                PortCommand::Remove { port } => {
                    store
                        .remove_port(&mut config, port)
                        .await
                        .with_context(|| format!("Failed to remove port {}", port))?;
                    println!("Stopped listening on port {}", port);
                }
            }
            Ok(())
        }
        Commands::Regenerate => {
            let config = load(&store).await?;
            store
                .rebuild(&config)
                .await
                .context("Failed to regenerate proxy configuration")?;
            println!("Proxy configuration regenerated for ports {:?}", config.ports());
            Ok(())
        }
        Commands::Apply => {
            store
                .validate_and_apply()
                .await
                .context("Failed to apply proxy configuration")?;
            println!("Proxy configuration applied");
            Ok(())
        }
        Commands::Reconcile => {
            let mut config = load(&store).await?;
            let report = store.reconcile(&mut config).await?;
            print_report(&report);
            Ok(())
        }
        Commands::Set(command) => {
            let mut config = load(&store).await?;
            match command {
                SetCommand::Host { host } => store.set_public_host(&mut config, &host)?,
                SetCommand::AppDir { dir } => store.set_app_dir(&mut config, &dir)?,
                SetCommand::PrimaryPort { port } => store
                    .set_primary_port(&mut config, port)
                    .await
                    .with_context(|| format!("Failed to set primary port {}", port))?,
            }
            println!("Saved");
            Ok(())
        }
    }
}

async fn load(store: &RouterStore) -> Result<RouterConfig> {
    store.load().await.with_context(|| {
        format!(
            "Failed to load router state from {}",
            store.settings().state_file.display()
        )
    })
}

async fn route(store: &RouterStore, command: RouteCommand) -> Result<()> {
    let mut config = load(store).await?;

    match command {
        RouteCommand::Add {
            port,
            path,
            name,
            backend_port,
        } => {
            let key = store
                .add_route(&mut config, port, &path, &name, backend_port)
                .await
                .with_context(|| format!("Failed to add route '{}'", name))?;
            println!("Route added: {} -> 127.0.0.1:{}", config.route_url(&key), backend_port);
        }
        RouteCommand::Remove { name } => {
            match store
                .remove_route(&mut config, &name)
                .await
                .with_context(|| format!("Failed to remove route '{}'", name))?
            {
                Some(key) => println!("Route removed: {}", key),
                None => println!("Removed leftover fragment for '{}'", name),
            }
        }
        RouteCommand::List { json } => {
            let routes = store.list_routes(&config);
            if json {
                println!("{}", serde_json::to_string_pretty(&routes)?);
            } else if routes.is_empty() {
                println!("No routes configured");
            } else {
                println!("{:<20} {:<8} {:<24} {:<8} URL", "NAME", "PORT", "PATH", "BACKEND");
                for route in routes {
                    println!(
                        "{:<20} {:<8} {:<24} {:<8} {}",
                        route.name, route.port, route.path, route.backend_port, route.url
                    );
                }
            }
        }
    }

    Ok(())
}

async fn init(store: &RouterStore, port: Option<u16>, app_dir: Option<PathBuf>) -> Result<()> {
    if store.exists() {
        let config = load(store).await?;
        println!("Router state already exists");
        print_config(store, &config);
        return Ok(());
    }

    let settings = store.settings();
    let port = match port {
        Some(port) => port,
        None => prompt(
            "Primary listening port",
            &settings.primary_port.to_string(),
        )?
        .parse::<u16>()
        .context("Port must be a number between 1 and 65535")?,
    };
    let app_dir = match app_dir {
        Some(dir) => dir,
        None => PathBuf::from(prompt(
            "Application directory",
            &settings.paths.app_dir.display().to_string(),
        )?),
    };

    let config = store
        .create(port, &app_dir)
        .await
        .context("Failed to create router state")?;
    print_config(store, &config);
    println!();
    println!("Run `n8s regenerate` once nginx is installed to write the proxy configuration.");
    Ok(())
}

/// Ask on stdin; an empty answer takes the default
fn prompt(question: &str, default: &str) -> Result<String> {
    let mut stdout = std::io::stdout();
    write!(stdout, "{} [{}]: ", question, default)?;
    stdout.flush()?;

    let mut answer = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("Failed to read answer")?;

    let answer = answer.trim();
    Ok(if answer.is_empty() {
        default.to_string()
    } else {
        answer.to_string()
    })
}

fn print_config(store: &RouterStore, config: &RouterConfig) {
    println!("State file:    {}", store.settings().state_file.display());
    println!("Public host:   {}", config.public_host);
    println!("Ports:         {:?} (primary {})", config.ports(), config.primary_port());
    println!("Routes dir:    {}", config.routes_dir.display());
    println!("Proxy config:  {}", config.nginx_conf.display());
    println!("App dir:       {}", display_dir(&config.app_dir));
    for (component, installed) in config.installed_flags() {
        println!(
            "{:<14} {}",
            format!("{}:", component),
            if *installed { "installed" } else { "not installed" }
        );
    }
    println!("Routes:        {}", config.routes().len());
    for (key, route) in config.routes() {
        println!("  {:<18} {} -> 127.0.0.1:{}", route.name, config.route_url(key), route.backend_port);
    }
}

fn display_dir(path: &Path) -> String {
    if path.exists() {
        path.display().to_string()
    } else {
        format!("{} (missing)", path.display())
    }
}

fn print_report(report: &ReconcileReport) {
    if report.is_empty() {
        println!("Installed flags match the system");
    }
    for change in &report.changes {
        println!(
            "{}: {} -> {}",
            change.component,
            if change.stored { "installed" } else { "not installed" },
            if change.observed { "installed" } else { "not installed" }
        );
    }
    for component in &report.unknown {
        println!("{}: could not be observed, kept stored flag", component);
    }
}
