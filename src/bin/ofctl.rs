//! ofctl CLI binary.
//!
//! OpenFlow control-channel engine.
//!
//! # Commands
//!
//! - `serve` - Accept switches until Ctrl-C
//! - `config` - Print the effective configuration as TOML

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use ofctl::{
    codec::PortStatus, Config, Controller, DefaultDriverProvider, Dpid, RoleState,
    SwitchListener, SwitchRegistry, VERSION,
};

#[derive(Parser)]
#[command(name = "ofctl")]
#[command(version = VERSION)]
#[command(about = "OpenFlow control channel: handshake, roles and switch registry", long_about = None)]
struct Cli {
    /// Configuration file (default: ~/.config/ofctl/config.toml, then OFCTL_* variables)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the controller and accept switches
    Serve {
        /// Listening port (repeatable, overrides the configuration)
        #[arg(short, long = "port")]
        ports: Vec<u16>,

        /// Log as JSON
        #[arg(long)]
        json: bool,

        /// Join switches as equal instead of claiming master
        #[arg(long)]
        equal: bool,

        /// Enable debug logging
        #[arg(short, long)]
        verbose: bool,
    },

    /// Print the effective configuration
    Config,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config)?;

    match cli.command {
        Commands::Serve {
            ports,
            json,
            equal,
            verbose,
        } => {
            let role = if equal {
                RoleState::Equal
            } else {
                RoleState::Master
            };
            cmd_serve(config, ports, role, json, verbose)
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<Config> {
    if let Some(path) = path {
        return Ok(Config::from_file(path)?);
    }
    match Config::default_path() {
        Some(path) if path.exists() => Ok(Config::from_file(path)?),
        _ => Ok(Config::from_env()),
    }
}

fn cmd_serve(
    mut config: Config,
    ports: Vec<u16>,
    role: RoleState,
    json: bool,
    verbose: bool,
) -> anyhow::Result<()> {
    init_logging(json, verbose);

    if !ports.is_empty() {
        config = config.with_ports(ports);
    }

    let mut controller = Controller::new(config);
    let listener = Arc::new(LoggingListener {
        registry: controller.registry(),
        role,
    });
    controller.start(vec![listener], Arc::new(DefaultDriverProvider))?;
    tracing::info!("ofctl {} ready on {:?}", VERSION, controller.local_addrs());

    let signals = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    signals.block_on(tokio::signal::ctrl_c())?;

    tracing::info!("Interrupted, shutting down");
    controller.stop();
    Ok(())
}

fn init_logging(json: bool, verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Logs switch lifecycle events and requests a role from new switches.
struct LoggingListener {
    registry: Arc<SwitchRegistry>,
    role: RoleState,
}

impl SwitchListener for LoggingListener {
    fn switch_added(&self, dpid: Dpid) {
        match self.registry.get_switch(dpid) {
            Some(sw) => tracing::info!(
                "Switch {} added: {} {} ({} ports)",
                dpid,
                sw.desc().mfr_desc,
                sw.desc().hw_desc,
                sw.ports().len()
            ),
            None => tracing::info!("Switch {} added", dpid),
        }
        if let Err(e) = self.registry.set_role(dpid, self.role) {
            tracing::warn!("Cannot request role {} from {}: {}", self.role, dpid, e);
        }
    }

    fn switch_removed(&self, dpid: Dpid) {
        tracing::info!("Switch {} removed", dpid);
    }

    fn switch_changed(&self, dpid: Dpid) {
        tracing::debug!("Switch {} changed", dpid);
    }

    fn port_changed(&self, dpid: Dpid, status: &PortStatus) {
        tracing::info!(
            "Switch {} port {} ({}) {:?}",
            dpid,
            status.desc.port_no,
            status.desc.name,
            status.reason
        );
    }

    fn role_reply_received(&self, dpid: Dpid, requested: RoleState, response: RoleState) {
        if requested == response {
            tracing::info!("Switch {} confirmed role {}", dpid, response);
        } else {
            tracing::warn!(
                "Switch {} answered {} to a {} request",
                dpid,
                response,
                requested
            );
        }
    }
}
