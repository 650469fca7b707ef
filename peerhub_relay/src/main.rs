// CLI entry point for the peerhub relay.
//
// Starts a standalone relay that peers connect to with `Node::connect`. The
// relay admits peers into the groups named on the command line (or in a
// groups file) and forwards their messages; it never looks inside them.
// See `server.rs` for the event loop and `roster.rs` for the per-client
// state.
//
// Usage:
//   relay (--groups <G>... | --file <PATH>) [OPTIONS]
//     -i, --interface <ADDR>  Interface to bind (default: 0.0.0.0)
//     -p, --port <PORT>       Listen port (default: 65042)
//     -n, --names <PATH>      Name pool for peers that join without a name
//     -v, --verbose           Debug logging (RUST_LOG overrides)
//
// The process runs until killed.

use std::path::PathBuf;
use std::process;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use clap::{ArgGroup, Parser};
use peerhub_protocol::DEFAULT_PORT;
use peerhub_relay::config::{BUILTIN_NAMES, RelayConfig, load_list};
use peerhub_relay::server::RelayServer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Relay server for peerhub groups.
#[derive(Parser, Debug)]
#[command(name = "relay", version, about)]
#[command(group(ArgGroup::new("allowed").required(true).args(["file", "groups"])))]
struct Args {
    /// Interface address to bind.
    #[arg(short, long, default_value = "0.0.0.0")]
    interface: String,

    /// TCP port to listen on.
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// File listing the allowed groups, one per line.
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Allowed groups.
    #[arg(short, long, num_args = 1..)]
    groups: Vec<String>,

    /// File listing candidate names for peers that join without one.
    #[arg(short, long)]
    names: Option<PathBuf>,

    /// Log at debug level.
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    let config = match build_config(args) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            process::exit(1);
        }
    };

    let mut server = match RelayServer::bind(&config) {
        Ok(server) => server,
        Err(e) => {
            error!("failed to start relay: {e}");
            process::exit(1);
        }
    };
    match server.local_addr() {
        Ok(addr) => info!(%addr, "relay listening"),
        Err(e) => error!(error = %e, "could not read the bound address"),
    }

    let keep_running = AtomicBool::new(true);
    if let Err(e) = server.run(Duration::from_secs(1), &keep_running) {
        error!("relay stopped: {e}");
        process::exit(1);
    }
}

/// Map CLI arguments onto a `RelayConfig`, loading list files.
fn build_config(args: Args) -> Result<RelayConfig, peerhub_relay::config::ConfigError> {
    let groups = match &args.file {
        Some(path) => load_list(path)?,
        None => args.groups,
    };
    let names = match &args.names {
        Some(path) => load_list(path)?,
        None => BUILTIN_NAMES.iter().map(|n| (*n).to_owned()).collect(),
    };

    Ok(RelayConfig {
        interface: args.interface,
        port: args.port,
        groups,
        names,
        ..RelayConfig::default()
    })
}

#[cfg(test)]
mod tests {
    use std::ffi::OsStr;
    use std::io::Write;

    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn groups_or_file_required() {
        assert!(Args::try_parse_from(["relay"]).is_err());
        assert!(Args::try_parse_from(["relay", "--groups", "a", "--file", "g.txt"]).is_err());
    }

    #[test]
    fn groups_flag_maps_onto_config() {
        let args = Args::try_parse_from(["relay", "-g", "net_demo", "lobby", "-p", "7000"]).unwrap();
        let config = build_config(args).unwrap();
        assert_eq!(config.groups, vec!["net_demo", "lobby"]);
        assert_eq!(config.port, 7000);
        assert_eq!(config.interface, "0.0.0.0");
        assert_eq!(config.names.len(), BUILTIN_NAMES.len());
    }

    #[test]
    fn names_file_replaces_pool() {
        let mut groups = tempfile::NamedTempFile::new().unwrap();
        writeln!(groups, "room").unwrap();
        let mut names = tempfile::NamedTempFile::new().unwrap();
        writeln!(names, "Ada\nGrace").unwrap();

        let args = Args::try_parse_from([
            OsStr::new("relay"),
            OsStr::new("--file"),
            groups.path().as_os_str(),
            OsStr::new("--names"),
            names.path().as_os_str(),
        ])
        .unwrap();
        let config = build_config(args).unwrap();
        assert_eq!(config.groups, vec!["room"]);
        assert_eq!(config.names, vec!["Ada", "Grace"]);
    }
}
