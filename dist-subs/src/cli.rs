use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::membership::NodeId;

#[derive(Parser, Debug)]
#[command(author, version, about = "Replicated subscriber directory", long_about = None)]
pub struct Cli {
    /// TOML configuration file (defaults to ./dist_subs.conf when present).
    #[arg(long, global = true, env = "DIST_SUBS_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one node; it serves only the admin port until started.
    Node(NodeArgs),
    /// Send the start command to nodes.
    Start(StartArgs),
    /// Query a node's subscriber count.
    Capacity(CapacityArgs),
    /// Register a subscriber, failing over to other nodes.
    Register(RegisterArgs),
    /// Start every node and poll their capacity periodically.
    Monitor(MonitorArgs),
}

#[derive(Args, Debug, Clone)]
pub struct NodeArgs {
    #[arg(long)]
    pub id: NodeId,
}

#[derive(Args, Debug, Clone)]
pub struct StartArgs {
    /// Nodes to start; all members when omitted.
    #[arg(long = "id")]
    pub ids: Vec<NodeId>,

    /// Overrides `fault_tolerance_level` from the configuration file.
    #[arg(long)]
    pub fault_tolerance: Option<i32>,
}

#[derive(Args, Debug, Clone)]
pub struct CapacityArgs {
    #[arg(long)]
    pub id: NodeId,

    /// Report ONLN subscribers instead of the total.
    #[arg(long)]
    pub active: bool,
}

#[derive(Args, Debug, Clone)]
pub struct RegisterArgs {
    #[arg(long)]
    pub name: String,

    #[arg(long = "interest")]
    pub interests: Vec<String>,

    /// Node to try first; a random member when omitted.
    #[arg(long)]
    pub id: Option<NodeId>,
}

#[derive(Args, Debug, Clone)]
pub struct MonitorArgs {
    #[arg(long, default_value_t = 5)]
    pub interval_secs: u64,

    /// Stop after this many polling rounds.
    #[arg(long)]
    pub rounds: Option<usize>,

    /// Address that receives every capacity sample.
    #[arg(long)]
    pub plotter: Option<SocketAddr>,

    #[arg(long)]
    pub fault_tolerance: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_accepts_repeated_ids() {
        let cli = Cli::try_parse_from(["dist-subs", "start", "--id", "1", "--id", "3", "--fault-tolerance", "2"])
            .expect("parse");
        match cli.command {
            Command::Start(args) => {
                assert_eq!(args.ids, vec![1, 3]);
                assert_eq!(args.fault_tolerance, Some(2));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn register_collects_interests() {
        let cli = Cli::try_parse_from([
            "dist-subs", "register", "--name", "Ada", "--interest", "chess", "--interest", "math",
        ])
        .expect("parse");
        match cli.command {
            Command::Register(args) => {
                assert_eq!(args.name, "Ada");
                assert_eq!(args.interests, vec!["chess".to_string(), "math".to_string()]);
                assert_eq!(args.id, None);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn node_requires_an_id() {
        assert!(Cli::try_parse_from(["dist-subs", "node"]).is_err());
    }

    #[test]
    fn config_flag_is_global() {
        let cli = Cli::try_parse_from(["dist-subs", "capacity", "--id", "2", "--config", "other.conf"])
            .expect("parse");
        assert_eq!(cli.config, Some(PathBuf::from("other.conf")));
    }
}
