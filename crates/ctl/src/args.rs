use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use common::{netutil, version};

#[derive(Debug, Parser)]
#[command(
    name = "stapply-ctl",
    version = version::VERSION,
    about = "stapply - remote automation over a message bus"
)]
pub struct Cli {
    #[command(flatten)]
    pub globals: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Args)]
pub struct GlobalArgs {
    /// NATS server (FQDN, IP, or full URL). Defaults to STAPPLY_DEFAULT_NATS,
    /// then to the target agent id for single-agent commands.
    #[arg(long = "nats", global = true)]
    pub nats: Option<String>,

    /// Allow connection to public NATS servers (insecure).
    #[arg(long, global = true)]
    pub allow_public: bool,

    /// Per-request timeout, e.g. "5s" or "2m".
    #[arg(long, global = true, default_value = "30s", value_parser = humantime::parse_duration)]
    pub timeout: Duration,

    /// Shared secret key for payload encryption.
    #[arg(long = "sec", env = netutil::ENV_SHARED_KEY, global = true)]
    pub secret: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Check an agent's availability, version, and load.
    Ping {
        /// Agent identity to address.
        agent_id: String,
    },

    /// Gather system facts from a remote agent.
    Discover {
        /// Agent identity to address.
        agent_id: String,
    },

    /// Update an agent binary to the controller's version.
    Update {
        /// Agent identity to address.
        agent_id: String,
        /// URL the agent downloads its replacement binary from.
        #[arg(long)]
        binary_url: String,
    },

    /// Validate and summarise a plan configuration.
    Status {
        /// Path to the plan configuration file.
        #[arg(short = 'c', long = "config")]
        config: PathBuf,
    },

    /// Execute an environment's plan against its hosts.
    Run {
        /// Path to the plan configuration file.
        #[arg(short = 'c', long = "config")]
        config: PathBuf,
        /// Environment name to execute.
        #[arg(short = 'e', long = "env")]
        env: String,
    },

    /// Health checks plus a full dry-run of an environment.
    Preflight {
        /// Path to the plan configuration file.
        #[arg(short = 'c', long = "config")]
        config: PathBuf,
        /// Environment name to check.
        #[arg(short = 'e', long = "env")]
        env: String,
    },

    /// Run a single action ad hoc against an environment or one agent.
    Adhoc {
        /// Optional plan configuration; without it the target is an agent id.
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
        /// Environment name (with --config) or a bare agent id.
        #[arg(short = 'e', long = "env")]
        target: String,
        /// Action verb to execute.
        action: String,
        /// Action arguments, joined verbatim.
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },
}
