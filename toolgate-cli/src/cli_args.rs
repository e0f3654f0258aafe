use std::path::PathBuf;

use clap::Args;
use clap::Parser;
use clap::Subcommand;
use toolgate_security::ActionError;
use toolgate_security::ActionRequest;

#[derive(Debug, Parser)]
#[command(name = "toolgate", version)]
#[command(about = "Policy-enforced tool invocation gateway", long_about = None)]
pub struct ToolgateCli {
    /// Gateway configuration file; a missing file means defaults.
    #[arg(long, global = true, env = "TOOLGATE_CONFIG", default_value = "toolgate.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve line-delimited JSON requests on stdin, one response per line on stdout.
    Serve,
    /// Check and execute a single action request given as JSON.
    Exec {
        /// e.g. `{"run_id":"r1","action":{"tool":"read_file","args":{"path":"README.md"}}}`
        request: String,
    },
    /// Policy bundle maintenance.
    Policies {
        #[command(subcommand)]
        command: PoliciesCommand,
    },
    /// Remote endpoint status.
    Endpoints {
        #[command(subcommand)]
        command: EndpointsCommand,
    },
    /// Probe the reasoning backend for tool-calling support.
    Negotiate,
    /// Show where a run would continue and which outputs it would replay.
    Resume { run_id: String },
    /// Read the audit trail.
    Audit {
        #[command(subcommand)]
        command: AuditCommand,
    },
    /// Configuration inspection.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum PoliciesCommand {
    /// Compile the bundle without installing it.
    Validate {
        /// Defaults to the configured policy directory.
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Ask the serving process to reload its bundle.
    Reload,
}

#[derive(Debug, Subcommand)]
pub enum EndpointsCommand {
    Health(HealthArgs),
}

#[derive(Debug, Args)]
pub struct HealthArgs {
    /// Probe every endpoint once before reporting.
    #[arg(long)]
    pub probe: bool,
}

#[derive(Debug, Subcommand)]
pub enum AuditCommand {
    Tail(TailArgs),
}

#[derive(Debug, Args)]
pub struct TailArgs {
    /// Omit for gateway-level events.
    pub run_id: Option<String>,
    #[arg(short = 'n', long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the effective configuration with secrets masked.
    View,
}

#[derive(Debug)]
pub enum ArgsValidationError {
    InvalidRequest(ActionError),
    ZeroLimit,
}

impl std::fmt::Display for ArgsValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArgsValidationError::InvalidRequest(err) => write!(f, "invalid action request: {err}"),
            ArgsValidationError::ZeroLimit => write!(f, "--limit must be at least 1"),
        }
    }
}

impl std::error::Error for ArgsValidationError {}

/// Checks clap cannot express. Runs before any gateway state is opened.
pub fn validate(cli: &ToolgateCli) -> Result<(), ArgsValidationError> {
    match &cli.command {
        Command::Exec { request } => parse_request(request).map(|_| ()),
        Command::Audit {
            command: AuditCommand::Tail(args),
        } if args.limit == 0 => Err(ArgsValidationError::ZeroLimit),
        _ => Ok(()),
    }
}

pub fn parse_request(text: &str) -> Result<ActionRequest, ArgsValidationError> {
    ActionRequest::parse(text).map_err(ArgsValidationError::InvalidRequest)
}
