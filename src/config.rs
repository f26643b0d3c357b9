//! Process-wide state (spec §6): log verbosity, log file path, discovery
//! socket, broadcast group, channel-server socket URL. Initialized at
//! startup before the event loop; torn down only on process exit. A
//! `structopt`-derived CLI feeds a once-initialized config singleton.

use std::sync::OnceLock;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "tcf-agentd", about = "Target Communication Framework debug agent")]
pub struct AgentOptions {
    /// Address the discovery service listens/announces on.
    #[structopt(long, default_value = "239.0.0.1:1534")]
    pub discovery_addr: String,

    /// URL clients connect to for the channel server, e.g. tcp:localhost:1534.
    #[structopt(long, default_value = "tcp:localhost:1534")]
    pub channel_url: String,

    /// Bitmask of log categories to enable (see LogLevel).
    #[structopt(long, default_value = "0")]
    pub log_mask: u32,

    /// Path to the log file. Defaults to stderr when unset.
    #[structopt(long)]
    pub log_file: Option<String>,

    /// env_logger-style filter string, e.g. "debug" or "tcf_debug_core=trace".
    #[structopt(long, default_value = "info")]
    pub verbosity: String,
}

/// Immutable configuration derived once from [`AgentOptions`].
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub discovery_addr: String,
    pub channel_url: String,
    pub log_mask: u32,
    pub log_file: Option<String>,
}

impl AgentConfig {
    pub fn from_options(opts: &AgentOptions) -> AgentConfig {
        AgentConfig {
            discovery_addr: opts.discovery_addr.clone(),
            channel_url: opts.channel_url.clone(),
            log_mask: opts.log_mask,
            log_file: opts.log_file.clone(),
        }
    }
}

static CONFIG: OnceLock<AgentConfig> = OnceLock::new();

/// Initialize the process-wide config exactly once. Subsequent calls are
/// ignored, matching §6's "initialized at startup ... torn down only on
/// process exit" lifecycle.
pub fn init(config: AgentConfig) {
    let _ = CONFIG.set(config);
}

pub fn get() -> &'static AgentConfig {
    CONFIG
        .get()
        .expect("config::init must be called before config::get")
}
