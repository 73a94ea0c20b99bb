//! Subcommands.

use std::time::Duration;

use clap::Subcommand;

/// Default bound on graceful shutdown, in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 10;

#[derive(Subcommand)]
pub enum Commands {
    /// Run the supervisor until Ctrl-C
    Serve {
        /// Reload the config file when it changes on disk
        #[arg(short, long)]
        watch: bool,
        /// Seconds to wait for actors to stop before sweeping containers
        #[arg(long, default_value_t = DEFAULT_SHUTDOWN_TIMEOUT_SECS)]
        shutdown_timeout: u64,
        /// Never start docker containers, even for isolated servers
        #[arg(long)]
        no_sandbox: bool,
    },

    /// Validate the config file and list configured servers
    Check,

    /// Stop containers left behind by previous runs
    Sweep {
        /// Remove containers with `docker rm -f` instead of stopping them
        #[arg(short, long)]
        force: bool,
        /// Sweep containers from every upmux instance on this host
        #[arg(long)]
        all_instances: bool,
    },

    /// Run the interactive OAuth flow for a server and store the token
    Login {
        /// Server name as it appears in the config
        server: String,
    },
}

/// Shutdown bound from the `--shutdown-timeout` flag.
pub const fn shutdown_timeout(secs: u64) -> Duration {
    Duration::from_secs(secs)
}
