//! CLI entry point.

use clap::{CommandFactory, Parser};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use upmux_cli::commands::shutdown_timeout;
use upmux_cli::handlers::serve::ServeArgs;
use upmux_cli::handlers::sweep::SweepArgs;
use upmux_cli::{Cli, CliConfig, CliError, Commands, bootstrap, handlers};

/// `RUST_LOG` wins; otherwise `info`, or `debug` with `--verbose`.
fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact(),
        )
        .try_init()
        .ok();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        return Ok(());
    };

    let config = CliConfig::resolve(cli.config)?;
    let ctx = bootstrap(&config)?;

    match command {
        Commands::Serve {
            watch,
            shutdown_timeout: secs,
            no_sandbox,
        } => {
            let args = ServeArgs {
                watch,
                shutdown_timeout: shutdown_timeout(secs),
                no_sandbox,
            };
            handlers::serve::execute(&ctx, args).await?;
        }
        Commands::Check => handlers::check::execute(&ctx)?,
        Commands::Sweep {
            force,
            all_instances,
        } => {
            handlers::sweep::execute(&ctx, SweepArgs {
                force,
                all_instances,
            })
            .await?;
        }
        Commands::Login { server } => handlers::login::execute(&ctx, &server).await?,
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        let code = e.downcast_ref::<CliError>().map_or(1, CliError::exit_code);
        std::process::exit(code);
    }
}
