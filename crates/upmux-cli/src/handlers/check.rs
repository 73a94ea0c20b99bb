//! Check command handler: validate the config and list servers.

use anyhow::Result;
use upmux_core::{ConfigSnapshot, ConfigSource, ServerConfig, TransportKind};

use crate::bootstrap::CliContext;

pub fn execute(ctx: &CliContext) -> Result<()> {
    let snapshot = ctx.config.current();
    if let Some(path) = ctx.config.path() {
        println!("Config: {}", path.display());
    }
    println!("Data dir: {}", ctx.data_dir.display());
    println!();
    print!("{}", render(&snapshot));
    Ok(())
}

/// One line per server, aligned on the name column.
pub fn render(snapshot: &ConfigSnapshot) -> String {
    if snapshot.is_empty() {
        return "No servers configured.\n".to_string();
    }
    let defaults = snapshot.docker_isolation();
    let width = snapshot
        .servers()
        .iter()
        .map(|s| s.name.len())
        .max()
        .unwrap_or(0);

    let mut out = String::new();
    for server in snapshot.servers() {
        let mut flags = Vec::new();
        if !server.enabled {
            flags.push("disabled");
        }
        if server.quarantined {
            flags.push("quarantined");
        }
        if server.uses_oauth() {
            flags.push("oauth");
        }
        if server.isolation_enabled(defaults) {
            flags.push("docker");
        }
        out.push_str(&format!(
            "{:<width$}  {:<16} {}{}\n",
            server.name,
            kind_label(server.transport_kind()),
            target(server),
            if flags.is_empty() {
                String::new()
            } else {
                format!("  [{}]", flags.join(", "))
            },
        ));
    }
    out.push_str(&format!("\n{} server(s), version {}\n", snapshot.len(), snapshot.version()));
    out
}

const fn kind_label(kind: TransportKind) -> &'static str {
    match kind {
        TransportKind::Stdio => "stdio",
        TransportKind::Http => "http",
        TransportKind::StreamableHttp => "streamable-http",
    }
}

fn target(server: &ServerConfig) -> String {
    match (&server.command, &server.url) {
        (Some(command), _) if server.transport_kind() == TransportKind::Stdio => {
            std::iter::once(command.as_str())
                .chain(server.args.iter().map(String::as_str))
                .collect::<Vec<_>>()
                .join(" ")
        }
        (_, Some(url)) => url.clone(),
        _ => String::new(),
    }
}
