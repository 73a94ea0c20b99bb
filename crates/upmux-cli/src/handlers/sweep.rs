//! Sweep command handler.
//!
//! Stops (or force-removes) containers labeled as managed by upmux. By
//! default only this installation's instance id is targeted.

use anyhow::Result;
use upmux_core::{LabelSelector, Sandbox};

use crate::bootstrap::CliContext;
use crate::error::CliError;

pub struct SweepArgs {
    pub force: bool,
    pub all_instances: bool,
}

pub async fn execute(ctx: &CliContext, args: SweepArgs) -> Result<()> {
    let sandbox = ctx
        .sandbox()
        .await
        .ok_or_else(|| CliError::Sandbox("docker is not available".to_string()))?;

    let selector = selector_for(sandbox.instance_id(), args.all_instances);
    let swept = if args.force {
        sandbox.remove_by_label(&selector).await
    } else {
        sandbox.stop_by_label(&selector).await
    };
    let ids = swept.map_err(CliError::from)?;

    if ids.is_empty() {
        println!("No managed containers found.");
    } else {
        let verb = if args.force { "Removed" } else { "Stopped" };
        println!("{verb} {} container(s):", ids.len());
        for id in ids {
            println!("  {id}");
        }
    }
    Ok(())
}

fn selector_for(instance_id: &str, all_instances: bool) -> LabelSelector {
    if all_instances {
        LabelSelector::AllManaged
    } else {
        LabelSelector::Instance(instance_id.to_string())
    }
}
