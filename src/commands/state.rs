use anyhow::Result;
use colored::Colorize;

use super::Session;
use crate::Context;
use crate::ui;

pub fn run(ctx: &Context) -> Result<()> {
    let session = Session::open(ctx)?;
    if session.state.resources.is_empty() {
        ui::info("No resources in state");
        return Ok(());
    }

    ui::header(&format!("Managed resources ({})", session.state.resources.len()));
    for stored in &session.state.resources {
        let id = stored.id.as_deref().unwrap_or("-");
        println!("  {:<20} {:<28} {} {}", stored.kind, stored.location.to_string(), stored.name.bold(), id.dimmed());
    }
    if ctx.verbose > 0 {
        ui::kv("state", &session.store.state_path().display().to_string());
        ui::kv("device", &session.store.device_path().display().to_string());
    }
    Ok(())
}
