use anyhow::{Result, bail};
use reconcile::{PlanDriver, Provider, ResourceKey};

use super::Session;
use crate::Context;
use crate::cli::ImportArgs;
use crate::{display, ui};

pub fn run(ctx: &Context, args: ImportArgs) -> Result<()> {
    let mut session = Session::open(ctx)?;
    let key = ResourceKey::new(args.kind.clone(), args.location.clone(), args.name.clone());
    if session.state.get(&key).is_some() {
        bail!("{key} is already managed");
    }

    let mut provider = Provider::new(session.registry.clone(), session.device.clone());
    provider.configure(session.config.clone())?;
    let response = provider.import_resource(&args.kind, &args.location, &args.name)?;
    display::display_diagnostics(&response.diagnostics);

    session.state.upsert(response.value);
    session.save_state()?;
    ui::success(&format!("Imported {key}"));
    Ok(())
}
