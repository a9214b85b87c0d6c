use anyhow::Result;
use std::path::Path;

use super::{Session, planning_failed};
use crate::Context;
use crate::display;

pub fn run(ctx: &Context, file: &Path) -> Result<()> {
    let session = Session::open(ctx)?;
    let declared = session.declared(file)?;
    let managed = session.state.keys();
    log::debug!("{} declared, {} managed", declared.len(), managed.len());

    let plan = session.engine().plan(&declared, &managed).map_err(planning_failed)?;
    display::display_plan(&plan, &session.registry, ctx.verbose > 0);
    Ok(())
}
