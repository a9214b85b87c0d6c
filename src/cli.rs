use clap::{Parser, Subcommand};
use clap_complete::Shell;
use reconcile::Location;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "panos-reconcile")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Plan and apply declared firewall configuration", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Provider config file (default: <config dir>/config.toml)
    #[arg(long, global = true, env = "PANOS_RECONCILE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding the state file and device snapshot
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Check a declaration file without contacting the device
    Validate(DeclarationArgs),

    /// Show what apply would change
    Plan(DeclarationArgs),

    /// Reconcile the device with a declaration file
    Apply(ApplyArgs),

    /// Adopt an existing device object into state
    Import(ImportArgs),

    /// List resources recorded in state
    State,

    /// Describe the known resource kinds
    Schema {
        /// Kind to describe (lists all kinds when omitted)
        kind: Option<String>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, clap::Args)]
pub struct DeclarationArgs {
    /// Declaration file (.toml or .json)
    pub file: PathBuf,
}

#[derive(Debug, clap::Args)]
pub struct ApplyArgs {
    /// Declaration file (.toml or .json)
    pub file: PathBuf,

    /// Parallel operations per stage (overrides config)
    #[arg(short = 'j', long)]
    pub jobs: Option<usize>,

    /// Keep going with later stages after a failure
    #[arg(long)]
    pub continue_on_failure: bool,

    /// Skip the confirmation prompt
    #[arg(short = 'y', long)]
    pub yes: bool,

    /// Show the plan without applying it
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Debug, clap::Args)]
pub struct ImportArgs {
    /// Resource kind, e.g. address
    pub kind: String,

    /// Location: shared, panorama, device_group:NAME, template:NAME[/VSYS], template_stack:NAME
    #[arg(value_parser = parse_location)]
    pub location: Location,

    /// Object name on the device
    pub name: String,
}

/// Parse the `Display` form of a location
pub fn parse_location(s: &str) -> Result<Location, String> {
    let (kind, rest) = match s.split_once(':') {
        Some((kind, rest)) => (kind, Some(rest)),
        None => (s, None),
    };
    match (kind.replace('-', "_").as_str(), rest) {
        ("shared", None) => Ok(Location::shared()),
        ("panorama", None) => Ok(Location::panorama()),
        ("device_group", Some(name)) if !name.is_empty() => Ok(Location::device_group(name)),
        ("template_stack", Some(name)) if !name.is_empty() => Ok(Location::template_stack(name)),
        ("template", Some(rest)) if !rest.is_empty() => match rest.split_once('/') {
            Some((name, vsys)) => Ok(Location::template(name, Some(vsys))),
            None => Ok(Location::template(rest, None)),
        },
        _ => Err(format!(
            "invalid location '{s}' (expected shared, panorama, device_group:NAME, template:NAME[/VSYS] or template_stack:NAME)"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_location_forms() {
        assert_eq!(parse_location("shared").unwrap(), Location::shared());
        assert_eq!(parse_location("device_group:edge").unwrap(), Location::device_group("edge"));
        assert_eq!(parse_location("device-group:edge").unwrap(), Location::device_group("edge"));
        assert_eq!(
            parse_location("template:branch/vsys1").unwrap(),
            Location::template("branch", Some("vsys1"))
        );
        assert_eq!(parse_location("template_stack:all").unwrap(), Location::template_stack("all"));
    }

    #[test]
    fn test_parse_location_roundtrips_display() {
        for location in [
            Location::panorama(),
            Location::template("branch", None),
            Location::template("branch", Some("vsys2")),
        ] {
            assert_eq!(parse_location(&location.to_string()).unwrap(), location);
        }
    }

    #[test]
    fn test_parse_location_rejects_garbage() {
        assert!(parse_location("device_group").is_err());
        assert!(parse_location("shared:x").is_err());
        assert!(parse_location("vsys:1").is_err());
    }

    #[test]
    fn test_apply_flags() {
        let cli = Cli::try_parse_from(["panos-reconcile", "apply", "fw.toml", "-j", "2", "--yes"]).unwrap();
        let Command::Apply(args) = cli.command else {
            panic!("expected apply");
        };
        assert_eq!(args.jobs, Some(2));
        assert!(args.yes);
        assert!(!args.dry_run);
    }
}
