use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::plan::Selection;

#[derive(Parser, Debug)]
#[command(
    name = "ragnatramp",
    version,
    about = "Declarative Hyper-V VM orchestration from a YAML file"
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, default_value = "ragnatramp.yaml")]
    pub config: PathBuf,

    /// Debug logging and echo every control-plane command
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Machine-readable JSON on stdout
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Which machines a command applies to.
#[derive(Args, Debug, Clone)]
pub struct Target {
    /// Machine name from the config
    pub machine: Option<String>,

    /// Every machine in the config
    #[arg(long, conflicts_with = "machine")]
    pub all: bool,
}

impl Target {
    pub fn selection(&self) -> Selection {
        selection_of(&self.machine)
    }

    pub fn is_explicit(&self) -> bool {
        self.all || self.machine.is_some()
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check the config file without touching Hyper-V
    Validate,

    /// Show what `up` would do
    Plan,

    /// Create and start every machine in the config
    Up,

    /// Show tracked and live state of every machine
    Status,

    /// Stop machines (all when none is named)
    Halt {
        #[command(flatten)]
        target: Target,
    },

    /// Remove machines and their disks; requires a machine name or --all
    Destroy {
        #[command(flatten)]
        target: Target,
    },

    /// Take a named checkpoint (all machines when none is named)
    Checkpoint {
        /// Checkpoint name
        name: String,

        /// Machine name from the config
        machine: Option<String>,
    },

    /// Restore a named checkpoint (all machines when none is named)
    Restore {
        /// Checkpoint name
        name: String,

        /// Machine name from the config
        machine: Option<String>,
    },
}

pub fn selection_of(machine: &Option<String>) -> Selection {
    match machine {
        Some(name) => Selection::Machine(name.clone()),
        None => Selection::All,
    }
}
