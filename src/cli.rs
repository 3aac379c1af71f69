use clap::{Args, Parser, Subcommand};

use resource_policy::ResourceType;

#[derive(Parser)]
#[command(name = "respolicyd", about = "Resource policy manager and demo client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the development policy manager
    Manager {
        /// Resource type to refuse (repeatable)
        #[arg(long, value_name = "TYPE")]
        deny: Vec<ResourceType>,
    },

    /// Acquire a resource set and print its events until Ctrl-C
    Acquire(AcquireArgs),
}

#[derive(Args, Debug)]
pub struct AcquireArgs {
    /// Application class, e.g. player or game
    #[arg(long)]
    pub class: String,

    /// Optional resource type (repeatable)
    #[arg(long, value_name = "TYPE")]
    pub optional: Vec<ResourceType>,

    /// Mandatory resource types
    #[arg(required = true, value_name = "TYPE")]
    pub resources: Vec<ResourceType>,

    /// Let the manager release the set when it is preempted
    #[arg(long)]
    pub auto_release: bool,

    /// Ask for a reply to every request
    #[arg(long)]
    pub always_reply: bool,
}
