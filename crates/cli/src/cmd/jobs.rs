use crate::output::print_json;
use crate::runtime::Runtime;

#[derive(Debug, clap::Subcommand)]
pub enum Commands {
    /// Registered job ids and names
    #[command(alias = "ls")]
    List,
}

pub fn run(runtime: &Runtime, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::List => print_json(&runtime.registry.list()),
    }
}
