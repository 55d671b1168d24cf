//! Alert commands.

use jobwarden_infra::alerts::ChannelKind;

use crate::output::print_json;
use crate::runtime::Runtime;

#[derive(Debug, clap::Subcommand)]
pub enum Commands {
    /// Rules, channels and throttle state
    Status,

    /// Recently triggered alerts, newest first
    History {
        #[arg(long, short = 'l', default_value_t = 20)]
        limit: usize,
    },

    /// Send a test alert, bypassing throttling
    Test {
        /// slack, email or discord (default: configured channels)
        #[arg(long)]
        channel: Option<ChannelKind>,
    },
}

pub fn run(runtime: &Runtime, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Status => print_json(&runtime.alerts.status()?),
        Commands::History { limit } => print_json(&runtime.alerts.history(limit)?),
        Commands::Test { channel } => {
            if !runtime.alerts.is_enabled() {
                anyhow::bail!("alerting is disabled; pass --alert-config with settings.enabled = true");
            }
            let report = runtime.alerts.test_alert(channel)?;
            print_json(&report)?;
            if report.deliveries.iter().all(|(_, err)| err.is_some()) {
                anyhow::bail!("test alert was not delivered on any channel");
            }
            Ok(())
        }
    }
}
