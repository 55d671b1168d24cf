//! Dead-letter commands.

use jobwarden_core::DeadLetterId;
use jobwarden_infra::jobs::DeadLetterFilter;

use crate::output::print_json;
use crate::runtime::Runtime;

#[derive(Debug, clap::Subcommand)]
pub enum Commands {
    /// List dead letters, newest first
    #[command(alias = "ls")]
    List {
        /// Only this job id
        #[arg(long)]
        job: Option<String>,

        /// Only entries that can still be retried
        #[arg(long)]
        retryable: bool,

        #[arg(long, short = 'l')]
        limit: Option<usize>,
    },

    /// Re-enqueue a dead letter and remove it
    Retry { id: DeadLetterId },

    /// Remove a dead letter without retrying it
    Archive { id: DeadLetterId },
}

pub fn run(runtime: &Runtime, command: Commands) -> anyhow::Result<()> {
    let dead_letters = runtime.queue.dead_letters();
    match command {
        Commands::List { job, retryable, limit } => {
            let entries = dead_letters.list(&DeadLetterFilter {
                job_id: job,
                can_retry: retryable.then_some(true),
                limit,
            })?;
            print_json(&serde_json::json!({
                "total": dead_letters.count()?,
                "entries": entries,
            }))
        }
        Commands::Retry { id } => print_json(&runtime.queue.retry_dead_letter(id)?),
        Commands::Archive { id } => {
            if !dead_letters.archive(id)? {
                anyhow::bail!("dead letter not found: {id}");
            }
            print_json(&serde_json::json!({ "archived": id }))
        }
    }
}
