use clap::Parser as _;

use jobwarden_cli::Cli;

fn main() {
    let cli = Cli::parse();

    if let Err(err) = jobwarden_cli::run(cli) {
        tracing::error!(error = %format!("{err:#}"), "command failed");
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
