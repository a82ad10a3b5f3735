use clap::Parser;
use colored::Colorize;
use tracing_subscriber::EnvFilter;

mod cli;
use cli::setup::Cli;

fn main() {
    let cli = Cli::parse();

    // RUST_LOG wins; --verbose only raises the default. Logs go to stderr.
    let default_filter = if cli.verbose {
        "keyminder=debug"
    } else {
        "keyminder=warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = cli::commands::run(cli) {
        if e.is_user_cancelled() {
            eprintln!("{}", "Cancelled.".yellow());
        } else {
            eprintln!("{} {}", "Error:".red(), e);
        }
        std::process::exit(1);
    }
}
