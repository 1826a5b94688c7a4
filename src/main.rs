//! Siteform CLI for dependency-ordered provisioning for static website stacks.

use clap::Parser;
use siteform::cli::Cli;
use tracing_subscriber::EnvFilter;

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "siteform=warn",
        1 => "siteform=info",
        2 => "siteform=debug",
        _ => "siteform=trace",
    };
    let filter = EnvFilter::try_from_env("SITEFORM_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = siteform::cli::dispatch(cli.command).await {
        eprintln!("error: {}", e);
        std::process::exit(e.exit_code());
    }
}
