use std::process::ExitCode;

use clap::Parser;

use portal_chat::cli::{run, CliArgs};

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();
    run(args).await
}
