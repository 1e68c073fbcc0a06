use std::process::ExitCode;

mod cli;
pub(crate) mod config;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    cli::run().await
}
