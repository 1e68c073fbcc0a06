mod actions;
mod arguments;

use std::process::ExitCode;

use clap::Parser;

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
pub enum Cli {
    /// Run the message bus daemon, see `run --help` for more information
    Run(arguments::Run),
}

impl Cli {
    pub async fn exec(self) -> ExitCode {
        match self {
            Self::Run(args) => actions::run(args).await,
        }
    }
}

pub async fn run() -> ExitCode {
    Cli::parse().exec().await
}
