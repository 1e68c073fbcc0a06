use std::path::PathBuf;

use clap::Args;

#[derive(Args)]
pub struct Run {
    /// Path to the daemon configuration file
    #[clap(long, short)]
    pub config: PathBuf,
}
