use std::path::PathBuf;

use clap::Args;

#[derive(Args, Debug)]
pub struct Run {
    /// Path to the node configuration file.
    #[clap(long, short, default_value = "crest.toml")]
    pub config: PathBuf,
}
