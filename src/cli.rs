use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "nextup",
    version,
    about = "Play the next unwatched episode in mpv and track watch progress"
)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(short = 'P', long, global = true, default_value = "series")]
    pub profile: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Play,
    Status,
    Reset { episode: String },
}
