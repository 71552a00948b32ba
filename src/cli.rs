//! Command-line interface definition.

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "storyloom",
    version,
    about = "Turn long-form text into narrated, illustrated story media",
    long_about = "Streams paragraphs to a generation service and plays back the \
narrated audio, images and video clips as they arrive. Paragraphs in the input \
are separated by blank lines."
)]
pub struct Cli {
    /// Text file to narrate; reads stdin when omitted
    pub file: Option<PathBuf>,

    /// Path to the configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// WebSocket endpoint of the generation service
    #[arg(long)]
    pub url: Option<String>,

    /// Base URL of the one-shot fallback API
    #[arg(long)]
    pub api_url: Option<String>,

    /// Request a video clip for each paragraph once its image is ready
    #[arg(long)]
    pub video: bool,

    /// Cache narration without playing it
    #[arg(long)]
    pub no_audio: bool,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Split raw input into paragraph units at blank lines.
///
/// This is the CLI's stand-in for the splitting collaborator; the session
/// itself accepts any already-split paragraph list.
pub fn split_paragraphs(text: &str) -> Vec<String> {
    text.split("\n\n")
        .map(|block| block.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|block| !block.is_empty())
        .collect()
}
