//! Command-line definitions

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use orchestrator_core::{CaptionDestination, CaptionJob, CaptionSettings};

/// Caption Studio - local image captioning with vision-language models
///
/// Examples:
///   caption-studio list
///   caption-studio download qwen2.5-vl-3b
///   caption-studio caption -m qwen2.5-vl-3b --trigger photo images/*.png
#[derive(Debug, Parser)]
#[command(
    name = "caption-studio",
    version,
    about = "Local image captioning with vision-language models",
    arg_required_else_help = true,
    propagate_version = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file path
    #[arg(long, global = true, value_name = "PATH", env = "CAPTION_STUDIO_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Hide progress bars
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List known model variants and their state
    #[command(alias = "ls")]
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Download a model variant
    #[command(alias = "pull")]
    Download {
        /// Variant id
        variant: String,
    },

    /// Delete a model variant's files
    #[command(alias = "rm")]
    Delete {
        /// Variant id
        variant: String,
    },

    /// Caption images
    Caption(CaptionArgs),
}

#[derive(Debug, Args)]
pub struct CaptionArgs {
    /// Variant id
    #[arg(short, long)]
    pub model: String,

    /// Images to caption, in order
    #[arg(required = true, value_name = "IMAGE")]
    pub images: Vec<PathBuf>,

    /// Instruction given to the model
    #[arg(short, long)]
    pub prompt: Option<String>,

    /// Prefix every caption with this word
    #[arg(short, long)]
    pub trigger: Option<String>,

    /// Comma separated words to remove from captions
    #[arg(short, long, value_delimiter = ',')]
    pub blacklist: Vec<String>,

    /// Sampling temperature
    #[arg(long)]
    pub temperature: Option<f32>,

    /// Write captions here instead of next to the images
    #[arg(short, long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Replace existing caption files
    #[arg(long)]
    pub overwrite: bool,
}

impl CaptionArgs {
    /// Builds a job, filling unset options from `defaults`
    pub fn into_job(self, defaults: CaptionSettings, destination: CaptionDestination) -> CaptionJob {
        let settings = CaptionSettings {
            system_prompt: self.prompt.unwrap_or(defaults.system_prompt),
            trigger_word: self.trigger.or(defaults.trigger_word),
            blacklist: if self.blacklist.is_empty() {
                defaults.blacklist
            } else {
                self.blacklist
            },
            temperature: self.temperature.unwrap_or(defaults.temperature),
        };
        let destination = self
            .output_dir
            .map(CaptionDestination::Directory)
            .unwrap_or(destination);

        CaptionJob::new(self.images, self.model, settings)
            .with_destination(destination)
            .with_overwrite(self.overwrite)
    }
}
