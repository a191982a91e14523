use std::path::PathBuf;

use clap::Parser;
use cutout_core::PipelineConfig;

use cutout_lib::headless::RunOptions;

#[derive(Parser, Debug)]
#[command(name = "cutout")]
#[command(about = "Remove image backgrounds, writing transparent PNGs")]
struct Args {
    /// Image files or http(s) URLs
    #[arg(required = true)]
    inputs: Vec<String>,

    /// Output directory
    #[arg(short, long, default_value = "cutout-output")]
    out: PathBuf,

    /// JSON config file (defaults to ~/.config/cutout/config.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the preprocess pool size
    #[arg(long)]
    preprocess_workers: Option<usize>,

    /// Override the segment pool size
    #[arg(long)]
    segment_workers: Option<usize>,

    /// Override the postprocess pool size
    #[arg(long)]
    postprocess_workers: Option<usize>,

    /// Load the model in every segment worker before the first image
    #[arg(long)]
    preload: bool,

    /// Downscale inputs so the long edge is at most this many pixels
    #[arg(long)]
    max_dimension: Option<u32>,
}

impl Args {
    fn pipeline_config(&self) -> PipelineConfig {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::load(path),
            None => PipelineConfig::load_or_default(),
        };

        if let Some(n) = self.preprocess_workers {
            config.preprocess_workers = n;
        }
        if let Some(n) = self.segment_workers {
            config.segment_workers = n;
        }
        if let Some(n) = self.postprocess_workers {
            config.postprocess_workers = n;
        }
        if self.preload {
            config.preload_model = true;
        }
        if self.max_dimension.is_some() {
            config.max_dimension = self.max_dimension;
        }
        config
    }
}

fn main() {
    let args = Args::parse();

    cutout_lib::headless::run(RunOptions {
        config: args.pipeline_config(),
        inputs: args.inputs,
        out_dir: args.out,
    });
}
