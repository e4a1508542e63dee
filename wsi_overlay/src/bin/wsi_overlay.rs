//! wsi_overlay
#![deny(missing_docs)]

use anyhow::Result;
use clap::{Parser, Subcommand};
use env_logger::{Builder, Env};
use log::info;
use std::path::PathBuf;
use wsi_overlay::layout::DEFAULT_UPLOADS_DIR;
use wsi_overlay::nucleus::configured_segmentor;
use wsi_overlay::pipeline::Pipeline;
use wsi_overlay::StageOutcome;
use wsi_parameters::Parameters;

/// Patch extraction, nucleus counting and overlay stitching for whole-slide
/// images.
#[derive(Parser, Debug)]
#[clap(version)]
struct Args {
    /// Directory holding one output directory per slide.
    #[clap(long, default_value = DEFAULT_UPLOADS_DIR)]
    uploads: PathBuf,

    /// TOML parameters file. Defaults to parameters.toml next to the
    /// executable.
    #[clap(long, value_name = "FILE")]
    parameters: Option<PathBuf>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Split slides into tissue and blank patches.
    Patch { slides: Vec<PathBuf> },
    /// Segment tissue patches, then count nuclei and draw overlays.
    Predict { slides: Vec<PathBuf> },
    /// Count nuclei and draw overlays from existing segmentation results.
    Count { slides: Vec<PathBuf> },
    /// Stitch blank and overlay patches into the downsampled merged image.
    Merge { slides: Vec<PathBuf> },
    /// Every step, slide by slide.
    Run { slides: Vec<PathBuf> },
}

fn main() -> Result<()> {
    Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let params = Parameters::load(args.parameters.as_deref())?;
    let pipeline = Pipeline::new(&args.uploads, params.clone());

    let outcomes: Vec<StageOutcome> = match &args.command {
        Command::Patch { slides } => slides.iter().map(|s| pipeline.patch(s)).collect(),
        Command::Count { slides } => slides.iter().map(|s| pipeline.count(s)).collect(),
        Command::Merge { slides } => slides.iter().map(|s| pipeline.merge(s)).collect(),
        Command::Predict { slides } => {
            let segmentor = configured_segmentor(&params.segmentor_command);
            slides
                .iter()
                .flat_map(|s| pipeline.predict(s, segmentor.as_ref()))
                .collect()
        }
        Command::Run { slides } => {
            let segmentor = configured_segmentor(&params.segmentor_command);
            pipeline.run_batch(slides, segmentor.as_ref())
        }
    };

    for outcome in &outcomes {
        println!("{}", serde_json::to_string(outcome)?);
    }
    let failed = outcomes.iter().filter(|o| !o.success).count();
    info!("{} of {} steps succeeded", outcomes.len() - failed, outcomes.len());
    if failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}
