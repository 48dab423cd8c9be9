#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(
    clippy::doc_markdown,
    clippy::uninlined_format_args,
    clippy::match_same_arms,
    clippy::needless_pass_by_value
)]

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use serde::Serialize;
use serde_json::json;

use segbridge::layout::{classify, Classification};
use segbridge::{
    builtin, imageio, BridgeError, Converter, ElementType, Runtime, SegmentationSettings,
    SemanticSegmenter,
};

/// segbridge CLI tools
#[derive(Parser)]
#[command(name = "segbridge")]
#[command(about = "segbridge CLI tools - run the segmentation collaborator and inspect array layouts")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode (only errors)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Segment images and write their masks
    Segment {
        /// Settings file (.yaml, .yml or .toml)
        #[arg(short, long)]
        settings: PathBuf,
        /// Directory receiving the masks
        #[arg(short, long, default_value = "masks")]
        output_dir: PathBuf,
        /// Segment without writing masks
        #[arg(long)]
        no_save: bool,
        /// Images to segment
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
    },
    /// Show how an image's array would cross into a native matrix
    Inspect {
        /// Image file to inspect
        input: PathBuf,
        /// Output format (json, yaml, toml)
        #[arg(short, long, default_value = "json")]
        format: InspectFormat,
        /// Inspect the transposed view of the array
        #[arg(long)]
        transpose: bool,
        /// Inspect the array flipped along this axis
        #[arg(long)]
        flip: Option<usize>,
    },
    /// Check a settings file and print the parsed result
    ValidateSettings {
        /// Settings file to validate
        file: PathBuf,
    },
}

#[derive(clap::ValueEnum, Clone)]
enum InspectFormat {
    Json,
    Yaml,
    Toml,
}

#[derive(Serialize)]
struct MatrixReport {
    mat_type: String,
    dims: Vec<usize>,
    steps: Vec<usize>,
    continuous: bool,
}

#[derive(Serialize)]
struct InspectReport {
    file: String,
    element_type: ElementType,
    extents: Vec<usize>,
    strides: Vec<isize>,
    needs_copy: bool,
    aliased: bool,
    classification: Classification,
    matrix: MatrixReport,
}

fn main() {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.quiet {
        log::LevelFilter::Error
    } else if args.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Err(e) = run(args) {
        error!("Command failed: {}", e);

        // Collaborator and settings failures are fatal for the pipeline
        let exit_code = match e.downcast_ref::<BridgeError>() {
            Some(err) if err.is_fatal() => 3,
            Some(err) if err.is_recoverable() => 1,
            Some(BridgeError::IoError(_) | BridgeError::ImageError(_)) => 1,
            _ => 2,
        };

        process::exit(exit_code);
    }
}

fn run(args: Args) -> Result<()> {
    match args.command {
        Commands::Segment {
            settings,
            output_dir,
            no_save,
            inputs,
        } => cmd_segment(&settings, &output_dir, no_save, &inputs, args.quiet),
        Commands::Inspect {
            input,
            format,
            transpose,
            flip,
        } => cmd_inspect(&input, format, transpose, flip),
        Commands::ValidateSettings { file } => cmd_validate_settings(&file),
    }
}

fn cmd_segment(
    settings_path: &Path,
    output_dir: &Path,
    no_save: bool,
    inputs: &[PathBuf],
    quiet: bool,
) -> Result<()> {
    let settings = SegmentationSettings::load(settings_path)?;
    let policy = settings.frame_error_policy;

    let runtime = Runtime::new();
    builtin::register(&runtime);
    let mut segmenter = SemanticSegmenter::initialize(Arc::clone(&runtime), settings)?;

    let progress = if quiet {
        None
    } else {
        Some(create_progress_bar(inputs.len() as u64)?)
    };

    let mut failed = 0_usize;
    for input in inputs {
        if let Some(ref pb) = progress {
            pb.set_message(input.display().to_string());
        }

        let result = if no_save {
            segmenter.segment_path(input)
        } else {
            segmenter.segment_to_file(input, output_dir, &mask_file_name(input))
        };

        match result {
            Ok(mask) => info!(
                "Segmented {} ({}x{})",
                input.display(),
                mask.rows(),
                mask.cols()
            ),
            Err(e) if policy.aborts() => {
                if let Some(ref pb) = progress {
                    pb.abandon_with_message(format!("Aborted at {}", input.display()));
                }
                return Err(e.into());
            }
            Err(e) => {
                warn!("Skipping {}: {}", input.display(), e);
                failed += 1;
            }
        }

        if let Some(ref pb) = progress {
            pb.inc(1);
        }
    }

    if let Some(ref pb) = progress {
        pb.finish_with_message("Segmentation complete!");
    }

    segmenter.shutdown()?;

    let saved_to = (!no_save).then(|| output_dir.display().to_string());
    let summary = json!({
        "processed": inputs.len() - failed,
        "failed": failed,
        "output_dir": saved_to,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn mask_file_name(input: &Path) -> String {
    let stem = input
        .file_stem()
        .map_or_else(|| "frame".into(), |stem| stem.to_string_lossy());
    format!("{}_mask.png", stem)
}

fn cmd_inspect(input: &Path, format: InspectFormat, transpose: bool, flip: Option<usize>) -> Result<()> {
    info!("Inspecting {}", input.display());

    let runtime = Runtime::new();
    let converter = Converter::new(Arc::clone(&runtime));

    let image = imageio::read_matrix(input)?;
    let object = converter.to_foreign(&image)?;
    let Some(mut array) = object.as_array().cloned() else {
        anyhow::bail!("{} holds no pixels", input.display());
    };
    if transpose {
        array = array.transposed();
    }
    if let Some(axis) = flip {
        array = array.flipped(axis)?;
    }

    let classification = classify(&array.descriptor())?;
    let matrix = converter.to_matrix(&array.clone().into())?;
    let aliased = matrix.data_ptr() == Some(array.data_ptr());

    let report = InspectReport {
        file: input.display().to_string(),
        element_type: array.element_type(),
        extents: array.extents().to_vec(),
        strides: array.strides().to_vec(),
        needs_copy: classification.needs_copy(),
        aliased,
        classification,
        matrix: MatrixReport {
            mat_type: matrix.mat_type().to_string(),
            dims: matrix.dims().to_vec(),
            steps: matrix.steps().to_vec(),
            continuous: matrix.is_continuous(),
        },
    };

    let output = match format {
        InspectFormat::Json => serde_json::to_string_pretty(&report)?,
        InspectFormat::Yaml => serde_yaml::to_string(&report)?,
        InspectFormat::Toml => toml::to_string_pretty(&report)?,
    };

    println!("{}", output);
    Ok(())
}

fn cmd_validate_settings(file: &Path) -> Result<()> {
    info!("Validating {}", file.display());

    let settings = SegmentationSettings::load(file)?;
    info!("✓ Settings are valid");

    println!("{}", serde_json::to_string_pretty(&settings)?);
    Ok(())
}

fn create_progress_bar(len: u64) -> Result<ProgressBar> {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")?
            .progress_chars("##-"),
    );
    Ok(pb)
}
