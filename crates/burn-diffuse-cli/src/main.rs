//! burn-diffuse CLI
//!
//! Inspect scheduler timesteps, expand batch sweeps and dry-run diffusers
//! against a shape-only backend.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use burn::prelude::*;
use burn_diffuse::samplers::{
    BatchOptions, Scheduler, SchedulerKind, SchedulerOptions, create_scheduler, generate_batch,
};
use burn_diffuse::{
    DebugConfig, DiffuseRequest, DiffusionPipeline, DiffusionProgress, Diffuser, ModelConfig,
    ProgressSink,
};
use burn_diffuse_image::TileConfig;
use burn_ndarray::NdArray;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

mod shape_backend;

use shape_backend::ShapeBackend;

type CliBackend = NdArray<f32>;

#[derive(Parser)]
#[command(name = "burn-diffuse")]
#[command(about = "Diffusion scheduler and pipeline tools")]
#[command(version)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Scheduler option sources shared by every command
#[derive(clap::Args)]
struct OptionArgs {
    /// JSON scheduler options (missing fields use defaults)
    #[arg(long)]
    options: Option<PathBuf>,

    /// Override the scheduler
    #[arg(long)]
    scheduler: Option<SchedulerKind>,

    /// Override the number of inference steps
    #[arg(long)]
    steps: Option<usize>,

    /// Override the seed
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the timestep schedule a scheduler produces
    Schedule {
        #[command(flatten)]
        args: OptionArgs,

        /// Print the slice a diffuser would traverse instead of the full schedule
        #[arg(long)]
        diffuser: Option<Diffuser>,
    },

    /// Expand a batch sweep into per-run options
    Batch {
        #[command(flatten)]
        args: OptionArgs,

        /// JSON batch options
        #[arg(long)]
        batch: PathBuf,
    },

    /// Run a diffuser end to end against a backend that returns zeros
    DryRun {
        #[command(flatten)]
        args: OptionArgs,

        /// Diffuser variant
        #[arg(long, default_value = "text_to_image")]
        diffuser: Diffuser,

        /// Images per run
        #[arg(long, default_value = "1")]
        batch_count: usize,

        /// Prompt embedding tokens
        #[arg(long, default_value = "77")]
        tokens: usize,

        /// Prompt embedding width
        #[arg(long, default_value = "768")]
        embed_dim: usize,

        /// Decode through overlapping tiles
        #[arg(long)]
        tiled: bool,

        /// Log latent statistics every step and fail on NaN/Inf
        #[arg(long)]
        debug: bool,
    },
}

fn load_options(args: &OptionArgs) -> Result<SchedulerOptions> {
    let mut options = match &args.options {
        Some(path) => read_json(path)?,
        None => SchedulerOptions::default(),
    };
    if let Some(scheduler) = args.scheduler {
        options.scheduler = scheduler;
    }
    if let Some(steps) = args.steps {
        options.inference_steps = steps;
    }
    if let Some(seed) = args.seed {
        options.seed = seed;
    }
    options.validate().context("Invalid scheduler options")?;
    Ok(options)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
}

fn run_schedule(args: OptionArgs, diffuser: Option<Diffuser>) -> Result<()> {
    let options = load_options(&args)?;
    let device = Default::default();
    let scheduler = create_scheduler::<CliBackend>(&options, &device)
        .context("Failed to create scheduler")?;

    let timesteps = match diffuser {
        Some(diffuser) => diffuser.get_timesteps(&options, &scheduler),
        None => scheduler.timesteps().to_vec(),
    };

    println!("Scheduler:   {}", options.scheduler);
    println!("Steps:       {}", options.inference_steps);
    println!("Order:       {}", scheduler.order());
    println!("Init sigma:  {:.4}", scheduler.init_noise_sigma());
    println!("Timesteps:   {}", timesteps.len());
    for (i, t) in timesteps.iter().enumerate() {
        println!("  {:>4}  {}", i, t);
    }
    Ok(())
}

fn run_batch(args: OptionArgs, batch: &Path) -> Result<()> {
    let options = load_options(&args)?;
    let batch: BatchOptions = read_json(batch)?;
    let expanded = generate_batch(&batch, &options);
    if expanded.is_empty() {
        bail!("Batch {:?} expands to no runs", batch.kind);
    }

    println!("{} runs ({:?} sweep)", expanded.len(), batch.kind);
    println!(
        "  {:>4}  {:<16} {:>6} {:>8} {:>8} {:>12}",
        "#", "scheduler", "steps", "guidance", "strength", "seed"
    );
    for (i, run) in expanded.iter().enumerate() {
        println!(
            "  {:>4}  {:<16} {:>6} {:>8.2} {:>8.2} {:>12}",
            i, run.scheduler, run.inference_steps, run.guidance_scale, run.strength, run.seed
        );
    }
    Ok(())
}

/// Progress sink backed by an indicatif bar
struct BarProgress {
    bar: ProgressBar,
}

impl<B: Backend> ProgressSink<B> for BarProgress {
    fn notify(&self, progress: DiffusionProgress<B>) {
        self.bar.set_length(progress.steps as u64);
        self.bar.set_position(progress.step as u64);
        self.bar.set_message(format!(
            "t={} ({:.0?}/step)",
            progress.timestep, progress.elapsed
        ));
    }
}

/// Synthetic inputs for the variants that need them, in `[0, 1]`
fn dry_run_request(
    diffuser: Diffuser,
    options: SchedulerOptions,
    model: &ModelConfig,
    tokens: usize,
    embed_dim: usize,
    device: &<CliBackend as Backend>::Device,
) -> DiffuseRequest<CliBackend> {
    let (height, width) = (options.height, options.width);
    let embeds = Tensor::zeros([1, tokens, embed_dim], device);
    let mut request = DiffuseRequest::new(diffuser, embeds, options);

    if diffuser.needs_image() {
        let image = match diffuser {
            Diffuser::Upscale => {
                Tensor::full([1, 3, height / model.vae_factor, width / model.vae_factor], 0.5, device)
            }
            _ => Tensor::full([1, 3, height, width], 0.5, device),
        };
        request = request.with_input_image(image);
    }
    if diffuser.needs_mask() {
        request = request.with_mask(Tensor::ones([1, 1, height, width], device));
    }
    if diffuser.uses_control_net() {
        request = request.with_control_image(Tensor::zeros([1, 3, height, width], device), Default::default());
    }
    request
}

#[allow(clippy::too_many_arguments)]
async fn run_dry_run(
    args: OptionArgs,
    diffuser: Diffuser,
    batch_count: usize,
    tokens: usize,
    embed_dim: usize,
    tiled: bool,
    debug: bool,
) -> Result<()> {
    let options = load_options(&args)?;
    let model = match diffuser {
        Diffuser::Upscale => ModelConfig::upscaler(),
        _ => ModelConfig::sd1x(),
    };
    let model = if tiled {
        model.with_tiling(TileConfig::enabled())
    } else {
        model
    };

    let device = Default::default();
    let request = dry_run_request(diffuser, options, &model, tokens, embed_dim, &device)
        .with_batch_count(batch_count)
        .with_debug(DebugConfig {
            stats: debug,
            nan: debug,
        });
    let pipeline =
        DiffusionPipeline::<CliBackend, _>::new(ShapeBackend::new(model.clone()), model, &device);

    let bar = ProgressBar::new(request.options.inference_steps as u64);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );
    let progress = BarProgress { bar: bar.clone() };

    let cancel = CancellationToken::new();
    let images = pipeline
        .run(&request, &progress, &cancel)
        .await
        .with_context(|| format!("Dry run of {} failed", diffuser))?;
    bar.finish_and_clear();

    info!(output = ?images.dims(), "dry run finished");
    println!("{} produced {:?}", diffuser, images.dims());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to install logger")?;

    match cli.command {
        Commands::Schedule { args, diffuser } => run_schedule(args, diffuser),
        Commands::Batch { args, batch } => run_batch(args, &batch),
        Commands::DryRun {
            args,
            diffuser,
            batch_count,
            tokens,
            embed_dim,
            tiled,
            debug,
        } => run_dry_run(args, diffuser, batch_count, tokens, embed_dim, tiled, debug).await,
    }
}
