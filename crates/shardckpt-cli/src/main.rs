//! shardckpt CLI
//!
//! Drive a simulated sharded training run with checkpointing, and inspect the
//! artifacts it leaves behind.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use ndarray::{ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use shardckpt::checkpoint::format::{read_any, ArtifactBody, ArtifactHeader};
use shardckpt::distributed::launch;
use shardckpt::prelude::*;
use shardckpt::state::total_elements;
use shardckpt::utils::{abbreviate_samples, format_bytes};

#[derive(Parser)]
#[command(name = "shardckpt")]
#[command(version, about = "shardckpt - checkpointing for sharded training state", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a synthetic training loop across thread ranks with checkpointing
    Simulate(SimulateArgs),

    /// List checkpoints of an experiment
    List(RunLocation),

    /// Print the header and tensor table of one artifact
    Inspect {
        /// Artifact path
        path: PathBuf,

        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Decode every artifact of an experiment and report corruption
    Verify(RunLocation),
}

#[derive(Args)]
struct RunLocation {
    /// Checkpoint root directory
    #[arg(long, default_value = "checkpoints")]
    root: PathBuf,

    /// Experiment identifier
    #[arg(long, default_value = "sim")]
    experiment_id: String,
}

#[derive(Args)]
struct SimulateArgs {
    /// TOML run configuration; overrides the flags below
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(flatten)]
    location: RunLocation,

    /// Number of ranks
    #[arg(long, default_value = "2")]
    world_size: usize,

    /// Keep the K most recent checkpoints (-1 keeps all, 0 never saves)
    #[arg(long, default_value = "3", allow_hyphen_values = true)]
    keep: i64,

    /// Save every K samples instead of keeping a window
    #[arg(long)]
    every: Option<i64>,

    /// Only save when the marker is divisible by this
    #[arg(long, default_value = "1")]
    interval: u64,

    /// Training steps to run
    #[arg(long, default_value = "10")]
    steps: u64,

    /// Samples consumed per step
    #[arg(long, default_value = "32")]
    samples_per_step: u64,

    /// Resume from the checkpoint at this marker
    #[arg(long)]
    resume: Option<u64>,

    /// Seed for the synthetic updates
    #[arg(long, default_value = "0")]
    seed: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate(args) => simulate(&args)?,
        Commands::List(location) => list(&location)?,
        Commands::Inspect { path, json } => inspect(&path, json)?,
        Commands::Verify(location) => verify(&location)?,
    }

    Ok(())
}

fn synthetic_specs() -> ParamSpecs {
    let mut specs = ParamSpecs::new();
    specs.insert("embed.weight".into(), vec![16, 8]);
    specs.insert("block.0.weight".into(), vec![8, 8]);
    specs.insert("block.0.bias".into(), vec![8]);
    specs.insert("head.weight".into(), vec![8, 4]);
    specs
}

fn random_state(specs: &ParamSpecs, rng: &mut StdRng) -> StateDict {
    specs
        .iter()
        .map(|(name, shape)| {
            let n: usize = shape.iter().product();
            let values = (0..n).map(|_| rng.gen_range(-0.1f32..0.1)).collect();
            // Shapes come from `specs`, so this cannot fail.
            let tensor = ArrayD::from_shape_vec(IxDyn(shape), values)
                .unwrap_or_else(|_| ArrayD::zeros(IxDyn(shape)));
            (name.clone(), tensor)
        })
        .collect()
}

fn simulation_config(args: &SimulateArgs) -> Result<AppConfig> {
    let mut config = match &args.config {
        Some(path) => AppConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => {
            let mut config = AppConfig {
                experiment_id: args.location.experiment_id.clone(),
                world_size: args.world_size,
                ..AppConfig::default()
            };
            config.checkpointing.execution.checkpoint_root = args.location.root.clone();
            config.checkpointing.strategy = match args.every {
                Some(k) => StrategyConfig::SaveEveryKSteps { k },
                None => StrategyConfig::SaveKMostRecent {
                    k: args.keep,
                    interval: args.interval,
                },
            };
            config
        }
    };
    if let Some(marker) = args.resume {
        config.run_mode = RunMode::WarmStart {
            resume_marker: marker,
        };
    }
    config.validate()?;
    Ok(config)
}

/// One line of the simulation report.
struct StepReport {
    marker: u64,
    saved: bool,
    failed: bool,
    deleted: Vec<u64>,
}

fn simulate(args: &SimulateArgs) -> Result<()> {
    let config = simulation_config(args)?;
    tracing::info!(
        experiment = %config.experiment_id,
        world_size = config.world_size,
        steps = args.steps,
        "Starting simulation"
    );

    let results = launch(config.world_size, |c| simulate_rank(&config, args, &c));
    let mut reports = Vec::with_capacity(results.len());
    for (rank, result) in results.into_iter().enumerate() {
        reports.push(result.with_context(|| format!("rank {} failed", rank))?);
    }
    let (steps, retained) = reports.swap_remove(0);

    for step in &steps {
        let action = if step.failed {
            "save FAILED"
        } else if step.saved {
            "saved"
        } else {
            "-"
        };
        print!("marker {:>8}  {}", step.marker, action);
        if !step.deleted.is_empty() {
            print!("  deleted {:?}", step.deleted);
        }
        println!();
    }
    println!("Retained: {:?}", retained);
    Ok(())
}

fn simulate_rank(
    config: &AppConfig,
    args: &SimulateArgs,
    collective: &ThreadCollective,
) -> Result<(Vec<StepReport>, Vec<u64>)> {
    let rank = collective.rank();
    let ctx = RunContext::from_config(config, rank)?;
    let mut checkpointing = Checkpointing::from_config(config, &ctx)?;
    let specs = synthetic_specs();
    let hyper = OptimizerShell::default();

    let (start, mut model, mut optimizer) = match config.run_mode {
        RunMode::WarmStart { resume_marker } => {
            let (model, optimizer) = checkpointing.resume(
                resume_marker,
                ModelShell::new(specs),
                &hyper,
                collective,
            )?;
            (resume_marker, model, optimizer)
        }
        RunMode::FromScratch => {
            let shell = if ctx.is_aggregator() {
                ModelShell::from_state(random_state(&specs, &mut StdRng::seed_from_u64(args.seed)))
            } else {
                ModelShell::new(specs)
            };
            let model = ShardedModel::scatter_full_state(shell, ctx.aggregator_rank(), collective)?;
            let optimizer = ShardedOptimizer::new(hyper.clone(), &model);
            (0, model, optimizer)
        }
    };

    let mut reports = Vec::new();
    for step in 1..=args.steps {
        let mut rng = StdRng::seed_from_u64(args.seed ^ (step << 16) ^ rank as u64);
        train_step(&mut model, &mut optimizer, &hyper, &mut rng);

        let marker = start + step * args.samples_per_step;
        let outcome = checkpointing.run(marker, &model, &optimizer, collective)?;
        reports.push(StepReport {
            marker,
            saved: outcome.saved(),
            failed: outcome.save_failed(),
            deleted: outcome.deleted,
        });
    }

    Ok((reports, checkpointing.strategy().retained().to_vec()))
}

/// Fake Adam step: random gradients applied to the local shard.
fn train_step(
    model: &mut ShardedModel,
    optimizer: &mut ShardedOptimizer,
    hyper: &OptimizerShell,
    rng: &mut StdRng,
) {
    let (beta1, beta2) = (hyper.betas.0 as f32, hyper.betas.1 as f32);
    let lr = hyper.lr as f32;

    for (name, param) in model.params_mut().iter_mut() {
        let grad = param.mapv(|_| rng.gen_range(-1.0f32..1.0));
        if let Some(m) = optimizer.moments_mut().get_mut(name) {
            m.exp_avg = &m.exp_avg * beta1 + &grad * (1.0 - beta1);
            m.exp_avg_sq = &m.exp_avg_sq * beta2 + &grad.mapv(|g| g * g) * (1.0 - beta2);
            let update = &m.exp_avg / &m.exp_avg_sq.mapv(|v| v.sqrt() + hyper.eps as f32);
            *param = &*param - &(update * lr);
        }
    }
    optimizer.set_step(optimizer.step() + 1);
}

fn list(location: &RunLocation) -> Result<()> {
    let layout = CheckpointLayout::new(&location.root, location.experiment_id.as_str());
    let listings = layout.scan()?;
    if listings.is_empty() {
        println!("No checkpoints for '{}' under {}", location.experiment_id, location.root.display());
        return Ok(());
    }

    println!("{:>10}  {:>8}  {:>10}  {:>10}  status", "marker", "samples", "model", "optimizer");
    for listing in &listings {
        let size = |entity| {
            listing
                .path(entity)
                .and_then(|p| std::fs::metadata(p).ok())
                .map(|m| format_bytes(m.len()))
                .unwrap_or_else(|| "-".to_string())
        };
        let status = if listing.is_complete() {
            "complete".to_string()
        } else {
            format!("partial (missing {:?})", listing.missing())
        };
        println!(
            "{:>10}  {:>8}  {:>10}  {:>10}  {}",
            listing.marker,
            abbreviate_samples(listing.num_samples()),
            size(EntityKind::Model),
            size(EntityKind::Optimizer),
            status
        );
    }
    if let Some(latest) = layout.latest_complete()? {
        println!("Latest complete: {}", latest.marker);
    }
    Ok(())
}

fn tensor_table(body: &ArtifactBody) -> Vec<(String, Vec<usize>)> {
    match body {
        ArtifactBody::Model(state) => state
            .iter()
            .map(|(name, t)| (name.clone(), t.shape().to_vec()))
            .collect(),
        ArtifactBody::Optimizer(state) => state
            .moments
            .iter()
            .map(|(name, m)| (name.clone(), m.exp_avg.shape().to_vec()))
            .collect(),
    }
}

fn inspect(path: &Path, json: bool) -> Result<()> {
    let (header, body) = read_any(path)?;
    let tensors = tensor_table(&body);

    if json {
        let step = match &body {
            ArtifactBody::Optimizer(state) => Some(state.step),
            ArtifactBody::Model(_) => None,
        };
        let value = serde_json::json!({
            "path": path.display().to_string(),
            "entity": header.entity.as_str(),
            "version": header.version,
            "marker": header.marker,
            "num_samples": header.marker.saturating_add(1),
            "checksum": format!("{:08x}", header.checksum),
            "payload_bytes": header.payload_len,
            "optimizer_step": step,
            "tensors": tensors
                .iter()
                .map(|(name, shape)| serde_json::json!({ "name": name, "shape": shape }))
                .collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    print_header(path, &header);
    match &body {
        ArtifactBody::Model(state) => println!("  parameters: {}", total_elements(state)),
        ArtifactBody::Optimizer(state) => {
            println!("  optimizer step: {}", state.step);
            println!("  lr: {}, betas: {:?}", state.hyper.lr, state.hyper.betas);
        }
    }
    println!("  tensors:");
    for (name, shape) in &tensors {
        let numel: usize = shape.iter().product();
        println!("    {:<24} {:?} ({} elements)", name, shape, numel);
    }
    Ok(())
}

fn print_header(path: &Path, header: &ArtifactHeader) {
    println!("{}", path.display());
    println!("  entity: {}", header.entity);
    println!("  format version: {}", header.version);
    println!(
        "  marker: {} ({} samples)",
        header.marker,
        abbreviate_samples(header.marker.saturating_add(1))
    );
    println!("  checksum: {:08x}", header.checksum);
    println!("  payload: {}", format_bytes(header.payload_len));
}

fn verify(location: &RunLocation) -> Result<()> {
    let layout = CheckpointLayout::new(&location.root, location.experiment_id.as_str());
    let listings = layout.scan()?;

    let mut corrupt = 0usize;
    let mut checked = 0usize;
    for listing in &listings {
        for entity in EntityKind::ALL {
            let Some(path) = listing.path(entity) else {
                println!("PARTIAL  marker {}: {} artifact missing", listing.marker, entity);
                continue;
            };
            checked += 1;
            match read_any(path) {
                Ok((header, _)) if header.entity != entity || header.marker != listing.marker => {
                    corrupt += 1;
                    println!(
                        "BAD      {}: header says {} at marker {}",
                        path.display(),
                        header.entity,
                        header.marker
                    );
                }
                Ok(_) => println!("OK       {}", path.display()),
                Err(e) => {
                    corrupt += 1;
                    println!("CORRUPT  {}: {}", path.display(), e);
                }
            }
        }
    }

    println!("{} artifacts checked, {} corrupt", checked, corrupt);
    if corrupt > 0 {
        bail!("{} corrupt artifact(s) in '{}'", corrupt, location.experiment_id);
    }
    Ok(())
}
