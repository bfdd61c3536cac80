//! Generative rehearsal CLI
//!
//! Runs class-incremental training with per-class generative replay on CSV
//! data or synthetic blobs, and inspects persisted rehearsal state.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;

use generative_rehearsal::data::{load_csv, split_into_tasks, synthetic_blobs, BlobConfig};
use generative_rehearsal::prelude::*;
use generative_rehearsal::rehearsal::DistributionRecord;
use generative_rehearsal::utils::setup_logging;

#[derive(Parser)]
#[command(name = "generative-rehearsal")]
#[command(about = "Continual learning with generative pseudo-rehearsal")]
struct Cli {
    /// Override the configured log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    InitConfig {
        #[arg(short, long, default_value = "config.toml")]
        output: PathBuf,
    },

    /// Train on CSV data (`f1,...,fD,label` with a header row)
    Run {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,

        /// Training CSV
        #[arg(long)]
        train: PathBuf,

        /// Validation CSV
        #[arg(long)]
        val: PathBuf,

        /// Comma-separated class order; ascending label order when omitted
        #[arg(long, value_delimiter = ',')]
        class_order: Option<Vec<ClassId>>,
    },

    /// Train on seeded Gaussian blobs
    Synthetic {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,

        /// Number of tasks
        #[arg(long, default_value = "3")]
        tasks: usize,

        /// Classes in every task after the first
        #[arg(long, default_value = "2")]
        classes_per_task: usize,

        /// Training rows per class
        #[arg(long, default_value = "80")]
        rows: usize,

        #[arg(long, default_value = "42")]
        seed: u64,
    },

    /// Summarise a persisted rehearsal file
    Inspect {
        #[arg(short, long)]
        path: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::InitConfig { output } => {
            setup_logging(cli.log_level.as_deref().unwrap_or("info"));
            Config::create_default(&output)?;
            info!("Wrote default configuration to {}", output.display());
        }

        Commands::Run {
            config,
            train,
            val,
            class_order,
        } => {
            let config = load_config(&config, cli.log_level.as_deref())?;
            let train = load_csv(&train)?;
            let val = load_csv(&val)?;
            let class_order = class_order.unwrap_or_else(|| train.classes());
            let report = run_pipeline(&config, &train, &val, &class_order)?;
            print_summary(&report);
        }

        Commands::Synthetic {
            config,
            tasks,
            classes_per_task,
            rows,
            seed,
        } => {
            let mut config = load_config(&config, cli.log_level.as_deref())?;
            if tasks == 0 || classes_per_task == 0 {
                bail!("--tasks and --classes-per-task must be at least 1");
            }
            config.training.increment = classes_per_task;
            config.validate()?;

            let blobs = BlobConfig {
                num_classes: config.training.base_increment + (tasks - 1) * classes_per_task,
                rows_per_class: rows,
                dim: config.model.feature_dim,
                seed,
                ..Default::default()
            };
            info!(
                "Generated {} classes of {}-dimensional blobs",
                blobs.num_classes, blobs.dim
            );
            let (train, val) = synthetic_blobs(&blobs);
            let class_order: Vec<ClassId> = (0..blobs.num_classes).collect();
            let report = run_pipeline(&config, &train, &val, &class_order)?;
            print_summary(&report);
        }

        Commands::Inspect { path } => {
            setup_logging(cli.log_level.as_deref().unwrap_or("warn"));
            let snapshot = RehearsalSnapshot::load(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            println!(
                "{}: version {}, {} with {} classes",
                path.display(),
                snapshot.version,
                snapshot.kind,
                snapshot.classes.len()
            );
            for class in &snapshot.classes {
                match &class.record {
                    DistributionRecord::Gaussian { mean, .. } => {
                        println!("  class {:>4}: gaussian, dim {}", class.class_id, mean.len());
                    }
                    DistributionRecord::Mixture {
                        n_components,
                        means,
                        bic,
                        ..
                    } => {
                        println!(
                            "  class {:>4}: mixture, {} components, dim {}, bic {:.2}",
                            class.class_id,
                            n_components,
                            means.first().map(Vec::len).unwrap_or(0),
                            bic
                        );
                    }
                }
            }
        }
    }

    Ok(())
}

fn load_config(path: &Path, log_level: Option<&str>) -> anyhow::Result<Config> {
    let config = if path.exists() {
        Config::load(path)?
    } else {
        Config::default()
    };
    setup_logging(log_level.unwrap_or(&config.logging.level));
    if !path.exists() {
        info!("{} not found, using defaults", path.display());
    }
    config.validate()?;
    Ok(config)
}

fn run_pipeline(
    config: &Config,
    train: &TaskData,
    val: &TaskData,
    class_order: &[ClassId],
) -> anyhow::Result<RunReport> {
    let tasks = split_into_tasks(
        train,
        val,
        class_order,
        config.training.base_increment,
        config.training.increment,
    )?;
    info!(
        "{} tasks over {} classes: {:?}",
        tasks.num_tasks(),
        tasks.total_classes(),
        tasks.classes_per_task
    );

    let model_config = ModelConfig {
        feature_dim: tasks.feature_dim(),
        initial_classes: tasks.classes_per_task[0],
        ..config.model.clone()
    };
    let model = IncrementalClassifier::new(model_config)?;
    let rehearsal = build_rehearsal(config.rehearsal_config())?;

    let mut trainer = ContinualTrainer::new(config.training.clone(), model, rehearsal, tasks)?;
    Ok(trainer.run()?)
}

fn print_summary(report: &RunReport) {
    println!();
    println!("Task  Classes  Real  Synthetic  Acc@1 per seen task");
    for task in &report.tasks {
        let accs: Vec<String> = task
            .evaluation
            .iter()
            .map(|e| format!("{:.1}", e.acc1))
            .collect();
        println!(
            "{:>4}  {:>7}  {:>4}  {:>9}  [{}]",
            task.task_id,
            task.num_classes,
            task.real_rows,
            task.synthetic_rows,
            accs.join(", ")
        );
    }
    println!();
    println!("Final accuracy:                 {:.4}", report.final_accuracy());
    println!("Average incremental accuracy:   {:.4}", report.average_incremental_accuracy);
    println!("Forgetting:                     {:.4}", report.forgetting);
    println!("Backward transfer:              {:.4}", report.backward_transfer);
    if !report.uncovered_classes.is_empty() {
        println!("Classes without rehearsal:      {:?}", report.uncovered_classes);
    }
    if let Some(path) = &report.rehearsal_path {
        println!("Rehearsal state:                {}", path.display());
    }
    if let Some(path) = &report.model_path {
        println!("Model:                          {}", path.display());
    }
}
