//! Basic rehearsal example
//!
//! Fits per-class Gaussian and Gaussian-mixture rehearsal on synthetic blobs,
//! draws replay rows from both, and round-trips the mixture state through disk.
//!
//! Run with: cargo run --example basic_rehearsal

use generative_rehearsal::data::{synthetic_blobs, BlobConfig};
use generative_rehearsal::prelude::*;
use generative_rehearsal::utils::setup_logging;
use ndarray::Axis;

fn main() -> anyhow::Result<()> {
    setup_logging("info");

    println!("=== Generative Rehearsal Basic Example ===\n");

    let (train, _) = synthetic_blobs(&BlobConfig {
        num_classes: 4,
        rows_per_class: 120,
        dim: 3,
        ..Default::default()
    });
    let first = train.subset(&rows_of(&train, &[0, 1]));
    let second = train.subset(&rows_of(&train, &[2, 3]));
    println!(
        "Task 0: {} rows of classes {:?}",
        first.len(),
        first.classes()
    );
    println!(
        "Task 1: {} rows of classes {:?}\n",
        second.len(),
        second.classes()
    );

    let save_dir = std::env::temp_dir().join("generative_rehearsal_demo");

    for kind in [
        RehearsalKind::GaussianDistribution,
        RehearsalKind::GaussianMixtureModel,
    ] {
        let config = RehearsalConfig::new("blobs")
            .kind(kind)
            .num_samples_per_class(200)
            .seed(Some(7))
            .save_dir(&save_dir);
        let mut rehearsal = build_rehearsal(config)?;

        rehearsal.register_task(&first)?;
        rehearsal.register_task(&second)?;
        println!("{}: stored classes {:?}", kind, rehearsal.class_ids());

        let replay = rehearsal.generate(200)?;
        for class_id in rehearsal.class_ids() {
            let real = train.class_rows(class_id);
            let synthetic = replay.class_rows(class_id);
            println!(
                "  class {}: real mean {:.3?}  replay mean {:.3?}",
                class_id,
                real.mean_axis(Axis(0)).map(|m| m.to_vec()).unwrap_or_default(),
                synthetic
                    .mean_axis(Axis(0))
                    .map(|m| m.to_vec())
                    .unwrap_or_default()
            );
        }

        let path = rehearsal.save()?;
        let mut restored = build_rehearsal(rehearsal.config().clone())?;
        restored.load()?;
        println!(
            "  saved to {} and restored {} classes (identical: {})\n",
            path.display(),
            restored.len(),
            restored.snapshot() == rehearsal.snapshot()
        );
    }

    Ok(())
}

fn rows_of(data: &TaskData, classes: &[ClassId]) -> Vec<usize> {
    data.labels
        .iter()
        .enumerate()
        .filter(|(_, label)| classes.contains(label))
        .map(|(i, _)| i)
        .collect()
}
