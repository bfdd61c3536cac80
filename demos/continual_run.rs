//! Continual run example
//!
//! Trains the incremental classifier over three class-incremental tasks of
//! synthetic blobs with mixture rehearsal, then prints the accuracy matrix
//! and forgetting metrics.
//!
//! Run with: cargo run --example continual_run

use generative_rehearsal::data::{split_into_tasks, synthetic_blobs, BlobConfig};
use generative_rehearsal::prelude::*;
use generative_rehearsal::utils::setup_logging;

fn main() -> anyhow::Result<()> {
    setup_logging("info");

    println!("=== Continual Learning with Generative Rehearsal ===\n");

    let blobs = BlobConfig {
        num_classes: 6,
        rows_per_class: 80,
        dim: 8,
        seed: 3,
        ..Default::default()
    };
    let (train, val) = synthetic_blobs(&blobs);
    let class_order: Vec<ClassId> = (0..blobs.num_classes).collect();
    let tasks = split_into_tasks(&train, &val, &class_order, 2, 2)?;
    println!(
        "{} tasks, classes per task {:?}\n",
        tasks.num_tasks(),
        tasks.classes_per_task
    );

    let model = IncrementalClassifier::new(ModelConfig {
        initial_classes: tasks.classes_per_task[0],
        feature_dim: tasks.feature_dim(),
        ..Default::default()
    })?;

    let rehearsal = build_rehearsal(
        RehearsalConfig::new("blobs")
            .kind(RehearsalKind::GaussianMixtureModel)
            .num_samples_per_class(40)
            .components_range(vec![1, 2, 3])
            .seed(Some(11)),
    )?;

    let config = TrainerConfig {
        n_epochs: 5,
        batch_size: 32,
        base_increment: 2,
        increment: 2,
        dataset_name: "blobs".to_string(),
        shuffle_seed: Some(5),
        log_every: 0,
        ..Default::default()
    };

    let mut trainer = ContinualTrainer::new(config, model, rehearsal, tasks)?;
    let report = trainer.run()?;

    for task in &report.tasks {
        println!(
            "Task {}: {} classes, {} real + {} replay rows, last epoch loss {:.4}",
            task.task_id,
            task.num_classes,
            task.real_rows,
            task.synthetic_rows,
            task.epochs.last().map(|e| e.loss).unwrap_or(f64::NAN)
        );
    }

    println!("\nAccuracy matrix (row: after task, column: evaluated task):");
    for (i, row) in report.accuracy_matrix.iter().enumerate() {
        let cells: Vec<String> = row.iter().map(|a| format!("{:.3}", a)).collect();
        println!("  after {}: [{}]", i, cells.join(", "));
    }

    println!("\nFinal accuracy:               {:.4}", report.final_accuracy());
    println!("Average incremental accuracy: {:.4}", report.average_incremental_accuracy);
    println!("Forgetting:                   {:.4}", report.forgetting);
    println!("Backward transfer:            {:.4}", report.backward_transfer);

    Ok(())
}
