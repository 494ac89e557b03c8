//! Checkpoint path resolution, top-k retention and restore.

use pretty_assertions::assert_eq;
use tempfile::TempDir;

use ember_core::model::{LinearHparams, LinearRegression};
use ember_core::persistence::{self, MANIFEST_FILE};
use ember_core::{ModelCheckpoint, Trainer, TrainerConfig};

fn config(dir: &TempDir, max_epochs: usize) -> TrainerConfig {
    TrainerConfig {
        progress_bar_refresh_rate: 0,
        ..TrainerConfig::default()
    }
    .with_root_dir(dir.path())
    .with_max_epochs(max_epochs)
    .with_seed(11)
}

fn model() -> LinearRegression {
    LinearRegression::new(LinearHparams {
        num_samples: 80,
        batch_size: 8,
        ..LinearHparams::default()
    })
}

#[test]
fn checkpoint_without_path_gets_its_own_dir() {
    let dir = TempDir::new().unwrap();
    let mut trainer = Trainer::builder()
        .config(config(&dir, 3))
        .checkpoint_callback(ModelCheckpoint::new(None).with_save_top_k(-1))
        .build()
        .unwrap();

    assert_ne!(trainer.ckpt_path(), trainer.default_root_dir());
    assert_eq!(
        trainer.checkpoint_callback().and_then(|cb| cb.dirpath()),
        Some(trainer.ckpt_path())
    );

    trainer.fit(&mut model()).unwrap();

    let ckpt_dir = trainer.ckpt_path().to_path_buf();
    for epoch in 0..3 {
        assert!(ckpt_dir.join(format!("epoch={epoch}.ckpt")).is_file());
    }
    assert!(ckpt_dir.join(MANIFEST_FILE).is_file());
    assert_eq!(persistence::read_manifest(&ckpt_dir).unwrap().len(), 3);
}

#[test]
fn checkpoint_registered_as_callback_still_saves() {
    let dir = TempDir::new().unwrap();
    let mut trainer = Trainer::builder()
        .config(config(&dir, 3))
        .callback(ModelCheckpoint::new(None).with_save_top_k(-1))
        .without_checkpointing()
        .build()
        .unwrap();
    assert!(trainer.callbacks().is_empty());

    let result = trainer.fit(&mut model()).unwrap();

    let ckpt_dir = trainer.ckpt_path().to_path_buf();
    for epoch in 0..3 {
        assert!(ckpt_dir.join(format!("epoch={epoch}.ckpt")).is_file());
    }
    assert_eq!(persistence::read_manifest(&ckpt_dir).unwrap().len(), 3);
    assert!(result.best_model_path.is_some());
}

#[test]
fn default_checkpoint_keeps_best_val_loss() {
    let dir = TempDir::new().unwrap();
    let mut trainer = Trainer::new(config(&dir, 4), Vec::new()).unwrap();
    let result = trainer.fit(&mut model()).unwrap();

    let cb = trainer.checkpoint_callback().unwrap();
    assert_eq!(cb.kept_checkpoints().len(), 1);
    let best = result.best_model_path.clone().unwrap();
    assert!(best.is_file());
    assert!(best.starts_with(trainer.ckpt_path()));

    let best_score = cb.best_model_score().unwrap();
    let best_val = result
        .history
        .val_history
        .iter()
        .filter_map(|m| m.get("val_loss").copied())
        .fold(f64::INFINITY, f64::min);
    assert_eq!(best_score, best_val);
}

#[test]
fn restore_resumes_after_saved_epoch() {
    let dir = TempDir::new().unwrap();
    let mut trainer = Trainer::builder()
        .config(config(&dir, 2))
        .checkpoint_callback(ModelCheckpoint::new(None).with_save_top_k(-1))
        .build()
        .unwrap();
    let mut trained = model();
    trainer.fit(&mut trained).unwrap();
    let last = trainer.ckpt_path().join("epoch=1.ckpt");

    let mut resumed = model();
    let mut next = Trainer::new(config(&dir, 4), Vec::new()).unwrap();
    next.restore(&last, &mut resumed).unwrap();

    assert_eq!(next.current_epoch(), 2);
    assert_eq!(next.global_step(), trainer.global_step());
    for (a, b) in resumed.weights().iter().zip(trained.weights()) {
        assert!((a - b).abs() < 1e-12);
    }
    assert!((resumed.bias() - trained.bias()).abs() < 1e-12);

    let result = next.fit(&mut resumed).unwrap();
    assert_eq!(result.epochs_completed, 2);
    assert_eq!(result.final_epoch, 3);
}

#[test]
fn restore_missing_file_is_error() {
    let dir = TempDir::new().unwrap();
    let mut trainer = Trainer::new(config(&dir, 1), Vec::new()).unwrap();
    let mut m = model();
    assert!(trainer.restore(&dir.path().join("nope.ckpt"), &mut m).is_err());
    assert_eq!(trainer.current_epoch(), 0);
}

#[test]
fn checkpoint_file_carries_hparams_and_metrics() {
    let dir = TempDir::new().unwrap();
    let mut trainer = Trainer::new(config(&dir, 1), Vec::new()).unwrap();
    let mut m = model();
    let result = trainer.fit(&mut m).unwrap();
    assert!(m.weights()[0] != 0.0);

    let file = persistence::load_checkpoint(&result.best_model_path.unwrap()).unwrap();
    assert_eq!(file.epoch, 0);
    assert_eq!(file.hparams["batch_size"], 8);
    assert!(file.callback_metrics.contains_key("val_loss"));
}
