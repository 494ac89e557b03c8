//! CLI subcommand handlers.

use crate::{Commands, ConfigAction, DataArgs, FitArgs, TestArgs};
use ember_core::callbacks::{Hook, HookTrace};
use ember_core::model::{LinearHparams, LinearRegression};
use ember_core::{ConfigOverrides, EarlyStopping, FitResult, Trainer, TrainerConfig};
use tracing::info;

/// Handle a CLI subcommand.
pub fn handle_command(command: Commands, config: TrainerConfig) -> anyhow::Result<()> {
    match command {
        Commands::Fit(args) => {
            let (result, trace) = run_fit(&args, config)?;
            print_fit_summary(&result);
            if let Some(trace) = trace {
                print_hook_counts(&trace);
            }
            Ok(())
        }
        Commands::Test(args) => handle_test(&args, config),
        Commands::Config { action } => handle_config(action, &config),
    }
}

fn build_model(data: &DataArgs, seed: Option<u64>) -> LinearRegression {
    let defaults = LinearHparams::default();
    LinearRegression::new(LinearHparams {
        num_samples: data.samples,
        batch_size: data.batch_size,
        seed: data.seed.or(seed).unwrap_or(defaults.seed),
        ..defaults
    })
}

fn fit_overrides(args: &FitArgs) -> ConfigOverrides {
    ConfigOverrides {
        max_epochs: args.max_epochs,
        default_root_dir: args.root_dir.clone(),
        seed: args.data.seed,
        ..Default::default()
    }
}

fn build_trainer(
    args: &FitArgs,
    config: TrainerConfig,
) -> anyhow::Result<(Trainer, Option<HookTrace>)> {
    let mut builder = Trainer::builder().config(config);
    if let Some(monitor) = &args.early_stop {
        builder = builder.early_stop_callback(
            EarlyStopping::new(monitor.as_str())
                .with_patience(args.patience)
                .verbose(true),
        );
    }
    let trace = args.trace_hooks.then(HookTrace::new);
    if let Some(trace) = &trace {
        builder = builder.callback(trace.clone());
    }
    Ok((builder.build()?, trace))
}

fn run_fit(
    args: &FitArgs,
    config: TrainerConfig,
) -> anyhow::Result<(FitResult, Option<HookTrace>)> {
    let config = fit_overrides(args).apply(config);
    let mut model = build_model(&args.data, config.seed);
    info!(
        max_epochs = config.max_epochs,
        samples = args.data.samples,
        early_stop = args.early_stop.as_deref().unwrap_or("off"),
        "Starting fit"
    );

    let (mut trainer, trace) = build_trainer(args, config)?;
    let result = trainer.fit(&mut model)?;
    info!(
        epochs = result.epochs_completed,
        stopped_early = result.stopped_early,
        "Fit finished"
    );
    Ok((result, trace))
}

fn print_fit_summary(result: &FitResult) {
    println!("Training finished");
    println!("  epochs:        {}", result.epochs_completed);
    println!("  global step:   {}", result.global_step);
    println!("  stopped early: {}", result.stopped_early);
    if let Some(loss) = result.final_loss() {
        println!("  final loss:    {loss:.6}");
    }
    for (key, value) in &result.callback_metrics {
        println!("  {key}: {value:.6}");
    }
    println!("  checkpoints:   {}", result.ckpt_path.display());
    if let Some(best) = &result.best_model_path {
        println!("  best model:    {}", best.display());
    }
}

fn print_hook_counts(trace: &HookTrace) {
    println!("Hook counts:");
    for hook in Hook::ALL {
        let count = trace.count(hook);
        if count > 0 {
            println!("  {:<28} {count}", hook.as_str());
        }
    }
}

fn handle_test(args: &TestArgs, config: TrainerConfig) -> anyhow::Result<()> {
    let config = ConfigOverrides {
        seed: args.data.seed,
        logger: Some(false),
        ..Default::default()
    }
    .apply(config);
    info!(checkpoint = %args.checkpoint.display(), "Testing checkpoint");
    let mut model = build_model(&args.data, config.seed);
    let mut trainer = Trainer::builder()
        .config(config)
        .without_checkpointing()
        .build()?;

    trainer.restore(&args.checkpoint, &mut model)?;
    let metrics = trainer.test(&mut model)?;
    println!("{}", serde_json::to_string_pretty(&metrics)?);
    Ok(())
}

fn handle_config(action: ConfigAction, config: &TrainerConfig) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            print!("{}", toml::to_string_pretty(config)?);
            Ok(())
        }
    }
}
