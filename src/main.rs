use anyhow::Context;
use burn::backend::{
    Autodiff,
    ndarray::{NdArray, NdArrayDevice},
    wgpu::{Wgpu, WgpuDevice},
};
use clap::Parser;
use disneyland_sentiment::{
    cli::{Args, BackendKind},
    pipeline::{self, PipelineConfig, PipelineOutcome},
};

pub type WgpuBackend = Wgpu<f32, i32>;
pub type NdArrayBackend = NdArray<f32>;

fn run_train(backend: BackendKind, config: &PipelineConfig) -> anyhow::Result<PipelineOutcome> {
    let outcome = match backend {
        BackendKind::Wgpu => {
            pipeline::run::<Autodiff<WgpuBackend>>(config, WgpuDevice::default())
        }
        BackendKind::Ndarray => {
            pipeline::run::<Autodiff<NdArrayBackend>>(config, NdArrayDevice::Cpu)
        }
    };
    outcome.context("Training run failed")
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = args.pipeline_config();

    log::info!(
        "Training for {} epochs from learning rate {}",
        config.epochs,
        config.initial_lr
    );
    let outcome = run_train(args.backend, &config)?;

    let last = outcome.summary.history.last();
    log::info!(
        "Run {} finished after {} optimizer steps{}",
        outcome.run_id,
        outcome.summary.optimizer_steps,
        last.map(|m| format!(", final val_loss {:.4}", m.val_loss))
            .unwrap_or_default()
    );
    println!(
        "Registered {} version {} ({})",
        outcome.model_version.name, outcome.model_version.version, outcome.model_version.source
    );
    Ok(())
}
