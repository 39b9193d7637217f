use std::path::PathBuf;

use anyhow::Result;
use serde::Deserialize;
use talos_core::config::CONFIG_FILE_ENV;
use talos_core::{config_builder, init_tracing, FederatedRun, FederationConfig, FlError, HeldOutEvaluator, JsonLinesSink, MlpClassifier};
use tokio::signal;
use tracing::{info, warn};

mod simulation;

use simulation::SimulationConfig;

#[derive(Debug, Deserialize)]
struct RunnerConfig {
    #[serde(flatten)]
    federation: FederationConfig,
    #[serde(default)]
    simulation: SimulationConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("federated-runner")?;

    let file = std::env::var(CONFIG_FILE_ENV).ok().map(PathBuf::from);
    let cfg: RunnerConfig = config_builder(file.as_deref())?.build()?.try_deserialize()?;
    cfg.federation.validate()?;
    info!(federation = ?cfg.federation, simulation = ?cfg.simulation, "config loaded");

    let sim = &cfg.simulation;
    let fed = &cfg.federation;
    let data = simulation::generate(sim, fed.num_clients, fed.batch_size, fed.seed)?;
    let model = MlpClassifier::new(sim.features, sim.hidden, sim.classes, fed.seed);
    let mut run = FederatedRun::new(fed.clone(), model, data.clients, HeldOutEvaluator::new(data.test))?;
    if let Some(path) = &sim.rounds_log {
        run = run.with_sink(JsonLinesSink::create(path)?);
    }

    let cancel = run.cancel_token();
    let mut handle = tokio::task::spawn_blocking(move || run.run());
    let outcome = tokio::select! {
        res = &mut handle => res?,
        _ = signal::ctrl_c() => {
            warn!("interrupt received; cancelling after in-flight batches");
            cancel.cancel();
            handle.await?
        }
    };

    match outcome {
        Ok(summary) => info!(run_id = %summary.run_id, rounds = summary.final_round, metrics = ?summary.metrics, "federated training complete"),
        Err(FlError::Cancelled) => warn!("run cancelled; global model left at last completed round"),
        Err(e) => return Err(e.into()),
    }
    Ok(())
}
