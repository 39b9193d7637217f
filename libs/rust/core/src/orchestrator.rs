//! Multi-round federated loop.
//!
//! Each round walks `SELECT -> DISTRIBUTE -> LOCAL_TRAIN -> COLLECT -> AGGREGATE ->
//! EVALUATE -> (CHECKPOINT)`. The global state is the only cross-round mutable state;
//! it sits behind a lock and is replaced wholesale once a round has aggregated,
//! evaluated and checkpointed successfully. Any earlier failure leaves it untouched.
//! Sink failures after the commit are logged and do not fail the round.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::RwLock;
use rayon::prelude::*;
use tracing::{debug, info, instrument, warn};

use crate::aggregate::{fedavg, ClientUpdate};
use crate::cancel::CancelToken;
use crate::checkpoint::{CheckpointStore, FileCheckpointStore};
use crate::config::{FailurePolicy, FederationConfig};
use crate::error::{FlError, Result};
use crate::eval::Evaluator;
use crate::mask::Mask;
use crate::model::{CrossEntropyLoss, Dataset, Loss, Model};
use crate::params::ParameterSet;
use crate::sampling::select_clients;
use crate::sink::{RoundRecord, RoundSink, TracingSink};
use crate::telemetry::FL_METRICS;
use crate::trainer::{train_client, ClientResult, ClientTask};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundPhase {
    Select,
    Distribute,
    LocalTrain,
    Collect,
    Aggregate,
    Evaluate,
    Checkpoint,
}

impl RoundPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoundPhase::Select => "SELECT",
            RoundPhase::Distribute => "DISTRIBUTE",
            RoundPhase::LocalTrain => "LOCAL_TRAIN",
            RoundPhase::Collect => "COLLECT",
            RoundPhase::Aggregate => "AGGREGATE",
            RoundPhase::Evaluate => "EVALUATE",
            RoundPhase::Checkpoint => "CHECKPOINT",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GlobalState {
    /// Last completed round; 0 before the first.
    pub round: u64,
    pub params: ParameterSet,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    pub final_round: u64,
    pub params: ParameterSet,
    pub metrics: BTreeMap<String, f64>,
    pub records: Vec<RoundRecord>,
}

pub struct FederatedRun<M, D> {
    run_id: String,
    config: FederationConfig,
    template: M,
    clients: Vec<D>,
    evaluator: Box<dyn Evaluator>,
    loss: Box<dyn Loss>,
    state: RwLock<GlobalState>,
    masks: RwLock<HashMap<usize, Arc<Mask>>>,
    checkpoints: Option<Box<dyn CheckpointStore>>,
    sinks: Vec<Box<dyn RoundSink>>,
    cancel: CancelToken,
    pool: Option<rayon::ThreadPool>,
}

impl<M, D> FederatedRun<M, D>
where
    M: Model + Clone,
    D: Dataset,
{
    /// `model` seeds the global state and is the template every client copy is cloned from.
    pub fn new(config: FederationConfig, model: M, clients: Vec<D>, evaluator: impl Evaluator + 'static) -> Result<Self> {
        config.validate()?;
        if clients.len() != config.num_clients {
            return Err(FlError::InvalidConfig(format!("num_clients is {} but {} client datasets were given", config.num_clients, clients.len())));
        }
        let pool = match (config.parallel, config.worker_threads) {
            (true, Some(n)) => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(n)
                    .thread_name(|i| format!("fl-client-{i}"))
                    .build()
                    .map_err(|e| FlError::InvalidConfig(format!("worker pool: {e}")))?,
            ),
            _ => None,
        };
        let checkpoints: Option<Box<dyn CheckpointStore>> = match &config.checkpoint.dir {
            Some(dir) => Some(Box::new(FileCheckpointStore::new(dir)?)),
            None => None,
        };
        let run_id = uuid::Uuid::new_v4().to_string();
        info!(%run_id, clients = clients.len(), rounds = config.rounds, sparse = config.sparsity.is_some(), "federated run created");
        Ok(Self {
            run_id,
            state: RwLock::new(GlobalState { round: 0, params: model.export() }),
            template: model,
            clients,
            evaluator: Box::new(evaluator),
            loss: Box::new(CrossEntropyLoss),
            masks: RwLock::new(HashMap::new()),
            checkpoints,
            sinks: vec![Box::new(TracingSink)],
            cancel: CancelToken::new(),
            pool,
            config,
        })
    }

    pub fn with_loss(mut self, loss: impl Loss + 'static) -> Self {
        self.loss = Box::new(loss);
        self
    }

    pub fn with_checkpoints(mut self, store: impl CheckpointStore + 'static) -> Self {
        self.checkpoints = Some(Box::new(store));
        self
    }

    pub fn with_sink(mut self, sink: impl RoundSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn run_id(&self) -> &str { &self.run_id }

    pub fn config(&self) -> &FederationConfig { &self.config }

    pub fn cancel_token(&self) -> CancelToken { self.cancel.clone() }

    pub fn current_round(&self) -> u64 { self.state.read().round }

    pub fn global_snapshot(&self) -> ParameterSet { self.state.read().params.clone() }

    pub fn cached_mask(&self, client: usize) -> Option<Arc<Mask>> { self.masks.read().get(&client).cloned() }

    /// Replaces the global state with the latest checkpoint. Returns its round, or `None` if there is none.
    pub fn resume_from_checkpoint(&self) -> Result<Option<u64>> {
        let Some(store) = &self.checkpoints else {
            return Ok(None);
        };
        let Some((round, params)) = store.load_latest()? else {
            return Ok(None);
        };
        let mut state = self.state.write();
        state.params.check_aligned(&params)?;
        *state = GlobalState { round, params };
        info!(round, "resumed from checkpoint");
        Ok(Some(round))
    }

    /// Runs rounds until the configured count, resuming first when configured to.
    pub fn run(&self) -> Result<RunSummary> {
        if self.config.checkpoint.resume && self.current_round() == 0 {
            self.resume_from_checkpoint()?;
        }
        let mut records = Vec::new();
        while self.current_round() < self.config.rounds {
            records.push(self.run_round()?);
        }
        let state = self.state.read().clone();
        let metrics = records.last().map(|r| r.metrics.clone()).unwrap_or_default();
        info!(run_id = %self.run_id, final_round = state.round, ?metrics, "federated run finished");
        Ok(RunSummary { run_id: self.run_id.clone(), final_round: state.round, params: state.params, metrics, records })
    }

    #[instrument(skip_all, fields(run = %self.run_id, round = self.current_round() + 1))]
    pub fn run_round(&self) -> Result<RoundRecord> {
        self.cancel.check()?;
        let round = self.current_round() + 1;

        phase(round, RoundPhase::Select);
        let selected = select_clients(self.clients.len(), self.config.client_fraction, self.config.seed, round);

        phase(round, RoundPhase::Distribute);
        let snapshot = self.global_snapshot();
        let jobs: Vec<(usize, Option<Arc<Mask>>)> = {
            let reuse = self.config.sparsity.as_ref().is_some_and(|s| s.reuse_masks);
            let masks = self.masks.read();
            selected.iter().map(|&c| (c, if reuse { masks.get(&c).cloned() } else { None })).collect()
        };

        phase(round, RoundPhase::LocalTrain);
        let outcomes = self.fan_out(jobs, &snapshot);

        phase(round, RoundPhase::Collect);
        if self.cancel.is_cancelled() {
            warn!(round, "round cancelled during local training; nothing aggregated");
            return Err(FlError::Cancelled);
        }
        let collected = self.collect(round, outcomes)?;

        phase(round, RoundPhase::Aggregate);
        let started = Instant::now();
        let updates: Vec<ClientUpdate> = collected.results.iter().map(|r| r.update.clone()).collect();
        let aggregated = fedavg(&updates)?;
        FL_METRICS.aggregation_latency_ms.record(started.elapsed().as_secs_f64() * 1000.0, &[]);

        phase(round, RoundPhase::Evaluate);
        let mut evaluated = self.template.clone();
        evaluated.load(&aggregated)?;
        let metrics = self.evaluator.evaluate(&evaluated)?;

        // a failed save leaves the round uncommitted
        if let Some(store) = &self.checkpoints {
            if self.config.checkpoint.is_due(round, self.config.rounds) {
                phase(round, RoundPhase::Checkpoint);
                store.save(round, &aggregated)?;
            }
        }

        {
            let mut state = self.state.write();
            *state = GlobalState { round, params: aggregated };
        }
        FL_METRICS.rounds_completed.add(1, &[]);
        FL_METRICS.client_updates.add(updates.len() as u64, &[]);
        self.remember_masks(&collected.results);

        let record = collected.into_record(&self.run_id, round, selected, metrics);
        for sink in &self.sinks {
            if let Err(err) = sink.record(&record) {
                warn!(round, error = %err, "round sink failed; continuing");
            }
        }
        Ok(record)
    }

    fn fan_out(&self, jobs: Vec<(usize, Option<Arc<Mask>>)>, snapshot: &ParameterSet) -> Vec<(usize, Result<ClientResult>)> {
        let work = |(client, cached): (usize, Option<Arc<Mask>>)| (client, self.train_one(client, cached, snapshot));
        if !self.config.parallel {
            return jobs.into_iter().map(work).collect();
        }
        match &self.pool {
            Some(pool) => pool.install(|| jobs.into_par_iter().map(&work).collect()),
            None => jobs.into_par_iter().map(&work).collect(),
        }
    }

    fn train_one(&self, client: usize, cached: Option<Arc<Mask>>, snapshot: &ParameterSet) -> Result<ClientResult> {
        // private copy; clients never see each other's updates
        let mut model = self.template.clone();
        model.load(snapshot)?;
        let training = self.config.training();
        let task = ClientTask {
            client_id: client,
            data: &self.clients[client],
            loss: self.loss.as_ref(),
            training: &training,
            sparsity: self.config.sparsity.as_ref(),
            cached_mask: cached,
            cancel: &self.cancel,
        };
        train_client(&mut model, task)
    }

    /// Applies the failure policy. Fatal errors abort under either policy.
    fn collect(&self, round: u64, outcomes: Vec<(usize, Result<ClientResult>)>) -> Result<Collected> {
        let mut collected = Collected::default();
        for (client, outcome) in outcomes {
            match outcome {
                Ok(result) => collected.results.push(result),
                Err(err) => {
                    FL_METRICS.client_failures.add(1, &[]);
                    let err = FlError::client(client, err);
                    if err.is_fatal() || self.config.failure_policy == FailurePolicy::AbortRound {
                        warn!(round, client, error = %err, "client failure aborts the round");
                        return Err(err);
                    }
                    warn!(round, client, error = %err, "dropping client from aggregation");
                    collected.failed.push(client);
                }
            }
        }
        if collected.results.is_empty() {
            warn!(round, failed = collected.failed.len(), "no client produced an update");
            return Err(FlError::EmptyUpdateSet);
        }
        Ok(collected)
    }

    fn remember_masks(&self, results: &[ClientResult]) {
        let reuse = self.config.sparsity.as_ref().is_some_and(|s| s.reuse_masks);
        let mut masks = self.masks.write();
        for r in results {
            if let Some(mask) = &r.mask {
                FL_METRICS.mask_sparsity.record(mask.sparsity(), &[]);
                if reuse {
                    masks.entry(r.update.client_id).or_insert_with(|| Arc::clone(mask));
                }
            }
        }
    }
}

fn phase(round: u64, phase: RoundPhase) { debug!(round, phase = phase.as_str(), "round phase"); }

#[derive(Default)]
struct Collected {
    results: Vec<ClientResult>,
    failed: Vec<usize>,
}

impl Collected {
    fn into_record(self, run_id: &str, round: u64, selected: Vec<usize>, metrics: BTreeMap<String, f64>) -> RoundRecord {
        let n = self.results.len() as f64;
        let sparsities: Vec<f64> = self.results.iter().filter_map(|r| r.mask.as_ref().map(|m| m.sparsity())).collect();
        RoundRecord {
            run_id: run_id.to_string(),
            round,
            metrics,
            clients_selected: selected,
            clients_participated: self.results.len(),
            failed_clients: self.failed,
            samples_used: self.results.iter().map(|r| r.update.num_samples).sum(),
            mean_client_loss: (n > 0.0).then(|| self.results.iter().map(|r| r.mean_loss as f64).sum::<f64>() / n),
            mean_mask_sparsity: (!sparsities.is_empty()).then(|| sparsities.iter().sum::<f64>() / sparsities.len() as f64),
            timestamp: Utc::now(),
        }
    }
}
