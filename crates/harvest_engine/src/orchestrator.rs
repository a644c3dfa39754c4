use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use harvest_logging::{harvest_debug, harvest_error, harvest_info, harvest_warn};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use harvest_core::{estimate_remaining, item_id, Adjustment, ConcurrencyController};

use crate::client::{ClientError, PageClient};
use crate::extract::{ExtractError, RecordExtractor};
use crate::gate::AdmissionGate;
use crate::store::{ItemStore, StoreError};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Fetch+extract cycles attempted per item before it is abandoned.
    pub retry_cap: usize,
    /// First retry delay; grows by `backoff_step` per attempt.
    pub backoff_base: Duration,
    pub backoff_step: Duration,
    /// Bounds of the randomized pause after a successful item, taken before
    /// the admission slot is released.
    pub politeness_min: Duration,
    pub politeness_max: Duration,
    /// Cadence of the controller's decision loop.
    pub decision_interval: Duration,
    /// How long to wait for the decision loop to wind down at the end.
    pub shutdown_grace: Duration,
    /// Log an ETA line every this many completions.
    pub progress_every: usize,
    /// Query parameter carrying the item id on detail URLs.
    pub id_param: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry_cap: 3,
            backoff_base: Duration::from_secs(3),
            backoff_step: Duration::from_secs(2),
            politeness_min: Duration::from_secs(1),
            politeness_max: Duration::from_secs(4),
            decision_interval: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(2),
            progress_every: 25,
            id_param: harvest_core::DEFAULT_ID_PARAM.to_string(),
        }
    }
}

/// Single synchronization boundary around the controller state. Recording
/// an outcome is a counter increment under the lock; the periodic decision
/// holds the same lock for its full body.
#[derive(Clone)]
pub struct ControllerHandle {
    inner: Arc<Mutex<ConcurrencyController>>,
}

impl ControllerHandle {
    pub fn new(controller: ConcurrencyController) -> Self {
        Self {
            inner: Arc::new(Mutex::new(controller)),
        }
    }

    pub fn record_success(&self) {
        self.inner.lock().unwrap().record_success();
    }

    pub fn record_error(&self) {
        self.inner.lock().unwrap().record_error();
    }

    pub fn target(&self) -> usize {
        self.inner.lock().unwrap().target()
    }

    pub fn counts_since_decision(&self) -> (u64, u64) {
        self.inner.lock().unwrap().counts_since_decision()
    }

    pub fn tick(&self, now: Duration) -> Option<Adjustment> {
        self.inner.lock().unwrap().tick(now)
    }
}

/// Outcome counts for one fetch-phase run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// URLs presented to the orchestrator.
    pub total: usize,
    /// Records fetched and persisted by this run.
    pub fetched: usize,
    /// Items skipped because their record already existed.
    pub skipped_existing: usize,
    /// URLs without an extractable item id.
    pub invalid_url: usize,
    /// Items abandoned after the retry cap.
    pub failed: usize,
}

#[derive(Debug, Error)]
enum ItemError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Bounded worker pool that fetches item detail pages.
///
/// Admitted parallelism tracks the controller's current target through the
/// admission gate; the controller's decision loop runs concurrently with
/// the workers for the whole fetch phase. Completion order across items is
/// whichever finishes first.
pub struct Orchestrator {
    client: Arc<dyn PageClient>,
    extractor: Arc<dyn RecordExtractor>,
    store: ItemStore,
    controller: ControllerHandle,
    config: Arc<OrchestratorConfig>,
}

impl Orchestrator {
    pub fn new(
        client: Arc<dyn PageClient>,
        extractor: Arc<dyn RecordExtractor>,
        store: ItemStore,
        controller: ControllerHandle,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            client,
            extractor,
            store,
            controller,
            config: Arc::new(config),
        }
    }

    /// Processes every URL whose item id is not already present in the item
    /// store. Individual item failures never abort the batch.
    pub async fn run(&self, urls: impl IntoIterator<Item = String>) -> RunSummary {
        let mut summary = RunSummary::default();
        let mut pending = Vec::new();
        for url in urls {
            summary.total += 1;
            let Some(id) = item_id(&url, &self.config.id_param) else {
                harvest_warn!("no item id in url {url:?}; skipping");
                summary.invalid_url += 1;
                continue;
            };
            if self.store.contains(&id) {
                harvest_debug!("record for item {id} already exists; skipping");
                summary.skipped_existing += 1;
                continue;
            }
            pending.push((id, url));
        }

        let to_fetch = pending.len();
        harvest_info!(
            "{} urls: {} to fetch, {} already stored, {} without id",
            summary.total,
            to_fetch,
            summary.skipped_existing,
            summary.invalid_url
        );
        if pending.is_empty() {
            return summary;
        }

        let gate = AdmissionGate::new(self.controller.target());
        let started = Instant::now();
        let cancel = CancellationToken::new();
        let decision_loop = tokio::spawn(run_decision_loop(
            self.controller.clone(),
            gate.clone(),
            self.config.decision_interval,
            cancel.clone(),
            started,
        ));

        let mut tasks = JoinSet::new();
        for (id, url) in pending {
            let gate = gate.clone();
            let client = self.client.clone();
            let extractor = self.extractor.clone();
            let store = self.store.clone();
            let controller = self.controller.clone();
            let config = self.config.clone();
            tasks.spawn(async move {
                let _permit = match gate.admit().await {
                    Ok(permit) => permit,
                    Err(err) => {
                        harvest_error!("item {id} not admitted: {err}");
                        return false;
                    }
                };
                process_item(&*client, &*extractor, &store, &controller, &config, &id, &url)
                    .await
            });
        }

        let mut completed = 0usize;
        while let Some(joined) = tasks.join_next().await {
            completed += 1;
            match joined {
                Ok(true) => summary.fetched += 1,
                Ok(false) => summary.failed += 1,
                Err(err) => {
                    harvest_error!("worker task failed: {err}");
                    summary.failed += 1;
                }
            }
            if completed % self.config.progress_every == 0 {
                if let Some(eta) = estimate_remaining(completed, to_fetch, started.elapsed()) {
                    harvest_info!(
                        "progress {completed}/{to_fetch}, about {}s remaining",
                        eta.as_secs()
                    );
                }
            }
        }

        // All items are done; stop the decision loop cooperatively, but do
        // not wait on it forever.
        cancel.cancel();
        if tokio::time::timeout(self.config.shutdown_grace, decision_loop)
            .await
            .is_err()
        {
            harvest_warn!("controller loop did not stop within the grace period");
        }

        harvest_info!(
            "fetch phase done: {} fetched, {} failed, {} skipped",
            summary.fetched,
            summary.failed,
            summary.skipped_existing
        );
        summary
    }
}

/// Periodic controller decisions, each retroactively resizing the gate so
/// the decisions actually bound the running parallelism.
async fn run_decision_loop(
    controller: ControllerHandle,
    gate: AdmissionGate,
    interval: Duration,
    cancel: CancellationToken,
    started: Instant,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(adjustment) = controller.tick(started.elapsed()) else {
                    continue;
                };
                let target = controller.target();
                gate.resize(target);
                match adjustment {
                    Adjustment::Unchanged => {
                        harvest_debug!("concurrency held at {target}");
                    }
                    Adjustment::Raised(_) => {
                        harvest_info!("concurrency raised to {target}");
                    }
                    Adjustment::Lowered(_) => {
                        harvest_info!("concurrency lowered to {target}");
                    }
                    Adjustment::Contracted(_) => {
                        harvest_warn!("error rate elevated; concurrency cut to {target}");
                    }
                }
            }
        }
    }
}

/// One item, up to `retry_cap` fetch+extract cycles. Reports exactly one
/// error to the controller when the cap is exhausted; intermediate failures
/// back off silently.
async fn process_item(
    client: &dyn PageClient,
    extractor: &dyn RecordExtractor,
    store: &ItemStore,
    controller: &ControllerHandle,
    config: &OrchestratorConfig,
    id: &str,
    url: &str,
) -> bool {
    for attempt in 0..config.retry_cap {
        match fetch_and_persist(client, extractor, store, id, url).await {
            Ok(()) => {
                controller.record_success();
                // Politeness pause happens while the admission slot is
                // still held.
                tokio::time::sleep(politeness_delay(config)).await;
                return true;
            }
            Err(err) => {
                if attempt + 1 < config.retry_cap {
                    harvest_warn!(
                        "attempt {}/{} for item {id} failed: {err}",
                        attempt + 1,
                        config.retry_cap
                    );
                    tokio::time::sleep(config.backoff_base + config.backoff_step * attempt as u32)
                        .await;
                } else {
                    harvest_error!(
                        "abandoning item {id} after {} attempts: {err}",
                        config.retry_cap
                    );
                    controller.record_error();
                }
            }
        }
    }
    false
}

async fn fetch_and_persist(
    client: &dyn PageClient,
    extractor: &dyn RecordExtractor,
    store: &ItemStore,
    id: &str,
    url: &str,
) -> Result<(), ItemError> {
    let html = client.fetch_document(url).await?;
    let record = extractor.extract(&html, url)?;
    store.write(id, &record)?;
    harvest_debug!("stored record for item {id}");
    Ok(())
}

fn politeness_delay(config: &OrchestratorConfig) -> Duration {
    let min = config.politeness_min.as_millis() as u64;
    let max = config.politeness_max.as_millis() as u64;
    if max <= min {
        return config.politeness_min;
    }
    Duration::from_millis(fastrand::u64(min..=max))
}
