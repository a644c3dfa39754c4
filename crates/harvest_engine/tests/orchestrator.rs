use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use harvest_core::{ConcurrencyController, ControllerConfig};
use harvest_engine::{
    ClientError, ControllerHandle, ExtractError, ItemRecord, ItemStore, Orchestrator,
    OrchestratorConfig, PageClient, RecordExtractor, RunSummary,
};
use tempfile::TempDir;

fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(harvest_logging::initialize_for_tests);
}

fn url_for(id: u32) -> String {
    format!("https://listings.example.com/cardetail.cfm?c={id}")
}

/// No delays, so tests run fast; decisions are effectively disabled by the
/// default 20s dwell.
fn quick_config() -> OrchestratorConfig {
    OrchestratorConfig {
        backoff_base: Duration::ZERO,
        backoff_step: Duration::ZERO,
        politeness_min: Duration::ZERO,
        politeness_max: Duration::ZERO,
        decision_interval: Duration::from_millis(10),
        shutdown_grace: Duration::from_millis(500),
        ..OrchestratorConfig::default()
    }
}

fn controller(initial: usize) -> ControllerHandle {
    let config = ControllerConfig::bounded(1, initial, 16).unwrap();
    ControllerHandle::new(ConcurrencyController::new(config))
}

/// Scripted page client that counts fetch attempts per URL.
struct ScriptedClient {
    responses: HashMap<String, Result<String, ClientError>>,
    attempts: Mutex<HashMap<String, usize>>,
    /// When set, the first `fail_first` attempts per URL time out.
    fail_first: usize,
}

impl ScriptedClient {
    fn ok_for(urls: &[String]) -> Self {
        Self {
            responses: urls
                .iter()
                .map(|url| (url.clone(), Ok(format!("<html>{url}</html>"))))
                .collect(),
            attempts: Mutex::new(HashMap::new()),
            fail_first: 0,
        }
    }

    fn failing_for(urls: &[String]) -> Self {
        Self {
            responses: urls
                .iter()
                .map(|url| (url.clone(), Err(ClientError::Timeout)))
                .collect(),
            attempts: Mutex::new(HashMap::new()),
            fail_first: 0,
        }
    }

    fn attempts_for(&self, url: &str) -> usize {
        self.attempts.lock().unwrap().get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl PageClient for ScriptedClient {
    async fn fetch_document(&self, url: &str) -> Result<String, ClientError> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let entry = attempts.entry(url.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };
        if attempt <= self.fail_first {
            return Err(ClientError::Timeout);
        }
        self.responses
            .get(url)
            .cloned()
            .unwrap_or_else(|| Err(ClientError::Navigation(format!("unexpected url {url}"))))
    }
}

/// Client that tracks the maximum number of in-flight fetches.
struct GaugeClient {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    delay: Duration,
}

impl GaugeClient {
    fn with_delay(delay: Duration) -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            delay,
        }
    }
}

#[async_trait]
impl PageClient for GaugeClient {
    async fn fetch_document(&self, url: &str) -> Result<String, ClientError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(format!("<html>{url}</html>"))
    }
}

/// Extractor that wraps the document into a minimal record.
struct StubExtractor;

impl RecordExtractor for StubExtractor {
    fn extract(&self, html: &str, url: &str) -> Result<ItemRecord, ExtractError> {
        if html.is_empty() {
            return Err(ExtractError::NotADetailPage);
        }
        Ok(ItemRecord {
            url: url.to_string(),
            brand: None,
            model: None,
            year: None,
            price_crc: None,
            price_usd: None,
            main_image: None,
            gallery: Vec::new(),
            mileage_km: None,
            displacement_cc: None,
            general: BTreeMap::from([("origen".to_string(), "test".to_string())]),
            seller: BTreeMap::new(),
            seller_comment: None,
            equipment: Vec::new(),
        })
    }
}

fn orchestrator(
    client: Arc<ScriptedClient>,
    store: ItemStore,
    controller: ControllerHandle,
    config: OrchestratorConfig,
) -> Orchestrator {
    Orchestrator::new(client, Arc::new(StubExtractor), store, controller, config)
}

#[tokio::test]
async fn already_stored_items_are_never_refetched() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let store = ItemStore::new(dir.path().to_path_buf());
    let urls: Vec<String> = (1..=5).map(url_for).collect();

    // Two records exist from a previous run.
    let stub = StubExtractor;
    for id in ["1", "2"] {
        let record = stub.extract("<html>seed</html>", &url_for(id.parse().unwrap()));
        store.write(id, &record.unwrap()).unwrap();
    }

    let client = Arc::new(ScriptedClient::ok_for(&urls));
    let controller = controller(3);
    let summary = orchestrator(client.clone(), store.clone(), controller, quick_config())
        .run(urls.clone())
        .await;

    assert_eq!(
        summary,
        RunSummary {
            total: 5,
            fetched: 3,
            skipped_existing: 2,
            invalid_url: 0,
            failed: 0,
        }
    );
    assert_eq!(client.attempts_for(&url_for(1)), 0);
    assert_eq!(client.attempts_for(&url_for(2)), 0);
    for id in 1..=5u32 {
        assert!(store.contains(&id.to_string()));
    }
}

#[tokio::test]
async fn exhausted_retries_report_one_error_and_leave_no_file() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let store = ItemStore::new(dir.path().to_path_buf());
    let urls = vec![url_for(7)];

    let client = Arc::new(ScriptedClient::failing_for(&urls));
    let controller = controller(2);
    let summary = orchestrator(
        client.clone(),
        store.clone(),
        controller.clone(),
        quick_config(),
    )
    .run(urls.clone())
    .await;

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.fetched, 0);
    // Exactly the retry cap of attempts, exactly one reported error.
    assert_eq!(client.attempts_for(&url_for(7)), 3);
    assert_eq!(controller.counts_since_decision(), (0, 1));
    assert!(!store.contains("7"));
}

#[tokio::test]
async fn transient_failure_is_retried_without_reporting() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let store = ItemStore::new(dir.path().to_path_buf());
    let urls = vec![url_for(9)];

    let mut client = ScriptedClient::ok_for(&urls);
    client.fail_first = 1;
    let client = Arc::new(client);
    let controller = controller(2);
    let summary = orchestrator(
        client.clone(),
        store.clone(),
        controller.clone(),
        quick_config(),
    )
    .run(urls)
    .await;

    assert_eq!(summary.fetched, 1);
    assert_eq!(client.attempts_for(&url_for(9)), 2);
    assert_eq!(controller.counts_since_decision(), (1, 0));
    assert!(store.contains("9"));
}

#[tokio::test]
async fn urls_without_an_id_are_skipped() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let store = ItemStore::new(dir.path().to_path_buf());
    let urls = vec!["https://listings.example.com/cardetail.cfm?s=1".to_string()];

    let client = Arc::new(ScriptedClient::ok_for(&[]));
    let summary = orchestrator(client.clone(), store, controller(2), quick_config())
        .run(urls.clone())
        .await;

    assert_eq!(summary.invalid_url, 1);
    assert_eq!(client.attempts_for(&urls[0]), 0);
}

#[tokio::test]
async fn parallelism_is_bounded_by_the_controller_target() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let store = ItemStore::new(dir.path().to_path_buf());
    let urls: Vec<String> = (1..=12).map(url_for).collect();
    let client = Arc::new(GaugeClient::with_delay(Duration::from_millis(20)));

    let summary = Orchestrator::new(
        client.clone(),
        Arc::new(StubExtractor),
        store,
        controller(2),
        quick_config(),
    )
    .run(urls)
    .await;

    assert_eq!(summary.fetched, 12);
    assert!(
        client.peak.load(Ordering::SeqCst) <= 2,
        "peak in-flight {} exceeded target",
        client.peak.load(Ordering::SeqCst)
    );
}

#[tokio::test]
async fn mid_run_decisions_widen_the_admitted_parallelism() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let store = ItemStore::new(dir.path().to_path_buf());
    let urls: Vec<String> = (1..=16).map(url_for).collect();
    let client = Arc::new(GaugeClient::with_delay(Duration::from_millis(30)));

    // Zero dwell: every 10ms decision tick with at least one completed item
    // probes the target upward, and the gate must follow.
    let config = ControllerConfig {
        dwell: Duration::ZERO,
        ..ControllerConfig::bounded(1, 1, 4).unwrap()
    };
    let handle = ControllerHandle::new(ConcurrencyController::new(config));

    let summary = Orchestrator::new(
        client.clone(),
        Arc::new(StubExtractor),
        store,
        handle.clone(),
        quick_config(),
    )
    .run(urls)
    .await;

    assert_eq!(summary.fetched, 16);
    assert!(handle.target() > 1, "controller never raised the target");
    let peak = client.peak.load(Ordering::SeqCst);
    assert!(
        (2..=4).contains(&peak),
        "admitted parallelism did not follow the raised target: peak {peak}"
    );
}
