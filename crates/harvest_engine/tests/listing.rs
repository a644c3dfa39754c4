use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::sync::{Arc, Mutex, Once};

use async_trait::async_trait;
use harvest_engine::{
    extract_item_urls, total_pages, ClientError, DiscoveryStore, FailedPageStore, HarvestError,
    ListingHarvester, ListingRules, ListingSession,
};
use tempfile::TempDir;
use url::Url;

fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(harvest_logging::initialize_for_tests);
}

const ROOT: &str = "https://listings.example.com/usados/";

/// Builds one listing page with the given detail-link ids and an optional
/// pagination control advertising the total page count.
fn listing_page(ids: &[u32], last_page: Option<&str>) -> String {
    let mut body = String::from("<html><body>");
    for id in ids {
        body.push_str(&format!(r#"<a href="cardetail.cfm?c={id}">item {id}</a>"#));
    }
    if let Some(arg) = last_page {
        body.push_str(&format!(
            r#"<a href="javascript:p({arg})">&Uacute;ltima P&aacute;gina</a>"#
        ));
    }
    body.push_str("</body></html>");
    body
}

fn url_for(id: u32) -> String {
    format!("{ROOT}cardetail.cfm?c={id}")
}

/// Scripted session that records its call order.
struct ScriptedSession {
    root: String,
    pages: HashMap<u32, Result<String, ClientError>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl ScriptedSession {
    fn new(root: String) -> Self {
        Self {
            root,
            pages: HashMap::new(),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn page(mut self, index: u32, result: Result<String, ClientError>) -> Self {
        self.pages.insert(index, result);
        self
    }

    fn calls(&self) -> Arc<Mutex<Vec<String>>> {
        self.calls.clone()
    }
}

#[async_trait]
impl ListingSession for ScriptedSession {
    async fn open(&mut self, _root_url: &str) -> Result<String, ClientError> {
        self.calls.lock().unwrap().push("open".to_string());
        Ok(self.root.clone())
    }

    async fn goto_page(&mut self, index: u32) -> Result<String, ClientError> {
        self.calls.lock().unwrap().push(format!("page:{index}"));
        self.pages
            .get(&index)
            .cloned()
            .unwrap_or_else(|| Err(ClientError::Navigation(format!("unexpected page {index}"))))
    }
}

struct Stores {
    _dir: TempDir,
    discovery: DiscoveryStore,
    failed: FailedPageStore,
}

fn stores() -> Stores {
    let dir = TempDir::new().unwrap();
    let discovery = DiscoveryStore::new(dir.path().join("urls.json"));
    let failed = FailedPageStore::new(dir.path().join("failed_pages.json"));
    Stores {
        _dir: dir,
        discovery,
        failed,
    }
}

fn harvester(
    session: ScriptedSession,
    stores: &Stores,
) -> ListingHarvester<ScriptedSession> {
    ListingHarvester::new(
        session,
        ListingRules::for_default_site().unwrap(),
        ROOT,
        stores.discovery.clone(),
        stores.failed.clone(),
    )
}

#[test]
fn total_pages_parses_the_control_and_defaults_to_one() {
    let rules = ListingRules::for_default_site().unwrap();
    assert_eq!(
        total_pages(&rules, &listing_page(&[1], Some("'42'"))).unwrap(),
        42
    );
    assert_eq!(total_pages(&rules, &listing_page(&[1], None)).unwrap(), 1);
    assert!(matches!(
        total_pages(&rules, &listing_page(&[1], Some("'nope'"))),
        Err(HarvestError::PageCountUnparseable)
    ));
}

#[test]
fn item_urls_are_absolute_and_deduplicated() {
    let rules = ListingRules::for_default_site().unwrap();
    let base = Url::parse(ROOT).unwrap();
    let html = format!(
        "{}{}",
        listing_page(&[7, 8], None),
        listing_page(&[7], None)
    );
    let urls = extract_item_urls(&rules, &html, &base);
    assert_eq!(
        urls,
        BTreeSet::from([url_for(7), url_for(8)])
    );
}

#[tokio::test]
async fn harvest_walks_all_pages_sequentially_and_persists() {
    init_logging();
    let stores = stores();
    let session = ScriptedSession::new(listing_page(&[1, 2], Some("'3'")))
        .page(2, Ok(listing_page(&[3], None)))
        .page(3, Ok(listing_page(&[4], None)));
    let calls = session.calls();
    let mut harvester = harvester(session, &stores);

    let urls = harvester.harvest().await.unwrap();
    assert_eq!(
        urls,
        BTreeSet::from([url_for(1), url_for(2), url_for(3), url_for(4)])
    );
    assert_eq!(
        *calls.lock().unwrap(),
        vec!["open", "page:2", "page:3"]
    );
    assert!(stores.discovery.exists());
    assert_eq!(stores.discovery.load().unwrap(), urls);
    assert!(!stores.failed.path().exists());
}

#[tokio::test]
async fn harvest_is_idempotent_once_persisted() {
    init_logging();
    let stores = stores();
    let session = ScriptedSession::new(listing_page(&[1], None));
    let mut first_harvester = harvester(session, &stores);
    let first = first_harvester.harvest().await.unwrap();
    let bytes_after_first = fs::read(stores.discovery.path()).unwrap();

    // Second harvest with a session that would fail every call: it must
    // never be reached.
    let session = ScriptedSession::new(String::new());
    let calls = session.calls();
    let mut harvester = harvester(session, &stores);
    let second = harvester.harvest().await.unwrap();

    assert_eq!(first, second);
    assert!(calls.lock().unwrap().is_empty());
    assert_eq!(fs::read(stores.discovery.path()).unwrap(), bytes_after_first);
}

#[tokio::test]
async fn failed_pages_are_marked_and_do_not_abort() {
    init_logging();
    let stores = stores();
    let session = ScriptedSession::new(listing_page(&[1], Some("'4'")))
        .page(2, Err(ClientError::Timeout))
        // Page 3 loads but yields no item links.
        .page(3, Ok(listing_page(&[], None)))
        .page(4, Ok(listing_page(&[9], None)));
    let mut harvester = harvester(session, &stores);

    let urls = harvester.harvest().await.unwrap();
    assert_eq!(urls, BTreeSet::from([url_for(1), url_for(9)]));
    assert_eq!(stores.failed.load().unwrap(), BTreeSet::from([2, 3]));
}

#[tokio::test]
async fn unparseable_page_count_aborts_without_discovery_output() {
    init_logging();
    let stores = stores();
    let session = ScriptedSession::new(listing_page(&[1], Some("'later'")));
    let mut harvester = harvester(session, &stores);

    let err = harvester.harvest().await.unwrap_err();
    assert!(matches!(err, HarvestError::PageCountUnparseable));
    assert!(!stores.discovery.exists());
}

#[tokio::test]
async fn retry_unions_new_urls_into_existing_discovery() {
    init_logging();
    let stores = stores();
    let existing = BTreeSet::from([url_for(100), url_for(101)]);
    stores.discovery.save(&existing).unwrap();
    stores.failed.save(&BTreeSet::from([2])).unwrap();

    let session = ScriptedSession::new(listing_page(&[1], Some("'2'")))
        .page(2, Ok(listing_page(&[200, 201], None)));
    let calls = session.calls();
    let mut harvester = harvester(session, &stores);

    let merged = harvester.retry_failed().await.unwrap();
    assert_eq!(
        merged,
        BTreeSet::from([url_for(100), url_for(101), url_for(200), url_for(201)])
    );
    assert_eq!(stores.discovery.load().unwrap(), merged);
    // Base state is reasserted before the transition is replayed.
    assert_eq!(*calls.lock().unwrap(), vec!["open", "page:2"]);
    // All markers resolved: the file is gone, not empty.
    assert!(!stores.failed.path().exists());
}

#[tokio::test]
async fn retry_keeps_markers_for_pages_that_fail_again() {
    init_logging();
    let stores = stores();
    stores.failed.save(&BTreeSet::from([2, 3])).unwrap();

    let session = ScriptedSession::new(listing_page(&[1], Some("'3'")))
        .page(2, Ok(listing_page(&[5], None)))
        .page(3, Err(ClientError::Timeout));
    let mut harvester = harvester(session, &stores);

    harvester.retry_failed().await.unwrap();
    assert_eq!(stores.failed.load().unwrap(), BTreeSet::from([3]));
}

#[tokio::test]
async fn retry_without_markers_is_rejected() {
    init_logging();
    let stores = stores();
    let session = ScriptedSession::new(String::new());
    let calls = session.calls();
    let mut harvester = harvester(session, &stores);

    let err = harvester.retry_failed().await.unwrap_err();
    assert!(matches!(err, HarvestError::NothingToRetry));
    assert!(calls.lock().unwrap().is_empty());
}
