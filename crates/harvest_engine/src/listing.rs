use std::collections::BTreeSet;

use harvest_logging::{harvest_info, harvest_warn};
use regex::Regex;
use scraper::{Html, Selector};
use thiserror::Error;
use url::Url;

use crate::client::{ClientError, ListingSession};
use crate::store::{DiscoveryStore, FailedPageStore, StoreError};

/// Anchors referencing item detail pages.
pub const DEFAULT_ITEM_LINK_SELECTOR: &str = r#"a[href^="cardetail.cfm"]"#;
/// Pagination anchors whose target embeds a page index, e.g. `javascript:p('42')`.
pub const DEFAULT_PAGE_CONTROL_SELECTOR: &str = r#"a[href^="javascript:p("]"#;

const PAGE_ARG_PATTERN: &str = r"\(\s*'?(\d+)'?\s*\)";

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("listing root unreachable: {0}")]
    RootUnreachable(#[source] ClientError),
    #[error("pagination control found but its page count is unparseable")]
    PageCountUnparseable,
    #[error("invalid listing rules: {0}")]
    InvalidRules(String),
    #[error("no failed pages recorded; nothing to retry")]
    NothingToRetry,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// How item links and the pagination control are located in listing pages.
#[derive(Debug, Clone)]
pub struct ListingRules {
    item_links: Selector,
    page_controls: Selector,
    page_arg: Regex,
}

impl ListingRules {
    pub fn new(
        item_link_selector: &str,
        page_control_selector: &str,
    ) -> Result<Self, HarvestError> {
        let item_links = Selector::parse(item_link_selector)
            .map_err(|err| HarvestError::InvalidRules(err.to_string()))?;
        let page_controls = Selector::parse(page_control_selector)
            .map_err(|err| HarvestError::InvalidRules(err.to_string()))?;
        let page_arg = Regex::new(PAGE_ARG_PATTERN)
            .map_err(|err| HarvestError::InvalidRules(err.to_string()))?;
        Ok(Self {
            item_links,
            page_controls,
            page_arg,
        })
    }

    /// Rules matching the default target site's markup.
    pub fn for_default_site() -> Result<Self, HarvestError> {
        Self::new(DEFAULT_ITEM_LINK_SELECTOR, DEFAULT_PAGE_CONTROL_SELECTOR)
    }
}

/// Resolves the total page count from the pagination controls in a listing
/// page. An absent control means a single page of results; a control whose
/// numeric argument cannot be read aborts the harvest.
pub fn total_pages(rules: &ListingRules, html: &str) -> Result<u32, HarvestError> {
    let doc = Html::parse_document(html);
    let mut control_seen = false;
    let mut best: Option<u32> = None;
    for control in doc.select(&rules.page_controls) {
        control_seen = true;
        let Some(href) = control.value().attr("href") else {
            continue;
        };
        if let Some(captures) = rules.page_arg.captures(href) {
            if let Ok(index) = captures[1].parse::<u32>() {
                best = Some(best.map_or(index, |current| current.max(index)));
            }
        }
    }
    if !control_seen {
        return Ok(1);
    }
    best.ok_or(HarvestError::PageCountUnparseable)
}

/// Collects the absolute item detail URLs referenced from one listing page,
/// deduplicated by URL string.
pub fn extract_item_urls(rules: &ListingRules, html: &str, base: &Url) -> BTreeSet<String> {
    let doc = Html::parse_document(html);
    let mut urls = BTreeSet::new();
    for link in doc.select(&rules.item_links) {
        let Some(href) = link.value().attr("href") else {
            continue;
        };
        match base.join(href) {
            Ok(absolute) => {
                urls.insert(absolute.to_string());
            }
            Err(err) => harvest_warn!("skipping unresolvable item link {href:?}: {err}"),
        }
    }
    urls
}

/// Walks the paginated listing and persists the discovered item URL set.
///
/// Pages are visited strictly sequentially: the pagination transition is
/// stateful and must not be replayed concurrently against one session.
pub struct ListingHarvester<S> {
    session: S,
    rules: ListingRules,
    root_url: String,
    discovery: DiscoveryStore,
    failed: FailedPageStore,
}

impl<S: ListingSession> ListingHarvester<S> {
    pub fn new(
        session: S,
        rules: ListingRules,
        root_url: impl Into<String>,
        discovery: DiscoveryStore,
        failed: FailedPageStore,
    ) -> Self {
        Self {
            session,
            rules,
            root_url: root_url.into(),
            discovery,
            failed,
        }
    }

    /// Discovers the full item URL set.
    ///
    /// Idempotent: if the discovery file already exists the persisted set is
    /// returned without touching the network. Individual page failures are
    /// recorded as failed-page markers and do not abort the walk; only an
    /// unreachable listing root is fatal.
    pub async fn harvest(&mut self) -> Result<BTreeSet<String>, HarvestError> {
        if self.discovery.exists() {
            harvest_info!(
                "discovery file {:?} already exists; skipping listing walk",
                self.discovery.path()
            );
            return Ok(self.discovery.load()?);
        }

        let first = self
            .session
            .open(&self.root_url)
            .await
            .map_err(HarvestError::RootUnreachable)?;
        let base = self.base_url()?;
        let pages = total_pages(&self.rules, &first)?;
        harvest_info!("listing has {pages} page(s)");

        let mut urls = BTreeSet::new();
        let mut failed_pages = BTreeSet::new();
        for index in 1..=pages {
            // Page 1 is the already-loaded results view.
            let html = if index == 1 {
                first.clone()
            } else {
                match self.session.goto_page(index).await {
                    Ok(html) => html,
                    Err(err) => {
                        harvest_warn!("pagination to page {index}/{pages} failed: {err}");
                        failed_pages.insert(index);
                        continue;
                    }
                }
            };
            let found = extract_item_urls(&self.rules, &html, &base);
            if found.is_empty() {
                harvest_warn!("page {index}/{pages} yielded no item links");
                failed_pages.insert(index);
                continue;
            }
            let before = urls.len();
            urls.extend(found);
            harvest_info!(
                "page {index}/{pages}: {} new urls, {} total",
                urls.len() - before,
                urls.len()
            );
        }

        self.discovery.save(&urls)?;
        self.failed.save(&failed_pages)?;
        Ok(urls)
    }

    /// Re-scrapes the pages recorded as failed, unioning newly found URLs
    /// into the existing discovery set. URLs are never removed. Markers for
    /// pages that fail again stay behind for a future run; if every marker
    /// resolves the marker file is deleted.
    pub async fn retry_failed(&mut self) -> Result<BTreeSet<String>, HarvestError> {
        let mut pending = self.failed.load()?;
        if pending.is_empty() {
            return Err(HarvestError::NothingToRetry);
        }

        // A pagination transition is only meaningful relative to the base
        // results view, so that state must be reasserted before replaying
        // any transition.
        let first = self
            .session
            .open(&self.root_url)
            .await
            .map_err(HarvestError::RootUnreachable)?;
        let base = self.base_url()?;

        let mut urls = if self.discovery.exists() {
            self.discovery.load()?
        } else {
            BTreeSet::new()
        };

        let mut resolved = Vec::new();
        for &index in &pending {
            let html = if index == 1 {
                Ok(first.clone())
            } else {
                self.session.goto_page(index).await
            };
            match html {
                Ok(html) => {
                    let found = extract_item_urls(&self.rules, &html, &base);
                    if found.is_empty() {
                        harvest_warn!("retried page {index} still yielded no item links");
                        continue;
                    }
                    let before = urls.len();
                    urls.extend(found);
                    harvest_info!(
                        "retried page {index}: {} new urls, {} total",
                        urls.len() - before,
                        urls.len()
                    );
                    resolved.push(index);
                }
                Err(err) => harvest_warn!("retried page {index} failed again: {err}"),
            }
        }

        for index in resolved {
            pending.remove(&index);
        }
        self.discovery.save(&urls)?;
        self.failed.save(&pending)?;
        if pending.is_empty() {
            harvest_info!("all failed pages resolved");
        } else {
            harvest_warn!("{} page(s) still outstanding", pending.len());
        }
        Ok(urls)
    }

    fn base_url(&self) -> Result<Url, HarvestError> {
        Url::parse(&self.root_url).map_err(|err| {
            HarvestError::RootUnreachable(ClientError::InvalidUrl(err.to_string()))
        })
    }
}
