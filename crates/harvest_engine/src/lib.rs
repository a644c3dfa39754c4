//! Harvest engine: IO pipeline for listing discovery and detail fetching.
mod client;
mod extract;
mod gate;
mod listing;
mod orchestrator;
mod store;

pub use client::{
    ClientError, ClientSettings, HttpListingSession, HttpPageClient, ListingSession, PageClient,
};
pub use extract::{ExtractError, ItemRecord, RecordExtractor, VehicleDetailExtractor};
pub use gate::{AdmissionGate, GateClosed};
pub use listing::{
    extract_item_urls, total_pages, HarvestError, ListingHarvester, ListingRules,
    DEFAULT_ITEM_LINK_SELECTOR, DEFAULT_PAGE_CONTROL_SELECTOR,
};
pub use orchestrator::{ControllerHandle, Orchestrator, OrchestratorConfig, RunSummary};
pub use store::{DiscoveryStore, FailedPageStore, ItemStore, StoreError};
