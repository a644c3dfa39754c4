//! Harvest core: pure decision logic, no I/O.
mod controller;
mod idents;
mod progress;

pub use controller::{
    Adjustment, ConcurrencyController, ControllerConfig, ControllerConfigError,
};
pub use idents::{item_id, page_marker, parse_page_marker, DEFAULT_ID_PARAM};
pub use progress::estimate_remaining;
