use url::Url;

/// Query parameter carrying the numeric item id on detail URLs.
pub const DEFAULT_ID_PARAM: &str = "c";

/// Extracts the numeric item id from a detail URL's query string.
///
/// Returns `None` for unparseable URLs, a missing parameter, or a value
/// that is not purely numeric.
pub fn item_id(url: &str, param: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let value = parsed
        .query_pairs()
        .find(|(key, _)| key == param)
        .map(|(_, value)| value.into_owned())?;
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(value)
}

/// Formats the persisted marker for a listing page that failed to scrape.
pub fn page_marker(index: u32) -> String {
    format!("PAGE::{index}")
}

/// Parses a persisted failed-page marker back into its page index.
pub fn parse_page_marker(marker: &str) -> Option<u32> {
    marker.strip_prefix("PAGE::")?.parse().ok()
}
