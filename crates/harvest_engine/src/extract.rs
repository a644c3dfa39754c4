use std::collections::BTreeMap;

use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured payload extracted from one item detail page.
///
/// Every field beyond the source URL is best-effort: a missing element on
/// the page leaves the field absent rather than failing the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_crc: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_usd: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub main_image: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gallery: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mileage_km: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub displacement_cc: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub general: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub seller: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seller_comment: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub equipment: Vec<String>,
}

impl ItemRecord {
    fn empty(url: &str) -> Self {
        Self {
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
            general: BTreeMap::new(),
            seller: BTreeMap::new(),
            seller_comment: None,
            equipment: Vec::new(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExtractError {
    #[error("document is not a recognizable detail page")]
    NotADetailPage,
}

/// Turns one fetched detail document into a structured record.
pub trait RecordExtractor: Send + Sync {
    fn extract(&self, html: &str, url: &str) -> Result<ItemRecord, ExtractError>;
}

/// Extractor for the used-vehicle detail pages of the default site.
///
/// Field-level failures are non-fatal; only a document with neither a title
/// header nor a general-info table is rejected.
#[derive(Debug, Default)]
pub struct VehicleDetailExtractor;

impl RecordExtractor for VehicleDetailExtractor {
    fn extract(&self, html: &str, url: &str) -> Result<ItemRecord, ExtractError> {
        let doc = Html::parse_document(html);
        let mut record = ItemRecord::empty(url);

        let header_sel = Selector::parse("div.header-text h1").ok();
        let usd_sel = Selector::parse("div.header-text h3").ok();
        let image_sel = Selector::parse("div.bannerimg").ok();
        let gallery_sel = Selector::parse("div.ws_images ul li img").ok();
        let general_sel = Selector::parse("table.mytext2 tr").ok();
        let table_sel = Selector::parse("table").ok();
        let row_sel = Selector::parse("tr").ok();
        let cell_sel = Selector::parse("td").ok();
        let equipment_sel =
            Selector::parse("table.table-bordered tbody tr").ok();
        let check_sel = Selector::parse("i.icon-check").ok();

        let mut headers = header_sel
            .as_ref()
            .map(|sel| doc.select(sel))
            .into_iter()
            .flatten();
        if let Some(title) = headers.next() {
            apply_title(&mut record, &element_text(title));
        }
        if let Some(price) = headers.next() {
            record.price_crc = digits(&element_text(price));
        }
        if let Some(sel) = usd_sel.as_ref() {
            if let Some(price) = doc.select(sel).next() {
                record.price_usd = digits(&element_text(price));
            }
        }

        if let Some(sel) = image_sel.as_ref() {
            record.main_image = doc
                .select(sel)
                .next()
                .and_then(|el| el.value().attr("data-image-src"))
                .map(str::to_string);
        }
        if let Some(sel) = gallery_sel.as_ref() {
            record.gallery = doc
                .select(sel)
                .filter_map(|img| img.value().attr("src"))
                .map(str::to_string)
                .collect();
        }

        if let (Some(rows), Some(cells)) = (general_sel.as_ref(), cell_sel.as_ref()) {
            for row in doc.select(rows) {
                let columns: Vec<ElementRef<'_>> = row.select(cells).collect();
                if columns.len() == 2 {
                    let key = normalize_key(&element_text(columns[0]));
                    let value = collapse_whitespace(&element_text(columns[1]));
                    if !key.is_empty() && !value.is_empty() {
                        record.general.insert(key, value);
                    }
                } else if columns.len() == 1
                    && columns[0].value().attr("bgcolor") == Some("#FAF7B4")
                {
                    // The highlighted single-cell row carries the seller's
                    // free-text comment.
                    let comment = collapse_whitespace(&element_text(columns[0]));
                    if !comment.is_empty() {
                        record.seller_comment = Some(comment);
                    }
                }
            }
        }
        record.mileage_km = record.general.get("kilometraje").and_then(|v| digits(v));
        record.displacement_cc = record.general.get("cilindrada").and_then(|v| digits(v));

        if let (Some(tables), Some(rows), Some(cells)) =
            (table_sel.as_ref(), row_sel.as_ref(), cell_sel.as_ref())
        {
            // The seller table has no class of its own; it is identified by
            // its "Vendedor" label cell.
            let seller_table = doc.select(tables).find(|table| {
                table.select(rows).any(|row| {
                    let columns: Vec<ElementRef<'_>> = row.select(cells).collect();
                    columns.len() == 2 && element_text(columns[0]).contains("Vendedor")
                })
            });
            if let Some(table) = seller_table {
                for row in table.select(rows) {
                    let columns: Vec<ElementRef<'_>> = row.select(cells).collect();
                    if columns.len() != 2 {
                        continue;
                    }
                    let key = normalize_key(&element_text(columns[0]));
                    let value = collapse_whitespace(&element_text(columns[1]));
                    if !key.is_empty() && !value.is_empty() {
                        record.seller.insert(key, value);
                    }
                }
            }
        }

        if let (Some(rows), Some(cells), Some(check)) =
            (equipment_sel.as_ref(), cell_sel.as_ref(), check_sel.as_ref())
        {
            for row in doc.select(rows) {
                let columns: Vec<ElementRef<'_>> = row.select(cells).collect();
                if columns.len() == 2 && columns[1].select(check).next().is_some() {
                    record.equipment.push(collapse_whitespace(&element_text(columns[0])));
                }
            }
            record.equipment.sort();
        }

        if record.brand.is_none() && record.model.is_none() && record.general.is_empty() {
            return Err(ExtractError::NotADetailPage);
        }
        Ok(record)
    }
}

/// Splits a header like `HYUNDAI TUCSON 2019` into brand, model and year.
/// The brand is the longest known-brand prefix; multi-word brands are why a
/// plain first-token split does not work.
fn apply_title(record: &mut ItemRecord, title: &str) {
    let mut parts: Vec<&str> = title.split_whitespace().collect();
    if let Some(last) = parts.last() {
        if last.len() == 4 && last.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(year) = last.parse() {
                record.year = Some(year);
                parts.pop();
            }
        }
    }
    let remaining = parts.join(" ");
    let upper = remaining.to_uppercase();
    let brand = KNOWN_BRANDS
        .iter()
        .filter(|brand| upper.starts_with(*brand))
        .max_by_key(|brand| brand.len());
    match brand {
        Some(brand) => {
            record.brand = Some((*brand).to_string());
            let model = remaining.get(brand.len()..).unwrap_or("").trim();
            record.model = Some(model.to_string());
        }
        None if !remaining.is_empty() => {
            record.model = Some(remaining);
        }
        None => {}
    }
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

fn normalize_key(raw: &str) -> String {
    raw.trim()
        .trim_end_matches(':')
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

fn collapse_whitespace(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Digits-only numeric parse, used for prices, mileage and displacement.
/// Returns `None` for values like `ND` with no digits at all.
fn digits(raw: &str) -> Option<u64> {
    let filtered: String = raw.chars().filter(char::is_ascii_digit).collect();
    if filtered.is_empty() {
        return None;
    }
    filtered.parse().ok()
}

/// Brand names the title parser recognizes, including multi-word marques.
const KNOWN_BRANDS: &[&str] = &[
    "ACURA", "ALFA ROMEO", "AMC", "ARO", "ASIA", "ASTON MARTIN", "AUDI", "AUSTIN", "BAW",
    "BENTLEY", "BLUEBIRD", "BMW", "BRILLIANCE", "BUICK", "BYD", "CADILLAC", "CHANA", "CHANGAN",
    "CHERY", "CHEVROLET", "CHRYSLER", "CITROEN", "DACIA", "DAEWOO", "DAIHATSU", "DATSUN",
    "DODGE/RAM", "DODGE", "RAM", "DONFENG(ZNA)", "DONFENG", "ZNA", "EAGLE", "FAW", "FERRARI",
    "FIAT", "FORD", "FOTON", "FREIGHTLINER", "GEELY", "GENESIS", "GEO", "GMC", "GONOW",
    "GREAT WALL", "HAFEI", "HAIMA", "HEIBAO", "HIGER", "HINO", "HONDA", "HUMMER", "HYUNDAI",
    "INFINITI", "INTERNATIONAL", "ISUZU", "IVECO", "JAC", "JAGUAR", "JEEP", "JINBEI", "JMC",
    "JONWAY", "KENWORTH", "KIA", "LADA", "LAMBORGHINI", "LANCIA", "LAND ROVER", "LEXUS", "LIFAN",
    "LINCOLN", "LOTUS", "MACK", "MAGIRUZ", "MAHINDRA", "MASERATI", "MAZDA", "MERCEDES BENZ",
    "MERCURY", "MG", "MINI", "MITSUBISHI", "NISSAN", "OLDSMOBILE", "OPEL", "PETERBILT",
    "PEUGEOT", "PLYMOUTH", "POLARSUN", "PONTIAC", "PORSCHE", "PROTON", "RAMBLER", "RENAULT",
    "REVA", "ROLLS ROYCE", "ROVER", "SAAB", "SAMSUNG", "SATURN", "SCANIA", "SCION", "SEAT",
    "SKODA", "SMART", "SOUEAST", "SSANG YONG", "SUBARU", "SUZUKI", "TIANMA", "TIGER TRUCK",
    "TOYOTA", "VOLKSWAGEN", "VOLVO", "WESTERN STAR", "YUGO", "ZOTYE",
];
