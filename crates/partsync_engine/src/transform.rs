//! CSV transformer: one input file in, twin shards out.
//!
//! Each catalog CSV becomes a primary shard (NDJSON, one document per row)
//! and a search shard (`_bulk` action/document pairs). Both are streamed
//! through buffered writers; nothing is held in memory per file beyond the
//! current row.
//!
//! Supplier CSVs are heterogeneous: column order varies, header names vary,
//! and numeric cells are frequently blank or garbage. Column roles are
//! detected once per file from the header; rows with an empty part number
//! are skipped silently and bad numerics fall back to field defaults.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use csv::StringRecord;
use partsync_protocol::defaults::{DEFAULT_CURRENCY, DEFAULT_STOCK, DEFAULT_WEIGHT_UNIT};
use partsync_protocol::types::PartListing;
use regex::Regex;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Run-scoped inputs every transformed row inherits.
#[derive(Debug, Clone)]
pub struct TransformContext {
    pub integration_id: String,
    pub integration_name: String,
    /// Physical search index for this run; baked into every action line.
    pub run_index: String,
    /// Run start instant, stamped onto every document.
    pub imported_at: DateTime<Utc>,
}

/// Result of transforming one CSV file.
#[derive(Debug, Clone)]
pub struct TransformOutput {
    pub file_name: String,
    pub primary_shard: PathBuf,
    pub search_shard: PathBuf,
    /// Rows emitted to both shards.
    pub records: u64,
    /// Rows dropped for an empty part number.
    pub skipped: u64,
}

/// Column role assignments for one file, built once from its header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ColumnIndex {
    pub part_number: Option<usize>,
    pub description: Option<usize>,
    pub brand: Option<usize>,
    pub price: Option<usize>,
    pub currency: Option<usize>,
    pub quantity: Option<usize>,
    pub min_order_qty: Option<usize>,
    pub stock: Option<usize>,
    pub stock_code: Option<usize>,
    pub weight: Option<usize>,
    pub weight_unit: Option<usize>,
    pub volume: Option<usize>,
    pub delivery_days: Option<usize>,
    pub category: Option<usize>,
    pub subcategory: Option<usize>,
    pub supplier: Option<usize>,
}

impl ColumnIndex {
    /// Match header tokens to roles, case-insensitively by substring.
    ///
    /// Roles whose patterns are substrings of other roles' patterns
    /// ("stock code" vs "stock", "weight unit" vs "weight", "min order qty"
    /// vs "qty") are claimed first; each column feeds at most one role.
    pub(crate) fn detect(headers: &StringRecord) -> Self {
        let tokens: Vec<String> = headers
            .iter()
            .map(|h| clean(h).to_lowercase())
            .collect();
        let mut used = vec![false; tokens.len()];
        let mut index = ColumnIndex::default();

        let mut claim = |slot: &mut Option<usize>, matcher: &dyn Fn(&str) -> bool| {
            for (i, token) in tokens.iter().enumerate() {
                if !used[i] && matcher(token) {
                    used[i] = true;
                    *slot = Some(i);
                    return;
                }
            }
        };

        claim(&mut index.part_number, &|h| {
            h.contains("vendor code") || h.contains("part") || h.contains("sku") || h == "code"
        });
        claim(&mut index.stock_code, &|h| {
            h.contains("stock code") || h.contains("stockcode") || h.contains("stock_code")
        });
        claim(&mut index.min_order_qty, &|h| {
            h.contains("min_lot") || h.contains("moq") || h.contains("min order")
        });
        claim(&mut index.weight_unit, &|h| {
            h.contains("weight unit") || h.contains("weightunit") || h.contains("weight_unit")
        });
        claim(&mut index.subcategory, &|h| {
            h.contains("subcategory") || h.contains("sub category") || h.contains("sub_category")
        });
        claim(&mut index.description, &|h| {
            h.contains("title") || h.contains("desc") || h.contains("name")
        });
        claim(&mut index.brand, &|h| {
            h.contains("brand") || h.contains("manufacturer") || h.contains("make")
        });
        claim(&mut index.price, &|h| h.contains("price"));
        claim(&mut index.currency, &|h| h.contains("currency"));
        claim(&mut index.quantity, &|h| {
            h.contains("quantity") || h.contains("qty")
        });
        claim(&mut index.stock, &|h| h.contains("stock"));
        claim(&mut index.weight, &|h| h.contains("weight"));
        claim(&mut index.volume, &|h| h.contains("volume"));
        claim(&mut index.delivery_days, &|h| {
            h.contains("delivery") || h.contains("lead_time") || h.contains("lead time")
        });
        claim(&mut index.category, &|h| h.contains("category"));
        claim(&mut index.supplier, &|h| h.contains("supplier"));

        index
    }
}

/// Transform one CSV into its twin shards. Synchronous; callers run it on a
/// blocking worker.
pub fn transform_file(
    csv_path: &Path,
    shard_dir: &Path,
    ctx: &TransformContext,
) -> Result<TransformOutput> {
    let file_name = csv_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown.csv")
        .to_string();
    let stem = csv_path
        .file_stem()
        .and_then(|n| n.to_str())
        .unwrap_or("shard");

    let delimiter = detect_delimiter(csv_path)?;
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(csv_path)
        .with_context(|| format!("Failed to open {}", csv_path.display()))?;

    let columns = ColumnIndex::detect(reader.headers()?);
    let fallback_stock_code = stock_code_from_file_name(&file_name);

    std::fs::create_dir_all(shard_dir)?;
    let primary_path = shard_dir.join(format!("{}.ndjson", stem));
    let search_path = shard_dir.join(format!("{}.bulk", stem));
    let mut primary = BufWriter::new(File::create(&primary_path)?);
    let mut search = BufWriter::new(File::create(&search_path)?);

    let action_line = format!(r#"{{"index":{{"_index":"{}"}}}}"#, ctx.run_index);

    let mut records = 0u64;
    let mut skipped = 0u64;

    for row in reader.records() {
        let row = row.with_context(|| format!("Failed to read row in {}", file_name))?;

        let part_number = cell(&row, columns.part_number);
        if part_number.is_empty() {
            skipped += 1;
            continue;
        }

        let stock_code = {
            let from_row = cell(&row, columns.stock_code);
            if from_row.is_empty() {
                fallback_stock_code.clone().unwrap_or_default()
            } else {
                from_row.to_string()
            }
        };

        let currency = {
            let raw = cell(&row, columns.currency);
            if raw.is_empty() {
                DEFAULT_CURRENCY.to_string()
            } else {
                raw.to_uppercase()
            }
        };

        let listing = PartListing {
            part_number: part_number.to_string(),
            description: cell(&row, columns.description).to_string(),
            brand: cell(&row, columns.brand).to_string(),
            supplier: cell(&row, columns.supplier).to_string(),
            category: cell(&row, columns.category).to_string(),
            subcategory: cell(&row, columns.subcategory).to_string(),
            stock: non_empty_or(cell(&row, columns.stock), DEFAULT_STOCK),
            stock_code,
            price: parse_f64(cell(&row, columns.price)),
            currency,
            quantity: parse_i32(cell(&row, columns.quantity), 0).max(0),
            min_order_qty: parse_i32(cell(&row, columns.min_order_qty), 1).max(1),
            weight: parse_f64(cell(&row, columns.weight)),
            weight_unit: non_empty_or(cell(&row, columns.weight_unit), DEFAULT_WEIGHT_UNIT),
            volume: parse_f64(cell(&row, columns.volume)),
            delivery_days: parse_i32(cell(&row, columns.delivery_days), 0),
            integration_id: ctx.integration_id.clone(),
            integration_name: ctx.integration_name.clone(),
            file_name: file_name.clone(),
            imported_at: ctx.imported_at,
        };

        let primary_line = serde_json::to_string(&listing)?;
        primary.write_all(primary_line.as_bytes())?;
        primary.write_all(b"\n")?;

        // Search document: same shape minus importedAt, paired with its
        // action line. A pair is indivisible across bulk requests.
        let mut doc = serde_json::to_value(&listing)?;
        if let Some(obj) = doc.as_object_mut() {
            obj.remove("importedAt");
        }
        search.write_all(action_line.as_bytes())?;
        search.write_all(b"\n")?;
        search.write_all(serde_json::to_string(&doc)?.as_bytes())?;
        search.write_all(b"\n")?;

        records += 1;
    }

    primary.flush()?;
    search.flush()?;

    debug!(file = %file_name, records, skipped, "transformed");
    Ok(TransformOutput {
        file_name,
        primary_shard: primary_path,
        search_shard: search_path,
        records,
        skipped,
    })
}

/// Separator heuristic: the first non-empty line picks `;` if it contains
/// one anywhere, else `,`.
fn detect_delimiter(csv_path: &Path) -> Result<u8> {
    let file = File::open(csv_path)
        .with_context(|| format!("Failed to open {}", csv_path.display()))?;
    let reader = BufReader::new(file);

    for line in reader.lines() {
        let line = line.with_context(|| format!("Failed to read {}", csv_path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        return Ok(if line.contains(';') { b';' } else { b',' });
    }
    Ok(b',')
}

/// Derive a stock code from file names like `parts_DS1_part01.csv`.
fn stock_code_from_file_name(file_name: &str) -> Option<String> {
    let re = Regex::new(r"_([A-Z0-9]+)_part").ok()?;
    re.captures(file_name)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

fn cell<'a>(row: &'a StringRecord, idx: Option<usize>) -> &'a str {
    idx.and_then(|i| row.get(i)).map(clean).unwrap_or("")
}

/// Trim whitespace and strip one layer of paired quotes.
fn clean(raw: &str) -> &str {
    let trimmed = raw.trim();
    let bytes = trimmed.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if first == last && (first == b'"' || first == b'\'') {
            return trimmed[1..trimmed.len() - 1].trim();
        }
    }
    trimmed
}

fn non_empty_or(value: &str, default: &str) -> String {
    if value.is_empty() {
        default.to_string()
    } else {
        value.to_string()
    }
}

fn parse_f64(value: &str) -> f64 {
    value.parse::<f64>().unwrap_or(0.0)
}

fn parse_i32(value: &str, default: i32) -> i32 {
    value.parse::<i32>().unwrap_or(default)
}
