use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::DateTime;
use tracing::info;

use crate::parser::TweetMetadata;
use crate::scraper::ScrapeResult;

pub const HEADER: [&str; 7] = [
    "Link",
    "Text",
    "Username",
    "Date",
    "Comment Count",
    "Like Count",
    "Share Count",
];
const DELIMITER: u8 = b';';
const NOT_AVAILABLE: &str = "N/A";

/// X's `created_at` layout, e.g. `Wed Oct 10 20:19:24 +0000 2018`.
const CREATED_AT_FORMAT: &str = "%a %b %d %H:%M:%S %z %Y";

#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    pub iso_dates: bool,
}

/// Write results to `path` in the order given.
pub fn write_results(path: &Path, results: &[ScrapeResult], opts: WriteOptions) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create output file {}", path.display()))?;
    write_rows(file, results, opts)?;
    info!("Wrote {} rows to {}", results.len(), path.display());
    Ok(())
}

fn write_rows<W: Write>(out: W, results: &[ScrapeResult], opts: WriteOptions) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(DELIMITER)
        .from_writer(out);

    writer.write_record(HEADER)?;
    let empty = TweetMetadata::default();
    for result in results {
        let meta = result.metadata().unwrap_or(&empty);
        writer.write_record(row(result.link.as_str(), meta, opts))?;
    }
    writer.flush()?;
    Ok(())
}

fn row(link: &str, meta: &TweetMetadata, opts: WriteOptions) -> [String; 7] {
    let date = meta.date.as_deref().map(|d| {
        if opts.iso_dates {
            iso_date(d)
        } else {
            d.to_string()
        }
    });
    [
        link.to_string(),
        or_na(meta.text.clone()),
        or_na(meta.username.clone()),
        or_na(date),
        or_na(meta.comment_count.map(|n| n.to_string())),
        or_na(meta.like_count.map(|n| n.to_string())),
        or_na(meta.share_count.map(|n| n.to_string())),
    ]
}

fn or_na(value: Option<String>) -> String {
    value.unwrap_or_else(|| NOT_AVAILABLE.to_string())
}

/// RFC 3339 form of a `created_at` value; anything unparseable passes through.
fn iso_date(raw: &str) -> String {
    DateTime::parse_from_str(raw, CREATED_AT_FORMAT)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|_| raw.to_string())
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OutputSummary {
    pub rows: usize,
    pub with_text: usize,
    pub not_available: usize,
}

pub fn summarize(path: &Path) -> Result<OutputSummary> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open output file {}", path.display()))?;
    summarize_rows(file)
}

fn summarize_rows<R: Read>(input: R) -> Result<OutputSummary> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(DELIMITER)
        .flexible(true)
        .from_reader(input);

    let mut summary = OutputSummary::default();
    for record in reader.records() {
        let record = record.context("Failed to read output row")?;
        summary.rows += 1;
        // Columns after Username come from the page; the username is URL-derived.
        let fetched = [1, 3, 4, 5, 6]
            .iter()
            .filter_map(|&i| record.get(i))
            .any(|v| v != NOT_AVAILABLE);
        if record.get(1).is_some_and(|t| t != NOT_AVAILABLE) {
            summary.with_text += 1;
        }
        if !fetched {
            summary.not_available += 1;
        }
    }
    Ok(summary)
}
