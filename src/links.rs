use std::collections::HashSet;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{info, warn};

const LINK_PATTERN: &str = r"^https://x\.com/\w+/status/\d+$";
const USERNAME_PATTERN: &str = r"https://x\.com/(\w+)/status/\d+";

fn link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(LINK_PATTERN).unwrap())
}

fn username_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(USERNAME_PATTERN).unwrap())
}

/// A post URL that matched the link pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Link(String);

impl Link {
    /// Validate a raw cell. Surrounding whitespace is ignored.
    pub fn parse(raw: &str) -> Option<Link> {
        let candidate = raw.trim();
        link_re()
            .is_match(candidate)
            .then(|| Link(candidate.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn username(&self) -> Option<String> {
        username_from_url(&self.0)
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Author handle between the host and `/status/`, if the URL has that shape.
pub fn username_from_url(url: &str) -> Option<String> {
    username_re()
        .captures(url)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Scan every cell of a headerless CSV and keep the ones that are links,
/// in the order they were encountered.
pub fn filter_links<R: Read>(input: R, dedup: bool) -> Result<Vec<Link>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(input);

    let mut seen = HashSet::new();
    let mut links = Vec::new();

    for record in reader.byte_records() {
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                warn!("Skipping unreadable input row: {}", e);
                continue;
            }
        };
        // Cells are checked one by one so a stray invalid byte only costs its own cell.
        for cell in record.iter() {
            let Some(link) = std::str::from_utf8(cell).ok().and_then(Link::parse) else {
                continue;
            };
            if dedup && !seen.insert(link.clone()) {
                continue;
            }
            links.push(link);
        }
    }

    Ok(links)
}

/// Write links one per line, no header.
pub fn write_links<W: Write>(out: W, links: &[Link]) -> Result<()> {
    let mut out = BufWriter::new(out);
    for link in links {
        writeln!(out, "{}", link)?;
    }
    out.flush()?;
    Ok(())
}

/// Filter `input` into `output`, returning how many links were kept.
pub fn filter_links_file(input: &Path, output: &Path, dedup: bool) -> Result<usize> {
    let infile =
        File::open(input).with_context(|| format!("Failed to open input {}", input.display()))?;
    let links = filter_links(infile, dedup)?;

    let outfile = File::create(output)
        .with_context(|| format!("Failed to create links file {}", output.display()))?;
    write_links(outfile, &links)?;

    info!(
        "Kept {} links from {} -> {}",
        links.len(),
        input.display(),
        output.display()
    );
    Ok(links.len())
}

/// Read a links file back, in file order.
pub fn load_links(path: &Path) -> Result<Vec<Link>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open links file {}", path.display()))?;
    read_links(file)
}

fn read_links<R: Read>(input: R) -> Result<Vec<Link>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(input);

    let mut links = Vec::new();
    for record in reader.records() {
        let record = record.context("Failed to read links file")?;
        for cell in record.iter().filter(|c| !c.trim().is_empty()) {
            match Link::parse(cell) {
                Some(link) => links.push(link),
                None => warn!("Ignoring invalid link in links file: {:?}", cell),
            }
        }
    }
    Ok(links)
}
