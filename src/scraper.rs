use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::FutureExt;
use indicatif::{ProgressBar, ProgressStyle};
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tracing::{info, warn};

use crate::fetcher::{FetchError, PageFetcher};
use crate::links::Link;
use crate::parser::{self, ExtractError, TweetMetadata};
use crate::settings::Settings;

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("extraction failed: {0}")]
    Extract(#[from] ExtractError),

    #[error("timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("worker panicked: {0}")]
    Panicked(String),
}

#[derive(Debug)]
pub enum Outcome {
    Metadata(TweetMetadata),
    Failed(ScrapeError),
}

/// Exactly one of these is produced for every link handed to [`scrape_all`].
#[derive(Debug)]
pub struct ScrapeResult {
    pub link: Link,
    pub outcome: Outcome,
}

impl ScrapeResult {
    pub fn metadata(&self) -> Option<&TweetMetadata> {
        match &self.outcome {
            Outcome::Metadata(m) => Some(m),
            Outcome::Failed(_) => None,
        }
    }

    pub fn error(&self) -> Option<&ScrapeError> {
        match &self.outcome {
            Outcome::Metadata(_) => None,
            Outcome::Failed(e) => Some(e),
        }
    }
}

/// Scrape stats returned after completion.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScrapeStats {
    pub total: usize,
    pub ok: usize,
    /// Page loaded but no matching response was seen.
    pub not_found: usize,
    pub errors: usize,
}

#[derive(Debug, Clone)]
pub struct ScrapeOptions {
    pub concurrency: usize,
    pub page_timeout: Duration,
    pub endpoint_marker: String,
    pub show_progress: bool,
}

impl From<&Settings> for ScrapeOptions {
    fn from(s: &Settings) -> Self {
        ScrapeOptions {
            concurrency: s.concurrency,
            page_timeout: s.page_timeout(),
            endpoint_marker: s.endpoint_marker.clone(),
            show_progress: true,
        }
    }
}

/// Scrape every link with at most `concurrency` visits in flight.
///
/// Results come back in completion order. Failures, timeouts, panics and
/// cancellation are all folded into the per-link [`Outcome`].
pub async fn scrape_all(
    fetcher: Arc<dyn PageFetcher>,
    links: Vec<Link>,
    opts: &ScrapeOptions,
    cancel: watch::Receiver<bool>,
) -> Result<(Vec<ScrapeResult>, ScrapeStats)> {
    let total = links.len();
    let semaphore = Arc::new(Semaphore::new(opts.concurrency.max(1)));
    let opts = Arc::new(opts.clone());

    let pb = if opts.show_progress {
        ProgressBar::new(total as u64)
    } else {
        ProgressBar::hidden()
    };
    pb.set_style(
        ProgressStyle::default_bar()
            .template("Scraping posts [{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")?
            .progress_chars("=> "),
    );

    // Channel: workers send results, this task collects them
    let (tx, mut rx) = tokio::sync::mpsc::channel::<ScrapeResult>(opts.concurrency.max(1) * 2);

    for link in links {
        let fetcher = Arc::clone(&fetcher);
        let sem = Arc::clone(&semaphore);
        let opts = Arc::clone(&opts);
        let mut cancel = cancel.clone();
        let tx = tx.clone();

        tokio::spawn(async move {
            let outcome = scrape_link(fetcher.as_ref(), &link, &sem, &opts, &mut cancel).await;
            let _ = tx.send(ScrapeResult { link, outcome }).await;
        });
    }

    // Drop our copy of tx so rx closes when all spawned tasks finish
    drop(tx);

    let mut results = Vec::with_capacity(total);
    let mut stats = ScrapeStats {
        total,
        ..Default::default()
    };

    while let Some(result) = rx.recv().await {
        if let Some(e) = result.error() {
            warn!("Scrape failed for {}: {}", result.link, e);
            stats.errors += 1;
        } else if result.metadata().is_some_and(TweetMetadata::is_empty) {
            stats.not_found += 1;
        } else {
            stats.ok += 1;
        }
        results.push(result);
        pb.inc(1);
    }

    pb.finish_and_clear();
    info!(
        "Scraped {} posts ({} ok, {} without data, {} errors)",
        stats.total, stats.ok, stats.not_found, stats.errors
    );

    Ok((results, stats))
}

async fn scrape_link(
    fetcher: &dyn PageFetcher,
    link: &Link,
    semaphore: &Semaphore,
    opts: &ScrapeOptions,
    cancel: &mut watch::Receiver<bool>,
) -> Outcome {
    let _permit = tokio::select! {
        biased;
        _ = cancelled(cancel) => return Outcome::Failed(ScrapeError::Cancelled),
        permit = semaphore.acquire() => match permit {
            Ok(p) => p,
            Err(_) => return Outcome::Failed(ScrapeError::Cancelled),
        },
    };

    let visit = tokio::time::timeout(
        opts.page_timeout,
        fetch_and_extract(fetcher, link, &opts.endpoint_marker),
    );

    tokio::select! {
        biased;
        _ = cancelled(cancel) => Outcome::Failed(ScrapeError::Cancelled),
        res = AssertUnwindSafe(visit).catch_unwind() => match res {
            Ok(Ok(Ok(meta))) => Outcome::Metadata(meta),
            Ok(Ok(Err(e))) => Outcome::Failed(e),
            Ok(Err(_)) => Outcome::Failed(ScrapeError::Timeout(opts.page_timeout)),
            Err(panic) => Outcome::Failed(ScrapeError::Panicked(panic_message(panic.as_ref()))),
        },
    }
}

async fn fetch_and_extract(
    fetcher: &dyn PageFetcher,
    link: &Link,
    marker: &str,
) -> std::result::Result<TweetMetadata, ScrapeError> {
    let responses = fetcher.fetch(link).await?;
    Ok(parser::extract_metadata(link, &responses, marker)?)
}

/// Resolves once cancellation is signalled; never, if the sender goes away
/// without signalling.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        let cancelled = *rx.borrow_and_update();
        if cancelled {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::{ResourceKind, ResponseRecord};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const ENDPOINT: &str = "https://x.com/i/api/graphql/q/TweetResultByRestId";

    #[derive(Clone)]
    enum Behavior {
        Tweet(&'static str),
        Nothing,
        Garbage,
        Fail,
        Hang,
        Panic,
    }

    struct FakeFetcher {
        pages: HashMap<String, Behavior>,
        delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl FakeFetcher {
        fn new(pages: &[(&str, Behavior)]) -> Self {
            FakeFetcher {
                pages: pages
                    .iter()
                    .map(|(u, b)| (u.to_string(), b.clone()))
                    .collect(),
                delay: Duration::from_millis(5),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PageFetcher for FakeFetcher {
        async fn fetch(&self, link: &Link) -> std::result::Result<Vec<ResponseRecord>, FetchError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let record = |body: String| ResponseRecord {
                url: ENDPOINT.to_string(),
                kind: ResourceKind::Xhr,
                body: Some(body),
            };
            match self.pages.get(link.as_str()).cloned().unwrap_or(Behavior::Nothing) {
                Behavior::Tweet(text) => Ok(vec![record(
                    serde_json::json!({"data": {"tweetResult": {"result": {"legacy": {
                        "full_text": text, "favorite_count": 1
                    }}}}})
                    .to_string(),
                )]),
                Behavior::Nothing => Ok(Vec::new()),
                Behavior::Garbage => Ok(vec![record("{\"data\":{}}".to_string())]),
                Behavior::Fail => Err(FetchError::Navigation {
                    url: link.to_string(),
                    message: "net::ERR_TIMED_OUT".to_string(),
                }),
                Behavior::Hang => std::future::pending().await,
                Behavior::Panic => panic!("browser exploded"),
            }
        }
    }

    fn options(concurrency: usize, timeout_ms: u64) -> ScrapeOptions {
        ScrapeOptions {
            concurrency,
            page_timeout: Duration::from_millis(timeout_ms),
            endpoint_marker: parser::DEFAULT_ENDPOINT_MARKER.to_string(),
            show_progress: false,
        }
    }

    fn links(urls: &[&str]) -> Vec<Link> {
        urls.iter().map(|u| Link::parse(u).unwrap()).collect()
    }

    fn by_link(results: &[ScrapeResult]) -> HashMap<&str, &ScrapeResult> {
        results.iter().map(|r| (r.link.as_str(), r)).collect()
    }

    #[tokio::test]
    async fn one_result_per_link_despite_failures() {
        let urls = [
            "https://x.com/a/status/1",
            "https://x.com/b/status/2",
            "https://x.com/c/status/3",
            "https://x.com/d/status/4",
            "https://x.com/e/status/5",
        ];
        let fetcher = FakeFetcher::new(&[
            (urls[0], Behavior::Tweet("hello")),
            (urls[1], Behavior::Fail),
            (urls[2], Behavior::Nothing),
            (urls[3], Behavior::Garbage),
            (urls[4], Behavior::Panic),
        ]);
        let (_tx, rx) = watch::channel(false);

        let (results, stats) = scrape_all(Arc::new(fetcher), links(&urls), &options(5, 2_000), rx)
            .await
            .unwrap();

        assert_eq!(results.len(), urls.len());
        assert_eq!(
            stats,
            ScrapeStats {
                total: 5,
                ok: 1,
                not_found: 1,
                errors: 3
            }
        );

        let map = by_link(&results);
        assert_eq!(map[urls[0]].metadata().unwrap().text.as_deref(), Some("hello"));
        assert!(matches!(map[urls[1]].error(), Some(ScrapeError::Fetch(_))));
        let empty = map[urls[2]].metadata().unwrap();
        assert!(empty.is_empty());
        assert_eq!(empty.username.as_deref(), Some("c"));
        assert!(matches!(map[urls[3]].error(), Some(ScrapeError::Extract(_))));
        match map[urls[4]].error() {
            Some(ScrapeError::Panicked(msg)) => assert!(msg.contains("browser exploded")),
            other => panic!("expected panic outcome, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn stalled_visit_times_out_without_blocking_others() {
        let urls = ["https://x.com/slow/status/1", "https://x.com/fast/status/2"];
        let fetcher = FakeFetcher::new(&[(urls[0], Behavior::Hang), (urls[1], Behavior::Tweet("ok"))]);
        let (_tx, rx) = watch::channel(false);

        let (results, stats) = scrape_all(Arc::new(fetcher), links(&urls), &options(1, 100), rx)
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(stats.ok, 1);
        let map = by_link(&results);
        assert!(matches!(map[urls[0]].error(), Some(ScrapeError::Timeout(_))));
        assert!(map[urls[1]].metadata().is_some());
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let urls: Vec<String> = (0..12).map(|i| format!("https://x.com/u/status/{i}")).collect();
        let url_refs: Vec<&str> = urls.iter().map(String::as_str).collect();
        let mut fetcher = FakeFetcher::new(&[]);
        fetcher.delay = Duration::from_millis(20);
        let fetcher = Arc::new(fetcher);
        let (_tx, rx) = watch::channel(false);

        let (results, _) = scrape_all(fetcher.clone(), links(&url_refs), &options(3, 5_000), rx)
            .await
            .unwrap();

        assert_eq!(results.len(), 12);
        let max = fetcher.max_in_flight.load(Ordering::SeqCst);
        assert!(max <= 3, "saw {max} visits in flight");
        assert!(max >= 1);
    }

    #[tokio::test]
    async fn cancellation_still_yields_every_result() {
        let urls = [
            "https://x.com/a/status/1",
            "https://x.com/b/status/2",
            "https://x.com/c/status/3",
        ];
        let fetcher = FakeFetcher::new(&[
            (urls[0], Behavior::Hang),
            (urls[1], Behavior::Hang),
            (urls[2], Behavior::Hang),
        ]);
        let (tx, rx) = watch::channel(false);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = tx.send(true);
        });

        let (results, stats) = scrape_all(Arc::new(fetcher), links(&urls), &options(2, 60_000), rx)
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(stats.errors, 3);
        assert!(results
            .iter()
            .all(|r| matches!(r.error(), Some(ScrapeError::Cancelled))));
    }

    #[tokio::test]
    async fn empty_input_gives_empty_output() {
        let (_tx, rx) = watch::channel(false);
        let (results, stats) = scrape_all(Arc::new(FakeFetcher::new(&[])), Vec::new(), &options(5, 100), rx)
            .await
            .unwrap();
        assert!(results.is_empty());
        assert_eq!(stats, ScrapeStats::default());
    }
}
