//! Concurrent archive search.
//!
//! [`ArchiveSearchExecutor`] queries the catalog once per date chunk with a
//! bounded number of requests in flight. A chunk that fails is logged and
//! treated as empty; the search as a whole only fails on invalid input.
//!
//! [`search_archive`] runs the full search stage: chunk the window, execute
//! the queries, normalize the items in chronological chunk order (so the
//! canonical CRS is deterministic), and count images per grid cell.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::catalog::Catalog;
use crate::chunk::chunk_window;
use crate::crs::Crs;
use crate::error::PipelineError;
use crate::models::{AreaOfInterest, DateChunk, RawItem, SearchWindow, TileRecord};
use crate::normalize::{assign_image_counts, normalize_chunk};
use crate::progress::{NoProgress, SearchProgressEvent, SearchProgressReporter};

/// Items returned for one chunk.
#[derive(Debug, Clone)]
pub struct ChunkResult {
    pub chunk: DateChunk,
    pub items: Vec<RawItem>,
}

/// What came back from executing every chunk.
#[derive(Debug, Default)]
pub struct SearchRun {
    /// Successful chunks in chronological order. Empty chunks are included.
    pub results: Vec<ChunkResult>,
    pub failures: Vec<PipelineError>,
}

/// Normalized result of a whole archive search.
#[derive(Debug, Clone, Default)]
pub struct SearchOutcome {
    pub tiles: Vec<TileRecord>,
    /// Canonical CRS of every tile; `None` when nothing was found.
    pub crs: Option<Crs>,
    pub chunks_total: usize,
    pub chunks_with_items: usize,
    pub chunks_failed: usize,
}

impl SearchOutcome {
    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }
}

pub struct ArchiveSearchExecutor {
    catalog: Arc<dyn Catalog>,
    max_workers: usize,
    reporter: Arc<dyn SearchProgressReporter>,
}

impl ArchiveSearchExecutor {
    pub fn new(catalog: Arc<dyn Catalog>, max_workers: usize) -> Self {
        Self {
            catalog,
            max_workers: max_workers.max(1),
            reporter: Arc::new(NoProgress),
        }
    }

    pub fn with_reporter(mut self, reporter: Box<dyn SearchProgressReporter>) -> Self {
        self.reporter = Arc::from(reporter);
        self
    }

    /// Query every chunk, at most `max_workers` at a time.
    pub async fn execute(&self, aoi: &AreaOfInterest, chunks: &[DateChunk]) -> SearchRun {
        let mut run = SearchRun::default();
        if chunks.is_empty() {
            return run;
        }

        let total = chunks.len() as u64;
        self.reporter
            .report(SearchProgressEvent::Started { chunks: total });

        let permits = Arc::new(Semaphore::new(self.max_workers.min(chunks.len()).max(1)));
        let mut tasks = JoinSet::new();
        let mut periods = HashMap::new();
        for chunk in chunks.iter().copied() {
            let catalog = Arc::clone(&self.catalog);
            let permits = Arc::clone(&permits);
            let aoi = aoi.clone();
            let handle = tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let result = catalog.search(&aoi, &chunk).await;
                (chunk, result)
            });
            periods.insert(handle.id(), chunk);
        }

        let mut done = 0u64;
        while let Some(joined) = tasks.join_next().await {
            done += 1;
            match joined {
                Ok((chunk, Ok(items))) => {
                    if items.is_empty() {
                        tracing::info!(period = %chunk, "no tiles found");
                    } else {
                        tracing::debug!(period = %chunk, items = items.len(), "chunk searched");
                    }
                    self.reporter.report(SearchProgressEvent::ChunkDone {
                        period: chunk.to_string(),
                        n: done,
                        total,
                        items: items.len() as u64,
                        failed: false,
                    });
                    run.results.push(ChunkResult { chunk, items });
                }
                Ok((chunk, Err(e))) => {
                    self.record_failure(&mut run, chunk.to_string(), format!("{:#}", e), done, total);
                }
                Err(e) => {
                    let period = periods
                        .get(&e.id())
                        .map(ToString::to_string)
                        .unwrap_or_else(|| "unknown".to_string());
                    self.record_failure(&mut run, period, format!("search task failed: {}", e), done, total);
                }
            }
        }

        run.results.sort_by_key(|r| r.chunk.start);
        run
    }

    fn record_failure(&self, run: &mut SearchRun, period: String, reason: String, n: u64, total: u64) {
        let failure = PipelineError::ChunkSearchFailure {
            chunk: period.clone(),
            reason,
        };
        tracing::error!(catalog = self.catalog.name(), "{}", failure);
        self.reporter.report(SearchProgressEvent::ChunkDone {
            period,
            n,
            total,
            items: 0,
            failed: true,
        });
        run.failures.push(failure);
    }
}

/// Search the archive for every tile over `aoi` within `window`.
///
/// Fails only on an invalid chunk size; chunk-level failures are logged and
/// counted in [`SearchOutcome::chunks_failed`].
pub async fn search_archive(
    executor: &ArchiveSearchExecutor,
    aoi: &AreaOfInterest,
    window: &SearchWindow,
    chunk_size: Duration,
    now: DateTime<Utc>,
) -> Result<SearchOutcome, PipelineError> {
    let chunks = chunk_window(window, chunk_size)?;
    tracing::info!(
        chunks = chunks.len(),
        "searching {} to {}",
        window.start().format("%Y-%m-%d"),
        window.end().format("%Y-%m-%d")
    );

    let run = executor.execute(aoi, &chunks).await;

    let mut outcome = SearchOutcome {
        chunks_total: chunks.len(),
        chunks_failed: run.failures.len(),
        ..Default::default()
    };
    for result in run.results {
        if result.items.is_empty() {
            continue;
        }
        let normalized = normalize_chunk(result.items, outcome.crs, now);
        if !normalized.tiles.is_empty() {
            outcome.chunks_with_items += 1;
        }
        outcome.crs = normalized.crs;
        outcome.tiles.extend(normalized.tiles);
    }
    assign_image_counts(&mut outcome.tiles);

    if outcome.is_empty() {
        tracing::warn!("no tiles found for the area and period");
    } else {
        tracing::info!(
            tiles = outcome.tiles.len(),
            crs = ?outcome.crs,
            "archive search complete"
        );
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Catalog that counts concurrent calls and returns one item per chunk.
    struct CountingCatalog {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Catalog for CountingCatalog {
        fn name(&self) -> &str {
            "counting"
        }

        async fn search(&self, _aoi: &AreaOfInterest, chunk: &DateChunk) -> Result<Vec<RawItem>> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![RawItem {
                id: chunk.interval(),
                ..Default::default()
            }])
        }

        async fn search_outcome(&self, _outcome_id: &str) -> Result<Vec<RawItem>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn bounded_concurrency_and_ordered_results() {
        let catalog = Arc::new(CountingCatalog {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let executor = ArchiveSearchExecutor::new(catalog.clone(), 3);
        let window = SearchWindow::new(
            Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2022, 12, 1, 0, 0, 0).unwrap(),
        )
        .unwrap();
        let chunks = chunk_window(&window, Duration::days(30)).unwrap();
        let aoi = AreaOfInterest::around(41.0, 2.0, 1.0).unwrap();

        let run = executor.execute(&aoi, &chunks).await;

        assert!(run.failures.is_empty());
        assert_eq!(run.results.len(), chunks.len());
        assert!(catalog.peak.load(Ordering::SeqCst) <= 3);
        for pair in run.results.windows(2) {
            assert!(pair[0].chunk.start < pair[1].chunk.start);
        }
    }

    /// Catalog that panics for the chunk starting at `panic_at`.
    struct PanickingCatalog {
        panic_at: DateTime<Utc>,
    }

    #[async_trait]
    impl Catalog for PanickingCatalog {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn search(&self, _aoi: &AreaOfInterest, chunk: &DateChunk) -> Result<Vec<RawItem>> {
            if chunk.start == self.panic_at {
                panic!("catalog client crashed");
            }
            Ok(Vec::new())
        }

        async fn search_outcome(&self, _outcome_id: &str) -> Result<Vec<RawItem>> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<SearchProgressEvent>>);

    impl SearchProgressReporter for Arc<Recorder> {
        fn report(&self, event: SearchProgressEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[tokio::test]
    async fn panicked_chunk_is_recorded_as_failure() {
        let window = SearchWindow::new(
            Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2022, 3, 2, 0, 0, 0).unwrap(),
        )
        .unwrap();
        let chunks = chunk_window(&window, Duration::days(30)).unwrap();
        assert_eq!(chunks.len(), 2);
        let recorder = Arc::new(Recorder::default());
        let executor = ArchiveSearchExecutor::new(
            Arc::new(PanickingCatalog {
                panic_at: chunks[1].start,
            }),
            2,
        )
        .with_reporter(Box::new(Arc::clone(&recorder)));
        let aoi = AreaOfInterest::around(41.0, 2.0, 1.0).unwrap();

        let run = executor.execute(&aoi, &chunks).await;

        assert_eq!(run.results.len(), 1);
        assert_eq!(run.failures.len(), 1);
        match &run.failures[0] {
            PipelineError::ChunkSearchFailure { chunk, .. } => {
                assert_eq!(chunk, &chunks[1].to_string())
            }
            other => panic!("unexpected failure {:?}", other),
        }
        let events = recorder.0.lock().unwrap();
        let failed: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                SearchProgressEvent::ChunkDone { period, failed: true, .. } => Some(period.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(failed, vec![chunks[1].to_string()]);
    }

    #[tokio::test]
    async fn empty_chunk_list_is_empty_run() {
        let catalog = Arc::new(CountingCatalog {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let executor = ArchiveSearchExecutor::new(catalog, 10);
        let aoi = AreaOfInterest::around(0.0, 0.0, 1.0).unwrap();
        let run = executor.execute(&aoi, &[]).await;
        assert!(run.results.is_empty() && run.failures.is_empty());
    }
}
