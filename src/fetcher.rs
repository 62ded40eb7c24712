//! Rate-limited batch fetcher.
//!
//! Walks the pending queue in fixed-size batches, one lookup in flight at a
//! time. Each batch is gathered in memory, then appended to the metadata log
//! and upserted into the progress store, in that order. The persist step
//! runs however the gather ended (completed, interrupted, or aborted on an
//! authentication failure), so a restart never repeats finished lookups.

use anyhow::Result;
use chrono::Utc;
use indicatif::ProgressBar;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::lookup::LookupService;
use crate::metadata_log::MetadataLog;
use crate::models::{FetchResult, FetchStats, LookupOutcome, LookupStatus, MetadataRecord, PendingTrack, ProgressEntry};
use crate::progress::{create_progress_bar, format_duration, log_progress};
use crate::progress_store::ProgressStore;

/// Granularity at which pauses notice a stop request
const PAUSE_SLICE: Duration = Duration::from_millis(100);

#[derive(Clone, Debug)]
pub struct FetchConfig {
    pub batch_size: usize,
    /// Pause after each lookup
    pub request_delay: Duration,
    /// Pause between batches
    pub batch_delay: Duration,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub backoff_multiplier: u32,
    pub max_backoff: Duration,
    /// Log a cumulative summary every N batches
    pub summary_every: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            request_delay: Duration::from_millis(300),
            batch_delay: Duration::from_secs(5),
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            backoff_multiplier: 2,
            max_backoff: Duration::from_secs(60),
            summary_every: 10,
        }
    }
}

// ============================================================================
// Stop Signal
// ============================================================================

/// Cooperative stop flag shared with the Ctrl-C handler.
#[derive(Clone, Debug, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` unless stopped first. Returns false if stopped.
    pub fn pause(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_stopped() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(PAUSE_SLICE));
        }
    }
}

// ============================================================================
// Fetcher
// ============================================================================

#[derive(Debug)]
pub struct FetchReport {
    pub stats: FetchStats,
    /// Stopped before the queue was drained
    pub interrupted: bool,
}

/// How a batch gather ended.
enum BatchEnd {
    Completed,
    Interrupted,
    Fatal(String),
}

/// Result of one key's lookup including retries.
enum Attempt {
    Done(LookupStatus, Option<MetadataRecord>),
    Interrupted,
    Fatal(String),
}

pub struct Fetcher<'a> {
    service: &'a mut dyn LookupService,
    config: FetchConfig,
    stop: StopSignal,
}

impl<'a> Fetcher<'a> {
    pub fn new(service: &'a mut dyn LookupService, config: FetchConfig, stop: StopSignal) -> Self {
        Self { service, config, stop }
    }

    /// Process `pending` in order. `stats` carries the work counters from
    /// the base scan and is returned filled in.
    pub fn run(
        &mut self,
        pending: &[PendingTrack],
        store: &mut ProgressStore,
        log: &mut MetadataLog,
        mut stats: FetchStats,
    ) -> Result<FetchReport> {
        let start = Instant::now();
        if pending.is_empty() {
            info!("Nothing to fetch: every key is already processed or skipped");
            stats.elapsed_seconds = start.elapsed().as_secs_f64();
            return Ok(FetchReport {
                stats,
                interrupted: false,
            });
        }

        let batch_size = self.config.batch_size.max(1);
        let total_batches = pending.len().div_ceil(batch_size);
        info!(
            "Fetching {} keys in {} batches of {}",
            pending.len(),
            total_batches,
            batch_size
        );

        let pb = create_progress_bar(pending.len() as u64, "Fetching metadata");
        let mut interrupted = false;

        for (batch_idx, chunk) in pending.chunks(batch_size).enumerate() {
            if self.stop.is_stopped() {
                interrupted = true;
                break;
            }

            let mut results = Vec::with_capacity(chunk.len());
            let end = self.gather(chunk, &mut results, &mut stats, &pb);
            persist(&results, store, log, &mut stats)?;
            stats.batches += 1;

            let found = results.iter().filter(|r| r.status == LookupStatus::Found).count();
            info!(
                "Batch {}/{}: {} attempted, {} found, {} persisted",
                batch_idx + 1,
                total_batches,
                results.len(),
                found,
                stats.progress_rows_written
            );
            if (batch_idx + 1) % self.config.summary_every.max(1) == 0 {
                log_summary(&stats, start.elapsed());
            }

            match end {
                BatchEnd::Completed => {}
                BatchEnd::Interrupted => {
                    interrupted = true;
                    break;
                }
                BatchEnd::Fatal(reason) => {
                    pb.abandon_with_message("Aborted: authentication failure");
                    stats.elapsed_seconds = start.elapsed().as_secs_f64();
                    log_summary(&stats, start.elapsed());
                    return Err(PipelineError::Authentication(reason).into());
                }
            }

            if batch_idx + 1 < total_batches && !self.stop.pause(self.config.batch_delay) {
                interrupted = true;
                break;
            }
        }

        if interrupted {
            pb.abandon_with_message("Interrupted");
        } else {
            pb.finish_with_message("Fetch complete");
        }
        stats.elapsed_seconds = start.elapsed().as_secs_f64();
        log_summary(&stats, start.elapsed());

        Ok(FetchReport { stats, interrupted })
    }

    fn gather(
        &mut self,
        chunk: &[PendingTrack],
        results: &mut Vec<FetchResult>,
        stats: &mut FetchStats,
        pb: &ProgressBar,
    ) -> BatchEnd {
        for (i, item) in chunk.iter().enumerate() {
            if self.stop.is_stopped() {
                return BatchEnd::Interrupted;
            }

            let (status, metadata) = match self.lookup_with_retry(item, stats) {
                Attempt::Done(status, metadata) => (status, metadata),
                Attempt::Interrupted => return BatchEnd::Interrupted,
                Attempt::Fatal(reason) => return BatchEnd::Fatal(reason),
            };
            debug!("{} - {}: {}", item.artist, item.track, status.as_str());

            stats.record(status);
            results.push(FetchResult {
                track: item.clone(),
                status,
                metadata,
                fetched_at: Utc::now().timestamp(),
            });
            pb.inc(1);
            log_progress("fetch", stats.attempted as u64, stats.pending as u64, 100);

            if i + 1 < chunk.len() && !self.stop.pause(self.config.request_delay) {
                return BatchEnd::Interrupted;
            }
        }
        BatchEnd::Completed
    }

    fn lookup_with_retry(&mut self, item: &PendingTrack, stats: &mut FetchStats) -> Attempt {
        let max_attempts = self.config.max_attempts.max(1);
        let mut backoff = self.config.initial_backoff;

        for attempt in 1..=max_attempts {
            match self.service.lookup(&item.track, &item.artist) {
                LookupOutcome::Found(metadata) => {
                    return Attempt::Done(LookupStatus::Found, Some(metadata))
                }
                LookupOutcome::NotFound => return Attempt::Done(LookupStatus::NotFound, None),
                LookupOutcome::Fatal(reason) => return Attempt::Fatal(reason),
                LookupOutcome::Transient { reason, retry_after } => {
                    if attempt == max_attempts {
                        warn!(
                            "Giving up on {} - {} after {} attempts: {}",
                            item.artist, item.track, attempt, reason
                        );
                        break;
                    }
                    let wait = retry_after.unwrap_or(backoff).min(self.config.max_backoff);
                    warn!(
                        "{} - {}: {} (attempt {}/{}), retrying in {}",
                        item.artist,
                        item.track,
                        reason,
                        attempt,
                        max_attempts,
                        format_duration(wait)
                    );
                    stats.retries += 1;
                    if !self.stop.pause(wait) {
                        return Attempt::Interrupted;
                    }
                    backoff = backoff
                        .saturating_mul(self.config.backoff_multiplier)
                        .min(self.config.max_backoff);
                }
            }
        }
        Attempt::Done(LookupStatus::Failed, None)
    }
}

/// Log first, then store: a key in the store always has a log row.
fn persist(
    results: &[FetchResult],
    store: &mut ProgressStore,
    log: &mut MetadataLog,
    stats: &mut FetchStats,
) -> Result<()> {
    if results.is_empty() {
        return Ok(());
    }
    stats.log_rows_written += log.append(results)?;
    let entries: Vec<ProgressEntry> = results.iter().map(ProgressEntry::from).collect();
    stats.progress_rows_written += store.upsert_batch(&entries)?;
    Ok(())
}

fn log_summary(stats: &FetchStats, elapsed: Duration) {
    info!(
        "Progress: {}/{} attempted, {} found ({:.1}%), {} not found, {} failed, {} retries, {} persisted [{}]",
        stats.attempted,
        stats.pending,
        stats.found,
        stats.hit_rate(),
        stats.not_found,
        stats.failed,
        stats.retries,
        stats.progress_rows_written,
        format_duration(elapsed)
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize_key;
    use rustc_hash::FxHashMap;
    use std::collections::VecDeque;
    use tempfile::TempDir;

    /// Plays back scripted outcomes per track name; unknown tracks are not found.
    #[derive(Default)]
    struct ScriptedService {
        script: FxHashMap<String, VecDeque<LookupOutcome>>,
        calls: Vec<String>,
        stop_after: Option<(usize, StopSignal)>,
    }

    impl ScriptedService {
        fn with(mut self, track: &str, outcomes: Vec<LookupOutcome>) -> Self {
            self.script.insert(track.to_string(), outcomes.into());
            self
        }
    }

    impl LookupService for ScriptedService {
        fn lookup(&mut self, track: &str, _artist: &str) -> LookupOutcome {
            self.calls.push(track.to_string());
            if let Some((n, stop)) = &self.stop_after {
                if self.calls.len() >= *n {
                    stop.stop();
                }
            }
            self.script
                .get_mut(track)
                .and_then(|q| q.pop_front())
                .unwrap_or(LookupOutcome::NotFound)
        }
    }

    fn quick_config() -> FetchConfig {
        FetchConfig {
            batch_size: 2,
            request_delay: Duration::ZERO,
            batch_delay: Duration::ZERO,
            initial_backoff: Duration::ZERO,
            ..Default::default()
        }
    }

    fn pending(names: &[&str]) -> Vec<PendingTrack> {
        names
            .iter()
            .map(|n| PendingTrack {
                key: normalize_key(Some(n), Some("Artist")),
                track: n.to_string(),
                artist: "Artist".to_string(),
            })
            .collect()
    }

    fn found(id: &str) -> LookupOutcome {
        LookupOutcome::Found(MetadataRecord {
            spotify_id: Some(id.to_string()),
            ..Default::default()
        })
    }

    fn transient() -> LookupOutcome {
        LookupOutcome::Transient {
            reason: "rate limited (429)".to_string(),
            retry_after: Some(Duration::ZERO),
        }
    }

    struct Fixture {
        _dir: TempDir,
        store: ProgressStore,
        log: MetadataLog,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = ProgressStore::open(dir.path().join("progress.db")).unwrap();
        let log = MetadataLog::open(dir.path().join("meta.csv")).unwrap();
        Fixture {
            _dir: dir,
            store,
            log,
        }
    }

    fn stats_for(work: &[PendingTrack]) -> FetchStats {
        FetchStats {
            pending: work.len(),
            ..Default::default()
        }
    }

    #[test]
    fn test_second_run_issues_no_lookups() {
        let mut fx = fixture();
        let work = pending(&["Song A", "Song B", "Song C"]);
        let mut service = ScriptedService::default().with("Song A", vec![found("a")]);

        let report = Fetcher::new(&mut service, quick_config(), StopSignal::new())
            .run(&work, &mut fx.store, &mut fx.log, stats_for(&work))
            .unwrap();
        assert!(!report.interrupted);
        assert_eq!(report.stats.found, 1);
        assert_eq!(report.stats.not_found, 2);
        assert_eq!(report.stats.batches, 2);
        assert_eq!(report.stats.progress_rows_written, 3);
        assert_eq!(service.calls.len(), 3);

        let processed = fx.store.load_all_keys().unwrap();
        let remaining: Vec<PendingTrack> = work
            .into_iter()
            .filter(|p| !processed.contains(&p.key))
            .collect();
        let mut second = ScriptedService::default();
        let report = Fetcher::new(&mut second, quick_config(), StopSignal::new())
            .run(&remaining, &mut fx.store, &mut fx.log, stats_for(&remaining))
            .unwrap();
        assert!(second.calls.is_empty());
        assert_eq!(report.stats.attempted, 0);
    }

    #[test]
    fn test_transient_failure_retried() {
        let mut fx = fixture();
        let work = pending(&["Song A"]);
        let mut service = ScriptedService::default().with("Song A", vec![transient(), found("a")]);

        let report = Fetcher::new(&mut service, quick_config(), StopSignal::new())
            .run(&work, &mut fx.store, &mut fx.log, stats_for(&work))
            .unwrap();
        assert_eq!(service.calls.len(), 2);
        assert_eq!(report.stats.retries, 1);
        assert_eq!(report.stats.found, 1);
    }

    #[test]
    fn test_exhausted_retries_recorded_as_failed() {
        let mut fx = fixture();
        let work = pending(&["Song A"]);
        let mut service = ScriptedService::default()
            .with("Song A", vec![transient(), transient(), transient(), found("late")]);

        let report = Fetcher::new(&mut service, quick_config(), StopSignal::new())
            .run(&work, &mut fx.store, &mut fx.log, stats_for(&work))
            .unwrap();
        assert_eq!(service.calls.len(), 3);
        assert_eq!(report.stats.failed, 1);

        let entry = fx.store.get(&work[0].key).unwrap().unwrap();
        assert_eq!(entry.status, LookupStatus::Failed);
        assert_eq!(entry.metadata, None);
    }

    #[test]
    fn test_auth_failure_persists_gathered_results_then_aborts() {
        let mut fx = fixture();
        let work = pending(&["Song A", "Song B", "Song C"]);
        let mut config = quick_config();
        config.batch_size = 10;
        let mut service = ScriptedService::default()
            .with("Song A", vec![found("a")])
            .with("Song B", vec![LookupOutcome::Fatal("invalid client".to_string())]);

        let err = Fetcher::new(&mut service, config, StopSignal::new())
            .run(&work, &mut fx.store, &mut fx.log, stats_for(&work))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Authentication(_))
        ));
        // Not retried, and nothing after it attempted
        assert_eq!(service.calls, vec!["Song A", "Song B"]);

        assert_eq!(fx.store.len().unwrap(), 1);
        assert!(fx.store.get(&work[0].key).unwrap().is_some());
        assert!(fx.store.get(&work[1].key).unwrap().is_none());
    }

    #[test]
    fn test_interrupt_flushes_partial_batch() {
        let mut fx = fixture();
        let work = pending(&["Song A", "Song B", "Song C", "Song D"]);
        let mut config = quick_config();
        config.batch_size = 10;
        let stop = StopSignal::new();
        let mut service = ScriptedService {
            stop_after: Some((2, stop.clone())),
            ..Default::default()
        };

        let report = Fetcher::new(&mut service, config, stop)
            .run(&work, &mut fx.store, &mut fx.log, stats_for(&work))
            .unwrap();
        assert!(report.interrupted);
        assert_eq!(report.stats.attempted, 2);
        assert_eq!(report.stats.log_rows_written, 2);
        assert_eq!(fx.store.len().unwrap(), 2);
    }

    #[test]
    fn test_pause_returns_early_when_stopped() {
        let stop = StopSignal::new();
        assert!(stop.pause(Duration::ZERO));
        stop.stop();
        let start = Instant::now();
        assert!(!stop.pause(Duration::from_secs(30)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
