//! RFC 6962 ledger source over HTTP.
//!
//! `prepare` reads the signed tree head from `ct/v1/get-sth`; `scan` splits the
//! requested range into fixed-size batches and fetches them from
//! `ct/v1/get-entries` on a pool of fetch threads. Logs may return fewer
//! entries than requested, in which case the fetcher continues from the last
//! index it received. Fetched batches flow to the calling thread over a
//! bounded channel, so a slow handler throttles fetching.

use super::{EntryKind, LedgerEntry, LedgerSource, ScanStats, TreeHead};
use crate::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use crossbeam_channel::{Receiver, Sender};
use serde::Deserialize;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for the HTTP ledger source.
#[derive(Debug, Clone)]
pub struct HttpSourceConfig {
    /// Log base URL, e.g. `https://ct.googleapis.com/logs/argon2024/`.
    pub url: String,

    /// Entries requested per `get-entries` call.
    /// Default: 1000
    pub batch_size: i64,

    /// Number of concurrent fetch threads.
    /// Default: 10
    pub parallel_fetch: usize,

    /// Per-request timeout.
    /// Default: 30s
    pub request_timeout: Duration,

    /// Retries per request after the first attempt fails.
    /// Default: 3
    pub max_retries: u32,

    /// Delay between retries.
    /// Default: 1s
    pub retry_delay: Duration,
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            batch_size: 1000,
            parallel_fetch: 10,
            request_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SthResponse {
    tree_size: i64,
    timestamp: u64,
    sha256_root_hash: String,
}

#[derive(Debug, Deserialize)]
struct EntriesResponse {
    entries: Vec<RawEntry>,
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    leaf_input: String,
    extra_data: String,
}

/// Ledger source backed by a Certificate Transparency log's HTTP API.
pub struct HttpLedgerSource {
    config: HttpSourceConfig,
    client: reqwest::blocking::Client,
    base_url: String,
}

impl HttpLedgerSource {
    /// Create a new source. Does not contact the log.
    pub fn new(config: HttpSourceConfig) -> Result<Self> {
        if config.url.trim().is_empty() {
            return Err(Error::Config("ledger URL is required".to_string()));
        }
        if config.batch_size < 1 {
            return Err(Error::Config("batch size must be at least 1".to_string()));
        }
        if config.parallel_fetch == 0 {
            return Err(Error::Config("parallel fetch must be at least 1".to_string()));
        }

        let client = reqwest::blocking::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("ctsieve/", env!("CARGO_PKG_VERSION")))
            .pool_max_idle_per_host(config.parallel_fetch)
            .build()?;

        let base_url = config.url.trim().trim_end_matches('/').to_string();

        Ok(Self {
            config,
            client,
            base_url,
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &HttpSourceConfig {
        &self.config
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str, requests: &AtomicU64) -> Result<T> {
        let mut attempt = 0;
        loop {
            requests.fetch_add(1, Ordering::Relaxed);
            let result = self
                .client
                .get(url)
                .send()
                .and_then(|resp| resp.error_for_status())
                .and_then(|resp| resp.json::<T>());

            match result {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(
                        "Request to {} failed (attempt {}/{}): {}",
                        url,
                        attempt,
                        self.config.max_retries + 1,
                        e
                    );
                    thread::sleep(self.config.retry_delay);
                }
                Err(e) => return Err(Error::Http(e)),
            }
        }
    }

    /// Fetch `[start, end]` (inclusive, as the API expects).
    fn get_entries(
        &self,
        start: i64,
        end: i64,
        requests: &AtomicU64,
        bytes: &AtomicU64,
    ) -> Result<Vec<LedgerEntry>> {
        let url = format!(
            "{}/ct/v1/get-entries?start={}&end={}",
            self.base_url, start, end
        );
        let response: EntriesResponse = self.get_json(&url, requests)?;

        let wanted = (end - start + 1) as usize;
        let mut entries = Vec::with_capacity(response.entries.len().min(wanted));
        for (offset, raw) in response.entries.into_iter().take(wanted).enumerate() {
            let index = start + offset as i64;
            let leaf_input = BASE64.decode(raw.leaf_input.as_bytes()).map_err(|e| {
                Error::Source(format!("entry {index}: invalid leaf_input base64: {e}"))
            })?;
            let extra_data = BASE64.decode(raw.extra_data.as_bytes()).map_err(|e| {
                Error::Source(format!("entry {index}: invalid extra_data base64: {e}"))
            })?;

            bytes.fetch_add((leaf_input.len() + extra_data.len()) as u64, Ordering::Relaxed);
            entries.push(LedgerEntry {
                index,
                kind: EntryKind::from_leaf_input(&leaf_input),
                leaf_input,
                extra_data,
            });
        }

        Ok(entries)
    }

    /// Fetch loop run by each fetch thread.
    ///
    /// Batches are claimed from a shared cursor so every index is fetched by
    /// exactly one thread.
    fn fetch_worker(
        &self,
        range: &Range<i64>,
        cursor: &AtomicI64,
        stop: &AtomicBool,
        sender: Sender<Result<Vec<LedgerEntry>>>,
        counters: &FetchCounters,
    ) {
        let batch_size = self.config.batch_size;

        loop {
            let batch_start = cursor.fetch_add(batch_size, Ordering::SeqCst);
            if batch_start >= range.end || stop.load(Ordering::SeqCst) {
                return;
            }
            let batch_end = (batch_start + batch_size).min(range.end);

            let mut next = batch_start;
            while next < batch_end {
                if stop.load(Ordering::SeqCst) {
                    return;
                }

                let result = self
                    .get_entries(next, batch_end - 1, &counters.requests, &counters.bytes)
                    .and_then(|entries| {
                        if entries.is_empty() {
                            Err(Error::Source(format!(
                                "log returned no entries for [{}, {}]",
                                next,
                                batch_end - 1
                            )))
                        } else {
                            Ok(entries)
                        }
                    });

                let failed = result.is_err();
                if let Ok(entries) = &result {
                    debug!("Fetched {} entries from {}", entries.len(), next);
                    next += entries.len() as i64;
                }

                // Receiver gone means the scan is over
                if sender.send(result).is_err() || failed {
                    return;
                }
            }
        }
    }

    fn deliver<F>(
        &self,
        receiver: Receiver<Result<Vec<LedgerEntry>>>,
        handler: &mut F,
        stop: &AtomicBool,
        stats: &mut ScanStats,
    ) -> Result<()>
    where
        F: FnMut(LedgerEntry) -> Result<bool>,
    {
        for batch in receiver {
            let entries = match batch {
                Ok(entries) => entries,
                Err(e) => {
                    stop.store(true, Ordering::SeqCst);
                    return Err(e);
                }
            };

            for entry in entries {
                stats.entries_delivered += 1;
                match handler(entry) {
                    Ok(true) => {}
                    Ok(false) => {
                        info!("Handler signaled stop");
                        stop.store(true, Ordering::SeqCst);
                        stats.stopped_early = true;
                        return Ok(());
                    }
                    Err(e) => {
                        stop.store(true, Ordering::SeqCst);
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct FetchCounters {
    requests: AtomicU64,
    bytes: AtomicU64,
}

impl LedgerSource for HttpLedgerSource {
    fn name(&self) -> &'static str {
        "ct-http"
    }

    fn prepare(&mut self) -> Result<TreeHead> {
        let url = format!("{}/ct/v1/get-sth", self.base_url);
        let requests = AtomicU64::new(0);
        let sth: SthResponse = self.get_json(&url, &requests)?;

        info!(
            "Got STH from {}: tree_size={}, timestamp={}, root={}",
            self.base_url, sth.tree_size, sth.timestamp, sth.sha256_root_hash
        );

        Ok(TreeHead {
            tree_size: sth.tree_size,
            timestamp_ms: sth.timestamp,
            root_hash: sth.sha256_root_hash,
        })
    }

    fn scan<F>(&mut self, range: Range<i64>, mut handler: F) -> Result<ScanStats>
    where
        F: FnMut(LedgerEntry) -> Result<bool>,
    {
        let mut stats = ScanStats::default();
        if range.is_empty() {
            return Ok(stats);
        }

        let cursor = AtomicI64::new(range.start);
        let stop = AtomicBool::new(false);
        let counters = FetchCounters::default();
        let (sender, receiver) = crossbeam_channel::bounded(self.config.parallel_fetch * 2);

        info!(
            "Scanning [{}, {}) with {} fetch threads, batch size {}",
            range.start, range.end, self.config.parallel_fetch, self.config.batch_size
        );

        let this = &*self;
        let outcome = thread::scope(|scope| {
            for _ in 0..this.config.parallel_fetch {
                let sender = sender.clone();
                let (range, cursor, stop, counters) = (&range, &cursor, &stop, &counters);
                scope.spawn(move || this.fetch_worker(range, cursor, stop, sender, counters));
            }
            drop(sender);

            // The receiver is dropped when delivery returns, releasing any
            // fetch thread blocked on a full channel.
            this.deliver(receiver, &mut handler, &stop, &mut stats)
        });

        stats.requests = counters.requests.load(Ordering::Relaxed);
        stats.bytes_received = counters.bytes.load(Ordering::Relaxed);
        outcome.map(|()| stats)
    }
}
