//! Upload and download phases against a shard service, followed by a metrics scrape.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::Result;
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sketches_ddsketch::DDSketch;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, Verify};
use crate::corpus::Corpus;
use crate::error::Error;
use crate::http::ShardRemote;
use crate::metrics::TimerSnapshot;

/// Parameters of a run that are independent of the remote and the corpus.
#[derive(Clone, Debug)]
pub struct RunOptions {
    /// Number of passes over the corpus and over the stored ids.
    pub trials: usize,
    /// Maximum number of requests in flight.
    pub concurrency: usize,
    /// How downloaded objects are checked.
    pub verify: Verify,
    /// Whether to read back the uploaded objects.
    pub download: bool,
    /// Server-side timers to look up after the run.
    pub timers: Vec<String>,
    /// Stops scheduling new requests once cancelled.
    pub cancel: CancellationToken,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            trials: 1,
            concurrency: 1,
            verify: Verify::default(),
            download: true,
            timers: Config::default().timers,
            cancel: CancellationToken::new(),
        }
    }
}

impl RunOptions {
    /// Takes the run parameters from the configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            trials: config.trials,
            concurrency: config.concurrency,
            verify: config.verify,
            download: true,
            timers: config.timers.clone(),
            cancel: CancellationToken::new(),
        }
    }
}

/// An uploaded object, as remembered for the download phase.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StoredObject {
    /// The identifier assigned by the shard.
    pub id: String,
    /// Index of the uploaded sample in the corpus.
    pub sample: usize,
    /// Index of the node that accepted the upload.
    pub remote: usize,
    /// The shard that reported handling the upload.
    pub shard: Option<String>,
}

/// Identifiers keyed by file name.
///
/// Uploads of the same file name overwrite each other. The id of the upload issued last wins,
/// regardless of the order in which concurrent uploads complete.
pub type IdMap = BTreeMap<String, StoredObject>;

/// Client-side measurements of a single phase.
#[derive(Default)]
pub struct PhaseMetrics {
    /// Request latency of successful requests, in seconds.
    pub latency: DDSketch,
    /// Payload sizes of successful requests, in bytes.
    pub sizes: DDSketch,
    /// Total payload bytes transferred by successful requests.
    pub bytes: u64,
    /// Requests that completed with a success status.
    pub successes: u64,
    /// Requests that failed, including those the shard reported as corrupted.
    pub failures: u64,
    /// Successful downloads whose body did not pass verification.
    pub mismatches: u64,
    /// Downloads the shard refused because its stored checksum no longer matched.
    pub corrupted: u64,
    /// Wall time of the phase.
    pub elapsed: Duration,
}

impl PhaseMetrics {
    /// Number of requests that were issued.
    pub fn attempted(&self) -> u64 {
        self.successes + self.failures
    }

    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Success {
                latency,
                bytes,
                verified,
            } => {
                self.successes += 1;
                self.bytes += bytes;
                self.latency.add(latency.as_secs_f64());
                self.sizes.add(bytes as f64);
                if !verified {
                    self.mismatches += 1;
                }
            }
            Outcome::Failure { corrupted } => {
                self.failures += 1;
                if corrupted {
                    self.corrupted += 1;
                }
            }
        }
    }
}

impl fmt::Debug for PhaseMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhaseMetrics")
            .field("successes", &self.successes)
            .field("failures", &self.failures)
            .field("mismatches", &self.mismatches)
            .field("corrupted", &self.corrupted)
            .field("bytes", &self.bytes)
            .field("elapsed", &self.elapsed)
            .finish_non_exhaustive()
    }
}

/// Server-side timers scraped from one admin remote.
#[derive(Clone, Debug, Serialize)]
pub struct ServerMetrics {
    /// The origin the metrics were read from.
    pub remote: String,
    /// The requested timers, or why they could not be read.
    pub outcome: ScrapeOutcome,
}

/// Result of scraping one metrics endpoint.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrapeOutcome {
    /// Every requested timer, `None` where the document does not contain it.
    Timers(BTreeMap<String, Option<TimerSnapshot>>),
    /// The endpoint could not be read.
    Failed(String),
}

/// Everything measured during a run.
#[derive(Debug, Default)]
pub struct RunReport {
    /// Number of samples in the corpus.
    pub samples: usize,
    /// The upload phase.
    pub upload: PhaseMetrics,
    /// The download phase, if it ran.
    pub download: Option<PhaseMetrics>,
    /// Identifiers returned by the shard.
    pub ids: IdMap,
    /// Timers reported by the service itself.
    pub servers: Vec<ServerMetrics>,
    /// Whether the run was interrupted before all requests were issued.
    pub cancelled: bool,
}

impl RunReport {
    /// Returns `true` if some phase issued requests and none of them succeeded.
    pub fn all_failed(&self) -> bool {
        let failed = |phase: &PhaseMetrics| phase.attempted() > 0 && phase.successes == 0;
        failed(&self.upload) || self.download.as_ref().is_some_and(failed)
    }
}

enum Outcome {
    Success {
        latency: Duration,
        bytes: u64,
        verified: bool,
    },
    Failure {
        corrupted: bool,
    },
}

/// Uploads the corpus `trials` times, reads every stored object back `trials` times and finally
/// scrapes the server-side timers.
///
/// Failed requests are logged and counted, they never abort the run.
pub async fn run(remote: ShardRemote, corpus: Corpus, options: RunOptions) -> Result<RunReport> {
    let mut report = RunReport {
        samples: corpus.len(),
        ..Default::default()
    };

    tracing::info!(
        trials = options.trials,
        samples = corpus.len(),
        concurrency = options.concurrency,
        "running upload phase"
    );
    let (upload, ids) = upload_phase(&remote, &corpus, &options).await?;
    report.upload = upload;
    report.ids = ids;

    if options.download && !options.cancel.is_cancelled() {
        if report.ids.is_empty() {
            tracing::warn!("no object was stored, skipping download phase");
        } else {
            tracing::info!(
                trials = options.trials,
                objects = report.ids.len(),
                verify = %options.verify,
                "running download phase"
            );
            let download = download_phase(&remote, &corpus, &report.ids, &options).await?;
            report.download = Some(download);
        }
    }

    report.cancelled = options.cancel.is_cancelled();
    report.servers = scrape(&remote, &options.timers).await;

    Ok(report)
}

/// Like [`run`], but without reading objects back.
pub async fn upload_only(
    remote: ShardRemote,
    corpus: Corpus,
    options: RunOptions,
) -> Result<RunReport> {
    let options = RunOptions {
        download: false,
        ..options
    };
    run(remote, corpus, options).await
}

/// Reads the given timers from every admin remote.
pub async fn scrape(remote: &ShardRemote, timers: &[String]) -> Vec<ServerMetrics> {
    let mut servers = Vec::with_capacity(remote.admin_remotes().len());

    for (index, url) in remote.admin_remotes().iter().enumerate() {
        let outcome = match remote.metrics(index).await {
            Ok(document) => ScrapeOutcome::Timers(
                timers
                    .iter()
                    .map(|name| {
                        let timer = document.timer(name).cloned();
                        if timer.is_none() {
                            tracing::warn!(remote = %url, timer = %name, "timer not reported");
                        }
                        (name.clone(), timer)
                    })
                    .collect(),
            ),
            Err(err) => {
                tracing::error!(
                    remote = %url,
                    error = &err as &dyn std::error::Error,
                    "failed to scrape metrics"
                );
                ScrapeOutcome::Failed(err.to_string())
            }
        };

        servers.push(ServerMetrics {
            remote: url.to_string(),
            outcome,
        });
    }

    servers
}

async fn upload_phase(
    remote: &ShardRemote,
    corpus: &Corpus,
    options: &RunOptions,
) -> Result<(PhaseMetrics, IdMap)> {
    let ids = Mutex::new(BTreeMap::<String, (usize, StoredObject)>::new());

    let jobs: Vec<(usize, usize)> = (0..options.trials)
        .flat_map(|_| 0..corpus.len())
        .enumerate()
        .collect();

    let stored = &ids;
    let metrics = run_phase("Uploading", jobs, options, move |(sequence, index)| {
        async move {
            let Some(sample) = corpus.get(index) else {
                return Outcome::Failure { corrupted: false };
            };
            let node = remote.next_remote();

            let start = Instant::now();
            match remote.upload(node, sample).await {
                Ok(receipt) => {
                    let latency = start.elapsed();
                    tracing::debug!(sample = %sample.name, id = %receipt.id, "uploaded");

                    let key = receipt.filename.unwrap_or_else(|| sample.name.clone());
                    let object = StoredObject {
                        id: receipt.id,
                        sample: index,
                        remote: node,
                        shard: receipt.shard,
                    };
                    remember(&mut stored.lock().unwrap(), key, sequence, object);

                    Outcome::Success {
                        latency,
                        bytes: sample.len(),
                        verified: true,
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        sample = %sample.name,
                        error = &err as &dyn std::error::Error,
                        "upload failed"
                    );
                    Outcome::Failure { corrupted: false }
                }
            }
        }
    })
    .await?;

    let ids = ids
        .into_inner()
        .unwrap()
        .into_iter()
        .map(|(key, (_, object))| (key, object))
        .collect();

    Ok((metrics, ids))
}

/// Stores `object` under `key` unless an upload issued later already claimed it.
fn remember(
    ids: &mut BTreeMap<String, (usize, StoredObject)>,
    key: String,
    sequence: usize,
    object: StoredObject,
) {
    match ids.get(&key) {
        Some((existing, _)) if *existing > sequence => {}
        _ => {
            ids.insert(key, (sequence, object));
        }
    }
}

async fn download_phase(
    remote: &ShardRemote,
    corpus: &Corpus,
    ids: &IdMap,
    options: &RunOptions,
) -> Result<PhaseMetrics> {
    let objects: Vec<&StoredObject> = ids.values().collect();
    let jobs: Vec<&StoredObject> = (0..options.trials)
        .flat_map(|_| objects.iter().copied())
        .collect();
    let verify = options.verify;

    run_phase("Downloading", jobs, options, |object| async move {
        let node = remote.next_remote();

        let start = Instant::now();
        match remote.fetch(node, &object.id).await {
            Ok(body) => {
                let latency = start.elapsed();
                let verified = match corpus.get(object.sample) {
                    Some(sample) => verify_body(verify, &object.id, &sample.data, &body),
                    None => true,
                };
                if !verified {
                    tracing::warn!(id = %object.id, "contents do not match expectation");
                }

                Outcome::Success {
                    latency,
                    bytes: body.len() as u64,
                    verified,
                }
            }
            Err(err) => {
                tracing::warn!(
                    id = %object.id,
                    error = &err as &dyn std::error::Error,
                    "download failed"
                );
                Outcome::Failure {
                    corrupted: matches!(err, Error::Corrupted { .. }),
                }
            }
        }
    })
    .await
}

/// Runs `task` for every job with bounded concurrency, until all jobs ran or the run is
/// cancelled. Requests already in flight when cancelling are awaited.
async fn run_phase<J, F, Fut>(
    label: &'static str,
    jobs: Vec<J>,
    options: &RunOptions,
    task: F,
) -> Result<PhaseMetrics>
where
    F: Fn(J) -> Fut,
    Fut: Future<Output = Outcome>,
{
    let bar = ProgressBar::new(jobs.len() as u64)
        .with_message(label)
        .with_style(ProgressStyle::with_template(
            "{msg} {wide_bar} {pos}/{len} {elapsed}",
        )?);
    bar.enable_steady_tick(Duration::from_millis(100));

    let metrics = Mutex::new(PhaseMetrics::default());
    let start = Instant::now();

    let recorded = &metrics;
    let progress = &bar;
    futures::stream::iter(jobs)
        .take_until(options.cancel.cancelled())
        .for_each_concurrent(options.concurrency, move |job| {
            let future = task(job);
            async move {
                let outcome = future.await;
                recorded.lock().unwrap().record(outcome);
                progress.inc(1);
            }
        })
        .await;

    bar.finish_and_clear();

    let mut metrics = metrics.into_inner().unwrap();
    metrics.elapsed = start.elapsed();
    if options.cancel.is_cancelled() {
        tracing::warn!(
            phase = label,
            completed = metrics.attempted(),
            "cancelled, remaining requests were not issued"
        );
    }

    Ok(metrics)
}

fn verify_body(verify: Verify, id: &str, expected: &[u8], body: &[u8]) -> bool {
    match verify {
        Verify::None => true,
        Verify::Content => body == expected,
        Verify::Sha256 => {
            body == expected && hex::encode(Sha256::digest(body)).eq_ignore_ascii_case(id)
        }
    }
}
