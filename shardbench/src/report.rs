//! Renders a [`RunReport`] for humans or machines.

use std::fmt;
use std::time::Duration;

use bytesize::ByteSize;
use serde::{Deserialize, Serialize};
use sketches_ddsketch::DDSketch;
use yansi::Paint;

use crate::bench::{IdMap, PhaseMetrics, RunReport, ScrapeOutcome, ServerMetrics};
use crate::metrics::TimerSnapshot;

/// Latency quantiles of one phase, in seconds.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct LatencySummary {
    /// Mean latency.
    pub avg: f64,
    /// Median latency.
    pub p50: f64,
    /// 90th percentile latency.
    pub p90: f64,
    /// 99th percentile latency.
    pub p99: f64,
    /// Slowest request.
    pub max: f64,
}

/// Serializable digest of [`PhaseMetrics`].
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct PhaseSummary {
    /// Successful requests.
    pub successes: u64,
    /// Failed requests.
    pub failures: u64,
    /// Successful downloads that did not pass verification.
    pub mismatches: u64,
    /// Downloads refused by the shard as corrupted.
    pub corrupted: u64,
    /// Payload bytes of successful requests.
    pub bytes: u64,
    /// Wall time of the phase in seconds.
    pub elapsed: f64,
    /// Successful requests per second of wall time.
    pub ops_per_sec: f64,
    /// Latency quantiles, absent if nothing succeeded.
    pub latency: Option<LatencySummary>,
}

impl PhaseSummary {
    /// Summarizes the measurements of a phase.
    pub fn new(metrics: &PhaseMetrics) -> Self {
        let latency = &metrics.latency;
        let latency = (latency.count() > 0).then(|| LatencySummary {
            avg: average(latency),
            p50: quantile(latency, 0.5),
            p90: quantile(latency, 0.9),
            p99: quantile(latency, 0.99),
            max: latency.max().unwrap_or_default(),
        });

        Self {
            successes: metrics.successes,
            failures: metrics.failures,
            mismatches: metrics.mismatches,
            corrupted: metrics.corrupted,
            bytes: metrics.bytes,
            elapsed: metrics.elapsed.as_secs_f64(),
            ops_per_sec: per_second(metrics.successes as f64, metrics.elapsed),
            latency,
        }
    }
}

/// The JSON form of a [`RunReport`].
#[derive(Debug, Serialize)]
pub struct ReportSummary<'a> {
    /// Number of samples in the corpus.
    pub samples: usize,
    /// Whether the run was interrupted.
    pub cancelled: bool,
    /// The upload phase.
    pub upload: PhaseSummary,
    /// The download phase, if it ran.
    pub download: Option<PhaseSummary>,
    /// Identifiers keyed by file name.
    pub ids: &'a IdMap,
    /// Timers reported by the service.
    pub servers: &'a [ServerMetrics],
}

impl<'a> ReportSummary<'a> {
    /// Summarizes a full run.
    pub fn new(report: &'a RunReport) -> Self {
        Self {
            samples: report.samples,
            cancelled: report.cancelled,
            upload: PhaseSummary::new(&report.upload),
            download: report.download.as_ref().map(PhaseSummary::new),
            ids: &report.ids,
            servers: &report.servers,
        }
    }
}

/// Writes the report as a single JSON document to stdout.
pub fn print_json(report: &RunReport) -> anyhow::Result<()> {
    let summary = ReportSummary::new(report);
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

/// Writes the report as colored text to stdout.
pub fn print_text(report: &RunReport) {
    if report.cancelled {
        println!("{}", "run was cancelled, results are partial".bold().yellow());
    }

    println!();
    println!(
        "{} ({} samples)",
        "## UPLOAD".bold(),
        report.samples.bold()
    );
    print_phase(&report.upload);

    if let Some(download) = &report.download {
        println!();
        println!("{}", "## DOWNLOAD".bold());
        print_phase(download);
    }

    if !report.ids.is_empty() {
        println!();
        println!("{} ({})", "## IDENTIFIERS".bold(), report.ids.len().blue());
        for (filename, object) in &report.ids {
            print!("  {}: {}", filename.bold(), object.id);
            if let Some(shard) = &object.shard {
                print!(" (shard {shard})");
            }
            println!();
        }
    }

    print_servers(&report.servers);
}

/// Writes the server-side timers to stdout.
pub fn print_servers(servers: &[ServerMetrics]) {
    for server in servers {
        println!();
        println!("{} {}", "## SERVER".bold(), server.remote.as_str().blue());

        let timers = match &server.outcome {
            ScrapeOutcome::Timers(timers) => timers,
            ScrapeOutcome::Failed(error) => {
                println!("  {}", format!("metrics unavailable: {error}").red());
                continue;
            }
        };

        for (name, timer) in timers {
            match timer {
                Some(timer) => print_timer(name, timer),
                None => println!("{}: {}", format!("{name:?}").bold(), "missing".red()),
            }
        }
    }
}

fn print_phase(metrics: &PhaseMetrics) {
    print!("{} ({} ops", "REQUESTS:".bold().green(), metrics.successes.bold());
    if metrics.failures > 0 {
        print!(
            ", {}",
            format!("{} FAILURES", metrics.failures).bold().red()
        );
    }
    if metrics.corrupted > 0 {
        print!(
            ", {}",
            format!("{} CORRUPTED", metrics.corrupted).bold().red()
        );
    }
    if metrics.mismatches > 0 {
        print!(
            ", {}",
            format!("{} MISMATCHES", metrics.mismatches).bold().red()
        );
    }
    println!(")");

    if metrics.latency.count() == 0 {
        return;
    }

    let sizes = &metrics.sizes;
    let avg = ByteSize::b(average(sizes) as u64);
    let p50 = ByteSize::b(quantile(sizes, 0.5) as u64);
    let p99 = ByteSize::b(quantile(sizes, 0.99) as u64);
    println!("  size avg: {}; p50: {p50:.2}; p99: {p99:.2}", avg.bold());

    print_ops(&metrics.latency, metrics.elapsed);
    print_throughput(metrics.bytes, metrics.elapsed);
    print_percentiles(&metrics.latency, Duration::from_secs_f64);
}

fn print_timer(name: &str, timer: &TimerSnapshot) {
    print!("{}:", format!("{name:?}").bold());
    if let Some(count) = timer.count {
        print!(" {} calls", count.bold());
    }
    println!();

    let units = timer.duration_units();
    let values: Vec<_> = [("mean", timer.mean), ("max", timer.max)]
        .into_iter()
        .filter_map(|(label, value)| Some((label, value?)))
        .chain(timer.percentiles())
        .map(|(label, value)| format!("{label}: {}", DisplayDuration(value, units)))
        .collect();

    if values.is_empty() {
        println!("  no durations reported");
    } else {
        println!("  {}", values.join("; "));
    }
}

fn print_percentiles<T: fmt::Debug>(sketch: &DDSketch, map: impl Fn(f64) -> T) {
    let avg = map(average(sketch));
    let p50 = map(quantile(sketch, 0.5));
    let p90 = map(quantile(sketch, 0.9));
    let p99 = map(quantile(sketch, 0.99));
    println!(
        "  avg: {:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}",
        avg.bold()
    );
}

fn print_ops(sketch: &DDSketch, duration: Duration) {
    let ops_ps = per_second(sketch.count() as f64, duration);
    print!("  {:.2} operations/s", ops_ps.bold());
}

fn print_throughput(total: u64, duration: Duration) {
    let throughput = per_second(total as f64, duration) as u64;
    println!(", {:.2}/s", ByteSize::b(throughput).bold());
}

fn average(sketch: &DDSketch) -> f64 {
    match sketch.count() {
        0 => 0.0,
        count => sketch.sum().unwrap_or_default() / count as f64,
    }
}

fn quantile(sketch: &DDSketch, q: f64) -> f64 {
    sketch.quantile(q).ok().flatten().unwrap_or_default()
}

fn per_second(value: f64, duration: Duration) -> f64 {
    let secs = duration.as_secs_f64();
    if secs > 0.0 { value / secs } else { 0.0 }
}

/// Converts a timer value in the reported unit into a [`Duration`].
fn to_duration(value: f64, units: &str) -> Option<Duration> {
    let secs = match units {
        "seconds" => value,
        "milliseconds" => value / 1e3,
        "microseconds" => value / 1e6,
        "nanoseconds" => value / 1e9,
        _ => return None,
    };
    Duration::try_from_secs_f64(secs).ok()
}

struct DisplayDuration<'a>(f64, &'a str);

impl fmt::Display for DisplayDuration<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match to_duration(self.0, self.1) {
            Some(duration) => write!(f, "{duration:.2?}"),
            None => write!(f, "{:.2} {}", self.0, self.1),
        }
    }
}
