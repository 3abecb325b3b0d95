//! The set of payloads uploaded during a run.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};
use rand_distr::{Distribution, LogNormal};

use crate::config::Config;

/// Upper bound for the size of a single synthetic payload.
///
/// The log-normal tail is unbounded, so sizes above this are clamped.
pub const MAX_SAMPLE_SIZE: u64 = 256 * 1024 * 1024;

/// A single payload and the name it is uploaded under.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    /// The file name sent in the multipart form.
    pub name: String,
    /// Contents of the payload.
    pub data: Bytes,
}

impl Sample {
    /// Creates a sample from a name and contents.
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }

    /// The size of the payload in bytes.
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    /// Returns `true` if the payload has no contents.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// An ordered, non-empty list of [`Sample`]s held in memory for the duration of a run.
#[derive(Clone, Debug)]
pub struct Corpus {
    samples: Vec<Sample>,
}

impl Corpus {
    /// Creates a corpus from the given samples.
    pub fn new(samples: Vec<Sample>) -> Result<Self> {
        if samples.is_empty() {
            bail!("the corpus does not contain any payloads");
        }
        Ok(Self { samples })
    }

    /// Builds the corpus configured for this run, preferring files over synthetic payloads.
    pub async fn load(config: &Config) -> Result<Self> {
        if !config.files.is_empty() {
            return Self::from_files(&config.files).await;
        }

        match &config.synthetic {
            Some(synthetic) => Self::synthetic(
                synthetic.count,
                synthetic.p50.as_u64(),
                synthetic.p99.as_u64(),
                synthetic.seed.unwrap_or_else(rand::random),
            ),
            None => bail!("either `files` or `synthetic` must be configured"),
        }
    }

    /// Reads every file fully into memory.
    pub async fn from_files(paths: &[PathBuf]) -> Result<Self> {
        let mut samples = Vec::with_capacity(paths.len());
        for path in paths {
            let data = tokio::fs::read(path)
                .await
                .with_context(|| format!("failed to read `{}`", path.display()))?;
            tracing::debug!(path = %path.display(), size = data.len(), "loaded payload");
            samples.push(Sample::new(file_name(path), data));
        }
        Self::new(samples)
    }

    /// Generates `count` payloads with log-normally distributed sizes.
    pub fn synthetic(count: usize, p50: u64, p99: u64, seed: u64) -> Result<Self> {
        let sizes = size_distribution(p50, p99)?;
        let mut rng = SmallRng::seed_from_u64(seed);

        let samples = (0..count)
            .map(|index| {
                let len = clamp_size(sizes.sample(&mut rng));
                let mut data = vec![0; len];
                rng.fill_bytes(&mut data);
                Sample::new(format!("synthetic-{seed:016x}-{index}.bin"), data)
            })
            .collect();

        Self::new(samples)
    }

    /// Returns the sample at `index`.
    pub fn get(&self, index: usize) -> Option<&Sample> {
        self.samples.get(index)
    }

    /// Iterates over all samples in order.
    pub fn iter(&self) -> impl Iterator<Item = &Sample> {
        self.samples.iter()
    }

    /// The number of samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Always `false`, a corpus cannot be constructed empty.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Total size of all samples in bytes.
    pub fn total_size(&self) -> u64 {
        self.samples.iter().map(Sample::len).sum()
    }
}

// Inspired by <https://stats.stackexchange.com/a/649432>
fn size_distribution(p50: u64, p99: u64) -> Result<LogNormal<f64>> {
    let p50 = p50 as f64;
    let p99 = p99 as f64;
    let mu = p50.ln();
    let sigma = (p99.ln() - mu) / 2.3263;

    LogNormal::new(mu, sigma).context("invalid size distribution")
}

fn clamp_size(size: f64) -> usize {
    size.min(MAX_SAMPLE_SIZE as f64) as usize
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn lognormal_percentiles_work() {
        let corpus = Corpus::synthetic(1000, 100, 1000, 7).unwrap();

        let mut sizes: Vec<_> = corpus.iter().map(Sample::len).collect();
        sizes.sort_unstable();

        // generous bounds, the distribution is sampled only a thousand times
        let p50 = sizes[500];
        assert!((60..=160).contains(&p50), "p50 = {p50}");
        let p99 = sizes[990];
        assert!((400..=2500).contains(&p99), "p99 = {p99}");
    }

    #[test]
    fn synthetic_is_deterministic() {
        let a = Corpus::synthetic(5, 1024, 4096, 1).unwrap();
        let b = Corpus::synthetic(5, 1024, 4096, 1).unwrap();
        let c = Corpus::synthetic(5, 1024, 4096, 2).unwrap();

        assert!(a.iter().eq(b.iter()));
        assert!(!a.iter().eq(c.iter()));
        assert_eq!(a.get(0).unwrap().name, "synthetic-0000000000000001-0.bin");
    }

    #[test]
    fn sizes_are_clamped() {
        assert_eq!(clamp_size(1e15), MAX_SAMPLE_SIZE as usize);
        assert_eq!(clamp_size(f64::INFINITY), MAX_SAMPLE_SIZE as usize);
        assert_eq!(clamp_size(1234.7), 1234);
    }

    #[test]
    fn synthetic_requires_payloads() {
        assert!(Corpus::synthetic(0, 1024, 4096, 1).is_err());
    }

    #[tokio::test]
    async fn reads_files_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("configuration.yml");
        let second = dir.path().join("requirements.txt");
        std::fs::File::create(&first)
            .unwrap()
            .write_all(b"server: {}\n")
            .unwrap();
        std::fs::File::create(&second)
            .unwrap()
            .write_all(b"requests\n")
            .unwrap();

        let corpus = Corpus::from_files(&[first, second]).await.unwrap();

        assert_eq!(corpus.len(), 2);
        assert_eq!(
            corpus.get(0).unwrap(),
            &Sample::new("configuration.yml", &b"server: {}\n"[..])
        );
        assert_eq!(corpus.get(1).unwrap().name, "requirements.txt");
        assert_eq!(corpus.total_size(), 20);
    }

    #[tokio::test]
    async fn missing_file_names_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("photo.jpg");

        let err = Corpus::from_files(&[missing]).await.unwrap_err();
        assert!(err.to_string().contains("photo.jpg"));
    }
}
