//! A remote implementation using HTTP to interact with shard nodes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use reqwest::StatusCode;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::Config;
use crate::corpus::Sample;
use crate::error::{Error, Result};
use crate::metrics::MetricsDocument;

const USER_AGENT: &str = concat!("shardbench/", env!("CARGO_PKG_VERSION"));

/// Error bodies are cut off after this many characters.
const MAX_ERROR_BODY: usize = 512;

/// The response to a successful upload.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct UploadReceipt {
    /// Identifier under which the shard stored the object.
    pub id: String,
    /// The file name the shard recorded, if it reports one.
    pub filename: Option<String>,
    /// The shard that handled the upload, if reported.
    pub shard: Option<String>,
}

#[derive(Deserialize)]
struct RawReceipt {
    id: Option<String>,
    filename: Option<String>,
    shard: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

#[derive(Debug)]
struct RemoteBuilderInner {
    remotes: Vec<Url>,
    admin_remotes: Vec<Url>,
    shard_path: String,
    metrics_path: String,
    reqwest_builder: reqwest::ClientBuilder,
}

/// Builder to create a [`ShardRemote`].
#[must_use]
#[derive(Debug)]
pub struct RemoteBuilder(Result<RemoteBuilderInner>);

impl RemoteBuilder {
    /// Creates a new builder that targets a single shard node.
    pub fn new(remote: &str) -> Self {
        let remote = match parse_url(remote) {
            Ok(url) => url,
            Err(err) => return Self(Err(err)),
        };

        let reqwest_builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .user_agent(USER_AGENT);

        Self(Ok(RemoteBuilderInner {
            remotes: vec![remote],
            admin_remotes: vec![],
            shard_path: "/shard".into(),
            metrics_path: "/admin/metrics".into(),
            reqwest_builder,
        }))
    }

    /// Adds another shard node. Requests rotate over all nodes round-robin.
    pub fn remote(mut self, remote: &str) -> Self {
        if let Ok(ref mut inner) = self.0 {
            match parse_url(remote) {
                Ok(url) => inner.remotes.push(url),
                Err(err) => return Self(Err(err)),
            }
        }
        self
    }

    /// Adds an origin serving the metrics endpoint.
    ///
    /// Without any admin remotes, metrics are scraped from every shard node.
    pub fn admin_remote(mut self, remote: &str) -> Self {
        if let Ok(ref mut inner) = self.0 {
            match parse_url(remote) {
                Ok(url) => inner.admin_remotes.push(url),
                Err(err) => return Self(Err(err)),
            }
        }
        self
    }

    /// Sets the route of the shard resource.
    pub fn shard_path(mut self, path: impl Into<String>) -> Self {
        if let Ok(ref mut inner) = self.0 {
            inner.shard_path = path.into();
        }
        self
    }

    /// Sets the route of the metrics document.
    pub fn metrics_path(mut self, path: impl Into<String>) -> Self {
        if let Ok(ref mut inner) = self.0 {
            inner.metrics_path = path.into();
        }
        self
    }

    /// Sets the total timeout of a single request.
    pub fn timeout(self, timeout: Duration) -> Self {
        let Ok(inner) = self.0 else { return self };
        Self(Ok(RemoteBuilderInner {
            reqwest_builder: inner
                .reqwest_builder
                .connect_timeout(timeout)
                .timeout(timeout),
            ..inner
        }))
    }

    /// Returns a [`ShardRemote`] that uses this configuration.
    pub fn build(self) -> Result<ShardRemote> {
        let inner = self.0?;
        let admin_remotes = if inner.admin_remotes.is_empty() {
            inner.remotes.clone()
        } else {
            inner.admin_remotes
        };

        Ok(ShardRemote {
            client: inner.reqwest_builder.build()?,
            remotes: inner.remotes,
            admin_remotes,
            shard_path: inner.shard_path,
            metrics_path: inner.metrics_path,
            cursor: AtomicUsize::new(0),
        })
    }
}

/// A remote implementation using HTTP to interact with one or more shard nodes.
#[derive(Debug)]
pub struct ShardRemote {
    client: reqwest::Client,
    remotes: Vec<Url>,
    admin_remotes: Vec<Url>,
    shard_path: String,
    metrics_path: String,
    cursor: AtomicUsize,
}

impl ShardRemote {
    /// Creates a [`RemoteBuilder`] for the given shard node.
    pub fn builder(remote: &str) -> RemoteBuilder {
        RemoteBuilder::new(remote)
    }

    /// Creates a remote from the run configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let (first, rest) = match config.remotes.split_first() {
            Some(split) => split,
            None => return Err(Error::MissingField("remotes")),
        };

        let mut builder = RemoteBuilder::new(first)
            .shard_path(config.shard_path.as_str())
            .metrics_path(config.metrics_path.as_str())
            .timeout(config.timeout);
        for remote in rest {
            builder = builder.remote(remote);
        }
        for remote in &config.admin_remotes {
            builder = builder.admin_remote(remote);
        }
        builder.build()
    }

    /// The shard nodes, in rotation order.
    pub fn remotes(&self) -> &[Url] {
        &self.remotes
    }

    /// The origins serving metrics.
    pub fn admin_remotes(&self) -> &[Url] {
        &self.admin_remotes
    }

    /// Returns the index of the node that should receive the next request.
    pub fn next_remote(&self) -> usize {
        self.cursor.fetch_add(1, Ordering::Relaxed) % self.remotes.len()
    }

    fn remote(&self, index: usize) -> Result<&Url> {
        self.remotes.get(index).ok_or(Error::UnknownRemote(index))
    }

    /// Uploads a sample as the `file` field of a multipart form.
    pub async fn upload(&self, remote: usize, sample: &Sample) -> Result<UploadReceipt> {
        let url = endpoint(self.remote(remote)?, &self.shard_path)?;

        let part = Part::stream_with_length(sample.data.clone(), sample.len())
            .file_name(sample.name.clone())
            .mime_str("application/octet-stream")?;
        let form = Form::new().part("file", part);

        let response = self.client.post(url.clone()).multipart(form).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, &url, response).await);
        }

        let body = response.bytes().await?;
        let raw: RawReceipt = serde_json::from_slice(&body)?;
        Ok(UploadReceipt {
            id: raw.id.ok_or(Error::MissingField("id"))?,
            filename: raw.filename,
            shard: raw.shard,
        })
    }

    /// Retrieves the object with the given identifier.
    pub async fn fetch(&self, remote: usize, id: &str) -> Result<Bytes> {
        let path = format!("{}/{id}", self.shard_path.trim_end_matches('/'));
        let url = endpoint(self.remote(remote)?, &path)?;

        let response = self.client.get(url.clone()).send().await?;
        match response.status() {
            status if status.is_success() => Ok(response.bytes().await?),
            StatusCode::NOT_FOUND => Err(Error::NotFound { id: id.to_owned() }),
            StatusCode::GONE => {
                let body = response.bytes().await?;
                let message = serde_json::from_slice::<ErrorBody>(&body)
                    .ok()
                    .and_then(|body| body.error)
                    .unwrap_or_else(|| truncate(&String::from_utf8_lossy(&body)));
                Err(Error::Corrupted {
                    id: id.to_owned(),
                    message,
                })
            }
            status => Err(status_error(status, &url, response).await),
        }
    }

    /// Fetches the metrics document from the admin remote at `index`.
    pub async fn metrics(&self, index: usize) -> Result<MetricsDocument> {
        let base = self
            .admin_remotes
            .get(index)
            .ok_or(Error::UnknownRemote(index))?;
        let url = endpoint(base, &self.metrics_path)?;

        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, &url, response).await);
        }

        let body = response.bytes().await?;
        Ok(MetricsDocument::from_slice(&body)?)
    }
}

async fn status_error(status: StatusCode, url: &Url, response: reqwest::Response) -> Error {
    let body = response.text().await.unwrap_or_default();
    Error::Status {
        status,
        url: url.to_string(),
        body: truncate(&body),
    }
}

fn truncate(body: &str) -> String {
    let body = body.trim();
    match body.char_indices().nth(MAX_ERROR_BODY) {
        Some((end, _)) => format!("{}...", &body[..end]),
        None => body.to_owned(),
    }
}

fn parse_url(url: &str) -> Result<Url> {
    Url::parse(url).map_err(|source| Error::InvalidUrl {
        url: url.to_owned(),
        source,
    })
}

/// Appends `path` to the path of `base`, keeping any prefix `base` already has.
fn endpoint(base: &Url, path: &str) -> Result<Url> {
    if base.cannot_be_a_base() {
        return Err(Error::InvalidUrl {
            url: base.to_string(),
            source: url::ParseError::RelativeUrlWithCannotBeABaseBase,
        });
    }

    let mut url = base.clone();
    let joined = format!(
        "{}/{}",
        base.path().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    url.set_path(&joined);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_joins_paths() {
        let base = Url::parse("http://localhost:8080").unwrap();
        assert_eq!(
            endpoint(&base, "/shard").unwrap().as_str(),
            "http://localhost:8080/shard"
        );

        let base = Url::parse("http://localhost:8080/").unwrap();
        assert_eq!(
            endpoint(&base, "/admin/metrics").unwrap().as_str(),
            "http://localhost:8080/admin/metrics"
        );

        let base = Url::parse("http://gateway/ring-a/").unwrap();
        assert_eq!(
            endpoint(&base, "/api/shard/abc123").unwrap().as_str(),
            "http://gateway/ring-a/api/shard/abc123"
        );
    }

    #[test]
    fn endpoint_rejects_opaque_urls() {
        let base = Url::parse("mailto:shard@example.com").unwrap();
        assert!(matches!(
            endpoint(&base, "/shard"),
            Err(Error::InvalidUrl { .. })
        ));
    }

    #[test]
    fn invalid_remote_fails_build() {
        let result = ShardRemote::builder("not a url").build();
        assert!(matches!(result, Err(Error::InvalidUrl { .. })));

        let result = ShardRemote::builder("http://localhost:8080")
            .remote("::")
            .build();
        assert!(matches!(result, Err(Error::InvalidUrl { .. })));
    }

    #[test]
    fn rotates_over_remotes() {
        let remote = ShardRemote::builder("http://10.0.0.1:8080")
            .remote("http://10.0.0.2:8080")
            .remote("http://10.0.0.3:8080")
            .build()
            .unwrap();

        let picks: Vec<_> = (0..7).map(|_| remote.next_remote()).collect();
        assert_eq!(picks, [0, 1, 2, 0, 1, 2, 0]);
        // metrics default to every shard node
        assert_eq!(remote.admin_remotes().len(), 3);
    }

    #[test]
    fn admin_remotes_override_nodes() {
        let config = Config {
            remotes: vec!["http://10.0.0.1:8080".into(), "http://10.0.0.2:8080".into()],
            admin_remotes: vec!["http://10.0.0.1:8081".into()],
            ..Default::default()
        };
        let remote = ShardRemote::from_config(&config).unwrap();

        assert_eq!(remote.remotes().len(), 2);
        assert_eq!(
            remote.admin_remotes()[0].as_str(),
            "http://10.0.0.1:8081/"
        );
    }

    #[tokio::test]
    async fn unknown_remote_index_fails() {
        let remote = ShardRemote::builder("http://10.0.0.1:8080").build().unwrap();
        let sample = Sample::new("icon.png", &b"\x89PNG"[..]);

        let err = remote.upload(1, &sample).await.unwrap_err();
        assert!(matches!(err, Error::UnknownRemote(1)));
        let err = remote.fetch(3, "abc123").await.unwrap_err();
        assert!(matches!(err, Error::UnknownRemote(3)));
        let err = remote.metrics(1).await.unwrap_err();
        assert!(matches!(err, Error::UnknownRemote(1)));
    }

    #[test]
    fn truncates_long_bodies() {
        let body = "x".repeat(MAX_ERROR_BODY + 10);
        let truncated = truncate(&body);
        assert_eq!(truncated.len(), MAX_ERROR_BODY + 3);
        assert!(truncated.ends_with("..."));

        assert_eq!(truncate("  short\n"), "short");
    }
}
