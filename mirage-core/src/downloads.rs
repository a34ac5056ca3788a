//! Path-or-url resolution backed by an on-disk download cache.
//!
//! A [`DownloadCache`] is constructed once at startup and passed to whatever
//! needs remote weights or assets materialized locally. Resolution is
//! synchronous and blocks the caller for the duration of any network I/O.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::DownloadError;

// Slash-terminated so lookalike hosts (huggingface.co.evil.example) never
// match; the bearer token must only ever travel to the real hub.
pub const HUGGINGFACE_DOMAIN: &str = "https://huggingface.co/";

const GET_TIMEOUT: Duration = Duration::from_secs(60);
const HEAD_TIMEOUT: Duration = Duration::from_secs(5);

/// Blocking HTTP access used by the cache. Trait-shaped so tests can count
/// requests without a network.
#[cfg_attr(test, mockall::automock)]
pub trait RemoteFetcher: Send + Sync {
    /// GET the full response body. Non-2xx statuses are errors.
    fn get(&self, url: &str) -> Result<Vec<u8>, DownloadError>;

    /// HEAD with redirects followed, returning the final status code.
    fn head_status<'a>(&self, url: &str, bearer: Option<&'a str>) -> Result<u16, DownloadError>;
}

/// [`RemoteFetcher`] over `reqwest`'s blocking client.
pub struct HttpFetcher {
    get_client: reqwest::blocking::Client,
    head_client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, DownloadError> {
        let get_client = reqwest::blocking::Client::builder()
            .timeout(GET_TIMEOUT)
            .build()
            .map_err(|e| DownloadError::Client(e.to_string()))?;
        let head_client = reqwest::blocking::Client::builder()
            .timeout(HEAD_TIMEOUT)
            .build()
            .map_err(|e| DownloadError::Client(e.to_string()))?;
        Ok(Self {
            get_client,
            head_client,
        })
    }
}

impl RemoteFetcher for HttpFetcher {
    fn get(&self, url: &str) -> Result<Vec<u8>, DownloadError> {
        let map_err = |e: reqwest::Error| DownloadError::Fetch {
            url: url.to_string(),
            reason: e.to_string(),
        };
        let response = self
            .get_client
            .get(url)
            .send()
            .and_then(reqwest::blocking::Response::error_for_status)
            .map_err(map_err)?;
        Ok(response.bytes().map_err(map_err)?.to_vec())
    }

    fn head_status<'a>(&self, url: &str, bearer: Option<&'a str>) -> Result<u16, DownloadError> {
        let mut request = self.head_client.head(url);
        if let Some(token) = bearer {
            request = request.header(reqwest::header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let response = request.send().map_err(|e| DownloadError::Fetch {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        Ok(response.status().as_u16())
    }
}

/// Why delegation to the hub's own cache did not produce a path.
#[derive(Debug)]
enum HubDelegateError {
    /// The url does not follow the hub's `/resolve/` layout; valid urls can
    /// still land here (e.g. raw blob links), so the caller falls back to the
    /// generic download path.
    NotHubLayout,
    Hub(hf_hub::api::sync::ApiError),
}

/// Splits a hub url into `(repo, revision, filename)` when it follows the
/// `{owner}/{repo}/resolve/{revision}/{filename}` layout.
fn parse_hub_url(url: &str) -> Option<(String, String, String)> {
    let rest = url.strip_prefix(HUGGINGFACE_DOMAIN)?.trim_start_matches('/');
    let rest = rest.split(['?', '#']).next().unwrap_or(rest);
    let parts: Vec<&str> = rest.splitn(5, '/').collect();
    match parts.as_slice() {
        [owner, repo, "resolve", revision, filename]
            if !owner.is_empty() && !repo.is_empty() && !filename.is_empty() =>
        {
            Some((
                format!("{owner}/{repo}"),
                (*revision).to_string(),
                (*filename).to_string(),
            ))
        }
        _ => None,
    }
}

fn hub_cached_path(url: &str) -> Result<PathBuf, HubDelegateError> {
    let (repo, revision, filename) = parse_hub_url(url).ok_or(HubDelegateError::NotHubLayout)?;
    let api = hf_hub::api::sync::Api::new().map_err(HubDelegateError::Hub)?;
    let repo = api.repo(hf_hub::Repo::with_revision(
        repo,
        hf_hub::RepoType::Model,
        revision,
    ));
    repo.get(&filename).map_err(HubDelegateError::Hub)
}

/// Characters illegal in filenames on common host filesystems.
fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '*' | '<' | '>' | ':' | '"' | '|' | '?' => '_',
            c => c,
        })
        .collect()
}

/// Resolves path-or-url references to local files, downloading into a
/// process-wide cache directory keyed by sanitized filename.
pub struct DownloadCache {
    root: PathBuf,
    token: Option<String>,
    fetcher: Box<dyn RemoteFetcher>,
    // Serializes writers per destination so concurrent resolves of the same
    // uncached url perform a single download.
    write_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl DownloadCache {
    pub fn new(
        root: impl Into<PathBuf>,
        token: Option<String>,
        fetcher: Box<dyn RemoteFetcher>,
    ) -> Self {
        Self {
            root: root.into(),
            token,
            fetcher,
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    /// A cache rooted in the platform cache directory, with the hub access
    /// token (if any) read from the hub's credential store.
    pub fn with_hub_defaults() -> Result<Self, DownloadError> {
        let root = directories::ProjectDirs::from("", "", "mirage").map_or_else(
            || std::env::temp_dir().join("mirage").join("cache"),
            |dirs| dirs.cache_dir().to_path_buf(),
        );
        let token = hf_hub::Cache::default().token();
        Ok(Self::new(root, token, Box::new(HttpFetcher::new()?)))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a reference to a local file. Urls go through the cache;
    /// anything else is returned as an absolute path with no existence check.
    pub fn resolve(
        &self,
        reference: &str,
        category: Option<&str>,
    ) -> Result<PathBuf, DownloadError> {
        if reference.starts_with("https://") || reference.starts_with("http://") {
            return self.cached_url_path(reference, category);
        }
        Ok(std::path::absolute(reference)?)
    }

    fn cached_url_path(&self, url: &str, category: Option<&str>) -> Result<PathBuf, DownloadError> {
        if url.starts_with(HUGGINGFACE_DOMAIN) {
            match hub_cached_path(url) {
                Ok(path) => return Ok(path),
                Err(HubDelegateError::NotHubLayout) => {
                    debug!(url, "url not in hub layout, using generic cache");
                }
                Err(HubDelegateError::Hub(e)) => {
                    warn!(url, error = %e, "hub delegation failed, using generic cache");
                }
            }
        }

        let filename = url.rsplit('/').next().unwrap_or(url);
        let mut dir = self.root.clone();
        if let Some(category) = category {
            dir = dir.join(category);
        }
        fs::create_dir_all(&dir)?;

        let dest_path = dir.join(sanitize_filename(filename));
        if dest_path.exists() {
            debug!(url, path = %dest_path.display(), "cache hit");
            return Ok(dest_path);
        }

        // Older releases wrote the filename unsanitized; migrate in place.
        let legacy_path = dir.join(filename);
        if legacy_path != dest_path && legacy_path.exists() {
            info!(from = %legacy_path.display(), to = %dest_path.display(), "migrating legacy cache entry");
            fs::rename(&legacy_path, &dest_path)?;
            return Ok(dest_path);
        }

        self.download_to(url, &dest_path)
    }

    fn download_to(&self, url: &str, dest_path: &Path) -> Result<PathBuf, DownloadError> {
        let lock = self.key_lock(dest_path);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        // A concurrent resolve may have landed the file while we waited.
        if dest_path.exists() {
            return Ok(dest_path.to_path_buf());
        }

        debug!(url, path = %dest_path.display(), "downloading");
        let body = self.fetcher.get(url)?;

        // Write to a sibling temp file and rename so a crash mid-write never
        // leaves a truncated cache entry at the final path.
        let dir = dest_path.parent().unwrap_or(&self.root);
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&body)?;
        tmp.persist(dest_path).map_err(|e| e.error)?;

        info!(url, path = %dest_path.display(), bytes = body.len(), "download complete");
        Ok(dest_path.to_path_buf())
    }

    fn key_lock(&self, dest_path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self
            .write_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        locks.entry(dest_path.to_path_buf()).or_default().clone()
    }

    /// Checks whether a gated-host url is accessible with the configured
    /// credentials. No-op for other hosts.
    pub fn check_gated_access(&self, url: &str) -> Result<(), DownloadError> {
        if !url.starts_with(HUGGINGFACE_DOMAIN) {
            return Ok(());
        }
        let status = self.fetcher.head_status(url, self.token.as_deref())?;
        if status == 401 {
            return Err(DownloadError::Unauthorized {
                url: url.to_string(),
            });
        }
        debug!(url, status, "gated access check passed");
        Ok(())
    }
}

impl std::fmt::Debug for DownloadCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadCache")
            .field("root", &self.root)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}
