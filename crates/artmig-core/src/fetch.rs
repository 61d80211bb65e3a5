//! Source resource fetching.
//!
//! A resource is addressed either relative to the configured files base
//! (local directory or HTTP origin) or by an absolute URL. Transport
//! failures are per-item recoverable: the caller skips that one
//! image/file and the run continues.

use std::path::PathBuf;

use reqwest::blocking::Client;
use tracing::debug;

use crate::config::{FilesBase, NetworkConfig, KNOWN_URI_PREFIXES};
use crate::error::{MigrateError, Result};

/// Fetches raw bytes from the configured files base.
pub struct ResourceFetcher {
    base: FilesBase,
    client: Client,
}

impl ResourceFetcher {
    pub fn new(base: FilesBase) -> Result<Self> {
        let client = Client::builder()
            .timeout(NetworkConfig::FETCH_TIMEOUT)
            .user_agent(NetworkConfig::USER_AGENT)
            .build()
            .map_err(|e| MigrateError::Network {
                message: format!("failed to build HTTP client: {e}"),
                source: Some(e),
            })?;
        Ok(Self { base, client })
    }

    /// Fetch a path relative to the files base.
    pub fn fetch_relative(&self, relative: &str) -> Result<Vec<u8>> {
        let relative = relative.trim_start_matches('/');
        match &self.base {
            FilesBase::Local(root) => {
                let path: PathBuf = root.join(relative);
                if !path.is_file() {
                    return Err(MigrateError::FileNotFound(path));
                }
                std::fs::read(&path).map_err(|e| MigrateError::io_with_path(e, path))
            }
            FilesBase::Http(base) => {
                let url = format!("{}/{}", base.as_str().trim_end_matches('/'), relative);
                self.fetch_url(&url)
            }
        }
    }

    /// Fetch an absolute URL (used for body images that already carry a
    /// host). A non-200 status or transport error is recoverable.
    pub fn fetch_url(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| MigrateError::FetchFailed {
                locator: url.to_string(),
                message: e.to_string(),
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(MigrateError::FetchFailed {
                locator: url.to_string(),
                message: format!("HTTP {status}"),
            });
        }
        let bytes = response.bytes().map_err(|e| MigrateError::FetchFailed {
            locator: url.to_string(),
            message: e.to_string(),
        })?;
        debug!(url, len = bytes.len(), "fetched resource");
        Ok(bytes.to_vec())
    }
}

/// Strip the legacy scheme/path prefixes a source URI may carry, leaving
/// the path relative to the files base.
pub fn strip_known_prefixes(uri: &str) -> &str {
    // Inline srcs are often root-relative; the prefixes themselves never
    // start with a slash.
    let uri = uri.trim_start_matches('/');
    for prefix in KNOWN_URI_PREFIXES {
        if let Some(rest) = uri.strip_prefix(prefix) {
            return rest.trim_start_matches('/');
        }
    }
    uri
}
