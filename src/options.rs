// src/options.rs

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RANGE};
use reqwest::{Client, Proxy, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Transport options applied identically by every worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestOptions {
    /// Extra headers sent with every request.
    pub headers: BTreeMap<String, String>,
    /// Connect timeout, and the longest wait for a single chunk of the body.
    pub timeout: Duration,
    /// Proxy URL used for all schemes.
    pub proxy: Option<String>,
    pub verify_tls: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            headers: BTreeMap::new(),
            timeout: Duration::from_secs(20),
            proxy: None,
            verify_tls: true,
        }
    }
}

impl RequestOptions {
    /// Builds the client shared by all workers of a download.
    pub fn build_client(&self) -> Result<Client, reqwest::Error> {
        let mut builder = Client::builder()
            .connect_timeout(self.timeout)
            .danger_accept_invalid_certs(!self.verify_tls);
        if let Some(proxy) = &self.proxy {
            builder = builder.proxy(Proxy::all(proxy)?);
        }
        builder.build()
    }

    /// A GET for `url` carrying the configured headers. A `range` value
    /// replaces any range header configured by the caller.
    pub fn get(&self, client: &Client, url: &str, range: Option<&str>) -> RequestBuilder {
        let mut headers = self.header_map();
        if let Some(range) = range {
            match HeaderValue::from_str(range) {
                Ok(value) => {
                    headers.insert(RANGE, value);
                }
                Err(_) => tracing::warn!(range, "skipping invalid range header"),
            }
        }
        client.get(url).headers(headers)
    }

    /// A HEAD for `url` carrying the configured headers.
    pub fn head(&self, client: &Client, url: &str) -> RequestBuilder {
        client.head(url).headers(self.header_map())
    }

    /// Headers that are not valid HTTP are skipped.
    fn header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in &self.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    map.insert(name, value);
                }
                _ => tracing::warn!(header = %name, "skipping invalid request header"),
            }
        }
        map
    }
}

/// Options for a single download.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadOptions {
    pub url: String,
    pub destination: PathBuf,
    /// Requested number of concurrent segments.
    pub segments: usize,
    /// How many times a failed attempt is resumed before giving up.
    pub retries: usize,
    pub request: RequestOptions,
    /// Expected hex SHA-256 of the finished file.
    pub sha256: Option<String>,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            url: String::new(),
            destination: PathBuf::new(),
            segments: 10,
            retries: 0,
            request: RequestOptions::default(),
            sha256: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_headers_are_dropped() {
        let mut options = RequestOptions::default();
        options.headers.insert("x-token".into(), "secret".into());
        options.headers.insert("bad header".into(), "x".into());
        let map = options.header_map();
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("x-token").unwrap(), "secret");
    }

    #[test]
    fn range_overrides_configured_range() {
        let mut options = RequestOptions::default();
        options.headers.insert("range".into(), "bytes=0-0".into());
        let client = options.build_client().unwrap();
        let request = options
            .get(&client, "http://localhost/file", Some("bytes=10-19"))
            .build()
            .unwrap();
        let ranges: Vec<_> = request.headers().get_all(RANGE).iter().collect();
        assert_eq!(ranges, vec!["bytes=10-19"]);
    }

    #[test]
    fn defaults() {
        let options = DownloadOptions::default();
        assert_eq!(options.segments, 10);
        assert_eq!(options.retries, 0);
        assert_eq!(options.request.timeout, Duration::from_secs(20));
        assert!(options.request.verify_tls);
        assert!(options.request.build_client().is_ok());
    }
}
