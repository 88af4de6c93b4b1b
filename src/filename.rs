// src/filename.rs

use reqwest::header::{HeaderMap, CONTENT_DISPOSITION};
use reqwest::Url;

const FALLBACK_NAME: &str = "download";

/// Picks a file name for a download: the `filename=` parameter of
/// `Content-Disposition` if present, otherwise the last path segment of the URL.
pub fn filename(url: &str, headers: &HeaderMap) -> String {
    from_content_disposition(headers)
        .or_else(|| from_url(url))
        .unwrap_or_else(|| FALLBACK_NAME.to_string())
}

fn from_content_disposition(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(CONTENT_DISPOSITION)?.to_str().ok()?;
    let start = value.find("filename=")? + "filename=".len();
    let name = value[start..].split(';').next()?.trim().trim_matches('"');
    sanitize(&decode(name))
}

fn from_url(url: &str) -> Option<String> {
    let url = Url::parse(url).ok()?;
    let last = url.path_segments()?.next_back()?;
    sanitize(&decode(last))
}

/// Percent-decodes `name`, keeping it as is when it does not decode to UTF-8.
fn decode(name: &str) -> String {
    urlencoding::decode(name)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| name.to_string())
}

/// Rejects empty names and anything that would escape the target directory.
fn sanitize(name: &str) -> Option<String> {
    let name = name.rsplit(['/', '\\']).next()?.trim();
    match name {
        "" | "." | ".." => None,
        name => Some(name.to_string()),
    }
}
