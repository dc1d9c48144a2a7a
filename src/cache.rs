use crate::error::Result;
use http::{HeaderMap, StatusCode};
use log::debug;
use sha2::{Digest, Sha256};
use std::{
    fs,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

const DEFAULT_VALIDATOR_TTL: Duration = Duration::from_secs(5 * 60);

/// Disk store for original response bodies, keyed by request URL and bounded
/// by RFC 7234 freshness directives.
///
/// An entry is a pair of sibling files: `<hex sha256>.html` holding the body
/// and `<hex sha256>.meta` holding a single RFC-3339 expiry timestamp.
/// Either file missing means a miss.
#[derive(Debug, Clone)]
pub struct DiskCache {
    dir: PathBuf,
    respect_headers: bool,
}

impl DiskCache {
    pub fn new<P: AsRef<Path>>(dir: P, respect_headers: bool) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
            respect_headers,
        })
    }

    /// Checks RFC 7234 headers to determine whether a response may be stored.
    pub fn is_cacheable(&self, status: StatusCode, headers: &HeaderMap) -> bool {
        if status.as_u16() < 200 || status.as_u16() >= 400 {
            return false;
        }
        if !self.respect_headers {
            return true;
        }

        let cc = header_str(headers, http::header::CACHE_CONTROL).to_ascii_lowercase();
        if cc.contains("no-store") || cc.contains("private") {
            return false;
        }
        if cc.contains("max-age") || cc.contains("s-maxage") {
            return true;
        }

        if let Some(expires) = parse_expires(headers) {
            if expires > SystemTime::now() {
                return true;
            }
        }

        headers.contains_key(http::header::ETAG)
            || headers.contains_key(http::header::LAST_MODIFIED)
    }

    /// Computes how long a response should stay cached. `s-maxage` beats
    /// `max-age`, both beat a future `Expires`; a response cacheable only by
    /// validator presence gets five minutes.
    pub fn ttl(&self, headers: &HeaderMap) -> Duration {
        if !self.respect_headers {
            return DEFAULT_VALIDATOR_TTL;
        }

        let cc = header_str(headers, http::header::CACHE_CONTROL);
        let cc_lower = cc.to_ascii_lowercase();

        if let Some(idx) = cc_lower.find("s-maxage=") {
            if let Some(d) = parse_max_age(&cc[idx + "s-maxage=".len()..]) {
                return d;
            }
        }
        if let Some(idx) = cc_lower.find("max-age=") {
            if let Some(d) = parse_max_age(&cc[idx + "max-age=".len()..]) {
                return d;
            }
        }

        if let Some(expires) = parse_expires(headers) {
            if let Ok(ttl) = expires.duration_since(SystemTime::now()) {
                if !ttl.is_zero() {
                    return ttl;
                }
            }
        }

        DEFAULT_VALIDATOR_TTL
    }

    /// Returns the cached body when both entry files exist and the expiry is
    /// in the future. Expired or half-written entries are deleted and miss.
    pub fn get(&self, url: &str) -> Option<Vec<u8>> {
        let (body_path, meta_path) = self.entry_paths(url);

        let meta = fs::read_to_string(&meta_path).ok()?;
        let expiry = OffsetDateTime::parse(meta.trim(), &Rfc3339).ok();
        let live = matches!(expiry, Some(at) if at > OffsetDateTime::now_utc());
        if !live {
            let _ = fs::remove_file(&meta_path);
            let _ = fs::remove_file(&body_path);
            return None;
        }

        fs::read(&body_path).ok()
    }

    /// Stores body bytes with an expiry `ttl` from now. The body file is
    /// written before the metadata file so a partial write never produces a
    /// live entry.
    pub fn put(&self, url: &str, body: &[u8], ttl: Duration) -> Result<()> {
        let (body_path, meta_path) = self.entry_paths(url);

        fs::write(&body_path, body)?;
        let expiry = OffsetDateTime::now_utc() + time::Duration::try_from(ttl).unwrap_or_default();
        let stamp = expiry
            .format(&Rfc3339)
            .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"));
        fs::write(&meta_path, stamp)?;
        debug!("cached {} byte(s) for {url}", body.len());
        Ok(())
    }

    fn entry_paths(&self, url: &str) -> (PathBuf, PathBuf) {
        let key = hex::encode(Sha256::digest(url.as_bytes()));
        (
            self.dir.join(format!("{key}.html")),
            self.dir.join(format!("{key}.meta")),
        )
    }
}

fn header_str(headers: &HeaderMap, name: http::header::HeaderName) -> &str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

fn parse_expires(headers: &HeaderMap) -> Option<SystemTime> {
    let raw = headers.get(http::header::EXPIRES)?.to_str().ok()?;
    httpdate::parse_http_date(raw).ok()
}

/// Parses the decimal seconds of a max-age directive, stopping at the next
/// comma or whitespace. Malformed or non-positive values count as absent.
fn parse_max_age(s: &str) -> Option<Duration> {
    let end = s
        .find(|c: char| c == ',' || c.is_whitespace())
        .unwrap_or(s.len());
    match s[..end].trim().parse::<i64>() {
        Ok(secs) if secs > 0 => Some(Duration::from_secs(secs as u64)),
        _ => None,
    }
}
