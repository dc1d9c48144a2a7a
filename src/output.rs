use crate::error::Result;
use log::debug;
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};
use url::Url;

const MAX_STEM_LEN: usize = 200;

/// Writes converted Markdown bodies to a directory under URL-derived names.
#[derive(Debug, Clone)]
pub struct OutputWriter {
    dir: PathBuf,
}

impl OutputWriter {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
        })
    }

    /// Saves the Markdown under a filename derived from the URL. The write
    /// goes through a temporary file and a rename, so a partial file is
    /// never observable under the final name.
    pub fn write(&self, url: &str, markdown: &[u8]) -> Result<()> {
        let path = self.dir.join(safe_filename(url));

        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(markdown)?;
        tmp.persist(&path).map_err(|err| err.error)?;

        debug!("wrote {} byte(s) to {}", markdown.len(), path.display());
        Ok(())
    }
}

/// Converts a URL into a file-safe name with a `.md` extension:
/// sanitised host, path segments and query joined by `__`, truncated to 200
/// characters before the extension.
pub fn safe_filename(raw_url: &str) -> String {
    let Ok(url) = Url::parse(raw_url) else {
        return format!("{}.md", truncate(&sanitize(raw_url)));
    };

    let mut parts: Vec<String> = Vec::new();
    if let Some(host) = url.host_str() {
        parts.push(sanitize(host));
    }
    for segment in url.path().trim_matches('/').split('/') {
        let s = sanitize(segment);
        if !s.is_empty() {
            parts.push(s);
        }
    }
    if let Some(query) = url.query() {
        let s = sanitize(query);
        if !s.is_empty() {
            parts.push(s);
        }
    }

    let mut name = parts.join("__");
    if name.is_empty() {
        name = String::from("index");
    }
    format!("{}.md", truncate(&name))
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn truncate(name: &str) -> &str {
    match name.char_indices().nth(MAX_STEM_LEN) {
        Some((idx, _)) => &name[..idx],
        None => name,
    }
}
