use crate::error::{Error, Result};
use fancy_regex::Regex;

/// Allow-list of URL regexes. An empty list allows every request.
#[derive(Debug, Default, Clone)]
pub struct Filter {
    patterns: Vec<Regex>,
}

impl Filter {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let compiled = patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|err| Error::Config(format!("invalid allow pattern {p:?}: {err}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns: compiled })
    }

    /// Reports whether the URL matches any allowed pattern.
    pub fn allowed(&self, url: &str) -> bool {
        if self.patterns.is_empty() {
            return true;
        }
        self.patterns
            .iter()
            .any(|p| p.is_match(url).unwrap_or(false))
    }
}
