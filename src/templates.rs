use crate::error::Result;
use log::debug;
use std::{collections::BTreeMap, fs, path::Path};

/// Mustache templates keyed by URL patterns derived from their filenames.
///
/// A file `api.example.com__v1__users.mustache` matches URLs under
/// `api.example.com/v1/users`; `_default.mustache` is the fallback for
/// anything no pattern matches.
#[derive(Debug, Default, Clone)]
pub struct TemplateStore {
    templates: BTreeMap<String, String>,
    default_template: Option<String>,
}

impl TemplateStore {
    /// Loads all `.mustache` files from `dir` (non-recursive). Filenames are
    /// turned into URL patterns by stripping the extension and mapping `__`
    /// to `/`.
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let mut store = TemplateStore::default();

        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(base) = name.strip_suffix(".mustache") else {
                continue;
            };

            let content = fs::read_to_string(entry.path())?;
            if base == "_default" {
                store.default_template = Some(content);
                continue;
            }
            store.templates.insert(base.replace("__", "/"), content);
        }

        debug!(
            "loaded {} template(s){}",
            store.templates.len(),
            if store.default_template.is_some() {
                " plus default"
            } else {
                ""
            }
        );
        Ok(store)
    }

    /// Returns the template for the best-matching URL pattern, or the empty
    /// string when nothing matches and no default exists.
    ///
    /// Matching ignores URL schemes on both sides. The longest
    /// scheme-stripped prefix wins; equal lengths break by lexical pattern
    /// order. Patterns without a `/` fall back to substring matching on the
    /// URL (host-only patterns).
    pub fn match_url(&self, url: &str) -> String {
        let bare_url = strip_scheme(url);

        // BTreeMap iteration is lexical, so the first longest prefix seen is
        // the lexically smallest of its length.
        let mut best: Option<(&str, &str)> = None;
        for (pattern, template) in &self.templates {
            let bare_pattern = strip_scheme(pattern);
            if bare_url.starts_with(bare_pattern) {
                let longer = match best {
                    Some((current, _)) => bare_pattern.len() > current.len(),
                    None => true,
                };
                if longer {
                    best = Some((bare_pattern, template));
                }
            }
        }
        if let Some((_, template)) = best {
            return template.to_string();
        }

        for (pattern, template) in &self.templates {
            let bare_pattern = strip_scheme(pattern);
            if !bare_pattern.contains('/') && url.contains(bare_pattern) {
                return template.to_string();
            }
        }

        self.default_template.clone().unwrap_or_default()
    }
}

/// Returns the template for a URL, treating an absent store as empty.
pub fn match_template(store: Option<&TemplateStore>, url: &str) -> String {
    store.map(|s| s.match_url(url)).unwrap_or_default()
}

fn strip_scheme(s: &str) -> &str {
    match s.find("://") {
        Some(idx) => &s[idx + 3..],
        None => s,
    }
}
