use crate::error::Error;
use std::sync::Arc;
use tiktoken_rs::CoreBPE;

/// Counts tokens under a named tiktoken encoding.
///
/// The BPE tables ship with the crate, so counting needs no network access
/// once the counter is constructed. Cloning shares the loaded encoder.
#[derive(Clone)]
pub struct TokenCounter {
    bpe: Arc<CoreBPE>,
}

impl TokenCounter {
    /// Creates a counter for the given encoding name
    /// (e.g. `cl100k_base`, `o200k_base`, `p50k_base`).
    pub fn new(encoding: &str) -> Result<Self, Error> {
        let bpe = match encoding {
            "cl100k_base" => tiktoken_rs::cl100k_base(),
            "o200k_base" => tiktoken_rs::o200k_base(),
            "p50k_base" => tiktoken_rs::p50k_base(),
            "p50k_edit" => tiktoken_rs::p50k_edit(),
            "r50k_base" => tiktoken_rs::r50k_base(),
            other => {
                return Err(Error::Config(format!(
                    "unknown tiktoken encoding {other:?}"
                )))
            }
        }
        .map_err(|err| Error::Config(format!("loading tiktoken encoding {encoding:?}: {err}")))?;

        Ok(Self { bpe: Arc::new(bpe) })
    }

    /// Returns the number of tokens in the given text.
    pub fn count(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }
}
