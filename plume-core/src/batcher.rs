use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{PlumeError, Result};

/// Where the prompts of a request come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PromptSource {
    /// One prompt, repeated to fill a single batch.
    Single(String),
    /// One prompt per line, chunked into consecutive batches.
    Lines(Vec<String>),
}

impl PromptSource {
    pub fn from_text(text: &str) -> Self {
        Self::Lines(text.lines().map(str::to_string).collect())
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| PlumeError::io(path, e))?;
        Ok(Self::from_text(&text))
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Single(prompt) => prompt.is_empty(),
            Self::Lines(lines) => lines.is_empty(),
        }
    }
}

/// An ordered group of prompts sent to the sampler in one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptBatch(Vec<String>);

impl PromptBatch {
    pub fn prompts(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Vec<String> {
        self.0
    }
}

/// Splits `source` into batches of `batch_size`; only the last batch may be shorter.
pub fn batch_prompts(source: &PromptSource, batch_size: usize) -> Result<Vec<PromptBatch>> {
    if batch_size < 1 {
        return Err(PlumeError::configuration("batch size must be at least 1"));
    }
    let batches = match source {
        PromptSource::Single(prompt) => vec![PromptBatch(vec![prompt.clone(); batch_size])],
        PromptSource::Lines(lines) => lines
            .chunks(batch_size)
            .map(|chunk| PromptBatch(chunk.to_vec()))
            .collect(),
    };
    Ok(batches)
}
