//! Training data: dataset sources, the seeded train/test split, collation
//! and the prefetching batch loader.

use crate::config::DataConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

pub mod collate;
pub mod loader;

pub use collate::{collate, Batch, CollateOptions};
pub use loader::{eval_batches, BatchLoader, LoadedBatch, LoaderPosition};

/// A pre-tokenized supervised example
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Example {
    #[serde(rename = "prompt_ids")]
    pub prompt: Vec<u32>,
    #[serde(rename = "response_ids")]
    pub response: Vec<u32>,
}

impl Example {
    pub fn new(prompt: Vec<u32>, response: Vec<u32>) -> Self {
        Self { prompt, response }
    }

    pub fn len(&self) -> usize {
        self.prompt.len() + self.response.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Dataset collaborator: yields raw examples for a split.
#[async_trait]
pub trait DatasetSource: Send + Sync {
    /// Human readable identifier
    fn name(&self) -> String;

    async fn load(&self, split: &str, max_examples: Option<usize>) -> Result<Vec<Example>>;
}

/// Reads `{"prompt_ids": [...], "response_ids": [...]}` records, one per line.
///
/// `path` is either the file itself or a directory holding `<split>.jsonl`.
pub struct JsonlSource {
    path: PathBuf,
}

impl JsonlSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn resolve(&self, split: &str) -> PathBuf {
        if self.path.is_dir() {
            self.path.join(format!("{}.jsonl", split))
        } else {
            self.path.clone()
        }
    }

    /// Parse JSONL content
    pub fn parse(content: &str, origin: &Path) -> Result<Vec<Example>> {
        let mut examples = Vec::new();
        for (line_num, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let example: Example = serde_json::from_str(line).map_err(|e| {
                Error::data(format!(
                    "failed to parse line {} in {}: {}",
                    line_num + 1,
                    origin.display(),
                    e
                ))
            })?;
            examples.push(example);
        }
        Ok(examples)
    }
}

#[async_trait]
impl DatasetSource for JsonlSource {
    fn name(&self) -> String {
        self.path.display().to_string()
    }

    async fn load(&self, split: &str, max_examples: Option<usize>) -> Result<Vec<Example>> {
        let path = self.resolve(split);
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            Error::data(format!("failed to read training data from {}: {}", path.display(), e))
        })?;
        let mut examples = Self::parse(&content, &path)?;
        if let Some(max) = max_examples {
            examples.truncate(max);
        }
        info!("Loaded {} examples from {}", examples.len(), path.display());
        Ok(examples)
    }
}

/// Examples held in memory, identical for every split.
#[derive(Debug, Clone, Default)]
pub struct InMemorySource {
    examples: Vec<Example>,
}

impl InMemorySource {
    pub fn new(examples: Vec<Example>) -> Self {
        Self { examples }
    }
}

#[async_trait]
impl DatasetSource for InMemorySource {
    fn name(&self) -> String {
        format!("memory({})", self.examples.len())
    }

    async fn load(&self, _split: &str, max_examples: Option<usize>) -> Result<Vec<Example>> {
        let n = max_examples.unwrap_or(self.examples.len()).min(self.examples.len());
        Ok(self.examples[..n].to_vec())
    }
}

/// Source for a `data_source` string.
pub fn source_for(config: &DataConfig) -> Box<dyn DatasetSource> {
    Box::new(JsonlSource::new(&config.data_source))
}

/// Train and held-out examples.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetSplit {
    pub train: Vec<Example>,
    pub test: Vec<Example>,
}

/// Shuffle with a generator seeded by `seed` and hold out
/// `ceil(len * ratio)` examples. Both sides always keep at least one example.
pub fn train_test_split(examples: Vec<Example>, ratio: f64, seed: u64) -> Result<DatasetSplit> {
    if !(ratio > 0.0 && ratio < 1.0) {
        return Err(Error::config(format!(
            "train_test_split must be strictly between 0 and 1, got {}",
            ratio
        )));
    }
    let n = examples.len();
    if n < 2 {
        return Err(Error::data(format!(
            "need at least 2 examples to split, got {}",
            n
        )));
    }

    let mut examples = examples;
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    examples.shuffle(&mut rng);

    let test_len = ((n as f64) * ratio).ceil() as usize;
    let test_len = test_len.clamp(1, n - 1);
    let train = examples.split_off(test_len);
    Ok(DatasetSplit {
        train,
        test: examples,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn examples(n: u32) -> Vec<Example> {
        (0..n).map(|i| Example::new(vec![i], vec![i + 1, i + 2])).collect()
    }

    #[test]
    fn test_split_is_reproducible() {
        let a = train_test_split(examples(100), 0.15, 42).unwrap();
        let b = train_test_split(examples(100), 0.15, 42).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.test.len(), 15);
        assert_eq!(a.train.len(), 85);

        let c = train_test_split(examples(100), 0.15, 7).unwrap();
        assert_ne!(a.test, c.test);
    }

    #[test]
    fn test_split_edge_cases() {
        assert!(matches!(train_test_split(examples(1), 0.5, 0), Err(Error::Data(_))));
        assert!(matches!(train_test_split(examples(10), 1.0, 0), Err(Error::Config(_))));

        let s = train_test_split(examples(2), 0.15, 0).unwrap();
        assert_eq!(s.test.len(), 1);
        assert_eq!(s.train.len(), 1);
    }

    #[test]
    fn test_parse_jsonl() {
        let content = "{\"prompt_ids\": [1, 2], \"response_ids\": [3]}\n\n{\"prompt_ids\": [], \"response_ids\": [4, 5]}\n";
        let parsed = JsonlSource::parse(content, Path::new("mem.jsonl")).unwrap();
        assert_eq!(parsed, vec![Example::new(vec![1, 2], vec![3]), Example::new(vec![], vec![4, 5])]);

        let err = JsonlSource::parse("{\"prompt\": 1}", Path::new("bad.jsonl")).unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[tokio::test]
    async fn test_jsonl_source_reads_split_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("train.jsonl"),
            "{\"prompt_ids\": [1], \"response_ids\": [2]}\n{\"prompt_ids\": [3], \"response_ids\": [4]}\n",
        )
        .unwrap();
        let source = JsonlSource::new(dir.path());
        assert_eq!(source.load("train", None).await.unwrap().len(), 2);
        assert_eq!(source.load("train", Some(1)).await.unwrap().len(), 1);
        assert!(matches!(source.load("validation", None).await, Err(Error::Data(_))));
    }
}
