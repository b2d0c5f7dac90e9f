//! Supervised fine-tuning collation into fixed-length padded batches.

use super::Example;
use crate::config::DataConfig;
use crate::error::{Error, Result};

/// Padding and masking parameters of collation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CollateOptions {
    pub max_seq_length: usize,
    pub pad_id: u32,
    pub ignore_index: i64,
    pub mask_prompt: bool,
}

impl From<&DataConfig> for CollateOptions {
    fn from(config: &DataConfig) -> Self {
        Self {
            max_seq_length: config.max_seq_length,
            pad_id: config.pad_id,
            ignore_index: config.ignore_index,
            mask_prompt: config.mask_prompt,
        }
    }
}

/// A padded batch of `[batch, max_seq_length]` token rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub input_ids: Vec<Vec<u32>>,
    /// Target tokens; `ignore_index` marks positions excluded from the loss
    pub labels: Vec<Vec<i64>>,
    /// True for real tokens, false for padding
    pub attention_mask: Vec<Vec<bool>>,
    pub prompt_lengths: Vec<usize>,
    pub response_lengths: Vec<usize>,
    pub ignore_index: i64,
}

impl Batch {
    pub fn batch_size(&self) -> usize {
        self.input_ids.len()
    }

    pub fn seq_len(&self) -> usize {
        self.input_ids.first().map(Vec::len).unwrap_or(0)
    }

    /// Positions `0..seq_len`, shared by every row.
    pub fn position_ids(&self) -> Vec<usize> {
        (0..self.seq_len()).collect()
    }

    /// Positions that contribute to the next-token loss: the label at `t + 1`
    /// predicted from position `t`.
    pub fn num_target_tokens(&self) -> usize {
        self.labels
            .iter()
            .map(|row| row.iter().skip(1).filter(|&&l| l != self.ignore_index).count())
            .sum()
    }

    /// Split rows into `parts` equal micro-batches, one per data-parallel group.
    pub fn split(&self, parts: usize) -> Result<Vec<Batch>> {
        let n = self.batch_size();
        if parts == 0 || n % parts != 0 {
            return Err(Error::sharding(format!(
                "batch of {} rows cannot be split across {} data parallel groups",
                n, parts
            )));
        }
        let rows = n / parts;
        Ok((0..parts)
            .map(|p| {
                let range = p * rows..(p + 1) * rows;
                Batch {
                    input_ids: self.input_ids[range.clone()].to_vec(),
                    labels: self.labels[range.clone()].to_vec(),
                    attention_mask: self.attention_mask[range.clone()].to_vec(),
                    prompt_lengths: self.prompt_lengths[range.clone()].to_vec(),
                    response_lengths: self.response_lengths[range].to_vec(),
                    ignore_index: self.ignore_index,
                }
            })
            .collect())
    }
}

/// Concatenate prompt and response, truncate to `max_seq_length`, then pad
/// inputs with `pad_id` and labels with `ignore_index`.
pub fn collate(examples: &[Example], options: &CollateOptions) -> Result<Batch> {
    if examples.is_empty() {
        return Err(Error::data("cannot collate an empty batch"));
    }
    let max_len = options.max_seq_length;
    let mut batch = Batch {
        input_ids: Vec::with_capacity(examples.len()),
        labels: Vec::with_capacity(examples.len()),
        attention_mask: Vec::with_capacity(examples.len()),
        prompt_lengths: Vec::with_capacity(examples.len()),
        response_lengths: Vec::with_capacity(examples.len()),
        ignore_index: options.ignore_index,
    };

    for example in examples {
        let mut ids: Vec<u32> = example
            .prompt
            .iter()
            .chain(example.response.iter())
            .copied()
            .take(max_len)
            .collect();
        let real = ids.len();

        let mut labels: Vec<i64> = ids.iter().map(|&t| t as i64).collect();
        if options.mask_prompt {
            let masked = example.prompt.len().min(real);
            labels[..masked].fill(options.ignore_index);
        }

        ids.resize(max_len, options.pad_id);
        labels.resize(max_len, options.ignore_index);
        let mask = (0..max_len).map(|i| i < real).collect();

        batch.input_ids.push(ids);
        batch.labels.push(labels);
        batch.attention_mask.push(mask);
        batch.prompt_lengths.push(example.prompt.len().min(max_len));
        batch.response_lengths.push(example.response.len().min(max_len));
    }
    Ok(batch)
}
