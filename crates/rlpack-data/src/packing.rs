//! Sequence packing for RL fine-tuning batches.
//!
//! Packing concatenates tokenized completions into fixed-width rows so that a
//! batch carries as little padding as possible. Sibling completions of the
//! same prompt share their prompt tokens: once a prompt has been written into a
//! row, later siblings placed in that row contribute only their completion.
//!
//! ```text
//! row 0: [prompt A][completion A1][completion A2][prompt B][completion B1][PAD]
//! group: [  pA    ][     g1      ][     g2      ][  pB    ][     g3      ][ -1]
//! parent:[  pA    ][     pA      ][     pA      ][  pB    ][     pB      ][ -1]
//! ```
//!
//! `group_ids` and `parent_ids` drive the grouped causal attention mask (see
//! [`crate::grouped_causal_mask`]): each completion attends to itself and to
//! its prompt, never to a sibling completion.
//!
//! # Algorithm
//!
//! Greedy, order preserving:
//! 1. For each result, decide whether its prompt is already in the open row
//! 2. If the (possibly prompt-stripped) result does not fit, close the row
//! 3. Append all nine channels, truncating to the row width if enabled
//! 4. Pad every row to the row width with per-channel sentinels
//! 5. Normalize weights so their mean over supervised tokens is exactly 1

use std::borrow::Cow;
use std::collections::HashSet;

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rlpack_core::{PackingConfig, Result, RlPackError};
use tracing::{debug, info, warn};

use crate::TokenizedResult;

/// Padding value for `group_ids` and `parent_ids`.
pub const PAD_GROUP_ID: i64 = -1;
/// Padding value for `input_pos`.
pub const PAD_INPUT_POS: i64 = 0;

/// Salt separating packer group ids from a grouper seeded with the same value.
const GROUP_ID_STREAM: u64 = 0x9E37_79B9_7F4A_7C15;

/// Nine aligned channels of shape `[num_sequences, sequence_length]`.
#[derive(Debug, Clone, PartialEq)]
pub struct PackedTensors {
    /// Token ids, padded with the configured pad id.
    pub tokens: Array2<i64>,
    /// Prompt id over shared prompt tokens, candidate group id elsewhere. Pad -1.
    pub group_ids: Array2<i64>,
    /// Prompt id of every candidate token. Pad -1.
    pub parent_ids: Array2<i64>,
    /// Position indices. Pad 0.
    pub input_pos: Array2<i64>,
    /// Supervised positions. Pad false.
    pub assistant_mask: Array2<bool>,
    /// Sampling log-probabilities. Pad NaN.
    pub logprobs: Array2<f32>,
    /// Per-token advantages. Pad 0.
    pub advantages: Array2<f32>,
    /// Loss weights with mean 1 over supervised positions. Pad 0.
    pub weights: Array2<f32>,
    /// Deferred-loss flags. Pad false.
    pub deferred: Array2<bool>,
}

impl PackedTensors {
    /// Number of rows.
    pub fn num_sequences(&self) -> usize {
        self.tokens.nrows()
    }

    /// Row width.
    pub fn sequence_length(&self) -> usize {
        self.tokens.ncols()
    }

    /// Shape shared by every channel.
    pub fn shape(&self) -> (usize, usize) {
        self.tokens.dim()
    }

    /// Check that all nine channels share one shape.
    pub fn validate(&self) -> Result<()> {
        let expected = self.tokens.dim();
        let shapes = [
            self.group_ids.dim(),
            self.parent_ids.dim(),
            self.input_pos.dim(),
            self.assistant_mask.dim(),
            self.logprobs.dim(),
            self.advantages.dim(),
            self.weights.dim(),
            self.deferred.dim(),
        ];
        match shapes.into_iter().find(|&shape| shape != expected) {
            Some(actual) => Err(RlPackError::ShapeMismatch {
                expected: vec![expected.0, expected.1],
                actual: vec![actual.0, actual.1],
            }),
            None => Ok(()),
        }
    }

    /// Number of supervised positions in the whole batch.
    pub fn num_assistant_tokens(&self) -> usize {
        self.assistant_mask.iter().filter(|&&m| m).count()
    }

    /// Grouped causal attention mask for one row.
    pub fn attention_mask(&self, row: usize) -> Result<Array2<bool>> {
        if row >= self.num_sequences() {
            return Err(RlPackError::IndexOutOfBounds {
                index: row,
                len: self.num_sequences(),
            });
        }
        let group_ids = self.group_ids.row(row).to_vec();
        let parent_ids = self.parent_ids.row(row).to_vec();
        Ok(crate::grouped_causal_mask(&group_ids, &parent_ids))
    }
}

/// Statistics about a packing run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PackingStats {
    /// Number of rows produced.
    pub num_rows: usize,
    /// Row width.
    pub seq_len: usize,
    /// Results written into a row.
    pub packed_results: usize,
    /// Results dropped for exceeding the row width with truncation disabled.
    pub skipped_too_long: usize,
    /// Results dropped for having no supervised tokens.
    pub skipped_no_completion: usize,
    /// Results whose prompt was already present in their row.
    pub deduplicated_prompts: usize,
    /// Results that lost their tail to truncation.
    pub truncated_results: usize,
    /// Non-padding positions across all rows.
    pub total_tokens: usize,
}

impl PackingStats {
    /// Fraction of positions holding real tokens.
    pub fn efficiency(&self) -> f64 {
        let capacity = self.num_rows * self.seq_len;
        if capacity == 0 {
            return 0.0;
        }
        self.total_tokens as f64 / capacity as f64
    }

    /// Pretty print stats.
    pub fn summary(&self) -> String {
        format!(
            "Packing: {} results → {} rows, {:.1}% efficiency, {} prompts shared, {} truncated, {} skipped",
            self.packed_results,
            self.num_rows,
            self.efficiency() * 100.0,
            self.deduplicated_prompts,
            self.truncated_results,
            self.skipped_too_long + self.skipped_no_completion
        )
    }
}

/// One open row: nine growable channels plus the group ids written so far.
struct RowBuilder {
    tokens: Vec<i64>,
    group_ids: Vec<i64>,
    parent_ids: Vec<i64>,
    input_pos: Vec<i64>,
    assistant_mask: Vec<bool>,
    logprobs: Vec<f32>,
    advantages: Vec<f32>,
    weights: Vec<f32>,
    deferred: Vec<bool>,
    markers: HashSet<i64>,
}

impl RowBuilder {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            tokens: Vec::with_capacity(capacity),
            group_ids: Vec::with_capacity(capacity),
            parent_ids: Vec::with_capacity(capacity),
            input_pos: Vec::with_capacity(capacity),
            assistant_mask: Vec::with_capacity(capacity),
            logprobs: Vec::with_capacity(capacity),
            advantages: Vec::with_capacity(capacity),
            weights: Vec::with_capacity(capacity),
            deferred: Vec::with_capacity(capacity),
            markers: HashSet::new(),
        }
    }

    fn len(&self) -> usize {
        self.tokens.len()
    }

    fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    fn has_prompt(&self, prompt_id: i64) -> bool {
        self.markers.contains(&prompt_id)
    }

    /// Append one result. A reported log-probability of `0.0` is kept as
    /// `0.0`; only a missing one becomes NaN.
    fn append(&mut self, result: &TokenizedResult, group_id: i64) {
        let len = result.len();
        let offset = self.len();
        let prompt_length = result.prompt_length.min(len);

        self.tokens.extend(result.token_ids.iter().map(|&t| i64::from(t)));

        self.group_ids
            .extend(std::iter::repeat(result.prompt_id).take(prompt_length));
        self.group_ids
            .extend(std::iter::repeat(group_id).take(len - prompt_length));
        if prompt_length > 0 {
            self.markers.insert(result.prompt_id);
        }
        if len > prompt_length {
            self.markers.insert(group_id);
        }

        self.parent_ids
            .extend(std::iter::repeat(result.prompt_id).take(len));
        self.input_pos
            .extend(result.input_pos.iter().map(|&p| i64::from(p)));
        self.assistant_mask.extend_from_slice(&result.assistant_mask);

        self.logprobs.extend(std::iter::repeat(f32::NAN).take(len));
        if let Some(token_logprobs) = result.token_logprobs.as_deref() {
            let positions: Vec<usize> = result
                .assistant_mask
                .iter()
                .enumerate()
                .filter_map(|(i, &m)| m.then_some(i))
                .collect();
            let n = positions.len().min(token_logprobs.len());
            let positions = &positions[positions.len() - n..];
            let token_logprobs = &token_logprobs[token_logprobs.len() - n..];
            for (&i, lp) in positions.iter().zip(token_logprobs) {
                self.logprobs[offset + i] = lp.logprob.map_or(f32::NAN, |v| v as f32);
            }
        }

        self.advantages
            .extend(std::iter::repeat(result.advantage as f32).take(len));

        let weight = (1.0 / result.num_assistant_tokens() as f64) as f32;
        self.weights.extend(std::iter::repeat(weight).take(len));

        self.deferred
            .extend(std::iter::repeat(result.deferred).take(len));
    }

    /// Clip every channel to `max_len`. Returns whether anything was removed.
    fn truncate(&mut self, max_len: usize) -> bool {
        if self.len() <= max_len {
            return false;
        }
        self.tokens.truncate(max_len);
        self.group_ids.truncate(max_len);
        self.parent_ids.truncate(max_len);
        self.input_pos.truncate(max_len);
        self.assistant_mask.truncate(max_len);
        self.logprobs.truncate(max_len);
        self.advantages.truncate(max_len);
        self.weights.truncate(max_len);
        self.deferred.truncate(max_len);
        self.markers = self.group_ids.iter().copied().collect();
        true
    }

    /// The stop token is never rewarded or penalized.
    fn zero_last_advantage(&mut self) {
        if let Some(last) = self.advantages.last_mut() {
            *last = 0.0;
        }
    }
}

/// Greedy sequence packer.
pub struct SequencePacker {
    config: PackingConfig,
    rng: StdRng,
}

impl SequencePacker {
    /// Create a new sequence packer.
    pub fn new(config: PackingConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed ^ GROUP_ID_STREAM),
            None => StdRng::from_entropy(),
        };
        Self { config, rng }
    }

    /// Pack results into rows.
    pub fn pack(&mut self, results: &[TokenizedResult]) -> Result<PackedTensors> {
        self.pack_with_stats(results).map(|(tensors, _)| tensors)
    }

    /// Pack results into rows and return stats.
    pub fn pack_with_stats(
        &mut self,
        results: &[TokenizedResult],
    ) -> Result<(PackedTensors, PackingStats)> {
        self.config.validate()?;
        for result in results {
            result.validate()?;
        }

        let seq_len = self.config.seq_len;
        let mut stats = PackingStats {
            seq_len,
            ..Default::default()
        };
        let mut rows = vec![RowBuilder::with_capacity(seq_len)];

        for (index, result) in results.iter().enumerate() {
            if result.len() > seq_len && !self.config.truncate_long_results {
                warn!(
                    index,
                    len = result.len(),
                    seq_len,
                    "Result is too long, skipping"
                );
                stats.skipped_too_long += 1;
                continue;
            }
            if result.num_assistant_tokens() == 0 {
                warn!(index, "Result has no completion tokens, skipping");
                stats.skipped_no_completion += 1;
                continue;
            }

            let current = rows.len() - 1;
            let needed = if rows[current].has_prompt(result.prompt_id) {
                result.len() - result.prompt_length.min(result.len())
            } else {
                result.len()
            };
            if !rows[current].is_empty() && rows[current].len() + needed > seq_len {
                debug!(row = current, len = rows[current].len(), "Row full, opening a new one");
                rows.push(RowBuilder::with_capacity(seq_len));
            }

            let open = rows.len() - 1;
            let row = &mut rows[open];
            let effective = if row.has_prompt(result.prompt_id) {
                debug!(index, prompt_id = result.prompt_id, "Prompt already in row");
                stats.deduplicated_prompts += 1;
                Cow::Owned(result.without_prompt())
            } else {
                Cow::Borrowed(result)
            };

            let group_id = draw_group_id(&mut self.rng, row, result.prompt_id);
            row.append(&effective, group_id);
            if self.config.truncate_long_results && row.truncate(seq_len) {
                stats.truncated_results += 1;
            }
            row.zero_last_advantage();
            stats.packed_results += 1;
        }

        stats.num_rows = rows.len();
        stats.total_tokens = rows.iter().map(RowBuilder::len).sum();

        let tensors = self.finish(&rows)?;
        info!("{}", stats.summary());
        Ok((tensors, stats))
    }

    /// Pad, stack, and normalize weights.
    fn finish(&self, rows: &[RowBuilder]) -> Result<PackedTensors> {
        let seq_len = self.config.seq_len;
        let assistant_mask = stack(rows, seq_len, false, |r| &r.assistant_mask)?;
        let mut weights = stack(rows, seq_len, 0.0f32, |r| &r.weights)?;
        normalize_weights(&mut weights, &assistant_mask)?;

        Ok(PackedTensors {
            tokens: stack(rows, seq_len, self.config.pad_token_id, |r| &r.tokens)?,
            group_ids: stack(rows, seq_len, PAD_GROUP_ID, |r| &r.group_ids)?,
            parent_ids: stack(rows, seq_len, PAD_GROUP_ID, |r| &r.parent_ids)?,
            input_pos: stack(rows, seq_len, PAD_INPUT_POS, |r| &r.input_pos)?,
            assistant_mask,
            logprobs: stack(rows, seq_len, f32::NAN, |r| &r.logprobs)?,
            advantages: stack(rows, seq_len, 0.0f32, |r| &r.advantages)?,
            weights,
            deferred: stack(rows, seq_len, false, |r| &r.deferred)?,
        })
    }
}

/// Draw a candidate group id that is not the pad sentinel, not the candidate's
/// own prompt id, and not already written in the row.
fn draw_group_id<R: Rng>(rng: &mut R, row: &RowBuilder, prompt_id: i64) -> i64 {
    loop {
        let id: i64 = rng.gen();
        if id != PAD_GROUP_ID && id != prompt_id && !row.has_prompt(id) {
            return id;
        }
    }
}

/// Pack results with a freshly seeded packer.
pub fn pack_tokenized_results(
    results: &[TokenizedResult],
    seq_len: usize,
    pad_token_id: i64,
    truncate_long_results: bool,
) -> Result<PackedTensors> {
    let config = PackingConfig::with_seq_len(seq_len)
        .pad_token_id(pad_token_id)
        .truncate_long_results(truncate_long_results);
    SequencePacker::new(config).pack(results)
}

/// Right-pad one channel of every row to `seq_len` and stack into a matrix.
fn stack<T, F>(rows: &[RowBuilder], seq_len: usize, pad: T, channel: F) -> Result<Array2<T>>
where
    T: Clone,
    F: Fn(&RowBuilder) -> &Vec<T>,
{
    let mut flat = Vec::with_capacity(rows.len() * seq_len);
    for row in rows {
        let values = channel(row);
        flat.extend_from_slice(values);
        flat.extend(std::iter::repeat(pad.clone()).take(seq_len.saturating_sub(values.len())));
    }
    let actual = flat.len();
    Array2::from_shape_vec((rows.len(), seq_len), flat).map_err(|_| RlPackError::ShapeMismatch {
        expected: vec![rows.len(), seq_len],
        actual: vec![actual],
    })
}

/// Zero unsupervised weights, then divide the rest by their mean.
fn normalize_weights(weights: &mut Array2<f32>, assistant_mask: &Array2<bool>) -> Result<()> {
    let mut sum = 0.0f64;
    let mut count = 0usize;
    for (w, &m) in weights.iter_mut().zip(assistant_mask.iter()) {
        if m {
            sum += f64::from(*w);
            count += 1;
        } else {
            *w = 0.0;
        }
    }
    if count == 0 || sum <= 0.0 {
        return Err(RlPackError::EmptyBatch);
    }

    let mean = sum / count as f64;
    for (w, &m) in weights.iter_mut().zip(assistant_mask.iter()) {
        if m {
            *w = (f64::from(*w) / mean) as f32;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TokenLogprob;

    fn mask(bits: &[u8]) -> Vec<bool> {
        bits.iter().map(|&b| b == 1).collect()
    }

    fn make_result(ids: &[u32], bits: &[u8]) -> TokenizedResult {
        TokenizedResult::new(ids.to_vec(), mask(bits))
    }

    fn packer(seq_len: usize) -> SequencePacker {
        SequencePacker::new(PackingConfig::with_seq_len(seq_len).with_seed(0))
    }

    fn supervised_weight_mean(tensors: &PackedTensors) -> f64 {
        let (sum, count) = tensors
            .weights
            .iter()
            .zip(tensors.assistant_mask.iter())
            .filter(|(_, &m)| m)
            .fold((0.0f64, 0usize), |(s, c), (&w, _)| (s + f64::from(w), c + 1));
        sum / count as f64
    }

    /// Index one past the last non-padding position of a row.
    fn row_len(tensors: &PackedTensors, row: usize) -> usize {
        tensors
            .group_ids
            .row(row)
            .iter()
            .rposition(|&g| g != PAD_GROUP_ID)
            .map_or(0, |i| i + 1)
    }

    #[test]
    fn test_zero_completion_result_dropped() {
        let a = make_result(&[1, 2, 3, 4, 5, 6, 7], &[0, 0, 0, 1, 1, 1, 1]).with_prompt(77, 3);
        let b = make_result(&[1, 2, 3], &[0, 0, 0]).with_prompt(77, 3);

        let (tensors, stats) = packer(10).pack_with_stats(&[a, b]).unwrap();

        assert_eq!(tensors.shape(), (1, 10));
        assert_eq!(stats.skipped_no_completion, 1);
        assert_eq!(stats.packed_results, 1);
        let tokens: Vec<i64> = tensors.tokens.row(0).to_vec();
        assert_eq!(tokens, vec![1, 2, 3, 4, 5, 6, 7, -100, -100, -100]);
        assert_eq!(tensors.num_assistant_tokens(), 4);
    }

    #[test]
    fn test_overflow_opens_new_row() {
        let results: Vec<_> = (0..3)
            .map(|i| make_result(&[10 * i + 1, 10 * i + 2], &[0, 1]))
            .collect();

        let tensors = packer(5).pack(&results).unwrap();

        assert_eq!(tensors.shape(), (2, 5));
        assert_eq!(tensors.tokens.row(0).to_vec(), vec![1, 2, 11, 12, -100]);
        assert_eq!(tensors.tokens.row(1).to_vec(), vec![21, 22, -100, -100, -100]);
        assert_eq!(row_len(&tensors, 0), 4);
        assert_eq!(row_len(&tensors, 1), 2);
    }

    #[test]
    fn test_exact_fit_stays_in_row() {
        let results = vec![
            make_result(&[1, 2, 3], &[0, 1, 1]),
            make_result(&[4, 5], &[0, 1]),
        ];
        let tensors = packer(5).pack(&results).unwrap();
        assert_eq!(tensors.shape(), (1, 5));
        assert_eq!(tensors.tokens.row(0).to_vec(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_all_channels_share_shape() {
        let results = vec![
            make_result(&[1, 2, 3, 4], &[0, 0, 1, 1]),
            make_result(&[5, 6, 7], &[0, 1, 1]),
            make_result(&[8, 9], &[1, 1]),
        ];
        let tensors = packer(6).pack(&results).unwrap();
        assert!(tensors.validate().is_ok());
        assert_eq!(tensors.sequence_length(), 6);
        assert!(tensors.num_sequences() >= 1);
    }

    #[test]
    fn test_padding_sentinels() {
        let result = make_result(&[3, 4], &[0, 1]).with_deferred(true).with_advantage(2.0);
        let tensors = SequencePacker::new(PackingConfig::with_seq_len(4).pad_token_id(0).with_seed(1))
            .pack(&[result])
            .unwrap();

        assert_eq!(tensors.tokens.row(0).to_vec(), vec![3, 4, 0, 0]);
        assert_eq!(tensors.group_ids[[0, 2]], -1);
        assert_eq!(tensors.parent_ids[[0, 3]], -1);
        assert_eq!(tensors.input_pos.row(0).to_vec(), vec![0, 1, 0, 0]);
        assert_eq!(tensors.assistant_mask.row(0).to_vec(), vec![false, true, false, false]);
        assert!(tensors.logprobs.iter().all(|v| v.is_nan()));
        assert_eq!(tensors.advantages.row(0).to_vec(), vec![2.0f32, 0.0, 0.0, 0.0]);
        assert_eq!(tensors.weights.row(0).to_vec(), vec![0.0f32, 1.0, 0.0, 0.0]);
        assert_eq!(tensors.deferred.row(0).to_vec(), vec![true, true, false, false]);
    }

    #[test]
    fn test_weights_normalized_over_supervised_tokens() {
        let results = vec![
            make_result(&[1, 2, 3, 4, 5], &[0, 1, 1, 1, 1]),
            make_result(&[6, 7], &[0, 1]),
            make_result(&[8, 9, 10], &[0, 1, 1]),
        ];
        let tensors = packer(8).pack(&results).unwrap();

        assert!((supervised_weight_mean(&tensors) - 1.0).abs() < 1e-6);
        for (&w, &m) in tensors.weights.iter().zip(tensors.assistant_mask.iter()) {
            if !m {
                assert_eq!(w, 0.0);
            }
        }
        // Every sample carries the same total weight regardless of its length.
        let first: f32 = tensors.weights.row(0).iter().take(5).sum();
        let second: f32 = tensors.weights.row(0).iter().skip(5).take(2).sum();
        assert!((first - second).abs() < 1e-5);
    }

    #[test]
    fn test_last_token_advantage_is_zero() {
        let results = vec![
            make_result(&[1, 2, 3], &[0, 1, 1]).with_advantage(1.5),
            make_result(&[4, 5, 6], &[0, 1, 1]).with_advantage(-0.5),
            make_result(&[7, 8, 9, 10], &[0, 1, 1, 1]).with_advantage(3.0),
        ];
        let tensors = packer(7).pack(&results).unwrap();

        for row in 0..tensors.num_sequences() {
            let last = row_len(&tensors, row) - 1;
            assert_eq!(tensors.advantages[[row, last]], 0.0);
        }
        assert_eq!(tensors.advantages.row(0).to_vec()[..3], [1.5f32, 1.5, 0.0]);
        assert_eq!(tensors.advantages.row(0).to_vec()[3..6], [-0.5f32, -0.5, 0.0]);
    }

    #[test]
    fn test_truncation_clips_to_row_width() {
        let ids: Vec<u32> = (0..13).collect();
        let mut bits = vec![0u8; 3];
        bits.extend(std::iter::repeat(1).take(10));
        let result = make_result(&ids, &bits).with_advantage(1.0);

        let (tensors, stats) = packer(8).pack_with_stats(&[result]).unwrap();

        assert_eq!(tensors.shape(), (1, 8));
        assert_eq!(stats.truncated_results, 1);
        assert_eq!(tensors.tokens.row(0).to_vec(), (0..8).collect::<Vec<i64>>());
        assert_eq!(tensors.input_pos.row(0).to_vec(), (0..8).collect::<Vec<i64>>());
        assert_eq!(tensors.assistant_mask.row(0).iter().filter(|&&m| m).count(), 5);
        assert_eq!(tensors.advantages[[0, 6]], 1.0);
        assert_eq!(tensors.advantages[[0, 7]], 0.0);
    }

    #[test]
    fn test_long_result_dropped_without_truncation() {
        let long = make_result(&[1, 2, 3, 4, 5, 6], &[0, 1, 1, 1, 1, 1]);
        let short = make_result(&[7, 8], &[0, 1]);
        let mut packer = SequencePacker::new(
            PackingConfig::with_seq_len(4)
                .truncate_long_results(false)
                .with_seed(2),
        );

        let (tensors, stats) = packer.pack_with_stats(&[long, short]).unwrap();

        assert_eq!(stats.skipped_too_long, 1);
        assert_eq!(tensors.shape(), (1, 4));
        assert_eq!(tensors.tokens.row(0).to_vec(), vec![7, 8, -100, -100]);
    }

    #[test]
    fn test_shared_prompt_written_once_per_row() {
        let prompt_id = 1234;
        let a = make_result(&[1, 2, 3, 4, 5], &[0, 0, 0, 1, 1]).with_prompt(prompt_id, 3);
        let b = make_result(&[1, 2, 3, 6, 7, 8], &[0, 0, 0, 1, 1, 1]).with_prompt(prompt_id, 3);

        let (tensors, stats) = packer(12).pack_with_stats(&[a, b]).unwrap();

        assert_eq!(stats.deduplicated_prompts, 1);
        assert_eq!(
            tensors.tokens.row(0).to_vec(),
            vec![1, 2, 3, 4, 5, 6, 7, 8, -100, -100, -100, -100]
        );

        let groups = tensors.group_ids.row(0).to_vec();
        assert_eq!(&groups[..3], &[prompt_id; 3]);
        let group_a = groups[3];
        let group_b = groups[5];
        assert_ne!(group_a, prompt_id);
        assert_ne!(group_b, prompt_id);
        assert_ne!(group_a, group_b);
        assert_eq!(&groups[3..5], &[group_a; 2]);
        assert_eq!(&groups[5..8], &[group_b; 3]);

        let parents = tensors.parent_ids.row(0).to_vec();
        assert!(parents[..8].iter().all(|&p| p == prompt_id));

        // Stripped sibling keeps its original positions.
        assert_eq!(tensors.input_pos.row(0).to_vec()[5..8], [3i64, 4, 5]);
    }

    #[test]
    fn test_shared_prompt_repeated_in_new_row() {
        let prompt_id = 99;
        let a = make_result(&[1, 2, 3, 4, 5], &[0, 0, 0, 1, 1]).with_prompt(prompt_id, 3);
        let b = make_result(&[1, 2, 3, 6, 7], &[0, 0, 0, 1, 1]).with_prompt(prompt_id, 3);

        let (tensors, stats) = packer(6).pack_with_stats(&[a, b]).unwrap();

        assert_eq!(stats.deduplicated_prompts, 0);
        assert_eq!(tensors.shape(), (2, 6));
        assert_eq!(tensors.tokens.row(1).to_vec(), vec![1, 2, 3, 6, 7, -100]);
        assert_eq!(&tensors.group_ids.row(1).to_vec()[..3], &[prompt_id; 3]);
    }

    #[test]
    fn test_logprobs_align_to_trailing_assistant_positions() {
        let result = make_result(&[1, 2, 3, 4, 5], &[0, 1, 1, 1, 1]).with_logprobs(vec![
            TokenLogprob::new("c", -0.5),
            TokenLogprob::missing("d"),
            TokenLogprob::new("e", -1.5),
        ]);
        let tensors = packer(6).pack(&[result]).unwrap();
        let row = tensors.logprobs.row(0).to_vec();

        assert!(row[0].is_nan());
        assert!(row[1].is_nan());
        assert_eq!(row[2], -0.5);
        assert!(row[3].is_nan());
        assert_eq!(row[4], -1.5);
        assert!(row[5].is_nan());
    }

    #[test]
    fn test_zero_logprob_is_kept() {
        let result = make_result(&[1, 2, 3], &[0, 1, 1])
            .with_logprobs(vec![TokenLogprob::new("b", 0.0), TokenLogprob::missing("c")]);
        let tensors = packer(3).pack(&[result]).unwrap();
        assert_eq!(tensors.logprobs[[0, 1]], 0.0);
        assert!(tensors.logprobs[[0, 2]].is_nan());
    }

    #[test]
    fn test_logprobs_of_stripped_sibling() {
        let a = make_result(&[1, 2, 4], &[0, 0, 1])
            .with_prompt(5, 2)
            .with_logprobs(vec![TokenLogprob::new("x", -0.1)]);
        let b = make_result(&[1, 2, 6, 7], &[0, 0, 1, 1])
            .with_prompt(5, 2)
            .with_logprobs(vec![TokenLogprob::new("y", -0.2), TokenLogprob::new("z", -0.3)]);
        let tensors = packer(8).pack(&[a, b]).unwrap();
        let row = tensors.logprobs.row(0).to_vec();

        assert_eq!(row[2], -0.1);
        assert_eq!(row[3], -0.2);
        assert_eq!(row[4], -0.3);
    }

    #[test]
    fn test_empty_input_is_empty_batch() {
        let err = packer(4).pack(&[]).unwrap_err();
        assert!(matches!(err, RlPackError::EmptyBatch));
    }

    #[test]
    fn test_all_results_dropped_is_empty_batch() {
        let results = vec![make_result(&[1, 2], &[0, 0])];
        let err = packer(4).pack(&results).unwrap_err();
        assert!(matches!(err, RlPackError::EmptyBatch));
    }

    #[test]
    fn test_mismatched_channels_fail_fast() {
        let bad = TokenizedResult::new(vec![1, 2, 3], mask(&[0, 1, 1])).with_input_pos(vec![0, 1]);
        let err = packer(8).pack(&[bad]).unwrap_err();
        assert!(matches!(err, RlPackError::ChannelLengthMismatch { .. }));
    }

    #[test]
    fn test_seeded_packing_is_deterministic() {
        let results = vec![
            make_result(&[1, 2, 3], &[0, 1, 1]),
            make_result(&[4, 5, 6], &[0, 1, 1]),
        ];
        let a = packer(4).pack(&results).unwrap();
        let b = packer(4).pack(&results).unwrap();
        assert_eq!(a.group_ids, b.group_ids);
        assert_eq!(a.tokens, b.tokens);
    }

    #[test]
    fn test_stats_summary() {
        let results = vec![
            make_result(&[1, 2, 3], &[0, 1, 1]),
            make_result(&[4, 5], &[0, 0]),
        ];
        let (_, stats) = packer(4).pack_with_stats(&results).unwrap();
        assert_eq!(stats.num_rows, 1);
        assert_eq!(stats.total_tokens, 3);
        assert!((stats.efficiency() - 0.75).abs() < 1e-12);
        let summary = stats.summary();
        assert!(summary.contains("1 results"));
        assert!(summary.contains("1 skipped"));
    }

    #[test]
    fn test_pack_tokenized_results_helper() {
        let results = vec![make_result(&[1, 2], &[0, 1])];
        let tensors = pack_tokenized_results(&results, 3, -1, true).unwrap();
        assert_eq!(tensors.tokens.row(0).to_vec(), vec![1, 2, -1]);
    }

    #[test]
    fn test_group_ids_never_reuse_prompt_id_under_shared_seed() {
        let siblings = vec![
            make_result(&[1, 2, 3, 4, 5], &[0, 0, 0, 1, 1]),
            make_result(&[1, 2, 3, 6, 7], &[0, 0, 0, 1, 1]),
        ];
        let grouped = crate::PromptGrouper::new(
            rlpack_core::GroupingConfig::default().without_shuffle(),
            Some(42),
        )
        .group(crate::PromptGroup::new(siblings))
        .unwrap();
        let prompt_id = grouped[0].prompt_id;

        let tensors = SequencePacker::new(PackingConfig::with_seq_len(10).with_seed(42))
            .pack(&grouped)
            .unwrap();

        // [prompt x3][A x2][B x2][PAD x3]
        let group_ids = tensors.group_ids.row(0).to_vec();
        assert!(group_ids[..3].iter().all(|&g| g == prompt_id));
        assert!(group_ids[3..7].iter().all(|&g| g != prompt_id && g != PAD_GROUP_ID));
        assert_ne!(group_ids[3], group_ids[5]);

        let attention = tensors.attention_mask(0).unwrap();
        assert!(attention[[5, 0]]);
        assert!(!attention[[5, 3]]);
        assert!(!attention[[6, 4]]);
    }

    #[test]
    fn test_draw_group_id_skips_taken_ids() {
        let mut row = RowBuilder::with_capacity(4);
        row.append(&make_result(&[1, 2], &[0, 1]).with_prompt(7, 1), 8);
        // Seeded draws are compared against a replay of the same stream.
        let mut rng = StdRng::seed_from_u64(5);
        let mut replay = StdRng::seed_from_u64(5);
        let first: i64 = replay.gen();
        let id = draw_group_id(&mut rng, &row, first);
        assert_ne!(id, first);
        assert_ne!(id, PAD_GROUP_ID);
        assert!(!row.has_prompt(id));
    }
}
