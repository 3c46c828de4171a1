//! Grouped causal attention masks for packed rows.
//!
//! A packed row interleaves several prompts and their sibling completions.
//! Token `i` may attend to an earlier token `j` when both belong to the same
//! group, or when `j` belongs to the prompt that `i` descends from:
//!
//! ```text
//! allowed[i][j] = j <= i && (group_ids[i] == group_ids[j] || parent_ids[i] == group_ids[j])
//! ```
//!
//! Completions therefore see their own tokens and their prompt, but never a
//! sibling completion, even though siblings sit side by side in the row.

use ndarray::Array2;

/// Build a boolean `[n, n]` mask, `true` where attention is allowed.
///
/// # Panics
/// Panics if the two slices differ in length.
pub fn grouped_causal_mask(group_ids: &[i64], parent_ids: &[i64]) -> Array2<bool> {
    assert_eq!(
        group_ids.len(),
        parent_ids.len(),
        "group_ids and parent_ids must be the same length"
    );
    let n = group_ids.len();
    Array2::from_shape_fn((n, n), |(i, j)| {
        j <= i && (group_ids[i] == group_ids[j] || parent_ids[i] == group_ids[j])
    })
}
