//! Prompt grouping for sibling completions.
//!
//! Every completion sampled from one prompt shares a prefix of tokens (the
//! rendered prompt). Grouping detects that prefix, stamps all siblings with a
//! shared random prompt id, and clears the assistant mask over the prefix so
//! prompt tokens are never supervised. The packer later uses the prompt id to
//! write the prefix once per row.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rlpack_core::{AdvantageNormalization, GroupingConfig, Result};
use serde::{Deserialize, Serialize};

use crate::TokenizedResult;

/// All candidate completions sampled from one prompt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptGroup {
    /// Sibling completions.
    pub completions: Vec<TokenizedResult>,
}

impl PromptGroup {
    /// Create a group from its completions.
    pub fn new(completions: Vec<TokenizedResult>) -> Self {
        Self { completions }
    }

    /// Number of completions.
    pub fn len(&self) -> usize {
        self.completions.len()
    }

    /// Whether the group has no completions.
    pub fn is_empty(&self) -> bool {
        self.completions.is_empty()
    }
}

/// Length of the longest token prefix shared by every result at once.
///
/// Returns 0 for an empty slice.
pub fn common_prefix_length(results: &[TokenizedResult]) -> usize {
    let Some((first, rest)) = results.split_first() else {
        return 0;
    };
    first
        .token_ids
        .iter()
        .enumerate()
        .take_while(|&(k, id)| rest.iter().all(|r| r.token_ids.get(k) == Some(id)))
        .count()
}

/// Compute advantages from sibling rewards.
///
/// With [`AdvantageNormalization::Group`] the baseline is the group mean and,
/// when `whiten` is set, the result is divided by the group standard deviation
/// (floored at 1e-8).
pub fn compute_group_advantages(
    rewards: &[f64],
    norm: AdvantageNormalization,
    whiten: bool,
) -> Vec<f64> {
    if rewards.is_empty() {
        return Vec::new();
    }
    match norm {
        AdvantageNormalization::None => rewards.to_vec(),
        AdvantageNormalization::Group => {
            let n = rewards.len() as f64;
            let baseline = rewards.iter().sum::<f64>() / n;
            let std = if whiten {
                let var = rewards.iter().map(|r| (r - baseline).powi(2)).sum::<f64>() / n;
                var.sqrt().max(1e-8)
            } else {
                1.0
            };
            rewards.iter().map(|r| (r - baseline) / std).collect()
        }
    }
}

/// Assigns prompt ids and prompt lengths to sibling completions.
pub struct PromptGrouper {
    config: GroupingConfig,
    rng: StdRng,
}

impl PromptGrouper {
    /// Create a grouper. `seed` fixes shuffling and id draws.
    pub fn new(config: GroupingConfig, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { config, rng }
    }

    /// Group the siblings of a single prompt.
    pub fn group(&mut self, group: PromptGroup) -> Result<Vec<TokenizedResult>> {
        let mut results = group.completions;
        group_siblings(&mut results, &self.config, &mut self.rng)?;
        Ok(results)
    }

    /// Group each prompt independently and concatenate the results in order.
    pub fn group_all(&mut self, groups: Vec<PromptGroup>) -> Result<Vec<TokenizedResult>> {
        group_prompts(groups, &self.config, &mut self.rng)
    }
}

/// Group many prompts independently, concatenating results in group order.
pub fn group_prompts<R: Rng>(
    groups: Vec<PromptGroup>,
    config: &GroupingConfig,
    rng: &mut R,
) -> Result<Vec<TokenizedResult>> {
    let mut out = Vec::with_capacity(groups.iter().map(PromptGroup::len).sum());
    for group in groups {
        let mut results = group.completions;
        group_siblings(&mut results, config, rng)?;
        out.extend(results);
    }
    Ok(out)
}

/// Group siblings in place and return the prompt id drawn for them.
///
/// Siblings are shuffled (if configured), the shared prefix length is computed
/// over all of them simultaneously, and the assistant mask is cleared over
/// that prefix.
pub fn group_siblings<R: Rng>(
    results: &mut [TokenizedResult],
    config: &GroupingConfig,
    rng: &mut R,
) -> Result<i64> {
    for result in results.iter() {
        result.validate()?;
    }

    if config.shuffle {
        results.shuffle(rng);
    }

    if config.overwrite_advantages {
        let rewards: Vec<f64> = results.iter().map(|r| r.reward).collect();
        let advantages =
            compute_group_advantages(&rewards, config.advantage_norm, config.whiten_advantages);
        for (result, advantage) in results.iter_mut().zip(advantages) {
            result.advantage = advantage;
        }
    }

    let prompt_id: i64 = rng.gen();
    let prompt_length = common_prefix_length(results);
    for result in results.iter_mut() {
        result.prompt_id = prompt_id;
        result.prompt_length = prompt_length;
        result.assistant_mask[..prompt_length].fill(false);
    }

    tracing::debug!(
        siblings = results.len(),
        prompt_length,
        "Grouped prompt siblings"
    );

    Ok(prompt_id)
}
