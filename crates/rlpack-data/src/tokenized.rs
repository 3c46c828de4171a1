//! Tokenized candidate completions.
//!
//! A [`TokenizedResult`] is one sampled completion for one prompt, already run
//! through a chat template and tokenizer. The tokenizer itself lives outside
//! this crate; results arrive here either constructed in code or deserialized
//! from JSON.

use rlpack_core::{Result, RlPackError};
use serde::{de, Deserialize, Deserializer, Serialize};

/// A single message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Role: "system", "user", or "assistant"
    pub role: String,
    /// Content of the message
    pub content: String,
}

/// Sampling log-probability of one completion token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenLogprob {
    /// Decoded token text, if known.
    #[serde(default)]
    pub token: String,
    /// Log-probability; `None` when the sampler did not report one.
    #[serde(default)]
    pub logprob: Option<f64>,
}

impl TokenLogprob {
    /// Create a record with a known log-probability.
    pub fn new(token: impl Into<String>, logprob: f64) -> Self {
        Self {
            token: token.into(),
            logprob: Some(logprob),
        }
    }

    /// Create a record whose log-probability is unknown.
    pub fn missing(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            logprob: None,
        }
    }
}

/// One tokenized candidate completion for one prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenizedResult {
    /// Conversation the tokens were rendered from.
    #[serde(default)]
    pub conversation: Vec<Message>,
    /// Scalar reward for this candidate.
    #[serde(default)]
    pub reward: f64,
    /// Advantage relative to the sibling group.
    #[serde(default)]
    pub advantage: f64,
    /// Whether the downstream loss should defer this sample.
    #[serde(default)]
    pub deferred: bool,
    /// Chat template used for rendering.
    #[serde(default)]
    pub chat_template: String,
    /// Rendered chat text.
    #[serde(default)]
    pub chat: String,
    /// Decoded text of each token.
    #[serde(default)]
    pub tokens: Vec<String>,
    /// Token ids.
    pub token_ids: Vec<u32>,
    /// Position index of each token.
    pub input_pos: Vec<u32>,
    /// True where the token belongs to the model's own completion.
    #[serde(deserialize_with = "deserialize_flags")]
    pub assistant_mask: Vec<bool>,
    /// Log-probabilities aligned to the trailing assistant positions.
    #[serde(default)]
    pub token_logprobs: Option<Vec<TokenLogprob>>,
    /// Id shared by every candidate sampled from the same prompt.
    #[serde(default)]
    pub prompt_id: i64,
    /// Length of the prefix shared by every candidate of the prompt.
    #[serde(default)]
    pub prompt_length: usize,
}

impl TokenizedResult {
    /// Create a result with positions `0..len` and no auxiliary data.
    pub fn new(token_ids: Vec<u32>, assistant_mask: Vec<bool>) -> Self {
        let input_pos = (0..token_ids.len() as u32).collect();
        Self {
            conversation: Vec::new(),
            reward: 0.0,
            advantage: 0.0,
            deferred: false,
            chat_template: String::new(),
            chat: String::new(),
            tokens: Vec::new(),
            token_ids,
            input_pos,
            assistant_mask,
            token_logprobs: None,
            prompt_id: 0,
            prompt_length: 0,
        }
    }

    /// Set the reward.
    pub fn with_reward(mut self, reward: f64) -> Self {
        self.reward = reward;
        self
    }

    /// Set the advantage.
    pub fn with_advantage(mut self, advantage: f64) -> Self {
        self.advantage = advantage;
        self
    }

    /// Set the deferred flag.
    pub fn with_deferred(mut self, deferred: bool) -> Self {
        self.deferred = deferred;
        self
    }

    /// Replace the position indices.
    pub fn with_input_pos(mut self, input_pos: Vec<u32>) -> Self {
        self.input_pos = input_pos;
        self
    }

    /// Attach per-token log-probabilities.
    pub fn with_logprobs(mut self, logprobs: Vec<TokenLogprob>) -> Self {
        self.token_logprobs = Some(logprobs);
        self
    }

    /// Set the shared prompt id and prefix length.
    pub fn with_prompt(mut self, prompt_id: i64, prompt_length: usize) -> Self {
        self.prompt_id = prompt_id;
        self.prompt_length = prompt_length;
        self
    }

    /// Number of tokens.
    pub fn len(&self) -> usize {
        self.token_ids.len()
    }

    /// Whether there are no tokens.
    pub fn is_empty(&self) -> bool {
        self.token_ids.is_empty()
    }

    /// Number of supervised positions.
    pub fn num_assistant_tokens(&self) -> usize {
        self.assistant_mask.iter().filter(|&&m| m).count()
    }

    /// Check that the per-token channels agree in length.
    pub fn validate(&self) -> Result<()> {
        let len = self.token_ids.len();
        if self.input_pos.len() != len || self.assistant_mask.len() != len {
            return Err(RlPackError::ChannelLengthMismatch {
                token_ids: len,
                input_pos: self.input_pos.len(),
                assistant_mask: self.assistant_mask.len(),
            });
        }
        Ok(())
    }

    /// Derive a result with the shared prompt prefix stripped.
    ///
    /// Log-probabilities stay aligned to the trailing assistant positions, so
    /// only as many trailing entries are kept as the stripped mask has
    /// supervised positions.
    pub fn without_prompt(&self) -> Self {
        let start = self.prompt_length.min(self.token_ids.len());
        let assistant_mask = self.assistant_mask[start.min(self.assistant_mask.len())..].to_vec();
        let remaining = assistant_mask.iter().filter(|&&m| m).count();
        let token_logprobs = self.token_logprobs.as_ref().map(|logprobs| {
            logprobs[logprobs.len().saturating_sub(remaining)..].to_vec()
        });

        Self {
            conversation: self.conversation.clone(),
            reward: self.reward,
            advantage: self.advantage,
            deferred: self.deferred,
            chat_template: self.chat_template.clone(),
            chat: self.chat.clone(),
            tokens: self.tokens.get(start..).map(<[String]>::to_vec).unwrap_or_default(),
            token_ids: self.token_ids[start..].to_vec(),
            input_pos: self.input_pos[start.min(self.input_pos.len())..].to_vec(),
            assistant_mask,
            token_logprobs,
            prompt_id: self.prompt_id,
            prompt_length: 0,
        }
    }
}

/// Accept an assistant mask written either as booleans or as 0/1 integers.
fn deserialize_flags<'de, D>(deserializer: D) -> std::result::Result<Vec<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(u64),
    }

    Vec::<Flag>::deserialize(deserializer)?
        .into_iter()
        .map(|flag| match flag {
            Flag::Bool(b) => Ok(b),
            Flag::Int(0) => Ok(false),
            Flag::Int(1) => Ok(true),
            Flag::Int(n) => Err(de::Error::custom(format!(
                "assistant mask entries must be 0 or 1, got {n}"
            ))),
        })
        .collect()
}
