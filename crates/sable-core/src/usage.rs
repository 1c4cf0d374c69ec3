use serde::{Deserialize, Serialize};

/// Latest-known usage snapshot for one stream. Providers report cumulative
/// totals per chunk, so this is a replace-on-update accumulator, never a sum.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageInfo {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_read_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_write_tokens: Option<u64>,
}

/// What a chunk parser extracts from a single segment. Every field is
/// optional: a chunk may carry any subset of the counters.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageUpdate {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub reasoning_tokens: Option<u64>,
    pub cache_read_tokens: Option<u64>,
    pub cache_write_tokens: Option<u64>,
}

impl UsageInfo {
    /// Fold an update into the accumulator.
    ///
    /// Required counters keep their previous value when the update omits
    /// them. The optional counters (reasoning, cache) are taken from the
    /// update verbatim, even when absent: providers restate the full set of
    /// optional counters on every usage-bearing chunk, so an absent field
    /// means "none", not "unchanged".
    pub fn apply(&mut self, update: &UsageUpdate) {
        if let Some(input) = update.input_tokens {
            self.input_tokens = input;
        }
        if let Some(output) = update.output_tokens {
            self.output_tokens = output;
        }
        self.reasoning_tokens = update.reasoning_tokens;
        self.cache_read_tokens = update.cache_read_tokens;
        self.cache_write_tokens = update.cache_write_tokens;
    }

    /// Merge an update into an accumulator that may not exist yet.
    pub fn merge(existing: Option<UsageInfo>, update: &UsageUpdate) -> UsageInfo {
        match existing {
            Some(mut info) => {
                info.apply(update);
                info
            }
            None => UsageInfo {
                input_tokens: update.input_tokens.unwrap_or(0),
                output_tokens: update.output_tokens.unwrap_or(0),
                reasoning_tokens: update.reasoning_tokens,
                cache_read_tokens: update.cache_read_tokens,
                cache_write_tokens: update.cache_write_tokens,
            },
        }
    }

    /// Total context-consuming tokens for overflow decisions:
    /// input + cache reads + output.
    pub fn context_total(&self) -> u64 {
        self.input_tokens + self.cache_read_tokens.unwrap_or(0) + self.output_tokens
    }
}

impl UsageUpdate {
    pub fn is_empty(&self) -> bool {
        self.input_tokens.is_none()
            && self.output_tokens.is_none()
            && self.reasoning_tokens.is_none()
            && self.cache_read_tokens.is_none()
            && self.cache_write_tokens.is_none()
    }
}
