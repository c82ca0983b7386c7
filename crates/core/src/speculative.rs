//! Draft-token proposal for speculative decoding.
//!
//! A [`DraftModel`] proposes a short continuation given the tokens already
//! in a slot's cache plus the token just sampled; the scheduler then decodes
//! the proposal through the target model in one batch and keeps the longest
//! prefix the target sampler agrees with. Proposers are interchangeable: a
//! real draft model sits behind the same trait as the model-free n-gram
//! lookup shipped here.

use serde::{Deserialize, Serialize};

use crate::model::Token;

/// Per-request speculative decoding knobs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SpeculativeParams {
    /// Drafts shorter than this are discarded (not worth a target pass).
    pub n_min: usize,
    /// Maximum draft length requested per step.
    pub n_max: usize,
    /// Minimum proposer confidence for a drafted token.
    pub p_min: f32,
}

impl Default for SpeculativeParams {
    fn default() -> Self {
        Self {
            n_min: 5,
            n_max: 16,
            p_min: 0.9,
        }
    }
}

impl SpeculativeParams {
    pub fn enabled(&self) -> bool {
        self.n_max > 0
    }
}

/// Draft-token source.
///
/// `prompt` is the slot's cache contents (everything already decoded by the
/// target model); `last` is the token sampled this iteration, not yet in the
/// cache. Proposals continue the sequence `prompt + [last]`.
pub trait DraftModel: Send {
    fn gen_draft(&mut self, params: &SpeculativeParams, prompt: &[Token], last: Token)
        -> Vec<Token>;

    fn name(&self) -> &str;
}

// ─── N-gram prompt-lookup proposer ────────────────────────────────────────

/// Model-free proposer: find the most recent earlier occurrence of the
/// n-gram ending at `last` and replay the tokens that followed it.
///
/// Effective on self-repetitive text (code, lists, quoted context) at zero
/// cost; `p_min` has no meaning here and is ignored.
#[derive(Debug, Clone)]
pub struct NGramDraft {
    /// N-gram length used for matching.
    pub n: usize,
}

impl Default for NGramDraft {
    fn default() -> Self {
        Self { n: 3 }
    }
}

impl DraftModel for NGramDraft {
    fn gen_draft(
        &mut self,
        params: &SpeculativeParams,
        prompt: &[Token],
        last: Token,
    ) -> Vec<Token> {
        if params.n_max == 0 {
            return Vec::new();
        }

        let mut haystack = Vec::with_capacity(prompt.len() + 1);
        haystack.extend_from_slice(prompt);
        haystack.push(last);

        let n = self.n.max(1);
        if haystack.len() < n + 1 {
            return Vec::new();
        }
        let needle = &haystack[haystack.len() - n..];

        // scan right to left so the most recent occurrence wins
        let limit = haystack.len() - n;
        for start in (0..limit).rev() {
            if &haystack[start..start + n] == needle {
                let follow = start + n;
                let take = params.n_max.min(haystack.len() - follow);
                if take == 0 {
                    continue;
                }
                return haystack[follow..follow + take].to_vec();
            }
        }

        Vec::new()
    }

    fn name(&self) -> &str {
        "ngram"
    }
}
