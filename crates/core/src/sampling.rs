//! Per-slot token sampling.
//!
//! Each slot owns a [`Sampler`] built from its merged [`SamplerSpec`] when
//! the task launches. The chain applies, in order: logit bias, repetition /
//! frequency / presence penalties over a bounded window, the optional
//! grammar constraint, temperature, then min-p / top-k / top-p / typical-p
//! filtering and a seeded draw. Temperature at or below zero degenerates to
//! argmax.
//!
//! The sampler deliberately works on plain logits slices: the scheduler
//! fetches the row for a batch entry from the backend and hands it over,
//! which keeps sampling testable without a model.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::model::Token;

/// Seed sentinel meaning "draw a fresh random seed per request".
pub const DEFAULT_SEED: u32 = 0xFFFF_FFFF;

/// A candidate token with its post-filter probability.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TokenProb {
    pub token: Token,
    pub prob: f32,
}

/// Grammar-style constraint hooked into the chain.
///
/// Compiled from a grammar string by the backend; the scheduler only ever
/// sees this capability surface.
pub trait Constraint: Send {
    /// Mask disallowed tokens (set their logits to `-inf`).
    fn apply(&mut self, logits: &mut [f32]);
    /// Advance the constraint state past an emitted token.
    fn accept(&mut self, token: Token);
    fn reset(&mut self);
}

/// Sampler capability owned by a slot.
pub trait Sampler: Send {
    /// Sample one token from a logits row. Does not advance sampler state;
    /// callers follow up with [`Sampler::accept`].
    fn sample(&mut self, logits: &[f32]) -> Token;

    /// Record an emitted token: penalty window, grammar state.
    fn accept(&mut self, token: Token, apply_grammar: bool);

    fn reset(&mut self);

    /// The last accepted token, if any.
    fn last(&self) -> Option<Token>;

    /// Top candidates from the most recent `sample` call, for `n_probs`.
    fn candidates(&self) -> &[TokenProb];

    /// The seed actually in use (after sentinel resolution).
    fn seed(&self) -> u32;

    /// Verify a draft against this sampler: sample row 0, then keep sampling
    /// while the draft agrees, accepting as we go. Returns the accepted ids;
    /// the final element is freshly sampled and is *not* yet in the KV, so
    /// the caller re-decodes it on the next iteration.
    fn sample_and_accept_n(&mut self, rows: &[Vec<f32>], draft: &[Token]) -> Vec<Token> {
        debug_assert_eq!(rows.len(), draft.len() + 1);
        let mut accepted = Vec::with_capacity(draft.len() + 1);

        let first = self.sample(&rows[0]);
        self.accept(first, true);
        accepted.push(first);

        for (i, &drafted) in draft.iter().enumerate() {
            if *accepted.last().expect("accepted is non-empty") != drafted {
                break;
            }
            if i + 1 >= rows.len() {
                break;
            }
            let next = self.sample(&rows[i + 1]);
            self.accept(next, true);
            accepted.push(next);
        }

        accepted
    }
}

// ─── Sampler spec ─────────────────────────────────────────────────────────

/// Fully merged sampling parameters for one request: server defaults
/// overlaid with per-request overrides at slot launch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplerSpec {
    pub seed: u32,
    /// Window of recent tokens considered by the penalties.
    pub penalty_last_n: i32,
    pub penalty_repeat: f32,
    pub penalty_freq: f32,
    pub penalty_present: f32,
    pub temperature: f32,
    pub top_k: i32,
    pub top_p: f32,
    pub min_p: f32,
    pub typical_p: f32,
    /// Keep at least this many candidates through the filters. 0 = 1.
    pub min_keep: usize,
    /// Number of top-probability candidates reported per token.
    pub n_probs: usize,
    /// Grammar in GBNF form, compiled by the backend. Empty = unconstrained.
    pub grammar: String,
    pub logit_bias: Vec<(Token, f32)>,
    pub ignore_eos: bool,
}

impl Default for SamplerSpec {
    fn default() -> Self {
        Self {
            seed: DEFAULT_SEED,
            penalty_last_n: 64,
            penalty_repeat: 1.0,
            penalty_freq: 0.0,
            penalty_present: 0.0,
            temperature: 0.8,
            top_k: 40,
            top_p: 0.95,
            min_p: 0.05,
            typical_p: 1.0,
            min_keep: 0,
            n_probs: 0,
            grammar: String::new(),
            logit_bias: Vec::new(),
            ignore_eos: false,
        }
    }
}

impl SamplerSpec {
    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }
}

// ─── Chain sampler ────────────────────────────────────────────────────────

/// Default [`Sampler`] implementation over raw logits.
pub struct ChainSampler {
    spec: SamplerSpec,
    seed_cur: u32,
    rng: StdRng,
    /// Recent accepted tokens, bounded by `penalty_last_n`.
    prev: Vec<Token>,
    constraint: Option<Box<dyn Constraint>>,
    last: Option<Token>,
    candidates: Vec<TokenProb>,
}

impl ChainSampler {
    pub fn new(spec: SamplerSpec, constraint: Option<Box<dyn Constraint>>) -> Self {
        let seed_cur = if spec.seed == DEFAULT_SEED {
            rand::random()
        } else {
            spec.seed
        };
        Self {
            rng: StdRng::seed_from_u64(u64::from(seed_cur)),
            seed_cur,
            prev: Vec::new(),
            constraint,
            last: None,
            candidates: Vec::new(),
            spec,
        }
    }
}

impl Sampler for ChainSampler {
    fn sample(&mut self, logits: &[f32]) -> Token {
        let mut logits = logits.to_vec();

        for &(token, bias) in &self.spec.logit_bias {
            if let Some(l) = logits.get_mut(token as usize) {
                *l += bias;
            }
        }

        let window_start = self
            .prev
            .len()
            .saturating_sub(self.spec.penalty_last_n.max(0) as usize);
        let window = self.prev[window_start..].to_vec();
        if self.spec.penalty_repeat != 1.0 {
            apply_repetition_penalty(&mut logits, &window, self.spec.penalty_repeat);
        }
        if self.spec.penalty_freq != 0.0 || self.spec.penalty_present != 0.0 {
            apply_frequency_presence_penalty(
                &mut logits,
                &window,
                self.spec.penalty_freq,
                self.spec.penalty_present,
            );
        }

        if let Some(constraint) = self.constraint.as_mut() {
            constraint.apply(&mut logits);
        }

        let min_keep = self.spec.min_keep.max(1);

        if self.spec.is_greedy() {
            let token = argmax(&logits);
            if self.spec.n_probs > 0 {
                let probs = softmax(&logits);
                self.candidates = top_candidates(&probs, self.spec.n_probs);
            } else {
                self.candidates.clear();
            }
            return token;
        }

        let inv_temp = 1.0 / self.spec.temperature;
        for l in logits.iter_mut() {
            *l *= inv_temp;
        }

        let mut probs = softmax(&logits);
        if self.spec.min_p > 0.0 {
            apply_min_p(&mut probs, self.spec.min_p, min_keep);
        }
        if self.spec.top_k > 0 && (self.spec.top_k as usize) < probs.len() {
            apply_top_k(&mut probs, (self.spec.top_k as usize).max(min_keep));
        }
        if self.spec.top_p > 0.0 && self.spec.top_p < 1.0 {
            apply_top_p(&mut probs, self.spec.top_p, min_keep);
        }
        if self.spec.typical_p > 0.0 && self.spec.typical_p < 1.0 {
            apply_typical_p(&mut probs, self.spec.typical_p, min_keep);
        }
        renormalize(&mut probs);

        if self.spec.n_probs > 0 {
            self.candidates = top_candidates(&probs, self.spec.n_probs);
        } else {
            self.candidates.clear();
        }

        sample_from_probs(&probs, &mut self.rng)
    }

    fn accept(&mut self, token: Token, apply_grammar: bool) {
        self.prev.push(token);
        let cap = self.spec.penalty_last_n.max(0) as usize;
        if cap > 0 && self.prev.len() > cap {
            let overflow = self.prev.len() - cap;
            self.prev.drain(..overflow);
        }
        self.last = Some(token);
        if apply_grammar {
            if let Some(constraint) = self.constraint.as_mut() {
                constraint.accept(token);
            }
        }
    }

    fn reset(&mut self) {
        self.prev.clear();
        self.last = None;
        self.candidates.clear();
        if let Some(constraint) = self.constraint.as_mut() {
            constraint.reset();
        }
    }

    fn last(&self) -> Option<Token> {
        self.last
    }

    fn candidates(&self) -> &[TokenProb] {
        &self.candidates
    }

    fn seed(&self) -> u32 {
        self.seed_cur
    }
}

// ─── Logit / probability transforms ───────────────────────────────────────

fn argmax(logits: &[f32]) -> Token {
    let mut best = 0usize;
    for (i, &l) in logits.iter().enumerate() {
        if l > logits[best] {
            best = i;
        }
    }
    best as Token
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut probs: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
    let sum: f32 = probs.iter().sum();
    if sum > 0.0 {
        for p in probs.iter_mut() {
            *p /= sum;
        }
    }
    probs
}

fn apply_repetition_penalty(logits: &mut [f32], window: &[Token], penalty: f32) {
    for &token in window {
        if let Some(l) = logits.get_mut(token as usize) {
            if *l > 0.0 {
                *l /= penalty;
            } else {
                *l *= penalty;
            }
        }
    }
}

fn apply_frequency_presence_penalty(
    logits: &mut [f32],
    window: &[Token],
    freq_penalty: f32,
    present_penalty: f32,
) {
    let mut counts: std::collections::HashMap<Token, usize> = std::collections::HashMap::new();
    for &token in window {
        *counts.entry(token).or_insert(0) += 1;
    }
    for (&token, &count) in &counts {
        if let Some(l) = logits.get_mut(token as usize) {
            *l -= count as f32 * freq_penalty + present_penalty;
        }
    }
}

fn apply_min_p(probs: &mut [f32], min_p: f32, min_keep: usize) {
    let max = probs.iter().copied().fold(0.0f32, f32::max);
    let threshold = min_p * max;
    let surviving = probs.iter().filter(|&&p| p >= threshold).count();
    if surviving < min_keep {
        return;
    }
    for p in probs.iter_mut() {
        if *p < threshold {
            *p = 0.0;
        }
    }
}

fn apply_top_k(probs: &mut [f32], k: usize) {
    if k >= probs.len() {
        return;
    }
    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_unstable_by(|&a, &b| {
        probs[b]
            .partial_cmp(&probs[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    for &i in &order[k..] {
        probs[i] = 0.0;
    }
}

fn apply_top_p(probs: &mut [f32], top_p: f32, min_keep: usize) {
    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_unstable_by(|&a, &b| {
        probs[b]
            .partial_cmp(&probs[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut cumulative = 0.0f32;
    let mut kept = 0usize;
    for &i in &order {
        cumulative += probs[i];
        kept += 1;
        if cumulative >= top_p && kept >= min_keep {
            break;
        }
    }
    for &i in &order[kept..] {
        probs[i] = 0.0;
    }
}

/// Locally typical sampling: keep tokens whose information content is close
/// to the distribution's entropy, accumulating mass until `typical_p`.
fn apply_typical_p(probs: &mut [f32], typical_p: f32, min_keep: usize) {
    let entropy: f32 = probs
        .iter()
        .filter(|&&p| p > 0.0)
        .map(|&p| -p * p.ln())
        .sum();

    let mut order: Vec<usize> = (0..probs.len()).filter(|&i| probs[i] > 0.0).collect();
    order.sort_unstable_by(|&a, &b| {
        let da = (-probs[a].ln() - entropy).abs();
        let db = (-probs[b].ln() - entropy).abs();
        da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut cumulative = 0.0f32;
    let mut kept = 0usize;
    for &i in &order {
        cumulative += probs[i];
        kept += 1;
        if cumulative >= typical_p && kept >= min_keep {
            break;
        }
    }
    let dropped: Vec<usize> = order[kept..].to_vec();
    for i in dropped {
        probs[i] = 0.0;
    }
}

fn renormalize(probs: &mut [f32]) {
    let sum: f32 = probs.iter().sum();
    if sum > 0.0 {
        for p in probs.iter_mut() {
            *p /= sum;
        }
    }
}

fn top_candidates(probs: &[f32], n: usize) -> Vec<TokenProb> {
    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_unstable_by(|&a, &b| {
        probs[b]
            .partial_cmp(&probs[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    order
        .into_iter()
        .take(n)
        .map(|i| TokenProb {
            token: i as Token,
            prob: probs[i],
        })
        .collect()
}

fn sample_from_probs(probs: &[f32], rng: &mut StdRng) -> Token {
    let total: f32 = probs.iter().sum();
    if total <= 0.0 {
        return argmax(probs);
    }
    let mut draw = rng.gen::<f32>() * total;
    for (i, &p) in probs.iter().enumerate() {
        draw -= p;
        if draw <= 0.0 {
            return i as Token;
        }
    }
    (probs.len() - 1) as Token
}

#[cfg(test)]
mod tests {
    use super::*;

    fn greedy_spec() -> SamplerSpec {
        SamplerSpec {
            temperature: 0.0,
            seed: 42,
            ..SamplerSpec::default()
        }
    }

    #[test]
    fn greedy_picks_argmax() {
        let mut sampler = ChainSampler::new(greedy_spec(), None);
        let logits = vec![-1.0, 3.0, 0.5, 2.9];
        assert_eq!(sampler.sample(&logits), 1);
    }

    #[test]
    fn seeded_sampling_is_deterministic() {
        let spec = SamplerSpec {
            temperature: 1.0,
            seed: 7,
            top_k: 0,
            top_p: 1.0,
            min_p: 0.0,
            ..SamplerSpec::default()
        };
        let logits = vec![1.0, 1.1, 0.9, 1.05];
        let mut a = ChainSampler::new(spec.clone(), None);
        let mut b = ChainSampler::new(spec, None);
        for _ in 0..16 {
            assert_eq!(a.sample(&logits), b.sample(&logits));
        }
    }

    #[test]
    fn default_seed_is_resolved() {
        let sampler = ChainSampler::new(SamplerSpec::default(), None);
        assert_ne!(sampler.seed(), DEFAULT_SEED);
    }

    #[test]
    fn logit_bias_can_force_a_token() {
        let spec = SamplerSpec {
            temperature: 0.0,
            logit_bias: vec![(2, 100.0)],
            ..SamplerSpec::default()
        };
        let mut sampler = ChainSampler::new(spec, None);
        assert_eq!(sampler.sample(&[5.0, 4.0, 1.0]), 2);
    }

    #[test]
    fn repetition_penalty_discourages_repeats() {
        let spec = SamplerSpec {
            temperature: 0.0,
            penalty_repeat: 10.0,
            ..SamplerSpec::default()
        };
        let mut sampler = ChainSampler::new(spec, None);
        let logits = vec![2.0, 1.9];
        assert_eq!(sampler.sample(&logits), 0);
        sampler.accept(0, true);
        // token 0 now penalized below token 1
        assert_eq!(sampler.sample(&logits), 1);
    }

    #[test]
    fn penalty_window_is_bounded() {
        let spec = SamplerSpec {
            temperature: 0.0,
            penalty_last_n: 2,
            penalty_repeat: 10.0,
            ..SamplerSpec::default()
        };
        let mut sampler = ChainSampler::new(spec, None);
        sampler.accept(0, true);
        sampler.accept(1, true);
        sampler.accept(2, true);
        // token 0 fell out of the window, so it is unpenalized again
        assert_eq!(sampler.sample(&[2.0, 1.9, 1.8]), 0);
    }

    #[test]
    fn candidates_report_top_probs() {
        let spec = SamplerSpec {
            temperature: 0.0,
            n_probs: 2,
            ..SamplerSpec::default()
        };
        let mut sampler = ChainSampler::new(spec, None);
        sampler.sample(&[0.0, 5.0, 1.0]);
        let candidates = sampler.candidates();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].token, 1);
        assert!(candidates[0].prob > candidates[1].prob);
    }

    #[test]
    fn top_k_masks_tail() {
        let mut probs = vec![0.5, 0.3, 0.15, 0.05];
        apply_top_k(&mut probs, 2);
        assert_eq!(probs[2], 0.0);
        assert_eq!(probs[3], 0.0);
        assert!(probs[0] > 0.0 && probs[1] > 0.0);
    }

    #[test]
    fn top_p_keeps_nucleus() {
        let mut probs = vec![0.6, 0.3, 0.08, 0.02];
        apply_top_p(&mut probs, 0.85, 1);
        assert!(probs[0] > 0.0 && probs[1] > 0.0);
        assert_eq!(probs[2], 0.0);
        assert_eq!(probs[3], 0.0);
    }

    #[test]
    fn min_keep_overrides_min_p() {
        let mut probs = vec![0.98, 0.01, 0.005, 0.005];
        // threshold would kill everything but index 0, min_keep forbids that
        apply_min_p(&mut probs, 0.5, 3);
        assert!(probs.iter().filter(|&&p| p > 0.0).count() >= 3);
    }

    struct EvenOnly;
    impl Constraint for EvenOnly {
        fn apply(&mut self, logits: &mut [f32]) {
            for (i, l) in logits.iter_mut().enumerate() {
                if i % 2 != 0 {
                    *l = f32::NEG_INFINITY;
                }
            }
        }
        fn accept(&mut self, _token: Token) {}
        fn reset(&mut self) {}
    }

    #[test]
    fn constraint_masks_tokens() {
        let mut sampler = ChainSampler::new(greedy_spec(), Some(Box::new(EvenOnly)));
        // best unmasked token is 2 even though 1 has the highest logit
        assert_eq!(sampler.sample(&[0.0, 9.0, 5.0, 8.0]), 2);
    }

    #[test]
    fn sample_and_accept_n_stops_at_first_disagreement() {
        // Greedy sampler over scripted rows: row i argmax = i + 10.
        let row = |winner: usize| {
            let mut r = vec![0.0f32; 16];
            r[winner] = 10.0;
            r
        };
        let mut sampler = ChainSampler::new(greedy_spec(), None);
        let rows = vec![row(10), row(11), row(12), row(13)];
        // draft agrees for two tokens then diverges
        let draft = vec![10, 11, 7];
        let accepted = sampler.sample_and_accept_n(&rows, &draft);
        assert_eq!(accepted, vec![10, 11, 12]);
        assert_eq!(Sampler::last(&sampler), Some(12));
    }

    #[test]
    fn sample_and_accept_n_full_agreement() {
        let row = |winner: usize| {
            let mut r = vec![0.0f32; 16];
            r[winner] = 10.0;
            r
        };
        let mut sampler = ChainSampler::new(greedy_spec(), None);
        let rows = vec![row(1), row(2), row(3)];
        let accepted = sampler.sample_and_accept_n(&rows, &[1, 2]);
        assert_eq!(accepted, vec![1, 2, 3]);
    }
}
