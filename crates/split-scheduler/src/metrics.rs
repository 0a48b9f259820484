//! Per-session phase timing.
//!
//! Phase boundaries are observed, not estimated: prefill starts with the
//! first step, the first token exists once the prefill pass completes its
//! last layer, and decode runs from there to the last committed step.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use split_types::wire::SessionSummary;

#[derive(Debug, Clone)]
pub struct PhaseClock {
    created: Instant,
    prefill_started: Option<Instant>,
    first_token: Option<Instant>,
    last_step: Option<Instant>,
    prompt_tokens: u32,
}

impl PhaseClock {
    pub fn start() -> Self {
        Self {
            created: Instant::now(),
            prefill_started: None,
            first_token: None,
            last_step: None,
            prompt_tokens: 0,
        }
    }

    pub fn mark_prefill(&mut self, prompt_tokens: u32) {
        if self.prefill_started.is_none() {
            self.prefill_started = Some(Instant::now());
            self.prompt_tokens = prompt_tokens;
        }
    }

    pub fn mark_first_token(&mut self) {
        if self.first_token.is_none() {
            self.first_token = Some(Instant::now());
        }
    }

    pub fn mark_step(&mut self) {
        self.last_step = Some(Instant::now());
    }

    pub fn prompt_tokens(&self) -> u32 {
        self.prompt_tokens
    }

    /// Fill timing and throughput fields of `summary` for `passes` completed
    /// layer passes (each pass yields one token).
    pub fn fill(&self, summary: &mut SessionSummary, passes: u32, expert_selections: BTreeMap<u32, u64>) {
        let span = |from: Option<Instant>, to: Option<Instant>| match (from, to) {
            (Some(a), Some(b)) if b >= a => b - a,
            _ => Duration::ZERO,
        };

        let prefill = span(self.prefill_started, self.first_token.or(self.last_step));
        let decode = span(self.first_token, self.last_step);
        let total = span(self.prefill_started, self.last_step);
        let ttft = span(Some(self.created), self.first_token);

        summary.prompt_tokens = self.prompt_tokens;
        summary.generated_tokens = passes;
        summary.prefill_time_s = prefill.as_secs_f64();
        summary.decode_time_s = decode.as_secs_f64();
        summary.total_time_s = total.as_secs_f64();
        summary.time_to_first_token_s = ttft.as_secs_f64();

        let rate = |n: f64, d: Duration| if d.is_zero() { 0.0 } else { n / d.as_secs_f64() };
        summary.tokens_per_second = rate(f64::from(self.prompt_tokens + passes), total);
        summary.prefill_tokens_per_second = rate(f64::from(self.prompt_tokens), prefill);
        summary.decode_tokens_per_second = rate(f64::from(passes.saturating_sub(1)), decode);
        summary.expert_selections = expert_selections;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
