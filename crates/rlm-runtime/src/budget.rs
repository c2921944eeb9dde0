// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-execution budget accounting.
//!
//! The tracker lives in worker memory but its consumed counters are
//! snapshotted into `state._budgets` every turn, so a restarted worker
//! reconstructs it from state and consumed budgets survive failover. The
//! start instant is shifted backwards by the previously consumed seconds so
//! `elapsed_seconds` keeps counting from where the old worker stopped.

use rlm_core::{Budgets, BudgetsConsumed, JsonValue};
use serde_json::json;
use std::time::Instant;

/// Budget tracker for one execution run.
#[derive(Debug, Clone)]
pub struct BudgetTracker {
    budgets: Option<Budgets>,
    start: Instant,
    consumed_offset_seconds: u64,
    turns: u32,
    llm_subcalls: u32,
    total_prompt_chars: u64,
}

impl BudgetTracker {
    /// Fresh tracker with zero consumption.
    #[must_use]
    pub fn new(budgets: Option<Budgets>) -> Self {
        Self {
            budgets,
            start: Instant::now(),
            consumed_offset_seconds: 0,
            turns: 0,
            llm_subcalls: 0,
            total_prompt_chars: 0,
        }
    }

    /// Reconstruct a tracker from `state._budgets.consumed`.
    #[must_use]
    pub fn from_state(state: Option<&JsonValue>, budgets: Option<Budgets>) -> Self {
        let mut tracker = Self::new(budgets);
        let Some(consumed) = state
            .and_then(|value| value.get("_budgets"))
            .and_then(|value| value.get("consumed"))
        else {
            return tracker;
        };
        tracker.turns = consumed
            .get("turns")
            .and_then(JsonValue::as_u64)
            .unwrap_or(0) as u32;
        tracker.llm_subcalls = consumed
            .get("llm_subcalls")
            .and_then(JsonValue::as_u64)
            .unwrap_or(0) as u32;
        tracker.total_prompt_chars = consumed
            .get("total_prompt_chars")
            .and_then(JsonValue::as_u64)
            .unwrap_or(0);
        tracker.consumed_offset_seconds = consumed
            .get("total_seconds")
            .and_then(JsonValue::as_u64)
            .unwrap_or(0);
        tracker
    }

    /// Wall-clock seconds consumed, including pre-failover consumption.
    #[must_use]
    pub fn elapsed_seconds(&self) -> u64 {
        self.consumed_offset_seconds + self.start.elapsed().as_secs()
    }

    /// Turns consumed.
    #[must_use]
    pub fn turns(&self) -> u32 {
        self.turns
    }

    /// Sub-calls consumed.
    #[must_use]
    pub fn llm_subcalls(&self) -> u32 {
        self.llm_subcalls
    }

    /// `true` when the turn budget is spent.
    #[must_use]
    pub fn over_max_turns(&self) -> bool {
        self.budgets
            .as_ref()
            .and_then(|b| b.max_turns)
            .is_some_and(|max| self.turns >= max)
    }

    /// `true` when the total wall-clock budget is spent.
    #[must_use]
    pub fn over_total_seconds(&self) -> bool {
        self.budgets
            .as_ref()
            .and_then(|b| b.max_total_seconds)
            .is_some_and(|max| self.elapsed_seconds() > max)
    }

    /// Can a prompt of this length be sent?
    #[must_use]
    pub fn can_accept_prompt(&self, prompt_chars: u64) -> bool {
        let Some(budgets) = &self.budgets else {
            return true;
        };
        if budgets
            .max_llm_prompt_chars
            .is_some_and(|max| prompt_chars > max)
        {
            return false;
        }
        !budgets
            .max_total_llm_prompt_chars
            .is_some_and(|max| self.total_prompt_chars + prompt_chars > max)
    }

    /// Can `count` more sub-calls be dispatched?
    #[must_use]
    pub fn can_accept_subcalls(&self, count: u32) -> bool {
        self.budgets
            .as_ref()
            .and_then(|b| b.max_llm_subcalls)
            .is_none_or(|max| self.llm_subcalls + count <= max)
    }

    /// Record a sent prompt.
    pub fn record_prompt(&mut self, prompt_chars: u64) {
        self.total_prompt_chars += prompt_chars;
    }

    /// Record dispatched sub-calls.
    pub fn record_subcalls(&mut self, count: u32) {
        self.llm_subcalls += count;
    }

    /// Record a completed turn.
    pub fn record_turn(&mut self) {
        self.turns += 1;
    }

    /// The `_budgets` snapshot written into state, or `None` when the
    /// execution is unbudgeted.
    #[must_use]
    pub fn snapshot(&self) -> Option<JsonValue> {
        let budgets = self.budgets.as_ref()?;
        let limits = serde_json::to_value(budgets).expect("budgets serialize");
        let consumed = json!({
            "turns": self.turns,
            "llm_subcalls": self.llm_subcalls,
            "total_seconds": self.elapsed_seconds(),
            "total_prompt_chars": self.total_prompt_chars,
        });
        let mut remaining = serde_json::Map::new();
        if let Some(max) = budgets.max_turns {
            remaining.insert("turns".into(), max.saturating_sub(self.turns).into());
        }
        if let Some(max) = budgets.max_llm_subcalls {
            remaining.insert(
                "llm_subcalls".into(),
                max.saturating_sub(self.llm_subcalls).into(),
            );
        }
        if let Some(max) = budgets.max_total_seconds {
            remaining.insert(
                "total_seconds".into(),
                max.saturating_sub(self.elapsed_seconds()).into(),
            );
        }
        if let Some(max) = budgets.max_total_llm_prompt_chars {
            remaining.insert(
                "total_prompt_chars".into(),
                max.saturating_sub(self.total_prompt_chars).into(),
            );
        }
        Some(json!({
            "limits": limits,
            "consumed": consumed,
            "remaining": remaining,
        }))
    }

    /// Consumed summary for the execution row.
    #[must_use]
    pub fn consumed(&self) -> BudgetsConsumed {
        BudgetsConsumed {
            turns: Some(self.turns),
            llm_subcalls: Some(self.llm_subcalls),
            total_seconds: Some(self.elapsed_seconds()),
        }
    }

    /// The budgets this tracker enforces.
    #[must_use]
    pub fn budgets(&self) -> Option<&Budgets> {
        self.budgets.as_ref()
    }
}
