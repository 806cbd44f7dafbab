//! Per-session, per-tool circuit breaker.
//!
//! Three consecutive failures disable a tool for the rest of the session;
//! three distinct disabled tools put the session in degraded mode. Both
//! are monotonic until an operator reset or a new session.

use crate::domain::session::SessionErrorState;

#[derive(Clone, Debug)]
pub struct ToolFailureConfig {
    pub disable_threshold: u32,
    pub degrade_threshold: usize,
}

impl Default for ToolFailureConfig {
    fn default() -> Self {
        Self { disable_threshold: 3, degrade_threshold: 3 }
    }
}

/// What a recorded failure did to the session state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FailureRecord {
    pub consecutive_failures: u32,
    pub newly_disabled: bool,
    pub newly_degraded: bool,
}

#[derive(Clone, Debug, Default)]
pub struct ToolFailureTracker {
    config: ToolFailureConfig,
}

impl ToolFailureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: ToolFailureConfig) -> Self {
        Self { config }
    }

    pub fn record_failure(&self, state: &mut SessionErrorState, tool: &str) -> FailureRecord {
        let count = state.failure_counts.entry(tool.to_string()).or_insert(0);
        *count += 1;
        let consecutive_failures = *count;

        let newly_disabled = consecutive_failures >= self.config.disable_threshold
            && state.disabled_tools.insert(tool.to_string());

        let newly_degraded = !state.degraded
            && state.disabled_tools.len() >= self.config.degrade_threshold;
        if newly_degraded {
            state.degraded = true;
            state.degraded_reason = Some(format!(
                "{} tools disabled after repeated failures",
                state.disabled_tools.len()
            ));
        }

        FailureRecord { consecutive_failures, newly_disabled, newly_degraded }
    }

    /// A success resets the consecutive counter, but never re-enables a
    /// tool that already tripped the breaker.
    pub fn record_success(&self, state: &mut SessionErrorState, tool: &str) {
        if !state.disabled_tools.contains(tool) {
            state.failure_counts.remove(tool);
        }
    }

    pub fn is_disabled(&self, state: &SessionErrorState, tool: &str) -> bool {
        state.disabled_tools.contains(tool)
    }

    pub fn is_degraded(&self, state: &SessionErrorState) -> bool {
        state.disabled_tools.len() >= self.config.degrade_threshold
    }

    /// Operator reset: clears counters, the disabled set, and the flag.
    pub fn reset(&self, state: &mut SessionErrorState) {
        state.failure_counts.clear();
        state.disabled_tools.clear();
        state.degraded = false;
        state.degraded_reason = None;
    }
}

#[cfg(test)]
mod tests {
    use super::ToolFailureTracker;
    use crate::domain::session::SessionErrorState;

    #[test]
    fn third_consecutive_failure_disables_the_tool() {
        let tracker = ToolFailureTracker::new();
        let mut state = SessionErrorState::default();

        for expected in 1..=2u32 {
            let record = tracker.record_failure(&mut state, "crm_update");
            assert_eq!(record.consecutive_failures, expected);
            assert!(!record.newly_disabled);
            assert!(!tracker.is_disabled(&state, "crm_update"));
        }

        let record = tracker.record_failure(&mut state, "crm_update");
        assert_eq!(record.consecutive_failures, 3);
        assert!(record.newly_disabled);
        assert!(tracker.is_disabled(&state, "crm_update"));
    }

    #[test]
    fn success_resets_the_streak_before_the_threshold() {
        let tracker = ToolFailureTracker::new();
        let mut state = SessionErrorState::default();

        tracker.record_failure(&mut state, "send_form");
        tracker.record_failure(&mut state, "send_form");
        tracker.record_success(&mut state, "send_form");

        let record = tracker.record_failure(&mut state, "send_form");
        assert_eq!(record.consecutive_failures, 1);
        assert!(!tracker.is_disabled(&state, "send_form"));
    }

    #[test]
    fn success_never_reenables_a_tripped_breaker() {
        let tracker = ToolFailureTracker::new();
        let mut state = SessionErrorState::default();

        for _ in 0..3 {
            tracker.record_failure(&mut state, "create_task");
        }
        tracker.record_success(&mut state, "create_task");

        assert!(tracker.is_disabled(&state, "create_task"));
    }

    #[test]
    fn degraded_mode_starts_at_exactly_three_disabled_tools() {
        let tracker = ToolFailureTracker::new();
        let mut state = SessionErrorState::default();

        for tool in ["tool_a", "tool_b"] {
            for _ in 0..3 {
                tracker.record_failure(&mut state, tool);
            }
        }
        assert!(!tracker.is_degraded(&state));
        assert!(!state.degraded);

        let mut last = None;
        for _ in 0..3 {
            last = Some(tracker.record_failure(&mut state, "tool_c"));
        }
        let record = last.expect("record");
        assert!(record.newly_disabled);
        assert!(record.newly_degraded);
        assert!(tracker.is_degraded(&state));
        assert!(state.degraded_reason.is_some());
    }

    #[test]
    fn reset_clears_everything() {
        let tracker = ToolFailureTracker::new();
        let mut state = SessionErrorState::default();
        for tool in ["a", "b", "c"] {
            for _ in 0..3 {
                tracker.record_failure(&mut state, tool);
            }
        }
        assert!(tracker.is_degraded(&state));

        tracker.reset(&mut state);
        assert!(state.is_empty());
        assert!(!tracker.is_degraded(&state));
    }
}
