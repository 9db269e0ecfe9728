use std::collections::HashMap;

/// Consecutive-violation counter for one device under one rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleState {
    pub device_id: String,
    pub consecutive_violations: u32,
}

/// Process-local streak counters, created lazily and rebuilt from zero on
/// restart. Owned by a single evaluator, so no locking.
#[derive(Debug, Default)]
pub struct StateTable {
    states: HashMap<(String, String), RuleState>,
}

impl StateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, device_id: &str, rule_id: &str) -> Option<&RuleState> {
        self.states.get(&(device_id.to_string(), rule_id.to_string()))
    }

    /// Current streak, zero for an unseen device.
    pub fn violations(&self, device_id: &str, rule_id: &str) -> u32 {
        self.get(device_id, rule_id)
            .map_or(0, |s| s.consecutive_violations)
    }

    /// Advance the streak on a violation, reset it otherwise. Returns the
    /// new streak length.
    pub fn record(&mut self, device_id: &str, rule_id: &str, violated: bool) -> u32 {
        let state = self
            .states
            .entry((device_id.to_string(), rule_id.to_string()))
            .or_insert_with(|| RuleState {
                device_id: device_id.to_string(),
                consecutive_violations: 0,
            });
        state.consecutive_violations = if violated {
            state.consecutive_violations.saturating_add(1)
        } else {
            0
        };
        state.consecutive_violations
    }

    pub fn reset(&mut self, device_id: &str, rule_id: &str) {
        if let Some(state) = self
            .states
            .get_mut(&(device_id.to_string(), rule_id.to_string()))
        {
            state.consecutive_violations = 0;
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
