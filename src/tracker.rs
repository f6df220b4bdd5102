use crate::types::ToolCall;

/// Keeps the "most complete" set of streamed tool calls.
///
/// Vendors resend the growing call set on every chunk. A later set only
/// replaces the stored one if its combined argument length is strictly
/// longer; a set marked complete replaces it unconditionally and freezes it.
#[derive(Debug, Default)]
pub struct ToolCallTracker {
    best: Vec<ToolCall>,
    best_len: usize,
    replacements: usize,
    finalized: bool,
}

impl ToolCallTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a snapshot of the calls. Returns true if it was kept.
    pub fn observe(&mut self, calls: &[ToolCall], complete: bool) -> bool {
        if self.finalized || calls.is_empty() {
            return false;
        }

        let len = total_argument_length(calls);
        let keep = complete || self.best.is_empty() || len > self.best_len;
        if !keep {
            return false;
        }

        if !self.best.is_empty() {
            self.replacements += 1;
        }
        self.best = calls.to_vec();
        self.best_len = len;
        self.finalized = complete;
        true
    }

    pub fn best(&self) -> &[ToolCall] {
        &self.best
    }

    /// How many times a stored set was displaced by a better one.
    pub fn replacements(&self) -> usize {
        self.replacements
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn is_empty(&self) -> bool {
        self.best.is_empty()
    }

    pub fn into_calls(self) -> Vec<ToolCall> {
        self.best
    }
}

fn total_argument_length(calls: &[ToolCall]) -> usize {
    calls.iter().map(ToolCall::argument_length).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(args: &str) -> Vec<ToolCall> {
        vec![ToolCall::new("c1", "search", args)]
    }

    #[test]
    fn keeps_longest_and_ignores_duplicates() {
        let mut tracker = ToolCallTracker::new();
        assert!(tracker.observe(&call("{\"q\":"), false)); // 5
        assert!(tracker.observe(&call("{\"q\":\"rust\"}"), false)); // 12
        assert!(!tracker.observe(&call("{\"q\":\"rust\"}"), false)); // 12 again
        assert_eq!(tracker.best()[0].argument_length(), 12);
        assert_eq!(tracker.replacements(), 1);
        assert!(!tracker.is_finalized());
    }

    #[test]
    fn shorter_snapshot_does_not_replace() {
        let mut tracker = ToolCallTracker::new();
        tracker.observe(&call("{\"q\":\"rust\"}"), false);
        assert!(!tracker.observe(&call("{}"), false));
        assert_eq!(tracker.best()[0].arguments, "{\"q\":\"rust\"}");
    }

    #[test]
    fn complete_marker_wins_and_freezes() {
        let mut tracker = ToolCallTracker::new();
        tracker.observe(&call("{\"q\":\"rust lang\"}"), false);
        assert!(tracker.observe(&call("{\"q\":\"rust\"}"), true));
        assert!(tracker.is_finalized());
        assert!(!tracker.observe(&call("{\"q\":\"much longer query\"}"), false));
        assert_eq!(tracker.into_calls()[0].arguments, "{\"q\":\"rust\"}");
    }

    #[test]
    fn empty_snapshots_are_ignored() {
        let mut tracker = ToolCallTracker::new();
        assert!(!tracker.observe(&[], false));
        assert!(tracker.is_empty());
    }
}
