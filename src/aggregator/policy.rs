//! Destructive-tool blocking policy
//!
//! Tools whose names suggest mutation of external state are blocked unless
//! yolo mode is on. Blocked tools stay visible in `tools/list` with a flag;
//! only invocation is refused.

use std::sync::atomic::{AtomicBool, Ordering};

/// Name fragments that mark a tool destructive
pub const DESTRUCTIVE_KEYWORDS: &[&str] = &[
    "apply",
    "create",
    "delete",
    "patch",
    "rollout",
    "scale",
    "install",
    "uninstall",
    "upgrade",
    "cleanup",
    "reconcile",
    "resume",
    "suspend",
    "move",
    "pause",
    "remediate",
    "update",
];

/// Runtime policy: a yolo switch over the destructive keyword list
pub struct ToolPolicy {
    yolo: AtomicBool,
}

impl ToolPolicy {
    /// Create a policy with the given yolo setting
    #[must_use]
    pub fn new(yolo: bool) -> Self {
        Self {
            yolo: AtomicBool::new(yolo),
        }
    }

    /// Whether a tool name matches the destructive keyword list
    #[must_use]
    pub fn is_destructive(name: &str) -> bool {
        let lower = name.to_ascii_lowercase();
        DESTRUCTIVE_KEYWORDS.iter().any(|kw| lower.contains(kw))
    }

    /// Whether invoking this tool is currently refused
    #[must_use]
    pub fn blocks(&self, name: &str) -> bool {
        !self.yolo() && Self::is_destructive(name)
    }

    /// Current yolo setting
    #[must_use]
    pub fn yolo(&self) -> bool {
        self.yolo.load(Ordering::Relaxed)
    }

    /// Flip yolo mode; returns the previous value
    pub fn set_yolo(&self, yolo: bool) -> bool {
        self.yolo.swap(yolo, Ordering::Relaxed)
    }
}
