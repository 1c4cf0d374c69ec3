use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::ids::SessionId;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PermissionAction {
    Allow,
    Deny,
    Ask,
}

/// A single permission rule. Immutable once loaded.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PermissionRule {
    pub permission: String,
    pub pattern: String,
    pub action: PermissionAction,
}

impl PermissionRule {
    pub fn new(
        permission: impl Into<String>,
        pattern: impl Into<String>,
        action: PermissionAction,
    ) -> Self {
        Self {
            permission: permission.into(),
            pattern: pattern.into(),
            action,
        }
    }
}

/// An ordered list of rules. Rule sets layer: defaults first, then profile
/// overrides, then session overrides; later sets take precedence.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RuleSet {
    pub rules: Vec<PermissionRule>,
}

impl RuleSet {
    pub fn new(rules: Vec<PermissionRule>) -> Self {
        Self { rules }
    }
}

/// Find the single rule governing `(permission, pattern)`.
///
/// Sets are scanned in reverse and rules within a set in reverse, so the
/// last rule defined wins and later layers beat defaults. When nothing
/// matches the synthetic `(*, *, ask)` rule is returned — an unmatched
/// permission never silently allows or denies.
pub fn evaluate(sets: &[RuleSet], permission: &str, pattern: &str) -> PermissionRule {
    for set in sets.iter().rev() {
        for rule in set.rules.iter().rev() {
            if glob_match(&rule.permission, permission) && glob_match(&rule.pattern, pattern) {
                return rule.clone();
            }
        }
    }
    PermissionRule::new("*", "*", PermissionAction::Ask)
}

/// Segment glob matching: split both the glob and the candidate on `*`;
/// equal segment counts with literally equal non-wildcard segments match.
/// Deliberately simpler than full glob — no character classes, no `**`.
/// Existing rule files depend on these exact semantics.
pub fn glob_match(glob: &str, candidate: &str) -> bool {
    if !glob.contains('*') {
        return glob == candidate;
    }

    let parts: Vec<&str> = glob.split('*').collect();
    let mut rest = candidate;

    for (i, part) in parts.iter().enumerate() {
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return part.is_empty() || rest.ends_with(part);
        } else if part.is_empty() {
            continue;
        } else {
            match rest.find(part) {
                Some(idx) => rest = &rest[idx + part.len()..],
                None => return false,
            }
        }
    }

    true
}

/// Collaborator consulted when the governing rule says `ask`. The actual
/// approval UI is out of scope; the coordinator blocks on this call.
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    async fn request(&self, session_id: &SessionId, permission: &str, pattern: &str) -> bool;
}

/// Approves everything. For non-interactive runs and tests.
pub struct AutoApprove;

#[async_trait]
impl ApprovalGate for AutoApprove {
    async fn request(&self, _session_id: &SessionId, _permission: &str, _pattern: &str) -> bool {
        true
    }
}

/// Denies everything.
pub struct AutoDeny;

#[async_trait]
impl ApprovalGate for AutoDeny {
    async fn request(&self, _session_id: &SessionId, _permission: &str, _pattern: &str) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(rules: Vec<(&str, &str, PermissionAction)>) -> RuleSet {
        RuleSet::new(
            rules
                .into_iter()
                .map(|(p, pat, a)| PermissionRule::new(p, pat, a))
                .collect(),
        )
    }

    #[test]
    fn no_rules_defaults_to_ask() {
        let rule = evaluate(&[], "bash", "ls");
        assert_eq!(rule.action, PermissionAction::Ask);
        assert_eq!(rule.permission, "*");
        assert_eq!(rule.pattern, "*");
    }

    #[test]
    fn unmatched_defaults_to_ask() {
        let sets = vec![set(vec![("bash", "ls *", PermissionAction::Allow)])];
        let rule = evaluate(&sets, "edit", "/etc/passwd");
        assert_eq!(rule.action, PermissionAction::Ask);
    }

    #[test]
    fn later_set_wins_over_earlier() {
        let sets = vec![
            set(vec![("*", "*", PermissionAction::Allow)]),
            set(vec![("doom_loop", "*", PermissionAction::Ask)]),
        ];
        let rule = evaluate(&sets, "doom_loop", "bash");
        assert_eq!(rule.action, PermissionAction::Ask);
        assert_eq!(rule.permission, "doom_loop");
    }

    #[test]
    fn last_rule_in_set_wins() {
        let sets = vec![set(vec![
            ("bash", "*", PermissionAction::Deny),
            ("bash", "*", PermissionAction::Allow),
        ])];
        let rule = evaluate(&sets, "bash", "rm -rf /");
        assert_eq!(rule.action, PermissionAction::Allow);
    }

    #[test]
    fn appended_set_overrides_same_pair() {
        let a = set(vec![("bash", "git *", PermissionAction::Allow)]);
        let b = set(vec![("bash", "git *", PermissionAction::Deny)]);
        let rule = evaluate(&[a, b], "bash", "git push");
        assert_eq!(rule.action, PermissionAction::Deny);
    }

    #[test]
    fn glob_literal_match() {
        assert!(glob_match("bash", "bash"));
        assert!(!glob_match("bash", "edit"));
    }

    #[test]
    fn glob_single_star() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("*", ""));
    }

    #[test]
    fn glob_prefix_and_suffix() {
        assert!(glob_match("git *", "git push"));
        assert!(!glob_match("git *", "hg push"));
        assert!(glob_match("*.rs", "main.rs"));
        assert!(!glob_match("*.rs", "main.go"));
    }

    #[test]
    fn glob_infix() {
        assert!(glob_match("cargo * --release", "cargo build --release"));
        assert!(!glob_match("cargo * --release", "cargo build"));
    }

    #[test]
    fn glob_no_double_star_semantics() {
        // `**` is two adjacent wildcards, not a recursive match; it still
        // behaves as a plain wildcard over the remaining text.
        assert!(glob_match("a**b", "a-anything-b"));
        assert!(glob_match("a**b", "ab"));
    }

    #[test]
    fn rule_set_serde() {
        let json = r#"{"rules":[{"permission":"bash","pattern":"ls *","action":"allow"}]}"#;
        let parsed: RuleSet = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.rules.len(), 1);
        assert_eq!(parsed.rules[0].action, PermissionAction::Allow);
    }

    #[tokio::test]
    async fn auto_gates() {
        let sid = SessionId::new();
        assert!(AutoApprove.request(&sid, "bash", "ls").await);
        assert!(!AutoDeny.request(&sid, "bash", "ls").await);
    }
}
