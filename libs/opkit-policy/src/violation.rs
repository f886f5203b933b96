use std::fmt;

use opkit_retrieve::SelectionPath;
use serde::Serialize;

/// Why one candidate policy did not authorize the request.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "outcome")]
pub enum PolicyOutcome {
    /// The restriction was satisfied, but the selection reaches paths the
    /// policy does not allow. These are the exact offending paths.
    ForbiddenSelection {
        /// Requested paths outside the policy's allow-list.
        forbidden: Vec<SelectionPath>,
    },
    /// The caller's `where` does not sit within the policy's restriction.
    RestrictionNotMet,
}

/// One candidate policy's verdict, for diagnostics.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyJudgement {
    /// The policy's diagnostic label, if it has one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Why the policy did not apply.
    #[serde(flatten)]
    pub outcome: PolicyOutcome,
}

/// Structured failure: no declared policy authorizes the requested retrieve
/// at `path`.
///
/// Lists every candidate policy with its verdict so callers can see exactly
/// which field tripped which policy, without leaking unrelated policy
/// internals.
#[derive(Clone, Debug, PartialEq, Serialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
pub struct PolicyViolation {
    /// Entity position the check failed at (`$`, `$.posts`, ...).
    pub path: SelectionPath,
    /// Every candidate policy's verdict.
    pub policies: Vec<PolicyJudgement>,
}

impl fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no policy authorizes the retrieve at {}", self.path)?;
        let forbidden: Vec<String> = self
            .policies
            .iter()
            .filter_map(|j| match &j.outcome {
                PolicyOutcome::ForbiddenSelection { forbidden } => Some(
                    forbidden
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(", "),
                ),
                PolicyOutcome::RestrictionNotMet => None,
            })
            .collect();
        if !forbidden.is_empty() {
            write!(f, " (forbidden: {})", forbidden.join("; "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn display_names_forbidden_paths() {
        let violation = PolicyViolation {
            path: SelectionPath::root(),
            policies: vec![PolicyJudgement {
                label: Some("owner".to_owned()),
                outcome: PolicyOutcome::ForbiddenSelection {
                    forbidden: vec![SelectionPath::root().child("id")],
                },
            }],
        };
        let rendered = violation.to_string();
        assert!(rendered.contains("$.id"), "got: {rendered}");
    }

    #[test]
    fn serializes_structurally() {
        let violation = PolicyViolation {
            path: SelectionPath::root().child("posts"),
            policies: vec![PolicyJudgement {
                label: None,
                outcome: PolicyOutcome::RestrictionNotMet,
            }],
        };
        let json = serde_json::to_value(&violation).unwrap();
        assert_eq!(json["path"], "$.posts");
        assert_eq!(json["policies"][0]["outcome"], "restrictionNotMet");
    }
}
