//! Final approval pass over a finished run

use futures::future::join_all;
use orch_sdk::{log_sign_off, AgentExecutor};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

use crate::types::{SignOff, TaskResult, TaskStatus};
use crate::yaml::decode_response;

#[derive(Deserialize)]
struct Verdict {
    approved: bool,
    #[serde(default)]
    feedback: String,
    #[serde(default)]
    issues: Vec<String>,
    #[serde(default)]
    recommendations: Vec<String>,
}

/// Ask every role for its verdict concurrently.
///
/// A role that cannot be reached or answers unintelligibly is recorded as a
/// rejection carrying the error as an issue.
pub async fn collect_sign_offs(
    executor: &Arc<dyn AgentExecutor>,
    roles: &[String],
    results: &[TaskResult],
) -> Vec<SignOff> {
    let summary: Vec<_> = results
        .iter()
        .map(|r| json!({ "taskId": r.task_id, "role": r.role, "status": r.status }))
        .collect();

    let requests = roles.iter().map(|role| {
        let own: Vec<&TaskResult> = results.iter().filter(|r| &r.role == role).collect();
        let context = json!({ "results": own, "summary": summary });
        async move {
            let prompt = format!(
                "Sign off on the completed work as {}. Respond with YAML: approved (bool), feedback, \
                 issues (list), recommendations (list).",
                role
            );
            let verdict = match executor.invoke(role, &prompt, &context).await {
                Ok(raw) => decode_response::<Verdict>(&raw).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };

            let sign_off = match verdict {
                Ok(v) => SignOff {
                    agent: role.clone(),
                    approved: v.approved,
                    feedback: v.feedback,
                    issues: v.issues,
                    recommendations: v.recommendations,
                },
                Err(error) => {
                    warn!(role = %role, error = %error, "Sign-off not obtained");
                    SignOff {
                        agent: role.clone(),
                        approved: false,
                        feedback: "Sign-off could not be obtained".to_string(),
                        issues: vec![error],
                        recommendations: vec![format!("Request sign-off from {} manually", role)],
                    }
                }
            };
            log_sign_off!(sign_off.agent, sign_off.approved);
            sign_off
        }
    });

    join_all(requests).await
}

/// Every role approved (and there was at least one)
pub fn overall_approval(sign_offs: &[SignOff]) -> bool {
    !sign_offs.is_empty() && sign_offs.iter().all(|s| s.approved)
}

/// Roles with at least one task that actually ran to completion
pub fn roles_that_ran(results: &[TaskResult]) -> Vec<String> {
    let mut roles: Vec<String> = results
        .iter()
        .filter(|r| r.status == TaskStatus::Completed)
        .map(|r| r.role.clone())
        .collect();
    roles.sort();
    roles.dedup();
    roles
}
