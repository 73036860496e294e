use std::collections::HashMap;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Value};
use tracing::info;

use resilix_core::provider::CodeProvider;
use resilix_core::types::{MergeGateStatus, RemediationRequest, RemediationResult};

use crate::patch;

const API_BASE: &str = "https://api.github.com";

/// GitHub REST code provider: branch + commit + PR on the remediation
/// target, merge-gate reads, and the merge call itself.
#[derive(Debug)]
pub struct GithubApiProvider {
    token: String,
    owner: String,
    default_base_branch: String,
    client: reqwest::Client,
}

impl GithubApiProvider {
    pub fn new(
        token: &str,
        owner: &str,
        default_base_branch: &str,
        timeout_secs: u64,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .user_agent("resilix-remediation")
            .build()
            .context("build github http client")?;
        Ok(Self {
            token: token.to_string(),
            owner: owner.to_string(),
            default_base_branch: default_base_branch.to_string(),
            client,
        })
    }

    fn repo_name<'a>(&self, repository: &'a str) -> &'a str {
        repository
            .split_once('/')
            .map(|(_, name)| name)
            .unwrap_or(repository)
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        self.request(self.client.get(url))
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    async fn default_branch(&self, repo_name: &str) -> Result<String> {
        let data: Value = self
            .get(&format!("{API_BASE}/repos/{}/{repo_name}", self.owner))
            .send()
            .await
            .context("fetch repo")?
            .error_for_status()
            .context("fetch repo status")?
            .json()
            .await
            .context("parse repo")?;
        Ok(data["default_branch"]
            .as_str()
            .unwrap_or(&self.default_base_branch)
            .to_string())
    }

    /// Fetch a file's content and blob sha on a branch. None when absent.
    async fn fetch_file(
        &self,
        repo_name: &str,
        path: &str,
        branch: &str,
    ) -> Result<Option<(String, String)>> {
        let response = self
            .get(&format!(
                "{API_BASE}/repos/{}/{repo_name}/contents/{path}",
                self.owner
            ))
            .query(&[("ref", branch)])
            .send()
            .await
            .context("fetch file")?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("file fetch failed with {status}: {body}");
        }
        let data: Value = response.json().await.context("parse file")?;
        let sha = data["sha"].as_str().unwrap_or_default().to_string();
        let encoded = data["content"].as_str().unwrap_or_default().replace('\n', "");
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .unwrap_or_default();
        Ok(Some((String::from_utf8_lossy(&decoded).into_owned(), sha)))
    }
}

#[async_trait]
impl CodeProvider for GithubApiProvider {
    async fn create_remediation_pr(
        &self,
        request: &RemediationRequest,
    ) -> Result<RemediationResult> {
        let started = Instant::now();
        let repo_name = self.repo_name(&request.repository);
        let branch_name = format!("fix/resilix-{}", request.incident_id.to_lowercase());

        let base_branch = self.default_branch(repo_name).await?;

        let base_ref: Value = self
            .get(&format!(
                "{API_BASE}/repos/{}/{repo_name}/git/ref/heads/{base_branch}",
                self.owner
            ))
            .send()
            .await
            .context("fetch base ref")?
            .error_for_status()
            .context("fetch base ref status")?
            .json()
            .await
            .context("parse base ref")?;
        let base_sha = base_ref["object"]["sha"].as_str().unwrap_or_default();

        // Branch creation; a 422 means it already exists, which is fine for
        // idempotent re-drives.
        let branch_resp = self
            .request(self.client.post(format!(
                "{API_BASE}/repos/{}/{repo_name}/git/refs",
                self.owner
            )))
            .json(&json!({
                "ref": format!("refs/heads/{branch_name}"),
                "sha": base_sha,
            }))
            .send()
            .await
            .context("create branch")?;
        let branch_status = branch_resp.status();
        if branch_status != reqwest::StatusCode::CREATED
            && branch_status != reqwest::StatusCode::UNPROCESSABLE_ENTITY
        {
            let body = branch_resp.text().await.unwrap_or_default();
            bail!("branch create failed with {branch_status}: {body}");
        }

        let existing = self
            .fetch_file(repo_name, &request.target_file, &branch_name)
            .await?;
        let (existing_content, existing_sha) = match existing {
            Some((content, sha)) => (Some(content), Some(sha)),
            None => (None, None),
        };

        let outcome =
            patch::render_remediation(&request.target_file, existing_content.as_deref(), request);

        let mut put_payload = json!({
            "message": format!("fix: {}", truncate(&request.summary, 72)),
            "content": base64::engine::general_purpose::STANDARD.encode(&outcome.content),
            "branch": branch_name,
        });
        if let Some(sha) = existing_sha {
            put_payload["sha"] = json!(sha);
        }
        self.request(self.client.put(format!(
            "{API_BASE}/repos/{}/{repo_name}/contents/{}",
            self.owner, request.target_file
        )))
        .json(&put_payload)
        .send()
        .await
        .context("upsert file")?
        .error_for_status()
        .context("upsert file status")?;

        let pr_resp = self
            .request(self.client.post(format!(
                "{API_BASE}/repos/{}/{repo_name}/pulls",
                self.owner
            )))
            .json(&json!({
                "title": format!("[Resilix] {}", truncate(&request.summary, 120)),
                "head": branch_name,
                "base": base_branch,
                "body": format!(
                    "Automated remediation for incident `{}`.",
                    request.incident_id
                ),
            }))
            .send()
            .await
            .context("create pr")?;

        let pr_data: Value = if pr_resp.status() == reqwest::StatusCode::UNPROCESSABLE_ENTITY {
            // A PR already exists for this head; reuse it.
            let prs: Value = self
                .get(&format!(
                    "{API_BASE}/repos/{}/{repo_name}/pulls",
                    self.owner
                ))
                .query(&[
                    ("head", format!("{}:{branch_name}", self.owner)),
                    ("state", "open".to_string()),
                ])
                .send()
                .await
                .context("list prs by head")?
                .error_for_status()
                .context("list prs status")?
                .json()
                .await
                .context("parse pr list")?;
            match prs.as_array().and_then(|a| a.first()).cloned() {
                Some(existing_pr) => {
                    info!(branch = %branch_name, "reusing existing open PR for branch");
                    existing_pr
                }
                None => bail!("pr create returned 422 and no open PR exists for {branch_name}"),
            }
        } else {
            pr_resp
                .error_for_status()
                .context("create pr status")?
                .json()
                .await
                .context("parse pr")?
        };

        let pr_number = pr_data["number"].as_i64().unwrap_or_default();
        let pr_url = pr_data["html_url"].as_str().unwrap_or_default().to_string();

        Ok(RemediationResult {
            success: true,
            action_taken: request.action,
            branch_name: Some(branch_name),
            pr_number: Some(pr_number),
            pr_url: Some(pr_url),
            pr_merged: false,
            target_file: Some(request.target_file.clone()),
            diff_old_line: outcome.diff_old_line,
            diff_new_line: outcome.diff_new_line,
            execution_time_seconds: started.elapsed().as_secs_f64(),
            error_message: None,
        })
    }

    async fn get_merge_gate_status(
        &self,
        repository: &str,
        pr_number: i64,
    ) -> Result<MergeGateStatus> {
        let repo_name = self.repo_name(repository);

        let pr: Value = self
            .get(&format!(
                "{API_BASE}/repos/{}/{repo_name}/pulls/{pr_number}",
                self.owner
            ))
            .send()
            .await
            .context("fetch pr")?
            .error_for_status()
            .context("fetch pr status")?
            .json()
            .await
            .context("parse pr")?;
        let head_sha = pr["head"]["sha"].as_str().unwrap_or_default();
        let mergeable_state = pr["mergeable_state"].as_str().unwrap_or_default();

        let combined: Value = self
            .get(&format!(
                "{API_BASE}/repos/{}/{repo_name}/commits/{head_sha}/status",
                self.owner
            ))
            .send()
            .await
            .context("fetch combined status")?
            .error_for_status()
            .context("combined status")?
            .json()
            .await
            .context("parse combined status")?;
        let ci_state = combined["state"].as_str().unwrap_or("pending");

        let reviews: Value = self
            .get(&format!(
                "{API_BASE}/repos/{}/{repo_name}/pulls/{pr_number}/reviews",
                self.owner
            ))
            .send()
            .await
            .context("fetch reviews")?
            .error_for_status()
            .context("reviews status")?
            .json()
            .await
            .context("parse reviews")?;
        let review_list = reviews.as_array().map(Vec::as_slice).unwrap_or_default();
        let review_decision = derive_review_decision(review_list);
        let has_approved_review = review_list.iter().any(|r| r["state"] == "APPROVED");

        let ci_passed = ci_state == "success";
        let codeowner_reviewed = review_decision.as_deref() == Some("APPROVED")
            || has_approved_review
            || matches!(mergeable_state, "clean" | "has_hooks");
        Ok(MergeGateStatus {
            ci_passed,
            codeowner_reviewed,
            details: json!({
                "ci_state": ci_state,
                "mergeable_state": mergeable_state,
                "review_decision": review_decision,
            }),
        })
    }

    async fn merge_pr(&self, repository: &str, pr_number: i64, method: &str) -> Result<bool> {
        let repo_name = self.repo_name(repository);
        let response = self
            .request(self.client.put(format!(
                "{API_BASE}/repos/{}/{repo_name}/pulls/{pr_number}/merge",
                self.owner
            )))
            .json(&json!({"merge_method": method}))
            .send()
            .await
            .context("merge pr")?;
        match response.status().as_u16() {
            200 | 201 => Ok(true),
            405 | 409 | 422 => Ok(false),
            status => {
                let body = response.text().await.unwrap_or_default();
                bail!("merge failed with {status}: {body}");
            }
        }
    }
}

/// Overall review decision for a PR, derived from the review list: the
/// latest APPROVED/CHANGES_REQUESTED review per reviewer stands, a
/// DISMISSED review clears that reviewer, a standing change request blocks
/// the decision, and one standing approval decides APPROVED. The REST
/// surface exposes no review-decision field of its own.
pub fn derive_review_decision(reviews: &[Value]) -> Option<String> {
    let mut latest: HashMap<String, &str> = HashMap::new();
    for review in reviews {
        let login = review["user"]["login"].as_str().unwrap_or("").to_string();
        match review["state"].as_str().unwrap_or("") {
            state @ ("APPROVED" | "CHANGES_REQUESTED") => {
                latest.insert(login, state);
            }
            "DISMISSED" => {
                latest.remove(&login);
            }
            _ => {}
        }
    }
    if latest.values().any(|s| *s == "CHANGES_REQUESTED") {
        return Some("CHANGES_REQUESTED".to_string());
    }
    if latest.values().any(|s| *s == "APPROVED") {
        return Some("APPROVED".to_string());
    }
    None
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
