use std::collections::{HashMap, HashSet};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use resilix_core::provider::TicketProvider;
use resilix_core::types::{TicketRecord, TransitionOutcome};

/// Jira Cloud REST v3 ticket provider.
#[derive(Debug)]
pub struct JiraApiProvider {
    base_url: String,
    username: String,
    api_token: String,
    project_key: String,
    issue_type: String,
    transition_strict: bool,
    transition_aliases: HashMap<String, HashSet<String>>,
    client: reqwest::Client,
}

impl JiraApiProvider {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        jira_url: &str,
        username: &str,
        api_token: &str,
        project_key: &str,
        issue_type: &str,
        transition_strict: bool,
        transition_aliases: &str,
        timeout_secs: u64,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .context("build jira http client")?;
        Ok(Self {
            base_url: jira_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            api_token: api_token.to_string(),
            project_key: project_key.to_string(),
            issue_type: issue_type.to_string(),
            transition_strict,
            transition_aliases: parse_aliases(transition_aliases),
            client,
        })
    }

    fn issue_url(&self, ticket_key: &str) -> String {
        format!("{}/rest/api/3/issue/{ticket_key}", self.base_url)
    }

    /// Atlassian Document Format wrapper for a plain-text description.
    fn to_adf(text: &str) -> Value {
        let text = if text.is_empty() {
            "Resilix incident ticket."
        } else {
            text
        };
        json!({
            "type": "doc",
            "version": 1,
            "content": [{
                "type": "paragraph",
                "content": [{"type": "text", "text": text}],
            }],
        })
    }

    fn alias_set(&self, target_status: &str) -> HashSet<String> {
        let key = target_status.trim().to_lowercase();
        let mut aliases = self
            .transition_aliases
            .get(&key)
            .cloned()
            .unwrap_or_default();
        aliases.insert(key);
        aliases
    }

    async fn transition_ticket_inner(
        &self,
        ticket_key: &str,
        target_status: &str,
    ) -> Result<TransitionOutcome> {
        let issue_endpoint = self.issue_url(ticket_key);
        let transitions_endpoint = format!("{issue_endpoint}/transitions");

        let issue: Value = self
            .client
            .get(&issue_endpoint)
            .basic_auth(&self.username, Some(&self.api_token))
            .header("Accept", "application/json")
            .send()
            .await
            .context("fetch issue")?
            .error_for_status()
            .context("fetch issue status")?
            .json()
            .await
            .context("parse issue")?;
        let from_status = issue["fields"]["status"]["name"]
            .as_str()
            .map(str::to_string);

        let listing: Value = self
            .client
            .get(&transitions_endpoint)
            .basic_auth(&self.username, Some(&self.api_token))
            .header("Accept", "application/json")
            .send()
            .await
            .context("list transitions")?
            .error_for_status()
            .context("list transitions status")?
            .json()
            .await
            .context("parse transitions")?;
        let transitions = listing["transitions"].as_array().cloned().unwrap_or_default();

        let targets = self.alias_set(target_status);
        // A selection miss is an error here so strict mode treats it the
        // same way as a transport failure.
        let selected = require_transition(&transitions, &targets, target_status)?;

        let transition_id = selected["id"]
            .as_str()
            .map(str::to_string)
            .or_else(|| selected["id"].as_i64().map(|id| id.to_string()))
            .unwrap_or_default();
        self.client
            .post(&transitions_endpoint)
            .basic_auth(&self.username, Some(&self.api_token))
            .header("Accept", "application/json")
            .json(&json!({"transition": {"id": transition_id}}))
            .send()
            .await
            .context("apply transition")?
            .error_for_status()
            .context("apply transition status")?;

        Ok(TransitionOutcome {
            ok: true,
            from_status,
            to_status: target_status.to_string(),
            applied_transition_id: Some(transition_id),
            reason: None,
        })
    }
}

/// Selection required to succeed: a miss becomes an error, which the
/// non-strict `transition_ticket` wrapper turns into a failure record and
/// strict mode propagates.
pub fn require_transition<'a>(
    transitions: &'a [Value],
    targets: &HashSet<String>,
    target_status: &str,
) -> Result<&'a Value> {
    select_transition(transitions, targets).ok_or_else(|| {
        anyhow!("No transition found for target status '{target_status}'")
    })
}

/// Prefer a transition whose name matches any alias; fall back to one whose
/// destination status name matches.
pub fn select_transition<'a>(
    transitions: &'a [Value],
    targets: &HashSet<String>,
) -> Option<&'a Value> {
    let mut status_name_match: Option<&Value> = None;
    for transition in transitions {
        let name = transition["name"]
            .as_str()
            .unwrap_or("")
            .trim()
            .to_lowercase();
        let to_name = transition["to"]["name"]
            .as_str()
            .unwrap_or("")
            .trim()
            .to_lowercase();
        if targets.contains(&name) {
            return Some(transition);
        }
        if status_name_match.is_none() && targets.contains(&to_name) {
            status_name_match = Some(transition);
        }
    }
    status_name_match
}

/// Parse the alias config: either a JSON object mapping canonical status →
/// list (or `|`-joined string) of names, or `stage:a|b,stage2:c` pairs.
pub fn parse_aliases(raw: &str) -> HashMap<String, HashSet<String>> {
    let mut parsed: HashMap<String, HashSet<String>> = HashMap::new();
    let value = raw.trim();
    if value.is_empty() {
        return parsed;
    }

    if value.starts_with('{') {
        let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(value) else {
            return parsed;
        };
        for (key, items) in obj {
            let aliases: HashSet<String> = match items {
                Value::Array(items) => items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|s| s.trim().to_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect(),
                Value::String(s) => s
                    .split('|')
                    .map(|part| part.trim().to_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect(),
                _ => HashSet::new(),
            };
            if !aliases.is_empty() {
                parsed.insert(key.trim().to_lowercase(), aliases);
            }
        }
        return parsed;
    }

    for pair in value.split(',') {
        let Some((stage, names)) = pair.split_once(':') else {
            continue;
        };
        let stage_key = stage.trim().to_lowercase();
        let aliases: HashSet<String> = names
            .split('|')
            .map(|part| part.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        if !stage_key.is_empty() && !aliases.is_empty() {
            parsed.insert(stage_key, aliases);
        }
    }
    parsed
}

#[async_trait]
impl TicketProvider for JiraApiProvider {
    async fn create_incident_ticket(
        &self,
        incident_id: &str,
        summary: &str,
        description: &str,
        priority: &str,
    ) -> Result<TicketRecord> {
        let endpoint = format!("{}/rest/api/3/issue", self.base_url);
        let fields = json!({
            "project": {"key": self.project_key},
            "summary": summary,
            "description": Self::to_adf(description),
            "issuetype": {"name": self.issue_type},
            "priority": {"name": priority},
            "labels": ["resilix-auto", "incident", incident_id.to_lowercase()],
        });

        let mut response = self
            .client
            .post(&endpoint)
            .basic_auth(&self.username, Some(&self.api_token))
            .header("Accept", "application/json")
            .json(&json!({"fields": fields}))
            .send()
            .await
            .context("create jira issue")?;

        if response.status() == reqwest::StatusCode::BAD_REQUEST {
            // Some Jira projects use custom priority schemes; retry without
            // priority before giving up.
            let mut fields_without_priority = fields.clone();
            if let Some(obj) = fields_without_priority.as_object_mut() {
                obj.remove("priority");
            }
            response = self
                .client
                .post(&endpoint)
                .basic_auth(&self.username, Some(&self.api_token))
                .header("Accept", "application/json")
                .json(&json!({"fields": fields_without_priority}))
                .send()
                .await
                .context("create jira issue (no priority)")?;
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("jira issue create failed with {status}: {body}");
        }
        let data: Value = response.json().await.context("parse jira issue")?;
        let ticket_key = data["key"].as_str().unwrap_or("UNKNOWN-0").to_string();

        Ok(TicketRecord {
            ticket_url: format!("{}/browse/{ticket_key}", self.base_url),
            ticket_key,
            summary: summary.to_string(),
            priority: priority.to_string(),
            status: "Open".to_string(),
            created_at: Utc::now(),
        })
    }

    async fn transition_ticket(
        &self,
        ticket_key: &str,
        target_status: &str,
    ) -> Result<TransitionOutcome> {
        match self.transition_ticket_inner(ticket_key, target_status).await {
            Ok(outcome) => Ok(outcome),
            Err(e) if self.transition_strict => Err(e),
            Err(e) => Ok(TransitionOutcome {
                ok: false,
                from_status: None,
                to_status: target_status.to_string(),
                applied_transition_id: None,
                reason: Some(format!("{e:#}")),
            }),
        }
    }
}
