use std::collections::HashMap;

use crate::types::GatePolicy;

/// Full application configuration loaded from environment / .env file.
#[derive(Debug, Clone)]
pub struct Config {
    // Web boundary
    pub web_bind: String,
    pub web_port: u16,
    pub cors_allowed_origins: String,
    pub frontend_dist_dir: String,
    pub app_version: String,
    pub build_sha: String,

    // Reasoning runner
    pub gemini_api_key: String,
    pub adk_session_backend: String,
    pub database_url: String,

    // Feature flags
    pub use_mock_providers: bool,
    /// True when USE_MOCK_PROVIDERS was set explicitly in the environment.
    pub use_mock_providers_set: bool,
    /// Deprecated alias kept for one migration cycle.
    pub use_mock_mcp: Option<bool>,
    pub allow_mock_fallback: bool,

    // Merge gate
    pub require_pr_approval: bool,
    pub require_ci_pass: bool,
    pub require_codeowner_review: bool,
    /// "squash" | "merge" | "rebase"
    pub merge_method: String,

    // Jira integration
    pub jira_integration_mode: String,
    pub jira_url: String,
    pub jira_username: String,
    pub jira_api_token: String,
    pub jira_project_key: String,
    pub jira_issue_type: String,
    pub jira_status_todo: String,
    pub jira_status_in_progress: String,
    pub jira_status_in_review: String,
    pub jira_status_done: String,
    pub jira_transition_strict: bool,
    pub jira_transition_aliases: String,
    pub jira_timeout_secs: u64,

    // GitHub integration
    pub github_integration_mode: String,
    pub github_token: String,
    pub github_owner: String,
    pub github_default_base_branch: String,
    pub github_timeout_secs: u64,

    // Deployment identifiers (Cloud Run style)
    pub service_service: Option<String>,
    pub service_revision: Option<String>,
}

pub fn parse_dotenv() -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

fn get(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
}

fn get_str(key: &str, dotenv: &HashMap<String, String>, default: &str) -> String {
    get(key, dotenv).unwrap_or_else(|| default.to_string())
}

fn get_bool(key: &str, dotenv: &HashMap<String, String>, default: bool) -> bool {
    match get(key, dotenv).as_deref().map(str::to_lowercase).as_deref() {
        Some("true") | Some("1") => true,
        Some("false") | Some("0") => false,
        Some(_) => default,
        None => default,
    }
}

fn get_u16(key: &str, dotenv: &HashMap<String, String>, default: u16) -> u16 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_u64(key: &str, dotenv: &HashMap<String, String>, default: u64) -> u64 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        let dotenv = parse_dotenv();

        let use_mock_providers_set = get("USE_MOCK_PROVIDERS", &dotenv).is_some();
        let use_mock_mcp = get("USE_MOCK_MCP", &dotenv)
            .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1"));

        Config {
            web_bind: get_str("WEB_BIND", &dotenv, "0.0.0.0"),
            web_port: get_u16("WEB_PORT", &dotenv, 8080),
            cors_allowed_origins: get_str(
                "CORS_ALLOWED_ORIGINS",
                &dotenv,
                "http://localhost:5173,http://localhost:3000",
            ),
            frontend_dist_dir: get_str("FRONTEND_DIST_DIR", &dotenv, ""),
            app_version: get_str("APP_VERSION", &dotenv, ""),
            build_sha: get_str("BUILD_SHA", &dotenv, ""),

            gemini_api_key: get_str("GEMINI_API_KEY", &dotenv, ""),
            adk_session_backend: get_str("ADK_SESSION_BACKEND", &dotenv, "in_memory"),
            database_url: get_str("DATABASE_URL", &dotenv, ""),

            use_mock_providers: get_bool("USE_MOCK_PROVIDERS", &dotenv, true),
            use_mock_providers_set,
            use_mock_mcp,
            allow_mock_fallback: get_bool("ALLOW_MOCK_FALLBACK", &dotenv, false),

            require_pr_approval: get_bool("REQUIRE_PR_APPROVAL", &dotenv, true),
            require_ci_pass: get_bool("REQUIRE_CI_PASS", &dotenv, true),
            require_codeowner_review: get_bool("REQUIRE_CODEOWNER_REVIEW", &dotenv, true),
            merge_method: get_str("MERGE_METHOD", &dotenv, "squash"),

            jira_integration_mode: get_str("JIRA_INTEGRATION_MODE", &dotenv, "api"),
            jira_url: get_str("JIRA_URL", &dotenv, ""),
            jira_username: get_str("JIRA_USERNAME", &dotenv, ""),
            jira_api_token: get_str("JIRA_API_TOKEN", &dotenv, ""),
            jira_project_key: get_str(
                "JIRA_PROJECT_KEY",
                &dotenv,
                "PLACEHOLDER_JIRA_PROJECT_KEY",
            ),
            jira_issue_type: get_str("JIRA_ISSUE_TYPE", &dotenv, "Bug"),
            jira_status_todo: get_str("JIRA_STATUS_TODO", &dotenv, "To Do"),
            jira_status_in_progress: get_str("JIRA_STATUS_IN_PROGRESS", &dotenv, "In Progress"),
            jira_status_in_review: get_str("JIRA_STATUS_IN_REVIEW", &dotenv, "In Review"),
            jira_status_done: get_str("JIRA_STATUS_DONE", &dotenv, "Done"),
            jira_transition_strict: get_bool("JIRA_TRANSITION_STRICT", &dotenv, false),
            jira_transition_aliases: get_str("JIRA_TRANSITION_ALIASES", &dotenv, ""),
            jira_timeout_secs: get_u64("JIRA_TIMEOUT_S", &dotenv, 15),

            github_integration_mode: get_str("GITHUB_INTEGRATION_MODE", &dotenv, "api"),
            github_token: get_str("GITHUB_TOKEN", &dotenv, ""),
            github_owner: get_str("GITHUB_OWNER", &dotenv, "PLACEHOLDER_OWNER"),
            github_default_base_branch: get_str("GITHUB_DEFAULT_BASE_BRANCH", &dotenv, "main"),
            github_timeout_secs: get_u64("GITHUB_TIMEOUT_S", &dotenv, 20),

            service_service: get("K_SERVICE", &dotenv),
            service_revision: get("K_REVISION", &dotenv),
        }
    }

    /// Canonical mock flag: USE_MOCK_PROVIDERS wins when set; the deprecated
    /// USE_MOCK_MCP is honored only when the canonical flag is absent.
    pub fn effective_use_mock_providers(&self) -> bool {
        if self.use_mock_providers_set {
            return self.use_mock_providers;
        }
        if let Some(legacy) = self.use_mock_mcp {
            return legacy;
        }
        self.use_mock_providers
    }

    pub fn is_legacy_mock_flag_used(&self) -> bool {
        self.use_mock_mcp.is_some() && !self.use_mock_providers_set
    }

    /// Gate policy snapshot from the values read at startup.
    pub fn gate_policy(&self) -> GatePolicy {
        GatePolicy {
            require_ci_pass: self.require_ci_pass,
            require_codeowner_review: self.require_codeowner_review,
            merge_method: self.merge_method.clone(),
        }
    }

    /// Gate policy re-read from the live environment. Called on every
    /// approve-merge request so operator changes take effect immediately.
    pub fn runtime_gate_policy(&self) -> GatePolicy {
        let dotenv = parse_dotenv();
        GatePolicy {
            require_ci_pass: get_bool("REQUIRE_CI_PASS", &dotenv, self.require_ci_pass),
            require_codeowner_review: get_bool(
                "REQUIRE_CODEOWNER_REVIEW",
                &dotenv,
                self.require_codeowner_review,
            ),
            merge_method: get_str("MERGE_METHOD", &dotenv, &self.merge_method),
        }
    }
}
