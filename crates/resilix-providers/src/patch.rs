use regex::Regex;

use resilix_core::types::RemediationRequest;

// ── Patch engine ─────────────────────────────────────────────────────────
//
// Rewrites the remediation target so the opened PR carries a diff that
// downstream CI can actually evaluate. Three artifact archetypes are
// recognized; everything else receives the legacy audit-comment file.

/// Upstream resolvers substituted into a resolver config when the forward
/// directive is rewritten.
const SAFE_RESOLVERS: &str = "1.1.1.1 8.8.8.8 9.9.9.9";

const DEFAULT_TIMEOUT_SECONDS: u32 = 30;
const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemediationTarget {
    ResolverConfig,
    DependencyConfig,
    AppHandler,
    Audit,
}

#[derive(Debug, Clone)]
pub struct PatchOutcome {
    pub content: String,
    pub diff_old_line: Option<String>,
    pub diff_new_line: Option<String>,
}

pub fn classify_target(target_file: &str) -> RemediationTarget {
    let path = target_file.to_lowercase();
    let is_yaml = path.ends_with(".yaml") || path.ends_with(".yml");
    if is_yaml && path.contains("dependencies") {
        return RemediationTarget::DependencyConfig;
    }
    if is_yaml && (path.contains("service-config") || path.contains("resolver")) {
        return RemediationTarget::ResolverConfig;
    }
    if path.contains("handler")
        || path.ends_with(".py")
        || path.ends_with(".js")
        || path.ends_with(".ts")
        || path.ends_with(".go")
        || path.ends_with(".rs")
    {
        return RemediationTarget::AppHandler;
    }
    RemediationTarget::Audit
}

/// Produce the patched file content and a one-line diff preview for the
/// target. `existing` is the file as currently found on the fix branch.
pub fn render_remediation(
    target_file: &str,
    existing: Option<&str>,
    request: &RemediationRequest,
) -> PatchOutcome {
    let target = classify_target(target_file);
    let content = match target {
        RemediationTarget::ResolverConfig => rewrite_resolver_config(existing),
        RemediationTarget::DependencyConfig => rewrite_dependency_config(existing),
        RemediationTarget::AppHandler => rewrite_app_handler(existing),
        RemediationTarget::Audit => audit_comment_file(request),
    };
    let (diff_old_line, diff_new_line) = diff_preview(existing, &content, target);
    PatchOutcome {
        content,
        diff_old_line,
        diff_new_line,
    }
}

// ── Resolver config (YAML) ───────────────────────────────────────────────

fn rewrite_resolver_config(existing: Option<&str>) -> String {
    let Some(existing) = existing.filter(|c| !c.trim().is_empty()) else {
        return format!(
            "resolver:\n  forward: {SAFE_RESOLVERS}\n  failover_mode: \"AUTO\"\n"
        );
    };

    let mut saw_forward = false;
    let mut saw_failover = false;
    let mut lines: Vec<String> = Vec::new();
    for line in existing.lines() {
        let trimmed = line.trim_start();
        let indent = &line[..line.len() - trimmed.len()];
        if trimmed.starts_with("forward:") {
            saw_forward = true;
            lines.push(format!("{indent}forward: {SAFE_RESOLVERS}"));
        } else if trimmed.starts_with("failover_mode:") {
            saw_failover = true;
            lines.push(format!("{indent}failover_mode: \"AUTO\""));
        } else {
            lines.push(line.to_string());
        }
    }
    if !saw_forward {
        lines.push(format!("forward: {SAFE_RESOLVERS}"));
    }
    if !saw_failover {
        lines.push("failover_mode: \"AUTO\"".to_string());
    }
    let mut content = lines.join("\n");
    content.push('\n');
    content
}

// ── Dependencies file (YAML) ─────────────────────────────────────────────

fn rewrite_dependency_config(existing: Option<&str>) -> String {
    let remediation_block = format!(
        "resilix_remediation:\n  timeout_seconds: {DEFAULT_TIMEOUT_SECONDS}\n  \
         max_retries: {DEFAULT_MAX_RETRIES}\n  circuit_breaker_enabled: true\n"
    );
    let Some(existing) = existing.filter(|c| !c.trim().is_empty()) else {
        return remediation_block;
    };

    // Regexes are static-shaped; construction can't fail at runtime.
    let timeout_re = Regex::new(r"(?m)^(\s*[A-Za-z0-9_-]*timeout[A-Za-z0-9_-]*\s*:\s*)\S+\s*$");
    let retry_re = Regex::new(r"(?m)^(\s*(?:max_)?retr(?:y_count|ies)\s*:\s*)\S+\s*$");
    let breaker_re = Regex::new(r"(?m)^(\s*circuit_breaker(?:_enabled)?\s*:\s*)\S+\s*$");
    let (Ok(timeout_re), Ok(retry_re), Ok(breaker_re)) = (timeout_re, retry_re, breaker_re)
    else {
        return existing.to_string();
    };

    let mut touched = false;
    let mut content = existing.to_string();
    if timeout_re.is_match(&content) {
        touched = true;
        content = timeout_re
            .replace_all(&content, format!("${{1}}{DEFAULT_TIMEOUT_SECONDS}"))
            .into_owned();
    }
    if retry_re.is_match(&content) {
        touched = true;
        content = retry_re
            .replace_all(&content, format!("${{1}}{DEFAULT_MAX_RETRIES}"))
            .into_owned();
    }
    if breaker_re.is_match(&content) {
        touched = true;
        content = breaker_re.replace_all(&content, "${1}true").into_owned();
    }

    if !touched {
        if !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(&remediation_block);
    } else if !content.ends_with('\n') {
        content.push('\n');
    }
    content
}

// ── Application handler (source) ─────────────────────────────────────────

// The helper body deliberately avoids the call-site shapes the rewriter
// matches, so a re-driven rewrite leaves an already-patched file unchanged.
const GUARDED_CALL_HELPER: &str = r#"

class UpstreamCallError(RuntimeError):
    """Typed wrapper for upstream transport failures."""


def resilient_get(url, timeout=2.0, **kwargs):
    try:
        return requests.request("GET", url, timeout=timeout, **kwargs)
    except requests.RequestException as exc:
        raise UpstreamCallError(str(exc)) from exc
"#;

fn rewrite_app_handler(existing: Option<&str>) -> String {
    let Some(existing) = existing.filter(|c| !c.trim().is_empty()) else {
        return format!(
            "import requests\n{}",
            GUARDED_CALL_HELPER.trim_start_matches('\n')
        );
    };

    let mut content = existing
        .replace("requests.get(", "resilient_get(")
        .replace("httpx.get(", "resilient_get(")
        .replace("http_client.get(", "resilient_get(");

    // Inject the guarded wrapper once at end-of-file.
    if !content.contains("def resilient_get") {
        if !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(GUARDED_CALL_HELPER.trim_start_matches('\n'));
    }
    content
}

// ── Legacy audit comment ─────────────────────────────────────────────────

fn audit_comment_file(request: &RemediationRequest) -> String {
    format!(
        "# Resilix automated remediation\n# Incident: {}\n# Action: {}\n# Summary: {}\n",
        request.incident_id,
        request.action.as_str(),
        request.summary,
    )
}

// ── Diff preview ─────────────────────────────────────────────────────────

/// First differing non-blank line pair between old and new content, or a
/// target-typed default when there is nothing to compare against.
fn diff_preview(
    existing: Option<&str>,
    patched: &str,
    target: RemediationTarget,
) -> (Option<String>, Option<String>) {
    if let Some(existing) = existing.filter(|c| !c.trim().is_empty()) {
        let old_lines: Vec<&str> = existing.lines().collect();
        let new_lines: Vec<&str> = patched.lines().collect();
        let max = old_lines.len().max(new_lines.len());
        for i in 0..max {
            let old = old_lines.get(i).copied().unwrap_or("");
            let new = new_lines.get(i).copied().unwrap_or("");
            if old.trim() == new.trim() {
                continue;
            }
            if old.trim().is_empty() && new.trim().is_empty() {
                continue;
            }
            let to_opt = |s: &str| {
                if s.trim().is_empty() {
                    None
                } else {
                    Some(s.to_string())
                }
            };
            return (to_opt(old), to_opt(new));
        }
        return (None, None);
    }

    let new_line = patched
        .lines()
        .find(|l| !l.trim().is_empty())
        .map(str::to_string);
    let old_line = match target {
        RemediationTarget::ResolverConfig => Some("forward: <unset>".to_string()),
        RemediationTarget::DependencyConfig => Some("resilix_remediation: <absent>".to_string()),
        RemediationTarget::AppHandler => Some("resilient_get: <absent>".to_string()),
        RemediationTarget::Audit => None,
    };
    (old_line, new_line)
}
