use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::types::{AlertEnrichment, SentinelTrace, Severity, SignalScores, ValidatedAlert};

// ── Signal weights ───────────────────────────────────────────────────────

const WEIGHT_ERROR_RATE_HIGH: f64 = 3.0;
const WEIGHT_HEALTH_FLAPPING: f64 = 3.0;
const WEIGHT_BACKLOG_GROWTH: f64 = 2.0;
const WEIGHT_DEPENDENCY_TIMEOUT: f64 = 2.0;

/// Queue depth above which a log entry counts as backlog growth.
const BACKLOG_QUEUE_DEPTH: f64 = 200_000.0;

// ── Fallback hook ────────────────────────────────────────────────────────

/// Input handed to the opaque fallback when deterministic triage is
/// ambiguous (low score or no signal fired).
#[derive(Debug, Clone)]
pub struct FallbackContext {
    pub incident_id: String,
    pub signal_hits: SignalScores,
    pub score: f64,
    pub labels: Value,
    pub annotations: Value,
}

/// Verdict returned by the fallback; absent fields leave the deterministic
/// result untouched.
#[derive(Debug, Clone, Default)]
pub struct FallbackVerdict {
    pub severity: Option<Severity>,
    pub is_actionable: Option<bool>,
    pub triage_reason: Option<String>,
    pub confidence_score: Option<f64>,
}

pub trait SignalFallback: Send + Sync {
    fn assess(&self, ctx: &FallbackContext) -> Option<FallbackVerdict>;
}

impl<F> SignalFallback for F
where
    F: Fn(&FallbackContext) -> Option<FallbackVerdict> + Send + Sync,
{
    fn assess(&self, ctx: &FallbackContext) -> Option<FallbackVerdict> {
        self(ctx)
    }
}

// ── Payload helpers ──────────────────────────────────────────────────────

pub(crate) fn parse_dt(value: Option<&Value>) -> DateTime<Utc> {
    let Some(Value::String(s)) = value else {
        return Utc::now();
    };
    DateTime::parse_from_rfc3339(&s.replace('Z', "+00:00"))
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn first_alert(payload: &Value) -> &Value {
    payload
        .get("alerts")
        .and_then(Value::as_array)
        .and_then(|a| a.first())
        .filter(|a| a.is_object())
        .unwrap_or(payload)
}

fn alert_text(alert: &Value) -> String {
    let labels = alert.get("labels");
    let annotations = alert.get("annotations");
    let mut parts: Vec<&str> = Vec::new();
    for value in [
        labels.and_then(|l| l.get("alertname")),
        labels.and_then(|l| l.get("severity")),
        annotations.and_then(|a| a.get("summary")),
        annotations.and_then(|a| a.get("description")),
    ]
    .into_iter()
    .flatten()
    {
        if let Some(s) = value.as_str() {
            parts.push(s);
        }
    }
    parts.join(" ").to_lowercase()
}

fn log_text(entry: &Value) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for key in ["event", "message", "component"] {
        if let Some(s) = entry.get(key).and_then(Value::as_str) {
            parts.push(s);
        }
    }
    parts.join(" ").to_lowercase()
}

// ── Signal collection ────────────────────────────────────────────────────

fn collect_signal_hits(payload: &Value) -> SignalScores {
    let mut hits = SignalScores::default();

    // Explicit signal names supplied by upstream tooling.
    if let Some(signals) = payload.get("signals").and_then(Value::as_array) {
        for signal in signals.iter().filter_map(Value::as_str) {
            match signal {
                "error_rate_high" => hits.error_rate_high += 1,
                "health_flapping" => hits.health_flapping += 1,
                "backlog_growth" => hits.backlog_growth += 1,
                "dependency_timeout" => hits.dependency_timeout += 1,
                _ => {}
            }
        }
    }

    if let Some(alerts) = payload.get("alerts").and_then(Value::as_array) {
        for alert in alerts.iter().filter(|a| a.is_object()) {
            let text = alert_text(alert);
            if text.contains("error") || text.contains("5xx") || text.contains("higherrorrate") {
                hits.error_rate_high += 1;
            }
            if text.contains("flapping") || text.contains("alternating") {
                hits.health_flapping += 1;
            }
            if text.contains("timeout") || text.contains("timed out") {
                hits.dependency_timeout += 1;
            }
        }
    }

    if let Some(entries) = payload.get("log_entries").and_then(Value::as_array) {
        for entry in entries.iter().filter(|e| e.is_object()) {
            let text = log_text(entry);
            if text.contains("flapping") || text.contains("alternating") {
                hits.health_flapping += 1;
            }
            let queue_depth = entry
                .get("metadata")
                .and_then(|m| m.get("queue_depth"))
                .and_then(Value::as_f64);
            if queue_depth.is_some_and(|d| d > BACKLOG_QUEUE_DEPTH) {
                hits.backlog_growth += 1;
            }
            if text.contains("timeout") || text.contains("timed out") {
                hits.dependency_timeout += 1;
            }
        }
    }

    hits
}

fn score_signals(hits: &SignalScores) -> f64 {
    let mut score = 0.0;
    for (count, weight) in [
        (hits.error_rate_high, WEIGHT_ERROR_RATE_HIGH),
        (hits.health_flapping, WEIGHT_HEALTH_FLAPPING),
        (hits.backlog_growth, WEIGHT_BACKLOG_GROWTH),
        (hits.dependency_timeout, WEIGHT_DEPENDENCY_TIMEOUT),
    ] {
        if count == 0 {
            continue;
        }
        score += weight;
        // Each repeat beyond the first adds 0.5, capped at 3 extra hits.
        score += f64::from((count - 1).min(3)) * 0.5;
    }
    score
}

fn total_hits(hits: &SignalScores) -> u32 {
    hits.error_rate_high + hits.health_flapping + hits.backlog_growth + hits.dependency_timeout
}

fn severity_from_score(score: f64, label: &str) -> Severity {
    let from_score = if score >= 6.0 {
        Severity::Critical
    } else if score >= 4.0 {
        Severity::High
    } else if score >= 2.0 {
        Severity::Medium
    } else {
        Severity::Low
    };
    // A label-supplied severity is honored only when stricter.
    match Severity::parse(label) {
        Some(from_label) if from_label.rank() > from_score.rank() => from_label,
        _ => from_score,
    }
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

// ── Entry point ──────────────────────────────────────────────────────────

/// Deterministic triage over a raw webhook payload. Identical payloads
/// always produce identical severity, signal scores and weighted score.
pub fn evaluate_alert(
    payload: &Value,
    incident_id: &str,
    fallback: Option<&dyn SignalFallback>,
) -> (ValidatedAlert, SentinelTrace) {
    let alert = first_alert(payload);
    let labels = alert.get("labels").cloned().unwrap_or(Value::Null);
    let annotations = alert.get("annotations").cloned().unwrap_or(Value::Null);

    let hits = collect_signal_hits(payload);
    let score = score_signals(&hits);
    let mut deterministic_confidence = (0.45 + score * 0.06).min(0.95);
    let ambiguous = score < 2.5 || total_hits(&hits) == 0;

    let label_severity = labels
        .get("severity")
        .and_then(Value::as_str)
        .unwrap_or("high");
    let mut severity = severity_from_score(score, label_severity);
    let mut is_actionable = score >= 2.0
        || payload
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("firing")
            .eq_ignore_ascii_case("firing");
    let mut triage_reason = if total_hits(&hits) > 0 {
        let mut parts = Vec::new();
        for (name, count) in [
            ("backlog_growth", hits.backlog_growth),
            ("dependency_timeout", hits.dependency_timeout),
            ("error_rate_high", hits.error_rate_high),
            ("health_flapping", hits.health_flapping),
        ] {
            if count > 0 {
                parts.push(format!("{name}:{count}"));
            }
        }
        format!("Signals detected: {}", parts.join(", "))
    } else {
        "No deterministic incident signals were detected.".to_string()
    };
    let mut used_llm_fallback = false;

    if ambiguous {
        if let Some(hook) = fallback {
            let ctx = FallbackContext {
                incident_id: incident_id.to_string(),
                signal_hits: hits,
                score,
                labels: labels.clone(),
                annotations,
            };
            if let Some(verdict) = hook.assess(&ctx) {
                used_llm_fallback = true;
                if let Some(s) = verdict.severity {
                    severity = s;
                }
                if let Some(a) = verdict.is_actionable {
                    is_actionable = a;
                }
                if let Some(reason) = verdict.triage_reason {
                    triage_reason = reason;
                }
                if let Some(confidence) = verdict.confidence_score {
                    deterministic_confidence = confidence;
                }
            }
        }
    }

    let triggered_at = parse_dt(alert.get("startsAt"));
    let error_type = labels
        .get("alertname")
        .and_then(Value::as_str)
        .unwrap_or("UnknownAlert")
        .to_string();
    let service_name = labels
        .get("service")
        .and_then(Value::as_str)
        .unwrap_or("unknown-service")
        .to_string();
    let affected_endpoints = labels
        .get("endpoint")
        .and_then(Value::as_str)
        .map(|e| vec![e.to_string()])
        .unwrap_or_default();
    // Heuristic enrichment only; not a semantic error-rate measurement.
    let error_rate = 1.0 + score;

    let validated = ValidatedAlert {
        alert_id: incident_id.to_string(),
        is_actionable,
        severity,
        service_name,
        error_type,
        error_rate: round3(error_rate),
        affected_endpoints,
        triggered_at,
        enrichment: AlertEnrichment {
            signal_scores: hits,
            weighted_score: score,
            used_llm_fallback,
            deterministic_confidence: round3(deterministic_confidence),
        },
        triage_reason,
    };
    let trace = SentinelTrace {
        signal_scores: hits,
        weighted_score: score,
        ambiguous,
        used_llm_fallback,
        deterministic_confidence: round3(deterministic_confidence),
    };
    (validated, trace)
}
