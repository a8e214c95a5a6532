//! Alert-to-prompt builder.
//!
//! Pure over its inputs: an alert JSON body goes in, the assembled prompt
//! text plus the derived incident key (and the matched SOP id, when the
//! knowledge base has one) come out. The orchestrator never interprets the
//! prompt body.

use std::collections::HashSet;
use std::path::Path;

use log::warn;
use serde::Deserialize;
use serde_json::Value;

use crate::store::derive_sop_id;

/// Floor for the task-instructions budget so truncation never destroys the
/// document's preamble.
const MIN_TASK_DOC_BUDGET: usize = 800;

#[derive(Debug, Default, Deserialize)]
pub struct Alert {
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub group_id: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub threshold: Value,
}

/// One line of the SOP knowledge base (`*.jsonl` files).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SopLine {
    #[serde(default)]
    pub sop_id: String,
    #[serde(default)]
    pub incident_key: String,
    /// Match conditions, e.g. `svc:billing cat:cpu`.
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub priority: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub metric: Vec<String>,
    #[serde(default)]
    pub log: Vec<String>,
    #[serde(default)]
    pub parameter: Vec<String>,
    #[serde(default)]
    pub fix_action: Vec<String>,
}

#[derive(Debug)]
pub struct BuiltPrompt {
    pub prompt: String,
    pub incident_key: String,
    pub sop_id: Option<String>,
}

pub struct PromptBuilder {
    sop_lines: Vec<SopLine>,
    sop_enabled: bool,
    task_doc: String,
}

impl PromptBuilder {
    /// Load the SOP catalog and task instructions once at startup.
    pub fn new(sop_dir: &Path, sop_enabled: bool, task_doc_path: &Path, task_doc_budget: usize) -> Self {
        let sop_lines = if sop_enabled {
            load_sop_dir(sop_dir)
        } else {
            Vec::new()
        };
        let task_doc = std::fs::read_to_string(task_doc_path)
            .map(|doc| {
                let budget = task_doc_budget.max(MIN_TASK_DOC_BUDGET);
                trim_to_bytes_utf8(doc.trim(), budget)
            })
            .unwrap_or_default();
        Self {
            sop_lines,
            sop_enabled,
            task_doc,
        }
    }

    /// Build a prompt from a request body.
    ///
    /// A body that parses as an [`Alert`] (non-empty `service`) gets the
    /// full assembly: instruction header, task instructions, alert JSON and
    /// SOP context. A body carrying only a `prompt` field gets the header
    /// and task instructions. Anything else returns `None`.
    pub fn build(&self, raw: &[u8]) -> Option<BuiltPrompt> {
        let value: Value = serde_json::from_slice(raw).ok()?;

        if let Ok(alert) = serde_json::from_value::<Alert>(value.clone()) {
            if !alert.service.is_empty() {
                return Some(self.build_from_alert(&alert, &value));
            }
        }

        let user_prompt = ["prompt", "inputs.prompt", "data.prompt", "params.prompt"]
            .into_iter()
            .find_map(|path| dig_str(&value, path))?;
        let mut b = String::from("You are an AIOps assistant.\n");
        if !self.task_doc.is_empty() {
            b.push_str("## TASK INSTRUCTIONS\n");
            b.push_str(&self.task_doc);
            b.push_str("\n\n");
        }
        b.push_str("## USER QUERY\n");
        b.push_str(&user_prompt);
        b.push('\n');
        Some(BuiltPrompt {
            prompt: b,
            incident_key: extract_incident_key(&value).unwrap_or_default(),
            sop_id: None,
        })
    }

    fn build_from_alert(&self, alert: &Alert, raw: &Value) -> BuiltPrompt {
        let incident_key = incident_key(alert);
        let sop = if self.sop_enabled {
            self.sop_context(alert, &incident_key)
        } else {
            None
        };

        let mut alert_json = raw.clone();
        if let Some(th) = stringify_raw(&alert.threshold) {
            alert_json["threshold"] = Value::String(th);
        }

        let mut b = String::new();
        b.push_str("You are an AIOps root-cause assistant.\n");
        b.push_str("This is a SINGLE-TURN request. All data is COMPLETE below.\n");
        b.push_str("DO NOT ask me to continue. Start now and return ONLY the final result.\n\n");
        if !self.task_doc.is_empty() {
            b.push_str("## TASK INSTRUCTIONS (verbatim)\n");
            b.push_str(&self.task_doc);
            b.push_str("\n\n");
        }
        b.push_str("## ALERT JSON (complete)\n");
        b.push_str(&alert_json.to_string());
        b.push_str("\n\n");
        let sop_id = sop.map(|(text, id)| {
            b.push_str(&text);
            b.push('\n');
            id
        });

        BuiltPrompt {
            prompt: b,
            incident_key,
            sop_id,
        }
    }

    /// Resolve the SOP entry for `alert` and render its knowledge block.
    fn sop_context(&self, alert: &Alert, incident_key: &str) -> Option<(String, String)> {
        if self.sop_lines.is_empty() {
            return None;
        }
        let expected = derive_sop_id(incident_key);

        let exact = self.sop_lines.iter().find(|l| l.sop_id == expected);
        let matched = match exact {
            Some(line) => line,
            None => {
                let mut hits: Vec<&SopLine> = self
                    .sop_lines
                    .iter()
                    .filter(|l| key_matches(&l.keys, alert))
                    .collect();
                if hits.is_empty() {
                    return None;
                }
                hits.sort_by_key(|l| priority_rank(&l.priority));
                hits[0]
            }
        };

        let sop_id = if matched.sop_id.is_empty() {
            expected
        } else {
            matched.sop_id.clone()
        };

        let mut b = String::new();
        b.push_str("### [SOP] Preloaded knowledge (high priority)\n");
        b.push_str(&format!("Matched SOP ID: {sop_id}\n"));
        if !matched.incident_key.is_empty() {
            b.push_str(&format!("Incident Key: {}\n", matched.incident_key));
        }
        b.push('\n');

        let mut seen = HashSet::new();
        let mut append = |prefix: &str, items: &[String], limit: usize| {
            let mut count = 0;
            for item in items {
                let item = item.trim();
                if item.is_empty() {
                    continue;
                }
                let rendered = substitute_templates(item, alert);
                let dedup_key = format!("{prefix}::{rendered}");
                if !seen.insert(dedup_key) {
                    continue;
                }
                b.push_str(&format!("- {prefix}: {rendered}\n"));
                count += 1;
                if count >= limit {
                    break;
                }
            }
        };
        append("Command", &matched.command, 5);
        append("Metric", &matched.metric, 5);
        append("Log", &matched.log, 3);
        append("Parameter", &matched.parameter, 3);
        append("FixAction", &matched.fix_action, 3);

        Some((b, sop_id))
    }
}

/// Normalized `service_category_severity_region[_alertname][_groupid]`.
pub fn incident_key(alert: &Alert) -> String {
    let alert_name = alert
        .metadata
        .get("alert_name")
        .or_else(|| alert.metadata.get("alertname"))
        .and_then(Value::as_str)
        .unwrap_or_default();

    let mut parts = vec![
        normalize(&alert.service),
        normalize(&alert.category),
        normalize(&alert.severity),
        normalize(&alert.region),
    ];
    if !alert_name.is_empty() {
        parts.push(normalize(alert_name));
    }
    if !alert.group_id.is_empty() {
        parts.push(normalize(&alert.group_id));
    }
    parts.join("_")
}

fn normalize(s: &str) -> String {
    s.replace([' ', '-'], "_").to_lowercase()
}

fn priority_rank(priority: &str) -> u8 {
    match priority.to_ascii_uppercase().as_str() {
        "HIGH" => 0,
        "MIDDLE" => 1,
        "LOW" => 2,
        _ => 3,
    }
}

/// Match `keys` like `svc:billing` / `cat:cpu*` against the alert. All
/// present conditions must hold and at least one must match.
fn key_matches(keys: &[String], alert: &Alert) -> bool {
    if keys.is_empty() {
        return false;
    }
    let mut matches = 0;
    for key in keys {
        let key = key.trim().to_lowercase();
        let Some((field, pattern)) = key.split_once(':') else {
            continue;
        };
        let value = match field {
            "svc" | "service" => alert.service.to_lowercase(),
            "cat" | "category" => alert.category.to_lowercase(),
            "sev" | "severity" => alert.severity.to_lowercase(),
            "region" => alert.region.to_lowercase(),
            _ => continue,
        };
        if wildcard_match(pattern, &value) {
            matches += 1;
        } else {
            return false;
        }
    }
    matches > 0
}

/// Glob-lite matching: `*` spans anything, everything else is literal.
fn wildcard_match(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if !pattern.contains('*') {
        return pattern == value;
    }
    let segments: Vec<&str> = pattern.split('*').collect();
    let mut rest = value;
    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(segment) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == segments.len() - 1 && !pattern.ends_with('*') {
            return rest.ends_with(segment);
        } else {
            match rest.find(segment) {
                Some(pos) => rest = &rest[pos + segment.len()..],
                None => return false,
            }
        }
    }
    true
}

/// Fill `{{…}}` placeholders in a SOP entry from the alert.
fn substitute_templates(entry: &str, alert: &Alert) -> String {
    let meta = &alert.metadata;
    let get = |keys: &[&str]| -> String {
        keys.iter()
            .find_map(|k| meta.get(k).and_then(Value::as_str))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or_default()
            .to_string()
    };

    let mut out = entry.to_string();
    if let Some(expr) = meta.get("expression").and_then(Value::as_str) {
        if !expr.is_empty() {
            out = out.replace("{{expression}}", expr);
        }
    }
    if !alert.path.is_empty() {
        out = out.replace("{{alert_path}}", &alert.path);
    }
    if !alert.service.is_empty() {
        out = out.replace("{{service_name}}", &alert.service);
    }

    let mut start = get(&["alert_start_time", "start_time", "start", "startsAt"]);
    if start.is_empty() {
        start = "now-10m".to_string();
    }
    let mut end = get(&["alert_end_time", "end_time", "end", "endsAt"]);
    if end.is_empty() {
        end = "now".to_string();
    }
    out = out.replace("{{alert_start_time}}", &start);
    out = out.replace("{{alert_end_time}}", &end);
    out
}

/// Render a raw JSON value the way an operator wrote it: strings verbatim,
/// everything else re-serialized.
fn stringify_raw(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Look up a dotted path, e.g. `inputs.prompt`.
fn dig_str(value: &Value, path: &str) -> Option<String> {
    let mut cur = value;
    for part in path.split('.') {
        cur = cur.get(part)?;
    }
    cur.as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

/// Candidate locations for an explicit incident key in a free-form body.
pub fn extract_incident_key(value: &Value) -> Option<String> {
    [
        "incident_key",
        "incidentKey",
        "inputs.incident_key",
        "inputs.incidentKey",
        "data.incident_key",
        "data.incidentKey",
        "metadata.group_id",
        "group_id",
    ]
    .into_iter()
    .find_map(|path| dig_str(value, path))
}

/// Byte-budget truncation that never cuts inside a UTF-8 sequence.
fn trim_to_bytes_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut cut = max_bytes;
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}\n...", &s[..cut])
}

fn load_sop_dir(dir: &Path) -> Vec<SopLine> {
    let mut lines = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().is_some_and(|e| e == "jsonl") {
                lines.extend(load_sop_file(&path));
            }
        }
    }
    lines
}

fn load_sop_file(path: &Path) -> Vec<SopLine> {
    let Ok(contents) = std::fs::read_to_string(path) else {
        warn!("sop: unreadable file {}", path.display());
        return Vec::new();
    };
    contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn alert(service: &str, category: &str) -> Alert {
        Alert {
            service: service.to_string(),
            category: category.to_string(),
            severity: "critical".to_string(),
            region: "us-west-2".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_incident_key_normalization() {
        let mut a = alert("Billing API", "cpu-load");
        a.group_id = "G 1".to_string();
        a.metadata = json!({"alert_name": "High CPU"});
        assert_eq!(
            incident_key(&a),
            "billing_api_cpu_load_critical_us_west_2_high_cpu_g_1"
        );
    }

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("*", "anything"));
        assert!(wildcard_match("billing", "billing"));
        assert!(!wildcard_match("billing", "billing-api"));
        assert!(wildcard_match("billing*", "billing-api"));
        assert!(wildcard_match("*api", "billing-api"));
        assert!(wildcard_match("bil*api", "billing-api"));
        assert!(!wildcard_match("bil*web", "billing-api"));
    }

    #[test]
    fn test_key_matches() {
        let a = alert("billing", "cpu");
        assert!(key_matches(&["svc:billing".to_string()], &a));
        assert!(key_matches(
            &["svc:bil*".to_string(), "cat:cpu".to_string()],
            &a
        ));
        assert!(!key_matches(
            &["svc:billing".to_string(), "cat:memory".to_string()],
            &a
        ));
        assert!(!key_matches(&[], &a));
        // Unknown fields are skipped, not failed.
        assert!(key_matches(
            &["zone:eu".to_string(), "svc:billing".to_string()],
            &a
        ));
    }

    #[test]
    fn test_template_substitution() {
        let mut a = alert("billing", "cpu");
        a.metadata = json!({"expression": "rate(cpu[5m]) > 0.9", "start_time": "t0"});
        let out = substitute_templates(
            "check {{expression}} for {{service_name}} from {{alert_start_time}} to {{alert_end_time}}",
            &a,
        );
        assert_eq!(out, "check rate(cpu[5m]) > 0.9 for billing from t0 to now");
    }

    #[test]
    fn test_trim_to_bytes_respects_utf8() {
        let s = "héllo wörld";
        let trimmed = trim_to_bytes_utf8(s, 3);
        assert!(trimmed.starts_with("h"));
        assert!(!trimmed.contains('\u{fffd}'));
        assert_eq!(trim_to_bytes_utf8("short", 100), "short");
    }

    #[test]
    fn test_build_from_plain_prompt_body() {
        let builder = PromptBuilder::new(
            Path::new("/nonexistent"),
            false,
            Path::new("/nonexistent"),
            2048,
        );
        let built = builder
            .build(br#"{"incident_key": "K1", "prompt": "why is it down"}"#)
            .unwrap();
        assert!(built.prompt.contains("## USER QUERY\nwhy is it down"));
        assert_eq!(built.incident_key, "K1");
        assert!(built.sop_id.is_none());
    }

    #[test]
    fn test_build_from_alert_body() {
        let builder = PromptBuilder::new(
            Path::new("/nonexistent"),
            false,
            Path::new("/nonexistent"),
            2048,
        );
        let body = json!({
            "service": "billing",
            "category": "cpu",
            "severity": "critical",
            "region": "eu-central-1",
        });
        let built = builder.build(body.to_string().as_bytes()).unwrap();
        assert!(built.prompt.contains("## ALERT JSON (complete)"));
        assert_eq!(built.incident_key, "billing_cpu_critical_eu_central_1");
    }

    #[test]
    fn test_build_rejects_unusable_body() {
        let builder = PromptBuilder::new(
            Path::new("/nonexistent"),
            false,
            Path::new("/nonexistent"),
            2048,
        );
        assert!(builder.build(b"{\"unrelated\": true}").is_none());
        assert!(builder.build(b"not json").is_none());
    }

    #[test]
    fn test_sop_catalog_matching() {
        let dir = tempfile::tempdir().unwrap();
        let sop = dir.path().join("base.jsonl");
        std::fs::write(
            &sop,
            concat!(
                "# comment line\n",
                r#"{"sop_id": "sop_low", "keys": ["svc:billing"], "priority": "LOW", "command": ["check disk"]}"#,
                "\n",
                r#"{"sop_id": "sop_high", "keys": ["svc:billing", "cat:cpu"], "priority": "HIGH", "command": ["top -b", "top -b"], "metric": ["cpu_usage{{service_name}}"]}"#,
                "\n",
            ),
        )
        .unwrap();
        let builder =
            PromptBuilder::new(dir.path(), true, Path::new("/nonexistent"), 2048);
        let a = alert("billing", "cpu");
        let (text, sop_id) = builder.sop_context(&a, &incident_key(&a)).unwrap();
        assert_eq!(sop_id, "sop_high");
        assert!(text.contains("Matched SOP ID: sop_high"));
        // Duplicates collapse.
        assert_eq!(text.matches("top -b").count(), 1);
        assert!(text.contains("cpu_usagebilling"));
    }
}
