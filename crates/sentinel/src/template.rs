//! Alert text rendering with Tera.

use serde_json::{json, Value};
use tera::{Context, Tera};

use crate::{anomaly::Anomaly, Error, Result};

pub const DEFAULT_TITLE_TEMPLATE: &str =
    "[{{ severity | upper }}] {{ kind }} in run {{ run_id }} ({{ target }})";

pub const DEFAULT_BODY_TEMPLATE: &str = r#"{{ message }}
Run: {{ run_id }}
Target: {{ target }}
Severity: {{ severity }}
{% if subsystem %}Subsystem: {{ subsystem }}
{% endif %}First seen: {{ first_seen }}
Last seen: {{ last_seen }} (seen {{ repeat_count }}x)
Evidence: {{ evidence_count }} item(s)
Fingerprint: {{ fingerprint }}"#;

fn to_context(value: &Value) -> Context {
    let mut context = Context::new();
    match value {
        Value::Object(map) => {
            for (key, value) in map {
                context.insert(key, value);
            }
        }
        // If not an object, make it available as "data"
        _ => context.insert("data", value),
    }
    context
}

/// Parsed title/body templates for alerts.
#[derive(Debug, Clone)]
pub struct AlertTemplates {
    tera: Tera,
}

impl AlertTemplates {
    /// Build from the defaults, replacing the body when `body` is given.
    pub fn new(body: Option<&str>) -> Result<Self> {
        let mut tera = Tera::default();
        tera.add_raw_templates(vec![
            ("title", DEFAULT_TITLE_TEMPLATE),
            ("body", body.unwrap_or(DEFAULT_BODY_TEMPLATE)),
        ])
        .map_err(|e| Error::Config(format!("Invalid alert template: {}", e)))?;
        Ok(Self { tera })
    }

    /// `(title, body)` for an anomaly.
    pub fn render(&self, anomaly: &Anomaly) -> Result<(String, String)> {
        let context = to_context(&anomaly_context(anomaly));
        let title = self.tera.render("title", &context)?;
        let body = self.tera.render("body", &context)?;
        Ok((title, body))
    }
}

fn anomaly_context(anomaly: &Anomaly) -> Value {
    json!({
        "run_id": anomaly.key.run_id,
        "kind": anomaly.kind().as_str(),
        "target": anomaly.key.target,
        "severity": anomaly.severity.to_string(),
        "message": anomaly.message,
        "subsystem": anomaly.subsystem,
        "first_seen": anomaly.first_seen.to_rfc3339(),
        "last_seen": anomaly.last_seen.to_rfc3339(),
        "repeat_count": anomaly.repeat_count,
        "evidence_count": anomaly.evidence.len(),
        "fingerprint": anomaly.key.fingerprint(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::{AnomalyKind, DedupKey, Severity};
    use chrono::Utc;

    fn anomaly() -> Anomaly {
        let mut a = Anomaly::new(
            DedupKey::new("gha-7", AnomalyKind::PodCrashLoop, "api-0"),
            Severity::Critical,
            "pod api-0 crashed 4 times within 600s",
            vec![],
            Utc::now(),
        );
        a.subsystem = Some("api".into());
        a
    }

    #[test]
    fn default_templates_render_key_fields() {
        let templates = AlertTemplates::new(None).unwrap();
        let (title, body) = templates.render(&anomaly()).unwrap();
        assert_eq!(title, "[CRITICAL] POD_CRASH_LOOP in run gha-7 (api-0)");
        assert!(body.starts_with("pod api-0 crashed 4 times"));
        assert!(body.contains("Subsystem: api"));
    }

    #[test]
    fn body_override_is_used() {
        let templates = AlertTemplates::new(Some("{{ kind }} on {{ target }}")).unwrap();
        let (_, body) = templates.render(&anomaly()).unwrap();
        assert_eq!(body, "POD_CRASH_LOOP on api-0");
    }

    #[test]
    fn broken_override_is_a_config_error() {
        assert!(matches!(
            AlertTemplates::new(Some("{{ unclosed")),
            Err(Error::Config(_))
        ));
    }
}
