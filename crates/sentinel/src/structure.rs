use serde::{Deserialize, Serialize};

/// Test suites whose second path component names the subsystem
/// (`tests/integration/api/...` belongs to `api`).
const SUITES: &[&str] = &[
    "integration",
    "load",
    "performance",
    "security",
    "infrastructure",
    "unit",
    "e2e",
];

/// Maps a path prefix to a subsystem name; the longest matching prefix wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubsystemRule {
    pub prefix: String,
    pub subsystem: String,
}

/// Classifies a failing test (by pytest node id) into the subsystem it exercises.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StructureAnalyzer {
    rules: Vec<SubsystemRule>,
}

impl StructureAnalyzer {
    pub fn new(rules: Vec<SubsystemRule>) -> Self {
        Self { rules }
    }

    /// Parse `prefix=subsystem` pairs separated by commas.
    pub fn from_spec(spec: &str) -> Self {
        let rules = spec
            .split(',')
            .filter_map(|pair| {
                let (prefix, subsystem) = pair.split_once('=')?;
                let (prefix, subsystem) = (prefix.trim(), subsystem.trim());
                if prefix.is_empty() || subsystem.is_empty() {
                    return None;
                }
                Some(SubsystemRule {
                    prefix: prefix.to_string(),
                    subsystem: subsystem.to_string(),
                })
            })
            .collect();
        Self { rules }
    }

    pub fn classify(&self, node_id: &str) -> Option<String> {
        let path = node_id.split("::").next().unwrap_or(node_id);

        if let Some(rule) = self
            .rules
            .iter()
            .filter(|r| path.starts_with(r.prefix.as_str()))
            .max_by_key(|r| r.prefix.len())
        {
            return Some(rule.subsystem.clone());
        }

        let mut parts = path.split('/').filter(|p| !p.is_empty());
        let mut first = parts.next()?;
        if first == "tests" {
            first = parts.next()?;
        }
        if SUITES.contains(&first) {
            let area = parts.next()?;
            if area.ends_with(".py") {
                return Some(first.to_string());
            }
            return Some(area.to_string());
        }
        if first.ends_with(".py") {
            return None;
        }
        Some(first.to_string())
    }
}
