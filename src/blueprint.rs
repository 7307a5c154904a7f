//! The Blueprint contract handed from the navigator to the coder.
//!
//! The navigator answers in free text that should contain one JSON object
//! with exactly these fields:
//!
//! ```json
//! {
//!   "target_url": "https://…",
//!   "description": "what is collected and why",
//!   "data_fields": ["country", "population"],
//!   "page_handling": "single page",
//!   "element_selectors": {"country": "td:nth-child(1)", "population": "td:nth-child(2)"},
//!   "special_handling": "requires JS rendering"
//! }
//! ```
//!
//! Nothing here rejects a Blueprint: [`inspect`] reports issues and the
//! caller decides what to do with them.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const FIELDS: [&str; 6] = [
    "target_url",
    "description",
    "data_fields",
    "page_handling",
    "element_selectors",
    "special_handling",
];

/// Structured description of a data-collection target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Blueprint {
    #[serde(default)]
    pub target_url: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub data_fields: Vec<String>,
    #[serde(default)]
    pub page_handling: String,
    #[serde(default)]
    pub element_selectors: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "flags_as_text")]
    pub special_handling: String,
}

/// Navigators sometimes emit special handling as a list or object of flags.
fn flags_as_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Null => String::new(),
        Value::String(s) => s,
        Value::Array(items) => items
            .iter()
            .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    })
}

/// A defect found in a Blueprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlueprintIssue {
    MissingField(&'static str),
    NoDataFields,
    InvalidTargetUrl(String),
    /// A data field without a selector mapping.
    MissingSelector(String),
    EmptySelector(String),
}

impl fmt::Display for BlueprintIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingField(name) => write!(f, "field `{}` is missing", name),
            Self::NoDataFields => write!(f, "`data_fields` is empty"),
            Self::InvalidTargetUrl(url) => write!(f, "`target_url` is not a valid URL: {:?}", url),
            Self::MissingSelector(field) => {
                write!(f, "data field `{}` has no entry in `element_selectors`", field)
            }
            Self::EmptySelector(field) => write!(f, "selector for `{}` is empty", field),
        }
    }
}

/// Why no Blueprint could be read from a text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlueprintError {
    #[error("no JSON object found in the navigator output")]
    NotFound,
    #[error("malformed Blueprint JSON: {0}")]
    Malformed(String),
}

impl Blueprint {
    /// Check the field-to-selector invariant and the target URL.
    pub fn validate(&self) -> Vec<BlueprintIssue> {
        let mut issues = Vec::new();
        if url::Url::parse(self.target_url.trim()).is_err() {
            issues.push(BlueprintIssue::InvalidTargetUrl(self.target_url.clone()));
        }
        if self.data_fields.is_empty() {
            issues.push(BlueprintIssue::NoDataFields);
        }
        for field in &self.data_fields {
            match self.element_selectors.get(field) {
                None => issues.push(BlueprintIssue::MissingSelector(field.clone())),
                Some(selector) if selector.trim().is_empty() => {
                    issues.push(BlueprintIssue::EmptySelector(field.clone()))
                }
                Some(_) => {}
            }
        }
        issues
    }
}

/// A Blueprint read from text together with everything wrong with it.
#[derive(Debug, Clone)]
pub struct BlueprintReport {
    pub blueprint: Blueprint,
    pub issues: Vec<BlueprintIssue>,
}

impl BlueprintReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }

    /// Issues as a bullet list for inclusion in an instruction.
    pub fn issue_list(&self) -> String {
        self.issues
            .iter()
            .map(|i| format!("- {}", i))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn fenced_json() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("valid regex"))
}

/// Find the JSON object in `text`: a fenced block if present, otherwise
/// the first balanced `{…}` span that parses as an object. Braces in
/// surrounding prose are skipped. When nothing parses, the first candidate
/// is returned so the caller can report why.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let fenced = fenced_json()
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str());
    if let Some(block) = fenced.filter(|b| parses_as_object(b)) {
        return Some(block);
    }

    let mut first = fenced;
    for (start, _) in text.match_indices('{') {
        let Some(span) = balanced_span(text, start) else {
            continue;
        };
        if parses_as_object(span) {
            return Some(span);
        }
        first.get_or_insert(span);
    }
    first
}

fn parses_as_object(candidate: &str) -> bool {
    serde_json::from_str::<serde_json::Map<String, Value>>(candidate).is_ok()
}

/// The balanced `{…}` span opening at byte `start`, ignoring braces inside
/// JSON strings.
fn balanced_span(text: &str, start: usize) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Read a Blueprint out of navigator output and validate it.
pub fn inspect(text: &str) -> Result<BlueprintReport, BlueprintError> {
    let raw = extract_json_object(text).ok_or(BlueprintError::NotFound)?;
    let value: Value =
        serde_json::from_str(raw).map_err(|e| BlueprintError::Malformed(e.to_string()))?;
    let object = value
        .as_object()
        .ok_or_else(|| BlueprintError::Malformed("top level is not an object".to_string()))?;

    let mut issues: Vec<BlueprintIssue> = FIELDS
        .iter()
        .filter(|f| !object.contains_key(**f))
        .map(|f| BlueprintIssue::MissingField(*f))
        .collect();

    let blueprint: Blueprint =
        serde_json::from_value(value).map_err(|e| BlueprintError::Malformed(e.to_string()))?;
    issues.extend(blueprint.validate());

    Ok(BlueprintReport { blueprint, issues })
}

#[cfg(test)]
mod tests {
    use super::*;

    const COMPLETE: &str = r#"Here is the plan:
```json
{
  "target_url": "https://en.wikipedia.org/wiki/List_of_countries_by_population",
  "description": "Top 10 countries by population",
  "data_fields": ["country", "population"],
  "page_handling": "single page",
  "element_selectors": {
    "country": "table.wikitable tr td:nth-child(2) a",
    "population": "table.wikitable tr td:nth-child(3)"
  },
  "special_handling": "static HTML, no login"
}
```"#;

    #[test]
    fn test_complete_blueprint_is_clean() {
        let report = inspect(COMPLETE).unwrap();
        assert!(report.is_clean(), "unexpected issues: {:?}", report.issues);
        assert_eq!(report.blueprint.data_fields, vec!["country", "population"]);
    }

    #[test]
    fn test_missing_selector_is_flagged() {
        let text = r#"{"target_url": "https://example.com", "description": "d",
            "data_fields": ["name", "price"], "page_handling": "paginated",
            "element_selectors": {"name": ".title"}, "special_handling": ""}"#;
        let report = inspect(text).unwrap();
        assert_eq!(
            report.issues,
            vec![BlueprintIssue::MissingSelector("price".to_string())]
        );
        assert!(report.issue_list().contains("`price`"));
    }

    #[test]
    fn test_missing_fields_and_list_flags() {
        let text = r#"prefix {"target_url": "not a url", "data_fields": ["a"],
            "element_selectors": {"a": " "}, "special_handling": ["requires login", "requires JS rendering"]} suffix"#;
        let report = inspect(text).unwrap();
        assert!(report.issues.contains(&BlueprintIssue::MissingField("description")));
        assert!(report.issues.contains(&BlueprintIssue::MissingField("page_handling")));
        assert!(report
            .issues
            .contains(&BlueprintIssue::InvalidTargetUrl("not a url".to_string())));
        assert!(report.issues.contains(&BlueprintIssue::EmptySelector("a".to_string())));
        assert_eq!(
            report.blueprint.special_handling,
            "requires login, requires JS rendering"
        );
    }

    #[test]
    fn test_no_json_or_malformed() {
        assert_eq!(inspect("I could not find the site").unwrap_err(), BlueprintError::NotFound);
        assert!(matches!(
            inspect(r#"{"target_url": "x", "data_fields": 5}"#),
            Err(BlueprintError::Malformed(_))
        ));
    }

    #[test]
    fn test_extract_ignores_braces_in_strings() {
        let text = r#"note {"a": "}{", "b": {"c": 1}} trailing }"#;
        assert_eq!(extract_json_object(text), Some(r#"{"a": "}{", "b": {"c": 1}}"#));
    }

    #[test]
    fn test_prose_braces_before_the_object_are_skipped() {
        let text = r#"Use {field} placeholders per column. Blueprint:
{"target_url": "https://example.com", "description": "d", "data_fields": ["name"],
 "page_handling": "single page", "element_selectors": {"name": ".title"}, "special_handling": ""}"#;
        let report = inspect(text).unwrap();
        assert!(report.is_clean(), "{:?}", report.issues);
        assert_eq!(report.blueprint.target_url, "https://example.com");

        // Nothing parses: the first candidate is reported as malformed.
        assert!(matches!(inspect("see {field} and {other}"), Err(BlueprintError::Malformed(_))));
    }
}
