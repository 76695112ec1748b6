//! 기본 제공 프로세서
//!
//! 레지스트리 이름과 설정 키:
//!
//! | 이름 | 설정 |
//! |------|------|
//! | `add_fields` | `target` (기본 `fields`, 빈 문자열은 최상위), `fields` |
//! | `add_tags` | `tags`, `target` (기본 `tags`) |
//! | `drop_fields` | `fields`, `ignore_missing` |
//! | `drop_event` | 없음 |
//! | `rename` | `fields` (`from`/`to` 목록), `ignore_missing`, `fail_on_error` (기본 true) |

use std::fmt;
use std::sync::Arc;

use relay_core::error::ProcessorError;
use relay_core::event::Event;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use super::{Processor, ProcessorFailure};

/// 설정 값을 프로세서 설정 구조체로 해석합니다.
///
/// `null`은 빈 객체로 취급합니다.
pub(crate) fn parse_config<T: DeserializeOwned>(
    name: &str,
    config: &Value,
) -> Result<T, ProcessorError> {
    let value = match config {
        Value::Null => Value::Object(Map::new()),
        other => other.clone(),
    };
    serde_json::from_value(value).map_err(|e| ProcessorError::InvalidConfig {
        name: name.to_owned(),
        reason: e.to_string(),
    })
}

fn failed(processor: &str, reason: impl Into<String>) -> ProcessorError {
    ProcessorError::Failed {
        processor: processor.to_owned(),
        reason: reason.into(),
    }
}

// ─── add_fields ──────────────────────────────────────────────────────

fn default_fields_target() -> String {
    "fields".to_owned()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AddFieldsConfig {
    #[serde(default = "default_fields_target")]
    target: String,
    fields: Map<String, Value>,
}

/// 대상 경로에 필드를 깊은 병합합니다.
#[derive(Debug, Clone)]
pub struct AddFields {
    target: String,
    fields: Map<String, Value>,
}

impl AddFields {
    pub fn new(target: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            target: target.into(),
            fields,
        }
    }

    pub fn from_config(config: &Value) -> Result<Arc<dyn Processor>, ProcessorError> {
        let cfg: AddFieldsConfig = parse_config("add_fields", config)?;
        Ok(Arc::new(Self::new(cfg.target, cfg.fields)))
    }
}

impl fmt::Display for AddFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<&str> = self.fields.keys().map(String::as_str).collect();
        write!(f, "add_fields={{target={:?}, fields={:?}}}", self.target, keys)
    }
}

impl Processor for AddFields {
    fn run(&self, mut event: Event) -> Result<Option<Event>, ProcessorFailure> {
        event.merge_fields(&self.target, self.fields.clone());
        Ok(Some(event))
    }
}

// ─── add_tags ────────────────────────────────────────────────────────

fn default_tags_target() -> String {
    "tags".to_owned()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AddTagsConfig {
    tags: Vec<String>,
    #[serde(default = "default_tags_target")]
    target: String,
}

/// 태그 배열에 값을 추가합니다 (중복 제외).
#[derive(Debug, Clone)]
pub struct AddTags {
    target: String,
    tags: Vec<String>,
}

impl AddTags {
    pub fn new(target: impl Into<String>, tags: Vec<String>) -> Self {
        Self {
            target: target.into(),
            tags,
        }
    }

    pub fn from_config(config: &Value) -> Result<Arc<dyn Processor>, ProcessorError> {
        let cfg: AddTagsConfig = parse_config("add_tags", config)?;
        if cfg.tags.is_empty() {
            return Err(ProcessorError::InvalidConfig {
                name: "add_tags".to_owned(),
                reason: "tags must not be empty".to_owned(),
            });
        }
        Ok(Arc::new(Self::new(cfg.target, cfg.tags)))
    }
}

impl fmt::Display for AddTags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "add_tags={{target={:?}, tags={:?}}}", self.target, self.tags)
    }
}

impl Processor for AddTags {
    fn run(&self, mut event: Event) -> Result<Option<Event>, ProcessorFailure> {
        let mut current = match event.get_value(&self.target) {
            Some(Value::Array(items)) => items.clone(),
            Some(Value::String(single)) => vec![Value::String(single.clone())],
            Some(_) => {
                let error = failed(
                    "add_tags",
                    format!("field '{}' is not a tag list", self.target),
                );
                return Err(ProcessorFailure::keep_event(error, event));
            }
            None => Vec::new(),
        };
        for tag in &self.tags {
            let value = Value::String(tag.clone());
            if !current.contains(&value) {
                current.push(value);
            }
        }
        event.put_value(&self.target, Value::Array(current));
        Ok(Some(event))
    }
}

// ─── drop_fields ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DropFieldsConfig {
    fields: Vec<String>,
    #[serde(default)]
    ignore_missing: bool,
}

/// 지정한 필드를 삭제합니다.
#[derive(Debug, Clone)]
pub struct DropFields {
    fields: Vec<String>,
    ignore_missing: bool,
}

impl DropFields {
    pub fn new(fields: Vec<String>, ignore_missing: bool) -> Self {
        Self {
            fields,
            ignore_missing,
        }
    }

    pub fn from_config(config: &Value) -> Result<Arc<dyn Processor>, ProcessorError> {
        let cfg: DropFieldsConfig = parse_config("drop_fields", config)?;
        Ok(Arc::new(Self::new(cfg.fields, cfg.ignore_missing)))
    }
}

impl fmt::Display for DropFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "drop_fields={:?}", self.fields)
    }
}

impl Processor for DropFields {
    fn run(&self, mut event: Event) -> Result<Option<Event>, ProcessorFailure> {
        let mut missing = Vec::new();
        for field in &self.fields {
            if event.delete(field).is_none() && !self.ignore_missing {
                missing.push(field.as_str());
            }
        }
        if missing.is_empty() {
            return Ok(Some(event));
        }
        let error = failed(
            "drop_fields",
            format!("failed to drop fields {missing:?}: key not found"),
        );
        Err(ProcessorFailure::keep_event(error, event))
    }
}

// ─── drop_event ──────────────────────────────────────────────────────

/// 모든 이벤트를 제거합니다.
#[derive(Debug, Clone, Copy, Default)]
pub struct DropEvent;

impl DropEvent {
    pub fn from_config(config: &Value) -> Result<Arc<dyn Processor>, ProcessorError> {
        match config {
            Value::Null => {}
            Value::Object(map) if map.is_empty() => {}
            _ => {
                return Err(ProcessorError::InvalidConfig {
                    name: "drop_event".to_owned(),
                    reason: "drop_event takes no settings".to_owned(),
                });
            }
        }
        Ok(Arc::new(Self))
    }
}

impl fmt::Display for DropEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "drop_event")
    }
}

impl Processor for DropEvent {
    fn run(&self, _event: Event) -> Result<Option<Event>, ProcessorFailure> {
        Ok(None)
    }
}

// ─── rename ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RenameField {
    pub from: String,
    pub to: String,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RenameConfig {
    fields: Vec<RenameField>,
    #[serde(default)]
    ignore_missing: bool,
    #[serde(default = "default_true")]
    fail_on_error: bool,
}

/// 필드 이름을 변경합니다.
///
/// `fail_on_error`이면 한 필드라도 실패할 때 처리 전 상태로 되돌리고
/// `error.message`를 기록한 이벤트를 퍼블리시합니다.
/// 그렇지 않으면 실패한 필드만 건너뜁니다.
#[derive(Debug, Clone)]
pub struct Rename {
    fields: Vec<RenameField>,
    ignore_missing: bool,
    fail_on_error: bool,
}

impl Rename {
    pub fn new(fields: Vec<RenameField>, ignore_missing: bool, fail_on_error: bool) -> Self {
        Self {
            fields,
            ignore_missing,
            fail_on_error,
        }
    }

    pub fn from_config(config: &Value) -> Result<Arc<dyn Processor>, ProcessorError> {
        let cfg: RenameConfig = parse_config("rename", config)?;
        Ok(Arc::new(Self::new(
            cfg.fields,
            cfg.ignore_missing,
            cfg.fail_on_error,
        )))
    }

    fn rename_field(&self, from: &str, to: &str, event: &mut Event) -> Result<(), String> {
        if event.has_field(to) {
            return Err(format!(
                "target field {to} already exists, drop or rename this field first"
            ));
        }
        match event.delete(from) {
            Some(value) => {
                event.put_value(to, value);
                Ok(())
            }
            None if self.ignore_missing => Ok(()),
            None => Err(format!("could not fetch value for key: {from}")),
        }
    }
}

impl fmt::Display for Rename {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pairs: Vec<String> = self
            .fields
            .iter()
            .map(|field| format!("{}->{}", field.from, field.to))
            .collect();
        write!(f, "rename=[{}]", pairs.join(", "))
    }
}

impl Processor for Rename {
    fn run(&self, mut event: Event) -> Result<Option<Event>, ProcessorFailure> {
        let backup = self.fail_on_error.then(|| event.clone());

        for field in &self.fields {
            if let Err(reason) = self.rename_field(&field.from, &field.to, &mut event) {
                let message = format!("Failed to rename fields in processor: {reason}");
                tracing::debug!(from = %field.from, to = %field.to, %message, "rename failed");
                if let Some(mut reverted) = backup {
                    reverted.set_error_message(message.clone());
                    return Err(ProcessorFailure::keep_event(
                        failed("rename", message),
                        reverted,
                    ));
                }
            }
        }
        Ok(Some(event))
    }
}

// ─── null 제거 ───────────────────────────────────────────────────────

/// null 값을 재귀적으로 제거합니다. `keep_null`이 꺼진 클라이언트 체인의 마지막 단계입니다.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveNulls;

impl fmt::Display for RemoveNulls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "remove_nulls")
    }
}

impl Processor for RemoveNulls {
    fn run(&self, mut event: Event) -> Result<Option<Event>, ProcessorFailure> {
        event.remove_nulls();
        Ok(Some(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::event::ERROR_MESSAGE_FIELD;
    use serde_json::json;

    fn run(
        processor: &Arc<dyn Processor>,
        event: Event,
    ) -> Result<Option<Event>, ProcessorFailure> {
        processor.run(event)
    }

    #[test]
    fn add_fields_defaults_to_fields_target() {
        let p = AddFields::from_config(&json!({"fields": {"env": "prod"}})).unwrap();
        let event = run(&p, Event::new()).unwrap().unwrap();
        assert_eq!(event.get_value("fields.env"), Some(&json!("prod")));
    }

    #[test]
    fn add_fields_to_metadata() {
        let p = AddFields::from_config(&json!({"target": "@metadata", "fields": {"pipeline": "p1"}}))
            .unwrap();
        let event = run(&p, Event::new()).unwrap().unwrap();
        assert_eq!(event.get_value("@metadata.pipeline"), Some(&json!("p1")));
        assert!(!event.has_field("pipeline"));
    }

    #[test]
    fn add_tags_deduplicates() {
        let p = AddTags::from_config(&json!({"tags": ["a", "b"]})).unwrap();
        let event = Event::new().with_field("tags", json!(["a"]));
        let event = run(&p, event).unwrap().unwrap();
        assert_eq!(event.get_value("tags"), Some(&json!(["a", "b"])));
    }

    #[test]
    fn add_tags_rejects_empty_list() {
        assert!(AddTags::from_config(&json!({"tags": []})).is_err());
    }

    #[test]
    fn drop_fields_missing_keeps_event_with_error() {
        let p = DropFields::from_config(&json!({"fields": ["a", "missing"]})).unwrap();
        let failure = run(&p, Event::new().with_field("a", 1)).unwrap_err();
        let event = failure.event.unwrap();
        assert!(!event.has_field("a"));
    }

    #[test]
    fn drop_fields_ignore_missing() {
        let p = DropFields::from_config(&json!({"fields": ["missing"], "ignore_missing": true}))
            .unwrap();
        assert!(run(&p, Event::new()).unwrap().is_some());
    }

    #[test]
    fn drop_event_rejects_settings() {
        assert!(DropEvent::from_config(&json!({"when": "x"})).is_err());
        assert!(DropEvent::from_config(&Value::Null).is_ok());
    }

    #[test]
    fn rename_moves_value() {
        let p = Rename::from_config(&json!({"fields": [{"from": "a.b", "to": "c"}]})).unwrap();
        let event = run(&p, Event::new().with_field("a.b", "v")).unwrap().unwrap();
        assert_eq!(event.get_value("c"), Some(&json!("v")));
        assert!(!event.has_field("a.b"));
    }

    #[test]
    fn rename_fail_on_error_reverts_to_snapshot() {
        let p = Rename::from_config(&json!({
            "fields": [{"from": "a", "to": "b"}, {"from": "missing", "to": "c"}]
        }))
        .unwrap();
        let failure = run(&p, Event::new().with_field("a", 1)).unwrap_err();
        let event = failure.event.unwrap();
        // 첫 번째 rename도 되돌려짐
        assert_eq!(event.get_value("a"), Some(&json!(1)));
        assert!(!event.has_field("b"));
        let message = event.get_value(ERROR_MESSAGE_FIELD).unwrap().as_str().unwrap();
        assert!(message.contains("missing"));
    }

    #[test]
    fn rename_without_fail_on_error_skips_bad_fields() {
        let p = Rename::from_config(&json!({
            "fields": [{"from": "missing", "to": "c"}, {"from": "a", "to": "b"}],
            "fail_on_error": false
        }))
        .unwrap();
        let event = run(&p, Event::new().with_field("a", 1)).unwrap().unwrap();
        assert_eq!(event.get_value("b"), Some(&json!(1)));
        assert!(!event.has_field(ERROR_MESSAGE_FIELD));
    }

    #[test]
    fn rename_refuses_to_overwrite() {
        let p = Rename::from_config(&json!({"fields": [{"from": "a", "to": "b"}]})).unwrap();
        let event = Event::new().with_field("a", 1).with_field("b", 2);
        assert!(run(&p, event).is_err());
    }

    #[test]
    fn unknown_setting_is_invalid_config() {
        let Err(err) = DropFields::from_config(&json!({"fields": [], "bogus": 1})) else {
            panic!("unknown setting must be rejected");
        };
        assert!(matches!(err, ProcessorError::InvalidConfig { .. }));
    }
}
