//! 이벤트 모델: 퍼블리셔 파이프라인을 흐르는 기본 단위
//!
//! [`Event`]는 타임스탬프, 점(`.`) 경로로 접근하는 필드 맵, 그리고
//! 출력 인덱싱 대상이 아닌 비공개 메타데이터 맵으로 구성됩니다.
//! 메타데이터는 `@metadata.` 접두어 경로로 접근하며, 대상 인덱스 이름 같은
//! 라우팅 힌트를 담습니다.
//!
//! 필드 삽입 순서는 출력 포맷을 위해 보존됩니다 (`serde_json` `preserve_order`).

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 메타데이터 경로 접두어
pub const METADATA_KEY: &str = "@metadata";

/// 프로세서 실패 시 기록되는 에러 메시지 필드
pub const ERROR_MESSAGE_FIELD: &str = "error.message";

/// 파이프라인 이벤트
///
/// 퍼블리시된 이후에는 불변으로 취급합니다. `Clone`은 깊은 복사이므로
/// 프로세서가 실패 시 되돌리기 위한 스냅샷으로 사용할 수 있습니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// 이벤트 발생 시각
    pub timestamp: DateTime<Utc>,
    /// 이벤트 필드 (중첩 가능)
    #[serde(default)]
    pub fields: Map<String, Value>,
    /// 비공개 메타데이터 (라우팅 힌트 등)
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub meta: Map<String, Value>,
}

impl Event {
    /// 현재 시각으로 빈 이벤트를 생성합니다.
    pub fn new() -> Self {
        Self::at(Utc::now())
    }

    /// 지정한 시각으로 빈 이벤트를 생성합니다.
    pub fn at(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            fields: Map::new(),
            meta: Map::new(),
        }
    }

    /// JSON 객체를 필드로 사용하는 이벤트를 생성합니다.
    ///
    /// 객체가 아닌 값은 `message` 필드로 감쌉니다.
    pub fn from_value(value: Value) -> Self {
        let mut event = Self::new();
        match value {
            Value::Object(fields) => event.fields = fields,
            other => {
                event.fields.insert("message".to_owned(), other);
            }
        }
        event
    }

    /// 필드를 설정한 이벤트를 반환합니다 (빌더 스타일).
    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.put_value(key, value.into());
        self
    }

    /// 점 경로로 값을 조회합니다.
    ///
    /// `@metadata.`로 시작하는 경로는 메타데이터 맵을 조회합니다.
    pub fn get_value(&self, key: &str) -> Option<&Value> {
        let (root, path) = self.resolve(key);
        let path = path?;
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = root.get(first)?;
        for segment in segments {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    /// 점 경로에 값이 존재하는지 확인합니다.
    pub fn has_field(&self, key: &str) -> bool {
        self.get_value(key).is_some()
    }

    /// 점 경로에 값을 기록하고 이전 값을 반환합니다.
    ///
    /// 중간 경로가 없거나 객체가 아니면 새 객체로 대체합니다.
    /// `@metadata` 자체에 객체를 기록하면 기존 메타데이터에 병합합니다.
    pub fn put_value(&mut self, key: &str, value: Value) -> Option<Value> {
        if key == METADATA_KEY {
            if let Value::Object(entries) = value {
                deep_merge(&mut self.meta, entries);
            }
            return None;
        }

        let root = self.resolve_mut(key);
        let path = strip_metadata(key).unwrap_or(key);
        let mut segments: Vec<&str> = path.split('.').collect();
        let last = segments.pop()?;

        let mut current = root;
        for segment in segments {
            let entry = current
                .entry(segment.to_owned())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            current = entry.as_object_mut()?;
        }
        current.insert(last.to_owned(), value)
    }

    /// 점 경로의 값을 삭제하고 삭제된 값을 반환합니다.
    pub fn delete(&mut self, key: &str) -> Option<Value> {
        let root = self.resolve_mut(key);
        let path = strip_metadata(key).unwrap_or(key);
        let mut segments: Vec<&str> = path.split('.').collect();
        let last = segments.pop()?;

        let mut current = root;
        for segment in segments {
            current = current.get_mut(segment)?.as_object_mut()?;
        }
        current.remove(last)
    }

    /// 대상 경로의 객체에 필드를 깊은 병합합니다.
    ///
    /// `target`이 비어 있으면 최상위 필드에 병합합니다.
    pub fn merge_fields(&mut self, target: &str, entries: Map<String, Value>) {
        if target.is_empty() {
            deep_merge(&mut self.fields, entries);
            return;
        }
        if target == METADATA_KEY {
            deep_merge(&mut self.meta, entries);
            return;
        }

        match self.get_value(target) {
            Some(Value::Object(_)) => {}
            _ => {
                self.put_value(target, Value::Object(Map::new()));
            }
        }
        let root = self.resolve_mut(target);
        let path = strip_metadata(target).unwrap_or(target);
        let mut current = root;
        for segment in path.split('.') {
            match current.get_mut(segment).and_then(Value::as_object_mut) {
                Some(next) => current = next,
                None => return,
            }
        }
        deep_merge(current, entries);
    }

    /// `error.message` 필드에 에러 메시지를 기록합니다.
    pub fn set_error_message(&mut self, message: impl Into<String>) {
        self.put_value(ERROR_MESSAGE_FIELD, Value::String(message.into()));
    }

    /// 필드에서 null 값을 재귀적으로 제거합니다.
    pub fn remove_nulls(&mut self) {
        remove_nulls_in(&mut self.fields);
    }

    fn resolve<'k>(&self, key: &'k str) -> (&Map<String, Value>, Option<&'k str>) {
        match strip_metadata(key) {
            Some(rest) => (&self.meta, Some(rest)),
            None if key == METADATA_KEY => (&self.meta, None),
            None => (&self.fields, Some(key)),
        }
    }

    fn resolve_mut(&mut self, key: &str) -> &mut Map<String, Value> {
        if strip_metadata(key).is_some() {
            &mut self.meta
        } else {
            &mut self.fields
        }
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Event[{}] fields={}",
            self.timestamp.to_rfc3339(),
            Value::Object(self.fields.clone())
        )
    }
}

fn strip_metadata(key: &str) -> Option<&str> {
    key.strip_prefix(METADATA_KEY)
        .and_then(|rest| rest.strip_prefix('.'))
        .filter(|rest| !rest.is_empty())
}

fn deep_merge(target: &mut Map<String, Value>, entries: Map<String, Value>) {
    for (key, value) in entries {
        match (target.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                deep_merge(existing, incoming);
            }
            (_, value) => {
                target.insert(key, value);
            }
        }
    }
}

fn remove_nulls_in(map: &mut Map<String, Value>) {
    map.retain(|_, value| !value.is_null());
    for value in map.values_mut() {
        if let Value::Object(inner) = value {
            remove_nulls_in(inner);
        }
    }
}
