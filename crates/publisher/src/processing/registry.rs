//! 프로세서 레지스트리: 점(`.`) 경로 네임스페이스
//!
//! 프로세서는 `"add_fields"`나 `"filters.rename"`처럼 점으로 구분된 이름으로
//! 등록됩니다. 설정은 키가 하나인 맵이며, 키가 네임스페이스를 가리키면
//! 그 값 역시 키가 하나인 맵으로 해석됩니다.
//!
//! ```text
//! {"filters": {"rename": {"fields": [...]}}}  →  "filters.rename"
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use relay_core::error::ProcessorError;
use serde_json::Value;

use super::Processor;
use super::actions::{AddFields, AddTags, DropEvent, DropFields, Rename};

/// 설정 값으로 프로세서를 생성하는 함수
pub type ProcessorConstructor = fn(&Value) -> Result<Arc<dyn Processor>, ProcessorError>;

enum Entry {
    Plugin(ProcessorConstructor),
    Namespace(Namespace),
}

#[derive(Default)]
struct Namespace {
    entries: BTreeMap<String, Entry>,
}

/// 이름 → 생성자 레지스트리
#[derive(Default)]
pub struct ProcessorRegistry {
    root: Namespace,
}

impl ProcessorRegistry {
    /// 빈 레지스트리를 생성합니다.
    pub fn new() -> Self {
        Self::default()
    }

    /// 기본 제공 프로세서가 등록된 레지스트리를 생성합니다.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        let builtins: [(&str, ProcessorConstructor); 5] = [
            ("add_fields", AddFields::from_config),
            ("add_tags", AddTags::from_config),
            ("drop_fields", DropFields::from_config),
            ("drop_event", DropEvent::from_config),
            ("rename", Rename::from_config),
        ];
        for (name, constructor) in builtins {
            // 빈 레지스트리에 고유 이름을 넣으므로 실패하지 않음
            let _ = registry.register(name, constructor);
        }
        registry
    }

    /// 점 경로 이름으로 생성자를 등록합니다.
    pub fn register(
        &mut self,
        name: &str,
        constructor: ProcessorConstructor,
    ) -> Result<(), ProcessorError> {
        let segments: Vec<&str> = name.split('.').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(ProcessorError::InvalidConfig {
                name: name.to_owned(),
                reason: "processor name segments must not be empty".to_owned(),
            });
        }

        let duplicate = || ProcessorError::Duplicate {
            name: name.to_owned(),
        };
        let Some((last, parents)) = segments.split_last() else {
            return Err(duplicate());
        };

        let mut ns = &mut self.root;
        for segment in parents {
            let entry = ns
                .entries
                .entry((*segment).to_owned())
                .or_insert_with(|| Entry::Namespace(Namespace::default()));
            ns = match entry {
                Entry::Namespace(child) => child,
                Entry::Plugin(_) => return Err(duplicate()),
            };
        }
        if ns.entries.contains_key(*last) {
            return Err(duplicate());
        }
        ns.entries
            .insert((*last).to_owned(), Entry::Plugin(constructor));
        Ok(())
    }

    /// 등록 여부를 확인합니다.
    pub fn contains(&self, name: &str) -> bool {
        let mut ns = &self.root;
        let mut segments = name.split('.').peekable();
        while let Some(segment) = segments.next() {
            match ns.entries.get(segment) {
                Some(Entry::Plugin(_)) => return segments.peek().is_none(),
                Some(Entry::Namespace(child)) => ns = child,
                None => return false,
            }
        }
        false
    }

    /// 키가 하나인 설정 맵으로 프로세서를 생성합니다.
    pub fn build(&self, config: &Value) -> Result<Arc<dyn Processor>, ProcessorError> {
        let mut ns = &self.root;
        let mut config = config;
        let mut path: Vec<&str> = Vec::new();

        loop {
            let (key, value) = single_entry(config, &path)?;
            path.push(key);
            match ns.entries.get(key) {
                Some(Entry::Plugin(constructor)) => return constructor(value),
                Some(Entry::Namespace(child)) => {
                    ns = child;
                    config = value;
                }
                None => {
                    return Err(ProcessorError::Unknown {
                        name: path.join("."),
                    });
                }
            }
        }
    }

    /// 설정 목록을 순서대로 생성합니다.
    pub fn build_all(&self, configs: &[Value]) -> Result<Vec<Arc<dyn Processor>>, ProcessorError> {
        configs.iter().map(|config| self.build(config)).collect()
    }

    /// 등록된 전체 이름 (정렬됨)
    pub fn names(&self) -> Vec<String> {
        fn walk(ns: &Namespace, prefix: &str, out: &mut Vec<String>) {
            for (key, entry) in &ns.entries {
                let name = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                match entry {
                    Entry::Plugin(_) => out.push(name),
                    Entry::Namespace(child) => walk(child, &name, out),
                }
            }
        }
        let mut out = Vec::new();
        walk(&self.root, "", &mut out);
        out
    }
}

impl fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("names", &self.names())
            .finish()
    }
}

fn single_entry<'a>(
    config: &'a Value,
    path: &[&str],
) -> Result<(&'a str, &'a Value), ProcessorError> {
    let at = if path.is_empty() {
        "processor".to_owned()
    } else {
        path.join(".")
    };
    let Value::Object(map) = config else {
        return Err(ProcessorError::InvalidConfig {
            name: at,
            reason: "expected a map with a single processor name".to_owned(),
        });
    };
    let mut iter = map.iter();
    match (iter.next(), iter.next()) {
        (Some((key, value)), None) => Ok((key.as_str(), value)),
        (None, _) => Err(ProcessorError::InvalidConfig {
            name: at,
            reason: "no processor name configured".to_owned(),
        }),
        (Some(_), Some(_)) => {
            let keys: Vec<&str> = map.keys().map(String::as_str).collect();
            Err(ProcessorError::InvalidConfig {
                name: at,
                reason: format!("too many keys {keys:?}, expected exactly one"),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::event::Event;
    use serde_json::json;

    #[test]
    fn builtins_are_registered() {
        let registry = ProcessorRegistry::with_builtins();
        assert_eq!(
            registry.names(),
            ["add_fields", "add_tags", "drop_event", "drop_fields", "rename"]
        );
    }

    #[test]
    fn build_resolves_top_level_name() {
        let registry = ProcessorRegistry::with_builtins();
        let processor = registry
            .build(&json!({"add_fields": {"target": "", "fields": {"a": 1}}}))
            .unwrap();
        let event = processor.run(Event::new()).unwrap().unwrap();
        assert_eq!(event.get_value("a"), Some(&json!(1)));
    }

    #[test]
    fn nested_namespace_resolution() {
        let mut registry = ProcessorRegistry::new();
        registry.register("filters.drop", DropEvent::from_config).unwrap();
        assert!(registry.contains("filters.drop"));
        assert!(!registry.contains("filters"));

        let processor = registry.build(&json!({"filters": {"drop": {}}})).unwrap();
        assert!(processor.run(Event::new()).unwrap().is_none());
    }

    #[test]
    fn unknown_name_reports_full_path() {
        let mut registry = ProcessorRegistry::new();
        registry.register("filters.drop", DropEvent::from_config).unwrap();
        let err = registry
            .build(&json!({"filters": {"bogus": {}}}))
            .err()
            .unwrap();
        assert_eq!(
            err,
            ProcessorError::Unknown {
                name: "filters.bogus".to_owned()
            }
        );
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = ProcessorRegistry::with_builtins();
        let err = registry.register("rename", Rename::from_config).unwrap_err();
        assert!(matches!(err, ProcessorError::Duplicate { .. }));

        // 플러그인 아래에 네임스페이스를 만들 수 없음
        let err = registry
            .register("rename.inner", Rename::from_config)
            .unwrap_err();
        assert!(matches!(err, ProcessorError::Duplicate { .. }));
    }

    #[test]
    fn config_must_have_exactly_one_key() {
        let registry = ProcessorRegistry::with_builtins();
        let err = registry.build(&json!({})).err().unwrap();
        assert!(err.to_string().contains("no processor name"));

        let err = registry
            .build(&json!({"drop_event": {}, "add_tags": {"tags": ["x"]}}))
            .err()
            .unwrap();
        assert!(err.to_string().contains("too many keys"));
    }

    #[test]
    fn build_all_preserves_order() {
        let registry = ProcessorRegistry::with_builtins();
        let processors = registry
            .build_all(&[
                json!({"add_tags": {"tags": ["a"]}}),
                json!({"drop_event": null}),
            ])
            .unwrap();
        assert_eq!(processors.len(), 2);
        assert_eq!(processors[1].to_string(), "drop_event");
    }
}
