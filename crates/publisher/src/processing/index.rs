//! 인덱스 선택 프로세서: 포맷 문자열로 대상 인덱스 이름을 계산
//!
//! 포맷 문법:
//!
//! - `%{[field.path]}`: 이벤트 필드 값 (`@metadata.` 경로 포함)
//! - `%{+yyyy.MM.dd}`: 이벤트 타임스탬프 (UTC) 날짜 포맷
//! - 그 외 문자는 그대로 사용
//!
//! 결과는 소문자로 변환되어 `@metadata.raw_index`에 기록됩니다.

use std::fmt;

use relay_core::error::ProcessorError;
use relay_core::event::Event;
use serde_json::Value;

use super::{Processor, ProcessorFailure};

/// 계산된 인덱스 이름이 기록되는 메타데이터 경로
pub const RAW_INDEX_FIELD: &str = "@metadata.raw_index";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(String),
    /// chrono strftime 포맷으로 변환된 날짜 포맷
    Timestamp(String),
}

/// 파싱된 인덱스 포맷 문자열
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexFormat {
    source: String,
    segments: Vec<Segment>,
}

impl IndexFormat {
    /// 포맷 문자열을 파싱합니다.
    pub fn parse(source: &str) -> Result<Self, ProcessorError> {
        let invalid = |reason: String| ProcessorError::InvalidConfig {
            name: "add_formatted_index".to_owned(),
            reason,
        };
        if source.trim().is_empty() {
            return Err(invalid("index format must not be empty".to_owned()));
        }

        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = source;
        while let Some(pos) = rest.find("%{") {
            literal.push_str(&rest[..pos]);
            let after = &rest[pos + 2..];
            let end = after
                .find('}')
                .ok_or_else(|| invalid(format!("unterminated expansion in '{source}'")))?;
            let expr = &after[..end];
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(parse_expansion(expr).map_err(|reason| invalid(reason))?);
            rest = &after[end + 1..];
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: source.to_owned(),
            segments,
        })
    }

    /// 필드 참조가 없는 고정 문자열인지 확인합니다.
    pub fn is_static(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, Segment::Literal(_)))
    }

    /// 이벤트에 대해 포맷을 계산합니다.
    pub fn render(&self, event: &Event) -> Result<String, String> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field(path) => match event.get_value(path) {
                    Some(Value::String(s)) => out.push_str(s),
                    Some(Value::Number(n)) => out.push_str(&n.to_string()),
                    Some(Value::Bool(b)) => out.push_str(if *b { "true" } else { "false" }),
                    Some(_) => return Err(format!("field '{path}' is not a scalar value")),
                    None => return Err(format!("key not found: {path}")),
                },
                Segment::Timestamp(fmt) => {
                    out.push_str(&event.timestamp.format(fmt).to_string());
                }
            }
        }
        Ok(out.to_lowercase())
    }
}

impl fmt::Display for IndexFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn parse_expansion(expr: &str) -> Result<Segment, String> {
    if let Some(date) = expr.strip_prefix('+') {
        if date.is_empty() {
            return Err("empty timestamp format".to_owned());
        }
        return Ok(Segment::Timestamp(to_strftime(date)));
    }
    let path = expr
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .ok_or_else(|| format!("field reference must look like %{{[field]}}, got '%{{{expr}}}'"))?;
    if path.is_empty() {
        return Err("empty field reference".to_owned());
    }
    Ok(Segment::Field(path.to_owned()))
}

/// Joda 스타일 날짜 포맷을 strftime 포맷으로 변환합니다.
fn to_strftime(joda: &str) -> String {
    let chars: Vec<char> = joda.chars().collect();
    let mut out = String::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let mut run = 1;
        while i + run < chars.len() && chars[i + run] == c {
            run += 1;
        }
        let token = match (c, run) {
            ('y' | 'Y', 2) => Some("%y"),
            ('y' | 'Y', _) => Some("%Y"),
            ('M', 1 | 2) => Some("%m"),
            ('M', 3) => Some("%b"),
            ('M', _) => Some("%B"),
            ('d', _) => Some("%d"),
            ('H', _) => Some("%H"),
            ('m', _) => Some("%M"),
            ('s', _) => Some("%S"),
            _ => None,
        };
        match token {
            Some(t) => out.push_str(t),
            None => {
                for _ in 0..run {
                    if c == '%' {
                        out.push_str("%%");
                    } else {
                        out.push(c);
                    }
                }
            }
        }
        i += run;
    }
    out
}

/// 포맷 문자열로 `@metadata.raw_index`를 설정하는 프로세서
///
/// 클라이언트 체인에서 사용자 프로세서보다 먼저 실행되므로
/// 사용자 프로세서가 계산된 인덱스를 덮어쓸 수 있습니다.
#[derive(Debug, Clone)]
pub struct AddFormattedIndex {
    format: IndexFormat,
}

impl AddFormattedIndex {
    pub fn new(format: IndexFormat) -> Self {
        Self { format }
    }

    pub fn parse(format: &str) -> Result<Self, ProcessorError> {
        IndexFormat::parse(format).map(Self::new)
    }
}

impl fmt::Display for AddFormattedIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "add_index_pattern={}", self.format)
    }
}

impl Processor for AddFormattedIndex {
    fn run(&self, mut event: Event) -> Result<Option<Event>, ProcessorFailure> {
        match self.format.render(&event) {
            Ok(index) => {
                event.put_value(RAW_INDEX_FIELD, Value::String(index));
                Ok(Some(event))
            }
            Err(reason) => {
                let error = ProcessorError::Failed {
                    processor: "add_index_pattern".to_owned(),
                    reason,
                };
                Err(ProcessorFailure::keep_event(error, event))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn event_at_2024_03_05() -> Event {
        Event::at(chrono::Utc.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap())
    }

    #[test]
    fn static_format() {
        let format = IndexFormat::parse("Logs-Static").unwrap();
        assert!(format.is_static());
        assert_eq!(format.render(&Event::new()).unwrap(), "logs-static");
    }

    #[test]
    fn field_and_date_expansion() {
        let format = IndexFormat::parse("%{[service.name]}-%{+yyyy.MM.dd}").unwrap();
        assert!(!format.is_static());
        let event = event_at_2024_03_05().with_field("service.name", "API");
        assert_eq!(format.render(&event).unwrap(), "api-2024.03.05");
    }

    #[test]
    fn metadata_field_reference() {
        let format = IndexFormat::parse("%{[@metadata.beat]}-x").unwrap();
        let mut event = Event::new();
        event.put_value("@metadata.beat", json!("relay"));
        assert_eq!(format.render(&event).unwrap(), "relay-x");
    }

    #[test]
    fn missing_field_is_render_error() {
        let format = IndexFormat::parse("%{[missing]}").unwrap();
        assert!(format.render(&Event::new()).is_err());
    }

    #[test]
    fn malformed_formats_are_rejected() {
        assert!(IndexFormat::parse("").is_err());
        assert!(IndexFormat::parse("logs-%{[a]").is_err());
        assert!(IndexFormat::parse("logs-%{a}").is_err());
        assert!(IndexFormat::parse("logs-%{+}").is_err());
    }

    #[test]
    fn joda_tokens_convert_to_strftime() {
        assert_eq!(to_strftime("yyyy.MM.dd"), "%Y.%m.%d");
        assert_eq!(to_strftime("yy-MM-dd'T'HH:mm:ss"), "%y-%m-%d'T'%H:%M:%S");
    }

    #[test]
    fn processor_writes_raw_index() {
        let processor = AddFormattedIndex::parse("%{[app]}-%{+yyyy}").unwrap();
        let event = event_at_2024_03_05().with_field("app", "web");
        let event = processor.run(event).unwrap().unwrap();
        assert_eq!(event.get_value(RAW_INDEX_FIELD), Some(&json!("web-2024")));
    }

    #[test]
    fn processor_keeps_event_when_field_missing() {
        let processor = AddFormattedIndex::parse("%{[app]}").unwrap();
        let failure = processor.run(Event::new()).unwrap_err();
        assert!(failure.event.is_some());
    }
}
