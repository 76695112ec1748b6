//! 이벤트 처리 체인
//!
//! [`Processor`]는 이벤트 하나를 받아 변경, 제거(`None`), 또는 실패를 반환합니다.
//! [`ProcessingChain`]은 프로세서를 등록 순서대로 실행합니다.
//!
//! # 체인 규칙
//!
//! - 어떤 단계가 `None`을 반환하면 이벤트는 필터링되고 이후 단계는 실행되지 않습니다.
//! - 어떤 단계가 실패하면 이후 단계는 실행되지 않습니다. 실패에 이벤트가
//!   담겨 있으면 그 이벤트는 계속 퍼블리시되고, 없으면 버려집니다.
//! - 처리 실패는 호출자에게 전파되지 않으며 debug 로그와 카운터로만 보고됩니다.

pub mod actions;
pub mod index;
pub mod registry;

use std::fmt;
use std::sync::Arc;

use relay_core::error::ProcessorError;
use relay_core::event::Event;

pub use actions::{AddFields, AddTags, DropEvent, DropFields, RemoveNulls, Rename};
pub use index::{AddFormattedIndex, IndexFormat};
pub use registry::{ProcessorConstructor, ProcessorRegistry};

/// 프로세서 실패
///
/// `event`가 있으면 체인은 중단되지만 해당 이벤트는 퍼블리시됩니다.
#[derive(Debug)]
pub struct ProcessorFailure {
    pub error: ProcessorError,
    pub event: Option<Event>,
}

impl ProcessorFailure {
    /// 이벤트를 버리는 실패
    pub fn drop_event(error: ProcessorError) -> Self {
        Self { error, event: None }
    }

    /// 이벤트를 계속 퍼블리시하는 실패
    pub fn keep_event(error: ProcessorError, event: Event) -> Self {
        Self {
            error,
            event: Some(event),
        }
    }
}

/// 이벤트 처리 단계
///
/// `Display` 구현은 로그와 디버깅에 쓰이는 진단용 이름입니다.
pub trait Processor: Send + Sync + fmt::Display {
    /// 이벤트를 처리합니다.
    ///
    /// - `Ok(Some(event))`: 다음 단계로 전달
    /// - `Ok(None)`: 이벤트 제거
    /// - `Err(failure)`: 처리 실패
    fn run(&self, event: Event) -> Result<Option<Event>, ProcessorFailure>;
}

/// 체인 실행 결과
#[derive(Debug)]
pub enum ChainOutcome {
    /// 퍼블리시할 이벤트
    Publish(Event),
    /// 프로세서에 의해 제거됨
    Filtered,
    /// 처리 실패 (이벤트가 있으면 퍼블리시)
    Failed {
        error: ProcessorError,
        event: Option<Event>,
    },
}

/// 순서가 있는 프로세서 목록
#[derive(Clone, Default)]
pub struct ProcessingChain {
    processors: Vec<Arc<dyn Processor>>,
}

impl ProcessingChain {
    pub fn new(processors: Vec<Arc<dyn Processor>>) -> Self {
        Self { processors }
    }

    /// 체인 끝에 프로세서를 추가합니다.
    pub fn push(&mut self, processor: Arc<dyn Processor>) {
        self.processors.push(processor);
    }

    /// 다른 체인의 프로세서를 끝에 이어 붙입니다.
    pub fn extend(&mut self, processors: impl IntoIterator<Item = Arc<dyn Processor>>) {
        self.processors.extend(processors);
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// 이벤트를 체인 전체에 통과시킵니다.
    pub fn run(&self, mut event: Event) -> ChainOutcome {
        for processor in &self.processors {
            match processor.run(event) {
                Ok(Some(next)) => event = next,
                Ok(None) => return ChainOutcome::Filtered,
                Err(failure) => {
                    tracing::debug!(
                        processor = %processor,
                        error = %failure.error,
                        keeps_event = failure.event.is_some(),
                        "processor failed"
                    );
                    return ChainOutcome::Failed {
                        error: failure.error,
                        event: failure.event,
                    };
                }
            }
        }
        ChainOutcome::Publish(event)
    }
}

impl fmt::Display for ProcessingChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "processors=[")?;
        for (i, processor) in self.processors.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{processor}")?;
        }
        write!(f, "]")
    }
}

impl fmt::Debug for ProcessingChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, json};

    struct Failing {
        keep: bool,
    }

    impl fmt::Display for Failing {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "failing")
        }
    }

    impl Processor for Failing {
        fn run(&self, event: Event) -> Result<Option<Event>, ProcessorFailure> {
            let error = ProcessorError::Failed {
                processor: "failing".to_owned(),
                reason: "boom".to_owned(),
            };
            Err(if self.keep {
                ProcessorFailure::keep_event(error, event)
            } else {
                ProcessorFailure::drop_event(error)
            })
        }
    }

    fn add(key: &str, value: &str) -> Arc<dyn Processor> {
        let mut fields = Map::new();
        fields.insert(key.to_owned(), json!(value));
        Arc::new(AddFields::new("", fields))
    }

    #[test]
    fn stages_run_in_order() {
        let chain = ProcessingChain::new(vec![add("a", "first"), add("a", "second")]);
        let ChainOutcome::Publish(event) = chain.run(Event::new()) else {
            panic!("expected publish");
        };
        assert_eq!(event.get_value("a"), Some(&json!("second")));
    }

    #[test]
    fn drop_stops_the_chain() {
        let chain = ProcessingChain::new(vec![Arc::new(DropEvent), add("a", "x")]);
        assert!(matches!(chain.run(Event::new()), ChainOutcome::Filtered));
    }

    #[test]
    fn failure_with_event_skips_remaining_stages() {
        let chain = ProcessingChain::new(vec![Arc::new(Failing { keep: true }), add("a", "x")]);
        match chain.run(Event::new().with_field("b", 1)) {
            ChainOutcome::Failed {
                event: Some(event), ..
            } => {
                assert!(!event.has_field("a"));
                assert!(event.has_field("b"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn failure_without_event_drops() {
        let chain = ProcessingChain::new(vec![Arc::new(Failing { keep: false })]);
        assert!(matches!(
            chain.run(Event::new()),
            ChainOutcome::Failed { event: None, .. }
        ));
    }

    #[test]
    fn empty_chain_passes_event_through() {
        let chain = ProcessingChain::default();
        assert!(chain.is_empty());
        assert!(matches!(chain.run(Event::new()), ChainOutcome::Publish(_)));
    }

    #[test]
    fn display_lists_processors() {
        let chain = ProcessingChain::new(vec![Arc::new(DropEvent)]);
        assert_eq!(chain.to_string(), "processors=[drop_event]");
    }
}
