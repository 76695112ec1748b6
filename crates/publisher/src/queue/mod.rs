//! 이벤트 큐: 프로듀서와 디스패처 사이의 유일한 동기화 지점
//!
//! 모든 백엔드는 같은 계약을 따릅니다.
//!
//! - 용량은 적재되었지만 아직 ACK되지 않은 이벤트 수로 계산합니다.
//! - [`Producer::publish`]는 공간이 생기거나 프로듀서가 취소될 때까지 대기하고,
//!   [`Producer::try_publish`]는 가득 찬 경우 즉시 이벤트를 돌려줍니다.
//! - [`Consumer::get`]은 적재 순서대로 최대 `max_events`개를 한 배치로 꺼냅니다.
//! - 배치 ACK는 순서와 무관하게 도착할 수 있지만, 각 프로듀서의 ACK 콜백은
//!   연속으로 확정된 구간만큼 적재 순서대로 호출됩니다.
//!
//! # 백엔드
//!
//! - [`memqueue`]: 메모리 내 고정 용량 버퍼 (`[queue.mem]`)
//! - [`diskqueue`]: JSON Lines 파일에 적재 내역을 기록하는 버퍼 (`[queue.disk]`)

mod broker;
pub mod diskqueue;
pub mod memqueue;

use std::fmt;
use std::sync::Arc;

use relay_core::config::QueueNamespace;
use relay_core::event::Event;
use relay_core::pipeline::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PublisherError;

pub use diskqueue::{DiskQueue, DiskQueueSettings};
pub use memqueue::{MemQueue, MemQueueSettings};

/// 프로듀서 ACK 콜백: 새로 확정된 이벤트 수를 전달받습니다.
pub type AckFn = Arc<dyn Fn(usize) + Send + Sync>;

/// 큐에 적재되는 단위
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// 처리 완료된 이벤트
    pub event: Event,
    /// 재시도 한도와 무관하게 버리지 않아야 하는 이벤트
    #[serde(default)]
    pub guaranteed: bool,
}

impl QueueEntry {
    pub fn new(event: Event) -> Self {
        Self {
            event,
            guaranteed: false,
        }
    }

    pub fn guaranteed(event: Event) -> Self {
        Self {
            event,
            guaranteed: true,
        }
    }
}

/// 프로듀서 생성 옵션
#[derive(Clone, Default)]
pub struct ProducerConfig {
    /// ACK 콜백 (없으면 ACK를 추적하지 않음)
    pub ack: Option<AckFn>,
}

impl fmt::Debug for ProducerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerConfig")
            .field("ack", &self.ack.is_some())
            .finish()
    }
}

/// 큐 구현체 공통 인터페이스
pub trait Queue: Send + Sync {
    /// 큐 타입 이름 (mem, disk)
    fn queue_type(&self) -> &'static str;

    /// 최대 미확정 이벤트 수
    fn capacity(&self) -> usize;

    /// 새 프로듀서를 생성합니다. 큐가 닫혔으면 `None`입니다.
    fn producer(&self, config: ProducerConfig) -> Option<Box<dyn Producer>>;

    /// 컨슈머 핸들을 생성합니다.
    fn consumer(&self) -> Box<dyn Consumer>;

    /// 적재되었지만 아직 ACK되지 않은 이벤트 수
    fn outstanding(&self) -> usize;

    /// 미확정 이벤트가 모두 ACK되거나 큐가 닫힐 때까지 대기합니다.
    fn wait_empty(&self) -> BoxFuture<'_, ()>;

    /// 큐를 닫습니다. 대기 중인 프로듀서와 컨슈머가 모두 깨어납니다.
    fn close(&self) -> Result<(), PublisherError>;
}

/// 프로듀서 핸들
pub trait Producer: Send + Sync {
    /// 공간이 생길 때까지 대기한 뒤 적재합니다.
    ///
    /// 프로듀서가 취소되었거나 큐가 닫히면 항목을 돌려줍니다.
    fn publish(&self, entry: QueueEntry) -> BoxFuture<'_, Result<(), QueueEntry>>;

    /// 대기 없이 적재를 시도합니다. 가득 찼으면 항목을 돌려줍니다.
    fn try_publish(&self, entry: QueueEntry) -> Result<(), QueueEntry>;

    /// 대기 중인 `publish` 호출을 깨우고 이후 적재를 거부합니다.
    ///
    /// 이미 적재된 이벤트는 그대로 전달되며 ACK 콜백도 유지됩니다.
    fn cancel(&self);
}

/// 컨슈머 핸들
pub trait Consumer: Send {
    /// 최대 `max_events`개의 배치를 꺼냅니다. 큐가 닫히면 `None`입니다.
    ///
    /// 반환된 future는 취소해도 이벤트를 잃지 않습니다.
    fn get(&mut self, max_events: usize) -> BoxFuture<'_, Option<QueueBatch>>;
}

/// 배치 ACK를 받아들이는 큐 내부 구현
pub(crate) trait AckSink: Send + Sync {
    fn ack_range(&self, start: u64, count: usize);
}

/// 큐 위치 구간에 대한 ACK 핸들
///
/// 한 번만 사용할 수 있습니다.
pub struct AckHandle {
    sink: Arc<dyn AckSink>,
    start: u64,
    count: usize,
}

impl AckHandle {
    pub(crate) fn new(sink: Arc<dyn AckSink>, start: u64, count: usize) -> Self {
        Self { sink, start, count }
    }

    /// 구간 전체를 확정합니다.
    pub fn ack(self) {
        self.sink.ack_range(self.start, self.count);
    }

    /// 구간의 이벤트 수
    pub fn count(&self) -> usize {
        self.count
    }
}

impl fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckHandle")
            .field("start", &self.start)
            .field("count", &self.count)
            .finish()
    }
}

/// 큐에서 꺼낸 배치
#[derive(Debug)]
pub struct QueueBatch {
    pub entries: Vec<QueueEntry>,
    pub ack: AckHandle,
}

/// 설정에서 해석된 큐 백엔드
///
/// 파이프라인 생성 전에 설정을 검증하기 위해 파싱과 생성을 분리합니다.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueSettings {
    Mem(MemQueueSettings),
    Disk(DiskQueueSettings),
}

impl QueueSettings {
    /// 설정된 설정으로 큐를 엽니다.
    pub fn open(&self) -> Result<Arc<dyn Queue>, PublisherError> {
        match self {
            Self::Mem(settings) => Ok(Arc::new(MemQueue::new(settings.clone())?)),
            Self::Disk(settings) => Ok(Arc::new(DiskQueue::open(settings.clone())?)),
        }
    }

    /// 큐 타입 이름
    pub fn queue_type(&self) -> &'static str {
        match self {
            Self::Mem(_) => memqueue::QUEUE_TYPE,
            Self::Disk(_) => diskqueue::QUEUE_TYPE,
        }
    }
}

/// `[queue.<type>]` 네임스페이스를 해석합니다.
///
/// 알 수 없는 타입이나 설정 키가 있으면 즉시 실패합니다.
pub fn queue_factory_for_config(ns: &QueueNamespace) -> Result<QueueSettings, PublisherError> {
    let (kind, raw) = ns.selected().ok_or_else(|| {
        PublisherError::config(
            "queue",
            format!(
                "exactly one queue type must be configured, found {}",
                ns.entries.len()
            ),
        )
    })?;

    let raw = match raw {
        Value::Null => Value::Object(Default::default()),
        other => other.clone(),
    };

    let invalid = |e: serde_json::Error| PublisherError::QueueConfig {
        queue_type: kind.to_owned(),
        reason: e.to_string(),
    };

    match kind {
        memqueue::QUEUE_TYPE => {
            let settings: MemQueueSettings = serde_json::from_value(raw).map_err(invalid)?;
            settings.validate()?;
            Ok(QueueSettings::Mem(settings))
        }
        diskqueue::QUEUE_TYPE => {
            let settings: DiskQueueSettings = serde_json::from_value(raw).map_err(invalid)?;
            settings.validate()?;
            Ok(QueueSettings::Disk(settings))
        }
        other => Err(PublisherError::UnknownQueueType(other.to_owned())),
    }
}
