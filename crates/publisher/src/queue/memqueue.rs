//! 메모리 큐: 고정 용량 인메모리 버퍼

use std::sync::Arc;
use std::time::Duration;

use relay_core::pipeline::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::broker::{Broker, FlushPolicy};
use super::{Consumer, Producer, ProducerConfig, Queue};
use crate::error::PublisherError;

pub const QUEUE_TYPE: &str = "mem";

/// 최대 이벤트 수 상한
const MAX_EVENTS: usize = 10_000_000;

/// `[queue.mem]` 설정
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemQueueSettings {
    /// 최대 미확정 이벤트 수
    pub events: usize,
    /// 배치 방출 최소 이벤트 수 (1 이하이면 즉시 방출)
    pub flush_min_events: usize,
    /// 최소 이벤트 수에 못 미쳐도 방출하는 대기 시간 (0이면 즉시 방출)
    pub flush_timeout_ms: u64,
}

impl MemQueueSettings {
    pub fn validate(&self) -> Result<(), PublisherError> {
        let invalid = |reason: String| PublisherError::QueueConfig {
            queue_type: QUEUE_TYPE.to_owned(),
            reason,
        };
        if self.events == 0 || self.events > MAX_EVENTS {
            return Err(invalid(format!("events must be between 1 and {MAX_EVENTS}")));
        }
        if self.flush_min_events > self.events {
            return Err(invalid(format!(
                "flush_min_events ({}) must not exceed events ({})",
                self.flush_min_events, self.events
            )));
        }
        Ok(())
    }

    pub(crate) fn flush_policy(&self) -> FlushPolicy {
        FlushPolicy {
            min_events: self.flush_min_events,
            timeout: Duration::from_millis(self.flush_timeout_ms),
        }
    }
}

impl Default for MemQueueSettings {
    fn default() -> Self {
        Self {
            events: 4096,
            flush_min_events: 2048,
            flush_timeout_ms: 1_000,
        }
    }
}

/// 인메모리 큐
pub struct MemQueue {
    broker: Arc<Broker>,
}

impl MemQueue {
    pub fn new(settings: MemQueueSettings) -> Result<Self, PublisherError> {
        settings.validate()?;
        info!(
            events = settings.events,
            flush_min_events = settings.flush_min_events,
            flush_timeout_ms = settings.flush_timeout_ms,
            "memory queue opened"
        );
        Ok(Self {
            broker: Broker::new(
                QUEUE_TYPE,
                settings.events,
                settings.flush_policy(),
                None,
            ),
        })
    }

    /// 배치를 즉시 방출하는 큐를 생성합니다.
    pub fn with_capacity(events: usize) -> Result<Self, PublisherError> {
        Self::new(MemQueueSettings {
            events,
            flush_min_events: 1,
            flush_timeout_ms: 0,
        })
    }
}

impl Queue for MemQueue {
    fn queue_type(&self) -> &'static str {
        QUEUE_TYPE
    }

    fn capacity(&self) -> usize {
        self.broker.capacity()
    }

    fn producer(&self, config: ProducerConfig) -> Option<Box<dyn Producer>> {
        self.broker.register_producer(config)
    }

    fn consumer(&self) -> Box<dyn Consumer> {
        self.broker.consumer()
    }

    fn outstanding(&self) -> usize {
        self.broker.outstanding()
    }

    fn wait_empty(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.broker.wait_empty())
    }

    fn close(&self) -> Result<(), PublisherError> {
        self.broker.close()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueEntry;
    use relay_core::event::Event;

    #[test]
    fn default_settings_are_valid() {
        MemQueueSettings::default().validate().unwrap();
    }

    #[test]
    fn flush_min_above_capacity_is_rejected() {
        let settings = MemQueueSettings {
            events: 10,
            flush_min_events: 20,
            flush_timeout_ms: 0,
        };
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("flush_min_events"));
    }

    #[tokio::test]
    async fn capacity_bounds_unacked_events() {
        let queue = MemQueue::with_capacity(2).unwrap();
        let producer = queue.producer(ProducerConfig::default()).unwrap();
        producer.try_publish(QueueEntry::new(Event::new())).unwrap();
        producer.try_publish(QueueEntry::new(Event::new())).unwrap();

        // 꺼내기만 하고 ACK하지 않으면 공간이 생기지 않음
        let batch = queue.consumer().get(2).await.unwrap();
        assert!(producer.try_publish(QueueEntry::new(Event::new())).is_err());
        assert_eq!(queue.outstanding(), 2);

        batch.ack.ack();
        assert_eq!(queue.outstanding(), 0);
        producer.try_publish(QueueEntry::new(Event::new())).unwrap();
    }
}
