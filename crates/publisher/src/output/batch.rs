//! 출력 배치: 한 번의 전송 시도 동안 단일 워커가 소유하는 이벤트 묶음
//!
//! 배치는 시도마다 정확히 하나의 결과로 끝납니다.
//!
//! - [`Batch::ack`]: 출력이 모든 이벤트를 받아들임
//! - [`Batch::discard`]: 영구 에러나 재시도 한도 초과로 버림 (큐에는 소비된 것으로 ACK)
//! - [`Batch::schedule_retry`]: 디스패처로 되돌려 백오프 후 다시 전송
//!
//! 종료 연산은 `self`를 소비하므로 같은 배치가 두 번 확정될 수 없습니다.

use relay_core::event::Event;
use tokio::time::Instant;

use crate::observer::{DropReason, Observer};
use crate::queue::{AckHandle, QueueBatch};

/// 출력 배치
#[derive(Debug)]
pub struct Batch {
    events: Vec<Event>,
    guaranteed: bool,
    ack: AckHandle,
    attempts: u32,
    not_before: Option<Instant>,
}

impl Batch {
    pub(crate) fn from_queue(batch: QueueBatch) -> Self {
        let guaranteed = batch.entries.iter().any(|entry| entry.guaranteed);
        let events = batch.entries.into_iter().map(|entry| entry.event).collect();
        Self {
            events,
            guaranteed,
            ack: batch.ack,
            attempts: 0,
            not_before: None,
        }
    }

    /// 배치의 이벤트 (적재 순서)
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// 지금까지 실패한 전송 시도 수
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// 보장 전송 모드 이벤트가 하나라도 있으면 재시도 한도와 무관하게 버리지 않습니다.
    pub fn is_guaranteed(&self) -> bool {
        self.guaranteed
    }

    /// 이 시각 이전에는 다시 전송하지 않습니다.
    pub fn not_before(&self) -> Option<Instant> {
        self.not_before
    }

    /// 실패를 기록한 뒤 재시도 한도를 넘었는지 확인합니다.
    ///
    /// `max_retries`가 음수이면 무제한입니다.
    pub(crate) fn record_failure(&mut self, max_retries: i32) -> bool {
        self.attempts = self.attempts.saturating_add(1);
        !self.guaranteed
            && u32::try_from(max_retries).is_ok_and(|limit| self.attempts > limit)
    }

    /// 다음 전송 시각을 설정합니다.
    pub(crate) fn schedule_retry(&mut self, at: Instant) {
        self.not_before = Some(at);
    }

    /// 전송 성공으로 확정합니다.
    pub(crate) fn ack(self, observer: &Observer, output: &str) {
        observer.output_acked(output, self.events.len());
        self.ack.ack();
    }

    /// 이벤트를 버리고 큐에는 소비된 것으로 확정합니다.
    pub(crate) fn discard(self, observer: &Observer, output: &str, reason: DropReason) {
        observer.output_dropped(output, self.events.len(), reason);
        self.ack.ack();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{MemQueue, ProducerConfig, Queue, QueueEntry};

    async fn batch_of(entries: Vec<QueueEntry>) -> (MemQueue, Batch) {
        let queue = MemQueue::with_capacity(16).unwrap();
        let producer = queue.producer(ProducerConfig::default()).unwrap();
        for entry in entries {
            producer.try_publish(entry).unwrap();
        }
        let batch = queue.consumer().get(16).await.unwrap();
        (queue, Batch::from_queue(batch))
    }

    #[tokio::test]
    async fn retry_limit_applies_to_plain_batches() {
        let (_queue, mut batch) = batch_of(vec![QueueEntry::new(Event::new())]).await;
        assert!(!batch.record_failure(1));
        assert!(batch.record_failure(1));
        assert_eq!(batch.attempts(), 2);
    }

    #[tokio::test]
    async fn zero_retries_exhausts_on_first_failure() {
        let (_queue, mut batch) = batch_of(vec![QueueEntry::new(Event::new())]).await;
        assert!(batch.record_failure(0));
    }

    #[tokio::test]
    async fn negative_limit_and_guaranteed_never_exhaust() {
        let (_queue, mut unlimited) = batch_of(vec![QueueEntry::new(Event::new())]).await;
        let (_queue2, mut guaranteed) = batch_of(vec![
            QueueEntry::new(Event::new()),
            QueueEntry::guaranteed(Event::new()),
        ])
        .await;
        assert!(guaranteed.is_guaranteed());
        for _ in 0..10 {
            assert!(!unlimited.record_failure(-1));
            assert!(!guaranteed.record_failure(0));
        }
    }

    #[tokio::test]
    async fn discard_still_acks_queue() {
        let (queue, batch) = batch_of(vec![
            QueueEntry::new(Event::new()),
            QueueEntry::new(Event::new()),
        ])
        .await;
        let observer = Observer::new();
        assert_eq!(queue.outstanding(), 2);
        batch.discard(&observer, "test", DropReason::Permanent);
        assert_eq!(queue.outstanding(), 0);
        assert_eq!(observer.snapshot().output_dropped, 2);
    }
}
