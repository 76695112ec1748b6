//! 큐 브로커: 적재, 배치 추출, ACK 정산을 담당하는 공유 상태
//!
//! 메모리 큐와 디스크 큐가 같은 브로커를 사용하며, 디스크 큐는
//! [`Journal`]을 붙여 적재와 ACK 내역을 기록합니다.
//!
//! 상태는 하나의 `std::sync::Mutex` 아래에 있고 잠금 구간에서는
//! await하지 않습니다. 대기는 `tokio::sync::Notify`로 처리하며,
//! 조건을 확인하기 전에 `Notified`를 등록하여 깨우기 신호를 놓치지 않습니다.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use relay_core::metrics::{LABEL_QUEUE_TYPE, QUEUE_OUTSTANDING_EVENTS};
use relay_core::pipeline::BoxFuture;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{AckFn, AckHandle, AckSink, Consumer, Producer, ProducerConfig, QueueBatch, QueueEntry};

/// 적재/ACK 내역 기록 대상
pub(crate) trait Journal: Send {
    /// 적재된 항목을 기록합니다.
    fn append(&mut self, entry: &QueueEntry) -> std::io::Result<()>;

    /// 앞에서부터 `count`개가 확정되었음을 기록합니다.
    ///
    /// `drained`이면 미확정 항목이 하나도 남지 않은 상태입니다.
    fn acknowledge(&mut self, count: usize, drained: bool) -> std::io::Result<()>;

    /// 버퍼를 비우고 파일을 닫습니다.
    fn close(&mut self) -> std::io::Result<()>;
}

/// 배치 방출 정책
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FlushPolicy {
    pub min_events: usize,
    pub timeout: Duration,
}

impl FlushPolicy {
    pub const IMMEDIATE: Self = Self {
        min_events: 1,
        timeout: Duration::ZERO,
    };

    fn immediate(&self) -> bool {
        self.min_events <= 1 || self.timeout.is_zero()
    }
}

struct Slot {
    producer: Option<u64>,
    admitted_at: Instant,
    entry: Option<QueueEntry>,
    acked: bool,
}

struct ProducerState {
    ack: Option<AckFn>,
    cancelled: bool,
    pending: usize,
}

struct State {
    /// `slots[0]`의 시퀀스 번호
    base_seq: u64,
    /// 다음에 컨슈머에게 넘길 시퀀스 번호
    read_seq: u64,
    slots: VecDeque<Slot>,
    producers: HashMap<u64, ProducerState>,
    next_producer_id: u64,
    closed: bool,
    journal: Option<Box<dyn Journal>>,
}

impl State {
    fn end_seq(&self) -> u64 {
        self.base_seq + self.slots.len() as u64
    }

    fn unread(&self) -> usize {
        (self.end_seq() - self.read_seq) as usize
    }

    fn oldest_unread(&self) -> Option<Instant> {
        let idx = (self.read_seq - self.base_seq) as usize;
        self.slots.get(idx).map(|slot| slot.admitted_at)
    }
}

pub(crate) struct Broker {
    queue_type: &'static str,
    capacity: usize,
    flush: FlushPolicy,
    state: Mutex<State>,
    readable: Notify,
    space: Notify,
    empty: Notify,
}

impl Broker {
    pub fn new(
        queue_type: &'static str,
        capacity: usize,
        flush: FlushPolicy,
        journal: Option<Box<dyn Journal>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue_type,
            capacity,
            flush,
            state: Mutex::new(State {
                base_seq: 0,
                read_seq: 0,
                slots: VecDeque::with_capacity(capacity.min(64 * 1024)),
                producers: HashMap::new(),
                next_producer_id: 0,
                closed: false,
                journal,
            }),
            readable: Notify::new(),
            space: Notify::new(),
            empty: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn outstanding(&self) -> usize {
        self.lock().slots.len()
    }

    /// 복구된 항목을 프로듀서 없이 적재합니다 (용량 제한 없음, 기록 없음).
    pub fn preload(&self, entries: Vec<QueueEntry>) {
        let mut state = self.lock();
        let now = Instant::now();
        for entry in entries {
            state.slots.push_back(Slot {
                producer: None,
                admitted_at: now,
                entry: Some(entry),
                acked: false,
            });
        }
        self.report_outstanding(state.slots.len());
        drop(state);
        self.readable.notify_waiters();
    }

    pub fn register_producer(
        self: &Arc<Self>,
        config: ProducerConfig,
    ) -> Option<Box<dyn Producer>> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }
        let id = state.next_producer_id;
        state.next_producer_id += 1;
        state.producers.insert(
            id,
            ProducerState {
                ack: config.ack,
                cancelled: false,
                pending: 0,
            },
        );
        Some(Box::new(BrokerProducer {
            broker: Arc::clone(self),
            id,
        }))
    }

    pub fn consumer(self: &Arc<Self>) -> Box<dyn Consumer> {
        Box::new(BrokerConsumer {
            broker: Arc::clone(self),
        })
    }

    pub async fn wait_empty(&self) {
        loop {
            let notified = self.empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.lock();
                if state.slots.is_empty() || state.closed {
                    return;
                }
            }
            notified.await;
        }
    }

    pub fn close(&self) -> std::io::Result<()> {
        let result = {
            let mut state = self.lock();
            state.closed = true;
            match state.journal.as_mut() {
                Some(journal) => journal.close(),
                None => Ok(()),
            }
        };
        self.readable.notify_waiters();
        self.space.notify_waiters();
        self.empty.notify_waiters();
        result
    }

    /// 공간이 있으면 적재합니다. 거부되면 항목과 대기 가능 여부를 돌려줍니다.
    ///
    /// 저널 기록에 실패한 항목은 적재하지 않습니다. 기록되지 않은 항목이
    /// 체크포인트에 합산되면 복구 시 다른 항목을 건너뛰게 됩니다.
    fn try_admit(&self, producer: u64, entry: QueueEntry) -> Result<(), (QueueEntry, bool)> {
        let mut state = self.lock();
        let rejected = state.closed
            || state
                .producers
                .get(&producer)
                .is_none_or(|p| p.cancelled);
        if rejected {
            return Err((entry, false));
        }
        if state.slots.len() >= self.capacity {
            return Err((entry, true));
        }

        if let Some(journal) = state.journal.as_mut()
            && let Err(e) = journal.append(&entry)
        {
            warn!(
                queue_type = self.queue_type,
                error = %e,
                "failed to persist queue entry, rejecting it"
            );
            return Err((entry, false));
        }
        if let Some(p) = state.producers.get_mut(&producer) {
            p.pending += 1;
        }
        state.slots.push_back(Slot {
            producer: Some(producer),
            admitted_at: Instant::now(),
            entry: Some(entry),
            acked: false,
        });
        self.report_outstanding(state.slots.len());
        drop(state);
        self.readable.notify_waiters();
        Ok(())
    }

    async fn admit(&self, producer: u64, mut entry: QueueEntry) -> Result<(), QueueEntry> {
        loop {
            let notified = self.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            match self.try_admit(producer, entry) {
                Ok(()) => return Ok(()),
                Err((rejected, false)) => return Err(rejected),
                Err((rejected, true)) => entry = rejected,
            }
            notified.await;
        }
    }

    fn cancel_producer(&self, producer: u64) {
        {
            let mut state = self.lock();
            if let Some(p) = state.producers.get_mut(&producer) {
                p.cancelled = true;
                if p.pending == 0 {
                    state.producers.remove(&producer);
                }
            }
        }
        self.space.notify_waiters();
    }

    /// 방출 가능한 배치를 꺼냅니다. 아직 이르면 다음 확인 시각을 돌려줍니다.
    fn take_batch(self: &Arc<Self>, max_events: usize) -> TakeResult {
        let mut state = self.lock();
        let unread = state.unread();
        if unread == 0 {
            return if state.closed {
                TakeResult::Closed
            } else {
                TakeResult::Wait(None)
            };
        }
        if state.closed {
            return TakeResult::Closed;
        }

        let limit = if max_events == 0 { unread } else { max_events };
        let ready = self.flush.immediate() || unread >= self.flush.min_events.min(limit);
        if !ready {
            let deadline = state
                .oldest_unread()
                .map(|admitted| admitted + self.flush.timeout);
            match deadline {
                Some(deadline) if Instant::now() < deadline => {
                    return TakeResult::Wait(Some(deadline));
                }
                _ => {}
            }
        }

        let count = unread.min(limit);
        let start = state.read_seq;
        let offset = (start - state.base_seq) as usize;
        let mut entries = Vec::with_capacity(count);
        for slot in state.slots.range_mut(offset..offset + count) {
            if let Some(entry) = slot.entry.take() {
                entries.push(entry);
            }
        }
        state.read_seq += count as u64;
        drop(state);

        let sink: Arc<dyn AckSink> = Arc::clone(self) as Arc<dyn AckSink>;
        TakeResult::Batch(QueueBatch {
            entries,
            ack: AckHandle::new(sink, start, count),
        })
    }

    async fn get(self: &Arc<Self>, max_events: usize) -> Option<QueueBatch> {
        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            match self.take_batch(max_events) {
                TakeResult::Batch(batch) => return Some(batch),
                TakeResult::Closed => return None,
                TakeResult::Wait(None) => notified.await,
                TakeResult::Wait(Some(deadline)) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
            }
        }
    }

    fn report_outstanding(&self, outstanding: usize) {
        metrics::gauge!(QUEUE_OUTSTANDING_EVENTS, LABEL_QUEUE_TYPE => self.queue_type)
            .set(outstanding as f64);
    }
}

enum TakeResult {
    Batch(QueueBatch),
    Wait(Option<Instant>),
    Closed,
}

impl AckSink for Broker {
    fn ack_range(&self, start: u64, count: usize) {
        let mut callbacks: Vec<(AckFn, usize)> = Vec::new();
        let released;
        {
            let mut state = self.lock();
            for seq in start..start + count as u64 {
                if seq < state.base_seq {
                    continue;
                }
                let idx = (seq - state.base_seq) as usize;
                if let Some(slot) = state.slots.get_mut(idx) {
                    slot.acked = true;
                }
            }

            // 앞에서부터 연속으로 확정된 구간만 정산합니다.
            let mut per_producer: Vec<(u64, usize)> = Vec::new();
            let mut popped = 0usize;
            while state.slots.front().is_some_and(|slot| slot.acked) {
                if let Some(slot) = state.slots.pop_front()
                    && let Some(id) = slot.producer
                {
                    match per_producer.iter_mut().find(|(pid, _)| *pid == id) {
                        Some((_, n)) => *n += 1,
                        None => per_producer.push((id, 1)),
                    }
                }
                popped += 1;
            }
            state.base_seq += popped as u64;
            released = popped;
            if popped == 0 {
                return;
            }

            for (id, n) in per_producer {
                let remove = match state.producers.get_mut(&id) {
                    Some(p) => {
                        p.pending = p.pending.saturating_sub(n);
                        if let Some(ack) = &p.ack {
                            callbacks.push((Arc::clone(ack), n));
                        }
                        p.cancelled && p.pending == 0
                    }
                    None => false,
                };
                if remove {
                    state.producers.remove(&id);
                }
            }

            let drained = state.slots.is_empty();
            if let Some(journal) = state.journal.as_mut()
                && let Err(e) = journal.acknowledge(popped, drained)
            {
                warn!(
                    queue_type = self.queue_type,
                    error = %e,
                    "failed to persist queue acknowledgement"
                );
            }
            self.report_outstanding(state.slots.len());
        }

        debug!(
            queue_type = self.queue_type,
            released, "released acknowledged events"
        );
        for (ack, n) in callbacks {
            ack(n);
        }
        self.space.notify_waiters();
        self.empty.notify_waiters();
    }
}

struct BrokerProducer {
    broker: Arc<Broker>,
    id: u64,
}

impl Producer for BrokerProducer {
    fn publish(&self, entry: QueueEntry) -> BoxFuture<'_, Result<(), QueueEntry>> {
        Box::pin(self.broker.admit(self.id, entry))
    }

    fn try_publish(&self, entry: QueueEntry) -> Result<(), QueueEntry> {
        self.broker
            .try_admit(self.id, entry)
            .map_err(|(entry, _)| entry)
    }

    fn cancel(&self) {
        self.broker.cancel_producer(self.id);
    }
}

struct BrokerConsumer {
    broker: Arc<Broker>,
}

impl Consumer for BrokerConsumer {
    fn get(&mut self, max_events: usize) -> BoxFuture<'_, Option<QueueBatch>> {
        Box::pin(self.broker.get(max_events))
    }
}
