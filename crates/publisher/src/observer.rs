//! 파이프라인 관측기: 명시적으로 전달되는 카운터 레지스트리
//!
//! [`Observer`]는 파이프라인이 소유하고 클라이언트, 출력 워커, 큐에
//! 생성 시점에 전달됩니다. 모든 증가 연산은 내부 원자 카운터와
//! `metrics` 파사드에 동시에 반영됩니다. 전역 싱글턴을 사용하지 않으므로
//! 같은 프로세스의 여러 파이프라인이 서로의 카운터를 오염시키지 않습니다.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use metrics::{counter, gauge};
use relay_core::metrics as names;

/// 출력 이벤트 드롭 사유
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// 출력이 영구 에러를 반환
    Permanent,
    /// 재시도 한도 초과
    RetryExhausted,
}

impl DropReason {
    fn label(self) -> &'static str {
        match self {
            Self::Permanent => "permanent",
            Self::RetryExhausted => "retry_exhausted",
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    clients_connected: AtomicU64,
    clients_closed: AtomicU64,
    clients_active: AtomicI64,
    events_new: AtomicU64,
    events_filtered: AtomicU64,
    events_published: AtomicU64,
    events_dropped_on_publish: AtomicU64,
    events_failed: AtomicU64,
    events_acked: AtomicU64,
    output_batches: AtomicU64,
    output_acked: AtomicU64,
    output_retried: AtomicU64,
    output_dropped: AtomicU64,
    backoff_waits: AtomicU64,
    workers_active: AtomicI64,
}

/// 카운터 스냅샷
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObserverSnapshot {
    pub clients_connected: u64,
    pub clients_closed: u64,
    pub clients_active: i64,
    pub events_new: u64,
    pub events_filtered: u64,
    pub events_published: u64,
    pub events_dropped_on_publish: u64,
    pub events_failed: u64,
    pub events_acked: u64,
    pub output_batches: u64,
    pub output_acked: u64,
    pub output_retried: u64,
    pub output_dropped: u64,
    pub backoff_waits: u64,
    pub workers_active: i64,
}

/// 파이프라인 관측기
///
/// `Clone`은 같은 카운터를 공유하는 핸들을 만듭니다.
#[derive(Debug, Clone, Default)]
pub struct Observer {
    counters: Arc<Counters>,
}

impl Observer {
    /// 새 관측기를 생성합니다.
    pub fn new() -> Self {
        Self::default()
    }

    // ─── 클라이언트 ──────────────────────────────────────────────────

    pub fn client_connected(&self) {
        self.counters
            .clients_connected
            .fetch_add(1, Ordering::Relaxed);
        let active = self.counters.clients_active.fetch_add(1, Ordering::Relaxed) + 1;
        counter!(names::PIPELINE_CLIENTS_CONNECTED_TOTAL).increment(1);
        gauge!(names::PIPELINE_CLIENTS_ACTIVE).set(active as f64);
    }

    pub fn client_closed(&self) {
        self.counters.clients_closed.fetch_add(1, Ordering::Relaxed);
        let active = self.counters.clients_active.fetch_sub(1, Ordering::Relaxed) - 1;
        counter!(names::PIPELINE_CLIENTS_CLOSED_TOTAL).increment(1);
        gauge!(names::PIPELINE_CLIENTS_ACTIVE).set(active as f64);
    }

    pub fn new_event(&self) {
        self.counters.events_new.fetch_add(1, Ordering::Relaxed);
        counter!(names::PIPELINE_EVENTS_TOTAL).increment(1);
    }

    pub fn filtered_event(&self) {
        self.counters.events_filtered.fetch_add(1, Ordering::Relaxed);
        counter!(names::PIPELINE_EVENTS_FILTERED_TOTAL).increment(1);
    }

    pub fn published_event(&self) {
        self.counters.events_published.fetch_add(1, Ordering::Relaxed);
        counter!(names::PIPELINE_EVENTS_PUBLISHED_TOTAL).increment(1);
    }

    pub fn dropped_on_publish(&self) {
        self.counters
            .events_dropped_on_publish
            .fetch_add(1, Ordering::Relaxed);
        counter!(names::PIPELINE_EVENTS_DROPPED_TOTAL).increment(1);
    }

    pub fn failed_event(&self) {
        self.counters.events_failed.fetch_add(1, Ordering::Relaxed);
        counter!(names::PIPELINE_EVENTS_FAILED_TOTAL).increment(1);
    }

    pub fn events_acked(&self, count: usize) {
        self.counters
            .events_acked
            .fetch_add(count as u64, Ordering::Relaxed);
        counter!(names::PIPELINE_EVENTS_ACKED_TOTAL).increment(count as u64);
    }

    // ─── 출력 ────────────────────────────────────────────────────────

    pub fn output_batch(&self, output: &str) {
        self.counters.output_batches.fetch_add(1, Ordering::Relaxed);
        counter!(names::OUTPUT_BATCHES_TOTAL, names::LABEL_OUTPUT => output.to_owned())
            .increment(1);
    }

    pub fn output_acked(&self, output: &str, count: usize) {
        self.counters
            .output_acked
            .fetch_add(count as u64, Ordering::Relaxed);
        counter!(names::OUTPUT_EVENTS_ACKED_TOTAL, names::LABEL_OUTPUT => output.to_owned())
            .increment(count as u64);
    }

    pub fn output_retried(&self, output: &str, count: usize) {
        self.counters
            .output_retried
            .fetch_add(count as u64, Ordering::Relaxed);
        counter!(names::OUTPUT_EVENTS_RETRIED_TOTAL, names::LABEL_OUTPUT => output.to_owned())
            .increment(count as u64);
    }

    pub fn output_dropped(&self, output: &str, count: usize, reason: DropReason) {
        self.counters
            .output_dropped
            .fetch_add(count as u64, Ordering::Relaxed);
        counter!(
            names::OUTPUT_EVENTS_DROPPED_TOTAL,
            names::LABEL_OUTPUT => output.to_owned(),
            names::LABEL_REASON => reason.label()
        )
        .increment(count as u64);
    }

    pub fn backoff_wait(&self) {
        self.counters.backoff_waits.fetch_add(1, Ordering::Relaxed);
        counter!(names::OUTPUT_BACKOFF_WAITS_TOTAL).increment(1);
    }

    pub fn worker_started(&self) {
        let active = self.counters.workers_active.fetch_add(1, Ordering::Relaxed) + 1;
        gauge!(names::OUTPUT_WORKERS_ACTIVE).set(active as f64);
    }

    pub fn worker_stopped(&self) {
        let active = self.counters.workers_active.fetch_sub(1, Ordering::Relaxed) - 1;
        gauge!(names::OUTPUT_WORKERS_ACTIVE).set(active as f64);
    }

    // ─── 조회/정리 ───────────────────────────────────────────────────

    /// 현재 카운터 값을 읽습니다.
    pub fn snapshot(&self) -> ObserverSnapshot {
        let c = &self.counters;
        ObserverSnapshot {
            clients_connected: c.clients_connected.load(Ordering::Relaxed),
            clients_closed: c.clients_closed.load(Ordering::Relaxed),
            clients_active: c.clients_active.load(Ordering::Relaxed),
            events_new: c.events_new.load(Ordering::Relaxed),
            events_filtered: c.events_filtered.load(Ordering::Relaxed),
            events_published: c.events_published.load(Ordering::Relaxed),
            events_dropped_on_publish: c.events_dropped_on_publish.load(Ordering::Relaxed),
            events_failed: c.events_failed.load(Ordering::Relaxed),
            events_acked: c.events_acked.load(Ordering::Relaxed),
            output_batches: c.output_batches.load(Ordering::Relaxed),
            output_acked: c.output_acked.load(Ordering::Relaxed),
            output_retried: c.output_retried.load(Ordering::Relaxed),
            output_dropped: c.output_dropped.load(Ordering::Relaxed),
            backoff_waits: c.backoff_waits.load(Ordering::Relaxed),
            workers_active: c.workers_active.load(Ordering::Relaxed),
        }
    }

    /// 파이프라인 종료 시 활성 게이지를 해제합니다.
    ///
    /// 누적 카운터는 유지됩니다.
    pub fn cleanup(&self) {
        gauge!(names::PIPELINE_CLIENTS_ACTIVE).set(0.0);
        gauge!(names::OUTPUT_WORKERS_ACTIVE).set(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_counters() {
        let observer = Observer::new();
        let handle = observer.clone();
        handle.new_event();
        handle.published_event();
        let snap = observer.snapshot();
        assert_eq!(snap.events_new, 1);
        assert_eq!(snap.events_published, 1);
    }

    #[test]
    fn separate_observers_are_isolated() {
        let a = Observer::new();
        let b = Observer::new();
        a.dropped_on_publish();
        assert_eq!(a.snapshot().events_dropped_on_publish, 1);
        assert_eq!(b.snapshot().events_dropped_on_publish, 0);
    }

    #[test]
    fn client_gauge_tracks_open_clients() {
        let observer = Observer::new();
        observer.client_connected();
        observer.client_connected();
        observer.client_closed();
        let snap = observer.snapshot();
        assert_eq!(snap.clients_connected, 2);
        assert_eq!(snap.clients_closed, 1);
        assert_eq!(snap.clients_active, 1);
    }

    #[test]
    fn output_counters_accumulate_counts() {
        let observer = Observer::new();
        observer.output_batch("test");
        observer.output_acked("test", 5);
        observer.output_dropped("test", 3, DropReason::Permanent);
        observer.output_retried("test", 2);
        let snap = observer.snapshot();
        assert_eq!(snap.output_batches, 1);
        assert_eq!(snap.output_acked, 5);
        assert_eq!(snap.output_dropped, 3);
        assert_eq!(snap.output_retried, 2);
    }
}
