//! 메트릭 상수 및 설명 등록
//!
//! 모든 Prometheus 메트릭의 이름과 설명을 중앙에서 정의합니다.
//! 퍼블리셔의 `Observer`는 이 상수를 사용하여 `metrics::counter!()`,
//! `metrics::gauge!()` 매크로를 호출합니다.
//!
//! # 네이밍 컨벤션
//!
//! - 접두어: `relay_`
//! - 영역: `pipeline_`, `queue_`, `output_`, `module_`
//! - 접미어: `_total` (counter), 없음 (gauge)

// ─── 레이블 키 상수 ────────────────────────────────────────────────

/// 큐 타입 레이블 키 (mem, disk)
pub const LABEL_QUEUE_TYPE: &str = "queue_type";

/// 출력 타입 레이블 키
pub const LABEL_OUTPUT: &str = "output";

/// 드롭 사유 레이블 키 (permanent, retry_exhausted)
pub const LABEL_REASON: &str = "reason";

/// 모듈 이름 레이블
pub const LABEL_MODULE: &str = "module";

// ─── Pipeline 메트릭 ────────────────────────────────────────────────

/// Pipeline: 연결된 클라이언트 수 (counter)
pub const PIPELINE_CLIENTS_CONNECTED_TOTAL: &str = "relay_pipeline_clients_connected_total";

/// Pipeline: 종료된 클라이언트 수 (counter)
pub const PIPELINE_CLIENTS_CLOSED_TOTAL: &str = "relay_pipeline_clients_closed_total";

/// Pipeline: 활성 클라이언트 수 (gauge)
pub const PIPELINE_CLIENTS_ACTIVE: &str = "relay_pipeline_clients_active";

/// Pipeline: 클라이언트가 받은 새 이벤트 수 (counter)
pub const PIPELINE_EVENTS_TOTAL: &str = "relay_pipeline_events_total";

/// Pipeline: 프로세서에 의해 필터링된 이벤트 수 (counter)
pub const PIPELINE_EVENTS_FILTERED_TOTAL: &str = "relay_pipeline_events_filtered_total";

/// Pipeline: 큐에 적재된 이벤트 수 (counter)
pub const PIPELINE_EVENTS_PUBLISHED_TOTAL: &str = "relay_pipeline_events_published_total";

/// Pipeline: 큐 포화로 버려진 이벤트 수 (counter)
pub const PIPELINE_EVENTS_DROPPED_TOTAL: &str = "relay_pipeline_events_dropped_total";

/// Pipeline: 프로세서 실패 이벤트 수 (counter)
pub const PIPELINE_EVENTS_FAILED_TOTAL: &str = "relay_pipeline_events_failed_total";

/// Pipeline: 프로듀서에게 ACK된 이벤트 수 (counter)
pub const PIPELINE_EVENTS_ACKED_TOTAL: &str = "relay_pipeline_events_acked_total";

// ─── Queue 메트릭 ───────────────────────────────────────────────────

/// Queue: ACK 대기 중인 이벤트 수 (gauge, label: queue_type)
pub const QUEUE_OUTSTANDING_EVENTS: &str = "relay_queue_outstanding_events";

// ─── Output 메트릭 ──────────────────────────────────────────────────

/// Output: 디스패치된 배치 수 (counter)
pub const OUTPUT_BATCHES_TOTAL: &str = "relay_output_batches_total";

/// Output: 출력이 수락한 이벤트 수 (counter)
pub const OUTPUT_EVENTS_ACKED_TOTAL: &str = "relay_output_events_acked_total";

/// Output: 재시도된 이벤트 수 (counter)
pub const OUTPUT_EVENTS_RETRIED_TOTAL: &str = "relay_output_events_retried_total";

/// Output: 버려진 이벤트 수 (counter, label: reason)
pub const OUTPUT_EVENTS_DROPPED_TOTAL: &str = "relay_output_events_dropped_total";

/// Output: 백오프 대기 횟수 (counter)
pub const OUTPUT_BACKOFF_WAITS_TOTAL: &str = "relay_output_backoff_waits_total";

/// Output: 활성 출력 워커 수 (gauge)
pub const OUTPUT_WORKERS_ACTIVE: &str = "relay_output_workers_active";

// ─── Module 메트릭 ──────────────────────────────────────────────────

/// Module: 실행된 fetch 수 (counter)
pub const MODULE_FETCHES_TOTAL: &str = "relay_module_fetches_total";

/// Module: 실패한 fetch 수 (counter)
pub const MODULE_FETCH_FAILURES_TOTAL: &str = "relay_module_fetch_failures_total";

// ─── 설명 등록 함수 ─────────────────────────────────────────────────

/// 모든 메트릭의 설명(description)을 등록합니다.
///
/// 전역 레코더 설치 후 한 번 호출합니다.
pub fn describe_all() {
    use metrics::{describe_counter, describe_gauge};

    // Pipeline
    describe_counter!(
        PIPELINE_CLIENTS_CONNECTED_TOTAL,
        "Total number of clients connected to the pipeline"
    );
    describe_counter!(
        PIPELINE_CLIENTS_CLOSED_TOTAL,
        "Total number of clients closed"
    );
    describe_gauge!(PIPELINE_CLIENTS_ACTIVE, "Number of currently open clients");
    describe_counter!(
        PIPELINE_EVENTS_TOTAL,
        "Total number of events received by clients"
    );
    describe_counter!(
        PIPELINE_EVENTS_FILTERED_TOTAL,
        "Total number of events dropped by processors"
    );
    describe_counter!(
        PIPELINE_EVENTS_PUBLISHED_TOTAL,
        "Total number of events admitted into the queue"
    );
    describe_counter!(
        PIPELINE_EVENTS_DROPPED_TOTAL,
        "Total number of events rejected because the queue was full"
    );
    describe_counter!(
        PIPELINE_EVENTS_FAILED_TOTAL,
        "Total number of events whose processing chain failed"
    );
    describe_counter!(
        PIPELINE_EVENTS_ACKED_TOTAL,
        "Total number of events acknowledged back to producers"
    );

    // Queue
    describe_gauge!(
        QUEUE_OUTSTANDING_EVENTS,
        "Number of events admitted into the queue and not yet acknowledged"
    );

    // Output
    describe_counter!(
        OUTPUT_BATCHES_TOTAL,
        "Total number of batches handed to output workers"
    );
    describe_counter!(
        OUTPUT_EVENTS_ACKED_TOTAL,
        "Total number of events accepted by outputs"
    );
    describe_counter!(
        OUTPUT_EVENTS_RETRIED_TOTAL,
        "Total number of events scheduled for redelivery"
    );
    describe_counter!(
        OUTPUT_EVENTS_DROPPED_TOTAL,
        "Total number of events dropped after permanent errors or exhausted retries"
    );
    describe_counter!(
        OUTPUT_BACKOFF_WAITS_TOTAL,
        "Total number of backoff delays applied before redelivery"
    );
    describe_gauge!(
        OUTPUT_WORKERS_ACTIVE,
        "Number of output workers currently running"
    );

    // Module
    describe_counter!(MODULE_FETCHES_TOTAL, "Total number of module fetch cycles");
    describe_counter!(
        MODULE_FETCH_FAILURES_TOTAL,
        "Total number of module fetch cycles that failed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_METRIC_NAMES: &[&str] = &[
        PIPELINE_CLIENTS_CONNECTED_TOTAL,
        PIPELINE_CLIENTS_CLOSED_TOTAL,
        PIPELINE_CLIENTS_ACTIVE,
        PIPELINE_EVENTS_TOTAL,
        PIPELINE_EVENTS_FILTERED_TOTAL,
        PIPELINE_EVENTS_PUBLISHED_TOTAL,
        PIPELINE_EVENTS_DROPPED_TOTAL,
        PIPELINE_EVENTS_FAILED_TOTAL,
        PIPELINE_EVENTS_ACKED_TOTAL,
        QUEUE_OUTSTANDING_EVENTS,
        OUTPUT_BATCHES_TOTAL,
        OUTPUT_EVENTS_ACKED_TOTAL,
        OUTPUT_EVENTS_RETRIED_TOTAL,
        OUTPUT_EVENTS_DROPPED_TOTAL,
        OUTPUT_BACKOFF_WAITS_TOTAL,
        OUTPUT_WORKERS_ACTIVE,
        MODULE_FETCHES_TOTAL,
        MODULE_FETCH_FAILURES_TOTAL,
    ];

    #[test]
    fn all_metrics_start_with_relay_prefix() {
        for name in ALL_METRIC_NAMES {
            assert!(
                name.starts_with("relay_"),
                "Metric '{}' does not start with 'relay_' prefix",
                name
            );
        }
    }

    #[test]
    fn metric_names_are_unique() {
        let mut names = ALL_METRIC_NAMES.to_vec();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), ALL_METRIC_NAMES.len());
    }

    #[test]
    fn counters_end_with_total() {
        let gauges = [
            PIPELINE_CLIENTS_ACTIVE,
            QUEUE_OUTSTANDING_EVENTS,
            OUTPUT_WORKERS_ACTIVE,
        ];
        for name in ALL_METRIC_NAMES {
            if !gauges.contains(name) {
                assert!(name.ends_with("_total"), "counter '{}' lacks _total", name);
            }
        }
    }

    #[test]
    fn describe_all_does_not_panic() {
        describe_all();
    }

    #[test]
    fn label_keys_are_lowercase() {
        for label in [LABEL_QUEUE_TYPE, LABEL_OUTPUT, LABEL_REASON, LABEL_MODULE] {
            assert_eq!(label.to_lowercase(), label);
        }
    }
}
