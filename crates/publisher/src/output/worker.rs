//! 출력 워커: 공유 작업 채널에서 배치를 받아 출력 클라이언트로 전송

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::backoff::GroupBackoff;
use super::batch::Batch;
use super::{DynOutputClient, PublishError};
use crate::observer::{DropReason, Observer};

/// 한 그룹의 워커들이 공유하는 상태
pub(crate) struct WorkerContext {
    /// 워커들이 나눠 받는 작업 채널 (워커별 전용 큐 없음)
    pub work_rx: Mutex<mpsc::Receiver<Batch>>,
    /// 재시도 배치를 디스패처로 돌려보내는 채널
    pub retry_tx: mpsc::UnboundedSender<Batch>,
    pub backoff: GroupBackoff,
    pub max_retries: i32,
    pub observer: Observer,
    pub cancel: CancellationToken,
}

async fn next_batch(rx: &Mutex<mpsc::Receiver<Batch>>) -> Option<Batch> {
    rx.lock().await.recv().await
}

/// 작업 채널이 닫히거나 취소될 때까지 배치를 전송합니다.
pub(crate) async fn run(
    worker_id: usize,
    mut client: Box<dyn DynOutputClient>,
    ctx: Arc<WorkerContext>,
) {
    let output = client.name().to_owned();
    ctx.observer.worker_started();
    tracing::debug!(worker = worker_id, output = %output, "output worker started");

    loop {
        let batch = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            batch = next_batch(&ctx.work_rx) => match batch {
                Some(batch) => batch,
                None => break,
            },
        };

        ctx.observer.output_batch(&output);
        let result = client.publish(&ctx.cancel, batch.events()).await;
        handle_result(worker_id, &output, &ctx, batch, result);
    }

    client.close().await;
    ctx.observer.worker_stopped();
    tracing::debug!(worker = worker_id, output = %output, "output worker stopped");
}

fn handle_result(
    worker_id: usize,
    output: &str,
    ctx: &WorkerContext,
    mut batch: Batch,
    result: Result<(), PublishError>,
) {
    match result {
        Ok(()) => {
            ctx.backoff.reset();
            batch.ack(&ctx.observer, output);
        }
        Err(PublishError::Permanent(reason)) => {
            tracing::warn!(
                worker = worker_id,
                output = output,
                events = batch.len(),
                reason = %reason,
                "dropping batch after permanent publish failure"
            );
            batch.discard(&ctx.observer, output, DropReason::Permanent);
        }
        Err(PublishError::Retryable(reason)) => {
            if ctx.cancel.is_cancelled() {
                // 큐에 미확정 상태로 남음
                tracing::debug!(
                    worker = worker_id,
                    events = batch.len(),
                    "batch abandoned on shutdown"
                );
                return;
            }
            if batch.record_failure(ctx.max_retries) {
                tracing::warn!(
                    worker = worker_id,
                    output = output,
                    events = batch.len(),
                    attempts = batch.attempts(),
                    reason = %reason,
                    "dropping batch after exhausting retries"
                );
                batch.discard(&ctx.observer, output, DropReason::RetryExhausted);
                return;
            }

            let delay = ctx.backoff.fail();
            tracing::debug!(
                worker = worker_id,
                output = output,
                events = batch.len(),
                attempts = batch.attempts(),
                delay_ms = delay.as_millis() as u64,
                reason = %reason,
                "retrying batch after backoff"
            );
            ctx.observer.output_retried(output, batch.len());
            ctx.observer.backoff_wait();
            batch.schedule_retry(Instant::now() + delay);
            if let Err(mpsc::error::SendError(batch)) = ctx.retry_tx.send(batch) {
                tracing::debug!(
                    events = batch.len(),
                    "dispatcher gone, retry batch left unacknowledged"
                );
            }
        }
    }
}
