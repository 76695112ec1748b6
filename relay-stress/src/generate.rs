//! Event generators and the stress run driver.
//!
//! Each generator owns one pipeline client and publishes events in a tight
//! loop until it is stopped or reaches `max_events`. A per-generator
//! watchdog reports an error whenever the published count did not move
//! during one watchdog interval.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use relay_core::event::Event;
use relay_publisher::{Client, ClientConfig, Pipeline, PublishMode, counting_acker};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{GenerateConfig, StressConfig};
use crate::output::stress_output_factory;

/// Publishes between cooperative yields so drop mode cannot starve the runtime.
const YIELD_EVERY: u64 = 64;

/// Errors collected from generators and watchdogs.
#[derive(Debug, Clone, Default)]
pub struct ErrorLog {
    inner: Arc<Mutex<Vec<String>>>,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, error: impl Into<String>) {
        let error = error.into();
        tracing::error!(error = %error, "stress error");
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(error);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.inner.lock().unwrap_or_else(|p| p.into_inner()))
    }
}

/// Totals reported at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StressReport {
    /// Events handed to clients by all generators.
    pub generated: u64,
    /// Events admitted into the queue.
    pub published: u64,
    /// Events acknowledged back to the generators' clients.
    pub acked: u64,
    /// Events rejected on publish or dropped by the output.
    pub dropped: u64,
    pub errors: Vec<String>,
}

impl StressReport {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Builds the client settings for one generator.
pub fn client_config(config: &GenerateConfig, id: usize) -> ClientConfig {
    let mut client = ClientConfig::new().with_publish_mode(PublishMode::from(config.publish_mode));
    if let Some(wait) = config.wait_close() {
        client = client.with_wait_close(wait);
    }
    if config.ack {
        client = client.with_ack_listener(counting_acker(move |n| {
            info!(generator = id, acked = n, "generator ACKs");
        }));
    }
    client
}

/// Runs one generator until `stop` fires or `max_events` is reached.
///
/// Returns the number of events handed to the client. The client is closed
/// before returning.
pub async fn generate(
    client: Client,
    config: GenerateConfig,
    id: usize,
    stop: CancellationToken,
    errors: ErrorLog,
) -> u64 {
    let count = Arc::new(AtomicU64::new(0));
    let done = stop.child_token();
    let mut helpers = JoinSet::new();

    // Closing the client releases a publish blocked on a full queue.
    let closer = client.clone();
    let closer_done = done.clone();
    helpers.spawn(async move {
        closer_done.cancelled().await;
        closer.close().await;
    });

    if let Some(interval) = config.watchdog() {
        let count = Arc::clone(&count);
        let done = done.clone();
        let errors = errors.clone();
        helpers.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            let mut last = 0;
            loop {
                tokio::select! {
                    biased;
                    _ = done.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let current = count.load(Ordering::Relaxed);
                if current == last {
                    errors.push(format!(
                        "no progress in generator {id} (last={last}, current={current})"
                    ));
                }
                last = current;
            }
        });
    }

    info!(generator = id, mode = %PublishMode::from(config.publish_mode), "generator started");

    while !stop.is_cancelled() {
        let event = Event::new()
            .with_field("id", id)
            .with_field("hello", "world")
            .with_field("count", count.load(Ordering::Relaxed));
        client.publish(event).await;

        let total = count.fetch_add(1, Ordering::Relaxed) + 1;
        if config.max_events > 0 && total >= config.max_events {
            break;
        }
        if total % YIELD_EVERY == 0 {
            tokio::task::yield_now().await;
        }
    }

    done.cancel();
    while let Some(result) = helpers.join_next().await {
        if let Err(e) = result {
            errors.push(format!("generator {id} helper task failed: {e}"));
        }
    }

    let total = count.load(Ordering::Relaxed);
    info!(generator = id, events = total, "generator stopped");
    total
}

/// Runs a full stress test: builds the pipeline, starts the generators,
/// waits for them, closes the pipeline and collects the totals.
pub async fn run(config: &StressConfig, stop: CancellationToken) -> Result<StressReport> {
    let pipeline = Pipeline::from_config(&config.relay, &stress_output_factory())?;
    let errors = ErrorLog::new();

    let mut generators = JoinSet::new();
    for id in 0..config.generate.worker {
        let client = pipeline.connect_with(client_config(&config.generate, id))?;
        generators.spawn(generate(
            client,
            config.generate.clone(),
            id,
            stop.clone(),
            errors.clone(),
        ));
    }
    info!(generators = config.generate.worker, "stress run started");

    let mut generated = 0;
    while let Some(result) = generators.join_next().await {
        match result {
            Ok(count) => generated += count,
            Err(e) => errors.push(format!("generator task failed: {e}")),
        }
    }

    debug!(outstanding = pipeline.outstanding(), "closing pipeline");
    pipeline.close().await;

    let snapshot = pipeline.observer().snapshot();
    Ok(StressReport {
        generated,
        published: snapshot.events_published,
        acked: snapshot.events_acked,
        dropped: snapshot.events_dropped_on_publish + snapshot.output_dropped,
        errors: errors.take(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_log_collects_and_drains() {
        let log = ErrorLog::new();
        assert!(log.is_empty());
        log.clone().push("first");
        log.push(String::from("second"));
        assert_eq!(log.len(), 2);
        assert_eq!(log.take(), vec!["first".to_owned(), "second".to_owned()]);
        assert!(log.is_empty());
    }

    #[test]
    fn report_success_depends_on_errors() {
        let mut report = StressReport::default();
        assert!(report.is_success());
        report.errors.push("stalled".to_owned());
        assert!(!report.is_success());
    }
}
