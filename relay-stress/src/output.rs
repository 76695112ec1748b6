//! Synthetic `test` output.
//!
//! Accepts every batch after an optional random delay and can be told to
//! fail every Nth batch with a retryable error. Output-specific keys live
//! next to the common `[output]` settings:
//!
//! | key | meaning |
//! |-----|---------|
//! | `min_wait_ms` / `max_wait_ms` | random per-batch delay range |
//! | `fail_every_batch` | every Nth batch fails (0 = never) |
//! | `retry` | overrides `max_retries` |

use std::time::Duration;

use rand::Rng;
use relay_core::config::OutputConfig;
use relay_core::event::Event;
use relay_publisher::output::{
    DynOutputClient, OutputClient, OutputFactory, OutputGroup, PublishError,
};
use relay_publisher::{Observer, PublisherError, builtin_output_factory};
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

pub const OUTPUT_TYPE: &str = "test";

/// `test` output specific settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TestOutputSettings {
    pub min_wait_ms: u64,
    pub max_wait_ms: u64,
    pub fail_every_batch: usize,
    pub retry: Option<i32>,
}

impl TestOutputSettings {
    pub fn from_output_config(config: &OutputConfig) -> Result<Self, PublisherError> {
        let settings: Self = serde_json::from_value(Value::Object(config.settings.clone()))
            .map_err(|e| PublisherError::Output {
                output: OUTPUT_TYPE.to_owned(),
                reason: e.to_string(),
            })?;
        if settings.max_wait_ms > 0 && settings.min_wait_ms > settings.max_wait_ms {
            return Err(PublisherError::config(
                "output.min_wait_ms",
                "must not exceed max_wait_ms",
            ));
        }
        Ok(settings)
    }

    fn wait(&self) -> Option<Duration> {
        if self.max_wait_ms == 0 || self.min_wait_ms >= self.max_wait_ms {
            return None;
        }
        let ms = rand::thread_rng().gen_range(self.min_wait_ms..self.max_wait_ms);
        Some(Duration::from_millis(ms))
    }
}

/// One worker's client.
#[derive(Debug)]
pub struct TestOutput {
    settings: TestOutputSettings,
    batch_count: usize,
}

impl TestOutput {
    pub fn new(settings: TestOutputSettings) -> Self {
        Self {
            settings,
            batch_count: 0,
        }
    }
}

impl OutputClient for TestOutput {
    fn name(&self) -> &str {
        OUTPUT_TYPE
    }

    async fn publish(
        &mut self,
        cancel: &CancellationToken,
        events: &[Event],
    ) -> Result<(), PublishError> {
        if let Some(wait) = self.settings.wait() {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(PublishError::Retryable("output closed".to_owned()));
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }

        if self.settings.fail_every_batch > 0 {
            self.batch_count += 1;
            if self.batch_count == self.settings.fail_every_batch {
                self.batch_count = 0;
                return Err(PublishError::Retryable(format!(
                    "injected failure for batch of {} events",
                    events.len()
                )));
            }
        }

        Ok(())
    }

    async fn close(&mut self) {}
}

/// Output factory that knows the `test` type and falls back to the built-in outputs.
pub fn stress_output_factory() -> OutputFactory {
    let builtin = builtin_output_factory();
    std::sync::Arc::new(move |observer: &Observer, config: &OutputConfig| {
        if config.kind != OUTPUT_TYPE {
            return builtin(observer, config);
        }
        let settings = TestOutputSettings::from_output_config(config)?;
        let mut common = config.clone();
        if let Some(retry) = settings.retry {
            common.max_retries = retry;
        }
        OutputGroup::from_config(&common, |_| {
            Ok(Box::new(TestOutput::new(settings.clone())) as Box<dyn DynOutputClient>)
        })
    })
}
