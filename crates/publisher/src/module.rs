//! 모듈 러너: 주기적으로 데이터를 수집해 클라이언트로 퍼블리시하는 프로듀서
//!
//! # 구성
//!
//! - [`Connector`]: 모듈 설정(`index`, `processors`, `fields`, `tags`, `keep_null`)을
//!   [`ClientConfig`]로 변환합니다. 인덱스 프로세서가 사용자 프로세서보다 먼저 실행됩니다.
//! - [`Fetcher`]: 수집 방식. 시작 시 한 번 결정되며 수집마다 다시 판별하지 않습니다.
//! - [`ModuleRunner`]: 첫 수집은 즉시, 이후 `period` 간격으로 수집합니다.
//!   연속 실패가 `failure_threshold`에 도달하면 `Degraded`를 보고하고,
//!   성공하면 `Healthy`로 돌아갑니다.
//!
//! 수집 통계는 전역 맵이 아닌 러너가 소유한 [`FetchStats`]에 기록됩니다.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use metrics::counter;
use relay_core::event::Event;
use relay_core::metrics as names;
use relay_core::pipeline::{BoxFuture, HealthStatus};
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::client::{Client, ClientConfig, PublishMode};
use crate::error::PublisherError;
use crate::pipeline::Pipeline;

/// 수집 에러
pub type FetchError = Box<dyn std::error::Error + Send + Sync>;

/// 커넥터 설정
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectorSettings {
    pub index: Option<String>,
    pub processors: Vec<Value>,
    pub keep_null: bool,
    pub fields: Map<String, Value>,
    pub tags: Vec<String>,
}

/// 모듈 설정으로 클라이언트를 연결합니다.
#[derive(Debug, Clone, Default)]
pub struct Connector {
    settings: ConnectorSettings,
    publish_mode: PublishMode,
}

impl Connector {
    pub fn new(settings: ConnectorSettings) -> Self {
        Self {
            settings,
            publish_mode: PublishMode::Default,
        }
    }

    /// 설정 값에서 커넥터를 생성합니다. 알 수 없는 키는 거부합니다.
    pub fn from_value(value: &Value) -> Result<Self, PublisherError> {
        let settings = match value {
            Value::Null => ConnectorSettings::default(),
            other => ConnectorSettings::deserialize(other)
                .map_err(|e| PublisherError::config("module", e.to_string()))?,
        };
        Ok(Self::new(settings))
    }

    pub fn with_publish_mode(mut self, mode: PublishMode) -> Self {
        self.publish_mode = mode;
        self
    }

    /// 클라이언트 설정을 만듭니다.
    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new()
            .with_publish_mode(self.publish_mode)
            .keep_null(self.settings.keep_null)
            .with_tags(self.settings.tags.iter().cloned());
        config.processing.fields = self.settings.fields.clone();
        config.processing.index = self.settings.index.clone();
        config.processing.processors = self.settings.processors.clone();
        config
    }

    /// 파이프라인에 클라이언트를 연결합니다.
    pub fn connect(&self, pipeline: &Pipeline) -> Result<Client, PublisherError> {
        pipeline.connect_with(self.client_config())
    }
}

/// 수집 결과를 모으는 리포터
///
/// 러너가 취소되면 `event`/`error`는 `false`를 반환하며 수집을 중단해야 합니다.
#[derive(Debug)]
pub struct Reporter {
    events: Vec<Event>,
    errors: Vec<String>,
    cancel: CancellationToken,
}

impl Reporter {
    fn new(cancel: CancellationToken) -> Self {
        Self {
            events: Vec::new(),
            errors: Vec::new(),
            cancel,
        }
    }

    /// 이벤트를 보고합니다.
    pub fn event(&mut self, event: Event) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.events.push(event);
        true
    }

    /// 수집 에러를 보고합니다. 에러 이벤트로 퍼블리시됩니다.
    pub fn error(&mut self, error: impl fmt::Display) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.errors.push(error.to_string());
        true
    }

    /// 러너가 취소되었는지 확인합니다.
    pub fn is_done(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// 리포터에 결과만 보고하는 수집기
pub trait BasicFetcher: Send {
    fn fetch<'a>(&'a mut self, reporter: &'a mut Reporter) -> BoxFuture<'a, ()>;
}

/// 취소 토큰을 받는 수집기
pub trait ContextFetcher: Send {
    fn fetch<'a>(
        &'a mut self,
        cancel: &'a CancellationToken,
        reporter: &'a mut Reporter,
    ) -> BoxFuture<'a, Result<(), FetchError>>;
}

/// 에러를 반환하는 수집기
pub trait ErrorFetcher: Send {
    fn fetch<'a>(&'a mut self, reporter: &'a mut Reporter) -> BoxFuture<'a, Result<(), FetchError>>;
}

/// 수집 방식
pub enum Fetcher {
    Basic(Box<dyn BasicFetcher>),
    WithContext(Box<dyn ContextFetcher>),
    ErrorReturning(Box<dyn ErrorFetcher>),
}

impl Fetcher {
    fn kind(&self) -> &'static str {
        match self {
            Self::Basic(_) => "basic",
            Self::WithContext(_) => "with_context",
            Self::ErrorReturning(_) => "error_returning",
        }
    }

    async fn fetch(
        &mut self,
        cancel: &CancellationToken,
        reporter: &mut Reporter,
    ) -> Result<(), FetchError> {
        match self {
            Self::Basic(fetcher) => {
                fetcher.fetch(reporter).await;
                Ok(())
            }
            Self::WithContext(fetcher) => fetcher.fetch(cancel, reporter).await,
            Self::ErrorReturning(fetcher) => fetcher.fetch(reporter).await,
        }
    }
}

impl fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

/// 모듈 러너 설정
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSettings {
    pub name: String,
    pub period: Duration,
    /// 이 횟수만큼 연속 실패하면 `Degraded` (0이면 보고하지 않음)
    pub failure_threshold: u32,
}

impl ModuleSettings {
    pub fn new(name: impl Into<String>, period: Duration) -> Self {
        Self {
            name: name.into(),
            period,
            failure_threshold: 3,
        }
    }

    pub fn validate(&self) -> Result<(), PublisherError> {
        if self.name.is_empty() {
            return Err(PublisherError::config("module.name", "must not be empty"));
        }
        if self.period.is_zero() {
            return Err(PublisherError::config("module.period", "must be greater than 0"));
        }
        Ok(())
    }
}

/// 수집 통계
#[derive(Debug, Default)]
pub struct FetchStats {
    fetches: AtomicU64,
    failures: AtomicU64,
    consecutive_failures: AtomicU32,
    events: AtomicU64,
}

impl FetchStats {
    pub fn fetches(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn events(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }
}

/// 모듈 러너
pub struct ModuleRunner {
    settings: ModuleSettings,
    fetcher: Fetcher,
    client: Client,
    stats: Arc<FetchStats>,
    health: Arc<RwLock<HealthStatus>>,
}

impl ModuleRunner {
    pub fn new(
        settings: ModuleSettings,
        fetcher: Fetcher,
        client: Client,
    ) -> Result<Self, PublisherError> {
        settings.validate()?;
        Ok(Self {
            settings,
            fetcher,
            client,
            stats: Arc::new(FetchStats::default()),
            health: Arc::new(RwLock::new(HealthStatus::Healthy)),
        })
    }

    /// 수집 통계 핸들
    pub fn stats(&self) -> Arc<FetchStats> {
        Arc::clone(&self.stats)
    }

    pub fn health(&self) -> HealthStatus {
        self.health
            .read()
            .map(|h| h.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// 한 번 수집해 결과를 퍼블리시합니다.
    pub async fn fetch_once(&mut self, cancel: &CancellationToken) {
        let module = self.settings.name.as_str();
        let mut reporter = Reporter::new(cancel.clone());
        let result = self.fetcher.fetch(cancel, &mut reporter).await;

        self.stats.fetches.fetch_add(1, Ordering::Relaxed);
        counter!(names::MODULE_FETCHES_TOTAL, names::LABEL_MODULE => module.to_owned()).increment(1);

        let mut errors = reporter.errors;
        if let Err(e) = result {
            errors.push(e.to_string());
        }

        let count = reporter.events.len();
        for mut event in reporter.events {
            event.put_value("event.module", Value::String(module.to_owned()));
            self.client.publish(event).await;
        }
        self.stats.events.fetch_add(count as u64, Ordering::Relaxed);

        if errors.is_empty() {
            self.record_success();
            return;
        }

        for message in &errors {
            let mut event = Event::new();
            event.put_value("event.module", Value::String(module.to_owned()));
            event.set_error_message(message.clone());
            self.client.publish(event).await;
        }
        self.record_failure(&errors);
    }

    fn record_success(&self) {
        let previous = self.stats.consecutive_failures.swap(0, Ordering::Relaxed);
        if previous > 0 {
            tracing::info!(module = %self.settings.name, previous_failures = previous, "module fetch recovered");
        }
        self.set_health(HealthStatus::Healthy);
    }

    fn record_failure(&self, errors: &[String]) {
        self.stats.failures.fetch_add(1, Ordering::Relaxed);
        counter!(
            names::MODULE_FETCH_FAILURES_TOTAL,
            names::LABEL_MODULE => self.settings.name.clone()
        )
        .increment(1);
        let consecutive = self
            .stats
            .consecutive_failures
            .fetch_add(1, Ordering::Relaxed)
            .saturating_add(1);

        tracing::warn!(
            module = %self.settings.name,
            consecutive,
            error = %errors.join("; "),
            "module fetch failed"
        );

        let threshold = self.settings.failure_threshold;
        if threshold > 0 && consecutive >= threshold {
            self.set_health(HealthStatus::Degraded(format!(
                "{} consecutive fetch failures",
                consecutive
            )));
        }
    }

    fn set_health(&self, status: HealthStatus) {
        let mut health = self
            .health
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *health = status;
    }

    /// 취소될 때까지 주기적으로 수집합니다. 반환 시 클라이언트를 닫습니다.
    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::info!(
            module = %self.settings.name,
            fetcher = self.fetcher.kind(),
            period_ms = self.settings.period.as_millis() as u64,
            "module runner started"
        );

        // 첫 틱은 즉시 발생
        let mut ticker = tokio::time::interval(self.settings.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.fetch_once(&cancel).await,
            }
        }

        self.client.close().await;
        tracing::info!(
            module = %self.settings.name,
            fetches = self.stats.fetches(),
            failures = self.stats.failures(),
            "module runner stopped"
        );
    }
}

impl fmt::Debug for ModuleRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRunner")
            .field("settings", &self.settings)
            .field("fetcher", &self.fetcher)
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use relay_core::event::ERROR_MESSAGE_FIELD;
    use serde_json::json;

    use super::*;
    use crate::processing::index::RAW_INDEX_FIELD;
    use crate::processing::{ChainOutcome, ProcessorRegistry};

    struct Counter {
        calls: Arc<AtomicUsize>,
    }

    impl BasicFetcher for Counter {
        fn fetch<'a>(&'a mut self, reporter: &'a mut Reporter) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                let n = self.calls.fetch_add(1, Ordering::SeqCst);
                reporter.event(Event::new().with_field("n", n as u64));
            })
        }
    }

    /// 지정한 횟수만큼 실패한 뒤 성공
    struct Flaky {
        failures_left: u32,
    }

    impl ErrorFetcher for Flaky {
        fn fetch<'a>(
            &'a mut self,
            reporter: &'a mut Reporter,
        ) -> BoxFuture<'a, Result<(), FetchError>> {
            Box::pin(async move {
                if self.failures_left > 0 {
                    self.failures_left -= 1;
                    return Err("endpoint unavailable".into());
                }
                reporter.event(Event::new());
                Ok(())
            })
        }
    }

    struct Cancellable;

    impl ContextFetcher for Cancellable {
        fn fetch<'a>(
            &'a mut self,
            cancel: &'a CancellationToken,
            reporter: &'a mut Reporter,
        ) -> BoxFuture<'a, Result<(), FetchError>> {
            Box::pin(async move {
                if !cancel.is_cancelled() {
                    reporter.error("partial failure");
                    reporter.event(Event::new());
                }
                Ok(())
            })
        }
    }

    fn pipeline() -> Pipeline {
        Pipeline::builder().build().unwrap()
    }

    #[test]
    fn connector_puts_index_before_user_processors() {
        let connector = Connector::from_value(&json!({
            "index": "computed",
            "processors": [
                {"add_fields": {"target": "@metadata", "fields": {"raw_index": "user"}}}
            ],
            "tags": ["mod"]
        }))
        .unwrap();
        let chain = connector
            .client_config()
            .build_chain(&ProcessorRegistry::with_builtins(), &[])
            .unwrap();
        let ChainOutcome::Publish(event) = chain.run(Event::new()) else {
            panic!("event should be published");
        };
        assert_eq!(event.get_value(RAW_INDEX_FIELD), Some(&json!("user")));
        assert_eq!(event.get_value("tags"), Some(&json!(["mod"])));
    }

    #[test]
    fn connector_rejects_unknown_settings() {
        let err = Connector::from_value(&json!({"indx": "typo"})).unwrap_err();
        assert!(err.to_string().contains("indx"));
        assert!(Connector::from_value(&Value::Null).is_ok());
    }

    #[test]
    fn settings_validation() {
        assert!(ModuleSettings::new("", Duration::from_secs(1)).validate().is_err());
        assert!(ModuleSettings::new("m", Duration::ZERO).validate().is_err());
        assert!(ModuleSettings::new("m", Duration::from_secs(1)).validate().is_ok());
    }

    #[tokio::test]
    async fn basic_fetcher_publishes_events() {
        let pipeline = pipeline();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut runner = ModuleRunner::new(
            ModuleSettings::new("counter", Duration::from_secs(1)),
            Fetcher::Basic(Box::new(Counter {
                calls: Arc::clone(&calls),
            })),
            pipeline.connect().unwrap(),
        )
        .unwrap();

        let cancel = CancellationToken::new();
        runner.fetch_once(&cancel).await;
        runner.fetch_once(&cancel).await;

        assert_eq!(runner.stats().fetches(), 2);
        assert_eq!(runner.stats().events(), 2);
        assert_eq!(pipeline.outstanding(), 2);
        assert!(runner.health().is_healthy());
    }

    #[tokio::test]
    async fn consecutive_failures_degrade_then_recover() {
        let pipeline = pipeline();
        let mut settings = ModuleSettings::new("flaky", Duration::from_secs(1));
        settings.failure_threshold = 2;
        let mut runner = ModuleRunner::new(
            settings,
            Fetcher::ErrorReturning(Box::new(Flaky { failures_left: 2 })),
            pipeline.connect().unwrap(),
        )
        .unwrap();
        let cancel = CancellationToken::new();

        runner.fetch_once(&cancel).await;
        assert!(runner.health().is_healthy());
        runner.fetch_once(&cancel).await;
        assert!(matches!(runner.health(), HealthStatus::Degraded(_)));
        assert_eq!(runner.stats().consecutive_failures(), 2);

        runner.fetch_once(&cancel).await;
        assert!(runner.health().is_healthy());
        assert_eq!(runner.stats().consecutive_failures(), 0);
        assert_eq!(runner.stats().failures(), 2);
        // 에러 이벤트 2개 + 정상 이벤트 1개
        assert_eq!(pipeline.outstanding(), 3);
    }

    #[tokio::test]
    async fn reported_errors_become_error_events() {
        let captured = Arc::new(std::sync::Mutex::new(Vec::new()));
        struct Capture(Arc<std::sync::Mutex<Vec<Event>>>);
        impl crate::processing::Processor for Capture {
            fn run(
                &self,
                event: Event,
            ) -> Result<Option<Event>, crate::processing::ProcessorFailure> {
                self.0.lock().unwrap().push(event.clone());
                Ok(Some(event))
            }
        }
        impl fmt::Display for Capture {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("capture")
            }
        }

        let pipeline = pipeline();
        let client = pipeline
            .connect_with(ClientConfig::new().with_processor(Arc::new(Capture(Arc::clone(&captured)))))
            .unwrap();
        let mut runner = ModuleRunner::new(
            ModuleSettings::new("ctx", Duration::from_secs(1)),
            Fetcher::WithContext(Box::new(Cancellable)),
            client,
        )
        .unwrap();
        runner.fetch_once(&CancellationToken::new()).await;

        let events = captured.lock().unwrap().clone();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.get_value("event.module") == Some(&json!("ctx"))));
        assert_eq!(
            events[1].get_value(ERROR_MESSAGE_FIELD),
            Some(&json!("partial failure"))
        );
        assert_eq!(runner.stats().failures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_fetches_immediately_and_periodically() {
        let pipeline = pipeline();
        let calls = Arc::new(AtomicUsize::new(0));
        let runner = ModuleRunner::new(
            ModuleSettings::new("counter", Duration::from_secs(10)),
            Fetcher::Basic(Box::new(Counter {
                calls: Arc::clone(&calls),
            })),
            pipeline.connect().unwrap(),
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(runner.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(pipeline.observer().snapshot().clients_closed, 1);
    }
}
