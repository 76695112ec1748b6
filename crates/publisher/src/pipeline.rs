//! 파이프라인: 큐, 출력 컨트롤러, 클라이언트 생성을 묶는 최상위 타입
//!
//! # 생명주기
//!
//! 1. [`PipelineBuilder::build`] 또는 [`Pipeline::from_config`]: 큐 설정을 먼저
//!    검증하고 큐를 연 뒤 출력 컨트롤러를 시작합니다. 잘못된 큐 설정은
//!    클라이언트가 생기기 전에 실패합니다.
//! 2. [`Pipeline::connect_with`]: 처리 체인을 구성하고 클라이언트를 생성합니다.
//! 3. [`Pipeline::close`]: 새 연결을 거부하고, `wait_close_mode = "pipeline"`이면
//!    큐가 비워질 때까지 최대 `wait_close`만큼 기다린 뒤 디스패처와 큐를 닫습니다.
//!
//! 이미 연결된 클라이언트는 파이프라인이 닫지 않습니다. 호출자가 먼저 닫아야 합니다.
//!
//! 토키오 런타임 안에서 생성해야 합니다.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use relay_core::config::{OutputConfig, PipelineSection, QueueNamespace, RelayConfig, WaitCloseMode};
use relay_core::pipeline::HealthStatus;
use serde_json::Value;
use tokio::sync::OnceCell;

use crate::client::{Client, ClientConfig};
use crate::error::PublisherError;
use crate::observer::Observer;
use crate::output::{GroupState, OutputController, OutputFactory, OutputGroup};
use crate::processing::{Processor, ProcessorRegistry};
use crate::queue::{Queue, queue_factory_for_config};

/// 파이프라인 종료 설정
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineSettings {
    /// 종료 시 큐가 비워지기를 기다리는 최대 시간
    pub wait_close: Duration,
    pub wait_close_mode: WaitCloseMode,
    /// 모든 클라이언트 체인 끝에 붙는 프로세서 설정
    pub processors: Vec<Value>,
}

impl From<&PipelineSection> for PipelineSettings {
    fn from(section: &PipelineSection) -> Self {
        Self {
            wait_close: section.wait_close(),
            wait_close_mode: section.wait_close_mode,
            processors: section.processors.clone(),
        }
    }
}

/// 파이프라인 빌더
pub struct PipelineBuilder {
    queue: QueueNamespace,
    output: Option<OutputGroup>,
    settings: PipelineSettings,
    registry: Option<ProcessorRegistry>,
    observer: Option<Observer>,
}

impl PipelineBuilder {
    /// 기본 메모리 큐와 출력 없음으로 시작합니다.
    pub fn new() -> Self {
        Self {
            queue: QueueNamespace::default(),
            output: None,
            settings: PipelineSettings::default(),
            registry: None,
            observer: None,
        }
    }

    pub fn queue(mut self, queue: QueueNamespace) -> Self {
        self.queue = queue;
        self
    }

    pub fn output(mut self, group: OutputGroup) -> Self {
        self.output = Some(group);
        self
    }

    pub fn settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn wait_close(mut self, wait: Duration, mode: WaitCloseMode) -> Self {
        self.settings.wait_close = wait;
        self.settings.wait_close_mode = mode;
        self
    }

    /// 전역 프로세서 설정을 추가합니다.
    pub fn processor(mut self, config: Value) -> Self {
        self.settings.processors.push(config);
        self
    }

    /// 프로세서 레지스트리를 지정합니다 (기본값: 기본 제공 프로세서).
    pub fn registry(mut self, registry: ProcessorRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// 관측기를 지정합니다 (기본값: 새 관측기).
    pub fn observer(mut self, observer: Observer) -> Self {
        self.observer = Some(observer);
        self
    }

    /// 파이프라인을 생성합니다.
    pub fn build(self) -> Result<Pipeline, PublisherError> {
        let queue_settings = queue_factory_for_config(&self.queue)?;
        let registry = self.registry.unwrap_or_else(ProcessorRegistry::with_builtins);
        let global = registry.build_all(&self.settings.processors)?;
        let queue = queue_settings.open()?;
        let observer = self.observer.unwrap_or_default();

        tracing::info!(
            queue_type = queue.queue_type(),
            capacity = queue.capacity(),
            output = self.output.is_some(),
            wait_close_ms = self.settings.wait_close.as_millis() as u64,
            wait_close_mode = %self.settings.wait_close_mode,
            "pipeline started"
        );

        let controller = OutputController::new(Arc::clone(&queue), observer.clone(), self.output);

        Ok(Pipeline {
            queue,
            controller,
            observer,
            registry: Arc::new(registry),
            global,
            settings: self.settings,
            closing: AtomicBool::new(false),
            close_once: OnceCell::new(),
        })
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// 퍼블리셔 파이프라인
pub struct Pipeline {
    queue: Arc<dyn Queue>,
    controller: OutputController,
    observer: Observer,
    registry: Arc<ProcessorRegistry>,
    global: Vec<Arc<dyn Processor>>,
    settings: PipelineSettings,
    closing: AtomicBool,
    close_once: OnceCell<()>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    /// 설정 파일 구조로 파이프라인을 생성합니다.
    ///
    /// 큐 설정을 먼저 검증한 뒤 출력 팩토리를 호출합니다.
    pub fn from_config(
        config: &RelayConfig,
        factory: &OutputFactory,
    ) -> Result<Self, PublisherError> {
        queue_factory_for_config(&config.queue)?;
        let observer = Observer::new();
        let group = factory(&observer, &config.output)?;
        PipelineBuilder::new()
            .queue(config.queue.clone())
            .output(group)
            .settings(PipelineSettings::from(&config.pipeline))
            .observer(observer)
            .build()
    }

    /// 기본 설정으로 클라이언트를 연결합니다.
    pub fn connect(&self) -> Result<Client, PublisherError> {
        self.connect_with(ClientConfig::default())
    }

    /// 클라이언트를 연결합니다.
    ///
    /// 종료가 시작된 뒤에는 [`PublisherError::Closing`]을 반환합니다.
    pub fn connect_with(&self, config: ClientConfig) -> Result<Client, PublisherError> {
        if self.is_closing() {
            return Err(PublisherError::Closing);
        }
        let chain = config.build_chain(&self.registry, &self.global)?;
        let client = Client::connect(self.queue.as_ref(), self.observer.clone(), config, chain)?;
        self.observer.client_connected();
        Ok(client)
    }

    /// 출력 설정으로 출력 그룹을 교체합니다. `None`이면 출력을 해제합니다.
    pub async fn reload_output(
        &self,
        config: Option<&OutputConfig>,
        factory: &OutputFactory,
    ) -> Result<(), PublisherError> {
        if self.is_closing() {
            return Err(PublisherError::Closing);
        }
        self.controller.reload(config, factory).await
    }

    /// 출력 컨트롤러
    pub fn output_controller(&self) -> &OutputController {
        &self.controller
    }

    pub fn observer(&self) -> &Observer {
        &self.observer
    }

    pub fn registry(&self) -> &ProcessorRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// 적재되었지만 아직 확정되지 않은 이벤트 수
    pub fn outstanding(&self) -> usize {
        self.queue.outstanding()
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// 파이프라인 상태를 확인합니다.
    pub fn health_check(&self) -> HealthStatus {
        if self.is_closing() {
            return HealthStatus::Unhealthy("pipeline is closing".to_owned());
        }
        match self.controller.group_state().current {
            GroupState::Active => HealthStatus::Healthy,
            state => HealthStatus::Degraded(format!("output group {state}")),
        }
    }

    /// 파이프라인을 닫습니다. 여러 번 호출해도 한 번만 수행됩니다.
    ///
    /// 대기 시간 초과는 로그로만 남기며 에러가 아닙니다.
    pub async fn close(&self) {
        self.close_once
            .get_or_init(|| async {
                self.closing.store(true, Ordering::Release);
                tracing::info!(outstanding = self.queue.outstanding(), "pipeline closing");

                let wait = self.settings.wait_close;
                if self.settings.wait_close_mode == WaitCloseMode::Pipeline && !wait.is_zero() {
                    match tokio::time::timeout(wait, self.queue.wait_empty()).await {
                        Ok(()) => tracing::debug!("pipeline queue drained"),
                        Err(_) => tracing::warn!(
                            outstanding = self.queue.outstanding(),
                            wait_ms = wait.as_millis() as u64,
                            "pipeline wait close timed out, abandoning in-flight events"
                        ),
                    }
                }

                self.controller.close().await;
                if let Err(e) = self.queue.close() {
                    tracing::warn!(error = %e, "queue close failed");
                }
                self.observer.cleanup();
                tracing::info!("pipeline closed");
            })
            .await;
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("queue_type", &self.queue.queue_type())
            .field("outstanding", &self.queue.outstanding())
            .field("output", &self.controller.group_state())
            .field("settings", &self.settings)
            .field("closing", &self.is_closing())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use relay_core::event::Event;
    use serde_json::json;

    use super::*;
    use crate::output::builtin_output_factory;

    #[tokio::test]
    async fn bad_queue_config_fails_before_connect() {
        let result = Pipeline::builder()
            .queue(QueueNamespace::single("spool", json!({})))
            .build();
        assert!(matches!(result, Err(PublisherError::UnknownQueueType(_))));
    }

    #[tokio::test]
    async fn unknown_global_processor_fails_build() {
        let result = Pipeline::builder().processor(json!({"bogus": {}})).build();
        assert!(matches!(result, Err(PublisherError::Processor(_))));
    }

    #[tokio::test]
    async fn connect_after_close_is_rejected() {
        let pipeline = Pipeline::builder().build().unwrap();
        let client = pipeline.connect().unwrap();
        client.close().await;
        pipeline.close().await;

        assert!(matches!(pipeline.connect(), Err(PublisherError::Closing)));
        assert!(pipeline.health_check().is_unhealthy());
    }

    #[tokio::test]
    async fn health_reflects_output_state() {
        let pipeline = Pipeline::builder().build().unwrap();
        assert!(matches!(pipeline.health_check(), HealthStatus::Degraded(_)));

        let factory = builtin_output_factory();
        pipeline
            .reload_output(Some(&OutputConfig::default()), &factory)
            .await
            .unwrap();
        assert!(pipeline.health_check().is_healthy());
        pipeline.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn wait_close_timeout_does_not_block_forever() {
        let pipeline = Pipeline::builder()
            .wait_close(Duration::from_millis(50), WaitCloseMode::Pipeline)
            .build()
            .unwrap();
        let client = pipeline.connect().unwrap();
        client.publish(Event::new()).await;
        client.close().await;

        pipeline.close().await;
        assert_eq!(pipeline.outstanding(), 1);
        assert_eq!(pipeline.observer().snapshot().clients_closed, 1);
    }

    #[test]
    fn settings_from_section() {
        let section = PipelineSection {
            wait_close_ms: 250,
            wait_close_mode: WaitCloseMode::Pipeline,
            processors: vec![json!({"drop_event": {}})],
        };
        let settings = PipelineSettings::from(&section);
        assert_eq!(settings.wait_close, Duration::from_millis(250));
        assert_eq!(settings.wait_close_mode, WaitCloseMode::Pipeline);
        assert_eq!(settings.processors.len(), 1);
    }
}
