//! 출력 계층: 출력 클라이언트, 그룹, 컨트롤러
//!
//! # 구성
//!
//! - [`OutputClient`]: 배치 하나를 전송하는 출력 구현 (네트워크 I/O는 여기서만 발생)
//! - [`OutputGroup`]: 병렬 워커로 실행될 클라이언트 묶음과 배치/재시도 설정
//! - [`OutputController`]: 디스패처 태스크를 소유하고 그룹 교체(reload)를 처리
//!
//! ```text
//! Queue ──get──▶ Dispatcher ──work channel──▶ Worker × N ──▶ OutputClient
//!                    ▲                            │
//!                    └────────── retry ───────────┘
//! ```

mod backoff;
mod batch;
pub mod console;
mod controller;
mod worker;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use relay_core::config::OutputConfig;
use relay_core::event::Event;
use relay_core::pipeline::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::PublisherError;
use crate::observer::Observer;

pub use backoff::GroupBackoff;
pub use batch::Batch;
pub use console::ConsoleOutput;
pub use controller::{GroupState, GroupStates, OutputController};

/// 출력 전송 에러
///
/// 재시도 여부는 출력 구현이 결정합니다.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    /// 연결 문제 등 다시 시도하면 성공할 수 있는 에러
    #[error("retryable publish failure: {0}")]
    Retryable(String),
    /// 직렬화 실패 등 다시 시도해도 실패하는 에러
    #[error("permanent publish failure: {0}")]
    Permanent(String),
}

/// 출력 클라이언트
///
/// `publish`는 취소 토큰이 취소되면 가능한 빨리 반환해야 합니다.
/// 재시도 대기 사이에서도 취소를 확인해야 합니다.
pub trait OutputClient: Send {
    /// 출력 이름 (로그/메트릭 레이블)
    fn name(&self) -> &str;

    /// 배치를 전송합니다.
    fn publish(
        &mut self,
        cancel: &CancellationToken,
        events: &[Event],
    ) -> impl Future<Output = Result<(), PublishError>> + Send;

    /// 연결을 정리합니다.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// dyn-compatible 출력 클라이언트
///
/// `OutputClient`는 RPITIT를 사용하므로 `dyn OutputClient`가 불가합니다.
/// 그룹은 `Box<dyn DynOutputClient>`로 클라이언트를 보관합니다.
pub trait DynOutputClient: Send {
    fn name(&self) -> &str;

    fn publish<'a>(
        &'a mut self,
        cancel: &'a CancellationToken,
        events: &'a [Event],
    ) -> BoxFuture<'a, Result<(), PublishError>>;

    fn close(&mut self) -> BoxFuture<'_, ()>;
}

/// OutputClient를 구현한 타입은 자동으로 DynOutputClient도 구현됩니다.
impl<T: OutputClient> DynOutputClient for T {
    fn name(&self) -> &str {
        OutputClient::name(self)
    }

    fn publish<'a>(
        &'a mut self,
        cancel: &'a CancellationToken,
        events: &'a [Event],
    ) -> BoxFuture<'a, Result<(), PublishError>> {
        Box::pin(OutputClient::publish(self, cancel, events))
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(OutputClient::close(self))
    }
}

/// 재시도 백오프 설정
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    pub init: Duration,
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            init: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

/// 출력 그룹: 워커 하나당 클라이언트 하나
pub struct OutputGroup {
    pub clients: Vec<Box<dyn DynOutputClient>>,
    /// 배치당 최대 이벤트 수
    pub batch_size: usize,
    /// 재시도 한도 (0은 재시도 없음, 음수는 무제한)
    pub max_retries: i32,
    pub backoff: BackoffConfig,
}

impl OutputGroup {
    pub fn new(
        clients: Vec<Box<dyn DynOutputClient>>,
        batch_size: usize,
        max_retries: i32,
    ) -> Self {
        Self {
            clients,
            batch_size,
            max_retries,
            backoff: BackoffConfig::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// 공통 출력 설정(`worker`, `bulk_max_size`, `max_retries`, 백오프)으로 그룹을 구성합니다.
    ///
    /// `make_client`는 워커 수만큼 호출됩니다.
    pub fn from_config<F>(config: &OutputConfig, mut make_client: F) -> Result<Self, PublisherError>
    where
        F: FnMut(usize) -> Result<Box<dyn DynOutputClient>, PublisherError>,
    {
        config.validate()?;
        let clients = (0..config.worker)
            .map(&mut make_client)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(clients, config.bulk_max_size, config.max_retries).with_backoff(
            BackoffConfig {
                init: config.backoff_init(),
                max: config.backoff_max(),
            },
        ))
    }
}

impl fmt::Debug for OutputGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.clients.iter().map(|c| c.name()).collect();
        f.debug_struct("OutputGroup")
            .field("clients", &names)
            .field("batch_size", &self.batch_size)
            .field("max_retries", &self.max_retries)
            .field("backoff", &self.backoff)
            .finish()
    }
}

/// 출력 설정으로 그룹을 생성하는 팩토리
pub type OutputFactory =
    Arc<dyn Fn(&Observer, &OutputConfig) -> Result<OutputGroup, PublisherError> + Send + Sync>;

/// 기본 제공 출력(`console`)만 아는 팩토리
pub fn builtin_output_factory() -> OutputFactory {
    Arc::new(|_observer: &Observer, config: &OutputConfig| match config.kind.as_str() {
        console::OUTPUT_TYPE => OutputGroup::from_config(config, |_| {
            Ok(Box::new(ConsoleOutput::stdout()) as Box<dyn DynOutputClient>)
        }),
        other => Err(PublisherError::Output {
            output: other.to_owned(),
            reason: "unknown output type".to_owned(),
        }),
    })
}
