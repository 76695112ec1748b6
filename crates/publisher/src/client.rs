//! 퍼블리셔 클라이언트: 프로듀서 하나가 이벤트를 파이프라인에 넣는 핸들
//!
//! 클라이언트는 이벤트를 처리 체인에 통과시킨 뒤 큐에 적재합니다.
//! 네트워크 I/O는 수행하지 않으며, 호출자에게 에러를 반환하지 않습니다.
//! 필터링, 드롭, 처리 실패는 리스너 콜백과 관측기 카운터로만 보고됩니다.
//!
//! # 사용 예시
//!
//! ```ignore
//! let client = pipeline.connect_with(
//!     ClientConfig::new()
//!         .with_publish_mode(PublishMode::DropIfFull)
//!         .with_wait_close(Duration::from_secs(5)),
//! )?;
//! client.publish(Event::new().with_field("message", "hello")).await;
//! client.close().await;
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use relay_core::event::{Event, METADATA_KEY};
use serde_json::{Map, Value};
use tokio::sync::{Notify, OnceCell, RwLock};
use uuid::Uuid;

use crate::error::PublisherError;
use crate::observer::Observer;
use crate::processing::{
    AddFields, AddFormattedIndex, AddTags, ChainOutcome, ProcessingChain, Processor,
    ProcessorRegistry, RemoveNulls,
};
use crate::queue::{AckFn, Producer, ProducerConfig, Queue, QueueEntry};

/// 큐가 가득 찼을 때의 적재 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublishMode {
    /// 공간이 생길 때까지 대기
    #[default]
    Default,
    /// 대기하며, 출력 재시도 한도를 넘어도 버리지 않음
    GuaranteedSend,
    /// 대기하지 않고 즉시 버림
    DropIfFull,
}

impl fmt::Display for PublishMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => f.write_str("default"),
            Self::GuaranteedSend => f.write_str("guaranteed"),
            Self::DropIfFull => f.write_str("drop_if_full"),
        }
    }
}

/// 이벤트 생명주기 리스너
///
/// 모든 메서드는 기본적으로 아무것도 하지 않습니다.
pub trait ClientListener: Send + Sync {
    fn new_event(&self) {}
    fn filtered(&self) {}
    fn published(&self) {}
    fn dropped_on_publish(&self, _event: &Event) {}
    fn closing(&self) {}
    fn closed(&self) {}
}

/// ACK 리스너: 새로 확정된 이벤트 수를 적재 순서대로 전달받습니다.
pub trait AckListener: Send + Sync {
    fn ack_events(&self, count: usize);
}

struct CountingAcker<F>(F);

impl<F> AckListener for CountingAcker<F>
where
    F: Fn(usize) + Send + Sync,
{
    fn ack_events(&self, count: usize) {
        (self.0)(count);
    }
}

/// 확정 수를 함수로 전달하는 ACK 리스너를 만듭니다.
pub fn counting_acker<F>(f: F) -> Arc<dyn AckListener>
where
    F: Fn(usize) + Send + Sync + 'static,
{
    Arc::new(CountingAcker(f))
}

/// 여러 ACK 리스너에 같은 확정 수를 전달합니다.
#[derive(Clone, Default)]
pub struct CombinedAckers {
    listeners: Vec<Arc<dyn AckListener>>,
}

impl CombinedAckers {
    pub fn new(listeners: Vec<Arc<dyn AckListener>>) -> Self {
        Self { listeners }
    }

    pub fn push(&mut self, listener: Arc<dyn AckListener>) {
        self.listeners.push(listener);
    }
}

impl AckListener for CombinedAckers {
    fn ack_events(&self, count: usize) {
        for listener in &self.listeners {
            listener.ack_events(count);
        }
    }
}

/// 클라이언트별 처리 옵션
#[derive(Clone, Default)]
pub struct ProcessingConfig {
    /// 인덱스 포맷 (`%{[field]}-%{+yyyy.MM.dd}`)
    pub index: Option<String>,
    /// 레지스트리로 해석되는 프로세서 설정
    pub processors: Vec<Value>,
    /// 코드에서 직접 추가하는 프로세서 (설정 프로세서 뒤에 실행)
    pub extra_processors: Vec<Arc<dyn Processor>>,
    /// null 값을 유지할지 여부
    pub keep_null: bool,
    /// 모든 이벤트에 추가할 필드
    pub fields: Map<String, Value>,
    /// 모든 이벤트에 추가할 메타데이터
    pub meta: Map<String, Value>,
    /// 모든 이벤트에 추가할 태그
    pub tags: Vec<String>,
}

impl fmt::Debug for ProcessingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessingConfig")
            .field("index", &self.index)
            .field("processors", &self.processors)
            .field("extra_processors", &self.extra_processors.len())
            .field("keep_null", &self.keep_null)
            .field("fields", &self.fields)
            .field("meta", &self.meta)
            .field("tags", &self.tags)
            .finish()
    }
}

/// 클라이언트 설정
#[derive(Clone, Default)]
pub struct ClientConfig {
    pub publish_mode: PublishMode,
    pub processing: ProcessingConfig,
    /// 종료 시 미확정 ACK를 기다리는 최대 시간 (`None`이면 기다리지 않음)
    pub wait_close: Option<Duration>,
    pub listener: Option<Arc<dyn ClientListener>>,
    pub ack_listener: Option<Arc<dyn AckListener>>,
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_publish_mode(mut self, mode: PublishMode) -> Self {
        self.publish_mode = mode;
        self
    }

    pub fn with_processing(mut self, processing: ProcessingConfig) -> Self {
        self.processing = processing;
        self
    }

    pub fn with_index(mut self, index: impl Into<String>) -> Self {
        self.processing.index = Some(index.into());
        self
    }

    /// 레지스트리로 해석할 프로세서 설정을 추가합니다.
    pub fn with_processor_config(mut self, config: Value) -> Self {
        self.processing.processors.push(config);
        self
    }

    pub fn with_processor(mut self, processor: Arc<dyn Processor>) -> Self {
        self.processing.extra_processors.push(processor);
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.processing.fields.insert(key.into(), value.into());
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.processing.meta.insert(key.into(), value.into());
        self
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.processing.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn keep_null(mut self, keep: bool) -> Self {
        self.processing.keep_null = keep;
        self
    }

    pub fn with_wait_close(mut self, wait: Duration) -> Self {
        self.wait_close = Some(wait);
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn ClientListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn with_ack_listener(mut self, listener: Arc<dyn AckListener>) -> Self {
        self.ack_listener = Some(listener);
        self
    }

    /// 설정을 검증합니다.
    pub fn validate(&self, registry: &ProcessorRegistry) -> Result<(), PublisherError> {
        self.build_chain(registry, &[]).map(|_| ())
    }

    /// 클라이언트 처리 체인을 구성합니다.
    ///
    /// 순서: 필드/메타데이터/태그 → 인덱스 → 클라이언트 프로세서 → 전역 프로세서 → null 제거
    pub(crate) fn build_chain(
        &self,
        registry: &ProcessorRegistry,
        global: &[Arc<dyn Processor>],
    ) -> Result<ProcessingChain, PublisherError> {
        if self.wait_close == Some(Duration::ZERO) {
            return Err(PublisherError::config(
                "wait_close",
                "must be greater than 0, leave unset to disable",
            ));
        }

        let processing = &self.processing;
        let mut chain = ProcessingChain::default();
        if !processing.fields.is_empty() {
            chain.push(Arc::new(AddFields::new("", processing.fields.clone())));
        }
        if !processing.meta.is_empty() {
            chain.push(Arc::new(AddFields::new(METADATA_KEY, processing.meta.clone())));
        }
        if !processing.tags.is_empty() {
            chain.push(Arc::new(AddTags::new("tags", processing.tags.clone())));
        }
        if let Some(index) = &processing.index {
            chain.push(Arc::new(AddFormattedIndex::parse(index)?));
        }
        chain.extend(registry.build_all(&processing.processors)?);
        chain.extend(processing.extra_processors.iter().cloned());
        chain.extend(global.iter().cloned());
        if !processing.keep_null {
            chain.push(Arc::new(RemoveNulls));
        }
        Ok(chain)
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("publish_mode", &self.publish_mode)
            .field("processing", &self.processing)
            .field("wait_close", &self.wait_close)
            .field("listener", &self.listener.is_some())
            .field("ack_listener", &self.ack_listener.is_some())
            .finish()
    }
}

/// 적재되었지만 아직 확정되지 않은 이벤트 수
#[derive(Default)]
struct PendingAcks {
    count: AtomicUsize,
    zero: Notify,
}

impl PendingAcks {
    fn add(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    fn sub(&self, n: usize) {
        let prev = self.count.fetch_sub(n, Ordering::AcqRel);
        if prev <= n {
            self.zero.notify_waiters();
        }
    }

    fn get(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    async fn wait_zero(&self) {
        loop {
            let notified = self.zero.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.get() == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct ClientInner {
    id: Uuid,
    mode: PublishMode,
    chain: ProcessingChain,
    producer: Box<dyn Producer>,
    observer: Observer,
    listener: Option<Arc<dyn ClientListener>>,
    pending: Arc<PendingAcks>,
    wait_close: Option<Duration>,
    /// `true`이면 닫힘. 퍼블리시는 읽기 잠금을 잡은 채 적재합니다.
    closed: RwLock<bool>,
    close_once: OnceCell<()>,
}

/// 퍼블리셔 클라이언트
///
/// `Clone`은 같은 클라이언트를 가리키는 핸들을 만듭니다.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// 큐에 프로듀서를 등록하고 클라이언트를 생성합니다.
    pub(crate) fn connect(
        queue: &dyn Queue,
        observer: Observer,
        config: ClientConfig,
        chain: ProcessingChain,
    ) -> Result<Self, PublisherError> {
        let pending = Arc::new(PendingAcks::default());

        let ack: AckFn = {
            let pending = Arc::clone(&pending);
            let observer = observer.clone();
            let ack_listener = config.ack_listener.clone();
            Arc::new(move |count: usize| {
                pending.sub(count);
                observer.events_acked(count);
                if let Some(listener) = &ack_listener {
                    listener.ack_events(count);
                }
            })
        };

        let producer = queue
            .producer(ProducerConfig { ack: Some(ack) })
            .ok_or(PublisherError::Closing)?;

        let id = Uuid::new_v4();
        tracing::debug!(
            client = %id,
            mode = %config.publish_mode,
            chain = %chain,
            "client connected"
        );

        Ok(Self {
            inner: Arc::new(ClientInner {
                id,
                mode: config.publish_mode,
                chain,
                producer,
                observer,
                listener: config.listener,
                pending,
                wait_close: config.wait_close,
                closed: RwLock::new(false),
                close_once: OnceCell::new(),
            }),
        })
    }

    /// 클라이언트 식별자
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// 적재되었지만 아직 확정되지 않은 이벤트 수
    pub fn pending_acks(&self) -> usize {
        self.inner.pending.get()
    }

    /// 이벤트를 처리하고 큐에 적재합니다.
    ///
    /// 닫힌 클라이언트에 대한 호출은 무시됩니다.
    pub async fn publish(&self, event: Event) {
        let inner = &self.inner;
        let closed = inner.closed.read().await;
        if *closed {
            tracing::trace!(client = %inner.id, "publish on closed client ignored");
            return;
        }

        inner.observer.new_event();
        inner.notify(|l| l.new_event());

        let event = match inner.chain.run(event) {
            ChainOutcome::Publish(event) => event,
            ChainOutcome::Filtered => {
                inner.observer.filtered_event();
                inner.notify(|l| l.filtered());
                return;
            }
            ChainOutcome::Failed { error, event } => {
                inner.observer.failed_event();
                match event {
                    Some(event) => event,
                    None => {
                        tracing::debug!(client = %inner.id, error = %error, "event dropped by processor failure");
                        return;
                    }
                }
            }
        };

        let entry = match inner.mode {
            PublishMode::GuaranteedSend => QueueEntry::guaranteed(event),
            PublishMode::Default | PublishMode::DropIfFull => QueueEntry::new(event),
        };

        inner.pending.add();
        let admitted = match inner.mode {
            PublishMode::DropIfFull => inner.producer.try_publish(entry),
            PublishMode::Default | PublishMode::GuaranteedSend => {
                inner.producer.publish(entry).await
            }
        };
        drop(closed);

        match admitted {
            Ok(()) => {
                inner.observer.published_event();
                inner.notify(|l| l.published());
            }
            Err(rejected) => {
                inner.pending.sub(1);
                inner.observer.dropped_on_publish();
                inner.notify(|l| l.dropped_on_publish(&rejected.event));
            }
        }
    }

    /// 여러 이벤트를 순서대로 적재합니다.
    pub async fn publish_all(&self, events: impl IntoIterator<Item = Event>) {
        for event in events {
            self.publish(event).await;
        }
    }

    /// 클라이언트를 닫습니다.
    ///
    /// 여러 번 또는 동시에 호출해도 종료 처리는 한 번만 수행되며,
    /// 모든 호출은 종료 처리가 끝난 뒤 반환됩니다. `wait_close`가 설정되어 있으면
    /// 그 시간까지 미확정 ACK를 기다리고, 시간이 지나도 에러로 취급하지 않습니다.
    pub async fn close(&self) {
        let inner = &self.inner;
        inner
            .close_once
            .get_or_init(|| async {
                inner.notify(|l| l.closing());
                // 대기 중인 적재를 깨워야 쓰기 잠금을 얻을 수 있음
                inner.producer.cancel();
                *inner.closed.write().await = true;

                if let Some(wait) = inner.wait_close {
                    let pending = inner.pending.get();
                    if tokio::time::timeout(wait, inner.pending.wait_zero())
                        .await
                        .is_err()
                    {
                        tracing::debug!(
                            client = %inner.id,
                            pending_before = pending,
                            pending_after = inner.pending.get(),
                            wait_ms = wait.as_millis() as u64,
                            "client wait close timed out"
                        );
                    }
                }

                inner.observer.client_closed();
                inner.notify(|l| l.closed());
                tracing::debug!(client = %inner.id, "client closed");
            })
            .await;
    }

    /// 닫힘 여부
    pub fn is_closed(&self) -> bool {
        self.inner.close_once.initialized()
    }
}

impl ClientInner {
    fn notify(&self, f: impl FnOnce(&dyn ClientListener)) {
        if let Some(listener) = &self.listener {
            f(listener.as_ref());
        }
    }
}

impl Drop for ClientInner {
    /// 닫지 않고 버려진 클라이언트도 큐에서 프로듀서 등록을 해제합니다.
    fn drop(&mut self) {
        self.producer.cancel();
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.inner.id)
            .field("mode", &self.inner.mode)
            .field("chain", &self.inner.chain)
            .field("pending_acks", &self.inner.pending.get())
            .finish()
    }
}
