#![doc = include_str!("../README.md")]
//!
//! # 모듈 구성
//!
//! - [`queue`]: 큐 인터페이스와 메모리/디스크 백엔드
//! - [`processing`]: 처리 체인, 기본 제공 프로세서, 프로세서 레지스트리
//! - [`client`]: 프로듀서 핸들, 적재 모드, 리스너
//! - [`output`]: 출력 클라이언트, 디스패처, 워커, 백오프
//! - [`pipeline`]: 큐와 출력을 묶는 파사드
//! - [`module`]: 주기적 수집 모듈 러너
//! - [`observer`]: 파이프라인이 소유하는 카운터 레지스트리
//! - [`error`]: 도메인 에러 타입

pub mod client;
pub mod error;
pub mod module;
pub mod observer;
pub mod output;
pub mod pipeline;
pub mod processing;
pub mod queue;

// --- 주요 타입 re-export ---

// 파이프라인
pub use pipeline::{Pipeline, PipelineBuilder, PipelineSettings};

// 클라이언트
pub use client::{
    AckListener, Client, ClientConfig, ClientListener, CombinedAckers, ProcessingConfig,
    PublishMode, counting_acker,
};

// 출력
pub use output::{
    BackoffConfig, DynOutputClient, GroupState, GroupStates, OutputClient, OutputController,
    OutputFactory, OutputGroup, PublishError, builtin_output_factory,
};

// 큐
pub use queue::{Queue, QueueSettings, queue_factory_for_config};

// 처리
pub use processing::{ProcessingChain, Processor, ProcessorFailure, ProcessorRegistry};

// 모듈
pub use module::{Connector, Fetcher, ModuleRunner, ModuleSettings};

// 관측
pub use observer::{Observer, ObserverSnapshot};

// 에러
pub use error::PublisherError;
