//! 퍼블리셔 에러 타입
//!
//! [`PublisherError`]는 큐 생성, 클라이언트 연결, 출력 그룹 구성 과정에서
//! 발생하는 에러를 표현합니다. `From<PublisherError> for RelayError` 변환이
//! 구현되어 있어 상위 레이어에서 `?` 연산자로 전파할 수 있습니다.
//!
//! 이벤트 단위 처리 에러와 전송 에러는 여기 포함되지 않습니다.
//! 이들은 로그와 카운터로만 보고되며 호출자에게 전파되지 않습니다.

use relay_core::error::{ConfigError, PipelineError, ProcessorError, RelayError};

/// 퍼블리셔 도메인 에러
#[derive(Debug, thiserror::Error)]
pub enum PublisherError {
    /// 알 수 없는 큐 백엔드
    #[error("unrecognized queue type '{0}'")]
    UnknownQueueType(String),

    /// 큐 설정 에러
    #[error("invalid {queue_type} queue settings: {reason}")]
    QueueConfig {
        /// 큐 타입 (mem, disk)
        queue_type: String,
        /// 에러 사유
        reason: String,
    },

    /// 설정 에러
    #[error("config error: {field}: {reason}")]
    Config {
        /// 설정 필드명
        field: String,
        /// 에러 사유
        reason: String,
    },

    /// 출력 그룹 구성 실패
    #[error("output '{output}' setup failed: {reason}")]
    Output {
        /// 출력 타입
        output: String,
        /// 실패 사유
        reason: String,
    },

    /// 프로세서 설정 에러
    #[error(transparent)]
    Processor(#[from] ProcessorError),

    /// 파이프라인이 종료 중
    #[error("pipeline is closing")]
    Closing,

    /// I/O 에러
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PublisherError {
    /// `Config` 에러를 간편하게 생성합니다.
    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl From<ConfigError> for PublisherError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::InvalidValue { field, reason } => Self::Config { field, reason },
            other => Self::Config {
                field: "config".to_owned(),
                reason: other.to_string(),
            },
        }
    }
}

impl From<PublisherError> for RelayError {
    fn from(err: PublisherError) -> Self {
        match err {
            PublisherError::Config { field, reason } => {
                RelayError::Config(ConfigError::InvalidValue { field, reason })
            }
            PublisherError::UnknownQueueType(_) | PublisherError::QueueConfig { .. } => {
                RelayError::Config(ConfigError::InvalidValue {
                    field: "queue".to_owned(),
                    reason: err.to_string(),
                })
            }
            PublisherError::Processor(e) => RelayError::Processor(e),
            PublisherError::Closing => RelayError::Pipeline(PipelineError::ShuttingDown),
            PublisherError::Io(e) => RelayError::Io(e),
            other => RelayError::Pipeline(PipelineError::InitFailed(other.to_string())),
        }
    }
}
