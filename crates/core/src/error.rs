//! 에러 타입: 도메인별 에러 정의

/// Relay 최상위 에러 타입
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// 설정 관련 에러
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// 파이프라인 처리 에러
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// 프로세서 설정/실행 에러
    #[error("processor error: {0}")]
    Processor(#[from] ProcessorError),

    /// I/O 에러
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// 설정 관련 에러
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// 설정 파일을 찾을 수 없음
    #[error("config file not found: {path}")]
    FileNotFound { path: String },

    /// 설정 파싱 실패
    #[error("failed to parse config: {reason}")]
    ParseFailed { reason: String },

    /// 유효하지 않은 설정 값
    #[error("invalid config value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// 파이프라인 처리 에러
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// 파이프라인이 종료 중이라 새 연결을 받을 수 없음
    #[error("pipeline is shutting down")]
    ShuttingDown,

    /// 파이프라인 초기화 실패
    #[error("pipeline init failed: {0}")]
    InitFailed(String),
}

/// 프로세서 설정 및 실행 에러
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessorError {
    /// 등록되지 않은 프로세서 이름
    #[error("unknown processor '{name}'")]
    Unknown { name: String },

    /// 같은 이름으로 중복 등록
    #[error("processor '{name}' is already registered")]
    Duplicate { name: String },

    /// 프로세서 설정이 잘못됨
    #[error("invalid config for processor '{name}': {reason}")]
    InvalidConfig { name: String, reason: String },

    /// 이벤트 처리 실패
    #[error("processor '{processor}' failed: {reason}")]
    Failed { processor: String, reason: String },
}

impl ConfigError {
    /// `InvalidValue` 에러를 간편하게 생성합니다.
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
