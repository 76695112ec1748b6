//! 설정 관리: relay.toml 파싱 및 런타임 설정
//!
//! [`RelayConfig`]는 퍼블리셔 파이프라인 전체 설정을 담는 최상위 구조체입니다.
//!
//! # 설정 로딩 우선순위
//! 1. CLI 인자 (최고 우선)
//! 2. 환경변수 (`RELAY_OUTPUT_WORKER=4` 형식)
//! 3. 설정 파일 (`relay.toml`)
//! 4. 기본값 (`Default` 구현)
//!
//! # 사용 예시
//! ```no_run
//! # async fn example() -> Result<(), relay_core::error::RelayError> {
//! use relay_core::config::RelayConfig;
//!
//! // 파일에서 로드 + 환경변수 오버라이드
//! let config = RelayConfig::load("relay.toml").await?;
//!
//! // TOML 문자열에서 직접 파싱
//! let config = RelayConfig::parse("[queue.mem]\nevents = 4096")?;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{ConfigError, RelayError};

/// 출력 배치 최대 크기 상한
const MAX_BULK_SIZE: usize = 1_000_000;

/// 출력 워커 수 상한
const MAX_WORKERS: usize = 1024;

/// Relay 통합 설정
///
/// `relay.toml` 파일의 최상위 구조를 나타냅니다.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    /// 일반 설정
    #[serde(default)]
    pub general: GeneralConfig,
    /// 큐 백엔드 설정 (`[queue.<type>]`)
    #[serde(default)]
    pub queue: QueueNamespace,
    /// 출력 설정
    #[serde(default)]
    pub output: OutputConfig,
    /// 파이프라인 종료 동작 설정
    #[serde(default)]
    pub pipeline: PipelineSection,
    /// Prometheus 메트릭 설정
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl RelayConfig {
    /// TOML 파일에서 설정을 로드하고 환경변수 오버라이드를 적용합니다.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, RelayError> {
        let mut config = Self::from_file(path).await?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// TOML 파일에서 설정을 로드합니다 (환경변수 오버라이드 없음).
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, RelayError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RelayError::Config(ConfigError::FileNotFound {
                    path: path.display().to_string(),
                })
            } else {
                RelayError::Io(e)
            }
        })?;
        let config = Self::parse(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// TOML 문자열에서 설정을 파싱합니다.
    pub fn parse(toml_str: &str) -> Result<Self, RelayError> {
        toml::from_str(toml_str).map_err(|e| {
            RelayError::Config(ConfigError::ParseFailed {
                reason: e.to_string(),
            })
        })
    }

    /// 환경변수로 설정값을 오버라이드합니다.
    ///
    /// 환경변수 네이밍 규칙: `RELAY_{SECTION}_{FIELD}`
    /// 예: `RELAY_PIPELINE_WAIT_CLOSE_MS=5000`
    pub fn apply_env_overrides(&mut self) {
        // General
        override_string(&mut self.general.log_level, "RELAY_GENERAL_LOG_LEVEL");
        override_string(&mut self.general.log_format, "RELAY_GENERAL_LOG_FORMAT");

        // Output
        override_string(&mut self.output.kind, "RELAY_OUTPUT_TYPE");
        override_parsed(&mut self.output.worker, "RELAY_OUTPUT_WORKER");
        override_parsed(&mut self.output.bulk_max_size, "RELAY_OUTPUT_BULK_MAX_SIZE");
        override_parsed(&mut self.output.max_retries, "RELAY_OUTPUT_MAX_RETRIES");
        override_parsed(
            &mut self.output.backoff_init_ms,
            "RELAY_OUTPUT_BACKOFF_INIT_MS",
        );
        override_parsed(&mut self.output.backoff_max_ms, "RELAY_OUTPUT_BACKOFF_MAX_MS");

        // Pipeline
        override_parsed(
            &mut self.pipeline.wait_close_ms,
            "RELAY_PIPELINE_WAIT_CLOSE_MS",
        );
        override_parsed(
            &mut self.pipeline.wait_close_mode,
            "RELAY_PIPELINE_WAIT_CLOSE_MODE",
        );

        // Metrics
        override_parsed(&mut self.metrics.enabled, "RELAY_METRICS_ENABLED");
        override_string(&mut self.metrics.listen_addr, "RELAY_METRICS_LISTEN_ADDR");
        override_parsed(&mut self.metrics.port, "RELAY_METRICS_PORT");
    }

    /// 설정값의 유효성을 검증합니다.
    ///
    /// 큐 백엔드별 설정은 퍼블리셔의 큐 팩토리가 검증합니다.
    pub fn validate(&self) -> Result<(), RelayError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(ConfigError::invalid(
                "general.log_level",
                format!("must be one of: {}", valid_levels.join(", ")),
            )
            .into());
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.general.log_format.as_str()) {
            return Err(ConfigError::invalid(
                "general.log_format",
                format!("must be one of: {}", valid_formats.join(", ")),
            )
            .into());
        }

        if self.queue.entries.len() != 1 {
            return Err(ConfigError::invalid(
                "queue",
                format!(
                    "exactly one queue type must be configured, found {}",
                    self.queue.entries.len()
                ),
            )
            .into());
        }

        self.output.validate()?;

        if self.metrics.enabled && self.metrics.port == 0 {
            return Err(ConfigError::invalid("metrics.port", "must be greater than 0").into());
        }

        Ok(())
    }
}

/// 일반 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// 로그 레벨 (trace, debug, info, warn, error)
    pub log_level: String,
    /// 로그 형식 (json, pretty)
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            log_format: "json".to_owned(),
        }
    }
}

/// 큐 백엔드 네임스페이스
///
/// `[queue.mem]`, `[queue.disk]`처럼 타입 이름 하나를 키로 갖는 맵입니다.
/// 설정 값의 해석은 큐 팩토리가 담당하므로 여기서는 원본 값을 보관만 합니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueNamespace {
    /// 타입 이름 → 백엔드 설정
    pub entries: BTreeMap<String, Value>,
}

impl QueueNamespace {
    /// 단일 타입으로 네임스페이스를 생성합니다.
    pub fn single(kind: impl Into<String>, settings: Value) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(kind.into(), settings);
        Self { entries }
    }

    /// 설정된 큐 타입과 설정 값을 반환합니다.
    ///
    /// 타입이 정확히 하나가 아니면 `None`입니다.
    pub fn selected(&self) -> Option<(&str, &Value)> {
        if self.entries.len() != 1 {
            return None;
        }
        self.entries.iter().next().map(|(k, v)| (k.as_str(), v))
    }
}

impl Default for QueueNamespace {
    fn default() -> Self {
        Self::single("mem", Value::Object(Map::new()))
    }
}

/// 출력 설정
///
/// 공통 필드 외의 키는 `settings`에 보관되어 출력 팩토리로 전달됩니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// 출력 타입 이름
    #[serde(rename = "type")]
    pub kind: String,
    /// 병렬 출력 워커 수
    pub worker: usize,
    /// 배치당 최대 이벤트 수
    pub bulk_max_size: usize,
    /// 배치 재시도 한도 (음수는 무제한)
    pub max_retries: i32,
    /// 백오프 초기 지연 (밀리초)
    pub backoff_init_ms: u64,
    /// 백오프 최대 지연 (밀리초)
    pub backoff_max_ms: u64,
    /// 출력별 추가 설정
    #[serde(flatten)]
    pub settings: Map<String, Value>,
}

impl OutputConfig {
    /// 백오프 초기 지연
    pub fn backoff_init(&self) -> Duration {
        Duration::from_millis(self.backoff_init_ms)
    }

    /// 백오프 최대 지연
    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    /// 출력 공통 설정의 유효성을 검증합니다.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kind.is_empty() {
            return Err(ConfigError::invalid("output.type", "must not be empty"));
        }
        if self.worker == 0 || self.worker > MAX_WORKERS {
            return Err(ConfigError::invalid(
                "output.worker",
                format!("must be between 1 and {MAX_WORKERS}"),
            ));
        }
        if self.bulk_max_size == 0 || self.bulk_max_size > MAX_BULK_SIZE {
            return Err(ConfigError::invalid(
                "output.bulk_max_size",
                format!("must be between 1 and {MAX_BULK_SIZE}"),
            ));
        }
        if self.backoff_init_ms == 0 {
            return Err(ConfigError::invalid(
                "output.backoff_init_ms",
                "must be greater than 0",
            ));
        }
        if self.backoff_max_ms < self.backoff_init_ms {
            return Err(ConfigError::invalid(
                "output.backoff_max_ms",
                "must not be less than backoff_init_ms",
            ));
        }
        Ok(())
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            kind: "console".to_owned(),
            worker: 1,
            bulk_max_size: 50,
            max_retries: 3,
            backoff_init_ms: 1_000,
            backoff_max_ms: 60_000,
            settings: Map::new(),
        }
    }
}

/// 파이프라인 종료 대기 모드
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitCloseMode {
    /// 종료 시 대기하지 않음
    #[default]
    None,
    /// 파이프라인 종료 시 미처리 이벤트 ACK를 대기
    Pipeline,
}

impl fmt::Display for WaitCloseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Pipeline => write!(f, "pipeline"),
        }
    }
}

impl FromStr for WaitCloseMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "pipeline" => Ok(Self::Pipeline),
            other => Err(ConfigError::invalid(
                "pipeline.wait_close_mode",
                format!("unknown mode '{other}', expected none or pipeline"),
            )),
        }
    }
}

/// 파이프라인 섹션 설정
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    /// 종료 시 최대 대기 시간 (밀리초)
    pub wait_close_ms: u64,
    /// 종료 대기 모드
    pub wait_close_mode: WaitCloseMode,
    /// 모든 클라이언트 체인 끝에 추가되는 프로세서 (`[[pipeline.processors]]`)
    pub processors: Vec<Value>,
}

impl PipelineSection {
    /// 종료 대기 시간
    pub fn wait_close(&self) -> Duration {
        Duration::from_millis(self.wait_close_ms)
    }
}

/// Prometheus 메트릭 설정
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// 메트릭 엔드포인트 활성화 여부
    pub enabled: bool,
    /// 수신 주소
    pub listen_addr: String,
    /// 수신 포트
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: "127.0.0.1".to_owned(),
            port: 9464,
        }
    }
}

// --- 환경변수 오버라이드 헬퍼 ---

fn override_string(target: &mut String, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val;
    }
}

fn override_parsed<T: FromStr>(target: &mut T, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<T>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                expected = std::any::type_name::<T>(),
                "failed to parse env var, ignoring"
            ),
        }
    }
}
