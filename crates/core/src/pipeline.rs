//! 파이프라인 공통 타입: 비동기 trait 헬퍼와 상태 보고

use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// dyn-compatible trait에서 사용하는 박싱된 Future
///
/// RPITIT(`impl Future`)를 반환하는 trait은 `dyn`으로 사용할 수 없으므로,
/// 동적 디스패치가 필요한 곳에서는 이 타입을 반환하는 trait을 함께 제공합니다.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// 컴포넌트 건강 상태
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    /// 정상 동작
    Healthy,
    /// 동작은 하지만 성능 저하 또는 연속 실패
    Degraded(String),
    /// 동작 불가
    Unhealthy(String),
}

impl HealthStatus {
    /// 정상 상태인지 확인합니다.
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// 동작 불가 상태인지 확인합니다.
    pub fn is_unhealthy(&self) -> bool {
        matches!(self, Self::Unhealthy(_))
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded(reason) => write!(f, "degraded: {reason}"),
            Self::Unhealthy(reason) => write!(f, "unhealthy: {reason}"),
        }
    }
}
