//! 그룹 단위 재시도 백오프
//!
//! 한 그룹의 모든 워커가 하나의 연속 실패 카운터를 공유합니다.
//! 지연은 `init * 2^(failures - 1)`이며 `max`로 제한되고,
//! 어느 워커든 배치 전송에 성공하면 초기화됩니다.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use super::BackoffConfig;

#[derive(Debug)]
pub struct GroupBackoff {
    config: BackoffConfig,
    failures: AtomicU32,
}

impl GroupBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            failures: AtomicU32::new(0),
        }
    }

    /// 실패를 기록하고 다음 재전송까지의 지연을 반환합니다.
    pub fn fail(&self) -> Duration {
        let failures = self
            .failures
            .fetch_add(1, Ordering::AcqRel)
            .saturating_add(1);
        self.delay_for(failures)
    }

    /// 성공 시 실패 카운터를 초기화합니다.
    pub fn reset(&self) {
        self.failures.store(0, Ordering::Release);
    }

    /// 현재 연속 실패 횟수
    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    /// `failures`번째 연속 실패에 대한 지연
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exp = (failures - 1).min(31);
        self.config
            .init
            .checked_mul(1u32 << exp)
            .unwrap_or(self.config.max)
            .min(self.config.max)
    }
}
