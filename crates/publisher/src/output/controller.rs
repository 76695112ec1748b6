//! 출력 컨트롤러: 디스패처 태스크와 활성 출력 그룹 관리
//!
//! 디스패처는 큐에서 배치를 꺼내 활성 그룹의 공유 작업 채널로 보냅니다.
//! 재시도 배치는 새 배치보다 먼저 전송되며, 백오프 시각이 지날 때까지
//! 디스패처는 큐에서 새 배치를 꺼내지 않습니다.
//!
//! 그룹 교체 시 새 그룹의 워커를 먼저 시작하고, 이전 그룹은 작업 채널만
//! 닫아 진행 중인 배치를 마무리하게 한 뒤 교체 완료로 표시합니다.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use relay_core::config::OutputConfig;

use super::backoff::GroupBackoff;
use super::batch::Batch;
use super::worker::{self, WorkerContext};
use super::{OutputFactory, OutputGroup};
use crate::error::PublisherError;
use crate::observer::Observer;
use crate::queue::{Consumer, Queue};

/// 출력 그룹 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupState {
    /// 설정된 그룹 없음
    #[default]
    Unset,
    /// 새 배치를 받는 중
    Active,
    /// 교체되어 진행 중인 배치만 마무리하는 중
    Draining,
    /// 모든 워커 종료
    Replaced,
}

impl fmt::Display for GroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unset => f.write_str("unset"),
            Self::Active => f.write_str("active"),
            Self::Draining => f.write_str("draining"),
            Self::Replaced => f.write_str("replaced"),
        }
    }
}

/// 현재/이전 그룹 상태 스냅샷
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GroupStates {
    pub current: GroupState,
    pub previous: Option<GroupState>,
}

#[derive(Default)]
struct StateBoard {
    current: GroupState,
    /// (그룹 세대, 상태)
    previous: Option<(u64, GroupState)>,
}

type SharedBoard = Arc<Mutex<StateBoard>>;

fn lock_board(board: &Mutex<StateBoard>) -> MutexGuard<'_, StateBoard> {
    board.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

enum Command {
    SetGroup(Option<OutputGroup>, oneshot::Sender<()>),
}

/// 출력 컨트롤러
pub struct OutputController {
    observer: Observer,
    commands: mpsc::UnboundedSender<Command>,
    board: SharedBoard,
    cancel: CancellationToken,
    dispatcher: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl OutputController {
    /// 디스패처 태스크를 시작합니다.
    ///
    /// `initial`이 `None`이면 그룹이 설정될 때까지 큐에서 배치를 꺼내지 않습니다.
    pub fn new(queue: Arc<dyn Queue>, observer: Observer, initial: Option<OutputGroup>) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        let board = SharedBoard::default();
        let cancel = CancellationToken::new();

        let mut dispatcher = Dispatcher {
            consumer: queue.consumer(),
            observer: observer.clone(),
            cancel: cancel.clone(),
            board: Arc::clone(&board),
            retry_tx,
            generation: 0,
            active: None,
        };
        dispatcher.install(initial);
        let handle = tokio::spawn(dispatcher.run(command_rx, retry_rx));

        Self {
            observer,
            commands,
            board,
            cancel,
            dispatcher: tokio::sync::Mutex::new(Some(handle)),
        }
    }

    /// 활성 그룹을 교체합니다. `None`이면 출력을 해제합니다.
    pub async fn set(&self, group: Option<OutputGroup>) -> Result<(), PublisherError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.commands
            .send(Command::SetGroup(group, done_tx))
            .map_err(|_| PublisherError::Closing)?;
        done_rx.await.map_err(|_| PublisherError::Closing)
    }

    /// 출력 설정으로 새 그룹을 만들어 교체합니다.
    ///
    /// 그룹 생성에 실패하면 기존 그룹을 그대로 유지합니다.
    pub async fn reload(
        &self,
        config: Option<&OutputConfig>,
        factory: &OutputFactory,
    ) -> Result<(), PublisherError> {
        let group = config
            .map(|config| factory(&self.observer, config))
            .transpose()?;
        if let Some(config) = config {
            tracing::info!(output = %config.kind, workers = config.worker, "reloading output");
        } else {
            tracing::info!("unsetting output");
        }
        self.set(group).await
    }

    /// 현재/이전 그룹 상태
    pub fn group_state(&self) -> GroupStates {
        let board = lock_board(&self.board);
        GroupStates {
            current: board.current,
            previous: board.previous.map(|(_, state)| state),
        }
    }

    /// 디스패처를 중지합니다.
    ///
    /// 워커에는 취소가 전달되지만 종료를 기다리지는 않습니다.
    pub async fn close(&self) {
        self.cancel.cancel();
        let handle = self.dispatcher.lock().await.take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            tracing::warn!(error = %e, "output dispatcher task failed");
        }
    }
}

impl fmt::Debug for OutputController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputController")
            .field("state", &self.group_state())
            .finish()
    }
}

struct ActiveGroup {
    generation: u64,
    batch_size: usize,
    work_tx: mpsc::Sender<Batch>,
    workers: Vec<JoinHandle<()>>,
}

struct Dispatcher {
    consumer: Box<dyn Consumer>,
    observer: Observer,
    cancel: CancellationToken,
    board: SharedBoard,
    retry_tx: mpsc::UnboundedSender<Batch>,
    generation: u64,
    active: Option<ActiveGroup>,
}

/// 백오프 시각까지 기다린 뒤 작업 채널 슬롯을 확보합니다.
async fn reserve_slot(
    work_tx: Option<mpsc::Sender<Batch>>,
    not_before: Option<Instant>,
) -> Result<mpsc::OwnedPermit<Batch>, mpsc::error::SendError<()>> {
    if let Some(at) = not_before {
        tokio::time::sleep_until(at).await;
    }
    match work_tx {
        Some(tx) => tx.reserve_owned().await,
        None => std::future::pending().await,
    }
}

impl Dispatcher {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut retries: mpsc::UnboundedReceiver<Batch>,
    ) {
        let mut pending: Option<Batch> = None;

        loop {
            let has_group = self.active.is_some();
            let batch_size = self.active.as_ref().map_or(1, |g| g.batch_size);
            let work_tx = self.active.as_ref().map(|g| g.work_tx.clone());
            let not_before = pending.as_ref().and_then(Batch::not_before);

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(Command::SetGroup(group, done)) => {
                        self.install(group);
                        let _ = done.send(());
                    }
                    None => break,
                },
                batch = retries.recv(), if pending.is_none() => {
                    // 송신자를 디스패처가 보유하므로 None은 오지 않음
                    pending = batch;
                }
                permit = reserve_slot(work_tx, not_before), if pending.is_some() && has_group => {
                    match permit {
                        Ok(permit) => {
                            if let Some(batch) = pending.take() {
                                permit.send(batch);
                            }
                        }
                        Err(_) => {
                            tracing::warn!("output workers exited, unsetting output group");
                            self.install(None);
                        }
                    }
                }
                batch = self.consumer.get(batch_size), if pending.is_none() && has_group => {
                    match batch {
                        Some(batch) => pending = Some(Batch::from_queue(batch)),
                        None => {
                            tracing::debug!("queue closed, dispatcher stopping");
                            break;
                        }
                    }
                }
            }
        }

        if let Some(batch) = pending {
            tracing::debug!(events = batch.len(), "dispatcher stopped with undelivered batch");
        }
        if let Some(active) = self.active.take() {
            tracing::debug!(workers = active.workers.len(), "releasing output group on shutdown");
        }
    }

    /// 새 그룹을 시작하고 이전 그룹을 드레인 상태로 전환합니다.
    fn install(&mut self, group: Option<OutputGroup>) {
        let group = group.filter(|g| {
            if g.clients.is_empty() {
                tracing::warn!("output group has no clients, treating as unset");
            }
            !g.clients.is_empty()
        });
        let next = group.map(|group| self.start_group(group));
        let previous = std::mem::replace(&mut self.active, next);

        {
            let mut board = lock_board(&self.board);
            board.current = if self.active.is_some() {
                GroupState::Active
            } else {
                GroupState::Unset
            };
            if let Some(previous) = &previous {
                board.previous = Some((previous.generation, GroupState::Draining));
            }
        }

        if let Some(previous) = previous {
            self.drain(previous);
        }
    }

    fn start_group(&mut self, group: OutputGroup) -> ActiveGroup {
        self.generation += 1;
        let (work_tx, work_rx) = mpsc::channel(1);
        let ctx = Arc::new(WorkerContext {
            work_rx: tokio::sync::Mutex::new(work_rx),
            retry_tx: self.retry_tx.clone(),
            backoff: GroupBackoff::new(group.backoff),
            max_retries: group.max_retries,
            observer: self.observer.clone(),
            cancel: self.cancel.child_token(),
        });

        tracing::info!(
            generation = self.generation,
            workers = group.clients.len(),
            batch_size = group.batch_size,
            max_retries = group.max_retries,
            "output group started"
        );

        let workers = group
            .clients
            .into_iter()
            .enumerate()
            .map(|(id, client)| tokio::spawn(worker::run(id, client, Arc::clone(&ctx))))
            .collect();

        ActiveGroup {
            generation: self.generation,
            batch_size: group.batch_size.max(1),
            work_tx,
            workers,
        }
    }

    /// 작업 채널을 닫고 워커 종료 후 교체 완료로 표시합니다.
    fn drain(&self, group: ActiveGroup) {
        let ActiveGroup {
            generation,
            work_tx,
            workers,
            ..
        } = group;
        drop(work_tx);

        let board = Arc::clone(&self.board);
        tokio::spawn(async move {
            for worker in workers {
                if let Err(e) = worker.await {
                    tracing::warn!(generation, error = %e, "output worker task failed");
                }
            }
            let mut board = lock_board(&board);
            if let Some((gen_id, state)) = board.previous.as_mut()
                && *gen_id == generation
            {
                *state = GroupState::Replaced;
            }
            tracing::debug!(generation, "output group drained");
        });
    }
}
