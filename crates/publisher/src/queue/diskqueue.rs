//! 디스크 큐: 적재 내역을 파일에 기록하여 재시작 후 복구하는 버퍼
//!
//! 적재/ACK 의미는 메모리 큐와 동일합니다. 추가로:
//!
//! - 적재된 항목은 `<path>/queue.jsonl`에 한 줄씩 기록됩니다.
//! - 연속으로 확정된 항목 수는 `<path>/ack.checkpoint`에 기록됩니다.
//! - 큐를 열 때 체크포인트 이후 항목을 다시 적재합니다 (프로듀서 없음).
//! - 미확정 항목이 모두 확정되면 두 파일을 비웁니다.
//! - 확정된 앞부분이 `compact_after_events`를 넘으면 남은 항목만으로
//!   세그먼트를 다시 씁니다. 미확정 항목이 계속 남아 있어도 파일이
//!   한없이 커지지 않습니다.
//! - 기록에 실패한 항목은 적재되지 않고 프로듀서에게 되돌아갑니다.
//!
//! 기록은 브로커 잠금 안에서 동기 `std::fs` 호출로 이루어지며 적재마다
//! flush합니다. 따라서 처리량은 파일 쓰기 지연에 묶이고, 잠금을 잡는 동안
//! 해당 tokio 워커 스레드가 블록됩니다. 높은 처리량이 필요하면 `mem` 큐를
//! 사용합니다.
//!
//! 압축 도중 중단되면 이미 확정된 항목이 다시 전달될 수 있습니다
//! (최소 한 번 전달). 파일 구성은 내부 구현이며 외부 계약이 아닙니다.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use relay_core::pipeline::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::broker::{Broker, FlushPolicy, Journal};
use super::{Consumer, Producer, ProducerConfig, Queue, QueueEntry};
use crate::error::PublisherError;

pub const QUEUE_TYPE: &str = "disk";

const SEGMENT_FILE: &str = "queue.jsonl";
const CHECKPOINT_FILE: &str = "ack.checkpoint";

fn default_max_events() -> usize {
    4096
}

fn default_compact_after_events() -> u64 {
    1024
}

/// `[queue.disk]` 설정
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiskQueueSettings {
    /// 큐 파일 디렉토리
    pub path: PathBuf,
    /// 최대 미확정 이벤트 수
    #[serde(default = "default_max_events")]
    pub max_events: usize,
    /// 확정된 앞부분이 이만큼 쌓이면 세그먼트를 압축합니다.
    #[serde(default = "default_compact_after_events")]
    pub compact_after_events: u64,
}

impl DiskQueueSettings {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_events: default_max_events(),
            compact_after_events: default_compact_after_events(),
        }
    }

    pub fn validate(&self) -> Result<(), PublisherError> {
        if self.path.as_os_str().is_empty() {
            return Err(PublisherError::QueueConfig {
                queue_type: QUEUE_TYPE.to_owned(),
                reason: "path must not be empty".to_owned(),
            });
        }
        if self.max_events == 0 {
            return Err(PublisherError::QueueConfig {
                queue_type: QUEUE_TYPE.to_owned(),
                reason: "max_events must be greater than 0".to_owned(),
            });
        }
        if self.compact_after_events == 0 {
            return Err(PublisherError::QueueConfig {
                queue_type: QUEUE_TYPE.to_owned(),
                reason: "compact_after_events must be greater than 0".to_owned(),
            });
        }
        Ok(())
    }
}

/// 디스크 기반 큐
pub struct DiskQueue {
    broker: Arc<Broker>,
}

impl DiskQueue {
    /// 큐 디렉토리를 열고 미확정 항목을 복구합니다.
    pub fn open(settings: DiskQueueSettings) -> Result<Self, PublisherError> {
        settings.validate()?;
        fs::create_dir_all(&settings.path)?;

        let recovered = recover(&settings.path)?;
        let journal = FileJournal::open(&settings.path, settings.compact_after_events)?;
        let broker = Broker::new(
            QUEUE_TYPE,
            settings.max_events,
            FlushPolicy::IMMEDIATE,
            Some(Box::new(journal)),
        );

        info!(
            path = %settings.path.display(),
            max_events = settings.max_events,
            recovered = recovered.len(),
            "disk queue opened"
        );
        if !recovered.is_empty() {
            broker.preload(recovered);
        }

        Ok(Self { broker })
    }
}

impl Queue for DiskQueue {
    fn queue_type(&self) -> &'static str {
        QUEUE_TYPE
    }

    fn capacity(&self) -> usize {
        self.broker.capacity()
    }

    fn producer(&self, config: ProducerConfig) -> Option<Box<dyn Producer>> {
        self.broker.register_producer(config)
    }

    fn consumer(&self) -> Box<dyn Consumer> {
        self.broker.consumer()
    }

    fn outstanding(&self) -> usize {
        self.broker.outstanding()
    }

    fn wait_empty(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.broker.wait_empty())
    }

    fn close(&self) -> Result<(), PublisherError> {
        self.broker.close()?;
        Ok(())
    }
}

/// 체크포인트 이후 항목을 읽고, 남은 항목만으로 세그먼트를 다시 씁니다.
fn recover(dir: &Path) -> Result<Vec<QueueEntry>, PublisherError> {
    let segment = dir.join(SEGMENT_FILE);
    let checkpoint = read_checkpoint(&dir.join(CHECKPOINT_FILE))?;

    let mut entries = Vec::new();
    let mut lines: Vec<String> = Vec::new();
    if segment.exists() {
        let reader = BufReader::new(File::open(&segment)?);
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if (idx as u64) < checkpoint || line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<QueueEntry>(&line) {
                Ok(entry) => {
                    entries.push(entry);
                    lines.push(line);
                }
                Err(e) => warn!(
                    line = idx + 1,
                    error = %e,
                    "skipping corrupt disk queue entry"
                ),
            }
        }
    }

    let tmp = write_segment_tmp(dir, &lines)?;
    fs::rename(&tmp, &segment)?;
    write_checkpoint(dir, 0)?;
    Ok(entries)
}

/// 주어진 줄들로 임시 세그먼트 파일을 쓰고 경로를 돌려줍니다.
fn write_segment_tmp(dir: &Path, lines: &[String]) -> std::io::Result<PathBuf> {
    let tmp = dir.join(format!("{SEGMENT_FILE}.tmp"));
    let mut writer = BufWriter::new(File::create(&tmp)?);
    for line in lines {
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(tmp)
}

fn read_checkpoint(path: &Path) -> Result<u64, PublisherError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(content.trim().parse::<u64>().unwrap_or_else(|_| {
            warn!(path = %path.display(), "invalid ack checkpoint, replaying all entries");
            0
        })),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

fn write_checkpoint(dir: &Path, acked: u64) -> std::io::Result<()> {
    let tmp = dir.join(format!("{CHECKPOINT_FILE}.tmp"));
    fs::write(&tmp, acked.to_string())?;
    fs::rename(&tmp, dir.join(CHECKPOINT_FILE))
}

fn open_segment(dir: &Path) -> std::io::Result<BufWriter<File>> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(SEGMENT_FILE))?;
    Ok(BufWriter::new(file))
}

struct FileJournal {
    dir: PathBuf,
    writer: BufWriter<File>,
    /// 세그먼트 앞부분 중 확정된 줄 수
    acked: u64,
    compact_after: u64,
}

impl FileJournal {
    fn open(dir: &Path, compact_after: u64) -> std::io::Result<Self> {
        Ok(Self {
            dir: dir.to_path_buf(),
            writer: open_segment(dir)?,
            acked: 0,
            compact_after,
        })
    }

    /// 확정된 앞부분을 버리고 남은 줄만으로 세그먼트를 다시 씁니다.
    ///
    /// 체크포인트를 먼저 0으로 되돌린 뒤 교체하므로, 중간에 멈추면
    /// 확정된 항목이 다시 적재될 수는 있어도 미확정 항목을 잃지는 않습니다.
    fn compact(&mut self) -> std::io::Result<()> {
        self.writer.flush()?;
        let segment = self.dir.join(SEGMENT_FILE);
        let reader = BufReader::new(File::open(&segment)?);
        let tail: Vec<String> = reader
            .lines()
            .skip(self.acked as usize)
            .collect::<std::io::Result<_>>()?;
        let tmp = write_segment_tmp(&self.dir, &tail)?;

        write_checkpoint(&self.dir, 0)?;
        fs::rename(&tmp, &segment)?;
        self.writer = open_segment(&self.dir)?;

        debug!(
            dropped = self.acked,
            remaining = tail.len(),
            "disk queue segment compacted"
        );
        self.acked = 0;
        Ok(())
    }
}

impl Journal for FileJournal {
    fn append(&mut self, entry: &QueueEntry) -> std::io::Result<()> {
        // 직렬화 실패 시 파일에 조각이 남지 않도록 한 줄을 먼저 만듭니다.
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        self.writer.write_all(&line)?;
        self.writer.flush()
    }

    fn acknowledge(&mut self, count: usize, drained: bool) -> std::io::Result<()> {
        if drained {
            self.writer.flush()?;
            self.writer.get_ref().set_len(0)?;
            self.acked = 0;
            return write_checkpoint(&self.dir, 0);
        }

        self.acked += count as u64;
        if self.acked >= self.compact_after {
            return self.compact();
        }
        write_checkpoint(&self.dir, self.acked)
    }

    fn close(&mut self) -> std::io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::event::Event;

    fn event(n: i64) -> QueueEntry {
        QueueEntry::new(Event::new().with_field("n", n))
    }

    #[tokio::test]
    async fn unacked_entries_are_replayed_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let settings = DiskQueueSettings::new(dir.path());
        {
            let queue = DiskQueue::open(settings.clone()).unwrap();
            let producer = queue.producer(ProducerConfig::default()).unwrap();
            for n in 0..3 {
                producer.try_publish(event(n)).unwrap();
            }
            // 첫 항목만 ACK
            let mut consumer = queue.consumer();
            let first = consumer.get(1).await.unwrap();
            first.ack.ack();
            queue.close().unwrap();
        }

        let reopened = DiskQueue::open(settings).unwrap();
        assert_eq!(reopened.outstanding(), 2);
        let batch = reopened.consumer().get(10).await.unwrap();
        let values: Vec<_> = batch
            .entries
            .iter()
            .map(|e| e.event.get_value("n").cloned().unwrap())
            .collect();
        assert_eq!(values, [1, 2]);
    }

    #[tokio::test]
    async fn drained_queue_truncates_segment() {
        let dir = tempfile::tempdir().unwrap();
        let queue = DiskQueue::open(DiskQueueSettings::new(dir.path())).unwrap();
        let producer = queue.producer(ProducerConfig::default()).unwrap();
        producer.try_publish(event(1)).unwrap();
        queue.consumer().get(10).await.unwrap().ack.ack();
        queue.close().unwrap();

        let segment = fs::metadata(dir.path().join(SEGMENT_FILE)).unwrap();
        assert_eq!(segment.len(), 0);
        let reopened = DiskQueue::open(DiskQueueSettings::new(dir.path())).unwrap();
        assert_eq!(reopened.outstanding(), 0);
    }

    fn segment_lines(dir: &Path) -> usize {
        fs::read_to_string(dir.join(SEGMENT_FILE))
            .unwrap()
            .lines()
            .count()
    }

    #[tokio::test]
    async fn segment_is_compacted_while_an_older_batch_stays_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = DiskQueueSettings::new(dir.path());
        settings.compact_after_events = 16;
        {
            let queue = DiskQueue::open(settings.clone()).unwrap();
            let producer = queue.producer(ProducerConfig::default()).unwrap();
            let mut consumer = queue.consumer();

            // 항상 직전 배치 하나를 확정하지 않은 채로 둡니다.
            producer.try_publish(event(0)).unwrap();
            let mut held = consumer.get(1).await.unwrap();
            for n in 1..500 {
                producer.try_publish(event(n)).unwrap();
                let next = consumer.get(1).await.unwrap();
                held.ack.ack();
                held = next;
                assert!(segment_lines(dir.path()) <= 16 + 1);
            }
            assert_eq!(queue.outstanding(), 1);
            queue.close().unwrap();
        }

        let reopened = DiskQueue::open(settings).unwrap();
        assert_eq!(reopened.outstanding(), 1);
        let batch = reopened.consumer().get(10).await.unwrap();
        assert_eq!(batch.entries.len(), 1);
        assert_eq!(
            batch.entries[0].event.get_value("n"),
            Some(&serde_json::json!(499))
        );
    }

    #[test]
    fn corrupt_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let good = serde_json::to_string(&event(7)).unwrap();
        fs::write(
            dir.path().join(SEGMENT_FILE),
            format!("not json\n{good}\n"),
        )
        .unwrap();

        let recovered = recover(dir.path()).unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].event.get_value("n"), Some(&serde_json::json!(7)));
    }

    #[test]
    fn zero_max_events_is_rejected() {
        let mut settings = DiskQueueSettings::new("/tmp/relay-queue");
        settings.max_events = 0;
        assert!(settings.validate().is_err());

        let mut settings = DiskQueueSettings::new("/tmp/relay-queue");
        settings.compact_after_events = 0;
        assert!(settings.validate().is_err());
    }
}
