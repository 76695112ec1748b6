//! 콘솔 출력: 이벤트를 JSON Lines로 표준 출력에 씁니다.

use relay_core::event::Event;
use serde_json::{Map, Value};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use super::{OutputClient, PublishError};

pub const OUTPUT_TYPE: &str = "console";

/// JSON Lines 출력
pub struct ConsoleOutput<W = tokio::io::Stdout> {
    writer: W,
}

impl ConsoleOutput {
    /// 표준 출력에 쓰는 출력을 생성합니다.
    pub fn stdout() -> Self {
        Self {
            writer: tokio::io::stdout(),
        }
    }
}

impl<W> ConsoleOutput<W>
where
    W: AsyncWrite + Unpin + Send,
{
    /// 임의의 writer에 쓰는 출력을 생성합니다.
    pub fn with_writer(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// 이벤트를 출력 문서로 변환합니다. 메타데이터는 포함하지 않습니다.
fn encode(event: &Event) -> Result<Vec<u8>, serde_json::Error> {
    let mut doc = Map::with_capacity(event.fields.len() + 1);
    doc.insert(
        "@timestamp".to_owned(),
        Value::String(event.timestamp.to_rfc3339()),
    );
    for (key, value) in &event.fields {
        doc.insert(key.clone(), value.clone());
    }
    let mut line = serde_json::to_vec(&Value::Object(doc))?;
    line.push(b'\n');
    Ok(line)
}

impl<W> OutputClient for ConsoleOutput<W>
where
    W: AsyncWrite + Unpin + Send,
{
    fn name(&self) -> &str {
        OUTPUT_TYPE
    }

    async fn publish(
        &mut self,
        cancel: &CancellationToken,
        events: &[Event],
    ) -> Result<(), PublishError> {
        let mut buf = Vec::new();
        for event in events {
            let line = encode(event).map_err(|e| PublishError::Permanent(e.to_string()))?;
            buf.extend_from_slice(&line);
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(PublishError::Retryable("publish cancelled".to_owned())),
            result = async {
                self.writer.write_all(&buf).await?;
                self.writer.flush().await
            } => result.map_err(|e| PublishError::Retryable(e.to_string())),
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.writer.flush().await {
            tracing::debug!(error = %e, "console output flush failed on close");
        }
    }
}
