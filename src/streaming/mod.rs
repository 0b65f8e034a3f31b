//! SSE 转码管道：上游字节流 -> 厂商事件 -> OpenAI chunk 帧。
//!
//! 一个后台任务负责解析与转码，帧经有界 channel 交给响应体读取；
//! 下游断开时任务结束并丢弃上游响应。

use crate::error::RelayError;
use crate::providers::anthropic::MessagesTranscoder;
use crate::providers::cohere::V2ChatTranscoder;
use crate::transport::ByteStream;
use crate::types::ChatStreamChunk;
use crate::Result;
use eventsource_stream::Eventsource;
use futures_util::{Stream, StreamExt};
use hyper::body::Bytes;
use std::pin::Pin;
use tokio::sync::mpsc;
use tracing::debug;

/// 输出给调用方的 SSE 字节流
pub type SseStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

const CHANNEL_CAPACITY: usize = 16;

pub const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";
const DONE_MARKER: &[u8] = b"[DONE]";

/// 一个输出帧
#[derive(Debug, Clone)]
pub enum Frame {
    Chunk(ChatStreamChunk),
    Done,
}

impl Frame {
    pub fn is_done(&self) -> bool {
        matches!(self, Frame::Done)
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        match self {
            Frame::Chunk(chunk) => Ok(Bytes::from(format!(
                "data: {}\n\n",
                serde_json::to_string(chunk)?
            ))),
            Frame::Done => Ok(Bytes::from_static(DONE_FRAME)),
        }
    }
}

/// 有状态的厂商流转码器
#[derive(Debug)]
pub enum Transcoder {
    Messages(MessagesTranscoder),
    V2Chat(V2ChatTranscoder),
}

impl Transcoder {
    /// 每个厂商事件产生零或一个输出帧
    pub fn on_event(&mut self, event: &str, data: &str) -> Result<Option<Frame>> {
        match self {
            Transcoder::Messages(inner) => inner.on_event(event, data),
            Transcoder::V2Chat(inner) => inner.on_event(event, data),
        }
    }
}

/// 启动转码管道；`transcoder` 为 None 时原样转发字节
pub fn pipe(body: ByteStream, transcoder: Option<Transcoder>) -> SseStream {
    let (tx, rx) = mpsc::channel::<Result<Bytes>>(CHANNEL_CAPACITY);

    tokio::spawn(async move {
        tokio::select! {
            _ = tx.closed() => debug!("下游连接已关闭，取消上游流"),
            _ = async {
                match transcoder {
                    Some(transcoder) => pump_events(body, transcoder, &tx).await,
                    None => pump_raw(body, &tx).await,
                }
            } => {}
        }
    });

    receiver_stream(rx)
}

fn receiver_stream(rx: mpsc::Receiver<Result<Bytes>>) -> SseStream {
    futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
    .boxed()
}

async fn pump_events(body: ByteStream, mut transcoder: Transcoder, tx: &mpsc::Sender<Result<Bytes>>) {
    let mut events = body.eventsource();

    while let Some(item) = events.next().await {
        let event = match item {
            Ok(event) => event,
            Err(e) => {
                let _ = tx.send(Err(RelayError::StreamError(e.to_string()))).await;
                return;
            }
        };

        let frame = match transcoder.on_event(&event.event, &event.data) {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };

        let done = frame.is_done();
        if tx.send(frame.to_bytes()).await.is_err() || done {
            return;
        }
    }

    let _ = tx.send(Ok(Bytes::from_static(DONE_FRAME))).await;
}

async fn pump_raw(mut body: ByteStream, tx: &mpsc::Sender<Result<Bytes>>) {
    let mut detector = DoneDetector::default();

    while let Some(item) = body.next().await {
        let bytes = match item {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };

        if !detector.seen {
            detector.feed(&bytes);
        }

        if tx.send(Ok(bytes)).await.is_err() {
            return;
        }
    }

    if detector.seen {
        return;
    }

    // 上游在行中间结束时先补齐事件边界
    let mut tail = Vec::new();
    if detector.has_partial_line() {
        detector.end_line();
        tail.extend_from_slice(b"\n\n");
    }
    if !detector.seen {
        tail.extend_from_slice(DONE_FRAME);
    }
    let _ = tx.send(Ok(Bytes::from(tail))).await;
}

/// 按行扫描原始 SSE 字节，只认完整的 `data: [DONE]` 行
#[derive(Debug, Default)]
struct DoneDetector {
    line: Vec<u8>,
    seen: bool,
}

impl DoneDetector {
    /// 超过该长度的行不可能是终止行，无需继续缓存
    const MAX_LINE: usize = b"data: [DONE]".len() + 1;

    fn feed(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            match byte {
                b'\n' | b'\r' => self.end_line(),
                _ if self.line.len() < Self::MAX_LINE => self.line.push(byte),
                _ => {}
            }
        }
    }

    fn end_line(&mut self) {
        if is_done_line(&self.line) {
            self.seen = true;
        }
        self.line.clear();
    }

    fn has_partial_line(&self) -> bool {
        !self.line.is_empty()
    }
}

fn is_done_line(line: &[u8]) -> bool {
    line.strip_prefix(b"data:")
        .map(|value| value.strip_prefix(b" ").unwrap_or(value) == DONE_MARKER)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::unix_now;
    use futures_util::stream;

    fn byte_stream(parts: Vec<&'static str>) -> ByteStream {
        stream::iter(parts.into_iter().map(|p| Ok(Bytes::from_static(p.as_bytes())))).boxed()
    }

    async fn collect(stream: SseStream) -> Vec<Result<Bytes>> {
        stream.collect().await
    }

    #[tokio::test]
    async fn test_raw_passthrough_keeps_bytes() {
        let out = collect(pipe(
            byte_stream(vec!["data: {\"a\":1}\n\n", "data: [DO", "NE]\n\n"]),
            None,
        ))
        .await;
        let joined: Vec<u8> = out
            .into_iter()
            .flat_map(|b| b.unwrap().to_vec())
            .collect();
        assert_eq!(joined, b"data: {\"a\":1}\n\ndata: [DONE]\n\n".to_vec());
    }

    #[tokio::test]
    async fn test_raw_passthrough_ignores_done_inside_content() {
        let out = collect(pipe(
            byte_stream(vec![
                "data: {\"choices\":[{\"delta\":{\"content\":\"print [DONE]\"}}]}\n\n",
            ]),
            None,
        ))
        .await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].as_ref().unwrap().as_ref(), DONE_FRAME);
    }

    #[tokio::test]
    async fn test_raw_passthrough_closes_partial_line() {
        let out = collect(pipe(byte_stream(vec!["data: {\"a\":1}"]), None)).await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].as_ref().unwrap().as_ref(), b"\n\ndata: [DONE]\n\n");

        let out = collect(pipe(byte_stream(vec!["data: {}\n\n", "data:[DONE]"]), None)).await;
        assert_eq!(out.len(), 3);
        assert_eq!(out[2].as_ref().unwrap().as_ref(), b"\n\n");
    }

    #[test]
    fn test_done_detector_lines() {
        let mut detector = DoneDetector::default();
        detector.feed(b"data: {\"x\":\"[DONE]\"}\r\n\r\n: [DONE]\n");
        assert!(!detector.seen);
        detector.feed(b"data: [DO");
        assert!(!detector.seen);
        detector.feed(b"NE]\r\n");
        assert!(detector.seen);
    }

    #[tokio::test]
    async fn test_raw_passthrough_appends_done() {
        let out = collect(pipe(byte_stream(vec!["data: {\"a\":1}\n\n"]), None)).await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].as_ref().unwrap().as_ref(), DONE_FRAME);
    }

    #[tokio::test]
    async fn test_transcoded_stream_without_done_is_terminated() {
        let transcoder = Transcoder::V2Chat(V2ChatTranscoder::new("command-r"));
        let out = collect(pipe(
            byte_stream(vec![
                "data: {\"type\":\"content-delta\",\"delta\":{\"message\":{\"content\":{\"text\":\"hi\"}}}}\n\n",
            ]),
            Some(transcoder),
        ))
        .await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].as_ref().unwrap().as_ref(), DONE_FRAME);
    }

    #[tokio::test]
    async fn test_transcoder_error_ends_stream() {
        let transcoder = Transcoder::Messages(MessagesTranscoder::new("claude"));
        let out = collect(pipe(
            byte_stream(vec![
                "event: content_block_start\ndata: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"tool_use\",\"id\":\"t\",\"name\":\"f\"}}\n\n",
                "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
            ]),
            Some(transcoder),
        ))
        .await;
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Err(RelayError::UnsupportedFeature(_))));
    }

    #[tokio::test]
    async fn test_dropped_consumer_stops_pipe() {
        let (up_tx, up_rx) = mpsc::channel::<Result<Bytes>>(1);
        let upstream: ByteStream = futures_util::stream::unfold(up_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();

        let out = pipe(upstream, None);
        drop(out);

        // 管道任务结束后上游接收端被丢弃
        tokio::time::timeout(std::time::Duration::from_secs(2), up_tx.closed())
            .await
            .unwrap();
    }

    #[test]
    fn test_frame_encoding() {
        let chunk = ChatStreamChunk {
            id: "c".into(),
            object: "chat.completion.chunk".into(),
            created: unix_now(),
            model: "m".into(),
            choices: vec![],
            usage: None,
        };
        let bytes = Frame::Chunk(chunk).to_bytes().unwrap();
        assert!(bytes.starts_with(b"data: {"));
        assert!(bytes.ends_with(b"\n\n"));
        assert_eq!(Frame::Done.to_bytes().unwrap().as_ref(), DONE_FRAME);
    }
}
