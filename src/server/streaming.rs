use crate::error::RelayError;
use crate::streaming::SseStream;
use futures_util::StreamExt;
use hyper::body::{Bytes, Frame};
use serde_json::{json, Value};

/// OpenAI 风格错误体
pub fn error_body(err: &RelayError) -> Value {
    json!({
        "error": {
            "message": err.to_string(),
            "type": err.error_type()
        }
    })
}

/// 流中途出错时的最后一帧
pub fn format_sse_error(err: &RelayError) -> Bytes {
    Bytes::from(format!("data: {}\n\n", error_body(err)))
}

/// 转码管道 -> HTTP 帧流；错误转成一个 SSE 错误帧，管道随后结束
pub fn into_frames(
    stream: SseStream,
) -> impl futures_util::Stream<Item = Result<Frame<Bytes>, std::convert::Infallible>> + Send {
    stream.map(|item| match item {
        Ok(bytes) => Ok(Frame::data(bytes)),
        Err(e) => {
            tracing::warn!("流式响应中断: {}", e);
            Ok(Frame::data(format_sse_error(&e)))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    #[test]
    fn test_format_sse_error() {
        let bytes = format_sse_error(&RelayError::unsupported("tool call arguments"));
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.starts_with("data: {"));
        assert!(text.ends_with("\n\n"));
        assert!(text.contains("\"type\":\"unsupported_feature\""));
    }

    #[tokio::test]
    async fn test_error_becomes_final_frame() {
        let input: SseStream = stream::iter(vec![
            Ok(Bytes::from_static(b"data: {}\n\n")),
            Err(RelayError::StreamError("boom".into())),
        ])
        .boxed();

        let frames: Vec<Bytes> = into_frames(input)
            .map(|frame| frame.unwrap().into_data().unwrap())
            .collect()
            .await;

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], Bytes::from_static(b"data: {}\n\n"));
        assert!(String::from_utf8_lossy(&frames[1]).contains("boom"));
    }
}
