use async_stream::try_stream;
use futures_util::StreamExt;

use super::TextStream;
use crate::error::ChatError;
use crate::models::ProviderId;

/**
 * \brief 将 SSE 响应拆成逐个事件的 data 载荷；遇到 `[DONE]` 即结束。
 */
pub(crate) fn data_events(
    resp: reqwest::Response,
    provider: ProviderId,
    model: String,
) -> TextStream {
    let mut stream = resp.bytes_stream();
    let mut buf = Vec::<u8>::new();

    Box::pin(try_stream! {
        let mut done = false;
        'read: while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ChatError::transport(provider, &model, e))?;
            buf.extend(chunk.iter().copied().filter(|b| *b != b'\r'));
            while let Some(pos) = find_double_newline(&buf) {
                let block = buf.drain(..pos + 2).collect::<Vec<u8>>();
                if let Some(data) = extract_data(&block) {
                    if data == "[DONE]" {
                        done = true;
                        break 'read;
                    }
                    yield data;
                }
            }
        }
        if !done {
            if let Some(data) = extract_data(&buf) {
                if data != "[DONE]" {
                    yield data;
                }
            }
        }
    })
}

fn find_double_newline(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

/**
 * \brief 合并一个事件块中的所有 data 行。
 */
fn extract_data(block: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(block);
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim_start)
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim)
        .collect();
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}
