//! SSE 行解码器
//!
//! 按 `\n` 切行，只保留 `data:` 行的负载。处理：
//! - 跨网络分片的不完整行
//! - 跨分片边界的不完整 UTF-8 序列
//! - `\r\n` 行尾

/// 行缓冲的 SSE `data:` 解码器
#[derive(Debug, Default)]
pub struct SseLineDecoder {
    /// 尚未遇到换行的文本
    buffer: String,
    /// 分片边界处不完整的 UTF-8 字节
    incomplete_utf8: Vec<u8>,
}

impl SseLineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 喂入原始字节，返回本次凑齐的所有 `data:` 负载
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.decode(chunk);

        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            if let Some(payload) = data_payload(&line) {
                payloads.push(payload);
            }
        }
        payloads
    }

    /// 流结束时取出最后一行（没有换行结尾的情况）
    pub fn flush(&mut self) -> Option<String> {
        if !self.incomplete_utf8.is_empty() {
            let tail = std::mem::take(&mut self.incomplete_utf8);
            self.buffer.push_str(&String::from_utf8_lossy(&tail));
        }
        let line = std::mem::take(&mut self.buffer);
        data_payload(&line)
    }

    /// 缓冲区中是否还有未处理的数据
    #[cfg(test)]
    pub fn has_remaining(&self) -> bool {
        !self.buffer.is_empty() || !self.incomplete_utf8.is_empty()
    }

    fn decode(&mut self, chunk: &[u8]) {
        let bytes = if self.incomplete_utf8.is_empty() {
            chunk.to_vec()
        } else {
            let mut combined = std::mem::take(&mut self.incomplete_utf8);
            combined.extend_from_slice(chunk);
            combined
        };

        let mut rest = bytes.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    self.buffer.push_str(s);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    self.buffer
                        .push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        // 末尾序列不完整，留到下一个分片
                        None => {
                            self.incomplete_utf8 = after.to_vec();
                            break;
                        }
                        Some(len) => {
                            tracing::debug!("SSE 流中出现无效 UTF-8 字节，已替换");
                            self.buffer.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                    }
                }
            }
        }
    }
}

/// 解析一行，返回 `data:` 之后的非空负载
fn data_payload(line: &str) -> Option<String> {
    let line = line.trim_end_matches('\n').trim_end_matches('\r');
    let payload = line.strip_prefix("data:")?.trim_start();
    (!payload.is_empty()).then(|| payload.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_line() {
        let mut decoder = SseLineDecoder::new();
        let payloads = decoder.feed(b"data: {\"a\":1}\n\n");
        assert_eq!(payloads, vec!["{\"a\":1}".to_string()]);
        assert!(!decoder.has_remaining());
    }

    #[test]
    fn test_non_data_lines_ignored() {
        let mut decoder = SseLineDecoder::new();
        let payloads = decoder.feed(b": keep-alive\nevent: ping\nid: 7\ndata: x\n");
        assert_eq!(payloads, vec!["x".to_string()]);
    }

    #[test]
    fn test_partial_frame_across_chunks() {
        let mut decoder = SseLineDecoder::new();
        assert!(decoder.feed(b"data: {\"obj").is_empty());
        assert!(decoder.has_remaining());
        let payloads = decoder.feed(b"ect\":2}\ndata: [DO");
        assert_eq!(payloads, vec!["{\"object\":2}".to_string()]);
        let payloads = decoder.feed(b"NE]\n");
        assert_eq!(payloads, vec!["[DONE]".to_string()]);
    }

    #[test]
    fn test_crlf_line_endings() {
        let mut decoder = SseLineDecoder::new();
        let payloads = decoder.feed(b"data: a\r\n\r\ndata:b\r\n");
        assert_eq!(payloads, vec!["a".to_string(), "b".to_string()]);
    }

    /// 中文字符 "中" (E4 B8 AD) 被拆在两个分片
    #[test]
    fn test_utf8_split_across_chunks() {
        let mut decoder = SseLineDecoder::new();
        assert!(decoder.feed(b"data: \xE4\xB8").is_empty());
        let payloads = decoder.feed(b"\xAD\n");
        assert_eq!(payloads, vec!["中".to_string()]);
        assert!(!decoder.has_remaining());
    }

    #[test]
    fn test_invalid_utf8_replaced() {
        let mut decoder = SseLineDecoder::new();
        let payloads = decoder.feed(b"data: a\xFFb\n");
        assert_eq!(payloads, vec!["a\u{FFFD}b".to_string()]);
    }

    #[test]
    fn test_flush_trailing_line() {
        let mut decoder = SseLineDecoder::new();
        assert!(decoder.feed(b"data: tail").is_empty());
        assert_eq!(decoder.flush(), Some("tail".to_string()));
        assert!(!decoder.has_remaining());
    }

    #[test]
    fn test_empty_data_skipped() {
        let mut decoder = SseLineDecoder::new();
        assert!(decoder.feed(b"data:\ndata:   \n").is_empty());
    }
}
