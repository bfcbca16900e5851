//! 请求侧归一化
//!
//! 把 OpenAI 风格的 chat completion 请求体转换为 [`RequestInfo`]：
//! 按角色统计文本字节、图片/文件附件、生成参数、提示哈希和场景标签。

use std::collections::BTreeSet;

use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use super::types::{GenerationParams, MessageComposition, RequestInfo, RuntimeContext, ScenarioLabels};

const KB: u64 = 1024;
const MB: u64 = 1024 * 1024;

/// 内容块的归类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PartKind {
    Text,
    Image,
    File,
    Other,
}

impl PartKind {
    fn as_str(&self) -> &'static str {
        match self {
            PartKind::Text => "text",
            PartKind::Image => "image",
            PartKind::File => "file",
            PartKind::Other => "other",
        }
    }
}

/// 单个内容块的测量结果
struct MeasuredPart {
    kind: PartKind,
    bytes: u64,
    text: Option<String>,
    file_kind: Option<String>,
}

/// 分析请求体，生成请求侧元数据
pub fn analyze_request(body: &Value, runtime: Option<RuntimeContext>) -> RequestInfo {
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .map(str::to_string);
    let messages = body.get("messages").and_then(Value::as_array);

    let mut composition = MessageComposition::default();
    let mut kinds = BTreeSet::new();
    let mut skeleton = Vec::new();
    let mut text_projection = Vec::new();

    for message in messages.into_iter().flatten() {
        let role = message
            .get("role")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let parts = measure_content(message.get("content"));

        composition.messages_count += 1;
        let text_bytes: u64 = parts
            .iter()
            .filter(|p| p.kind == PartKind::Text)
            .map(|p| p.bytes)
            .sum();
        match role {
            "system" | "developer" => {
                composition.system_count += 1;
                composition.system_text_bytes += text_bytes;
            }
            "user" => {
                composition.user_count += 1;
                composition.user_text_bytes += text_bytes;
            }
            "assistant" => {
                composition.assistant_count += 1;
                composition.assistant_text_bytes += text_bytes;
            }
            "tool" | "function" => {
                composition.tool_count += 1;
                composition.tool_text_bytes += text_bytes;
            }
            _ => {}
        }

        for part in &parts {
            match part.kind {
                PartKind::Image => {
                    composition.image_parts += 1;
                    composition.image_bytes += part.bytes;
                }
                PartKind::File => {
                    composition.file_parts += 1;
                    composition.file_bytes += part.bytes;
                    kinds.insert(part.file_kind.clone().unwrap_or_else(|| "file".to_string()));
                }
                _ => {}
            }
        }

        skeleton.push(json!({
            "role": role,
            "parts": parts
                .iter()
                .map(|p| json!({"kind": p.kind.as_str(), "bytes": p.bytes}))
                .collect::<Vec<_>>(),
        }));
        let text = parts
            .iter()
            .filter_map(|p| p.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n");
        text_projection.push(json!({"role": role, "text": text}));
    }
    composition.file_kinds = kinds.into_iter().collect();

    let (prompt_hash, text_prompt_hash, message_structure_hash) = match messages {
        Some(messages) => (
            sha256_json(&Value::Array(messages.clone())),
            sha256_json(&Value::Array(text_projection)),
            sha256_json(&Value::Array(skeleton)),
        ),
        None => (None, None, None),
    };

    let scenario_labels = scenario_labels(&composition, runtime.as_ref());

    RequestInfo {
        model,
        composition,
        params: generation_params(body),
        runtime,
        prompt_hash,
        text_prompt_hash,
        message_structure_hash,
        scenario_labels,
    }
}

/// 计算 JSON 值的 SHA-256（十六进制），序列化失败时返回 None
fn sha256_json(value: &Value) -> Option<String> {
    let bytes = serde_json::to_vec(value).ok()?;
    Some(hex::encode(Sha256::digest(&bytes)))
}

fn measure_content(content: Option<&Value>) -> Vec<MeasuredPart> {
    match content {
        Some(Value::String(text)) => vec![text_part(text)],
        Some(Value::Array(blocks)) => blocks.iter().map(measure_part).collect(),
        _ => Vec::new(),
    }
}

fn text_part(text: &str) -> MeasuredPart {
    MeasuredPart {
        kind: PartKind::Text,
        bytes: text.len() as u64,
        text: Some(text.to_string()),
        file_kind: None,
    }
}

fn measure_part(part: &Value) -> MeasuredPart {
    let part_type = part.get("type").and_then(Value::as_str).unwrap_or("");
    match part_type {
        "text" | "input_text" => {
            let text = part.get("text").and_then(Value::as_str).unwrap_or("");
            text_part(text)
        }
        "image_url" | "input_image" | "image" => {
            let url = part
                .get("image_url")
                .and_then(|v| v.get("url").or(Some(v)))
                .and_then(Value::as_str)
                .or_else(|| part.pointer("/source/data").and_then(Value::as_str));
            MeasuredPart {
                kind: PartKind::Image,
                bytes: url.map(payload_bytes).unwrap_or(0),
                text: None,
                file_kind: None,
            }
        }
        "file" | "input_file" | "document" => measure_file(part),
        _ => MeasuredPart {
            kind: PartKind::Other,
            bytes: 0,
            text: None,
            file_kind: None,
        },
    }
}

fn measure_file(part: &Value) -> MeasuredPart {
    let data = part
        .pointer("/file/file_data")
        .or_else(|| part.get("file_data"))
        .or_else(|| part.pointer("/source/data"))
        .or_else(|| part.get("text"))
        .and_then(Value::as_str);
    let filename = part
        .pointer("/file/filename")
        .or_else(|| part.get("filename"))
        .or_else(|| part.get("title"))
        .and_then(Value::as_str);
    let media_type = data
        .and_then(data_url_mime)
        .or_else(|| part.pointer("/source/media_type").and_then(Value::as_str))
        .or_else(|| part.pointer("/file/mime_type").and_then(Value::as_str));

    let file_kind = filename
        .and_then(extension_kind)
        .or_else(|| media_type.map(mime_kind));

    MeasuredPart {
        kind: PartKind::File,
        bytes: data.map(payload_bytes).unwrap_or(0),
        text: None,
        file_kind,
    }
}

/// 附件数据的字节数：data URL 取解码后大小，远程 URL 记 0，其余按原文长度
fn payload_bytes(data: &str) -> u64 {
    if let Some(rest) = data.strip_prefix("data:") {
        let Some((header, payload)) = rest.split_once(',') else {
            return 0;
        };
        if header.ends_with(";base64") {
            return base64_decoded_len(payload);
        }
        return payload.len() as u64;
    }
    if data.starts_with("http://") || data.starts_with("https://") {
        return 0;
    }
    // Anthropic 风格的裸 base64 与纯文本无法可靠区分，按 base64 估算仅限看起来像 base64 的串
    if !data.is_empty()
        && data
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/' || b == b'=')
        && data.len() % 4 == 0
    {
        return base64_decoded_len(data);
    }
    data.len() as u64
}

fn base64_decoded_len(payload: &str) -> u64 {
    let trimmed = payload.trim();
    let padding = trimmed.bytes().rev().take_while(|b| *b == b'=').count() as u64;
    ((trimmed.len() as u64) * 3 / 4).saturating_sub(padding)
}

fn data_url_mime(data: &str) -> Option<&str> {
    let rest = data.strip_prefix("data:")?;
    let header = rest.split(',').next()?;
    let mime = header.split(';').next()?;
    (!mime.is_empty()).then_some(mime)
}

fn extension_kind(filename: &str) -> Option<String> {
    let (_, ext) = filename.rsplit_once('.')?;
    let ext = ext.trim().to_ascii_lowercase();
    (!ext.is_empty() && ext.len() <= 8).then_some(ext)
}

fn mime_kind(mime: &str) -> String {
    let subtype = mime
        .split('/')
        .nth(1)
        .unwrap_or(mime)
        .trim()
        .to_ascii_lowercase();
    let subtype = subtype.strip_prefix("x-").unwrap_or(&subtype).to_string();
    match subtype.as_str() {
        "plain" => "txt".to_string(),
        "markdown" => "md".to_string(),
        "vnd.openxmlformats-officedocument.wordprocessingml.document" => "docx".to_string(),
        "msword" => "doc".to_string(),
        "" => "file".to_string(),
        other => other
            .rsplit(|c: char| c == '.' || c == '+')
            .next()
            .unwrap_or(other)
            .to_string(),
    }
}

fn generation_params(body: &Value) -> GenerationParams {
    let float = |key: &str| body.get(key).and_then(Value::as_f64).filter(|v| v.is_finite());
    GenerationParams {
        temperature: float("temperature"),
        top_p: float("top_p"),
        top_k: float("top_k"),
        min_p: float("min_p"),
        max_tokens: body
            .get("max_tokens")
            .or_else(|| body.get("max_completion_tokens"))
            .and_then(Value::as_u64),
        seed: body.get("seed").and_then(Value::as_i64),
        stream: body.get("stream").and_then(Value::as_bool),
    }
}

// === 场景标签 ===

fn scenario_labels(composition: &MessageComposition, runtime: Option<&RuntimeContext>) -> ScenarioLabels {
    ScenarioLabels {
        input_mode: input_mode(composition).to_string(),
        file_size_bucket: file_size_bucket(composition.file_bytes, composition.has_document())
            .to_string(),
        file_kinds: if composition.file_kinds.is_empty() {
            "none".to_string()
        } else {
            composition.file_kinds.join("+")
        },
        image_size_bucket: image_size_bucket(composition.image_bytes, composition.has_image())
            .to_string(),
        image_count_bucket: image_count_bucket(composition.image_parts).to_string(),
        user_text_size_bucket: user_text_size_bucket(composition.user_text_bytes).to_string(),
        runtime_bucket: runtime_bucket(runtime.and_then(|r| r.n_ctx)).to_string(),
    }
}

pub fn input_mode(composition: &MessageComposition) -> &'static str {
    match (composition.has_document(), composition.has_image()) {
        (true, true) => "file+image",
        (true, false) => "file",
        (false, true) => "image",
        (false, false) => "text",
    }
}

/// 有附件但大小未知（远程 URL）时归入最小档
pub fn file_size_bucket(bytes: u64, present: bool) -> &'static str {
    match bytes {
        0 if !present => "0:none",
        b if b < 10 * KB => "1:<10KB",
        b if b < 100 * KB => "2:10-100KB",
        b if b < MB => "3:100KB-1MB",
        _ => "4:>1MB",
    }
}

pub fn image_size_bucket(bytes: u64, present: bool) -> &'static str {
    match bytes {
        0 if !present => "0:none",
        b if b < 100 * KB => "1:<100KB",
        b if b < MB => "2:100KB-1MB",
        b if b < 5 * MB => "3:1-5MB",
        _ => "4:>5MB",
    }
}

pub fn image_count_bucket(count: u32) -> &'static str {
    match count {
        0 => "0",
        1 => "1",
        2 => "2",
        3..=4 => "3-4",
        _ => "5+",
    }
}

pub fn user_text_size_bucket(bytes: u64) -> &'static str {
    match bytes {
        0 => "0:none",
        b if b < KB => "1:<1KB",
        b if b < 4 * KB => "2:1-4KB",
        b if b < 16 * KB => "3:4-16KB",
        b if b < 64 * KB => "4:16-64KB",
        _ => "5:>64KB",
    }
}

pub fn runtime_bucket(n_ctx: Option<u64>) -> &'static str {
    match n_ctx {
        None | Some(0) => "unknown",
        Some(n) if n <= 4096 => "ctx<=4k",
        Some(n) if n <= 8192 => "ctx<=8k",
        Some(n) if n <= 32768 => "ctx<=32k",
        Some(n) if n <= 131072 => "ctx<=128k",
        Some(_) => "ctx>128k",
    }
}

pub fn output_length_bucket(tokens: u64) -> &'static str {
    match tokens {
        0..=128 => "0-128",
        129..=512 => "129-512",
        513..=1024 => "513-1024",
        _ => "1025+",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_request(user_text: &str) -> Value {
        json!({
            "model": "qwen3-8b",
            "stream": true,
            "temperature": 0.7,
            "messages": [
                {"role": "system", "content": "You are helpful"},
                {"role": "user", "content": user_text}
            ]
        })
    }

    #[test]
    fn test_text_only_request() {
        let info = analyze_request(&text_request("hello"), None);

        assert_eq!(info.model.as_deref(), Some("qwen3-8b"));
        assert_eq!(info.composition.messages_count, 2);
        assert_eq!(info.composition.system_count, 1);
        assert_eq!(info.composition.user_count, 1);
        assert_eq!(info.composition.user_text_bytes, 5);
        assert_eq!(info.composition.system_text_bytes, 15);
        assert_eq!(info.params.temperature, Some(0.7));
        assert_eq!(info.params.stream, Some(true));
        assert_eq!(info.scenario_labels.input_mode, "text");
        assert_eq!(info.scenario_labels.file_size_bucket, "0:none");
        assert_eq!(info.scenario_labels.file_kinds, "none");
        assert_eq!(info.scenario_labels.image_count_bucket, "0");
        assert_eq!(info.scenario_labels.user_text_size_bucket, "1:<1KB");
        assert_eq!(info.scenario_labels.runtime_bucket, "unknown");
        assert_eq!(info.prompt_hash.as_ref().map(|h| h.len()), Some(64));
    }

    #[test]
    fn test_prompt_hash_is_stable_and_content_addressed() {
        let a = analyze_request(&text_request("hello"), None);
        let b = analyze_request(&text_request("hello"), None);
        let c = analyze_request(&text_request("hellO"), None);

        assert_eq!(a.prompt_hash, b.prompt_hash);
        assert_ne!(a.prompt_hash, c.prompt_hash);
        // 结构哈希只看字节数，不看文本
        assert_eq!(a.message_structure_hash, c.message_structure_hash);
    }

    #[test]
    fn test_image_and_file_parts() {
        let body = json!({
            "model": "gemma-3",
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": "What is in these?"},
                    {"type": "image_url", "image_url": {"url": "data:image/png;base64,AAAABBBB"}},
                    {"type": "image_url", "image_url": {"url": "https://example.com/cat.png"}},
                    {"type": "file", "file": {"filename": "report.PDF", "file_data": "data:application/pdf;base64,AAAA"}},
                    {"type": "file", "file": {"file_data": "data:text/plain;base64,AAA="}}
                ]
            }]
        });
        let info = analyze_request(&body, None);
        let c = &info.composition;

        assert_eq!(c.image_parts, 2);
        assert_eq!(c.image_bytes, 6);
        assert_eq!(c.file_parts, 2);
        assert_eq!(c.file_bytes, 3 + 2);
        assert_eq!(c.file_kinds, vec!["pdf".to_string(), "txt".to_string()]);
        assert_eq!(c.user_text_bytes, 17);
        assert_eq!(info.scenario_labels.input_mode, "file+image");
        assert_eq!(info.scenario_labels.file_kinds, "pdf+txt");
        assert_eq!(info.scenario_labels.image_count_bucket, "2");
        assert_eq!(info.scenario_labels.file_size_bucket, "1:<10KB");
        assert_eq!(info.scenario_labels.image_size_bucket, "1:<100KB");
    }

    /// 附件不同但文字相同的请求共享纯文本哈希
    #[test]
    fn test_text_prompt_hash_ignores_attachments() {
        let plain = json!({"messages": [{"role": "user", "content": [{"type": "text", "text": "describe"}]}]});
        let with_image = json!({"messages": [{"role": "user", "content": [
            {"type": "text", "text": "describe"},
            {"type": "image_url", "image_url": {"url": "data:image/jpeg;base64,AAAA"}}
        ]}]});
        let a = analyze_request(&plain, None);
        let b = analyze_request(&with_image, None);

        assert_ne!(a.prompt_hash, b.prompt_hash);
        assert_eq!(a.text_prompt_hash, b.text_prompt_hash);
    }

    #[test]
    fn test_missing_messages() {
        let info = analyze_request(&json!({"model": "m"}), None);
        assert_eq!(info.composition.messages_count, 0);
        assert!(info.prompt_hash.is_none());
        assert!(info.message_structure_hash.is_none());
    }

    #[test]
    fn test_runtime_bucket_from_context() {
        let runtime = RuntimeContext {
            n_ctx: Some(32768),
            ..Default::default()
        };
        let info = analyze_request(&text_request("hi"), Some(runtime));
        assert_eq!(info.scenario_labels.runtime_bucket, "ctx<=32k");
        assert_eq!(runtime_bucket(Some(200_000)), "ctx>128k");
        assert_eq!(runtime_bucket(Some(4096)), "ctx<=4k");
    }

    #[test]
    fn test_bucket_boundaries() {
        assert_eq!(image_count_bucket(3), "3-4");
        assert_eq!(image_count_bucket(4), "3-4");
        assert_eq!(image_count_bucket(9), "5+");
        assert_eq!(output_length_bucket(128), "0-128");
        assert_eq!(output_length_bucket(129), "129-512");
        assert_eq!(output_length_bucket(1024), "513-1024");
        assert_eq!(output_length_bucket(1025), "1025+");
        assert_eq!(user_text_size_bucket(1024), "2:1-4KB");
        assert_eq!(file_size_bucket(0, true), "1:<10KB");
        assert_eq!(file_size_bucket(2 * MB, true), "4:>1MB");
    }

    /// 带数字前缀的有序标签按字典序即为自然顺序
    #[test]
    fn test_ordinal_labels_sort_lexically() {
        let mut labels = vec![
            user_text_size_bucket(100 * KB),
            user_text_size_bucket(10),
            user_text_size_bucket(0),
            user_text_size_bucket(5 * KB),
        ];
        labels.sort();
        assert_eq!(labels, vec!["0:none", "1:<1KB", "3:4-16KB", "5:>64KB"]);
    }

    #[test]
    fn test_anthropic_document_block() {
        let body = json!({"messages": [{"role": "user", "content": [
            {"type": "document", "source": {"type": "base64", "media_type": "application/pdf", "data": "AAAAAAAA"}}
        ]}]});
        let info = analyze_request(&body, None);
        assert_eq!(info.composition.file_parts, 1);
        assert_eq!(info.composition.file_bytes, 6);
        assert_eq!(info.composition.file_kinds, vec!["pdf".to_string()]);
    }
}
