//! 公共工具模块

pub mod auth;

/// 当前 Unix 时间戳（毫秒）
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// 按字符数截断字符串，保证不会在多字节字符中间截断
///
/// 返回不超过 `max_chars` 个字符的最长前缀
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((end, _)) => &s[..end],
        None => s,
    }
}
