use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// 遥测服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// 推理服务地址（不含路径）
    #[serde(default = "default_upstream_url")]
    pub upstream_url: String,

    /// Admin API 密钥（可选，启用记录查询与统计 API）
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_api_key: Option<String>,

    /// SQLite 数据库文件路径
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// 全局捕获开关
    #[serde(default = "default_true")]
    pub capture_enabled: bool,

    /// 空闲超过该时长（毫秒）后开启新会话链
    #[serde(default = "default_idle_reset_ms")]
    pub idle_reset_ms: i64,

    /// 首轮提示重复判定窗口（毫秒）
    #[serde(default = "default_duplicate_window_ms")]
    pub duplicate_window_ms: i64,

    /// 每条记录保留的最大文本字符数
    #[serde(default = "default_max_captured_chars")]
    pub max_captured_chars: usize,

    /// 上游请求超时（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// HTTP 代理地址（可选）
    /// 支持格式: http://host:port, https://host:port, socks5://host:port
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,

    /// 是否读取上游 /props 获取运行时上下文
    #[serde(default = "default_true")]
    pub runtime_probe: bool,

    #[serde(default = "default_runtime_probe_ttl_secs")]
    pub runtime_probe_ttl_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8990
}

fn default_upstream_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_db_path() -> String {
    "telemetry.db".to_string()
}

fn default_true() -> bool {
    true
}

fn default_idle_reset_ms() -> i64 {
    30 * 60 * 1000
}

fn default_duplicate_window_ms() -> i64 {
    2 * 60 * 1000
}

fn default_max_captured_chars() -> usize {
    200_000
}

fn default_request_timeout_secs() -> u64 {
    600
}

fn default_runtime_probe_ttl_secs() -> u64 {
    60
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            upstream_url: default_upstream_url(),
            admin_api_key: None,
            db_path: default_db_path(),
            capture_enabled: true,
            idle_reset_ms: default_idle_reset_ms(),
            duplicate_window_ms: default_duplicate_window_ms(),
            max_captured_chars: default_max_captured_chars(),
            request_timeout_secs: default_request_timeout_secs(),
            proxy_url: None,
            runtime_probe: true,
            runtime_probe_ttl_secs: default_runtime_probe_ttl_secs(),
        }
    }
}

impl Config {
    /// 获取默认配置文件路径
    pub fn default_config_path() -> &'static str {
        "config.json"
    }

    /// 去掉末尾斜杠的上游地址
    pub fn upstream_base(&self) -> &str {
        self.upstream_url.trim_end_matches('/')
    }

    /// 从文件加载配置
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            // 配置文件不存在，返回默认配置
            tracing::info!("配置文件不存在，使用默认配置: {}", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("读取配置文件失败: {}", path.display()))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("解析配置文件失败: {}", path.display()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("chat-telemetry-{}-{}.json", name, uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let path = temp_path("missing");
        let config = Config::load(&path).unwrap();
        assert_eq!(config.port, 8990);
        assert_eq!(config.upstream_url, "http://127.0.0.1:8080");
        assert!(config.capture_enabled);
        assert_eq!(config.idle_reset_ms, 1_800_000);
    }

    #[test]
    fn test_partial_file_uses_camel_case_and_defaults() {
        let path = temp_path("partial");
        fs::write(
            &path,
            r#"{"port": 9000, "upstreamUrl": "http://gpu:8080/", "captureEnabled": false, "adminApiKey": "k"}"#,
        )
        .unwrap();
        let config = Config::load(&path).unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(config.port, 9000);
        assert_eq!(config.upstream_base(), "http://gpu:8080");
        assert!(!config.capture_enabled);
        assert_eq!(config.admin_api_key.as_deref(), Some("k"));
        assert_eq!(config.duplicate_window_ms, 120_000);
        assert_eq!(config.db_path, "telemetry.db");
    }

    #[test]
    fn test_invalid_json_is_error() {
        let path = temp_path("invalid");
        fs::write(&path, "{ not json").unwrap();
        let result = Config::load(&path);
        fs::remove_file(&path).unwrap();
        assert!(result.is_err());
    }
}
