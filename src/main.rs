mod capture;
mod chain;
mod common;
mod http_client;
mod model;
mod record_store;
mod relay;
mod stats;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use capture::ParserConfig;
use chain::CorrelatorConfig;
use model::config::Config;
use record_store::{RecordSink, create_record_router};
use relay::{RelayState, RuntimeProbe, cors_layer, create_relay_router};

/// Chat completion 遥测转发服务
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = Config::default_config_path())]
    config: String,

    /// 覆盖监听地址
    #[arg(long)]
    host: Option<String>,

    /// 覆盖监听端口
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = Config::load(&args.config)
        .with_context(|| format!("加载配置失败: {}", args.config))?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    let client = http_client::build_client(config.proxy_url.as_deref(), config.request_timeout_secs)
        .context("构建 HTTP Client 失败")?;

    let sink = Arc::new(RecordSink::new(
        &config.db_path,
        CorrelatorConfig {
            idle_reset_ms: config.idle_reset_ms,
            duplicate_window_ms: config.duplicate_window_ms,
        },
    )?);
    tracing::info!("记录数据库: {}", config.db_path);

    let upstream_base = config.upstream_base().to_string();
    let runtime = Arc::new(RuntimeProbe::new(
        client.clone(),
        &upstream_base,
        config.runtime_probe,
        config.runtime_probe_ttl_secs,
    ));

    let mut app = create_relay_router(RelayState {
        client,
        upstream_base: upstream_base.clone(),
        capture_enabled: config.capture_enabled,
        parser_config: ParserConfig {
            max_captured_chars: config.max_captured_chars,
        },
        sink: sink.clone(),
        runtime,
    });

    match config.admin_api_key.as_deref().filter(|k| !k.trim().is_empty()) {
        Some(key) => {
            app = app.nest("/api/admin", create_record_router(key, sink.clone()));
            tracing::info!("Admin API 已启用: /api/admin");
        }
        None => tracing::info!("未配置 adminApiKey，Admin API 未启用"),
    }

    let app = app.layer(cors_layer());

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("监听 {} 失败", addr))?;
    tracing::info!("转发服务已启动: http://{} -> {}", addr, upstream_base);
    if !config.capture_enabled {
        tracing::warn!("捕获已关闭，仅转发请求");
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("监听退出信号失败: {}", e);
            }
            tracing::info!("收到退出信号，停止接收新请求");
        })
        .await?;

    // 等待已提交的记录落盘
    sink.flush().await;
    tracing::info!(contexts = sink.tracked_contexts(), "记录已落盘，服务退出");
    Ok(())
}
