use anyhow::Context;
use clap::Parser;
use llm_relay::config::Config;
use llm_relay::providers::routing::Gateway;
use llm_relay::server;
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "llm-relay")]
#[command(about = "OpenAI 兼容的多厂商 LLM 转发网关", long_about = None)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "llm-relay.yaml")]
    config: String,

    /// 监听地址
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    bind: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = Config::from_file(&args.config)
        .with_context(|| format!("加载配置文件失败: {}", args.config))?;

    let addr: SocketAddr = args
        .bind
        .parse()
        .with_context(|| format!("无效的监听地址: {}", args.bind))?;

    let gateway = Arc::new(Gateway::from_config(&config).context("初始化网关失败")?);

    server::start_server(gateway, addr).await?;

    Ok(())
}
