pub mod handlers;
pub mod streaming;

use crate::providers::routing::Gateway;
use crate::Result;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// 等待 SIGTERM 或 Ctrl+C
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("设置 Ctrl+C 信号处理失败: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("设置 SIGTERM 信号处理失败: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => warn!("收到 Ctrl+C 信号，开始优雅关闭..."),
        _ = terminate => warn!("收到 SIGTERM 信号，开始优雅关闭..."),
    }
}

fn serve_connection(stream: tokio::net::TcpStream, gateway: Arc<Gateway>) {
    let io = TokioIo::new(stream);

    tokio::spawn(async move {
        let service = service_fn(move |req| {
            let gateway = Arc::clone(&gateway);
            handlers::handle_request(req, gateway)
        });

        if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
            error!("服务连接错误: {}", e);
        }
    });
}

/// 启动 HTTP 服务器（带优雅关闭）
pub async fn start_server(gateway: Arc<Gateway>, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("llm-relay 服务器运行在 http://{}", addr);

    let (shutdown_tx, mut shutdown_rx) = watch::channel(());
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(());
    });

    loop {
        tokio::select! {
            // 等待新连接
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => serve_connection(stream, Arc::clone(&gateway)),
                    Err(e) => error!("接受连接失败: {}", e),
                }
            }
            // 等待关闭信号
            _ = shutdown_rx.changed() => {
                info!("收到关闭信号，停止接受新连接");
                break;
            }
        }
    }

    info!("服务器已优雅关闭");
    Ok(())
}

/// 启动 HTTP 服务器（仅用于测试，不监听关闭信号）
pub async fn start_server_test(gateway: Arc<Gateway>, listener: TcpListener) -> Result<()> {
    info!("llm-relay 测试服务器运行在 http://{}", listener.local_addr()?);

    loop {
        match listener.accept().await {
            Ok((stream, _)) => serve_connection(stream, Arc::clone(&gateway)),
            Err(e) => error!("接受连接失败: {}", e),
        }
    }
}
