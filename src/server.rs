// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 连接处理与监听循环
//!
//! 每个连接只处理一个请求：读取 → 解析 → 决策 → 发送响应（或交给外部程序）→ 关闭。
//! 连接之间不共享任何可变状态。

use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use log::{debug, error, info, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::TcpListener,
    signal,
    time::sleep,
};

use crate::{
    access_log::AccessRecord,
    cgi::Gateway,
    config::Config,
    exception::Exception,
    request::Request,
    resolver::{FsStat, Resolution, Resolver},
    response::{self, Response},
    transport,
};

/// 处理一个连接上的唯一请求，返回写入访问日志的记录。
///
/// 连接在请求到达之前就被关闭、读取超时或出现读错误时不发送任何响应，返回 `None`。
pub async fn handle_connection<S>(
    stream: &mut S,
    peer: Option<SocketAddr>,
    id: u128,
    root: &Path,
    config: &Config,
) -> Option<AccessRecord>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let start_time = Instant::now();
    let raw = transport::read_request(stream, config.max_request_size(), config.timeout(), id).await;

    let (request, resolution) = match raw {
        Ok(raw) => match Request::try_from(&raw, id, config) {
            Ok(request) => {
                let resolution = Resolver::new(root, &FsStat).resolve(&request, id);
                (Some(request), resolution)
            }
            Err(e) => (None, Resolution::rejected(e)),
        },
        Err(Exception::RequestTooLarge) => (None, Resolution::rejected(Exception::RequestTooLarge)),
        Err(e) => {
            debug!("[ID{}]未收到完整请求（{}），直接关闭连接", id, e);
            return None;
        }
    };
    debug!(
        "[ID{}]请求决策完成：{}，用时{}ms",
        id,
        resolution.outcome.status(),
        start_time.elapsed().as_millis()
    );

    let mut record = AccessRecord::new(peer, request.as_ref());
    let mut sent = 0u64;

    match (&request, resolution.file_path.as_deref()) {
        (Some(request), Some(script)) if resolution.outcome.dispatch_external() => {
            record.set_status(resolution.outcome.status().code());
            let gateway = Gateway::new(root, config, peer);
            if let Err(e) = gateway.dispatch(stream, script, request, id, &mut sent).await {
                if sent == 0 {
                    // 还没有发出任何内容，可以改为 500 错误页
                    let fallback = Resolution::rejected(e);
                    let response = Response::from_resolution(Some(request), &fallback, id);
                    record.set_status(response.status().code());
                    if let Ok(n) =
                        transport::write_all(stream, &response.as_bytes(), config.timeout(), id).await
                    {
                        sent += n as u64;
                    }
                } else {
                    warn!("[ID{}]外部程序处理失败：{}", id, e);
                }
            }
        }
        _ => {
            let response = Response::from_resolution(request.as_ref(), &resolution, id);
            record.set_status(response.status().code());
            if let Err(e) = send_response(stream, &response, config, id, &mut sent).await {
                warn!("[ID{}]响应发送中断（{}），已发送{}字节", id, e, sent);
            }
        }
    }

    if let Err(e) = stream.shutdown().await {
        debug!("[ID{}]关闭连接时遇到错误：{}", id, e);
    }
    record.set_bytes(sent);
    record.log();
    debug!(
        "[ID{}]连接处理完毕，服务端用时{}ms",
        id,
        start_time.elapsed().as_millis()
    );
    Some(record)
}

async fn send_response<W>(
    stream: &mut W,
    response: &Response,
    config: &Config,
    id: u128,
    sent: &mut u64,
) -> Result<(), Exception>
where
    W: AsyncWrite + Unpin,
{
    let head = response.as_bytes();
    *sent += transport::write_all(stream, &head, config.timeout(), id).await? as u64;
    if let Some(span) = response.body() {
        response::send_body(stream, span, config.chunk_size(), config.timeout(), id, sent).await?;
    }
    stream.flush().await.map_err(|e| {
        error!("[ID{}]刷新连接失败：{}", id, e);
        Exception::IoFailure
    })
}

/// 绑定端口并持续接受连接，收到 Ctrl-C 后停止接受新连接并等待已有连接结束。
pub async fn run(config: Config, root: PathBuf) -> Result<(), Exception> {
    let port = config.port();
    let address = match config.local() {
        true => Ipv4Addr::new(127, 0, 0, 1),
        false => Ipv4Addr::new(0, 0, 0, 0),
    };
    let listener = TcpListener::bind(SocketAddrV4::new(address, port))
        .await
        .map_err(|e| {
            error!("无法绑定{}:{}，错误：{}", address, port, e);
            Exception::IoFailure
        })?;
    info!("服务端开始在{}:{}上监听Socket连接", address, port);
    info!("www root: {}", root.display());

    let config = Arc::new(config);
    let root = Arc::new(root);
    let active_connection = Arc::new(AtomicU32::new(0));
    let mut id: u128 = 0;

    loop {
        let (mut stream, addr) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("接受连接失败：{}", e);
                    continue;
                }
            },
            _ = signal::ctrl_c() => {
                info!("收到停机信号，不再接受新连接");
                break;
            }
        };
        debug!("[ID{}]TCP连接已建立：{}", id, addr);

        let config = Arc::clone(&config);
        let root = Arc::clone(&root);
        let active_connection = Arc::clone(&active_connection);
        tokio::spawn(async move {
            active_connection.fetch_add(1, Ordering::SeqCst);
            handle_connection(&mut stream, Some(addr), id, &root, &config).await;
            active_connection.fetch_sub(1, Ordering::SeqCst);
        });
        id += 1;
    }

    let deadline = Instant::now() + config.timeout();
    while active_connection.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
        debug!(
            "等待{}个连接处理完毕",
            active_connection.load(Ordering::SeqCst)
        );
        sleep(Duration::from_millis(100)).await;
    }
    let remaining = active_connection.load(Ordering::SeqCst);
    if remaining > 0 {
        warn!("仍有{}个连接未结束，强制退出", remaining);
    }
    info!("服务端已停止，共处理{}个连接", id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn exchange(root: &Path, request: &[u8]) -> (Option<AccessRecord>, String) {
        let config = Config::new().with_timeout_secs(2);
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        client.write_all(request).await.unwrap();
        client.shutdown().await.unwrap();
        let record = handle_connection(&mut server, None, 0, root, &config).await;
        drop(server);
        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        (record, String::from_utf8_lossy(&received).to_string())
    }

    #[tokio::test]
    async fn test_serves_file_and_records_bytes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello world").unwrap();

        let (record, text) = exchange(dir.path(), b"GET /a.txt HTTP/1.1\r\n\r\n").await;
        let record = record.unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("\r\n\r\nhello world"));
        assert_eq!(record.status(), 200);
        assert_eq!(record.bytes(), text.len() as u64);
    }

    #[tokio::test]
    async fn test_rejected_request_is_answered() {
        let dir = tempfile::tempdir().unwrap();
        let (record, text) = exchange(dir.path(), b"GIBBERISH").await;
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert_eq!(record.unwrap().status(), 400);
    }

    #[tokio::test]
    async fn test_closed_connection_gets_no_response() {
        let dir = tempfile::tempdir().unwrap();
        let (record, text) = exchange(dir.path(), b"").await;
        assert!(record.is_none());
        assert!(text.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unstartable_program_falls_back_to_500() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let cgi_dir = dir.path().join("cgi-bin");
        std::fs::create_dir(&cgi_dir).unwrap();
        let script = cgi_dir.join("broken.sh");
        std::fs::write(&script, "#!/nonexistent/interpreter\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let (record, text) = exchange(dir.path(), b"GET /cgi-bin/broken.sh HTTP/1.1\r\n\r\n").await;
        assert!(text.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert_eq!(record.unwrap().status(), 500);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_program_runs_under_relative_root() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::Builder::new().prefix("www").tempdir_in(".").unwrap();
        let root = dir.path().strip_prefix(".").unwrap_or(dir.path()).to_path_buf();
        assert!(root.is_relative());
        let cgi_dir = root.join("cgi-bin");
        std::fs::create_dir(&cgi_dir).unwrap();
        let script = cgi_dir.join("hello.sh");
        std::fs::write(&script, "#!/bin/sh\nprintf 'Content-Type: text/plain\\r\\n\\r\\nhello'\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let (record, text) = exchange(&root, b"GET /cgi-bin/hello.sh HTTP/1.1\r\n\r\n").await;
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{}", text);
        assert!(text.ends_with("\r\n\r\nhello"));
        assert_eq!(record.unwrap().status(), 200);
    }
}
