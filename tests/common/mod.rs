//! 集成测试共用的测试服务器与报文解析工具。

#![allow(dead_code)]

use std::{collections::HashMap, net::SocketAddr, path::Path, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

use tinyweb::{config::Config, server::handle_connection};

/// 在随机端口上启动一个只服务于 `root` 的测试服务器。
pub async fn spawn_server(root: &Path, config: Config) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let root = Arc::new(root.to_path_buf());
    let config = Arc::new(config);
    tokio::spawn(async move {
        let mut id = 0u128;
        loop {
            let (mut stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => break,
            };
            let root = Arc::clone(&root);
            let config = Arc::clone(&config);
            tokio::spawn(async move {
                handle_connection(&mut stream, Some(peer), id, &root, &config).await;
            });
            id += 1;
        }
    });
    addr
}

/// 发送原始字节并读取到服务端关闭连接为止。
pub async fn send_raw(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request).await.unwrap();
    stream.shutdown().await.unwrap();
    let mut buffer = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut buffer))
        .await
        .expect("服务端没有关闭连接")
        .unwrap();
    buffer
}

pub struct ParsedResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl ParsedResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

pub fn parse_response(raw: &[u8]) -> ParsedResponse {
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("响应中没有空行");
    let head = String::from_utf8_lossy(&raw[..split]).to_string();
    let mut lines = head.split("\r\n");

    let status = lines
        .next()
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|c| c.parse::<u16>().ok())
        .unwrap_or(0);
    let headers = lines
        .filter_map(|l| l.split_once(": "))
        .map(|(k, v)| (k.to_ascii_lowercase(), v.to_string()))
        .collect();

    ParsedResponse {
        status,
        headers,
        body: raw[split + 4..].to_vec(),
    }
}

pub async fn request(addr: SocketAddr, request: &str) -> ParsedResponse {
    parse_response(&send_raw(addr, request.as_bytes()).await)
}
