//! 带超时的连接读写原语。

use std::time::Duration;

use bytes::BytesMut;
use log::{debug, error, warn};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::timeout,
};

use crate::{exception::Exception, request::RawRequest};

const HEADER_END: &[u8] = b"\r\n\r\n";

/// 读取一次请求：读到空行、对端关闭写端或超过上限为止。
///
/// 每次读操作都受 `idle` 超时约束，超时直接放弃本次请求。
pub async fn read_request<R>(
    stream: &mut R,
    max_size: usize,
    idle: Duration,
    id: u128,
) -> Result<RawRequest, Exception>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = BytesMut::with_capacity(max_size.min(8192));
    let mut chunk = vec![0u8; 1024];
    loop {
        let n = match timeout(idle, stream.read(&mut chunk)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                error!("[ID{}]读取连接时遇到错误：{}", id, e);
                return Err(Exception::IoFailure);
            }
            Err(_) => {
                warn!("[ID{}]读取请求超时，已读取{}字节", id, buffer.len());
                return Err(Exception::Timeout);
            }
        };
        if n == 0 {
            if buffer.is_empty() {
                return Err(Exception::ConnectionClosed);
            }
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
        if buffer.len() > max_size {
            warn!("[ID{}]请求超过{}字节的上限", id, max_size);
            return Err(Exception::RequestTooLarge);
        }
        if contains_header_end(&buffer) {
            break;
        }
    }
    debug!("[ID{}]HTTP请求接收完毕，共{}字节", id, buffer.len());
    RawRequest::new(buffer.freeze(), max_size)
}

fn contains_header_end(buffer: &[u8]) -> bool {
    buffer.windows(HEADER_END.len()).any(|w| w == HEADER_END)
}

/// 带超时地写出全部字节。
pub async fn write_all<W>(
    stream: &mut W,
    bytes: &[u8],
    idle: Duration,
    id: u128,
) -> Result<usize, Exception>
where
    W: AsyncWrite + Unpin,
{
    match timeout(idle, stream.write_all(bytes)).await {
        Ok(Ok(())) => Ok(bytes.len()),
        Ok(Err(e)) => {
            error!("[ID{}]写入连接失败：{}", id, e);
            Err(Exception::IoFailure)
        }
        Err(_) => {
            warn!("[ID{}]写入连接超时", id);
            Err(Exception::Timeout)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_until_blank_line() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let raw = read_request(&mut server, 1024, Duration::from_secs(1), 0)
            .await
            .unwrap();
        assert_eq!(raw.as_bytes(), b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
    }

    #[tokio::test]
    async fn test_read_until_eof_without_terminator() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        client.write_all(b"GIBBERISH").await.unwrap();
        client.shutdown().await.unwrap();
        let raw = read_request(&mut server, 1024, Duration::from_secs(1), 0)
            .await
            .unwrap();
        assert_eq!(raw.as_bytes(), b"GIBBERISH");
    }

    #[tokio::test]
    async fn test_closed_before_request() {
        let (client, mut server) = tokio::io::duplex(4096);
        drop(client);
        let result = read_request(&mut server, 1024, Duration::from_secs(1), 0).await;
        assert_eq!(result.unwrap_err(), Exception::ConnectionClosed);
    }

    #[tokio::test]
    async fn test_oversized_request() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        client.write_all(&[b'a'; 2048]).await.unwrap();
        let result = read_request(&mut server, 1000, Duration::from_secs(1), 0).await;
        assert_eq!(result.unwrap_err(), Exception::RequestTooLarge);
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        let result = read_request(&mut server, 1024, Duration::from_millis(50), 0).await;
        assert_eq!(result.unwrap_err(), Exception::Timeout);
        drop(client);
    }

    #[tokio::test]
    async fn test_write_all() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let n = write_all(&mut server, b"hello", Duration::from_secs(1), 0)
            .await
            .unwrap();
        assert_eq!(n, 5);
        drop(server);
        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"hello");
    }

    #[tokio::test]
    async fn test_write_to_closed_peer() {
        let (client, mut server) = tokio::io::duplex(16);
        drop(client);
        let result = write_all(&mut server, b"hello", Duration::from_secs(1), 0).await;
        assert_eq!(result.unwrap_err(), Exception::IoFailure);
    }
}
