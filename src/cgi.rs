// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 外部程序（CGI）调度模块
//!
//! 服务器只发送状态行以及 `Server`、`Date` 两个字段，之后把外部程序的标准输出原样转发给客户端，
//! 由程序自己补全其余头部与空行。程序的退出状态不会改变已经发出的状态行。
//!
//! 转发的每次写入都受连接空闲超时约束。写入失败时立即停止转发并结束外部程序。
//! HEAD 请求只转发程序输出的头部块，其余输出被读取后丢弃。

use std::{
    env,
    net::SocketAddr,
    path::{Path, PathBuf},
    process::Stdio,
};

use log::{debug, error, warn};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite},
    process::Command,
};

use crate::{
    config::Config,
    exception::Exception,
    param::SERVER_NAME,
    request::Request,
    response::Response,
    transport,
};

const FALLBACK_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// 在程序输出中定位头部块的结束位置（`\r\n\r\n` 或 `\n\n`），可以跨块匹配。
#[derive(Debug)]
struct HeaderBoundary {
    tail: Vec<u8>,
}

impl HeaderBoundary {
    /// 前导部分以 CRLF 结尾，程序只输出一个空行时头部块即告结束。
    fn new() -> Self {
        Self {
            tail: b"\r\n".to_vec(),
        }
    }

    /// 返回本块中属于头部块的字节数；整块都还在头部块内时返回 `None`。
    fn feed(&mut self, chunk: &[u8]) -> Option<usize> {
        let mut joined = std::mem::take(&mut self.tail);
        let offset = joined.len();
        joined.extend_from_slice(chunk);

        let crlf = find(&joined, b"\r\n\r\n").map(|i| i + 4);
        let lf = find(&joined, b"\n\n").map(|i| i + 2);
        match crlf.into_iter().chain(lf).min() {
            Some(end) => Some(end.saturating_sub(offset)),
            None => {
                let keep = joined.len().min(3);
                self.tail = joined[joined.len() - keep..].to_vec();
                None
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

async fn read_stderr<R: AsyncRead + Unpin>(mut stderr: R) -> String {
    let mut buffer = Vec::new();
    if let Err(e) = stderr.read_to_end(&mut buffer).await {
        warn!("读取外部程序的标准错误失败：{}", e);
    }
    String::from_utf8_lossy(&buffer).trim_end().to_string()
}

/// 一个连接上的外部程序调度器。
pub struct Gateway<'a> {
    root: &'a Path,
    config: &'a Config,
    peer: Option<SocketAddr>,
}

impl<'a> Gateway<'a> {
    pub fn new(root: &'a Path, config: &'a Config, peer: Option<SocketAddr>) -> Self {
        Self { root, config, peer }
    }

    /// 构造外部程序的运行环境。继承的环境变量全部清空，只保留 `PATH`。
    ///
    /// `script` 与 `root` 必须是绝对路径：程序在脚本所在目录中启动。
    fn command(&self, script: &Path, root: &Path, request: &Request) -> Command {
        let mut cmd = Command::new(script);
        cmd.env_clear();
        cmd.env(
            "PATH",
            env::var_os("PATH").unwrap_or_else(|| FALLBACK_PATH.into()),
        );
        cmd.env("GATEWAY_INTERFACE", "CGI/1.1");
        cmd.env("SERVER_SOFTWARE", SERVER_NAME);
        cmd.env("SERVER_PROTOCOL", request.version());
        cmd.env("SERVER_PORT", self.config.port().to_string());
        cmd.env("REQUEST_METHOD", request.method().to_string());
        cmd.env("REQUEST_URI", request.path());
        cmd.env("SCRIPT_NAME", request.path());
        cmd.env("SCRIPT_FILENAME", script);
        cmd.env("DOCUMENT_ROOT", root);
        cmd.env("QUERY_STRING", "");
        if let Some(addr) = self.peer {
            cmd.env("REMOTE_ADDR", addr.ip().to_string());
            cmd.env("REMOTE_PORT", addr.port().to_string());
        }
        if let Some(dir) = script.parent() {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }

    async fn absolute(path: &Path, id: u128) -> Result<PathBuf, Exception> {
        tokio::fs::canonicalize(path).await.map_err(|e| {
            error!("[ID{}]无法解析{}的绝对路径：{}", id, path.display(), e);
            Exception::CgiExecuteFailed
        })
    }

    /// 执行外部程序并把输出转发到连接上。
    ///
    /// 先发送 [`Response::external_preamble`]，再转发标准输出直到程序关闭它。
    /// `sent` 累计实际写出的字节数（含前导部分）。
    ///
    /// # 错误处理
    /// - 程序无法启动：`CgiExecuteFailed`，此时尚未向连接写入任何内容
    /// - 转发失败：`IoFailure` 或 `Timeout`，程序会被结束
    /// - 程序以非零状态退出：`CgiExitFailure`，输出已经全部转发
    pub async fn dispatch<W>(
        &self,
        stream: &mut W,
        script: &Path,
        request: &Request,
        id: u128,
        sent: &mut u64,
    ) -> Result<(), Exception>
    where
        W: AsyncWrite + Unpin,
    {
        let script = Self::absolute(script, id).await?;
        let root = Self::absolute(self.root, id).await?;
        let mut child = self
            .command(&script, &root, request)
            .spawn()
            .map_err(|e| {
                error!("[ID{}]无法启动外部程序{}：{}", id, script.display(), e);
                Exception::CgiExecuteFailed
            })?;
        debug!("[ID{}]已启动外部程序{}", id, script.display());

        let (mut stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => (stdout, stderr),
            _ => {
                error!("[ID{}]无法获取外部程序的输出管道", id);
                return Err(Exception::CgiExecuteFailed);
            }
        };
        let stderr = tokio::spawn(read_stderr(stderr));

        let forwarded = self
            .forward(&mut stdout, stream, request.is_head(), id, sent)
            .await;
        drop(stdout);
        if let Err(e) = &forwarded {
            warn!("[ID{}]转发中断（{}），结束外部程序", id, e);
            if let Err(e) = child.start_kill() {
                debug!("[ID{}]外部程序已经退出：{}", id, e);
            }
        }

        let status = child.wait().await;
        match stderr.await {
            Ok(text) if !text.is_empty() => warn!("[ID{}]外部程序的标准错误输出：{}", id, text),
            Ok(_) => {}
            Err(e) => warn!("[ID{}]读取标准错误的任务失败：{}", id, e),
        }
        forwarded?;

        match status {
            Ok(status) if status.success() => {
                debug!("[ID{}]外部程序正常退出，共发送{}字节", id, sent);
                Ok(())
            }
            Ok(status) => {
                error!("[ID{}]外部程序异常退出：{}", id, status);
                Err(Exception::CgiExitFailure)
            }
            Err(e) => {
                error!("[ID{}]等待外部程序退出失败：{}", id, e);
                Err(Exception::CgiExitFailure)
            }
        }
    }

    /// 发送前导部分并按块转发标准输出。`headonly` 时头部块之后的输出只读取不发送。
    async fn forward<R, W>(
        &self,
        stdout: &mut R,
        stream: &mut W,
        headonly: bool,
        id: u128,
        sent: &mut u64,
    ) -> Result<(), Exception>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let idle = self.config.timeout();
        let preamble = Response::external_preamble();
        *sent += transport::write_all(stream, &preamble, idle, id).await? as u64;

        let mut boundary = headonly.then(HeaderBoundary::new);
        let mut buffer = vec![0u8; self.config.chunk_size().max(1)];
        loop {
            let n = stdout.read(&mut buffer).await.map_err(|e| {
                error!("[ID{}]读取外部程序输出失败：{}", id, e);
                Exception::IoFailure
            })?;
            if n == 0 {
                return Ok(());
            }
            let chunk = match boundary.as_mut().map(|b| b.feed(&buffer[..n])) {
                Some(Some(end)) => {
                    let end = end.min(n);
                    *sent += transport::write_all(stream, &buffer[..end], idle, id).await? as u64;
                    break;
                }
                _ => &buffer[..n],
            };
            *sent += transport::write_all(stream, chunk, idle, id).await? as u64;
        }

        let discarded = tokio::io::copy(stdout, &mut tokio::io::sink())
            .await
            .map_err(|e| {
                error!("[ID{}]读取外部程序输出失败：{}", id, e);
                Exception::IoFailure
            })?;
        debug!("[ID{}]HEAD请求，丢弃外部程序输出的{}字节", id, discarded);
        Ok(())
    }
}
