// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # HTTP 响应组装模块
//!
//! 把 [`Resolution`] 渲染为状态行与头部块，并负责把文件的（部分）内容按块写回连接。

use crate::{
    param::*,
    request::Request,
    resolver::{Resolution, ResourceMetadata},
    transport,
    util::{format_file_size, format_http_date, mime_for_path, HtmlBuilder},
};

use bytes::Bytes;
use chrono::prelude::*;
use log::{debug, warn};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt, AsyncWrite},
};

use std::{
    io::SeekFrom,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::exception::Exception;

/// 需要从文件中发送的闭区间 `[start, end]`。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodySpan {
    pub path: PathBuf,
    pub start: u64,
    pub end: u64,
}

impl BodySpan {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    version: HttpVersion,
    status: HttpStatus,
    date: DateTime<Utc>,
    server_name: String,
    content_type: Option<String>,
    content_length: Option<u64>,
    last_modified: Option<DateTime<Utc>>,
    accept_ranges: Option<String>,
    content_range: Option<String>,
    location: Option<String>,
    content: Option<Bytes>,
    body: Option<BodySpan>,
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl Response {
    pub fn new() -> Self {
        Self {
            version: HttpVersion::V1_1,
            status: HttpStatus::Ok,
            date: Utc::now(),
            server_name: SERVER_NAME.to_string(),
            content_type: None,
            content_length: None,
            last_modified: None,
            accept_ranges: None,
            content_range: None,
            location: None,
            content: None,
            body: None,
        }
    }

    fn set_code(&mut self, status: HttpStatus) -> &mut Self {
        self.status = status;
        self
    }

    /// 根据决策结果组装响应。
    ///
    /// `request` 在请求未能解析时为 `None`。HEAD 请求得到与 GET 相同的头部，但不带响应体。
    pub fn from_resolution(request: Option<&Request>, resolution: &Resolution, id: u128) -> Self {
        let outcome = &resolution.outcome;
        let status = outcome.status();
        let headonly = request.is_some_and(Request::is_head);
        let mut response = Self::new();
        response.set_code(status);

        match (status, resolution.metadata, resolution.file_path.as_deref()) {
            (HttpStatus::Ok, Some(meta), Some(path)) => {
                response.fill_file_headers(path, &meta);
                response.content_length = Some(meta.size);
                response.body = Some(BodySpan {
                    path: path.to_path_buf(),
                    start: 0,
                    end: meta.size.saturating_sub(1),
                })
                .filter(|_| meta.size > 0);
            }
            (HttpStatus::PartialContent, Some(meta), Some(path)) => {
                response.fill_file_headers(path, &meta);
                match outcome.byte_span(meta.size) {
                    Some((start, end)) => {
                        response.content_range =
                            Some(format!("bytes {}-{}/{}", start, end, meta.size));
                        response.content_length = Some(end - start + 1);
                        response.body = Some(BodySpan {
                            path: path.to_path_buf(),
                            start,
                            end,
                        });
                    }
                    None => {
                        warn!("[ID{}]部分内容响应缺少有效的字节范围，改为500", id);
                        response.set_code(HttpStatus::InternalServerError);
                        response.set_error_page();
                    }
                }
            }
            (HttpStatus::MovedPermanently, _, _) => {
                let path = request.map_or("/", Request::path);
                response.location = Some([path, "/"].concat());
                response.content_length = Some(0);
            }
            (HttpStatus::NotModified, Some(meta), _) => {
                response.last_modified = Some(meta.modified);
            }
            (HttpStatus::RangeNotSatisfiable, meta, _) => {
                if let Some(meta) = meta {
                    response.content_range = Some(format!("bytes */{}", meta.size));
                }
                response.set_error_page();
            }
            (status, _, _) if status.is_error() => {
                response.set_error_page();
            }
            (status, _, _) => {
                warn!("[ID{}]{}响应缺少资源元数据，改为500", id, status);
                response.set_code(HttpStatus::InternalServerError);
                response.set_error_page();
            }
        }

        if headonly {
            response.content = None;
            response.body = None;
        }
        debug!(
            "[ID{}]响应：{}，Content-Length：{:?}，Content-Range：{:?}",
            id, response.status, response.content_length, response.content_range
        );
        response
    }

    fn fill_file_headers(&mut self, path: &Path, meta: &ResourceMetadata) {
        self.content_type = Some(mime_for_path(path).to_string());
        self.last_modified = Some(meta.modified);
        self.accept_ranges = Some("bytes".to_string());
    }

    fn set_error_page(&mut self) {
        let page = HtmlBuilder::from_status(self.status, None).build();
        self.content_type = Some("text/html;charset=utf-8".to_string());
        self.content_length = Some(page.len() as u64);
        self.content = Some(Bytes::from(page));
    }

    fn status_line(&self) -> String {
        [
            self.version.to_string().as_str(),
            " ",
            &self.status.code().to_string(),
            " ",
            self.status.reason(),
            CRLF,
        ]
        .concat()
    }

    /// 状态行与固定字段（`Server`、`Date`），每行以 CRLF 结尾。
    fn preamble(&self) -> String {
        [
            self.status_line().as_str(),
            "Server: ",
            &self.server_name,
            CRLF,
            "Date: ",
            &format_http_date(&self.date),
            CRLF,
        ]
        .concat()
    }

    /// 交给外部程序之前发送的部分：没有结束头部块的空行，剩余头部由程序自己输出。
    pub fn external_preamble() -> Bytes {
        let mut response = Self::new();
        response.set_code(HttpStatus::Ok);
        Bytes::from(response.preamble())
    }

    /// 完整的头部块，以空行结束。
    pub fn header_bytes(&self) -> Bytes {
        let optional = |name: &str, value: Option<String>| match value {
            Some(v) => [name, ": ", &v, CRLF].concat(),
            None => String::new(),
        };
        let header = [
            self.preamble(),
            optional("Content-Length", self.content_length.map(|l| l.to_string())),
            optional("Content-Type", self.content_type.clone()),
            optional("Last-Modified", self.last_modified.as_ref().map(format_http_date)),
            optional("Accept-Ranges", self.accept_ranges.clone()),
            optional("Content-Range", self.content_range.clone()),
            optional("Location", self.location.clone()),
            ["Connection: close", CRLF].concat(),
            CRLF.to_string(),
        ]
        .concat();
        Bytes::from(header)
    }

    /// 头部块加上内联内容（错误页）。文件内容不在这里，需要用 [`send_body`] 发送。
    pub fn as_bytes(&self) -> Vec<u8> {
        [
            &self.header_bytes()[..],
            match &self.content {
                Some(c) => c,
                None => b"",
            },
        ]
        .concat()
    }
}

impl Response {
    pub fn status(&self) -> HttpStatus {
        self.status
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub fn body(&self) -> Option<&BodySpan> {
        self.body.as_ref()
    }
}

/// 从 `span.start` 开始按块读取文件并写入连接，直到 `span.end`（含）。
///
/// 读到的字节少于预期（文件在此期间被截短）时停止，不重试。
/// 已发送的字节数累计到 `sent` 中，出错时调用方仍能据此记录日志。
pub async fn send_body<W>(
    stream: &mut W,
    span: &BodySpan,
    chunk_size: usize,
    idle: Duration,
    id: u128,
    sent: &mut u64,
) -> Result<(), Exception>
where
    W: AsyncWrite + Unpin,
{
    let mut file = File::open(&span.path).await.map_err(|e| {
        warn!("[ID{}]无法打开文件{}：{}", id, span.path.display(), e);
        Exception::IoFailure
    })?;
    file.seek(SeekFrom::Start(span.start)).await.map_err(|e| {
        warn!("[ID{}]无法定位到文件位置{}：{}", id, span.start, e);
        Exception::IoFailure
    })?;

    let mut buffer = vec![0u8; chunk_size.max(1)];
    let mut remaining = span.len();
    debug!(
        "[ID{}]开始发送{}的{}-{}（{}）",
        id,
        span.path.display(),
        span.start,
        span.end,
        format_file_size(remaining)
    );
    while remaining > 0 {
        let want = remaining.min(buffer.len() as u64) as usize;
        let n = file.read(&mut buffer[..want]).await.map_err(|e| {
            warn!("[ID{}]读取文件失败：{}", id, e);
            Exception::IoFailure
        })?;
        if n == 0 {
            warn!("[ID{}]文件提前结束，还差{}字节", id, remaining);
            break;
        }
        transport::write_all(stream, &buffer[..n], idle, id).await?;
        *sent += n as u64;
        remaining -= n as u64;
    }
    Ok(())
}
