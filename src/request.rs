// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # HTTP 请求处理模块
//!
//! 该模块负责把从连接中读取的原始字节解析为强类型的 [`Request`]。它由两部分组成：
//! 1. 请求行校验器：用固定语法匹配 `METHOD SP PATH SP PROTOCOL CRLF`，并提取三个记号。
//! 2. 头部字段扫描器：逐行扫描剩余内容，只提取 `Range` 与 `If-Modified-Since`，其余头部一律忽略。
//!
//! 协议版本与方法是否受支持不在这里判断，它们属于解析器（resolver）的决策顺序。

use bytes::Bytes;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use log::{debug, error};
use regex::Regex;

use crate::{
    config::Config,
    exception::Exception,
    param::{HttpRequestMethod, HttpStatus, CRLF},
    util::parse_http_date,
};

lazy_static! {
    /// 请求行语法。方法取自固定集合，路径由字母数字、`/`、`-` 组成，
    /// 末尾可带一个 "标点 + 字母数字" 的后缀（通常是文件扩展名）。
    static ref REQUEST_LINE: Regex = Regex::new(
        r"^(GET|HEAD|POST|PUT|DELETE|TRACE|CONNECT|OPTIONS) (/[A-Za-z0-9/-]*(?:[[:punct:]][A-Za-z0-9]+)?) (HTTP/[0-9][[:punct:]][0-9])\r\n"
    )
    .unwrap();
    static ref RANGE_HEADER: Regex =
        Regex::new(r"(?i)^range:[ \t]*bytes=([0-9]*)-([0-9]*)[ \t]*$").unwrap();
    static ref IF_MODIFIED_SINCE_HEADER: Regex =
        Regex::new(r"(?i)^if-modified-since:[ \t]*(.+)$").unwrap();
}

/// 从连接中读取到的一次完整请求，长度受缓冲区上限约束。
#[derive(Debug, Clone)]
pub struct RawRequest {
    bytes: Bytes,
}

impl RawRequest {
    /// 超过 `max_size` 的请求直接判为错误，不会被截断后继续处理。
    pub fn new(bytes: impl Into<Bytes>, max_size: usize) -> Result<Self, Exception> {
        let bytes = bytes.into();
        if bytes.len() > max_size {
            return Err(Exception::RequestTooLarge);
        }
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// `Range: bytes=<start>-<end>` 中的两个端点。
///
/// 端点缺失时为 `None`，与数值 0 区分开。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeSpec {
    start: Option<u64>,
    end: Option<u64>,
}

impl RangeSpec {
    pub fn new(start: Option<u64>, end: Option<u64>) -> Self {
        Self { start, end }
    }

    /// 任一端点的数字无法表示为 u64 时，整个范围按两个端点都缺失处理，
    /// 之后会被归类为 416。
    fn from_digits(start: &str, end: &str) -> Self {
        match (parse_offset(start), parse_offset(end)) {
            (Ok(start), Ok(end)) => Self { start, end },
            _ => Self::new(None, None),
        }
    }

    pub fn start(&self) -> Option<u64> {
        self.start
    }

    pub fn end(&self) -> Option<u64> {
        self.end
    }

    /// 只看语法形式的分类，不涉及文件大小。
    pub fn classify(&self) -> HttpStatus {
        match (self.start, self.end) {
            (Some(start), Some(end)) if start < end => HttpStatus::PartialContent,
            (None, Some(end)) if end > 0 => HttpStatus::PartialContent,
            (Some(_), None) => HttpStatus::PartialContent,
            _ => HttpStatus::RangeNotSatisfiable,
        }
    }
}

fn parse_offset(digits: &str) -> Result<Option<u64>, std::num::ParseIntError> {
    if digits.is_empty() {
        return Ok(None);
    }
    digits.parse::<u64>().map(Some)
}

/// 请求行中提取出的三个记号。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine<'a> {
    pub method: HttpRequestMethod,
    pub path: &'a str,
    pub protocol: &'a str,
    /// 请求行（含 CRLF）在缓冲区中的结束位置
    pub end: usize,
}

/// 校验请求的第一行。匹配必须从偏移 0 开始。
pub fn validate_request_line(text: &str) -> Result<RequestLine<'_>, Exception> {
    let captures = REQUEST_LINE
        .captures(text)
        .ok_or(Exception::MalformedRequestLine)?;
    let whole = captures.get(0).ok_or(Exception::MalformedRequestLine)?;
    if whole.start() != 0 {
        return Err(Exception::MalformedRequestLine);
    }
    let method = captures
        .get(1)
        .and_then(|m| HttpRequestMethod::from_token(m.as_str()))
        .ok_or(Exception::MalformedRequestLine)?;
    let path = captures.get(2).ok_or(Exception::MalformedRequestLine)?;
    let protocol = captures.get(3).ok_or(Exception::MalformedRequestLine)?;
    Ok(RequestLine {
        method,
        path: path.as_str(),
        protocol: protocol.as_str(),
        end: whole.end(),
    })
}

/// 头部扫描结果：只保留服务器关心的两个字段。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeaderFields {
    pub range: Option<RangeSpec>,
    pub if_modified_since: Option<DateTime<Utc>>,
}

impl HeaderFields {
    /// 一直扫描到缓冲区末尾，不要求空行结束。同名头部出现多次时以最后一次为准。
    pub fn scan(text: &str) -> Self {
        let mut fields = Self::default();
        for line in text.split(CRLF) {
            if let Some(captures) = IF_MODIFIED_SINCE_HEADER.captures(line) {
                if let Some(date) = captures.get(1).and_then(|m| parse_http_date(m.as_str())) {
                    fields.if_modified_since = Some(date);
                }
            } else if let Some(captures) = RANGE_HEADER.captures(line) {
                let start = captures.get(1).map_or("", |m| m.as_str());
                let end = captures.get(2).map_or("", |m| m.as_str());
                fields.range = Some(RangeSpec::from_digits(start, end));
            }
        }
        fields
    }
}

/// 表示一个解析完成的 HTTP 请求，创建后不再改变。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// HTTP 请求方法
    method: HttpRequestMethod,
    /// 请求行中的原始路径
    path: String,
    /// 实际要访问的资源路径（`/` 结尾时补上首页文件名）
    target: String,
    /// 请求行中的协议记号，例如 `HTTP/1.1`
    version: String,
    /// 范围请求参数
    range: Option<RangeSpec>,
    /// 条件请求的时间戳
    if_modified_since: Option<DateTime<Utc>>,
    /// 路径是否落在可执行资源前缀之下
    is_cgi: bool,
}

impl Request {
    /// 从原始请求构建 `Request`。
    ///
    /// # 错误处理
    /// 请求不是 UTF-8 时返回 `RequestIsNotUtf8`，请求行不符合语法时返回 `MalformedRequestLine`。
    /// 两者都会被解析器映射为 400。
    pub fn try_from(raw: &RawRequest, id: u128, config: &Config) -> Result<Self, Exception> {
        let text = match std::str::from_utf8(raw.as_bytes()) {
            Ok(text) => text,
            Err(_) => {
                error!("[ID{}]无法解析HTTP请求：不是合法的UTF-8", id);
                return Err(Exception::RequestIsNotUtf8);
            }
        };

        let line = match validate_request_line(text) {
            Ok(line) => line,
            Err(e) => {
                let first = text.split(CRLF).next().unwrap_or_default();
                error!("[ID{}]HTTP请求行格式不正确：{:?}", id, first);
                return Err(e);
            }
        };

        let fields = HeaderFields::scan(&text[line.end..]);
        debug!(
            "[ID{}]请求行：{} {} {}，Range：{:?}，If-Modified-Since：{:?}",
            id, line.method, line.path, line.protocol, fields.range, fields.if_modified_since
        );

        let target = if line.path.ends_with('/') {
            [line.path, config.index_file()].concat()
        } else {
            line.path.to_string()
        };
        let is_cgi = under_prefix(line.path, config.cgi_prefix());

        Ok(Self {
            method: line.method,
            path: line.path.to_string(),
            target,
            version: line.protocol.to_string(),
            range: fields.range,
            if_modified_since: fields.if_modified_since,
            is_cgi,
        })
    }
}

/// 按路径片段比较前缀（不区分大小写），`/cgi-binary` 不算在 `/cgi-bin` 之下。
fn under_prefix(path: &str, prefix: &str) -> bool {
    let path = path.to_ascii_lowercase();
    let prefix = prefix.trim_end_matches('/').to_ascii_lowercase();
    path == prefix || path.starts_with(&format!("{}/", prefix))
}

impl Request {
    pub fn method(&self) -> HttpRequestMethod {
        self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn range(&self) -> Option<RangeSpec> {
        self.range
    }

    pub fn if_modified_since(&self) -> Option<DateTime<Utc>> {
        self.if_modified_since
    }

    pub fn is_cgi(&self) -> bool {
        self.is_cgi
    }

    pub fn is_head(&self) -> bool {
        self.method == HttpRequestMethod::Head
    }
}
