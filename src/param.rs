// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 协议参数与常量模块
//!
//! 该模块定义了 `tinyweb` 遵循的 HTTP 协议相关常量和数据结构，包括：
//! - 服务器会产生的全部状态码及其原因短语（Reason Phrase）。
//! - 文件后缀名到 MIME 类型的映射表。
//! - HTTP 方法与版本的强类型枚举。

use std::collections::HashMap;
use std::fmt;

use lazy_static::lazy_static;

/// 服务器名称标识，用于 HTTP 响应头的 `Server` 字段
pub const SERVER_NAME: &str = concat!("tinyweb/", env!("CARGO_PKG_VERSION"));

/// HTTP 协议规定的换行符（Carriage Return Line Feed）
pub const CRLF: &str = "\r\n";

/// 服务器唯一支持的协议版本标记
pub const PROTOCOL_HTTP_1_1: &str = "HTTP/1.1";

/// 默认的配置文件路径
pub const DEFAULT_CONFIG: &str = "config/development.toml";

/// log4rs 配置文件路径
pub const LOG_CONFIG: &str = "config/log4rs.yaml";

/// 访问日志使用的 log target
pub const ACCESS_LOG_TARGET: &str = "access";

/// 无法识别后缀时使用的 MIME 类型
pub const DEFAULT_MIME: &str = "application/octet-stream";

/// 服务器可能返回的状态码。
///
/// 这是一个封闭集合：请求处理管线只会产生下面这些状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpStatus {
    Ok,
    PartialContent,
    MovedPermanently,
    NotModified,
    BadRequest,
    Forbidden,
    NotFound,
    RangeNotSatisfiable,
    InternalServerError,
    NotImplemented,
}

impl HttpStatus {
    pub fn code(&self) -> u16 {
        match self {
            HttpStatus::Ok => 200,
            HttpStatus::PartialContent => 206,
            HttpStatus::MovedPermanently => 301,
            HttpStatus::NotModified => 304,
            HttpStatus::BadRequest => 400,
            HttpStatus::Forbidden => 403,
            HttpStatus::NotFound => 404,
            HttpStatus::RangeNotSatisfiable => 416,
            HttpStatus::InternalServerError => 500,
            HttpStatus::NotImplemented => 501,
        }
    }

    /// 标准原因短语，参考 [RFC 9110](https://www.rfc-editor.org/rfc/rfc9110.html)。
    pub fn reason(&self) -> &'static str {
        match self {
            HttpStatus::Ok => "OK",
            HttpStatus::PartialContent => "Partial Content",
            HttpStatus::MovedPermanently => "Moved Permanently",
            HttpStatus::NotModified => "Not Modified",
            HttpStatus::BadRequest => "Bad Request",
            HttpStatus::Forbidden => "Forbidden",
            HttpStatus::NotFound => "Not Found",
            HttpStatus::RangeNotSatisfiable => "Range Not Satisfiable",
            HttpStatus::InternalServerError => "Internal Server Error",
            HttpStatus::NotImplemented => "Not Implemented",
        }
    }

    /// 4xx 与 5xx
    pub fn is_error(&self) -> bool {
        self.code() >= 400
    }
}

impl fmt::Display for HttpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code(), self.reason())
    }
}

/// 请求行语法所识别的 HTTP 方法。
///
/// 识别与支持是两回事：只有 `GET` 和 `HEAD` 会被真正处理，其余方法得到 501。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpRequestMethod {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Trace,
    Connect,
    Options,
}

impl HttpRequestMethod {
    /// 从请求行中的方法记号构造枚举，记号区分大小写。
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "GET" => Some(HttpRequestMethod::Get),
            "HEAD" => Some(HttpRequestMethod::Head),
            "POST" => Some(HttpRequestMethod::Post),
            "PUT" => Some(HttpRequestMethod::Put),
            "DELETE" => Some(HttpRequestMethod::Delete),
            "TRACE" => Some(HttpRequestMethod::Trace),
            "CONNECT" => Some(HttpRequestMethod::Connect),
            "OPTIONS" => Some(HttpRequestMethod::Options),
            _ => None,
        }
    }

    pub fn is_supported(&self) -> bool {
        matches!(self, HttpRequestMethod::Get | HttpRequestMethod::Head)
    }
}

impl fmt::Display for HttpRequestMethod {
    /// 将枚举格式化为 HTTP 标准大写方法名
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            HttpRequestMethod::Get => "GET",
            HttpRequestMethod::Head => "HEAD",
            HttpRequestMethod::Post => "POST",
            HttpRequestMethod::Put => "PUT",
            HttpRequestMethod::Delete => "DELETE",
            HttpRequestMethod::Trace => "TRACE",
            HttpRequestMethod::Connect => "CONNECT",
            HttpRequestMethod::Options => "OPTIONS",
        };
        write!(f, "{}", name)
    }
}

/// 响应使用的 HTTP 协议版本
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    V1_1,
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            HttpVersion::V1_1 => write!(f, "{}", PROTOCOL_HTTP_1_1),
        }
    }
}

lazy_static! {
    /// 文件后缀名到 MIME 类型（Media Type）的映射表。
    ///
    /// 用于设置响应头中的 `Content-Type` 字段，未列出的后缀使用 [`DEFAULT_MIME`]。
    pub static ref MIME_TYPES: HashMap<&'static str, &'static str> = {
        let mut map = HashMap::new();
        map.insert("aac", "audio/aac");
        map.insert("avi", "video/x-msvideo");
        map.insert("bin", "application/octet-stream");
        map.insert("bmp", "image/bmp");
        map.insert("css", "text/css;charset=utf-8");
        map.insert("csv", "text/csv");
        map.insert("gif", "image/gif");
        map.insert("gz", "application/gzip");
        map.insert("htm", "text/html;charset=utf-8");
        map.insert("html", "text/html;charset=utf-8");
        map.insert("ico", "image/x-icon");
        map.insert("jar", "application/java-archive");
        map.insert("jpeg", "image/jpeg");
        map.insert("jpg", "image/jpeg");
        map.insert("js", "text/javascript;charset=utf-8");
        map.insert("json", "application/json");
        map.insert("mp3", "audio/mpeg");
        map.insert("mp4", "video/mp4");
        map.insert("mpeg", "video/mpeg");
        map.insert("ogg", "audio/ogg");
        map.insert("otf", "font/otf");
        map.insert("pdf", "application/pdf");
        map.insert("png", "image/png");
        map.insert("sh", "application/x-sh");
        map.insert("svg", "image/svg+xml");
        map.insert("tar", "application/x-tar");
        map.insert("tif", "image/tiff");
        map.insert("tiff", "image/tiff");
        map.insert("ttf", "font/ttf");
        map.insert("txt", "text/plain;charset=utf-8");
        map.insert("wasm", "application/wasm");
        map.insert("wav", "audio/wav");
        map.insert("webm", "video/webm");
        map.insert("webp", "image/webp");
        map.insert("woff", "font/woff");
        map.insert("woff2", "font/woff2");
        map.insert("xhtml", "application/xhtml+xml");
        map.insert("xml", "text/xml");
        map.insert("zip", "application/zip");
        map
    };
}
