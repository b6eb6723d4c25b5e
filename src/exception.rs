// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # Exception 模块
//!
//! 该模块定义了服务器在一次连接的生命周期中可能遇到的各类异常情况。
//!
//! ## 设计意图
//! - **错误分类**：涵盖协议解析错误、文件系统错误、传输错误、外部程序执行错误以及启动阶段的配置错误。
//! - **语义映射**：能够到达客户端的变体都通过 [`Exception::status`] 对应到一个固定的 HTTP 状态码。
//! - **轻量**：变体不携带底层 `io::Error`，具体原因在出错的位置记录到日志中。

use std::fmt;

use crate::param::HttpStatus;

/// 服务器处理请求过程中发生的异常类型。
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Exception {
    /// 请求字节流无法解析为合法的 UTF-8 字符串。
    RequestIsNotUtf8,
    /// 请求行不符合 `METHOD SP PATH SP PROTOCOL CRLF` 语法。
    MalformedRequestLine,
    /// 请求超过了缓冲区上限，不会被截断后继续处理。
    RequestTooLarge,
    /// 客户端在发送任何数据之前就关闭了连接。
    ConnectionClosed,
    /// 读写操作超过了连接的空闲超时时间。
    Timeout,
    /// 在根目录下未找到所请求的资源。
    FileNotFound,
    /// 文件系统拒绝访问所请求的资源。
    PermissionDenied,
    /// 获取资源元数据时发生了非 "不存在" 的意外错误。
    MetadataUnavailable,
    /// 向连接写入或从文件读取时发生 I/O 错误。
    IoFailure,
    /// 无法启动外部程序。
    CgiExecuteFailed,
    /// 外部程序以非零状态退出。
    CgiExitFailure,
    /// 配置文件无法读取。
    ConfigUnreadable,
    /// 配置内容非法（例如根目录不是目录）。
    RootDirInvalid,
}

use Exception::*;

impl Exception {
    /// 该异常在还能回复客户端时应当使用的状态码。
    pub fn status(&self) -> HttpStatus {
        match self {
            RequestIsNotUtf8 | MalformedRequestLine => HttpStatus::BadRequest,
            FileNotFound => HttpStatus::NotFound,
            PermissionDenied => HttpStatus::Forbidden,
            _ => HttpStatus::InternalServerError,
        }
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestIsNotUtf8 => write!(f, "Request bytes can't be parsed in UTF-8"),
            MalformedRequestLine => write!(f, "Malformed request line"),
            RequestTooLarge => write!(f, "Request exceeds the buffer size"),
            ConnectionClosed => write!(f, "Connection closed by peer"),
            Timeout => write!(f, "Connection timed out"),
            FileNotFound => write!(f, "File not found (404)"),
            PermissionDenied => write!(f, "Permission denied (403)"),
            MetadataUnavailable => write!(f, "Couldn't read file metadata"),
            IoFailure => write!(f, "I/O failure"),
            CgiExecuteFailed => write!(f, "Couldn't invoke cgi program"),
            CgiExitFailure => write!(f, "Cgi program exited with failure"),
            ConfigUnreadable => write!(f, "Couldn't read config file"),
            RootDirInvalid => write!(f, "Root dir is not readable or not a directory"),
        }
    }
}

impl std::error::Error for Exception {}
