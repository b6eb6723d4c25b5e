//! 访问日志。每个请求在连接关闭前输出一行，写入 `access` 日志目标。

use std::{fmt, net::SocketAddr};

use chrono::{DateTime, Local};
use log::info;

use crate::{param::ACCESS_LOG_TARGET, request::Request};

const ACCESS_DATE_FORMAT: &str = "%d/%b/%Y:%H:%M:%S %z";

/// 一行访问日志的内容，格式与常见的 Common Log Format 一致：
/// `<peer> - - [<date>] "<METHOD> <path> <protocol>" <status> <bytes>`
#[derive(Debug, Clone)]
pub struct AccessRecord {
    peer: Option<SocketAddr>,
    date: DateTime<Local>,
    request_line: Option<String>,
    status: u16,
    bytes: u64,
}

impl AccessRecord {
    pub fn new(peer: Option<SocketAddr>, request: Option<&Request>) -> Self {
        Self {
            peer,
            date: Local::now(),
            request_line: request.map(|r| {
                format!("{} {} {}", r.method(), r.path(), r.version())
            }),
            status: 500,
            bytes: 0,
        }
    }

    pub fn set_status(&mut self, status: u16) -> &mut Self {
        self.status = status;
        self
    }

    pub fn set_bytes(&mut self, bytes: u64) -> &mut Self {
        self.bytes = bytes;
        self
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn log(&self) {
        info!(target: ACCESS_LOG_TARGET, "{}", self);
    }
}

impl fmt::Display for AccessRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let peer = self
            .peer
            .map_or_else(|| "-".to_string(), |p| p.ip().to_string());
        write!(
            f,
            "{} - - [{}] \"{}\" {} {}",
            peer,
            self.date.format(ACCESS_DATE_FORMAT),
            self.request_line.as_deref().unwrap_or("-"),
            self.status,
            self.bytes
        )
    }
}
