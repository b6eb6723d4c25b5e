// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 请求决策模块
//!
//! 把解析后的 [`Request`] 与文件系统元数据合成为唯一确定的 [`ResolvedOutcome`]。
//!
//! 检查按固定优先级进行，任何一步得出终结状态后都不再继续：
//! 协议版本 → 方法 → Range 语法 → 资源存在性 → Range 与文件大小 → 目录重定向
//! → `If-Modified-Since` → 可执行资源 → 正常内容。
//!
//! 决策过程是纯函数：相同的请求与相同的元数据总是得到相同的结果。

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use log::{debug, error, warn};

use crate::{
    exception::Exception,
    param::{HttpStatus, PROTOCOL_HTTP_1_1},
    request::Request,
};

/// 资源类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    RegularFile,
    Directory,
    Other,
}

/// 每次请求都重新获取的资源元数据，不跨请求缓存。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceMetadata {
    pub kind: ResourceKind,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub executable: bool,
}

impl ResourceMetadata {
    pub fn file(size: u64, modified: DateTime<Utc>) -> Self {
        Self {
            kind: ResourceKind::RegularFile,
            size,
            modified,
            executable: false,
        }
    }

    pub fn directory(modified: DateTime<Utc>) -> Self {
        Self {
            kind: ResourceKind::Directory,
            size: 4096,
            modified,
            executable: false,
        }
    }

    pub fn with_executable(mut self, executable: bool) -> Self {
        self.executable = executable;
        self
    }
}

/// 文件系统元数据查询接口。
///
/// 资源不存在时返回 `FileNotFound`，拒绝访问时返回 `PermissionDenied`，
/// 其余意外错误返回 `MetadataUnavailable`。
#[cfg_attr(test, mockall::automock)]
pub trait ResourceStat {
    fn stat(&self, path: &Path) -> Result<ResourceMetadata, Exception>;
}

/// 基于 `std::fs::metadata` 的实现，会跟随符号链接。
#[derive(Debug, Clone, Copy, Default)]
pub struct FsStat;

impl ResourceStat for FsStat {
    fn stat(&self, path: &Path) -> Result<ResourceMetadata, Exception> {
        let meta = fs::metadata(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Exception::FileNotFound,
            io::ErrorKind::PermissionDenied => Exception::PermissionDenied,
            _ => {
                error!("无法获取{}的元数据：{}", path.display(), e);
                Exception::MetadataUnavailable
            }
        })?;
        let kind = if meta.is_file() {
            ResourceKind::RegularFile
        } else if meta.is_dir() {
            ResourceKind::Directory
        } else {
            ResourceKind::Other
        };
        let modified = meta.modified().map_err(|e| {
            error!("无法获取{}的修改时间：{}", path.display(), e);
            Exception::MetadataUnavailable
        })?;
        Ok(ResourceMetadata {
            kind,
            size: meta.len(),
            modified: modified.into(),
            executable: is_executable(&meta),
        })
    }
}

#[cfg(unix)]
fn is_executable(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &fs::Metadata) -> bool {
    false
}

/// 一次请求唯一确定的决策结果，是组装响应的唯一输入。
///
/// 除 416 外的错误状态不携带字节范围。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedOutcome {
    status: HttpStatus,
    content_start: Option<u64>,
    content_end: Option<u64>,
    dispatch_external: bool,
}

impl Default for ResolvedOutcome {
    fn default() -> Self {
        Self::new()
    }
}

impl ResolvedOutcome {
    /// 初始状态是 500，任何检查都没有完成时就以此作答。
    pub fn new() -> Self {
        Self {
            status: HttpStatus::InternalServerError,
            content_start: None,
            content_end: None,
            dispatch_external: false,
        }
    }

    fn settle(&mut self, status: HttpStatus) {
        self.status = status;
        if !matches!(
            status,
            HttpStatus::PartialContent | HttpStatus::RangeNotSatisfiable
        ) {
            self.content_start = None;
            self.content_end = None;
        }
    }

    pub fn status(&self) -> HttpStatus {
        self.status
    }

    pub fn content_start(&self) -> Option<u64> {
        self.content_start
    }

    pub fn content_end(&self) -> Option<u64> {
        self.content_end
    }

    pub fn dispatch_external(&self) -> bool {
        self.dispatch_external
    }

    /// 部分内容响应实际要发送的闭区间 `[start, end]`。
    ///
    /// 结束位置缺失时取 `size - 1`，超过文件末尾时截到 `size - 1`；
    /// 只有结束位置时表示文件末尾的 `end` 个字节。
    pub fn byte_span(&self, size: u64) -> Option<(u64, u64)> {
        if self.status != HttpStatus::PartialContent || size == 0 {
            return None;
        }
        let last = size - 1;
        match (self.content_start, self.content_end) {
            (Some(start), Some(end)) if start <= last => Some((start, end.min(last))),
            (Some(start), None) if start <= last => Some((start, last)),
            (None, Some(suffix)) if suffix > 0 => Some((size - suffix.min(size), last)),
            _ => None,
        }
    }
}

/// 决策结果以及得出结果时用到的上下文。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub outcome: ResolvedOutcome,
    pub metadata: Option<ResourceMetadata>,
    pub file_path: Option<PathBuf>,
}

impl Resolution {
    /// 请求未能通过解析时的结果：语法错误为 400，缓冲区溢出等资源耗尽为 500。
    pub fn rejected(exception: Exception) -> Self {
        let mut outcome = ResolvedOutcome::new();
        outcome.settle(exception.status());
        Self {
            outcome,
            metadata: None,
            file_path: None,
        }
    }

    fn terminal(outcome: ResolvedOutcome) -> Self {
        Self {
            outcome,
            metadata: None,
            file_path: None,
        }
    }
}

/// 请求决策引擎。
pub struct Resolver<'a, S: ResourceStat + ?Sized> {
    root: &'a Path,
    stat: &'a S,
}

impl<'a, S: ResourceStat + ?Sized> Resolver<'a, S> {
    pub fn new(root: &'a Path, stat: &'a S) -> Self {
        Self { root, stat }
    }

    /// 把请求的目标路径映射到根目录下的物理路径。
    pub fn file_path(&self, request: &Request) -> PathBuf {
        self.root.join(request.target().trim_start_matches('/'))
    }

    pub fn resolve(&self, request: &Request, id: u128) -> Resolution {
        let mut outcome = ResolvedOutcome::new();

        if request.version() != PROTOCOL_HTTP_1_1 {
            warn!("[ID{}]不支持的HTTP协议版本：{}", id, request.version());
            outcome.settle(HttpStatus::BadRequest);
            return Resolution::terminal(outcome);
        }

        if !request.method().is_supported() {
            warn!("[ID{}]未实现的HTTP请求方法：{}", id, request.method());
            outcome.settle(HttpStatus::NotImplemented);
            return Resolution::terminal(outcome);
        }

        outcome.settle(HttpStatus::Ok);

        if let Some(range) = request.range() {
            outcome.content_start = range.start();
            outcome.content_end = range.end();
            outcome.settle(range.classify());
            debug!("[ID{}]Range分类结果：{}", id, outcome.status);
        }

        let file_path = self.file_path(request);
        let metadata = match self.stat.stat(&file_path) {
            Ok(meta) if meta.kind != ResourceKind::Other => meta,
            Ok(_) => {
                warn!("[ID{}]{}既不是文件也不是目录，返回404", id, file_path.display());
                outcome.settle(HttpStatus::NotFound);
                return Resolution::terminal(outcome);
            }
            Err(e) => {
                warn!("[ID{}]无法访问{}：{}", id, file_path.display(), e);
                outcome.settle(e.status());
                return Resolution::terminal(outcome);
            }
        };
        let mut resolution = Resolution {
            outcome,
            metadata: Some(metadata),
            file_path: Some(file_path),
        };

        if request.range().is_some() {
            if resolution.outcome.status == HttpStatus::RangeNotSatisfiable {
                return resolution;
            }
            if effective_start(&resolution.outcome, metadata.size) >= metadata.size {
                debug!(
                    "[ID{}]Range起点超出文件大小{}，返回416",
                    id, metadata.size
                );
                resolution.outcome.settle(HttpStatus::RangeNotSatisfiable);
                return resolution;
            }
        }

        if metadata.kind == ResourceKind::Directory {
            debug!("[ID{}]请求的路径是目录，重定向到{}/", id, request.path());
            resolution.outcome.settle(HttpStatus::MovedPermanently);
            return resolution;
        }

        if let Some(since) = request.if_modified_since() {
            if since.timestamp() >= metadata.modified.timestamp() {
                debug!("[ID{}]资源自{}以来未修改", id, since);
                resolution.outcome.settle(HttpStatus::NotModified);
                return resolution;
            }
        }

        if request.is_cgi() {
            if metadata.executable {
                debug!("[ID{}]可执行资源，交由外部程序处理", id);
                resolution.outcome.settle(HttpStatus::Ok);
                resolution.outcome.dispatch_external = true;
            } else {
                warn!("[ID{}]{}没有可执行权限，返回403", id, request.path());
                resolution.outcome.settle(HttpStatus::Forbidden);
            }
            return resolution;
        }

        resolution
    }
}

/// 范围的实际起点；只有后缀长度时从文件末尾倒推。
fn effective_start(outcome: &ResolvedOutcome, size: u64) -> u64 {
    match (outcome.content_start, outcome.content_end) {
        (Some(start), _) => start,
        (None, Some(suffix)) => size - suffix.min(size),
        (None, None) => size,
    }
}
