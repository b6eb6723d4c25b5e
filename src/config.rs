use serde_derive::Deserialize;
use serde_derive::Serialize;

use log::{error, warn};
use std::fs::{self, File};
use std::io::prelude::*;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::exception::Exception;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "default_www_root")]
    www_root: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_local")]
    local: bool,
    #[serde(default)]
    worker_threads: usize,
    #[serde(default = "default_timeout_secs")]
    timeout_secs: u64,
    #[serde(default = "default_chunk_size")]
    chunk_size: usize,
    #[serde(default = "default_max_request_size")]
    max_request_size: usize,
    #[serde(default = "default_index_file")]
    index_file: String,
    #[serde(default = "default_cgi_prefix")]
    cgi_prefix: String,
}

fn default_www_root() -> String {
    "www".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_local() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_chunk_size() -> usize {
    4096 // 4KB
}

fn default_max_request_size() -> usize {
    8192 // 8KB
}

fn default_index_file() -> String {
    "index.html".to_string()
}

fn default_cgi_prefix() -> String {
    "/cgi-bin".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        Self {
            www_root: default_www_root(),
            port: default_port(),
            local: default_local(),
            worker_threads: 0,
            timeout_secs: default_timeout_secs(),
            chunk_size: default_chunk_size(),
            max_request_size: default_max_request_size(),
            index_file: default_index_file(),
            cgi_prefix: default_cgi_prefix(),
        }
    }

    pub fn from_toml(filename: &str) -> Result<Self, Exception> {
        let mut file = File::open(filename).map_err(|e| {
            error!("无法打开配置文件{}：{}", filename, e);
            Exception::ConfigUnreadable
        })?;
        let mut str_val = String::new();
        file.read_to_string(&mut str_val).map_err(|e| {
            error!("读取配置文件{}失败：{}", filename, e);
            Exception::ConfigUnreadable
        })?;
        Ok(Self::from_toml_str(&str_val))
    }

    pub fn from_toml_str(content: &str) -> Self {
        let mut raw_config: Config = match toml::from_str(content) {
            Ok(t) => t,
            Err(e) => {
                error!("无法成功从配置文件构建配置对象，使用默认配置：{}", e);
                Config::new()
            }
        };
        if raw_config.worker_threads == 0 {
            raw_config.worker_threads = num_cpus::get();
        }
        if raw_config.chunk_size == 0 {
            warn!("chunk_size被设置为0，该值将被改为{}。", default_chunk_size());
            raw_config.chunk_size = default_chunk_size();
        }
        if raw_config.max_request_size == 0 {
            warn!(
                "max_request_size被设置为0，该值将被改为{}。",
                default_max_request_size()
            );
            raw_config.max_request_size = default_max_request_size();
        }
        if !raw_config.cgi_prefix.starts_with('/') {
            raw_config.cgi_prefix.insert(0, '/');
        }
        raw_config
    }

    /// 确认根目录存在且确实是一个目录，返回规范化后的绝对路径。
    ///
    /// 外部程序在自己的工作目录中启动，相对路径在那里会失效。
    pub fn check_root_dir(&self) -> Result<PathBuf, Exception> {
        let root = Path::new(&self.www_root);
        match fs::metadata(root) {
            Ok(meta) if meta.is_dir() => fs::canonicalize(root).map_err(|e| {
                error!("无法解析根目录{}的绝对路径：{}", self.www_root, e);
                Exception::RootDirInvalid
            }),
            Ok(_) => {
                error!("根目录{}不是一个目录", self.www_root);
                Err(Exception::RootDirInvalid)
            }
            Err(e) => {
                error!("无法访问根目录{}：{}", self.www_root, e);
                Err(Exception::RootDirInvalid)
            }
        }
    }

    pub fn with_www_root(mut self, root: impl Into<String>) -> Self {
        self.www_root = root.into();
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_max_request_size(mut self, size: usize) -> Self {
        self.max_request_size = size.max(1);
        self
    }

    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }
}

impl Config {
    pub fn www_root(&self) -> &str {
        &self.www_root
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn local(&self) -> bool {
        self.local
    }

    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn max_request_size(&self) -> usize {
        self.max_request_size
    }

    pub fn index_file(&self) -> &str {
        &self.index_file
    }

    pub fn cgi_prefix(&self) -> &str {
        &self.cgi_prefix
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::new();
        assert_eq!(config.www_root(), "www");
        assert_eq!(config.port(), 8080);
        assert_eq!(config.timeout(), Duration::from_secs(120));
        assert_eq!(config.index_file(), "index.html");
        assert_eq!(config.cgi_prefix(), "/cgi-bin");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = Config::from_toml_str("www_root = \"public\"\nport = 9000\n");
        assert_eq!(config.www_root(), "public");
        assert_eq!(config.port(), 9000);
        assert_eq!(config.chunk_size(), 4096);
        assert_eq!(config.max_request_size(), 8192);
        assert!(config.worker_threads() > 0);
    }

    #[test]
    fn test_invalid_toml_falls_back() {
        let config = Config::from_toml_str("port = \"not a number\"");
        assert_eq!(config.port(), 8080);
    }

    #[test]
    fn test_zero_sizes_are_corrected() {
        let config = Config::from_toml_str("chunk_size = 0\nmax_request_size = 0\n");
        assert_eq!(config.chunk_size(), 4096);
        assert_eq!(config.max_request_size(), 8192);
    }

    #[test]
    fn test_cgi_prefix_gets_leading_slash() {
        let config = Config::from_toml_str("cgi_prefix = \"scripts\"");
        assert_eq!(config.cgi_prefix(), "/scripts");
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "timeout_secs = 5").unwrap();
        let config = Config::from_toml(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_from_toml_missing_file() {
        let result = Config::from_toml("/definitely/not/here.toml");
        assert_eq!(result.unwrap_err(), Exception::ConfigUnreadable);
    }

    #[test]
    fn test_check_root_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new().with_www_root(dir.path().to_str().unwrap());
        assert_eq!(
            config.check_root_dir().unwrap(),
            dir.path().canonicalize().unwrap()
        );

        let file = tempfile::NamedTempFile::new().unwrap();
        let config = Config::new().with_www_root(file.path().to_str().unwrap());
        assert_eq!(config.check_root_dir().unwrap_err(), Exception::RootDirInvalid);

        let config = Config::new().with_www_root("/definitely/not/here");
        assert_eq!(config.check_root_dir().unwrap_err(), Exception::RootDirInvalid);
    }

    #[test]
    fn test_relative_root_becomes_absolute() {
        let dir = tempfile::Builder::new().prefix("root").tempdir_in(".").unwrap();
        let relative = dir.path().strip_prefix(".").unwrap_or(dir.path());
        assert!(relative.is_relative());

        let config = Config::new().with_www_root(relative.to_str().unwrap());
        let root = config.check_root_dir().unwrap();
        assert!(root.is_absolute());
        assert_eq!(root, dir.path().canonicalize().unwrap());
    }
}
