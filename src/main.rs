// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # tinyweb
//!
//! 每个连接只处理一个请求的静态文件服务器。
//! 启动顺序：初始化日志 → 载入配置 → 检查根目录 → 构建 Tokio 运行时 → 进入监听循环。
//!
//! 用法：`tinyweb [配置文件路径]`，缺省为 `config/development.toml`。

use std::{env, process};

use log::{error, info, warn};
use tokio::runtime::Builder;

use tinyweb::{
    config::Config,
    param::{DEFAULT_CONFIG, LOG_CONFIG, SERVER_NAME},
    server,
};

fn main() {
    // 日志配置文件缺失时无法输出任何日志，只能直接退出
    if let Err(e) = log4rs::init_file(LOG_CONFIG, Default::default()) {
        eprintln!("无法初始化日志系统（{}）：{}", LOG_CONFIG, e);
        process::exit(1);
    }
    info!("{}正在启动", SERVER_NAME);

    let config_path = env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG.to_string());
    let config = match Config::from_toml(&config_path) {
        Ok(config) => {
            info!("配置文件{}已载入", config_path);
            config
        }
        Err(e) => {
            warn!("{}，使用默认配置", e);
            Config::from_toml_str("")
        }
    };

    let root = match config.check_root_dir() {
        Ok(root) => root,
        Err(e) => {
            error!("{}，服务端无法启动", e);
            process::exit(1);
        }
    };

    let worker_threads = config.worker_threads();
    info!("工作线程数：{}", worker_threads);
    let runtime = match Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("无法构建Tokio运行时：{}", e);
            process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(server::run(config, root)) {
        error!("服务端异常退出：{}", e);
        process::exit(1);
    }
}
