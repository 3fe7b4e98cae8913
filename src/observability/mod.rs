//! 可观测性：tracing 订阅器初始化
//!
//! 库本身只发出 tracing 事件，从不隐式安装订阅器；宿主进程在启动时调用 init()。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 安装 EnvFilter（RUST_LOG，缺省 info）+ fmt 层
pub fn init() {
    init_with_default("info");
}

/// RUST_LOG 未设置或无法解析时使用 default_directive；重复初始化会被忽略
pub fn init_with_default(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    if tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init()
        .is_err()
    {
        tracing::debug!("Tracing subscriber already installed");
    }
}
