use std::env;

pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const COMPILER: &str = env!("NOUGAT_COMPILER");
pub const OS: &str = env::consts::OS;
pub const ARCH: &str = env::consts::ARCH;

// config defaults
pub const HOST_INDEX: [&str; 1] = ["index.html"];
pub fn host_index() -> Vec<String> {
    HOST_INDEX.map(|h| h.to_string()).to_vec()
}

pub const DEFAULT_IP: &str = "0.0.0.0";
pub fn default_ip() -> String {
    DEFAULT_IP.to_string()
}

/// 整个请求处理的超时时间（秒）
pub const PROCESS_TIMEOUT: u16 = 75;
pub fn process_timeout() -> u16 {
    PROCESS_TIMEOUT
}

/// 上游响应超时（秒）
pub const PROXY_TIMEOUT: u16 = 30;
pub fn proxy_timeout() -> u16 {
    PROXY_TIMEOUT
}

/// 上游连接超时（秒）
pub const PROXY_CONNECT_TIMEOUT: u16 = 5;

pub const DEFAULT_LOG_LEVEL: &str = "info";
pub fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

pub const DEFAULT_LOG_FOLDER: &str = "./logs";
pub fn default_log_folder() -> String {
    DEFAULT_LOG_FOLDER.to_string()
}
