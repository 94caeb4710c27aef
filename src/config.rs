use std::fs;

use serde::Deserialize;

use crate::{
    consts::{default_ip, default_log_folder, default_log_level, process_timeout, proxy_timeout},
    error::Result,
};

/// 日志配置（服务器自身的诊断日志，非访问日志）
#[derive(Deserialize, Clone, Debug)]
pub struct SettingLog {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_folder")]
    pub folder: String,
}

impl Default for SettingLog {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            folder: default_log_folder(),
        }
    }
}

/// proxy_redirect 的改写规则
/// 上游响应的 Location 头部以 from 开头时，替换为 to
#[derive(Deserialize, Clone, Debug)]
pub struct SettingProxyRedirect {
    pub from: String,
    pub to: String,
}

/// 单条 location 配置
///
/// location 的行为由互斥的字段决定：
/// - `root`: 静态文件服务（可配合 `try_files`、`index`、`auto_index`）
/// - `proxy_pass`: 反向代理到上游
/// - `redirect_to`: HTTP 重定向
/// - `status`: 返回固定状态码（可带固定响应体）
#[derive(Deserialize, Clone, Debug)]
pub struct SettingLocation {
    /// The register route
    pub location: String,
    /// The static assets root folder
    pub root: Option<String>,
    /// Index files format
    #[serde(default)]
    pub index: Vec<String>,
    /// 自动生成目录索引页面
    #[serde(default)]
    pub auto_index: bool,
    /// 按顺序尝试的候选文件模板，`$uri` 会被替换为请求路径；
    /// 最后一项可以是 `@name`，指向本主机内的命名 location
    pub try_files: Option<Vec<String>>,

    /// 反向代理目标，如 `http://127.0.0.1:3000/upstream/`
    /// 路径部分按字面保留：没有路径、有无尾部斜杠都有区别
    pub proxy_pass: Option<String>,
    /// 上游响应 Location 头部的改写规则，按配置顺序取第一条命中的
    #[serde(default)]
    pub proxy_redirect: Vec<SettingProxyRedirect>,
    /// 上游响应超时（秒）
    #[serde(default = "proxy_timeout")]
    pub proxy_timeout: u16,

    /// HTTP Basic 认证的 realm
    pub auth_realm: Option<String>,
    /// 凭据文件路径，每行 `user:password`
    /// 路径在配置加载时解析，对请求处理是不透明输入
    pub auth_file: Option<String>,

    /// HTTP 重定向目标
    pub redirect_to: Option<String>,
    pub redirect_code: Option<u16>,

    /// 直接返回固定状态码
    pub status: Option<u16>,
    /// 固定状态码的响应体
    pub status_body: Option<String>,

    /// 访问日志文件路径，`"off"` 表示关闭；缺省继承主机配置
    pub access_log: Option<String>,
    /// 错误日志文件路径，`"off"` 表示关闭；缺省继承主机配置
    pub error_log: Option<String>,
    /// 是否记录 404（文件不存在）
    pub log_not_found: Option<bool>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct SettingHost {
    #[serde(default = "default_ip")]
    pub ip: String,
    pub port: u16,
    /// 虚拟主机名；None 表示该端口的默认主机
    pub server_name: Option<String>,
    #[serde(default)]
    pub ssl: bool,
    pub certificate: Option<String>,
    pub certificate_key: Option<String>,
    /// 整个请求处理的超时时间
    #[serde(default = "process_timeout")]
    pub timeout: u16,
    /// 主机级访问日志，location 未配置时继承
    pub access_log: Option<String>,
    /// 主机级错误日志，location 未配置时继承
    pub error_log: Option<String>,
    #[serde(default)]
    pub log_not_found: Option<bool>,
    #[serde(default)]
    pub location: Vec<SettingLocation>,
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct Settings {
    #[serde(default)]
    pub log: SettingLog,
    #[serde(default)]
    pub host: Vec<SettingHost>,
}

impl Settings {
    pub fn new(path: &str) -> Result<Self> {
        let file = fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&file)?;
        Ok(settings)
    }
}
