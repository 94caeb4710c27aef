use std::path::Path;
use std::sync::{Arc, LazyLock};

use anyhow::Context;
use chrono::Local;
use dashmap::DashMap;
use http::{Method, StatusCode};
use tokio::{
    fs::{self, File, OpenOptions},
    io::AsyncWriteExt,
    sync::Mutex,
};
use tracing::error;

/// 已打开的日志文件，按路径共享
/// 同一文件只打开一次，多个 location 指向同一路径时写同一个句柄
static SINKS: LazyLock<DashMap<String, Arc<LogSink>>> = LazyLock::new(DashMap::new);

/// 追加式访问/错误日志文件
///
/// 每次写入一条完整的行，写入在 Mutex 后串行化，
/// 并发请求之间的行不会交错，行之间的顺序不作保证。
#[derive(Debug)]
pub struct LogSink {
    path: String,
    file: Mutex<File>,
}

impl LogSink {
    async fn open(path: &str) -> anyhow::Result<Arc<Self>> {
        if let Some(parent) = Path::new(path).parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create log folder for {path}"))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("open log file {path}"))?;
        Ok(Arc::new(Self {
            path: path.to_string(),
            file: Mutex::new(file),
        }))
    }

    pub async fn append(&self, line: &str) {
        let mut file = self.file.lock().await;
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        if let Err(err) = file.write_all(&buf).await {
            error!("Failed to append to {}: {err}", self.path);
            return;
        }
        if let Err(err) = file.flush().await {
            error!("Failed to flush {}: {err}", self.path);
        }
    }
}

/// 按路径取共享的日志文件句柄，不存在时打开
pub async fn shared_sink(path: &str) -> anyhow::Result<Arc<LogSink>> {
    if let Some(sink) = SINKS.get(path) {
        return Ok(sink.clone());
    }
    let sink = LogSink::open(path).await?;
    SINKS.insert(path.to_string(), sink.clone());
    Ok(sink)
}

#[allow(dead_code)]
pub fn clear_sinks() {
    SINKS.clear();
}

/// location 生效的日志配置
/// None 表示对应日志已关闭（配置里的 "off"）
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    pub access: Option<Arc<LogSink>>,
    pub error: Option<Arc<LogSink>>,
    pub log_not_found: bool,
}

/// 请求的终态，决定日志写入方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// 正常完成（包含重定向、固定状态、目录列表被拒等）
    Completed,
    /// 文件不存在，受 log_not_found 控制
    NotFound,
    /// 完全没有携带凭据的 401，设计上不写错误日志
    AuthMissing,
    /// 凭据错误，detail 写入错误日志
    AuthFailed(String),
    /// 上游失败（502/504）
    Upstream(String),
}

/// 按 location 的日志配置记录一次请求的终态
///
/// 规则：
/// - 文件不存在且 log_not_found 关闭时，访问/错误日志都不写
/// - 访问日志记录所有完成的请求，除非该 location 的访问日志关闭
/// - 4xx/5xx 额外写错误日志，除非错误日志关闭；
///   唯一例外是完全没带凭据的 401，永远不写
pub async fn record(
    cfg: &LogConfig,
    method: &Method,
    path: &str,
    status: StatusCode,
    outcome: Outcome,
) {
    if outcome == Outcome::NotFound && !cfg.log_not_found {
        return;
    }

    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
    if let Some(access) = &cfg.access {
        access
            .append(&format!("[{timestamp}] {method} {path} {}", status.as_u16()))
            .await;
    }

    if !(status.is_client_error() || status.is_server_error()) {
        return;
    }
    if outcome == Outcome::AuthMissing {
        return;
    }
    if let Some(error) = &cfg.error {
        let line = match &outcome {
            Outcome::AuthFailed(detail) | Outcome::Upstream(detail) => {
                format!("[{timestamp}] {method} {path} {} {detail}", status.as_u16())
            }
            _ => format!("[{timestamp}] {method} {path} {}", status.as_u16()),
        };
        error.append(&line).await;
    }
}
