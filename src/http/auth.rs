use std::{collections::HashMap, sync::Arc};

use anyhow::Context;
use base64::{Engine, engine::general_purpose::STANDARD};
use http::{HeaderMap, header::AUTHORIZATION};
use tokio::fs;

/// location 的 Basic 认证规则
///
/// 凭据文件在配置加载时解析为 username → password 的映射，
/// 请求处理只做查表和口令比对。
#[derive(Debug, Clone)]
pub struct AuthRule {
    pub realm: String,
    pub users: Arc<HashMap<String, String>>,
}

/// 一次认证检查的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Granted,
    /// 请求完全没有携带 Authorization 头部
    Missing,
    /// 头部存在但不是合法的 Basic 凭据
    Malformed,
    UnknownUser(String),
    BadPassword(String),
}

/// 读取凭据文件，每行 `user:password`
/// 空行和 `#` 开头的行跳过
pub async fn load_credentials(path: &str) -> anyhow::Result<HashMap<String, String>> {
    let raw = fs::read_to_string(path)
        .await
        .with_context(|| format!("read credentials file {path}"))?;
    let mut users = HashMap::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((user, password)) = line.split_once(':') else {
            continue;
        };
        users.insert(user.to_string(), password.to_string());
    }
    Ok(users)
}

/// 对照凭据表检查请求的 Authorization 头部
pub fn check(headers: &HeaderMap, rule: &AuthRule) -> AuthOutcome {
    let Some(value) = headers.get(AUTHORIZATION) else {
        return AuthOutcome::Missing;
    };
    let Ok(value) = value.to_str() else {
        return AuthOutcome::Malformed;
    };
    let Some((scheme, payload)) = value.split_once(' ') else {
        return AuthOutcome::Malformed;
    };
    if !scheme.eq_ignore_ascii_case("basic") {
        return AuthOutcome::Malformed;
    }
    let Ok(decoded) = STANDARD.decode(payload.trim()) else {
        return AuthOutcome::Malformed;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return AuthOutcome::Malformed;
    };
    let Some((user, password)) = decoded.split_once(':') else {
        return AuthOutcome::Malformed;
    };

    match rule.users.get(user) {
        None => AuthOutcome::UnknownUser(user.to_string()),
        Some(expected) if expected == password => AuthOutcome::Granted,
        Some(_) => AuthOutcome::BadPassword(user.to_string()),
    }
}

/// 认证失败写入错误日志的行内容
/// 完全缺失凭据的情况不写日志，因此没有对应的文案
pub fn error_detail(outcome: &AuthOutcome) -> Option<String> {
    match outcome {
        AuthOutcome::Granted | AuthOutcome::Missing => None,
        AuthOutcome::Malformed => Some("invalid authorization header".to_string()),
        AuthOutcome::UnknownUser(user) => Some(format!(r#"user "{user}" was not found"#)),
        AuthOutcome::BadPassword(user) => Some(format!(r#"user "{user}": password mismatch"#)),
    }
}
