//! 虚拟主机与 location 的运行期模型
//!
//! 配置加载后构建一次，服务期间只读。location 的选择是纯前缀匹配：
//! 构建时按前缀长度降序排序（稳定排序，等长时保持配置顺序），
//! 匹配时从最长的开始找第一个命中的，结果确定且可复现。

use std::{collections::HashMap, sync::Arc};

use anyhow::Context;
use tracing::debug;

use crate::{
    config::{SettingHost, SettingLocation, SettingProxyRedirect},
    consts::host_index,
    http::{
        auth::{self, AuthRule},
        logs::{self, LogConfig},
        rewrite::ProxyTarget,
    },
};

/// try_files 的单个候选项
#[derive(Debug, Clone)]
pub enum TryFilesStep {
    /// 路径模板，`$uri` 替换为请求路径
    Template(String),
    /// 命名 location 的内部转移，如 `@fallback`
    NamedFallback(String),
}

/// location 的行为类型，请求处理时用 match 分发
#[derive(Debug, Clone)]
pub enum LocationKind {
    Static {
        root: String,
    },
    Proxy {
        target: ProxyTarget,
        redirect: Vec<SettingProxyRedirect>,
        timeout: u16,
    },
    Redirect {
        to: String,
        code: u16,
    },
    Status {
        status: u16,
        body: Option<String>,
    },
}

/// 一条构建完成的 location 规则
#[derive(Debug, Clone)]
pub struct Location {
    pub prefix: String,
    /// 前缀是否以 `/` 结尾（根路径 `/` 除外）
    /// 决定裸前缀请求是否需要补斜杠重定向
    pub trailing_slash: bool,
    pub kind: LocationKind,
    pub index: Vec<String>,
    pub auto_index: bool,
    pub try_files: Option<Vec<TryFilesStep>>,
    pub auth: Option<AuthRule>,
    pub logs: LogConfig,
}

impl Location {
    /// 选择 location 时使用的前缀
    /// 尾部斜杠不参与选择（`/doc/` 也能匹配请求 `/doc`），
    /// 补斜杠是选中之后的规范化步骤
    pub fn match_key(&self) -> &str {
        if self.trailing_slash {
            &self.prefix[..self.prefix.len() - 1]
        } else {
            &self.prefix
        }
    }
}

/// 判断选中的 location 是否要求补斜杠重定向
///
/// 仅当前缀以 `/` 结尾、且请求路径正好等于去掉斜杠的前缀时成立。
/// 已带斜杠的路径和前缀之后还有内容的路径都不会重定向。
pub fn needs_slash_redirect(location: &Location, path: &str) -> bool {
    location.trailing_slash && path == location.match_key()
}

/// 一个虚拟主机：server_name 下的全部 location
#[derive(Debug, Clone)]
pub struct VirtualHost {
    pub server_name: Option<String>,
    /// 前缀匹配的 location，按前缀长度降序
    locations: Vec<Arc<Location>>,
    /// `@name` 命名 location，只能通过 try_files 转移进入
    named: HashMap<String, Arc<Location>>,
    /// 没有 location 命中时使用的日志配置（主机级）
    pub fallback_logs: LogConfig,
}

impl VirtualHost {
    /// 从配置构建运行期虚拟主机
    /// 打开日志文件、读取凭据文件都在这一步完成
    pub async fn build(host: &SettingHost) -> anyhow::Result<Self> {
        let host_logs = build_log_config(
            host.access_log.as_deref(),
            host.error_log.as_deref(),
            host.log_not_found,
            None,
        )
        .await?;

        let mut locations = Vec::new();
        let mut named = HashMap::new();
        for setting in &host.location {
            let location = Arc::new(build_location(setting, host, &host_logs).await?);
            debug!("Location built: {:?}", location.prefix);
            if let Some(name) = setting.location.strip_prefix('@') {
                named.insert(name.to_string(), location);
            } else {
                locations.push(location);
            }
        }
        // 稳定排序：等长前缀保持配置顺序，先配置的优先
        locations.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));

        Ok(Self {
            server_name: host.server_name.clone(),
            locations,
            named,
            fallback_logs: host_logs,
        })
    }

    /// 最长前缀匹配
    /// 返回 None 表示没有任何 location 命中（调用方回默认状态码）
    pub fn matched(&self, path: &str) -> Option<Arc<Location>> {
        self.locations
            .iter()
            .find(|location| path.starts_with(location.match_key()))
            .cloned()
    }

    /// 查找 try_files 的命名 fallback
    pub fn named(&self, name: &str) -> Option<Arc<Location>> {
        self.named.get(name).cloned()
    }
}

/// 合并主机级默认与 location 覆盖，得到生效的日志配置
/// `"off"` 显式关闭，缺省继承 `inherit`
async fn build_log_config(
    access: Option<&str>,
    error: Option<&str>,
    log_not_found: Option<bool>,
    inherit: Option<&LogConfig>,
) -> anyhow::Result<LogConfig> {
    let access = match access {
        Some("off") => None,
        Some(path) => Some(logs::shared_sink(path).await?),
        None => inherit.and_then(|cfg| cfg.access.clone()),
    };
    let error = match error {
        Some("off") => None,
        Some(path) => Some(logs::shared_sink(path).await?),
        None => inherit.and_then(|cfg| cfg.error.clone()),
    };
    let log_not_found = log_not_found
        .or(inherit.map(|cfg| cfg.log_not_found))
        .unwrap_or(true);
    Ok(LogConfig {
        access,
        error,
        log_not_found,
    })
}

async fn build_location(
    setting: &SettingLocation,
    host: &SettingHost,
    host_logs: &LogConfig,
) -> anyhow::Result<Location> {
    let prefix = setting.location.clone();
    anyhow::ensure!(
        prefix.starts_with('/') || prefix.starts_with('@'),
        "location must start with / or @: {prefix}"
    );
    let trailing_slash = prefix.len() > 1 && prefix.ends_with('/');

    let kind = if let Some(proxy_pass) = &setting.proxy_pass {
        LocationKind::Proxy {
            target: ProxyTarget::parse(proxy_pass)
                .with_context(|| format!("location {prefix}"))?,
            redirect: setting.proxy_redirect.clone(),
            timeout: setting.proxy_timeout,
        }
    } else if let Some(to) = &setting.redirect_to {
        LocationKind::Redirect {
            to: to.clone(),
            code: setting.redirect_code.unwrap_or(301),
        }
    } else if let Some(status) = setting.status {
        LocationKind::Status {
            status,
            body: setting.status_body.clone(),
        }
    } else if let Some(root) = &setting.root {
        LocationKind::Static { root: root.clone() }
    } else {
        anyhow::bail!("location {prefix} needs one of root, proxy_pass, redirect_to, status");
    };

    let auth = match (&setting.auth_file, &setting.auth_realm) {
        (Some(file), realm) => {
            let users = auth::load_credentials(file)
                .await
                .with_context(|| format!("location {prefix}"))?;
            Some(AuthRule {
                realm: realm.clone().unwrap_or_else(|| "restricted".to_string()),
                users: Arc::new(users),
            })
        }
        (None, Some(_)) => {
            anyhow::bail!("location {prefix} has auth_realm without auth_file")
        }
        (None, None) => None,
    };

    let try_files = setting.try_files.as_ref().map(|steps| {
        steps
            .iter()
            .map(|step| match step.strip_prefix('@') {
                Some(name) => TryFilesStep::NamedFallback(name.to_string()),
                None => TryFilesStep::Template(step.clone()),
            })
            .collect()
    });

    let index = if setting.index.is_empty() {
        host_index()
    } else {
        setting.index.clone()
    };

    let logs = build_log_config(
        setting.access_log.as_deref(),
        setting.error_log.as_deref(),
        setting.log_not_found.or(host.log_not_found),
        Some(host_logs),
    )
    .await?;

    Ok(Location {
        prefix,
        trailing_slash,
        kind,
        index,
        auto_index: setting.auto_index,
        try_files,
        auth,
        logs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn static_location(prefix: &str) -> Location {
        Location {
            prefix: prefix.to_string(),
            trailing_slash: prefix.len() > 1 && prefix.ends_with('/'),
            kind: LocationKind::Static {
                root: "./html".to_string(),
            },
            index: host_index(),
            auto_index: false,
            try_files: None,
            auth: None,
            logs: LogConfig::default(),
        }
    }

    fn vhost_with(prefixes: &[&str]) -> VirtualHost {
        let mut locations = Vec::new();
        let mut named = HashMap::new();
        for prefix in prefixes {
            let location = Arc::new(static_location(prefix));
            if let Some(name) = prefix.strip_prefix('@') {
                named.insert(name.to_string(), location);
            } else {
                locations.push(location);
            }
        }
        locations.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        VirtualHost {
            server_name: None,
            locations,
            named,
            fallback_logs: LogConfig::default(),
        }
    }

    #[test]
    fn longest_prefix_wins() {
        let vhost = vhost_with(&["/", "/doc/", "/doc/api/"]);
        assert_eq!(vhost.matched("/doc/api/guide").unwrap().prefix, "/doc/api/");
        assert_eq!(vhost.matched("/doc/readme").unwrap().prefix, "/doc/");
        assert_eq!(vhost.matched("/other").unwrap().prefix, "/");
    }

    #[test]
    fn no_match_without_root_location() {
        let vhost = vhost_with(&["/doc/"]);
        assert!(vhost.matched("/other").is_none());
    }

    #[test]
    fn trailing_slash_ignored_for_selection() {
        let vhost = vhost_with(&["/proxy2/"]);
        // 裸前缀也要选中同一条 location，补斜杠是后续步骤
        assert_eq!(vhost.matched("/proxy2").unwrap().prefix, "/proxy2/");
        assert_eq!(vhost.matched("/proxy2/sub").unwrap().prefix, "/proxy2/");
    }

    #[test]
    fn equal_length_prefixes_keep_config_order() {
        let vhost = vhost_with(&["/aa", "/ab"]);
        assert_eq!(vhost.matched("/aa/x").unwrap().prefix, "/aa");
        assert_eq!(vhost.matched("/ab/x").unwrap().prefix, "/ab");
    }

    #[test]
    fn named_locations_never_prefix_match() {
        let vhost = vhost_with(&["/", "@fallback"]);
        // 字面请求 /@fallback 只会落在 / 上
        assert_eq!(vhost.matched("/@fallback").unwrap().prefix, "/");
        assert!(vhost.named("fallback").is_some());
        assert!(vhost.named("missing").is_none());
    }

    #[test]
    fn slash_redirect_only_for_bare_prefix() {
        let location = static_location("/subfolder1/");
        assert!(needs_slash_redirect(&location, "/subfolder1"));
        // 已规范化的路径是幂等的，不会再次重定向
        assert!(!needs_slash_redirect(&location, "/subfolder1/"));
        assert!(!needs_slash_redirect(&location, "/subfolder1/index.html"));
        assert!(!needs_slash_redirect(&location, "/subfolder12"));
    }

    #[test]
    fn slash_redirect_never_for_plain_prefix() {
        let location = static_location("/proxy1");
        assert!(!needs_slash_redirect(&location, "/proxy1"));
        assert!(!needs_slash_redirect(&location, "/proxy1/"));
    }
}
