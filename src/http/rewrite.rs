//! 反向代理的上游路径改写
//!
//! 这里的规则是刻意的「笨」拼接：上游路径 = proxy_pass 的路径部分 + 请求路径
//! 去掉 location 前缀后的剩余部分，不插入也不去除斜杠。配置里 proxy_pass
//! 带不带尾部斜杠会直接改变转发结果（包括产生 `//` 或者把两段粘在一起），
//! 这与 nginx 的行为一致，必须原样保留。

use crate::config::SettingProxyRedirect;

/// 反向代理目标，从 proxy_pass 的 URL 拆出来
///
/// `base_path` 按配置字面保留：URL 没有路径部分时为空字符串，
/// 有路径时包含开头的 `/`，尾部斜杠不做任何修正。
#[derive(Debug, Clone)]
pub struct ProxyTarget {
    pub scheme: String,
    pub authority: String,
    pub base_path: String,
}

impl ProxyTarget {
    pub fn parse(input: &str) -> anyhow::Result<Self> {
        let (scheme, rest) = input
            .split_once("://")
            .ok_or_else(|| anyhow::anyhow!("proxy_pass missing scheme: {input}"))?;
        anyhow::ensure!(
            scheme == "http" || scheme == "https",
            "proxy_pass scheme must be http or https: {input}"
        );
        let (authority, base_path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, ""),
        };
        anyhow::ensure!(!authority.is_empty(), "proxy_pass missing host: {input}");
        Ok(Self {
            scheme: scheme.to_string(),
            authority: authority.to_string(),
            base_path: base_path.to_string(),
        })
    }
}

/// 计算转发到上游的 path + query
///
/// - `base` 为空（proxy_pass 没有路径部分）：原始请求路径原样转发，
///   前缀和剩余部分都不参与
/// - 否则：`base` 与去掉前缀后的剩余部分做字面拼接
///
/// 剩余部分优先从原始路径取（保留原有的百分号编码字节）；
/// 前缀字节以编码形式到达时原始路径剥不掉前缀，此时改用
/// 匹配时的解码路径取剩余部分，不会丢弃。query 始终原样追加。
pub fn upstream_path_and_query(
    prefix: &str,
    base: &str,
    raw_path: &str,
    decoded_path: &str,
    query: Option<&str>,
) -> String {
    let mut out = if base.is_empty() {
        raw_path.to_string()
    } else {
        let remainder = raw_path
            .strip_prefix(prefix)
            .or_else(|| decoded_path.strip_prefix(prefix))
            .unwrap_or_default();
        format!("{base}{remainder}")
    };
    if let Some(query) = query {
        out.push('?');
        out.push_str(query);
    }
    out
}

/// 按配置顺序应用第一条命中的 proxy_redirect 规则
///
/// 上游响应的 Location 以 `from` 开头时替换该字面前缀为 `to`；
/// 没有命中时返回 None，头部原样透传。
pub fn rewrite_location(value: &str, rules: &[SettingProxyRedirect]) -> Option<String> {
    for rule in rules {
        if let Some(rest) = value.strip_prefix(rule.from.as_str()) {
            return Some(format!("{}{rest}", rule.to));
        }
    }
    None
}
