//! 反向代理转发
//!
//! 请求体和响应体都走流式转发，慢客户端的背压会传导到上游连接。
//! 上游请求带 `x-real-ip` 和原始 `host`；上游响应里的这两个头部
//! 在回传前剥掉，避免意外回显给客户端。

use std::sync::OnceLock;
use std::time::Duration;

use axum::{body::Body, extract::Request, response::Response};
use http::{HeaderName, HeaderValue, StatusCode, header::LOCATION};
use reqwest::Client;
use tracing::{debug, error};

use crate::{
    config::SettingProxyRedirect,
    consts::PROXY_CONNECT_TIMEOUT,
    http::{
        RequestContext,
        error::RouteResult,
        logs::Outcome,
        plain_status,
        rewrite::{self, ProxyTarget},
    },
};

/// 全局 reqwest 客户端实例，用于复用连接池
/// 重定向跟随必须关闭，上游的 Location 要原样（或按 proxy_redirect 改写后）回给客户端
static CLIENT: OnceLock<Client> = OnceLock::new();

fn get_client() -> &'static Client {
    CLIENT.get_or_init(|| {
        Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(PROXY_CONNECT_TIMEOUT.into()))
            .build()
            .expect("Failed to initialize reqwest client")
    })
}

/// 把请求转发到上游并回传响应
///
/// 失败映射：连接失败 502，超时 504，两者都会进错误日志。
/// 不做重试，客户端断开时响应流被丢弃，上游传输随之中止。
pub async fn forward(
    prefix: &str,
    target: &ProxyTarget,
    redirect_rules: &[SettingProxyRedirect],
    timeout: u16,
    ctx: &RequestContext,
    req: Request,
) -> RouteResult<(Response, Outcome)> {
    let path_query = rewrite::upstream_path_and_query(
        prefix,
        &target.base_path,
        &ctx.raw_path,
        &ctx.decoded_path,
        ctx.query.as_deref(),
    );
    let uri = format!("{}://{}{}", target.scheme, target.authority, path_query);
    debug!("reverse proxy uri: {uri:?}");

    let client = get_client();
    let mut forward_req = client
        .request(ctx.method.clone(), uri.as_str())
        .timeout(Duration::from_secs(timeout.into()));

    // forward request headers
    for (name, value) in req.headers() {
        if !is_exclude_header(name) {
            forward_req = forward_req.header(name.clone(), value.clone());
        }
    }
    forward_req = forward_req
        .header("host", ctx.host.as_str())
        .header("x-real-ip", ctx.client_ip.ip().to_string());

    // forward request body as a stream
    let body = reqwest::Body::wrap_stream(req.into_body().into_data_stream());
    forward_req = forward_req.body(body);

    let upstream_response = match forward_req.send().await {
        Ok(response) => response,
        Err(err) => {
            error!("Failed to proxy request to {uri}: {err}");
            let status = if err.is_timeout() {
                StatusCode::GATEWAY_TIMEOUT
            } else {
                StatusCode::BAD_GATEWAY
            };
            return Ok((
                plain_status(status),
                Outcome::Upstream(format!("upstream {uri} failed: {err}")),
            ));
        }
    };

    // response from reverse proxy server
    let mut response_builder = Response::builder().status(upstream_response.status());
    let headers = response_builder
        .headers_mut()
        .ok_or_else(|| anyhow::anyhow!("response builder has no headers"))
        .map_err(crate::http::error::RouteError::Any)?;
    copy_headers(upstream_response.headers(), headers);

    // proxy_redirect：第一条命中的规则改写 Location，其余原样透传
    if let Some(location) = upstream_response.headers().get(LOCATION)
        && let Ok(location) = location.to_str()
        && let Some(rewritten) = rewrite::rewrite_location(location, redirect_rules)
        && let Ok(value) = HeaderValue::from_str(&rewritten)
    {
        debug!("proxy_redirect: {location} -> {rewritten}");
        headers.insert(LOCATION, value);
    }

    let response = response_builder
        .body(Body::from_stream(upstream_response.bytes_stream()))
        .map_err(|err| {
            error!("Failed to build proxy response: {err}");
            crate::http::error::RouteError::InternalError()
        })?;

    Ok((response, Outcome::Completed))
}

/// 不应该转发的头部
///
/// 逐跳头部不跨连接转发；`host` 和 `x-real-ip` 由代理自己设置，
/// 入站请求和上游响应里出现的都要丢弃。
fn is_exclude_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "host"
            | "x-real-ip"
            | "connection"
            | "proxy-authenticate"
            | "upgrade"
            | "proxy-authorization"
            | "keep-alive"
            | "transfer-encoding"
            | "te"
    )
}

/// 复制头部，排除 is_exclude_header 中定义的
fn copy_headers(from: &http::HeaderMap, to: &mut http::HeaderMap) {
    for (name, value) in from.iter() {
        if !is_exclude_header(name) {
            to.append(name.clone(), value.clone());
        }
    }
}
