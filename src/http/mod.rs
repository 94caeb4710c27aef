use std::{
    net::SocketAddr,
    sync::{Arc, LazyLock},
    time::Duration,
};

use anyhow::anyhow;
use axum::{
    Extension, Router,
    body::Body,
    extract::{ConnectInfo, Request},
    response::{IntoResponse, Response},
};
use axum_server::{Handle, tls_rustls::RustlsConfig};
use dashmap::DashMap;
use http::{
    HeaderValue, Method, StatusCode,
    header::{CONTENT_TYPE, LOCATION, WWW_AUTHENTICATE},
};
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;
use tracing::{debug, error, info, warn};

use crate::{
    config::SettingHost,
    middlewares::{add_version, logging_route},
};

pub mod error;
// 处理静态文件
pub mod serve;
// 处理反向代理
pub mod reverse_proxy;
// location 匹配与补斜杠规范化
pub mod matcher;
// 上游路径改写
pub mod rewrite;
// Basic 认证
pub mod auth;
// 访问/错误日志
pub mod logs;
// content-type 映射表
pub mod mime;

use auth::AuthOutcome;
use error::{RouteError, RouteResult};
use logs::Outcome;
use matcher::{LocationKind, VirtualHost};
use serve::StaticOutcome;

/// 虚拟主机表
/// 一级键是监听端口，二级键是小写的 server_name（None 表示该端口的默认主机）
/// 启动时构建完成，服务期间只读
pub static HOSTS: LazyLock<DashMap<u16, DashMap<Option<String>, Arc<VirtualHost>>>> =
    LazyLock::new(DashMap::new);

/// 已绑定的监听地址，同端口的多个虚拟主机共享一个监听器
static BOUND: LazyLock<DashMap<String, ()>> = LazyLock::new(DashMap::new);

/// try_files 命名 fallback 的内部转移上限，防止配置成环
const MAX_FALLBACK_DEPTH: usize = 8;

/// 清除所有全局状态
///
/// 此函数主要用于测试场景，确保测试之间的隔离。
#[allow(dead_code)]
pub fn clear_global_state() {
    HOSTS.clear();
    BOUND.clear();
    logs::clear_sinks();
}

/// 监听器信息，通过 Extension 注入到每个请求
/// dispatch 用端口在 HOSTS 中定位虚拟主机表，用 ssl 决定重定向的 scheme
#[derive(Debug, Clone, Copy)]
pub struct Listener {
    pub port: u16,
    pub ssl: bool,
}

/// 单个请求的上下文
///
/// 匹配用解码后的路径，转发用原始路径，两者都保留。
pub struct RequestContext {
    pub method: Method,
    pub scheme: String,
    /// 原始 Host 头部（可能带端口）
    pub host: String,
    pub raw_path: String,
    pub decoded_path: String,
    pub query: Option<String>,
    pub client_ip: SocketAddr,
}

/// 规范化解码后的路径：合并重复斜杠、消解 `.` 和 `..` 段
///
/// 返回 None 表示 `..` 越过了根，调用方必须拒绝该请求，
/// 任何文件系统访问都不得使用未经此步骤的路径。
/// 尾部斜杠保留（补斜杠重定向和目录判断都依赖它）。
pub(crate) fn sanitize_path(path: &str) -> Option<String> {
    let trailing_slash = path.len() > 1 && path.ends_with('/');
    let mut stack: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                stack.pop()?;
            }
            other => stack.push(other),
        }
    }
    let mut out = String::from("/");
    out.push_str(&stack.join("/"));
    if trailing_slash && out.len() > 1 {
        out.push('/');
    }
    Some(out)
}

/// 固定状态码的纯文本响应
pub(crate) fn plain_status(status: StatusCode) -> Response {
    let body = status.canonical_reason().unwrap_or("").to_string();
    (status, body).into_response()
}

/// 301 补斜杠重定向，保留原始 query
pub(crate) fn slash_redirect_response(ctx: &RequestContext) -> RouteResult<Response> {
    let mut target = format!("{}://{}{}/", ctx.scheme, ctx.host, ctx.raw_path);
    if let Some(query) = &ctx.query {
        target.push('?');
        target.push_str(query);
    }
    let response = Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(
            LOCATION,
            HeaderValue::from_str(&target).map_err(|_| RouteError::BadRequest())?,
        )
        .body(Body::empty())
        .map_err(|err| RouteError::Any(anyhow!("build redirect response: {err}")))?;
    Ok(response)
}

/// 401 响应，带 Basic 质询
fn unauthorized_response(realm: &str) -> RouteResult<Response> {
    let challenge = format!(r#"Basic realm="{realm}""#);
    let response = Response::builder()
        .status(StatusCode::UNAUTHORIZED)
        .header(
            WWW_AUTHENTICATE,
            HeaderValue::from_str(&challenge).map_err(|_| RouteError::InternalError())?,
        )
        .body(Body::from("Unauthorized"))
        .map_err(|err| RouteError::Any(anyhow!("build auth response: {err}")))?;
    Ok(response)
}

/// 按端口和域名查虚拟主机
/// 精确匹配小写的 server_name，找不到时回该端口的默认主机
fn find_vhost(port: u16, domain: &str) -> Option<Arc<VirtualHost>> {
    let port_config = HOSTS.get(&port)?;
    let domain = domain.to_lowercase();
    if let Some(entry) = port_config.get(&Some(domain)) {
        return Some(entry.clone());
    }
    port_config.get(&None).map(|entry| entry.clone())
}

/// 每个请求的入口
///
/// 流程：解析 Host → 查虚拟主机 → location 匹配 → 补斜杠重定向短路 →
/// 认证 → 按 location 类型分发 → 记录终态日志。
/// 没有命中的虚拟主机或 location 一律回固定的 410。
pub async fn dispatch(
    Extension(listener): Extension<Listener>,
    ConnectInfo(client_ip): ConnectInfo<SocketAddr>,
    request: Request,
) -> RouteResult<Response> {
    let port = listener.port;
    // origin-form 请求行不带 scheme，监听器自己知道有没有 TLS
    let scheme = if listener.ssl { "https" } else { "http" }.to_string();
    let host = request
        .headers()
        .get("host") // 注意：host 是小写的
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let (domain, _) = host.split_once(':').unwrap_or((host.as_str(), ""));

    let Some(vhost) = find_vhost(port, domain) else {
        debug!("no virtual host for {host:?} on port {port}");
        return Ok(plain_status(StatusCode::GONE));
    };

    let method = request.method().clone();
    let raw_path = request.uri().path().to_string();
    let query = request.uri().query().map(str::to_string);
    let decoded = match urlencoding::decode(&raw_path) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => raw_path.clone(),
    };
    let Some(decoded_path) = sanitize_path(&decoded) else {
        debug!("path escapes root: {decoded:?}");
        logs::record(
            &vhost.fallback_logs,
            &method,
            &raw_path,
            StatusCode::BAD_REQUEST,
            Outcome::Completed,
        )
        .await;
        return Ok(plain_status(StatusCode::BAD_REQUEST));
    };

    let ctx = RequestContext {
        method,
        scheme,
        host,
        raw_path,
        decoded_path,
        query,
        client_ip,
    };

    let Some(location) = vhost.matched(&ctx.decoded_path) else {
        debug!("no location matched {:?}", ctx.decoded_path);
        logs::record(
            &vhost.fallback_logs,
            &ctx.method,
            &ctx.raw_path,
            StatusCode::GONE,
            Outcome::Completed,
        )
        .await;
        return Ok(plain_status(StatusCode::GONE));
    };
    debug!("location matched: {:?}", location.prefix);

    // 裸前缀请求的补斜杠重定向，命中后不再有任何后续处理
    if matcher::needs_slash_redirect(&location, &ctx.decoded_path) {
        let response = slash_redirect_response(&ctx)?;
        logs::record(
            &location.logs,
            &ctx.method,
            &ctx.raw_path,
            StatusCode::MOVED_PERMANENTLY,
            Outcome::Completed,
        )
        .await;
        return Ok(response);
    }

    handle_location(&vhost, location, ctx, request).await
}

/// 从认证开始处理一条选中的 location
/// try_files 的命名 fallback 会带着同一个请求回到这里的循环顶部
async fn handle_location(
    vhost: &VirtualHost,
    mut location: Arc<matcher::Location>,
    ctx: RequestContext,
    request: Request,
) -> RouteResult<Response> {
    let mut depth = 0;
    loop {
        // AuthGate
        if let Some(rule) = &location.auth {
            let outcome = auth::check(request.headers(), rule);
            if outcome != AuthOutcome::Granted {
                let log_outcome = match &outcome {
                    AuthOutcome::Missing => Outcome::AuthMissing,
                    other => {
                        Outcome::AuthFailed(auth::error_detail(other).unwrap_or_default())
                    }
                };
                let response = unauthorized_response(&rule.realm)?;
                logs::record(
                    &location.logs,
                    &ctx.method,
                    &ctx.raw_path,
                    StatusCode::UNAUTHORIZED,
                    log_outcome,
                )
                .await;
                return Ok(response);
            }
        }

        let fallback = match &location.kind {
            LocationKind::Static { root } => {
                match serve::serve_static(&location, root, &ctx, request.headers()).await? {
                    StaticOutcome::Ready(response, outcome) => {
                        logs::record(
                            &location.logs,
                            &ctx.method,
                            &ctx.raw_path,
                            response.status(),
                            outcome,
                        )
                        .await;
                        return Ok(response);
                    }
                    StaticOutcome::Fallback(name) => name,
                }
            }
            LocationKind::Proxy {
                target,
                redirect,
                timeout,
            } => {
                let (response, outcome) = reverse_proxy::forward(
                    &location.prefix,
                    target,
                    redirect,
                    *timeout,
                    &ctx,
                    request,
                )
                .await?;
                logs::record(
                    &location.logs,
                    &ctx.method,
                    &ctx.raw_path,
                    response.status(),
                    outcome,
                )
                .await;
                return Ok(response);
            }
            LocationKind::Redirect { to, code } => {
                let status = StatusCode::from_u16(*code)
                    .unwrap_or(StatusCode::MOVED_PERMANENTLY);
                let response = Response::builder()
                    .status(status)
                    .header(
                        LOCATION,
                        HeaderValue::from_str(to).map_err(|_| RouteError::InternalError())?,
                    )
                    .body(Body::empty())
                    .map_err(|err| {
                        RouteError::Any(anyhow!("build redirect response: {err}"))
                    })?;
                logs::record(
                    &location.logs,
                    &ctx.method,
                    &ctx.raw_path,
                    status,
                    Outcome::Completed,
                )
                .await;
                return Ok(response);
            }
            LocationKind::Status { status, body } => {
                let status =
                    StatusCode::from_u16(*status).map_err(|_| RouteError::InternalError())?;
                let mut builder = Response::builder().status(status);
                let response = match body {
                    Some(text) => {
                        builder = builder.header(
                            CONTENT_TYPE,
                            HeaderValue::from_static(mime::TEXT_PLAIN),
                        );
                        builder.body(Body::from(text.clone()))
                    }
                    None => builder.body(Body::empty()),
                }
                .map_err(|err| RouteError::Any(anyhow!("build status response: {err}")))?;
                logs::record(
                    &location.logs,
                    &ctx.method,
                    &ctx.raw_path,
                    status,
                    Outcome::Completed,
                )
                .await;
                return Ok(response);
            }
        };

        // try_files 的内部转移：不产生客户端可见的重定向，
        // 换一条 location 从认证重新走一遍
        depth += 1;
        if depth > MAX_FALLBACK_DEPTH {
            error!("named fallback depth exceeded at @{fallback}");
            return Ok(plain_status(StatusCode::INTERNAL_SERVER_ERROR));
        }
        match vhost.named(&fallback) {
            Some(next) => {
                debug!("internal transfer to @{fallback}");
                location = next;
            }
            None => {
                warn!("named location @{fallback} not found");
                logs::record(
                    &location.logs,
                    &ctx.method,
                    &ctx.raw_path,
                    StatusCode::NOT_FOUND,
                    Outcome::NotFound,
                )
                .await;
                return Ok(plain_status(StatusCode::NOT_FOUND));
            }
        }
    }
}

/// 注册一个虚拟主机并在需要时绑定监听器
///
/// 返回 None 表示该地址已有监听器（同端口的后续虚拟主机只注册不绑定）。
pub async fn make_server(host: &SettingHost) -> anyhow::Result<Option<Handle<SocketAddr>>> {
    debug!("make_server start with host: {:?}", host);
    let vhost = Arc::new(VirtualHost::build(host).await?);
    let server_name = vhost.server_name.as_ref().map(|name| name.to_lowercase());

    // 保存主机到映射中
    if let Some(port_entry) = HOSTS.get_mut(&host.port) {
        port_entry.insert(server_name, vhost);
    } else {
        let domain_map = DashMap::new();
        domain_map.insert(server_name, vhost);
        HOSTS.insert(host.port, domain_map);
    }

    let addr = format!("{}:{}", host.ip, host.port);
    if BOUND.contains_key(&addr) {
        debug!("listener already bound on {addr}");
        return Ok(None);
    }
    BOUND.insert(addr.clone(), ());

    let mut router = Router::new().fallback(dispatch);
    router = router.layer(
        ServiceBuilder::new()
            .layer(Extension(Listener {
                port: host.port,
                ssl: host.ssl,
            }))
            .layer(axum::middleware::from_fn(add_version))
            .layer(TimeoutLayer::new(Duration::from_secs(host.timeout.into()))),
    );
    router = logging_route(router);

    let addr: SocketAddr = addr.parse()?;
    let handle = Handle::new();
    let handle_clone = handle.clone();
    let (ssl, certificate, certificate_key) = (
        host.ssl,
        host.certificate.clone(),
        host.certificate_key.clone(),
    );

    // 生成一个任务来运行服务器
    tokio::spawn(async move {
        let served = if ssl {
            match (certificate, certificate_key) {
                (Some(cert), Some(key)) => {
                    debug!("Certificate: {} Certificate key: {}", cert, key);
                    match RustlsConfig::from_pem_file(&cert, &key).await {
                        Ok(rustls_config) => {
                            info!("Listening on https://{}", addr);
                            axum_server::bind_rustls(addr, rustls_config)
                                .handle(handle_clone)
                                .serve(
                                    router.into_make_service_with_connect_info::<SocketAddr>(),
                                )
                                .await
                                .map_err(anyhow::Error::from)
                        }
                        Err(e) => Err(anyhow::Error::from(e)),
                    }
                }
                _ => Err(anyhow!("SSL enabled but certificate or key missing")),
            }
        } else {
            info!("Listening on http://{}", addr);
            axum_server::bind(addr)
                .handle(handle_clone)
                .serve(router.into_make_service_with_connect_info::<SocketAddr>())
                .await
                .map_err(anyhow::Error::from)
        };
        if let Err(err) = served {
            error!("Server on {addr} exited: {err}");
        }
    });

    Ok(Some(handle))
}

/// 启动所有服务器
///
/// 单个主机启动失败会被记录为错误日志，不会中断其他主机的启动。
pub async fn start_servers(hosts: &[SettingHost]) -> Vec<Handle<SocketAddr>> {
    let mut handles = Vec::new();
    for host in hosts {
        let server_addr = format!("{}:{}", host.ip, host.port);
        match make_server(host).await {
            Ok(Some(handle)) => {
                handles.push(handle);
                info!("Server instance started on {}", server_addr);
            }
            Ok(None) => {
                info!("Virtual host registered on {}", server_addr);
            }
            Err(e) => {
                error!(
                    "Failed to start server instance on {}: {:?}",
                    server_addr, e
                );
            }
        }
    }
    handles
}

/// 优雅关闭所有服务器
pub async fn shutdown_servers(handles: &mut Vec<Handle<SocketAddr>>) {
    for handle in handles.iter() {
        handle.graceful_shutdown(Some(std::time::Duration::from_secs(30)));
    }
    handles.clear();
    info!("All servers have been signaled to shut down");
}
