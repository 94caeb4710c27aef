//! 静态文件服务
//!
//! 处理顺序：try_files（若配置）→ 目录的 index 文件链 → 自动目录索引。
//! 目录存在但请求没带尾部斜杠时补 301，文件用流式传输并带弱 ETag。

use std::{path::PathBuf, time::UNIX_EPOCH};

use anyhow::{Context, anyhow};
use axum::{
    body::Body,
    response::{IntoResponse, Response},
};
use http::{
    HeaderMap, HeaderValue, StatusCode,
    header::{CONTENT_TYPE, ETAG, IF_NONE_MATCH},
};
use tokio::fs::{self, File};
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::http::{
    RequestContext,
    error::RouteResult,
    logs::Outcome,
    matcher::{Location, TryFilesStep},
    mime, plain_status, slash_redirect_response,
};

/// 静态处理的结果
pub enum StaticOutcome {
    /// 响应已就绪，带日志终态
    Ready(Response, Outcome),
    /// try_files 耗尽，内部转移到命名 location
    Fallback(String),
}

/// 处理一条静态 location
pub async fn serve_static(
    location: &Location,
    root: &str,
    ctx: &RequestContext,
    req_headers: &HeaderMap,
) -> RouteResult<StaticOutcome> {
    // try_files 接管整个候选链
    if let Some(steps) = &location.try_files {
        return try_files(steps, root, ctx, req_headers).await;
    }

    let fs_path = format!("{root}{}", ctx.decoded_path);
    debug!("static fs path: {fs_path}");

    match fs::metadata(&fs_path).await {
        Ok(meta) if meta.is_dir() => {
            if !ctx.decoded_path.ends_with('/') {
                // 目录存在但路径没带斜杠，补斜杠重定向
                return Ok(StaticOutcome::Ready(
                    slash_redirect_response(ctx)?,
                    Outcome::Completed,
                ));
            }
            // 按顺序尝试 index 文件
            for index in &location.index {
                let candidate = format!("{fs_path}{index}");
                if is_regular_file(&candidate).await {
                    let response = stream_file(candidate.into(), req_headers).await?;
                    return Ok(StaticOutcome::Ready(response, Outcome::Completed));
                }
            }
            if location.auto_index {
                let html = render_autoindex(&ctx.decoded_path, &fs_path).await?;
                let mut headers = HeaderMap::new();
                headers.insert(CONTENT_TYPE, HeaderValue::from_static(mime::TEXT_HTML));
                return Ok(StaticOutcome::Ready(
                    (headers, html).into_response(),
                    Outcome::Completed,
                ));
            }
            // 没有 index 也不允许列目录
            Ok(StaticOutcome::Ready(
                plain_status(StatusCode::FORBIDDEN),
                Outcome::Completed,
            ))
        }
        Ok(_) => {
            let response = stream_file(fs_path.into(), req_headers).await?;
            Ok(StaticOutcome::Ready(response, Outcome::Completed))
        }
        Err(_) => {
            debug!("static path does not exist: {fs_path}");
            Ok(StaticOutcome::Ready(
                plain_status(StatusCode::NOT_FOUND),
                Outcome::NotFound,
            ))
        }
    }
}

/// 按 try_files 的候选链找第一个存在的普通文件
async fn try_files(
    steps: &[TryFilesStep],
    root: &str,
    ctx: &RequestContext,
    req_headers: &HeaderMap,
) -> RouteResult<StaticOutcome> {
    for step in steps {
        match step {
            TryFilesStep::Template(template) => {
                let candidate = format!("{root}{}", template.replace("$uri", &ctx.decoded_path));
                debug!("try_files candidate: {candidate}");
                if is_regular_file(&candidate).await {
                    let response = stream_file(candidate.into(), req_headers).await?;
                    return Ok(StaticOutcome::Ready(response, Outcome::Completed));
                }
            }
            TryFilesStep::NamedFallback(name) => {
                return Ok(StaticOutcome::Fallback(name.clone()));
            }
        }
    }
    Ok(StaticOutcome::Ready(
        plain_status(StatusCode::NOT_FOUND),
        Outcome::NotFound,
    ))
}

async fn is_regular_file(path: &str) -> bool {
    fs::metadata(path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}

/// 将文件流式传输为 HTTP 响应
///
/// 带弱 ETag，命中 If-None-Match 时返回 304 空响应体。
pub async fn stream_file(path: PathBuf, req_headers: &HeaderMap) -> RouteResult<Response> {
    let file = File::open(&path)
        .await
        .with_context(|| format!("open file failed: {path:?}"))?;

    let path_str = path
        .to_str()
        .ok_or(anyhow!("convert path to string failed"))?;
    let etag = calculate_etag(&file, path_str).await?;

    let mut response = Response::builder();
    let headers = response
        .headers_mut()
        .with_context(|| "insert header failed")?;
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(mime::content_type_for(path_str)),
    );
    headers.insert(
        ETAG,
        HeaderValue::from_str(&etag).with_context(|| "insert header failed")?,
    );

    let not_modified = req_headers
        .get(IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == etag);
    if not_modified {
        return Ok(response
            .status(StatusCode::NOT_MODIFIED)
            .body(Body::empty())
            .with_context(|| "failed to build HTTP response")?);
    }

    let body = Body::from_stream(ReaderStream::new(file));
    Ok(response
        .body(body)
        .with_context(|| "failed to build HTTP response with body")?)
}

/// 使用修改时间和文件大小计算弱 ETag（简化且足够唯一）
async fn calculate_etag(file: &File, path: &str) -> anyhow::Result<String> {
    let metadata = file
        .metadata()
        .await
        .with_context(|| "get file metadata failed")?;

    let modified_timestamp = metadata
        .modified()
        .with_context(|| "get file modified time failed")?
        .duration_since(UNIX_EPOCH)
        .with_context(|| "calculate unix timestamp failed")?
        .as_secs();

    let etag_data = format!("{}-{}-{}", path, modified_timestamp, metadata.len());
    let etag = format!("W/\"{:x}\"", md5::compute(etag_data));
    debug!("file {path:?} etag: {etag:?}");

    Ok(etag)
}

/// 生成目录索引页面，每个条目一个锚点
async fn render_autoindex(request_path: &str, fs_path: &str) -> RouteResult<String> {
    let mut entries = fs::read_dir(fs_path)
        .await
        .with_context(|| format!("read dir failed: {fs_path}"))?;

    let mut names = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| "read dir entry failed")?
    {
        let mut name = entry.file_name().to_string_lossy().to_string();
        let is_dir = entry
            .file_type()
            .await
            .map(|t| t.is_dir())
            .unwrap_or(false);
        if is_dir {
            name.push('/');
        }
        names.push(name);
    }
    names.sort();

    let rows = names
        .iter()
        .map(|name| {
            // 目录名的尾部斜杠不参与百分号编码
            let (bare, slash) = match name.strip_suffix('/') {
                Some(bare) => (bare, "/"),
                None => (name.as_str(), ""),
            };
            let href = format!("{}{slash}", urlencoding::encode(bare));
            let text = escape_html(name);
            format!(r#"<a href="{href}">{text}</a>"#)
        })
        .collect::<Vec<_>>()
        .join("\n");

    Ok(format!(
        "<!DOCTYPE html>\n<html>\n<head><title>Index of {request_path}</title></head>\n\
         <body>\n<h1>Index of {request_path}</h1>\n<hr>\n<pre>\n\
         <a href=\"../\">../</a>\n{rows}\n</pre>\n<hr>\n</body>\n</html>\n"
    ))
}

/// HTML 转义目录条目名，属性和文本共用
fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
