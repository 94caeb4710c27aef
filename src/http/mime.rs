// https://developer.mozilla.org/en-US/docs/Web/HTTP/Basics_of_HTTP/MIME_types/Common_types

pub const TEXT_PLAIN: &str = "text/plain";
pub const TEXT_HTML: &str = "text/html";
pub const TEXT_CSS: &str = "text/css";
pub const APPLICATION_JAVASCRIPT: &str = "application/javascript";
pub const APPLICATION_JSON: &str = "application/json";
pub const IMAGE_JPEG: &str = "image/jpeg";
pub const IMAGE_PNG: &str = "image/png";
pub const IMAGE_GIF: &str = "image/gif";
pub const IMAGE_SVG: &str = "image/svg+xml";
pub const APPLICATION_OCTET_STREAM: &str = "application/octet-stream";

/// 根据文件扩展名返回 content-type
///
/// 固定映射表，未知扩展名回退到 `application/octet-stream`。
/// 注意 `.map` 与 `.json` 一样按 JSON 处理（source map 文件）。
pub fn content_type_for(path: &str) -> &'static str {
    let ext = path.rsplit('.').next().unwrap_or_default();
    match ext.to_ascii_lowercase().as_str() {
        "html" => TEXT_HTML,
        "txt" => TEXT_PLAIN,
        "css" => TEXT_CSS,
        "js" => APPLICATION_JAVASCRIPT,
        "json" | "map" => APPLICATION_JSON,
        "jpg" => IMAGE_JPEG,
        "png" => IMAGE_PNG,
        "gif" => IMAGE_GIF,
        "svg" => IMAGE_SVG,
        _ => APPLICATION_OCTET_STREAM,
    }
}
