//! 静态文件服务集成测试

use std::fs;

use anyhow::Result;
use serial_test::serial;
use tempfile::TempDir;

mod common;
use common::*;

/// 建立一个简单的站点目录：
/// index.html、app.js、style.css、hello world.txt 和 subfolder1/index.html
fn site_dir() -> Result<TempDir> {
    let dir = TempDir::new()?;
    fs::write(
        dir.path().join("index.html"),
        "<html><body>Test Page</body></html>",
    )?;
    fs::write(dir.path().join("app.js"), "console.log('hi');")?;
    fs::write(dir.path().join("style.css"), "body {}")?;
    fs::write(dir.path().join("hello world.txt"), "with space")?;
    fs::create_dir(dir.path().join("subfolder1"))?;
    fs::write(
        dir.path().join("subfolder1").join("index.html"),
        "<html><body>subfolder1/index.html</body></html>",
    )?;
    Ok(dir)
}

fn static_config(port: u16, root: &str, extra: &str) -> String {
    format!(
        r#"
[[host]]
ip = "127.0.0.1"
port = {port}

[[host.location]]
location = "/"
root = "{root}"
index = ["index.html"]
{extra}
"#
    )
}

#[tokio::test]
#[serial]
async fn serves_index_file() -> Result<()> {
    let site = site_dir()?;
    let port = 46001;
    let config = write_config(&static_config(port, site.path().to_str().unwrap(), ""))?;
    let _handles = start_test_server(&config).await?;

    let response = get(port, "/").await?;
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap(),
        "text/html"
    );
    assert!(response.text().await?.contains("Test Page"));
    Ok(())
}

#[tokio::test]
#[serial]
async fn missing_file_is_404() -> Result<()> {
    let site = site_dir()?;
    let port = 46002;
    let config = write_config(&static_config(port, site.path().to_str().unwrap(), ""))?;
    let _handles = start_test_server(&config).await?;

    let response = get(port, "/nonexistent.html").await?;
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
#[serial]
async fn directory_without_slash_redirects_with_query() -> Result<()> {
    let site = site_dir()?;
    let port = 46003;
    let config = write_config(&static_config(port, site.path().to_str().unwrap(), ""))?;
    let _handles = start_test_server(&config).await?;

    let response = get(port, "/subfolder1?hello=world").await?;
    assert_eq!(response.status(), reqwest::StatusCode::MOVED_PERMANENTLY);
    // Location 是包含 scheme 和 host 的绝对 URL，query 原样保留
    assert_eq!(
        response
            .headers()
            .get("location")
            .unwrap()
            .to_str()
            .unwrap(),
        format!("http://127.0.0.1:{port}/subfolder1/?hello=world")
    );

    let response = get(port, "/subfolder1/").await?;
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert!(response.text().await?.contains("subfolder1/index.html"));
    Ok(())
}

#[tokio::test]
#[serial]
async fn content_types_from_extension() -> Result<()> {
    let site = site_dir()?;
    let port = 46004;
    let config = write_config(&static_config(port, site.path().to_str().unwrap(), ""))?;
    let _handles = start_test_server(&config).await?;

    let js = get(port, "/app.js").await?;
    assert_eq!(
        js.headers().get("content-type").unwrap().to_str().unwrap(),
        "application/javascript"
    );
    let css = get(port, "/style.css").await?;
    assert_eq!(
        css.headers().get("content-type").unwrap().to_str().unwrap(),
        "text/css"
    );
    Ok(())
}

#[tokio::test]
#[serial]
async fn percent_encoded_path_finds_file() -> Result<()> {
    let site = site_dir()?;
    let port = 46005;
    let config = write_config(&static_config(port, site.path().to_str().unwrap(), ""))?;
    let _handles = start_test_server(&config).await?;

    let response = get(port, "/hello%20world.txt").await?;
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.text().await?, "with space");
    Ok(())
}

#[tokio::test]
#[serial]
async fn autoindex_lists_directory() -> Result<()> {
    let site = site_dir()?;
    let port = 46006;
    let config = write_config(&format!(
        r#"
[[host]]
ip = "127.0.0.1"
port = {port}

[[host.location]]
location = "/"
root = "{root}"
index = ["missing.html"]
auto_index = true
"#,
        root = site.path().to_str().unwrap()
    ))?;
    let _handles = start_test_server(&config).await?;

    let response = get(port, "/").await?;
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body = response.text().await?;
    assert!(body.contains(r#"<a href="app.js">app.js</a>"#));
    // 目录条目带尾部斜杠
    assert!(body.contains(r#"<a href="subfolder1/">subfolder1/</a>"#));
    assert!(body.contains(r#"<a href="../">../</a>"#));
    Ok(())
}

#[tokio::test]
#[serial]
async fn directory_without_index_or_autoindex_is_403() -> Result<()> {
    let site = site_dir()?;
    let port = 46007;
    let config = write_config(&format!(
        r#"
[[host]]
ip = "127.0.0.1"
port = {port}

[[host.location]]
location = "/"
root = "{root}"
index = ["missing.html"]
"#,
        root = site.path().to_str().unwrap()
    ))?;
    let _handles = start_test_server(&config).await?;

    let response = get(port, "/").await?;
    assert_eq!(response.status(), reqwest::StatusCode::FORBIDDEN);
    Ok(())
}

#[tokio::test]
#[serial]
async fn etag_roundtrip_yields_304() -> Result<()> {
    let site = site_dir()?;
    let port = 46008;
    let config = write_config(&static_config(port, site.path().to_str().unwrap(), ""))?;
    let _handles = start_test_server(&config).await?;

    let first = get(port, "/index.html").await?;
    let etag = first
        .headers()
        .get("etag")
        .expect("missing etag")
        .to_str()?
        .to_string();
    assert!(etag.starts_with("W/"));

    let second = client()
        .get(format!("http://127.0.0.1:{port}/index.html"))
        .header("if-none-match", &etag)
        .send()
        .await?;
    assert_eq!(second.status(), reqwest::StatusCode::NOT_MODIFIED);
    assert!(second.text().await?.is_empty());
    Ok(())
}

#[tokio::test]
#[serial]
async fn dot_segments_cannot_escape_root() -> Result<()> {
    let dir = TempDir::new()?;
    let root = dir.path().join("site");
    fs::create_dir(&root)?;
    fs::write(root.join("index.html"), "public")?;
    // root 之外的文件，任何请求都不应该拿到
    fs::write(dir.path().join("secret.txt"), "TOP-SECRET")?;

    let port = 46012;
    let config = write_config(&static_config(port, root.to_str().unwrap(), ""))?;
    let _handles = start_test_server(&config).await?;

    let escaped = raw_get(port, "/../secret.txt").await?;
    assert!(escaped.starts_with("HTTP/1.1 400"));
    assert!(!escaped.contains("TOP-SECRET"));

    let encoded = raw_get(port, "/%2e%2e/secret.txt").await?;
    assert!(encoded.starts_with("HTTP/1.1 400"));
    assert!(!encoded.contains("TOP-SECRET"));

    // 消解后仍在根内的点段是合法的
    let inside = raw_get(port, "/sub/../index.html").await?;
    assert!(inside.starts_with("HTTP/1.1 200"));
    assert!(inside.contains("public"));
    Ok(())
}

#[tokio::test]
#[serial]
async fn try_files_serves_first_existing_candidate() -> Result<()> {
    let site = site_dir()?;
    fs::write(site.path().join("fallback.html"), "fallback page")?;
    let port = 46009;
    let config = write_config(&format!(
        r#"
[[host]]
ip = "127.0.0.1"
port = {port}

[[host.location]]
location = "/"
root = "{root}"
try_files = ["$uri", "/fallback.html"]
"#,
        root = site.path().to_str().unwrap()
    ))?;
    let _handles = start_test_server(&config).await?;

    // 存在的文件直接命中 $uri
    let hit = get(port, "/app.js").await?;
    assert_eq!(hit.status(), reqwest::StatusCode::OK);
    assert_eq!(hit.text().await?, "console.log('hi');");

    // 不存在的路径落到固定候选
    let miss = get(port, "/no/such/page").await?;
    assert_eq!(miss.status(), reqwest::StatusCode::OK);
    assert_eq!(miss.text().await?, "fallback page");
    Ok(())
}

#[tokio::test]
#[serial]
async fn try_files_named_fallback_transfers_internally() -> Result<()> {
    let site = site_dir()?;
    let port = 46010;
    let config = write_config(&format!(
        r#"
[[host]]
ip = "127.0.0.1"
port = {port}

[[host.location]]
location = "/"
root = "{root}"
try_files = ["$uri", "@teapot"]

[[host.location]]
location = "@teapot"
status = 418
status_body = "short and stout"
"#,
        root = site.path().to_str().unwrap()
    ))?;
    let _handles = start_test_server(&config).await?;

    let response = get(port, "/no/such/page").await?;
    // 内部转移不产生重定向，客户端只看到命名 location 的响应
    assert_eq!(response.status(), reqwest::StatusCode::IM_A_TEAPOT);
    assert_eq!(response.text().await?, "short and stout");
    Ok(())
}

#[tokio::test]
#[serial]
async fn try_files_exhausted_is_404() -> Result<()> {
    let site = site_dir()?;
    let port = 46011;
    let config = write_config(&format!(
        r#"
[[host]]
ip = "127.0.0.1"
port = {port}

[[host.location]]
location = "/"
root = "{root}"
try_files = ["$uri", "$uri/index.htm"]
"#,
        root = site.path().to_str().unwrap()
    ))?;
    let _handles = start_test_server(&config).await?;

    let response = get(port, "/no/such/page").await?;
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    Ok(())
}
