//! 集成测试的公共辅助函数和工具

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use axum::Router;
use tempfile::TempDir;

use nougat::config::Settings;
use nougat::http;

/// 写入临时配置文件
/// 临时目录被有意泄漏，保证测试期间文件不被删除
pub fn write_config(content: &str) -> Result<PathBuf> {
    let temp_dir = TempDir::new()?;
    let config_path = temp_dir.path().join("config.toml");
    std::fs::write(&config_path, content)?;
    let _ = Box::leak(Box::new(temp_dir));
    Ok(config_path)
}

/// 启动测试服务器并等待所有监听端口就绪
pub async fn start_test_server(
    config_path: &Path,
) -> Result<Vec<axum_server::Handle<SocketAddr>>> {
    let settings =
        Settings::new(config_path.to_str().expect("Invalid path")).expect("Failed to load config");
    let ports: Vec<u16> = settings.host.iter().map(|host| host.port).collect();
    let handles = http::start_servers(&settings.host).await;
    for port in ports {
        wait_for_port(port).await?;
    }
    Ok(handles)
}

/// 轮询端口直到能建立 TCP 连接
pub async fn wait_for_port(port: u16) -> Result<()> {
    for _ in 0..100 {
        if tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .is_ok()
        {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    anyhow::bail!("server on port {port} did not start")
}

/// 在指定端口上启动一个上游 stub 服务器
pub async fn start_upstream(port: u16, router: Router) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    wait_for_port(port).await
}

/// 不跟随重定向的测试客户端
/// 重定向类测试需要读取原始的 Location 头部
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .expect("Failed to build test client")
}

/// 在一条裸 TCP 连接上发送请求并读完整个响应
///
/// reqwest 会在发送前规范化 URL 路径，点段和编码字节类的用例
/// 需要绕过它，把请求行原样送出去。
pub async fn raw_get(port: u16, path: &str) -> Result<String> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port)).await?;
    let request =
        format!("GET {path} HTTP/1.1\r\nhost: 127.0.0.1:{port}\r\nconnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;
    Ok(String::from_utf8_lossy(&response).into_owned())
}

/// 发送 GET 请求到测试服务器
pub async fn get(port: u16, path: &str) -> Result<reqwest::Response> {
    client()
        .get(format!("http://127.0.0.1:{port}{path}"))
        .send()
        .await
        .map_err(Into::into)
}
