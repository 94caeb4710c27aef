use anyhow::{Context, Result};

use clap::Parser;
use config::Settings;
use consts::COMPILER;
use http::{shutdown_servers, start_servers};
use tracing::{debug, info};

use crate::{
    consts::{ARCH, NAME, OS, VERSION},
    utils::init_logger,
};

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

mod cli;
mod config;
mod consts;
mod error;
mod http;
mod middlewares;
mod utils;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    let settings = Settings::new(&args.config).with_context(|| "init config failed")?;

    let _guard = init_logger(settings.log.level.as_str(), settings.log.folder.as_str())
        .with_context(|| "init logger failed")?;

    debug!("settings {:?}", settings);
    info!("{}/{}", NAME, VERSION);
    info!("{}", COMPILER);
    info!("OS: {} {}", OS, ARCH);

    let mut handles = start_servers(&settings.host).await;

    info!("Server started");

    // 保持主线程运行，直到所有服务器停止
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down");

    shutdown_servers(&mut handles).await;

    Ok(())
}
