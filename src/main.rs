//! terminal-rag CLI 진입점

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use terminal_rag::config::{AppConfig, LogFormat};

fn main() -> Result<()> {
    let cli = terminal_rag::cli::Cli::parse();

    // 설정 로드 (기본값 → 파일 → RAG_* 환경 변수)
    let config = AppConfig::load(cli.config.as_deref()).context("설정 로드 실패")?;

    // 로깅 초기화 (RUST_LOG가 있으면 우선)
    let level = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match config.logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init(),
    }

    // CLI 실행
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(terminal_rag::cli::run(cli, config))
}
