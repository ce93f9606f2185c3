use anyhow::Result;
use clap::Parser;
use owo_colors::OwoColorize;
use std::fs::OpenOptions;
use tracing_appender::non_blocking;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use logfetcher::config::{self, GeneralConfig};
use logfetcher::{cli, scheduler};

fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    match cli.command {
        cli::Commands::Fetch { verbose } => run_fetch(verbose),
    }
}

fn run_fetch(verbose: bool) -> Result<()> {
    let cfg_path = config::config_path();
    // 配置错误在任何抓取开始前以非零退出；解析错误带脱字符指示行
    let cfg = match config::load(&cfg_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}", format!("⚠️ {}", e).red());
            std::process::exit(1);
        }
    };
    init_tracing(&cfg.general, verbose);

    // 启动即解析 ssh 可执行文件；缺失时尽早失败
    let ssh_program = match which::which("ssh") {
        Ok(p) => p,
        Err(e) => {
            eprintln!("{}", format!("⚠️ 找不到 ssh 可执行文件: {}", e).red());
            std::process::exit(1);
        }
    };

    tracing::info!(
        "[fetch] 启动: {} 台主机, 配置 {}",
        cfg.hosts.len(),
        cfg_path.display()
    );
    let sched = scheduler::Scheduler::new(&cfg, ssh_program)?;
    sched.run()
}

fn init_tracing(general: &GeneralConfig, verbose: bool) {
    // Initialize tracing to the configured log file; --verbose forces debug
    // level and mirrors everything to stdout.
    if let Some(parent) = general.log_file.parent()
        && !parent.as_os_str().is_empty()
    {
        let _ = std::fs::create_dir_all(parent);
    }
    let level = if verbose { "debug" } else { general.log_level.as_filter() };

    match OpenOptions::new().create(true).append(true).open(&general.log_file) {
        Ok(file) => {
            let (non_blocking_writer, guard) = non_blocking(file);
            // Leak the worker guard so the background writer thread stays
            // alive for the whole process; dropping it would lose log lines.
            let _ = Box::leak(Box::new(guard));
            let file_layer = fmt::layer()
                .with_writer(non_blocking_writer)
                .with_ansi(false)
                .with_filter(EnvFilter::new(level));
            if verbose {
                let stdout_layer =
                    fmt::layer().with_writer(std::io::stdout).with_filter(EnvFilter::new(level));
                tracing_subscriber::registry().with(file_layer).with(stdout_layer).init();
            } else {
                tracing_subscriber::registry().with(file_layer).init();
            }
        }
        Err(e) => {
            eprintln!(
                "warning: could not open log file at {}: {}",
                general.log_file.display(),
                e
            );
            if verbose {
                let stdout_layer =
                    fmt::layer().with_writer(std::io::stdout).with_filter(EnvFilter::new(level));
                tracing_subscriber::registry().with(stdout_layer).init();
            }
        }
    }
}
