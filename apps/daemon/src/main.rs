//! armvisor 守护进程
//!
//! 加载配置、构造监督器、启动后台线程，并周期性输出健康与故障状态，Ctrl+C 时优雅退出。

use anyhow::Context;
use armvisor_core::{HealthStatus, Supervisor, SupervisorBuilder, SupervisorConfig};
use clap::Parser;
use crossbeam_channel::{bounded, select, tick};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};

/// armvisor 守护进程
#[derive(Parser, Debug)]
#[command(name = "armvisor-daemon")]
#[command(about = "Robot arm supervisor - task coordination, arbitration and fault monitoring", long_about = None)]
struct Args {
    /// 配置文件路径
    ///
    /// 默认: `<config_dir>/armvisor/config.toml`，不存在时使用内置默认配置
    #[arg(long)]
    config: Option<PathBuf>,

    /// 状态输出间隔（秒）
    #[arg(long, default_value = "10")]
    status_interval: u64,

    /// 以 JSON 输出健康报告
    #[arg(long)]
    json: bool,

    /// 打印生效的配置后退出
    #[arg(long)]
    print_config: bool,

    /// 退出时等待任务完成的最长时间（秒）
    #[arg(long, default_value = "10")]
    shutdown_timeout: u64,
}

/// 默认配置文件路径
fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("armvisor").join("config.toml"))
}

/// 解析配置：显式路径必须存在；默认路径不存在时回退到内置默认值
fn resolve_config(explicit: Option<&Path>) -> anyhow::Result<(SupervisorConfig, Option<PathBuf>)> {
    if let Some(path) = explicit {
        let config = SupervisorConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?;
        return Ok((config, Some(path.to_path_buf())));
    }
    if let Some(path) = default_config_path() {
        if path.is_file() {
            let config = SupervisorConfig::load(&path)
                .with_context(|| format!("loading {}", path.display()))?;
            return Ok((config, Some(path)));
        }
    }
    Ok((SupervisorConfig::default(), None))
}

fn report_status(supervisor: &Supervisor, json: bool) -> anyhow::Result<()> {
    let report = supervisor.health().latest();
    if json {
        println!("{}", serde_json::to_string(&*report)?);
        return Ok(());
    }

    let faults = supervisor.faults().counts();
    let tasks = supervisor.coordinator().stats();
    let (held, total) = supervisor.arbiter().utilization();
    let summary = format!(
        "health {:?} (round {}), {} unresolved fault(s), tasks {} pending / {} running, {}/{} resource(s) held",
        report.status, report.round, faults.unresolved, tasks.pending, tasks.running, held, total
    );
    match report.status {
        HealthStatus::Ok => info!("{}", summary),
        HealthStatus::Degraded => warn!("{}", summary),
        HealthStatus::Failed | HealthStatus::Unknown => {
            error!("{}", summary);
            for check in report.checks.iter().filter(|c| c.status != HealthStatus::Ok) {
                error!("  {}: {:?} - {}", check.name, check.status, check.message);
            }
        },
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("armvisor_core=info".parse()?)
                .add_directive("armvisor_daemon=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let (config, source) = resolve_config(args.config.as_deref())?;
    if args.print_config {
        print!("{}", config.to_toml_string()?);
        return Ok(());
    }
    match &source {
        Some(path) => info!("Using config {}", path.display()),
        None => info!("No config file found, using defaults"),
    }

    let supervisor = SupervisorBuilder::new()
        .config(config)
        .log_events(true)
        .build()
        .context("building supervisor")?;
    supervisor.start().context("starting supervisor")?;

    let (stop_tx, stop_rx) = bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .context("installing Ctrl+C handler")?;

    info!("armvisor daemon started. Press Ctrl+C to stop.");
    let status = tick(Duration::from_secs(args.status_interval.max(1)));
    loop {
        select! {
            recv(stop_rx) -> _ => break,
            recv(status) -> _ => {
                if let Err(e) = report_status(&supervisor, args.json) {
                    warn!("Failed to report status: {:#}", e);
                }
            },
        }
    }

    info!("Shutting down...");
    supervisor
        .shutdown(true, Duration::from_secs(args.shutdown_timeout))
        .context("shutting down supervisor")?;
    Ok(())
}
