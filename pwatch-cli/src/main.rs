//! pwatch CLI - コマンドラインインターフェース
//!
//! 指定したプロセスの全スレッドにハードウェアウォッチポイントを設定し、
//! トラップごとのレジスタを標準出力に1行ずつ書き出します。

use anyhow::{bail, Context, Result};
use clap::Parser;
use pwatch_core::parse::{parse_address, parse_kind, parse_len};
use pwatch_core::{Arch, EventLoop, ProcTasks, SampleData, Session, TaskEnumerator, WatchRequest};
use std::io::{self, Write};
use tracing_subscriber::EnvFilter;

/// pwatch - Hardware watchpoint tracer
#[derive(Parser)]
#[command(name = "pwatch")]
#[command(version)]
#[command(
    about = "Stream register snapshots on every access to a memory address",
    long_about = None
)]
struct Cli {
    /// Process ID whose threads are watched
    pid: i32,

    /// Address to watch (hexadecimal, 0x prefix optional)
    addr: String,

    /// Access kind: r, w, rw or x
    #[arg(default_value = "w")]
    kind: String,

    /// Watched length in bytes: 1, 2, 4 or 8
    #[arg(default_value = "4")]
    len: String,

    /// Ring size exponent (2^N data pages per thread)
    #[arg(long = "ring-exp", default_value_t = 1)]
    ring_exp: u32,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let arch = Arch::native()?;
    let request = WatchRequest::new(
        parse_address(&cli.addr)?,
        parse_len(&cli.len)?,
        parse_kind(&cli.kind)?,
        arch.clone(),
    );

    let threads = ProcTasks::new().threads(cli.pid);
    if threads.is_empty() {
        bail!("process {} has no threads (or does not exist)", cli.pid);
    }
    tracing::info!("process {} threads: {:?}", cli.pid, threads);

    let mut session = Session::create(&threads, &request, cli.ring_exp).with_context(|| {
        format!(
            "failed to watch 0x{:x} in process {}",
            request.address, cli.pid
        )
    })?;

    if let Err(failure) = session.enable_all() {
        for (tid, e) in &failure.failures {
            tracing::warn!("thread {} not armed: {}", tid, e);
        }
    }

    let stdout = io::stdout();
    let handler = move |sample: &SampleData<'_>| {
        if !sample.abi.has_registers() {
            tracing::debug!("sample from thread {} carries no registers", sample.tid);
            return;
        }
        let line = format_sample(&arch, sample);
        let mut out = stdout.lock();
        // 出力先が閉じられた場合は書けないだけなので無視する
        let _ = writeln!(out, "{}", line);
    };

    let mut event_loop = EventLoop::new(session, handler)?;

    let stop = event_loop.stop_handle();
    ctrlc::set_handler(move || stop.stop()).context("failed to install Ctrl-C handler")?;

    event_loop.run()?;

    let stats = event_loop.stats();
    let mut session = event_loop.into_session();
    if let Err(failure) = session.disable_all() {
        tracing::warn!("{}", failure);
    }
    session.destroy();

    tracing::info!(
        "{} samples, {} lost, {} skipped records, {} exited threads over {} wakeups",
        stats.samples,
        stats.lost,
        stats.skipped,
        stats.exited_threads,
        stats.wakeups
    );

    Ok(())
}

/// ログを初期化する（標準出力はサンプル専用）
fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

/// `name: value` の組をレジスタ番号順に空白区切りで並べる
fn format_sample(arch: &Arch, sample: &SampleData<'_>) -> String {
    arch.named_registers(sample)
        .map(|(name, value)| format!("{}: {:x}", name, value))
        .collect::<Vec<_>>()
        .join(" ")
}
