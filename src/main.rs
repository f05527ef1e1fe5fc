//! Ferry CLI - batch uploads, downloads, and remote management for
//! framed-TCP storage devices.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use ferry::batch;
use ferry::config::Config;
use ferry::connection::DeviceAddr;
use ferry::logger::{JsonLogger, Logger, NoopLogger};
use ferry::orchestrator::{Event, Orchestrator};
use ferry::progress::ProgressSample;
use ferry::resolver::{self, ConflictChoice, ConflictPrompt, DecisionTx};
use ferry::transfer;
use ferry::url::parse_remote_url;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Ferry - high-throughput file transfer to framed-TCP storage devices"
)]
struct Args {
    /// Device host (IP or name); ferry:// URLs override this
    #[arg(long, global = true)]
    host: Option<String>,

    /// Device port
    #[arg(long, global = true)]
    port: Option<u16>,

    /// TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Write JSONL log entries to file
    #[arg(long = "log-file", global = true)]
    log_file: Option<PathBuf>,

    /// Max parallel transfers (0 = auto)
    #[arg(long, global = true)]
    parallel: Option<usize>,

    /// What to do when a file already exists on the device
    #[arg(long = "on-conflict", global = true, value_enum, default_value_t = OnConflict::Ask)]
    on_conflict: OnConflict,

    /// Show individual file operations as they happen
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OnConflict {
    Ask,
    Replace,
    Skip,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload files or directories to a remote directory
    Upload {
        /// Local files and directories
        #[arg(required = true)]
        sources: Vec<PathBuf>,
        /// Remote destination: /path or ferry://host[:port]/path
        dest: String,
    },
    /// Download one remote file
    Download {
        /// Remote file: /path or ferry://host[:port]/path
        remote: String,
        /// Local destination file
        local: PathBuf,
    },
    /// List a remote directory
    Ls { path: String },
    /// Show storage totals
    Df,
    /// Create a remote directory
    Mkdir { path: String },
    /// Delete a remote file
    Rm { path: String },
    /// Delete a remote directory tree
    Rmdir { path: String },
    /// Rename a remote path
    Mv { src: String, dst: String },
    /// Copy a remote file
    Cp { src: String, dst: String },
    /// Connectivity check
    Ping,
    /// Ask the device daemon to exit
    Shutdown,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    rt.block_on(run(args))
}

async fn run(args: Args) -> Result<()> {
    let mut cfg = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(host) = &args.host {
        cfg.host = Some(host.clone());
    }
    if let Some(port) = args.port {
        cfg.port = port;
    }
    if let Some(parallel) = args.parallel {
        cfg.max_parallel = parallel;
    }

    let logger: Arc<dyn Logger> = match &args.log_file {
        Some(path) => Arc::new(JsonLogger::new(path)?),
        None => Arc::new(NoopLogger),
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            eprintln!("\nInterrupted, finishing in-flight writes...");
            cancel.cancel();
        })
        .context("Error setting Ctrl-C handler")?;
    }

    match args.command {
        Command::Upload { sources, dest } => {
            let (addr, remote_base) = split_dest(&cfg, &dest)?;
            upload(
                &cfg,
                addr,
                &sources,
                &remote_base,
                args.on_conflict,
                args.verbose,
                cancel,
                logger,
            )
            .await
        }
        Command::Download { remote, local } => {
            let (addr, remote_path) = split_dest(&cfg, &remote)?;
            download(addr, &remote_path, &local, cancel).await
        }
        Command::Ls { path } => {
            let mut conn = device_addr(&cfg)?.connect().await?;
            let mut entries = conn.list_dir(&path).await?;
            entries.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then(a.name.cmp(&b.name)));
            for e in entries {
                let kind = if e.is_dir { "d" } else { "-" };
                println!(
                    "{} {:>12} {} {}",
                    kind,
                    e.size,
                    e.timestamp.format("%Y-%m-%d %H:%M"),
                    e.name
                );
            }
            Ok(())
        }
        Command::Df => {
            let mut conn = device_addr(&cfg)?.connect().await?;
            for s in conn.list_storage().await? {
                let used = s.total_bytes.saturating_sub(s.free_bytes);
                println!(
                    "{:<16} {:>10} total, {:>10} used, {:>10} free",
                    s.path,
                    fmt_size(s.total_bytes.max(0) as u64),
                    fmt_size(used.max(0) as u64),
                    fmt_size(s.free_bytes.max(0) as u64)
                );
            }
            Ok(())
        }
        Command::Mkdir { path } => {
            device_addr(&cfg)?.connect().await?.create_dir(&path).await?;
            Ok(())
        }
        Command::Rm { path } => {
            device_addr(&cfg)?.connect().await?.delete_file(&path).await?;
            Ok(())
        }
        Command::Rmdir { path } => {
            let mut conn = device_addr(&cfg)?.connect().await?;
            conn.delete_dir(&path, |msg| println!("{}", msg)).await?;
            Ok(())
        }
        Command::Mv { src, dst } => {
            device_addr(&cfg)?.connect().await?.rename(&src, &dst).await?;
            Ok(())
        }
        Command::Cp { src, dst } => {
            device_addr(&cfg)?
                .connect()
                .await?
                .copy_file(&src, &dst)
                .await?;
            Ok(())
        }
        Command::Ping => {
            let addr = device_addr(&cfg)?;
            let started = Instant::now();
            addr.connect().await?.ping().await?;
            println!("{} answered in {:.1} ms", addr, started.elapsed().as_secs_f64() * 1e3);
            Ok(())
        }
        Command::Shutdown => {
            device_addr(&cfg)?.connect().await?.shutdown().await?;
            println!("shutdown sent");
            Ok(())
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn upload(
    cfg: &Config,
    addr: DeviceAddr,
    sources: &[PathBuf],
    remote_base: &str,
    on_conflict: OnConflict,
    verbose: bool,
    cancel: CancellationToken,
    logger: Arc<dyn Logger>,
) -> Result<()> {
    let plan = batch::expand(sources, remote_base)?;
    if plan.jobs.is_empty() {
        println!("nothing to upload");
        return Ok(());
    }
    let total_files = plan.jobs.len();
    let total_bytes = plan.total_bytes();
    println!(
        "Uploading {} files ({}) to {}{}",
        total_files,
        fmt_size(total_bytes),
        addr,
        remote_base
    );

    // Pre-flight on one control connection: directory tree, then duplicates
    let mut control = addr.connect().await?;
    for dir in &plan.dirs {
        if let Err(e) = control.create_dir(dir).await {
            // The device rejects mkdir of an existing directory; harmless
            logger.note(&format!("mkdir {}: {}", dir, e));
        }
    }
    let decisions = decision_provider(on_conflict);
    let jobs = resolver::resolve(&mut control, plan.jobs, &decisions, logger.as_ref()).await?;
    drop(control);
    if jobs.is_empty() {
        println!("all files skipped, nothing to do");
        return Ok(());
    }

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let bar = ProgressBar::new(jobs.iter().map(|j| j.size).sum());
    bar.set_style(
        ProgressStyle::with_template(
            "{bar:32.green} {bytes}/{total_bytes} {bytes_per_sec} eta {eta} {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    let render = {
        let bar = bar.clone();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                match event {
                    Event::Batch(s) => {
                        bar.set_position(s.bytes_sent);
                        bar.set_message(format!("{}/{} files", s.files_done, s.files_total));
                    }
                    Event::JobStarted { remote, .. } if verbose => {
                        bar.println(format!("  start {}", remote));
                    }
                    Event::JobSucceeded { remote, .. } if verbose => {
                        bar.println(format!("  done  {}", remote));
                    }
                    Event::JobRetrying {
                        remote, attempt, error, ..
                    } => {
                        bar.println(format!("  retry {} (attempt {}): {}", remote, attempt, error));
                    }
                    Event::JobFailed { remote, error, .. } => {
                        bar.println(format!("  FAILED {}: {}", remote, error));
                    }
                    Event::ConnectFailed { error } => {
                        bar.println(format!("  connect failed: {}", error));
                    }
                    _ => {}
                }
            }
        })
    };

    let orchestrator = Orchestrator::new(addr, cfg.clone(), cancel, events_tx, logger);
    let report = orchestrator.run(jobs).await;
    // Dropping the orchestrator closes the event channel and ends the renderer
    drop(orchestrator);
    render.await.ok();

    let secs = report.elapsed.as_secs_f64();
    let speed = if secs > 0.0 {
        report.bytes_sent as f64 / secs
    } else {
        0.0
    };
    bar.finish_with_message(format!(
        "{} files, {} in {:.1}s ({}/s)",
        report.succeeded.len(),
        fmt_size(report.bytes_sent),
        secs,
        fmt_size(speed as u64)
    ));

    if !report.failed.is_empty() {
        eprintln!("Failed after retries:");
        for name in &report.failed {
            eprintln!("  {}", name);
        }
    }
    if !report.cancelled.is_empty() {
        eprintln!("Cancelled before completion: {} files", report.cancelled.len());
    }
    if report.all_succeeded() {
        Ok(())
    } else {
        bail!(
            "{} of {} files did not complete",
            report.failed.len() + report.cancelled.len(),
            report.files_total
        );
    }
}

async fn download(
    addr: DeviceAddr,
    remote: &str,
    local: &std::path::Path,
    cancel: CancellationToken,
) -> Result<()> {
    let mut conn = addr.connect().await?;
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{bar:32.cyan} {bytes}/{total_bytes} {bytes_per_sec} eta {eta}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    let bar2 = bar.clone();
    let received = transfer::download_file(&mut conn, remote, local, &cancel, move |s: ProgressSample| {
        bar2.set_length(s.total_bytes);
        bar2.set_position(s.bytes_sent);
    })
    .await?;
    bar.finish();
    println!("downloaded {} ({})", local.display(), fmt_size(received));
    Ok(())
}

/// Interactive or fixed-answer conflict decisions, depending on the flag.
fn decision_provider(on_conflict: OnConflict) -> DecisionTx {
    match on_conflict {
        OnConflict::Replace => resolver::fixed_decision(ConflictChoice::Replace),
        OnConflict::Skip => resolver::fixed_decision(ConflictChoice::Skip),
        OnConflict::Ask => {
            let (tx, mut rx) = mpsc::channel::<ConflictPrompt>(1);
            tokio::spawn(async move {
                while let Some(prompt) = rx.recv().await {
                    let question = format!(
                        "{} exists on device (local {}, remote {}). [r]eplace / [s]kip / [R]eplace all / [S]kip all: ",
                        prompt.file_name,
                        fmt_size(prompt.local_size),
                        fmt_size(prompt.remote_size.max(0) as u64),
                    );
                    let answer = tokio::task::spawn_blocking(move || {
                        use std::io::Write;
                        loop {
                            print!("{}", question);
                            let _ = std::io::stdout().flush();
                            let mut line = String::new();
                            if std::io::stdin().read_line(&mut line).is_err() {
                                return ConflictChoice::Skip;
                            }
                            match line.trim() {
                                "r" => return ConflictChoice::Replace,
                                "s" => return ConflictChoice::Skip,
                                "R" => return ConflictChoice::ReplaceAll,
                                "S" => return ConflictChoice::SkipAll,
                                _ => continue,
                            }
                        }
                    })
                    .await
                    .unwrap_or(ConflictChoice::Skip);
                    let _ = prompt.reply.send(answer);
                }
            });
            tx
        }
    }
}

fn device_addr(cfg: &Config) -> Result<DeviceAddr> {
    let host = cfg
        .host
        .clone()
        .context("no device host: pass --host, set it in the config, or use a ferry:// URL")?;
    Ok(DeviceAddr::new(host, cfg.port))
}

/// A destination is either `ferry://host[:port]/path` or a bare remote path
/// combined with --host/--port.
fn split_dest(cfg: &Config, dest: &str) -> Result<(DeviceAddr, String)> {
    if let Some(url) = parse_remote_url(dest) {
        return Ok((DeviceAddr::new(url.host, url.port), url.path));
    }
    if !dest.starts_with('/') {
        bail!("destination must be an absolute remote path or a ferry:// URL: {dest}");
    }
    Ok((device_addr(cfg)?, dest.to_string()))
}

fn fmt_size(bytes: u64) -> String {
    const KIB: f64 = 1024.0;
    const MIB: f64 = 1024.0 * 1024.0;
    const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
    let b = bytes as f64;
    if b >= GIB {
        format!("{:.2} GiB", b / GIB)
    } else if b >= MIB {
        format!("{:.1} MiB", b / MIB)
    } else if b >= KIB {
        format!("{:.1} KiB", b / KIB)
    } else {
        format!("{} B", bytes)
    }
}
