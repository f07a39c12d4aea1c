//! framepipe CLI: `framepipe send` streams frames to a receiver,
//! `framepipe recv` serves the receiving endpoint.

use clap::{ArgAction, Args, Parser, Subcommand};
use framepipe::config::{
    DEFAULT_CHUNK_BYTES, DEFAULT_CONNS, DEFAULT_DRAIN_GRACE_MS, DEFAULT_FILE_WAIT_MS,
    DEFAULT_LOOKAHEAD, DEFAULT_PATTERN, DEFAULT_POLL_MS, DEFAULT_RECV_WORKERS, DEFAULT_STABLE_MS,
};
use framepipe::{logging, receiver, sender, ReceiverConfig, SenderConfig, TransferError};
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const EXIT_OK: u8 = 0;
const EXIT_CONFIG: u8 = 1;
const EXIT_IO: u8 = 2;
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Debug, Parser)]
#[command(
    name = "framepipe",
    version,
    about = "Low-latency camera frame transfer over TCP"
)]
struct Cli {
    /// Increase verbosity (-v logs each file event, -vv enables trace)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Scan a source directory and stream ready frames to a receiver
    Send(SendArgs),
    /// Accept frame streams and commit them atomically under an output directory
    Recv(RecvArgs),
}

#[derive(Debug, Args)]
struct SendArgs {
    /// Source directory to scan
    #[arg(long)]
    src_dir: PathBuf,

    /// Receiver host
    #[arg(long)]
    host: String,

    /// Receiver port
    #[arg(long)]
    port: u16,

    /// Glob filter for candidate names
    #[arg(long, default_value = DEFAULT_PATTERN)]
    pattern: String,

    /// Skip names lexicographically <= this marker
    #[arg(long, default_value = "")]
    start_after: String,

    /// Worker / connection count
    #[arg(long, default_value_t = DEFAULT_CONNS)]
    conns: usize,

    /// Readiness lookahead K (0 disables)
    #[arg(long, default_value_t = DEFAULT_LOOKAHEAD)]
    lookahead: usize,

    /// Milliseconds between size-stability samples
    #[arg(long, default_value_t = DEFAULT_STABLE_MS)]
    stable_ms: u64,

    /// Milliseconds to wait for a candidate that vanished before the probe
    #[arg(long, default_value_t = DEFAULT_FILE_WAIT_MS)]
    file_wait_ms: u64,

    /// Stop after this many successful transfers (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    max_files: u64,

    /// Destination prefix on the receiver (enables the with-dest protocol)
    #[arg(long, default_value = "")]
    dest_path: String,

    /// Preserve paths relative to src_dir instead of sending basenames
    #[arg(long)]
    preserve_structure: bool,

    /// Remove stale .part files from src_dir at startup
    #[arg(long)]
    cleanup_part_files: bool,

    /// Exit after the current backlog drains
    #[arg(long)]
    once: bool,

    /// Announce the backlog size per connection (requires --conns=1 --once)
    #[arg(long)]
    count_first: bool,

    /// Socket send chunk size in bytes
    #[arg(long, default_value_t = DEFAULT_CHUNK_BYTES)]
    chunk_bytes: usize,

    /// Directory scan interval in milliseconds
    #[arg(long, default_value_t = DEFAULT_POLL_MS)]
    poll_ms: u64,

    /// Once mode: drain the backlog without lookahead after this many
    /// milliseconds without new files
    #[arg(long, default_value_t = DEFAULT_DRAIN_GRACE_MS)]
    drain_grace_ms: u64,

    /// Print final stats as JSON
    #[arg(long)]
    json_stats: bool,
}

#[derive(Debug, Args)]
struct RecvArgs {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0")]
    listen_ip: IpAddr,

    /// Port to listen on
    #[arg(long)]
    port: u16,

    /// Base output directory
    #[arg(long)]
    out_dir: PathBuf,

    /// Accept-loop count when --reuseport is set
    #[arg(long, default_value_t = DEFAULT_RECV_WORKERS)]
    workers: usize,

    /// Bind one socket per worker with SO_REUSEPORT
    #[arg(long)]
    reuseport: bool,

    /// Expect a file-count header at the start of each session
    #[arg(long)]
    expect_count_first: bool,

    /// Accept frames carrying destination paths
    #[arg(long)]
    use_dest_paths: bool,

    /// fsync each file before the atomic rename
    #[arg(long)]
    fsync: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            return ExitCode::from(EXIT_IO);
        }
    };
    ExitCode::from(runtime.block_on(run(cli)))
}

async fn run(cli: Cli) -> u8 {
    // Single cancellation root: SIGINT stops the scanner, in-flight files
    // get a grace period, then sockets close.
    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received; shutting down");
                cancel.cancel();
            }
        })
    };

    let code = match cli.command {
        Command::Send(args) => run_send(args, cli.verbose > 0, cancel.clone()).await,
        Command::Recv(args) => run_recv(args, cancel.clone()).await,
    };

    interrupt.abort();
    if cancel.is_cancelled() && code == EXIT_OK {
        EXIT_INTERRUPTED
    } else {
        code
    }
}

async fn run_send(args: SendArgs, verbose: bool, cancel: CancellationToken) -> u8 {
    let json_stats = args.json_stats;
    let config = SenderConfig {
        src_dir: args.src_dir,
        host: args.host,
        port: args.port,
        pattern: args.pattern,
        start_after: args.start_after,
        conns: args.conns,
        lookahead: args.lookahead,
        stable_ms: args.stable_ms,
        file_wait_ms: args.file_wait_ms,
        max_files: args.max_files,
        dest_path: args.dest_path,
        preserve_structure: args.preserve_structure,
        cleanup_part_files: args.cleanup_part_files,
        once: args.once,
        count_first: args.count_first,
        chunk_bytes: args.chunk_bytes,
        poll_ms: args.poll_ms,
        drain_grace_ms: args.drain_grace_ms,
        verbose,
        json_stats,
    };

    match sender::run(config, cancel).await {
        Ok(stats) => {
            let summary = if json_stats {
                stats.to_json().unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"))
            } else {
                stats.summary_line()
            };
            println!("{summary}");
            EXIT_OK
        }
        Err(e) => classify(e),
    }
}

async fn run_recv(args: RecvArgs, cancel: CancellationToken) -> u8 {
    let config = ReceiverConfig {
        listen_ip: args.listen_ip,
        port: args.port,
        out_dir: args.out_dir,
        workers: args.workers,
        reuseport: args.reuseport,
        expect_count_first: args.expect_count_first,
        use_dest_paths: args.use_dest_paths,
        fsync: args.fsync,
        verbose: false,
    };

    let listener = match receiver::Listener::bind(config).await {
        Ok(listener) => listener,
        Err(e) => return classify(e.into()),
    };
    match listener.serve(cancel).await {
        Ok(()) => EXIT_OK,
        Err(e) => classify(e.into()),
    }
}

fn classify(e: anyhow::Error) -> u8 {
    error!("{e:#}");
    match e.downcast_ref::<TransferError>() {
        Some(TransferError::Config(_)) => EXIT_CONFIG,
        _ => EXIT_IO,
    }
}
