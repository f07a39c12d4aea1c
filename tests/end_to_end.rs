//! End-to-end transfer tests over localhost TCP.
//!
//! These verify behavior, not flags: files actually arrive, byte-for-byte
//! identical, only via atomic renames, and hostile frames never touch the
//! filesystem.

use framepipe::config::{ReceiverConfig, SenderConfig};
use framepipe::receiver::Listener;
use framepipe::sender;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

fn write_frames(dir: &Path, camera: &str, count: usize, size: usize) -> Vec<String> {
    let mut names = Vec::new();
    for i in 1..=count {
        let name = format!("frame_{camera}_{i:09}.jpg");
        let mut content = vec![0xabu8; size];
        let tag = (i as u64).to_be_bytes();
        let n = tag.len().min(size);
        content[..n].copy_from_slice(&tag[..n]);
        fs::write(dir.join(&name), &content).unwrap();
        names.push(name);
    }
    names
}

async fn start_receiver(
    out_dir: &Path,
    use_dest_paths: bool,
    expect_count_first: bool,
) -> SocketAddr {
    let config = ReceiverConfig {
        listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        out_dir: out_dir.to_path_buf(),
        workers: 2,
        reuseport: false,
        expect_count_first,
        use_dest_paths,
        fsync: false,
        verbose: false,
    };
    let listener = Listener::bind(config).await.unwrap();
    let addr = listener.local_addr();
    tokio::spawn(listener.serve(CancellationToken::new()));
    addr
}

fn sender_config(src_dir: &Path, addr: SocketAddr) -> SenderConfig {
    SenderConfig {
        src_dir: src_dir.to_path_buf(),
        host: addr.ip().to_string(),
        port: addr.port(),
        conns: 4,
        stable_ms: 1,
        file_wait_ms: 5,
        poll_ms: 10,
        drain_grace_ms: 50,
        once: true,
        ..Default::default()
    }
}

fn assert_identical(src: &Path, dest: &Path, name: &str) {
    let want = fs::read(src.join(name)).unwrap();
    let got = fs::read(dest.join(name)).unwrap();
    assert_eq!(want, got, "content mismatch for {name}");
}

fn part_files(dir: &Path) -> Vec<String> {
    let mut parts = Vec::new();
    for entry in fs::read_dir(dir).unwrap() {
        let name = entry.unwrap().file_name().to_string_lossy().into_owned();
        if name.contains(".part") {
            parts.push(name);
        }
    }
    parts
}

// =============================================================================
// Happy path
// =============================================================================

#[tokio::test]
async fn happy_path_transfers_all_files() {
    let src = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    let names = write_frames(src.path(), "camera01", 100, 4096);

    let addr = start_receiver(dest.path(), false, false).await;
    let stats = sender::run(sender_config(src.path(), addr), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(stats.files_sent, 100);
    assert_eq!(stats.files_failed, 0);
    assert_eq!(stats.bytes, 100 * 4096);
    for name in &names {
        assert_identical(src.path(), dest.path(), name);
    }
    assert!(part_files(dest.path()).is_empty());
}

// =============================================================================
// Start-after filter
// =============================================================================

#[tokio::test]
async fn start_after_skips_earlier_names() {
    let src = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    write_frames(src.path(), "camera01", 20, 1024);

    let addr = start_receiver(dest.path(), false, false).await;
    let mut config = sender_config(src.path(), addr);
    config.start_after = "frame_camera01_000000010.jpg".to_string();
    let stats = sender::run(config, CancellationToken::new()).await.unwrap();

    assert_eq!(stats.files_sent, 10);
    assert!(!dest.path().join("frame_camera01_000000010.jpg").exists());
    assert!(dest.path().join("frame_camera01_000000011.jpg").exists());
    assert!(dest.path().join("frame_camera01_000000020.jpg").exists());
}

// =============================================================================
// Destination paths
// =============================================================================

#[tokio::test]
async fn dest_path_nests_files_under_out_dir() {
    let src = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    let names = write_frames(src.path(), "camera02", 5, 2048);

    let addr = start_receiver(dest.path(), true, false).await;
    let mut config = sender_config(src.path(), addr);
    config.dest_path = "BPL_270625_1/camera02/".to_string();
    let stats = sender::run(config, CancellationToken::new()).await.unwrap();

    assert_eq!(stats.files_sent, 5);
    let nested = dest.path().join("BPL_270625_1/camera02");
    for name in &names {
        assert!(nested.join(name).exists(), "{name} missing under dest path");
    }
}

#[tokio::test]
async fn with_dest_frame_rejected_when_disabled() {
    let src = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    write_frames(src.path(), "camera01", 2, 1024);

    // Receiver runs the legacy protocol only.
    let addr = start_receiver(dest.path(), false, false).await;
    let mut config = sender_config(src.path(), addr);
    config.dest_path = "somewhere".to_string();
    let stats = sender::run(config, CancellationToken::new()).await.unwrap();

    assert_eq!(stats.files_sent, 0);
    assert_eq!(stats.files_failed, 2);
}

// =============================================================================
// Path traversal
// =============================================================================

#[tokio::test]
async fn traversal_frame_is_rejected_without_writes() {
    let dest_root = TempDir::new().unwrap();
    let out_dir = dest_root.path().join("out");
    let addr = start_receiver(&out_dir, true, false).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let name = b"../../etc/passwd";
    stream.write_all(&[0x01]).await.unwrap();
    stream
        .write_all(&(name.len() as u32).to_be_bytes())
        .await
        .unwrap();
    stream.write_all(name).await.unwrap();
    stream.write_all(&4u64.to_be_bytes()).await.unwrap();
    stream.write_all(b"evil").await.unwrap();

    // The receiver must close without acking.
    let mut ack = [0u8; 1];
    let read = stream.read(&mut ack).await.unwrap_or(0);
    assert_eq!(read, 0, "receiver acked a traversal frame");

    tokio::time::sleep(Duration::from_millis(50)).await;
    let entries: Vec<_> = fs::read_dir(&out_dir).unwrap().collect();
    assert!(entries.is_empty(), "traversal frame left files behind");
    let escaped: Vec<_> = fs::read_dir(dest_root.path())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(escaped, vec![std::ffi::OsString::from("out")]);
}

#[tokio::test]
async fn traversal_dest_is_rejected() {
    let dest = TempDir::new().unwrap();
    let addr = start_receiver(dest.path(), true, false).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let name = b"a.jpg";
    let evil_dest = b"../outside";
    stream.write_all(&[0x02]).await.unwrap();
    stream
        .write_all(&(name.len() as u32).to_be_bytes())
        .await
        .unwrap();
    stream.write_all(name).await.unwrap();
    stream
        .write_all(&(evil_dest.len() as u32).to_be_bytes())
        .await
        .unwrap();
    stream.write_all(evil_dest).await.unwrap();
    stream.write_all(&4u64.to_be_bytes()).await.unwrap();
    stream.write_all(b"evil").await.unwrap();

    let mut ack = [0u8; 1];
    let read = stream.read(&mut ack).await.unwrap_or(0);
    assert_eq!(read, 0);
}

// =============================================================================
// Atomicity
// =============================================================================

#[tokio::test]
async fn partial_transfer_leaves_no_file_behind() {
    let dest = TempDir::new().unwrap();
    let addr = start_receiver(dest.path(), false, false).await;

    // Announce a 1 MiB payload, deliver a fraction, drop the connection.
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let name = b"frame_camera01_000000001.jpg";
    stream.write_all(&[0x01]).await.unwrap();
    stream
        .write_all(&(name.len() as u32).to_be_bytes())
        .await
        .unwrap();
    stream.write_all(name).await.unwrap();
    stream
        .write_all(&(1024u64 * 1024).to_be_bytes())
        .await
        .unwrap();
    stream.write_all(&vec![0u8; 64 * 1024]).await.unwrap();
    drop(stream);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let entries: Vec<_> = fs::read_dir(dest.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert!(
        entries.is_empty(),
        "partial transfer left entries: {entries:?}"
    );
}

// =============================================================================
// Idempotent retry
// =============================================================================

#[tokio::test]
async fn resending_overwrites_without_part_accumulation() {
    let src = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    let names = write_frames(src.path(), "camera01", 10, 1024);

    let addr = start_receiver(dest.path(), false, false).await;
    let first = sender::run(sender_config(src.path(), addr), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(first.files_sent, 10);

    // Change the source content, then resend everything.
    write_frames(src.path(), "camera01", 10, 2048);
    let second = sender::run(sender_config(src.path(), addr), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(second.files_sent, 10);

    for name in &names {
        assert_eq!(fs::read(dest.path().join(name)).unwrap().len(), 2048);
    }
    assert!(part_files(dest.path()).is_empty());
}

// =============================================================================
// Lookahead starvation (once-mode drain)
// =============================================================================

#[tokio::test]
async fn small_backlog_drains_in_once_mode() {
    let src = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    write_frames(src.path(), "camera01", 3, 1024);

    let addr = start_receiver(dest.path(), false, false).await;
    let mut config = sender_config(src.path(), addr);
    config.lookahead = 4;
    let stats = sender::run(config, CancellationToken::new()).await.unwrap();

    assert_eq!(stats.files_sent, 3);
}

// =============================================================================
// Count-first sessions
// =============================================================================

#[tokio::test]
async fn count_first_session_transfers_declared_backlog() {
    let src = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    let names = write_frames(src.path(), "camera01", 5, 4096);

    let addr = start_receiver(dest.path(), false, true).await;
    let mut config = sender_config(src.path(), addr);
    config.conns = 1;
    config.count_first = true;
    let stats = sender::run(config, CancellationToken::new()).await.unwrap();

    assert_eq!(stats.files_sent, 5);
    for name in &names {
        assert_identical(src.path(), dest.path(), name);
    }
}

// =============================================================================
// Race with an active writer
// =============================================================================

#[tokio::test]
async fn files_written_while_scanning_arrive_intact() {
    let src = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();

    let addr = start_receiver(dest.path(), false, false).await;

    // Producer appends directly to the final names while the sender tails
    // the directory: only the lookahead + stability pair keeps a growing
    // file from being dispatched.
    let producer_dir = src.path().to_path_buf();
    let producer = tokio::spawn(async move {
        for i in 1..=24u64 {
            let fin = producer_dir.join(format!("frame_camera01_{i:09}.jpg"));
            let content = vec![i as u8; 8192];
            for chunk in content.chunks(2048) {
                use std::io::Write;
                let mut f = fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&fin)
                    .unwrap();
                f.write_all(chunk).unwrap();
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    });

    // Continuous (tail) mode: with lookahead=4 the last 4 frames stay
    // unready, so cap successes at 20 to terminate.
    let mut config = sender_config(src.path(), addr);
    config.once = false;
    config.max_files = 20;
    let stats = sender::run(config, CancellationToken::new()).await.unwrap();
    producer.await.unwrap();

    assert_eq!(stats.files_sent, 20);
    assert_eq!(stats.files_failed, 0);
    for i in 1..=20u64 {
        let name = format!("frame_camera01_{i:09}.jpg");
        let got = fs::read(dest.path().join(&name)).unwrap();
        assert_eq!(got, vec![i as u8; 8192], "content mismatch for {name}");
    }
}
