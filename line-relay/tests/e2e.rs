use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    process::{Child, ChildStdin, ChildStdout, Command},
    time::{sleep, timeout},
};

const READ_TIMEOUT: Duration = Duration::from_secs(3);
const BINARY: &str = env!("CARGO_BIN_EXE_line-relay");

#[tokio::test]
async fn relay_binary_end_to_end() -> Result<()> {
    let log_dir = tempfile::tempdir()?;
    let (mut relay_child, mut relay_stdout) = spawn_relay(log_dir.path()).await?;
    let addr = read_relay_addr(&mut relay_stdout).await?;

    // Drain the relay's console log in the background so the pipe never fills.
    let relay_log_task = tokio::spawn(async move {
        drain(relay_stdout).await;
    });

    let (watcher_read, mut watcher_write) = TcpStream::connect(&addr).await?.into_split();
    let mut watcher = BufReader::new(watcher_read);
    wait_until_echoed(&mut watcher, &mut watcher_write).await?;

    // Registered after the marker, so its first relayed line is its own.
    let mut client = spawn_client(&addr).await?;

    client
        .send_line("hi from the client")
        .await
        .context("client send line")?;
    assert_eq!(
        read_line_expect(&mut watcher, "watcher hears client").await?,
        "hi from the client"
    );
    let client_echo = read_line_expect(&mut client.stdout, "client echo").await?;
    assert_eq!(client_echo, "hi from the client");

    watcher_write.write_all(b"hello back\n").await?;
    assert_eq!(
        read_line_expect(&mut client.stdout, "client hears watcher").await?,
        "hello back"
    );
    assert_eq!(
        read_line_expect(&mut watcher, "watcher echo").await?,
        "hello back"
    );

    client.send_line("/quit").await.context("client send quit")?;
    ensure_success(&mut client.child, "client").await?;

    wait_for_log_line(log_dir.path(), "relay listening on").await?;

    // The relay runs until interrupted; stop it manually.
    let _ = relay_child.kill().await;
    let _ = relay_child.wait().await;
    let _ = relay_log_task.await;

    Ok(())
}

#[tokio::test]
async fn relay_binary_fails_when_port_is_taken() -> Result<()> {
    let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = taken.local_addr()?;
    let log_dir = tempfile::tempdir()?;

    let status = timeout(
        READ_TIMEOUT,
        Command::new(BINARY)
            .arg("serve")
            .arg("--listen")
            .arg(addr.to_string())
            .arg("--log-dir")
            .arg(log_dir.path())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status(),
    )
    .await
    .context("relay did not exit")??;

    assert!(!status.success());
    Ok(())
}

struct ClientProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl ClientProcess {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.stdin
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to send line '{line}'"))?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }
}

async fn spawn_relay(log_dir: &Path) -> Result<(Child, BufReader<ChildStdout>)> {
    let mut cmd = Command::new(BINARY);
    cmd.arg("serve")
        .arg("--listen")
        .arg("127.0.0.1:0")
        .arg("--log-dir")
        .arg(log_dir)
        .arg("--rotation")
        .arg("second")
        .env("RUST_LOG", "info")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = cmd.spawn().context("failed to spawn relay")?;
    let stdout = child
        .stdout
        .take()
        .context("relay stdout missing after spawn")?;

    Ok((child, BufReader::new(stdout)))
}

async fn read_relay_addr(reader: &mut BufReader<ChildStdout>) -> Result<String> {
    loop {
        let line = read_line(reader)
            .await?
            .context("relay did not emit listening address")?;
        if !line.contains("relay listening on") {
            continue;
        }
        let addr = line
            .split_whitespace()
            .last()
            .context("unexpected relay banner format")?;
        if !addr.contains(':') {
            return Err(anyhow!("relay banner missing socket: {line}"));
        }
        return Ok(addr.to_string());
    }
}

async fn spawn_client(addr: &str) -> Result<ClientProcess> {
    let mut child = Command::new(BINARY)
        .arg("client")
        .arg("--server")
        .arg(addr)
        .env("RUST_LOG", "warn")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .context("failed to spawn client")?;

    let stdin = child
        .stdin
        .take()
        .context("client stdin missing after spawn")?;
    let stdout = child
        .stdout
        .take()
        .context("client stdout missing after spawn")?;

    Ok(ClientProcess {
        child,
        stdin,
        stdout: BufReader::new(stdout),
    })
}

/// Round-trips a marker line, which proves the session is registered.
async fn wait_until_echoed<R, W>(reader: &mut R, writer: &mut W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    writer.write_all(b"ready?\n").await?;
    let echoed = read_line_expect(reader, "watcher marker").await?;
    if echoed != "ready?" {
        return Err(anyhow!("unexpected marker echo: {echoed}"));
    }
    Ok(())
}

async fn read_line_expect<R>(reader: &mut R, description: &str) -> Result<String>
where
    R: AsyncBufRead + Unpin,
{
    match read_line(reader).await {
        Ok(Some(line)) => Ok(line),
        Ok(None) => Err(anyhow!("{description}: stream closed")),
        Err(err) => Err(err.context(format!("{description}: failed to read line"))),
    }
}

async fn read_line<R>(reader: &mut R) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let read_future = reader.read_line(&mut line);
    let bytes_io = match timeout(READ_TIMEOUT, read_future).await {
        Ok(result) => result,
        Err(_) => return Err(anyhow!("timed out waiting for line")),
    };
    if bytes_io? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

async fn drain(mut reader: BufReader<ChildStdout>) {
    let mut buffer = String::new();
    while let Ok(bytes) = reader.read_line(&mut buffer).await {
        if bytes == 0 {
            break;
        }
        buffer.clear();
    }
}

async fn wait_for_log_line(dir: &Path, needle: &str) -> Result<()> {
    for _ in 0..50 {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let contents = std::fs::read_to_string(&path).unwrap_or_default();
            if contents.contains(needle) {
                return Ok(());
            }
        }
        sleep(Duration::from_millis(50)).await;
    }
    Err(anyhow!("no log file in {} contains {needle:?}", dir.display()))
}

async fn ensure_success(child: &mut Child, name: &str) -> Result<()> {
    let status = timeout(READ_TIMEOUT, child.wait())
        .await
        .with_context(|| format!("{name} did not exit"))?
        .with_context(|| format!("failed to await {name} process"))?;
    if !status.success() {
        return Err(anyhow!("{name} exited with status {status}"));
    }
    Ok(())
}
