use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    line::{DEFAULT_MAX_LINE_BYTES, read_line, write_line},
};

pub async fn run(args: ClientArgs) -> Result<()> {
    let (reader, mut writer) = establish_connection(&args).await?;

    // Relayed lines are copied on their own task: `read_line` is not cancel
    // safe, so it must not sit in the same `select!` as stdin.
    let mut relayed = tokio::spawn(forward_relayed_lines(reader));
    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    loop {
        input.clear();
        select! {
            finished = &mut relayed => {
                match finished {
                    Ok(result) => result?,
                    Err(error) => warn!(?error, "relay reader task failed"),
                }
                break;
            }
            bytes_read = stdin.read_line(&mut input) => {
                if !handle_stdin_input(bytes_read, &input, &mut writer).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }

    relayed.abort();
    shutdown_connection(&mut writer).await;
    Ok(())
}

async fn establish_connection(
    args: &ClientArgs,
) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);

    let (reader, writer) = stream.into_split();
    Ok((BufReader::new(reader), writer))
}

async fn forward_relayed_lines(mut reader: BufReader<OwnedReadHalf>) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(payload) = read_line(&mut reader, DEFAULT_MAX_LINE_BYTES)
        .await
        .context("failed to read from relay")?
    {
        write_line(&mut stdout, &payload).await?;
    }
    warn!("relay closed the connection");
    Ok(())
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    writer: &mut OwnedWriteHalf,
) -> Result<bool> {
    if bytes_read? == 0 {
        return Ok(false);
    }

    let text = input.trim_end_matches(['\r', '\n']);
    if text.eq_ignore_ascii_case("/quit") {
        return Ok(false);
    }

    write_line(writer, text.as_bytes())
        .await
        .context("failed to send line to relay")?;
    Ok(true)
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}
