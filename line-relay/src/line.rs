use std::io;

use bytes::Bytes;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Longest line accepted from a client when no other limit is configured.
pub const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024;

/// Reads one newline-delimited line, without its terminator.
///
/// Returns `Ok(None)` on a clean end-of-stream. A trailing `\r` is dropped so
/// telnet-style clients relay the same payload as netcat. Bytes are passed
/// through untouched; nothing here requires UTF-8. An unterminated final line
/// is still returned before the stream reports EOF.
pub async fn read_line<R>(reader: &mut R, max_len: usize) -> io::Result<Option<Bytes>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    // One byte of headroom so an overlong line is detectable without reading it all.
    let limit = u64::try_from(max_len).unwrap_or(u64::MAX).saturating_add(2);
    let bytes = (&mut *reader).take(limit).read_until(b'\n', &mut line).await?;
    if bytes == 0 {
        return Ok(None);
    }

    if line.last() == Some(&b'\n') {
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
    }

    if line.len() > max_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("line exceeds {max_len} bytes"),
        ));
    }

    Ok(Some(Bytes::from(line)))
}

/// Writes `payload` followed by `\n` and flushes so peers see it immediately.
pub async fn write_line<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(payload).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}
