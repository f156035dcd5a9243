//! Command writer: serializes single-line, multi-line, and `sendmsg`
//! commands with the correct terminators, and is the *only* path that may
//! emit bytes on the socket (spec.md §4.B) — the listener never writes.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::constants;
use crate::error::EslResult;

/// A set of dialplan execute lines that terminates with a blank line on the
/// wire, optionally targeting a specific channel UUID.
#[derive(Debug, Clone, Default)]
pub struct SendMsg {
    pub uuid: Option<String>,
    pub lines: Vec<String>,
}

impl SendMsg {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_uuid(uuid: impl Into<String>) -> Self {
        Self {
            uuid: Some(uuid.into()),
            lines: Vec::new(),
        }
    }

    pub fn line(mut self, line: impl Into<String>) -> Self {
        self.lines.push(line.into());
        self
    }
}

/// Serializes commands over a writer half, under a write mutex so an `api`,
/// `bgapi`, `sendmsg`, or keepalive write can never interleave bytes with
/// another.
pub struct CommandWriter<W> {
    writer: Mutex<W>,
}

impl<W: AsyncWrite + Unpin> CommandWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// `command\n\n` — used for `auth`, `connect`, `api`, `bgapi`, `event`, `exit`.
    pub async fn write_line(&self, command: &str) -> EslResult<()> {
        let mut w = self.writer.lock().await;
        w.write_all(command.as_bytes()).await?;
        w.write_all(b"\n\n").await?;
        w.flush().await?;
        Ok(())
    }

    /// Each line followed by `\n`, terminated by an extra `\n`.
    pub async fn write_multiline(&self, lines: &[String]) -> EslResult<()> {
        let mut w = self.writer.lock().await;
        for line in lines {
            w.write_all(line.as_bytes()).await?;
            w.write_all(b"\n").await?;
        }
        w.write_all(b"\n").await?;
        w.flush().await?;
        Ok(())
    }

    /// One or more `SendMsg` batches, identical wire shape to a multi-line
    /// command: each `sendmsg [<uuid>]` header line followed by the
    /// message's dialplan lines, a blank line between batches, the whole
    /// thing terminated by `\n\n`.
    pub async fn write_sendmsg(&self, msgs: &[SendMsg]) -> EslResult<()> {
        let mut w = self.writer.lock().await;
        let batch_count = msgs.len();
        for (i, msg) in msgs.iter().enumerate() {
            match &msg.uuid {
                Some(uuid) => w.write_all(format!("{} {}\n", constants::SENDMSG_COMMAND, uuid).as_bytes()).await?,
                None => w.write_all(format!("{}\n", constants::SENDMSG_COMMAND).as_bytes()).await?,
            }
            for line in &msg.lines {
                w.write_all(line.as_bytes()).await?;
                w.write_all(b"\n").await?;
            }
            if i + 1 < batch_count {
                w.write_all(b"\n").await?;
            }
        }
        w.write_all(b"\n").await?;
        w.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_line() {
        let buf: Vec<u8> = Vec::new();
        let writer = CommandWriter::new(buf);
        writer.write_line("api status").await.unwrap();
        let written = writer.writer.into_inner();
        assert_eq!(written, b"api status\n\n");
    }

    #[tokio::test]
    async fn test_write_multiline() {
        let buf: Vec<u8> = Vec::new();
        let writer = CommandWriter::new(buf);
        writer
            .write_multiline(&["event plain ALL".to_string(), "Some-Header: value".to_string()])
            .await
            .unwrap();
        let written = writer.writer.into_inner();
        assert_eq!(written, b"event plain ALL\nSome-Header: value\n\n");
    }

    #[tokio::test]
    async fn test_write_sendmsg_single() {
        let buf: Vec<u8> = Vec::new();
        let writer = CommandWriter::new(buf);
        let msg = SendMsg::for_uuid("abc-123")
            .line("call-command: execute")
            .line("execute-app-name: playback");
        writer.write_sendmsg(&[msg]).await.unwrap();
        let written = writer.writer.into_inner();
        assert_eq!(
            written,
            b"sendmsg abc-123\ncall-command: execute\nexecute-app-name: playback\n\n"
        );
    }

    #[tokio::test]
    async fn test_write_sendmsg_batch() {
        let buf: Vec<u8> = Vec::new();
        let writer = CommandWriter::new(buf);
        let a = SendMsg::for_uuid("a").line("call-command: execute");
        let b = SendMsg::for_uuid("b").line("call-command: hangup");
        writer.write_sendmsg(&[a, b]).await.unwrap();
        let written = writer.writer.into_inner();
        assert_eq!(
            written,
            b"sendmsg a\ncall-command: execute\n\nsendmsg b\ncall-command: hangup\n\n"
        );
    }
}
