//! Line assembly for interactive input.
//!
//! SSH clients that requested a PTY put the local terminal in raw mode, so
//! the server sees individual keystrokes and is responsible for echo. Piped
//! and `exec` clients send plain newline-terminated text. [`LineReader`]
//! handles both.

use std::collections::VecDeque;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const CTRL_C: u8 = 0x03;
const CTRL_D: u8 = 0x04;
const BACKSPACE: u8 = 0x08;
const DELETE: u8 = 0x7f;

/// Longest line kept; extra bytes are dropped until the next newline.
const MAX_LINE: usize = 1024;

/// One unit of client input.
#[derive(Debug, PartialEq, Eq)]
pub enum Input {
    /// A complete line, trimmed.
    Line(String),
    /// Ctrl-C or Ctrl-D.
    Interrupt,
    /// The client closed its input. Output may still be open.
    Eof,
}

/// Buffers raw bytes from the transport into [`Input`] events.
///
/// [`LineReader::next`] is cancel-safe: bytes already read are either still
/// pending, part of the current line, or held as a decoded event until the
/// next call. Echo output waits in its own buffer.
pub struct LineReader {
    pending: VecDeque<u8>,
    line: Vec<u8>,
    ready: Option<Input>,
    echo_out: Vec<u8>,
    echo: bool,
    eof: bool,
}

impl LineReader {
    /// `echo` makes typed characters visible on terminals in raw mode.
    pub fn new(echo: bool) -> Self {
        Self {
            pending: VecDeque::new(),
            line: Vec::new(),
            ready: None,
            echo_out: Vec::new(),
            echo,
            eof: false,
        }
    }

    /// Read until a full line, an interrupt, or end of input.
    pub async fn next<R, W>(&mut self, reader: &mut R, writer: &mut W) -> io::Result<Input>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            if self.ready.is_none() {
                self.ready = self.scan();
            }
            self.flush_echo(writer).await?;
            if let Some(input) = self.ready.take() {
                return Ok(input);
            }

            if self.eof {
                return Ok(Input::Eof);
            }
            let mut chunk = [0u8; 1024];
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                self.eof = true;
                // Unterminated last line, e.g. `printf init | ssh ...`.
                if !self.line.is_empty() {
                    self.ready = Some(Input::Line(self.take_line()));
                }
                continue;
            }
            self.pending.extend(&chunk[..n]);
        }
    }

    /// Consume pending bytes up to the first complete event.
    fn scan(&mut self) -> Option<Input> {
        while let Some(byte) = self.pending.pop_front() {
            match byte {
                b'\r' | b'\n' => {
                    if byte == b'\r' && self.pending.front() == Some(&b'\n') {
                        self.pending.pop_front();
                    }
                    if self.echo {
                        self.echo_out.extend_from_slice(b"\r\n");
                    }
                    return Some(Input::Line(self.take_line()));
                }
                CTRL_C | CTRL_D => return Some(Input::Interrupt),
                BACKSPACE | DELETE => {
                    if self.line.pop().is_some() && self.echo {
                        self.echo_out.extend_from_slice(b"\x08 \x08");
                    }
                }
                b if b < 0x20 => {}
                b => {
                    if self.line.len() < MAX_LINE {
                        self.line.push(b);
                        if self.echo {
                            self.echo_out.push(b);
                        }
                    }
                }
            }
        }
        None
    }

    async fn flush_echo<W: AsyncWrite + Unpin>(&mut self, writer: &mut W) -> io::Result<()> {
        if self.echo_out.is_empty() {
            return Ok(());
        }
        while !self.echo_out.is_empty() {
            let n = writer.write(&self.echo_out).await?;
            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            self.echo_out.drain(..n);
        }
        writer.flush().await
    }

    fn take_line(&mut self) -> String {
        let line = String::from_utf8_lossy(&self.line).trim().to_string();
        self.line.clear();
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(input: &[u8], echo: bool) -> (Vec<Input>, Vec<u8>) {
        let mut reader = input;
        let mut echoed = Vec::new();
        let mut lines = LineReader::new(echo);
        let mut events = Vec::new();
        loop {
            let event = lines.next(&mut reader, &mut echoed).await.unwrap();
            let done = event == Input::Eof;
            events.push(event);
            if done {
                break;
            }
        }
        (events, echoed)
    }

    #[tokio::test]
    async fn test_splits_lines_on_any_terminator() {
        let (events, echoed) = collect(b"init\r\nhelp\rexit\n", false).await;
        assert_eq!(
            events,
            vec![
                Input::Line("init".into()),
                Input::Line("help".into()),
                Input::Line("exit".into()),
                Input::Eof,
            ]
        );
        assert!(echoed.is_empty());
    }

    #[tokio::test]
    async fn test_unterminated_line_before_eof() {
        let (events, _) = collect(b"  init ", false).await;
        assert_eq!(events, vec![Input::Line("init".into()), Input::Eof]);
    }

    #[tokio::test]
    async fn test_backspace_and_echo() {
        let (events, echoed) = collect(b"inx\x7fit\r", true).await;
        assert_eq!(events[0], Input::Line("init".into()));
        assert_eq!(echoed, b"inx\x08 \x08it\r\n");
    }

    #[tokio::test]
    async fn test_cancelled_echo_keeps_line() {
        let mut reader = &b"exit\r"[..];
        let (mut echo_tx, mut echo_rx) = tokio::io::duplex(1);
        let mut lines = LineReader::new(true);

        // The one-byte pipe blocks the echo after "e".
        let first = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            lines.next(&mut reader, &mut echo_tx),
        )
        .await;
        assert!(first.is_err());

        let drain = tokio::spawn(async move {
            let mut out = Vec::new();
            echo_rx.read_to_end(&mut out).await.unwrap();
            out
        });
        let event = lines.next(&mut reader, &mut echo_tx).await.unwrap();
        assert_eq!(event, Input::Line("exit".into()));
        drop(echo_tx);
        assert_eq!(drain.await.unwrap(), b"exit\r\n");
    }

    #[tokio::test]
    async fn test_ctrl_c_interrupts() {
        let (events, _) = collect(b"ini\x03", true).await;
        assert_eq!(events[0], Input::Interrupt);
    }
}
