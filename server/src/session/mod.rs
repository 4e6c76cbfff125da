//! Session protocol: claim an identifier, then stream its payloads.
//!
//! Every interactive session runs this state machine on its own task:
//!
//! ```text
//! Start ──► AwaitClaim ──init──► Streaming ──close / exit / Ctrl-C──► Closing
//!              │  ▲                                                     ▲
//!              └──┘ blank / help / unknown (bounded)                    │
//!              └────────────── exit / EOF / Ctrl-C / shutdown ──────────┘
//! ```
//!
//! End of client input only ends a session that has not claimed yet. Once
//! streaming, `printf 'init\n' | ssh ...` or `ssh -n host init` keep
//! receiving payloads until the channel itself closes
//! ([`SessionOptions::closed`]) or a write fails.
//!
//! One claim per session. The [`Inbox`] obtained in `AwaitClaim` is released
//! on every path into `Closing`, including transport errors; dropping it on
//! a panic releases it as well.
//!
//! The protocol is transport-agnostic: anything `AsyncRead + AsyncWrite`
//! works. The SSH layer hands in a channel stream; tests use
//! `tokio::io::duplex`.

pub mod input;
pub mod render;

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::relay::{Inbox, Registry};
use input::{Input, LineReader};
use render::{Outbound, Renderer};

/// Dependencies shared by every session.
#[derive(Clone)]
pub struct SessionContext {
    pub registry: Registry,
    pub config: Arc<Config>,
    /// Cancelled on server shutdown.
    pub shutdown: CancellationToken,
    /// Session tasks, awaited before the process exits.
    pub tasks: TaskTracker,
}

/// Per-session transport facts.
#[derive(Debug, Default, Clone)]
pub struct SessionOptions {
    /// The client requested a PTY: echo input, use `\r\n`.
    pub terminal: bool,
    /// Command given on the `ssh` command line, processed before any input.
    pub command: Option<String>,
    /// Cancelled by the transport when the client closes the channel.
    pub closed: CancellationToken,
}

/// Why a session ended.
#[derive(Debug)]
pub enum CloseReason {
    /// Client closed the transport.
    Disconnected,
    /// Ctrl-C / Ctrl-D.
    Interrupted,
    /// `exit` or `quit`.
    Exited,
    /// Server is shutting down.
    ShutDown,
    TooManyViolations,
    /// The registry could not allocate an identifier.
    ClaimFailed,
    Transport(io::Error),
}

impl CloseReason {
    /// Exit status reported to `ssh`.
    pub fn exit_status(&self) -> u32 {
        match self {
            Self::Disconnected | Self::Interrupted | Self::Exited | Self::ShutDown => 0,
            Self::TooManyViolations => 2,
            Self::ClaimFailed | Self::Transport(_) => 1,
        }
    }
}

/// Claim grammar.
#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    Init,
    Help,
    Exit,
    Blank,
    Unknown(&'a str),
}

fn parse_command(line: &str) -> Command<'_> {
    let line = line.trim();
    match line.to_ascii_lowercase().as_str() {
        "" => Command::Blank,
        "init" => Command::Init,
        "help" | "?" => Command::Help,
        "exit" | "quit" => Command::Exit,
        _ => Command::Unknown(line),
    }
}

enum State {
    Start,
    AwaitClaim { violations: usize },
    Streaming(Inbox),
    Closing(CloseReason, Option<Inbox>),
}

/// Drive one session to completion over `io`.
pub async fn run_session<S>(io: S, ctx: SessionContext, opts: SessionOptions) -> CloseReason
where
    S: AsyncRead + AsyncWrite,
{
    let (reader, writer) = tokio::io::split(io);
    let mut session = Session {
        reader,
        writer,
        input: LineReader::new(opts.terminal),
        renderer: Renderer::new(opts.terminal),
        command: opts.command,
        closed: opts.closed,
        ctx,
    };

    let mut state = State::Start;
    loop {
        state = match state {
            State::Start => session.start().await,
            State::AwaitClaim { violations } => session.await_claim(violations).await,
            State::Streaming(inbox) => session.stream(inbox).await,
            State::Closing(reason, inbox) => return session.close(reason, inbox).await,
        };
    }
}

struct Session<S> {
    reader: ReadHalf<S>,
    writer: WriteHalf<S>,
    input: LineReader,
    renderer: Renderer,
    command: Option<String>,
    closed: CancellationToken,
    ctx: SessionContext,
}

impl<S: AsyncRead + AsyncWrite> Session<S> {
    async fn send(&mut self, msg: Outbound<'_>) -> io::Result<()> {
        let bytes = self.renderer.render(&msg);
        self.writer.write_all(&bytes).await?;
        self.writer.flush().await
    }

    async fn send_all(&mut self, msgs: &[Outbound<'_>]) -> io::Result<()> {
        for msg in msgs {
            let bytes = self.renderer.render(msg);
            self.writer.write_all(&bytes).await?;
        }
        self.writer.flush().await
    }

    async fn start(&mut self) -> State {
        // `ssh host init` skips the interactive greeting.
        if self.command.is_some() {
            return State::AwaitClaim { violations: 0 };
        }
        match self.send_all(&[Outbound::Welcome, Outbound::Prompt]).await {
            Ok(()) => State::AwaitClaim { violations: 0 },
            Err(e) => State::Closing(CloseReason::Transport(e), None),
        }
    }

    async fn await_claim(&mut self, violations: usize) -> State {
        let input = match self.command.take() {
            Some(command) => Ok(Input::Line(command)),
            None => tokio::select! {
                () = self.ctx.shutdown.cancelled() => {
                    return State::Closing(CloseReason::ShutDown, None);
                }
                () = self.closed.cancelled() => {
                    return State::Closing(CloseReason::Disconnected, None);
                }
                input = self.input.next(&mut self.reader, &mut self.writer) => input,
            },
        };

        let line = match input {
            Ok(Input::Line(line)) => line,
            Ok(Input::Interrupt) => return State::Closing(CloseReason::Interrupted, None),
            Ok(Input::Eof) => return State::Closing(CloseReason::Disconnected, None),
            Err(e) => return State::Closing(CloseReason::Transport(e), None),
        };

        let result = match parse_command(&line) {
            Command::Init => return self.claim().await,
            Command::Exit => return State::Closing(CloseReason::Exited, None),
            Command::Blank => self.send(Outbound::Prompt).await,
            Command::Help => {
                let connect_command = self.ctx.config.ssh.connect_command();
                let help = Outbound::Help {
                    connect_command: &connect_command,
                };
                self.send_all(&[help, Outbound::Prompt]).await
            }
            Command::Unknown(input) => {
                let violations = violations + 1;
                let max = self.ctx.config.ssh.max_protocol_violations.max(1);
                warn!(input, violations, "Unrecognized claim input");
                if violations >= max {
                    let _ = self
                        .send(Outbound::Notice("too many invalid commands, closing"))
                        .await;
                    return State::Closing(CloseReason::TooManyViolations, None);
                }
                let remaining = max - violations;
                let reply = [Outbound::Violation { input, remaining }, Outbound::Prompt];
                return match self.send_all(&reply).await {
                    Ok(()) => State::AwaitClaim { violations },
                    Err(e) => State::Closing(CloseReason::Transport(e), None),
                };
            }
        };

        match result {
            Ok(()) => State::AwaitClaim { violations },
            Err(e) => State::Closing(CloseReason::Transport(e), None),
        }
    }

    async fn claim(&mut self) -> State {
        let inbox = match self.ctx.registry.claim(self.ctx.config.relay.claim_attempts) {
            Ok(inbox) => inbox,
            Err(e) => {
                error!("Claim failed: {e}");
                let _ = self
                    .send(Outbound::Notice(
                        "could not allocate a webhook URL, try again later",
                    ))
                    .await;
                return State::Closing(CloseReason::ClaimFailed, None);
            }
        };

        let url = self.ctx.config.http.webhook_url(inbox.id().as_str());
        let connect_command = self.ctx.config.ssh.connect_command();
        let ready = Outbound::Ready {
            id: inbox.id(),
            url: &url,
            connect_command: &connect_command,
        };
        let sent = self.send(ready).await;
        match sent {
            Ok(()) => State::Streaming(inbox),
            Err(e) => State::Closing(CloseReason::Transport(e), Some(inbox)),
        }
    }

    async fn stream(&mut self, mut inbox: Inbox) -> State {
        let mut input_open = true;
        let reason = loop {
            tokio::select! {
                () = self.ctx.shutdown.cancelled() => {
                    let _ = self.send(Outbound::Notice("server shutting down")).await;
                    break CloseReason::ShutDown;
                }
                () = self.closed.cancelled() => break CloseReason::Disconnected,
                payload = inbox.recv() => {
                    let Some(payload) = payload else {
                        break CloseReason::Disconnected;
                    };
                    debug!(
                        id = %inbox.id(),
                        bytes = payload.len(),
                        method = %payload.method,
                        path = %payload.path,
                        content_type = payload.content_type.as_deref().unwrap_or("-"),
                        queued_ms = payload.age().as_millis(),
                        "Writing payload to session"
                    );
                    if let Err(e) = self.send(Outbound::Payload(&payload)).await {
                        break CloseReason::Transport(e);
                    }
                }
                input = self.input.next(&mut self.reader, &mut self.writer), if input_open => match input {
                    Ok(Input::Line(line)) => {
                        if parse_command(&line) == Command::Exit {
                            break CloseReason::Exited;
                        }
                    }
                    Ok(Input::Interrupt) => break CloseReason::Interrupted,
                    Ok(Input::Eof) => {
                        debug!(id = %inbox.id(), "Client input closed, still streaming");
                        input_open = false;
                    }
                    Err(e) => break CloseReason::Transport(e),
                },
            }
        };
        State::Closing(reason, Some(inbox))
    }

    async fn close(&mut self, reason: CloseReason, inbox: Option<Inbox>) -> CloseReason {
        match inbox {
            Some(inbox) => {
                info!(id = %inbox.id(), ?reason, "Session closed");
                inbox.release();
            }
            None => info!(?reason, "Session closed without a claim"),
        }
        let _ = self.writer.shutdown().await;
        reason
    }
}
