//! SSH transport for interactive sessions.
//!
//! The SSH layer only establishes the transport: it accepts every client
//! (there is no notion of who may claim an identifier), tracks whether the
//! client asked for a PTY, and on `shell` or `exec` hands the channel stream
//! to [`crate::session::run_session`] on its own task.
//!
//! ```text
//! TCP accept ─► russh handshake ─► channel_open_session (stash channel)
//!                                   ├─ pty_request   → terminal = true
//!                                   ├─ shell_request → spawn session
//!                                   ├─ exec_request  → spawn session with command
//!                                   └─ channel_close → cancel the session's `closed` token
//! ```
//!
//! A client closing its stdin (`ssh -n`, piped input) only ends the input
//! side; the session keeps streaming until the channel or the connection
//! closes. Dropping the connection handler cancels every session it started.
//!
//! Only `chacha20-poly1305@openssh.com` is offered as a cipher.
//!
//! The host key is loaded once at startup; failure there is a boot error.

use std::borrow::Cow;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{cipher, Channel, ChannelId, MethodSet, Preferred, Pty, SshId};
use russh_keys::key::{KeyPair, PublicKey};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::SshConfig;
use crate::session::{run_session, SessionContext, SessionOptions};

/// The configured host key could not be loaded.
#[derive(Debug, thiserror::Error)]
#[error("failed to load host key {path}: {source}")]
pub struct HostKeyError {
    pub path: String,
    #[source]
    pub source: russh_keys::Error,
}

/// Load the server's private host key (unencrypted OpenSSH or PEM).
pub fn load_host_key(path: &str) -> Result<KeyPair, HostKeyError> {
    russh_keys::load_secret_key(path, None).map_err(|source| HostKeyError {
        path: path.to_string(),
        source,
    })
}

/// Build the russh server configuration.
pub fn server_config(ssh: &SshConfig, host_key: KeyPair) -> russh::server::Config {
    russh::server::Config {
        server_id: SshId::Standard(ssh.server_id.clone()),
        methods: MethodSet::NONE | MethodSet::PUBLICKEY | MethodSet::PASSWORD,
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::ZERO),
        inactivity_timeout: ssh.inactivity_timeout(),
        keys: vec![host_key],
        preferred: Preferred {
            cipher: Cow::Borrowed(&[cipher::CHACHA20_POLY1305]),
            ..Preferred::default()
        },
        ..Default::default()
    }
}

/// Accept SSH connections until `ctx.shutdown` is cancelled.
pub async fn serve(listener: TcpListener, config: Arc<russh::server::Config>, ctx: SessionContext) {
    loop {
        let (stream, peer) = tokio::select! {
            () = ctx.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("SSH accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
        };
        let _ = stream.set_nodelay(true);

        let handler = SshConnection::new(peer, ctx.clone());
        let config = Arc::clone(&config);
        tokio::spawn(
            async move {
                debug!("SSH connection accepted");
                match russh::server::run_stream(config, stream, handler).await {
                    Ok(running) => {
                        if let Err(e) = running.await {
                            debug!("SSH connection ended: {e}");
                        }
                    }
                    Err(e) => debug!("SSH handshake failed: {e}"),
                }
            }
            .instrument(info_span!("ssh_conn", peer = %peer)),
        );
    }
    info!("SSH listener stopped");
}

/// A session channel opened but not yet started.
struct PendingChannel {
    channel: Channel<Msg>,
    terminal: bool,
}

/// Per-connection russh handler.
pub struct SshConnection {
    peer: SocketAddr,
    ctx: SessionContext,
    channels: HashMap<ChannelId, PendingChannel>,
    /// Close tokens of sessions already handed to the protocol.
    sessions: HashMap<ChannelId, CancellationToken>,
}

impl SshConnection {
    pub fn new(peer: SocketAddr, ctx: SessionContext) -> Self {
        Self {
            peer,
            ctx,
            channels: HashMap::new(),
            sessions: HashMap::new(),
        }
    }

    /// Hand a pending channel to the session protocol on its own task.
    fn start_session(&mut self, channel: ChannelId, command: Option<String>, session: &mut Session) {
        let Some(pending) = self.channels.remove(&channel) else {
            warn!(?channel, "Shell/exec request for unknown or already started channel");
            session.channel_failure(channel);
            return;
        };
        session.channel_success(channel);

        let closed = CancellationToken::new();
        self.sessions.insert(channel, closed.clone());

        let handle = session.handle();
        let ctx = self.ctx.clone();
        let opts = SessionOptions {
            terminal: pending.terminal,
            command,
            closed,
        };
        self.ctx.tasks.spawn(
            async move {
                info!(terminal = opts.terminal, "Session started");
                let reason = run_session(pending.channel.into_stream(), ctx, opts).await;
                let _ = handle
                    .exit_status_request(channel, reason.exit_status())
                    .await;
                let _ = handle.eof(channel).await;
                let _ = handle.close(channel).await;
            }
            .instrument(info_span!("ssh_session", peer = %self.peer, ?channel)),
        );
    }
}

#[async_trait]
impl Handler for SshConnection {
    type Error = russh::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        debug!(peer = %self.peer, user, "Accepting client without credentials");
        Ok(Auth::Accept)
    }

    async fn auth_password(&mut self, user: &str, _password: &str) -> Result<Auth, Self::Error> {
        debug!(peer = %self.peer, user, "Accepting password client");
        Ok(Auth::Accept)
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        _public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        debug!(peer = %self.peer, user, "Accepting public-key client");
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.channels.insert(
            channel.id(),
            PendingChannel {
                channel,
                terminal: false,
            },
        );
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(pending) = self.channels.get_mut(&channel) {
            debug!(peer = %self.peer, term, "PTY requested");
            pending.terminal = true;
        }
        session.channel_success(channel);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.start_session(channel, None, session);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).into_owned();
        self.start_session(channel, Some(command), session);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channels.remove(&channel);
        if let Some(closed) = self.sessions.remove(&channel) {
            debug!(peer = %self.peer, ?channel, "Client closed session channel");
            closed.cancel();
        }
        Ok(())
    }
}

impl Drop for SshConnection {
    fn drop(&mut self) {
        for closed in self.sessions.values() {
            closed.cancel();
        }
    }
}
