//! Messages the server writes to a session.
//!
//! Control text and webhook payloads travel as distinct [`Outbound`]
//! variants, so a payload body can never be mistaken for a control message
//! and vice versa.

use crate::relay::{Identifier, Payload};

/// Everything a session can be sent.
#[derive(Debug)]
pub enum Outbound<'a> {
    /// Greeting shown when an interactive shell opens.
    Welcome,
    /// Input prompt while awaiting a claim.
    Prompt,
    /// Command reference.
    Help { connect_command: &'a str },
    /// The claim succeeded.
    Ready {
        id: &'a Identifier,
        url: &'a str,
        connect_command: &'a str,
    },
    /// One webhook body.
    Payload(&'a Payload),
    /// Unrecognized claim input.
    Violation { input: &'a str, remaining: usize },
    /// Free-form status line.
    Notice(&'a str),
}

/// Serializes [`Outbound`] messages for one session.
#[derive(Debug, Clone, Copy)]
pub struct Renderer {
    terminal: bool,
}

impl Renderer {
    /// `terminal` switches line endings to `\r\n` for raw-mode PTYs.
    pub fn new(terminal: bool) -> Self {
        Self { terminal }
    }

    pub fn render(&self, msg: &Outbound<'_>) -> Vec<u8> {
        match msg {
            Outbound::Payload(payload) => {
                let mut out = Vec::with_capacity(payload.body.len() + 2);
                out.extend_from_slice(&payload.body);
                out.extend_from_slice(self.newline());
                out
            }
            Outbound::Prompt => b"> ".to_vec(),
            other => self.text(&control_text(other)),
        }
    }

    fn newline(&self) -> &'static [u8] {
        if self.terminal {
            b"\r\n"
        } else {
            b"\n"
        }
    }

    fn text(&self, s: &str) -> Vec<u8> {
        if self.terminal {
            s.replace('\n', "\r\n").into_bytes()
        } else {
            s.as_bytes().to_vec()
        }
    }
}

fn control_text(msg: &Outbound<'_>) -> String {
    match msg {
        Outbound::Welcome => "Welcome to sendit\n\n\
             Type `init` to get a webhook URL, `help` for instructions, `exit` to leave.\n"
            .to_string(),
        Outbound::Help { connect_command } => format!(
            "Commands:\n  \
               init   claim a webhook URL and stream its requests here\n  \
               help   show this message\n  \
               exit   close the session\n\n\
             Skip the prompt next time:\n  {connect_command}\n"
        ),
        Outbound::Ready {
            id,
            url,
            connect_command,
        } => format!(
            "\nWebhook URL: {url}\n\
             Identifier:  {id}\n\n\
             Every request sent to this URL (or any path below it) is printed here.\n\
             Try it:\n  curl -X POST --data '{{\"hello\":\"world\"}}' {url}\n\n\
             Claim another URL later with:\n  {connect_command}\n\n\
             Waiting for requests... (Ctrl-C to stop)\n"
        ),
        Outbound::Violation { input, remaining } => format!(
            "unknown command: {input:?} (type `init` to claim a URL, {remaining} attempts left)\n"
        ),
        Outbound::Notice(text) => format!("{text}\n"),
        Outbound::Prompt | Outbound::Payload(_) => String::new(),
    }
}
