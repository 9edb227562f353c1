//! The inbound submission state machine.
//!
//! Transitions only touch [`SessionState`]: they record the envelope and the
//! reply to send, and never perform I/O. Reading the message body and running
//! an AUTH exchange are left to the session.

use sigil_common::traits::fsm::FiniteStateMachine;

use crate::{
    command::{Command, HeloVariant},
    reply::Reply,
};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum State {
    /// Greeting sent, no EHLO/HELO yet.
    #[default]
    Connect,
    /// Greeted; no mail transaction in progress.
    Ready,
    /// AUTH accepted for processing; the session verifies the credentials.
    Authenticating { initial_response: Option<String> },
    MailFrom,
    RcptTo,
    /// `354` sent; the session reads the body next.
    Data,
    Quit,
}

/// What the state machine knows about a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub hostname: String,
    pub max_message_bytes: usize,
    pub max_recipients: usize,
    /// Credentials are configured: AUTH is offered and required before MAIL.
    pub auth_required: bool,

    pub id: Option<String>,
    pub extended: bool,
    pub authenticated: bool,
    pub sender: Option<String>,
    pub recipients: Vec<String>,
    /// Reply produced by the last transition, if the transition has one.
    pub reply: Option<Reply>,
}

impl SessionState {
    pub fn new(
        hostname: impl Into<String>,
        max_message_bytes: usize,
        max_recipients: usize,
        auth_required: bool,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            max_message_bytes,
            max_recipients,
            auth_required,
            id: None,
            extended: false,
            authenticated: false,
            sender: None,
            recipients: Vec::new(),
            reply: None,
        }
    }

    /// Forget the current mail transaction.
    pub fn reset_transaction(&mut self) {
        self.sender = None;
        self.recipients.clear();
    }

    fn ehlo_reply(&self, id: &str) -> Reply {
        let mut lines = vec![
            format!("{} greets {id}", self.hostname),
            "8BITMIME".to_string(),
            format!("SIZE {}", self.max_message_bytes),
        ];
        if self.auth_required {
            lines.push("AUTH PLAIN".to_string());
        }
        Reply::multiline(250, lines)
    }

    fn respond(&mut self, code: u16, text: impl Into<String>) {
        self.reply = Some(Reply::new(code, text));
    }
}

fn bad_sequence(state: State, context: &mut SessionState, text: &str) -> State {
    context.respond(503, text);
    state
}

impl FiniteStateMachine for State {
    type Input = Command;
    type Context = SessionState;

    fn transition(self, input: Self::Input, context: &mut Self::Context) -> Self {
        context.reply = None;

        match (self, input) {
            (_, Command::Quit) => {
                context.respond(221, format!("{} Service closing transmission channel", context.hostname));
                Self::Quit
            }

            (state, Command::Unknown(text)) => {
                context.respond(500, format!("Command not recognized: {text}"));
                state
            }

            (state, Command::Invalid(reason)) => {
                context.respond(501, format!("Syntax error: {reason}"));
                state
            }

            (state, Command::Noop) => {
                context.respond(250, "OK");
                state
            }

            (Self::Data | Self::Authenticating { .. } | Self::Quit, _) => {
                context.respond(503, "Bad sequence of commands");
                Self::Quit
            }

            (_, Command::Helo(variant)) => {
                context.reset_transaction();
                match variant {
                    HeloVariant::Ehlo(id) => {
                        context.reply = Some(context.ehlo_reply(&id));
                        context.extended = true;
                        context.id = Some(id);
                    }
                    HeloVariant::Helo(id) => {
                        context.respond(250, format!("{} greets {id}", context.hostname));
                        context.extended = false;
                        context.id = Some(id);
                    }
                }
                Self::Ready
            }

            (Self::Connect, Command::Rset) => {
                context.respond(250, "OK");
                Self::Connect
            }

            (_, Command::Rset) => {
                context.reset_transaction();
                context.respond(250, "OK");
                Self::Ready
            }

            (Self::Connect, _) => bad_sequence(Self::Connect, context, "Send HELO/EHLO first"),

            (Self::Ready, Command::Auth { .. }) if !context.auth_required => {
                bad_sequence(Self::Ready, context, "Authentication not enabled")
            }
            (Self::Ready, Command::Auth { .. }) if context.authenticated => {
                bad_sequence(Self::Ready, context, "Already authenticated")
            }
            (Self::Ready, Command::Auth { mechanism, .. }) if mechanism != "PLAIN" => {
                context.respond(504, format!("Unrecognized authentication type {mechanism}"));
                Self::Ready
            }
            (Self::Ready, Command::Auth {
                initial_response, ..
            }) => Self::Authenticating { initial_response },
            (state, Command::Auth { .. }) => {
                bad_sequence(state, context, "AUTH not permitted during a mail transaction")
            }

            (Self::Ready, Command::MailFrom(..)) if context.auth_required && !context.authenticated => {
                context.respond(530, "Authentication required");
                Self::Ready
            }
            (Self::Ready, Command::MailFrom(_, Some(size))) if size > context.max_message_bytes => {
                context.respond(
                    552,
                    format!(
                        "Declared message size {size} exceeds maximum {}",
                        context.max_message_bytes
                    ),
                );
                Self::Ready
            }
            (Self::Ready, Command::MailFrom(sender, _)) => {
                context.sender = sender;
                context.respond(250, "OK");
                Self::MailFrom
            }
            (state, Command::MailFrom(..)) => {
                bad_sequence(state, context, "Sender already specified")
            }

            (Self::Ready, Command::RcptTo(_)) => bad_sequence(Self::Ready, context, "Need MAIL command"),
            (state @ (Self::MailFrom | Self::RcptTo), Command::RcptTo(_))
                if context.recipients.len() >= context.max_recipients =>
            {
                context.respond(
                    452,
                    format!("Too many recipients (maximum {})", context.max_recipients),
                );
                state
            }
            (Self::MailFrom | Self::RcptTo, Command::RcptTo(recipient)) => {
                context.recipients.push(recipient);
                context.respond(250, "OK");
                Self::RcptTo
            }

            (Self::RcptTo, Command::Data) => {
                context.respond(354, "Start mail input; end with <CRLF>.<CRLF>");
                Self::Data
            }
            (state @ (Self::Ready | Self::MailFrom), Command::Data) => {
                bad_sequence(state, context, "Need RCPT command")
            }

            (state, _) => bad_sequence(state, context, "Bad sequence of commands"),
        }
    }
}
