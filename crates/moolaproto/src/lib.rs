//! `moolaproto`: the JSON-per-line wire protocol spoken by moolamud.
//!
//! Every message is one JSON object per line (LF-terminated). Inbound
//! requests and outbound server messages are enums tagged on `"op"`;
//! the broadcast payload (`MsgEvent`) is the shape clients render: a
//! message body plus optional speaker, rank badge, and reward note.
//!
//! This crate is IO-free on purpose: both the server and the bots
//! depend on it and do their own line framing.

use serde::{Deserialize, Serialize};

/// Hard cap on one wire line. Anything longer is a protocol violation.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

pub const MAX_NICK_CHARS: usize = 24;

#[derive(Debug, Clone)]
pub enum ProtoError {
    EmptyNickname,
    NicknameTooLong { max: usize, got: usize },
    NicknameBadChar(char),
}

impl std::fmt::Display for ProtoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtoError::EmptyNickname => write!(f, "nickname is empty"),
            ProtoError::NicknameTooLong { max, got } => {
                write!(f, "nickname too long: max {max} chars, got {got}")
            }
            ProtoError::NicknameBadChar(c) => {
                write!(f, "nickname contains disallowed character {c:?}")
            }
        }
    }
}

impl std::error::Error for ProtoError {}

/// Check a raw nickname and return the trimmed form.
///
/// Nicknames are case-sensitive identities; we only reject the things
/// that break the wire or the screen (empty, oversized, control chars,
/// embedded whitespace).
pub fn validate_nickname(raw: &str) -> Result<&str, ProtoError> {
    let nick = raw.trim();
    if nick.is_empty() {
        return Err(ProtoError::EmptyNickname);
    }
    let got = nick.chars().count();
    if got > MAX_NICK_CHARS {
        return Err(ProtoError::NicknameTooLong {
            max: MAX_NICK_CHARS,
            got,
        });
    }
    if let Some(c) = nick.chars().find(|c| c.is_control() || c.is_whitespace()) {
        return Err(ProtoError::NicknameBadChar(c));
    }
    Ok(nick)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientReq {
    Join { nickname: String },
    Msg { text: String },
    Ping {},
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ServerMsg {
    Hello { motd: String },
    Message { event: MsgEvent },
    Pong {},
    Err { text: String },
}

/// One rendered chat-room message.
///
/// `nickname` is present for lines attributed to a user (chat, farm
/// progress), absent for server-voice lines. `rank` and `reward` ride
/// along on ordinary chat so clients can badge the speaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsgEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    pub msg: String,
    #[serde(rename = "type")]
    pub kind: MsgKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reward: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MsgKind {
    Chat,
    System,
    News,
    Bot,
    File,
}

impl MsgKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MsgKind::Chat => "chat",
            MsgKind::System => "system",
            MsgKind::News => "news",
            MsgKind::Bot => "bot",
            MsgKind::File => "file",
        }
    }
}

impl MsgEvent {
    pub fn system(msg: impl Into<String>) -> Self {
        Self {
            nickname: None,
            msg: msg.into(),
            kind: MsgKind::System,
            rank: None,
            reward: None,
        }
    }

    pub fn news(msg: impl Into<String>) -> Self {
        Self {
            nickname: None,
            msg: msg.into(),
            kind: MsgKind::News,
            rank: None,
            reward: None,
        }
    }

    pub fn bot(msg: impl Into<String>) -> Self {
        Self {
            nickname: None,
            msg: msg.into(),
            kind: MsgKind::Bot,
            rank: None,
            reward: None,
        }
    }

    pub fn from_user(nickname: impl Into<String>, msg: impl Into<String>, kind: MsgKind) -> Self {
        Self {
            nickname: Some(nickname.into()),
            msg: msg.into(),
            kind,
            rank: None,
            reward: None,
        }
    }
}
