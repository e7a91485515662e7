use std::collections::VecDeque;
use std::io::Write;
use std::path::PathBuf;

use moolaproto::{MsgEvent, MsgKind};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

/// How many recent lines a joining client gets replayed.
pub const REPLAY_LINES: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    pub msg: String,
    #[serde(rename = "type")]
    pub kind: MsgKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<String>,
    pub ts_unix: i64,
}

impl ChatRecord {
    pub fn from_event(ev: &MsgEvent) -> Self {
        Self {
            nickname: ev.nickname.clone(),
            msg: ev.msg.clone(),
            kind: ev.kind,
            rank: ev.rank.clone(),
            ts_unix: chrono::Utc::now().timestamp(),
        }
    }

    /// Rebuild the broadcastable event. Rewards are moment-of-send candy
    /// and are not replayed.
    pub fn to_event(&self) -> MsgEvent {
        MsgEvent {
            nickname: self.nickname.clone(),
            msg: self.msg.clone(),
            kind: self.kind,
            rank: self.rank.clone(),
            reward: None,
        }
    }
}

#[derive(Debug)]
struct Inner {
    path: Option<PathBuf>,
    ring: VecDeque<ChatRecord>,
    cap: usize,
}

/// Append-only chat history: a JSON-lines spool on disk plus a bounded
/// in-memory ring for late-join replay. Appends are best-effort; a disk
/// hiccup costs history, never a message.
#[derive(Debug)]
pub struct ChatLog {
    inner: Mutex<Inner>,
}

impl ChatLog {
    /// Open the spool and reload the most recent `cap` records from it.
    pub fn open(path: PathBuf, cap: usize) -> Self {
        let cap = cap.max(1);
        let mut ring = VecDeque::with_capacity(cap);
        if let Ok(s) = std::fs::read_to_string(&path) {
            for line in s.lines() {
                let Ok(rec) = serde_json::from_str::<ChatRecord>(line) else {
                    continue;
                };
                if ring.len() == cap {
                    ring.pop_front();
                }
                ring.push_back(rec);
            }
        }
        Self {
            inner: Mutex::new(Inner {
                path: Some(path),
                ring,
                cap,
            }),
        }
    }

    /// Ring only; nothing touches disk.
    pub fn in_memory(cap: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                path: None,
                ring: VecDeque::new(),
                cap: cap.max(1),
            }),
        }
    }

    pub async fn append(&self, rec: ChatRecord) {
        let mut inner = self.inner.lock().await;
        if let Some(path) = inner.path.clone() {
            if let Err(e) = append_line(&path, &rec) {
                warn!(path = %path.display(), err = %e, "chat log append failed");
            }
        }
        if inner.ring.len() == inner.cap {
            inner.ring.pop_front();
        }
        inner.ring.push_back(rec);
    }

    /// Oldest-first recent records, ready to replay to a joiner.
    pub async fn tail(&self) -> Vec<ChatRecord> {
        let inner = self.inner.lock().await;
        inner.ring.iter().cloned().collect()
    }
}

fn append_line(path: &PathBuf, rec: &ChatRecord) -> anyhow::Result<()> {
    let mut f = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    let s = serde_json::to_string(rec)?;
    f.write_all(s.as_bytes())?;
    f.write_all(b"\n")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat(nick: &str, msg: &str) -> ChatRecord {
        let mut ev = MsgEvent::from_user(nick, msg, MsgKind::Chat);
        ev.rank = Some("commoner".to_string());
        ChatRecord::from_event(&ev)
    }

    #[tokio::test]
    async fn ring_keeps_only_the_newest() {
        let log = ChatLog::in_memory(3);
        for i in 0..5 {
            log.append(chat("Alice", &format!("line {i}"))).await;
        }
        let tail = log.tail().await;
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].msg, "line 2");
        assert_eq!(tail[2].msg, "line 4");
    }

    #[tokio::test]
    async fn spool_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chatlog.jsonl");

        let log = ChatLog::open(path.clone(), 10);
        log.append(chat("Alice", "hello")).await;
        log.append(chat("Bob", "hi alice")).await;
        drop(log);

        let log = ChatLog::open(path, 10);
        let tail = log.tail().await;
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].nickname.as_deref(), Some("Alice"));
        assert_eq!(tail[1].msg, "hi alice");
        assert_eq!(tail[1].kind, MsgKind::Chat);
    }

    #[tokio::test]
    async fn garbage_lines_in_the_spool_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chatlog.jsonl");
        std::fs::write(&path, "{broken\n").unwrap();

        let log = ChatLog::open(path.clone(), 10);
        assert!(log.tail().await.is_empty());
        log.append(chat("Alice", "after the crash")).await;
        drop(log);

        let log = ChatLog::open(path, 10);
        assert_eq!(log.tail().await.len(), 1);
    }

    #[test]
    fn replay_event_drops_the_reward() {
        let mut ev = MsgEvent::from_user("Alice", "hello", MsgKind::Chat);
        ev.reward = Some("+20".to_string());
        let back = ChatRecord::from_event(&ev).to_event();
        assert_eq!(back.reward, None);
        assert_eq!(back.nickname.as_deref(), Some("Alice"));
    }
}
