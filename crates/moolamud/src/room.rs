use std::collections::HashMap;

use bytes::Bytes;
use moolaproto::{MsgEvent, ServerMsg};
use tokio::sync::{mpsc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u128);

impl SessionId {
    /// Good enough for logs: XOR high/low halves.
    pub fn short(self) -> u64 {
        (self.0 as u64) ^ ((self.0 >> 64) as u64)
    }
}

pub fn new_session_id() -> SessionId {
    let mut b = [0u8; 16];
    getrandom::getrandom(&mut b).expect("getrandom");
    SessionId(u128::from_be_bytes(b))
}

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub nickname: String,
    pub write_tx: mpsc::Sender<Bytes>,
}

/// Encode one server message as a wire line (JSON + LF).
pub fn encode_line(msg: &ServerMsg) -> Option<Bytes> {
    match serde_json::to_vec(msg) {
        Ok(mut v) => {
            v.push(b'\n');
            Some(Bytes::from(v))
        }
        Err(_) => None,
    }
}

/// The one chat room. Holds every live session's write queue; messages
/// fan out here and only here.
#[derive(Debug, Default)]
pub struct Room {
    sessions: Mutex<HashMap<SessionId, SessionInfo>>,
}

impl Room {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, id: SessionId, info: SessionInfo) {
        self.sessions.lock().await.insert(id, info);
    }

    pub async fn remove(&self, id: SessionId) -> Option<SessionInfo> {
        self.sessions.lock().await.remove(&id)
    }

    pub async fn count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Send an event to every connected session. The lock is held only to
    /// snapshot the queues; actual sends happen outside it.
    pub async fn broadcast_event(&self, ev: &MsgEvent) {
        let Some(line) = encode_line(&ServerMsg::Message { event: ev.clone() }) else {
            return;
        };
        let txs = {
            let m = self.sessions.lock().await;
            m.values().map(|s| s.write_tx.clone()).collect::<Vec<_>>()
        };
        for tx in txs {
            let _ = tx.send(line.clone()).await;
        }
    }

    pub async fn send_event(&self, id: SessionId, ev: &MsgEvent) {
        self.send_msg(id, &ServerMsg::Message { event: ev.clone() })
            .await;
    }

    pub async fn send_msg(&self, id: SessionId, msg: &ServerMsg) {
        let Some(line) = encode_line(msg) else { return };
        let tx = {
            let m = self.sessions.lock().await;
            m.get(&id).map(|s| s.write_tx.clone())
        };
        if let Some(tx) = tx {
            let _ = tx.send(line).await;
        }
    }
}
