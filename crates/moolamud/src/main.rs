use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use moolaproto::{validate_nickname, ClientReq, MsgEvent, ServerMsg, MAX_LINE_BYTES};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn, Level};

mod ai;
mod chatlog;
mod commands;
mod economy;
mod farm;
mod ledger;
mod market;
mod rank;
mod room;

use commands::{handle_chat_line, EconCtx, Scope};
use room::{encode_line, new_session_id, Room, SessionInfo};

const MOTD_DEFAULT: &str =
    "welcome to moolamud. every word you type earns a little money. !help for the economy commands.";

fn usage_and_exit() -> ! {
    eprintln!(
        "moolamud (chat server with a toy economy)\n\n\
USAGE:\n  moolamud [--bind HOST:PORT]\n\n\
ENV:\n  MOOLAMUD_BIND           default 0.0.0.0:4040\n  MOOLAMUD_LEDGER_PATH    default ledger.json\n  MOOLAMUD_CHATLOG_PATH   default chatlog.jsonl\n  MOOLAMUD_REPLAY_LINES   default 20\n  MOOLAMUD_ECON_TICK_S    default 60\n  MOOLAMUD_FARM_TICK_S    default 2\n  MOOLAMUD_MOTD           optional\n  OPENAI_API_KEY          optional; enables !ai\n  OPENAI_API_BASE         optional; default https://api.openai.com/v1\n  MOOLAMUD_AI_MODEL       optional; default gpt-4o-mini\n"
    );
    std::process::exit(2);
}

#[derive(Clone, Debug)]
struct Config {
    bind: SocketAddr,
    ledger_path: PathBuf,
    chatlog_path: PathBuf,
    replay_lines: usize,
    econ_tick: Duration,
    farm_tick: Duration,
    motd: String,
}

fn parse_args() -> Config {
    let mut bind: SocketAddr = std::env::var("MOOLAMUD_BIND")
        .unwrap_or_else(|_| "0.0.0.0:4040".to_string())
        .parse()
        .unwrap_or_else(|_| usage_and_exit());

    let ledger_path: PathBuf = std::env::var("MOOLAMUD_LEDGER_PATH")
        .unwrap_or_else(|_| "ledger.json".to_string())
        .into();
    let chatlog_path: PathBuf = std::env::var("MOOLAMUD_CHATLOG_PATH")
        .unwrap_or_else(|_| "chatlog.jsonl".to_string())
        .into();
    let replay_lines = std::env::var("MOOLAMUD_REPLAY_LINES")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(chatlog::REPLAY_LINES);
    let econ_tick = std::env::var("MOOLAMUD_ECON_TICK_S")
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(economy::DEFAULT_TICK);
    let farm_tick = std::env::var("MOOLAMUD_FARM_TICK_S")
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(2));
    let motd = std::env::var("MOOLAMUD_MOTD").unwrap_or_else(|_| MOTD_DEFAULT.to_string());

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--bind" => {
                let v = it.next().unwrap_or_else(|| usage_and_exit());
                bind = v.parse().unwrap_or_else(|_| usage_and_exit());
            }
            "-h" | "--help" => usage_and_exit(),
            _ => usage_and_exit(),
        }
    }

    Config {
        bind,
        ledger_path,
        chatlog_path,
        replay_lines,
        econ_tick,
        farm_tick,
        motd,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,moolamud=info".into()),
        )
        .with_target(false)
        .with_max_level(Level::INFO)
        .init();

    let cfg = parse_args();
    let listener = TcpListener::bind(cfg.bind)
        .await
        .with_context(|| format!("bind {}", cfg.bind))?;

    let ledger = Arc::new(Mutex::new(ledger::Ledger::load(cfg.ledger_path.clone())));
    let market = Arc::new(Mutex::new(market::Market::new()));
    let room = Arc::new(Room::new());
    let ctx = EconCtx {
        ledger: ledger.clone(),
        market: market.clone(),
        farms: Arc::new(farm::FarmRegistry::new()),
        room: room.clone(),
        chatlog: Arc::new(chatlog::ChatLog::open(
            cfg.chatlog_path.clone(),
            cfg.replay_lines,
        )),
        ai: ai::AiConfig::from_env(),
        farm_tick: cfg.farm_tick,
    };

    economy::spawn(ledger, market, room, cfg.econ_tick);

    info!(
        bind = %cfg.bind,
        ledger = %cfg.ledger_path.display(),
        chatlog = %cfg.chatlog_path.display(),
        econ_tick_s = cfg.econ_tick.as_secs(),
        farm_tick_s = cfg.farm_tick.as_secs(),
        ai = ctx.ai.is_some(),
        "moolamud listening"
    );

    loop {
        let (stream, peer) = listener.accept().await?;
        let ctx = ctx.clone();
        let motd = cfg.motd.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_conn(stream, peer, ctx, motd).await {
                warn!(peer = %peer, err = %e, "connection ended with error");
            }
        });
    }
}

async fn handle_conn(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: EconCtx,
    motd: String,
) -> anyhow::Result<()> {
    let (rd, mut wr) = stream.into_split();
    let mut lines = BufReader::new(rd).lines();

    // One write queue per session so a slow client never stalls the room.
    // The writer exits when the last queue handle drops.
    let (write_tx, mut write_rx) = mpsc::channel::<Bytes>(256);
    tokio::spawn(async move {
        while let Some(b) = write_rx.recv().await {
            if wr.write_all(&b).await.is_err() {
                break;
            }
        }
    });

    send_direct(&write_tx, &ServerMsg::Hello { motd }).await;

    // The first real request must claim a nickname.
    let nick = match await_join(&mut lines, &write_tx).await? {
        Some(nick) => nick,
        None => return Ok(()),
    };

    let session = new_session_id();
    ctx.room
        .insert(
            session,
            SessionInfo {
                nickname: nick.clone(),
                write_tx: write_tx.clone(),
            },
        )
        .await;
    info!(peer = %peer, nick = %nick, sid = session.short(), "joined");

    // Catch the newcomer up, then tell everyone.
    for rec in ctx.chatlog.tail().await {
        send_direct(
            &write_tx,
            &ServerMsg::Message {
                event: rec.to_event(),
            },
        )
        .await;
    }
    let online = ctx.room.count().await;
    ctx.room
        .broadcast_event(&MsgEvent::system(format!("* {nick} joined ({online} online)")))
        .await;

    let result = session_loop(&mut lines, &ctx, &nick, session, &write_tx).await;

    ctx.room.remove(session).await;
    ctx.room
        .broadcast_event(&MsgEvent::system(format!("* {nick} left")))
        .await;
    info!(peer = %peer, nick = %nick, sid = session.short(), "left");
    result
}

/// Read requests until the client joins. `Ok(None)` means the peer went
/// away (or sent something hopeless) before joining.
async fn await_join(
    lines: &mut Lines<BufReader<OwnedReadHalf>>,
    write_tx: &mpsc::Sender<Bytes>,
) -> anyhow::Result<Option<String>> {
    while let Some(line) = lines.next_line().await? {
        let Some(req) = decode_req(&line, write_tx).await else {
            continue;
        };
        match req {
            ClientReq::Join { nickname } => match validate_nickname(&nickname) {
                Ok(nick) => return Ok(Some(nick.to_string())),
                Err(e) => {
                    send_direct(
                        write_tx,
                        &ServerMsg::Err {
                            text: e.to_string(),
                        },
                    )
                    .await;
                }
            },
            ClientReq::Ping {} => send_direct(write_tx, &ServerMsg::Pong {}).await,
            ClientReq::Msg { .. } => {
                send_direct(
                    write_tx,
                    &ServerMsg::Err {
                        text: "join first".to_string(),
                    },
                )
                .await;
            }
        }
    }
    Ok(None)
}

async fn session_loop(
    lines: &mut Lines<BufReader<OwnedReadHalf>>,
    ctx: &EconCtx,
    nick: &str,
    session: room::SessionId,
    write_tx: &mpsc::Sender<Bytes>,
) -> anyhow::Result<()> {
    while let Some(line) = lines.next_line().await? {
        let Some(req) = decode_req(&line, write_tx).await else {
            continue;
        };
        match req {
            ClientReq::Ping {} => send_direct(write_tx, &ServerMsg::Pong {}).await,
            ClientReq::Join { .. } => {
                send_direct(
                    write_tx,
                    &ServerMsg::Err {
                        text: "already joined".to_string(),
                    },
                )
                .await;
            }
            ClientReq::Msg { text } => {
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }
                for (scope, ev) in handle_chat_line(ctx, nick, text).await {
                    match scope {
                        Scope::Sender => ctx.room.send_event(session, &ev).await,
                        Scope::Room => ctx.room.broadcast_event(&ev).await,
                    }
                }
            }
        }
    }
    Ok(())
}

/// Parse one wire line; protocol junk earns an err reply, not a drop.
async fn decode_req(line: &str, write_tx: &mpsc::Sender<Bytes>) -> Option<ClientReq> {
    if line.len() > MAX_LINE_BYTES {
        send_direct(
            write_tx,
            &ServerMsg::Err {
                text: "line too long".to_string(),
            },
        )
        .await;
        return None;
    }
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<ClientReq>(line) {
        Ok(req) => Some(req),
        Err(e) => {
            send_direct(
                write_tx,
                &ServerMsg::Err {
                    text: format!("bad request: {e}"),
                },
            )
            .await;
            None
        }
    }
}

async fn send_direct(write_tx: &mpsc::Sender<Bytes>, msg: &ServerMsg) {
    if let Some(b) = encode_line(msg) {
        let _ = write_tx.send(b).await;
    }
}
