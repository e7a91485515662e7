//! Scripted smoke bots for a running moolamud server: each bot joins,
//! chats, and pokes the economy commands on a timer, logging whatever
//! the room says back. Handy for eyeballing broadcast fan-out and farm
//! cadence without opening N terminals.

use std::time::Duration;

use anyhow::Context;
use moolaproto::{ClientReq, ServerMsg};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{info, warn, Level};

const SCRIPT: &[&str] = &[
    "hello from the swarm",
    "!balance",
    "!deposit 100",
    "!gamble 50",
    "!top",
    "anyone around?",
    "!withdraw 50",
];

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    bots: u32,
}

fn usage_and_exit() -> ! {
    eprintln!(
        "bot_swarm\n\n\
USAGE:\n  bot_swarm [--addr HOST:PORT] [--bots N]\n\n\
ENV:\n  MOOLAMUD_ADDR  default 127.0.0.1:4040\n  BOTS           default 2\n"
    );
    std::process::exit(2);
}

fn parse_args() -> Config {
    let mut addr = std::env::var("MOOLAMUD_ADDR").unwrap_or_else(|_| "127.0.0.1:4040".to_string());
    let mut bots: u32 = std::env::var("BOTS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(2)
        .max(1);

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--addr" => addr = it.next().unwrap_or_else(|| usage_and_exit()),
            "--bots" => {
                bots = it
                    .next()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_else(|| usage_and_exit())
            }
            "-h" | "--help" => usage_and_exit(),
            _ => usage_and_exit(),
        }
    }

    Config { addr, bots }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,bot_swarm=info".into()),
        )
        .with_target(false)
        .with_max_level(Level::INFO)
        .init();

    let cfg = parse_args();
    info!(addr = %cfg.addr, bots = cfg.bots, "bot swarm starting");

    for i in 0..cfg.bots {
        let name = format!("Moola{}", i + 1);
        let addr = cfg.addr.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = bot_loop(&addr, &name).await {
                    warn!(bot = %name, err = %e, "bot loop error; retrying");
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        });
    }

    std::future::pending::<()>().await;
    Ok(())
}

async fn bot_loop(addr: &str, name: &str) -> anyhow::Result<()> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connect {addr}"))?;
    let (rd, mut wr) = stream.into_split();
    let mut lines = BufReader::new(rd).lines();

    send(&mut wr, &ClientReq::Join {
        nickname: name.to_string(),
    })
    .await?;

    let mut script = SCRIPT.iter().cycle();
    let mut chatter = tokio::time::interval(Duration::from_secs(3));
    let mut last_ping = tokio::time::Instant::now();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break; };
                let Ok(msg) = serde_json::from_str::<ServerMsg>(&line) else { continue; };
                match msg {
                    ServerMsg::Hello { .. } | ServerMsg::Pong {} => {}
                    ServerMsg::Err { text } => warn!(bot = %name, err = %text, "server complained"),
                    ServerMsg::Message { event } => {
                        info!(
                            bot = %name,
                            kind = event.kind.as_str(),
                            from = event.nickname.as_deref().unwrap_or("-"),
                            msg = %event.msg,
                            "heard"
                        );
                    }
                }
            }
            _ = chatter.tick() => {
                if let Some(text) = script.next() {
                    send(&mut wr, &ClientReq::Msg { text: text.to_string() }).await?;
                }
                if last_ping.elapsed() > Duration::from_secs(10) {
                    send(&mut wr, &ClientReq::Ping {}).await?;
                    last_ping = tokio::time::Instant::now();
                }
            }
        }
    }

    Ok(())
}

async fn send(
    wr: &mut tokio::net::tcp::OwnedWriteHalf,
    req: &ClientReq,
) -> anyhow::Result<()> {
    let mut b = serde_json::to_vec(req)?;
    b.push(b'\n');
    wr.write_all(&b).await?;
    Ok(())
}
