use std::sync::Arc;
use std::time::Duration;

use moolaproto::{validate_nickname, MsgEvent, MsgKind};
use rand::Rng;
use tokio::sync::{watch, Mutex};
use tracing::warn;

use crate::ai::{self, AiConfig};
use crate::chatlog::{ChatLog, ChatRecord};
use crate::farm::FarmRegistry;
use crate::ledger::{BalanceField, Ledger};
use crate::market::Market;
use crate::rank::Rank;
use crate::room::Room;

/// Ordinary chat pays `BASE + PER_CHAR * chars`.
pub const CHAT_REWARD_BASE: i64 = 10;
pub const CHAT_REWARD_PER_CHAR: i64 = 2;

/// Chat rewards above this get their own news bulletin.
pub const NEWS_REWARD_FLOOR: i64 = 5000;

/// Each farm tick banks this much.
pub const FARM_REWARD: i64 = 5000;

pub const TOP_N: usize = 10;

const HELP_TEXT: &str = "commands:\n \
!balance | !deposit <amount> | !withdraw <amount> | !gift <nick> <amount>\n \
!gamble <amount> | !rps <rock|paper|scissors> <amount> | !buy <asset> <amount>\n \
!top | !farm | !stopfarm | !ai <prompt> | !help";

const USAGE_DEPOSIT: &str = "usage: !deposit <amount>";
const USAGE_WITHDRAW: &str = "usage: !withdraw <amount>";
const USAGE_GIFT: &str = "usage: !gift <nick> <amount>";
const USAGE_GAMBLE: &str = "usage: !gamble <amount>";
const USAGE_RPS: &str = "usage: !rps <rock|paper|scissors> <amount>";
const USAGE_BUY: &str = "usage: !buy <asset> <amount>";
const USAGE_AI: &str = "usage: !ai <prompt>";

/// Where a reply goes: back to the speaker only, or to the whole room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Sender,
    Room,
}

/// Everything a command handler may touch. Cheap to clone; all shared
/// state is behind Arcs.
#[derive(Clone)]
pub struct EconCtx {
    pub ledger: Arc<Mutex<Ledger>>,
    pub market: Arc<Mutex<Market>>,
    pub farms: Arc<FarmRegistry>,
    pub room: Arc<Room>,
    pub chatlog: Arc<ChatLog>,
    pub ai: Option<AiConfig>,
    pub farm_tick: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpsChoice {
    Rock,
    Paper,
    Scissors,
}

impl RpsChoice {
    pub fn parse(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "rock" | "r" => Some(RpsChoice::Rock),
            "paper" | "p" => Some(RpsChoice::Paper),
            "scissors" | "s" => Some(RpsChoice::Scissors),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RpsChoice::Rock => "rock",
            RpsChoice::Paper => "paper",
            RpsChoice::Scissors => "scissors",
        }
    }

    pub fn beats(self, other: RpsChoice) -> bool {
        matches!(
            (self, other),
            (RpsChoice::Rock, RpsChoice::Scissors)
                | (RpsChoice::Paper, RpsChoice::Rock)
                | (RpsChoice::Scissors, RpsChoice::Paper)
        )
    }

    fn pick(rng: &mut impl Rng) -> Self {
        match rng.gen_range(0..3) {
            0 => RpsChoice::Rock,
            1 => RpsChoice::Paper,
            _ => RpsChoice::Scissors,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command<'a> {
    Balance,
    Deposit(i64),
    Withdraw(i64),
    Gift { to: &'a str, amount: i64 },
    Gamble(i64),
    Rps { choice: RpsChoice, bet: i64 },
    Buy { asset: &'a str, amount: i64 },
    Top,
    FarmStart,
    FarmStop,
    Help,
    Ai(&'a str),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Parsed<'a> {
    /// Not a command; earns the chat reward and goes to the room.
    Chat,
    /// Recognized command with bad arguments.
    Usage(&'static str),
    Cmd(Command<'a>),
}

fn amount_arg(tok: Option<&str>) -> Option<i64> {
    tok?.parse::<i64>().ok().filter(|a| *a > 0)
}

pub fn parse_command(text: &str) -> Parsed<'_> {
    let text = text.trim();
    if !text.starts_with('!') {
        return Parsed::Chat;
    }
    let mut toks = text.split_whitespace();
    let Some(head) = toks.next() else {
        return Parsed::Chat;
    };

    match head.to_ascii_lowercase().as_str() {
        "!balance" | "!bal" => Parsed::Cmd(Command::Balance),
        "!deposit" => match amount_arg(toks.next()) {
            Some(a) => Parsed::Cmd(Command::Deposit(a)),
            None => Parsed::Usage(USAGE_DEPOSIT),
        },
        "!withdraw" => match amount_arg(toks.next()) {
            Some(a) => Parsed::Cmd(Command::Withdraw(a)),
            None => Parsed::Usage(USAGE_WITHDRAW),
        },
        "!gift" => match (toks.next(), amount_arg(toks.next())) {
            (Some(to), Some(amount)) => Parsed::Cmd(Command::Gift { to, amount }),
            _ => Parsed::Usage(USAGE_GIFT),
        },
        "!gamble" => match amount_arg(toks.next()) {
            Some(a) => Parsed::Cmd(Command::Gamble(a)),
            None => Parsed::Usage(USAGE_GAMBLE),
        },
        "!rps" => match (toks.next().and_then(RpsChoice::parse), amount_arg(toks.next())) {
            (Some(choice), Some(bet)) => Parsed::Cmd(Command::Rps { choice, bet }),
            _ => Parsed::Usage(USAGE_RPS),
        },
        "!buy" => match (toks.next(), amount_arg(toks.next())) {
            (Some(asset), Some(amount)) => Parsed::Cmd(Command::Buy { asset, amount }),
            _ => Parsed::Usage(USAGE_BUY),
        },
        "!top" | "!ranking" => Parsed::Cmd(Command::Top),
        "!farm" => Parsed::Cmd(Command::FarmStart),
        "!stopfarm" | "!farmstop" => Parsed::Cmd(Command::FarmStop),
        "!help" | "!commands" => Parsed::Cmd(Command::Help),
        "!ai" => {
            let prompt = text
                .split_once(char::is_whitespace)
                .map(|(_, rest)| rest.trim())
                .unwrap_or("");
            if prompt.is_empty() {
                Parsed::Usage(USAGE_AI)
            } else {
                Parsed::Cmd(Command::Ai(prompt))
            }
        }
        // Unknown bang-words are just chat, like any other typo.
        _ => Parsed::Chat,
    }
}

/// The whole economy surface for one inbound chat line. Total: every
/// input produces zero or more outbound events and never an error.
pub async fn handle_chat_line(ctx: &EconCtx, nick: &str, text: &str) -> Vec<(Scope, MsgEvent)> {
    match parse_command(text) {
        Parsed::Chat => ordinary_chat(ctx, nick, text).await,
        Parsed::Usage(hint) => vec![(Scope::Sender, MsgEvent::system(hint))],
        Parsed::Cmd(cmd) => run_command(ctx, nick, cmd).await,
    }
}

async fn run_command<'a>(ctx: &EconCtx, nick: &str, cmd: Command<'a>) -> Vec<(Scope, MsgEvent)> {
    match cmd {
        Command::Balance => balance_report(ctx, nick).await,

        Command::Deposit(a) => {
            let mut l = ctx.ledger.lock().await;
            match l.adjust(nick, BalanceField::Cash, -a) {
                Ok(_) => {
                    if let Err(e) = l.adjust(nick, BalanceField::Bank, a) {
                        warn!(nick = %nick, err = %e, "deposit credit failed");
                    }
                    l.save_or_warn();
                    reply(format!("deposited {}₩ into the bank", fmt_amount(a)))
                }
                Err(_) => reply(format!("not enough cash to deposit {}₩", fmt_amount(a))),
            }
        }

        Command::Withdraw(a) => {
            let mut l = ctx.ledger.lock().await;
            match l.adjust(nick, BalanceField::Bank, -a) {
                Ok(_) => {
                    if let Err(e) = l.adjust(nick, BalanceField::Cash, a) {
                        warn!(nick = %nick, err = %e, "withdraw credit failed");
                    }
                    l.save_or_warn();
                    reply(format!("withdrew {}₩ from the bank", fmt_amount(a)))
                }
                Err(_) => reply(format!("not enough banked to withdraw {}₩", fmt_amount(a))),
            }
        }

        Command::Gift { to, amount } => {
            let to = match validate_nickname(to) {
                Ok(t) => t,
                Err(_) => return reply(USAGE_GIFT.to_string()),
            };
            let mut l = ctx.ledger.lock().await;
            match l.adjust(nick, BalanceField::Cash, -amount) {
                Ok(_) => {
                    // Exactly what left the sender lands on the recipient.
                    if let Err(e) = l.adjust(to, BalanceField::Cash, amount) {
                        warn!(from = %nick, to = %to, err = %e, "gift credit failed");
                    }
                    l.save_or_warn();
                    vec![(
                        Scope::Room,
                        MsgEvent::news(format!(
                            "{nick} sent {}₩ to {to} as a gift",
                            fmt_amount(amount)
                        )),
                    )]
                }
                Err(_) => reply(format!("not enough cash to gift {}₩", fmt_amount(amount))),
            }
        }

        Command::Gamble(bet) => gamble(ctx, nick, bet).await,
        Command::Rps { choice, bet } => rock_paper_scissors(ctx, nick, choice, bet).await,
        Command::Buy { asset, amount } => buy_asset(ctx, nick, asset, amount).await,

        Command::Top => {
            let rows = ctx.ledger.lock().await.top_by_wealth(TOP_N);
            let mut s = String::from("wealth ranking");
            for (i, (who, total)) in rows.iter().enumerate() {
                s.push_str(&format!("\n {}. {} ({}₩)", i + 1, who, fmt_amount(*total)));
            }
            reply(s)
        }

        Command::FarmStart => match ctx.farms.begin(nick).await {
            Some(run_flag) => {
                tokio::spawn(farm_loop(ctx.clone(), nick.to_string(), run_flag));
                reply("farm started; !stopfarm to stop".to_string())
            }
            None => reply("your farm is already running".to_string()),
        },

        Command::FarmStop => {
            if ctx.farms.stop(nick).await {
                reply("farm stopping at its next tick".to_string())
            } else {
                reply("no farm running".to_string())
            }
        }

        Command::Help => reply(HELP_TEXT.to_string()),

        Command::Ai(prompt) => {
            let Some(cfg) = ctx.ai.clone() else {
                return reply("ai is not configured on this server".to_string());
            };
            // Fire and forget: the completion call runs after any ledger
            // effect and its failure stays out of the room.
            let room = ctx.room.clone();
            let prompt = prompt.to_string();
            tokio::spawn(async move {
                match ai::complete(&cfg, &prompt).await {
                    Ok(text) => {
                        room.broadcast_event(&MsgEvent::bot(format!("AI: {text}")))
                            .await;
                    }
                    Err(e) => warn!(err = %e, "completion request failed"),
                }
            });
            Vec::new()
        }
    }
}

fn reply(msg: String) -> Vec<(Scope, MsgEvent)> {
    vec![(Scope::Sender, MsgEvent::system(msg))]
}

async fn balance_report(ctx: &EconCtx, nick: &str) -> Vec<(Scope, MsgEvent)> {
    let snap = {
        let mut l = ctx.ledger.lock().await;
        l.get_or_create(nick).clone()
    };
    let held = ctx.market.lock().await.valuation(&snap.holdings);
    let total = snap.cash.saturating_add(snap.bank).saturating_add(held);
    let rank = Rank::for_wealth(total);
    let farm = if ctx.farms.is_running(nick).await {
        "running"
    } else {
        "idle"
    };
    reply(format!(
        "asset report for {nick}\n - cash: {}₩\n - bank: {}₩\n - holdings: {}₩\n - total: {}₩ [{}]\n - farm: {farm}",
        fmt_amount(snap.cash),
        fmt_amount(snap.bank),
        fmt_amount(held),
        fmt_amount(total),
        rank.as_str()
    ))
}

async fn gamble(ctx: &EconCtx, nick: &str, bet: i64) -> Vec<(Scope, MsgEvent)> {
    let win = rand::thread_rng().gen_bool(0.5);
    let mut l = ctx.ledger.lock().await;
    if l.get_or_create(nick).cash < bet {
        return reply(format!("not enough cash to gamble {}₩", fmt_amount(bet)));
    }
    let delta = if win { bet } else { -bet };
    if let Err(e) = l.adjust(nick, BalanceField::Cash, delta) {
        warn!(nick = %nick, err = %e, "gamble settle failed");
        return reply(format!("not enough cash to gamble {}₩", fmt_amount(bet)));
    }
    l.save_or_warn();
    if win {
        vec![(
            Scope::Room,
            MsgEvent::news(format!(
                "[jackpot] {nick} staked {}₩ and doubled it",
                fmt_amount(bet)
            )),
        )]
    } else {
        vec![(
            Scope::Room,
            MsgEvent::system(format!(
                "{nick} gambled {}₩ into thin air",
                fmt_amount(bet)
            )),
        )]
    }
}

async fn rock_paper_scissors(
    ctx: &EconCtx,
    nick: &str,
    choice: RpsChoice,
    bet: i64,
) -> Vec<(Scope, MsgEvent)> {
    let house = RpsChoice::pick(&mut rand::thread_rng());
    let mut l = ctx.ledger.lock().await;
    if l.get_or_create(nick).cash < bet {
        return reply(format!("not enough cash to bet {}₩", fmt_amount(bet)));
    }
    let verdict = if choice == house {
        "draw"
    } else if choice.beats(house) {
        if let Err(e) = l.adjust(nick, BalanceField::Cash, bet) {
            warn!(nick = %nick, err = %e, "rps payout failed");
        }
        "you win"
    } else {
        if let Err(e) = l.adjust(nick, BalanceField::Cash, -bet) {
            warn!(nick = %nick, err = %e, "rps settle failed");
        }
        "you lose"
    };
    l.save_or_warn();
    reply(format!(
        "you threw {}, house threw {} - {}!",
        choice.as_str(),
        house.as_str(),
        verdict
    ))
}

async fn buy_asset(ctx: &EconCtx, nick: &str, asset: &str, amount: i64) -> Vec<(Scope, MsgEvent)> {
    let sym = asset.to_ascii_uppercase();
    let (price, listed) = {
        let m = ctx.market.lock().await;
        (m.price(&sym), m.symbols().join(", "))
    };
    let Some(price) = price else {
        return reply(format!("unknown asset {asset}; tradable: {listed}"));
    };
    let qty = amount as f64 / price as f64;
    let mut l = ctx.ledger.lock().await;
    match l.adjust(nick, BalanceField::Cash, -amount) {
        Ok(_) => {
            if let Err(e) = l.adjust_holding(nick, &sym, qty) {
                warn!(nick = %nick, asset = %sym, err = %e, "holding credit failed");
            }
            l.save_or_warn();
            reply(format!(
                "bought {qty:.6} {sym} at {}₩ per unit",
                fmt_amount(price)
            ))
        }
        Err(_) => reply(format!("not enough cash to buy {}₩ of {sym}", fmt_amount(amount))),
    }
}

/// Plain chat: pay the length-scaled reward, badge the speaker's rank,
/// log it, and hand it to the room.
async fn ordinary_chat(ctx: &EconCtx, nick: &str, text: &str) -> Vec<(Scope, MsgEvent)> {
    let reward = CHAT_REWARD_BASE + CHAT_REWARD_PER_CHAR * text.chars().count() as i64;
    let snap = {
        let mut l = ctx.ledger.lock().await;
        if let Err(e) = l.adjust(nick, BalanceField::Cash, reward) {
            warn!(nick = %nick, err = %e, "chat reward failed");
        }
        l.save_or_warn();
        l.get_or_create(nick).clone()
    };
    let held = ctx.market.lock().await.valuation(&snap.holdings);
    let total = snap.cash.saturating_add(snap.bank).saturating_add(held);

    let mut ev = MsgEvent::from_user(nick, text, MsgKind::Chat);
    ev.rank = Some(Rank::for_wealth(total).as_str().to_string());
    ev.reward = Some(format!("+{}₩", fmt_amount(reward)));
    ctx.chatlog.append(ChatRecord::from_event(&ev)).await;

    let mut out = vec![(Scope::Room, ev)];
    if reward > NEWS_REWARD_FLOOR {
        out.push((
            Scope::Room,
            MsgEvent::news(format!(
                "[economy bulletin] {nick}'s wall of text just minted {}₩",
                fmt_amount(reward)
            )),
        ));
    }
    out
}

/// One farming loop. Credit, announce, sleep, re-check the flag; exits
/// quietly once the registry flips it.
async fn farm_loop(ctx: EconCtx, nick: String, run_flag: watch::Receiver<bool>) {
    loop {
        if !*run_flag.borrow() {
            break;
        }
        let res = {
            let mut l = ctx.ledger.lock().await;
            let r = l.adjust(&nick, BalanceField::Bank, FARM_REWARD);
            if r.is_ok() {
                l.save_or_warn();
            }
            r
        };
        match res {
            Ok(_) => {
                let ev = MsgEvent::from_user(
                    nick.clone(),
                    format!("farming... (+{}₩ banked)", fmt_amount(FARM_REWARD)),
                    MsgKind::System,
                );
                ctx.room.broadcast_event(&ev).await;
            }
            Err(e) => warn!(nick = %nick, err = %e, "farm credit failed"),
        }
        tokio::time::sleep(ctx.farm_tick).await;
    }
}

/// `1234567` -> `"1,234,567"`.
pub fn fmt_amount(n: i64) -> String {
    let digits = n.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if n < 0 {
        out.push('-');
    }
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}
