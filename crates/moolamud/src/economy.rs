use std::sync::Arc;
use std::time::Duration;

use moolaproto::MsgEvent;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::commands::fmt_amount;
use crate::ledger::Ledger;
use crate::market::{Market, DRIFT_HIGH, DRIFT_LOW};
use crate::room::Room;

pub const DEFAULT_TICK: Duration = Duration::from_secs(60);

/// Launch the economy heartbeat: every period, pay interest, drift the
/// market, and tell the room. One bad iteration is logged and skipped,
/// never fatal; the scheduler outlives everything but the process.
pub fn spawn(
    ledger: Arc<Mutex<Ledger>>,
    market: Arc<Mutex<Market>>,
    room: Arc<Room>,
    period: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(period).await;
            if let Err(e) = tick_once(&ledger, &market, &room).await {
                warn!(err = %e, "economy tick failed; skipping this period");
            }
        }
    })
}

/// One scheduler iteration, separated out so tests can drive it
/// without waiting on the clock.
pub async fn tick_once(
    ledger: &Arc<Mutex<Ledger>>,
    market: &Arc<Mutex<Market>>,
    room: &Arc<Room>,
) -> anyhow::Result<()> {
    // Interest first, reading each bank balance as it is right now.
    let (paid, save_res) = {
        let mut l = ledger.lock().await;
        let paid = l.accrue_interest();
        let save_res = if paid > 0 { l.save() } else { Ok(()) };
        (paid, save_res)
    };

    let price_report = {
        let mut m = market.lock().await;
        let mut rng = rand::thread_rng();
        m.tick(&mut rng, DRIFT_LOW, DRIFT_HIGH);
        m.symbols()
            .iter()
            .filter_map(|sym| m.price(sym).map(|px| format!("{sym} {}₩", fmt_amount(px))))
            .collect::<Vec<_>>()
            .join(", ")
    };

    debug!(paid, prices = %price_report, "economy tick");
    room.broadcast_event(&MsgEvent::news(format!(
        "[economy news] {price_report} | 1% interest paid to {paid} savers"
    )))
    .await;

    // A store hiccup still deserves the operator's attention, even
    // though the in-memory ledger already moved on.
    save_res?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::BalanceField;
    use crate::market::SEED_ASSETS;
    use crate::room::{SessionId, SessionInfo};
    use moolaproto::{MsgKind, ServerMsg};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn tick_pays_interest_drifts_prices_and_announces() {
        let ledger = Arc::new(Mutex::new(Ledger::in_memory()));
        let market = Arc::new(Mutex::new(Market::new()));
        let room = Arc::new(Room::new());

        ledger
            .lock()
            .await
            .adjust("Alice", BalanceField::Bank, 1000)
            .unwrap();
        ledger.lock().await.get_or_create("Broke");

        let (tx, mut rx) = mpsc::channel(16);
        room.insert(
            SessionId(1),
            SessionInfo {
                nickname: "tap".to_string(),
                write_tx: tx,
            },
        )
        .await;

        tick_once(&ledger, &market, &room).await.unwrap();

        assert_eq!(ledger.lock().await.snapshot("Alice").unwrap().bank, 1010);
        assert_eq!(ledger.lock().await.snapshot("Broke").unwrap().bank, 0);

        let seed = SEED_ASSETS[0].1;
        let px = market.lock().await.price("BTC").unwrap();
        assert!(px >= ((seed as f64) * DRIFT_LOW) as i64 - 1);
        assert!(px <= ((seed as f64) * DRIFT_HIGH) as i64 + 1);

        let b = rx.recv().await.unwrap();
        match serde_json::from_slice::<ServerMsg>(&b).unwrap() {
            ServerMsg::Message { event } => {
                assert_eq!(event.kind, MsgKind::News);
                assert!(event.msg.contains("interest paid to 1 savers"));
                assert!(event.msg.contains("BTC"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn two_ticks_compound_truncating() {
        let ledger = Arc::new(Mutex::new(Ledger::in_memory()));
        let market = Arc::new(Mutex::new(Market::new()));
        let room = Arc::new(Room::new());

        ledger
            .lock()
            .await
            .adjust("Alice", BalanceField::Bank, 1000)
            .unwrap();

        tick_once(&ledger, &market, &room).await.unwrap();
        tick_once(&ledger, &market, &room).await.unwrap();

        // 1000 -> 1010 -> 1020 (1020.1 truncated).
        assert_eq!(ledger.lock().await.snapshot("Alice").unwrap().bank, 1020);
    }
}
