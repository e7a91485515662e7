use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Every account starts with this much cash on first sight.
pub const STARTING_CASH: i64 = 1000;

/// The two integer balances `adjust` may touch. Closed on purpose:
/// persistence never sees a free-form field name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceField {
    Cash,
    Bank,
}

impl BalanceField {
    pub fn as_str(self) -> &'static str {
        match self {
            BalanceField::Cash => "cash",
            BalanceField::Bank => "bank",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AdjustError {
    /// The mutation would take the balance below zero. Nothing was written.
    Insufficient {
        field: &'static str,
        have: i64,
        delta: i64,
    },
    InsufficientHolding {
        asset: String,
        have: f64,
        delta: f64,
    },
}

impl std::fmt::Display for AdjustError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdjustError::Insufficient { field, have, delta } => {
                write!(f, "{field} would go negative: have {have}, delta {delta}")
            }
            AdjustError::InsufficientHolding { asset, have, delta } => {
                write!(
                    f,
                    "holding {asset} would go negative: have {have}, delta {delta}"
                )
            }
        }
    }
}

impl std::error::Error for AdjustError {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub nickname: String,
    pub cash: i64,
    pub bank: i64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub holdings: HashMap<String, f64>,
    pub created_unix: u64,
    /// Creation sequence; the stable tie-break for wealth ranking.
    pub seq: u64,
}

impl Account {
    fn new(nickname: &str, seq: u64) -> Self {
        Self {
            nickname: nickname.to_string(),
            cash: STARTING_CASH,
            bank: 0,
            holdings: HashMap::new(),
            created_unix: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            seq,
        }
    }
}

/// The authoritative account store. Shared as `Arc<tokio::sync::Mutex<Ledger>>`;
/// holding that one lock is what serializes concurrent adjustments, so no
/// method here spawns, sleeps, or does IO other than `save`.
#[derive(Debug)]
pub struct Ledger {
    path: Option<PathBuf>,
    by_nick: HashMap<String, Account>,
    next_seq: u64,
}

impl Ledger {
    /// Load from disk. A missing or unreadable file starts an empty ledger;
    /// we'd rather open with fresh accounts than refuse to boot.
    pub fn load(path: PathBuf) -> Self {
        let mut by_nick = HashMap::new();
        let mut next_seq = 0u64;
        if let Ok(s) = std::fs::read_to_string(&path) {
            match serde_json::from_str::<Vec<Account>>(&s) {
                Ok(v) => {
                    for a in v {
                        next_seq = next_seq.max(a.seq + 1);
                        by_nick.insert(a.nickname.clone(), a);
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), err = %e, "ledger file unreadable; starting empty");
                }
            }
        }
        Self {
            path: Some(path),
            by_nick,
            next_seq,
        }
    }

    /// An unbacked ledger; saves are no-ops.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            by_nick: HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn get_or_create(&mut self, nick: &str) -> &Account {
        self.ensure_mut(nick)
    }

    fn ensure_mut(&mut self, nick: &str) -> &mut Account {
        let next_seq = &mut self.next_seq;
        self.by_nick.entry(nick.to_string()).or_insert_with(|| {
            let acc = Account::new(nick, *next_seq);
            *next_seq += 1;
            acc
        })
    }

    /// Apply `field += delta`, rejecting any result below zero.
    ///
    /// This is the only mutation path for cash and bank. The account is
    /// created on first touch, so a gift to a stranger lands on a fresh
    /// account with the starting grant.
    pub fn adjust(
        &mut self,
        nick: &str,
        field: BalanceField,
        delta: i64,
    ) -> Result<i64, AdjustError> {
        let acc = self.ensure_mut(nick);
        let slot = match field {
            BalanceField::Cash => &mut acc.cash,
            BalanceField::Bank => &mut acc.bank,
        };
        let next = slot.saturating_add(delta);
        if next < 0 {
            return Err(AdjustError::Insufficient {
                field: field.as_str(),
                have: *slot,
                delta,
            });
        }
        *slot = next;
        Ok(next)
    }

    /// Same contract as `adjust`, for asset holdings.
    pub fn adjust_holding(
        &mut self,
        nick: &str,
        asset: &str,
        delta_qty: f64,
    ) -> Result<f64, AdjustError> {
        let acc = self.ensure_mut(nick);
        let have = acc.holdings.get(asset).copied().unwrap_or(0.0);
        let next = have + delta_qty;
        if next < 0.0 {
            return Err(AdjustError::InsufficientHolding {
                asset: asset.to_string(),
                have,
                delta: delta_qty,
            });
        }
        acc.holdings.insert(asset.to_string(), next);
        Ok(next)
    }

    /// Point-in-time copy for display; may be stale by the time the next
    /// command runs, which is fine.
    pub fn snapshot(&self, nick: &str) -> Option<Account> {
        self.by_nick.get(nick).cloned()
    }

    /// Accrue 1% interest (truncated) on every positive bank balance,
    /// reading each balance now, not at scheduler start. Returns how many
    /// accounts were paid.
    pub fn accrue_interest(&mut self) -> usize {
        let mut paid = 0;
        for acc in self.by_nick.values_mut() {
            if acc.bank > 0 {
                acc.bank = acc.bank.saturating_mul(101) / 100;
                paid += 1;
            }
        }
        paid
    }

    /// Top accounts by `cash + bank`, descending, ties broken by creation
    /// order. Holdings are deliberately excluded here (display valuation
    /// belongs to the market).
    pub fn top_by_wealth(&self, n: usize) -> Vec<(String, i64)> {
        let mut rows: Vec<(&Account, i64)> = self
            .by_nick
            .values()
            .map(|a| (a, a.cash.saturating_add(a.bank)))
            .collect();
        rows.sort_by(|(a, ta), (b, tb)| tb.cmp(ta).then(a.seq.cmp(&b.seq)));
        rows.into_iter()
            .take(n)
            .map(|(a, total)| (a.nickname.clone(), total))
            .collect()
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut v = self.by_nick.values().cloned().collect::<Vec<_>>();
        v.sort_by(|a, b| a.nickname.cmp(&b.nickname));
        let s = serde_json::to_string_pretty(&v)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, s)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Best-effort save: a persistence hiccup is logged, never propagated.
    /// The in-memory ledger stays authoritative either way.
    pub fn save_or_warn(&self) {
        if let Err(e) = self.save() {
            warn!(err = %e, "ledger save failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    #[test]
    fn first_sight_gets_the_default_grant() {
        let mut l = Ledger::in_memory();
        let a = l.get_or_create("Alice");
        assert_eq!(a.cash, STARTING_CASH);
        assert_eq!(a.bank, 0);
        assert!(a.holdings.is_empty());
        // Second sight returns the same row, not a fresh grant.
        l.adjust("Alice", BalanceField::Cash, -100).unwrap();
        assert_eq!(l.get_or_create("Alice").cash, STARTING_CASH - 100);
    }

    #[test]
    fn adjust_rejects_negative_results_without_writing() {
        let mut l = Ledger::in_memory();
        let err = l.adjust("Alice", BalanceField::Cash, -2000).unwrap_err();
        assert!(matches!(err, AdjustError::Insufficient { have: 1000, .. }));
        assert_eq!(l.snapshot("Alice").unwrap().cash, 1000);

        let err = l.adjust("Alice", BalanceField::Bank, -1).unwrap_err();
        assert!(matches!(err, AdjustError::Insufficient { have: 0, .. }));
        assert_eq!(l.snapshot("Alice").unwrap().bank, 0);
    }

    #[test]
    fn holdings_never_go_negative() {
        let mut l = Ledger::in_memory();
        l.adjust_holding("Alice", "BTC", 0.5).unwrap();
        assert!(l.adjust_holding("Alice", "BTC", -0.6).is_err());
        let snap = l.snapshot("Alice").unwrap();
        assert!((snap.holdings["BTC"] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn interest_truncates_and_compounds() {
        let mut l = Ledger::in_memory();
        l.adjust("Alice", BalanceField::Bank, 1000).unwrap();
        l.accrue_interest();
        assert_eq!(l.snapshot("Alice").unwrap().bank, 1010);
        l.accrue_interest();
        // 1010 * 1.01 = 1020.1, truncated.
        assert_eq!(l.snapshot("Alice").unwrap().bank, 1020);
    }

    #[test]
    fn interest_skips_empty_banks() {
        let mut l = Ledger::in_memory();
        l.get_or_create("Alice");
        l.adjust("Bob", BalanceField::Bank, 500).unwrap();
        assert_eq!(l.accrue_interest(), 1);
        assert_eq!(l.snapshot("Alice").unwrap().bank, 0);
        assert_eq!(l.snapshot("Bob").unwrap().bank, 505);
    }

    #[test]
    fn ranking_is_descending_with_insertion_order_ties() {
        let mut l = Ledger::in_memory();
        l.get_or_create("First"); // 1000
        l.get_or_create("Second"); // 1000, created later
        l.adjust("Rich", BalanceField::Cash, 9000).unwrap(); // 10000
        l.adjust("Rich", BalanceField::Bank, 5000).unwrap(); // 15000 total

        let top = l.top_by_wealth(10);
        assert_eq!(top[0], ("Rich".to_string(), 15000));
        assert_eq!(top[1], ("First".to_string(), 1000));
        assert_eq!(top[2], ("Second".to_string(), 1000));

        assert_eq!(l.top_by_wealth(2).len(), 2);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");

        let mut l = Ledger::load(path.clone());
        l.adjust("Alice", BalanceField::Cash, 500).unwrap();
        l.adjust_holding("Alice", "BTC", 0.25).unwrap();
        l.save().unwrap();

        let l2 = Ledger::load(path);
        let snap = l2.snapshot("Alice").unwrap();
        assert_eq!(snap.cash, 1500);
        assert!((snap.holdings["BTC"] - 0.25).abs() < 1e-12);
        // Sequence numbers keep counting after a reload.
        let mut l2 = l2;
        l2.get_or_create("Bob");
        assert!(l2.snapshot("Bob").unwrap().seq > snap.seq);
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        std::fs::write(&path, "not json at all {{{").unwrap();
        let mut l = Ledger::load(path);
        assert_eq!(l.get_or_create("Alice").cash, STARTING_CASH);
    }

    #[tokio::test]
    async fn concurrent_adjustments_lose_nothing() {
        let ledger = Arc::new(Mutex::new(Ledger::in_memory()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    ledger
                        .lock()
                        .await
                        .adjust("Alice", BalanceField::Cash, 1)
                        .unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let snap = ledger.lock().await.snapshot("Alice").unwrap();
        assert_eq!(snap.cash, STARTING_CASH + 800);
    }
}
