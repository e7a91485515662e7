use std::collections::HashMap;

use rand::Rng;

/// Assets the empire trades and their restart price. Prices are not
/// persisted; every boot starts the walk over from here.
pub const SEED_ASSETS: &[(&str, i64)] = &[("BTC", 50_000_000)];

/// Per-tick multiplicative drift bounds.
pub const DRIFT_LOW: f64 = 0.90;
pub const DRIFT_HIGH: f64 = 1.15;

/// In-memory simulated prices. Shared as `Arc<Mutex<Market>>`; only the
/// economy scheduler calls `tick`, everyone else just reads.
#[derive(Debug)]
pub struct Market {
    prices: HashMap<String, i64>,
}

impl Market {
    pub fn new() -> Self {
        let prices = SEED_ASSETS
            .iter()
            .map(|(sym, px)| (sym.to_string(), *px))
            .collect();
        Self { prices }
    }

    pub fn price(&self, asset: &str) -> Option<i64> {
        self.prices.get(asset).copied()
    }

    /// Symbols in a stable order, for announcements and help text.
    pub fn symbols(&self) -> Vec<String> {
        let mut v: Vec<String> = self.prices.keys().cloned().collect();
        v.sort();
        v
    }

    /// One random-walk step: every price becomes `price * uniform(low, high)`,
    /// truncated to whole units and floored at 1 so an asset can crash but
    /// never disappear.
    pub fn tick(&mut self, rng: &mut impl Rng, low: f64, high: f64) {
        for px in self.prices.values_mut() {
            let factor = rng.gen_range(low..high);
            *px = ((*px as f64 * factor) as i64).max(1);
        }
    }

    /// Truncated total value of a holdings map at current prices.
    /// Unknown symbols value at zero.
    pub fn valuation(&self, holdings: &HashMap<String, f64>) -> i64 {
        holdings
            .iter()
            .map(|(asset, qty)| {
                self.prices
                    .get(asset)
                    .map(|px| (qty * *px as f64) as i64)
                    .unwrap_or(0)
            })
            .sum()
    }
}
