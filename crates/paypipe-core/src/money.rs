//! Chain-to-fiat conversion.
//!
//! Marketplace amounts are decimal strings in the chain's native unit. The
//! oracle maps a lowercase chain id to a USD unit price; unknown chains
//! deliberately resolve to the `eth` price so a new chain never silently
//! prices at zero.

use std::collections::BTreeMap;

use crate::{Error, Result};

/// Fallback unit price when even `eth` is missing from a custom table.
const DEFAULT_ETH_USD: f64 = 3000.0;

pub trait PriceOracle: Send + Sync {
    /// USD unit price for a lowercase chain id. Must be deterministic for
    /// unknown chains (the `eth` price).
    fn usd_price(&self, chain: &str) -> f64;
}

/// A fixed chain -> USD table.
#[derive(Debug, Clone)]
pub struct StaticPriceTable {
    prices: BTreeMap<String, f64>,
}

impl Default for StaticPriceTable {
    fn default() -> Self {
        let mut prices = BTreeMap::new();
        // Base settles in ETH, so it shares ETH pricing.
        prices.insert("base".to_string(), 3000.0);
        prices.insert("eth".to_string(), 3000.0);
        prices.insert("sol".to_string(), 100.0);
        Self { prices }
    }
}

impl StaticPriceTable {
    pub fn new(prices: BTreeMap<String, f64>) -> Self {
        Self { prices }
    }

    /// Parses a `chain=usd` list, e.g. `"eth=2500,sol=95"`. Commas and
    /// whitespace both separate entries; parsed entries override defaults.
    pub fn from_spec(spec: &str) -> Result<Self> {
        let mut table = Self::default();
        for raw in spec.split(|c: char| c == ',' || c.is_whitespace()) {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            let (chain, price) = raw.split_once('=').ok_or_else(|| {
                Error::NotConfigured(format!("bad price table entry {raw:?}, want chain=usd"))
            })?;
            let price: f64 = price.trim().parse().map_err(|_| {
                Error::NotConfigured(format!("bad price in table entry {raw:?}"))
            })?;
            if !price.is_finite() || price <= 0.0 {
                return Err(Error::NotConfigured(format!(
                    "price must be positive in table entry {raw:?}"
                )));
            }
            table
                .prices
                .insert(chain.trim().to_ascii_lowercase(), price);
        }
        Ok(table)
    }
}

impl PriceOracle for StaticPriceTable {
    fn usd_price(&self, chain: &str) -> f64 {
        let chain = chain.trim().to_ascii_lowercase();
        match self.prices.get(chain.as_str()) {
            Some(p) => *p,
            None => self
                .prices
                .get("eth")
                .copied()
                .unwrap_or(DEFAULT_ETH_USD),
        }
    }
}

/// Converts a native-unit decimal amount to USD via the oracle.
pub fn crypto_to_usd(amount: &str, chain: &str, oracle: &dyn PriceOracle) -> Result<f64> {
    let amount = amount.trim();
    let parsed: f64 = amount
        .parse()
        .map_err(|_| Error::Metadata(format!("bad required amount {amount:?}")))?;
    if !parsed.is_finite() || parsed < 0.0 {
        return Err(Error::Metadata(format!(
            "required amount out of range: {amount:?}"
        )));
    }
    Ok(parsed * oracle.usd_price(chain))
}
