use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Symbol, ValidationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetClass {
    Equity,
    Etf,
    Future,
    Crypto,
    Forex,
    Index,
}

impl AssetClass {
    pub const ALL: [Self; 6] = [
        Self::Equity,
        Self::Etf,
        Self::Future,
        Self::Crypto,
        Self::Forex,
        Self::Index,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Equity => "equity",
            Self::Etf => "etf",
            Self::Future => "future",
            Self::Crypto => "crypto",
            Self::Forex => "forex",
            Self::Index => "index",
        }
    }
}

impl Display for AssetClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetClass {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|class| class.as_str() == normalized)
            .ok_or(ValidationError::InvalidAssetClass { value: normalized })
    }
}

/// Identity of a tradable instrument: symbol, asset class and listing venue.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstrumentId {
    pub symbol: Symbol,
    pub asset_class: AssetClass,
    pub exchange: String,
}

impl InstrumentId {
    pub fn new(
        symbol: &str,
        asset_class: AssetClass,
        exchange: &str,
    ) -> Result<Self, ValidationError> {
        let exchange = exchange.trim().to_ascii_uppercase();
        if exchange.is_empty() {
            return Err(ValidationError::EmptyExchange);
        }

        Ok(Self {
            symbol: Symbol::parse(symbol)?,
            asset_class,
            exchange,
        })
    }
}

impl Display for InstrumentId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.exchange, self.symbol)
    }
}

/// Instrument reference data. Only `active` changes after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrument {
    pub id: InstrumentId,
    pub active: bool,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Instrument {
    pub fn new(id: InstrumentId) -> Self {
        Self {
            id,
            active: true,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn deactivate(&mut self) {
        self.active = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instrument_identity_normalizes_symbol_and_exchange() {
        let id = InstrumentId::new("btc-usd", AssetClass::Crypto, " coinbase ").expect("valid id");
        assert_eq!(id.to_string(), "COINBASE:BTC-USD");
    }

    #[test]
    fn rejects_empty_exchange() {
        let err = InstrumentId::new("AAPL", AssetClass::Equity, "  ").expect_err("must fail");
        assert_eq!(err, ValidationError::EmptyExchange);
    }

    #[test]
    fn parses_asset_class() {
        assert_eq!(AssetClass::from_str("FOREX").expect("parse"), AssetClass::Forex);
        assert!(AssetClass::from_str("bond").is_err());
    }
}
