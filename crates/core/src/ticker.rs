//! Ticker symbol value object.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Longest symbol we accept (covers FX pairs like `EURUSD=X` and index
/// symbols like `^GSPC` with room to spare).
pub const MAX_TICKER_LEN: usize = 15;

/// A normalized ticker symbol.
///
/// Input is trimmed and upper-cased. Allowed characters are ASCII letters,
/// digits and `.`, `-`, `^`, `=`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ticker(String);

impl Ticker {
    pub fn parse(raw: &str) -> DomainResult<Self> {
        let symbol = raw.trim().to_ascii_uppercase();

        if symbol.is_empty() {
            return Err(DomainError::validation("ticker must not be empty"));
        }
        if symbol.len() > MAX_TICKER_LEN {
            return Err(DomainError::validation(format!(
                "ticker '{symbol}' is longer than {MAX_TICKER_LEN} characters"
            )));
        }
        if let Some(bad) = symbol
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '^' | '=')))
        {
            return Err(DomainError::validation(format!(
                "ticker '{symbol}' contains invalid character '{bad}'"
            )));
        }

        Ok(Self(symbol))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for Ticker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Ticker {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Ticker {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Ticker> for String {
    fn from(value: Ticker) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn normalizes_case_and_whitespace() {
        let t = Ticker::parse("  brk.b ").unwrap();
        assert_eq!(t.as_str(), "BRK.B");
    }

    #[test]
    fn accepts_index_and_fx_symbols() {
        assert!(Ticker::parse("^GSPC").is_ok());
        assert!(Ticker::parse("EURUSD=X").is_ok());
    }

    #[test]
    fn rejects_empty_and_invalid() {
        assert!(matches!(Ticker::parse("   "), Err(DomainError::Validation(_))));
        assert!(matches!(Ticker::parse("AA PL"), Err(DomainError::Validation(_))));
        assert!(matches!(Ticker::parse("A/B"), Err(DomainError::Validation(_))));
        assert!(matches!(
            Ticker::parse("ABCDEFGHIJKLMNOP"),
            Err(DomainError::Validation(_))
        ));
    }

    #[test]
    fn deserialization_validates() {
        let ok: Ticker = serde_json::from_str("\"msft\"").unwrap();
        assert_eq!(ok.as_str(), "MSFT");
        assert!(serde_json::from_str::<Ticker>("\"\"").is_err());
    }

    proptest! {
        /// Parsing is idempotent: a parsed ticker re-parses to itself.
        #[test]
        fn parse_is_idempotent(raw in "[a-zA-Z0-9.^=-]{1,15}") {
            let once = Ticker::parse(&raw).unwrap();
            let twice = Ticker::parse(once.as_str()).unwrap();
            prop_assert_eq!(once, twice);
        }
    }
}
