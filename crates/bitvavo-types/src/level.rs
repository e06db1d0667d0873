//! Price level types with decimal precision

use rust_decimal::Decimal;
use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeTuple;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A single price level in the orderbook
///
/// On the wire a level is a two element array of decimal strings,
/// `["price", "size"]`. A size of zero removes the level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Level {
    /// Price of this level
    pub price: Decimal,
    /// Size resting at this price
    pub size: Decimal,
}

impl Level {
    /// Create a new price level
    pub fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }

    /// Check if this level has zero size (should be removed)
    pub fn is_zero(&self) -> bool {
        self.size.is_zero()
    }
}

impl Serialize for Level {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(2)?;
        tuple.serialize_element(&self.price.to_string())?;
        tuple.serialize_element(&self.size.to_string())?;
        tuple.end()
    }
}

impl<'de> Deserialize<'de> for Level {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_seq(LevelVisitor)
    }
}

struct LevelVisitor;

impl<'de> Visitor<'de> for LevelVisitor {
    type Value = Level;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a [price, size] pair")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Level, A::Error> {
        let price: DecimalValue = seq
            .next_element()?
            .ok_or_else(|| de::Error::invalid_length(0, &self))?;
        let size: DecimalValue = seq
            .next_element()?
            .ok_or_else(|| de::Error::invalid_length(1, &self))?;
        // Tolerate trailing fields (some feeds append order counts)
        while seq.next_element::<de::IgnoredAny>()?.is_some() {}
        Ok(Level::new(price.0, size.0))
    }
}

/// Decimal that accepts either a JSON string or a JSON number without going through f64
struct DecimalValue(Decimal);

impl<'de> Deserialize<'de> for DecimalValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum StringOrNumber {
            String(String),
            Number(serde_json::Number),
        }

        let raw = match StringOrNumber::deserialize(deserializer)? {
            StringOrNumber::String(s) => s,
            StringOrNumber::Number(n) => n.to_string(),
        };
        Decimal::from_str(&raw)
            .or_else(|_| Decimal::from_scientific(&raw))
            .map(DecimalValue)
            .map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_level_from_string_pair() {
        let level: Level = serde_json::from_str(r#"["29000.5", "0.01230000"]"#).unwrap();
        assert_eq!(level.price, dec!(29000.5));
        assert_eq!(level.size, dec!(0.0123));
    }

    #[test]
    fn test_level_from_numbers_keeps_precision() {
        let level: Level = serde_json::from_str(r#"[0.1, 5e-6]"#).unwrap();
        assert_eq!(level.price, dec!(0.1));
        assert_eq!(level.size, dec!(0.000005));
    }

    #[test]
    fn test_zero_level() {
        let level: Level = serde_json::from_str(r#"["100", "0"]"#).unwrap();
        assert!(level.is_zero());
    }

    #[test]
    fn test_level_rejects_short_array() {
        assert!(serde_json::from_str::<Level>(r#"["100"]"#).is_err());
    }

    #[test]
    fn test_level_serializes_as_strings() {
        let json = serde_json::to_string(&Level::new(dec!(1.5), dec!(2))).unwrap();
        assert_eq!(json, r#"["1.5","2"]"#);
    }
}
