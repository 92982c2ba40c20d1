//! Unit Conversion Utilities
//!
//! Amounts are kept as integer base units (satoshis, wei, token minor units).
//! These helpers convert to and from decimal strings for display and for
//! USD valuation.

/// Satoshis per Bitcoin
pub const SATS_PER_BTC: u64 = 100_000_000;

/// Render base units as a decimal string with exactly `decimals` fraction digits
/// e.g. (1_500_000, 8) -> "0.01500000"
pub fn to_decimal_string(amount: u128, decimals: u8) -> String {
    if decimals == 0 {
        return amount.to_string();
    }
    let scale = 10u128.pow(decimals as u32);
    format!(
        "{}.{:0width$}",
        amount / scale,
        amount % scale,
        width = decimals as usize
    )
}

/// Base units as a floating point amount of whole coins (valuation only)
pub fn to_whole_units(amount: u128, decimals: u8) -> f64 {
    amount as f64 / 10f64.powi(decimals as i32)
}

/// Human-readable amount, e.g. "1,000,000 (0.01000000 BTC)"
pub fn to_display(amount: u128, decimals: u8, symbol: &str) -> String {
    format!(
        "{} ({} {})",
        format_with_commas(amount),
        to_decimal_string(amount, decimals),
        symbol
    )
}

/// Parse a decimal amount ("1.5") into base units, rejecting excess precision
pub fn parse_units(s: &str, decimals: u8) -> Option<u128> {
    let s = s.trim().replace(['_', ','], "");
    let (whole, frac) = match s.split_once('.') {
        Some((w, f)) => (w.to_string(), f.to_string()),
        None => (s.clone(), String::new()),
    };
    if whole.is_empty() && frac.is_empty() {
        return None;
    }
    if frac.len() > decimals as usize || !frac.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let whole: u128 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let padded = format!("{:0<width$}", frac, width = decimals as usize);
    let frac: u128 = if padded.is_empty() { 0 } else { padded.parse().ok()? };
    whole
        .checked_mul(10u128.pow(decimals as u32))?
        .checked_add(frac)
}

/// Deserialize a base-unit amount from an integer or a decimal string
///
/// TOML integers are i64 and JSON numbers past u64 lose precision, so large
/// amounts are written as strings.
pub fn de_amount<'de, D>(deserializer: D) -> Result<u128, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct AmountVisitor;

    impl<'de> serde::de::Visitor<'de> for AmountVisitor {
        type Value = u128;

        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.write_str("a non-negative integer or integer string")
        }

        fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<u128, E> {
            Ok(v as u128)
        }

        fn visit_u128<E: serde::de::Error>(self, v: u128) -> Result<u128, E> {
            Ok(v)
        }

        fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<u128, E> {
            u128::try_from(v).map_err(|_| E::custom("amount must be non-negative"))
        }

        fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<u128, E> {
            v.trim().parse().map_err(E::custom)
        }
    }

    deserializer.deserialize_any(AmountVisitor)
}

/// Format number with thousands separators
fn format_with_commas(n: u128) -> String {
    let s = n.to_string();
    let mut result = String::new();
    let chars: Vec<char> = s.chars().collect();

    for (i, c) in chars.iter().enumerate() {
        if i > 0 && (chars.len() - i) % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decimal_string() {
        assert_eq!(to_decimal_string(0, 8), "0.00000000");
        assert_eq!(to_decimal_string(1, 8), "0.00000001");
        assert_eq!(to_decimal_string(SATS_PER_BTC as u128, 8), "1.00000000");
        assert_eq!(to_decimal_string(1_000_000_000_000_000_000, 18), "1.000000000000000000");
        assert_eq!(to_decimal_string(42, 0), "42");
    }

    #[test]
    fn test_display_format() {
        let display = to_display(1_000_000, 8, "BTC");
        assert!(display.contains("1,000,000"));
        assert!(display.contains("0.01000000 BTC"));
    }

    #[test]
    fn test_parse_units() {
        assert_eq!(parse_units("1", 8), Some(100_000_000));
        assert_eq!(parse_units("0.5", 6), Some(500_000));
        assert_eq!(parse_units("1_000.25", 2), Some(100_025));
        assert_eq!(parse_units(".1", 1), Some(1));
        assert_eq!(parse_units("0.123", 2), None);
        assert_eq!(parse_units("abc", 8), None);
    }

    #[test]
    fn test_de_amount_accepts_int_and_string() {
        #[derive(serde::Deserialize)]
        struct Holder {
            #[serde(deserialize_with = "de_amount")]
            amount: u128,
        }

        let h: Holder = serde_json::from_str(r#"{"amount": 42}"#).unwrap();
        assert_eq!(h.amount, 42);
        let h: Holder =
            serde_json::from_str(r#"{"amount": "340282366920938463463374607431768211455"}"#).unwrap();
        assert_eq!(h.amount, u128::MAX);
        let h: Holder = toml::from_str("amount = 10000").unwrap();
        assert_eq!(h.amount, 10_000);
        assert!(serde_json::from_str::<Holder>(r#"{"amount": -1}"#).is_err());
    }

    #[test]
    fn test_whole_units() {
        assert!((to_whole_units(150_000_000, 8) - 1.5).abs() < f64::EPSILON);
    }
}
