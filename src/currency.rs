//! ISO-4217 currency metadata

use std::collections::HashMap;

use once_cell::sync::Lazy;

/// Display metadata for a supported currency
#[derive(Debug, Clone, Copy)]
pub struct CurrencyInfo {
    pub code: &'static str,
    pub symbol: &'static str,
    /// Minor-unit exponent (2 for cents, 0 for yen-like currencies)
    pub exponent: u32,
    pub flag: &'static str,
}

static CURRENCY_META: Lazy<HashMap<&'static str, CurrencyInfo>> = Lazy::new(|| {
    let entries = [
        CurrencyInfo { code: "USD", symbol: "$", exponent: 2, flag: "🇺🇸" },
        CurrencyInfo { code: "EUR", symbol: "€", exponent: 2, flag: "🇪🇺" },
        CurrencyInfo { code: "GBP", symbol: "£", exponent: 2, flag: "🇬🇧" },
        CurrencyInfo { code: "JPY", symbol: "¥", exponent: 0, flag: "🇯🇵" },
        CurrencyInfo { code: "CAD", symbol: "$", exponent: 2, flag: "🇨🇦" },
        CurrencyInfo { code: "AUD", symbol: "$", exponent: 2, flag: "🇦🇺" },
        CurrencyInfo { code: "CHF", symbol: "Fr", exponent: 2, flag: "🇨🇭" },
        CurrencyInfo { code: "CNY", symbol: "¥", exponent: 2, flag: "🇨🇳" },
        CurrencyInfo { code: "KRW", symbol: "₩", exponent: 0, flag: "🇰🇷" },
        CurrencyInfo { code: "MXN", symbol: "$", exponent: 2, flag: "🇲🇽" },
        CurrencyInfo { code: "SGD", symbol: "$", exponent: 2, flag: "🇸🇬" },
        CurrencyInfo { code: "HKD", symbol: "$", exponent: 2, flag: "🇭🇰" },
        CurrencyInfo { code: "INR", symbol: "₹", exponent: 2, flag: "🇮🇳" },
        CurrencyInfo { code: "SEK", symbol: "kr", exponent: 2, flag: "🇸🇪" },
        CurrencyInfo { code: "NOK", symbol: "kr", exponent: 2, flag: "🇳🇴" },
    ];
    entries.into_iter().map(|info| (info.code, info)).collect()
});

/// Metadata for a currency code, if supported.
pub fn currency_info(code: &str) -> Option<&'static CurrencyInfo> {
    CURRENCY_META.get(code)
}

/// Whether the code is in the supported set.
pub fn is_supported(code: &str) -> bool {
    CURRENCY_META.contains_key(code)
}

/// Minor-unit exponent for a currency, defaulting to 2.
pub fn currency_exponent(code: &str) -> u32 {
    currency_info(code).map(|info| info.exponent).unwrap_or(2)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("USD", 2 ; "dollar has cents")]
    #[test_case("JPY", 0 ; "yen has no minor unit")]
    #[test_case("KRW", 0 ; "won has no minor unit")]
    #[test_case("XYZ", 2 ; "unknown defaults to two")]
    fn test_currency_exponent(code: &str, expected: u32) {
        assert_eq!(currency_exponent(code), expected);
    }

    #[test]
    fn test_supported_set_membership() {
        assert!(is_supported("EUR"));
        assert!(!is_supported("DOGE"));
        assert!(!is_supported("usd"), "codes are case sensitive");
    }
}
