//! Pure domain aggregates: a [`User`] owns its [`Order`]s, each order owns its [`Product`]s.
//!
//! Money is always an integer amount of minor currency units (cents). Order totals are
//! derived from the products and never stored.

pub mod order;
pub mod product;
pub mod user;

pub use order::*;
pub use product::*;
pub use user::*;

/// Renders an amount of cents as the shortest decimal string: `183674` -> `"1836.74"`,
/// `150000` -> `"1500"`, `1250` -> `"12.5"`.
pub fn format_cents(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    let (units, fraction) = (abs / 100, abs % 100);
    match fraction {
        0 => format!("{}{}", sign, units),
        f if f % 10 == 0 => format!("{}{}.{}", sign, units, f / 10),
        f => format!("{}{}.{:02}", sign, units, f),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_cents() {
        assert_eq!(format_cents(183674), "1836.74");
        assert_eq!(format_cents(5), "0.05");
        assert_eq!(format_cents(150000), "1500");
        assert_eq!(format_cents(1250), "12.5");
        assert_eq!(format_cents(-1250), "-12.5");
        assert_eq!(format_cents(0), "0");
    }
}
