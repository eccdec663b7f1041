//! Positional field access and value conversion
//!
//! EFD numbers use a decimal comma (`1.234,56`) and dates are `ddmmyyyy`.
//! Malformed values degrade to zero / `None` instead of failing the line.

use chrono::NaiveDate;

/// Convert an EFD decimal. Empty or malformed input yields `0.0`.
pub fn parse_decimal(raw: &str) -> f64 {
    let raw = raw.trim();
    if raw.is_empty() {
        return 0.0;
    }

    let parsed = if raw.contains(',') {
        raw.replace('.', "").replace(',', ".").parse::<f64>()
    } else {
        raw.parse::<f64>()
    };

    parsed.ok().filter(|v| v.is_finite()).unwrap_or(0.0)
}

/// Convert an EFD `ddmmyyyy` date. Anything else yields `None`.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.len() != 8 || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let day: u32 = raw[0..2].parse().ok()?;
    let month: u32 = raw[2..4].parse().ok()?;
    let year: i32 = raw[4..8].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// A line split on `|`. Index 0 is the empty text before the leading pipe,
/// index 1 the record tag, so EFD field N lives at index N + 1 relative to
/// the tag (`REG` is field 01 at index 1).
pub struct Fields<'a> {
    parts: Vec<&'a str>,
}

impl<'a> Fields<'a> {
    pub fn split(line: &'a str) -> Self {
        Self {
            parts: line.split('|').collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn tag(&self) -> &'a str {
        self.text(1)
    }

    /// Trimmed text at `index`, empty when absent
    pub fn text(&self, index: usize) -> &'a str {
        self.parts.get(index).map(|s| s.trim()).unwrap_or("")
    }

    pub fn owned(&self, index: usize) -> String {
        self.text(index).to_string()
    }

    pub fn decimal(&self, index: usize) -> f64 {
        parse_decimal(self.text(index))
    }

    pub fn date(&self, index: usize) -> Option<NaiveDate> {
        parse_date(self.text(index))
    }
}

/// A record line starts with `|`, then a four-character tag, then `|`
pub fn looks_like_record(line: &str) -> bool {
    let bytes = line.as_bytes();
    bytes.len() >= 6 && bytes[0] == b'|' && bytes[5] == b'|'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decimal_with_thousands_separator() {
        assert_eq!(parse_decimal("1.234,56"), 1234.56);
        assert_eq!(parse_decimal("1234,56"), 1234.56);
        assert_eq!(parse_decimal("1.000.000,00"), 1_000_000.0);
    }

    #[test]
    fn test_decimal_empty_or_malformed_is_zero() {
        assert_eq!(parse_decimal(""), 0.0);
        assert_eq!(parse_decimal("   "), 0.0);
        assert_eq!(parse_decimal("abc"), 0.0);
        assert_eq!(parse_decimal("1,2,3"), 0.0);
    }

    #[test]
    fn test_decimal_plain_integer_and_negative() {
        assert_eq!(parse_decimal("42"), 42.0);
        assert_eq!(parse_decimal("-10,5"), -10.5);
    }

    #[test]
    fn test_date_ddmmyyyy() {
        assert_eq!(parse_date("25122024"), NaiveDate::from_ymd_opt(2024, 12, 25));
        assert_eq!(parse_date("01012025"), NaiveDate::from_ymd_opt(2025, 1, 1));
    }

    #[test]
    fn test_date_rejects_wrong_length_and_impossible_days() {
        assert_eq!(parse_date(""), None);
        assert_eq!(parse_date("2512202"), None);
        assert_eq!(parse_date("251220245"), None);
        assert_eq!(parse_date("31022024"), None);
        assert_eq!(parse_date("ab122024"), None);
    }

    #[test]
    fn test_fields_positions() {
        let fields = Fields::split("|C100|0|1|FORN01|55|");
        assert_eq!(fields.tag(), "C100");
        assert_eq!(fields.text(2), "0");
        assert_eq!(fields.text(4), "FORN01");
        assert_eq!(fields.text(40), "");
        assert_eq!(fields.len(), 7);
    }

    #[test]
    fn test_record_shape() {
        assert!(looks_like_record("|0000|017|"));
        assert!(looks_like_record("|9999|"));
        assert!(!looks_like_record(""));
        assert!(!looks_like_record("|99|"));
        assert!(!looks_like_record("C100|0|1|"));
    }
}
