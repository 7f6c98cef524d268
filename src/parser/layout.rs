//! Column layout of the legacy fixed-width extract.
//!
//! Offsets are 0-indexed, end-exclusive, and counted in characters:
//!
//! ```text
//! id[0,10) name[10,55) orderId[55,65) productId[65,75) amount[75,87) date[87,95)
//! ```

use std::ops::Range;

pub const USER_ID: Range<usize> = 0..10;
pub const USER_NAME: Range<usize> = 10..55;
pub const ORDER_ID: Range<usize> = 55..65;
pub const PRODUCT_ID: Range<usize> = 65..75;
pub const AMOUNT: Range<usize> = 75..87;
pub const DATE: Range<usize> = 87..95;

/// Lines shorter than this cannot carry an order id and are skipped.
pub const MIN_LINE_LEN: usize = 65;

/// Substrings marking header or separator rows.
pub const HEADER_MARKERS: [&str; 2] = ["userId", "|-"];

/// A line already split into characters so ranges never land inside a UTF-8 sequence.
pub struct Columns {
    chars: Vec<char>,
}

impl Columns {
    pub fn new(line: &str) -> Self {
        Self {
            chars: line.chars().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.chars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }

    /// Returns the trimmed text of `range`, clamped to the line length.
    pub fn field(&self, range: Range<usize>) -> String {
        let end = range.end.min(self.chars.len());
        let start = range.start.min(end);
        self.chars[start..end]
            .iter()
            .collect::<String>()
            .trim()
            .to_string()
    }
}

pub fn is_header(line: &str) -> bool {
    HEADER_MARKERS.iter().any(|marker| line.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_is_clamped_to_line_length() {
        let columns = Columns::new("0000000070  Ann");
        assert_eq!(columns.field(USER_ID), "0000000070");
        assert_eq!(columns.field(USER_NAME), "Ann");
        assert_eq!(columns.field(DATE), "");
    }

    #[test]
    fn test_multibyte_names_do_not_split() {
        let line = format!("0000000001{:>45}0000000002", "José Ñúñez");
        let columns = Columns::new(&line);
        assert_eq!(columns.field(USER_NAME), "José Ñúñez");
        assert_eq!(columns.field(ORDER_ID), "0000000002");
    }
}
