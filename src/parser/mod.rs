//! # Fixed-width order parser
//!
//! Turns a legacy positional text extract into ordered [`User`] aggregates in a single
//! pass. Parsing never fails: every problem is attached to its line as a [`LineIssue`]
//! and the line is either skipped or repaired (missing dates fall back to the
//! processing date).
//!
//! ## Merge rules
//!
//! - Users are keyed by id and keep first-seen order. Their lines need not be contiguous.
//! - Within a user, a line whose date matches an existing order appends its product to
//!   that order; otherwise a new order is created.
//!
//! The accumulator is an [`IndexMap`] owned by one `parse` call, so it is single-writer
//! and not meant to be shared across threads.

pub mod layout;

use crate::model::{Order, OrderId, Product, ProductId, User, UserId};
use chrono::{NaiveDate, Utc};
use indexmap::IndexMap;
use layout::Columns;
use std::fmt::Display;
use tracing::{debug, warn};

/// What went wrong on a single line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssueKind {
    /// The line is shorter than [`layout::MIN_LINE_LEN`]; skipped.
    TooShort { len: usize },
    /// A numeric field could not be read; skipped.
    InvalidNumber { field: &'static str, raw: String },
    /// The date column was missing or invalid; the processing date was used instead.
    DateDefaulted { raw: String },
}

impl IssueKind {
    /// Whether the line still contributed to the output.
    pub fn is_skip(&self) -> bool {
        !matches!(self, IssueKind::DateDefaulted { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineIssue {
    /// 1-based line number in the input.
    pub line: usize,
    pub kind: IssueKind,
}

impl Display for LineIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            IssueKind::TooShort { len } => {
                write!(f, "line {}: too short ({} chars)", self.line, len)
            }
            IssueKind::InvalidNumber { field, raw } => {
                write!(f, "line {}: invalid {} {:?}", self.line, field, raw)
            }
            IssueKind::DateDefaulted { raw } => {
                write!(f, "line {}: invalid date {:?}, using processing date", self.line, raw)
            }
        }
    }
}

/// Result of a parse with every line-level issue kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParseReport {
    pub users: Vec<User>,
    pub issues: Vec<LineIssue>,
}

impl ParseReport {
    pub fn skipped_lines(&self) -> usize {
        self.issues.iter().filter(|i| i.kind.is_skip()).count()
    }
}

/// One successfully decoded line.
struct OrderLine {
    user_id: UserId,
    user_name: String,
    order_id: OrderId,
    product: Product,
    date: NaiveDate,
}

/// Parser for the legacy fixed-width order extract.
#[derive(Debug, Clone, Default)]
pub struct FixedWidthOrderParser {
    processing_date: Option<NaiveDate>,
}

impl FixedWidthOrderParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pins the date used for lines with a missing or invalid date column.
    /// Without it, today's UTC date is used.
    pub fn with_processing_date(date: NaiveDate) -> Self {
        Self {
            processing_date: Some(date),
        }
    }

    /// Parses `content` into aggregates, logging each line issue.
    pub fn parse(&self, content: &str) -> Vec<User> {
        let report = self.parse_with_report(content);
        for issue in &report.issues {
            warn!(line = issue.line, "{}", issue);
        }
        report.users
    }

    /// Parses `content` and returns the aggregates together with the line issues.
    pub fn parse_with_report(&self, content: &str) -> ParseReport {
        let today = self
            .processing_date
            .unwrap_or_else(|| Utc::now().date_naive());
        let mut users: IndexMap<UserId, User> = IndexMap::new();
        let mut issues = Vec::new();

        for (index, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || layout::is_header(line) {
                continue;
            }
            let number = index + 1;
            match decode_line(line, today) {
                Ok((order_line, date_issue)) => {
                    if let Some(kind) = date_issue {
                        issues.push(LineIssue { line: number, kind });
                    }
                    merge(&mut users, order_line);
                }
                Err(kind) => issues.push(LineIssue { line: number, kind }),
            }
        }

        debug!(users = users.len(), issues = issues.len(), "Parsed extract");
        ParseReport {
            users: users.into_values().collect(),
            issues,
        }
    }
}

fn decode_line(line: &str, today: NaiveDate) -> Result<(OrderLine, Option<IssueKind>), IssueKind> {
    let columns = Columns::new(line);
    if columns.len() < layout::MIN_LINE_LEN {
        return Err(IssueKind::TooShort { len: columns.len() });
    }

    let user_id = parse_id(&columns, layout::USER_ID, "user id")?;
    let order_id = parse_id(&columns, layout::ORDER_ID, "order id")?;
    let product_id = parse_id(&columns, layout::PRODUCT_ID, "product id")?;
    let value = parse_amount(&columns.field(layout::AMOUNT))?;

    let raw_date = columns.field(layout::DATE);
    let (date, date_issue) = match parse_date(&raw_date) {
        Some(date) => (date, None),
        None => (today, Some(IssueKind::DateDefaulted { raw: raw_date })),
    };

    let line = OrderLine {
        user_id: UserId(user_id),
        user_name: columns.field(layout::USER_NAME),
        order_id: OrderId(order_id),
        product: Product::new(ProductId(product_id), format!("Product {}", product_id), value),
        date,
    };
    Ok((line, date_issue))
}

fn parse_id(
    columns: &Columns,
    range: std::ops::Range<usize>,
    field: &'static str,
) -> Result<u64, IssueKind> {
    let raw = columns.field(range);
    raw.parse::<u64>()
        .map_err(|_| IssueKind::InvalidNumber { field, raw })
}

/// Strips decimal separators and reads the remaining digits as cents.
/// An empty column is a zero amount.
fn parse_amount(raw: &str) -> Result<i64, IssueKind> {
    let digits: String = raw.chars().filter(|c| *c != '.' && *c != ',').collect();
    if digits.is_empty() {
        return Ok(0);
    }
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(IssueKind::InvalidNumber {
            field: "amount",
            raw: raw.to_string(),
        });
    }
    digits.parse::<i64>().map_err(|_| IssueKind::InvalidNumber {
        field: "amount",
        raw: raw.to_string(),
    })
}

/// `YYYYMMDD` is rewritten to `YYYY-MM-DD` before parsing.
fn parse_date(raw: &str) -> Option<NaiveDate> {
    if raw.len() != 8 || !raw.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let iso = format!("{}-{}-{}", &raw[0..4], &raw[4..6], &raw[6..8]);
    NaiveDate::parse_from_str(&iso, "%Y-%m-%d").ok()
}

fn merge(users: &mut IndexMap<UserId, User>, line: OrderLine) {
    let user = users
        .entry(line.user_id)
        .or_insert_with(|| User::new(line.user_id, line.user_name));

    match user.orders.iter_mut().find(|order| order.date == line.date) {
        Some(order) => order.products.push(line.product),
        None => user
            .orders
            .push(Order::new(line.order_id, line.date, vec![line.product])),
    }
}
