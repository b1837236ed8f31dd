//! Natural-language date ranges.
//!
//! [`DateRangeResolver`] turns expressions such as `"last week"`,
//! `"Q1 2025"` or `"last 30 days"` into an inclusive [`DateRange`]. Parsing
//! and resolution are separate steps: an expression is first classified into
//! a closed [`DateExpression`] by an ordered rule table, then resolved against
//! "today" with calendar arithmetic. Weeks start on Monday.
//!
//! Rules, in priority order:
//!
//! | Rule | Examples |
//! |------|----------|
//! | canonical phrase | `today`, `yesterday`, `this week`, `last month`, `next quarter`, `this year` |
//! | rolling span | `last 7 days`, `last 2 weeks`, `last months`, `next 14 days` |
//! | quarter | `Q1 2025`, `q3-2024` |
//! | bare year | `2024` |
//! | literal date | `2025-07-28`, `07/28/2025`, `July 28, 2025`, `28 July 2025` |
//!
//! Anything else is an error naming the expression; nothing is guessed.

use std::sync::LazyLock;

use chrono::{Datelike, Days, Local, Months, NaiveDate};
use regex::Regex;
use serde::Serialize;
use tracing::trace;

use crate::error::DateRangeError;

/// Days assumed by `"last days"` / `"next days"` with no count.
pub const DEFAULT_DAY_SPAN: u32 = 30;

/// Machine-readable date format.
pub const ISO_FORMAT: &str = "%Y-%m-%d";
/// Human-readable date format, e.g. `July 28, 2025`.
pub const DISPLAY_FORMAT: &str = "%B %-d, %Y";

const LITERAL_FORMATS: [&str; 7] = [
    "%Y-%m-%d",
    "%m/%d/%Y",
    "%B %d, %Y",
    "%B %d %Y",
    "%b %d, %Y",
    "%d %B %Y",
    "%d %b %Y",
];

// ── Ranges ─────────────────────────────────────────────────────────

/// Inclusive calendar range with `start <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    /// `None` when `end` precedes `start`.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    pub fn single(date: NaiveDate) -> Self {
        Self {
            start: date,
            end: date,
        }
    }

    /// Inclusive day count.
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

/// Resolver output: the range in both renderings plus its length.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedDateRange {
    pub expression: String,
    /// Serialized as `YYYY-MM-DD`.
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub start_display: String,
    pub end_display: String,
    pub days: i64,
}

impl ResolvedDateRange {
    fn new(expression: &str, range: DateRange) -> Self {
        Self {
            expression: expression.to_string(),
            start: range.start,
            end: range.end,
            start_display: range.start.format(DISPLAY_FORMAT).to_string(),
            end_display: range.end.format(DISPLAY_FORMAT).to_string(),
            days: range.days(),
        }
    }

    pub fn range(&self) -> DateRange {
        DateRange {
            start: self.start,
            end: self.end,
        }
    }

    pub fn start_iso(&self) -> String {
        self.start.format(ISO_FORMAT).to_string()
    }

    pub fn end_iso(&self) -> String {
        self.end.format(ISO_FORMAT).to_string()
    }
}

// ── Expressions ────────────────────────────────────────────────────

/// Calendar period addressed by `this`/`last`/`next`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    Week,
    Month,
    Quarter,
    Year,
}

/// Unit of a rolling `last N ...` span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanUnit {
    Days,
    Weeks,
    Months,
}

/// A classified date expression, not yet anchored to a date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateExpression {
    /// Single day relative to today (`yesterday` is -1).
    Day(i64),
    /// Whole calendar period, shifted by `offset` periods from the current one.
    Period { period: Period, offset: i32 },
    /// Rolling span ending today.
    Last { count: u32, unit: SpanUnit },
    /// Rolling span of days starting today.
    Next { days: u32 },
    Quarter { quarter: u32, year: i32 },
    Year(i32),
    Date(NaiveDate),
}

type Rule = fn(&str) -> Result<Option<DateExpression>, ()>;

/// Matchers in priority order. `Err(())` means the rule matched but its
/// numbers are unusable.
const RULES: [(&str, Rule); 5] = [
    ("canonical", canonical),
    ("rolling", rolling),
    ("quarter", quarter),
    ("year", bare_year),
    ("literal", literal),
];

static PERIOD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(this|last|next) (week|month|quarter|year)$").expect("valid period regex")
});
static LAST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^last (?:(\d+) )?(day|week|month)s?$").expect("valid rolling regex")
});
static NEXT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^next (?:(\d+) )?days?$").expect("valid rolling regex"));
static QUARTER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^q([1-4])(?:\s*-\s*|\s+)(\d{4})$").expect("valid quarter regex")
});
static YEAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{4})$").expect("valid year regex"));

fn canonical(expr: &str) -> Result<Option<DateExpression>, ()> {
    let day = match expr {
        "today" => Some(0),
        "yesterday" => Some(-1),
        "tomorrow" => Some(1),
        _ => None,
    };
    if let Some(offset) = day {
        return Ok(Some(DateExpression::Day(offset)));
    }

    let Some(caps) = PERIOD_RE.captures(expr) else {
        return Ok(None);
    };
    let offset = match &caps[1] {
        "last" => -1,
        "next" => 1,
        _ => 0,
    };
    let period = match &caps[2] {
        "week" => Period::Week,
        "month" => Period::Month,
        "quarter" => Period::Quarter,
        _ => Period::Year,
    };
    Ok(Some(DateExpression::Period { period, offset }))
}

fn rolling(expr: &str) -> Result<Option<DateExpression>, ()> {
    if let Some(caps) = LAST_RE.captures(expr) {
        let unit = match &caps[2] {
            "day" => SpanUnit::Days,
            "week" => SpanUnit::Weeks,
            _ => SpanUnit::Months,
        };
        let default = if unit == SpanUnit::Days { DEFAULT_DAY_SPAN } else { 1 };
        let count = span_count(caps.get(1).map(|m| m.as_str()), default)?;
        return Ok(Some(DateExpression::Last { count, unit }));
    }
    if let Some(caps) = NEXT_RE.captures(expr) {
        let days = span_count(caps.get(1).map(|m| m.as_str()), DEFAULT_DAY_SPAN)?;
        return Ok(Some(DateExpression::Next { days }));
    }
    Ok(None)
}

fn span_count(digits: Option<&str>, default: u32) -> Result<u32, ()> {
    match digits {
        None => Ok(default),
        Some(d) => match d.parse::<u32>() {
            Ok(0) | Err(_) => Err(()),
            Ok(n) => Ok(n),
        },
    }
}

fn quarter(expr: &str) -> Result<Option<DateExpression>, ()> {
    let Some(caps) = QUARTER_RE.captures(expr) else {
        return Ok(None);
    };
    let quarter = caps[1].parse().map_err(|_| ())?;
    let year = caps[2].parse().map_err(|_| ())?;
    Ok(Some(DateExpression::Quarter { quarter, year }))
}

fn bare_year(expr: &str) -> Result<Option<DateExpression>, ()> {
    let Some(caps) = YEAR_RE.captures(expr) else {
        return Ok(None);
    };
    let year = caps[1].parse().map_err(|_| ())?;
    Ok(Some(DateExpression::Year(year)))
}

fn literal(expr: &str) -> Result<Option<DateExpression>, ()> {
    Ok(LITERAL_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(expr, fmt).ok())
        .map(DateExpression::Date))
}

/// Trim, lowercase and collapse internal whitespace.
fn normalize(expression: &str) -> String {
    expression
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

impl DateExpression {
    /// Classify `expression`, trying each rule in priority order.
    pub fn parse(expression: &str) -> Result<Self, DateRangeError> {
        let normalized = normalize(expression);
        for (name, rule) in RULES {
            match rule(&normalized) {
                Ok(Some(parsed)) => {
                    trace!("Date expression '{expression}' matched {name} rule");
                    return Ok(parsed);
                }
                Ok(None) => continue,
                Err(()) => return Err(out_of_range(expression)),
            }
        }
        Err(DateRangeError::Unrecognized {
            expression: expression.to_string(),
        })
    }

    /// Anchor the expression at `today`. `None` when the result falls
    /// outside the representable calendar.
    pub fn resolve(&self, today: NaiveDate) -> Option<DateRange> {
        match *self {
            Self::Day(offset) => add_days(today, offset).map(DateRange::single),
            Self::Period { period, offset } => period_range(period, offset, today),
            Self::Last { count, unit } => {
                let start = match unit {
                    SpanUnit::Days => today.checked_sub_days(Days::new(u64::from(count) - 1))?,
                    SpanUnit::Weeks => {
                        today.checked_sub_days(Days::new(u64::from(count) * 7 - 1))?
                    }
                    SpanUnit::Months => today
                        .checked_sub_months(Months::new(count))?
                        .checked_add_days(Days::new(1))?,
                };
                DateRange::new(start, today)
            }
            Self::Next { days } => {
                let end = today.checked_add_days(Days::new(u64::from(days) - 1))?;
                DateRange::new(today, end)
            }
            Self::Quarter { quarter, year } => quarter_range(year, quarter),
            Self::Year(year) => year_range(year),
            Self::Date(date) => Some(DateRange::single(date)),
        }
    }
}

fn out_of_range(expression: &str) -> DateRangeError {
    DateRangeError::OutOfRange {
        expression: expression.to_string(),
    }
}

fn add_days(date: NaiveDate, offset: i64) -> Option<NaiveDate> {
    let days = Days::new(offset.unsigned_abs());
    if offset < 0 {
        date.checked_sub_days(days)
    } else {
        date.checked_add_days(days)
    }
}

fn first_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, 1)
}

fn month_range(first: NaiveDate) -> Option<DateRange> {
    let last = first
        .checked_add_months(Months::new(1))?
        .checked_sub_days(Days::new(1))?;
    DateRange::new(first, last)
}

fn year_range(year: i32) -> Option<DateRange> {
    DateRange::new(
        NaiveDate::from_ymd_opt(year, 1, 1)?,
        NaiveDate::from_ymd_opt(year, 12, 31)?,
    )
}

/// Quarter of the year (1-4) containing `date`.
pub fn quarter_of(date: NaiveDate) -> u32 {
    date.month0() / 3 + 1
}

/// The three calendar months of `quarter` (1-4) in `year`: zero-based months
/// `[(q-1)*3, (q-1)*3+3)`.
pub fn quarter_range(year: i32, quarter: u32) -> Option<DateRange> {
    if !(1..=4).contains(&quarter) {
        return None;
    }
    let first_month0 = (quarter - 1) * 3;
    let start = first_of_month(year, first_month0 + 1)?;
    let last_month = first_of_month(year, first_month0 + 3)?;
    DateRange::new(start, month_range(last_month)?.end)
}

fn period_range(period: Period, offset: i32, today: NaiveDate) -> Option<DateRange> {
    match period {
        Period::Week => {
            let monday = add_days(today, -i64::from(today.weekday().num_days_from_monday()))?;
            let start = add_days(monday, i64::from(offset) * 7)?;
            DateRange::new(start, start.checked_add_days(Days::new(6))?)
        }
        Period::Month => {
            let first = first_of_month(today.year(), today.month())?;
            let months = Months::new(offset.unsigned_abs());
            let shifted = if offset < 0 {
                first.checked_sub_months(months)?
            } else {
                first.checked_add_months(months)?
            };
            month_range(shifted)
        }
        Period::Quarter => {
            // Count quarters from year 0 so shifts roll over year boundaries.
            let index = today.year() * 4 + (quarter_of(today) as i32 - 1) + offset;
            let year = index.div_euclid(4);
            let quarter = index.rem_euclid(4) as u32 + 1;
            quarter_range(year, quarter)
        }
        Period::Year => year_range(today.year().checked_add(offset)?),
    }
}

// ── Resolver ───────────────────────────────────────────────────────

/// Resolves date expressions against the local date, or a pinned one.
#[derive(Debug, Clone, Copy, Default)]
pub struct DateRangeResolver {
    today: Option<NaiveDate>,
}

impl DateRangeResolver {
    /// Resolver anchored to the local calendar date at each call.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolver with a fixed notion of "today".
    pub fn fixed(today: NaiveDate) -> Self {
        Self { today: Some(today) }
    }

    pub fn today(&self) -> NaiveDate {
        self.today.unwrap_or_else(|| Local::now().date_naive())
    }

    pub fn resolve(&self, expression: &str) -> Result<ResolvedDateRange, DateRangeError> {
        let parsed = DateExpression::parse(expression)?;
        let range = parsed
            .resolve(self.today())
            .ok_or_else(|| out_of_range(expression))?;
        Ok(ResolvedDateRange::new(expression, range))
    }
}

/// Resolve `expression` relative to the local date.
pub fn resolve_date_range(expression: &str) -> Result<ResolvedDateRange, DateRangeError> {
    DateRangeResolver::new().resolve(expression)
}

/// Resolve `expression` relative to `today`.
pub fn resolve_date_range_on(
    expression: &str,
    today: NaiveDate,
) -> Result<ResolvedDateRange, DateRangeError> {
    DateRangeResolver::fixed(today).resolve(expression)
}
