//! Worklog domain library: a plain-text time-tracking format.
//! The core stays pure: parsing, reconciling and aggregation never touch the
//! filesystem, never log, and hold no state between calls.

pub mod core {
    use chrono::{Datelike, Days, NaiveDate};
    use std::{cmp::Ordering, fmt, str::FromStr};

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum DomainError {
        #[error("invalid date {year:04}-{month:02}-{day:02}")]
        InvalidDate { year: i32, month: u32, day: u32 },
        #[error("invalid time {hour}:{minute:02}")]
        InvalidTime { hour: i64, minute: i64 },
        #[error("duration is out of the representable range")]
        DurationOverflow,
        #[error("range end must not precede its start")]
        InvalidRange,
        #[error("the sign of the duration does not match its value")]
        SignMismatch,
        #[error("invalid summary line {0:?}")]
        InvalidSummary(String),
    }

    /* ------------------------------- Styles ------------------------------- */

    /// Separator used between the date components of a record header.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub enum DateFormat {
        #[default]
        Dashes,
        Slashes,
    }

    impl DateFormat {
        pub fn separator(self) -> char {
            match self {
                Self::Dashes => '-',
                Self::Slashes => '/',
            }
        }
    }

    impl FromStr for DateFormat {
        type Err = String;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            match s.trim() {
                "YYYY-MM-DD" => Ok(Self::Dashes),
                "YYYY/MM/DD" => Ok(Self::Slashes),
                other => Err(format!(
                    "unknown date format {other:?} (expected YYYY-MM-DD or YYYY/MM/DD)"
                )),
            }
        }
    }

    /// Clock convention used when rendering times.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub enum TimeFormat {
        #[default]
        TwentyFourHour,
        TwelveHour,
    }

    impl FromStr for TimeFormat {
        type Err = String;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            match s.trim() {
                "24h" => Ok(Self::TwentyFourHour),
                "12h" => Ok(Self::TwelveHour),
                other => Err(format!(
                    "unknown time convention {other:?} (expected 24h or 12h)"
                )),
            }
        }
    }

    /// Indentation unit of entry lines.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub enum Indentation {
        #[default]
        Tab,
        Spaces(u8),
    }

    impl Indentation {
        /// Recognises a single entry-level indentation unit.
        pub fn from_unit(s: &str) -> Option<Self> {
            match s {
                "\t" => Some(Self::Tab),
                "  " => Some(Self::Spaces(2)),
                "   " => Some(Self::Spaces(3)),
                "    " => Some(Self::Spaces(4)),
                _ => None,
            }
        }

        pub fn as_string(self) -> String {
            match self {
                Self::Tab => "\t".to_string(),
                Self::Spaces(n) => " ".repeat(n as usize),
            }
        }
    }

    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub enum LineEnding {
        #[default]
        Lf,
        CrLf,
    }

    impl LineEnding {
        pub fn as_str(self) -> &'static str {
            match self {
                Self::Lf => "\n",
                Self::CrLf => "\r\n",
            }
        }
    }

    /// Rendering conventions of a file. Never part of a value's identity.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct Style {
        pub date_format: DateFormat,
        pub time_format: TimeFormat,
        pub indentation: Indentation,
        pub line_ending: LineEnding,
    }

    /* --------------------------------- Date --------------------------------- */

    /// A valid Gregorian calendar date.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct Date(NaiveDate);

    impl Date {
        pub fn new(year: i32, month: u32, day: u32) -> Result<Self, DomainError> {
            NaiveDate::from_ymd_opt(year, month, day)
                .map(Self)
                .ok_or(DomainError::InvalidDate { year, month, day })
        }

        pub fn from_naive(date: NaiveDate) -> Self {
            Self(date)
        }

        pub fn year(self) -> i32 {
            self.0.year()
        }

        pub fn month(self) -> u32 {
            self.0.month()
        }

        pub fn day(self) -> u32 {
            self.0.day()
        }

        pub fn naive(self) -> NaiveDate {
            self.0
        }

        /// Shifts the date by `n` days (may be negative).
        pub fn plus_days(self, n: i64) -> Result<Self, DomainError> {
            let shifted = if n >= 0 {
                self.0.checked_add_days(Days::new(n.unsigned_abs()))
            } else {
                self.0.checked_sub_days(Days::new(n.unsigned_abs()))
            };
            shifted.map(Self).ok_or(DomainError::InvalidDate {
                year: self.year(),
                month: self.month(),
                day: self.day(),
            })
        }

        /// Signed number of days from `self` to `other`.
        pub fn days_until(self, other: Date) -> i64 {
            (other.0 - self.0).num_days()
        }

        pub fn render(self, format: DateFormat) -> String {
            let sep = format.separator();
            format!(
                "{:04}{sep}{:02}{sep}{:02}",
                self.year(),
                self.month(),
                self.day()
            )
        }
    }

    impl fmt::Display for Date {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.render(DateFormat::Dashes))
        }
    }

    /* --------------------------------- Time --------------------------------- */

    const MINUTES_PER_DAY: i64 = 24 * 60;

    /// Which calendar day a time belongs to, relative to its record's date.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub enum DayShift {
        Yesterday, // `<23:00`
        #[default]
        Today,
        Tomorrow, // `1:30>`
    }

    impl DayShift {
        fn days(self) -> i64 {
            match self {
                Self::Yesterday => -1,
                Self::Today => 0,
                Self::Tomorrow => 1,
            }
        }
    }

    /// Time of day relative to a record's date.
    ///
    /// Times are ordered by their offset from the record's midnight, so
    /// `<23:00` sorts before `0:00` and `1:30>` sorts after `23:59`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Time {
        hour: u8,
        minute: u8,
        shift: DayShift,
    }

    impl Time {
        pub fn new(hour: u32, minute: u32) -> Result<Self, DomainError> {
            Self::shifted(hour, minute, DayShift::Today)
        }

        /// `24:00` is only valid unshifted, as the end of the record's day.
        pub fn shifted(hour: u32, minute: u32, shift: DayShift) -> Result<Self, DomainError> {
            let valid = minute < 60 && (hour < 24 || (hour == 24 && minute == 0 && shift == DayShift::Today));
            if !valid {
                return Err(DomainError::InvalidTime {
                    hour: i64::from(hour),
                    minute: i64::from(minute),
                });
            }
            Ok(Self {
                hour: hour as u8,
                minute: minute as u8,
                shift,
            })
        }

        /// Builds a time from minutes since the record's midnight; the result
        /// must fall within yesterday, today or tomorrow.
        pub fn from_midnight_offset(mins: i64) -> Result<Self, DomainError> {
            let invalid = || DomainError::InvalidTime {
                hour: mins.div_euclid(60),
                minute: mins.rem_euclid(60),
            };
            if mins == MINUTES_PER_DAY {
                return Self::new(24, 0);
            }
            let shift = match mins.div_euclid(MINUTES_PER_DAY) {
                -1 => DayShift::Yesterday,
                0 => DayShift::Today,
                1 => DayShift::Tomorrow,
                _ => return Err(invalid()),
            };
            let of_day = mins.rem_euclid(MINUTES_PER_DAY);
            Self::shifted((of_day / 60) as u32, (of_day % 60) as u32, shift)
        }

        pub fn hour(self) -> u32 {
            u32::from(self.hour)
        }

        pub fn minute(self) -> u32 {
            u32::from(self.minute)
        }

        pub fn shift(self) -> DayShift {
            self.shift
        }

        /// Minutes since the record's midnight; negative for `<` times,
        /// 1440 and beyond for `>` times.
        pub fn midnight_offset(self) -> i64 {
            self.shift.days() * MINUTES_PER_DAY + i64::from(self.hour) * 60 + i64::from(self.minute)
        }

        pub fn plus(self, d: Duration) -> Result<Self, DomainError> {
            let mins = self
                .midnight_offset()
                .checked_add(d.in_minutes())
                .ok_or(DomainError::DurationOverflow)?;
            Self::from_midnight_offset(mins)
        }

        /// Duration from `self` until `other` (negative if `other` is earlier).
        pub fn until(self, other: Time) -> Duration {
            Duration::from_minutes(other.midnight_offset() - self.midnight_offset())
        }

        pub fn render(self, format: TimeFormat) -> String {
            let mut buf = String::new();
            if self.shift == DayShift::Yesterday {
                buf.push('<');
            }
            match format {
                TimeFormat::TwentyFourHour => {
                    buf.push_str(&format!("{}:{:02}", self.hour, self.minute));
                }
                TimeFormat::TwelveHour => {
                    let (hour, suffix) = match self.hour {
                        0 | 24 => (12, "am"),
                        h @ 1..=11 => (h, "am"),
                        12 => (12, "pm"),
                        h => (h - 12, "pm"),
                    };
                    buf.push_str(&format!("{hour}:{:02}{suffix}", self.minute));
                }
            }
            if self.shift == DayShift::Tomorrow {
                buf.push('>');
            }
            buf
        }
    }

    impl Ord for Time {
        fn cmp(&self, other: &Self) -> Ordering {
            self.midnight_offset().cmp(&other.midnight_offset())
        }
    }

    impl PartialOrd for Time {
        fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
            Some(self.cmp(other))
        }
    }

    impl fmt::Display for Time {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.render(TimeFormat::TwentyFourHour))
        }
    }

    /* ------------------------------- Duration ------------------------------- */

    /// Signed amount of minutes. Zero is meaningful (an empty pause).
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct Duration(i64);

    impl Duration {
        /// Sign of the whole value follows the inputs: `new(-1, -30)` is -90m.
        pub fn new(hours: i64, minutes: i64) -> Result<Self, DomainError> {
            hours
                .checked_mul(60)
                .and_then(|h| h.checked_add(minutes))
                .map(Self)
                .ok_or(DomainError::DurationOverflow)
        }

        pub const fn from_minutes(minutes: i64) -> Self {
            Self(minutes)
        }

        pub fn zero() -> Self {
            Self(0)
        }

        pub fn in_minutes(self) -> i64 {
            self.0
        }

        pub fn is_zero(self) -> bool {
            self.0 == 0
        }

        pub fn is_negative(self) -> bool {
            self.0 < 0
        }

        pub fn plus(self, other: Duration) -> Result<Self, DomainError> {
            self.0
                .checked_add(other.0)
                .map(Self)
                .ok_or(DomainError::DurationOverflow)
        }

        pub fn minus(self, other: Duration) -> Result<Self, DomainError> {
            self.0
                .checked_sub(other.0)
                .map(Self)
                .ok_or(DomainError::DurationOverflow)
        }

        pub fn negate(self) -> Result<Self, DomainError> {
            self.0
                .checked_neg()
                .map(Self)
                .ok_or(DomainError::DurationOverflow)
        }

        pub fn abs(self) -> Self {
            Self(self.0.saturating_abs())
        }

        pub fn saturating_plus(self, other: Duration) -> Self {
            Self(self.0.saturating_add(other.0))
        }

        /// Renders `1h30m`, `45m`, `2h`, `0m` or `-1h5m`.
        fn render_magnitude(self) -> String {
            let abs = self.0.unsigned_abs();
            let (hours, minutes) = (abs / 60, abs % 60);
            match (hours, minutes) {
                (0, m) => format!("{m}m"),
                (h, 0) => format!("{h}h"),
                (h, m) => format!("{h}h{m}m"),
            }
        }

        /// Like `Display`, but positive values carry an explicit `+`.
        pub fn render_signed(self) -> String {
            match self.0.cmp(&0) {
                Ordering::Greater => format!("+{}", self.render_magnitude()),
                _ => self.to_string(),
            }
        }

        pub fn render_with(self, sign: Sign) -> String {
            match sign {
                Sign::Implicit => self.to_string(),
                Sign::Plus => format!("+{}", self.render_magnitude()),
                Sign::Minus => format!("-{}", self.render_magnitude()),
            }
        }
    }

    impl fmt::Display for Duration {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            if self.0 < 0 {
                f.write_str("-")?;
            }
            f.write_str(&self.render_magnitude())
        }
    }

    /// Sign marker as written in the source text.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub enum Sign {
        #[default]
        Implicit,
        Plus,
        Minus,
    }

    /* -------------------------------- Range -------------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum RangeEnd {
        Closed(Time),
        /// In progress (`?` in the source).
        Open,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Range {
        start: Time,
        end: RangeEnd,
    }

    impl Range {
        pub fn closed(start: Time, end: Time) -> Result<Self, DomainError> {
            if end < start {
                return Err(DomainError::InvalidRange);
            }
            Ok(Self {
                start,
                end: RangeEnd::Closed(end),
            })
        }

        pub fn open(start: Time) -> Self {
            Self {
                start,
                end: RangeEnd::Open,
            }
        }

        pub fn start(&self) -> Time {
            self.start
        }

        pub fn end(&self) -> RangeEnd {
            self.end
        }

        pub fn is_open(&self) -> bool {
            matches!(self.end, RangeEnd::Open)
        }

        /// `None` while the range is still open.
        pub fn duration(&self) -> Option<Duration> {
            match self.end {
                RangeEnd::Closed(end) => Some(self.start.until(end)),
                RangeEnd::Open => None,
            }
        }

        pub fn render(&self, format: TimeFormat) -> String {
            let end = match self.end {
                RangeEnd::Closed(t) => t.render(format),
                RangeEnd::Open => "?".to_string(),
            };
            format!("{} - {}", self.start.render(format), end)
        }
    }

    /* ------------------------------- Summaries ------------------------------- */

    /// Free text attached to an entry. The first line may be empty; further
    /// lines are never blank.
    #[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
    pub struct EntrySummary(Vec<String>);

    impl EntrySummary {
        pub fn new<I, S>(lines: I) -> Result<Self, DomainError>
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            let lines: Vec<String> = lines.into_iter().map(Into::into).collect();
            for (idx, line) in lines.iter().enumerate() {
                if line.contains(['\n', '\r']) || (idx > 0 && line.trim().is_empty()) {
                    return Err(DomainError::InvalidSummary(line.clone()));
                }
            }
            if lines.is_empty() {
                return Ok(Self::default());
            }
            Ok(Self(lines))
        }

        pub fn lines(&self) -> &[String] {
            &self.0
        }

        pub fn first_line(&self) -> &str {
            self.0.first().map(String::as_str).unwrap_or("")
        }

        pub fn is_empty(&self) -> bool {
            self.0.iter().all(|l| l.is_empty())
        }

        /// Appends `other`: its first line continues our last line (separated
        /// by a space when both are non-empty), the rest become new lines.
        pub fn merge(&self, other: &EntrySummary) -> EntrySummary {
            let mut lines = self.0.clone();
            let mut incoming = other.0.iter();
            if let Some(first) = incoming.next() {
                match lines.last_mut() {
                    Some(last) if !first.is_empty() => {
                        if !last.is_empty() {
                            last.push(' ');
                        }
                        last.push_str(first);
                    }
                    Some(_) => {}
                    None => lines.push(first.clone()),
                }
            }
            lines.extend(incoming.cloned());
            EntrySummary(lines)
        }
    }

    /// Non-indented lines directly below a record header.
    #[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
    pub struct RecordSummary(Vec<String>);

    impl RecordSummary {
        pub fn new<I, S>(lines: I) -> Result<Self, DomainError>
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            let lines: Vec<String> = lines.into_iter().map(Into::into).collect();
            for line in &lines {
                let bad_start = line.starts_with([' ', '\t']);
                if line.trim().is_empty() || bad_start || line.contains(['\n', '\r']) {
                    return Err(DomainError::InvalidSummary(line.clone()));
                }
            }
            Ok(Self(lines))
        }

        pub fn lines(&self) -> &[String] {
            &self.0
        }

        pub fn is_empty(&self) -> bool {
            self.0.is_empty()
        }
    }

    /* ------------------------------ Should-total ------------------------------ */

    /// Target duration of a record; `closed` is the trailing `!` marker.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct ShouldTotal {
        pub duration: Duration,
        pub closed: bool,
    }

    impl ShouldTotal {
        pub fn new(duration: Duration, closed: bool) -> Self {
            Self { duration, closed }
        }
    }

    impl fmt::Display for ShouldTotal {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.duration)?;
            if self.closed {
                f.write_str("!")?;
            }
            Ok(())
        }
    }

    /* -------------------------------- Entries -------------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum EntryValue {
        Range(Range),
        Duration(Duration, Sign),
    }

    impl EntryValue {
        /// Checks that a written sign agrees with the value.
        pub fn duration(duration: Duration, sign: Sign) -> Result<Self, DomainError> {
            let consistent = match sign {
                Sign::Minus => duration.in_minutes() <= 0,
                Sign::Plus | Sign::Implicit => duration.in_minutes() >= 0,
            };
            if !consistent {
                return Err(DomainError::SignMismatch);
            }
            Ok(Self::Duration(duration, sign))
        }

        pub fn render(&self, format: TimeFormat) -> String {
            match self {
                Self::Range(range) => range.render(format),
                Self::Duration(d, sign) => d.render_with(*sign),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    pub struct Entry {
        pub value: EntryValue,
        pub summary: EntrySummary,
    }

    impl Entry {
        pub fn new(value: EntryValue, summary: EntrySummary) -> Self {
            Self { value, summary }
        }

        /// A zero-minute pause (`-0m`).
        pub fn pause(summary: EntrySummary) -> Self {
            Self::new(EntryValue::Duration(Duration::zero(), Sign::Minus), summary)
        }

        pub fn is_open_range(&self) -> bool {
            matches!(self.value, EntryValue::Range(r) if r.is_open())
        }

        /// Duration entries written with an explicit minus (including `-0m`).
        /// Whether it actually acts as a pause depends on its position.
        pub fn is_pause_like(&self) -> bool {
            matches!(self.value, EntryValue::Duration(_, Sign::Minus))
        }

        /// `None` for an open range.
        pub fn duration(&self) -> Option<Duration> {
            match self.value {
                EntryValue::Range(r) => r.duration(),
                EntryValue::Duration(d, _) => Some(d),
            }
        }
    }

    /* -------------------------------- Records -------------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Record {
        pub date: Date,
        pub should_total: Option<ShouldTotal>,
        pub summary: RecordSummary,
        pub entries: Vec<Entry>,
    }

    impl Record {
        pub fn new(date: Date) -> Self {
            Self {
                date,
                should_total: None,
                summary: RecordSummary::default(),
                entries: vec![],
            }
        }

        pub fn open_ranges(&self) -> impl Iterator<Item = (usize, &Entry)> {
            self.entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.is_open_range())
        }
    }

    /* ------------------------------ Source spans ------------------------------ */

    /// Byte range into the original source text.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct SourceRange {
        pub start: usize,
        pub end: usize,
    }

    impl SourceRange {
        pub fn slice<'a>(&self, source: &'a str) -> &'a str {
            &source[self.start..self.end]
        }

        pub fn len(&self) -> usize {
            self.end - self.start
        }

        pub fn is_empty(&self) -> bool {
            self.start == self.end
        }
    }

    /// Half-open range of line indices (0-based).
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct LineSpan {
        pub start: usize,
        pub end: usize,
    }

    impl LineSpan {
        pub fn new(start: usize, end: usize) -> Self {
            Self { start, end }
        }

        /// Zero-length span, i.e. a pure insertion point before line `at`.
        pub fn empty_at(at: usize) -> Self {
            Self { start: at, end: at }
        }

        pub fn len(&self) -> usize {
            self.end - self.start
        }

        pub fn is_empty(&self) -> bool {
            self.start == self.end
        }
    }

    /// One physical line of the source: content without its line ending,
    /// the ending itself (empty on an unterminated last line) and the byte
    /// length of the leading whitespace.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SourceLine {
        pub content: SourceRange,
        pub ending: SourceRange,
        pub indentation: usize,
    }

    /// Verbatim shadow of a `Record`: where each of its parts lives in the source.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Block {
        /// Header through the last line of the last entry.
        pub lines: LineSpan,
        pub header: usize,
        pub summary: LineSpan,
        /// Indentation of the record's entries, if it has any.
        pub indentation: Option<String>,
        pub entries: Vec<EntryBlock>,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct EntryBlock {
        pub lines: LineSpan,
        pub indentation: String,
        /// Leading whitespace of the first continuation line, if any.
        pub continuation_indentation: Option<String>,
        /// Byte length of the value (range or duration) after the indentation.
        pub value_len: usize,
        /// Clock convention the range was written in; `None` for durations.
        pub time_format: Option<TimeFormat>,
    }

}

pub mod parser {
    //! Line-oriented parser built on `nom`.
    //!
    //! Parsing happens in two passes:
    //! - `tokenize` splits the text into physical lines, classifies each one
    //!   (header, range entry, duration entry, summary text, blank) and votes
    //!   on the file's style conventions.
    //! - `parse_with` groups the classified lines into records, resolves
    //!   indentation depth (entry vs. continuation) and records a `Block` per
    //!   record so that edits can later replace exact line spans.

    use crate::core::*;
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag_no_case, take_while_m_n},
        character::complete::{char, digit1, one_of, space0, space1},
        combinator::{cut, eof, map, opt, recognize},
        error::{VerboseError, VerboseErrorKind, context},
        multi::many1_count,
        sequence::{pair, preceded, separated_pair, terminated, tuple},
    };
    use std::{fmt::Debug, str::FromStr};

    /* ------------------------------- Errors ------------------------------- */

    /// Malformed input. `line` and `column` are 1-based; the column counts
    /// characters, not bytes.
    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    #[error("line {line}, column {column}: {message}")]
    pub struct SyntaxError {
        pub line: usize,
        pub column: usize,
        pub message: String,
    }

    impl SyntaxError {
        fn at(line_idx: usize, content: &str, byte_offset: usize, message: impl Into<String>) -> Self {
            let prefix = content.get(..byte_offset).unwrap_or(content);
            Self {
                line: line_idx + 1,
                column: prefix.chars().count() + 1,
                message: message.into(),
            }
        }
    }

    /// Non-fatal finding, e.g. a record without entries.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Warning {
        pub line: usize,
        pub message: String,
    }

    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct ParseOptions {
        /// Suppresses the warning for records that have no entries.
        pub allow_empty_records: bool,
    }

    /* ------------------------------ nom layer ------------------------------ */

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /// A recoverable mismatch; `alt` may try the next branch.
    fn reject<'a, T>(input: &'a str, ctx: &'static str) -> PResult<'a, T> {
        Err(nom::Err::Error(VerboseError {
            errors: vec![(input, VerboseErrorKind::Context(ctx))],
        }))
    }

    /// The input committed to a construct and turned out invalid.
    fn fail<'a, T>(input: &'a str, ctx: &'static str) -> PResult<'a, T> {
        Err(nom::Err::Failure(VerboseError {
            errors: vec![(input, VerboseErrorKind::Context(ctx))],
        }))
    }

    /// Extracts the innermost context label and the remaining input at the
    /// failure point.
    fn describe<'a>(err: &nom::Err<VerboseError<&'a str>>) -> Option<(&'a str, &'static str)> {
        match err {
            nom::Err::Error(ve) | nom::Err::Failure(ve) => {
                let rest = ve.errors.first().map(|(frag, _)| *frag)?;
                let label = ve.errors.iter().find_map(|(_, kind)| match kind {
                    VerboseErrorKind::Context(ctx) => Some(*ctx),
                    _ => None,
                })?;
                Some((rest, label))
            }
            nom::Err::Incomplete(_) => None,
        }
    }

    fn digits(m: usize, n: usize) -> impl FnMut(&str) -> PResult<'_, &str> {
        move |i: &str| take_while_m_n(m, n, |c: char| c.is_ascii_digit())(i)
    }

    fn number<T: FromStr>(s: &str) -> Option<T> {
        s.parse().ok()
    }

    pub(crate) fn date(i: &str) -> PResult<'_, (Date, DateFormat)> {
        let start = i;
        let (i, (y, sep1, m, sep2, d)) =
            tuple((digits(4, 4), one_of("-/"), digits(2, 2), one_of("-/"), digits(2, 2)))(i)?;
        if sep1 != sep2 {
            return fail(start, "date separators must match");
        }
        let format = if sep1 == '/' {
            DateFormat::Slashes
        } else {
            DateFormat::Dashes
        };
        let parsed = match (number(y), number(m), number(d)) {
            (Some(y), Some(m), Some(d)) => Date::new(y, m, d).ok(),
            _ => None,
        };
        match parsed {
            Some(date) => Ok((i, (date, format))),
            None => fail(start, "invalid date"),
        }
    }

    pub(crate) fn time(i: &str) -> PResult<'_, (Time, TimeFormat)> {
        let start = i;
        let (i, yesterday) = opt(char('<'))(i)?;
        let (i, (with_colon, (h, m))) = alt((
            map(separated_pair(digits(1, 2), char(':'), digits(2, 2)), |hm| (true, hm)),
            map(digits(3, 4), |s: &str| (false, s.split_at(s.len() - 2))),
        ))(i)?;
        let (i, meridiem) = opt(alt((tag_no_case("am"), tag_no_case("pm"))))(i)?;
        let (i, tomorrow) = opt(char('>'))(i)?;

        // Only the colon form is unambiguous enough to commit to.
        let invalid = |input| {
            if with_colon {
                fail(input, "invalid time")
            } else {
                reject(input, "invalid time")
            }
        };
        let (Some(mut hour), Some(minute)) = (number::<u32>(h), number::<u32>(m)) else {
            return invalid(start);
        };
        let format = match meridiem.map(|s| s.to_ascii_lowercase()) {
            Some(suffix) => {
                if !(1..=12).contains(&hour) {
                    return invalid(start);
                }
                hour %= 12;
                if suffix == "pm" {
                    hour += 12;
                }
                TimeFormat::TwelveHour
            }
            None => TimeFormat::TwentyFourHour,
        };
        let shift = match (yesterday, tomorrow) {
            (None, None) => DayShift::Today,
            (Some(_), None) => DayShift::Yesterday,
            (None, Some(_)) => DayShift::Tomorrow,
            (Some(_), Some(_)) => return invalid(start),
        };
        match Time::shifted(hour, minute, shift) {
            Ok(t) => Ok((i, (t, format))),
            Err(_) => invalid(start),
        }
    }

    fn range(i: &str) -> PResult<'_, (Range, TimeFormat)> {
        let (i, (start, start_format)) = time(i)?;
        let (i, _) = tuple((space0, char('-'), space0))(i)?;
        let end_pos = i;
        let (i, end) = cut(context(
            "expected end time or `?`",
            alt((
                map(recognize(many1_count(char('?'))), |_| None),
                map(time, Some),
            )),
        ))(i)?;
        match end {
            None => Ok((i, (Range::open(start), start_format))),
            Some((end, end_format)) => match Range::closed(start, end) {
                Ok(range) => {
                    let format = if start_format == TimeFormat::TwelveHour {
                        start_format
                    } else {
                        end_format
                    };
                    Ok((i, (range, format)))
                }
                Err(_) => fail(end_pos, "range end must not precede its start"),
            },
        }
    }

    pub(crate) fn duration(i: &str) -> PResult<'_, (Duration, Sign)> {
        let (i, sign) = opt(one_of("+-"))(i)?;
        let body = i;
        let (i, (hours, minutes)) = alt((
            pair(
                map(terminated(digit1, char('h')), Some),
                opt(terminated(digit1, char('m'))),
            ),
            map(terminated(digit1, char('m')), |m| (None, Some(m))),
        ))(i)?;
        let hours = match hours.map(number::<i64>) {
            None => 0,
            Some(Some(h)) => h,
            Some(None) => return fail(body, "duration is too large"),
        };
        let minutes = match minutes.map(number::<i64>) {
            None => 0,
            Some(Some(m)) => m,
            Some(None) => return fail(body, "duration is too large"),
        };
        if hours > 0 && minutes >= 60 {
            return fail(body, "minutes must be below 60 when hours are given");
        }
        let Ok(magnitude) = Duration::new(hours, minutes) else {
            return fail(body, "duration is too large");
        };
        let (value, sign) = match sign {
            Some('-') => (Duration::from_minutes(-magnitude.in_minutes()), Sign::Minus),
            Some(_) => (magnitude, Sign::Plus),
            None => (magnitude, Sign::Implicit),
        };
        Ok((i, (value, sign)))
    }

    fn should_total(i: &str) -> PResult<'_, ShouldTotal> {
        let (i, _) = char('(')(i)?;
        let (i, ((d, _), closed)) = cut(context(
            "invalid should-total",
            terminated(pair(duration, opt(char('!'))), char(')')),
        ))(i)?;
        Ok((i, ShouldTotal::new(d, closed.is_some())))
    }

    fn header(i: &str) -> PResult<'_, (Date, DateFormat, Option<ShouldTotal>)> {
        let (i, (date, format)) = cut(context("invalid date", date))(i)?;
        let (i, should) = opt(preceded(space1, should_total))(i)?;
        let (i, _) = space0(i)?;
        let (i, _) = cut(context("unexpected text after record date", eof))(i)?;
        Ok((i, (date, format, should)))
    }

    fn looks_like_date(s: &str) -> bool {
        let b = s.as_bytes();
        b.len() >= 5 && b[..4].iter().all(u8::is_ascii_digit) && matches!(b[4], b'-' | b'/')
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum ParsedValue {
        Range(Range, TimeFormat),
        Duration(Duration, Sign),
    }

    /// Parses the value at the start of an (un-indented) entry text.
    /// Returns the value, its byte length, and the rest of the line.
    fn entry_value(payload: &str) -> Result<(ParsedValue, usize, &str), (usize, String)> {
        let parsed = alt((
            map(range, |(r, f)| ParsedValue::Range(r, f)),
            map(duration, |(d, s)| ParsedValue::Duration(d, s)),
        ))(payload);
        match parsed {
            Ok((rest, value)) => {
                let value_len = payload.len() - rest.len();
                if rest.is_empty() || rest.starts_with([' ', '\t']) {
                    Ok((value, value_len, rest))
                } else {
                    Err((value_len, "expected whitespace after the entry value".to_string()))
                }
            }
            Err(err @ nom::Err::Failure(_)) => {
                let (rest, label) = describe(&err).unwrap_or((payload, "invalid entry"));
                Err((payload.len() - rest.len(), label.to_string()))
            }
            Err(_) => Err((0, "expected time range or duration".to_string())),
        }
    }

    /// Runs `parser` over the whole of `input` (used by `FromStr`).
    fn complete<'a, T>(
        input: &'a str,
        mut parser: impl FnMut(&'a str) -> PResult<'a, T>,
        what: &str,
    ) -> Result<T, SyntaxError> {
        let trimmed = input.trim();
        let offset = input.len() - input.trim_start().len();
        match terminated(&mut parser, eof)(trimmed) {
            Ok((_, value)) => Ok(value),
            Err(err) => {
                let (rest, label) = describe(&err).unwrap_or((trimmed, ""));
                let message = if label.is_empty() {
                    format!("expected {what}")
                } else {
                    label.to_string()
                };
                Err(SyntaxError::at(0, input, offset + trimmed.len() - rest.len(), message))
            }
        }
    }

    /// Parses a standalone date and reports the format it was written in.
    pub fn parse_date(text: &str) -> Result<(Date, DateFormat), SyntaxError> {
        complete(text, date, "a date")
    }

    impl FromStr for Date {
        type Err = SyntaxError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            parse_date(s).map(|(d, _)| d)
        }
    }

    impl FromStr for Time {
        type Err = SyntaxError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            complete(s, time, "a time").map(|(t, _)| t)
        }
    }

    impl FromStr for Duration {
        type Err = SyntaxError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            complete(s, duration, "a duration").map(|(d, _)| d)
        }
    }

    impl FromStr for ShouldTotal {
        type Err = SyntaxError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            complete(
                s,
                map(pair(duration, opt(char('!'))), |((d, _), closed)| {
                    ShouldTotal::new(d, closed.is_some())
                }),
                "a should-total",
            )
        }
    }

    /// Parses a single entry given as plain text, e.g. `1h30m Meeting`.
    /// Further lines become continuation lines of the summary.
    pub fn parse_entry(text: &str) -> Result<Entry, SyntaxError> {
        let mut lines = text.lines();
        let first = lines.next().unwrap_or("").trim();
        let (value, _, rest) =
            entry_value(first).map_err(|(offset, msg)| SyntaxError::at(0, first, offset, msg))?;
        let mut summary = vec![rest.trim().to_string()];
        summary.extend(lines.map(str::trim).filter(|l| !l.is_empty()).map(String::from));
        let summary = EntrySummary::new(summary)
            .map_err(|e| SyntaxError::at(0, first, 0, e.to_string()))?;
        let value = into_entry_value(value).map_err(|e| SyntaxError::at(0, first, 0, e.to_string()))?;
        Ok(Entry::new(value, summary))
    }

    fn into_entry_value(value: ParsedValue) -> Result<EntryValue, DomainError> {
        match value {
            ParsedValue::Range(r, _) => Ok(EntryValue::Range(r)),
            ParsedValue::Duration(d, sign) => EntryValue::duration(d, sign),
        }
    }

    /* ------------------------------ Tokenizer ------------------------------ */

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum LineKind {
        Blank,
        Header {
            date: Date,
            date_format: DateFormat,
            should_total: Option<ShouldTotal>,
        },
        RangeEntry {
            range: Range,
            time_format: TimeFormat,
            value_len: usize,
        },
        DurationEntry {
            duration: Duration,
            sign: Sign,
            value_len: usize,
        },
        /// Free text: a record summary line when un-indented, otherwise a
        /// continuation line (or a malformed entry, decided later).
        Summary,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Line {
        pub number: usize,
        pub source: SourceLine,
        pub kind: LineKind,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Tokens {
        pub lines: Vec<Line>,
        pub style: Style,
    }

    /// Majority vote that remembers first-seen order. Ties go to the default
    /// when it is among the leaders, otherwise to whichever leader was seen first.
    struct Votes<T> {
        counts: Vec<(T, usize)>,
    }

    impl<T: Copy + PartialEq + Debug> Votes<T> {
        fn new() -> Self {
            Self { counts: vec![] }
        }

        fn add(&mut self, value: T) {
            match self.counts.iter_mut().find(|(v, _)| *v == value) {
                Some((_, n)) => *n += 1,
                None => self.counts.push((value, 1)),
            }
        }

        fn winner(&self, default: T) -> T {
            let max = self.counts.iter().map(|(_, n)| *n).max().unwrap_or(0);
            let leaders: Vec<T> = self
                .counts
                .iter()
                .filter(|(_, n)| *n == max)
                .map(|(v, _)| *v)
                .collect();
            if leaders.is_empty() || leaders.contains(&default) {
                default
            } else {
                leaders[0]
            }
        }
    }

    fn split_lines(text: &str) -> Vec<SourceLine> {
        let mut out = Vec::new();
        let mut pos = 0;
        while pos < text.len() {
            let rest = &text[pos..];
            let (content_len, ending_len) = match rest.find('\n') {
                Some(nl) if rest[..nl].ends_with('\r') => (nl - 1, 2),
                Some(nl) => (nl, 1),
                None => (rest.len(), 0),
            };
            let content = SourceRange {
                start: pos,
                end: pos + content_len,
            };
            let ending = SourceRange {
                start: content.end,
                end: content.end + ending_len,
            };
            let indentation = rest[..content_len]
                .bytes()
                .take_while(|b| *b == b' ' || *b == b'\t')
                .count();
            out.push(SourceLine {
                content,
                ending,
                indentation,
            });
            pos = ending.end;
        }
        out
    }

    /// Splits and classifies every line, and detects the file's style.
    pub fn tokenize(text: &str) -> Result<Tokens, SyntaxError> {
        let mut date_votes = Votes::new();
        let mut time_votes = Votes::new();
        let mut indent_votes = Votes::new();
        let mut ending_votes = Votes::new();
        let mut record_has_entry = true;

        let mut lines = Vec::new();
        for (number, source) in split_lines(text).into_iter().enumerate() {
            let content = source.content.slice(text);
            let payload = &content[source.indentation..];
            match source.ending.len() {
                2 => ending_votes.add(LineEnding::CrLf),
                1 => ending_votes.add(LineEnding::Lf),
                _ => {}
            }

            let kind = if payload.is_empty() {
                LineKind::Blank
            } else if source.indentation == 0 {
                if looks_like_date(payload) {
                    let (_, (date, date_format, should_total)) = header(payload).map_err(|err| {
                        let (rest, label) = describe(&err).unwrap_or((payload, "invalid record header"));
                        SyntaxError::at(number, content, content.len() - rest.len(), label)
                    })?;
                    date_votes.add(date_format);
                    record_has_entry = false;
                    LineKind::Header {
                        date,
                        date_format,
                        should_total,
                    }
                } else {
                    LineKind::Summary
                }
            } else {
                match entry_value(payload) {
                    Ok((value, value_len, _)) => {
                        if !record_has_entry {
                            record_has_entry = true;
                            if let Some(unit) = Indentation::from_unit(&content[..source.indentation]) {
                                indent_votes.add(unit);
                            }
                        }
                        match value {
                            ParsedValue::Range(range, time_format) => {
                                time_votes.add(time_format);
                                LineKind::RangeEntry {
                                    range,
                                    time_format,
                                    value_len,
                                }
                            }
                            ParsedValue::Duration(duration, sign) => LineKind::DurationEntry {
                                duration,
                                sign,
                                value_len,
                            },
                        }
                    }
                    Err(_) => LineKind::Summary,
                }
            };
            lines.push(Line {
                number,
                source,
                kind,
            });
        }

        let defaults = Style::default();
        let style = Style {
            date_format: date_votes.winner(defaults.date_format),
            time_format: time_votes.winner(defaults.time_format),
            indentation: indent_votes.winner(defaults.indentation),
            line_ending: ending_votes.winner(defaults.line_ending),
        };
        Ok(Tokens { lines, style })
    }

    /* -------------------------- Structural parser -------------------------- */

    /// A parsed file: the semantic records plus their verbatim blocks, all
    /// referencing the single copy of the source held here.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ParsedFile {
        source: String,
        lines: Vec<SourceLine>,
        records: Vec<Record>,
        blocks: Vec<Block>,
        style: Style,
        warnings: Vec<Warning>,
        options: ParseOptions,
    }

    impl ParsedFile {
        pub fn source(&self) -> &str {
            &self.source
        }

        pub fn lines(&self) -> &[SourceLine] {
            &self.lines
        }

        pub fn records(&self) -> &[Record] {
            &self.records
        }

        pub fn blocks(&self) -> &[Block] {
            &self.blocks
        }

        pub fn style(&self) -> Style {
            self.style
        }

        pub fn warnings(&self) -> &[Warning] {
            &self.warnings
        }

        pub fn options(&self) -> ParseOptions {
            self.options
        }

        /// Content of line `idx` without its line ending.
        pub fn line_text(&self, idx: usize) -> &str {
            self.lines[idx].content.slice(&self.source)
        }

        pub fn line_ending(&self, idx: usize) -> &str {
            self.lines[idx].ending.slice(&self.source)
        }

        /// Byte offset at which line `idx` starts; `idx == lines().len()`
        /// yields the end of the source.
        pub fn line_start(&self, idx: usize) -> usize {
            self.lines
                .get(idx)
                .map_or(self.source.len(), |l| l.content.start)
        }

        pub fn is_blank(&self, idx: usize) -> bool {
            self.line_text(idx).trim().is_empty()
        }

        pub fn into_parts(self) -> (Vec<Record>, Vec<Block>) {
            (self.records, self.blocks)
        }
    }

    struct EntryBuilder {
        value: EntryValue,
        summary: Vec<String>,
        block: EntryBlock,
    }

    struct RecordBuilder {
        date: Date,
        should_total: Option<ShouldTotal>,
        header: usize,
        summary: Vec<String>,
        summary_span: LineSpan,
        indentation: Option<String>,
        entries: Vec<EntryBuilder>,
        end: usize,
    }

    enum Depth {
        Entry,
        Continuation,
        Invalid,
    }

    impl RecordBuilder {
        fn depth(&mut self, indent: &str) -> Depth {
            let Some(unit) = self.indentation.as_deref() else {
                if Indentation::from_unit(indent).is_none() {
                    return Depth::Invalid;
                }
                self.indentation = Some(indent.to_string());
                return Depth::Entry;
            };
            if indent == unit {
                Depth::Entry
            } else if indent.starts_with(&unit.repeat(2)) && !self.entries.is_empty() {
                Depth::Continuation
            } else {
                Depth::Invalid
            }
        }

        fn finish(
            self,
            options: ParseOptions,
            records: &mut Vec<Record>,
            blocks: &mut Vec<Block>,
            warnings: &mut Vec<Warning>,
        ) -> Result<(), DomainError> {
            if self.entries.is_empty() && !options.allow_empty_records {
                warnings.push(Warning {
                    line: self.header + 1,
                    message: format!("record {} has no entries", self.date),
                });
            }
            let mut entries = Vec::with_capacity(self.entries.len());
            let mut entry_blocks = Vec::with_capacity(self.entries.len());
            for e in self.entries {
                entries.push(Entry::new(e.value, EntrySummary::new(e.summary)?));
                entry_blocks.push(e.block);
            }
            records.push(Record {
                date: self.date,
                should_total: self.should_total,
                summary: RecordSummary::new(self.summary)?,
                entries,
            });
            blocks.push(Block {
                lines: LineSpan::new(self.header, self.end),
                header: self.header,
                summary: self.summary_span,
                indentation: self.indentation,
                entries: entry_blocks,
            });
            Ok(())
        }
    }

    pub fn parse(text: &str) -> Result<ParsedFile, SyntaxError> {
        parse_with(text, ParseOptions::default())
    }

    /// Parses `text` into records and blocks. Stops at the first error.
    pub fn parse_with(text: &str, options: ParseOptions) -> Result<ParsedFile, SyntaxError> {
        let Tokens { lines, style } = tokenize(text)?;
        let mut records = Vec::new();
        let mut blocks = Vec::new();
        let mut warnings = Vec::new();
        let mut current: Option<RecordBuilder> = None;

        let mut close = |current: &mut Option<RecordBuilder>, at: usize| -> Result<(), SyntaxError> {
            if let Some(builder) = current.take() {
                let header = builder.header;
                builder
                    .finish(options, &mut records, &mut blocks, &mut warnings)
                    .map_err(|e| SyntaxError {
                        line: header.max(at) + 1,
                        column: 1,
                        message: e.to_string(),
                    })?;
            }
            Ok(())
        };

        for line in &lines {
            let content = line.source.content.slice(text);
            let indent = &content[..line.source.indentation];
            let error = |offset: usize, message: &str| SyntaxError::at(line.number, content, offset, message);

            match &line.kind {
                LineKind::Blank => close(&mut current, line.number)?,
                LineKind::Header {
                    date,
                    should_total,
                    ..
                } => {
                    close(&mut current, line.number)?;
                    current = Some(RecordBuilder {
                        date: *date,
                        should_total: *should_total,
                        header: line.number,
                        summary: vec![],
                        summary_span: LineSpan::empty_at(line.number + 1),
                        indentation: None,
                        entries: vec![],
                        end: line.number + 1,
                    });
                }
                LineKind::Summary if indent.is_empty() => {
                    let Some(record) = current.as_mut() else {
                        return Err(error(0, "expected a record date"));
                    };
                    if !record.entries.is_empty() {
                        return Err(error(
                            0,
                            "unexpected text after entries (missing indentation or blank line?)",
                        ));
                    }
                    record.summary.push(content.to_string());
                    record.summary_span.end = line.number + 1;
                    record.end = line.number + 1;
                }
                kind => {
                    let Some(record) = current.as_mut() else {
                        return Err(error(0, "unexpected indentation outside of a record"));
                    };
                    match record.depth(indent) {
                        Depth::Invalid => return Err(error(0, "unexpected indentation")),
                        Depth::Continuation => {
                            if let Some(entry) = record.entries.last_mut() {
                                let text = content.trim();
                                entry.summary.push(text.to_string());
                                if entry.block.continuation_indentation.is_none() {
                                    entry.block.continuation_indentation = Some(indent.to_string());
                                }
                                entry.block.lines.end = line.number + 1;
                            }
                        }
                        Depth::Entry => {
                            let (value, value_len, time_format) = match kind {
                                LineKind::RangeEntry {
                                    range,
                                    time_format,
                                    value_len,
                                } => (EntryValue::Range(*range), *value_len, Some(*time_format)),
                                LineKind::DurationEntry {
                                    duration,
                                    sign,
                                    value_len,
                                } => {
                                    let value = EntryValue::duration(*duration, *sign)
                                        .map_err(|e| error(indent.len(), &e.to_string()))?;
                                    (value, *value_len, None)
                                }
                                _ => {
                                    let (offset, message) = entry_value(&content[indent.len()..])
                                        .err()
                                        .unwrap_or((0, "expected time range or duration".to_string()));
                                    return Err(error(indent.len() + offset, &message));
                                }
                            };
                            let summary = content[indent.len() + value_len..].trim().to_string();
                            record.entries.push(EntryBuilder {
                                value,
                                summary: vec![summary],
                                block: EntryBlock {
                                    lines: LineSpan::new(line.number, line.number + 1),
                                    indentation: indent.to_string(),
                                    continuation_indentation: None,
                                    value_len,
                                    time_format,
                                },
                            });
                        }
                    }
                    record.end = line.number + 1;
                }
            }
        }
        close(&mut current, lines.len())?;
        drop(close);

        Ok(ParsedFile {
            source: text.to_string(),
            lines: lines.into_iter().map(|l| l.source).collect(),
            records,
            blocks,
            style,
            warnings,
            options,
        })
    }

}

pub mod format {
    //! Text rendering. Untouched text is always taken verbatim from the
    //! source; rendering only happens for lines an edit produces.

    use crate::{core::*, parser::ParsedFile};

    /// Reassembles the file from its source spans.
    pub fn serialise(file: &ParsedFile) -> String {
        let source = file.source();
        let mut out = String::with_capacity(source.len());
        for line in file.lines() {
            out.push_str(line.content.slice(source));
            out.push_str(line.ending.slice(source));
        }
        out
    }

    pub fn render_header(date: Date, should_total: Option<ShouldTotal>, format: DateFormat) -> String {
        let mut out = date.render(format);
        if let Some(st) = should_total {
            out.push_str(&format!(" ({st})"));
        }
        out
    }

    /// Lines of an entry, without line endings.
    pub fn render_entry(entry: &Entry, format: TimeFormat, indent: &str, continuation: &str) -> Vec<String> {
        render_entry_text(&entry.value.render(format), &entry.summary, indent, continuation)
    }

    /// Like `render_entry`, for a value that is already rendered.
    pub fn render_entry_text(
        value: &str,
        summary: &EntrySummary,
        indent: &str,
        continuation: &str,
    ) -> Vec<String> {
        let mut lines = summary.lines().iter();
        let mut first = format!("{indent}{value}");
        if let Some(text) = lines.next().filter(|t| !t.is_empty()) {
            first.push(' ');
            first.push_str(text);
        }
        let mut out = vec![first];
        out.extend(lines.map(|l| format!("{continuation}{l}")));
        out
    }

    /// Renders a whole record in `style`, e.g. for a record that does not
    /// exist in the source yet.
    pub fn render_record(record: &Record, style: Style) -> Vec<String> {
        let indent = style.indentation.as_string();
        let continuation = indent.repeat(2);
        let mut out = vec![render_header(record.date, record.should_total, style.date_format)];
        out.extend(record.summary.lines().iter().cloned());
        for entry in &record.entries {
            out.extend(render_entry(entry, style.time_format, &indent, &continuation));
        }
        out
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::parser::{parse, parse_entry};

        #[test]
        fn serialise_is_verbatim() {
            let inputs = [
                "",
                "\n\n",
                "2020-01-01\n\t1h\n",
                "2020/01/01 (8h!)\r\nSummary\r\n    9:00am-10:00am  spaced   out  \r\n        more\r\n\r\n\r\n2020/01/02\r\n    -0m",
                "\n2010-04-27\n    3:00pm - ?\n",
            ];
            for input in inputs {
                assert_eq!(serialise(&parse(input).unwrap()), input);
            }
        }

        #[test]
        fn header_rendering() {
            let date = Date::new(2000, 1, 1).unwrap();
            assert_eq!(render_header(date, None, DateFormat::Slashes), "2000/01/01");
            let st = ShouldTotal::new(Duration::from_minutes(450), true);
            assert_eq!(render_header(date, Some(st), DateFormat::Dashes), "2000-01-01 (7h30m!)");
        }

        #[test]
        fn entry_rendering() {
            let entry = parse_entry("-0m Lunch\nbreak").unwrap();
            assert_eq!(
                render_entry(&entry, TimeFormat::TwentyFourHour, "    ", "        "),
                ["    -0m Lunch", "        break"]
            );

            let entry = parse_entry("15:00 - ?").unwrap();
            assert_eq!(render_entry(&entry, TimeFormat::TwelveHour, "\t", "\t\t"), ["\t3:00pm - ?"]);

            let summary = EntrySummary::new(["", "next line"]).unwrap();
            assert_eq!(render_entry_text("-2h", &summary, "  ", "    "), ["  -2h", "    next line"]);
        }

        #[test]
        fn rendered_record_parses_back() {
            let mut record = Record::new(Date::new(2000, 1, 1).unwrap());
            record.entries.push(parse_entry("8:00 - 9:30 Standup\nand planning").unwrap());
            record.entries.push(parse_entry("+1h").unwrap());
            let style = Style {
                date_format: DateFormat::Slashes,
                indentation: Indentation::Spaces(2),
                ..Style::default()
            };
            let text = render_record(&record, style).join("\n");
            assert_eq!(text, "2000/01/01\n  8:00 - 9:30 Standup\n    and planning\n  +1h");
            assert_eq!(parse(&text).unwrap().records(), [record]);
        }
    }
}

pub mod reconciling {
    //! Targeted edits on a parsed file.
    //!
    //! A `Reconciler` is bound to one record (existing, or to be created) and
    //! applies exactly one edit. Only the lines an edit touches are produced
    //! anew; everything else is copied from the source byte for byte. The
    //! result is parsed again before it is handed out, so a successful edit
    //! always yields valid text.

    use crate::{
        core::*,
        format,
        parser::{self, ParsedFile},
    };

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum ReconcileError {
        #[error("no open time range")]
        NoOpenRange,
        #[error("more than one open time range")]
        MultipleOpenRanges,
        #[error("invalid edit: {0}")]
        InvalidEdit(String),
        #[error(transparent)]
        Domain(#[from] DomainError),
    }

    /// Outcome of a successful edit.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Reconciled {
        /// The whole text with the edit applied.
        pub all_serialised: String,
        /// The inserted or rewritten text, line endings included.
        pub changed: String,
        /// Lines of the original text that `changed` replaces; empty for
        /// pure insertions.
        pub replaced_lines: LineSpan,
        /// `all_serialised`, parsed.
        pub file: ParsedFile,
        /// Position of the edited record in `file.records()`.
        pub record_index: usize,
    }

    impl Reconciled {
        pub fn record(&self) -> Option<&Record> {
            self.file.records().get(self.record_index)
        }
    }

    /// Strategy for locating the record an edit applies to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Creator {
        /// The last record with this date.
        AtRecord(Date),
        /// A record that does not exist yet.
        NewRecord {
            date: Date,
            should_total: Option<ShouldTotal>,
        },
    }

    impl Creator {
        pub fn bind<'a>(&self, file: &'a ParsedFile) -> Option<Reconciler<'a>> {
            match *self {
                Self::AtRecord(date) => Reconciler::at_record(file, date),
                Self::NewRecord { date, should_total } => {
                    Some(Reconciler::new_record(file, date, should_total))
                }
            }
        }
    }

    /// The reconciler of the first creator that binds, if any.
    pub fn first_match<'a>(file: &'a ParsedFile, creators: &[Creator]) -> Option<Reconciler<'a>> {
        creators.iter().find_map(|c| c.bind(file))
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Target {
        Existing(usize),
        /// Inserted in front of record `before` (or at the end).
        New {
            date: Date,
            should_total: Option<ShouldTotal>,
            before: usize,
        },
    }

    /// `lines` (without line endings) replace the original lines in `span`.
    struct Edit {
        span: LineSpan,
        lines: Vec<String>,
    }

    #[derive(Debug, Clone)]
    pub struct Reconciler<'a> {
        file: &'a ParsedFile,
        target: Target,
        style: Style,
    }

    impl<'a> Reconciler<'a> {
        /// Binds to the last record dated `date`; habitual logging appends
        /// at the end, so that is the most recent one.
        pub fn at_record(file: &'a ParsedFile, date: Date) -> Option<Self> {
            let idx = file.records().iter().rposition(|r| r.date == date)?;
            Some(Self {
                file,
                target: Target::Existing(idx),
                style: file.style(),
            })
        }

        /// Binds to a record that will be inserted before the first record
        /// not dated earlier than `date`, or at the end of the file.
        pub fn new_record(file: &'a ParsedFile, date: Date, should_total: Option<ShouldTotal>) -> Self {
            let records = file.records();
            let before = records
                .iter()
                .position(|r| r.date >= date)
                .unwrap_or(records.len());
            Self {
                file,
                target: Target::New {
                    date,
                    should_total,
                    before,
                },
                style: file.style(),
            }
        }

        /// Overrides the conventions used for newly rendered text.
        pub fn with_style(mut self, style: Style) -> Self {
            self.style = style;
            self
        }

        pub fn style(&self) -> Style {
            self.style
        }

        pub fn date(&self) -> Date {
            match self.target {
                Target::Existing(idx) => self.file.records()[idx].date,
                Target::New { date, .. } => date,
            }
        }

        /// The bound record; `None` if it is yet to be created.
        pub fn record(&self) -> Option<&'a Record> {
            match self.target {
                Target::Existing(idx) => self.file.records().get(idx),
                Target::New { .. } => None,
            }
        }

        pub fn is_new(&self) -> bool {
            matches!(self.target, Target::New { .. })
        }

        /* ------------------------------ edits ------------------------------ */

        /// Appends `entry` as the last entry of the record.
        pub fn append_entry(&self, entry: &Entry) -> Result<Reconciled, ReconcileError> {
            let has_open = self
                .record()
                .is_some_and(|r| r.open_ranges().next().is_some());
            if entry.is_open_range() && has_open {
                return Err(ReconcileError::MultipleOpenRanges);
            }
            match self.target {
                Target::Existing(idx) => {
                    let block = &self.file.blocks()[idx];
                    let (indent, continuation) = self.indentation(block);
                    let lines = format::render_entry(entry, self.style.time_format, &indent, &continuation);
                    self.apply(Edit {
                        span: LineSpan::empty_at(block.lines.end),
                        lines,
                    })
                }
                Target::New { .. } => self.create(vec![entry.clone()]),
            }
        }

        /// Materialises a new record without entries; an existing record is
        /// left as it is.
        pub fn ensure_record(&self) -> Result<Reconciled, ReconcileError> {
            match self.target {
                Target::Existing(idx) => Ok(self.unchanged(idx)),
                Target::New { .. } => self.create(vec![]),
            }
        }

        pub fn start_open_range(&self, start: Time, summary: &EntrySummary) -> Result<Reconciled, ReconcileError> {
            let entry = Entry::new(EntryValue::Range(Range::open(start)), summary.clone());
            self.append_entry(&entry)
        }

        /// Replaces the `?` placeholder of the open range with `end`; the rest
        /// of the line is kept. A non-empty `summary` is merged into the
        /// entry's summary.
        pub fn close_open_range(&self, end: Time, summary: &EntrySummary) -> Result<Reconciled, ReconcileError> {
            let (idx, open) = self.open_range()?;
            let entry = &self.file.records()[idx].entries[open];
            let EntryValue::Range(range) = entry.value else {
                return Err(ReconcileError::NoOpenRange);
            };
            Range::closed(range.start(), end)?;

            let block = &self.file.blocks()[idx];
            let eb = &block.entries[open];
            let value = self.value_text(eb);
            let keep = value.find('?').unwrap_or(value.len());
            let format = eb.time_format.unwrap_or(self.style.time_format);
            let new_value = format!("{}{}", &value[..keep], end.render(format));
            self.rewrite_entry(block, eb, &new_value, summary)
        }

        /// Adds a zero pause (`-0m`) below the open range, after any pauses
        /// already following it.
        pub fn append_pause(&self, summary: &EntrySummary) -> Result<Reconciled, ReconcileError> {
            let (idx, open) = self.open_range()?;
            let record = &self.file.records()[idx];
            let block = &self.file.blocks()[idx];
            let last = pause_run_end(record, open) - 1;
            let (indent, continuation) = self.indentation(block);
            let lines = format::render_entry(
                &Entry::pause(summary.clone()),
                self.style.time_format,
                &indent,
                &continuation,
            );
            self.apply(Edit {
                span: LineSpan::empty_at(block.entries[last].lines.end),
                lines,
            })
        }

        /// Grows the last pause below the open range by `|delta|`; creates the
        /// pause if there is none yet. `delta` must be negative; zero is a
        /// no-op.
        pub fn extend_pause(&self, delta: Duration, summary: &EntrySummary) -> Result<Reconciled, ReconcileError> {
            let (idx, open) = self.open_range()?;
            if delta.is_zero() {
                return Ok(self.unchanged(idx));
            }
            if !delta.is_negative() {
                return Err(ReconcileError::InvalidEdit(format!(
                    "a pause can only grow; {} is not negative",
                    delta.render_signed()
                )));
            }
            let record = &self.file.records()[idx];
            let block = &self.file.blocks()[idx];
            let end = pause_run_end(record, open);

            if end == open + 1 {
                let next_is_duration = record
                    .entries
                    .get(end)
                    .is_some_and(|e| matches!(e.value, EntryValue::Duration(..)));
                if next_is_duration {
                    return Err(ReconcileError::InvalidEdit(
                        "the entry after the open range is not a pause".to_string(),
                    ));
                }
                let pause = Entry::new(EntryValue::duration(delta, Sign::Minus)?, summary.clone());
                let (indent, continuation) = self.indentation(block);
                let lines = format::render_entry(&pause, self.style.time_format, &indent, &continuation);
                return self.apply(Edit {
                    span: LineSpan::empty_at(block.entries[open].lines.end),
                    lines,
                });
            }

            let last = end - 1;
            let pause = &record.entries[last];
            let current = pause.duration().unwrap_or_default();
            let extended = current.plus(delta)?;
            self.rewrite_entry(
                block,
                &block.entries[last],
                &extended.render_with(Sign::Minus),
                summary,
            )
        }

        /* ----------------------------- helpers ----------------------------- */

        /// Index of the single open range in the bound record.
        fn open_range(&self) -> Result<(usize, usize), ReconcileError> {
            let Target::Existing(idx) = self.target else {
                return Err(ReconcileError::NoOpenRange);
            };
            let mut open = self.file.records()[idx].open_ranges().map(|(i, _)| i);
            match (open.next(), open.next()) {
                (None, _) => Err(ReconcileError::NoOpenRange),
                (Some(i), None) => Ok((idx, i)),
                (Some(_), Some(_)) => Err(ReconcileError::MultipleOpenRanges),
            }
        }

        fn indentation(&self, block: &Block) -> (String, String) {
            let indent = block
                .indentation
                .clone()
                .unwrap_or_else(|| self.style.indentation.as_string());
            let continuation = block
                .entries
                .iter()
                .find_map(|e| e.continuation_indentation.clone())
                .unwrap_or_else(|| indent.repeat(2));
            (indent, continuation)
        }

        fn value_text(&self, eb: &EntryBlock) -> &'a str {
            let line = self.file.line_text(eb.lines.start);
            let start = eb.indentation.len();
            &line[start..start + eb.value_len]
        }

        /// Swaps the value of an existing entry. With an empty `summary` only
        /// the value is replaced in the first line; otherwise the merged
        /// summary is rendered along with it.
        fn rewrite_entry(
            &self,
            block: &Block,
            eb: &EntryBlock,
            new_value: &str,
            summary: &EntrySummary,
        ) -> Result<Reconciled, ReconcileError> {
            let line = self.file.line_text(eb.lines.start);
            let value_start = eb.indentation.len();
            let rewritten = format!(
                "{}{}{}",
                &line[..value_start],
                new_value,
                &line[value_start + eb.value_len..]
            );
            if summary.is_empty() {
                return self.apply(Edit {
                    span: LineSpan::new(eb.lines.start, eb.lines.start + 1),
                    lines: vec![rewritten],
                });
            }

            // The written lines stay as they are; the summary is appended to
            // the last one, in front of its trailing whitespace.
            let mut lines = vec![rewritten];
            lines.extend((eb.lines.start + 1..eb.lines.end).map(|i| self.file.line_text(i).to_string()));
            let mut incoming = summary.lines().iter();
            if let Some(text) = incoming.next().filter(|t| !t.is_empty()) {
                if let Some(last) = lines.last_mut() {
                    let end = last.trim_end().len();
                    last.insert_str(end, &format!(" {text}"));
                }
            }
            let continuation = match &eb.continuation_indentation {
                Some(c) => c.clone(),
                None => self.indentation(block).1,
            };
            lines.extend(incoming.map(|l| format!("{continuation}{l}")));
            self.apply(Edit { span: eb.lines, lines })
        }

        /// Inserts the pending new record, keeping one blank line at each seam.
        fn create(&self, entries: Vec<Entry>) -> Result<Reconciled, ReconcileError> {
            let Target::New {
                date,
                should_total,
                before,
            } = self.target
            else {
                return Err(ReconcileError::InvalidEdit(format!("record {} already exists", self.date())));
            };
            let mut record = Record::new(date);
            record.should_total = should_total;
            record.entries = entries;

            let mut lines = format::render_record(&record, self.style);
            let blocks = self.file.blocks();
            let at = blocks
                .get(before)
                .map_or(self.file.lines().len(), |b| b.lines.start);
            if at > 0 && !self.file.is_blank(at - 1) {
                lines.insert(0, String::new());
            }
            if before < blocks.len() {
                lines.push(String::new());
            }
            self.apply(Edit {
                span: LineSpan::empty_at(at),
                lines,
            })
        }

        fn unchanged(&self, idx: usize) -> Reconciled {
            Reconciled {
                all_serialised: format::serialise(self.file),
                changed: String::new(),
                replaced_lines: LineSpan::empty_at(self.file.blocks()[idx].lines.end),
                file: self.file.clone(),
                record_index: idx,
            }
        }

        fn apply(&self, edit: Edit) -> Result<Reconciled, ReconcileError> {
            let file = self.file;
            let source = file.source();
            let eol = self.style.line_ending.as_str();
            let n = file.lines().len();
            // An unterminated last line stays unterminated after the edit.
            let keep_unterminated = n > 0 && edit.span.end == n && file.line_ending(n - 1).is_empty();

            let mut changed = String::new();
            for (i, line) in edit.lines.iter().enumerate() {
                changed.push_str(line);
                if !(keep_unterminated && i + 1 == edit.lines.len()) {
                    changed.push_str(eol);
                }
            }

            let mut out = String::with_capacity(source.len() + changed.len() + eol.len());
            out.push_str(&source[..file.line_start(edit.span.start)]);
            if keep_unterminated && edit.span.is_empty() {
                out.push_str(eol);
            }
            out.push_str(&changed);
            out.push_str(&source[file.line_start(edit.span.end)..]);

            let reparsed = parser::parse_with(&out, file.options()).map_err(|e| {
                ReconcileError::InvalidEdit(format!("the result would not be valid ({e})"))
            })?;
            let record_index = match self.target {
                Target::Existing(idx) => idx,
                Target::New { before, .. } => before,
            };
            Ok(Reconciled {
                all_serialised: out,
                changed,
                replaced_lines: edit.span,
                file: reparsed,
                record_index,
            })
        }
    }

    /// End (exclusive) of the run of pause-like entries following `open`.
    fn pause_run_end(record: &Record, open: usize) -> usize {
        let mut end = open + 1;
        while record.entries.get(end).is_some_and(Entry::is_pause_like) {
            end += 1;
        }
        end
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::parser::{parse, parse_entry};

        fn date(y: i32, m: u32, d: u32) -> Date {
            Date::new(y, m, d).unwrap()
        }

        fn summary(lines: &[&str]) -> EntrySummary {
            EntrySummary::new(lines.iter().copied()).unwrap()
        }

        fn at_record<T>(text: &str, d: Date, edit: impl FnOnce(&Reconciler) -> T) -> T {
            let file = parse(text).unwrap();
            let reconciler = Reconciler::at_record(&file, d).unwrap();
            edit(&reconciler)
        }

        fn april_27() -> Date {
            date(2010, 4, 27)
        }

        /* ------------------------------ pauses ------------------------------ */

        #[test]
        fn appending_pause_adds_new_entry() {
            let original = r#"
2010-04-27
    3:00pm - ?
"#;
            let result = at_record(original, april_27(), |r| r.append_pause(&EntrySummary::default())).unwrap();
            assert_eq!(
                result.all_serialised,
                r#"
2010-04-27
    3:00pm - ?
    -0m
"#
            );
            assert_eq!(result.changed, "    -0m\n");
            assert_eq!(result.replaced_lines, LineSpan::empty_at(3));
        }

        #[test]
        fn appending_pause_with_summary() {
            let original = "\n2010-04-27\n    3:00pm - ?\n";
            let result = at_record(original, april_27(), |r| r.append_pause(&summary(&["Lunch break"]))).unwrap();
            assert_eq!(result.all_serialised, "\n2010-04-27\n    3:00pm - ?\n    -0m Lunch break\n");
        }

        #[test]
        fn appending_pause_with_multiline_summary() {
            let original = "\n2010-04-27\n    3:00pm - ?\n";
            let result = at_record(original, april_27(), |r| r.append_pause(&summary(&["Lunch", "break"]))).unwrap();
            assert_eq!(
                result.all_serialised,
                "\n2010-04-27\n    3:00pm - ?\n    -0m Lunch\n        break\n"
            );
        }

        #[test]
        fn appending_pause_with_utf8_summary() {
            let original = "\n2010-04-27\n你好！你好吗？\n\t8:00 - ? 去工作\n";
            let result = at_record(original, april_27(), |r| r.append_pause(&summary(&["午休"]))).unwrap();
            assert_eq!(
                result.all_serialised,
                "\n2010-04-27\n你好！你好吗？\n\t8:00 - ? 去工作\n\t-0m 午休\n"
            );
        }

        #[test]
        fn appending_pause_goes_after_existing_pauses() {
            let original = "2010-04-27\n\t8:00 - ?\n\t-30m\n\t9:00 - 10:00\n";
            let result = at_record(original, april_27(), |r| r.append_pause(&EntrySummary::default())).unwrap();
            assert_eq!(
                result.all_serialised,
                "2010-04-27\n\t8:00 - ?\n\t-30m\n\t-0m\n\t9:00 - 10:00\n"
            );
        }

        #[test]
        fn appending_pause_fails_without_open_range() {
            let original = "\n2010-04-27\n    3:00 - 4:00\n";
            let result = at_record(original, april_27(), |r| r.append_pause(&EntrySummary::default()));
            assert_eq!(result, Err(ReconcileError::NoOpenRange));
        }

        #[test]
        fn appending_pause_fails_with_two_open_ranges() {
            let original = "2010-04-27\n\t8:00 - ?\n\t9:00 - ?\n";
            let result = at_record(original, april_27(), |r| r.append_pause(&EntrySummary::default()));
            assert_eq!(result, Err(ReconcileError::MultipleOpenRanges));
        }

        #[test]
        fn extending_pause_extends_pause() {
            let original = r#"
2010-04-27
Foo
    3:00 - ? I desperately need
        a break!
    -30m
"#;
            let result = at_record(original, april_27(), |r| {
                r.extend_pause(Duration::from_minutes(-3), &EntrySummary::default())
            })
            .unwrap();
            assert_eq!(
                result.all_serialised,
                r#"
2010-04-27
Foo
    3:00 - ? I desperately need
        a break!
    -33m
"#
            );
            assert_eq!(result.replaced_lines, LineSpan::new(5, 6));
            assert_eq!(result.changed, "    -33m\n");
        }

        #[test]
        fn extending_pause_with_summary() {
            let original = r#"
2010-04-27
Foo
    3:00 - ? I desperately need
        a break!
    -1m Lunch break
"#;
            let result = at_record(original, april_27(), |r| {
                r.extend_pause(Duration::from_minutes(-3), &summary(&["and more break"]))
            })
            .unwrap();
            assert_eq!(
                result.all_serialised,
                r#"
2010-04-27
Foo
    3:00 - ? I desperately need
        a break!
    -4m Lunch break and more break
"#
            );
        }

        #[test]
        fn extending_pause_with_summary_on_next_line() {
            let original = r#"
2010-04-27
Foo
    3:00 - ? I desperately need
        a break!
    -1h Lunch break
"#;
            let result = at_record(original, april_27(), |r| {
                r.extend_pause(Duration::from_minutes(-60), &summary(&["", "and more break"]))
            })
            .unwrap();
            assert_eq!(
                result.all_serialised,
                r#"
2010-04-27
Foo
    3:00 - ? I desperately need
        a break!
    -2h Lunch break
        and more break
"#
            );
        }

        #[test]
        fn extending_pause_with_multiline_summary() {
            let original = r#"
2010-04-27
Foo
    3:00 - ? I desperately need
        a break!
    -1h Lunch
        break
"#;
            let result = at_record(original, april_27(), |r| {
                r.extend_pause(Duration::from_minutes(-60), &summary(&["and more break"]))
            })
            .unwrap();
            assert_eq!(
                result.all_serialised,
                r#"
2010-04-27
Foo
    3:00 - ? I desperately need
        a break!
    -2h Lunch
        break and more break
"#
            );
            assert_eq!(result.replaced_lines, LineSpan::new(5, 7));
        }

        #[test]
        fn extending_pause_extends_last_pause() {
            let original = r#"
2010-04-27
Foo
    3:00 - ? I desperately need
        a break!
    -30m
    -30m
"#;
            let delta = Duration::new(-2, -51).unwrap();
            let result = at_record(original, april_27(), |r| r.extend_pause(delta, &EntrySummary::default())).unwrap();
            assert_eq!(
                result.all_serialised,
                r#"
2010-04-27
Foo
    3:00 - ? I desperately need
        a break!
    -30m
    -3h21m
"#
            );
        }

        #[test]
        fn extending_pause_by_zero_is_noop() {
            let original = r#"
2010-04-27
Foo
    3:00 - ? I desperately need
        a break!
    -0m
"#;
            let result = at_record(original, april_27(), |r| {
                r.extend_pause(Duration::zero(), &EntrySummary::default())
            })
            .unwrap();
            assert_eq!(result.all_serialised, original);
            assert!(result.changed.is_empty());
            assert!(result.replaced_lines.is_empty());
        }

        #[test]
        fn extending_pause_fails_without_open_range() {
            let original = "\n2010-04-27\n    3:00 - 4:00\n    -30m\n";
            let result = at_record(original, april_27(), |r| {
                r.extend_pause(Duration::from_minutes(120), &EntrySummary::default())
            });
            assert_eq!(result, Err(ReconcileError::NoOpenRange));
        }

        #[test]
        fn extending_pause_rejects_non_negative_delta() {
            let original = "2010-04-27\n\t3:00 - ?\n\t-5m\n";
            let result = at_record(original, april_27(), |r| {
                r.extend_pause(Duration::from_minutes(10), &EntrySummary::default())
            });
            assert!(matches!(result, Err(ReconcileError::InvalidEdit(_))));
        }

        #[test]
        fn extending_pause_keeps_the_written_spacing() {
            let original = "2010-04-27\n    3:00 - ?\n    -1m    Lunch  \n";
            let result = at_record(original, april_27(), |r| {
                r.extend_pause(Duration::from_minutes(-3), &summary(&["more"]))
            })
            .unwrap();
            assert_eq!(result.all_serialised, "2010-04-27\n    3:00 - ?\n    -4m    Lunch more  \n");
            assert_eq!(result.changed, "    -4m    Lunch more  \n");
        }

        #[test]
        fn does_not_extend_non_negative_durations() {
            let original = "\n2010-04-27\n    3:00 - ?\n    30m\n";
            let result = at_record(original, april_27(), |r| {
                r.extend_pause(Duration::from_minutes(-10), &EntrySummary::default())
            });
            assert!(matches!(result, Err(ReconcileError::InvalidEdit(_))));
        }

        #[test]
        fn extending_creates_pause_when_none_follows() {
            let original = "2010-04-27\n\t3:00 - ? Work\n\t1:00 - 2:00\n";
            let result = at_record(original, april_27(), |r| {
                r.extend_pause(Duration::from_minutes(-15), &summary(&["Coffee"]))
            })
            .unwrap();
            assert_eq!(
                result.all_serialised,
                "2010-04-27\n\t3:00 - ? Work\n\t-15m Coffee\n\t1:00 - 2:00\n"
            );
            assert!(result.replaced_lines.is_empty());
        }

        /* --------------------------- open ranges --------------------------- */

        #[test]
        fn closing_open_range_keeps_the_rest_of_the_line() {
            let original = "2010-04-27\n\t8:00 - ???   Work\n\t-30m\n";
            let result = at_record(original, april_27(), |r| {
                r.close_open_range(Time::new(17, 15).unwrap(), &EntrySummary::default())
            })
            .unwrap();
            assert_eq!(result.all_serialised, "2010-04-27\n\t8:00 - 17:15   Work\n\t-30m\n");
            assert_eq!(result.replaced_lines, LineSpan::new(1, 2));
            let record = result.record().unwrap();
            assert_eq!(record.open_ranges().count(), 0);
        }

        #[test]
        fn closing_open_range_uses_the_ranges_clock() {
            let original = "2010-04-27\n    9:00am-?\n";
            let result = at_record(original, april_27(), |r| {
                r.close_open_range(Time::new(13, 30).unwrap(), &summary(&["Done"]))
            })
            .unwrap();
            assert_eq!(result.all_serialised, "2010-04-27\n    9:00am-1:30pm Done\n");
        }

        #[test]
        fn closing_before_start_fails() {
            let original = "2010-04-27\n\t8:00 - ?\n";
            let result = at_record(original, april_27(), |r| {
                r.close_open_range(Time::new(7, 0).unwrap(), &EntrySummary::default())
            });
            assert_eq!(result, Err(ReconcileError::Domain(DomainError::InvalidRange)));
        }

        #[test]
        fn closing_needs_an_open_range() {
            let original = "2010-04-27\n\t8:00 - 9:00\n";
            let result = at_record(original, april_27(), |r| {
                r.close_open_range(Time::new(10, 0).unwrap(), &EntrySummary::default())
            });
            assert_eq!(result, Err(ReconcileError::NoOpenRange));
        }

        #[test]
        fn starting_open_range() {
            let original = "2010-04-27\n\t8:00 - 9:00\n";
            let result = at_record(original, april_27(), |r| {
                r.start_open_range(Time::new(10, 0).unwrap(), &summary(&["Review"]))
            })
            .unwrap();
            assert_eq!(result.all_serialised, "2010-04-27\n\t8:00 - 9:00\n\t10:00 - ? Review\n");

            let again = Reconciler::at_record(&result.file, april_27())
                .unwrap()
                .start_open_range(Time::new(11, 0).unwrap(), &EntrySummary::default());
            assert_eq!(again, Err(ReconcileError::MultipleOpenRanges));
        }

        /* ----------------------------- entries ----------------------------- */

        #[test]
        fn appending_entry_to_existing_record() {
            let original = "\n1855-04-25\n\t1h\n";
            let entry = parse_entry("2h").unwrap();
            let result = at_record(original, date(1855, 4, 25), |r| r.append_entry(&entry)).unwrap();
            assert_eq!(result.all_serialised, "\n1855-04-25\n\t1h\n\t2h\n");
        }

        #[test]
        fn appending_entry_targets_the_last_record_of_a_date() {
            let original = "2000-01-01\n\t1h\n\n2000-01-01\n\t3h\n\n2000-01-02\n\t5h\n";
            let entry = parse_entry("2h").unwrap();
            let result = at_record(original, date(2000, 1, 1), |r| r.append_entry(&entry)).unwrap();
            assert_eq!(
                result.all_serialised,
                "2000-01-01\n\t1h\n\n2000-01-01\n\t3h\n\t2h\n\n2000-01-02\n\t5h\n"
            );
            assert_eq!(result.record_index, 1);
        }

        #[test]
        fn appending_entry_keeps_line_endings() {
            let original = "2000-01-01\r\n  1h\r\n  -5m";
            let entry = parse_entry("30m Notes\nmore").unwrap();
            let result = at_record(original, date(2000, 1, 1), |r| r.append_entry(&entry)).unwrap();
            assert_eq!(result.all_serialised, "2000-01-01\r\n  1h\r\n  -5m\r\n  30m Notes\r\n    more");
        }

        #[test]
        fn appending_entry_after_record_summary_only() {
            let original = "2000-01-01\nHoliday\n\n2000-01-02\n\t1h\n";
            let entry = parse_entry("1h").unwrap();
            let result = at_record(original, date(2000, 1, 1), |r| r.append_entry(&entry)).unwrap();
            assert_eq!(result.all_serialised, "2000-01-01\nHoliday\n\t1h\n\n2000-01-02\n\t1h\n");
        }

        #[test]
        fn edits_that_would_not_parse_are_rejected() {
            // 24:00 has no 12-hour spelling that keeps the range valid.
            let original = "2000-01-01\n\t1h\n";
            let entry = parse_entry("23:00 - 24:00").unwrap();
            let file = parse(original).unwrap();
            let style = Style {
                time_format: TimeFormat::TwelveHour,
                ..file.style()
            };
            let result = Reconciler::at_record(&file, date(2000, 1, 1))
                .unwrap()
                .with_style(style)
                .append_entry(&entry);
            assert!(matches!(result, Err(ReconcileError::InvalidEdit(_))));
        }

        /* ---------------------------- new records ---------------------------- */

        #[test]
        fn new_record_in_empty_file() {
            let file = parse("").unwrap();
            let entry = parse_entry("2h").unwrap();
            let result = Reconciler::new_record(&file, date(1855, 4, 25), None)
                .append_entry(&entry)
                .unwrap();
            assert_eq!(result.all_serialised, "1855-04-25\n\t2h\n");
            assert_eq!(result.record_index, 0);
        }

        #[test]
        fn new_record_is_appended_after_earlier_dates() {
            let file = parse("\n1855-04-25\n\t1h\n").unwrap();
            let entry = parse_entry("2h").unwrap();
            let st = Some("7h30m!".parse().unwrap());
            let result = Reconciler::new_record(&file, date(2000, 1, 1), st)
                .append_entry(&entry)
                .unwrap();
            assert_eq!(result.all_serialised, "\n1855-04-25\n\t1h\n\n2000-01-01 (7h30m!)\n\t2h\n");
        }

        #[test]
        fn new_record_is_inserted_before_later_dates() {
            let file = parse("2000-01-01\n\t1h\n\n2000-01-03\n\t3h").unwrap();
            let entry = parse_entry("2h").unwrap();
            let result = Reconciler::new_record(&file, date(2000, 1, 2), None)
                .append_entry(&entry)
                .unwrap();
            assert_eq!(
                result.all_serialised,
                "2000-01-01\n\t1h\n\n2000-01-02\n\t2h\n\n2000-01-03\n\t3h"
            );
            assert_eq!(result.record_index, 1);
            assert_eq!(result.replaced_lines, LineSpan::empty_at(3));
        }

        #[test]
        fn new_record_after_unterminated_last_line() {
            let file = parse("2000-01-01\n\t1h").unwrap();
            let result = Reconciler::new_record(&file, date(2000, 1, 2), None)
                .ensure_record()
                .unwrap();
            assert_eq!(result.all_serialised, "2000-01-01\n\t1h\n\n2000-01-02");
            assert_eq!(result.file.warnings().len(), 1);
        }

        #[test]
        fn new_record_follows_detected_style() {
            let file = parse("\n1855/04/25\n\t1h\n").unwrap();
            let entry = parse_entry("2h").unwrap();
            let result = Reconciler::new_record(&file, date(2000, 1, 1), None)
                .append_entry(&entry)
                .unwrap();
            assert_eq!(result.all_serialised, "\n1855/04/25\n\t1h\n\n2000/01/01\n\t2h\n");

            let style = Style {
                date_format: DateFormat::Dashes,
                ..file.style()
            };
            let result = Reconciler::new_record(&file, date(2000, 1, 1), None)
                .with_style(style)
                .append_entry(&entry)
                .unwrap();
            assert_eq!(result.all_serialised, "\n1855/04/25\n\t1h\n\n2000-01-01\n\t2h\n");
        }

        #[test]
        fn new_record_has_no_open_range() {
            let file = parse("").unwrap();
            let reconciler = Reconciler::new_record(&file, date(2000, 1, 1), None);
            assert!(reconciler.is_new());
            assert_eq!(
                reconciler.append_pause(&EntrySummary::default()),
                Err(ReconcileError::NoOpenRange)
            );
        }

        #[test]
        fn first_match_falls_through_creators() {
            let file = parse("2000-01-01\n\t1h\n").unwrap();
            let today = date(2000, 1, 2);
            let creators = [
                Creator::AtRecord(today),
                Creator::AtRecord(date(2000, 1, 1)),
                Creator::NewRecord {
                    date: today,
                    should_total: None,
                },
            ];
            let reconciler = first_match(&file, &creators).unwrap();
            assert_eq!(reconciler.date(), date(2000, 1, 1));
            assert!(!reconciler.is_new());

            let reconciler = first_match(&file, &[Creator::AtRecord(today), creators[2]]).unwrap();
            assert!(reconciler.is_new());

            assert!(first_match(&file, &[Creator::AtRecord(today)]).is_none());
        }

        #[test]
        fn existing_record_is_left_alone_by_ensure_record() {
            let original = "2000-01-01\n\t1h\n";
            let result = at_record(original, date(2000, 1, 1), |r| r.ensure_record()).unwrap();
            assert_eq!(result.all_serialised, original);
        }
    }
}

pub mod service {
    //! Aggregations over records. Pure and total; rounding configuration is
    //! the only thing that can be rejected.

    use crate::core::*;
    use chrono::{NaiveDateTime, Timelike};
    use std::{fmt, str::FromStr};

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum ServiceError {
        #[error("invalid rounding unit {0}m (expected 5m, 10m, 15m, 30m or 60m)")]
        InvalidRoundingUnit(u32),
        #[error("no current record (dated either today or yesterday)")]
        NoCurrentRecord,
    }

    /* ------------------------------- totals ------------------------------- */

    /// Sum of all closed entries; open ranges count as zero.
    pub fn total_of(record: &Record) -> Duration {
        record
            .entries
            .iter()
            .filter_map(Entry::duration)
            .fold(Duration::zero(), Duration::saturating_plus)
    }

    pub fn total<'a>(records: impl IntoIterator<Item = &'a Record>) -> Duration {
        records
            .into_iter()
            .map(total_of)
            .fold(Duration::zero(), Duration::saturating_plus)
    }

    /// Like `total_of`, but open ranges count as if they closed at `now`.
    /// A range starting after `now` counts as zero.
    pub fn hypothetical_total_of(now: NaiveDateTime, record: &Record) -> Duration {
        let days = record.date.days_until(Date::from_naive(now.date()));
        let now_offset = days
            .saturating_mul(24 * 60)
            .saturating_add(i64::from(now.hour() * 60 + now.minute()));
        record
            .entries
            .iter()
            .map(|e| match e.value {
                EntryValue::Range(r) if r.is_open() => {
                    Duration::from_minutes(now_offset.saturating_sub(r.start().midnight_offset()).max(0))
                }
                _ => e.duration().unwrap_or_default(),
            })
            .fold(Duration::zero(), Duration::saturating_plus)
    }

    pub fn hypothetical_total<'a>(now: NaiveDateTime, records: impl IntoIterator<Item = &'a Record>) -> Duration {
        records
            .into_iter()
            .map(|r| hypothetical_total_of(now, r))
            .fold(Duration::zero(), Duration::saturating_plus)
    }

    /// Sum of all should-totals. The sum is closed if any part of it was.
    pub fn should_total_sum<'a>(records: impl IntoIterator<Item = &'a Record>) -> ShouldTotal {
        records
            .into_iter()
            .filter_map(|r| r.should_total)
            .fold(ShouldTotal::default(), |acc, st| {
                ShouldTotal::new(acc.duration.saturating_plus(st.duration), acc.closed || st.closed)
            })
    }

    /// `actual - should`: positive when more was logged than targeted.
    pub fn diff(should: Duration, actual: Duration) -> Duration {
        Duration::from_minutes(actual.in_minutes().saturating_sub(should.in_minutes()))
    }

    /// Time of day at which `diff` reaches zero, if it is representable.
    pub fn estimated_end_time(now: Time, diff: Duration) -> Option<Time> {
        now.plus(diff.negate().ok()?).ok()
    }

    /* ------------------------------- rounding ------------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Rounding(u32);

    impl Rounding {
        pub const UNITS: [u32; 5] = [5, 10, 15, 30, 60];

        pub fn new(minutes: u32) -> Result<Self, ServiceError> {
            if Self::UNITS.contains(&minutes) {
                Ok(Self(minutes))
            } else {
                Err(ServiceError::InvalidRoundingUnit(minutes))
            }
        }

        pub fn minutes(self) -> u32 {
            self.0
        }

        /// Nearest multiple of the unit; ties round away from zero.
        pub fn round(self, d: Duration) -> Duration {
            let unit = i64::from(self.0);
            let abs = d.in_minutes().saturating_abs();
            let rounded = (abs.saturating_mul(2).saturating_add(unit) / (2 * unit)).saturating_mul(unit);
            Duration::from_minutes(if d.is_negative() { -rounded } else { rounded })
        }

        /// Rounds a time of day; `23:58` becomes `24:00` at 5 minutes.
        pub fn round_time(self, t: Time) -> Result<Time, DomainError> {
            let rounded = self.round(Duration::from_minutes(t.midnight_offset()));
            Time::from_midnight_offset(rounded.in_minutes())
        }
    }

    impl fmt::Display for Rounding {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}m", self.0)
        }
    }

    impl FromStr for Rounding {
        type Err = String;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            let s = s.trim();
            let digits = s.strip_suffix('m').unwrap_or(s);
            let minutes: u32 = digits
                .parse()
                .map_err(|_| format!("invalid rounding unit {s:?} (expected e.g. 15m)"))?;
            Self::new(minutes).map_err(|e| e.to_string())
        }
    }

    /* ---------------------------- current record ---------------------------- */

    /// Records split into the ones currently worked on and all others.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Split<'a> {
        pub current: Vec<&'a Record>,
        pub previous: Vec<&'a Record>,
        /// `false` when `current` holds yesterday's records.
        pub is_today: bool,
    }

    /// `current` holds today's records, or yesterday's when there are none
    /// for today (a night shift past midnight).
    pub fn split_current_and_previous(today: Date, records: &[Record]) -> Result<Split<'_>, ServiceError> {
        let yesterday = today.plus_days(-1).ok();
        let mut todays = vec![];
        let mut yesterdays = vec![];
        let mut previous = vec![];
        for r in records {
            if r.date == today {
                todays.push(r);
            } else if Some(r.date) == yesterday {
                yesterdays.push(r);
            } else {
                previous.push(r);
            }
        }
        if !todays.is_empty() {
            previous.extend(yesterdays);
            return Ok(Split {
                current: todays,
                previous,
                is_today: true,
            });
        }
        if !yesterdays.is_empty() {
            return Ok(Split {
                current: yesterdays,
                previous,
                is_today: false,
            });
        }
        Err(ServiceError::NoCurrentRecord)
    }

}

pub mod config {
    //! User settings: an optional TOML file, then `WORKLOG_*` environment
    //! variables. Empty values count as unset.

    use crate::{core::*, service::Rounding};
    use figment::{
        Figment,
        providers::{Env, Format, Toml},
    };
    use serde::{Deserialize, Deserializer};
    use std::{
        fmt::Display,
        path::{Path, PathBuf},
        str::FromStr,
    };

    #[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
    #[serde(default)]
    pub struct Config {
        /// Applied by `start`/`stop` when no `--round` is given.
        #[serde(deserialize_with = "empty_as_none")]
        pub default_rounding: Option<Rounding>,
        /// Should-total of records created implicitly.
        #[serde(deserialize_with = "empty_as_none")]
        pub default_should_total: Option<ShouldTotal>,
        #[serde(deserialize_with = "empty_as_none")]
        pub date_format: Option<DateFormat>,
        #[serde(deserialize_with = "empty_as_none")]
        pub time_convention: Option<TimeFormat>,
        /// Record file used when none is passed on the command line.
        #[serde(deserialize_with = "empty_as_none")]
        pub file: Option<PathBuf>,
    }

    /// Env values such as `WORKLOG_DEFAULT_ROUNDING=15` arrive as numbers.
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(i64),
    }

    fn empty_as_none<'de, D, T>(d: D) -> Result<Option<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: FromStr,
        T::Err: Display,
    {
        let raw = match Option::<Raw>::deserialize(d)? {
            None => return Ok(None),
            Some(Raw::Text(s)) => s,
            Some(Raw::Number(n)) => n.to_string(),
        };
        match raw.trim() {
            "" => Ok(None),
            s => s.parse().map(Some).map_err(serde::de::Error::custom),
        }
    }

    impl Config {
        pub fn load() -> Result<Self, figment::Error> {
            Self::load_from(None)
        }

        /// Reads `path` if given, otherwise the default config file; a
        /// missing file is not an error. Environment variables win.
        pub fn load_from(path: Option<&Path>) -> Result<Self, figment::Error> {
            let mut figment = Figment::new();
            match path {
                Some(p) => figment = figment.merge(Toml::file(p)),
                None => {
                    if let Some(p) = default_path() {
                        figment = figment.merge(Toml::file(p));
                    }
                }
            }
            Self::from_figment(figment.merge(Env::prefixed("WORKLOG_")))
        }

        pub fn from_figment(figment: Figment) -> Result<Self, figment::Error> {
            figment.extract()
        }

        /// Configured preferences override the detected style.
        pub fn apply_to(&self, detected: Style) -> Style {
            Style {
                date_format: self.date_format.unwrap_or(detected.date_format),
                time_format: self.time_convention.unwrap_or(detected.time_format),
                ..detected
            }
        }
    }

    /// `<config dir>/worklog/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("worklog").join("config.toml"))
    }

}
