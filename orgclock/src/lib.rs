//! Org activity-log engine: turns org outlines into activity records and sums
//! their clocked time into calendar-bounded reports.
//!
//! Everything up to `report` is pure; file access lives in `source`, `config`
//! and `engine`.

pub mod core {
    use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime};
    use indexmap::{IndexMap, IndexSet};
    use serde::{Deserialize, Serialize};
    use serde_with::{DeserializeFromStr, SerializeDisplay};
    use std::{
        cmp::Ordering,
        fmt,
        hash::{Hash, Hasher},
        str::FromStr,
    };

    /* ---------------------------- Value Objects ---------------------------- */

    /// Tag wrapper (`:tag:` in a headline). Case-sensitive, as in Org.
    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Tag(pub String);

    impl From<&str> for Tag {
        fn from(s: &str) -> Self {
            Self(s.to_string())
        }
    }

    impl fmt::Display for Tag {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    /// Tags in order of appearance; equality ignores order.
    pub type TagSet = IndexSet<Tag>;

    /// Joins tags as they appear in a headline, without the outer colons.
    pub fn join_tags(tags: &TagSet) -> String {
        tags.iter().map(|t| t.0.as_str()).collect::<Vec<_>>().join(":")
    }

    /// Headline state keyword. Headlines without one carry `None`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "UPPERCASE")]
    pub enum StateKeyword {
        Todo,
        Waiting,
        Done,
    }

    impl StateKeyword {
        pub fn as_str(self) -> &'static str {
            match self {
                StateKeyword::Todo => "TODO",
                StateKeyword::Waiting => "WAITING",
                StateKeyword::Done => "DONE",
            }
        }

        pub fn from_word(word: &str) -> Option<Self> {
            match word {
                "TODO" => Some(StateKeyword::Todo),
                "WAITING" => Some(StateKeyword::Waiting),
                "DONE" => Some(StateKeyword::Done),
                _ => None,
            }
        }
    }

    /* ----------------------------- Timestamps ----------------------------- */

    /// `+` (from last), `++` (from base), `.+` (from now).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum RepeaterKind {
        FromLast,
        FromBase,
        FromNow,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum RepeaterUnit {
        Day,
        Week,
        Month,
        Year,
    }

    impl RepeaterUnit {
        pub fn from_char(c: char) -> Option<Self> {
            match c {
                'd' => Some(RepeaterUnit::Day),
                'w' => Some(RepeaterUnit::Week),
                'm' => Some(RepeaterUnit::Month),
                'y' => Some(RepeaterUnit::Year),
                _ => None,
            }
        }

        fn as_char(self) -> char {
            match self {
                RepeaterUnit::Day => 'd',
                RepeaterUnit::Week => 'w',
                RepeaterUnit::Month => 'm',
                RepeaterUnit::Year => 'y',
            }
        }
    }

    /// Repeater cookie such as `.+1d`, `++2w`, `+1m`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Repeater {
        pub kind: RepeaterKind,
        pub value: u32,
        pub unit: RepeaterUnit,
    }

    impl Repeater {
        /// Whether `day` falls on the cadence anchored at `anchor`.
        pub fn matches(&self, anchor: NaiveDate, day: NaiveDate) -> bool {
            let step = i64::from(self.value.max(1));
            match self.unit {
                RepeaterUnit::Day => (day - anchor).num_days().rem_euclid(step) == 0,
                RepeaterUnit::Week => (day - anchor).num_days().rem_euclid(7 * step) == 0,
                RepeaterUnit::Month => {
                    let months = i64::from(day.year() - anchor.year()) * 12
                        + i64::from(day.month()) - i64::from(anchor.month());
                    day.day() == anchor.day() && months.rem_euclid(step) == 0
                }
                RepeaterUnit::Year => {
                    day.month() == anchor.month()
                        && day.day() == anchor.day()
                        && i64::from(day.year() - anchor.year()).rem_euclid(step) == 0
                }
            }
        }
    }

    impl fmt::Display for Repeater {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let sym = match self.kind {
                RepeaterKind::FromLast => "+",
                RepeaterKind::FromBase => "++",
                RepeaterKind::FromNow => ".+",
            };
            write!(f, "{}{}{}", sym, self.value, self.unit.as_char())
        }
    }

    /// A timestamp: active `<...>` (planning) or inactive `[...]` (logbook).
    ///
    /// Equality, ordering and hashing look at `(date, time)` only; the day
    /// name is informational and never checked against the date.
    #[derive(Debug, Clone, SerializeDisplay, DeserializeFromStr)]
    pub struct Timestamp {
        pub active: bool,
        pub date: NaiveDate,
        pub time: Option<NaiveTime>,
        pub day_name: Option<String>,
        /// End of an in-bracket time range (`10:00-11:30`).
        pub end_time: Option<NaiveTime>,
        pub repeater: Option<Repeater>,
    }

    impl Timestamp {
        pub fn new(date: NaiveDate, time: Option<NaiveTime>) -> Self {
            Self {
                active: false,
                date,
                time,
                day_name: None,
                end_time: None,
                repeater: None,
            }
        }

        /// Start as a datetime; all-day timestamps start at midnight.
        pub fn datetime(&self) -> NaiveDateTime {
            self.date.and_time(self.time.unwrap_or(NaiveTime::MIN))
        }

        /// End of an in-bracket time range, if any.
        pub fn range_end(&self) -> Option<NaiveDateTime> {
            self.end_time.map(|t| self.date.and_time(t))
        }
    }

    impl PartialEq for Timestamp {
        fn eq(&self, other: &Self) -> bool {
            self.date == other.date && self.time == other.time
        }
    }

    impl Eq for Timestamp {}

    impl PartialOrd for Timestamp {
        fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
            Some(self.cmp(other))
        }
    }

    impl Ord for Timestamp {
        fn cmp(&self, other: &Self) -> Ordering {
            (self.date, self.time).cmp(&(other.date, other.time))
        }
    }

    impl Hash for Timestamp {
        fn hash<H: Hasher>(&self, state: &mut H) {
            self.date.hash(state);
            self.time.hash(state);
        }
    }

    impl fmt::Display for Timestamp {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let (open, close) = if self.active { ('<', '>') } else { ('[', ']') };
            write!(f, "{}{}", open, self.date.format("%Y-%m-%d"))?;
            if let Some(day) = &self.day_name {
                write!(f, " {day}")?;
            }
            if let Some(time) = self.time {
                write!(f, " {}", time.format("%H:%M"))?;
                if let Some(end) = self.end_time {
                    write!(f, "-{}", end.format("%H:%M"))?;
                }
            }
            if let Some(rep) = &self.repeater {
                write!(f, " {rep}")?;
            }
            write!(f, "{close}")
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    #[error("unrecognized timestamp {0:?}")]
    pub struct TimestampParseError(pub String);

    impl FromStr for Timestamp {
        type Err = TimestampParseError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            crate::tokenizer::parse_timestamp_str(s)
                .ok_or_else(|| TimestampParseError(s.to_string()))
        }
    }

    /* ------------------------------ Headings ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "UPPERCASE")]
    pub enum PlanningKind {
        Scheduled,
        Deadline,
    }

    /// First SCHEDULED/DEADLINE entry following a headline.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Planning {
        pub kind: PlanningKind,
        pub start: Timestamp,
        /// End of a `<...>--<...>` range.
        pub end: Option<Timestamp>,
    }

    impl Planning {
        pub fn repeater(&self) -> Option<&Repeater> {
            self.start
                .repeater
                .as_ref()
                .or_else(|| self.end.as_ref().and_then(|e| e.repeater.as_ref()))
        }

        /// Planned end: the range end, else an in-bracket end time.
        pub fn end_at(&self) -> Option<NaiveDateTime> {
            match &self.end {
                Some(end) => Some(end.datetime()),
                None => self.start.range_end(),
            }
        }
    }

    /// A raw line with its 1-based position in the source file.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct SourceLine {
        pub number: usize,
        pub text: String,
    }

    /// One headline and everything up to the next headline of any level.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct HeadingBlock {
        /// 1-based line of the headline.
        pub line: usize,
        pub level: u8,
        pub state: Option<StateKeyword>,
        pub priority: Option<char>,
        pub title: String,
        pub tags: TagSet,
        pub planning: Option<Planning>,
        pub closed: Option<Timestamp>,
        #[serde(default)]
        pub properties: IndexMap<String, String>,
        /// LOGBOOK interior (and loose CLOCK lines), unparsed.
        #[serde(default)]
        pub logbook: Vec<SourceLine>,
        #[serde(default)]
        pub body: String,
    }

    impl HeadingBlock {
        pub fn new(line: usize, level: u8, title: impl Into<String>) -> Self {
            Self {
                line,
                level,
                state: None,
                priority: None,
                title: title.into(),
                tags: TagSet::new(),
                planning: None,
                closed: None,
                properties: IndexMap::new(),
                logbook: vec![],
                body: String::new(),
            }
        }
    }

    /// Level and own tags of an enclosing headline.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Ancestor {
        pub level: u8,
        pub tags: TagSet,
    }

    /* ------------------------------- Clocks ------------------------------- */

    /// How running clocks count toward totals.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub enum OpenClockPolicy {
        /// Open clocks contribute nothing.
        #[default]
        Exclude,
        /// Open clocks run until the given wall-clock instant.
        CountUntil(NaiveDateTime),
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ClockInterval {
        /// 1-based line of the CLOCK entry.
        pub line: usize,
        pub start: Timestamp,
        /// `None` while the clock is still running.
        pub end: Option<Timestamp>,
        /// Duration after `=>`, in minutes.
        pub stated_minutes: Option<i64>,
    }

    impl ClockInterval {
        pub fn is_open(&self) -> bool {
            self.end.is_none()
        }

        pub fn start_at(&self) -> NaiveDateTime {
            self.start.datetime()
        }

        pub fn end_at(&self) -> Option<NaiveDateTime> {
            self.end.as_ref().map(Timestamp::datetime)
        }

        /// `end - start`; negative when the entry is inverted.
        pub fn actual_minutes(&self) -> Option<i64> {
            self.end_at().map(|end| (end - self.start_at()).num_minutes())
        }

        /// End used for attribution under `policy`.
        pub fn effective_end(&self, policy: OpenClockPolicy) -> Option<NaiveDateTime> {
            match (self.end_at(), policy) {
                (Some(end), _) => Some(end),
                (None, OpenClockPolicy::CountUntil(now)) => Some(now.max(self.start_at())),
                (None, OpenClockPolicy::Exclude) => None,
            }
        }

        /// Minutes counted toward totals; the computed duration is authoritative.
        pub fn minutes(&self, policy: OpenClockPolicy) -> i64 {
            self.effective_end(policy)
                .map(|end| (end - self.start_at()).num_minutes().max(0))
                .unwrap_or(0)
        }
    }

    /// `- State "DONE" from "TODO" [2025-11-13 Thu 08:30]` note in a logbook.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct StateChange {
        pub line: usize,
        pub to: String,
        pub from: Option<String>,
        pub at: Timestamp,
    }

    /* ------------------------------- Records ------------------------------- */

    /// Normalized view of one heading, built once and never mutated.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ActivityRecord {
        pub block: HeadingBlock,
        /// Own tags first, then ancestors nearest-first, then file tags.
        pub effective_tags: TagSet,
        pub clocks: Vec<ClockInterval>,
        #[serde(default)]
        pub state_changes: Vec<StateChange>,
        pub is_habit: bool,
        pub total_clocked_minutes: i64,
    }

    impl ActivityRecord {
        pub fn title(&self) -> &str {
            &self.block.title
        }

        pub fn habit_repeater(&self) -> Option<&Repeater> {
            self.block.planning.as_ref().and_then(Planning::repeater)
        }

        /// Dates on which the heading moved to DONE (logbook notes and CLOSED).
        pub fn done_dates(&self) -> impl Iterator<Item = NaiveDate> + '_ {
            self.state_changes
                .iter()
                .filter(|sc| sc.to == StateKeyword::Done.as_str())
                .map(|sc| sc.at.date)
                .chain(self.block.closed.as_ref().map(|ts| ts.date))
        }
    }

    /* ------------------------------ Date range ------------------------------ */

    /// Half-open calendar range `[start, end)`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DateRange {
        pub start: NaiveDate,
        pub end: NaiveDate,
    }

    impl DateRange {
        pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, EngineError> {
            if start >= end {
                return Err(EngineError::InvalidRange { start, end });
            }
            Ok(Self { start, end })
        }

        /// Monday-to-Monday week containing `day`.
        pub fn week_of(day: NaiveDate) -> Self {
            let monday = day - Duration::days(i64::from(day.weekday().num_days_from_monday()));
            Self {
                start: monday,
                end: monday + Duration::days(7),
            }
        }

        pub fn contains_date(&self, day: NaiveDate) -> bool {
            day >= self.start && day < self.end
        }

        pub fn contains(&self, at: NaiveDateTime) -> bool {
            self.contains_date(at.date())
        }

        pub fn num_days(&self) -> i64 {
            (self.end - self.start).num_days()
        }

        pub fn days(&self) -> impl Iterator<Item = NaiveDate> + '_ {
            self.start.iter_days().take_while(|d| *d < self.end)
        }

        /// `YYYY-MM-` prefixes of every month the range touches.
        pub fn month_prefixes(&self) -> Vec<String> {
            let mut out: Vec<String> = Vec::new();
            for day in self.days() {
                let prefix = day.format("%Y-%m-").to_string();
                if out.last() != Some(&prefix) {
                    out.push(prefix);
                }
            }
            out
        }
    }

    impl fmt::Display for DateRange {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}..{}", self.start, self.end)
        }
    }

    /* ---------------------------- Warnings ---------------------------- */

    /// Non-fatal conditions met while parsing; parsing always continues.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
    #[serde(tag = "kind", rename_all = "snake_case")]
    pub enum WarningKind {
        #[error("unparseable tags kept in title: {text:?}")]
        MalformedHeading { text: String },
        #[error("stated duration {stated} min differs from computed {computed} min")]
        ClockDurationMismatch { stated: i64, computed: i64 },
        #[error("clock is still running")]
        OpenClockEncountered,
        #[error("unrecognized CLOCK line {text:?}")]
        UnknownTimestampFormat { text: String },
        #[error("drawer :{name}: has no :END:")]
        UnterminatedDrawer { name: String },
        #[error("clock ends before it starts")]
        NegativeClockInterval,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Warning {
        pub source: Option<String>,
        pub line: usize,
        #[serde(flatten)]
        pub kind: WarningKind,
    }

    impl Warning {
        pub fn new(line: usize, kind: WarningKind) -> Self {
            Self {
                source: None,
                line,
                kind,
            }
        }

        pub fn with_source(mut self, name: &str) -> Self {
            self.source = Some(name.to_string());
            self
        }
    }

    impl fmt::Display for Warning {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match &self.source {
                Some(src) => write!(f, "{}:{}: {}", src, self.line, self.kind),
                None => write!(f, "line {}: {}", self.line, self.kind),
            }
        }
    }

    /* ---------------------------- Errors (fatal) ---------------------------- */

    /// Raised by a grouping rule; aborts only the report being built.
    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    #[error("grouping failed for {title:?}: {reason}")]
    pub struct GroupingError {
        pub title: String,
        pub reason: String,
    }

    #[derive(Debug, thiserror::Error)]
    pub enum EngineError {
        #[error("reading {path}: {source}")]
        Io {
            path: String,
            source: std::io::Error,
        },
        #[error("empty date range: {start} is not before {end}")]
        InvalidRange { start: NaiveDate, end: NaiveDate },
        #[error(transparent)]
        Grouping(#[from] GroupingError),
        #[error("invalid configuration: {0}")]
        Config(String),
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn date(y: i32, m: u32, d: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(y, m, d).unwrap()
        }

        #[test]
        fn timestamp_equality_ignores_day_name() {
            let a: Timestamp = "[2025-11-13 Thu 08:25]".parse().unwrap();
            let b: Timestamp = "[2025-11-13 Fri 08:25]".parse().unwrap();
            let c: Timestamp = "[2025-11-13 Thu 08:26]".parse().unwrap();
            assert_eq!(a, b);
            assert!(a < c);
        }

        #[test]
        fn timestamp_display_round_trips() {
            let text = "<2025-11-13 Thu 10:00-11:30 .+1d>";
            let ts: Timestamp = text.parse().unwrap();
            assert_eq!(ts.to_string(), text);
            assert_eq!(
                serde_json::to_string(&ts).unwrap(),
                format!("\"{text}\"")
            );
        }

        #[test]
        fn week_of_starts_on_monday() {
            let week = DateRange::week_of(date(2025, 11, 13));
            assert_eq!(week.start, date(2025, 11, 10));
            assert_eq!(week.end, date(2025, 11, 17));
            assert_eq!(week.num_days(), 7);
        }

        #[test]
        fn empty_range_is_rejected() {
            let d = date(2025, 11, 13);
            assert!(matches!(
                DateRange::new(d, d),
                Err(EngineError::InvalidRange { .. })
            ));
        }

        #[test]
        fn month_prefixes_cover_range() {
            let range = DateRange::new(date(2025, 10, 30), date(2025, 11, 2)).unwrap();
            assert_eq!(range.month_prefixes(), vec!["2025-10-", "2025-11-"]);
        }

        #[test]
        fn repeater_cadence() {
            let daily: Timestamp = "<2025-11-10 Mon +1d>".parse().unwrap();
            let weekly: Timestamp = "<2025-11-10 Mon ++1w>".parse().unwrap();
            let monthly: Timestamp = "<2025-01-31 Fri .+1m>".parse().unwrap();
            let anchor = date(2025, 11, 10);
            assert!(daily.repeater.unwrap().matches(anchor, date(2025, 11, 12)));
            assert!(weekly.repeater.unwrap().matches(anchor, date(2025, 11, 17)));
            assert!(!weekly.repeater.unwrap().matches(anchor, date(2025, 11, 16)));
            assert!(weekly.repeater.unwrap().matches(anchor, date(2025, 11, 3)));
            let m = monthly.repeater.unwrap();
            assert!(m.matches(date(2025, 1, 31), date(2025, 3, 31)));
            assert!(!m.matches(date(2025, 1, 31), date(2025, 2, 28)));
        }

        #[test]
        fn open_clock_counts_only_when_asked() {
            let start: Timestamp = "[2025-11-13 Thu 08:25]".parse().unwrap();
            let clock = ClockInterval {
                line: 1,
                start,
                end: None,
                stated_minutes: None,
            };
            assert_eq!(clock.minutes(OpenClockPolicy::Exclude), 0);
            let now = date(2025, 11, 13).and_hms_opt(9, 0, 0).unwrap();
            assert_eq!(clock.minutes(OpenClockPolicy::CountUntil(now)), 35);
        }
    }
}

pub mod tokenizer {
    //! Line-classifying tokenizer built on `nom`.
    //!
    //! Parsing strategy:
    //! - Every line is classified on its own: heading, planning, drawer open/close,
    //!   clock, `#+KEY:` keyword, or plain text.
    //! - Heading blocks are assembled from the classified stream in one pass; a block
    //!   runs from its headline to the next headline of any level.
    //! - LOGBOOK interiors are collected verbatim. CLOCK grammar lives in `clock`.

    use crate::core::*;
    use chrono::{NaiveDate, NaiveTime};
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, take_while1, take_while_m_n},
        character::complete::{char, digit1, one_of, satisfy, space0, space1},
        combinator::{all_consuming, eof, map, map_opt, map_res, opt},
        error::VerboseError,
        multi::many1,
        sequence::{delimited, preceded, terminated, tuple},
    };

    pub(crate) type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /* ----------------------------- Headlines ----------------------------- */

    /// A parsed headline line.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Headline {
        pub level: u8,
        pub state: Option<StateKeyword>,
        pub priority: Option<char>,
        pub title: String,
        pub tags: TagSet,
        /// Trailing text that looked like a tag block but did not parse.
        pub malformed: Option<String>,
    }

    /// Parse `* TODO [#A] Title :tag1:tag2:`; `None` when the line is no headline.
    pub fn parse_headline(line: &str) -> Option<Headline> {
        let (rest, (stars, state, priority)) = headline_prefix(line).ok()?;
        let (title, tags, malformed) = split_tags(rest);
        Some(Headline {
            level: u8::try_from(stars).unwrap_or(u8::MAX),
            state,
            priority,
            title,
            tags,
            malformed,
        })
    }

    fn headline_prefix(i: &str) -> PResult<'_, (usize, Option<StateKeyword>, Option<char>)> {
        let (i, stars) = take_while1(|c: char| c == '*')(i)?;
        let (i, _) = space1(i)?;
        let (i, state) = opt(terminated(
            map_opt(
                take_while1(|c: char| c.is_ascii_uppercase()),
                StateKeyword::from_word,
            ),
            alt((space1, eof)),
        ))(i)?;
        let (i, priority) = opt(terminated(
            delimited(
                tag("[#"),
                satisfy(|c: char| c.is_ascii_alphanumeric()),
                char(']'),
            ),
            alt((space1, eof)),
        ))(i)?;
        Ok((i, (stars.len(), state, priority)))
    }

    fn split_tags(rest: &str) -> (String, TagSet, Option<String>) {
        let text = rest.trim_end();
        let (head, candidate) = match text.rfind([' ', '\t']) {
            Some(pos) => (&text[..pos], &text[pos + 1..]),
            None => ("", text),
        };
        if candidate.len() >= 2 && candidate.starts_with(':') && candidate.ends_with(':') {
            let parts: Vec<&str> = candidate.split(':').filter(|p| !p.is_empty()).collect();
            if !parts.is_empty() && parts.iter().all(|p| p.chars().all(is_tag_char)) {
                let tags = parts.into_iter().map(Tag::from).collect();
                return (head.trim_end().to_string(), tags, None);
            }
        }
        // Keep anything else in the title; only flag text that tried to be tags.
        let malformed = (candidate.starts_with(':') && candidate.matches(':').count() >= 2)
            .then(|| candidate.to_string());
        (text.to_string(), TagSet::new(), malformed)
    }

    fn is_tag_char(c: char) -> bool {
        c.is_alphanumeric() || matches!(c, '_' | '@' | '#' | '%')
    }

    /// Tags from a `#+FILETAGS:` value (`:a:b:` or space separated).
    pub fn parse_tag_list(value: &str) -> TagSet {
        value
            .split(|c: char| c == ':' || c.is_whitespace())
            .filter(|t| !t.is_empty() && t.chars().all(is_tag_char))
            .map(Tag::from)
            .collect()
    }

    /* --------------------------- Line classifier --------------------------- */

    /// The kind of a single outline line.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum LineKind {
        Heading(Headline),
        Planning,
        LogbookOpen,
        PropertiesOpen,
        DrawerEnd,
        Clock,
        Keyword { key: String, value: String },
        Plain,
    }

    pub fn classify_line(line: &str) -> LineKind {
        if line.starts_with('*') {
            if let Some(h) = parse_headline(line) {
                return LineKind::Heading(h);
            }
        }
        let trimmed = line.trim();
        if trimmed.eq_ignore_ascii_case(":LOGBOOK:") {
            return LineKind::LogbookOpen;
        }
        if trimmed.eq_ignore_ascii_case(":PROPERTIES:") {
            return LineKind::PropertiesOpen;
        }
        if trimmed.eq_ignore_ascii_case(":END:") {
            return LineKind::DrawerEnd;
        }
        if trimmed.starts_with("CLOCK:") {
            return LineKind::Clock;
        }
        if ["SCHEDULED:", "DEADLINE:", "CLOSED:"]
            .iter()
            .any(|k| trimmed.starts_with(k))
        {
            return LineKind::Planning;
        }
        if let Some((key, value)) = trimmed.strip_prefix("#+").and_then(|r| r.split_once(':')) {
            if !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return LineKind::Keyword {
                    key: key.to_ascii_uppercase(),
                    value: value.trim().to_string(),
                };
            }
        }
        LineKind::Plain
    }

    /* ------------------------------ Tokenizer ------------------------------ */

    /// Lazy sequence of heading blocks over one text (a file or a window of it).
    pub struct Tokenizer<'a> {
        lines: std::iter::Enumerate<std::str::Lines<'a>>,
        first_line: usize,
        pending: Option<(usize, Headline)>,
        file_tags: TagSet,
        warnings: Vec<Warning>,
    }

    impl<'a> Tokenizer<'a> {
        pub fn new(text: &'a str) -> Self {
            Self::with_offset(text, 0)
        }

        /// `first_line` is the 0-based index of the text's first line in its file,
        /// so reported line numbers stay file-relative for windows.
        pub fn with_offset(text: &'a str, first_line: usize) -> Self {
            Self {
                lines: text.lines().enumerate(),
                first_line,
                pending: None,
                file_tags: TagSet::new(),
                warnings: Vec::new(),
            }
        }

        pub fn with_file_tags(mut self, tags: TagSet) -> Self {
            self.file_tags = tags;
            self
        }

        /// `#+FILETAGS:` seen so far (plus any seeded tags).
        pub fn file_tags(&self) -> &TagSet {
            &self.file_tags
        }

        pub fn warnings(&self) -> &[Warning] {
            &self.warnings
        }

        pub fn into_warnings(self) -> Vec<Warning> {
            self.warnings
        }

        fn next_line(&mut self) -> Option<(usize, &'a str)> {
            let offset = self.first_line;
            self.lines
                .next()
                .map(|(idx, line)| (offset + idx + 1, line))
        }

        fn open(&mut self, number: usize, headline: Headline) -> BlockBuilder<'a> {
            if let Some(text) = &headline.malformed {
                self.warnings.push(Warning::new(
                    number,
                    WarningKind::MalformedHeading { text: text.clone() },
                ));
            }
            BlockBuilder::new(number, headline)
        }
    }

    impl Iterator for Tokenizer<'_> {
        type Item = HeadingBlock;

        fn next(&mut self) -> Option<HeadingBlock> {
            let (number, headline) = match self.pending.take() {
                Some(pending) => pending,
                // Preamble: only #+FILETAGS matters before the first headline.
                None => loop {
                    let (number, line) = self.next_line()?;
                    match classify_line(line) {
                        LineKind::Heading(h) => break (number, h),
                        LineKind::Keyword { key, value } if key == "FILETAGS" => {
                            self.file_tags.extend(parse_tag_list(&value));
                        }
                        _ => {}
                    }
                },
            };

            let mut block = self.open(number, headline);
            while let Some((number, line)) = self.next_line() {
                match classify_line(line) {
                    LineKind::Heading(h) => {
                        self.pending = Some((number, h));
                        break;
                    }
                    kind => block.push(number, line, kind),
                }
            }
            Some(block.finish(&mut self.warnings))
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Drawer {
        Logbook,
        Properties,
    }

    impl Drawer {
        fn name(self) -> &'static str {
            match self {
                Drawer::Logbook => "LOGBOOK",
                Drawer::Properties => "PROPERTIES",
            }
        }
    }

    struct BlockBuilder<'a> {
        block: HeadingBlock,
        body: Vec<&'a str>,
        /// Open drawer and the line it was opened on.
        drawer: Option<(Drawer, usize)>,
        in_planning: bool,
    }

    impl<'a> BlockBuilder<'a> {
        fn new(number: usize, headline: Headline) -> Self {
            let mut block = HeadingBlock::new(number, headline.level, headline.title);
            block.state = headline.state;
            block.priority = headline.priority;
            block.tags = headline.tags;
            Self {
                block,
                body: Vec::new(),
                drawer: None,
                in_planning: true,
            }
        }

        fn push(&mut self, number: usize, line: &'a str, kind: LineKind) {
            if let Some((drawer, _)) = self.drawer {
                match (drawer, kind) {
                    (_, LineKind::DrawerEnd) => self.drawer = None,
                    (Drawer::Logbook, _) => self.block.logbook.push(SourceLine {
                        number,
                        text: line.to_string(),
                    }),
                    (Drawer::Properties, _) => {
                        if let Some((key, value)) = parse_property(line) {
                            self.block.properties.insert(key, value);
                        }
                    }
                }
                return;
            }

            // Planning is only recognized on the lines directly below the headline.
            let planning_slot = std::mem::replace(&mut self.in_planning, false);
            match kind {
                LineKind::Planning if planning_slot && self.apply_planning(line) => {
                    self.in_planning = true;
                }
                LineKind::LogbookOpen => self.drawer = Some((Drawer::Logbook, number)),
                LineKind::PropertiesOpen => self.drawer = Some((Drawer::Properties, number)),
                LineKind::Clock => self.block.logbook.push(SourceLine {
                    number,
                    text: line.to_string(),
                }),
                _ => self.body.push(line),
            }
        }

        fn apply_planning(&mut self, line: &str) -> bool {
            let Ok((_, items)) = planning_line(line.trim()) else {
                return false;
            };
            for (keyword, start, end) in items {
                match keyword {
                    PlanningKeyword::Closed => self.block.closed = Some(start),
                    PlanningKeyword::Scheduled | PlanningKeyword::Deadline => {
                        if self.block.planning.is_none() {
                            let kind = if keyword == PlanningKeyword::Scheduled {
                                PlanningKind::Scheduled
                            } else {
                                PlanningKind::Deadline
                            };
                            self.block.planning = Some(Planning { kind, start, end });
                        }
                    }
                }
            }
            true
        }

        fn finish(mut self, warnings: &mut Vec<Warning>) -> HeadingBlock {
            if let Some((drawer, opened)) = self.drawer {
                warnings.push(Warning::new(
                    opened,
                    WarningKind::UnterminatedDrawer {
                        name: drawer.name().to_string(),
                    },
                ));
            }
            let first = self.body.iter().position(|l| !l.trim().is_empty());
            let last = self.body.iter().rposition(|l| !l.trim().is_empty());
            if let (Some(first), Some(last)) = (first, last) {
                self.block.body = self.body[first..=last].join("\n");
            }
            self.block
        }
    }

    fn parse_property(line: &str) -> Option<(String, String)> {
        let (key, value) = line.trim().strip_prefix(':')?.split_once(':')?;
        if key.is_empty() || key.contains(char::is_whitespace) {
            return None;
        }
        Some((key.to_string(), value.trim().to_string()))
    }

    /// Blocks, file tags and warnings of a whole text.
    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct Tokenized {
        pub blocks: Vec<HeadingBlock>,
        pub file_tags: TagSet,
        pub warnings: Vec<Warning>,
    }

    pub fn tokenize(text: &str) -> Tokenized {
        let mut tokenizer = Tokenizer::new(text);
        let blocks = tokenizer.by_ref().collect();
        Tokenized {
            blocks,
            file_tags: tokenizer.file_tags().clone(),
            warnings: tokenizer.into_warnings(),
        }
    }

    /* ----------------------------- Planning ----------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum PlanningKeyword {
        Scheduled,
        Deadline,
        Closed,
    }

    fn planning_item(i: &str) -> PResult<'_, (PlanningKeyword, Timestamp, Option<Timestamp>)> {
        // SCHEDULED: <2025-11-15 Sat 12:00>--<2025-11-15 Sat 13:00>
        let (i, _) = space0(i)?;
        let (i, keyword) = alt((
            map(tag("SCHEDULED:"), |_| PlanningKeyword::Scheduled),
            map(tag("DEADLINE:"), |_| PlanningKeyword::Deadline),
            map(tag("CLOSED:"), |_| PlanningKeyword::Closed),
        ))(i)?;
        let (i, _) = space0(i)?;
        let (i, start) = timestamp(i)?;
        let (i, end) = opt(preceded(tag("--"), timestamp))(i)?;
        Ok((i, (keyword, start, end)))
    }

    fn planning_line(i: &str) -> PResult<'_, Vec<(PlanningKeyword, Timestamp, Option<Timestamp>)>> {
        all_consuming(terminated(many1(planning_item), space0))(i)
    }

    /* ----------------------------- Timestamps ----------------------------- */

    /// `<2025-11-13 Thu 10:00-11:00 .+1d -2d>` or `[2025-11-13 Thu 08:25]`.
    pub(crate) fn timestamp(i: &str) -> PResult<'_, Timestamp> {
        let (i, open) = one_of("<[")(i)?;
        let close = if open == '<' { '>' } else { ']' };
        let (i, date) = parse_date(i)?;
        let (i, day_name) = opt(preceded(
            space1,
            take_while1(|c: char| c.is_alphabetic() || c == '.'),
        ))(i)?;
        let (i, time) = opt(preceded(space1, parse_time))(i)?;
        let (i, end_time) = match time {
            Some(_) => opt(preceded(char('-'), parse_time))(i)?,
            None => (i, None),
        };
        let (i, repeater) = opt(preceded(space1, parse_repeater))(i)?;
        let (i, _) = opt(preceded(space1, parse_delay))(i)?;
        let (i, _) = space0(i)?;
        let (i, _) = char(close)(i)?;
        Ok((
            i,
            Timestamp {
                active: open == '<',
                date,
                time,
                day_name: day_name.map(str::to_string),
                end_time,
                repeater,
            },
        ))
    }

    /// Parse one complete timestamp, surrounding whitespace allowed.
    pub fn parse_timestamp_str(s: &str) -> Option<Timestamp> {
        all_consuming(timestamp)(s.trim()).ok().map(|(_, ts)| ts)
    }

    fn parse_date(i: &str) -> PResult<'_, NaiveDate> {
        map_opt(
            tuple((
                map_res(take_while_m_n(4, 4, is_digit), |s: &str| s.parse::<i32>()),
                char('-'),
                map_res(take_while_m_n(2, 2, is_digit), |s: &str| s.parse::<u32>()),
                char('-'),
                map_res(take_while_m_n(2, 2, is_digit), |s: &str| s.parse::<u32>()),
            )),
            |(y, _, m, _, d)| NaiveDate::from_ymd_opt(y, m, d),
        )(i)
    }

    pub(crate) fn parse_time(i: &str) -> PResult<'_, NaiveTime> {
        map_opt(
            tuple((
                map_res(take_while_m_n(1, 2, is_digit), |s: &str| s.parse::<u32>()),
                char(':'),
                map_res(take_while_m_n(2, 2, is_digit), |s: &str| s.parse::<u32>()),
            )),
            |(h, _, m)| NaiveTime::from_hms_opt(h, m, 0),
        )(i)
    }

    fn parse_repeater(i: &str) -> PResult<'_, Repeater> {
        map_opt(
            tuple((
                alt((tag(".+"), tag("++"), tag("+"))),
                map_res(digit1, |s: &str| s.parse::<u32>()),
                one_of("dwmy"),
            )),
            |(sym, value, unit)| {
                let kind = match sym {
                    ".+" => RepeaterKind::FromNow,
                    "++" => RepeaterKind::FromBase,
                    _ => RepeaterKind::FromLast,
                };
                Some(Repeater {
                    kind,
                    value,
                    unit: RepeaterUnit::from_char(unit)?,
                })
            },
        )(i)
    }

    /// Warning/delay cookie (`-2d`, `--1w`); parsed and dropped.
    fn parse_delay(i: &str) -> PResult<'_, ()> {
        map(
            tuple((alt((tag("--"), tag("-"))), digit1, one_of("hdwmy"))),
            |_| (),
        )(i)
    }

    fn is_digit(c: char) -> bool {
        c.is_ascii_digit()
    }

}

pub mod clock {
    //! CLOCK line and state-change note extraction from collected logbook lines.

    use crate::core::*;
    use crate::tokenizer::{PResult, timestamp};
    use nom::{
        bytes::complete::{tag, take_while, take_while_m_n},
        character::complete::{char, digit1, space0, space1},
        combinator::{all_consuming, map_res, opt},
        sequence::{delimited, preceded, tuple},
    };
    use tracing::trace;

    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct ClockExtraction {
        pub intervals: Vec<ClockInterval>,
        pub state_changes: Vec<StateChange>,
        pub warnings: Vec<Warning>,
    }

    /// Parse every CLOCK entry and `- State` note in `lines`.
    ///
    /// Unparseable CLOCK lines are skipped with an `UnknownTimestampFormat`
    /// warning; the remaining lines are still processed.
    pub fn extract_clocks(lines: &[SourceLine]) -> ClockExtraction {
        let mut out = ClockExtraction::default();
        for line in lines {
            let text = line.text.trim();
            if let Some(rest) = text.strip_prefix("CLOCK:") {
                match clock_entry(rest) {
                    Ok((_, (start, end, stated)))
                        if start.time.is_some()
                            && end.as_ref().is_none_or(|e| e.time.is_some()) =>
                    {
                        let interval = ClockInterval {
                            line: line.number,
                            start,
                            end,
                            stated_minutes: stated,
                        };
                        if let Some(kind) = check_interval(&interval) {
                            out.warnings.push(Warning::new(line.number, kind));
                        }
                        out.intervals.push(interval);
                    }
                    _ => {
                        trace!(line = line.number, text, "skipping unparseable CLOCK entry");
                        out.warnings.push(Warning::new(
                            line.number,
                            WarningKind::UnknownTimestampFormat {
                                text: text.to_string(),
                            },
                        ));
                    }
                }
            } else if text.starts_with("- State") {
                if let Ok((_, (to, from, at))) = state_change(text) {
                    out.state_changes.push(StateChange {
                        line: line.number,
                        to,
                        from,
                        at,
                    });
                }
            }
        }
        out
    }

    fn check_interval(interval: &ClockInterval) -> Option<WarningKind> {
        let actual = match interval.actual_minutes() {
            None => return Some(WarningKind::OpenClockEncountered),
            Some(actual) => actual,
        };
        if actual < 0 {
            return Some(WarningKind::NegativeClockInterval);
        }
        match interval.stated_minutes {
            // Org rounds to whole minutes; allow one minute of slack.
            Some(stated) if (stated - actual).abs() > 1 => Some(WarningKind::ClockDurationMismatch {
                stated,
                computed: actual,
            }),
            _ => None,
        }
    }

    type ClockParts = (Timestamp, Option<Timestamp>, Option<i64>);

    fn clock_entry(i: &str) -> PResult<'_, ClockParts> {
        // [2025-11-13 Thu 08:25]--[2025-11-13 Thu 09:30] =>  1:05
        let (i, (_, start, end, stated, _)) = all_consuming(tuple((
            space0,
            timestamp,
            opt(preceded(tuple((space0, tag("--"), space0)), timestamp)),
            opt(preceded(tuple((space0, tag("=>"), space0)), duration)),
            space0,
        )))(i)?;
        Ok((i, (start, end, stated)))
    }

    fn duration(i: &str) -> PResult<'_, i64> {
        let (i, (hours, _, minutes)) = tuple((
            map_res(digit1, |s: &str| s.parse::<i64>()),
            char(':'),
            map_res(take_while_m_n(2, 2, |c: char| c.is_ascii_digit()), |s: &str| {
                s.parse::<i64>()
            }),
        ))(i)?;
        Ok((i, hours * 60 + minutes))
    }

    fn quoted(i: &str) -> PResult<'_, &str> {
        delimited(char('"'), take_while(|c: char| c != '"'), char('"'))(i)
    }

    fn state_change(i: &str) -> PResult<'_, (String, Option<String>, Timestamp)> {
        // - State "DONE"       from "TODO"       [2025-11-14 Fri 18:02]
        let (i, _) = tag("- State")(i)?;
        let (i, _) = space1(i)?;
        let (i, to) = quoted(i)?;
        let (i, from) = opt(preceded(
            tuple((space1, tag("from"))),
            opt(preceded(space1, quoted)),
        ))(i)?;
        let (i, _) = space1(i)?;
        let (i, at) = timestamp(i)?;
        let from = from.flatten().filter(|s| !s.is_empty()).map(str::to_string);
        Ok((i, (to.to_string(), from, at)))
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn lines(texts: &[&str]) -> Vec<SourceLine> {
            texts
                .iter()
                .enumerate()
                .map(|(i, t)| SourceLine {
                    number: i + 1,
                    text: t.to_string(),
                })
                .collect()
        }

        #[test]
        fn closed_clock_with_matching_duration() {
            let out = extract_clocks(&lines(&[
                "CLOCK: [2025-11-13 Thu 08:25]--[2025-11-13 Thu 09:30] =>  1:05",
            ]));
            assert!(out.warnings.is_empty());
            assert_eq!(out.intervals.len(), 1);
            let c = &out.intervals[0];
            assert_eq!(c.actual_minutes(), Some(65));
            assert_eq!(c.stated_minutes, Some(65));
            assert_eq!(c.minutes(OpenClockPolicy::Exclude), 65);
        }

        #[test]
        fn open_clock_is_kept_and_flagged() {
            let out = extract_clocks(&lines(&["CLOCK: [2025-11-13 Thu 08:25]"]));
            assert_eq!(out.intervals.len(), 1);
            assert!(out.intervals[0].is_open());
            assert_eq!(out.warnings[0].kind, WarningKind::OpenClockEncountered);
        }

        #[test]
        fn stated_duration_mismatch_prefers_computed() {
            let out = extract_clocks(&lines(&[
                "CLOCK: [2025-11-13 Thu 08:25]--[2025-11-13 Thu 09:30] =>  1:30",
                "CLOCK: [2025-11-13 Thu 10:00]--[2025-11-13 Thu 10:31] =>  0:30",
            ]));
            assert_eq!(out.intervals.len(), 2);
            assert_eq!(out.warnings.len(), 1);
            assert_eq!(
                out.warnings[0].kind,
                WarningKind::ClockDurationMismatch {
                    stated: 90,
                    computed: 65
                }
            );
            assert_eq!(out.intervals[0].minutes(OpenClockPolicy::Exclude), 65);
        }

        #[test]
        fn crosses_midnight() {
            let out = extract_clocks(&lines(&[
                "CLOCK: [2025-11-13 Thu 23:30]--[2025-11-14 Fri 00:15] =>  0:45",
            ]));
            assert!(out.warnings.is_empty());
            assert_eq!(out.intervals[0].actual_minutes(), Some(45));
        }

        #[test]
        fn negative_interval_counts_zero() {
            let out = extract_clocks(&lines(&[
                "CLOCK: [2025-11-13 Thu 10:00]--[2025-11-13 Thu 09:00]",
            ]));
            assert_eq!(out.warnings[0].kind, WarningKind::NegativeClockInterval);
            assert_eq!(out.intervals[0].minutes(OpenClockPolicy::Exclude), 0);
        }

        #[test]
        fn malformed_entries_are_skipped() {
            let out = extract_clocks(&lines(&[
                "CLOCK: [2025-13-45 Thu 08:25]--[2025-11-13 Thu 09:30] =>  1:05",
                "CLOCK: [2025-11-13 Thu]--[2025-11-13 Thu 09:30]",
                "CLOCK: [2025-11-13 Thu 08:00]--",
                "CLOCK: [2025-11-13 Thu 11:00]--[2025-11-13 Thu 11:10] =>  0:10",
            ]));
            assert_eq!(out.intervals.len(), 1);
            assert_eq!(out.intervals[0].line, 4);
            let lines: Vec<usize> = out.warnings.iter().map(|w| w.line).collect();
            assert_eq!(lines, vec![1, 2, 3]);
            assert!(out
                .warnings
                .iter()
                .all(|w| matches!(w.kind, WarningKind::UnknownTimestampFormat { .. })));
        }

        #[test]
        fn long_durations_parse() {
            let out = extract_clocks(&lines(&[
                "CLOCK: [2025-11-13 Thu 08:00]--[2025-11-13 Thu 18:05] => 10:05",
            ]));
            assert!(out.warnings.is_empty());
            assert_eq!(out.intervals[0].stated_minutes, Some(605));
        }

        #[test]
        fn state_change_notes() {
            let out = extract_clocks(&lines(&[
                "- State \"DONE\"       from \"TODO\"       [2025-11-14 Fri 18:02]",
                "- State \"DONE\"       from              [2025-11-15 Sat 07:00]",
                "- Note taken on [2025-11-15 Sat 08:00]",
            ]));
            assert!(out.warnings.is_empty());
            assert_eq!(out.state_changes.len(), 2);
            assert_eq!(out.state_changes[0].to, "DONE");
            assert_eq!(out.state_changes[0].from.as_deref(), Some("TODO"));
            assert_eq!(out.state_changes[1].from, None);
            assert_eq!(out.state_changes[1].at.date.to_string(), "2025-11-15");
        }
    }
}

pub mod records {
    //! Turns heading blocks into activity records: tag inheritance, clock
    //! extraction, habit detection and totals.

    use crate::clock::extract_clocks;
    use crate::core::*;

    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct BuildOptions {
        pub open_clocks: OpenClockPolicy,
    }

    /// Builds records in document order, tracking the enclosing outline.
    ///
    /// Blocks must arrive in document order. File tags sit at level 0 and are
    /// never popped; a window can seed the ancestors it started under.
    #[derive(Debug, Clone, Default)]
    pub struct RecordBuilder {
        stack: Vec<Ancestor>,
        options: BuildOptions,
        warnings: Vec<Warning>,
    }

    impl RecordBuilder {
        pub fn new(options: BuildOptions) -> Self {
            Self {
                options,
                ..Self::default()
            }
        }

        pub fn with_file_tags(mut self, tags: TagSet) -> Self {
            if !tags.is_empty() {
                self.stack.insert(0, Ancestor { level: 0, tags });
            }
            self
        }

        pub fn with_ancestors(mut self, ancestors: impl IntoIterator<Item = Ancestor>) -> Self {
            self.stack.extend(ancestors);
            self
        }

        pub fn build(&mut self, block: HeadingBlock) -> ActivityRecord {
            while self
                .stack
                .last()
                .is_some_and(|a| a.level != 0 && a.level >= block.level)
            {
                self.stack.pop();
            }

            let mut effective_tags = block.tags.clone();
            for ancestor in self.stack.iter().rev() {
                effective_tags.extend(ancestor.tags.iter().cloned());
            }

            let extraction = extract_clocks(&block.logbook);
            self.warnings.extend(extraction.warnings);
            let total_clocked_minutes = extraction
                .intervals
                .iter()
                .map(|c| c.minutes(self.options.open_clocks))
                .sum();
            let is_habit = block
                .planning
                .as_ref()
                .is_some_and(|p| p.repeater().is_some());

            self.stack.push(Ancestor {
                level: block.level,
                tags: block.tags.clone(),
            });

            ActivityRecord {
                block,
                effective_tags,
                clocks: extraction.intervals,
                state_changes: extraction.state_changes,
                is_habit,
                total_clocked_minutes,
            }
        }

        pub fn warnings(&self) -> &[Warning] {
            &self.warnings
        }

        pub fn into_warnings(self) -> Vec<Warning> {
            self.warnings
        }
    }

    /// Build records for a whole document's blocks.
    pub fn build_records(
        blocks: impl IntoIterator<Item = HeadingBlock>,
        file_tags: TagSet,
        options: BuildOptions,
    ) -> (Vec<ActivityRecord>, Vec<Warning>) {
        let mut builder = RecordBuilder::new(options).with_file_tags(file_tags);
        let records = blocks.into_iter().map(|b| builder.build(b)).collect();
        (records, builder.into_warnings())
    }

}

pub mod aggregate {
    //! Range filtering, grouping and habit consistency over built records.

    use crate::core::*;
    use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use std::collections::{BTreeMap, BTreeSet};
    use std::fmt;
    use std::str::FromStr;

    /// Bucket for records without any effective tag.
    pub const UNTAGGED: &str = "untagged";
    /// Bucket for headlines without a state keyword.
    pub const NO_STATE: &str = "NONE";

    /// Whether a key is computed once per record or once per calendar day.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub enum KeyScope {
        #[default]
        Record,
        Day,
    }

    /// Maps a record (on a given day) to a bucket key; `Ok(None)` skips it.
    pub trait GroupingKey {
        fn scope(&self) -> KeyScope {
            KeyScope::Record
        }

        fn key(&self, record: &ActivityRecord, day: NaiveDate) -> Result<Option<String>, GroupingError>;
    }

    impl<F> GroupingKey for F
    where
        F: Fn(&ActivityRecord) -> Result<Option<String>, GroupingError>,
    {
        fn key(&self, record: &ActivityRecord, _day: NaiveDate) -> Result<Option<String>, GroupingError> {
            self(record)
        }
    }

    /// Built-in grouping rules.
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum GroupBy {
        /// First effective tag.
        #[default]
        PrimaryTag,
        /// All effective tags joined with `:`.
        TagSet,
        State,
        /// Habit title; non-habits are skipped.
        Habit,
        Title,
        /// Calendar day; intervals are split at midnight.
        Date,
        /// Value of a PROPERTIES entry; records without it are skipped.
        Property(String),
    }

    impl GroupingKey for GroupBy {
        fn scope(&self) -> KeyScope {
            match self {
                GroupBy::Date => KeyScope::Day,
                _ => KeyScope::Record,
            }
        }

        fn key(&self, record: &ActivityRecord, day: NaiveDate) -> Result<Option<String>, GroupingError> {
            let key = match self {
                GroupBy::PrimaryTag => record
                    .effective_tags
                    .first()
                    .map(|t| t.0.clone())
                    .unwrap_or_else(|| UNTAGGED.to_string()),
                GroupBy::TagSet if record.effective_tags.is_empty() => UNTAGGED.to_string(),
                GroupBy::TagSet => join_tags(&record.effective_tags),
                GroupBy::State => record
                    .block
                    .state
                    .map_or(NO_STATE, StateKeyword::as_str)
                    .to_string(),
                GroupBy::Habit => return Ok(record.is_habit.then(|| record.title().to_string())),
                GroupBy::Title => record.title().to_string(),
                GroupBy::Date => day.to_string(),
                GroupBy::Property(name) => return Ok(record.block.properties.get(name).cloned()),
            };
            Ok(Some(key))
        }
    }

    impl FromStr for GroupBy {
        type Err = String;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            match s {
                "tag" | "primary-tag" => Ok(GroupBy::PrimaryTag),
                "tags" | "tag-set" => Ok(GroupBy::TagSet),
                "state" => Ok(GroupBy::State),
                "habit" => Ok(GroupBy::Habit),
                "title" => Ok(GroupBy::Title),
                "date" | "day" => Ok(GroupBy::Date),
                other => match other.strip_prefix("property:") {
                    Some(name) if !name.is_empty() => Ok(GroupBy::Property(name.to_string())),
                    _ => Err(format!(
                        "unknown grouping {other:?} (expected tag, tags, state, habit, title, date or property:NAME)"
                    )),
                },
            }
        }
    }

    impl fmt::Display for GroupBy {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                GroupBy::PrimaryTag => f.write_str("tag"),
                GroupBy::TagSet => f.write_str("tags"),
                GroupBy::State => f.write_str("state"),
                GroupBy::Habit => f.write_str("habit"),
                GroupBy::Title => f.write_str("title"),
                GroupBy::Date => f.write_str("date"),
                GroupBy::Property(name) => write!(f, "property:{name}"),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Query {
        pub range: DateRange,
        /// Keep only records carrying this effective tag.
        pub tag: Option<Tag>,
        pub open_clocks: OpenClockPolicy,
    }

    impl Query {
        pub fn new(range: DateRange) -> Self {
            Self {
                range,
                tag: None,
                open_clocks: OpenClockPolicy::default(),
            }
        }

        pub fn with_tag(mut self, tag: Tag) -> Self {
            self.tag = Some(tag);
            self
        }

        pub fn with_open_clocks(mut self, policy: OpenClockPolicy) -> Self {
            self.open_clocks = policy;
            self
        }
    }

    /// One attributed slice: a clock interval (or a day slice of one), or a
    /// planned occurrence for records without clocks.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct BucketEntry<'a> {
        pub record: &'a ActivityRecord,
        pub start: NaiveDateTime,
        pub end: Option<NaiveDateTime>,
        pub minutes: i64,
        /// `false` for planned entries.
        pub clocked: bool,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Bucket<'a> {
        pub key: String,
        pub total_minutes: i64,
        /// Distinct contributing records, first contribution first.
        pub records: Vec<&'a ActivityRecord>,
        /// Sorted by start.
        pub entries: Vec<BucketEntry<'a>>,
    }

    impl Bucket<'_> {
        fn new(key: String) -> Self {
            Self {
                key,
                total_minutes: 0,
                records: Vec::new(),
                entries: Vec::new(),
            }
        }
    }

    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
    pub struct Summary {
        pub total_minutes: i64,
        pub record_count: usize,
        pub open_clocks: usize,
    }

    /// Buckets sorted by total descending, then key.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Aggregation<'a> {
        pub range: DateRange,
        pub buckets: Vec<Bucket<'a>>,
        pub summary: Summary,
    }

    /// A record is in range when one of its clocks starts in range, or when it
    /// has no clocks and its planning date is in range.
    pub fn in_range(record: &ActivityRecord, range: &DateRange) -> bool {
        if record.clocks.is_empty() {
            record
                .block
                .planning
                .as_ref()
                .is_some_and(|p| range.contains_date(p.start.date))
        } else {
            record.clocks.iter().any(|c| range.contains(c.start_at()))
        }
    }

    pub fn aggregate<'a, K>(
        records: &'a [ActivityRecord],
        query: &Query,
        key: &K,
    ) -> Result<Aggregation<'a>, EngineError>
    where
        K: GroupingKey + ?Sized,
    {
        let range = query.range;
        let scope = key.scope();
        let mut buckets: IndexMap<String, Bucket<'a>> = IndexMap::new();
        let mut summary = Summary::default();

        for record in records {
            if let Some(tag) = &query.tag {
                if !record.effective_tags.contains(tag) {
                    continue;
                }
            }
            let mut placed = false;
            for entry in entries_for(record, &range, query.open_clocks, scope) {
                let Some(bucket_key) = key.key(record, entry.start.date())? else {
                    continue;
                };
                placed = true;
                summary.total_minutes += entry.minutes;
                let bucket = buckets
                    .entry(bucket_key)
                    .or_insert_with_key(|k| Bucket::new(k.clone()));
                bucket.total_minutes += entry.minutes;
                if !bucket.records.iter().any(|r| std::ptr::eq(*r, record)) {
                    bucket.records.push(record);
                }
                bucket.entries.push(entry);
            }
            if placed {
                summary.record_count += 1;
                summary.open_clocks += record
                    .clocks
                    .iter()
                    .filter(|c| c.is_open() && range.contains(c.start_at()))
                    .count();
            }
        }

        let mut buckets: Vec<Bucket<'a>> = buckets.into_values().collect();
        for bucket in &mut buckets {
            bucket.entries.sort_by_key(|e| e.start);
        }
        buckets.sort_by(|a, b| {
            b.total_minutes
                .cmp(&a.total_minutes)
                .then_with(|| a.key.cmp(&b.key))
        });
        Ok(Aggregation {
            range,
            buckets,
            summary,
        })
    }

    fn entries_for<'a>(
        record: &'a ActivityRecord,
        range: &DateRange,
        policy: OpenClockPolicy,
        scope: KeyScope,
    ) -> Vec<BucketEntry<'a>> {
        if record.clocks.is_empty() {
            return record
                .block
                .planning
                .iter()
                .filter(|p| range.contains_date(p.start.date))
                .map(|p| BucketEntry {
                    record,
                    start: p.start.datetime(),
                    end: p.end_at(),
                    minutes: 0,
                    clocked: false,
                })
                .collect();
        }

        let mut out = Vec::new();
        for clock in &record.clocks {
            let start = clock.start_at();
            match (scope, clock.effective_end(policy)) {
                (KeyScope::Day, Some(end)) => {
                    for (s, e) in split_at_midnight(start, end.max(start)) {
                        if range.contains(s) {
                            out.push(BucketEntry {
                                record,
                                start: s,
                                end: Some(e),
                                minutes: (e - s).num_minutes(),
                                clocked: true,
                            });
                        }
                    }
                }
                (_, end) if range.contains(start) => out.push(BucketEntry {
                    record,
                    start,
                    end,
                    minutes: clock.minutes(policy),
                    clocked: true,
                }),
                _ => {}
            }
        }
        out
    }

    fn split_at_midnight(start: NaiveDateTime, end: NaiveDateTime) -> Vec<(NaiveDateTime, NaiveDateTime)> {
        let mut out = Vec::new();
        let mut cursor = start;
        loop {
            let midnight = (cursor.date() + Duration::days(1)).and_time(NaiveTime::MIN);
            if end <= midnight {
                out.push((cursor, end));
                return out;
            }
            out.push((cursor, midnight));
            cursor = midnight;
        }
    }

    /* ------------------------------- Habits ------------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct HabitStat {
        pub title: String,
        pub repeater: Repeater,
        /// Distinct in-range days with a completion, capped at `expected`.
        pub completed: usize,
        pub expected: usize,
        pub dates: Vec<NaiveDate>,
    }

    impl HabitStat {
        /// Completion ratio in `[0, 1]`; `0` when nothing was expected.
        pub fn ratio(&self) -> f64 {
            if self.expected == 0 {
                0.0
            } else {
                self.completed as f64 / self.expected as f64
            }
        }
    }

    /// Per-habit consistency over `range`, ordered by title.
    ///
    /// A day counts as completed when a clock starts on it or the heading was
    /// marked DONE on it. Expected days follow the repeater cadence anchored at
    /// the habit's scheduled date.
    pub fn habit_consistency(records: &[ActivityRecord], range: &DateRange) -> Vec<HabitStat> {
        let mut by_title: BTreeMap<&str, (Repeater, NaiveDate, BTreeSet<NaiveDate>)> = BTreeMap::new();
        for record in records.iter().filter(|r| r.is_habit) {
            let (Some(planning), Some(repeater)) = (record.block.planning.as_ref(), record.habit_repeater())
            else {
                continue;
            };
            let slot = by_title
                .entry(record.title())
                .or_insert_with(|| (*repeater, planning.start.date, BTreeSet::new()));
            let days = record
                .clocks
                .iter()
                .map(|c| c.start_at().date())
                .chain(record.done_dates())
                .filter(|d| range.contains_date(*d));
            slot.2.extend(days);
        }

        by_title
            .into_iter()
            .map(|(title, (repeater, anchor, dates))| {
                let expected = range.days().filter(|d| repeater.matches(anchor, *d)).count();
                let dates: Vec<NaiveDate> = dates.into_iter().collect();
                HabitStat {
                    title: title.to_string(),
                    repeater,
                    completed: dates.len().min(expected),
                    expected,
                    dates,
                }
            })
            .collect()
    }

}

pub mod report {
    //! Text and JSON projections of aggregation results. No business logic.

    use crate::aggregate::{Aggregation, Bucket, BucketEntry, HabitStat};
    use crate::core::DateRange;
    use indexmap::IndexMap;
    use serde::Serialize;
    use std::fmt::Write as _;

    /// `H:MM`, minutes always two digits.
    pub fn format_minutes(minutes: i64) -> String {
        let sign = if minutes < 0 { "-" } else { "" };
        let m = minutes.abs();
        format!("{sign}{}:{:02}", m / 60, m % 60)
    }

    /// Rounded integer share; `0` when there is no total.
    fn percent(part: i64, total: i64) -> i64 {
        if total <= 0 {
            0
        } else {
            (part * 100 + total / 2) / total
        }
    }

    fn count_noun(n: usize, noun: &str) -> String {
        if n == 1 {
            format!("{n} {noun}")
        } else {
            format!("{n} {noun}s")
        }
    }

    /// Meeting list: one section per day, one row per entry.
    ///
    /// Expects an aggregation keyed by date.
    pub fn render_meetings(agg: &Aggregation<'_>) -> String {
        let mut out = format!("Meetings {}\n", agg.range);
        if agg.buckets.is_empty() {
            out.push_str("No meetings in range.\n");
            return out;
        }
        let mut days: Vec<&Bucket<'_>> = agg.buckets.iter().collect();
        days.sort_by(|a, b| a.key.cmp(&b.key));
        for day in days {
            let _ = writeln!(out, "{}  ({})", day.key, format_minutes(day.total_minutes));
            for entry in &day.entries {
                let duration = if entry.clocked {
                    format_minutes(entry.minutes)
                } else {
                    "-".to_string()
                };
                let _ = writeln!(
                    out,
                    "  {:<11}  {:>5}  {}",
                    time_span(entry),
                    duration,
                    entry.record.title()
                );
            }
        }
        out
    }

    fn time_span(entry: &BucketEntry<'_>) -> String {
        let all_day = !entry.clocked
            && entry
                .record
                .block
                .planning
                .as_ref()
                .is_some_and(|p| p.start.time.is_none());
        if all_day {
            return "all-day".to_string();
        }
        let start = entry.start.format("%H:%M");
        match entry.end {
            Some(end) => format!("{start}-{}", end.format("%H:%M")),
            None if entry.clocked => format!("{start}-"),
            None => start.to_string(),
        }
    }

    /// Category breakdown with share of the total per bucket.
    pub fn render_breakdown(agg: &Aggregation<'_>) -> String {
        let total = agg.summary.total_minutes;
        let width = agg
            .buckets
            .iter()
            .map(|b| b.key.chars().count())
            .max()
            .unwrap_or(0)
            .max("total".len());

        let mut out = format!("Breakdown {}\n", agg.range);
        for bucket in &agg.buckets {
            let _ = writeln!(
                out,
                "{:<width$}  {:>6}  {:>4}",
                bucket.key,
                format_minutes(bucket.total_minutes),
                format!("{}%", percent(bucket.total_minutes, total)),
            );
        }
        let _ = writeln!(out, "{}", "-".repeat(width + 14));
        let _ = writeln!(
            out,
            "{:<width$}  {:>6}  {:>4}  ({}, {})",
            "total",
            format_minutes(total),
            if total > 0 { "100%" } else { "0%" },
            count_noun(agg.summary.record_count, "record"),
            count_noun(agg.summary.open_clocks, "open clock"),
        );
        out
    }

    pub fn render_habits(stats: &[HabitStat], range: &DateRange) -> String {
        let mut out = format!("Habits {range}\n");
        if stats.is_empty() {
            out.push_str("No habits found.\n");
            return out;
        }
        let width = stats
            .iter()
            .map(|s| s.title.chars().count())
            .max()
            .unwrap_or(0)
            .max("habit".len());
        let _ = writeln!(out, "{:<width$}  {:>5}  {:>4}  every", "habit", "done", "rate");
        for stat in stats {
            let _ = writeln!(
                out,
                "{:<width$}  {:>5}  {:>4}  {}",
                stat.title,
                format!("{}/{}", stat.completed, stat.expected),
                format!("{}%", percent(stat.completed as i64, stat.expected as i64)),
                stat.repeater,
            );
        }
        out
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct BucketView {
        pub total_minutes: i64,
        pub percent: i64,
        pub records: Vec<String>,
    }

    /// Machine-readable report; bucket order matches the aggregation.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct StructuredReport {
        pub range: DateRange,
        pub total_minutes: i64,
        pub record_count: usize,
        pub open_clocks: usize,
        pub buckets: IndexMap<String, BucketView>,
    }

    pub fn structured(agg: &Aggregation<'_>) -> StructuredReport {
        let total = agg.summary.total_minutes;
        let buckets = agg
            .buckets
            .iter()
            .map(|b| {
                let view = BucketView {
                    total_minutes: b.total_minutes,
                    percent: percent(b.total_minutes, total),
                    records: b.records.iter().map(|r| r.title().to_string()).collect(),
                };
                (b.key.clone(), view)
            })
            .collect();
        StructuredReport {
            range: agg.range,
            total_minutes: total,
            record_count: agg.summary.record_count,
            open_clocks: agg.summary.open_clocks,
            buckets,
        }
    }

}

pub mod source {
    //! Content sources and heading-aligned line windows.
    //!
    //! A window `[start, end)` owns the headings whose headline lies inside it.
    //! Lines before its first headline belong to an earlier heading and are
    //! skipped; the last heading is read past `end` up to the next headline.
    //! Consecutive windows therefore visit every heading exactly once. While
    //! skipping, only the outline (levels and tags) and `#+FILETAGS` are kept.

    use crate::core::{Ancestor, TagSet};
    use crate::tokenizer::{LineKind, classify_line, parse_tag_list};
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use std::fs::File;
    use std::io::{self, BufRead, BufReader, Cursor};
    use std::path::{Path, PathBuf};
    use tracing::debug;

    /// Line-oriented access to one outline document.
    pub trait ContentSource {
        /// Name used in warnings and logs.
        fn name(&self) -> &str;
        /// A fresh reader positioned at the first line.
        fn open(&self) -> io::Result<Box<dyn BufRead + '_>>;
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct FileSource {
        path: PathBuf,
        name: String,
    }

    impl FileSource {
        pub fn new(path: impl Into<PathBuf>) -> Self {
            let path = path.into();
            let name = path.display().to_string();
            Self { path, name }
        }

        pub fn path(&self) -> &Path {
            &self.path
        }
    }

    impl ContentSource for FileSource {
        fn name(&self) -> &str {
            &self.name
        }

        fn open(&self) -> io::Result<Box<dyn BufRead + '_>> {
            Ok(Box::new(BufReader::new(File::open(&self.path)?)))
        }
    }

    /// In-memory document (stdin, tests).
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct TextSource {
        name: String,
        text: String,
    }

    impl TextSource {
        pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
            Self {
                name: name.into(),
                text: text.into(),
            }
        }
    }

    impl ContentSource for TextSource {
        fn name(&self) -> &str {
            &self.name
        }

        fn open(&self) -> io::Result<Box<dyn BufRead + '_>> {
            Ok(Box::new(Cursor::new(self.text.as_bytes())))
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum Role {
        Tasks,
        Agenda,
        Archive,
    }

    /// Role -> sources mapping handed to the engine.
    #[derive(Default)]
    pub struct SourceSet {
        sources: IndexMap<Role, Vec<Box<dyn ContentSource>>>,
    }

    impl SourceSet {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn add(&mut self, role: Role, source: impl ContentSource + 'static) {
            self.sources.entry(role).or_default().push(Box::new(source));
        }

        pub fn with(mut self, role: Role, source: impl ContentSource + 'static) -> Self {
            self.add(role, source);
            self
        }

        pub fn role(&self, role: Role) -> impl Iterator<Item = &dyn ContentSource> + '_ {
            self.sources
                .get(&role)
                .into_iter()
                .flatten()
                .map(|s| &**s)
        }

        /// Task and agenda sources, in that order.
        pub fn primary(&self) -> impl Iterator<Item = &dyn ContentSource> + '_ {
            self.role(Role::Tasks).chain(self.role(Role::Agenda))
        }

        pub fn is_empty(&self) -> bool {
            self.sources.values().all(Vec::is_empty)
        }
    }

    impl fmt::Debug for SourceSet {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let mut map = f.debug_map();
            for (role, sources) in &self.sources {
                let names: Vec<&str> = sources.iter().map(|s| s.name()).collect();
                map.entry(role, &names);
            }
            map.finish()
        }
    }

    /// 0-based half-open line range; `end: None` reads to EOF.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LineWindow {
        pub start: usize,
        pub end: Option<usize>,
    }

    impl LineWindow {
        pub fn new(start: usize, end: Option<usize>) -> Self {
            Self { start, end }
        }

        pub fn sized(start: usize, size: usize) -> Self {
            Self::new(start, Some(start.saturating_add(size.max(1))))
        }

        fn is_past_end(&self, index: usize) -> bool {
            self.end.is_some_and(|end| index >= end)
        }
    }

    /// Text of the headings a window owns, plus the context found before it.
    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct WindowText {
        /// 0-based index of the first line of `text` in the source.
        pub first_line: usize,
        pub text: String,
        /// Enclosing headlines of the first heading, outermost first.
        pub ancestors: Vec<Ancestor>,
        pub file_tags: TagSet,
        /// Headline that starts the next window; `None` at EOF.
        pub next_start: Option<usize>,
    }

    impl WindowText {
        pub fn is_empty(&self) -> bool {
            self.text.is_empty()
        }
    }

    /// Lines of a reader with invalid UTF-8 replaced rather than rejected.
    /// Strips the `\n` or `\r\n` terminator.
    struct LossyLines<R> {
        reader: R,
        index: usize,
        buf: Vec<u8>,
    }

    impl<R: BufRead> LossyLines<R> {
        fn new(reader: R) -> Self {
            Self {
                reader,
                index: 0,
                buf: Vec::new(),
            }
        }
    }

    impl<R: BufRead> Iterator for LossyLines<R> {
        type Item = io::Result<String>;

        fn next(&mut self) -> Option<Self::Item> {
            self.buf.clear();
            match self.reader.read_until(b'\n', &mut self.buf) {
                Err(e) => return Some(Err(e)),
                Ok(0) => return None,
                Ok(_) => {}
            }
            if self.buf.last() == Some(&b'\n') {
                self.buf.pop();
                if self.buf.last() == Some(&b'\r') {
                    self.buf.pop();
                }
            }
            let index = self.index;
            self.index += 1;
            let line = match String::from_utf8(std::mem::take(&mut self.buf)) {
                Ok(line) => line,
                Err(e) => {
                    debug!(line = index + 1, "invalid UTF-8 replaced");
                    String::from_utf8_lossy(e.as_bytes()).into_owned()
                }
            };
            Some(Ok(line))
        }
    }

    pub fn read_window(source: &dyn ContentSource, window: LineWindow) -> io::Result<WindowText> {
        let reader = source.open()?;
        let mut out = WindowText::default();
        let mut outline: Vec<Ancestor> = Vec::new();
        let mut started = false;
        let mut seen_heading = false;

        for (index, line) in LossyLines::new(reader).enumerate() {
            let line = line?;
            let heading = match classify_line(&line) {
                LineKind::Heading(h) => {
                    seen_heading = true;
                    Some(h)
                }
                LineKind::Keyword { key, value } if key == "FILETAGS" && !seen_heading => {
                    out.file_tags.extend(parse_tag_list(&value));
                    None
                }
                _ => None,
            };

            match heading {
                Some(_) if window.is_past_end(index) => {
                    out.next_start = Some(index);
                    break;
                }
                Some(h) if !started && index >= window.start => {
                    started = true;
                    out.first_line = index;
                    outline.retain(|a| a.level < h.level);
                    out.ancestors = std::mem::take(&mut outline);
                }
                Some(h) if !started => {
                    outline.retain(|a| a.level < h.level);
                    outline.push(Ancestor {
                        level: h.level,
                        tags: h.tags,
                    });
                }
                _ => {}
            }
            if started {
                out.text.push_str(&line);
                out.text.push('\n');
            }
        }

        debug!(
            source = source.name(),
            start = window.start,
            end = ?window.end,
            first_line = out.first_line,
            bytes = out.text.len(),
            "read window"
        );
        Ok(out)
    }

    /// Consecutive non-empty windows of `size` lines until EOF.
    ///
    /// Each window reopens the source and scans from the top to rebuild its
    /// outline context, so a full pass reads the source once per window.
    /// Memory stays bounded by the window size.
    pub struct Windows<'s> {
        source: &'s dyn ContentSource,
        size: usize,
        next: Option<usize>,
    }

    impl Iterator for Windows<'_> {
        type Item = io::Result<WindowText>;

        fn next(&mut self) -> Option<Self::Item> {
            loop {
                let start = self.next?;
                match read_window(self.source, LineWindow::sized(start, self.size)) {
                    Err(e) => {
                        self.next = None;
                        return Some(Err(e));
                    }
                    Ok(window) => {
                        self.next = window.next_start;
                        if !window.is_empty() {
                            return Some(Ok(window));
                        }
                    }
                }
            }
        }
    }

    pub fn windows(source: &dyn ContentSource, size: usize) -> Windows<'_> {
        Windows {
            source,
            size,
            next: Some(0),
        }
    }

    /// A line containing the needle, with the headline that owns it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LineMatch {
        /// 0-based line index.
        pub index: usize,
        /// 0-based index of the owning headline; `None` in the preamble.
        pub heading_index: Option<usize>,
    }

    /// Streaming substring search over a source.
    pub fn matching_lines(source: &dyn ContentSource, needle: &str) -> io::Result<Vec<LineMatch>> {
        let reader = source.open()?;
        let mut matches = Vec::new();
        let mut heading_index = None;
        for (index, line) in LossyLines::new(reader).enumerate() {
            let line = line?;
            if line.starts_with('*') && matches!(classify_line(&line), LineKind::Heading(_)) {
                heading_index = Some(index);
            }
            if line.contains(needle) {
                matches.push(LineMatch {
                    index,
                    heading_index,
                });
            }
        }
        debug!(source = source.name(), needle, hits = matches.len(), "searched source");
        Ok(matches)
    }

}

pub mod config {
    //! Configuration loading: defaults, user config file, explicit file, env.

    use crate::core::{EngineError, OpenClockPolicy};
    use crate::source::{FileSource, Role, SourceSet};
    use chrono::NaiveDateTime;
    use figment::Figment;
    use figment::providers::{Env, Format, Serialized, Toml};
    use serde::{Deserialize, Serialize};
    use std::path::{Path, PathBuf};

    pub const DEFAULT_WINDOW_LINES: usize = 2000;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct Config {
        /// Primary task file.
        pub tasks: Option<PathBuf>,
        /// Primary agenda file.
        pub agenda: Option<PathBuf>,
        pub archives: Vec<PathBuf>,
        /// Lines per archive scan window.
        pub window_lines: usize,
        /// Count running clocks up to now.
        pub count_open_clocks: bool,
    }

    impl Default for Config {
        fn default() -> Self {
            Self {
                tasks: None,
                agenda: None,
                archives: Vec::new(),
                window_lines: DEFAULT_WINDOW_LINES,
                count_open_clocks: false,
            }
        }
    }

    impl Config {
        /// Provider stack: defaults, `config.toml` in the user config dir,
        /// `config_path`, then `ORGCLOCK_*` variables.
        pub fn figment(config_path: Option<&Path>) -> Figment {
            layered(config_dir().map(|d| d.join("config.toml")), config_path)
                .merge(Env::prefixed("ORGCLOCK_"))
        }

        pub fn load() -> Result<Self, figment::Error> {
            Self::load_from(None)
        }

        pub fn load_from(config_path: Option<&Path>) -> Result<Self, figment::Error> {
            Self::figment(config_path).extract()
        }

        pub fn validate(&self) -> Result<(), EngineError> {
            if self.window_lines == 0 {
                return Err(EngineError::Config("window_lines must be at least 1".into()));
            }
            Ok(())
        }

        /// Role mapping for the configured paths; missing files fail on read.
        pub fn sources(&self) -> SourceSet {
            let mut set = SourceSet::new();
            if let Some(path) = &self.tasks {
                set.add(Role::Tasks, FileSource::new(path));
            }
            if let Some(path) = &self.agenda {
                set.add(Role::Agenda, FileSource::new(path));
            }
            for path in &self.archives {
                set.add(Role::Archive, FileSource::new(path));
            }
            set
        }

        pub fn open_clock_policy(&self, now: NaiveDateTime) -> OpenClockPolicy {
            if self.count_open_clocks {
                OpenClockPolicy::CountUntil(now)
            } else {
                OpenClockPolicy::Exclude
            }
        }
    }

    fn layered(user_file: Option<PathBuf>, config_path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(file) = user_file {
            figment = figment.merge(Toml::file(file));
        }
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }
        figment
    }

    /// `orgclock` directory under the platform config dir.
    pub fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("orgclock"))
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::fs;

        #[test]
        fn defaults() {
            let config = layered(None, None).extract::<Config>().unwrap();
            assert_eq!(config, Config::default());
            assert_eq!(config.window_lines, 2000);
            assert!(config.validate().is_ok());
            assert!(config.sources().is_empty());
        }

        #[test]
        fn explicit_file_overrides_user_file() {
            let dir = tempfile::tempdir().unwrap();
            let user = dir.path().join("user.toml");
            let explicit = dir.path().join("explicit.toml");
            fs::write(&user, "tasks = \"/org/tasks.org\"\nwindow_lines = 500\n").unwrap();
            fs::write(
                &explicit,
                "window_lines = 100\narchives = [\"/org/a.org_archive\", \"/org/b.org_archive\"]\n",
            )
            .unwrap();

            let config: Config = layered(Some(user), Some(&explicit)).extract().unwrap();
            assert_eq!(config.tasks, Some(PathBuf::from("/org/tasks.org")));
            assert_eq!(config.window_lines, 100);
            assert_eq!(config.archives.len(), 2);

            let sources = config.sources();
            assert_eq!(sources.role(Role::Tasks).count(), 1);
            assert_eq!(sources.role(Role::Archive).count(), 2);
            assert_eq!(sources.role(Role::Agenda).count(), 0);
        }

        #[test]
        fn missing_user_file_is_ignored() {
            let dir = tempfile::tempdir().unwrap();
            let config: Config = layered(Some(dir.path().join("absent.toml")), None)
                .extract()
                .unwrap();
            assert_eq!(config, Config::default());
        }

        #[test]
        fn zero_window_is_rejected() {
            let config = Config {
                window_lines: 0,
                ..Config::default()
            };
            assert!(matches!(config.validate(), Err(EngineError::Config(_))));
        }

        #[test]
        fn open_clock_policy_follows_flag() {
            let now = chrono::NaiveDate::from_ymd_opt(2025, 11, 13)
                .unwrap()
                .and_hms_opt(12, 0, 0)
                .unwrap();
            assert_eq!(Config::default().open_clock_policy(now), OpenClockPolicy::Exclude);
            let counting = Config {
                count_open_clocks: true,
                ..Config::default()
            };
            assert_eq!(counting.open_clock_policy(now), OpenClockPolicy::CountUntil(now));
        }

        #[test]
        fn config_dir_ends_with_app_name() {
            if let Some(dir) = config_dir() {
                assert_eq!(dir.file_name().unwrap(), "orgclock");
            }
        }
    }
}

pub mod engine {
    //! Drives sources through the pipeline and decides when archives are read.

    use crate::aggregate::in_range;
    use crate::config::DEFAULT_WINDOW_LINES;
    use crate::core::*;
    use crate::records::{BuildOptions, RecordBuilder};
    use crate::source::{
        ContentSource, LineWindow, Role, SourceSet, WindowText, matching_lines, read_window, windows,
    };
    use crate::tokenizer::Tokenizer;
    use serde::Serialize;
    use std::collections::BTreeSet;
    use std::io;
    use tracing::debug;

    /// Records and warnings of one or more sources, in document order.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
    pub struct Analysis {
        pub records: Vec<ActivityRecord>,
        pub warnings: Vec<Warning>,
    }

    impl Analysis {
        pub fn extend(&mut self, other: Analysis) {
            self.records.extend(other.records);
            self.warnings.extend(other.warnings);
        }

        fn tagged(mut self, source: &str) -> Self {
            for warning in &mut self.warnings {
                warning.source = Some(source.to_string());
            }
            self
        }
    }

    fn run(mut tokenizer: Tokenizer<'_>, builder: RecordBuilder) -> Analysis {
        let blocks: Vec<HeadingBlock> = tokenizer.by_ref().collect();
        let mut builder = builder.with_file_tags(tokenizer.file_tags().clone());
        let records = blocks.into_iter().map(|b| builder.build(b)).collect();
        let mut warnings = tokenizer.into_warnings();
        warnings.extend(builder.into_warnings());
        warnings.sort_by_key(|w| w.line);
        Analysis { records, warnings }
    }

    /// Parse a whole document held in memory.
    pub fn analyze_text(text: &str, options: BuildOptions) -> Analysis {
        run(Tokenizer::new(text), RecordBuilder::new(options))
    }

    /// Parse one window, seeding the outline context read before it.
    pub fn analyze_window(window: &WindowText, options: BuildOptions) -> Analysis {
        let builder = RecordBuilder::new(options)
            .with_file_tags(window.file_tags.clone())
            .with_ancestors(window.ancestors.iter().cloned());
        run(Tokenizer::with_offset(&window.text, window.first_line), builder)
    }

    fn io_error(source: &dyn ContentSource, e: io::Error) -> EngineError {
        EngineError::Io {
            path: source.name().to_string(),
            source: e,
        }
    }

    /// Parse a source window by window; memory stays bounded by `window_lines`.
    pub fn analyze_source(
        source: &dyn ContentSource,
        window_lines: usize,
        options: BuildOptions,
    ) -> Result<Analysis, EngineError> {
        let mut analysis = Analysis::default();
        for window in windows(source, window_lines.max(1)) {
            let window = window.map_err(|e| io_error(source, e))?;
            analysis.extend(analyze_window(&window, options));
        }
        debug!(
            source = source.name(),
            records = analysis.records.len(),
            warnings = analysis.warnings.len(),
            "analyzed source"
        );
        Ok(analysis.tagged(source.name()))
    }

    /// When archive sources are read.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub enum ArchivePolicy {
        Never,
        /// Only when primary sources hold no in-range record, and then only the
        /// windows mentioning the range's months.
        #[default]
        IfNeeded,
        /// Every window of every archive.
        Always,
    }

    pub struct Engine {
        sources: SourceSet,
        options: BuildOptions,
        window_lines: usize,
    }

    impl Engine {
        pub fn new(sources: SourceSet) -> Self {
            Self {
                sources,
                options: BuildOptions::default(),
                window_lines: DEFAULT_WINDOW_LINES,
            }
        }

        pub fn with_options(mut self, options: BuildOptions) -> Self {
            self.options = options;
            self
        }

        pub fn with_window_lines(mut self, window_lines: usize) -> Self {
            self.window_lines = window_lines.max(1);
            self
        }

        pub fn sources(&self) -> &SourceSet {
            &self.sources
        }

        pub fn load_primary(&self) -> Result<Analysis, EngineError> {
            let mut analysis = Analysis::default();
            for source in self.sources.primary() {
                analysis.extend(analyze_source(source, self.window_lines, self.options)?);
            }
            Ok(analysis)
        }

        /// Every source, archives included, read in full.
        pub fn load_all(&self) -> Result<Analysis, EngineError> {
            let mut analysis = self.load_primary()?;
            for archive in self.sources.role(Role::Archive) {
                analysis.extend(analyze_source(archive, self.window_lines, self.options)?);
            }
            Ok(analysis)
        }

        /// Primary records plus whatever archive records `policy` calls for.
        pub fn collect(&self, range: &DateRange, policy: ArchivePolicy) -> Result<Analysis, EngineError> {
            let mut analysis = self.load_primary()?;
            let scan = match policy {
                ArchivePolicy::Never => false,
                ArchivePolicy::Always => true,
                ArchivePolicy::IfNeeded => !analysis.records.iter().any(|r| in_range(r, range)),
            };
            debug!(?policy, scan, "archive decision");
            if !scan {
                return Ok(analysis);
            }
            for archive in self.sources.role(Role::Archive) {
                let part = match policy {
                    ArchivePolicy::Always => analyze_source(archive, self.window_lines, self.options)?,
                    _ => self.scan_archive(archive, range)?,
                };
                analysis.extend(part);
            }
            Ok(analysis)
        }

        /// Read only the windows owning a line that mentions one of the range's months.
        fn scan_archive(&self, source: &dyn ContentSource, range: &DateRange) -> Result<Analysis, EngineError> {
            let size = self.window_lines;
            let mut starts = BTreeSet::new();
            for prefix in range.month_prefixes() {
                let hits = matching_lines(source, &prefix).map_err(|e| io_error(source, e))?;
                starts.extend(hits.iter().filter_map(|h| h.heading_index).map(|h| h / size * size));
            }
            debug!(source = source.name(), windows = starts.len(), "scanning archive windows");

            let mut analysis = Analysis::default();
            for start in starts {
                let window = read_window(source, LineWindow::sized(start, size))
                    .map_err(|e| io_error(source, e))?;
                analysis.extend(analyze_window(&window, self.options));
            }
            Ok(analysis.tagged(source.name()))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::source::{FileSource, TextSource};
        use chrono::NaiveDate;

        const TASKS: &str = "\
#+FILETAGS: :home:
* Projects :proj:
** TODO Garden
:LOGBOOK:
CLOCK: [2025-11-13 Thu 16:00]--[2025-11-13 Thu 16:45] =>  0:45
:END:
** Broken :x:y!:
:LOGBOOK:
CLOCK: [2025-11-13 Thu 18:00]--[2025-11-13 Thu 18:05] =>  0:30
CLOCK: garbage
:END:
* Inbox
Note
";

        const ARCHIVE: &str = "\
* Old :old:
** DONE Taxes
:LOGBOOK:
CLOCK: [2025-04-02 Wed 09:00]--[2025-04-02 Wed 11:00] =>  2:00
:END:
** DONE Move
:LOGBOOK:
CLOCK: [2025-06-10 Tue 09:00]--[2025-06-10 Tue 10:00] =>  1:00
:END:
** DONE Filing
:LOGBOOK:
CLOCK: [2025-04-20 Sun 10:00]--[2025-04-20 Sun 10:30] =>  0:30
:END:
";

        fn range(from: (i32, u32, u32), to: (i32, u32, u32)) -> DateRange {
            DateRange::new(
                NaiveDate::from_ymd_opt(from.0, from.1, from.2).unwrap(),
                NaiveDate::from_ymd_opt(to.0, to.1, to.2).unwrap(),
            )
            .unwrap()
        }

        fn titles(analysis: &Analysis) -> Vec<&str> {
            analysis.records.iter().map(ActivityRecord::title).collect()
        }

        fn engine() -> Engine {
            let sources = SourceSet::new()
                .with(Role::Tasks, TextSource::new("tasks.org", TASKS))
                .with(Role::Archive, TextSource::new("tasks.org_archive", ARCHIVE));
            Engine::new(sources).with_window_lines(4)
        }

        #[test]
        fn parsing_is_idempotent() {
            let a = analyze_text(TASKS, BuildOptions::default());
            let b = analyze_text(TASKS, BuildOptions::default());
            assert_eq!(a, b);
            assert_eq!(serde_json::to_string(&a).unwrap(), serde_json::to_string(&b).unwrap());
        }

        #[test]
        fn windowed_parse_matches_whole_file() {
            let whole = analyze_text(TASKS, BuildOptions::default());
            for size in [1, 2, 3, 5, 100] {
                let windowed =
                    analyze_source(&TextSource::new("tasks.org", TASKS), size, BuildOptions::default()).unwrap();
                assert_eq!(windowed.records, whole.records, "window size {size}");
                let lines: Vec<usize> = windowed.warnings.iter().map(|w| w.line).collect();
                let expected: Vec<usize> = whole.warnings.iter().map(|w| w.line).collect();
                assert_eq!(lines, expected, "window size {size}");
            }
        }

        #[test]
        fn warnings_carry_file_lines_and_source() {
            let analysis =
                analyze_source(&TextSource::new("tasks.org", TASKS), 3, BuildOptions::default()).unwrap();
            let rendered: Vec<String> = analysis.warnings.iter().map(ToString::to_string).collect();
            assert_eq!(rendered.len(), 3);
            assert!(rendered[0].starts_with("tasks.org:7: "));
            assert!(rendered[1].starts_with("tasks.org:9: "));
            assert!(rendered[2].starts_with("tasks.org:10: "));
            let garden = &analysis.records[1];
            assert_eq!(join_tags(&garden.effective_tags), "proj:home");
            assert_eq!(garden.total_clocked_minutes, 45);
        }

        #[test]
        fn archives_skipped_when_primary_covers_range() {
            let analysis = engine()
                .collect(&range((2025, 11, 10), (2025, 11, 17)), ArchivePolicy::IfNeeded)
                .unwrap();
            assert_eq!(titles(&analysis), vec!["Projects", "Garden", "Broken :x:y!:", "Inbox"]);
        }

        #[test]
        fn archive_windows_are_chosen_by_month() {
            let analysis = engine()
                .collect(&range((2025, 4, 1), (2025, 5, 1)), ArchivePolicy::IfNeeded)
                .unwrap();
            let titles = titles(&analysis);
            assert!(titles.contains(&"Taxes"));
            assert!(titles.contains(&"Filing"));
            assert!(!titles.contains(&"Move"));
            let taxes = analysis.records.iter().find(|r| r.title() == "Taxes").unwrap();
            assert_eq!(join_tags(&taxes.effective_tags), "old");
        }

        #[test]
        fn archive_policy_always_and_never() {
            let april = range((2025, 4, 1), (2025, 5, 1));
            let all = engine().collect(&april, ArchivePolicy::Always).unwrap();
            assert_eq!(all.records.len(), 8);
            let none = engine().collect(&april, ArchivePolicy::Never).unwrap();
            assert_eq!(none.records.len(), 4);
        }

        #[test]
        fn unreadable_source_is_fatal() {
            let dir = tempfile::tempdir().unwrap();
            let missing = dir.path().join("gone.org");
            let sources = SourceSet::new().with(Role::Tasks, FileSource::new(&missing));
            let err = Engine::new(sources).load_primary().unwrap_err();
            match err {
                EngineError::Io { path, source } => {
                    assert_eq!(path, missing.display().to_string());
                    assert_eq!(source.kind(), io::ErrorKind::NotFound);
                }
                other => panic!("unexpected error {other:?}"),
            }
        }

        #[test]
        fn stray_latin1_byte_keeps_the_file() {
            use std::io::Write;
            let mut file = tempfile::NamedTempFile::new().unwrap();
            file.write_all(
                b"* Work :work:\n:LOGBOOK:\n\
CLOCK: [2025-11-13 Thu 09:00]--[2025-11-13 Thu 10:00] =>  1:00\n:END:\n\
* Notes\ncaf\xE9\n",
            )
            .unwrap();
            let analysis =
                analyze_source(&FileSource::new(file.path()), 2000, BuildOptions::default()).unwrap();
            let titles: Vec<&str> = analysis.records.iter().map(|r| r.title()).collect();
            assert_eq!(titles, vec!["Work", "Notes"]);
            assert_eq!(analysis.records[0].total_clocked_minutes, 60);
            assert_eq!(analysis.records[1].block.body, "caf\u{FFFD}");
        }
    }
}
