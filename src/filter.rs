//! Gmail-flavoured filter expressions
//!
//! A rule's `filter` string is parsed once, when the configuration is loaded,
//! into a [`FilterExpr`]: a conjunction of possibly negated terms. Evaluation
//! against a [`Message`] is pure and deterministic for a given `now`.
//!
//! ```text
//! from:billing@ subject:"your bill" -label:Paid older_than:2w
//! subject:/^\[(jira|github)\]/ -any:unsubscribe
//! ```

use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use std::fmt;

use crate::models::Message;
use crate::rules::CompiledRule;

/// Failure to parse a filter string, reported without the rule name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterSyntaxError(pub String);

impl fmt::Display for FilterSyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

type ParseResult<T> = std::result::Result<T, FilterSyntaxError>;

fn syntax(msg: impl Into<String>) -> FilterSyntaxError {
    FilterSyntaxError(msg.into())
}

/// Message text a term can look at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextField {
    Sender,
    Recipients,
    Subject,
    Body,
    /// Sender, recipients, subject or body
    Any,
}

impl TextField {
    fn keyword(&self) -> &'static str {
        match self {
            TextField::Sender => "from",
            TextField::Recipients => "to",
            TextField::Subject => "subject",
            TextField::Body => "body",
            TextField::Any => "any",
        }
    }
}

#[derive(Debug, Clone)]
pub enum TextPattern {
    /// Case-insensitive substring, stored lower-cased
    Contains(String),
    /// Case-insensitive regex search
    Regex(Regex),
}

impl TextPattern {
    fn is_match(&self, haystack: &str) -> bool {
        match self {
            TextPattern::Contains(needle) => haystack.to_lowercase().contains(needle.as_str()),
            TextPattern::Regex(re) => re.is_match(haystack),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    Important,
    Inbox,
}

/// A single `(field, operator, value)` condition
#[derive(Debug, Clone)]
pub enum Condition {
    Text { field: TextField, pattern: TextPattern },
    Label(String),
    Flag(Flag),
    /// At least this many days old
    OlderThan(i64),
    /// Strictly fewer than this many days old
    NewerThan(i64),
}

impl Condition {
    fn evaluate(&self, message: &Message, now: DateTime<Utc>) -> bool {
        match self {
            Condition::Text { field, pattern } => match field {
                TextField::Sender => pattern.is_match(&message.sender),
                TextField::Recipients => pattern.is_match(&message.recipients_text()),
                TextField::Subject => pattern.is_match(&message.subject),
                TextField::Body => pattern.is_match(&message.snippet),
                TextField::Any => {
                    pattern.is_match(&message.sender)
                        || pattern.is_match(&message.recipients_text())
                        || pattern.is_match(&message.subject)
                        || pattern.is_match(&message.snippet)
                }
            },
            Condition::Label(name) => message.has_label(name),
            Condition::Flag(Flag::Important) => message.is_important,
            Condition::Flag(Flag::Inbox) => message.in_inbox,
            Condition::OlderThan(days) => message.age_days(now) >= *days,
            Condition::NewerThan(days) => message.age_days(now) < *days,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Term {
    pub negated: bool,
    pub condition: Condition,
}

/// Parsed filter: every term must hold
#[derive(Debug, Clone)]
pub struct FilterExpr {
    source: String,
    terms: Vec<Term>,
}

impl FilterExpr {
    pub fn parse(source: &str) -> ParseResult<Self> {
        let terms = Parser::new(source).parse_terms()?;
        if terms.is_empty() {
            return Err(syntax("filter has no terms"));
        }
        Ok(Self {
            source: source.trim().to_string(),
            terms,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    pub fn evaluate(&self, message: &Message, now: DateTime<Utc>) -> bool {
        self.terms
            .iter()
            .all(|t| t.condition.evaluate(message, now) != t.negated)
    }

    /// Gmail search string that narrows the server-side listing
    ///
    /// Only terms Gmail evaluates exactly as we do are emitted (labels and
    /// flags), plus age bounds widened by one day. Text terms are left to the
    /// client-side matcher because Gmail tokenises words where we match
    /// substrings. The result never excludes a message `evaluate` accepts.
    pub fn search_query(&self) -> String {
        let mut parts = Vec::new();
        for term in &self.terms {
            let rendered = match &term.condition {
                Condition::Label(name) => Some(format!("label:{}", quote_label(name))),
                Condition::Flag(Flag::Important) => Some("is:important".to_string()),
                Condition::Flag(Flag::Inbox) => Some("in:inbox".to_string()),
                Condition::OlderThan(days) if !term.negated && *days > 1 => {
                    Some(format!("older_than:{}d", days.saturating_sub(1)))
                }
                Condition::NewerThan(days) if !term.negated => {
                    Some(format!("newer_than:{}d", days.saturating_add(1)))
                }
                _ => None,
            };
            if let Some(part) = rendered {
                if term.negated {
                    parts.push(format!("-{}", part));
                } else {
                    parts.push(part);
                }
            }
        }
        parts.join(" ")
    }
}

impl fmt::Display for FilterExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn quote_label(name: &str) -> String {
    if name.chars().any(|c| c.is_whitespace() || c == '"') {
        format!("\"{}\"", name.replace('"', "\\\""))
    } else {
        name.to_string()
    }
}

/// Evaluates compiled rules against messages at a fixed instant
#[derive(Debug, Clone, Copy)]
pub struct RuleMatcher {
    now: DateTime<Utc>,
}

impl RuleMatcher {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now }
    }

    pub fn matches(&self, message: &Message, rule: &CompiledRule) -> bool {
        rule.filter.evaluate(message, self.now)
    }
}

enum RawValue {
    Plain(String),
    Quoted(String),
    Regex(String),
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn parse_terms(&mut self) -> ParseResult<Vec<Term>> {
        let mut terms = Vec::new();
        loop {
            self.skip_whitespace();
            let Some(c) = self.peek() else { break };

            if matches!(c, '(' | ')' | '{' | '}') {
                return Err(syntax(format!(
                    "grouping with '{}' is not supported; terms are always combined with AND",
                    c
                )));
            }

            let negated = c == '-';
            if negated {
                self.pos += 1;
                if self.peek().map_or(true, char::is_whitespace) {
                    return Err(syntax("'-' must be followed by a term"));
                }
            }

            if let Some(term) = self.parse_term(negated)? {
                terms.push(term);
            }
        }
        Ok(terms)
    }

    /// Returns None for the no-op `AND` keyword
    fn parse_term(&mut self, negated: bool) -> ParseResult<Option<Term>> {
        match self.peek() {
            Some('"') | Some('/') => {
                let value = self.parse_value()?;
                let condition = text_condition(TextField::Any, value)?;
                return Ok(Some(Term { negated, condition }));
            }
            _ => {}
        }

        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_alphanumeric() || c == '_')
        {
            self.pos += 1;
        }
        let word: String = self.chars[start..self.pos].iter().collect();

        if self.peek() == Some(':') && !word.is_empty() {
            self.pos += 1;
            let value = self.parse_value()?;
            let condition = field_condition(&word, value)?;
            return Ok(Some(Term { negated, condition }));
        }

        // Bare word: rewind and read up to whitespace
        self.pos = start;
        let value = self.read_plain();
        if !negated {
            match value.as_str() {
                "AND" => return Ok(None),
                "OR" => return Err(syntax("'OR' is not supported; terms are always combined with AND")),
                _ => {}
            }
        }
        if value.is_empty() {
            return Err(syntax(format!(
                "unexpected character '{}'",
                self.peek().unwrap_or(' ')
            )));
        }
        let condition = text_condition(TextField::Any, RawValue::Plain(value))?;
        Ok(Some(Term { negated, condition }))
    }

    fn read_plain(&mut self) -> String {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| !c.is_whitespace() && !matches!(c, '(' | ')' | '{' | '}'))
        {
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }

    fn parse_value(&mut self) -> ParseResult<RawValue> {
        match self.peek() {
            Some('"') => {
                self.pos += 1;
                Ok(RawValue::Quoted(self.read_delimited('"', "quoted value")?))
            }
            Some('/') => {
                self.pos += 1;
                Ok(RawValue::Regex(self.read_delimited('/', "regular expression")?))
            }
            Some(c) if !c.is_whitespace() => Ok(RawValue::Plain(self.read_plain())),
            _ => Err(syntax("missing value after ':'")),
        }
    }

    /// Reads up to the closing delimiter; `\<delim>` escapes it
    fn read_delimited(&mut self, delim: char, what: &str) -> ParseResult<String> {
        let mut out = String::new();
        loop {
            match self.peek() {
                None => return Err(syntax(format!("unterminated {}", what))),
                Some('\\') if self.chars.get(self.pos + 1) == Some(&delim) => {
                    out.push(delim);
                    self.pos += 2;
                }
                Some(c) if c == delim => {
                    self.pos += 1;
                    return Ok(out);
                }
                Some(c) => {
                    out.push(c);
                    self.pos += 1;
                }
            }
        }
    }
}

fn field_condition(field: &str, value: RawValue) -> ParseResult<Condition> {
    match field.to_ascii_lowercase().as_str() {
        "from" | "sender" => text_condition(TextField::Sender, value),
        "to" => text_condition(TextField::Recipients, value),
        "subject" => text_condition(TextField::Subject, value),
        "body" | "snippet" => text_condition(TextField::Body, value),
        "any" => text_condition(TextField::Any, value),
        "label" => match value {
            RawValue::Plain(v) | RawValue::Quoted(v) if !v.trim().is_empty() => {
                Ok(Condition::Label(v.trim().to_string()))
            }
            RawValue::Regex(_) => Err(syntax("label: does not accept a regular expression")),
            _ => Err(syntax("label: needs a label name")),
        },
        "is" | "in" => {
            let v = plain_only(field, value)?.to_ascii_lowercase();
            match (field.to_ascii_lowercase().as_str(), v.as_str()) {
                ("is", "important") => Ok(Condition::Flag(Flag::Important)),
                ("is", "inbox") | ("in", "inbox") => Ok(Condition::Flag(Flag::Inbox)),
                _ => Err(syntax(format!("unsupported flag '{}:{}'", field, v))),
            }
        }
        "older_than" => Ok(Condition::OlderThan(parse_days(&plain_only(field, value)?)?)),
        "newer_than" => Ok(Condition::NewerThan(parse_days(&plain_only(field, value)?)?)),
        other => Err(syntax(format!("unknown field '{}'", other))),
    }
}

fn plain_only(field: &str, value: RawValue) -> ParseResult<String> {
    match value {
        RawValue::Plain(v) | RawValue::Quoted(v) => Ok(v),
        RawValue::Regex(_) => Err(syntax(format!(
            "{}: does not accept a regular expression",
            field
        ))),
    }
}

fn text_condition(field: TextField, value: RawValue) -> ParseResult<Condition> {
    let pattern = match value {
        RawValue::Plain(v) | RawValue::Quoted(v) => {
            if v.is_empty() {
                return Err(syntax(format!("{}: has an empty value", field.keyword())));
            }
            TextPattern::Contains(v.to_lowercase())
        }
        RawValue::Regex(src) => {
            if src.is_empty() {
                return Err(syntax(format!("{}: has an empty regular expression", field.keyword())));
            }
            let re = RegexBuilder::new(&src)
                .case_insensitive(true)
                .build()
                .map_err(|e| syntax(format!("invalid regular expression /{}/: {}", src, e)))?;
            TextPattern::Regex(re)
        }
    };
    Ok(Condition::Text { field, pattern })
}

/// Longest age a filter may name: 100 years
pub const MAX_AGE_DAYS: i64 = 36_500;

/// `N` followed by d, w, m (30 days) or y (365 days)
fn parse_days(value: &str) -> ParseResult<i64> {
    let bad = || syntax(format!("invalid duration '{}', expected e.g. 7d, 2w, 3m or 1y", value));
    let unit = value.chars().last().ok_or_else(bad)?;
    let count: i64 = value[..value.len() - unit.len_utf8()]
        .parse()
        .map_err(|_| bad())?;
    if count < 0 {
        return Err(bad());
    }
    let per_unit = match unit.to_ascii_lowercase() {
        'd' => 1,
        'w' => 7,
        'm' => 30,
        'y' => 365,
        _ => return Err(bad()),
    };
    match count.checked_mul(per_unit) {
        Some(days) if days <= MAX_AGE_DAYS => Ok(days),
        _ => Err(syntax(format!(
            "duration '{}' is longer than {} days",
            value, MAX_AGE_DAYS
        ))),
    }
}
