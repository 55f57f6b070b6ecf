use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::registry::DialectVocabulary;
use crate::statement_splitter::{ends_inside_literal, mask_literals, StatementType};

static CLAUSE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(select|from|where|group\s+by|order\s+by)\b").expect("valid pattern")
});
static FROM_KEYWORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bfrom\b").expect("valid pattern"));

const COMPARISON_OPERATORS: [&str; 9] = ["=~", "!~", ">=", "<=", "!=", "<>", "=", ">", "<"];

/// Words after which an operator makes no sense.
const RESERVED_WORDS: [&str; 24] = [
    "SELECT", "FROM", "WHERE", "GROUP", "ORDER", "BY", "AND", "OR", "NOT", "LIMIT", "OFFSET",
    "SLIMIT", "SOFFSET", "AS", "ON", "IN", "IS", "LIKE", "ASC", "DESC", "FILL", "ALIGN", "HAVING",
    "SHOW",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Clause {
    Select,
    From,
    Where,
    GroupBy,
    OrderBy,
}

impl Clause {
    fn parse(keyword: &str) -> Option<Self> {
        let normalized = keyword
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_ascii_uppercase();
        match normalized.as_str() {
            "SELECT" => Some(Self::Select),
            "FROM" => Some(Self::From),
            "WHERE" => Some(Self::Where),
            "GROUP BY" => Some(Self::GroupBy),
            "ORDER BY" => Some(Self::OrderBy),
            _ => None,
        }
    }
}

/// What surrounds the cursor in the statement being edited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletionContext {
    pub current_word: String,
    pub previous_word: Option<String>,
    pub statement_type: StatementType,
    pub current_clause: Option<Clause>,
    pub is_empty: bool,
    pub expects_keyword: bool,
    pub expects_value: bool,
    pub expects_operator: bool,
    pub in_string: bool,
    pub target_object: Option<String>,
}

fn is_word_char(ch: char) -> bool {
    ch.is_alphanumeric() || ch == '_' || ch == '.'
}

fn floor_char_boundary(text: &str, offset: usize) -> usize {
    let mut offset = offset.min(text.len());
    while !text.is_char_boundary(offset) {
        offset -= 1;
    }
    offset
}

/// Analyzes the statement around `cursor_offset` (a byte offset, clamped to
/// the text). Never fails.
#[must_use]
pub fn analyze_context(
    text: &str,
    cursor_offset: usize,
    vocabulary: &DialectVocabulary,
) -> CompletionContext {
    let cursor = floor_char_boundary(text, cursor_offset);
    let masked = mask_literals(text);

    let statement_start = masked[..cursor].rfind(';').map_or(0, |index| index + 1);
    let statement_end = masked[cursor..]
        .find(';')
        .map_or(text.len(), |index| cursor + index);

    let before = &text[statement_start..cursor];
    let masked_before = &masked[statement_start..cursor];

    let word_start = before
        .char_indices()
        .rev()
        .take_while(|(_, ch)| is_word_char(*ch))
        .last()
        .map_or(before.len(), |(index, _)| index);
    let current_word = before[word_start..].to_string();
    let ahead_of_word = masked_before[..word_start].trim_end();

    let previous_word = ahead_of_word
        .split(|ch: char| !is_word_char(ch))
        .rfind(|word| !word.is_empty())
        .map(str::to_string);

    let current_clause = CLAUSE
        .find_iter(masked_before)
        .filter_map(|found| Clause::parse(found.as_str()))
        .last();

    let is_empty = before.trim().is_empty();
    let ends_in_whitespace = before.ends_with(char::is_whitespace);

    let expects_keyword = is_empty
        || (current_word.is_empty() && ends_in_whitespace)
        || (!current_word.is_empty()
            && vocabulary.keywords.iter().any(|keyword| {
                keyword.len() > current_word.len()
                    && keyword
                        .get(..current_word.len())
                        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(&current_word))
            }));

    let expects_value = !ahead_of_word.ends_with("|>")
        && COMPARISON_OPERATORS
            .iter()
            .any(|operator| ahead_of_word.ends_with(operator));

    let expects_operator = current_word.is_empty()
        && ends_in_whitespace
        && trailing_identifier(masked_before.trim_end()).is_some_and(|identifier| {
            !RESERVED_WORDS
                .iter()
                .any(|reserved| reserved.eq_ignore_ascii_case(identifier))
        });

    CompletionContext {
        previous_word,
        statement_type: StatementType::detect(masked_before),
        current_clause,
        is_empty,
        expects_keyword,
        expects_value,
        expects_operator,
        in_string: ends_inside_literal(before),
        target_object: target_object(
            &text[statement_start..statement_end],
            &masked[statement_start..statement_end],
        ),
        current_word,
    }
}

/// Bare identifier the text ends with; numbers do not count.
fn trailing_identifier(text: &str) -> Option<&str> {
    let start = text
        .char_indices()
        .rev()
        .take_while(|(_, ch)| is_word_char(*ch))
        .last()
        .map(|(index, _)| index)?;
    let identifier = &text[start..];
    identifier
        .starts_with(|ch: char| ch.is_alphabetic() || ch == '_')
        .then_some(identifier)
}

/// Object named after the first `FROM`, with quotes removed and InfluxQL's
/// `db..measurement` collapsed to a dotted path.
fn target_object(statement: &str, masked: &str) -> Option<String> {
    // Quoted names are blank in `masked`, so the token is read from `statement`.
    let found = FROM_KEYWORD.find(masked)?;
    let rest = statement[found.end()..].trim_start();
    let token_end = rest
        .char_indices()
        .scan(false, |quoted, (index, ch)| {
            if ch == '"' {
                *quoted = !*quoted;
            }
            let boundary = !*quoted && (ch.is_whitespace() || matches!(ch, ';' | ',' | '(' | ')'));
            Some((index, boundary))
        })
        .find(|(_, boundary)| *boundary)
        .map_or(rest.len(), |(index, _)| index);

    let object = rest[..token_end].replace('"', "").replace("..", ".");
    let object = object.trim_matches('.');
    (!object.is_empty()).then(|| object.to_string())
}
