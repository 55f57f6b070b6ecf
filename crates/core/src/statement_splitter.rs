use serde::Serialize;

const STATEMENT_KEYWORDS: [(&str, StatementType); 8] = [
    ("SELECT", StatementType::Select),
    ("INSERT", StatementType::Insert),
    ("UPDATE", StatementType::Update),
    ("DELETE", StatementType::Delete),
    ("CREATE", StatementType::Create),
    ("DROP", StatementType::Drop),
    ("SHOW", StatementType::Show),
    ("EXPLAIN", StatementType::Explain),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementType {
    Select,
    Insert,
    Update,
    Delete,
    Create,
    Drop,
    Show,
    Explain,
    Unknown,
}

impl StatementType {
    /// Classifies by case-insensitive keyword prefix.
    #[must_use]
    pub fn detect(statement: &str) -> Self {
        let trimmed = statement.trim_start();
        STATEMENT_KEYWORDS
            .iter()
            .find(|(keyword, _)| {
                trimmed
                    .get(..keyword.len())
                    .is_some_and(|prefix| prefix.eq_ignore_ascii_case(keyword))
            })
            .map_or(Self::Unknown, |(_, statement_type)| *statement_type)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedStatement {
    pub original: String,
    pub cleaned: String,
    pub is_empty: bool,
    pub statement_type: StatementType,
}

impl ParsedStatement {
    fn from_slice(raw: &str) -> Self {
        let cleaned = remove_comments(raw).trim().to_string();
        Self {
            original: raw.trim().to_string(),
            is_empty: cleaned.is_empty(),
            statement_type: StatementType::detect(&cleaned),
            cleaned,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Code,
    SingleQuote,
    DoubleQuote,
    LineComment,
    BlockComment,
    HtmlComment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegionKind {
    Code,
    Literal,
    Comment,
}

#[derive(Debug, Clone, Copy)]
struct Region {
    kind: RegionKind,
    start: usize,
    end: usize,
}

#[derive(Debug)]
struct Scan {
    regions: Vec<Region>,
    final_mode: Mode,
}

impl Mode {
    fn region_kind(self) -> RegionKind {
        match self {
            Self::Code => RegionKind::Code,
            Self::SingleQuote | Self::DoubleQuote => RegionKind::Literal,
            Self::LineComment | Self::BlockComment | Self::HtmlComment => RegionKind::Comment,
        }
    }
}

fn close(regions: &mut Vec<Region>, mode: Mode, start: usize, end: usize) {
    if end > start {
        regions.push(Region {
            kind: mode.region_kind(),
            start,
            end,
        });
    }
}

fn scan(text: &str) -> Scan {
    let mut regions = Vec::new();
    let mut mode = Mode::Code;
    let mut start = 0;
    let mut idx = 0;
    let mut escaped = false;

    while let Some(ch) = text[idx..].chars().next() {
        let rest = &text[idx..];
        match mode {
            Mode::Code => {
                let opened = if rest.starts_with("--") {
                    Some((Mode::LineComment, 2))
                } else if ch == '#' {
                    Some((Mode::LineComment, 1))
                } else if rest.starts_with("/*") {
                    Some((Mode::BlockComment, 2))
                } else if rest.starts_with("<!--") {
                    Some((Mode::HtmlComment, 4))
                } else if ch == '\'' && !escaped {
                    Some((Mode::SingleQuote, 1))
                } else if ch == '"' && !escaped {
                    Some((Mode::DoubleQuote, 1))
                } else {
                    None
                };

                if let Some((next_mode, width)) = opened {
                    close(&mut regions, mode, start, idx);
                    start = idx;
                    mode = next_mode;
                    idx += width;
                    escaped = false;
                    continue;
                }
                escaped = ch == '\\' && !escaped;
                idx += ch.len_utf8();
            }
            Mode::SingleQuote | Mode::DoubleQuote => {
                let quote = if mode == Mode::SingleQuote { '\'' } else { '"' };
                idx += ch.len_utf8();
                if ch == quote && !escaped {
                    close(&mut regions, mode, start, idx);
                    start = idx;
                    mode = Mode::Code;
                    escaped = false;
                    continue;
                }
                escaped = ch == '\\' && !escaped;
            }
            Mode::LineComment => {
                if ch == '\n' {
                    close(&mut regions, mode, start, idx);
                    start = idx;
                    mode = Mode::Code;
                    continue;
                }
                idx += ch.len_utf8();
            }
            Mode::BlockComment | Mode::HtmlComment => {
                let terminator = if mode == Mode::BlockComment { "*/" } else { "-->" };
                if rest.starts_with(terminator) {
                    idx += terminator.len();
                    close(&mut regions, mode, start, idx);
                    start = idx;
                    mode = Mode::Code;
                    continue;
                }
                idx += ch.len_utf8();
            }
        }
    }
    close(&mut regions, mode, start, text.len());

    Scan {
        regions,
        final_mode: mode,
    }
}

/// Splits `text` into statements on `;` outside of quotes and comments.
///
/// Never fails: unbalanced quotes or comments simply swallow the rest of
/// the input into the last statement.
#[must_use]
pub fn split_statements(text: &str) -> Vec<ParsedStatement> {
    let mut statements = Vec::new();
    let mut statement_start = 0;

    for region in scan(text).regions {
        if region.kind != RegionKind::Code {
            continue;
        }
        for (offset, ch) in text[region.start..region.end].char_indices() {
            if ch == ';' {
                let end = region.start + offset + 1;
                statements.push(ParsedStatement::from_slice(&text[statement_start..end]));
                statement_start = end;
            }
        }
    }

    let trailing = &text[statement_start..];
    if !trailing.trim().is_empty() {
        statements.push(ParsedStatement::from_slice(trailing));
    }
    statements
}

/// Drops every comment, keeping string literals and the newline that ends a
/// line comment.
#[must_use]
pub fn remove_comments(text: &str) -> String {
    let mut cleaned = String::with_capacity(text.len());
    for region in scan(text).regions {
        if region.kind != RegionKind::Comment {
            cleaned.push_str(&text[region.start..region.end]);
        }
    }
    cleaned
}

/// Returns a copy of `text` with the same byte length in which literals and
/// comments are blanked out with spaces, so keyword searches on the result
/// map back onto `text` one-to-one.
#[must_use]
pub fn mask_literals(text: &str) -> String {
    let mut masked = String::with_capacity(text.len());
    for region in scan(text).regions {
        let slice = &text[region.start..region.end];
        if region.kind == RegionKind::Code {
            masked.push_str(slice);
        } else {
            masked.extend(std::iter::repeat(' ').take(slice.len()));
        }
    }
    masked
}

/// Byte offset just past the last code or literal character of `text`;
/// everything after it is comments and whitespace.
#[must_use]
pub fn code_end(text: &str) -> usize {
    scan(text)
        .regions
        .iter()
        .rev()
        .find_map(|region| match region.kind {
            RegionKind::Comment => None,
            RegionKind::Literal => Some(region.end),
            RegionKind::Code => {
                let kept = text[region.start..region.end].trim_end();
                (!kept.is_empty()).then(|| region.start + kept.len())
            }
        })
        .unwrap_or(0)
}

/// Whether the end of `text` sits inside an unterminated string literal.
#[must_use]
pub fn ends_inside_literal(text: &str) -> bool {
    matches!(
        scan(text).final_mode,
        Mode::SingleQuote | Mode::DoubleQuote
    )
}

#[cfg(test)]
mod tests {
    use super::{
        code_end, ends_inside_literal, mask_literals, remove_comments, split_statements,
        StatementType,
    };

    #[test]
    fn semicolon_inside_literal_is_not_a_boundary() {
        let statements = split_statements("SELECT 'a;b' FROM t; SELECT 2;");

        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0].original, "SELECT 'a;b' FROM t;");
        assert_eq!(statements[1].original, "SELECT 2;");
        for statement in &statements {
            assert_eq!(statement.original.matches('\'').count() % 2, 0);
            assert_eq!(statement.statement_type, StatementType::Select);
        }
    }

    #[test]
    fn double_quoted_identifier_keeps_semicolon() {
        let statements = split_statements(r#"SELECT "we;ird" FROM "cpu";SHOW DATABASES"#);
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0].cleaned, r#"SELECT "we;ird" FROM "cpu";"#);
        assert_eq!(statements[1].statement_type, StatementType::Show);
    }

    #[test]
    fn escaped_quote_does_not_close_literal() {
        let statements = split_statements(r"SELECT 'it\'s;fine' FROM t; DROP DATABASE x");
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[1].statement_type, StatementType::Drop);
    }

    #[test]
    fn remove_comments_preserves_newline_after_line_comment() {
        let cleaned = remove_comments("SELECT 1; -- comment\nSELECT 2;");
        assert_eq!(cleaned, "SELECT 1; \nSELECT 2;");

        let statements = split_statements(&cleaned);
        assert_eq!(statements.len(), 2);
        assert!(statements.iter().all(|statement| !statement.is_empty));
    }

    #[test]
    fn all_comment_styles_hide_separators() {
        let text = "SELECT 1 /* a; b */ FROM t;\n# skip; this\nSHOW MEASUREMENTS <!-- x; y -->;";
        let statements = split_statements(text);

        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0].cleaned, "SELECT 1  FROM t;");
        assert_eq!(statements[1].cleaned, "SHOW MEASUREMENTS ;");
        assert_eq!(statements[1].statement_type, StatementType::Show);
    }

    #[test]
    fn comment_only_statement_is_marked_empty() {
        let statements = split_statements("SELECT 1; -- trailing note");
        assert_eq!(statements.len(), 2);
        assert!(statements[1].is_empty);
        assert_eq!(statements[1].statement_type, StatementType::Unknown);
    }

    #[test]
    fn trailing_statement_without_semicolon_is_emitted() {
        let statements = split_statements("CREATE DATABASE a;\n  explain select 1  ");
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[1].original, "explain select 1");
        assert_eq!(statements[1].statement_type, StatementType::Explain);
    }

    #[test]
    fn blank_input_produces_no_statements() {
        assert!(split_statements("  \n\t ").is_empty());
    }

    #[test]
    fn unterminated_literal_degrades_to_single_statement() {
        let statements = split_statements("SELECT 'open; SELECT 2;");
        assert_eq!(statements.len(), 1);
        assert!(ends_inside_literal("SELECT 'open"));
        assert!(!ends_inside_literal("SELECT 'closed'"));
    }

    #[test]
    fn mask_keeps_byte_length_and_hides_literals() {
        let text = "SELECT * FROM t WHERE host = 'limit 5' -- LIMIT 9\n";
        let masked = mask_literals(text);

        assert_eq!(masked.len(), text.len());
        assert!(!masked.contains("limit"));
        assert!(!masked.contains("LIMIT"));
        assert!(masked.starts_with("SELECT * FROM t WHERE host = "));
    }

    #[test]
    fn code_end_stops_before_trailing_comments() {
        let text = "SELECT * FROM t -- recent rows";
        assert_eq!(&text[..code_end(text)], "SELECT * FROM t");

        let text = "SELECT * FROM t WHERE host = 'a -- b' /* x */ \n# y";
        assert_eq!(&text[..code_end(text)], "SELECT * FROM t WHERE host = 'a -- b'");

        assert_eq!(code_end("-- only a note"), 0);
    }

    #[test]
    fn statement_type_order_follows_keyword_list() {
        assert_eq!(StatementType::detect("  insert into x"), StatementType::Insert);
        assert_eq!(StatementType::detect("update x"), StatementType::Update);
        assert_eq!(StatementType::detect("DELETE FROM x"), StatementType::Delete);
        assert_eq!(StatementType::detect("ALTER x"), StatementType::Unknown);
    }
}
