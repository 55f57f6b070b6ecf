use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;

use crate::backend::{BackendType, DialectVersion, QueryLanguage};
use crate::completion_context::{analyze_context, Clause, CompletionContext};
use crate::registry::{BackendRegistry, DialectVocabulary, RegistryError};
use crate::schema_cache::{SchemaCache, SchemaCacheEntry};
use crate::statement_splitter::StatementType;

pub const DEFAULT_MAX_SUGGESTIONS: usize = 100;
const EXACT_MATCH_BONUS: u32 = 15;

const VALUE_SUGGESTIONS: [(&str, &str); 7] = [
    ("TRUE", "boolean true"),
    ("FALSE", "boolean false"),
    ("NULL", "missing value"),
    ("now()", "current server time"),
    ("now() - 1h", "one hour ago"),
    ("now() - 24h", "one day ago"),
    ("now() - 7d", "one week ago"),
];

const STATEMENT_STARTERS: [&str; 7] = [
    "SELECT", "SHOW", "CREATE", "DROP", "DELETE", "INSERT", "EXPLAIN",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionKind {
    Keyword,
    Function,
    Object,
    Field,
    Tag,
    Operator,
    Value,
}

impl SuggestionKind {
    #[must_use]
    pub fn base_priority(self) -> u32 {
        match self {
            Self::Keyword => 90,
            Self::Function => 80,
            Self::Object => 70,
            Self::Field => 60,
            Self::Tag => 55,
            Self::Operator => 50,
            Self::Value => 40,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Suggestion {
    pub label: String,
    pub insert_text: String,
    pub kind: SuggestionKind,
    pub priority: u32,
    pub description: Option<String>,
}

/// Orders by priority, then label, keeps the best-ranked entry per label and
/// truncates to `limit`.
#[must_use]
pub fn rank_suggestions(mut suggestions: Vec<Suggestion>, limit: usize) -> Vec<Suggestion> {
    suggestions.sort_by(|left, right| {
        right
            .priority
            .cmp(&left.priority)
            .then_with(|| left.label.cmp(&right.label))
    });

    let mut seen = HashSet::new();
    suggestions.retain(|suggestion| seen.insert(suggestion.label.clone()));
    suggestions.truncate(limit);
    suggestions
}

/// Collects candidates matching the word under the cursor.
struct Candidates<'a> {
    word: &'a str,
    suggestions: Vec<Suggestion>,
}

impl<'a> Candidates<'a> {
    fn new(word: &'a str) -> Self {
        Self {
            word,
            suggestions: Vec::new(),
        }
    }

    fn matches(&self, label: &str) -> bool {
        self.word.is_empty()
            || label
                .get(..self.word.len())
                .is_some_and(|prefix| prefix.eq_ignore_ascii_case(self.word))
    }

    fn push(
        &mut self,
        kind: SuggestionKind,
        label: &str,
        insert_text: String,
        description: Option<&str>,
    ) {
        if !self.matches(label) {
            return;
        }
        let bonus = if label.eq_ignore_ascii_case(self.word) {
            EXACT_MATCH_BONUS
        } else {
            0
        };
        self.suggestions.push(Suggestion {
            label: label.to_string(),
            insert_text,
            kind,
            priority: kind.base_priority() + bonus,
            description: description.map(str::to_string),
        });
    }

    fn keywords<'k>(&mut self, keywords: impl IntoIterator<Item = &'k str>) {
        for keyword in keywords {
            self.push(SuggestionKind::Keyword, keyword, keyword.to_string(), None);
        }
    }

    fn functions(&mut self, vocabulary: &DialectVocabulary) {
        for function in &vocabulary.functions {
            self.push(
                SuggestionKind::Function,
                function,
                format!("{function}()"),
                Some("function"),
            );
        }
    }

    fn operators(&mut self, vocabulary: &DialectVocabulary) {
        for operator in &vocabulary.operators {
            self.push(
                SuggestionKind::Operator,
                operator,
                format!("{operator} "),
                None,
            );
        }
    }

    fn values(&mut self) {
        for (label, description) in VALUE_SUGGESTIONS {
            self.push(SuggestionKind::Value, label, label.to_string(), Some(description));
        }
    }

    fn named<'n>(
        &mut self,
        kind: SuggestionKind,
        names: impl IntoIterator<Item = &'n str>,
        description: &str,
    ) {
        for name in names {
            self.push(kind, name, name.to_string(), Some(description));
        }
    }
}

/// Context-aware suggestions for one backend version.
#[derive(Debug)]
pub struct CompletionEngine {
    schema_cache: Arc<SchemaCache>,
    backend: BackendType,
    version: DialectVersion,
    vocabulary: DialectVocabulary,
    statement_delimited: bool,
    max_suggestions: usize,
}

impl CompletionEngine {
    pub fn new(
        registry: &BackendRegistry,
        schema_cache: Arc<SchemaCache>,
        backend: BackendType,
        version: DialectVersion,
    ) -> Result<Self, RegistryError> {
        let features = registry.get_features(backend, Some(&version))?;
        let statement_delimited = features
            .query_capabilities
            .primary_language()
            .map_or(true, QueryLanguage::is_statement_delimited);
        Ok(Self {
            schema_cache,
            backend,
            version,
            vocabulary: features.query_capabilities.vocabulary,
            statement_delimited,
            max_suggestions: DEFAULT_MAX_SUGGESTIONS,
        })
    }

    #[must_use]
    pub fn with_max_suggestions(mut self, max_suggestions: usize) -> Self {
        self.max_suggestions = max_suggestions;
        self
    }

    #[must_use]
    pub fn vocabulary(&self) -> &DialectVocabulary {
        &self.vocabulary
    }

    /// Suggestions for the cursor position in `text`.
    ///
    /// Schema lookups are best effort: when the cache cannot be refreshed
    /// the result falls back to the dialect vocabulary.
    pub async fn generate_suggestions(
        &self,
        connection_id: &str,
        database: Option<&str>,
        text: &str,
        cursor_offset: usize,
    ) -> Vec<Suggestion> {
        let context = analyze_context(text, cursor_offset, &self.vocabulary);
        if context.in_string {
            return Vec::new();
        }

        let schema = match database {
            Some(database) => match self.schema_cache.get(connection_id, database).await {
                Ok(entry) => entry,
                Err(error) => {
                    tracing::warn!(
                        backend = %self.backend,
                        version = %self.version,
                        connection_id,
                        database,
                        %error,
                        "schema unavailable, suggesting keywords only"
                    );
                    None
                }
            },
            None => None,
        };

        let suggestions = self.candidates(&context, schema.as_deref());
        rank_suggestions(suggestions, self.max_suggestions)
    }

    fn candidates(
        &self,
        context: &CompletionContext,
        schema: Option<&SchemaCacheEntry>,
    ) -> Vec<Suggestion> {
        let mut candidates = Candidates::new(&context.current_word);
        let vocabulary = &self.vocabulary;
        let target = context.target_object.as_deref();

        if context.expects_value {
            candidates.values();
            return candidates.suggestions;
        }
        if context.expects_operator && context.current_clause == Some(Clause::Where) {
            candidates.operators(vocabulary);
            candidates.keywords(["AND", "OR"]);
            return candidates.suggestions;
        }
        if context.is_empty {
            candidates.keywords(STATEMENT_STARTERS);
            return candidates.suggestions;
        }

        // A finished identifier that starts no keyword gets no keyword noise.
        let keyword_pool: &[String] =
            if context.expects_keyword || vocabulary.is_keyword(&context.current_word) {
                &vocabulary.keywords
            } else {
                &[]
            };
        let all_keywords = keyword_pool.iter().map(String::as_str);
        if !self.statement_delimited {
            // Pipelines have no clauses to anchor on.
            candidates.functions(vocabulary);
            push_objects(&mut candidates, schema);
            push_fields(&mut candidates, schema, target);
            candidates.keywords(all_keywords);
            return candidates.suggestions;
        }
        match (context.statement_type, context.current_clause) {
            (StatementType::Select, Some(Clause::Select)) => {
                candidates.functions(vocabulary);
                push_fields(&mut candidates, schema, target);
                candidates.keywords(all_keywords);
            }
            (_, Some(Clause::From)) => {
                push_objects(&mut candidates, schema);
                candidates.keywords(all_keywords);
            }
            (_, Some(Clause::Where)) => {
                push_fields(&mut candidates, schema, target);
                push_tags(&mut candidates, schema, target);
                candidates.functions(vocabulary);
                candidates.keywords(all_keywords);
            }
            (_, Some(Clause::GroupBy)) => {
                push_tags(&mut candidates, schema, target);
                push_fields(&mut candidates, schema, target);
                candidates.functions(vocabulary);
                candidates.keywords(all_keywords);
            }
            (_, Some(Clause::OrderBy)) => {
                push_fields(&mut candidates, schema, target);
                candidates.keywords(all_keywords);
            }
            (StatementType::Unknown, _) => {
                candidates.keywords(STATEMENT_STARTERS);
            }
            _ => {
                candidates.keywords(all_keywords);
                push_objects(&mut candidates, schema);
            }
        }
        candidates.suggestions
    }
}

fn push_objects(candidates: &mut Candidates<'_>, schema: Option<&SchemaCacheEntry>) {
    if let Some(schema) = schema {
        candidates.named(
            SuggestionKind::Object,
            schema.objects.iter().map(String::as_str),
            "object",
        );
    }
}

fn push_fields(
    candidates: &mut Candidates<'_>,
    schema: Option<&SchemaCacheEntry>,
    target: Option<&str>,
) {
    let Some(schema) = schema else {
        return;
    };
    match target {
        Some(target) => candidates.named(
            SuggestionKind::Field,
            schema.fields_of(target).iter().map(String::as_str),
            "field",
        ),
        None => candidates.named(SuggestionKind::Field, schema.all_fields(), "field"),
    }
}

fn push_tags(
    candidates: &mut Candidates<'_>,
    schema: Option<&SchemaCacheEntry>,
    target: Option<&str>,
) {
    if let (Some(schema), Some(target)) = (schema, target) {
        candidates.named(
            SuggestionKind::Tag,
            schema.tags_of(target).iter().map(String::as_str),
            "tag",
        );
    }
}
