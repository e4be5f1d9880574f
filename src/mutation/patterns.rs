//! The mutation pattern table.
//!
//! Every [`MutationKind`] owns one or more [`PatternRule`]s. A rule pairs a
//! regex (compiled once, when the table is built) with a replacement for the
//! span it matches: capture group 1 when present, else the whole match. The
//! table is built at startup and shared by reference.

use super::MutationKind;
use crate::language::Language;
use regex::Regex;
use std::ops::Range;

/// Produces the replacement text for a matched span, or `None` to skip it.
pub type ReplaceFn = fn(&str) -> Option<String>;

/// How a rule rewrites the span it matched.
#[derive(Clone, Copy)]
pub enum Replacement {
    Fixed(&'static str),
    With(ReplaceFn),
}

impl Replacement {
    fn produce(&self, original: &str) -> Option<String> {
        match self {
            Replacement::Fixed(text) => Some((*text).to_string()),
            Replacement::With(f) => f(original),
        }
    }
}

/// Extra check on the whole match (`text`, match range) the regex alone can't express.
pub type AcceptFn = fn(&str, Range<usize>) -> bool;

/// One compiled substitution rule.
pub struct PatternRule {
    pub name: &'static str,
    pub kind: MutationKind,
    regex: Regex,
    replace: Replacement,
    accept: AcceptFn,
    /// Languages the rule applies to. Empty means every language.
    languages: &'static [Language],
}

/// A span of source text and the text that replaces it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternMatch {
    pub span: Range<usize>,
    pub replacement: String,
}

impl PatternRule {
    pub fn applies_to(&self, language: Language) -> bool {
        self.languages.is_empty() || self.languages.contains(&language)
    }

    /// All non-overlapping matches in `text`, each with its replacement.
    ///
    /// Matches whose replacement equals the original span are dropped.
    pub fn find_matches(&self, text: &str) -> Vec<PatternMatch> {
        self.regex
            .captures_iter(text)
            .filter_map(|caps| {
                let whole = caps.get(0)?;
                if !(self.accept)(text, whole.range()) {
                    return None;
                }
                let target = caps.get(1).unwrap_or(whole);
                let original = target.as_str();
                let replacement = self.replace.produce(original)?;
                (replacement != original).then(|| PatternMatch {
                    span: target.range(),
                    replacement,
                })
            })
            .collect()
    }
}

impl std::fmt::Debug for PatternRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatternRule")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("pattern", &self.regex.as_str())
            .finish()
    }
}

/// The full, compiled rule set.
#[derive(Debug)]
pub struct PatternTable {
    rules: Vec<PatternRule>,
}

const RUST: &[Language] = &[Language::Rust];
const PYTHON: &[Language] = &[Language::Python];
const TYPESCRIPT: &[Language] = &[Language::TypeScript];
const C_LIKE: &[Language] = &[Language::Rust, Language::TypeScript, Language::Generic];
const PY_TS: &[Language] = &[Language::Python, Language::TypeScript];
const TS_GENERIC: &[Language] = &[Language::TypeScript, Language::Generic];
const ANY: &[Language] = &[];

fn always(_: &str, _: Range<usize>) -> bool {
    true
}

/// Reject digits that belong to a float literal (`1.5`, `.5`, `1.`).
fn not_float(text: &str, range: Range<usize>) -> bool {
    let bytes = text.as_bytes();
    let before = range.start.checked_sub(1).map(|i| bytes[i]);
    let after = bytes.get(range.end).copied();
    let after_next = bytes.get(range.end + 1).copied();
    if before == Some(b'.') {
        return false;
    }
    !(after == Some(b'.') && after_next.is_some_and(|b| b.is_ascii_digit()))
}

/// Only index expressions: the `[` must follow an identifier, `)` or `]`.
fn is_index_expr(text: &str, range: Range<usize>) -> bool {
    range
        .start
        .checked_sub(1)
        .and_then(|i| text.as_bytes().get(i))
        .is_some_and(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b')' | b']'))
}

fn increment_literal(s: &str) -> Option<String> {
    s.parse::<u128>()
        .ok()
        .and_then(|n| n.checked_add(1))
        .map(|n| n.to_string())
}

fn shift_index(s: &str) -> Option<String> {
    Some(format!("{} + 1", s))
}

fn broaden_exception(s: &str) -> Option<String> {
    (s != "BaseException").then(|| "BaseException".to_string())
}

fn empty_string(_: &str) -> Option<String> {
    Some(String::new())
}

fn rust_default_return(s: &str) -> Option<String> {
    (s.trim() != "Default::default()").then(|| "Default::default()".to_string())
}

fn force_is_err(s: &str) -> Option<String> {
    Some(format!("{} || true", s))
}

fn force_not_ok(s: &str) -> Option<String> {
    Some(format!("{} && false", s))
}

fn python_none_return(s: &str) -> Option<String> {
    (s.trim() != "None").then(|| "None".to_string())
}

fn ts_undefined_return(s: &str) -> Option<String> {
    (s.trim() != "undefined").then(|| "undefined".to_string())
}

/// Uncompiled form of a rule.
struct RuleSpec {
    name: &'static str,
    kind: MutationKind,
    pattern: &'static str,
    replace: Replacement,
    accept: AcceptFn,
    languages: &'static [Language],
}

fn spec(
    name: &'static str,
    kind: MutationKind,
    pattern: &'static str,
    replace: Replacement,
    accept: AcceptFn,
    languages: &'static [Language],
) -> RuleSpec {
    RuleSpec {
        name,
        kind,
        pattern,
        replace,
        accept,
        languages,
    }
}

impl PatternTable {
    /// Compile every rule. Called once per run.
    pub fn compile() -> Result<Self, regex::Error> {
        use Replacement::{Fixed, With};

        let specs = vec![
            // Boundary shift: strict <-> inclusive
            spec("lt_to_le", MutationKind::BoundaryShift, r"\s(<)\s", Fixed("<="), always, ANY),
            spec("le_to_lt", MutationKind::BoundaryShift, r"\s(<=)\s", Fixed("<"), always, ANY),
            spec("gt_to_ge", MutationKind::BoundaryShift, r"\s(>)\s", Fixed(">="), always, ANY),
            spec("ge_to_gt", MutationKind::BoundaryShift, r"\s(>=)\s", Fixed(">"), always, ANY),
            // Boolean logic inversion
            spec("eq_to_ne", MutationKind::BooleanInversion, r"\s(==)\s", Fixed("!="), always, ANY),
            spec("ne_to_eq", MutationKind::BooleanInversion, r"\s(!=)\s", Fixed("=="), always, ANY),
            spec("strict_eq_to_ne", MutationKind::BooleanInversion, r"\s(===)\s", Fixed("!=="), always, TYPESCRIPT),
            spec("strict_ne_to_eq", MutationKind::BooleanInversion, r"\s(!==)\s", Fixed("==="), always, TYPESCRIPT),
            spec("and_to_or", MutationKind::BooleanInversion, r"\s(&&)\s", Fixed("||"), always, C_LIKE),
            spec("or_to_and", MutationKind::BooleanInversion, r"\s(\|\|)\s", Fixed("&&"), always, C_LIKE),
            spec("true_to_false", MutationKind::BooleanInversion, r"\b(true)\b", Fixed("false"), always, C_LIKE),
            spec("false_to_true", MutationKind::BooleanInversion, r"\b(false)\b", Fixed("true"), always, C_LIKE),
            spec("py_true_to_false", MutationKind::BooleanInversion, r"\b(True)\b", Fixed("False"), always, PYTHON),
            spec("py_false_to_true", MutationKind::BooleanInversion, r"\b(False)\b", Fixed("True"), always, PYTHON),
            spec("py_and_to_or", MutationKind::BooleanInversion, r"\s(and)\s", Fixed("or"), always, PYTHON),
            spec("py_or_to_and", MutationKind::BooleanInversion, r"\s(or)\s", Fixed("and"), always, PYTHON),
            // Off by one: integer literals and index expressions
            spec("int_literal_inc", MutationKind::OffByOne, r"\b(\d+)\b", With(increment_literal), not_float, ANY),
            spec("index_shift", MutationKind::OffByOne, r"\[([A-Za-z_]\w*)\]", With(shift_index), is_index_expr, ANY),
            // Exception handling weakening
            spec("broaden_except", MutationKind::ExceptionWeakening, r"\bexcept\s+([A-Za-z_][\w.]*)", With(broaden_exception), always, PYTHON),
            spec("swallow_question_mark", MutationKind::ExceptionWeakening, r"(?m)^\s*[\w.:]+\([^;\n]*\)(\?);\s*$", Fixed(".ok()"), always, RUST),
            // Error path injection
            spec("force_is_err", MutationKind::ErrorPathInjection, r"(\.is_err\(\))", With(force_is_err), always, RUST),
            spec("force_not_ok", MutationKind::ErrorPathInjection, r"(\.is_ok\(\))", With(force_not_ok), always, RUST),
            spec("py_error_branch", MutationKind::ErrorPathInjection, r"\bif\s+(\w*(?i:err)\w*)\s*:", Fixed("True"), always, PYTHON),
            spec("c_error_branch", MutationKind::ErrorPathInjection, r"\bif\s*\(\s*(!?\s*\w*(?i:err)\w*)\s*\)", Fixed("true"), always, TS_GENERIC),
            // Constant mutation
            spec("string_emptied", MutationKind::ConstantMutation, r#""([^"\\\n]+)""#, With(empty_string), always, ANY),
            spec("single_quoted_emptied", MutationKind::ConstantMutation, r"'([^'\\\n]{2,})'", With(empty_string), always, PY_TS),
            // Early return
            spec("return_default", MutationKind::EarlyReturn, r"\breturn[ \t]+([^;\n]+);", With(rust_default_return), always, RUST),
            spec("return_none", MutationKind::EarlyReturn, r"(?m)\breturn[ \t]+([^\n#]*[^\s#])", With(python_none_return), always, PYTHON),
            spec("return_undefined", MutationKind::EarlyReturn, r"\breturn[ \t]+([^;\n]+);", With(ts_undefined_return), always, TYPESCRIPT),
        ];

        let rules = specs
            .into_iter()
            .map(|s| {
                Ok::<_, regex::Error>(PatternRule {
                    name: s.name,
                    kind: s.kind,
                    regex: Regex::new(s.pattern)?,
                    replace: s.replace,
                    accept: s.accept,
                    languages: s.languages,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!("Compiled {} mutation pattern rules", rules.len());
        Ok(Self { rules })
    }

    /// Rules for the given kinds that apply to `language`, in table order.
    pub fn rules_for<'a>(
        &'a self,
        kinds: &'a [MutationKind],
        language: Language,
    ) -> impl Iterator<Item = &'a PatternRule> + 'a {
        self.rules
            .iter()
            .filter(move |r| kinds.contains(&r.kind) && r.applies_to(language))
    }

    /// Whether any rule of `kind` applies to `language`.
    pub fn supports(&self, kind: MutationKind, language: Language) -> bool {
        self.rules
            .iter()
            .any(|r| r.kind == kind && r.applies_to(language))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }
}
