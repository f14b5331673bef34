//! Literal tokenizer for the document-store mini-language.
//!
//! Generated blocks look like Go BSON literals (`bson.M{"a": 1}`,
//! `bson.D{{"a", 1}}`, `bson.A{1, 2}`) and occasionally like plain JSON.
//! Everything here works on a single left-to-right scan that tracks bracket
//! depth and quote state, so commas and colons inside strings or nested
//! literals never split an entry.
use tracing::warn;

use crate::value::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiteralKind {
    /// `key: value` entries.
    Mapping,
    /// `{key, value}` brace groups, order significant.
    PairList,
    /// Bare values.
    Sequence,
}

/// Recognised opening tokens. Longer tokens come before their prefixes.
const OPENERS: &[(&str, LiteralKind)] = &[
    ("map[string]interface{}{", LiteralKind::Mapping),
    ("map[string]any{", LiteralKind::Mapping),
    ("primitive.M{", LiteralKind::Mapping),
    ("bson.M{", LiteralKind::Mapping),
    ("primitive.D{", LiteralKind::PairList),
    ("bson.D{", LiteralKind::PairList),
    ("mongo.Pipeline{", LiteralKind::Sequence),
    ("[]interface{}{", LiteralKind::Sequence),
    ("[]any{", LiteralKind::Sequence),
    ("[]bson.M{", LiteralKind::Sequence),
    ("[]bson.D{", LiteralKind::Sequence),
    ("[]string{", LiteralKind::Sequence),
    ("[]int{", LiteralKind::Sequence),
    ("primitive.A{", LiteralKind::Sequence),
    ("bson.A{", LiteralKind::Sequence),
    ("{", LiteralKind::Mapping),
    ("[", LiteralKind::Sequence),
];

/// Go numeric conversions the provider sometimes wraps numbers in.
const NUMERIC_CASTS: &[&str] = &["int", "int32", "int64", "float32", "float64"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LiteralError {
    #[error("empty value")]
    Empty,
    #[error("unterminated string literal: {0}")]
    UnterminatedString(String),
    #[error("no key/value separator in entry: {0}")]
    MissingSeparator(String),
}

fn is_quote(ch: char) -> bool {
    matches!(ch, '"' | '\'' | '`')
}

/// Incremental scanner state shared by every depth-aware routine.
#[derive(Default)]
struct Scanner {
    depth: i32,
    quote: Option<char>,
    escaped: bool,
}

impl Scanner {
    /// Feed one character; returns true when it sits at depth zero outside
    /// any quoted string.
    fn step(&mut self, ch: char) -> bool {
        if let Some(q) = self.quote {
            if self.escaped {
                self.escaped = false;
            } else if ch == '\\' && q != '`' {
                self.escaped = true;
            } else if ch == q {
                self.quote = None;
            }
            return false;
        }
        match ch {
            c if is_quote(c) => {
                self.quote = Some(c);
                false
            }
            '{' | '[' | '(' => {
                self.depth += 1;
                false
            }
            '}' | ']' | ')' => {
                // A stray closer must not push later entries below depth zero.
                self.depth = (self.depth - 1).max(0);
                false
            }
            _ => self.depth == 0,
        }
    }
}

/// Split `content` into comma-separated entries at depth zero.
///
/// Entries are trimmed; empty ones (trailing commas) are skipped.
pub fn split_top_level(content: &str) -> Vec<&str> {
    let mut entries = Vec::new();
    let mut scanner = Scanner::default();
    let mut start = 0;

    for (i, ch) in content.char_indices() {
        if scanner.step(ch) && ch == ',' {
            push_entry(&mut entries, &content[start..i]);
            start = i + 1;
        }
    }
    push_entry(&mut entries, &content[start..]);
    entries
}

fn push_entry<'a>(entries: &mut Vec<&'a str>, raw: &'a str) {
    let entry = raw.trim();
    if !entry.is_empty() {
        entries.push(entry);
    }
}

/// Byte index of the first `target` at depth zero outside quotes.
pub fn find_top_level(content: &str, target: char) -> Option<usize> {
    let mut scanner = Scanner::default();
    content
        .char_indices()
        .find(|&(_, ch)| scanner.step(ch) && ch == target)
        .map(|(i, _)| i)
}

/// Index of the bracket closing the one at `open_idx`.
fn matching_close(text: &str, open_idx: usize) -> Option<usize> {
    let mut scanner = Scanner::default();
    for (i, ch) in text[open_idx..].char_indices() {
        let was_quoted = scanner.quote.is_some();
        scanner.step(ch);
        if !was_quoted && matches!(ch, '}' | ']' | ')') && scanner.depth == 0 {
            return Some(open_idx + i);
        }
    }
    None
}

/// Remove a recognised outer literal wrapper, returning its kind and body.
///
/// The wrapper must span the whole text: `bson.D{..}, bson.D{..}` is two
/// literals, not one. A literal whose closing bracket never arrives
/// (truncated output) is accepted up to the end of the text.
pub fn strip_wrapper(text: &str) -> Option<(LiteralKind, &str)> {
    let text = text.trim();
    let (opener, kind) = OPENERS
        .iter()
        .find(|(opener, _)| text.starts_with(opener))?;
    let open_idx = opener.len() - 1;
    match matching_close(text, open_idx) {
        Some(close) if close == text.len() - 1 => Some((*kind, &text[opener.len()..close])),
        Some(_) => None,
        None => Some((*kind, &text[opener.len()..])),
    }
}

/// Top-level entries of a literal, with its wrapper removed when present.
pub fn entries(literal: &str) -> Vec<&str> {
    match strip_wrapper(literal) {
        Some((_, body)) => split_top_level(body),
        None => split_top_level(literal),
    }
}

/// Strip the quotes from a string literal, resolving `\"` and `\\`.
///
/// Returns `None` when `text` is not a quoted literal and an error when the
/// closing quote is missing or followed by more text.
fn unquote(text: &str) -> Option<Result<String, LiteralError>> {
    let mut chars = text.char_indices();
    let (_, q) = chars.next().filter(|(_, c)| is_quote(*c))?;

    let mut out = String::with_capacity(text.len());
    let mut escaped = false;
    for (i, ch) in chars {
        if escaped {
            match ch {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                other => out.push(other),
            }
            escaped = false;
        } else if ch == '\\' && q != '`' {
            escaped = true;
        } else if ch == q {
            if text[i + ch.len_utf8()..].trim().is_empty() {
                return Some(Ok(out));
            }
            break;
        } else {
            out.push(ch);
        }
    }
    Some(Err(LiteralError::UnterminatedString(text.to_string())))
}

fn parse_key(raw: &str) -> String {
    let raw = raw.trim();
    match unquote(raw) {
        Some(Ok(key)) => key,
        _ => raw.trim_matches(is_quote).to_string(),
    }
}

/// Classify a single value literal.
///
/// Order: quoted string, `nil`/`null`, boolean, nested literal, integer,
/// float, and finally the raw text as a string.
pub fn parse_value(text: &str) -> Result<Value, LiteralError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(LiteralError::Empty);
    }

    if let Some(result) = unquote(text) {
        return result.map(Value::String);
    }

    match text {
        "nil" | "null" => return Ok(Value::Null),
        "true" => return Ok(Value::Bool(true)),
        "false" => return Ok(Value::Bool(false)),
        _ => {}
    }

    if let Some((kind, body)) = strip_wrapper(text) {
        return Ok(match kind {
            LiteralKind::Mapping => Value::Object(parse_mapping(body)),
            LiteralKind::PairList => Value::Object(parse_pair_list(body).into_iter().collect()),
            LiteralKind::Sequence => Value::Array(parse_sequence(body)),
        });
    }

    if let Some(inner) = strip_numeric_cast(text) {
        return parse_value(inner);
    }

    if let Ok(i) = text.parse::<i64>() {
        return Ok(Value::Int(i));
    }
    if let Ok(f) = text.parse::<f64>() {
        return Ok(Value::Float(f));
    }
    Ok(Value::String(text.to_string()))
}

fn strip_numeric_cast(text: &str) -> Option<&str> {
    let open = text.find('(')?;
    if !text.ends_with(')') || !NUMERIC_CASTS.contains(&&text[..open]) {
        return None;
    }
    Some(&text[open + 1..text.len() - 1])
}

/// Parse the body of a mapping literal (`"k": v, ...`).
///
/// Unparsable entries are logged and dropped.
pub fn parse_mapping(body: &str) -> Map {
    let mut map = Map::new();
    for entry in split_top_level(body) {
        match parse_mapping_entry(entry) {
            Ok((key, value)) => {
                map.insert(key, value);
            }
            Err(e) => warn!(error = %e, "dropping mapping entry"),
        }
    }
    map
}

fn parse_mapping_entry(entry: &str) -> Result<(String, Value), LiteralError> {
    let colon = find_top_level(entry, ':')
        .ok_or_else(|| LiteralError::MissingSeparator(entry.to_string()))?;
    let key = parse_key(&entry[..colon]);
    if key.is_empty() {
        return Err(LiteralError::MissingSeparator(entry.to_string()));
    }
    let value = parse_value(&entry[colon + 1..])?;
    Ok((key, value))
}

/// Parse the body of an ordered-pair list (`{"k", v}, ...`).
///
/// Besides `{"k", v}` this accepts `bson.E{Key: "k", Value: v}` and a bare
/// `"k": v`. Unparsable entries are logged and dropped.
pub fn parse_pair_list(body: &str) -> Vec<(String, Value)> {
    split_top_level(body)
        .into_iter()
        .filter_map(|entry| match parse_pair(entry) {
            Ok(pair) => Some(pair),
            Err(e) => {
                warn!(error = %e, "dropping ordered-pair entry");
                None
            }
        })
        .collect()
}

fn parse_pair(entry: &str) -> Result<(String, Value), LiteralError> {
    let group = entry
        .strip_prefix("bson.E")
        .or_else(|| entry.strip_prefix("primitive.E"))
        .unwrap_or(entry)
        .trim();

    let inner = match group.strip_prefix('{') {
        Some(rest) => rest.strip_suffix('}').unwrap_or(rest),
        None => return parse_mapping_entry(entry),
    };

    let comma = find_top_level(inner, ',')
        .ok_or_else(|| LiteralError::MissingSeparator(entry.to_string()))?;
    let (raw_key, raw_value) = (inner[..comma].trim(), inner[comma + 1..].trim());

    // bson.E{Key: "k", Value: v}
    if let (Some(k), Some(v)) = (
        raw_key.strip_prefix("Key:"),
        raw_value.strip_prefix("Value:"),
    ) {
        return Ok((parse_key(k), parse_value(v)?));
    }

    let key = parse_key(raw_key);
    if key.is_empty() {
        return Err(LiteralError::MissingSeparator(entry.to_string()));
    }
    Ok((key, parse_value(raw_value)?))
}

/// Parse the body of a sequence literal. Unparsable items are dropped.
pub fn parse_sequence(body: &str) -> Vec<Value> {
    split_top_level(body)
        .into_iter()
        .filter_map(|item| match parse_value(item) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(error = %e, "dropping sequence item");
                None
            }
        })
        .collect()
}

/// Parse a block body that should hold an ordered set of `(key, value)`
/// pairs, whichever literal form the provider chose.
pub fn parse_ordered(content: &str) -> Vec<(String, Value)> {
    match strip_wrapper(content) {
        Some((LiteralKind::PairList, body)) => parse_pair_list(body),
        Some((LiteralKind::Mapping, body)) => parse_mapping(body).into_iter().collect(),
        Some((LiteralKind::Sequence, body)) => parse_pair_list(body),
        None => parse_pair_list(content),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_split_respects_nesting_and_quotes() {
        let parts = entries(r#"{"a": "x,y", "b": {"c": 1}}"#);
        assert_eq!(parts, vec![r#""a": "x,y""#, r#""b": {"c": 1}"#]);
    }

    #[test]
    fn test_split_skips_trailing_comma() {
        assert_eq!(split_top_level(r#""a": 1, "b": 2,"#).len(), 2);
        assert!(split_top_level("   ").is_empty());
    }

    #[test]
    fn test_split_recovers_after_stray_closer() {
        let parts = split_top_level(r#""a": 1}, "b": 2, "c": 3"#);
        assert_eq!(parts, vec![r#""a": 1}"#, r#""b": 2"#, r#""c": 3"#]);
        assert_eq!(find_top_level(r#"}), "k": 1"#, ':'), Some(7));
    }

    #[test]
    fn test_split_handles_escaped_quotes() {
        let parts = split_top_level(r#""a": "say \"hi, there\"", "b": 2"#);
        assert_eq!(parts.len(), 2);
    }

    #[test]
    fn test_strip_wrapper_requires_whole_text() {
        assert_eq!(
            strip_wrapper(r#"bson.M{"a": 1}"#),
            Some((LiteralKind::Mapping, r#""a": 1"#))
        );
        assert_eq!(strip_wrapper(r#"bson.D{{"a", 1}}, bson.D{{"b", 2}}"#), None);
        assert_eq!(
            strip_wrapper(r#"mongo.Pipeline{bson.D{{"$limit", 5}}}"#),
            Some((LiteralKind::Sequence, r#"bson.D{{"$limit", 5}}"#))
        );
    }

    #[test]
    fn test_strip_wrapper_accepts_truncated_literal() {
        assert_eq!(
            strip_wrapper(r#"bson.M{"a": 1"#),
            Some((LiteralKind::Mapping, r#""a": 1"#))
        );
    }

    #[test]
    fn test_parse_value_classification() {
        assert_eq!(parse_value(r#""active""#), Ok(Value::from("active")));
        assert_eq!(parse_value("nil"), Ok(Value::Null));
        assert_eq!(parse_value("true"), Ok(Value::Bool(true)));
        assert_eq!(parse_value("42"), Ok(Value::Int(42)));
        assert_eq!(parse_value("-3.5"), Ok(Value::Float(-3.5)));
        assert_eq!(parse_value("int32(7)"), Ok(Value::Int(7)));
        assert_eq!(parse_value("$status"), Ok(Value::from("$status")));
        assert_eq!(parse_value("  "), Err(LiteralError::Empty));
    }

    #[test]
    fn test_parse_value_unterminated_string() {
        assert!(matches!(
            parse_value(r#""oops"#),
            Err(LiteralError::UnterminatedString(_))
        ));
    }

    #[test]
    fn test_parse_value_unescapes() {
        assert_eq!(
            parse_value(r#""a \"quoted\" word""#),
            Ok(Value::from(r#"a "quoted" word"#))
        );
    }

    #[test]
    fn test_parse_mapping_nested() {
        let map = parse_mapping(r#""age": bson.M{"$gte": 18, "$lt": 65.5}, "name": "x:y""#);
        let age = map.get("age").and_then(Value::as_object).unwrap();
        assert_eq!(age.get("$gte"), Some(&Value::Int(18)));
        assert_eq!(age.get("$lt"), Some(&Value::Float(65.5)));
        assert_eq!(map.get("name"), Some(&Value::from("x:y")));
    }

    #[test]
    fn test_parse_mapping_drops_bad_entries() {
        let map = parse_mapping(r#""ok": 1, garbage, "bad": "unterminated"#);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("ok"), Some(&Value::Int(1)));
    }

    #[test]
    fn test_parse_mapping_with_sequence_value() {
        let map = parse_mapping(r#""status": bson.M{"$in": bson.A{"a", "b"}}"#);
        let status = map.get("status").and_then(Value::as_object).unwrap();
        assert_eq!(
            status.get("$in"),
            Some(&Value::Array(vec![Value::from("a"), Value::from("b")]))
        );
    }

    #[test]
    fn test_parse_pair_list_forms() {
        let pairs = parse_pair_list(
            r#"{"created_at", -1}, bson.E{Key: "name", Value: 1}, "score": 1"#,
        );
        assert_eq!(
            pairs,
            vec![
                ("created_at".to_string(), Value::Int(-1)),
                ("name".to_string(), Value::Int(1)),
                ("score".to_string(), Value::Int(1)),
            ]
        );
    }

    #[test]
    fn test_parse_pair_list_nested_pair_list_value() {
        let pairs = parse_pair_list(
            r#"{"$group", bson.D{{"_id", "$status"}, {"count", bson.D{{"$sum", 1}}}}}"#,
        );
        assert_eq!(pairs.len(), 1);
        let group = pairs[0].1.as_object().unwrap();
        assert_eq!(group.keys().collect::<Vec<_>>(), vec!["_id", "count"]);
        let count = group.get("count").and_then(Value::as_object).unwrap();
        assert_eq!(count.get("$sum"), Some(&Value::Int(1)));
    }

    #[test]
    fn test_parse_ordered_accepts_mapping_form() {
        let pairs = parse_ordered(r#"bson.M{"a": 1, "b": -1}"#);
        assert_eq!(pairs[0], ("a".to_string(), Value::Int(1)));
        assert_eq!(pairs[1], ("b".to_string(), Value::Int(-1)));
    }

    #[test]
    fn test_json_style_literals() {
        let v = parse_value(r#"{"tags": ["a", "b"], "n": null}"#).unwrap();
        let obj = v.as_object().unwrap();
        assert_eq!(
            obj.get("tags"),
            Some(&Value::Array(vec![Value::from("a"), Value::from("b")]))
        );
        assert_eq!(obj.get("n"), Some(&Value::Null));
    }

    proptest! {
        #[test]
        fn prop_split_counts_top_level_entries(
            values in prop::collection::vec("[a-z ,{}:]{0,12}", 1..8)
        ) {
            // Every value is quoted, so commas and braces inside never split.
            let body = values
                .iter()
                .enumerate()
                .map(|(i, v)| format!("\"k{}\": \"{}\"", i, v))
                .collect::<Vec<_>>()
                .join(", ");
            prop_assert_eq!(split_top_level(&body).len(), values.len());
            prop_assert_eq!(parse_mapping(&body).len(), values.len());
        }
    }
}
