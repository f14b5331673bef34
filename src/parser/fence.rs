//! Line-level scanning of generated text: markdown code fences, the
//! `var name = "value"` assignment lines and `*NAME_START` / `*NAME_END`
//! sentinel blocks.

/// Language tags recognised on an inline fence with no line break.
const FENCE_TAGS: &[&str] = &[
    "sql",
    "postgresql",
    "postgres",
    "pgsql",
    "psql",
    "plpgsql",
    "mongodb",
    "mongo",
    "javascript",
    "js",
    "go",
    "golang",
    "json",
    "bson",
    "text",
    "plaintext",
];

/// Return the body of the first fenced code block, or the trimmed text when
/// there is no fence.
///
/// Text before the opening fence (provider chatter) is discarded; a missing
/// closing fence keeps everything after the opening one.
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(open) = trimmed.find("```") else {
        return trimmed;
    };

    let after = strip_fence_tag(&trimmed[open + 3..]);
    let body = match after.find("```") {
        Some(close) => &after[..close],
        None => after,
    };
    body.trim()
}

/// Drop the info string after an opening fence.
///
/// When the fence is followed by a line break, the whole first line is the
/// info string whatever it says. Inline fences (```` ```sql SELECT 1``` ````)
/// only lose a leading known tag.
fn strip_fence_tag(text: &str) -> &str {
    if let Some(newline) = text.find('\n') {
        if !text[..newline].contains("```") {
            return &text[newline + 1..];
        }
    }
    let end = text
        .find(|c: char| c.is_whitespace())
        .unwrap_or(text.len());
    let tag = &text[..end];
    if !tag.is_empty() && FENCE_TAGS.iter().any(|t| t.eq_ignore_ascii_case(tag)) {
        &text[end..]
    } else {
        text
    }
}

/// Find the quoted value of an assignment such as `var collection = "orders"`.
///
/// `var`, `let` and `const` prefixes, `=` and `:=`, and double, single or
/// back quotes are all accepted. The first non-empty match wins.
pub fn assignment(text: &str, name: &str) -> Option<String> {
    text.lines().find_map(|line| assignment_in_line(line, name))
}

fn assignment_in_line(line: &str, name: &str) -> Option<String> {
    let mut rest = line.trim();
    for keyword in ["var ", "let ", "const "] {
        if let Some(stripped) = rest.strip_prefix(keyword) {
            rest = stripped.trim_start();
            break;
        }
    }

    let rest = rest.strip_prefix(name)?.trim_start();
    let rest = rest
        .strip_prefix(":=")
        .or_else(|| rest.strip_prefix('='))?
        .trim_start();

    let quote = rest.chars().next().filter(|c| matches!(*c, '"' | '\'' | '`'))?;
    let body = &rest[quote.len_utf8()..];
    let close = body.find(quote)?;
    let value = body[..close].trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Content between `*NAME_START` and `*NAME_END`, trimmed.
///
/// Returns `None` when the start sentinel is absent. When the end sentinel
/// is missing the block runs to the next sentinel line or the end of text.
pub fn block<'a>(text: &'a str, name: &str) -> Option<&'a str> {
    let start_marker = format!("*{}_START", name);
    let end_marker = format!("*{}_END", name);

    let start = text.find(&start_marker)? + start_marker.len();
    let rest = &text[start..];
    let end = rest
        .find(&end_marker)
        .or_else(|| next_sentinel(rest))
        .unwrap_or(rest.len());
    Some(rest[..end].trim())
}

fn next_sentinel(text: &str) -> Option<usize> {
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        let trimmed = line.trim_start();
        if trimmed.starts_with('*')
            && (trimmed.trim_end().ends_with("_START") || trimmed.trim_end().ends_with("_END"))
        {
            return Some(offset + (line.len() - trimmed.len()));
        }
        offset += line.len();
    }
    None
}
