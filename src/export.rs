use unicode_width::UnicodeWidthStr;

use crate::value::{Map, Value};

/// Every key across `rows`, in first-seen order.
pub fn columns(rows: &[Map]) -> Vec<&str> {
    let mut names: Vec<&str> = Vec::new();
    for row in rows {
        for key in row.keys() {
            if !names.contains(&key) {
                names.push(key);
            }
        }
    }
    names
}

pub fn to_csv(rows: &[Map]) -> String {
    delimited(rows, ",", |s| csv_escape(&s))
}

pub fn to_tsv(rows: &[Map]) -> String {
    delimited(rows, "\t", |s| s.replace(['\t', '\n'], " "))
}

fn delimited(rows: &[Map], separator: &str, escape: impl Fn(String) -> String) -> String {
    let columns = columns(rows);
    let mut output = String::new();

    let headers: Vec<String> = columns.iter().map(|c| escape(c.to_string())).collect();
    output.push_str(&headers.join(separator));
    output.push('\n');

    for row in rows {
        let cells: Vec<String> = columns
            .iter()
            .map(|c| escape(row.get(c).map(cell_text).unwrap_or_default()))
            .collect();
        output.push_str(&cells.join(separator));
        output.push('\n');
    }

    output
}

pub fn to_json(rows: &[Map]) -> String {
    serde_json::to_string_pretty(rows).unwrap_or_else(|_| "[]".to_string())
}

/// Boxed plain-text grid sized by display width.
pub fn to_table(rows: &[Map]) -> String {
    let columns = columns(rows);
    if columns.is_empty() {
        return String::from("(no rows)\n");
    }

    let cells: Vec<Vec<String>> = rows
        .iter()
        .map(|row| {
            columns
                .iter()
                .map(|c| row.get(c).map(Value::display).unwrap_or_default())
                .map(|s| s.replace('\n', " "))
                .collect()
        })
        .collect();

    let mut widths: Vec<usize> = columns.iter().map(|c| c.width()).collect();
    for row in &cells {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.width());
        }
    }

    let rule = {
        let parts: Vec<String> = widths.iter().map(|w| "-".repeat(w + 2)).collect();
        format!("+{}+\n", parts.join("+"))
    };
    let line = |values: &[&str]| {
        let parts: Vec<String> = values
            .iter()
            .zip(&widths)
            .map(|(v, w)| format!(" {}{} ", v, " ".repeat(w - v.width())))
            .collect();
        format!("|{}|\n", parts.join("|"))
    };

    let mut output = rule.clone();
    output.push_str(&line(&columns));
    output.push_str(&rule);
    for row in &cells {
        let values: Vec<&str> = row.iter().map(String::as_str).collect();
        output.push_str(&line(&values));
    }
    output.push_str(&rule);
    output.push_str(&format!(
        "({} row{})\n",
        rows.len(),
        if rows.len() == 1 { "" } else { "s" }
    ));
    output
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        other => other.display(),
    }
}

fn csv_escape(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}
