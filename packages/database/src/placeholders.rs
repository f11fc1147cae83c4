//! Placeholder normalization.
//!
//! Callers always write positional `?` placeholders (or `:name` through
//! [`named_to_positional`]). PostgreSQL wants `$1..$n`, which
//! [`question_marks_to_dollar`] produces. Quoted literals and quoted
//! identifiers are copied through untouched.

use crate::{DatabaseError, DatabaseValue};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Quote {
    None,
    Single,
    Double,
    Backtick,
}

impl Quote {
    const fn toggle(self, c: char) -> Self {
        match (self, c) {
            (Self::None, '\'') => Self::Single,
            (Self::None, '"') => Self::Double,
            (Self::None, '`') => Self::Backtick,
            (Self::Single, '\'') | (Self::Double, '"') | (Self::Backtick, '`') => Self::None,
            (state, _) => state,
        }
    }
}

/// Rewrites each `?` outside of quotes to `$1`, `$2`, ...
#[must_use]
pub fn question_marks_to_dollar(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut quote = Quote::None;
    let mut index = 0;

    for c in sql.chars() {
        if quote == Quote::None && c == '?' {
            index += 1;
            out.push('$');
            out.push_str(&index.to_string());
            continue;
        }
        quote = quote.toggle(c);
        out.push(c);
    }

    out
}

const fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

const fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Replaces `:name` placeholders with `?` and returns the values in the order
/// their placeholders appear. A name may be used more than once. PostgreSQL
/// `::type` casts are left alone.
///
/// # Errors
///
/// * If a placeholder names a parameter that was not supplied
pub fn named_to_positional(
    sql: &str,
    params: &[(&str, DatabaseValue)],
) -> Result<(String, Vec<DatabaseValue>), DatabaseError> {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut values = Vec::with_capacity(params.len());
    let mut quote = Quote::None;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if quote == Quote::None && c == ':' {
            let prev_is_colon = i > 0 && chars[i - 1] == ':';
            let next = chars.get(i + 1).copied();

            if next == Some(':') || prev_is_colon {
                out.push(c);
                i += 1;
                continue;
            }

            if next.is_some_and(is_ident_start) {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && is_ident_char(chars[end]) {
                    end += 1;
                }
                let name: String = chars[start..end].iter().collect();
                let value = params
                    .iter()
                    .find(|(param, _)| *param == name)
                    .map(|(_, value)| value.clone())
                    .ok_or_else(|| {
                        DatabaseError::InvalidParameters(format!("Missing parameter ':{name}'"))
                    })?;
                values.push(value);
                out.push('?');
                i = end;
                continue;
            }
        }

        quote = quote.toggle(c);
        out.push(c);
        i += 1;
    }

    Ok((out, values))
}
