//! Placeholder scanning and rendering.
//!
//! Statements are written with either positional (`$1`, `$2`, ...) or named
//! (`:key`) placeholders. Before a statement reaches a backend it is rewritten
//! into the engine's native placeholder syntax and the parameters are laid out
//! in the order the engine expects. Unknown names are rejected here, so a
//! statement with an undefined parameter never reaches the engine.
//!
//! The scanner understands just enough SQL to avoid false positives: string
//! literals, quoted identifiers, comments, PostgreSQL dollar-quoted bodies and
//! `::` casts are copied through untouched.

use crate::error::{DbError, DbResult};
use crate::models::{Param, Params};

/// Native placeholder syntax of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    /// `$1`, `$2` (PostgreSQL)
    Dollar,
    /// `?1`, `?2` (SQLite)
    NumberedQuestion,
    /// `?` per occurrence (MySQL)
    Question,
}

/// A statement rewritten for a specific backend.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundQuery {
    pub sql: String,
    /// Arguments in the order the rewritten statement consumes them.
    pub args: Vec<Param>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Text(String),
    Positional(usize),
    Named(String),
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Whether the quote at `i` opens a PostgreSQL `E'...'` escape string.
fn is_escape_string(chars: &[char], i: usize) -> bool {
    i >= 1
        && matches!(chars[i - 1], 'E' | 'e')
        && (i == 1 || !is_ident_char(chars[i - 2]))
}

/// Split `sql` into literal text and placeholders.
///
/// With `backslash_escapes` set, `\` escapes the next character inside
/// quoted strings, as MySQL does by default.
fn scan(sql: &str, backslash_escapes: bool) -> DbResult<Vec<Token>> {
    let chars: Vec<char> = sql.chars().collect();
    let mut tokens = Vec::new();
    let mut text = String::new();
    let mut i = 0;

    let flush = |text: &mut String, tokens: &mut Vec<Token>| {
        if !text.is_empty() {
            tokens.push(Token::Text(std::mem::take(text)));
        }
    };

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' | '"' | '`' => {
                // Quoted run; a doubled quote is an escaped quote
                let escapes = match c {
                    '`' => false,
                    '\'' => backslash_escapes || is_escape_string(&chars, i),
                    _ => backslash_escapes,
                };
                text.push(c);
                i += 1;
                while i < chars.len() {
                    text.push(chars[i]);
                    if escapes && chars[i] == '\\' {
                        if let Some(&next) = chars.get(i + 1) {
                            text.push(next);
                        }
                        i += 2;
                        continue;
                    }
                    if chars[i] == c {
                        if i + 1 < chars.len() && chars[i + 1] == c {
                            text.push(c);
                            i += 2;
                            continue;
                        }
                        i += 1;
                        break;
                    }
                    i += 1;
                }
            }
            '-' if chars.get(i + 1) == Some(&'-') => {
                while i < chars.len() && chars[i] != '\n' {
                    text.push(chars[i]);
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                text.push_str("/*");
                i += 2;
                while i < chars.len() {
                    if chars[i] == '*' && chars.get(i + 1) == Some(&'/') {
                        text.push_str("*/");
                        i += 2;
                        break;
                    }
                    text.push(chars[i]);
                    i += 1;
                }
            }
            ':' if chars.get(i + 1) == Some(&':') => {
                text.push_str("::");
                i += 2;
            }
            ':' if chars.get(i + 1).copied().is_some_and(is_ident_start) => {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && is_ident_char(chars[end]) {
                    end += 1;
                }
                flush(&mut text, &mut tokens);
                tokens.push(Token::Named(chars[start..end].iter().collect()));
                i = end;
            }
            '$' if chars.get(i + 1).is_some_and(|c| c.is_ascii_digit()) => {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && chars[end].is_ascii_digit() {
                    end += 1;
                }
                let digits: String = chars[start..end].iter().collect();
                let index: usize = digits
                    .parse()
                    .map_err(|_| DbError::binding(format!("invalid placeholder ${digits}")))?;
                if index == 0 {
                    return Err(DbError::binding("positional placeholders start at $1"));
                }
                flush(&mut text, &mut tokens);
                tokens.push(Token::Positional(index));
                i = end;
            }
            '$' if chars
                .get(i + 1)
                .is_some_and(|&c| c == '$' || is_ident_start(c)) =>
            {
                // Possible dollar-quoted body: $tag$ ... $tag$
                let mut end = i + 1;
                while end < chars.len() && is_ident_char(chars[end]) {
                    end += 1;
                }
                if chars.get(end) == Some(&'$') {
                    let tag: String = chars[i..=end].iter().collect();
                    let tag_chars: Vec<char> = tag.chars().collect();
                    text.push_str(&tag);
                    i = end + 1;
                    loop {
                        if i >= chars.len() {
                            break;
                        }
                        if chars[i..].starts_with(&tag_chars) {
                            text.push_str(&tag);
                            i += tag_chars.len();
                            break;
                        }
                        text.push(chars[i]);
                        i += 1;
                    }
                } else {
                    text.push(c);
                    i += 1;
                }
            }
            _ => {
                text.push(c);
                i += 1;
            }
        }
    }
    flush(&mut text, &mut tokens);
    Ok(tokens)
}

fn cast_suffix(param: &Param) -> String {
    match param {
        Param::Typed {
            type_name,
            schema: Some(schema),
            ..
        } => format!("::{}.{}", schema, type_name),
        Param::Typed { type_name, .. } => format!("::{}", type_name),
        Param::Value(_) => String::new(),
    }
}

/// Rewrite `sql` for a backend and order `params` to match.
///
/// With `cast_typed` set, placeholders bound to typed parameters are followed
/// by an explicit cast to the parameter's type name.
pub fn bind(
    sql: &str,
    params: &Params,
    style: PlaceholderStyle,
    cast_typed: bool,
) -> DbResult<BoundQuery> {
    let tokens = scan(sql, style == PlaceholderStyle::Question)?;
    let has_positional = tokens.iter().any(|t| matches!(t, Token::Positional(_)));
    let has_named = tokens.iter().any(|t| matches!(t, Token::Named(_)));

    if has_positional && has_named {
        return Err(DbError::binding(
            "positional ($n) and named (:key) placeholders cannot be mixed in one statement",
        ));
    }

    // Resolve every placeholder to (native index, param)
    let mut order: Vec<String> = Vec::new();
    let mut resolved: Vec<(usize, &Param)> = Vec::new();
    for token in &tokens {
        match token {
            Token::Text(_) => {}
            Token::Positional(n) => {
                let values: &[Param] = match params {
                    Params::Positional(values) => values.as_slice(),
                    Params::Named(_) => {
                        return Err(DbError::binding(
                            "positional placeholders require a sequence of values, not a mapping",
                        ));
                    }
                    Params::None => &[],
                };
                let param = values.get(n - 1).ok_or_else(|| {
                    DbError::binding(format!(
                        "${} referenced but only {} values supplied",
                        n,
                        values.len()
                    ))
                })?;
                resolved.push((*n, param));
            }
            Token::Named(name) => {
                let param = match params {
                    Params::Named(map) => map.get(name),
                    Params::Positional(_) => {
                        return Err(DbError::binding(
                            "named placeholders require a mapping of values, not a sequence",
                        ));
                    }
                    Params::None => None,
                }
                .ok_or_else(|| DbError::undefined_parameter(name.clone()))?;
                let index = match order.iter().position(|n| n == name) {
                    Some(idx) => idx + 1,
                    None => {
                        order.push(name.clone());
                        order.len()
                    }
                };
                resolved.push((index, param));
            }
        }
    }

    if !has_named {
        if let Params::Positional(values) = params {
            let highest = resolved.iter().map(|(n, _)| *n).max().unwrap_or(0);
            if values.len() > highest {
                return Err(DbError::binding(format!(
                    "{} values supplied but the statement references {}",
                    values.len(),
                    highest
                )));
            }
        }
    }

    let mut sql_out = String::with_capacity(sql.len());
    let mut args: Vec<Param> = Vec::new();
    let mut placeholders = resolved.into_iter();
    for token in tokens {
        match token {
            Token::Text(text) => sql_out.push_str(&text),
            Token::Positional(_) | Token::Named(_) => {
                let (index, param) = placeholders
                    .next()
                    .ok_or_else(|| DbError::internal("placeholder resolution out of step"))?;
                match style {
                    PlaceholderStyle::Dollar => sql_out.push_str(&format!("${}", index)),
                    PlaceholderStyle::NumberedQuestion => sql_out.push_str(&format!("?{}", index)),
                    PlaceholderStyle::Question => {
                        sql_out.push('?');
                        args.push(param.clone());
                    }
                }
                if cast_typed {
                    sql_out.push_str(&cast_suffix(param));
                }
                if style != PlaceholderStyle::Question {
                    if args.len() < index {
                        args.resize(index, Param::Value(crate::models::Value::Null));
                    }
                    args[index - 1] = param.clone();
                }
            }
        }
    }

    // Numbered styles consume the caller's list as-is, gaps included
    if style != PlaceholderStyle::Question && has_positional {
        if let Params::Positional(values) = params {
            args = values.clone();
        }
    }

    Ok(BoundQuery { sql: sql_out, args })
}
