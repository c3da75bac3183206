//! Recipe template expansion.
//!
//! Recipes are templates evaluated once, before TOML decoding. Actions are
//! written between `{{` and `}}`:
//!
//! - `{{ .name }}` substitutes the template variable `name` verbatim
//! - `{{ sector 2048 }}` converts a sector count to bytes (`1048576`)
//! - `{{ or .name "fallback" }}` yields the first non-empty argument
//!
//! Arguments may be variables, double-quoted strings or bare numbers, and
//! `sector` accepts any of them as long as it evaluates to an integer.

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;

/// Bytes per sector used by the `sector` helper.
pub const SECTOR_SIZE: u64 = 512;

/// Convert a sector count to a byte count.
pub fn sector(count: u64) -> Result<u64> {
    count
        .checked_mul(SECTOR_SIZE)
        .with_context(|| format!("sector count {} overflows a byte offset", count))
}

/// Expand `text` with `vars`, returning the literal recipe document.
pub fn expand(text: &str, vars: &BTreeMap<String, String>) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let line = line_of(text, text.len() - rest.len() + start);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            bail!("line {}: unclosed '{{{{' in recipe template", line);
        };
        let value = evaluate(after[..end].trim(), vars)
            .with_context(|| format!("line {}: evaluating '{{{{{}}}}}'", line, &after[..end]))?;
        out.push_str(&value);
        rest = &after[end + 2..];
    }

    out.push_str(rest);
    Ok(out)
}

fn line_of(text: &str, offset: usize) -> usize {
    text[..offset].matches('\n').count() + 1
}

#[derive(Debug, PartialEq, Eq)]
enum Token {
    Var(String),
    Str(String),
    Word(String),
}

fn tokenize(body: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = body.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        if c == '"' {
            chars.next();
            let mut literal = String::new();
            loop {
                match chars.next() {
                    Some('"') => break,
                    Some('\\') => match chars.next() {
                        Some('n') => literal.push('\n'),
                        Some('t') => literal.push('\t'),
                        Some(other) => literal.push(other),
                        None => bail!("unterminated string literal"),
                    },
                    Some(other) => literal.push(other),
                    None => bail!("unterminated string literal"),
                }
            }
            tokens.push(Token::Str(literal));
            continue;
        }

        let mut word = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_whitespace() || c == '"' {
                break;
            }
            word.push(c);
            chars.next();
        }
        match word.strip_prefix('.') {
            Some(name) if !name.is_empty() => tokens.push(Token::Var(name.to_string())),
            _ => tokens.push(Token::Word(word)),
        }
    }

    Ok(tokens)
}

fn resolve(token: &Token, vars: &BTreeMap<String, String>, optional: bool) -> Result<String> {
    match token {
        Token::Var(name) => match vars.get(name) {
            Some(value) => Ok(value.clone()),
            None if optional => Ok(String::new()),
            None => bail!("template variable '{}' is not set", name),
        },
        Token::Str(literal) => Ok(literal.clone()),
        Token::Word(word) if word.parse::<i64>().is_ok() => Ok(word.clone()),
        Token::Word(word) => bail!("unexpected '{}' as an argument", word),
    }
}

fn evaluate(body: &str, vars: &BTreeMap<String, String>) -> Result<String> {
    let tokens = tokenize(body)?;
    let Some((head, args)) = tokens.split_first() else {
        bail!("empty template action");
    };

    match head {
        Token::Word(func) if func == "sector" => {
            let [arg] = args else {
                bail!("sector takes exactly one argument, got {}", args.len());
            };
            let raw = resolve(arg, vars, false)?;
            let count: u64 = raw
                .trim()
                .parse()
                .with_context(|| format!("sector argument '{}' is not a count", raw))?;
            Ok(sector(count)?.to_string())
        }
        Token::Word(func) if func == "or" => {
            if args.is_empty() {
                bail!("or needs at least one argument");
            }
            let mut last = String::new();
            for arg in args {
                last = resolve(arg, vars, true)?;
                if !last.is_empty() {
                    break;
                }
            }
            Ok(last)
        }
        _ if args.is_empty() => resolve(head, vars, false),
        Token::Word(func) => bail!("unknown template function '{}'", func),
        _ => bail!("unexpected arguments after value"),
    }
}
