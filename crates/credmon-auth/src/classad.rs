//! Minimal ClassAd reader for key files
//!
//! Key files are written upstream as a sequence of ClassAds, either in the
//! bracketed new-style syntax (`[ Provider = "box"; LocalUser = "alice" ]`)
//! or the line-oriented old-style syntax (one `Name = value` per line, ads
//! separated by blank lines). Only literal values are interpreted; any other
//! expression is kept as raw text. Attribute names are case-insensitive.

use crate::error::{Error, Result};

/// A literal attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Integer(i64),
    Real(f64),
    Boolean(bool),
    Undefined,
    /// Anything that is not a literal, stored verbatim.
    Expr(String),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

/// One parsed ad. Assignment order is preserved; a repeated attribute
/// replaces the earlier value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassAd {
    attrs: Vec<(String, Value)>,
}

impl ClassAd {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.attrs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// String-valued attribute lookup. `undefined` reads as absent; any other
    /// non-string value is a parse error.
    pub fn get_str(&self, name: &str) -> Result<Option<&str>> {
        match self.get(name) {
            None | Some(Value::Undefined) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(other) => Err(Error::Parse(format!(
                "attribute {name} must be a string, got {other:?}"
            ))),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        match self
            .attrs
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(&name))
        {
            Some(i) => self.attrs[i].1 = value,
            None => self.attrs.push((name, value)),
        }
    }

    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }
}

/// Parse every ad in `src`, detecting the syntax from the first
/// significant character.
pub fn parse_ads(src: &str) -> Result<Vec<ClassAd>> {
    let first = src
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !is_comment(l));
    match first {
        Some(line) if line.starts_with('[') => parse_new_style(src),
        Some(_) => parse_old_style(src),
        None => Ok(Vec::new()),
    }
}

fn is_comment(line: &str) -> bool {
    line.starts_with('#') || line.starts_with("//")
}

fn parse_old_style(src: &str) -> Result<Vec<ClassAd>> {
    let mut ads = Vec::new();
    let mut current = ClassAd::default();

    for (lineno, line) in src.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            if !current.is_empty() {
                ads.push(std::mem::take(&mut current));
            }
            continue;
        }
        if is_comment(line) {
            continue;
        }
        let (name, raw) = line.split_once('=').ok_or_else(|| {
            Error::Parse(format!("line {}: expected `Name = value`", lineno + 1))
        })?;
        let name = name.trim();
        if !is_identifier(name) {
            return Err(Error::Parse(format!(
                "line {}: invalid attribute name {name:?}",
                lineno + 1
            )));
        }
        let value = parse_literal(raw.trim())
            .map_err(|e| Error::Parse(format!("line {}: {e}", lineno + 1)))?;
        current.insert(name, value);
    }
    if !current.is_empty() {
        ads.push(current);
    }
    Ok(ads)
}

fn parse_new_style(src: &str) -> Result<Vec<ClassAd>> {
    let mut cursor = Cursor::new(src);
    let mut ads = Vec::new();

    loop {
        cursor.skip_trivia();
        match cursor.peek() {
            None => break,
            Some('[') => {
                cursor.bump();
                ads.push(parse_body(&mut cursor)?);
            }
            Some(c) => {
                return Err(Error::Parse(format!(
                    "offset {}: expected '[' but found {c:?}",
                    cursor.pos
                )));
            }
        }
    }
    Ok(ads)
}

fn parse_body(cursor: &mut Cursor<'_>) -> Result<ClassAd> {
    let mut ad = ClassAd::default();
    loop {
        cursor.skip_trivia();
        match cursor.peek() {
            None => return Err(Error::Parse("unterminated ClassAd, missing ']'".into())),
            Some(']') => {
                cursor.bump();
                return Ok(ad);
            }
            Some(';') => {
                cursor.bump();
                continue;
            }
            Some(_) => {}
        }

        let name = cursor.identifier()?;
        cursor.skip_trivia();
        if cursor.peek() != Some('=') {
            return Err(Error::Parse(format!(
                "offset {}: expected '=' after attribute {name}",
                cursor.pos
            )));
        }
        cursor.bump();
        let raw = cursor.raw_expression()?;
        let value = parse_literal(raw.trim())
            .map_err(|e| Error::Parse(format!("attribute {name}: {e}")))?;
        ad.insert(name, value);
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

/// Interpret the text on the right-hand side of an assignment.
fn parse_literal(raw: &str) -> std::result::Result<Value, String> {
    if raw.is_empty() {
        return Err("missing value".into());
    }
    if raw.starts_with('"') {
        let (s, rest) = unquote(raw)?;
        if !rest.trim().is_empty() {
            return Ok(Value::Expr(raw.to_string()));
        }
        return Ok(Value::String(s));
    }
    if raw.eq_ignore_ascii_case("true") {
        return Ok(Value::Boolean(true));
    }
    if raw.eq_ignore_ascii_case("false") {
        return Ok(Value::Boolean(false));
    }
    if raw.eq_ignore_ascii_case("undefined") {
        return Ok(Value::Undefined);
    }
    if let Ok(i) = raw.parse::<i64>() {
        return Ok(Value::Integer(i));
    }
    if let Ok(f) = raw.parse::<f64>() {
        return Ok(Value::Real(f));
    }
    Ok(Value::Expr(raw.to_string()))
}

/// Decode a quoted string starting at `raw[0] == '"'`. Returns the decoded
/// string and the text following the closing quote.
fn unquote(raw: &str) -> std::result::Result<(String, &str), String> {
    let mut out = String::new();
    let mut chars = raw.char_indices().skip(1);
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Ok((out, &raw[i + 1..])),
            '\\' => match chars.next() {
                Some((_, 'n')) => out.push('\n'),
                Some((_, 't')) => out.push('\t'),
                Some((_, 'r')) => out.push('\r'),
                Some((_, other)) => out.push(other),
                None => break,
            },
            c => out.push(c),
        }
    }
    Err("unterminated string literal".into())
}

struct Cursor<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self) {
        if let Some(c) = self.peek() {
            self.pos += c.len_utf8();
        }
    }

    /// Skip whitespace and line comments.
    fn skip_trivia(&mut self) {
        loop {
            let rest = self.rest();
            let trimmed = rest.trim_start();
            self.pos += rest.len() - trimmed.len();
            if trimmed.starts_with('#') || trimmed.starts_with("//") {
                let skip = trimmed.find('\n').unwrap_or(trimmed.len());
                self.pos += skip;
            } else {
                return;
            }
        }
    }

    fn identifier(&mut self) -> Result<String> {
        let rest = self.rest();
        let len = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '.'))
            .unwrap_or(rest.len());
        let name = &rest[..len];
        if !is_identifier(name) {
            return Err(Error::Parse(format!(
                "offset {}: expected attribute name",
                self.pos
            )));
        }
        self.pos += len;
        Ok(name.to_string())
    }

    /// Consume text up to the next top-level `;` or `]`, honoring quotes and
    /// nested brackets. The terminator itself is left in place.
    fn raw_expression(&mut self) -> Result<&'a str> {
        let start = self.pos;
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;

        for (i, c) in self.rest().char_indices() {
            if in_string {
                match (escaped, c) {
                    (true, _) => escaped = false,
                    (false, '\\') => escaped = true,
                    (false, '"') => in_string = false,
                    _ => {}
                }
                continue;
            }
            match c {
                '"' => in_string = true,
                '[' | '(' | '{' => depth += 1,
                ')' | '}' => depth = depth.saturating_sub(1),
                ']' if depth > 0 => depth -= 1,
                ';' | ']' if depth == 0 => {
                    self.pos = start + i;
                    return Ok(&self.src[start..self.pos]);
                }
                _ => {}
            }
        }
        Err(Error::Parse("unterminated ClassAd, missing ']'".into()))
    }
}
