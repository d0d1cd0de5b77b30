//! Nested casualty and vehicle documents
//!
//! JSON-lines sources carry these lists as JSON arrays. The CSV export writes
//! them as Python literals (`[{'class': 'Driver', 'age': 34}]`), so a string
//! value is tried as JSON first and as a Python literal second.

use serde_json::{Map, Number, Value};

/// Discriminator key added by the TfL API; never stored.
pub const TYPE_KEY: &str = "$type";
pub const SEX_OF_CASUALTY_KEY: &str = "sexOfCasualty";

const MAX_DEPTH: usize = 64;

/// Which nested list a document is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Casualties,
    Vehicles,
}

/// Parses and cleans one nested document.
///
/// Returns `Ok(None)` for an absent or null value and `Err(reason)` for
/// text that is neither JSON nor a Python literal. Anything that parses is
/// kept, list or not: a lone dict or a scalar is stored as that JSON value.
/// Casualty objects, at the top level or inside a list, gain a
/// `sexOfCasualty` key when the feed omits it.
pub fn parse_document(raw: &Value, kind: DocumentKind) -> Result<Option<Value>, String> {
    let parsed = match raw {
        Value::Null => return Ok(None),
        Value::String(text) => {
            let text = text.trim();
            if text.is_empty() {
                return Ok(None);
            }
            match serde_json::from_str::<Value>(text) {
                Ok(value) => value,
                Err(_) => parse_python_literal(text)?,
            }
        },
        other => other.clone(),
    };

    let doc = match strip_type_keys(parsed) {
        Value::Null => return Ok(None),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| complete_entry(item, kind))
                .collect(),
        ),
        other => complete_entry(other, kind),
    };

    Ok(Some(doc))
}

fn complete_entry(mut entry: Value, kind: DocumentKind) -> Value {
    if kind == DocumentKind::Casualties {
        if let Value::Object(fields) = &mut entry {
            fields
                .entry(SEX_OF_CASUALTY_KEY)
                .or_insert(Value::Null);
        }
    }
    entry
}

/// Removes every `$type` key, at any depth.
pub fn strip_type_keys(value: Value) -> Value {
    match value {
        Value::Object(fields) => Value::Object(
            fields
                .into_iter()
                .filter(|(k, _)| k != TYPE_KEY)
                .map(|(k, v)| (k, strip_type_keys(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(strip_type_keys).collect()),
        other => other,
    }
}

/// Parses a Python literal (lists, tuples, dicts, strings, numbers,
/// `True`/`False`/`None`) into JSON.
pub fn parse_python_literal(text: &str) -> Result<Value, String> {
    let mut parser = LiteralParser { src: text, pos: 0 };
    let value = parser.value(0)?;
    parser.skip_ws();
    if parser.pos != text.len() {
        return Err(format!("trailing input at offset {}", parser.pos));
    }
    Ok(value)
}

struct LiteralParser<'a> {
    src: &'a str,
    pos: usize,
}

impl LiteralParser<'_> {
    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.bump();
        }
    }

    fn expect(&mut self, want: char) -> Result<(), String> {
        match self.bump() {
            Some(c) if c == want => Ok(()),
            Some(c) => Err(format!("expected {want:?} at offset {}, found {c:?}", self.pos - c.len_utf8())),
            None => Err(format!("expected {want:?}, found end of input")),
        }
    }

    fn value(&mut self, depth: usize) -> Result<Value, String> {
        if depth > MAX_DEPTH {
            return Err("nesting too deep".to_string());
        }
        self.skip_ws();
        match self.peek() {
            Some('[') => self.sequence('[', ']', depth),
            Some('(') => self.sequence('(', ')', depth),
            Some('{') => self.dict(depth),
            Some(q @ ('\'' | '"')) => self.string(q).map(Value::String),
            Some(c) if c.is_ascii_digit() || c == '-' || c == '+' || c == '.' => self.number(),
            Some(c) if c.is_ascii_alphabetic() => self.keyword(),
            Some(c) => Err(format!("unexpected {c:?} at offset {}", self.pos)),
            None => Err("unexpected end of input".to_string()),
        }
    }

    fn sequence(&mut self, open: char, close: char, depth: usize) -> Result<Value, String> {
        self.expect(open)?;
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some(close) {
                self.bump();
                return Ok(Value::Array(items));
            }
            items.push(self.value(depth + 1)?);
            self.skip_ws();
            match self.bump() {
                Some(',') => continue,
                Some(c) if c == close => return Ok(Value::Array(items)),
                Some(c) => return Err(format!("unexpected {c:?} in list")),
                None => return Err("unterminated list".to_string()),
            }
        }
    }

    fn dict(&mut self, depth: usize) -> Result<Value, String> {
        self.expect('{')?;
        let mut fields = Map::new();
        loop {
            self.skip_ws();
            if self.peek() == Some('}') {
                self.bump();
                return Ok(Value::Object(fields));
            }
            let key = match self.value(depth + 1)? {
                Value::String(s) => s,
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                other => return Err(format!("unsupported dict key {other}")),
            };
            self.skip_ws();
            self.expect(':')?;
            let value = self.value(depth + 1)?;
            fields.insert(key, value);
            self.skip_ws();
            match self.bump() {
                Some(',') => continue,
                Some('}') => return Ok(Value::Object(fields)),
                Some(c) => return Err(format!("unexpected {c:?} in dict")),
                None => return Err("unterminated dict".to_string()),
            }
        }
    }

    fn string(&mut self, quote: char) -> Result<String, String> {
        self.expect(quote)?;
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err("unterminated string".to_string()),
                Some(c) if c == quote => return Ok(out),
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some('0') => out.push('\0'),
                    Some('x') => out.push(self.hex_escape(2)?),
                    Some('u') => out.push(self.hex_escape(4)?),
                    Some('U') => out.push(self.hex_escape(8)?),
                    Some(c @ ('\\' | '\'' | '"')) => out.push(c),
                    Some(c) => {
                        out.push('\\');
                        out.push(c);
                    },
                    None => return Err("unterminated escape".to_string()),
                },
                Some(c) => out.push(c),
            }
        }
    }

    fn hex_escape(&mut self, digits: usize) -> Result<char, String> {
        let end = self.pos + digits;
        let hex = self
            .src
            .get(self.pos..end)
            .ok_or_else(|| "truncated escape".to_string())?;
        let code = u32::from_str_radix(hex, 16).map_err(|_| format!("bad escape \\{hex}"))?;
        self.pos = end;
        char::from_u32(code).ok_or_else(|| format!("invalid code point {code:#x}"))
    }

    fn number(&mut self) -> Result<Value, String> {
        let start = self.pos;
        while matches!(
            self.peek(),
            Some(c) if c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E' | '_')
        ) {
            self.bump();
        }
        let literal: String = self.src[start..self.pos].chars().filter(|c| *c != '_').collect();
        if let Ok(int) = literal.parse::<i64>() {
            return Ok(Value::Number(int.into()));
        }
        literal
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| format!("invalid number {literal:?}"))
    }

    fn keyword(&mut self) -> Result<Value, String> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == '_') {
            self.bump();
        }
        match &self.src[start..self.pos] {
            "True" => Ok(Value::Bool(true)),
            "False" => Ok(Value::Bool(false)),
            "None" => Ok(Value::Null),
            other => Err(format!("unknown name {other:?}")),
        }
    }
}
