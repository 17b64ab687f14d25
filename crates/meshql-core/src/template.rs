//! `{{name}}` query templates.
//!
//! A template is parsed once into literal and placeholder segments. Rendering
//! substitutes stringified parameter values, passed through a backend escaper
//! for `{{name}}` and inserted verbatim for `{{{name}}}`.
//!
//! The escapers only protect text inside a quoted literal. A `{{name}}` written
//! outside quotes, as in `eggs = {{eggs}}`, accepts numbers, booleans and null
//! under [`QueryTemplate::render_with`]; any other text there is rejected.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::envelope::Params;
use crate::error::{ErrorCode, MeshqlError, MeshqlResult};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    /// `quoted` is set when the placeholder sits inside a `'` or `"` literal.
    Placeholder { name: String, raw: bool, quoted: bool },
}

/// A compiled query template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl QueryTemplate {
    /// Parse a template, failing on unterminated or empty placeholders.
    pub fn compile(source: impl Into<String>) -> MeshqlResult<Self> {
        let source = source.into();
        let mut segments = Vec::new();
        let mut rest = source.as_str();
        let mut quote = QuoteState::default();

        while let Some(start) = rest.find("{{") {
            if start > 0 {
                quote.scan(&rest[..start]);
                segments.push(Segment::Literal(rest[..start].to_string()));
            }
            let after = &rest[start..];
            let (open, close) = if after.starts_with("{{{") {
                ("{{{", "}}}")
            } else {
                ("{{", "}}")
            };
            let body = &after[open.len()..];
            let end = body.find(close).ok_or_else(|| {
                MeshqlError::template(
                    ErrorCode::TplUnterminated,
                    format!("Unterminated placeholder starting at byte {}", source.len() - rest.len() + start),
                    &source,
                )
            })?;
            let name = body[..end].trim();
            if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '.') {
                return Err(MeshqlError::template(
                    ErrorCode::TplInvalidQuery,
                    format!("Invalid placeholder name '{}'", name),
                    &source,
                ));
            }
            segments.push(Segment::Placeholder {
                name: name.to_string(),
                raw: open.len() == 3,
                quoted: quote.is_open(),
            });
            rest = &body[end + close.len()..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Self { source, segments })
    }

    /// The template text as compiled.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Names of every placeholder, in order of appearance.
    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Placeholder { name, .. } => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// Render with values inserted as-is.
    pub fn render(&self, params: &Params) -> MeshqlResult<String> {
        self.substitute(params, verbatim, false)
    }

    /// Render, passing every `{{name}}` value through `escape`.
    ///
    /// Fails with `TPL_003` when a `{{name}}` outside quotes receives anything
    /// but a number, a boolean or null.
    pub fn render_with<F>(&self, params: &Params, escape: F) -> MeshqlResult<String>
    where
        F: for<'a> Fn(&'a str) -> Cow<'a, str>,
    {
        self.substitute(params, escape, true)
    }

    fn substitute<F>(&self, params: &Params, escape: F, guard_unquoted: bool) -> MeshqlResult<String>
    where
        F: for<'a> Fn(&'a str) -> Cow<'a, str>,
    {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder { name, raw, quoted } => {
                    let value = lookup(params, name).ok_or_else(|| {
                        MeshqlError::template(
                            ErrorCode::TplUnknownPlaceholder,
                            format!("No parameter supplied for '{}'", name),
                            &self.source,
                        )
                    })?;
                    if guard_unquoted && !raw && !quoted && !is_bare_literal(value) {
                        return Err(MeshqlError::template(
                            ErrorCode::TplInvalidQuery,
                            format!(
                                "Parameter '{}' is outside quotes and is not a number, boolean or null",
                                name
                            ),
                            &self.source,
                        ));
                    }
                    let text = stringify(value);
                    if *raw {
                        out.push_str(&text);
                    } else {
                        out.push_str(&escape(text.as_str()));
                    }
                }
            }
        }
        Ok(out)
    }
}

impl FromStr for QueryTemplate {
    type Err = MeshqlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::compile(s)
    }
}

impl fmt::Display for QueryTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Tracks whether scanned literal text has left a quote open.
#[derive(Debug, Default)]
struct QuoteState {
    open: Option<char>,
    escaped: bool,
}

impl QuoteState {
    fn scan(&mut self, text: &str) {
        for c in text.chars() {
            let open = self.open;
            match open {
                None if c == '\'' || c == '"' => self.open = Some(c),
                None => {}
                Some(_) if self.escaped => self.escaped = false,
                Some(_) if c == '\\' => self.escaped = true,
                Some(q) if c == q => self.open = None,
                Some(_) => {}
            }
        }
    }

    fn is_open(&self) -> bool {
        self.open.is_some()
    }
}

/// Values that are safe to splice outside a quoted literal.
fn is_bare_literal(value: &Value) -> bool {
    match value {
        Value::Number(_) | Value::Bool(_) | Value::Null => true,
        Value::String(s) => s.parse::<f64>().map(f64::is_finite).unwrap_or(false),
        Value::Array(_) | Value::Object(_) => false,
    }
}

fn verbatim(s: &str) -> Cow<'_, str> {
    Cow::Borrowed(s)
}

/// Dotted lookup into nested parameter objects.
fn lookup<'a>(params: &'a Params, name: &str) -> Option<&'a Value> {
    if let Some(v) = params.get(name) {
        return Some(v);
    }
    let mut parts = name.split('.');
    let mut current = params.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Literal text of a parameter value.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// Escape text for the inside of a JSON string literal.
pub fn escape_json_string(s: &str) -> Cow<'_, str> {
    if !s.chars().any(|c| c == '"' || c == '\\' || c.is_control()) {
        return Cow::Borrowed(s);
    }
    let quoted = Value::String(s.to_string()).to_string();
    Cow::Owned(quoted[1..quoted.len() - 1].to_string())
}

/// Escape text for the inside of a standard single-quoted SQL literal.
pub fn escape_sql_literal(s: &str) -> Cow<'_, str> {
    if s.contains('\'') {
        Cow::Owned(s.replace('\'', "''"))
    } else {
        Cow::Borrowed(s)
    }
}
