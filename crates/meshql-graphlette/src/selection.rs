//! GraphQL-style selection sets such as `name farm { name }`.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use meshql_core::envelope::Payload;
use meshql_core::error::{MeshqlError, MeshqlResult};

/// One requested field and its optional sub-selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub selection: Selection,
}

/// An ordered set of requested fields. Empty means "everything".
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Selection {
    fields: Vec<Field>,
}

#[derive(Debug, PartialEq)]
enum Token<'a> {
    Name(&'a str),
    Open,
    Close,
}

fn tokenize(text: &str) -> MeshqlResult<Vec<Token<'_>>> {
    let mut tokens = Vec::new();
    let mut chars = text.char_indices().peekable();
    while let Some((start, c)) = chars.next() {
        match c {
            '{' => tokens.push(Token::Open),
            '}' => tokens.push(Token::Close),
            c if c.is_whitespace() || c == ',' => {}
            c if c.is_ascii_alphanumeric() || c == '_' => {
                let mut end = start + c.len_utf8();
                while let Some(&(i, n)) = chars.peek() {
                    if n.is_ascii_alphanumeric() || n == '_' {
                        end = i + n.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Name(&text[start..end]));
            }
            other => {
                return Err(MeshqlError::validation(format!(
                    "unexpected '{}' in selection '{}'",
                    other, text
                )))
            }
        }
    }
    Ok(tokens)
}

impl Selection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `name farm { name }`. An outer pair of braces is accepted and ignored.
    pub fn parse(text: &str) -> MeshqlResult<Self> {
        let mut tokens = tokenize(text)?;
        if tokens.first() == Some(&Token::Open) && tokens.last() == Some(&Token::Close) {
            tokens.remove(0);
            tokens.pop();
        }

        let mut pos = 0;
        let selection = Self::parse_level(&tokens, &mut pos, text)?;
        if pos != tokens.len() {
            return Err(MeshqlError::validation(format!(
                "unbalanced braces in selection '{}'",
                text
            )));
        }
        Ok(selection)
    }

    fn parse_level(tokens: &[Token<'_>], pos: &mut usize, text: &str) -> MeshqlResult<Self> {
        let mut fields: Vec<Field> = Vec::new();
        while let Some(token) = tokens.get(*pos) {
            match token {
                Token::Name(name) => {
                    *pos += 1;
                    fields.push(Field {
                        name: name.to_string(),
                        selection: Selection::default(),
                    });
                }
                Token::Open => {
                    *pos += 1;
                    let Some(parent) = fields.last_mut().filter(|f| f.selection.is_empty()) else {
                        return Err(MeshqlError::validation(format!(
                            "sub-selection without a field in '{}'",
                            text
                        )));
                    };
                    let nested = Self::parse_level(tokens, pos, text)?;
                    if tokens.get(*pos) != Some(&Token::Close) || nested.is_empty() {
                        return Err(MeshqlError::validation(format!(
                            "unbalanced braces in selection '{}'",
                            text
                        )));
                    }
                    *pos += 1;
                    parent.selection = nested;
                }
                Token::Close => break,
            }
        }
        Ok(Self { fields })
    }

    pub fn with_field(mut self, name: impl Into<String>, selection: Selection) -> Self {
        self.fields.push(Field {
            name: name.into(),
            selection,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    /// Keep only the selected fields of `payload`, recursing into objects and
    /// arrays of objects. An empty selection keeps everything.
    pub fn project(&self, mut payload: Payload) -> Payload {
        if self.is_empty() {
            return payload;
        }
        let mut out = Payload::new();
        for field in &self.fields {
            if let Some(value) = payload.remove(&field.name) {
                out.insert(field.name.clone(), field.selection.project_value(value));
            }
        }
        out
    }

    fn project_value(&self, value: Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(self.project(map)),
            Value::Array(items) => {
                Value::Array(items.into_iter().map(|v| self.project_value(v)).collect())
            }
            other => other,
        }
    }
}

impl fmt::Display for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            f.write_str(&field.name)?;
            if !field.selection.is_empty() {
                write!(f, " {{ {} }}", field.selection)?;
            }
        }
        Ok(())
    }
}

impl FromStr for Selection {
    type Err = MeshqlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_and_render() {
        let selection = Selection::parse("name, farm { name id }").unwrap();
        assert_eq!(selection.fields().len(), 2);
        assert!(selection.contains("farm"));
        assert_eq!(selection.field("farm").unwrap().selection.fields().len(), 2);
        assert_eq!(selection.to_string(), "name farm { name id }");
    }

    #[test]
    fn test_outer_braces_ignored() {
        let a: Selection = "{ name coop { farm { name } } }".parse().unwrap();
        let b: Selection = "name coop { farm { name } }".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "name coop { farm { name } }");
    }

    #[test]
    fn test_malformed_selections() {
        assert!(Selection::parse("name { }").is_err());
        assert!(Selection::parse("{ name").is_err());
        assert!(Selection::parse("name }").is_err());
        assert!(Selection::parse("name(id: 1)").is_err());
        assert!(Selection::parse("farm { name } { id }").is_err());
    }

    #[test]
    fn test_empty_selection() {
        let selection = Selection::parse("  ").unwrap();
        assert!(selection.is_empty());
        assert_eq!(selection.to_string(), "");
    }

    #[test]
    fn test_project() {
        let selection = Selection::parse("name hens { eggs }").unwrap();
        let payload = json!({
            "name": "Coop A",
            "farm_id": "farm1",
            "hens": [{"name": "Ruby", "eggs": 3}, {"name": "Pearl", "eggs": 5}]
        });
        let projected = selection.project(payload.as_object().cloned().unwrap());
        assert_eq!(
            Value::Object(projected),
            json!({"name": "Coop A", "hens": [{"eggs": 3}, {"eggs": 5}]})
        );
    }

    #[test]
    fn test_empty_selection_keeps_everything() {
        let payload = json!({"name": "Red Barn", "acres": 40});
        let projected = Selection::new().project(payload.as_object().cloned().unwrap());
        assert_eq!(Value::Object(projected), payload);
    }
}
