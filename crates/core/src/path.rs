//! Field path parsing: `spec.containers[0].image`, `metadata.labels['app.oam.dev/name']`.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("path not found: {0}")]
    PathNotFound(String),
    #[error("type mismatch at {path}: expected {expected}")]
    TypeMismatch { path: String, expected: &'static str },
    #[error("invalid field path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },
}

impl PathError {
    pub fn is_not_found(&self) -> bool { matches!(self, PathError::PathNotFound(_)) }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Field(String),
    Index(usize),
}

pub fn parse(path: &str) -> Result<Vec<Segment>, PathError> {
    let invalid = |reason: &'static str| PathError::InvalidPath { path: path.to_string(), reason };
    if path.is_empty() { return Err(invalid("empty path")); }

    let mut out = Vec::new();
    let mut field = String::new();
    // true right after a closing bracket, where a '.' may follow without a field name
    let mut after_bracket = false;
    let mut chars = path.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        match c {
            '.' => {
                if field.is_empty() {
                    if !after_bracket { return Err(invalid("empty field name")); }
                } else {
                    out.push(Segment::Field(std::mem::take(&mut field)));
                }
                if chars.peek().is_none() { return Err(invalid("trailing '.'")); }
                after_bracket = false;
            }
            '[' => {
                if !field.is_empty() { out.push(Segment::Field(std::mem::take(&mut field))); }
                let rest = &path[i + 1..];
                let (seg, consumed) = match rest.chars().next() {
                    Some(q @ ('\'' | '"')) => {
                        let body = &rest[1..];
                        let end = body.find(q).ok_or_else(|| invalid("unterminated quoted key"))?;
                        if !body[end + 1..].starts_with(']') { return Err(invalid("expected ']' after quoted key")); }
                        (Segment::Field(body[..end].to_string()), end + 3)
                    }
                    _ => {
                        let end = rest.find(']').ok_or_else(|| invalid("unclosed '['"))?;
                        let idx = rest[..end].parse::<usize>().map_err(|_| invalid("index must be a non-negative integer"))?;
                        (Segment::Index(idx), end + 1)
                    }
                };
                out.push(seg);
                for _ in 0..rest[..consumed].chars().count() { chars.next(); }
                after_bracket = true;
            }
            ']' => return Err(invalid("unexpected ']'")),
            c => {
                if after_bracket { return Err(invalid("expected '.' or '[' after ']'")); }
                field.push(c);
            }
        }
    }
    if !field.is_empty() { out.push(Segment::Field(field)); }
    Ok(out)
}
