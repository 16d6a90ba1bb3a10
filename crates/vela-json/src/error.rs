#![forbid(unsafe_code)]

//! Structured decode failures.
//!
//! A [`DecodeError`] is a tree: projections wrap the failure of their inner
//! decoder with the path segment they took, and `one_of` collects the
//! failures of every alternative. Rendering walks the tree outward-in,
//! accumulating the path as it goes.

use std::fmt;

use serde_json::Value;

use crate::encode;

/// Why a decoder rejected a value.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// Failure below the named object field.
    Field(String, Box<DecodeError>),
    /// Failure below the given array index.
    Index(usize, Box<DecodeError>),
    /// Every alternative of a `one_of` failed, in attempt order.
    OneOf(Vec<DecodeError>),
    /// A primitive failure with a message and the offending value.
    Failure(String, Value),
}

impl DecodeError {
    /// Shorthand for a [`DecodeError::Failure`].
    pub fn failure(message: impl Into<String>, value: &Value) -> Self {
        Self::Failure(message.into(), value.clone())
    }

    pub(crate) fn field(name: &str, inner: DecodeError) -> Self {
        Self::Field(name.to_owned(), Box::new(inner))
    }

    pub(crate) fn index(index: usize, inner: DecodeError) -> Self {
        Self::Index(index, Box::new(inner))
    }

    /// Path segments leading to the innermost failure, for the first
    /// failing alternative of any `one_of` along the way.
    pub fn path(&self) -> Vec<String> {
        let mut path = Vec::new();
        let mut current = self;
        loop {
            match current {
                Self::Field(name, inner) => {
                    path.push(field_segment(name));
                    current = inner;
                }
                Self::Index(index, inner) => {
                    path.push(format!("[{index}]"));
                    current = inner;
                }
                Self::OneOf(errors) => match errors.first() {
                    Some(first) => current = first,
                    None => return path,
                },
                Self::Failure(..) => return path,
            }
        }
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&render(self, Vec::new()))
    }
}

impl std::error::Error for DecodeError {}

fn render(error: &DecodeError, mut context: Vec<String>) -> String {
    match error {
        DecodeError::Field(name, inner) => {
            context.push(field_segment(name));
            render(inner, context)
        }
        DecodeError::Index(index, inner) => {
            context.push(format!("[{index}]"));
            render(inner, context)
        }
        DecodeError::OneOf(errors) => match errors.as_slice() {
            [] => {
                let suffix = if context.is_empty() {
                    "!".to_owned()
                } else {
                    format!(" at json{}", context.concat())
                };
                format!("Ran into a one_of with no possibilities{suffix}")
            }
            [single] => render(single, context),
            _ => {
                let starter = if context.is_empty() {
                    "A one_of".to_owned()
                } else {
                    format!("The one_of at json{}", context.concat())
                };
                let mut out = format!(
                    "{starter} failed in the following {} ways:",
                    errors.len()
                );
                for (i, err) in errors.iter().enumerate() {
                    out.push_str("\n\n\n\n(");
                    out.push_str(&(i + 1).to_string());
                    out.push_str(") ");
                    out.push_str(&indent(&err.to_string()));
                }
                out
            }
        },
        DecodeError::Failure(message, value) => {
            let introduction = if context.is_empty() {
                "Problem with the given value:\n\n".to_owned()
            } else {
                format!("Problem with the value at json{}:\n\n", context.concat())
            };
            format!(
                "{introduction}    {}\n\n{message}",
                indent(&encode::encode(4, value))
            )
        }
    }
}

fn field_segment(name: &str) -> String {
    let mut chars = name.chars();
    let simple = match chars.next() {
        Some(first) => first.is_ascii_alphabetic() && chars.all(|c| c.is_ascii_alphanumeric()),
        None => false,
    };
    if simple {
        format!(".{name}")
    } else {
        format!("['{name}']")
    }
}

fn indent(text: &str) -> String {
    text.split('\n').collect::<Vec<_>>().join("\n    ")
}
