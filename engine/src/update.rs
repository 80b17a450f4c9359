//! Update modifications.
//!
//! An update carries a modification document in one of two styles:
//!
//! - **Set-style**: no key starts with `$`. The document replaces the stored
//!   one wholesale (keeping `_id`), so the update behaves like an insert.
//! - **Mod-style**: every key is a field operator (`$set`, `$inc`, ...). The
//!   result depends on the stored document, which therefore has to be
//!   fetched unless an earlier operation in the batch already produced it.

use crate::document::{Document, DocumentKey, ID_FIELD};
use crate::{Error, Result};
use serde_json::{Number, Value};
use std::cmp::Ordering;

/// A single field operator of a Mod-style update.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldUpdate {
    Set { path: String, value: Value },
    Unset { path: String },
    Inc { path: String, by: Number },
    Mul { path: String, by: Number },
    Min { path: String, value: Value },
    Max { path: String, value: Value },
    Rename { from: String, to: String },
}

/// A parsed modification.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateAction {
    /// Whole-document replacement.
    Replace(Document),
    /// Field operators, applied in order.
    Modify(Vec<FieldUpdate>),
}

impl UpdateAction {
    /// Parse a modification document.
    pub fn parse(modification: &Document) -> Result<Self> {
        let operator_keys = modification.keys().filter(|k| k.starts_with('$')).count();

        if operator_keys == 0 {
            return Ok(UpdateAction::Replace(modification.clone()));
        }
        if operator_keys != modification.len() {
            return Err(Error::InvalidModification(
                "cannot mix field operators with replacement fields".to_string(),
            ));
        }

        let mut updates = Vec::new();
        for (operator, args) in modification {
            let args = args.as_object().ok_or_else(|| {
                Error::InvalidModification(format!("argument of {operator} must be an object"))
            })?;
            for (path, value) in args {
                updates.push(parse_field_update(operator, path, value)?);
            }
        }

        Ok(UpdateAction::Modify(updates))
    }

    /// Whether this modification replaces the whole document.
    pub fn is_set_modification(&self) -> bool {
        matches!(self, UpdateAction::Replace(_))
    }

    /// Apply the modification to a document, returning the new document.
    pub fn apply(&self, doc: &Document) -> Result<Document> {
        match self {
            UpdateAction::Replace(replacement) => {
                let mut result = replacement.clone();
                if let Some(id) = doc.get(ID_FIELD) {
                    result.insert(ID_FIELD.to_string(), id.clone());
                }
                Ok(result)
            }
            UpdateAction::Modify(updates) => {
                let mut result = doc.clone();
                for update in updates {
                    apply_field_update(&mut result, update)?;
                }
                Ok(result)
            }
        }
    }

    /// Apply the modification as an upsert that found no document.
    pub fn apply_as_upsert(&self, key: &DocumentKey) -> Result<Document> {
        self.apply(&key.seed_document())
    }
}

fn parse_field_update(operator: &str, path: &str, value: &Value) -> Result<FieldUpdate> {
    let path = path.to_string();
    let update = match operator {
        "$set" => FieldUpdate::Set {
            path,
            value: value.clone(),
        },
        "$unset" => FieldUpdate::Unset { path },
        "$inc" => FieldUpdate::Inc {
            path,
            by: numeric_argument("$inc", value)?,
        },
        "$mul" => FieldUpdate::Mul {
            path,
            by: numeric_argument("$mul", value)?,
        },
        "$min" => FieldUpdate::Min {
            path,
            value: value.clone(),
        },
        "$max" => FieldUpdate::Max {
            path,
            value: value.clone(),
        },
        "$rename" => {
            let to = value.as_str().ok_or_else(|| {
                Error::InvalidModification(format!("$rename target of '{path}' must be a string"))
            })?;
            FieldUpdate::Rename {
                from: path,
                to: to.to_string(),
            }
        }
        other => return Err(Error::UnknownOperator(other.to_string())),
    };
    Ok(update)
}

fn numeric_argument(operator: &str, value: &Value) -> Result<Number> {
    match value {
        Value::Number(n) => Ok(n.clone()),
        _ => Err(Error::InvalidModification(format!(
            "argument of {operator} must be a number"
        ))),
    }
}

fn apply_field_update(doc: &mut Document, update: &FieldUpdate) -> Result<()> {
    match update {
        FieldUpdate::Set { path, value } => set_path(doc, path, value.clone()),
        FieldUpdate::Unset { path } => {
            remove_path(doc, path);
            Ok(())
        }
        FieldUpdate::Inc { path, by } => {
            let next = match get_path(doc, path) {
                None => Value::Number(by.clone()),
                Some(Value::Number(current)) => Value::Number(add(current, by)),
                Some(_) => {
                    return Err(Error::NonNumericField {
                        operator: "$inc",
                        field: path.clone(),
                    })
                }
            };
            set_path(doc, path, next)
        }
        FieldUpdate::Mul { path, by } => {
            let next = match get_path(doc, path) {
                None => Value::Number(zero_like(by)),
                Some(Value::Number(current)) => Value::Number(mul(current, by)),
                Some(_) => {
                    return Err(Error::NonNumericField {
                        operator: "$mul",
                        field: path.clone(),
                    })
                }
            };
            set_path(doc, path, next)
        }
        FieldUpdate::Min { path, value } => {
            let replace = match get_path(doc, path) {
                None => true,
                Some(current) => compare_values(value, current) == Ordering::Less,
            };
            if replace {
                set_path(doc, path, value.clone())?;
            }
            Ok(())
        }
        FieldUpdate::Max { path, value } => {
            let replace = match get_path(doc, path) {
                None => true,
                Some(current) => compare_values(value, current) == Ordering::Greater,
            };
            if replace {
                set_path(doc, path, value.clone())?;
            }
            Ok(())
        }
        FieldUpdate::Rename { from, to } => {
            if let Some(value) = remove_path(doc, from) {
                set_path(doc, to, value)?;
            }
            Ok(())
        }
    }
}

fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = doc.get(first)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn set_path(doc: &mut Document, path: &str, value: Value) -> Result<()> {
    let segments: Vec<&str> = path.split('.').collect();
    let (last, parents) = match segments.split_last() {
        Some(split) => split,
        None => return Ok(()),
    };

    let mut current = doc;
    for segment in parents {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Document::new()));
        current = match entry {
            Value::Object(map) => map,
            _ => {
                return Err(Error::PathNotTraversable {
                    path: path.to_string(),
                    segment: segment.to_string(),
                })
            }
        };
    }
    current.insert(last.to_string(), value);
    Ok(())
}

fn remove_path(doc: &mut Document, path: &str) -> Option<Value> {
    let segments: Vec<&str> = path.split('.').collect();
    let (last, parents) = segments.split_last()?;

    let mut current = doc;
    for segment in parents {
        current = current.get_mut(*segment)?.as_object_mut()?;
    }
    current.remove(*last)
}

fn add(a: &Number, b: &Number) -> Number {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(sum) = x.checked_add(y) {
            return Number::from(sum);
        }
    }
    float(a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0))
}

fn mul(a: &Number, b: &Number) -> Number {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(product) = x.checked_mul(y) {
            return Number::from(product);
        }
    }
    float(a.as_f64().unwrap_or(0.0) * b.as_f64().unwrap_or(0.0))
}

fn zero_like(n: &Number) -> Number {
    if n.is_f64() {
        float(0.0)
    } else {
        Number::from(0)
    }
}

fn float(value: f64) -> Number {
    Number::from_f64(value).unwrap_or_else(|| Number::from(0))
}

/// Rank of a JSON type in cross-type comparisons.
fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 5,
    }
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                return x.cmp(&y);
            }
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}
