//! Query filter matching.
//!
//! Supports the subset of the MongoDB filter language the sync engine and
//! its callers rely on: field equality on dotted paths, the comparison
//! operators `$eq`, `$ne`, `$gt`, `$gte`, `$lt`, `$lte`, `$in`, `$nin`,
//! `$exists`, and the logical operators `$and` / `$or`.

use std::cmp::Ordering;

use docsync_codec::{Document, Value};

use crate::error::{StorageError, StorageResult};

/// True when `document` satisfies `filter`. An empty filter matches all.
pub fn matches(document: &Document, filter: &Document) -> StorageResult<bool> {
    for (key, condition) in filter {
        let satisfied = match key.as_str() {
            "$and" => clauses(condition, "$and")?
                .iter()
                .try_fold(true, |acc, clause| Ok::<_, StorageError>(acc && matches(document, clause)?))?,
            "$or" => {
                let mut any = false;
                for clause in clauses(condition, "$or")? {
                    if matches(document, clause)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            op if op.starts_with('$') => {
                return Err(StorageError::invalid_filter(format!(
                    "unsupported top-level operator {op}"
                )))
            }
            path => field_matches(document.get_path(path), condition)?,
        };
        if !satisfied {
            return Ok(false);
        }
    }
    Ok(true)
}

fn clauses<'a>(condition: &'a Value, op: &str) -> StorageResult<Vec<&'a Document>> {
    let items = condition
        .as_array()
        .ok_or_else(|| StorageError::invalid_filter(format!("{op} expects an array")))?;
    if items.is_empty() {
        return Err(StorageError::invalid_filter(format!("{op} expects a non-empty array")));
    }
    items
        .iter()
        .map(|item| {
            item.as_document()
                .ok_or_else(|| StorageError::invalid_filter(format!("{op} clauses must be documents")))
        })
        .collect()
}

/// True when `condition` is an operator document such as `{$gt: 1}`.
pub fn is_operator_document(condition: &Value) -> bool {
    match condition {
        Value::Document(d) => !d.is_empty() && d.keys().all(|k| k.starts_with('$')),
        _ => false,
    }
}

fn field_matches(field: Option<&Value>, condition: &Value) -> StorageResult<bool> {
    let Value::Document(ops) = condition else {
        return Ok(equals(field, condition));
    };
    if !is_operator_document(condition) {
        return Ok(equals(field, condition));
    }

    for (op, operand) in ops {
        let satisfied = match op.as_str() {
            "$eq" => equals(field, operand),
            "$ne" => !equals(field, operand),
            "$gt" => ordered(field, operand, |o| o == Ordering::Greater),
            "$gte" => ordered(field, operand, |o| o != Ordering::Less),
            "$lt" => ordered(field, operand, |o| o == Ordering::Less),
            "$lte" => ordered(field, operand, |o| o != Ordering::Greater),
            "$in" => in_list(field, operand, "$in")?,
            "$nin" => !in_list(field, operand, "$nin")?,
            "$exists" => {
                let wanted = operand
                    .as_bool()
                    .ok_or_else(|| StorageError::invalid_filter("$exists expects a bool"))?;
                field.is_some() == wanted
            }
            other => {
                return Err(StorageError::invalid_filter(format!(
                    "unsupported field operator {other}"
                )))
            }
        };
        if !satisfied {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Equality with query semantics: a missing field equals null, numbers
/// compare across widths, and an array field matches when any element does.
fn equals(field: Option<&Value>, expected: &Value) -> bool {
    match field {
        None => expected.is_null(),
        Some(actual) => {
            values_equal(actual, expected)
                || matches!(actual, Value::Array(items) if items.iter().any(|i| values_equal(i, expected)))
        }
    }
}

/// Value equality that treats numbers of different widths as equal.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (x, y) if x.is_number() && y.is_number() => x.compare(y) == Ordering::Equal,
        (Value::Document(x), Value::Document(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).is_some_and(|other| values_equal(v, other)))
        }
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(p, q)| values_equal(p, q))
        }
        _ => a == b,
    }
}

fn comparable(a: &Value, b: &Value) -> bool {
    (a.is_number() && b.is_number()) || a.type_name() == b.type_name()
}

fn ordered(field: Option<&Value>, operand: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    let check = |v: &Value| comparable(v, operand) && accept(v.compare(operand));
    match field {
        None => false,
        Some(Value::Array(items)) if !matches!(operand, Value::Array(_)) => items.iter().any(check),
        Some(v) => check(v),
    }
}

fn in_list(field: Option<&Value>, operand: &Value, op: &str) -> StorageResult<bool> {
    let candidates = operand
        .as_array()
        .ok_or_else(|| StorageError::invalid_filter(format!("{op} expects an array")))?;
    Ok(candidates.iter().any(|c| equals(field, c)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_codec::doc;

    fn sample() -> Document {
        doc! {
            "_id" => 1,
            "name" => "ada",
            "age" => Value::Int64(36),
            "tags" => vec!["x", "y"],
            "address" => doc! { "city" => "london" },
        }
    }

    #[test]
    fn equality_and_paths() {
        let d = sample();
        assert!(matches(&d, &Document::new()).unwrap());
        assert!(matches(&d, &doc! { "name" => "ada" }).unwrap());
        assert!(matches(&d, &doc! { "age" => 36 }).unwrap());
        assert!(matches(&d, &doc! { "address.city" => "london" }).unwrap());
        assert!(matches(&d, &doc! { "tags" => "y" }).unwrap());
        assert!(!matches(&d, &doc! { "name" => "bob" }).unwrap());
        assert!(matches(&d, &doc! { "missing" => Value::Null }).unwrap());
    }

    #[test]
    fn comparison_operators() {
        let d = sample();
        assert!(matches(&d, &doc! { "age" => doc! { "$gt" => 30, "$lte" => 36.0 } }).unwrap());
        assert!(!matches(&d, &doc! { "age" => doc! { "$lt" => 36 } }).unwrap());
        assert!(!matches(&d, &doc! { "name" => doc! { "$gt" => 1 } }).unwrap());
        assert!(matches(&d, &doc! { "name" => doc! { "$ne" => "bob" } }).unwrap());
    }

    #[test]
    fn set_operators() {
        let d = sample();
        assert!(matches(&d, &doc! { "_id" => doc! { "$in" => vec![3, 1] } }).unwrap());
        assert!(!matches(&d, &doc! { "_id" => doc! { "$nin" => vec![1] } }).unwrap());
        assert!(matches(&d, &doc! { "_id" => doc! { "$nin" => Vec::<Value>::new() } }).unwrap());
    }

    #[test]
    fn exists_operator() {
        let d = sample();
        assert!(matches(&d, &doc! { "name" => doc! { "$exists" => true } }).unwrap());
        assert!(matches(&d, &doc! { "other" => doc! { "$exists" => false } }).unwrap());
    }

    #[test]
    fn logical_operators() {
        let d = sample();
        let or = doc! { "$or" => vec![doc! { "name" => "bob" }, doc! { "age" => 36 }] };
        assert!(matches(&d, &or).unwrap());
        let and = doc! { "$and" => vec![doc! { "name" => "ada" }, doc! { "age" => 1 }] };
        assert!(!matches(&d, &and).unwrap());
    }

    #[test]
    fn embedded_document_equality() {
        let d = sample();
        assert!(matches(&d, &doc! { "address" => doc! { "city" => "london" } }).unwrap());
        assert!(!matches(&d, &doc! { "address" => doc! { "city" => "paris" } }).unwrap());
    }

    #[test]
    fn unknown_operator_is_rejected() {
        let d = sample();
        assert!(matches(&d, &doc! { "age" => doc! { "$regex" => "a" } }).is_err());
        assert!(matches(&d, &doc! { "$where" => "x" }).is_err());
    }
}
