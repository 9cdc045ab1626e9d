//! Update document application.

use docsync_codec::{Document, Value};

use crate::error::{StorageError, StorageResult};
use crate::query::is_operator_document;

const ID_FIELD: &str = "_id";

/// True when `update` uses operators (`$set`, ...) rather than being a
/// whole replacement document.
pub fn is_operator_update(update: &Document) -> bool {
    update.keys().next().is_some_and(|k| k.starts_with('$'))
}

/// Applies `update` to `document`, returning the post-image.
///
/// A document without operators replaces everything except `_id`.
/// Supported operators: `$set`, `$unset`, `$inc`, `$push`.
pub fn apply_update(document: &Document, update: &Document) -> StorageResult<Document> {
    if !is_operator_update(update) {
        return replace(document, update);
    }

    let mut result = document.clone();
    for (op, fields) in update {
        let fields = fields
            .as_document()
            .ok_or_else(|| StorageError::invalid_update(format!("{op} expects a document")))?;
        for (path, operand) in fields {
            if path == ID_FIELD || path.starts_with("_id.") {
                return Err(StorageError::invalid_update("_id is immutable"));
            }
            match op.as_str() {
                "$set" => result.set_path(path, operand.clone())?,
                "$unset" => {
                    result.remove_path(path);
                }
                "$inc" => increment(&mut result, path, operand)?,
                "$push" => push(&mut result, path, operand)?,
                other => {
                    return Err(StorageError::invalid_update(format!(
                        "unsupported update operator {other}"
                    )))
                }
            }
        }
    }
    Ok(result)
}

fn replace(document: &Document, replacement: &Document) -> StorageResult<Document> {
    if replacement.keys().any(|k| k.starts_with('$')) {
        return Err(StorageError::invalid_update(
            "replacement documents cannot contain operators",
        ));
    }
    let mut result = Document::with_capacity(replacement.len() + 1);
    match (document.get(ID_FIELD), replacement.get(ID_FIELD)) {
        (Some(existing), Some(new)) if existing != new => {
            return Err(StorageError::invalid_update("_id is immutable"));
        }
        (Some(existing), _) => {
            result.insert(ID_FIELD, existing.clone());
        }
        (None, _) => {}
    }
    for (k, v) in replacement {
        result.insert(k.clone(), v.clone());
    }
    Ok(result)
}

fn increment(document: &mut Document, path: &str, amount: &Value) -> StorageResult<()> {
    let updated = match (document.get_path(path), amount) {
        (None, a) if a.is_number() => a.clone(),
        (Some(Value::Int32(x)), Value::Int32(y)) => match x.checked_add(*y) {
            Some(sum) => Value::Int32(sum),
            None => Value::Int64(i64::from(*x) + i64::from(*y)),
        },
        (Some(Value::Int32(_) | Value::Int64(_)), Value::Int32(_) | Value::Int64(_)) => {
            let x = document.get_path(path).and_then(Value::as_i64).unwrap_or(0);
            let y = amount.as_i64().unwrap_or(0);
            Value::Int64(
                x.checked_add(y)
                    .ok_or_else(|| StorageError::invalid_update("$inc overflow"))?,
            )
        }
        (Some(current), a) if current.is_number() && a.is_number() => {
            Value::Double(current.as_f64().unwrap_or(0.0) + a.as_f64().unwrap_or(0.0))
        }
        _ => {
            return Err(StorageError::invalid_update(format!(
                "$inc on {path} requires numeric values"
            )))
        }
    };
    document.set_path(path, updated)?;
    Ok(())
}

fn push(document: &mut Document, path: &str, item: &Value) -> StorageResult<()> {
    let mut items = match document.get_path(path) {
        None => Vec::new(),
        Some(Value::Array(existing)) => existing.clone(),
        Some(other) => {
            return Err(StorageError::invalid_update(format!(
                "$push on {path} requires an array, found {}",
                other.type_name()
            )))
        }
    };
    items.push(item.clone());
    document.set_path(path, Value::Array(items))?;
    Ok(())
}

/// Seed document for an upsert: the filter's equality conditions.
///
/// Operator clauses other than `$eq` contribute nothing.
pub fn upsert_seed(filter: &Document) -> StorageResult<Document> {
    let mut seed = Document::new();
    for (path, condition) in filter {
        if path.starts_with('$') {
            continue;
        }
        if is_operator_document(condition) {
            if let Some(eq) = condition.as_document().and_then(|d| d.get("$eq")) {
                seed.set_path(path, eq.clone())?;
            }
        } else {
            seed.set_path(path, condition.clone())?;
        }
    }
    Ok(seed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_codec::doc;

    #[test]
    fn set_and_unset() {
        let d = doc! { "_id" => 1, "a" => 1, "b" => doc! { "c" => 2 } };
        let u = doc! { "$set" => doc! { "a" => 5, "b.d" => 3 }, "$unset" => doc! { "b.c" => true } };
        let after = apply_update(&d, &u).unwrap();
        assert_eq!(after, doc! { "_id" => 1, "a" => 5, "b" => doc! { "d" => 3 } });
    }

    #[test]
    fn replacement_keeps_id() {
        let d = doc! { "_id" => 1, "a" => 1 };
        let after = apply_update(&d, &doc! { "z" => true }).unwrap();
        assert_eq!(after, doc! { "_id" => 1, "z" => true });
        assert!(apply_update(&d, &doc! { "_id" => 2 }).is_err());
    }

    #[test]
    fn increment_widths() {
        let d = doc! { "n" => 1, "big" => Value::Int64(10), "f" => 1.5 };
        let after = apply_update(
            &d,
            &doc! { "$inc" => doc! { "n" => 2, "big" => 1, "f" => 1, "new" => 4 } },
        )
        .unwrap();
        assert_eq!(after.get("n"), Some(&Value::Int32(3)));
        assert_eq!(after.get("big"), Some(&Value::Int64(11)));
        assert_eq!(after.get("f"), Some(&Value::Double(2.5)));
        assert_eq!(after.get("new"), Some(&Value::Int32(4)));
        assert!(apply_update(&doc! { "s" => "x" }, &doc! { "$inc" => doc! { "s" => 1 } }).is_err());
    }

    #[test]
    fn push_appends() {
        let d = doc! { "list" => vec![1] };
        let after = apply_update(&d, &doc! { "$push" => doc! { "list" => 2, "other" => "x" } }).unwrap();
        assert_eq!(after.get("list"), Some(&Value::from(vec![1, 2])));
        assert_eq!(after.get("other"), Some(&Value::from(vec!["x"])));
    }

    #[test]
    fn id_cannot_be_set() {
        let d = doc! { "_id" => 1 };
        assert!(apply_update(&d, &doc! { "$set" => doc! { "_id" => 2 } }).is_err());
    }

    #[test]
    fn unknown_operator() {
        assert!(apply_update(&Document::new(), &doc! { "$rename" => doc! { "a" => "b" } }).is_err());
    }

    #[test]
    fn seed_from_filter() {
        let filter = doc! {
            "_id" => 7,
            "a.b" => "x",
            "n" => doc! { "$gt" => 1 },
            "m" => doc! { "$eq" => 2 },
        };
        assert_eq!(
            upsert_seed(&filter).unwrap(),
            doc! { "_id" => 7, "a" => doc! { "b" => "x" }, "m" => 2 }
        );
    }
}
