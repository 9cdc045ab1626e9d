//! The aggregation subset evaluated against local documents.
//!
//! Supported stages: `$match`, `$project`, `$sort`, `$skip` and `$limit`.

use std::cmp::Ordering;

use docsync_codec::{Document, Value};
use docsync_protocol::ID_FIELD;
use docsync_storage::matches;

use crate::error::{SyncError, SyncResult};

/// Runs `pipeline` over `documents`.
pub fn run_pipeline(documents: Vec<Document>, pipeline: &[Document]) -> SyncResult<Vec<Document>> {
    let mut current = documents;
    for stage in pipeline {
        let mut entries = stage.iter();
        let (name, spec) = match (entries.next(), entries.next()) {
            (Some(entry), None) => entry,
            _ => return Err(SyncError::decoding("a pipeline stage must have exactly one field")),
        };
        current = match name.as_str() {
            "$match" => {
                let filter = stage_document(name, spec)?;
                let mut kept = Vec::with_capacity(current.len());
                for document in current {
                    if matches(&document, filter)? {
                        kept.push(document);
                    }
                }
                kept
            }
            "$project" => {
                let projection = Projection::parse(stage_document(name, spec)?)?;
                current.iter().map(|d| projection.apply(d)).collect()
            }
            "$sort" => {
                let keys = stage_document(name, spec)?;
                let mut sorted = current;
                sort_documents(&mut sorted, keys)?;
                sorted
            }
            "$skip" => {
                let n = stage_count(name, spec)?;
                current.into_iter().skip(n).collect()
            }
            "$limit" => {
                let n = stage_count(name, spec)?;
                current.into_iter().take(n).collect()
            }
            other => {
                return Err(SyncError::decoding(format!("unsupported aggregation stage {other}")));
            }
        };
    }
    Ok(current)
}

fn stage_document<'a>(name: &str, spec: &'a Value) -> SyncResult<&'a Document> {
    spec.as_document()
        .ok_or_else(|| SyncError::decoding(format!("{name} expects a document")))
}

fn stage_count(name: &str, spec: &Value) -> SyncResult<usize> {
    spec.as_i64()
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| SyncError::decoding(format!("{name} expects a non-negative integer")))
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        other => other.as_f64().map_or(true, |n| n != 0.0),
    }
}

struct Projection<'a> {
    include: bool,
    include_id: bool,
    paths: Vec<&'a str>,
}

impl<'a> Projection<'a> {
    fn parse(spec: &'a Document) -> SyncResult<Self> {
        let mut include_id = true;
        let mut mode = None;
        let mut paths = Vec::new();
        for (path, flag) in spec {
            if path == ID_FIELD {
                include_id = truthy(flag);
                continue;
            }
            let wanted = truthy(flag);
            match mode {
                None => mode = Some(wanted),
                Some(m) if m != wanted => {
                    return Err(SyncError::decoding("$project cannot mix inclusion and exclusion"));
                }
                Some(_) => {}
            }
            paths.push(path.as_str());
        }
        Ok(Self {
            include: mode.unwrap_or(false),
            include_id,
            paths,
        })
    }

    fn apply(&self, document: &Document) -> Document {
        if self.include {
            let mut projected = Document::new();
            if self.include_id {
                if let Some(id) = document.get(ID_FIELD) {
                    projected.insert(ID_FIELD, id.clone());
                }
            }
            for path in &self.paths {
                if let Some(value) = document.get_path(path) {
                    // Intermediate segments are created by the projection
                    // itself, so they are always documents.
                    let _ = projected.set_path(path, value.clone());
                }
            }
            projected
        } else {
            let mut projected = document.clone();
            if !self.include_id {
                projected.remove(ID_FIELD);
            }
            for path in &self.paths {
                projected.remove_path(path);
            }
            projected
        }
    }
}

fn sort_documents(documents: &mut [Document], keys: &Document) -> SyncResult<()> {
    let mut order = Vec::with_capacity(keys.len());
    for (path, direction) in keys {
        let ascending = match direction.as_i64() {
            Some(1) => true,
            Some(-1) => false,
            _ => return Err(SyncError::decoding("$sort direction must be 1 or -1")),
        };
        order.push((path.as_str(), ascending));
    }
    documents.sort_by(|a, b| {
        for (path, ascending) in &order {
            let left = a.get_path(path).unwrap_or(&Value::Null);
            let right = b.get_path(path).unwrap_or(&Value::Null);
            let ordering = left.compare(right);
            let ordering = if *ascending { ordering } else { ordering.reverse() };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
    Ok(())
}
