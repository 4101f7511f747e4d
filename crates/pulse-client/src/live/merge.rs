//! Record-level merge helpers for live collections.

use serde_json::Value;

/// Position of the record whose `id_field` equals `id`.
pub(crate) fn find_index(records: &[Value], id_field: &str, id: &Value) -> Option<usize> {
    records.iter().position(|record| record.get(id_field) == Some(id))
}

/// Copy every field of `update` into `current`, leaving fields the
/// update does not mention untouched. Non-object values are ignored;
/// partial updates are the norm on the stream.
pub(crate) fn merge_record(current: &mut Value, update: &Value) {
    if let (Some(target), Some(source)) = (current.as_object_mut(), update.as_object()) {
        for (key, value) in source {
            target.insert(key.clone(), value.clone());
        }
    }
}

/// Fold `incoming` into `target` keyed by `id_field`: records with a
/// known identifier merge field-by-field into the existing entry,
/// everything else appends. Existing order is preserved.
pub(crate) fn insert_without_duplication(target: &mut Vec<Value>, incoming: Vec<Value>, id_field: &str) {
    for record in incoming {
        let Some(id) = record.get(id_field).cloned() else {
            target.push(record);
            continue;
        };
        match find_index(target, id_field, &id) {
            Some(index) => merge_record(&mut target[index], &record),
            None => target.push(record),
        }
    }
}
