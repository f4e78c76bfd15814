//! Strategic merge patching over JSON values.
//!
//! A plain JSON merge patch replaces arrays wholesale, which silently
//! drops or duplicates named sub-objects (volumes, network interfaces).
//! This merge is object-aware: arrays whose elements are all objects
//! carrying a `name` field merge element-wise by that name.

use serde_json::Value;

/// Key field identifying elements of a named list.
const MERGE_KEY: &str = "name";

/// Applies `patch` on top of `base` and returns the merged value.
pub fn strategic_merge(base: Value, patch: &Value) -> Value {
    match (base, patch) {
        (Value::Object(mut base_map), Value::Object(patch_map)) => {
            for (k, patch_val) in patch_map {
                if patch_val.is_null() {
                    base_map.remove(k);
                    continue;
                }
                let merged = match base_map.remove(k) {
                    Some(base_val) => strategic_merge(base_val, patch_val),
                    None => patch_val.clone(),
                };
                base_map.insert(k.clone(), merged);
            }
            Value::Object(base_map)
        }
        (Value::Array(base_items), Value::Array(patch_items))
            if is_named_list(&base_items) && patch_items.iter().all(has_merge_key) =>
        {
            merge_named_list(base_items, patch_items)
        }
        // Everything else (scalars, positional arrays) is replaced.
        (_, patch_val) => patch_val.clone(),
    }
}

fn has_merge_key(value: &Value) -> bool {
    value
        .as_object()
        .map(|m| m.get(MERGE_KEY).map(Value::is_string).unwrap_or(false))
        .unwrap_or(false)
}

fn is_named_list(items: &[Value]) -> bool {
    !items.is_empty() && items.iter().all(has_merge_key)
}

fn element_name(value: &Value) -> Option<&str> {
    value.as_object()?.get(MERGE_KEY)?.as_str()
}

/// Merges patch elements into base elements by their `name` key. Base
/// ordering is preserved; unmatched patch elements append.
fn merge_named_list(base_items: Vec<Value>, patch_items: &[Value]) -> Value {
    let mut merged: Vec<Value> = Vec::with_capacity(base_items.len());
    let mut consumed = vec![false; patch_items.len()];

    for base_item in base_items {
        let name = element_name(&base_item).map(str::to_owned);
        let patch_idx = name.as_deref().and_then(|n| {
            patch_items
                .iter()
                .position(|p| element_name(p) == Some(n))
        });
        match patch_idx {
            Some(i) => {
                consumed[i] = true;
                merged.push(strategic_merge(base_item, &patch_items[i]));
            }
            None => merged.push(base_item),
        }
    }

    for (i, patch_item) in patch_items.iter().enumerate() {
        if !consumed[i] {
            merged.push(patch_item.clone());
        }
    }

    Value::Array(merged)
}
