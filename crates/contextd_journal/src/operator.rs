//! Update operators.
//!
//! Every replica resolves an update by applying the same operator document to
//! the same `before` image, so application is a pure function of its inputs.
//! Operators are applied in canonical key order, and within one operator in
//! canonical path order.

use crate::error::{JournalError, JournalResult};
use contextd_codec::{cmp_keys, Value};
use std::cmp::Ordering;

const ID_FIELD: &str = "_id";

/// Applies an update operator to a document, returning the new document.
///
/// An operator with no `$`-prefixed keys replaces the document, keeping the
/// original `_id`. Otherwise each key names an operator taking a map of
/// dotted field paths: `$set`, `$unset`, `$inc`, `$mul`, `$min`, `$max`,
/// `$rename`, `$push`, `$addToSet`, `$pop`, `$pull`.
///
/// # Errors
///
/// Returns [`JournalError::Request`] for unknown operators, a mix of
/// operator and plain keys, writes to `_id`, or type mismatches.
pub fn apply_operator(before: &Value, operator: &Value) -> JournalResult<Value> {
    if before.as_map().is_none() {
        return Err(JournalError::request("before must be a document"));
    }
    let ops = operator
        .as_map()
        .ok_or_else(|| JournalError::request("operator must be a document"))?;

    let dollar = ops.iter().filter(|(k, _)| k.starts_with('$')).count();
    if dollar == 0 {
        let mut replacement = operator.clone();
        if let Some(id) = before.get(ID_FIELD) {
            replacement.insert(ID_FIELD, id.clone());
        }
        return Ok(replacement);
    }
    if dollar != ops.len() {
        return Err(JournalError::request(
            "operator mixes update operators and plain fields",
        ));
    }

    let mut ordered: Vec<&(String, Value)> = ops.iter().collect();
    ordered.sort_by(|a, b| cmp_keys(&a.0, &b.0));

    let mut doc = before.clone();
    for (name, args) in ordered {
        let fields = args
            .as_map()
            .ok_or_else(|| JournalError::request(format!("{name} expects a document")))?;
        let mut fields: Vec<&(String, Value)> = fields.iter().collect();
        fields.sort_by(|a, b| cmp_keys(&a.0, &b.0));

        for (path, arg) in fields {
            guard_id(path)?;
            apply_one(&mut doc, name, path, arg)?;
        }
    }
    Ok(doc)
}

fn apply_one(doc: &mut Value, name: &str, path: &str, arg: &Value) -> JournalResult<()> {
    match name {
        "$set" => set(doc, path, arg.clone()),
        "$unset" => {
            unset(doc, path)?;
            Ok(())
        }
        "$inc" => arithmetic(doc, path, arg, name, i64::checked_add, |a, b| a + b),
        "$mul" => arithmetic(doc, path, arg, name, i64::checked_mul, |a, b| a * b),
        "$min" => bound(doc, path, arg, Ordering::Less),
        "$max" => bound(doc, path, arg, Ordering::Greater),
        "$rename" => {
            let to = arg
                .as_text()
                .ok_or_else(|| JournalError::request("$rename target must be text"))?;
            guard_id(to)?;
            if let Some(value) = unset(doc, path)? {
                set(doc, to, value)?;
            }
            Ok(())
        }
        "$push" => {
            let items = each(arg);
            with_array(doc, path, name, |array| array.extend(items))
        }
        "$addToSet" => {
            let items = each(arg);
            with_array(doc, path, name, |array| {
                for item in items {
                    if !array.contains(&item) {
                        array.push(item);
                    }
                }
            })
        }
        "$pop" => {
            let first = match arg.as_integer() {
                Some(1) => false,
                Some(-1) => true,
                _ => return Err(JournalError::request("$pop expects 1 or -1")),
            };
            with_array(doc, path, name, |array| {
                if first && !array.is_empty() {
                    array.remove(0);
                } else {
                    array.pop();
                }
            })
        }
        "$pull" => with_array(doc, path, name, |array| array.retain(|item| item != arg)),
        other => Err(JournalError::request(format!("unknown operator {other}"))),
    }
}

fn guard_id(path: &str) -> JournalResult<()> {
    if path == ID_FIELD || path.starts_with("_id.") {
        return Err(JournalError::request("_id cannot be modified"));
    }
    Ok(())
}

/// `$push`/`$addToSet` accept either one value or `{"$each": [..]}`.
fn each(arg: &Value) -> Vec<Value> {
    if let Some(Value::Array(items)) = arg.get("$each") {
        if arg.as_map().is_some_and(|m| m.len() == 1) {
            return items.clone();
        }
    }
    vec![arg.clone()]
}

/// Integer operands stay exact; a float on either side makes the result a
/// float.
fn arithmetic(
    doc: &mut Value,
    path: &str,
    arg: &Value,
    name: &str,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> JournalResult<()> {
    if !matches!(arg, Value::Integer(_) | Value::Float(_)) {
        return Err(JournalError::request(format!("{name} expects a number")));
    }
    let (parent, key) = parent_mut(doc, path)?;
    let current = match child(parent, key) {
        None | Some(Value::Null) => Value::Integer(0),
        Some(n @ (Value::Integer(_) | Value::Float(_))) => n.clone(),
        Some(other) => {
            return Err(JournalError::request(format!(
                "{name} on {path}: field is {}",
                other.type_name()
            )))
        }
    };
    let overflow = || JournalError::request(format!("{name} on {path} overflows"));
    let result = match (&current, arg) {
        (Value::Integer(a), Value::Integer(b)) => {
            Value::Integer(int_op(*a, *b).ok_or_else(overflow)?)
        }
        _ => {
            let (a, b) = current.as_f64().zip(arg.as_f64()).ok_or_else(overflow)?;
            let f = float_op(a, b);
            if !f.is_finite() {
                return Err(overflow());
            }
            Value::number(f)
        }
    };
    put(parent, key, result, path)
}

fn bound(doc: &mut Value, path: &str, arg: &Value, keep_if: Ordering) -> JournalResult<()> {
    let (parent, key) = parent_mut(doc, path)?;
    let replace = match child(parent, key) {
        None | Some(Value::Null) => true,
        Some(current) => compare(arg, current, path)? == keep_if,
    };
    if replace {
        put(parent, key, arg.clone(), path)?;
    }
    Ok(())
}

fn compare(a: &Value, b: &Value, path: &str) -> JournalResult<Ordering> {
    match (a, b) {
        (Value::Integer(x), Value::Integer(y)) => Ok(x.cmp(y)),
        (Value::Integer(_) | Value::Float(_), Value::Integer(_) | Value::Float(_)) => a
            .as_f64()
            .zip(b.as_f64())
            .and_then(|(x, y)| x.partial_cmp(&y))
            .ok_or_else(|| JournalError::request(format!("cannot compare numbers at {path}"))),
        (Value::Timestamp(x), Value::Timestamp(y)) => Ok(x.cmp(y)),
        (Value::Text(x), Value::Text(y)) => Ok(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Ok(x.cmp(y)),
        _ => Err(JournalError::request(format!(
            "cannot compare {} with {} at {path}",
            a.type_name(),
            b.type_name()
        ))),
    }
}

fn with_array(
    doc: &mut Value,
    path: &str,
    name: &str,
    f: impl FnOnce(&mut Vec<Value>),
) -> JournalResult<()> {
    let (parent, key) = parent_mut(doc, path)?;
    let mut array = match child(parent, key) {
        None => Vec::new(),
        Some(Value::Array(items)) => items.clone(),
        Some(other) => {
            return Err(JournalError::request(format!(
                "{name} on {path}: field is {}",
                other.type_name()
            )))
        }
    };
    f(&mut array);
    put(parent, key, Value::Array(array), path)
}

fn set(doc: &mut Value, path: &str, value: Value) -> JournalResult<()> {
    let (parent, key) = parent_mut(doc, path)?;
    put(parent, key, value, path)
}

/// Removes the field at `path`, returning it. Missing paths are a no-op.
fn unset(doc: &mut Value, path: &str) -> JournalResult<Option<Value>> {
    let segments = split(path)?;
    let Some((last, parents)) = segments.split_last() else {
        return Ok(None);
    };
    let mut node = doc;
    for segment in parents {
        node = match node {
            Value::Map(_) => match node.get_mut(segment) {
                Some(next) => next,
                None => return Ok(None),
            },
            Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                Some(next) => next,
                None => return Ok(None),
            },
            _ => return Ok(None),
        };
    }
    Ok(match node {
        Value::Map(_) => node.remove(last),
        Value::Array(items) => last
            .parse::<usize>()
            .ok()
            .and_then(|i| items.get_mut(i))
            .map(|slot| std::mem::replace(slot, Value::Null)),
        _ => None,
    })
}

fn split(path: &str) -> JournalResult<Vec<&str>> {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(JournalError::request(format!("invalid field path {path:?}")));
    }
    Ok(segments)
}

/// Walks to the container holding the last path segment, creating
/// intermediate documents as needed.
fn parent_mut<'a, 'p>(doc: &'a mut Value, path: &'p str) -> JournalResult<(&'a mut Value, &'p str)> {
    let segments = split(path)?;
    let Some((last, parents)) = segments.split_last() else {
        return Err(JournalError::request("empty field path"));
    };
    let mut node = doc;
    for segment in parents {
        node = descend(node, segment, path)?;
    }
    Ok((node, *last))
}

fn descend<'a>(node: &'a mut Value, segment: &str, path: &str) -> JournalResult<&'a mut Value> {
    match node {
        Value::Map(pairs) => {
            let index = match pairs.iter().position(|(k, _)| k == segment) {
                Some(index) => index,
                None => {
                    let index =
                        pairs.partition_point(|(k, _)| cmp_keys(k, segment) == Ordering::Less);
                    pairs.insert(index, (segment.to_string(), Value::empty_map()));
                    index
                }
            };
            Ok(&mut pairs[index].1)
        }
        Value::Array(items) => segment
            .parse::<usize>()
            .ok()
            .and_then(|i| items.get_mut(i))
            .ok_or_else(|| JournalError::request(format!("{path}: no element {segment}"))),
        other => Err(JournalError::request(format!(
            "{path}: cannot descend into {}",
            other.type_name()
        ))),
    }
}

fn child<'a>(parent: &'a Value, key: &str) -> Option<&'a Value> {
    match parent {
        Value::Map(_) => parent.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    }
}

fn put(parent: &mut Value, key: &str, value: Value, path: &str) -> JournalResult<()> {
    match parent {
        Value::Map(_) => {
            parent.insert(key, value);
            Ok(())
        }
        Value::Array(items) => {
            let slot = key
                .parse::<usize>()
                .ok()
                .and_then(|i| items.get_mut(i))
                .ok_or_else(|| JournalError::request(format!("{path}: no element {key}")))?;
            *slot = value;
            Ok(())
        }
        other => Err(JournalError::request(format!(
            "{path}: cannot set a field on {}",
            other.type_name()
        ))),
    }
}
