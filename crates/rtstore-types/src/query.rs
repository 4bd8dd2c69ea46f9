//! Filter, sort, and paginate opaque JSON item payloads.
//!
//! Every item is `(key, value)` with `value` an opaque byte string; this
//! module only looks inside `value` as JSON when a query/order actually
//! references a field.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::Item;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Query {
    #[serde(default)]
    pub field: String,
    #[serde(default = "default_operator")]
    pub operator: Operator,
    #[serde(default)]
    pub value: String,
}

fn default_operator() -> Operator {
    Operator::Eq
}

impl Query {
    /// An all-zero query: empty field, no value. Matches every item.
    pub fn is_empty(&self) -> bool {
        self.field.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Order {
    #[serde(default, rename = "orderBy")]
    pub order_by: String,
    #[serde(default)]
    pub ascending: bool,
}

impl Order {
    /// An all-zero order: empty `orderBy`. Preserves iteration order.
    pub fn is_empty(&self) -> bool {
        self.order_by.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Limit {
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

impl Limit {
    /// An all-zero limit: no limit and no offset. Returns everything.
    pub fn is_empty(&self) -> bool {
        self.limit == 0 && self.offset == 0
    }
}

fn resolve<'a>(value: &'a Value, field: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in field.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Does `item`'s JSON payload satisfy `query`?
///
/// An item whose payload does not parse as JSON never matches a non-empty
/// query (it is excluded from results, per the documented `DecodeError`
/// handling for filtering).
pub fn matches_query(item: &Item, query: &Query) -> bool {
    if query.is_empty() {
        return true;
    }
    let Ok(parsed) = serde_json::from_slice::<Value>(&item.value) else {
        return false;
    };
    let resolved = resolve(&parsed, &query.field);
    match resolved {
        None | Some(Value::Null) => query.operator == Operator::Eq && query.value.is_empty(),
        Some(Value::String(s)) => compare_against(s.as_str().cmp(query.value.as_str()), query.operator),
        Some(Value::Number(n)) => {
            let Some(actual) = n.as_f64() else { return false };
            let Ok(expected) = query.value.parse::<f64>() else {
                return false;
            };
            let Some(ordering) = actual.partial_cmp(&expected) else {
                return false;
            };
            compare_against(ordering, query.operator)
        }
        _ => false,
    }
}

fn compare_against(ordering: Ordering, operator: Operator) -> bool {
    match operator {
        Operator::Eq => ordering == Ordering::Equal,
        Operator::Lt => ordering == Ordering::Less,
        Operator::Le => ordering != Ordering::Greater,
        Operator::Gt => ordering == Ordering::Greater,
        Operator::Ge => ordering != Ordering::Less,
    }
}

/// Field value used for ordering: `None` for missing/unparseable/cross-type
/// fields, which are treated as "undefined" and sort first ascending.
enum SortKey {
    Undefined,
    Number(f64),
    Text(String),
}

fn sort_key(item: &Item, field: &str) -> SortKey {
    let Ok(parsed) = serde_json::from_slice::<Value>(&item.value) else {
        return SortKey::Undefined;
    };
    match resolve(&parsed, field) {
        Some(Value::Number(n)) => n.as_f64().map_or(SortKey::Undefined, SortKey::Number),
        Some(Value::String(s)) => SortKey::Text(s.clone()),
        _ => SortKey::Undefined,
    }
}

fn compare_sort_keys(a: &SortKey, b: &SortKey) -> Ordering {
    match (a, b) {
        (SortKey::Undefined, SortKey::Undefined) => Ordering::Equal,
        (SortKey::Undefined, _) => Ordering::Less,
        (_, SortKey::Undefined) => Ordering::Greater,
        (SortKey::Number(x), SortKey::Number(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        (SortKey::Text(x), SortKey::Text(y)) => x.cmp(y),
        // Cross-type comparisons: spec treats them as "undefined"; tie as equal
        // so a stable sort leaves their relative iteration order untouched.
        _ => Ordering::Equal,
    }
}

/// Sort `items` in place per `order`. A no-op if `order` is empty.
pub fn apply_order(items: &mut [Item], order: &Order) {
    if order.is_empty() {
        return;
    }
    items.sort_by(|a, b| {
        let ordering = compare_sort_keys(&sort_key(a, &order.order_by), &sort_key(b, &order.order_by));
        if order.ascending { ordering } else { ordering.reverse() }
    });
}

/// Slice `items` per `limit`. A no-op if `limit` is empty.
pub fn apply_limit(items: Vec<Item>, limit: &Limit) -> Vec<Item> {
    if limit.is_empty() {
        return items;
    }
    if limit.offset >= items.len() {
        return Vec::new();
    }
    let end = if limit.limit == 0 {
        items.len()
    } else {
        items.len().min(limit.offset + limit.limit)
    };
    items[limit.offset..end].to_vec()
}

/// Full filter → order → limit pipeline over an already-materialized item set.
pub fn apply(mut items: Vec<Item>, query: &Query, order: &Order, limit: &Limit) -> Vec<Item> {
    if !query.is_empty() {
        items.retain(|item| matches_query(item, query));
    }
    apply_order(&mut items, order);
    apply_limit(items, limit)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(key: &str, json: &str) -> Item {
        Item { key: key.to_string(), value: json.as_bytes().to_vec() }
    }

    #[test]
    fn empty_query_matches_everything() {
        let q = Query::default();
        assert!(matches_query(&item("a", "{}"), &q));
        assert!(matches_query(&item("a", "not json"), &q));
    }

    #[test]
    fn string_equality() {
        let q = Query { field: "city".into(), operator: Operator::Eq, value: "NYC".into() };
        assert!(matches_query(&item("a", r#"{"city":"NYC"}"#), &q));
        assert!(!matches_query(&item("a", r#"{"city":"LA"}"#), &q));
    }

    #[test]
    fn missing_field_matches_only_empty_eq() {
        let q = Query { field: "age".into(), operator: Operator::Eq, value: String::new() };
        assert!(matches_query(&item("a", r#"{"city":"NYC"}"#), &q));

        let q2 = Query { field: "age".into(), operator: Operator::Eq, value: "5".into() };
        assert!(!matches_query(&item("a", r#"{"city":"NYC"}"#), &q2));
    }

    #[test]
    fn numeric_comparison_parses_value_string() {
        let q = Query { field: "n".into(), operator: Operator::Ge, value: "2".into() };
        assert!(matches_query(&item("a", r#"{"n":3}"#), &q));
        assert!(!matches_query(&item("a", r#"{"n":1}"#), &q));
    }

    #[test]
    fn unparseable_numeric_value_never_matches() {
        let q = Query { field: "n".into(), operator: Operator::Eq, value: "not-a-number".into() };
        assert!(!matches_query(&item("a", r#"{"n":1}"#), &q));
    }

    #[test]
    fn order_sorts_ascending_with_missing_first() {
        let mut items = vec![item("a", r#"{"n":3}"#), item("b", "{}"), item("c", r#"{"n":1}"#)];
        apply_order(&mut items, &Order { order_by: "n".into(), ascending: true });
        let keys: Vec<&str> = items.iter().map(|i| i.key.as_str()).collect();
        assert_eq!(keys, vec!["b", "c", "a"]);
    }

    #[test]
    fn order_sorts_descending_with_missing_last() {
        let mut items = vec![item("a", r#"{"n":3}"#), item("b", "{}"), item("c", r#"{"n":1}"#)];
        apply_order(&mut items, &Order { order_by: "n".into(), ascending: false });
        let keys: Vec<&str> = items.iter().map(|i| i.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "c", "b"]);
    }

    #[test]
    fn limit_with_offset_past_end_is_empty() {
        let items = vec![item("a", "{}"), item("b", "{}")];
        let out = apply_limit(items, &Limit { limit: 5, offset: 10 });
        assert!(out.is_empty());
    }

    #[test]
    fn zero_limit_with_offset_returns_rest() {
        let items = (0..5).map(|i| item(&i.to_string(), "{}")).collect::<Vec<_>>();
        let out = apply_limit(items, &Limit { limit: 0, offset: 2 });
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn pipeline_filters_then_orders_then_slices() {
        let items = vec![
            item("a", r#"{"city":"NYC","n":3}"#),
            item("b", r#"{"city":"LA","n":1}"#),
            item("c", r#"{"city":"NYC","n":1}"#),
        ];
        let q = Query { field: "city".into(), operator: Operator::Eq, value: "NYC".into() };
        let order = Order { order_by: "n".into(), ascending: true };
        let out = apply(items, &q, &order, &Limit::default());
        let keys: Vec<&str> = out.iter().map(|i| i.key.as_str()).collect();
        assert_eq!(keys, vec!["c", "a"]);
    }
}
