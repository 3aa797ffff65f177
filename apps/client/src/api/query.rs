//! Row filters in the REST dialect of the hosted datastore.
//!
//! A [`Query`] renders to query-string pairs (`column=op.value`) for the HTTP
//! client and can also be evaluated against JSON rows, which keeps the
//! in-process backend used by tests honest about what a filter selects.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String),
    Neq(String),
    Gt(String),
    Gte(String),
    Lt(String),
    Lte(String),
    In(Vec<String>),
    IsNull,
    /// Case-insensitive pattern where `*` matches any run of characters.
    ILike(String),
}

impl Filter {
    fn render(&self) -> String {
        match self {
            Filter::Eq(v) => format!("eq.{}", v),
            Filter::Neq(v) => format!("neq.{}", v),
            Filter::Gt(v) => format!("gt.{}", v),
            Filter::Gte(v) => format!("gte.{}", v),
            Filter::Lt(v) => format!("lt.{}", v),
            Filter::Lte(v) => format!("lte.{}", v),
            Filter::In(values) => format!("in.({})", values.join(",")),
            Filter::IsNull => "is.null".to_string(),
            Filter::ILike(pattern) => format!("ilike.{}", pattern),
        }
    }

    fn accepts(&self, field: Option<&Value>) -> bool {
        let actual = field.and_then(scalar_text);
        match (self, actual) {
            (Filter::IsNull, actual) => actual.is_none(),
            (_, None) => false,
            (Filter::Eq(expected), Some(actual)) => actual == *expected,
            (Filter::Neq(expected), Some(actual)) => actual != *expected,
            (Filter::Gt(bound), Some(actual)) => compare_text(&actual, bound) == Ordering::Greater,
            (Filter::Gte(bound), Some(actual)) => compare_text(&actual, bound) != Ordering::Less,
            (Filter::Lt(bound), Some(actual)) => compare_text(&actual, bound) == Ordering::Less,
            (Filter::Lte(bound), Some(actual)) => compare_text(&actual, bound) != Ordering::Greater,
            (Filter::In(values), Some(actual)) => values.iter().any(|v| *v == actual),
            (Filter::ILike(pattern), Some(actual)) => {
                glob_match(&pattern.to_lowercase(), &actual.to_lowercase())
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub select: Option<String>,
    pub filters: Vec<(String, Filter)>,
    /// Disjunction of conjunctions, rendered as one `or=(...)` parameter.
    pub any_of: Vec<Vec<(String, Filter)>>,
    pub order: Vec<(String, bool)>,
    pub limit: Option<u32>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(mut self, columns: impl Into<String>) -> Self {
        self.select = Some(columns.into());
        self
    }

    pub fn filter(mut self, column: impl Into<String>, filter: Filter) -> Self {
        self.filters.push((column.into(), filter));
        self
    }

    pub fn eq(self, column: impl Into<String>, value: impl ToString) -> Self {
        self.filter(column, Filter::Eq(value.to_string()))
    }

    pub fn is_in<V: ToString>(self, column: impl Into<String>, values: &[V]) -> Self {
        let values = values.iter().map(ToString::to_string).collect();
        self.filter(column, Filter::In(values))
    }

    pub fn any_of(mut self, group: Vec<(String, Filter)>) -> Self {
        self.any_of.push(group);
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, ascending: bool) -> Self {
        self.order.push((column.into(), ascending));
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut params = Vec::new();

        if let Some(select) = &self.select {
            params.push(("select".to_string(), select.clone()));
        }

        for (column, filter) in &self.filters {
            params.push((column.clone(), filter.render()));
        }

        if !self.any_of.is_empty() {
            let groups = self
                .any_of
                .iter()
                .map(|group| {
                    let terms = group
                        .iter()
                        .map(|(column, filter)| format!("{}.{}", column, filter.render()))
                        .collect::<Vec<_>>();
                    if terms.len() == 1 {
                        terms.join("")
                    } else {
                        format!("and({})", terms.join(","))
                    }
                })
                .collect::<Vec<_>>();
            params.push(("or".to_string(), format!("({})", groups.join(","))));
        }

        if !self.order.is_empty() {
            let order = self
                .order
                .iter()
                .map(|(column, asc)| format!("{}.{}", column, if *asc { "asc" } else { "desc" }))
                .collect::<Vec<_>>()
                .join(",");
            params.push(("order".to_string(), order));
        }

        if let Some(limit) = self.limit {
            params.push(("limit".to_string(), limit.to_string()));
        }

        params
    }

    pub fn matches(&self, row: &Value) -> bool {
        let all = self
            .filters
            .iter()
            .all(|(column, filter)| filter.accepts(row.get(column)));
        let any = self.any_of.is_empty()
            || self.any_of.iter().any(|group| {
                group
                    .iter()
                    .all(|(column, filter)| filter.accepts(row.get(column)))
            });
        all && any
    }

    /// Filters, orders and truncates `rows` the way the backend would.
    pub fn apply(&self, rows: impl IntoIterator<Item = Value>) -> Vec<Value> {
        let mut selected = rows
            .into_iter()
            .filter(|row| self.matches(row))
            .collect::<Vec<_>>();

        if !self.order.is_empty() {
            selected.sort_by(|a, b| {
                for (column, ascending) in &self.order {
                    let left = a.get(column).and_then(scalar_text).unwrap_or_default();
                    let right = b.get(column).and_then(scalar_text).unwrap_or_default();
                    let ord = compare_text(&left, &right);
                    let ord = if *ascending { ord } else { ord.reverse() };
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            });
        }

        if let Some(limit) = self.limit {
            selected.truncate(limit as usize);
        }

        selected
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

fn compare_text(left: &str, right: &str) -> Ordering {
    if let (Ok(l), Ok(r)) = (
        DateTime::parse_from_rfc3339(left),
        DateTime::parse_from_rfc3339(right),
    ) {
        return l.with_timezone(&Utc).cmp(&r.with_timezone(&Utc));
    }

    if let (Ok(l), Ok(r)) = (left.parse::<f64>(), right.parse::<f64>()) {
        return l.partial_cmp(&r).unwrap_or(Ordering::Equal);
    }

    left.cmp(right)
}

fn glob_match(pattern: &str, text: &str) -> bool {
    let parts = pattern.split('*').collect::<Vec<_>>();
    if parts.len() == 1 {
        return pattern == text;
    }

    let mut rest = text;
    for (idx, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if idx == 0 {
            match rest.strip_prefix(part) {
                Some(tail) => rest = tail,
                None => return false,
            }
        } else if idx == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_rest_params() {
        let query = Query::new()
            .select("*,author:profiles(*)")
            .eq("post_id", "p1")
            .is_in("status", &["pending", "accepted"])
            .order_by("created_at", false)
            .limit(20);

        assert_eq!(
            query.to_params(),
            vec![
                ("select".to_string(), "*,author:profiles(*)".to_string()),
                ("post_id".to_string(), "eq.p1".to_string()),
                ("status".to_string(), "in.(pending,accepted)".to_string()),
                ("order".to_string(), "created_at.desc".to_string()),
                ("limit".to_string(), "20".to_string()),
            ]
        );
    }

    #[test]
    fn renders_two_party_disjunction() {
        let query = Query::new()
            .any_of(vec![
                ("sender_id".to_string(), Filter::Eq("a".to_string())),
                ("receiver_id".to_string(), Filter::Eq("b".to_string())),
            ])
            .any_of(vec![
                ("sender_id".to_string(), Filter::Eq("b".to_string())),
                ("receiver_id".to_string(), Filter::Eq("a".to_string())),
            ]);

        assert_eq!(
            query.to_params(),
            vec![(
                "or".to_string(),
                "(and(sender_id.eq.a,receiver_id.eq.b),and(sender_id.eq.b,receiver_id.eq.a))"
                    .to_string()
            )]
        );
    }

    #[test]
    fn evaluates_filters_order_and_limit() {
        let rows = vec![
            json!({ "id": 1, "expires_at": "2026-10-19T10:00:00Z", "user": "a" }),
            json!({ "id": 2, "expires_at": "2026-10-19T12:00:00.250Z", "user": "b" }),
            json!({ "id": 3, "expires_at": "2026-10-19T14:00:00Z", "user": "a" }),
        ];

        let query = Query::new()
            .filter("expires_at", Filter::Gt("2026-10-19T11:00:00Z".to_string()))
            .order_by("expires_at", false)
            .limit(5);
        let ids = query
            .apply(rows.clone())
            .iter()
            .map(|r| r["id"].as_i64().unwrap_or_default())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![3, 2]);

        let by_user = Query::new().eq("user", "a").limit(1);
        assert_eq!(by_user.apply(rows).len(), 1);
    }

    #[test]
    fn ilike_matches_prefix_case_insensitively() {
        let query = Query::new().filter("username", Filter::ILike("Ali*".to_string()));
        assert!(query.matches(&json!({ "username": "alice" })));
        assert!(!query.matches(&json!({ "username": "malice" })));
        assert!(Query::new()
            .filter("bio", Filter::IsNull)
            .matches(&json!({ "bio": null })));
    }
}
