//! Query descriptions shared by the remote store and the local cache.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use eaves_common::{validate_class_name, Attributes, Result, Value};

/// Reserved key matching the object id instead of an attribute.
pub const OBJECT_ID_KEY: &str = "objectId";

/// Comparison applied to a single key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum ConstraintOp {
    Equal(Value),
    NotEqual(Value),
    LessThan(Value),
    GreaterThan(Value),
    Exists(bool),
    ContainedIn(Vec<Value>),
}

/// A constraint on one key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    pub key: String,
    pub op: ConstraintOp,
}

/// Sort order on one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub key: String,
    pub descending: bool,
}

/// A query over one class.
///
/// Constraints are conjunctive. Two queries with the same class, constraints,
/// ordering and window have the same [`signature`](QuerySpec::signature),
/// which keys the local query result cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub class_name: String,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    #[serde(default)]
    pub order: Vec<OrderBy>,
    pub limit: Option<usize>,
    #[serde(default)]
    pub skip: usize,
}

impl QuerySpec {
    /// Create an unconstrained query over a class.
    ///
    /// # Errors
    /// - Invalid class name
    pub fn new(class_name: impl Into<String>) -> Result<Self> {
        let class_name = class_name.into();
        validate_class_name(&class_name)?;
        Ok(Self {
            class_name,
            constraints: Vec::new(),
            order: Vec::new(),
            limit: None,
            skip: 0,
        })
    }

    fn with(mut self, key: impl Into<String>, op: ConstraintOp) -> Self {
        self.constraints.push(Constraint {
            key: key.into(),
            op,
        });
        self
    }

    pub fn equal_to(self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(key, ConstraintOp::Equal(value.into()))
    }

    pub fn not_equal_to(self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(key, ConstraintOp::NotEqual(value.into()))
    }

    pub fn less_than(self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(key, ConstraintOp::LessThan(value.into()))
    }

    pub fn greater_than(self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(key, ConstraintOp::GreaterThan(value.into()))
    }

    pub fn exists(self, key: impl Into<String>) -> Self {
        self.with(key, ConstraintOp::Exists(true))
    }

    pub fn does_not_exist(self, key: impl Into<String>) -> Self {
        self.with(key, ConstraintOp::Exists(false))
    }

    pub fn contained_in(self, key: impl Into<String>, values: Vec<Value>) -> Self {
        self.with(key, ConstraintOp::ContainedIn(values))
    }

    pub fn order_by_ascending(mut self, key: impl Into<String>) -> Self {
        self.order.push(OrderBy {
            key: key.into(),
            descending: false,
        });
        self
    }

    pub fn order_by_descending(mut self, key: impl Into<String>) -> Self {
        self.order.push(OrderBy {
            key: key.into(),
            descending: true,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    /// Stable string identifying this query for caching.
    pub fn signature(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| eaves_common::Error::Serialization(e.to_string()))
    }

    /// Whether an object satisfies every constraint.
    pub fn matches(&self, object_id: Option<&str>, attributes: &Attributes) -> bool {
        self.constraints.iter().all(|c| {
            let id_value;
            let value = if c.key == OBJECT_ID_KEY {
                id_value = object_id.map(|id| Value::String(id.to_string()));
                id_value.as_ref()
            } else {
                attributes.get(&c.key)
            };
            constraint_holds(&c.op, value)
        })
    }

    /// Sort a matching set by the query order and apply skip/limit.
    pub fn apply_window<T>(&self, mut items: Vec<T>, attributes_of: impl Fn(&T) -> &Attributes) -> Vec<T> {
        if !self.order.is_empty() {
            items.sort_by(|a, b| {
                let (a, b) = (attributes_of(a), attributes_of(b));
                for order in &self.order {
                    let ord = match (a.get(&order.key), b.get(&order.key)) {
                        (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
                        (Some(_), None) => Ordering::Greater,
                        (None, Some(_)) => Ordering::Less,
                        (None, None) => Ordering::Equal,
                    };
                    let ord = if order.descending { ord.reverse() } else { ord };
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            });
        }
        let iter = items.into_iter().skip(self.skip);
        match self.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        }
    }
}

fn constraint_holds(op: &ConstraintOp, value: Option<&Value>) -> bool {
    match op {
        ConstraintOp::Exists(expected) => value.is_some() == *expected,
        ConstraintOp::Equal(expected) => value == Some(expected),
        ConstraintOp::NotEqual(expected) => value != Some(expected),
        ConstraintOp::LessThan(bound) => {
            matches!(value.and_then(|v| compare_values(v, bound)), Some(Ordering::Less))
        }
        ConstraintOp::GreaterThan(bound) => {
            matches!(value.and_then(|v| compare_values(v, bound)), Some(Ordering::Greater))
        }
        ConstraintOp::ContainedIn(values) => value.is_some_and(|v| values.contains(v)),
    }
}

/// Order two values of comparable types.
///
/// Integers and numbers compare numerically with each other. Values of
/// unrelated types are unordered.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Integer(x), Value::Integer(y)) => Some(x.cmp(y)),
        (Value::Integer(x), Value::Number(y)) => (*x as f64).partial_cmp(y),
        (Value::Number(x), Value::Integer(y)) => x.partial_cmp(&(*y as f64)),
        (Value::Number(x), Value::Number(y)) => x.partial_cmp(y),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Date(x), Value::Date(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
