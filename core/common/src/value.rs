//! Attribute values carried by remote objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::ObjectRef;

/// Attribute map of an object.
pub type Attributes = BTreeMap<String, Value>;

/// Pending changes of an object, keyed by attribute name.
pub type Delta = BTreeMap<String, FieldOp>;

/// A single attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Number(f64),
    String(String),
    Date(DateTime<Utc>),
    Bytes(Vec<u8>),
    GeoPoint(GeoPoint),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
    /// Reference to another object.
    Pointer(ObjectRef),
    /// One-to-many relation handle.
    Relation(RelationRef),
}

impl Value {
    /// String contents, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Integer contents, if this is an integer.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Boolean contents, if this is a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Pointer target, if this is a pointer.
    pub fn as_pointer(&self) -> Option<&ObjectRef> {
        match self {
            Value::Pointer(r) => Some(r),
            _ => None,
        }
    }

    /// Collect every object reference reachable inside this value.
    pub fn collect_refs(&self, out: &mut Vec<ObjectRef>) {
        match self {
            Value::Pointer(r) => out.push(r.clone()),
            Value::Array(items) => items.iter().for_each(|v| v.collect_refs(out)),
            Value::Object(map) => map.values().for_each(|v| v.collect_refs(out)),
            _ => {}
        }
    }

    /// Replace every pointer equal to `from` with `to`.
    ///
    /// Returns true if anything changed.
    pub fn rewrite_ref(&mut self, from: &ObjectRef, to: &ObjectRef) -> bool {
        match self {
            Value::Pointer(r) if r == from => {
                *r = to.clone();
                true
            }
            Value::Array(items) => items
                .iter_mut()
                .fold(false, |changed, v| v.rewrite_ref(from, to) || changed),
            Value::Object(map) => map
                .values_mut()
                .fold(false, |changed, v| v.rewrite_ref(from, to) || changed),
            _ => false,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<ObjectRef> for Value {
    fn from(r: ObjectRef) -> Self {
        Value::Pointer(r)
    }
}

/// Operation applied to one attribute by a save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum FieldOp {
    /// Set the attribute to a value.
    Set(Value),
    /// Remove the attribute.
    Unset,
}

impl FieldOp {
    /// Collect object references carried by this operation.
    pub fn collect_refs(&self, out: &mut Vec<ObjectRef>) {
        if let FieldOp::Set(v) = self {
            v.collect_refs(out);
        }
    }

    /// Rewrite pointer targets carried by this operation.
    pub fn rewrite_ref(&mut self, from: &ObjectRef, to: &ObjectRef) -> bool {
        match self {
            FieldOp::Set(v) => v.rewrite_ref(from, to),
            FieldOp::Unset => false,
        }
    }
}

/// Handle to a one-to-many relation stored on the remote service.
///
/// Members are not materialized on the client; the handle only records the
/// class of objects the relation points to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationRef {
    pub target_class: String,
}

const EARTH_RADIUS_KM: f64 = 6371.0;
const EARTH_RADIUS_MILES: f64 = 3958.8;

/// A latitude/longitude pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    latitude: f64,
    longitude: f64,
}

impl GeoPoint {
    /// Create a geo point.
    ///
    /// # Errors
    /// - Latitude outside [-90, 90] or longitude outside [-180, 180]
    pub fn new(latitude: f64, longitude: f64) -> crate::Result<Self> {
        if !(-90.0..=90.0).contains(&latitude) {
            return Err(crate::Error::InvalidInput(format!(
                "Latitude {} out of range",
                latitude
            )));
        }
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(crate::Error::InvalidInput(format!(
                "Longitude {} out of range",
                longitude
            )));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    /// Great-circle distance in radians (haversine).
    pub fn distance_in_radians(&self, other: &GeoPoint) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let dlat = lat2 - lat1;
        let dlon = (other.longitude - self.longitude).to_radians();
        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * a.sqrt().min(1.0).asin()
    }

    pub fn distance_in_kilometers(&self, other: &GeoPoint) -> f64 {
        self.distance_in_radians(other) * EARTH_RADIUS_KM
    }

    pub fn distance_in_miles(&self, other: &GeoPoint) -> f64 {
        self.distance_in_radians(other) * EARTH_RADIUS_MILES
    }
}
