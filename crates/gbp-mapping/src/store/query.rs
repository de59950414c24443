//! Tenant scoping, filtering, sorting, pagination and field projection

use super::PolicyObject;
use gbp_common::{GbpError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Sort key for list queries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub field: String,
    pub ascending: bool,
}

/// List query. The default lists everything, ordered by id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Query {
    /// Only objects of this tenant
    pub tenant_id: Option<String>,
    /// Field name -> accepted values. Array fields match when any element
    /// is accepted.
    pub filters: BTreeMap<String, Vec<Value>>,
    /// Fields kept by projection; empty keeps all
    pub fields: Vec<String>,
    /// Sort keys; `id` is always appended as the final tiebreaker
    pub sorts: Vec<SortKey>,
    pub limit: Option<usize>,
    /// Return objects strictly after this id in sort order
    pub marker: Option<String>,
    /// Page backwards from the marker
    pub page_reverse: bool,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn filter(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.entry(field.into()).or_default().push(value.into());
        self
    }

    pub fn fields(mut self, fields: &[&str]) -> Self {
        self.fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn sort(mut self, field: impl Into<String>, ascending: bool) -> Self {
        self.sorts.push(SortKey {
            field: field.into(),
            ascending,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn marker(mut self, id: impl Into<String>) -> Self {
        self.marker = Some(id.into());
        self
    }

    pub fn page_reverse(mut self, reverse: bool) -> Self {
        self.page_reverse = reverse;
        self
    }

    fn matches(&self, record: &Value) -> bool {
        if let Some(tenant) = &self.tenant_id {
            if record.get("tenant_id").and_then(Value::as_str) != Some(tenant.as_str()) {
                return false;
            }
        }
        self.filters.iter().all(|(field, accepted)| match record.get(field) {
            Some(Value::Array(items)) => items.iter().any(|item| accepted.contains(item)),
            Some(value) => accepted.contains(value),
            None => false,
        })
    }

    fn sort_keys(&self) -> Vec<SortKey> {
        let mut keys = self.sorts.clone();
        if !keys.iter().any(|k| k.field == "id") {
            keys.push(SortKey {
                field: "id".into(),
                ascending: true,
            });
        }
        if self.page_reverse {
            for key in &mut keys {
                key.ascending = !key.ascending;
            }
        }
        keys
    }

    fn compare(keys: &[SortKey], a: &Value, b: &Value) -> Ordering {
        for key in keys {
            let ord = compare_values(
                a.get(&key.field).unwrap_or(&Value::Null),
                b.get(&key.field).unwrap_or(&Value::Null),
            );
            let ord = if key.ascending { ord } else { ord.reverse() };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    pub(crate) fn execute<T: PolicyObject>(&self, table: &BTreeMap<String, T>) -> Result<Vec<T>> {
        let mut rows = Vec::new();
        for object in table.values() {
            let record = to_record(object)?;
            if self.matches(&record) {
                rows.push((record, object));
            }
        }

        let keys = self.sort_keys();
        rows.sort_by(|(a, _), (b, _)| Self::compare(&keys, a, b));

        if let Some(marker) = &self.marker {
            let marker_obj = table
                .get(marker)
                .ok_or_else(|| GbpError::not_found(T::KIND, marker.clone()))?;
            let marker_record = to_record(marker_obj)?;
            rows.retain(|(record, _)| Self::compare(&keys, record, &marker_record) == Ordering::Greater);
        }

        if let Some(limit) = self.limit {
            rows.truncate(limit);
        }

        let mut result: Vec<T> = rows.into_iter().map(|(_, obj)| obj.clone()).collect();
        if self.page_reverse {
            result.reverse();
        }
        Ok(result)
    }

    pub(crate) fn count<T: PolicyObject>(&self, table: &BTreeMap<String, T>) -> Result<usize> {
        let mut count = 0;
        for object in table.values() {
            if self.matches(&to_record(object)?) {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Keep only the requested fields of an object
    pub fn project<T: Serialize>(&self, object: &T) -> Result<Value> {
        let record = to_record(object)?;
        if self.fields.is_empty() {
            return Ok(record);
        }
        let mut projected = serde_json::Map::new();
        if let Value::Object(map) = record {
            for (key, value) in map {
                if self.fields.iter().any(|f| f == &key) {
                    projected.insert(key, value);
                }
            }
        }
        Ok(Value::Object(projected))
    }
}

fn to_record<T: Serialize>(object: &T) -> Result<Value> {
    serde_json::to_value(object).map_err(|e| GbpError::InvalidRequest(e.to_string()))
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(_), Value::Array(_)) | (Value::Object(_), Value::Object(_)) => {
            a.to_string().cmp(&b.to_string())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}
