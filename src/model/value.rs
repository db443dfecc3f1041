//! Tagged metric values and the persistence routing table.
//!
//! A metric value is one of {int64, float64, string, bool, null}. The routing
//! table in [`column_for_type`] is the single source of truth for which
//! physical history column a sample fills; the pub/sub payload always
//! stringifies instead.

use serde::{Deserialize, Serialize};

/// A decoded metric value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Null,
}

impl MetricValue {
    pub fn is_null(&self) -> bool {
        matches!(self, MetricValue::Null)
    }

    /// Numeric promotion used by alarm conditions: booleans become 0/1,
    /// strings are parsed, unparseable values promote to `None`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Int(v) => Some(*v as f64),
            MetricValue::Float(v) => Some(*v),
            MetricValue::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            MetricValue::Str(s) => s.trim().parse::<f64>().ok(),
            MetricValue::Null => None,
        }
    }

    /// Stringified form used by pub/sub payloads and the alarm audit trail.
    pub fn to_display_string(&self) -> String {
        match self {
            MetricValue::Int(v) => v.to_string(),
            MetricValue::Float(v) => v.to_string(),
            MetricValue::Bool(v) => v.to_string(),
            MetricValue::Str(s) => s.clone(),
            MetricValue::Null => String::new(),
        }
    }
}

/// The physical history column a sample routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueColumn {
    Int,
    Float,
    Bool,
    Str,
}

/// Classify a Sparkplug type name into a value column.
///
/// Case-insensitive prefix match: `int*`/`uint*` route to the int column,
/// `float`/`double` to the float column, `boolean` to the bool column, and
/// everything else (String, Text, UUID, DateTime, ...) to the string column.
pub fn column_for_type(metric_type: &str) -> ValueColumn {
    let t = metric_type.to_ascii_lowercase();
    if t.starts_with("int") || t.starts_with("uint") {
        ValueColumn::Int
    } else if t.starts_with("float") || t.starts_with("double") {
        ValueColumn::Float
    } else if t.starts_with("boolean") {
        ValueColumn::Bool
    } else {
        ValueColumn::Str
    }
}

/// A value split across the four nullable history columns. Exactly one field
/// is `Some` for a persistable sample.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoutedValue {
    pub int_value: Option<i64>,
    pub float_value: Option<f64>,
    pub string_value: Option<String>,
    pub bool_value: Option<bool>,
}

impl RoutedValue {
    pub fn is_empty(&self) -> bool {
        self.int_value.is_none()
            && self.float_value.is_none()
            && self.string_value.is_none()
            && self.bool_value.is_none()
    }
}

/// Route a value into its history column according to the metric type.
///
/// Null values route nowhere (the row invariant requires exactly one non-null
/// column, so null samples are simply not persisted). Mismatched value/type
/// pairs are coerced toward the declared type where lossless, and fall back
/// to the value's own natural column otherwise.
pub fn route_value(value: &MetricValue, metric_type: &str) -> RoutedValue {
    let mut routed = RoutedValue::default();
    if value.is_null() {
        return routed;
    }
    match column_for_type(metric_type) {
        ValueColumn::Int => match value {
            MetricValue::Int(v) => routed.int_value = Some(*v),
            MetricValue::Float(v) => routed.int_value = Some(*v as i64),
            MetricValue::Bool(v) => routed.int_value = Some(i64::from(*v)),
            MetricValue::Str(s) => match s.trim().parse::<i64>() {
                Ok(v) => routed.int_value = Some(v),
                Err(_) => routed.string_value = Some(s.clone()),
            },
            MetricValue::Null => {}
        },
        ValueColumn::Float => match value.as_f64() {
            Some(v) => routed.float_value = Some(v),
            None => routed.string_value = Some(value.to_display_string()),
        },
        ValueColumn::Bool => match value {
            MetricValue::Bool(v) => routed.bool_value = Some(*v),
            MetricValue::Int(v) => routed.bool_value = Some(*v != 0),
            other => routed.string_value = Some(other.to_display_string()),
        },
        ValueColumn::Str => routed.string_value = Some(value.to_display_string()),
    }
    routed
}

/// Route a bare value by its own variant, for callers without a declared
/// type (property history rows).
pub fn route_by_variant(value: &MetricValue) -> RoutedValue {
    let mut routed = RoutedValue::default();
    match value {
        MetricValue::Int(v) => routed.int_value = Some(*v),
        MetricValue::Float(v) => routed.float_value = Some(*v),
        MetricValue::Bool(v) => routed.bool_value = Some(*v),
        MetricValue::Str(s) => routed.string_value = Some(s.clone()),
        MetricValue::Null => {}
    }
    routed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_classification_follows_prefixes() {
        assert_eq!(column_for_type("Int32"), ValueColumn::Int);
        assert_eq!(column_for_type("int64"), ValueColumn::Int);
        assert_eq!(column_for_type("UInt8"), ValueColumn::Int);
        assert_eq!(column_for_type("Float"), ValueColumn::Float);
        assert_eq!(column_for_type("Double"), ValueColumn::Float);
        assert_eq!(column_for_type("Boolean"), ValueColumn::Bool);
        assert_eq!(column_for_type("String"), ValueColumn::Str);
        assert_eq!(column_for_type("Text"), ValueColumn::Str);
        assert_eq!(column_for_type("DateTime"), ValueColumn::Str);
        assert_eq!(column_for_type(""), ValueColumn::Str);
    }

    fn non_null_count(r: &RoutedValue) -> usize {
        usize::from(r.int_value.is_some())
            + usize::from(r.float_value.is_some())
            + usize::from(r.string_value.is_some())
            + usize::from(r.bool_value.is_some())
    }

    #[test]
    fn routing_fills_exactly_one_column() {
        let cases = [
            (MetricValue::Int(5), "Int32"),
            (MetricValue::Float(72.5), "Float"),
            (MetricValue::Bool(true), "Boolean"),
            (MetricValue::Str("run".into()), "String"),
            (MetricValue::Float(1.5), "Int64"),
            (MetricValue::Int(1), "Boolean"),
            (MetricValue::Str("xyz".into()), "Int32"),
        ];
        for (value, ty) in cases {
            let routed = route_value(&value, ty);
            assert_eq!(non_null_count(&routed), 1, "{value:?} as {ty}");
        }
    }

    #[test]
    fn null_routes_nowhere() {
        let routed = route_value(&MetricValue::Null, "Float");
        assert!(routed.is_empty());
    }

    #[test]
    fn numeric_promotion() {
        assert_eq!(MetricValue::Int(3).as_f64(), Some(3.0));
        assert_eq!(MetricValue::Bool(true).as_f64(), Some(1.0));
        assert_eq!(MetricValue::Bool(false).as_f64(), Some(0.0));
        assert_eq!(MetricValue::Str("101.5".into()).as_f64(), Some(101.5));
        assert_eq!(MetricValue::Str("running".into()).as_f64(), None);
        assert_eq!(MetricValue::Null.as_f64(), None);
    }

    #[test]
    fn display_string_matches_wire_form() {
        assert_eq!(MetricValue::Float(72.5).to_display_string(), "72.5");
        assert_eq!(MetricValue::Float(10.0).to_display_string(), "10");
        assert_eq!(MetricValue::Int(-4).to_display_string(), "-4");
        assert_eq!(MetricValue::Bool(true).to_display_string(), "true");
        assert_eq!(MetricValue::Null.to_display_string(), "");
    }

    #[test]
    fn untagged_serde_representation() {
        assert_eq!(serde_json::to_string(&MetricValue::Int(5)).unwrap(), "5");
        assert_eq!(
            serde_json::to_string(&MetricValue::Float(1.5)).unwrap(),
            "1.5"
        );
        assert_eq!(
            serde_json::to_string(&MetricValue::Bool(true)).unwrap(),
            "true"
        );
        let v: MetricValue = serde_json::from_str("42").unwrap();
        assert_eq!(v, MetricValue::Int(42));
    }
}
