//! Decoded payload record
//!
//! Turns the raw protobuf [`Payload`](super::proto::Payload) into a record
//! with normalised millisecond timestamps and native tagged values. All
//! 64-bit wire integers are promoted here; downstream code never sees a raw
//! wire value.

use thiserror::Error;

use crate::model::topology::{MetricProperty, TemplateDefinition, TemplateMember};
use crate::model::value::MetricValue;
use crate::utils::time::normalize_sparkplug_ts;

use super::proto::{self, datatype, metric, property_value};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed Sparkplug payload: {0}")]
    Protobuf(#[from] prost::DecodeError),
}

/// One decoded metric.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMetric {
    pub name: String,
    /// Sparkplug datatype name ("Int32", "Float", "Boolean", ...).
    pub metric_type: String,
    pub value: MetricValue,
    /// Per-metric timestamp in ms, when present on the wire.
    pub timestamp: Option<i64>,
    pub properties: Vec<MetricProperty>,
    /// Reference to a template definition, for template instances.
    pub template_ref: Option<String>,
    /// Present when this metric carries a template definition (BIRTH only).
    pub template_def: Option<TemplateDefinition>,
}

/// A decoded Sparkplug-B frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPayload {
    /// Payload-level timestamp in ms, when present.
    pub timestamp: Option<i64>,
    pub seq: Option<u64>,
    pub metrics: Vec<DecodedMetric>,
}

/// Decode a raw Sparkplug-B frame.
pub fn decode(buf: &[u8]) -> Result<DecodedPayload, DecodeError> {
    let raw = <proto::Payload as prost::Message>::decode(buf)?;
    Ok(DecodedPayload {
        timestamp: raw.timestamp.map(normalize_sparkplug_ts),
        seq: raw.seq,
        metrics: raw.metrics.into_iter().filter_map(decode_metric).collect(),
    })
}

fn decode_metric(raw: proto::Metric) -> Option<DecodedMetric> {
    let name = raw.name.filter(|n| !n.is_empty())?;
    let code = raw.datatype.unwrap_or(0);
    let is_null = raw.is_null.unwrap_or(false);

    let mut template_ref = None;
    let mut template_def = None;
    let value = if is_null {
        MetricValue::Null
    } else {
        match raw.value {
            Some(metric::Value::TemplateValue(t)) => {
                if t.is_definition.unwrap_or(false) {
                    template_def = Some(template_definition(&name, &t));
                } else {
                    template_ref = t.template_ref.clone();
                }
                MetricValue::Null
            }
            Some(v) => promote_metric_value(v, code),
            None => MetricValue::Null,
        }
    };

    Some(DecodedMetric {
        metric_type: datatype::name(code).to_string(),
        value,
        timestamp: raw.timestamp.map(normalize_sparkplug_ts),
        properties: raw.properties.map(decode_properties).unwrap_or_default(),
        template_ref,
        template_def,
        name,
    })
}

/// Promote a wire value to a native tagged value according to its datatype.
///
/// Signed integers travel two's-complement inside unsigned wire fields;
/// UInt64 values above `i64::MAX` fall back to float with documented
/// precision loss. Bytes/File payloads carry no scalar value.
fn promote_metric_value(value: metric::Value, code: u32) -> MetricValue {
    match value {
        metric::Value::IntValue(v) => MetricValue::Int(sign_extend_u32(v, code)),
        metric::Value::LongValue(v) => match code {
            datatype::UINT64 => {
                if let Ok(signed) = i64::try_from(v) {
                    MetricValue::Int(signed)
                } else {
                    MetricValue::Float(v as f64)
                }
            }
            datatype::DATETIME => MetricValue::Int(normalize_sparkplug_ts(v)),
            _ => MetricValue::Int(v as i64),
        },
        metric::Value::FloatValue(v) => MetricValue::Float(f64::from(v)),
        metric::Value::DoubleValue(v) => MetricValue::Float(v),
        metric::Value::BooleanValue(v) => MetricValue::Bool(v),
        metric::Value::StringValue(v) => MetricValue::Str(v),
        metric::Value::BytesValue(_) => MetricValue::Null,
        metric::Value::TemplateValue(_) => MetricValue::Null,
    }
}

/// Sign-extend a 32-bit wire integer for the small signed datatypes.
fn sign_extend_u32(v: u32, code: u32) -> i64 {
    match code {
        datatype::INT8 => i64::from(v as u8 as i8),
        datatype::INT16 => i64::from(v as u16 as i16),
        datatype::INT32 => i64::from(v as i32),
        _ => i64::from(v),
    }
}

fn decode_properties(set: proto::PropertySet) -> Vec<MetricProperty> {
    set.keys
        .into_iter()
        .zip(set.values)
        .map(|(name, pv)| {
            let code = pv.r#type.unwrap_or(0);
            let value = if pv.is_null.unwrap_or(false) {
                MetricValue::Null
            } else {
                match pv.value {
                    Some(property_value::Value::IntValue(v)) => {
                        MetricValue::Int(sign_extend_u32(v, code))
                    }
                    Some(property_value::Value::LongValue(v)) => MetricValue::Int(v as i64),
                    Some(property_value::Value::FloatValue(v)) => MetricValue::Float(f64::from(v)),
                    Some(property_value::Value::DoubleValue(v)) => MetricValue::Float(v),
                    Some(property_value::Value::BooleanValue(v)) => MetricValue::Bool(v),
                    Some(property_value::Value::StringValue(v)) => MetricValue::Str(v),
                    None => MetricValue::Null,
                }
            };
            MetricProperty {
                name,
                value,
                property_type: datatype::name(code).to_string(),
            }
        })
        .collect()
}

fn template_definition(name: &str, t: &proto::Template) -> TemplateDefinition {
    TemplateDefinition {
        name: name.to_string(),
        version: t.version.clone(),
        members: t
            .metrics
            .iter()
            .filter_map(|m| {
                m.name.as_ref().map(|n| TemplateMember {
                    name: n.clone(),
                    member_type: datatype::name(m.datatype.unwrap_or(0)).to_string(),
                })
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparkplug::proto::{Metric, Payload, PropertySet, PropertyValue, Template};
    use prost::Message as _;

    fn encode(payload: &Payload) -> Vec<u8> {
        payload.encode_to_vec()
    }

    fn one_metric(m: Metric) -> Vec<u8> {
        encode(&Payload {
            timestamp: Some(1_700_000_000_000),
            metrics: vec![m],
            seq: Some(0),
            uuid: None,
            body: None,
        })
    }

    #[test]
    fn decodes_a_float_metric() {
        let buf = one_metric(Metric {
            name: Some("Temp".into()),
            datatype: Some(datatype::FLOAT),
            timestamp: Some(1_700_000_000_000),
            value: Some(metric::Value::FloatValue(72.5)),
            ..Default::default()
        });

        let decoded = decode(&buf).unwrap();
        assert_eq!(decoded.timestamp, Some(1_700_000_000_000));
        assert_eq!(decoded.metrics.len(), 1);
        let m = &decoded.metrics[0];
        assert_eq!(m.name, "Temp");
        assert_eq!(m.metric_type, "Float");
        assert_eq!(m.value, MetricValue::Float(72.5));
    }

    #[test]
    fn negative_int32_survives_the_unsigned_wire_field() {
        let buf = one_metric(Metric {
            name: Some("Delta".into()),
            datatype: Some(datatype::INT32),
            value: Some(metric::Value::IntValue((-40_i32) as u32)),
            ..Default::default()
        });
        let decoded = decode(&buf).unwrap();
        assert_eq!(decoded.metrics[0].value, MetricValue::Int(-40));
    }

    #[test]
    fn negative_int8_sign_extends() {
        let buf = one_metric(Metric {
            name: Some("Small".into()),
            datatype: Some(datatype::INT8),
            value: Some(metric::Value::IntValue(0xFF)),
            ..Default::default()
        });
        let decoded = decode(&buf).unwrap();
        assert_eq!(decoded.metrics[0].value, MetricValue::Int(-1));
    }

    #[test]
    fn uint64_above_i64_max_falls_back_to_float() {
        let buf = one_metric(Metric {
            name: Some("Counter".into()),
            datatype: Some(datatype::UINT64),
            value: Some(metric::Value::LongValue(u64::MAX)),
            ..Default::default()
        });
        let decoded = decode(&buf).unwrap();
        assert_eq!(decoded.metrics[0].value, MetricValue::Float(u64::MAX as f64));
    }

    #[test]
    fn is_null_wins_over_any_value() {
        let buf = one_metric(Metric {
            name: Some("Gone".into()),
            datatype: Some(datatype::INT32),
            is_null: Some(true),
            value: Some(metric::Value::IntValue(7)),
            ..Default::default()
        });
        let decoded = decode(&buf).unwrap();
        assert!(decoded.metrics[0].value.is_null());
    }

    #[test]
    fn nameless_metrics_are_dropped() {
        let buf = one_metric(Metric {
            name: None,
            datatype: Some(datatype::INT32),
            value: Some(metric::Value::IntValue(7)),
            ..Default::default()
        });
        assert!(decode(&buf).unwrap().metrics.is_empty());
    }

    #[test]
    fn second_resolution_payload_timestamp_is_normalised() {
        let buf = encode(&Payload {
            timestamp: Some(1_700_000_000),
            metrics: vec![],
            seq: None,
            uuid: None,
            body: None,
        });
        assert_eq!(decode(&buf).unwrap().timestamp, Some(1_700_000_000_000));
    }

    #[test]
    fn properties_zip_keys_and_values() {
        let buf = one_metric(Metric {
            name: Some("Temp".into()),
            datatype: Some(datatype::FLOAT),
            value: Some(metric::Value::FloatValue(1.0)),
            properties: Some(PropertySet {
                keys: vec!["engUnit".into(), "scanRate".into()],
                values: vec![
                    PropertyValue {
                        r#type: Some(datatype::STRING),
                        is_null: None,
                        value: Some(property_value::Value::StringValue("degF".into())),
                    },
                    PropertyValue {
                        r#type: Some(datatype::INT64),
                        is_null: None,
                        value: Some(property_value::Value::LongValue(1000)),
                    },
                ],
            }),
            ..Default::default()
        });

        let decoded = decode(&buf).unwrap();
        let props = &decoded.metrics[0].properties;
        assert_eq!(props.len(), 2);
        assert_eq!(props[0].name, "engUnit");
        assert_eq!(props[0].value, MetricValue::Str("degF".into()));
        assert_eq!(props[1].value, MetricValue::Int(1000));
    }

    #[test]
    fn template_definition_is_extracted_from_birth() {
        let buf = one_metric(Metric {
            name: Some("Motor".into()),
            datatype: Some(datatype::TEMPLATE),
            value: Some(metric::Value::TemplateValue(Template {
                version: Some("1.2".into()),
                is_definition: Some(true),
                template_ref: None,
                metrics: vec![Metric {
                    name: Some("RPM".into()),
                    datatype: Some(datatype::FLOAT),
                    ..Default::default()
                }],
            })),
            ..Default::default()
        });

        let decoded = decode(&buf).unwrap();
        let def = decoded.metrics[0].template_def.as_ref().unwrap();
        assert_eq!(def.name, "Motor");
        assert_eq!(def.version.as_deref(), Some("1.2"));
        assert_eq!(def.members.len(), 1);
        assert_eq!(def.members[0].member_type, "Float");
    }

    #[test]
    fn template_instance_keeps_the_reference() {
        let buf = one_metric(Metric {
            name: Some("Pump3".into()),
            datatype: Some(datatype::TEMPLATE),
            value: Some(metric::Value::TemplateValue(Template {
                version: None,
                is_definition: Some(false),
                template_ref: Some("Motor".into()),
                metrics: vec![],
            })),
            ..Default::default()
        });
        let decoded = decode(&buf).unwrap();
        assert_eq!(decoded.metrics[0].template_ref.as_deref(), Some("Motor"));
        assert!(decoded.metrics[0].template_def.is_none());
    }

    #[test]
    fn garbage_fails_cleanly() {
        assert!(decode(&[0xFF, 0xFF, 0xFF, 0x01]).is_err());
    }
}
