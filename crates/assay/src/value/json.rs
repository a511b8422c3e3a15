use serde_json::{json, Map, Number, Value};

use super::{Data, RuntimeValue, Time};
use crate::types::Type;

const NEVER: &str = "Never";

impl RuntimeValue {
    /// Renders the value as JSON for reports and result sinks.
    ///
    /// Errors render as `{"error": "..."}` alongside whatever payload remains.
    pub fn to_json(&self) -> Value {
        let payload = data_to_json(&self.data, &self.typ);
        match &self.error {
            None => payload,
            Some(err) => json!({ "error": err.to_string(), "value": payload }),
        }
    }
}

fn time_to_json(value: Time) -> Value {
    if value.is_never() {
        return Value::String(NEVER.to_string());
    }
    match value.to_datetime() {
        Some(datetime) => Value::String(datetime.to_rfc3339()),
        None => Value::Null,
    }
}

fn float_to_json(value: f64) -> Value {
    match Number::from_f64(value) {
        Some(number) => Value::Number(number),
        None if value.is_nan() => Value::String("NaN".to_string()),
        None if value.is_sign_negative() => Value::String("-Infinity".to_string()),
        None => Value::String("Infinity".to_string()),
    }
}

fn data_to_json(data: &Data, typ: &Type) -> Value {
    match data {
        Data::Nil => Value::Null,
        Data::Bool(value) => Value::Bool(*value),
        Data::Int(value) => Value::from(*value),
        Data::Float(value) => float_to_json(*value),
        Data::String(value) => Value::String(value.clone()),
        Data::Regex(value) => Value::String(value.as_str().to_string()),
        Data::Time(value) => time_to_json(*value),
        Data::Dict(value) => value.clone(),
        Data::Array(items) => {
            let child = typ.child();
            Value::Array(items.iter().map(|item| data_to_json(item, &child)).collect())
        }
        Data::Map(entries) => {
            let child = typ.child();
            let object: Map<String, Value> = entries
                .iter()
                .map(|(key, item)| (key.clone(), data_to_json(item, &child)))
                .collect();
            Value::Object(object)
        }
        Data::Resource(handle) => json!({ "name": handle.name, "id": handle.id }),
        Data::Block(entries) => {
            let object: Map<String, Value> = entries
                .iter()
                .map(|(key, item)| (key.clone(), item.to_json()))
                .collect();
            Value::Object(object)
        }
        Data::Ref(target) => Value::String(target.to_string()),
    }
}
