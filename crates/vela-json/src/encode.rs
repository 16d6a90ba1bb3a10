#![forbid(unsafe_code)]

//! Encoders: typed Rust values to host JSON.

use serde::Serialize;
use serde_json::{Map, Number, Value};

/// Encode a string.
pub fn string(value: impl Into<String>) -> Value {
    Value::String(value.into())
}

/// Encode an integer.
pub fn int(value: i64) -> Value {
    Value::Number(value.into())
}

/// Encode a float. Non-finite values have no JSON form and encode as `null`.
pub fn float(value: f64) -> Value {
    Number::from_f64(value).map_or(Value::Null, Value::Number)
}

/// Encode a boolean.
pub fn bool(value: bool) -> Value {
    Value::Bool(value)
}

/// The JSON `null`.
pub fn null() -> Value {
    Value::Null
}

/// Encode every item with `f` into a JSON array.
pub fn list<T>(items: impl IntoIterator<Item = T>, f: impl Fn(T) -> Value) -> Value {
    Value::Array(items.into_iter().map(f).collect())
}

/// Build an object from key/value pairs. Later duplicates win.
pub fn object<K: Into<String>>(pairs: impl IntoIterator<Item = (K, Value)>) -> Value {
    Value::Object(
        pairs
            .into_iter()
            .map(|(key, value)| (key.into(), value))
            .collect::<Map<String, Value>>(),
    )
}

/// Encode a map-like collection, converting keys and values.
pub fn dict<K, V>(
    entries: impl IntoIterator<Item = (K, V)>,
    key: impl Fn(K) -> String,
    value: impl Fn(V) -> Value,
) -> Value {
    object(entries.into_iter().map(|(k, v)| (key(k), value(v))))
}

/// Render a value as JSON text, pretty-printed with `indent` spaces when
/// `indent > 0`.
pub fn encode(indent: usize, value: &Value) -> String {
    if indent == 0 {
        return value.to_string();
    }
    let pad = vec![b' '; indent];
    let formatter = serde_json::ser::PrettyFormatter::with_indent(&pad);
    let mut out = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
    if value.serialize(&mut ser).is_err() {
        return value.to_string();
    }
    String::from_utf8(out).unwrap_or_else(|_| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn object_keeps_last_duplicate() {
        let v = object([("a", int(1)), ("a", int(2))]);
        assert_eq!(v, json!({"a": 2}));
    }

    #[test]
    fn non_finite_float_is_null() {
        assert_eq!(float(f64::NAN), Value::Null);
        assert_eq!(float(1.5), json!(1.5));
    }

    #[test]
    fn encode_compact_and_indented() {
        let v = json!({"a": [1, 2]});
        assert_eq!(encode(0, &v), r#"{"a":[1,2]}"#);
        assert_eq!(encode(2, &v), "{\n  \"a\": [\n    1,\n    2\n  ]\n}");
    }

    #[test]
    fn list_and_dict_helpers() {
        assert_eq!(list([1_i64, 2, 3], int), json!([1, 2, 3]));
        let pairs = vec![(1, true), (2, false)];
        assert_eq!(
            dict(pairs, |k: i32| k.to_string(), bool),
            json!({"1": true, "2": false})
        );
    }
}
