//! Canonical JSON serialization per RFC 8785 (JCS).
//!
//! Object ids and transaction signatures are computed over these bytes, so
//! the output must be byte-identical across implementations: member names
//! sorted by UTF-16 code units, no insignificant whitespace, integers
//! without a decimal point.

use serde_json::{Map, Number, Value};

pub fn to_canonical_string(value: &Value) -> String {
    let mut out = String::with_capacity(128);
    write_value(&mut out, value);
    out
}

pub fn to_canonical_vec(value: &Value) -> Vec<u8> {
    to_canonical_string(value).into_bytes()
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(number) => write_number(out, number),
        Value::String(text) => write_string(out, text),
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        Value::Object(members) => write_object(out, members),
    }
}

fn write_object(out: &mut String, members: &Map<String, Value>) {
    let mut keys: Vec<&String> = members.keys().collect();
    keys.sort_by(|a, b| {
        let a_units = a.encode_utf16();
        let b_units = b.encode_utf16();
        a_units.cmp(b_units)
    });

    out.push('{');
    for (index, key) in keys.iter().enumerate() {
        if index > 0 {
            out.push(',');
        }
        write_string(out, key);
        out.push(':');
        write_value(out, &members[key.as_str()]);
    }
    out.push('}');
}

fn write_number(out: &mut String, number: &Number) {
    if let Some(value) = number.as_u64() {
        out.push_str(&value.to_string());
    } else if let Some(value) = number.as_i64() {
        out.push_str(&value.to_string());
    } else if let Some(value) = number.as_f64() {
        // Integral doubles within the exact range print without a decimal
        // point, matching the ECMAScript serialization JCS is defined by.
        if value.fract() == 0.0 && value.abs() < 9_007_199_254_740_992.0 {
            out.push_str(&(value as i64).to_string());
        } else {
            out.push_str(&value.to_string());
        }
    }
}

fn write_string(out: &mut String, text: &str) {
    out.push('"');
    for ch in text.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{0008}' => out.push_str("\\b"),
            '\u{0009}' => out.push_str("\\t"),
            '\u{000a}' => out.push_str("\\n"),
            '\u{000c}' => out.push_str("\\f"),
            '\u{000d}' => out.push_str("\\r"),
            ch if (ch as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", ch as u32));
            }
            ch => out.push(ch),
        }
    }
    out.push('"');
}
