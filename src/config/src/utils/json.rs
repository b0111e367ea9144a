// Copyright 2024 Quiver Labs Inc.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

pub use serde_json::{from_value, json, to_value, Error, Map, Number, Value};

#[inline(always)]
pub fn to_string<T>(value: &T) -> Result<String, serde_json::Error>
where
    T: ?Sized + serde::Serialize,
{
    serde_json::to_string(value)
}

#[inline(always)]
pub fn to_vec<T>(value: &T) -> Result<Vec<u8>, serde_json::Error>
where
    T: ?Sized + serde::Serialize,
{
    serde_json::to_vec(value)
}

#[inline(always)]
pub fn from_str<'a, T>(s: &'a str) -> Result<T, serde_json::Error>
where
    T: serde::Deserialize<'a>,
{
    serde_json::from_str(s)
}

#[inline(always)]
pub fn from_slice<'a, T>(v: &'a [u8]) -> Result<T, serde_json::Error>
where
    T: serde::Deserialize<'a>,
{
    serde_json::from_slice(v)
}

/// Get a field as string, accepting string or number values.
pub fn get_string_value(value: &Value) -> String {
    match value {
        Value::String(v) => v.to_string(),
        Value::Number(v) => v.to_string(),
        Value::Bool(v) => v.to_string(),
        _ => value.to_string(),
    }
}

/// Get a field as f64 where the value may be int, float or numeric string.
pub fn get_float_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(v) => v.as_f64(),
        Value::String(v) => v.parse::<f64>().ok(),
        Value::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_string_value() {
        assert_eq!(get_string_value(&json!("abc")), "abc");
        assert_eq!(get_string_value(&json!(123)), "123");
        assert_eq!(get_string_value(&json!(true)), "true");
    }

    #[test]
    fn test_get_float_value() {
        assert_eq!(get_float_value(&json!(1.5)), Some(1.5));
        assert_eq!(get_float_value(&json!("2.5")), Some(2.5));
        assert_eq!(get_float_value(&json!(10)), Some(10.0));
        assert_eq!(get_float_value(&json!([1])), None);
    }
}
