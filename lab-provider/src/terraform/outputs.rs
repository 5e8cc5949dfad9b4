use serde_json::{Map, Value};

use crate::{ProviderError, Result};

/// Parse `terraform output -json`.
///
/// Output is captured with stderr interleaved, so anything around the outermost JSON object
/// is ignored.
pub fn parse_outputs(raw: &str) -> Result<Map<String, Value>> {
    let body = match (raw.find('{'), raw.rfind('}')) {
        (Some(start), Some(end)) if start < end => &raw[start..=end],
        _ => {
            return Err(ProviderError::MalformedOutput(
                "no JSON object in `output -json` result".to_string(),
            ))
        }
    };

    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(ProviderError::MalformedOutput(format!(
            "expected an object of outputs, got {}",
            other
        ))),
        Err(e) => Err(ProviderError::MalformedOutput(format!(
            "invalid outputs JSON: {}",
            e
        ))),
    }
}

fn output_value<'a>(outputs: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    outputs.get(key).and_then(|output| output.get("value"))
}

/// The graphical port reported for `domain`, if any.
pub fn vnc_port(outputs: &Map<String, Value>, domain: &str) -> Result<Option<u16>> {
    let key = format!("{}_vnc_port", domain);
    let parsed = match output_value(outputs, &key) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(n)) => n.as_u64().and_then(|v| u16::try_from(v).ok()),
        Some(Value::String(s)) => s.trim().parse::<u16>().ok(),
        Some(_) => None,
    };

    parsed.map(Some).ok_or_else(|| {
        ProviderError::MalformedOutput(format!("output '{}' is not a valid port", key))
    })
}

pub fn address(outputs: &Map<String, Value>, domain: &str) -> Option<String> {
    output_value(outputs, &format!("{}_ip", domain))
        .and_then(Value::as_str)
        .map(str::to_string)
}
