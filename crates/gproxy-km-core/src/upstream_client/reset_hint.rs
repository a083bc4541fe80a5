use std::time::{Duration, SystemTime};

/// Looks for a rate-limit reset timestamp (milliseconds since epoch) in a
/// 429 response body. Checks `error.metadata.headers["X-RateLimit-Reset"]`
/// first, then `error.metadata.reset`, then a bare top-level `reset` field.
/// A value that is absent, unparsable, zero, or not strictly in the future
/// is treated as absent — callers fall back to the configured default
/// cooldown in that case.
pub fn extract_reset_hint(body: &[u8]) -> Option<SystemTime> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    let candidate = value
        .pointer("/error/metadata/headers/X-RateLimit-Reset")
        .or_else(|| value.pointer("/error/metadata/reset"))
        .or_else(|| value.pointer("/reset"))?;

    let ms = parse_millis(candidate)?;
    if ms <= 0 {
        return None;
    }

    let at = SystemTime::UNIX_EPOCH + Duration::from_millis(ms as u64);
    if at <= SystemTime::now() { None } else { Some(at) }
}

fn parse_millis(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        serde_json::Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn future_ms() -> i64 {
        (SystemTime::now() + Duration::from_secs(60))
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_millis() as i64
    }

    #[test]
    fn extracts_from_headers_field() {
        let ms = future_ms();
        let body = json!({
            "error": {"metadata": {"headers": {"X-RateLimit-Reset": ms.to_string()}}}
        });
        assert!(extract_reset_hint(&serde_json::to_vec(&body).unwrap()).is_some());
    }

    #[test]
    fn falls_back_to_metadata_reset() {
        let ms = future_ms();
        let body = json!({"error": {"metadata": {"reset": ms}}});
        assert!(extract_reset_hint(&serde_json::to_vec(&body).unwrap()).is_some());
    }

    #[test]
    fn falls_back_to_top_level_reset() {
        let ms = future_ms();
        let body = json!({"reset": ms});
        assert!(extract_reset_hint(&serde_json::to_vec(&body).unwrap()).is_some());
    }

    #[test]
    fn past_timestamp_is_absent() {
        let body = json!({"reset": 1});
        assert!(extract_reset_hint(&serde_json::to_vec(&body).unwrap()).is_none());
    }

    #[test]
    fn zero_is_absent() {
        let body = json!({"reset": 0});
        assert!(extract_reset_hint(&serde_json::to_vec(&body).unwrap()).is_none());
    }

    #[test]
    fn malformed_json_is_absent() {
        assert!(extract_reset_hint(b"not json").is_none());
    }

    #[test]
    fn missing_field_is_absent() {
        assert!(extract_reset_hint(b"{}").is_none());
    }
}
