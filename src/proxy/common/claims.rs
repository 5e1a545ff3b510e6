use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClaimsError {
    #[error("token is not a JWT (missing payload segment)")]
    MissingSegment,

    #[error("cannot decode token payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("token payload is not JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("token payload has no numeric exp claim")]
    MissingExp,
}

/// Read the `exp` claim (unix seconds) without verifying the signature.
pub fn decode_expiry(token: &str) -> Result<i64, ClaimsError> {
    let segment = token
        .split('.')
        .nth(1)
        .filter(|s| !s.is_empty())
        .ok_or(ClaimsError::MissingSegment)?;

    let decoded = URL_SAFE_NO_PAD.decode(segment.trim_end_matches('='))?;
    let claims: Value = serde_json::from_slice(&decoded)?;

    claims
        .get("exp")
        .and_then(|exp| exp.as_i64().or_else(|| exp.as_f64().map(|f| f as i64)))
        .ok_or(ClaimsError::MissingExp)
}

#[cfg(test)]
pub(crate) fn make_token(claims: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let body = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{}.{}.signature", header, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_expiry() {
        let token = make_token(&json!({"sub": "u", "exp": 1_900_000_000}));
        assert_eq!(decode_expiry(&token).unwrap(), 1_900_000_000);

        let token = make_token(&json!({"exp": 1_900_000_000.0}));
        assert_eq!(decode_expiry(&token).unwrap(), 1_900_000_000);
    }

    #[test]
    fn test_decode_expiry_errors() {
        assert!(matches!(
            decode_expiry("opaque-token"),
            Err(ClaimsError::MissingSegment)
        ));
        assert!(matches!(
            decode_expiry("a.!!!.c"),
            Err(ClaimsError::Base64(_))
        ));
        let token = make_token(&json!({"sub": "u"}));
        assert!(matches!(decode_expiry(&token), Err(ClaimsError::MissingExp)));
    }
}
