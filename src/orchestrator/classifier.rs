// Error classification module
//
// Classifies upstream error messages into health-relevant categories. The
// rules are ordered and purely textual (plus an optional JSON body probe),
// so classification is deterministic for a given message.

use crate::models::ErrorKind;

/// Upstream error code that means the account itself is locked.
const LOCKED_ERROR_CODE: i64 = 326;

/// True when the message parses as JSON and carries `errors[].code == 326`.
pub fn has_locked_code(message: &str) -> bool {
    let trimmed = message.trim();
    if !trimmed.starts_with('{') && !trimmed.starts_with('[') {
        return false;
    }
    let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) else {
        return false;
    };
    json.get("errors")
        .and_then(|e| e.as_array())
        .map_or(false, |errors| {
            errors
                .iter()
                .any(|err| err.get("code").and_then(|c| c.as_i64()) == Some(LOCKED_ERROR_CODE))
        })
}

/// Classify an upstream error message. Rules apply in order; the first
/// match wins.
pub fn classify_error(message: &str) -> ErrorKind {
    if has_locked_code(message) {
        return ErrorKind::AccountLocked;
    }

    let lower = message.to_lowercase();
    let contains_any = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if contains_any(&["status 401", "status: 401", "status code: 401"]) {
        ErrorKind::AccountSuspended
    } else if contains_any(&["timeout", "timed out"]) {
        ErrorKind::Timeout
    } else if contains_any(&["network", "fetch failed", "connection", "socket"]) {
        ErrorKind::Network
    } else if contains_any(&["rate limit", "too many requests", "429"]) {
        ErrorKind::RateLimit
    } else if contains_any(&["auth", "login", "credentials", "unauthorized", "401"]) {
        ErrorKind::Auth
    } else if contains_any(&["not found", "404"]) {
        ErrorKind::NotFound
    } else if contains_any(&[
        "account is temporarily locked",
        "account locked",
        "to unlock your account",
    ]) {
        ErrorKind::AccountLocked
    } else {
        ErrorKind::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_json_locked_code() {
        let body = r#"{"errors":[{"code":326,"message":"locked"}]}"#;
        assert_eq!(classify_error(body), ErrorKind::AccountLocked);
        assert!(has_locked_code(body));
    }

    #[test]
    fn test_json_other_code_falls_through() {
        let body = r#"{"errors":[{"code":88,"message":"Rate limit exceeded"}]}"#;
        assert!(!has_locked_code(body));
        assert_eq!(classify_error(body), ErrorKind::RateLimit);
    }

    #[test]
    fn test_status_401_is_suspension() {
        assert_eq!(
            classify_error("Response status: 401"),
            ErrorKind::AccountSuspended
        );
        assert_eq!(
            classify_error("request failed with status code: 401"),
            ErrorKind::AccountSuspended
        );
    }

    #[test]
    fn test_bare_401_is_auth() {
        // Without the "status" prefix, 401 is an auth problem, not suspension
        assert_eq!(classify_error("got 401 from upstream"), ErrorKind::Auth);
        assert_eq!(classify_error("Unauthorized"), ErrorKind::Auth);
    }

    #[test]
    fn test_timeout() {
        assert_eq!(classify_error("operation timed out"), ErrorKind::Timeout);
        assert_eq!(
            classify_error("Timeout while waiting for response"),
            ErrorKind::Timeout
        );
    }

    #[test]
    fn test_timeout_wins_over_network() {
        // "connection timed out" mentions both; timeout is checked first
        assert_eq!(classify_error("connection timed out"), ErrorKind::Timeout);
    }

    #[test]
    fn test_network() {
        assert_eq!(classify_error("fetch failed"), ErrorKind::Network);
        assert_eq!(classify_error("socket hang up"), ErrorKind::Network);
        assert_eq!(classify_error("Connection refused"), ErrorKind::Network);
    }

    #[test]
    fn test_rate_limit() {
        assert_eq!(classify_error("Rate limit exceeded"), ErrorKind::RateLimit);
        assert_eq!(classify_error("HTTP 429"), ErrorKind::RateLimit);
        assert_eq!(
            classify_error("Too Many Requests"),
            ErrorKind::RateLimit
        );
    }

    #[test]
    fn test_auth() {
        assert_eq!(classify_error("login failed"), ErrorKind::Auth);
        assert_eq!(classify_error("bad credentials"), ErrorKind::Auth);
    }

    #[test]
    fn test_not_found() {
        assert_eq!(classify_error("user not found"), ErrorKind::NotFound);
        assert_eq!(classify_error("HTTP 404"), ErrorKind::NotFound);
    }

    #[test]
    fn test_textual_lock_messages() {
        assert_eq!(
            classify_error("Your account is temporarily locked."),
            ErrorKind::AccountLocked
        );
        assert_eq!(
            classify_error("please verify your identity to unlock your account"),
            ErrorKind::AccountLocked
        );
    }

    #[test]
    fn test_unknown() {
        assert_eq!(classify_error("something odd happened"), ErrorKind::Unknown);
        assert_eq!(classify_error(""), ErrorKind::Unknown);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Same message, same kind - classification has no hidden state.
        #[test]
        fn classification_is_deterministic(message in ".{0,120}") {
            prop_assert_eq!(classify_error(&message), classify_error(&message));
        }

        /// Case must not affect the outcome.
        #[test]
        fn classification_is_case_insensitive(message in "[a-zA-Z0-9 :/.]{0,60}") {
            prop_assert_eq!(
                classify_error(&message.to_uppercase()),
                classify_error(&message.to_lowercase())
            );
        }
    }
}
