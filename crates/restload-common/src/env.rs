//! Typed environment variable lookups
//!
//! Missing variables are `Ok(None)`; present but unparsable ones are errors,
//! so a typo in `RESTLOAD_EXTRACT__WORKERS=six` fails startup instead of
//! silently falling back to the default.

use std::fmt::Display;
use std::str::FromStr;

use crate::error::{RestloadError, Result};

/// Read and parse `key`, returning `None` when it is unset or empty.
pub fn parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(key) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| RestloadError::InvalidEnv {
                key: key.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

/// Read `key` as a string, returning `None` when it is unset or empty.
pub fn string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Overwrite `slot` with the parsed value of `key` when it is set.
pub fn apply<T>(key: &str, slot: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: Display,
{
    if let Some(value) = parse(key)? {
        *slot = value;
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_missing_is_none() {
        let value: Option<u32> = parse("RESTLOAD_TEST_ENV_DEFINITELY_UNSET").unwrap();
        assert!(value.is_none());
    }

    #[test]
    fn test_parse_and_apply() {
        std::env::set_var("RESTLOAD_TEST_ENV_WORKERS", " 7 ");
        let mut workers = 1usize;
        apply("RESTLOAD_TEST_ENV_WORKERS", &mut workers).unwrap();
        assert_eq!(workers, 7);
        std::env::remove_var("RESTLOAD_TEST_ENV_WORKERS");
    }

    #[test]
    fn test_parse_invalid_reports_key() {
        std::env::set_var("RESTLOAD_TEST_ENV_BAD", "six");
        let err = parse::<u32>("RESTLOAD_TEST_ENV_BAD").unwrap_err();
        assert!(err.to_string().contains("RESTLOAD_TEST_ENV_BAD"));
        std::env::remove_var("RESTLOAD_TEST_ENV_BAD");
    }
}
