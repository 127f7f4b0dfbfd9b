//! Environment variable configuration helpers.

use std::env;
use std::str::FromStr;

/// Read a typed value from the environment.
///
/// Falls back to `default` when the variable is unset or fails to parse.
pub fn from_env<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_var_yields_default() {
        assert_eq!(from_env("INFERFLOW_TEST_UNSET_VAR", 10usize), 10);
    }

    #[test]
    fn unparseable_var_yields_default() {
        unsafe { env::set_var("INFERFLOW_TEST_BAD_VAR", "not-a-number") };
        assert_eq!(from_env("INFERFLOW_TEST_BAD_VAR", 7usize), 7);
        unsafe { env::remove_var("INFERFLOW_TEST_BAD_VAR") };
    }

    #[test]
    fn set_var_is_parsed() {
        unsafe { env::set_var("INFERFLOW_TEST_GOOD_VAR", "42") };
        assert_eq!(from_env("INFERFLOW_TEST_GOOD_VAR", 0usize), 42);
        unsafe { env::remove_var("INFERFLOW_TEST_GOOD_VAR") };
    }
}
