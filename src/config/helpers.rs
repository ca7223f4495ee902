use crate::error::ConfigError;

/// Read an environment variable, treating empty values as unset.
pub(crate) fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(val) if val.is_empty() => Ok(None),
        Ok(val) => Ok(Some(val)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("failed to read {key}: {e}"),
        }),
    }
}

/// Parse an environment variable into `T`, or fall back to `default`.
pub(crate) fn parse_optional_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    optional_env(key)?
        .map(|s| {
            s.parse().map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{e}"),
            })
        })
        .transpose()
        .map(|opt| opt.unwrap_or(default))
}

/// Parse a byte size like `512m`, `2g`, `1024` or `64k`.
pub(crate) fn parse_byte_size(key: &str, raw: &str) -> Result<i64, ConfigError> {
    let trimmed = raw.trim().to_ascii_lowercase();
    let trimmed = trimmed.strip_suffix('b').unwrap_or(&trimmed);
    let (digits, multiplier) = match trimmed.chars().last() {
        Some('k') => (&trimmed[..trimmed.len() - 1], 1024_i64),
        Some('m') => (&trimmed[..trimmed.len() - 1], 1024 * 1024),
        Some('g') => (&trimmed[..trimmed.len() - 1], 1024 * 1024 * 1024),
        _ => (trimmed, 1),
    };
    let value: i64 = digits.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("'{raw}' is not a byte size"),
    })?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{raw}' overflows"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_byte_size() {
        assert_eq!(parse_byte_size("Memory", "1024").unwrap(), 1024);
        assert_eq!(parse_byte_size("Memory", "64k").unwrap(), 64 * 1024);
        assert_eq!(parse_byte_size("Memory", "512M").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_byte_size("Memory", "2gb").unwrap(), 2 * 1024 * 1024 * 1024);
        assert!(parse_byte_size("Memory", "lots").is_err());
    }

    #[test]
    fn test_parse_optional_env_default() {
        let value: u64 = parse_optional_env("HARBORMASTER_TEST_UNSET_VALUE", 42).unwrap();
        assert_eq!(value, 42);
    }
}
