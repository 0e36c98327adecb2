use crate::error::{ShmsockError, ShmsockResult};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::str::FromStr;

/// Service names double as directory path components
static SERVICE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]{0,63}$").expect("static pattern"));

/// Identifier under which an endpoint is reachable by its peers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct EndpointId(pub u16);

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EndpointId {
    type Err = ShmsockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u16>()
            .map(EndpointId)
            .map_err(|e| ShmsockError::AddressInvalid(format!("Invalid endpoint id '{}': {}", s, e)))
    }
}

/// Validated service name
///
/// # Format:
/// - 1 to 64 characters
/// - ASCII letters, digits, `_`, `.` and `-`
/// - must start with a letter or digit
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceName(String);

impl ServiceName {
    pub fn new(name: &str) -> ShmsockResult<Self> {
        if name.is_empty() {
            return Err(ShmsockError::AddressInvalid(
                "Service name cannot be empty".to_string(),
            ));
        }
        if !is_valid_name(name) {
            return Err(ShmsockError::AddressInvalid(format!(
                "Invalid service name '{}': expected 1-64 of [A-Za-z0-9_.-], not starting with '_', '.' or '-'",
                name
            )));
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ServiceName {
    type Err = ShmsockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ServiceName::new(s)
    }
}

impl AsRef<str> for ServiceName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Whether `name` is usable as a service name or namespace
pub fn is_valid_name(name: &str) -> bool {
    SERVICE_NAME.is_match(name)
}
