use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::ops::Deref;

/// Device serial number as printed on the unit label.
///
/// Serials are opaque to us, we never parse or validate them beyond
/// carrying them around, so this is just a descriptive newtype.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Serial(String);

impl Deref for Serial {
    type Target = String;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for Serial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for Serial {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Serial {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<Serial> for String {
    fn from(value: Serial) -> Self {
        value.0
    }
}
