//! Object/text codec for values kept in string-keyed stores

use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Converts typed records to text and back
pub trait Serializer: Send + Sync {
    /// Serialize `value`, pretty-printed when `indent` is set
    fn serialize<T: Serialize + ?Sized>(&self, value: &T, indent: bool) -> Result<String>;

    /// Parse `text` into a `T`, failing with a format error on malformed input
    fn deserialize<T: DeserializeOwned>(&self, text: &str) -> Result<T>;
}

/// JSON codec backed by `serde_json`
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize<T: Serialize + ?Sized>(&self, value: &T, indent: bool) -> Result<String> {
        let text = if indent {
            serde_json::to_string_pretty(value)?
        } else {
            serde_json::to_string(value)?
        };
        Ok(text)
    }

    fn deserialize<T: DeserializeOwned>(&self, text: &str) -> Result<T> {
        Ok(serde_json::from_str(text)?)
    }
}
