//! Field-level recovery for config files: a field which fails to parse is reset to its default instead of failing the whole file.

use serde::{Deserialize, Deserializer};

#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum TryParse<T> {
    Valid(T),
    Invalid(serde_json::Value),
}

impl<T: Default> TryParse<T> {
    pub fn or_default(self) -> T {
        match self {
            TryParse::Valid(value) => value,
            TryParse::Invalid(json) => {
                tracing::error!(message_id = "Rk2vB7qe", ?json, field_type = std::any::type_name::<T>(), "invalid config value, using default");
                T::default()
            }
        }
    }
}

pub fn deserialize<'de, T: Default + Deserialize<'de>, D: Deserializer<'de>>(deserializer: D) -> Result<T, D::Error> {
    Ok(TryParse::<T>::deserialize(deserializer)?.or_default())
}
