// Copyright 2024, The Weir Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Configuration primitives for the Weir runtime: structured config values,
//! the [`Impl`] constructor trait and the string-or-struct [`NameWithConfig`]
//! shape used for transform lists and similar named entries.

use serde::Deserialize;
use value_trait::prelude::*;

/// The structured value type configuration is carried in
pub type Value = simd_json::OwnedValue;

/// Named key value pair with optional config
#[derive(Clone, Debug, Default)]
#[allow(clippy::module_name_repetitions)]
pub struct NameWithConfig {
    /// Name
    pub name: String,
    /// Config (optional)
    pub config: Option<Value>,
}

impl<'v> serde::Deserialize<'v> for NameWithConfig {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'v>,
    {
        #[derive(Deserialize, Debug)]
        #[serde(untagged)]
        enum Variants {
            // json: "drop_empty"
            Name(String),
            // json: { "name": "drop_empty", "config": { ... } }
            NameAndConfig { name: String, config: Value },
            // json: { "name": "drop_empty" }
            NameAndNoConfig { name: String },
        }

        let var = Variants::deserialize(deserializer)?;

        match var {
            Variants::NameAndConfig { name, config } => Ok(NameWithConfig {
                name,
                config: Some(config),
            }),
            Variants::NameAndNoConfig { name } | Variants::Name(name) => {
                Ok(NameWithConfig { name, config: None })
            }
        }
    }
}

impl TryFrom<&Value> for NameWithConfig {
    type Error = Error;

    fn try_from(value: &Value) -> Result<Self, Error> {
        if let Some(name) = value.as_str() {
            Ok(Self::from(name))
        } else if let Some(name) = value.get_str("name") {
            Ok(Self {
                name: name.to_string(),
                config: value.get("config").cloned(),
            })
        } else {
            Err(Error::InvalidConfig(value.encode()))
        }
    }
}

/// Error for config shapes that fail to deserialize
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// The value has neither a string nor a `{name, config}` shape
    InvalidConfig(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::result::Result<(), std::fmt::Error> {
        match self {
            Self::InvalidConfig(v) => write!(f, "Invalid config: {v}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<&str> for NameWithConfig {
    fn from(name: &str) -> Self {
        Self {
            name: name.to_string(),
            config: None,
        }
    }
}
impl From<&String> for NameWithConfig {
    fn from(name: &String) -> Self {
        name.clone().into()
    }
}
impl From<String> for NameWithConfig {
    fn from(name: String) -> Self {
        Self { name, config: None }
    }
}

/// Trait for constructing config structs from structured values so that
/// key names show up in errors
pub trait Impl {
    /// deserialises the config into a struct and returns nice errors
    /// this doesn't need to be overwritten in most cases.
    ///
    /// # Errors
    /// if the Configuration is invalid
    fn new(config: &Value) -> Result<Self, simd_json::Error>
    where
        Self: serde::de::DeserializeOwned,
    {
        simd_json::serde::from_owned_value(config.clone())
    }
}

/// A configuration map
pub type Map = Option<Value>;

#[cfg(test)]
mod test {
    use super::*;
    use simd_json::json;
    use std::collections::HashMap;

    #[test]
    fn name_with_config() {
        let v: Value = json!({"name": "drop_empty", "config": {"mode": "strict"}});
        let nac = NameWithConfig::deserialize(v).expect("could structurize two element struct");
        assert_eq!(nac.name, "drop_empty");
        assert!(nac.config.as_object().is_some());
        let v: Value = json!({"name": "solar_quality"});
        let nac = NameWithConfig::deserialize(v).expect("could structurize one element struct");
        assert_eq!(nac.name, "solar_quality");
        assert_eq!(nac.config, None);
        let v: Value = json!("solar_quality");
        let nac = NameWithConfig::deserialize(v).expect("could structurize string");
        assert_eq!(nac.name, "solar_quality");
        assert_eq!(nac.config, None);
    }

    #[test]
    fn name_with_config_in_a_hatemap() {
        let stage = "solar_quality";
        let data: Value = json!({
            "first": {"name": "solar_quality", "config": {"panel_area": 2.0}},
            "second": {"name": "drop_empty"},
            "third": stage,
        });
        let nac = HashMap::<String, NameWithConfig>::deserialize(data)
            .expect("could structurize map of named configs");

        assert_eq!(nac.len(), 3);
    }

    #[test]
    fn impl_trait_surfaces_unknown_fields() {
        #[derive(Deserialize, Debug, Clone)]
        #[serde(deny_unknown_fields)]
        struct Config {
            interval: u64,
        }
        impl Impl for Config {}

        let ok: Value = json!({"interval": 10});
        assert_eq!(Config::new(&ok).expect("valid config").interval, 10);

        let bad: Value = json!({"interval": 10, "intervall": 12});
        assert!(Config::new(&bad).is_err());
    }
}
