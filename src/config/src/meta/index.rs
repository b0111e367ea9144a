// Copyright 2024 Quiver Labs Inc.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use std::{collections::BTreeMap, str::FromStr};

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub name: String,
    pub settings: IndexSettings,
    #[serde(default)]
    pub mappings: Mappings,
    pub state: IndexState,
    pub created_at: i64,
    pub updated_at: i64,
}

impl IndexMeta {
    pub fn new(name: &str, settings: IndexSettings, mappings: Mappings, at_micros: i64) -> Self {
        IndexMeta {
            name: name.to_string(),
            settings,
            mappings,
            state: IndexState::Creating,
            created_at: at_micros,
            updated_at: at_micros,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("index name must not be empty".to_string());
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_' || c == '.')
        {
            return Err(format!(
                "index name may only contain lowercase letters, digits, '-', '_' and '.': {}",
                self.name
            ));
        }
        if self.name.starts_with(['-', '_', '.']) {
            return Err(format!("index name must not start with '-', '_' or '.': {}", self.name));
        }
        if self.settings.shards == 0 {
            return Err("settings.shards must be >= 1".to_string());
        }
        if self.settings.shards > 1024 {
            return Err("settings.shards must be <= 1024".to_string());
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum IndexState {
    Creating,
    Active,
    Deleting,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexSettings {
    #[serde(default = "default_shards")]
    pub shards: u32,
    #[serde(default)]
    pub replicas: u32,
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
    #[serde(default)]
    pub codec: Codec,
}

fn default_shards() -> u32 {
    1
}

fn default_refresh_interval_ms() -> u64 {
    1000
}

impl Default for IndexSettings {
    fn default() -> Self {
        IndexSettings {
            shards: default_shards(),
            replicas: 0,
            refresh_interval_ms: default_refresh_interval_ms(),
            codec: Codec::Default,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum Codec {
    #[default]
    #[serde(rename = "default")]
    Default,
    #[serde(rename = "best_compression")]
    BestCompression,
}

impl FromStr for Codec {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "" | "default" => Ok(Codec::Default),
            "best_compression" => Ok(Codec::BestCompression),
            _ => Err(format!("Invalid codec: {s}")),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Mappings {
    #[serde(default)]
    pub properties: BTreeMap<String, FieldMapping>,
}

impl Mappings {
    pub fn field_type(&self, field: &str) -> Option<FieldType> {
        self.properties.get(field).map(|m| m.field_type)
    }

    /// The analyzer used for a text field, at index and at search time alike.
    pub fn analyzer<'a>(&'a self, field: &str, default: &'a str) -> &'a str {
        self.properties
            .get(field)
            .and_then(|m| m.analyzer.as_deref())
            .unwrap_or(default)
    }

    pub fn text_fields(&self) -> impl Iterator<Item = &str> {
        self.properties
            .iter()
            .filter(|(_, m)| m.field_type == FieldType::Text)
            .map(|(k, _)| k.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analyzer: Option<String>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Keyword,
    Long,
    Double,
    Bool,
    Date,
}
