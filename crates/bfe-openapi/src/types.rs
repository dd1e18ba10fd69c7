//! Wire types for the open-api product pool endpoints

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::ApiError;

/// Port map key used for the single port each pool instance exposes
pub const DEFAULT_PORT_KEY: &str = "Default";

/// One backend member of an instance pool
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Instance {
    #[serde(default, deserialize_with = "null_as_default")]
    pub hostname: String,
    pub ip: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub weight: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub ports: BTreeMap<String, i32>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tags: BTreeMap<String, String>,
}

impl Instance {
    /// Port published under [`DEFAULT_PORT_KEY`]
    pub fn default_port(&self) -> Option<i32> {
        self.ports.get(DEFAULT_PORT_KEY).copied()
    }
}

/// Body of create and update requests
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpsertParam {
    pub name: String,
    pub instances: Vec<Instance>,
}

/// Pool as returned by the server
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PoolResponse {
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub instances: Vec<Instance>,
}

/// Response envelope
///
/// Older servers spell the message field `RetMsg`, newer ones `ErrMsg`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ApiResponse {
    #[serde(rename = "ErrNum")]
    pub status: u16,
    #[serde(
        rename = "ErrMsg",
        alias = "RetMsg",
        default,
        deserialize_with = "null_as_default"
    )]
    pub message: String,
    #[serde(rename = "Data", default)]
    pub data: Value,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Check the status, returning the envelope untouched on success
    pub fn into_result(self) -> Result<Self, ApiError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ApiError::Status {
                status: self.status,
                message: self.message,
            })
        }
    }

    /// Check the status and decode the payload
    ///
    /// A missing or null payload decodes to `T::default()`.
    pub fn into_data<T>(self) -> Result<T, ApiError>
    where
        T: DeserializeOwned + Default,
    {
        let response = self.into_result()?;
        if response.data.is_null() {
            return Ok(T::default());
        }
        Ok(serde_json::from_value(response.data)?)
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
