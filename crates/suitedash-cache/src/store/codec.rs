//! Value encoding shared by both calling conventions.
//!
//! Values are stored as MessagePack with named fields, so a value written by
//! the blocking client decodes identically through the async client and
//! structs remain readable as maps.

use serde::{Serialize, de::DeserializeOwned};

use crate::error::StoreResult;

pub fn encode<T: Serialize + ?Sized>(value: &T) -> StoreResult<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(value)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    Ok(rmp_serde::from_slice(bytes)?)
}
