//! Cluster serialization layer.
//!
//! Every operation, response, and backfill chunk crosses the cluster through
//! these helpers. The payload format is JSON; the protobuf builtins in
//! `crate::term` additionally keep their own byte-stable prost encoding for
//! peers that predate this node.

use serde::de::DeserializeOwned;
use serde::Serialize;

pub fn encode<T: Serialize>(message: &T) -> anyhow::Result<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}

pub fn decode<T: DeserializeOwned>(data: &[u8]) -> anyhow::Result<T> {
    Ok(serde_json::from_slice(data)?)
}
