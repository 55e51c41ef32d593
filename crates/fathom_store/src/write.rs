//! Write operations and their responses.
//!
//! Every write targets exactly one key, so its region is that key's single
//! hash cell and it never shards into more than one piece. Both unshard
//! flavors therefore expect exactly one response and return it verbatim.

use serde::{Deserialize, Serialize};

use crate::eval::{RuntimeError, Scopes, Value};
use crate::keys::StoreKey;
use crate::region::{monokey_region, Region};
use crate::term::{Mapping, ModifyOp};

/// Store `data` at `key`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PointWrite {
    pub key: StoreKey,
    pub data: Value,
}

/// Rewrite the document at `key` through an expression mapping.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PointModify {
    pub primary_key: String,
    pub key: StoreKey,
    pub op: ModifyOp,
    pub scopes: Scopes,
    pub mapping: Mapping,
}

/// Remove the document at `key`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PointDelete {
    pub key: StoreKey,
}

/// A client-visible write operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Write {
    Point(PointWrite),
    Modify(PointModify),
    Delete(PointDelete),
}

/// Outcome of a point write.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreResult {
    Stored,
    Duplicate,
}

/// Outcome of a point modify. Evaluator failures ride here as values, the
/// same way range reads carry them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ModifyResult {
    Modified,
    Skipped,
    Nop,
    Error(RuntimeError),
}

/// Outcome of a point delete.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeleteResult {
    Deleted,
    Missing,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PointWriteResponse {
    pub result: StoreResult,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PointModifyResponse {
    pub result: ModifyResult,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PointDeleteResponse {
    pub result: DeleteResult,
}

/// A response mirroring the write variant it answers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WriteResponse {
    Point(PointWriteResponse),
    Modify(PointModifyResponse),
    Delete(PointDeleteResponse),
}

impl Write {
    fn key(&self) -> &StoreKey {
        match self {
            Write::Point(w) => &w.key,
            Write::Modify(m) => &m.key,
            Write::Delete(d) => &d.key,
        }
    }

    /// The single hash cell this write affects.
    pub fn get_region(&self) -> Region {
        monokey_region(self.key())
    }

    /// Writes never split: `region` must equal the write's own region.
    pub fn shard(&self, region: &Region) -> Write {
        debug_assert_eq!(self.get_region(), *region, "sharding a write elsewhere");
        self.clone()
    }

    /// Writes land on a single shard, so there is exactly one response.
    pub fn unshard(&self, responses: &[WriteResponse]) -> WriteResponse {
        debug_assert_eq!(responses.len(), 1, "writes target a single hash cell");
        responses[0].clone()
    }

    pub fn multistore_unshard(&self, responses: &[WriteResponse]) -> WriteResponse {
        self.unshard(responses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(s: &str) -> StoreKey {
        StoreKey::from(s)
    }

    #[test]
    fn every_write_variant_lives_in_its_monokey_region() {
        let writes = [
            Write::Point(PointWrite {
                key: key("k"),
                data: json!({"id": "k"}),
            }),
            Write::Modify(PointModify {
                primary_key: "id".to_string(),
                key: key("k"),
                op: ModifyOp::Update,
                scopes: Scopes::new(),
                mapping: Mapping::default(),
            }),
            Write::Delete(PointDelete { key: key("k") }),
        ];
        for write in &writes {
            assert_eq!(write.get_region(), monokey_region(&key("k")));
            let region = write.get_region();
            assert_eq!(region.end, region.beg + 1);
        }
    }

    #[test]
    fn shard_is_identity_on_the_own_region() {
        let write = Write::Delete(PointDelete { key: key("k") });
        let sharded = write.shard(&write.get_region());
        assert_eq!(sharded, write);
    }

    #[test]
    fn unshard_passes_the_single_response_through() {
        let write = Write::Point(PointWrite {
            key: key("k"),
            data: json!(1),
        });
        let response = WriteResponse::Point(PointWriteResponse {
            result: StoreResult::Stored,
        });
        assert_eq!(write.unshard(std::slice::from_ref(&response)), response);
        assert_eq!(
            write.multistore_unshard(std::slice::from_ref(&response)),
            response
        );
    }
}
