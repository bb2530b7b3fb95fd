//! Typed views of the array's REST resources.
//!
//! The array returns generic JSON objects; every relation between them is
//! expressed as a `{"ref": "/<resource>/<id>"}` reference. Lifecycle code
//! only ever touches these records through their typed fields.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DriverError, Result};

/// Resource names understood by the array.
pub mod resources {
    pub const VOLUMES: &str = "volumes";
    pub const VOLUME_GROUPS: &str = "volume_groups";
    pub const HOSTS: &str = "hosts";
    pub const HOST_IQNS: &str = "host_iqns";
    pub const MAPPINGS: &str = "mappings";
    pub const NET_IPS: &str = "system/net_ips";
}

/// A reference to another array object, e.g. `{"ref": "/volumes/7"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    #[serde(rename = "ref")]
    pub path: String,
}

impl ObjectRef {
    pub fn new(resource: &str, id: u64) -> Self {
        ObjectRef {
            path: format!("/{}/{}", resource, id),
        }
    }

    /// The numeric object id at the end of the reference path.
    pub fn id(&self) -> Option<u64> {
        self.path.rsplit('/').next()?.parse().ok()
    }
}

/// A volume. `size` is in KiB, `scsi_sn` is the page 0x80 serial the
/// orchestration layer uses as the blockdevice id.
#[derive(Debug, Clone, Deserialize)]
pub struct VolumeRecord {
    pub id: u64,
    pub name: String,
    pub size: u64,
    pub scsi_sn: String,
    pub volume_group: ObjectRef,
}

impl VolumeRecord {
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(resources::VOLUMES, self.id)
    }
}

/// The dedup/quota container a volume lives in (1:1 in this driver).
#[derive(Debug, Clone, Deserialize)]
pub struct VolumeGroupRecord {
    pub id: u64,
    pub name: String,
}

impl VolumeGroupRecord {
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(resources::VOLUME_GROUPS, self.id)
    }
}

/// A compute node as the array sees it.
#[derive(Debug, Clone, Deserialize)]
pub struct HostRecord {
    pub id: u64,
    pub name: String,
    #[serde(rename = "type")]
    pub host_type: String,
}

impl HostRecord {
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(resources::HOSTS, self.id)
    }
}

/// Binds an iSCSI initiator identity to a host. `host` is absent while
/// the IQN is registered but not yet bound.
#[derive(Debug, Clone, Deserialize)]
pub struct HostIqnRecord {
    pub id: u64,
    pub iqn: String,
    #[serde(default)]
    pub host: Option<ObjectRef>,
}

/// Attaches exactly one volume to exactly one host.
#[derive(Debug, Clone, Deserialize)]
pub struct MappingRecord {
    pub id: u64,
    pub volume: ObjectRef,
    pub host: ObjectRef,
}

/// A data-port address on the array.
#[derive(Debug, Clone, Deserialize)]
pub struct NetIpRecord {
    pub ip_address: String,
}

/// Deserializes a search result set into typed records.
pub fn decode<T: DeserializeOwned>(hits: Vec<Value>) -> Result<Vec<T>> {
    hits.into_iter()
        .map(|hit| {
            serde_json::from_value(hit)
                .map_err(|e| DriverError::Api(format!("malformed array response: {}", e)))
        })
        .collect()
}

/// Deserializes a single created/updated object.
pub fn decode_one<T: DeserializeOwned>(object: Value) -> Result<T> {
    serde_json::from_value(object)
        .map_err(|e| DriverError::Api(format!("malformed array response: {}", e)))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_object_ref_round_trip() {
        let r = ObjectRef::new(resources::VOLUMES, 42);
        assert_eq!(r.path, "/volumes/42");
        assert_eq!(r.id(), Some(42));
        assert_eq!(serde_json::to_value(&r).unwrap(), json!({"ref": "/volumes/42"}));
    }

    #[test]
    fn test_decode_volume_record() {
        let hits = vec![json!({
            "id": 7,
            "name": "K2F-11111111-1111-1111-1111-111111111111",
            "size": 1048576,
            "scsi_sn": "20024f400d5570001",
            "volume_group": {"ref": "/volume_groups/3"},
        })];
        let volumes: Vec<VolumeRecord> = decode(hits).unwrap();
        assert_eq!(volumes[0].scsi_sn, "20024f400d5570001");
        assert_eq!(volumes[0].volume_group.id(), Some(3));
        assert_eq!(volumes[0].object_ref().path, "/volumes/7");
    }

    #[test]
    fn test_decode_unbound_host_iqn() {
        let iqns: Vec<HostIqnRecord> =
            decode(vec![json!({"id": 1, "iqn": "iqn.1994-05.com.redhat:x"})]).unwrap();
        assert!(iqns[0].host.is_none());
    }

    #[test]
    fn test_decode_rejects_malformed_hit() {
        let result: Result<Vec<MappingRecord>> = decode(vec![json!({"id": "wat"})]);
        assert!(matches!(result, Err(DriverError::Api(_))));
    }
}
