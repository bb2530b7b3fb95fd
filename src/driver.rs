//! The volume lifecycle core: translates orchestration-layer calls into
//! array operations and host-side iSCSI/multipath work.
//!
//! Volume state is observed, never cached: `NotExist` →
//! `Exists/Unmapped` → `Exists/Mapped` and back, with the array as the
//! single source of truth for every transition.

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::capacity;
use crate::client::ArrayClient;
use crate::config::{
    DriverConfig, CONTROL_VOLUME_NAME, DATASET_ID_LEN, ISCSI_PORT, UNLIMITED_QUOTA, VG_PREFIX,
    VOL_PREFIX,
};
use crate::error::{DriverError, Result};
use crate::iscsi::IscsiSession;
use crate::records::{
    decode, decode_one, resources, HostIqnRecord, HostRecord, MappingRecord, NetIpRecord,
    ObjectRef, VolumeGroupRecord, VolumeRecord,
};
use crate::runner::CommandRunner;

/// A volume as the orchestration layer sees it: SCSI serial as the
/// identifier, size in bytes, the attached node if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDeviceVolume {
    pub blockdevice_id: String,
    pub size: u64,
    pub attached_to: Option<String>,
    pub dataset_id: Uuid,
}

impl BlockDeviceVolume {
    /// Converts an array volume record. The dataset id is the trailing
    /// fixed-length suffix of the volume name; names that don't conform
    /// get the nil UUID.
    fn from_record(volume: &VolumeRecord, attached_to: Option<String>) -> Self {
        let dataset_id = volume
            .name
            .len()
            .checked_sub(DATASET_ID_LEN)
            .and_then(|start| volume.name.get(start..))
            .and_then(|suffix| Uuid::parse_str(suffix).ok())
            .unwrap_or_else(Uuid::nil);

        BlockDeviceVolume {
            blockdevice_id: volume.scsi_sn.clone(),
            size: capacity::kib_to_bytes(volume.size),
            attached_to,
            dataset_id,
        }
    }
}

/// Block device driver for the K2 storage array.
pub struct BlockDriver {
    client: Arc<ArrayClient>,
    iscsi: IscsiSession,
    runner: Arc<dyn CommandRunner>,
    is_dedup: bool,
    destroy_host: bool,
    instance_name: OnceLock<String>,
}

impl BlockDriver {
    pub fn new(
        config: &DriverConfig,
        client: Arc<ArrayClient>,
        iscsi: IscsiSession,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(BlockDriver {
            client,
            iscsi,
            runner,
            is_dedup: config.is_dedup(),
            destroy_host: config.destroy_host,
            instance_name: OnceLock::new(),
        })
    }

    /// The minimum allocatable granularity the array recommends.
    pub fn allocation_unit(&self) -> u64 {
        capacity::allocation_unit()
    }

    /// A stable identity for this node: its hostname, cached for the
    /// life of the driver instance.
    pub fn compute_instance_id(&self) -> Result<String> {
        if let Some(name) = self.instance_name.get() {
            return Ok(name.clone());
        }
        let output = self.runner.run(&["uname", "-n"]);
        let name = output.stdout.trim().to_string();
        if name.is_empty() {
            return Err(DriverError::InvalidData(
                "cannot determine the local hostname".into(),
            ));
        }
        Ok(self.instance_name.get_or_init(|| name).clone())
    }

    fn host_type(&self) -> String {
        let os = self.runner.run(&["uname", "-s"]).stdout.trim().to_string();
        if os.is_empty() {
            "Linux".to_string()
        } else {
            os
        }
    }

    /// Creates a volume group and a volume inside it for `dataset_id`.
    /// A group created without a following volume is left behind; the
    /// array has no transactional create.
    pub async fn create_volume(&self, dataset_id: Uuid, size: u64) -> Result<BlockDeviceVolume> {
        let group_name = format!("{}-{}", VG_PREFIX, dataset_id);
        let volume_name = format!("{}-{}", VOL_PREFIX, dataset_id);
        info!("Creating volume {} ({} bytes)", volume_name, size);

        let group: VolumeGroupRecord = decode_one(
            self.client
                .create(
                    resources::VOLUME_GROUPS,
                    json!({
                        "name": group_name,
                        "quota": UNLIMITED_QUOTA,
                        "is_dedup": self.is_dedup,
                    }),
                )
                .await
                .map_err(|e| {
                    DriverError::Api(format!(
                        "error creating volume group for dataset {}: {}",
                        dataset_id, e
                    ))
                })?,
        )?;

        let volume: VolumeRecord = decode_one(
            self.client
                .create(
                    resources::VOLUMES,
                    json!({
                        "name": volume_name,
                        "size": capacity::bytes_to_kib(size),
                        "volume_group": group.object_ref(),
                    }),
                )
                .await
                .map_err(|e| {
                    DriverError::Api(format!(
                        "error creating volume for dataset {}: {}",
                        dataset_id, e
                    ))
                })?,
        )?;

        Ok(BlockDeviceVolume::from_record(&volume, None))
    }

    /// Attaches a volume to this node: resolves or creates the array
    /// host bound to the local IQN, logs in to every data port, then
    /// maps the volume and kicks off a background rescan.
    pub async fn attach_volume(
        &self,
        blockdevice_id: &str,
        attach_to: &str,
    ) -> Result<BlockDeviceVolume> {
        info!("Attaching {} to {}", blockdevice_id, attach_to);
        let volume = self.find_volume(blockdevice_id).await?;

        let iqn = self.iscsi.initiator_name().ok_or_else(|| {
            DriverError::InvalidData(format!(
                "no iSCSI initiator name on this host (blockdevice_id: {})",
                blockdevice_id
            ))
        })?;
        let bound_iqn = self.find_host_iqn(&iqn).await?;

        let host_ref = match bound_iqn.as_ref().and_then(|b| b.host.clone()) {
            Some(host_ref) => host_ref,
            None => {
                // The IQN is not bound yet. A host already registered
                // under this node's name is an inconsistent state we
                // refuse to adopt silently.
                let existing = self
                    .client
                    .search(resources::HOSTS, json!({ "name": attach_to }))
                    .await?;
                if !existing.is_empty() {
                    return Err(DriverError::InvalidData(format!(
                        "host {} exists but is not bound to iqn {}",
                        attach_to, iqn
                    )));
                }
                let host = self.create_host(attach_to).await?;
                self.bind_iqn(&iqn, bound_iqn, &host).await?;
                host.object_ref()
            }
        };

        // Make sure the host is logged in to every array data port
        // before the volume is mapped.
        for ip in self.net_ips().await? {
            self.iscsi.login(&ip.ip_address, ISCSI_PORT);
        }

        if let Some(mapping) = self.find_mapping(&volume).await? {
            if mapping.host != host_ref {
                return Err(DriverError::AlreadyAttachedVolume(blockdevice_id.to_string()));
            }
            // Already mapped to this host; nothing to create.
            info!("{} is already mapped to {}", blockdevice_id, attach_to);
            return Ok(BlockDeviceVolume::from_record(
                &volume,
                Some(attach_to.to_string()),
            ));
        }

        self.client
            .create(
                resources::MAPPINGS,
                json!({
                    "volume": volume.object_ref(),
                    "host": host_ref,
                }),
            )
            .await
            .map_err(|e| {
                DriverError::Api(format!(
                    "unable to map volume {} to {}: {}",
                    blockdevice_id, attach_to, e
                ))
            })?;
        info!("Mapped {} to {}", blockdevice_id, attach_to);

        self.spawn_rescan("attach");

        Ok(BlockDeviceVolume::from_record(
            &volume,
            Some(attach_to.to_string()),
        ))
    }

    /// Detaches a volume from whatever host it is mapped to: flushes
    /// buffers, forgets the multipath aggregate, deletes the mapping
    /// after confirming the mapped host is the IQN-bound one, and
    /// rescans in the background.
    pub async fn detach_volume(&self, blockdevice_id: &str) -> Result<()> {
        info!("Detaching {}", blockdevice_id);
        let volume = self.find_volume(blockdevice_id).await?;
        let mapping = self
            .find_mapping(&volume)
            .await?
            .ok_or_else(|| DriverError::UnattachedVolume(blockdevice_id.to_string()))?;

        self.iscsi.sync_device();

        for path in self.iscsi.find_paths(blockdevice_id) {
            let path = path.to_string_lossy();
            if path.starts_with("/dev/mapper/") {
                self.iscsi.remove_multipath(&path);
                break;
            }
        }

        let mapped_host = self
            .host_by_ref(&mapping.host)
            .await?
            .ok_or_else(|| DriverError::api_for(blockdevice_id, "unable to locate mapped host"))?;

        let iqn_host = match self.iscsi.initiator_name() {
            Some(iqn) => match self.find_host_iqn(&iqn).await?.and_then(|b| b.host) {
                Some(host_ref) => self.host_by_ref(&host_ref).await?,
                None => None,
            },
            None => None,
        };

        // Conservative guard: only delete the mapping when the mapped
        // host is the one bound to this node's IQN. On mismatch the
        // mapping stays; device cleanup above has already happened.
        match iqn_host {
            Some(iqn_host) if iqn_host.name == mapped_host.name => {
                self.client.delete(resources::MAPPINGS, mapping.id).await?;
                info!("Removed mapping of {} from {}", blockdevice_id, mapped_host.name);
            }
            _ => {
                warn!(
                    "Mapped host {} does not match the IQN-bound host, leaving the mapping of {} in place",
                    mapped_host.name, blockdevice_id
                );
            }
        }

        if self.destroy_host {
            if let Err(e) = self.client.delete(resources::HOSTS, mapped_host.id).await {
                error!("Unable to delete host {}: {}", mapped_host.name, e);
            }
        }

        self.spawn_rescan("detach");
        Ok(())
    }

    /// Destroys a volume and its volume group. Refuses while a mapping
    /// exists; detach first.
    pub async fn destroy_volume(&self, blockdevice_id: &str) -> Result<()> {
        info!("Destroying volume {}", blockdevice_id);
        let volume = self.find_volume(blockdevice_id).await?;
        if self.find_mapping(&volume).await?.is_some() {
            return Err(DriverError::VolumeMapped(blockdevice_id.to_string()));
        }

        let group_id = volume.volume_group.id().ok_or_else(|| {
            DriverError::api_for(blockdevice_id, "volume has a malformed volume_group reference")
        })?;

        let wrap = |e: DriverError| {
            DriverError::Api(format!(
                "error destroying volume blockdevice_id:{}: {}",
                blockdevice_id, e
            ))
        };
        self.client
            .delete(resources::VOLUMES, volume.id)
            .await
            .map_err(wrap)?;
        self.client
            .delete(resources::VOLUME_GROUPS, group_id)
            .await
            .map_err(wrap)
    }

    /// Lists every volume on the array with its attachment state. The
    /// array's internal control volume is excluded.
    pub async fn list_volumes(&self) -> Result<Vec<BlockDeviceVolume>> {
        let volumes: Vec<VolumeRecord> =
            decode(self.client.search(resources::VOLUMES, json!({})).await?)?;
        let mappings: Vec<MappingRecord> =
            decode(self.client.search(resources::MAPPINGS, json!({})).await?)?;
        let hosts: Vec<HostRecord> =
            decode(self.client.search(resources::HOSTS, json!({})).await?)?;

        let host_name = |host_ref: &ObjectRef| {
            hosts
                .iter()
                .find(|h| h.object_ref() == *host_ref)
                .map(|h| h.name.clone())
        };

        let mut result: Vec<BlockDeviceVolume> = volumes
            .iter()
            .filter(|volume| volume.name != CONTROL_VOLUME_NAME)
            .map(|volume| {
                let attached_to = mappings
                    .iter()
                    .find(|m| m.volume == volume.object_ref())
                    .and_then(|m| host_name(&m.host));
                BlockDeviceVolume::from_record(volume, attached_to)
            })
            .collect();

        // Stable output for equal array state.
        result.sort_by(|a, b| a.blockdevice_id.cmp(&b.blockdevice_id));
        Ok(result)
    }

    /// The local device path for an attached volume, multipath aggregate
    /// first. `None` when the path has not been discovered yet.
    pub async fn get_device_path(&self, blockdevice_id: &str) -> Result<Option<PathBuf>> {
        let volume = self.find_volume(blockdevice_id).await?;
        if self.find_mapping(&volume).await?.is_none() {
            return Err(DriverError::UnattachedVolume(blockdevice_id.to_string()));
        }

        let mut paths = self.iscsi.find_paths(blockdevice_id);
        if paths.is_empty() {
            return Ok(None);
        }
        Ok(Some(paths.remove(0)))
    }

    /// Submits the slow host rescan as a background task. The lifecycle
    /// call returns immediately; the outcome is logged by a detached
    /// task so a panicking rescan is never silently dropped.
    fn spawn_rescan(&self, trigger: &'static str) {
        let session = self.iscsi.clone();
        let work = tokio::task::spawn_blocking(move || session.rescan());
        tokio::spawn(async move {
            match work.await {
                Ok(()) => info!("Background {} rescan finished", trigger),
                Err(e) => error!("Background {} rescan failed: {}", trigger, e),
            }
        });
    }

    async fn find_volume(&self, blockdevice_id: &str) -> Result<VolumeRecord> {
        let hits = self
            .client
            .search(resources::VOLUMES, json!({ "scsi_sn": blockdevice_id }))
            .await?;
        decode::<VolumeRecord>(hits)?
            .into_iter()
            .next()
            .ok_or_else(|| DriverError::UnknownVolume(blockdevice_id.to_string()))
    }

    async fn find_mapping(&self, volume: &VolumeRecord) -> Result<Option<MappingRecord>> {
        let hits = self
            .client
            .search(resources::MAPPINGS, json!({ "volume": volume.object_ref() }))
            .await?;
        Ok(decode(hits)?.into_iter().next())
    }

    async fn find_host_iqn(&self, iqn: &str) -> Result<Option<HostIqnRecord>> {
        let hits = self
            .client
            .search(resources::HOST_IQNS, json!({ "iqn": iqn }))
            .await?;
        Ok(decode(hits)?.into_iter().next())
    }

    async fn host_by_ref(&self, host_ref: &ObjectRef) -> Result<Option<HostRecord>> {
        let Some(id) = host_ref.id() else {
            return Ok(None);
        };
        let hits = self.client.search(resources::HOSTS, json!({ "id": id })).await?;
        Ok(decode(hits)?.into_iter().next())
    }

    async fn net_ips(&self) -> Result<Vec<NetIpRecord>> {
        decode(self.client.search(resources::NET_IPS, json!({})).await?)
    }

    async fn create_host(&self, name: &str) -> Result<HostRecord> {
        let host = decode_one(
            self.client
                .create(
                    resources::HOSTS,
                    json!({ "name": name, "type": self.host_type() }),
                )
                .await?,
        )?;
        info!("Created new host {}", name);
        Ok(host)
    }

    /// Binds the local IQN to `host`, updating an existing unbound
    /// registration or creating the binding from scratch.
    async fn bind_iqn(
        &self,
        iqn: &str,
        existing: Option<HostIqnRecord>,
        host: &HostRecord,
    ) -> Result<()> {
        match existing {
            Some(record) => {
                self.client
                    .update(
                        resources::HOST_IQNS,
                        record.id,
                        json!({ "host": host.object_ref() }),
                    )
                    .await?;
            }
            None => {
                self.client
                    .create(
                        resources::HOST_IQNS,
                        json!({ "iqn": iqn, "host": host.object_ref() }),
                    )
                    .await?;
            }
        }
        info!("Bound iqn {} to host {}", iqn, host.name);
        Ok(())
    }
}
