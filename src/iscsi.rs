//! Host-side iSCSI session and multipath handling.
//!
//! Everything here shells out through a [`CommandRunner`]: `iscsiadm` for
//! discovery and sessions, `rescan-scsi-bus.sh` for LUN discovery,
//! `multipath` for the aggregated device table and `/lib/udev/scsi_id` for
//! page 0x80 identifiers.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use regex::Regex;
use tracing::{info, warn};

use crate::config::{MULTIPATH_PROBE_DELAY, MULTIPATH_PROBE_LIMIT, RESCAN_SETTLE_DELAY};
use crate::runner::CommandRunner;

const INITIATOR_NAME_FILE: &str = "/etc/iscsi/initiatorname.iscsi";
const SCSI_ID: &str = "/lib/udev/scsi_id";
/// Vendor tag on the map-name line of `multipath -l` output for K2 LUNs.
const MULTIPATH_VENDOR_TAG: &str = "KMNRIO";
const DEV_MAPPER: &str = "/dev/mapper/";

/// Manages the host's iSCSI sessions and device paths for the array.
#[derive(Clone)]
pub struct IscsiSession {
    runner: Arc<dyn CommandRunner>,
    /// Device directory to scan for single paths. `/dev` unless the driver
    /// runs in a container with the host devices mounted elsewhere.
    dev_dir: PathBuf,
    settle_delay: Duration,
    probe_delay: Duration,
    probe_limit: u32,
}

impl IscsiSession {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        IscsiSession {
            runner,
            dev_dir: PathBuf::from("/dev"),
            settle_delay: RESCAN_SETTLE_DELAY,
            probe_delay: MULTIPATH_PROBE_DELAY,
            probe_limit: MULTIPATH_PROBE_LIMIT,
        }
    }

    pub fn with_dev_dir(mut self, dev_dir: impl Into<PathBuf>) -> Self {
        self.dev_dir = dev_dir.into();
        self
    }

    /// Drops the settle and probe delays. Canned-runner tests only.
    #[cfg(test)]
    pub fn without_delays(mut self) -> Self {
        self.settle_delay = Duration::ZERO;
        self.probe_delay = Duration::ZERO;
        self
    }

    /// Discovers targets behind `ip:port` and logs in to each of them.
    /// Returns true only if every login command succeeded.
    pub fn login(&self, ip: &str, port: u16) -> bool {
        self.discover_and_act(ip, port, true)
    }

    /// Discovers targets behind `ip:port` and logs out of each of them.
    pub fn logout(&self, ip: &str, port: u16) -> bool {
        self.discover_and_act(ip, port, false)
    }

    fn discover_and_act(&self, ip: &str, port: u16, login: bool) -> bool {
        let portal = format!("{}:{}", ip, port);
        let discovery = self
            .runner
            .run(&["iscsiadm", "-m", "discovery", "-t", "st", "-p", &portal]);

        let action = if login { "-l" } else { "-u" };
        let mut all_succeeded = true;
        for line in discovery.stdout.lines() {
            // Target lines look like "10.0.0.1:3260,1 iqn.2009-01.com...".
            if !line.contains(':') {
                continue;
            }
            let target_iqn = match line.split_whitespace().nth(1) {
                Some(iqn) => iqn,
                None => continue,
            };

            let output = self
                .runner
                .run(&["iscsiadm", "-m", "node", "-T", target_iqn, action]);
            if output.success() {
                info!("Performed {} on {}", action, target_iqn);
            } else {
                warn!(
                    "iscsiadm {} failed for {} (status {})",
                    action, target_iqn, output.status
                );
                all_succeeded = false;
            }
        }
        all_succeeded
    }

    /// Reads the host's iSCSI initiator name (IQN).
    pub fn initiator_name(&self) -> Option<String> {
        let output = self.runner.run(&["cat", INITIATOR_NAME_FILE]);
        for line in output.stdout.lines() {
            if let Some((_, value)) = line.split_once('=') {
                return Some(value.trim().to_string());
            }
        }
        info!("No iSCSI initiator name configured on this host");
        None
    }

    /// Runs the full host rescan: iSCSI session rescan, SCSI bus rescan,
    /// multipath table refresh, with a settle delay before each step so
    /// the kernel has time to surface new devices.
    ///
    /// This is a multi-second blocking call; lifecycle operations submit
    /// it as a background task instead of calling it inline.
    pub fn rescan(&self) {
        thread::sleep(self.settle_delay);
        let start = Instant::now();
        self.runner.run(&["iscsiadm", "-m", "session", "--rescan"]);
        info!("Rescanned iSCSI sessions in {:?}", start.elapsed());

        thread::sleep(self.settle_delay);
        self.runner.run(&["rescan-scsi-bus.sh"]);

        thread::sleep(self.settle_delay);
        self.runner.run(&["multipath"]);
        info!("Host rescan completed");
    }

    /// Finds the local device paths whose page 0x80 identifier contains
    /// `device_id`. Single paths are sorted; if a multipath aggregate
    /// exists it is probed for a bounded number of attempts and, when
    /// found, put at the front of the list.
    pub fn find_paths(&self, device_id: &str) -> Vec<PathBuf> {
        lazy_static! {
            static ref SCSI_DISK: Regex = Regex::new(r"^sd[a-z]+$").unwrap();
        }

        let mut paths: Vec<String> = Vec::new();
        let entries = match fs::read_dir(&self.dev_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Cannot list {}: {}", self.dev_dir.display(), e);
                return Vec::new();
            }
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = match name.to_str() {
                Some(name) => name,
                None => continue,
            };
            // Whole-disk devices only; sda1 and friends are partitions.
            if !SCSI_DISK.is_match(name) {
                continue;
            }
            let device = self.dev_dir.join(name);
            let device_str = device.to_string_lossy().into_owned();
            let output = self.runner.run(&[
                SCSI_ID,
                "--page=0x80",
                "--whitelisted",
                &format!("--device={}", device_str),
            ]);
            if output.stdout.contains(device_id) {
                info!("Found {} at {}", device_id, device_str);
                paths.push(device_str);
            }
        }

        // Callers always want the same device reported for equal state.
        paths.sort();

        if !paths.is_empty() {
            let mut probes = 0;
            while probes < self.probe_limit {
                if let Some(mpath) = self.multipath_device(&paths[0]) {
                    info!("Found multipath device {}", mpath);
                    paths.insert(0, mpath);
                    break;
                }
                probes += 1;
                thread::sleep(self.probe_delay);
            }
        }

        paths.into_iter().map(PathBuf::from).collect()
    }

    /// Looks up the multipath aggregate for a single-path device, e.g.
    /// `/dev/mapper/mpathb` for `/dev/sdw`. The map-name line of
    /// `multipath -l` carries the K2 vendor tag:
    ///
    /// ```text
    /// mpathb (20024f400d5570001) dm-2 KMNRIO ,k2
    /// size=2.0G features='0' hwhandler='0' wp=rw
    /// ```
    fn multipath_device(&self, scsi_device: &str) -> Option<String> {
        let output = self.runner.run(&["multipath", "-l", scsi_device]);
        for line in output.stdout.lines() {
            if !line.contains(MULTIPATH_VENDOR_TAG) {
                continue;
            }
            let name = line.split_whitespace().next()?;
            return Some(format!("{}{}", DEV_MAPPER, name));
        }
        None
    }

    /// Flushes buffered writes to disk. Run before detaching so an
    /// unmounted-but-cached filesystem is not lost.
    pub fn sync_device(&self) {
        self.runner.run(&["sync"]);
        info!("Flushed host buffers");
    }

    /// Tells the multipath manager to forget a `/dev/mapper/...` map.
    pub fn remove_multipath(&self, mpath: &str) {
        let Some(name) = mpath.strip_prefix(DEV_MAPPER) else {
            return;
        };
        let output = self.runner.run(&["multipath", "-f", name]);
        if !output.success() {
            warn!("Failed to remove multipath device {}", mpath);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::sync::Arc;

    use super::*;
    use crate::runner::testing::FakeRunner;

    fn session(runner: Arc<FakeRunner>) -> IscsiSession {
        IscsiSession::new(runner).without_delays()
    }

    fn dev_tree(names: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for name in names {
            File::create(dir.path().join(name)).unwrap();
        }
        dir
    }

    fn scsi_id_command(dir: &tempfile::TempDir, name: &str) -> String {
        format!(
            "/lib/udev/scsi_id --page=0x80 --whitelisted --device={}",
            dir.path().join(name).display()
        )
    }

    #[test]
    fn test_login_discovers_and_logs_in_every_target() {
        let runner = Arc::new(FakeRunner::new());
        runner.respond(
            "iscsiadm -m discovery -t st -p 10.0.0.1:3260",
            "10.0.0.1:3260,1 iqn.2009-01.com.kaminario:storage.k2.1\n\
             10.0.0.1:3260,2 iqn.2009-01.com.kaminario:storage.k2.2\n",
            0,
        );
        assert!(session(runner.clone()).login("10.0.0.1", 3260));
        assert!(runner.ran("iscsiadm -m node -T iqn.2009-01.com.kaminario:storage.k2.1 -l"));
        assert!(runner.ran("iscsiadm -m node -T iqn.2009-01.com.kaminario:storage.k2.2 -l"));
    }

    #[test]
    fn test_login_reports_partial_failure() {
        let runner = Arc::new(FakeRunner::new());
        runner.respond(
            "iscsiadm -m discovery -t st -p 10.0.0.1:3260",
            "10.0.0.1:3260,1 iqn.a\n10.0.0.1:3260,2 iqn.b\n",
            0,
        );
        runner.respond("iscsiadm -m node -T iqn.b -l", "", 19);
        assert!(!session(runner).login("10.0.0.1", 3260));
    }

    #[test]
    fn test_logout_uses_logout_action() {
        let runner = Arc::new(FakeRunner::new());
        runner.respond(
            "iscsiadm -m discovery -t st -p 10.0.0.1:3260",
            "10.0.0.1:3260,1 iqn.a\n",
            0,
        );
        assert!(session(runner.clone()).logout("10.0.0.1", 3260));
        assert!(runner.ran("iscsiadm -m node -T iqn.a -u"));
    }

    #[test]
    fn test_initiator_name_parses_config_file() {
        let runner = Arc::new(FakeRunner::new());
        runner.respond(
            "cat /etc/iscsi/initiatorname.iscsi",
            "InitiatorName=iqn.1994-05.com.redhat:b8bbdc\n",
            0,
        );
        assert_eq!(
            session(runner).initiator_name(),
            Some("iqn.1994-05.com.redhat:b8bbdc".to_string())
        );
    }

    #[test]
    fn test_initiator_name_absent() {
        let runner = Arc::new(FakeRunner::new());
        runner.respond("cat /etc/iscsi/initiatorname.iscsi", "", 1);
        assert_eq!(session(runner).initiator_name(), None);
    }

    #[test]
    fn test_rescan_runs_all_three_steps_in_order() {
        let runner = Arc::new(FakeRunner::new());
        session(runner.clone()).rescan();
        assert_eq!(
            runner.calls(),
            vec![
                "iscsiadm -m session --rescan".to_string(),
                "rescan-scsi-bus.sh".to_string(),
                "multipath".to_string(),
            ]
        );
    }

    #[test]
    fn test_find_paths_orders_multipath_first() {
        let dir = dev_tree(&["sdb", "sda", "sda1", "nvme0n1"]);
        let runner = Arc::new(FakeRunner::new());
        runner.respond(&scsi_id_command(&dir, "sda"), "20024f400d5570001\n", 0);
        runner.respond(&scsi_id_command(&dir, "sdb"), "20024f400d5570001\n", 0);
        runner.respond(
            &format!("multipath -l {}", dir.path().join("sda").display()),
            "mpathb (20024f400d5570001) dm-2 KMNRIO ,k2\n\
             size=2.0G features='0' hwhandler='0' wp=rw\n",
            0,
        );

        let paths = session(runner).with_dev_dir(dir.path()).find_paths("20024f400d5570001");
        assert_eq!(paths.len(), 3);
        assert_eq!(paths[0], PathBuf::from("/dev/mapper/mpathb"));
        assert_eq!(paths[1], dir.path().join("sda"));
        assert_eq!(paths[2], dir.path().join("sdb"));
    }

    #[test]
    fn test_find_paths_without_multipath_keeps_sorted_single_paths() {
        let dir = dev_tree(&["sdb", "sda"]);
        let runner = Arc::new(FakeRunner::new());
        runner.respond(&scsi_id_command(&dir, "sdb"), "2002deadbeef\n", 0);

        let paths = session(runner.clone()).with_dev_dir(dir.path()).find_paths("2002deadbeef");
        assert_eq!(paths, vec![dir.path().join("sdb")]);
        // Probing is bounded.
        let probes = runner
            .calls()
            .iter()
            .filter(|c| c.starts_with("multipath -l"))
            .count();
        assert_eq!(probes, MULTIPATH_PROBE_LIMIT as usize);
    }

    #[test]
    fn test_find_paths_empty_for_unknown_device_id() {
        let dir = dev_tree(&["sda"]);
        let runner = Arc::new(FakeRunner::new());
        runner.respond(&scsi_id_command(&dir, "sda"), "2002something\n", 0);
        assert!(session(runner).with_dev_dir(dir.path()).find_paths("2002other").is_empty());
    }

    #[test]
    fn test_remove_multipath_flushes_map_name() {
        let runner = Arc::new(FakeRunner::new());
        session(runner.clone()).remove_multipath("/dev/mapper/mpathb");
        assert!(runner.ran("multipath -f mpathb"));
    }

    #[test]
    fn test_remove_multipath_ignores_plain_devices() {
        let runner = Arc::new(FakeRunner::new());
        session(runner.clone()).remove_multipath("/dev/sda");
        assert!(runner.calls().is_empty());
    }
}
