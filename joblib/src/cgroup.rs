//! Cgroup v2 confinement for jobs.
//!
//! Each job gets one leaf directory `<root>/<worker>/<job_id>`. Controllers
//! are enabled on the worker's parent directory, limits are written into the
//! leaf, and the child process is placed into the leaf at spawn time through
//! the directory handle opened here.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};

const SUBTREE_CONTROLLERS: &str = "+memory +cpu +io";

/// One second, in the microseconds `cpu.max` expects.
const CPU_PERIOD_USEC: i64 = 1_000_000;

/// Resource ceilings applied to a job's cgroup. A zero value leaves that
/// dimension unlimited and its control file untouched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Memory ceiling in bytes.
    pub memory_bytes: u64,
    /// CPU ceiling as a percentage of one core; 100 is a full core.
    pub cpu_percentage: i32,
    /// Disk throughput ceiling in bytes per second, applied to both reads
    /// and writes on every whole disk.
    pub disk_io_bps: i32,
}

/// Owns one cgroup-v2 leaf directory for the lifetime of a job.
pub struct CgroupController {
    root: PathBuf,
    worker: String,
    job_id: String,
    handle: File,
    removed: AtomicBool,
}

impl CgroupController {
    /// Create `<root>/<worker>/<job_id>` and open a handle on it. The worker
    /// parent is created on demand; a pre-existing leaf is an error.
    pub fn new(root: &Path, worker: &str, job_id: &str) -> Result<Self> {
        if !root.join("cgroup.controllers").is_file() {
            return Err(Error::CgroupSetup(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} is not a cgroup v2 mount", root.display()),
            )));
        }

        let worker_path = root.join(worker);
        fs::create_dir_all(&worker_path).map_err(Error::CgroupSetup)?;

        let job_path = worker_path.join(job_id);
        tracing::debug!(path = %job_path.display(), "creating cgroup");
        fs::create_dir(&job_path).map_err(Error::CgroupSetup)?;

        let handle = File::open(&job_path).map_err(Error::CgroupSetup)?;

        Ok(Self {
            root: root.to_path_buf(),
            worker: worker.to_string(),
            job_id: job_id.to_string(),
            handle,
            removed: AtomicBool::new(false),
        })
    }

    /// Directory descriptor handed to the spawn call so the child starts
    /// life inside this leaf.
    pub fn dir_fd(&self) -> BorrowedFd<'_> {
        self.handle.as_fd()
    }

    /// Write the control files for every non-zero limit. Controllers are
    /// enabled on the parent first; limit writes follow in the leaf.
    pub fn configure(&self, limits: &ResourceLimits) -> Result<()> {
        self.enable_subtree_controllers()
            .map_err(Error::CgroupSetup)?;

        if limits.memory_bytes > 0 {
            self.write_control(&self.leaf_file("memory.max"), &limits.memory_bytes.to_string())
                .map_err(Error::CgroupSetup)?;
        }

        if limits.cpu_percentage > 0 {
            self.write_control(&self.leaf_file("cpu.max"), &cpu_max_value(limits.cpu_percentage))
                .map_err(Error::CgroupSetup)?;
        }

        if limits.disk_io_bps > 0 {
            self.apply_io_limit(limits.disk_io_bps)?;
        }

        Ok(())
    }

    /// Remove the leaf directory. Safe to call more than once; only the
    /// first call acts. Failures are logged, never surfaced.
    pub fn cleanup(&self) {
        if self.removed.swap(true, Ordering::SeqCst) {
            return;
        }

        let path = self.leaf_dir();
        match fs::remove_dir(&path) {
            Ok(()) => tracing::debug!(path = %path.display(), "removed cgroup"),
            Err(err) => tracing::error!(path = %path.display(), %err, "failed to remove cgroup"),
        }
    }

    /// A cgroup with member processes cannot also enable controllers for its
    /// children, so enablement happens one level up from the leaf.
    fn enable_subtree_controllers(&self) -> io::Result<()> {
        self.write_control(&self.parent_file("cgroup.subtree_control"), SUBTREE_CONTROLLERS)
    }

    fn apply_io_limit(&self, bps: i32) -> Result<()> {
        let table = fs::read_to_string("/proc/partitions").map_err(Error::CgroupSetup)?;
        let io_max = self.leaf_file("io.max");

        for device in whole_disks(&table) {
            let value = format!("{}:{} rbps={} wbps={}", device.major, device.minor, bps, bps);
            if let Err(err) = self.write_control(&io_max, &value) {
                tracing::warn!(device = %device.name, %value, %err, "skipping io limit for device");
            }
        }

        Ok(())
    }

    fn write_control(&self, path: &Path, value: &str) -> io::Result<()> {
        // cgroupfs control files always exist; no create
        let mut file = OpenOptions::new().write(true).open(path)?;
        tracing::debug!(path = %path.display(), value, "writing cgroup control");
        file.write_all(value.as_bytes())
    }

    fn parent_file(&self, name: &str) -> PathBuf {
        self.root.join(&self.worker).join(name)
    }

    fn leaf_dir(&self) -> PathBuf {
        self.root.join(&self.worker).join(&self.job_id)
    }

    fn leaf_file(&self, name: &str) -> PathBuf {
        self.leaf_dir().join(name)
    }
}

impl Drop for CgroupController {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// A row of the kernel's partition table.
#[derive(Debug, PartialEq, Eq)]
struct BlockDevice {
    major: String,
    minor: String,
    name: String,
}

/// Parse `/proc/partitions` down to whole disks. `io.max` takes limits per
/// device, not per partition, and a whole disk is the entry with minor 0.
fn whole_disks(table: &str) -> Vec<BlockDevice> {
    table
        .lines()
        .skip(2) // header and blank line
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let major = fields.next()?.to_string();
            let minor = fields.next()?.to_string();
            let _blocks = fields.next()?;
            let name = fields.next()?.to_string();
            Some(BlockDevice { major, minor, name })
        })
        .filter(|device| device.minor == "0")
        .collect()
}

/// `cpu.max` value for a percentage of one core: the quota scales linearly
/// over a fixed one-second period.
fn cpu_max_value(percentage: i32) -> String {
    let quota = CPU_PERIOD_USEC * i64::from(percentage);
    format!("{} {}\n", quota, CPU_PERIOD_USEC)
}
