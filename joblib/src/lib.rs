//! Job supervision: cgroup-v2 confinement, process lifecycle, and output
//! capture with live replay.

mod spawn;

pub mod cgroup;
pub mod clock;
pub mod error;
pub mod job;
pub mod output;
pub mod registry;

pub use cgroup::{CgroupController, ResourceLimits};
pub use clock::{Clock, SystemClock};
pub use error::{Error, Result};
pub use job::{CommandSpec, Job, Observation, OutputKind, Status, StatusChange, WorkerSettings};
pub use output::{OutputReader, OutputStore};
pub use registry::JobRegistry;

#[cfg(test)]
mod joblib_tests {
    //! End-to-end tests against the real kernel interfaces. They need root
    //! and a cgroup v2 mount, so they are ignored by default:
    //! `cargo test -- --ignored` on a privileged host runs them.

    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn settings() -> WorkerSettings {
        WorkerSettings {
            // fresh parent per test so runs never collide
            worker_name: format!("joblib-test-{}", uuid::Uuid::new_v4()),
            cgroup_root: "/sys/fs/cgroup".into(),
            spool_dir: std::env::temp_dir(),
        }
    }

    fn start_job(program: &str, args: &[&str], limits: ResourceLimits) -> Result<Arc<Job>> {
        let job = Job::new(
            &settings(),
            Arc::new(SystemClock),
            limits,
            CommandSpec {
                program: program.to_string(),
                args: args.iter().map(|arg| arg.to_string()).collect(),
            },
        )?;
        job.start()?;
        Ok(job)
    }

    async fn drain(mut reader: OutputReader) -> Vec<u8> {
        let mut bytes = Vec::new();
        while let Some(chunk) = reader.next_chunk().await.expect("read chunk") {
            bytes.extend_from_slice(&chunk);
        }
        bytes
    }

    async fn wait_terminal(job: &Job) -> Status {
        loop {
            let status = job.observe().status;
            if status.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    #[ignore = "requires root and a cgroup v2 mount"]
    async fn echo_job_succeeds_and_streams_output() {
        let limits =
            ResourceLimits { memory_bytes: 64 * 1024 * 1024, cpu_percentage: 50, disk_io_bps: 0 };
        let job = start_job("echo", &["hello"], limits).expect("start echo");

        let output = drain(job.open_output(OutputKind::Stdout).expect("open output")).await;
        assert_eq!(String::from_utf8_lossy(&output), "hello\n");

        let obs = job.observe();
        assert_eq!(obs.status, Status::Succeeded);
        let statuses: Vec<_> = obs.history.iter().map(|change| change.status).collect();
        assert_eq!(statuses, vec![Status::Ready, Status::Running, Status::Succeeded]);
    }

    #[tokio::test]
    #[ignore = "requires root and a cgroup v2 mount"]
    async fn stop_kills_a_long_running_job() {
        let job =
            start_job("sleep", &["3600"], ResourceLimits::default()).expect("start sleep");

        tokio::time::sleep(Duration::from_millis(100)).await;
        job.stop().expect("stop running job");

        let output = drain(job.open_output(OutputKind::Stdout).expect("open output")).await;
        assert!(output.is_empty());
        assert_eq!(job.observe().status, Status::Stopped);

        // stop on a terminal job does not move the status back
        assert!(matches!(job.stop(), Err(Error::InvalidState(Status::Stopped))));
        assert_eq!(job.observe().status, Status::Stopped);
    }

    #[tokio::test]
    #[ignore = "requires root and a cgroup v2 mount"]
    async fn concurrent_readers_observe_identical_output() {
        let one_mib = 1024 * 1024;
        let job = start_job(
            "sh",
            &["-c", "head -c 1048576 /dev/zero"],
            ResourceLimits::default(),
        )
        .expect("start producer");

        let readers: Vec<_> = (0..3)
            .map(|_| job.open_output(OutputKind::Stdout).expect("open output"))
            .collect();
        let mut outputs = Vec::new();
        for reader in readers {
            outputs.push(tokio::spawn(drain(reader)));
        }

        let mut collected = Vec::new();
        for output in outputs {
            collected.push(output.await.expect("join reader"));
        }
        assert_eq!(collected[0].len(), one_mib);
        assert_eq!(collected[0], collected[1]);
        assert_eq!(collected[1], collected[2]);
    }

    #[tokio::test]
    #[ignore = "requires root and a cgroup v2 mount"]
    async fn late_reader_replays_finished_job() {
        let job = start_job("echo", &["all done"], ResourceLimits::default()).expect("start echo");
        assert_eq!(wait_terminal(&job).await, Status::Succeeded);

        // opened only after the job finished
        let output = drain(job.open_output(OutputKind::Stdout).expect("open output")).await;
        assert_eq!(String::from_utf8_lossy(&output), "all done\n");
    }

    #[tokio::test]
    #[ignore = "requires root and a cgroup v2 mount"]
    async fn cgroup_leaf_is_removed_after_exit() {
        let worker = settings();
        let job = Job::new(
            &worker,
            Arc::new(SystemClock),
            ResourceLimits::default(),
            CommandSpec { program: "true".to_string(), args: vec![] },
        )
        .expect("create job");
        let leaf = worker.cgroup_root.join(&worker.worker_name).join(job.id().to_string());
        assert!(leaf.is_dir());

        job.start().expect("start job");
        wait_terminal(&job).await;

        // cleanup runs right after the terminal transition
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!leaf.exists());
    }

    #[tokio::test]
    #[ignore = "requires root and a cgroup v2 mount"]
    async fn memory_limit_kills_an_over_allocating_job() {
        // sort buffers its whole input, far past the 16 MiB ceiling
        let limits = ResourceLimits {
            memory_bytes: 16 * 1024 * 1024,
            cpu_percentage: 0,
            disk_io_bps: 0,
        };
        let job = start_job(
            "sh",
            &["-c", "head -c 268435456 /dev/zero | sort > /dev/null"],
            limits,
        )
        .expect("start allocator");

        // killed by the kernel OOM reaper, not by a stop request
        assert_eq!(wait_terminal(&job).await, Status::Failed);

        // the stream still ends cleanly
        let _ = drain(job.open_output(OutputKind::Stdout).expect("open output")).await;
    }

    #[tokio::test]
    #[ignore = "requires root and a cgroup v2 mount"]
    async fn missing_binary_fails_the_job() {
        // the clone itself succeeds; exec fails inside the child, which
        // exits 127 and lands the job in Failed
        let job = start_job("this-command-does-not-exist", &[], ResourceLimits::default())
            .expect("start");
        assert_eq!(wait_terminal(&job).await, Status::Failed);
    }
}
