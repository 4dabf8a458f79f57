//! Process inspection via the proc filesystem
//!
//! Reads process metadata from `/proc` (or `/host/proc` when the agent runs
//! as a DaemonSet with hostPID) and maps processes back to container IDs
//! through their cgroup membership.

mod elf;
mod locator;

pub use elf::ElfAnalyzer;
pub use locator::PidLocator;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;
use tracing::debug;

/// Snapshot of a live process taken from `/proc/<pid>`.
///
/// Fields other than `cmdline` degrade to empty when the corresponding proc
/// file is unreadable; the snapshot is invalid if the process exits between
/// acquisition and use, which callers must tolerate.
#[derive(Debug, Clone, Default)]
pub struct ProcessContext {
    pub pid: i32,
    pub ppid: i32,
    pub executable: String,
    pub cmdline: String,
    pub environ: HashMap<String, String>,
    pub cgroup_path: String,
    pub container_id: String,
}

impl ProcessContext {
    /// Basename of the resolved executable path, empty if unknown.
    pub fn exe_basename(&self) -> &str {
        self.executable.rsplit('/').next().unwrap_or("")
    }

    /// True if the executable basename or the lowered cmdline matches any of
    /// the given names.
    pub fn matches_process_name(&self, names: &[&str]) -> bool {
        let exe = self.exe_basename().to_lowercase();
        let cmdline = self.cmdline.to_lowercase();
        names
            .iter()
            .any(|name| exe == name.to_lowercase() || cmdline.contains(&name.to_lowercase()))
    }
}

/// Case-insensitive check for any of the given needles inside a maps file.
pub fn maps_contains(maps: &str, needles: &[&str]) -> bool {
    let lower = maps.to_lowercase();
    needles.iter().any(|n| lower.contains(&n.to_lowercase()))
}

/// Reader over a configurable proc root.
#[derive(Debug, Clone)]
pub struct ProcReader {
    root: PathBuf,
}

impl ProcReader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Pick `/host/proc` when the node's proc is mounted in (hostPID
    /// DaemonSet mode), otherwise plain `/proc`.
    pub fn discover() -> Self {
        if Path::new("/host/proc").is_dir() {
            tracing::info!(proc_root = "/host/proc", "Using host proc for process inspection");
            Self::new("/host/proc")
        } else {
            tracing::info!(proc_root = "/proc", "Using local proc for process inspection");
            Self::new("/proc")
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// All PIDs currently visible under the proc root.
    pub async fn enumerate_pids(&self) -> Result<Vec<i32>> {
        let mut entries = fs::read_dir(&self.root)
            .await
            .with_context(|| format!("failed to read proc dir {}", self.root.display()))?;

        let mut pids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Ok(pid) = entry.file_name().to_string_lossy().parse::<i32>() {
                pids.push(pid);
            }
        }
        Ok(pids)
    }

    /// Build a [`ProcessContext`] for a PID. Only an unreadable `cmdline`
    /// fails the call; every other read degrades its field to empty.
    pub async fn context(&self, pid: i32) -> Result<ProcessContext> {
        let proc_path = self.root.join(pid.to_string());

        let executable = fs::read_link(proc_path.join("exe"))
            .await
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();

        let cmdline_bytes = fs::read(proc_path.join("cmdline"))
            .await
            .with_context(|| format!("failed to read cmdline for pid {pid}"))?;
        let cmdline = String::from_utf8_lossy(&cmdline_bytes)
            .replace('\0', " ")
            .trim_end()
            .to_string();

        let mut environ = HashMap::new();
        if let Ok(env_bytes) = fs::read(proc_path.join("environ")).await {
            for pair in String::from_utf8_lossy(&env_bytes).split('\0') {
                if let Some((key, value)) = pair.split_once('=') {
                    environ.insert(key.to_string(), value.to_string());
                }
            }
        }

        let mut ppid = 0;
        if let Ok(status) = fs::read_to_string(proc_path.join("status")).await {
            for line in status.lines() {
                if let Some(rest) = line.strip_prefix("PPid:") {
                    ppid = rest.trim().parse().unwrap_or(0);
                    break;
                }
            }
        }

        let cgroup_path = fs::read_to_string(proc_path.join("cgroup"))
            .await
            .unwrap_or_default();
        let container_id = extract_container_id(&cgroup_path).unwrap_or_default();

        Ok(ProcessContext {
            pid,
            ppid,
            executable,
            cmdline,
            environ,
            cgroup_path,
            container_id,
        })
    }

    /// Full text of `/proc/<pid>/maps`.
    pub async fn read_maps(&self, pid: i32) -> Result<String> {
        fs::read_to_string(self.root.join(pid.to_string()).join("maps"))
            .await
            .with_context(|| format!("failed to read maps for pid {pid}"))
    }

    /// Raw text of `/proc/<pid>/cgroup`, empty if unreadable.
    pub async fn read_cgroup(&self, pid: i32) -> String {
        let path = self.root.join(pid.to_string()).join("cgroup");
        match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) => {
                debug!(pid, error = %e, "cgroup file unreadable, process may have exited");
                String::new()
            }
        }
    }
}

/// Extract the 12-character short container ID from `/proc/<pid>/cgroup`
/// text. Recognizes the docker, containerd and CRI-O runtime prefixes.
pub fn extract_container_id(cgroup_text: &str) -> Option<String> {
    const RUNTIME_PREFIXES: [&str; 3] = ["docker-", "cri-containerd-", "crio-"];

    for line in cgroup_text.lines() {
        let line = line.trim();
        for prefix in RUNTIME_PREFIXES {
            if let Some(idx) = line.find(prefix) {
                let id = &line[idx + prefix.len()..];
                let id = id.strip_suffix(".scope").unwrap_or(id);
                if id.len() >= 12 && id[..12].bytes().all(|b| b.is_ascii_hexdigit()) {
                    return Some(id[..12].to_string());
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn write_proc_entry(
        root: &Path,
        pid: i32,
        exe_target: Option<&str>,
        cmdline: &[u8],
        environ: &[u8],
        cgroup: &str,
    ) {
        let dir = root.join(pid.to_string());
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("cmdline"), cmdline).unwrap();
        std::fs::write(dir.join("environ"), environ).unwrap();
        std::fs::write(dir.join("status"), format!("Name:\tx\nPPid:\t{}\n", pid - 1)).unwrap();
        std::fs::write(dir.join("cgroup"), cgroup).unwrap();
        if let Some(target) = exe_target {
            let bin = root.join(target.trim_start_matches('/'));
            std::fs::create_dir_all(bin.parent().unwrap()).unwrap();
            std::fs::write(&bin, b"#!").unwrap();
            symlink(&bin, dir.join("exe")).unwrap();
        }
    }

    #[tokio::test]
    async fn enumerate_skips_non_numeric_entries() {
        let tmp = TempDir::new().unwrap();
        write_proc_entry(tmp.path(), 42, None, b"sleep\0100\0", b"", "0::/init.scope\n");
        std::fs::create_dir(tmp.path().join("sys")).unwrap();
        std::fs::write(tmp.path().join("uptime"), "1 1").unwrap();

        let reader = ProcReader::new(tmp.path());
        let pids = reader.enumerate_pids().await.unwrap();
        assert_eq!(pids, vec![42]);
    }

    #[tokio::test]
    async fn context_flattens_cmdline_and_splits_environ() {
        let tmp = TempDir::new().unwrap();
        write_proc_entry(
            tmp.path(),
            100,
            Some("usr/bin/python3"),
            b"python3\0manage.py\0runserver\0",
            b"PYTHON_VERSION=3.11.5\0HOME=/root\0BROKEN\0",
            "0::/kubepods.slice/docker-0123456789abcdef.scope\n",
        );

        let reader = ProcReader::new(tmp.path());
        let ctx = reader.context(100).await.unwrap();

        assert_eq!(ctx.cmdline, "python3 manage.py runserver");
        assert_eq!(ctx.environ.get("PYTHON_VERSION").unwrap(), "3.11.5");
        assert!(!ctx.environ.contains_key("BROKEN"));
        assert_eq!(ctx.ppid, 99);
        assert_eq!(ctx.exe_basename(), "python3");
        assert_eq!(ctx.container_id, "0123456789ab");
    }

    #[tokio::test]
    async fn context_survives_missing_exe_symlink() {
        let tmp = TempDir::new().unwrap();
        write_proc_entry(tmp.path(), 7, None, b"java\0-jar\0app.jar\0", b"", "");

        let reader = ProcReader::new(tmp.path());
        let ctx = reader.context(7).await.unwrap();
        assert!(ctx.executable.is_empty());
        assert_eq!(ctx.cmdline, "java -jar app.jar");
    }

    #[tokio::test]
    async fn context_fails_without_cmdline() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("13")).unwrap();

        let reader = ProcReader::new(tmp.path());
        assert!(reader.context(13).await.is_err());
    }

    #[test]
    fn container_id_extraction_covers_runtimes() {
        let full = "a1b2c3d4e5f60718293a4b5c6d7e8f90a1b2c3d4e5f60718293a4b5c6d7e8f90";
        let cases = [
            format!("12:pids:/kubepods.slice/kubepods-burstable-podx.slice/docker-{full}.scope"),
            format!("0::/kubepods.slice/kubepods-pody.slice/cri-containerd-{full}.scope"),
            format!("0::/system.slice/crio-{full}.scope"),
        ];
        for case in &cases {
            assert_eq!(
                extract_container_id(case).as_deref(),
                Some(&full[..12]),
                "failed for {case}"
            );
        }
    }

    #[test]
    fn container_id_extraction_rejects_noise() {
        assert_eq!(extract_container_id("0::/init.scope"), None);
        assert_eq!(extract_container_id("0::/docker-tooshort.scope"), None);
        assert_eq!(extract_container_id(""), None);
    }

    #[test]
    fn maps_matching_is_case_insensitive() {
        let maps = "7f00-7f01 r-xp /usr/lib/jvm/LibJVM.so\n";
        assert!(maps_contains(maps, &["libjvm.so"]));
        assert!(!maps_contains(maps, &["libcoreclr.so"]));
    }
}
