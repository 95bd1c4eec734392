//! Crash-safe on-disk tracking of live containers, plus the PID-identity
//! check that tells a live original process apart from a recycled PID.
//!
//! Grounded on `status.c` (`libcrun_write_container_status`,
//! `libcrun_read_container_status`, `libcrun_is_container_running`,
//! `libcrun_container_delete_status`, the `exec.fifo` trio). The cgroup
//! resource applier in [`crate::v1`]/[`crate::v2`] and this module are
//! siblings: both translate a declarative runtime concept into filesystem
//! state, but this one owns `<root>/<id>/status` instead of `/sys/fs/cgroup`.

use std::ffi::OsStr;
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::dir::Dir;
use nix::fcntl::{openat, OFlag};
use nix::mount::{umount2, MntFlags};
use nix::sys::signal::kill;
use nix::sys::stat::Mode;
use nix::unistd::{mkfifo, unlink, unlinkat, Pid, UnlinkatFlags};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const STATUS_FILE_NAME: &str = "status";
const EXEC_FIFO_NAME: &str = "exec.fifo";
const FALLBACK_RUN_ROOT: &str = "/run/crun";

/// A container's persisted status document (§3 `ContainerStatus`).
///
/// Field names on the wire are hyphenated (`process-start-time`,
/// `cgroup-path`, `systemd-cgroup`) except `external_descriptors`, which
/// keeps its original underscore spelling — both are an external contract
/// with whatever wrote/reads these files, not a Rust naming choice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub pid: i32,
    #[serde(rename = "process-start-time", default)]
    pub process_start_time: u64,
    #[serde(rename = "cgroup-path")]
    pub cgroup_path: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub intelrdt: Option<String>,
    pub rootfs: String,
    #[serde(rename = "systemd-cgroup", default)]
    pub systemd_cgroup: bool,
    pub bundle: String,
    pub created: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub detached: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub external_descriptors: Option<String>,
}

/// The pieces of `/proc/<pid>/stat` the liveness check cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PidStat {
    pub state: char,
    pub starttime: u64,
}

/// Rejects ids containing `/`; every entry point below calls this first.
fn validate_id(id: &str) -> Result<()> {
    if id.contains('/') {
        return Err(Error::ConfigInvalid(format!(
            "invalid character `/` in the ID `{id}`"
        )));
    }
    Ok(())
}

/// `$XDG_RUNTIME_DIR/crun`, else `/run/crun`, unless `root` overrides it.
/// Created with mode 0700 if missing.
fn run_directory(root: Option<&Path>) -> Result<PathBuf> {
    let root = match root {
        Some(root) => root.to_path_buf(),
        None => match std::env::var("XDG_RUNTIME_DIR") {
            Ok(dir) if !dir.is_empty() => PathBuf::from(dir).join("crun"),
            _ => PathBuf::from(FALLBACK_RUN_ROOT),
        },
    };

    ensure_directory(&root, 0o700)?;
    Ok(root)
}

fn ensure_directory(path: &Path, mode: u32) -> Result<()> {
    match fs::create_dir_all(path) {
        Ok(()) => {}
        Err(err) => return Err(Error::IOError(err)),
    }
    let mut perms = fs::metadata(path)?.permissions();
    std::os::unix::fs::PermissionsExt::set_mode(&mut perms, mode);
    fs::set_permissions(path, perms)?;
    Ok(())
}

/// `<root>/<id>`.
pub fn state_directory(root: Option<&Path>, id: &str) -> Result<PathBuf> {
    validate_id(id)?;
    Ok(run_directory(root)?.join(id))
}

/// `<root>/<id>/status`.
fn status_file_path(root: Option<&Path>, id: &str) -> Result<PathBuf> {
    Ok(state_directory(root, id)?.join(STATUS_FILE_NAME))
}

/// Creates `<root>/<id>` with mode 0700, failing if it already exists
/// (mirrors `libcrun_status_check_directories`: existence means the
/// container id is already taken).
pub fn create_state_directory(root: Option<&Path>, id: &str) -> Result<()> {
    let dir = state_directory(root, id)?;
    if dir.exists() {
        return Err(Error::ConfigInvalid(format!(
            "container `{id}` already exists"
        )));
    }
    fs::create_dir(&dir)?;
    let mut perms = fs::metadata(&dir)?.permissions();
    std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o700);
    fs::set_permissions(&dir, perms)?;
    Ok(())
}

/// Reads `/proc/<pid>/stat`, tolerating a process that has already exited.
///
/// Grounded on `read_pid_stat` in `status.c`: a missing `/proc/<pid>` is not
/// an error (the zeroed stat signals "gone"), but a malformed file once
/// opened is. The command field is parenthesized and may itself contain
/// spaces or parens, so we seek to the **last** `)` before tokenizing the
/// rest, exactly as the original does.
fn read_pid_stat(pid: i32) -> Result<PidStat> {
    let path = format!("/proc/{pid}/stat");
    let contents = match fs::read_to_string(&path) {
        Ok(c) => c,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(PidStat {
                state: 'X',
                starttime: 0,
            });
        }
        Err(err) => return Err(Error::IOError(err)),
    };

    let after_cmd = match contents.rfind(')') {
        Some(idx) => contents[idx + 1..].trim_start(),
        None => {
            return Err(Error::ParseError(format!(
                "could not read process state from `{path}`"
            )))
        }
    };

    let mut fields = after_cmd.split_whitespace();
    let state = fields
        .next()
        .and_then(|s| s.chars().next())
        .ok_or_else(|| Error::ParseError(format!("could not read process state from `{path}`")))?;

    // `state` is field 3, starttime is field 22: 19 more whitespace-separated
    // fields after state before reaching it.
    let starttime_field = fields.nth(18).ok_or_else(|| {
        Error::ParseError(format!("could not read process start time from `{path}`"))
    })?;
    let starttime = starttime_field
        .parse::<u64>()
        .map_err(|e| Error::ParseError(format!("parse process start time from `{path}`: {e}")))?;

    Ok(PidStat { state, starttime })
}

/// Encodes `status` as pretty JSON and writes it via write-temp-then-rename,
/// so a reader never observes a partial file. `process_start_time` is
/// (re)captured here, at write time, because that is the only time a
/// write-time/read-time race can't reuse a stale PID.
pub fn write_status(root: Option<&Path>, id: &str, status: &mut ContainerStatus) -> Result<()> {
    validate_id(id)?;
    let file = status_file_path(root, id)?;

    let stat = read_pid_stat(status.pid)?;
    status.process_start_time = stat.starttime;

    let body = serde_json::to_vec_pretty(status)
        .map_err(|e| Error::ParseError(format!("cannot encode status: {e}")))?;
    if std::str::from_utf8(&body).is_err() {
        return Err(Error::ParseError(
            "status document is not valid UTF-8".to_string(),
        ));
    }

    let tmp = file.with_extension("tmp");
    {
        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o700)
            .open(&tmp)?;
        f.write_all(&body)?;
        f.flush()?;
    }
    fs::rename(&tmp, &file)?;

    Ok(())
}

/// Reads and parses a container's status document.
///
/// Required fields (`pid`, `cgroup-path`, `rootfs`, `bundle`, `created`) are
/// checked by hand rather than via `#[serde(...)]` alone, so a missing one
/// produces the exact "`<field>` missing in `<file>`" message the original
/// emits instead of a generic deserialization error.
pub fn read_status(root: Option<&Path>, id: &str) -> Result<ContainerStatus> {
    validate_id(id)?;
    let file = status_file_path(root, id)?;

    let contents = match fs::read_to_string(&file) {
        Ok(c) => c,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            let dir = state_directory(root, id)?;
            if !dir.exists() {
                return Err(Error::NotFound(format!("container `{id}` does not exist")));
            }
            return Err(Error::IOError(err));
        }
        Err(err) => return Err(Error::IOError(err)),
    };

    let value: serde_json::Value = serde_json::from_str(&contents)
        .map_err(|e| Error::ParseError(format!("cannot parse status file: `{file:?}`: {e}")))?;

    let required_str = |key: &str| -> Result<String> {
        value
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| Error::ParseError(format!("`{key}` missing in `{file:?}`")))
    };
    let optional_str = |key: &str| -> Option<String> {
        value.get(key).and_then(|v| v.as_str()).map(str::to_string)
    };

    let pid = value
        .get("pid")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| Error::ParseError(format!("`pid` missing in `{file:?}`")))? as i32;
    // Missing for backwards compatibility with records predating this field.
    let process_start_time = value.get("process-start-time").and_then(|v| v.as_u64()).unwrap_or(0);
    let cgroup_path = required_str("cgroup-path")?;
    let rootfs = required_str("rootfs")?;
    let bundle = required_str("bundle")?;
    let created = required_str("created")?;
    let systemd_cgroup = value
        .get("systemd-cgroup")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let detached = value
        .get("detached")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    Ok(ContainerStatus {
        pid,
        process_start_time,
        cgroup_path,
        scope: optional_str("scope"),
        intelrdt: optional_str("intelrdt"),
        rootfs,
        systemd_cgroup,
        bundle,
        created,
        owner: optional_str("owner"),
        detached,
        external_descriptors: optional_str("external_descriptors"),
    })
}

/// Lists container ids with a status file under `root`. Entries whose name
/// begins with `.`, or whose directory has no `status` file (a half-created
/// or already-deleted container), are skipped.
pub fn list_containers(root: Option<&Path>) -> Result<Vec<String>> {
    let root = run_directory(root)?;
    let mut out = Vec::new();

    for entry in fs::read_dir(&root)? {
        let entry = entry?;
        let name = entry.file_name();
        if name.as_bytes().starts_with(b".") {
            continue;
        }
        if entry.path().join(STATUS_FILE_NAME).exists() {
            if let Some(name) = name.to_str() {
                out.push(name.to_string());
            }
        }
    }

    Ok(out)
}

/// Recursively removes `<root>/<id>`, tolerating `EBUSY` from lingering
/// bind-mounts left behind inside the state directory (e.g. an idmapped
/// mount namespace artifact) by detaching them and retrying.
///
/// Grounded on `libcrun_container_delete_status` / `rmdirfd` in `status.c`:
/// try a plain `unlinkat`, then `AT_REMOVEDIR`; on `EBUSY` resolve the entry
/// via `/proc/self/fd/<fd>` and `umount2(..., MNT_DETACH)` before retrying;
/// on `ENOTEMPTY` recurse into the entry first.
pub fn delete_status(root: Option<&Path>, id: &str) -> Result<()> {
    validate_id(id)?;
    let run_dir = run_directory(root)?;
    let dir_path = run_dir.join(id);

    let run_fd = open_dir_path_only(&run_dir)?;
    let dfd = openat(
        run_fd.as_raw_fd(),
        id,
        OFlag::O_DIRECTORY | OFlag::O_RDONLY | OFlag::O_CLOEXEC,
        Mode::empty(),
    )
    .map_err(|e| nix_to_io_error(e, &dir_path))?;

    remove_dir_contents(dfd, &dir_path)?;

    unlinkat(
        Some(run_fd.as_raw_fd()),
        OsStr::new(id),
        UnlinkatFlags::RemoveDir,
    )
    .map_err(|e| nix_to_io_error(e, &dir_path))?;

    Ok(())
}

fn open_dir_path_only(path: &Path) -> Result<OwnedFd> {
    let raw = nix::fcntl::open(path, OFlag::O_DIRECTORY | OFlag::O_PATH | OFlag::O_CLOEXEC, Mode::empty())
        .map_err(|e| nix_to_io_error(e, path))?;
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

/// Removes the contents of the directory referenced by `dfd`, taking
/// ownership of it (closing it on every return path).
fn remove_dir_contents(dfd: RawFd, display_path: &Path) -> Result<()> {
    let dir = Dir::from_fd(dfd).map_err(|e| nix_to_io_error(e, display_path))?;

    for entry in dir {
        let entry = entry.map_err(|e| nix_to_io_error(e, display_path))?;
        let name = entry.file_name();
        let name_bytes = name.to_bytes();
        if name_bytes == b"." || name_bytes == b".." {
            continue;
        }
        let name_os = OsStr::from_bytes(name_bytes);

        // Best-effort as a regular file first; the final AT_REMOVEDIR below
        // will fail loudly if this leaves something behind.
        if unlinkat(Some(dfd), name_os, UnlinkatFlags::NoRemoveDir).is_ok() {
            continue;
        }

        retry_remove_entry(dfd, name_os, display_path)?;
    }

    Ok(())
}

fn retry_remove_entry(parent_fd: RawFd, name: &OsStr, display_path: &Path) -> Result<()> {
    match unlinkat(Some(parent_fd), name, UnlinkatFlags::RemoveDir) {
        Ok(()) => Ok(()),
        Err(nix::Error::EBUSY) => {
            let tfd = openat(
                parent_fd,
                name,
                OFlag::O_PATH | OFlag::O_CLOEXEC | OFlag::O_NOFOLLOW,
                Mode::empty(),
            );
            if let Ok(tfd) = tfd {
                let proc_path = format!("/proc/self/fd/{tfd}");
                let detached = umount2(proc_path.as_str(), MntFlags::MNT_DETACH).is_ok();
                let _ = nix::unistd::close(tfd);
                if detached {
                    return retry_remove_entry(parent_fd, name, display_path);
                }
            }
            Err(Error::IOError(std::io::Error::from_raw_os_error(
                nix::Error::EBUSY as i32,
            )))
        }
        Err(nix::Error::ENOTEMPTY) => {
            let cfd = openat(
                parent_fd,
                name,
                OFlag::O_DIRECTORY | OFlag::O_RDONLY | OFlag::O_CLOEXEC,
                Mode::empty(),
            )
            .map_err(|e| nix_to_io_error(e, display_path))?;
            remove_dir_contents(cfd, display_path)?;
            unlinkat(Some(parent_fd), name, UnlinkatFlags::RemoveDir)
                .map_err(|e| nix_to_io_error(e, display_path))
        }
        Err(e) => Err(nix_to_io_error(e, display_path)),
    }
}

fn nix_to_io_error(err: nix::Error, path: &Path) -> Error {
    Error::IOError(std::io::Error::new(
        std::io::Error::from(err).kind(),
        format!("{path:?}: {err}"),
    ))
}

/// `kill(pid, 0)` plus, if delivered, a start-time/state identity check.
/// Grounded on `libcrun_is_container_running` + `libcrun_check_pid_valid`.
/// A mismatched start-time or a zombie/dead process is "stopped", not an
/// error — see `Error::IdentityMismatch`'s doc comment for why this kind
/// still exists even though nothing here raises it.
pub fn is_running(status: &ContainerStatus) -> Result<bool> {
    match kill(Pid::from_raw(status.pid), None) {
        Ok(()) => check_pid_valid(status),
        Err(nix::Error::ESRCH) => Ok(false),
        Err(e) => Err(nix_to_io_error(e, Path::new(&format!("pid {}", status.pid)))),
    }
}

fn check_pid_valid(status: &ContainerStatus) -> Result<bool> {
    // For backwards compatibility: records with no recorded start-time can't
    // be checked and are trusted.
    if status.process_start_time == 0 {
        return Ok(true);
    }

    let stat = read_pid_stat(status.pid)?;
    if stat.starttime == 0 && stat.state == 'X' {
        // process exited between the `kill` and this read.
        return Ok(false);
    }

    Ok(stat.starttime == status.process_start_time && stat.state != 'Z' && stat.state != 'X')
}

/// Creates `<state_dir>/exec.fifo` and returns the nonblocking read end.
pub fn create_exec_fifo(root: Option<&Path>, id: &str) -> Result<OwnedFd> {
    let path = state_directory(root, id)?.join(EXEC_FIFO_NAME);

    mkfifo(&path, Mode::from_bits_truncate(0o600)).map_err(|e| nix_to_io_error(e, &path))?;

    let fd = nix::fcntl::open(&path, OFlag::O_NONBLOCK | OFlag::O_CLOEXEC, Mode::empty())
        .map_err(|e| nix_to_io_error(e, &path))?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Opens the write end of `exec.fifo`, unlinks the node, and writes a single
/// zero byte to unblock whoever is holding the read end open.
pub fn write_exec_fifo(root: Option<&Path>, id: &str) -> Result<()> {
    let path = state_directory(root, id)?.join(EXEC_FIFO_NAME);

    let fd = nix::fcntl::open(&path, OFlag::O_WRONLY | OFlag::O_CLOEXEC, Mode::empty())
        .map_err(|e| nix_to_io_error(e, &path))?;
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    unlink(&path).map_err(|e| nix_to_io_error(e, &path))?;

    nix::unistd::write(&fd, &[0u8]).map_err(|e| nix_to_io_error(e, &path))?;

    Ok(())
}

/// Whether `exec.fifo` still exists as a directory entry. A reader that
/// consumed the single byte and exited leaves the fifo unlinked, so absence
/// signals "already read".
pub fn has_read_exec_fifo(root: Option<&Path>, id: &str) -> Result<bool> {
    let path = state_directory(root, id)?.join(EXEC_FIFO_NAME);
    Ok(!path.exists())
}
