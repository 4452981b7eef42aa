//! Mount-table introspection (§6.1 `vfs_enumerate_mounts`/
//! `vfs_unmount_by_id`), used by §4.3.3 reconciliation and C7. Hand-rolled
//! `/proc/self/mountinfo` parsing: `rsmount`-style bindings require a native
//! `libmount` found via pkg-config, too fragile to adopt without a build
//! (see DESIGN.md).

use std::{
    fs,
    io::{self, BufRead},
    path::Path,
};

use crate::error::{BrokerError, Result};

/// One line of `/proc/self/mountinfo`, the fields relevant to §6.1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// mount id, used as the "fsid" handle for unmount-by-id (§6.1).
    pub mount_id: u32,
    pub parent_id: u32,
    pub mountpoint: String,
    pub fstype: String,
    pub mounted_from: String,
    pub options: Vec<String>,
}

impl MountEntry {
    /// True if `automounted` was injected at mount time (§4.5 step 1: "mounts
    /// it knows as automounted, tagged by option injected at mount time").
    pub fn is_automounted(&self) -> bool {
        self.options.iter().any(|o| o == "automounted")
    }
}

/// Parses the `/proc/<pid>/mountinfo` format (see `proc_pid_mountinfo(5)`):
///
/// ```text
/// 36 35 98:0 /mnt1 /mnt2 rw,noatime master:1 - ext3 /dev/root rw,errors=continue
/// ```
///
/// Fields before the `-` separator are positional; `mounted_from` and
/// `fstype` come right after it.
fn parse_line(line: &str) -> Result<MountEntry> {
    let (left, right) = line
        .split_once(" - ")
        .ok_or_else(|| BrokerError::BadInput(format!("malformed mountinfo line: {line}")))?;
    let left_fields: Vec<&str> = left.split(' ').collect();
    if left_fields.len() < 6 {
        return Err(BrokerError::BadInput(format!("malformed mountinfo line: {line}")));
    }
    let mount_id = left_fields[0]
        .parse()
        .map_err(|_| BrokerError::BadInput("bad mount id".into()))?;
    let parent_id = left_fields[1]
        .parse()
        .map_err(|_| BrokerError::BadInput("bad parent id".into()))?;
    let mountpoint = unescape_octal(left_fields[4]);
    let options = left_fields[5].split(',').map(str::to_string).collect();

    let right_fields: Vec<&str> = right.split(' ').collect();
    if right_fields.len() < 3 {
        return Err(BrokerError::BadInput(format!("malformed mountinfo line: {line}")));
    }
    let fstype = right_fields[0].to_string();
    let mounted_from = unescape_octal(right_fields[1]);
    // Per-superblock options (last field): this is where a FUSE filesystem's
    // own mount-option strings (e.g. our injected `automounted` tag) show up,
    // as distinct from the generic VFS options in the left-hand side's field 6.
    let mut options = options;
    options.extend(right_fields[2].split(',').map(str::to_string));

    Ok(MountEntry {
        mount_id,
        parent_id,
        mountpoint,
        fstype,
        mounted_from,
        options,
    })
}

/// `/proc/self/mountinfo` escapes space, tab, newline, and backslash as
/// `\NNN` octal.
fn unescape_octal(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            if let Ok(code) = u8::from_str_radix(std::str::from_utf8(&bytes[i + 1..i + 4]).unwrap_or(""), 8) {
                out.push(code);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// `vfs_enumerate_mounts()` (§6.1).
pub fn enumerate_mounts() -> Result<Vec<MountEntry>> {
    enumerate_mounts_from(Path::new("/proc/self/mountinfo"))
}

fn enumerate_mounts_from(path: &Path) -> Result<Vec<MountEntry>> {
    let file = fs::File::open(path).map_err(BrokerError::Io)?;
    let reader = io::BufReader::new(file);
    let mut out = Vec::new();
    for line in reader.lines() {
        let line = line.map_err(BrokerError::Io)?;
        if line.trim().is_empty() {
            continue;
        }
        out.push(parse_line(&line)?);
    }
    Ok(out)
}

/// `vfs_unmount_by_id(fsid, flags)` (§6.1): resolves `mount_id` to its
/// current mountpoint and issues `umount2`, by path rather than by racy
/// re-derivation, since Linux has no "unmount by mount id" syscall — this is
/// the narrow race window §4.3.3 ("by fs-id, to avoid racy path matching")
/// accepts relative to matching purely on path.
pub fn unmount_by_id(mount_id: u32, flags: i32) -> Result<()> {
    let mounts = enumerate_mounts()?;
    let entry = mounts
        .into_iter()
        .find(|m| m.mount_id == mount_id)
        .ok_or(BrokerError::NotFound)?;
    let c_path = std::ffi::CString::new(entry.mountpoint.as_bytes())
        .map_err(|e| BrokerError::BadInput(e.to_string()))?;
    let ret = unsafe { libc::umount2(c_path.as_ptr(), flags) };
    if ret == -1 {
        let errno = io::Error::last_os_error();
        if errno.raw_os_error() == Some(libc::EBUSY) {
            return Err(BrokerError::Busy(entry.mountpoint));
        }
        return Err(BrokerError::Io(errno));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
36 35 98:0 /mnt1 /mnt2 rw,noatime master:1 - ext3 /dev/root rw,errors=continue
37 35 0:31 / /net rw,relatime shared:2 - autofs automounted rw,automounted
";

    #[test]
    fn parses_sample_mountinfo() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mountinfo");
        std::fs::write(&path, SAMPLE).unwrap();
        let entries = enumerate_mounts_from(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].mountpoint, "/mnt2");
        assert_eq!(entries[0].fstype, "ext3");
        assert!(!entries[0].is_automounted());
        assert_eq!(entries[1].mountpoint, "/net");
        assert!(entries[1].is_automounted());
    }

    #[test]
    fn unescapes_octal_spaces() {
        assert_eq!(unescape_octal(r"/mnt\040with\040space"), "/mnt with space");
    }
}
