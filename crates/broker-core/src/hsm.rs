//! HSM per-file metadata (spec §6.5): a fixed-layout record stored as a
//! single reserved extended attribute, read/written with the `xattr` crate
//! (already a teacher dependency in `wormholefs`).

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{BrokerError, Result};

/// The reserved xattr name holding the record.
pub const XATTR_NAME: &str = "user.broker.hsm";

const RECORD_LEN: usize = 1 + 4 * 12 + 12 + 4 + 8 + 8;

/// §6.5 `state` enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HsmState {
    Unmanaged = 0,
    Offline = 1,
    Unmodified = 2,
    Modified = 3,
}

impl HsmState {
    fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => Self::Unmanaged,
            1 => Self::Offline,
            2 => Self::Unmodified,
            3 => Self::Modified,
            other => return Err(BrokerError::BadInput(format!("invalid hsm state {other}"))),
        })
    }
}

/// A POSIX `(sec, nsec)` timeval pair, zero meaning "never set".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timeval {
    pub sec: u64,
    pub nsec: u32,
}

impl Timeval {
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    pub fn from_system_time(t: SystemTime) -> Self {
        let d = t.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
        Timeval {
            sec: d.as_secs(),
            nsec: d.subsec_nanos(),
        }
    }

    fn write_to(self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.sec.to_le_bytes());
        buf.extend_from_slice(&self.nsec.to_le_bytes());
    }

    fn read_from(buf: &[u8], off: &mut usize) -> Self {
        let sec = u64::from_le_bytes(buf[*off..*off + 8].try_into().unwrap());
        *off += 8;
        let nsec = u32::from_le_bytes(buf[*off..*off + 4].try_into().unwrap());
        *off += 4;
        Timeval { sec, nsec }
    }
}

/// §6.5's fixed-layout record in full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HsmRecord {
    pub state: HsmState,
    pub staged_tv: Timeval,
    pub modified_tv: Timeval,
    pub archived_tv: Timeval,
    pub released_tv: Timeval,
    pub ctime: Timeval,
    pub offline_nlink: u32,
    pub offline_size: u64,
    pub offline_bytes: u64,
}

impl Default for HsmRecord {
    /// A file with no xattr is treated as `UNMANAGED` with a zeroed record
    /// (§6.5).
    fn default() -> Self {
        HsmRecord {
            state: HsmState::Unmanaged,
            staged_tv: Timeval::default(),
            modified_tv: Timeval::default(),
            archived_tv: Timeval::default(),
            released_tv: Timeval::default(),
            ctime: Timeval::default(),
            offline_nlink: 0,
            offline_size: 0,
            offline_bytes: 0,
        }
    }
}

impl HsmRecord {
    fn encode(&self) -> [u8; RECORD_LEN] {
        let mut buf = Vec::with_capacity(RECORD_LEN);
        buf.push(self.state as u8);
        self.staged_tv.write_to(&mut buf);
        self.modified_tv.write_to(&mut buf);
        self.archived_tv.write_to(&mut buf);
        self.released_tv.write_to(&mut buf);
        self.ctime.write_to(&mut buf);
        buf.extend_from_slice(&self.offline_nlink.to_le_bytes());
        buf.extend_from_slice(&self.offline_size.to_le_bytes());
        buf.extend_from_slice(&self.offline_bytes.to_le_bytes());
        buf.try_into().expect("RECORD_LEN mismatch")
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != RECORD_LEN {
            return Err(BrokerError::BadInput(format!(
                "hsm record is {} bytes, expected {RECORD_LEN}",
                buf.len()
            )));
        }
        let state = HsmState::from_u8(buf[0])?;
        let mut off = 1;
        let staged_tv = Timeval::read_from(buf, &mut off);
        let modified_tv = Timeval::read_from(buf, &mut off);
        let archived_tv = Timeval::read_from(buf, &mut off);
        let released_tv = Timeval::read_from(buf, &mut off);
        let ctime = Timeval::read_from(buf, &mut off);
        let offline_nlink = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        let offline_size = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
        off += 8;
        let offline_bytes = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
        Ok(HsmRecord {
            state,
            staged_tv,
            modified_tv,
            archived_tv,
            released_tv,
            ctime,
            offline_nlink,
            offline_size,
            offline_bytes,
        })
    }

    /// `STAGE -> UNMODIFIED` (§6.5 transition table; the source's `#if 0`
    /// `STAGE -> ONLINE` intermediate guard is not carried — see DESIGN.md
    /// Open Question decision).
    pub fn apply_stage(&mut self) {
        self.state = HsmState::Unmodified;
        self.staged_tv = Timeval::now();
    }

    /// a tracked write: `-> MODIFIED`.
    pub fn apply_write(&mut self) {
        self.state = HsmState::Modified;
        self.modified_tv = Timeval::now();
    }

    /// `ARCHIVE -> UNMODIFIED`.
    pub fn apply_archive(&mut self) {
        self.state = HsmState::Unmodified;
        self.archived_tv = Timeval::now();
    }

    /// `RELEASE -> OFFLINE`, stashing the attributes needed to keep `stat`
    /// reporting the pre-release size (scenario 5: "`ls -l X` before stage
    /// shows size from record").
    pub fn apply_release(&mut self, nlink: u32, size: u64, bytes_on_disk: u64) {
        self.state = HsmState::Offline;
        self.released_tv = Timeval::now();
        self.offline_nlink = nlink;
        self.offline_size = size;
        self.offline_bytes = bytes_on_disk;
    }

    /// `UNMANAGE -> UNMANAGED`.
    pub fn apply_unmanage(&mut self) {
        *self = HsmRecord::default();
    }

    pub fn needs_staging(&self) -> bool {
        self.state == HsmState::Offline
    }
}

/// Reads the record for `path`, defaulting to `UNMANAGED` if the xattr is
/// absent.
pub fn read_record(path: &std::path::Path) -> Result<HsmRecord> {
    match xattr::get(path, XATTR_NAME).map_err(BrokerError::Io)? {
        Some(bytes) => HsmRecord::decode(&bytes),
        None => Ok(HsmRecord::default()),
    }
}

pub fn write_record(path: &std::path::Path, record: &HsmRecord) -> Result<()> {
    xattr::set(path, XATTR_NAME, &record.encode()).map_err(BrokerError::Io)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_record_is_unmanaged_and_zeroed() {
        let r = HsmRecord::default();
        assert_eq!(r.state, HsmState::Unmanaged);
        assert_eq!(r.offline_size, 0);
    }

    #[test]
    fn encode_decode_roundtrip() {
        let mut r = HsmRecord::default();
        r.apply_release(2, 12345, 4096);
        let encoded = r.encode();
        let decoded = HsmRecord::decode(&encoded).unwrap();
        assert_eq!(decoded, r);
    }

    #[test]
    fn stage_then_archive_transition() {
        let mut r = HsmRecord::default();
        r.apply_release(1, 100, 100);
        assert!(r.needs_staging());
        r.apply_stage();
        assert_eq!(r.state, HsmState::Unmodified);
        assert!(!r.needs_staging());
        r.apply_write();
        assert_eq!(r.state, HsmState::Modified);
        r.apply_archive();
        assert_eq!(r.state, HsmState::Unmodified);
    }

    #[test]
    fn xattr_roundtrip_on_tempfile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"hello").unwrap();
        assert_eq!(read_record(&path).unwrap(), HsmRecord::default());

        let mut r = HsmRecord::default();
        r.apply_release(1, 5, 4096);
        write_record(&path, &r).unwrap();
        assert_eq!(read_record(&path).unwrap(), r);
    }
}
