use crate::error::{BtrfsError, Result};
use crate::structures::*;

use log::debug;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// One backing store of a pool. All I/O is positional; the handle is owned
/// here and never escapes the pool.
pub struct Device {
    pub path: PathBuf,
    file: File,
    pub devid: u64,
    pub dev_uuid: BtrfsUuid,
    pub total_bytes: u64,
    pub sector_size: u32,
    pub io_align: u32,
    pub writable: bool,
    /// set when the device was absent at open and reads must not touch it
    pub missing: bool,
}

impl Device {
    pub fn open(path: &Path, writable: bool) -> Result<Device> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)
            .map_err(|e| BtrfsError::IoRead {
                devid: 0,
                offset: 0,
                source: e,
            })?;
        let total_bytes = device_bytes(&file)?;
        debug!("opened {} ({} bytes)", path.display(), total_bytes);
        Ok(Device {
            path: path.to_path_buf(),
            file,
            devid: 0,
            dev_uuid: [0; BTRFS_UUID_SIZE],
            total_bytes,
            sector_size: 4096,
            io_align: 4096,
            writable,
            missing: false,
        })
    }

    pub fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        if self.missing {
            return Err(BtrfsError::IoRead {
                devid: self.devid,
                offset,
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }
        self.file
            .read_exact_at(buf, offset)
            .map_err(|e| BtrfsError::IoRead {
                devid: self.devid,
                offset,
                source: e,
            })
    }

    pub fn write_all_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        assert!(self.writable);
        self.file
            .write_all_at(buf, offset)
            .map_err(|e| BtrfsError::IoWrite {
                devid: self.devid,
                offset,
                source: e,
            })
    }

    pub fn zero_range(&self, offset: u64, len: u64) -> Result<()> {
        let zeroes = vec![0_u8; 64 * 1024];
        let mut done = 0_u64;
        while done < len {
            let n = std::cmp::min(zeroes.len() as u64, len - done);
            self.write_all_at(&zeroes[..n as usize], offset + done)?;
            done += n;
        }
        Ok(())
    }

    /// durability barrier around superblock writes
    pub fn flush(&self) -> Result<()> {
        self.file.sync_data().map_err(|e| BtrfsError::IoWrite {
            devid: self.devid,
            offset: 0,
            source: e,
        })
    }
}

/// regular files report their length, block devices need the ioctl
fn device_bytes(file: &File) -> Result<u64> {
    let md = file.metadata().map_err(|e| BtrfsError::IoRead {
        devid: 0,
        offset: 0,
        source: e,
    })?;
    if md.is_file() {
        return Ok(md.len());
    }
    let mut len64 = 0_u64;
    let len_ref = &mut len64 as *mut u64;
    let ret = unsafe { ioctls::blkgetsize64(file.as_raw_fd(), len_ref) };
    if ret != 0 {
        return Err(BtrfsError::IoRead {
            devid: 0,
            offset: 0,
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(len64)
}

/// Devices of one filesystem, keyed by devid and by device uuid. A writable
/// set may sit on top of a chain of read-only seed sets.
pub struct DeviceSet {
    pub fsid: BtrfsFsid,
    pub devid_map: HashMap<u64, Rc<Device>>,
    pub devuuid_map: HashMap<BtrfsUuid, Rc<Device>>,
    pub seed: Option<Box<DeviceSet>>,
    pub writable: bool,
}

impl DeviceSet {
    pub fn new(fsid: BtrfsFsid, writable: bool) -> DeviceSet {
        DeviceSet {
            fsid,
            devid_map: HashMap::new(),
            devuuid_map: HashMap::new(),
            seed: None,
            writable,
        }
    }

    pub fn insert(&mut self, dev: Device) -> Rc<Device> {
        let di = Rc::new(dev);
        self.devid_map.insert(di.devid, Rc::clone(&di));
        self.devuuid_map.insert(di.dev_uuid, Rc::clone(&di));
        di
    }

    /// resolves through the seed chain when the writable side lacks the devid
    pub fn get(&self, devid: u64) -> Option<&Rc<Device>> {
        if let Some(d) = self.devid_map.get(&devid) {
            return Some(d);
        }
        self.seed.as_ref().and_then(|s| s.get(devid))
    }

    /// accepted header fsids: ours plus every seed's
    pub fn fsid_allowed(&self, fsid: &BtrfsFsid) -> bool {
        if *fsid == self.fsid {
            return true;
        }
        self.seed.as_ref().map_or(false, |s| s.fsid_allowed(fsid))
    }

    pub fn num_devices(&self) -> usize {
        self.devid_map.len()
    }

    pub fn flush_all(&self) -> Result<()> {
        for dev in self.devid_map.values() {
            dev.flush()?;
        }
        Ok(())
    }
}

/// Known device sets, keyed by filesystem uuid. Passed explicitly into open
/// so tests can hold independent registries.
#[derive(Default)]
pub struct Registry {
    sets: HashMap<BtrfsFsid, Vec<PathBuf>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    pub fn record(&mut self, fsid: BtrfsFsid, path: &Path) {
        let paths = self.sets.entry(fsid).or_default();
        if !paths.iter().any(|p| p == path) {
            paths.push(path.to_path_buf());
        }
    }

    pub fn paths(&self, fsid: &BtrfsFsid) -> &[PathBuf] {
        self.sets.get(fsid).map(|v| v.as_slice()).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_device(len: usize) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dev0");
        let mut f = File::create(&path).unwrap();
        f.write_all(&vec![0_u8; len]).unwrap();
        (dir, path)
    }

    #[test]
    fn positional_io_round_trip() {
        let (_dir, path) = temp_device(1 << 20);
        let dev = Device::open(&path, true).unwrap();
        dev.write_all_at(b"hello stripe", 65536).unwrap();
        let mut buf = [0_u8; 12];
        dev.read_exact_at(&mut buf, 65536).unwrap();
        assert_eq!(&buf, b"hello stripe");
    }

    #[test]
    fn zero_range_clears() {
        let (_dir, path) = temp_device(1 << 20);
        let dev = Device::open(&path, true).unwrap();
        dev.write_all_at(&[0xFF; 8192], 4096).unwrap();
        dev.zero_range(4096, 8192).unwrap();
        let mut buf = [0_u8; 8192];
        dev.read_exact_at(&mut buf, 4096).unwrap();
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn read_past_end_is_io_error() {
        let (_dir, path) = temp_device(4096);
        let dev = Device::open(&path, false).unwrap();
        let mut buf = [0_u8; 64];
        assert!(matches!(
            dev.read_exact_at(&mut buf, 8192),
            Err(BtrfsError::IoRead { .. })
        ));
    }
}
