//! Small helpers shared by both daemons.

use std::path::Path;

use anyhow::{bail, format_err, Error};

/// Filesystem usage for the mount holding `path`.
#[derive(Debug, Clone, Copy)]
pub struct FsStatus {
    pub total: u64,
    pub used: u64,
    pub avail: u64,
}

/// Returns disk usage information (total, used, avail)
pub fn disk_usage(path: &Path) -> Result<FsStatus, Error> {
    let mut stat: libc::statfs64 = unsafe { std::mem::zeroed() };

    use nix::NixPath;

    let res = path.with_nix_path(|cstr| unsafe { libc::statfs64(cstr.as_ptr(), &mut stat) })?;
    nix::errno::Errno::result(res)?;

    let bsize = stat.f_bsize as u64;

    Ok(FsStatus {
        total: stat.f_blocks * bsize,
        used: (stat.f_blocks - stat.f_bfree) * bsize,
        avail: stat.f_bavail * bsize,
    })
}

/// Wall clock seconds since the epoch, truncated to the on-disk width.
pub fn epoch_now() -> u32 {
    match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
        Ok(duration) => duration.as_secs() as u32,
        Err(_) => 0,
    }
}

/// Write `data` to `path` atomically (temp file in the same directory,
/// then rename over the target).
pub fn replace_file(path: &Path, data: &[u8]) -> Result<(), Error> {
    let dir = path
        .parent()
        .ok_or_else(|| format_err!("file {:?} has no parent directory", path))?;
    let mut tmp = path.to_owned();
    tmp.set_extension("tmp");

    std::fs::create_dir_all(dir)?;
    std::fs::write(&tmp, data)
        .map_err(|err| format_err!("unable to write {:?} - {}", tmp, err))?;

    if let Err(err) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        bail!("atomic rename to {:?} failed - {}", path, err);
    }
    Ok(())
}
