use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::FileExt;
use std::path::Path;

/// fsync a directory so that file creation/deletion inside it survives a
/// crash. Some filesystems require this for the entry to be durable.
pub(crate) fn sync_dir(path: &Path) -> std::io::Result<()> {
    File::open(path)?.sync_all()
}

/// Read exactly `buf.len()` bytes at `offset`. Returns `Ok(false)` if the
/// file does not exist (the caller may have lost a race against the
/// deleter); EOF within the range is an error.
pub(crate) fn read_at(path: &Path, offset: u64, buf: &mut [u8]) -> std::io::Result<bool> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    };
    file.read_exact_at(buf, offset)?;
    Ok(true)
}

/// Append `buf` to `path` and fsync. If `create` is set the file must not
/// exist yet and is created 0600. If `nosync` is set the fsync is skipped.
pub(crate) fn append(path: &Path, create: bool, buf: &[u8], nosync: bool) -> std::io::Result<()> {
    let mut opts = OpenOptions::new();
    opts.write(true).append(true);
    if create {
        opts.create_new(true);
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o600);
        }
    }
    let mut file = opts.open(path)?;
    file.write_all(buf)?;
    if !nosync {
        file.sync_all()?;
    }
    Ok(())
}
