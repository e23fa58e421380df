use crate::StoreError;
use std::path::Path;

/// One `blks_*` file found on disk: its first block number (from the
/// filename) and its length in bytes.
pub(crate) struct FoundFile {
    pub fileno: u64,
    pub len: u64,
}

/// Scan `dir` for files named `blks_<16 hex digits>` and return them in
/// order of increasing first block number. Anything that is not a regular
/// file with a well-formed name is ignored.
pub(crate) fn scan(dir: &Path) -> Result<Vec<FoundFile>, StoreError> {
    let mut files = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let Some(fileno) = parse_name(name) else {
            continue;
        };
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        files.push(FoundFile {
            fileno,
            len: meta.len(),
        });
    }

    files.sort_by_key(|f| f.fileno);
    Ok(files)
}

fn parse_name(name: &str) -> Option<u64> {
    let hex = name.strip_prefix("blks_")?;
    if hex.len() != 16 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u64::from_str_radix(hex, 16).ok()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn name_parsing() {
        assert_eq!(parse_name("blks_0000000000000000"), Some(0));
        assert_eq!(parse_name("blks_00000000000000ff"), Some(255));
        assert_eq!(parse_name("blks_ffffffffffffffff"), Some(u64::MAX));
        assert_eq!(parse_name("blks_00000000000000f"), None);
        assert_eq!(parse_name("blks_00000000000000fff"), None);
        assert_eq!(parse_name("blks_00000000000000fg"), None);
        assert_eq!(parse_name("data_0000000000000000"), None);
    }

    #[test]
    fn scan_sorts_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("blks_0000000000000010"), [0u8; 4]).unwrap();
        std::fs::write(dir.path().join("blks_0000000000000000"), [0u8; 8]).unwrap();
        std::fs::write(dir.path().join("notablock"), [0u8; 1]).unwrap();
        std::fs::create_dir(dir.path().join("blks_0000000000000020")).unwrap();

        let files = scan(dir.path()).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].fileno, 0);
        assert_eq!(files[0].len, 8);
        assert_eq!(files[1].fileno, 0x10);
        assert_eq!(files[1].len, 4);
    }
}
