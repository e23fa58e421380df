use crate::{disk, findfiles, StoreError};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
struct Segment {
    /// First block number in the file.
    start: u64,
    /// Length of the file in blocks.
    len: u64,
}

struct State {
    files: VecDeque<Segment>,
    minblk: u64,
    nextblk: u64,
}

/// Storage state for fixed-size blocks in a directory of segment files.
///
/// Any number of threads may call `read` and `next_block` concurrently;
/// at most one thread may be in `append` and at most one in `delete` at
/// any given time. All synchronization is the state rwlock, which is
/// dropped around file I/O.
pub struct Store {
    dir: PathBuf,
    block_len: usize,
    latency: Option<Duration>,
    nosync: bool,
    max_file_blocks: u64,
    state: RwLock<State>,
}

impl Store {
    /// Scan `dir` and build the storage state for `block_len`-byte
    /// blocks. Consecutive files must cover a contiguous block range; a
    /// partial trailing block in the most recent file is truncated away
    /// (the crash-recovery model), anywhere else it is an error.
    pub fn open(
        dir: impl Into<PathBuf>,
        block_len: usize,
        latency_ns: u64,
        nosync: bool,
    ) -> Result<Self, StoreError> {
        let dir = dir.into();
        assert!(block_len > 0);

        // Largest number of blocks one file can hold without its byte
        // length overflowing a file offset.
        let max_file_blocks = i64::MAX as u64 / block_len as u64;

        let found = findfiles::scan(&dir)?;

        let minblk = found.first().map(|f| f.fileno).unwrap_or(0);
        let mut files = VecDeque::with_capacity(found.len());
        let mut nextblk = minblk;

        for (i, f) in found.iter().enumerate() {
            if f.fileno != nextblk {
                return Err(StoreError::Discontiguous(segment_name(f.fileno)));
            }

            let mut len = f.len;
            if len % block_len as u64 != 0 {
                if i + 1 != found.len() {
                    return Err(StoreError::PartialBlock(segment_name(f.fileno)));
                }
                // Interrupted append; drop the partial block.
                len -= len % block_len as u64;
                let file = std::fs::OpenOptions::new()
                    .write(true)
                    .open(segment_path(&dir, f.fileno))?;
                file.set_len(len)?;
            }

            let seg = Segment {
                start: f.fileno,
                len: len / block_len as u64,
            };
            files.push_back(seg);
            nextblk = seg.start + seg.len;
        }

        Ok(Self {
            dir,
            block_len,
            latency: (latency_ns > 0).then(|| Duration::from_nanos(latency_ns)),
            nosync,
            max_file_blocks,
            state: RwLock::new(State {
                files,
                minblk,
                nextblk,
            }),
        })
    }

    pub fn block_len(&self) -> usize {
        self.block_len
    }

    /// The next block number that `append` will assign.
    pub fn next_block(&self) -> u64 {
        self.state.read().nextblk
    }

    /// Read block `blkno` into `buf`. Returns `Ok(false)` if the block is
    /// not present, including when the read races with the deleter and
    /// the segment file has already been unlinked.
    pub fn read(&self, blkno: u64, buf: &mut [u8]) -> Result<bool, StoreError> {
        assert_eq!(buf.len(), self.block_len);

        let seg = {
            let state = self.state.read();
            if blkno < state.minblk || blkno >= state.nextblk {
                return Ok(false);
            }
            let i = state.files.partition_point(|s| s.start + s.len <= blkno);
            state.files[i]
        };

        let offset = (blkno - seg.start) * self.block_len as u64;
        if !disk::read_at(&segment_path(&self.dir, seg.start), offset, buf)? {
            // Lost a race against the deleter; the block no longer exists.
            return Ok(false);
        }

        if let Some(latency) = self.latency {
            std::thread::sleep(latency);
        }

        Ok(true)
    }

    /// Append `nblks` blocks from `buf` at block number `blkno`, which
    /// must equal `next_block()`. There must never be more than one
    /// thread calling this at a time.
    pub fn append(&self, blkno: u64, nblks: u64, buf: &[u8]) -> Result<(), StoreError> {
        assert!(nblks > 0);
        assert_eq!(buf.len() as u64, nblks * self.block_len as u64);

        let (fnum, newfile) = {
            let mut state = self.state.write();
            if blkno != state.nextblk {
                return Err(StoreError::WrongAppendPosition {
                    got: blkno,
                    want: state.nextblk,
                });
            }

            // Start a new file if there are no files yet, if the last
            // file holds more than 1/16 of the stored blocks (bounding
            // how much a single FREE can strand), or if appending would
            // make the file too long.
            let newfile = match state.files.back() {
                None => true,
                Some(last) => {
                    last.len > (state.nextblk - state.minblk) / 16
                        || last.len + nblks > self.max_file_blocks
                }
            };
            if newfile {
                state.files.push_back(Segment {
                    start: blkno,
                    len: 0,
                });
            }
            (state.files.back().unwrap().start, newfile)
        };

        disk::append(
            &segment_path(&self.dir, fnum),
            newfile,
            buf,
            self.nosync,
        )?;
        if newfile && !self.nosync {
            disk::sync_dir(&self.dir)?;
        }

        let mut state = self.state.write();
        state.files.back_mut().unwrap().len += nblks;
        state.nextblk += nblks;
        Ok(())
    }

    /// Drop whole segment files whose blocks are all numbered below
    /// `blkno`. The last file is never deleted, which is what keeps this
    /// safe to run concurrently with the writer; readers that lose the
    /// race observe a missing file and report a miss.
    pub fn delete(&self, blkno: u64) -> Result<(), StoreError> {
        loop {
            let fnum = {
                let mut state = self.state.write();
                if state.files.len() < 2 {
                    break;
                }
                let head = state.files[0];
                if head.start + head.len > blkno {
                    break;
                }
                state.files.pop_front();
                state.minblk = state.files[0].start;
                head.start
            };

            let path = segment_path(&self.dir, fnum);
            if let Err(err) = std::fs::remove_file(&path) {
                tracing::warn!("unlink({}): {err}", path.display());
                return Err(err.into());
            }
            disk::sync_dir(&self.dir)?;
        }
        Ok(())
    }

    #[cfg(test)]
    fn set_max_file_blocks(&mut self, n: u64) {
        self.max_file_blocks = n;
    }
}

fn segment_name(fileno: u64) -> String {
    format!("blks_{fileno:016x}")
}

fn segment_path(dir: &Path, fileno: u64) -> PathBuf {
    dir.join(segment_name(fileno))
}
