use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{fence, Ordering};
use std::time::{Duration, Instant};

use memmap2::{Mmap, MmapMut};
use tracing::{debug, trace};

use takt_core::{TaktError, TickSnapshot};

// ── File layout ──────────────────────────────────────────────────────
//
//   0..4    magic "TAKT"
//   4..8    rotate_num (u32 LE)
//   8       selector byte: which header copy is current (0 or 1)
//   16..    header copy 0
//   ..      header copy 1
//   ..      frame arena
//
// Header copy: seq (u64 LE), frame_count (u32 LE), 4 pad bytes, then
// rotate_num entries of (offset u64 LE, len u64 LE), oldest first.
//
// Write order is payload → header into the non-current copy → release fence
// → selector flip. The flip is a single-byte store, so a reader observes
// either the old or the new complete header, never a mix.

const MAGIC: u32 = 0x544B_4154; // "TAKT" LE
const MAGIC_OFF: usize = 0;
const ROTATE_OFF: usize = 4;
const SELECTOR_OFF: usize = 8;
const HEADER_OFF: usize = 16;

const INITIAL_ARENA: u64 = 256 * 1024;
const GROW_ALIGN: u64 = 64 * 1024;

fn header_size(rotate_num: usize) -> usize {
    16 + rotate_num * 16
}

fn arena_off(rotate_num: usize) -> u64 {
    (HEADER_OFF + 2 * header_size(rotate_num)) as u64
}

fn align8(v: u64) -> u64 {
    (v + 7) & !7
}

/// The path of the backing file for a named channel.
pub fn channel_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.chan"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Frame {
    offset: u64,
    len: u64,
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

fn read_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

// ── Writer ───────────────────────────────────────────────────────────

/// The single writer of a channel. One per outbound channel by construction;
/// no other process may write the same file.
pub struct ChannelWriter {
    file: File,
    mmap: MmapMut,
    path: PathBuf,
    rotate_num: usize,
    seq: u64,
    /// Live frames, oldest first. At most `rotate_num` entries.
    frames: Vec<Frame>,
}

impl ChannelWriter {
    /// Create a fresh channel file, replacing any stale one from a previous
    /// run.
    pub fn create(dir: &Path, name: &str, rotate_num: usize) -> Result<Self, TaktError> {
        if rotate_num == 0 {
            return Err(TaktError::Channel("rotate_num must be > 0".into()));
        }
        std::fs::create_dir_all(dir)?;
        let path = channel_path(dir, name);
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed stale channel file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.set_len(arena_off(rotate_num) + INITIAL_ARENA)?;

        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        mmap[MAGIC_OFF..MAGIC_OFF + 4].copy_from_slice(&MAGIC.to_le_bytes());
        mmap[ROTATE_OFF..ROTATE_OFF + 4].copy_from_slice(&(rotate_num as u32).to_le_bytes());
        // Selector and both header copies are already zero: seq 0, no frames.

        debug!(path = %path.display(), rotate_num, "channel created");
        Ok(Self {
            file,
            mmap,
            path,
            rotate_num,
            seq: 0,
            frames: Vec::new(),
        })
    }

    /// The sequence number of the last published snapshot (0 = none yet).
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Publish a snapshot. Assigns the next sequence number into `snap.seq`
    /// and returns it.
    pub fn put(&mut self, snap: &mut TickSnapshot) -> Result<u64, TaktError> {
        snap.seq = self.seq + 1;
        let payload = snap.to_bytes()?;
        let need = payload.len() as u64;

        // Frames for the last rotate_num puts stay live; everything older is
        // reusable space.
        let keep = self.rotate_num - 1;
        let mut retained: Vec<Frame> = if self.frames.len() > keep {
            self.frames[self.frames.len() - keep..].to_vec()
        } else {
            self.frames.clone()
        };

        let offset = self.alloc(&retained, need)?;
        self.mmap[offset as usize..(offset + need) as usize].copy_from_slice(&payload);

        retained.push(Frame { offset, len: need });
        self.seq += 1;
        self.publish_header(self.seq, &retained);
        self.frames = retained;

        trace!(path = %self.path.display(), seq = self.seq, bytes = need, "snapshot published");
        Ok(self.seq)
    }

    /// First-fit gap search between live frames; append and grow the backing
    /// file when no gap is large enough.
    fn alloc(&mut self, live: &[Frame], need: u64) -> Result<u64, TaktError> {
        let mut sorted = live.to_vec();
        sorted.sort_by_key(|f| f.offset);

        let mut cursor = arena_off(self.rotate_num);
        for f in &sorted {
            if f.offset >= cursor && f.offset - cursor >= need {
                return Ok(cursor);
            }
            cursor = align8(cursor.max(f.offset + f.len));
        }

        if cursor + need > self.mmap.len() as u64 {
            self.grow(cursor + need)?;
        }
        Ok(cursor)
    }

    fn grow(&mut self, min_len: u64) -> Result<(), TaktError> {
        let target = min_len
            .max(self.mmap.len() as u64 * 2)
            .div_ceil(GROW_ALIGN)
            * GROW_ALIGN;
        self.file.set_len(target)?;
        self.mmap = unsafe { MmapMut::map_mut(&self.file)? };
        debug!(path = %self.path.display(), bytes = target, "channel grown");
        Ok(())
    }

    fn publish_header(&mut self, seq: u64, frames: &[Frame]) {
        let hdr_size = header_size(self.rotate_num);
        let current = self.mmap[SELECTOR_OFF];
        let next = 1 - (current & 1);
        let off = HEADER_OFF + next as usize * hdr_size;

        let buf = &mut self.mmap[off..off + hdr_size];
        buf[0..8].copy_from_slice(&seq.to_le_bytes());
        buf[8..12].copy_from_slice(&(frames.len() as u32).to_le_bytes());
        buf[12..16].fill(0);
        for (i, f) in frames.iter().enumerate() {
            let p = 16 + i * 16;
            buf[p..p + 8].copy_from_slice(&f.offset.to_le_bytes());
            buf[p + 8..p + 16].copy_from_slice(&f.len.to_le_bytes());
        }

        // Payload and header must be visible before the flip.
        fence(Ordering::Release);
        unsafe {
            std::ptr::write_volatile(self.mmap.as_mut_ptr().add(SELECTOR_OFF), next);
        }
    }
}

// ── Reader ───────────────────────────────────────────────────────────

/// A polling reader of a channel. Any number may exist per channel, in any
/// process on the same host.
pub struct ChannelReader {
    file: File,
    mmap: Mmap,
    path: PathBuf,
    rotate_num: usize,
}

impl ChannelReader {
    pub fn open(dir: &Path, name: &str) -> Result<Self, TaktError> {
        let path = channel_path(dir, name);
        let file = File::open(&path)
            .map_err(|e| TaktError::Channel(format!("open {}: {e}", path.display())))?;
        let mmap = unsafe { Mmap::map(&file)? };

        if mmap.len() < HEADER_OFF || read_u32(&mmap, MAGIC_OFF) != MAGIC {
            return Err(TaktError::Channel(format!(
                "{} is not a channel file",
                path.display()
            )));
        }
        let rotate_num = read_u32(&mmap, ROTATE_OFF) as usize;
        if rotate_num == 0 {
            return Err(TaktError::Channel(format!(
                "{}: corrupt rotate_num",
                path.display()
            )));
        }

        Ok(Self {
            file,
            mmap,
            path,
            rotate_num,
        })
    }

    /// Sequence number of the newest published snapshot (0 = none yet).
    pub fn header_seq(&mut self) -> Result<u64, TaktError> {
        self.remap_if_grown()?;
        Ok(self.read_header()?.0)
    }

    /// Fetch the newest snapshot on the channel.
    ///
    /// Deserialization failure is fatal to the caller: it propagates to the
    /// component's top-level retry loop. There is no partial-read state
    /// because frames are written whole before the header is published.
    pub fn get(&mut self) -> Result<TickSnapshot, TaktError> {
        // One retry: the frame may point past our mapping if the writer grew
        // the file since we last mapped it.
        for _ in 0..2 {
            self.remap_if_grown()?;
            let (seq, frames) = self.read_header()?;
            let Some(f) = frames.last() else {
                return Err(TaktError::Channel(format!(
                    "{}: channel empty",
                    self.path.display()
                )));
            };
            let end = f.offset + f.len;
            if end > self.mmap.len() as u64 {
                self.remap()?;
                continue;
            }
            let snap = TickSnapshot::from_bytes(&self.mmap[f.offset as usize..end as usize])?;
            trace!(path = %self.path.display(), seq, "snapshot read");
            return Ok(snap);
        }
        Err(TaktError::Channel(format!(
            "{}: frame beyond mapping after remap",
            self.path.display()
        )))
    }

    /// Poll until a snapshot newer than `last_seq` is published, then fetch
    /// it. Cooperative polling with a bounded backoff; tick cadences are
    /// hundreds of milliseconds, so a wake primitive is not worth the
    /// cross-process coordination. `Ok(None)` means the timeout elapsed with
    /// no newer snapshot.
    pub fn wait_for_next(
        &mut self,
        last_seq: u64,
        timeout: Option<Duration>,
    ) -> Result<Option<TickSnapshot>, TaktError> {
        let start = Instant::now();
        let mut backoff = Duration::from_millis(1);
        loop {
            if self.header_seq()? > last_seq {
                return self.get().map(Some);
            }
            if let Some(limit) = timeout {
                if start.elapsed() >= limit {
                    return Ok(None);
                }
            }
            std::thread::sleep(backoff);
            backoff = (backoff * 2).min(Duration::from_millis(10));
        }
    }

    fn read_header(&self) -> Result<(u64, Vec<Frame>), TaktError> {
        let hdr_size = header_size(self.rotate_num);
        if self.mmap.len() < HEADER_OFF + 2 * hdr_size {
            return Err(TaktError::Channel(format!(
                "{}: file shorter than header region",
                self.path.display()
            )));
        }

        let selector = unsafe { std::ptr::read_volatile(self.mmap.as_ptr().add(SELECTOR_OFF)) };
        fence(Ordering::Acquire);
        let off = HEADER_OFF + (selector & 1) as usize * hdr_size;

        let buf = &self.mmap[off..off + hdr_size];
        let seq = read_u64(buf, 0);
        let count = (read_u32(buf, 8) as usize).min(self.rotate_num);
        let frames = (0..count)
            .map(|i| Frame {
                offset: read_u64(buf, 16 + i * 16),
                len: read_u64(buf, 16 + i * 16 + 8),
            })
            .collect();
        Ok((seq, frames))
    }

    fn remap_if_grown(&mut self) -> Result<(), TaktError> {
        let len = self.file.metadata()?.len();
        if len != self.mmap.len() as u64 {
            self.remap()?;
        }
        Ok(())
    }

    fn remap(&mut self) -> Result<(), TaktError> {
        self.mmap = unsafe { Mmap::map(&self.file)? };
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────
