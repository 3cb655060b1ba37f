//! Single-writer, multi-reader broadcast channel over file-backed shared memory.
//!
//! Each channel is one memory-mapped file carrying serialized
//! [`TickSnapshot`](takt_core::TickSnapshot) frames. A double-buffered header
//! with a one-byte selector gives readers a complete header at all times
//! without locks; the last `rotate_num` frames stay live so slow readers can
//! still fetch the latest snapshot while the writer moves on.

mod shm;

pub use shm::{ChannelReader, ChannelWriter, channel_path};
