//! Rolling per-track sample queue: a thread-safe FIFO of sample metadata over a monolithic byte
//! buffer.
//!
//! One producer (the loader task running the demuxer) appends bytes and commits sample metadata;
//! one consumer (the pull side) peeks, copies and advances. A single mutex guards both the
//! metadata ring and the byte buffer. Metadata lives in a cyclic buffer that grows by a fixed
//! increment, preserving logical order by copying around the wrap point; bytes ahead of the read
//! cursor are released as the consumer advances.

use std::collections::VecDeque;

use parking_lot::Mutex;

/// The sample starts with a keyframe and can be decoded from here.
pub const SAMPLE_FLAG_SYNC: u32 = 1;
/// The sample payload is encrypted and carries crypto metadata.
pub const SAMPLE_FLAG_ENCRYPTED: u32 = 2;
/// The sample should be decoded but not presented (pre-roll after a seek).
pub const SAMPLE_FLAG_DECODE_ONLY: u32 = 4;

/// Ring growth step when the metadata buffer fills up.
const SAMPLE_CAPACITY_INCREMENT: usize = 250;

/// Byte buffer reservations are rounded up to this granularity.
pub const BYTE_ALLOCATION_GRANULARITY: usize = 32 * 1024;

/// Per-sample encryption metadata. Clear bytes precede encrypted bytes within each subsample.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CryptoInfo {
    pub key_id: Vec<u8>,
    pub iv: Vec<u8>,
    pub num_bytes_clear: Vec<i32>,
    pub num_bytes_enc: Vec<i32>,
}

impl CryptoInfo {
    pub fn subsample_count(&self) -> usize {
        self.num_bytes_clear.len()
    }
}

#[derive(Debug, Clone, Default)]
struct SampleInfo {
    time_us: i64,
    duration_us: i64,
    flags: u32,
    offset: i64,
    size: i32,
    crypto: Option<CryptoInfo>,
}

/// Destination for a peeked sample. The queue copies metadata, payload bytes and (for encrypted
/// samples) crypto metadata out under its lock, so the holder stays valid across later queue
/// mutations.
#[derive(Debug, Default)]
pub struct SampleHolder {
    pub time_us: i64,
    pub duration_us: i64,
    pub flags: u32,
    pub data: Vec<u8>,
    pub crypto: Option<CryptoInfo>,
}

impl SampleHolder {
    pub fn is_sync(&self) -> bool {
        self.flags & SAMPLE_FLAG_SYNC != 0
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags & SAMPLE_FLAG_ENCRYPTED != 0
    }

    pub fn is_decode_only(&self) -> bool {
        self.flags & SAMPLE_FLAG_DECODE_ONLY != 0
    }

    pub fn clear(&mut self) {
        self.time_us = 0;
        self.duration_us = 0;
        self.flags = 0;
        self.data.clear();
        self.crypto = None;
    }
}

struct Inner {
    infos: Vec<SampleInfo>,
    capacity: usize,
    queue_size: usize,
    absolute_read_index: i32,
    relative_read_index: usize,
    relative_write_index: usize,
    bytes: VecDeque<u8>,
    /// Absolute stream offset of `bytes[0]`.
    bytes_base_offset: i64,
    /// Absolute offset one past the last byte appended; monotonic except for upstream discards.
    total_bytes_written: i64,
}

impl Inner {
    fn write_index(&self) -> i32 {
        self.absolute_read_index + self.queue_size as i32
    }

    fn last_write_slot(&self) -> usize {
        if self.relative_write_index == 0 {
            self.capacity - 1
        } else {
            self.relative_write_index - 1
        }
    }

    fn release_bytes_before(&mut self, offset: i64) {
        let drop = (offset - self.bytes_base_offset).clamp(0, self.bytes.len() as i64) as usize;
        self.bytes.drain(..drop);
        self.bytes_base_offset += drop as i64;
    }
}

/// The queue itself. See the module docs for the locking protocol.
pub struct RollingSampleQueue {
    inner: Mutex<Inner>,
}

impl Default for RollingSampleQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl RollingSampleQueue {
    pub fn new() -> RollingSampleQueue {
        RollingSampleQueue {
            inner: Mutex::new(Inner {
                infos: vec![SampleInfo::default(); SAMPLE_CAPACITY_INCREMENT],
                capacity: SAMPLE_CAPACITY_INCREMENT,
                queue_size: 0,
                absolute_read_index: 0,
                relative_read_index: 0,
                relative_write_index: 0,
                bytes: VecDeque::new(),
                bytes_base_offset: 0,
                total_bytes_written: 0,
            }),
        }
    }

    pub fn clear(&self) {
        let mut q = self.inner.lock();
        q.queue_size = 0;
        q.absolute_read_index = 0;
        q.relative_read_index = 0;
        q.relative_write_index = 0;
        q.bytes.clear();
        q.bytes_base_offset = 0;
        q.total_bytes_written = 0;
    }

    /// Index one past the last committed sample. Monotonic across the queue's lifetime, not
    /// reset by ring wraparound.
    pub fn write_index(&self) -> i32 {
        self.inner.lock().write_index()
    }

    /// Index of the sample the consumer will peek next.
    pub fn read_index(&self) -> i32 {
        self.inner.lock().absolute_read_index
    }

    pub fn sample_count(&self) -> usize {
        self.inner.lock().queue_size
    }

    /// Bytes currently held between the read cursor and the write watermark.
    pub fn bytes_buffered(&self) -> usize {
        self.inner.lock().bytes.len()
    }

    /// Appends payload bytes at the write watermark, growing the buffer in
    /// [`BYTE_ALLOCATION_GRANULARITY`] steps. Returns the absolute offset of the first byte
    /// appended, for use as the sample's `offset`.
    pub fn write_sample_data(&self, data: &[u8]) -> i64 {
        let mut q = self.inner.lock();
        let offset = q.total_bytes_written;
        let needed = q.bytes.len() + data.len();
        if needed > q.bytes.capacity() {
            let rounded = needed.div_ceil(BYTE_ALLOCATION_GRANULARITY) * BYTE_ALLOCATION_GRANULARITY;
            let additional = rounded - q.bytes.len();
            q.bytes.reserve(additional);
        }
        q.bytes.extend(data.iter().copied());
        q.total_bytes_written += data.len() as i64;
        offset
    }

    /// Current write watermark (absolute offset one past the last byte appended).
    pub fn bytes_written(&self) -> i64 {
        self.inner.lock().total_bytes_written
    }

    /// Appends sample metadata referring to `size` bytes at absolute `offset` in the byte
    /// buffer.
    pub fn commit_sample(
        &self,
        time_us: i64,
        duration_us: i64,
        flags: u32,
        offset: i64,
        size: i32,
        crypto: Option<CryptoInfo>,
    ) {
        let mut q = self.inner.lock();
        let slot = q.relative_write_index;
        q.infos[slot] = SampleInfo { time_us, duration_us, flags, offset, size, crypto };
        q.queue_size += 1;
        if q.queue_size == q.capacity {
            // Grow the ring, unwrapping so the oldest sample lands at slot 0.
            let new_capacity = q.capacity + SAMPLE_CAPACITY_INCREMENT;
            let mut new_infos = Vec::with_capacity(new_capacity);
            let read = q.relative_read_index;
            new_infos.extend_from_slice(&q.infos[read..]);
            new_infos.extend_from_slice(&q.infos[..read]);
            new_infos.resize(new_capacity, SampleInfo::default());
            let old_capacity = q.capacity;
            q.infos = new_infos;
            q.relative_read_index = 0;
            q.relative_write_index = old_capacity;
            q.capacity = new_capacity;
        } else {
            q.relative_write_index = (q.relative_write_index + 1) % q.capacity;
        }
    }

    /// Copies the current sample (metadata, payload, crypto) into `holder`. Returns false when
    /// the queue is empty.
    pub fn peek_sample(&self, holder: &mut SampleHolder) -> bool {
        let q = self.inner.lock();
        if q.queue_size == 0 {
            return false;
        }
        let info = &q.infos[q.relative_read_index];
        holder.time_us = info.time_us;
        holder.duration_us = info.duration_us;
        holder.flags = info.flags;
        holder.crypto = if holder.is_encrypted() { info.crypto.clone() } else { None };
        holder.data.clear();
        let from = (info.offset - q.bytes_base_offset).max(0) as usize;
        let to = (from + info.size as usize).min(q.bytes.len());
        holder.data.extend(q.bytes.range(from..to));
        true
    }

    /// Start time of the current sample without copying it out.
    pub fn peek_time_us(&self) -> Option<i64> {
        let q = self.inner.lock();
        if q.queue_size == 0 {
            None
        } else {
            Some(q.infos[q.relative_read_index].time_us)
        }
    }

    /// Advances the read cursor past the current sample, releasing payload bytes that are no
    /// longer reachable. Returns the earliest absolute byte offset still needed.
    pub fn move_to_next_sample(&self) -> i64 {
        let mut q = self.inner.lock();
        debug_assert!(q.queue_size > 0);
        q.queue_size -= 1;
        let last_read = q.relative_read_index;
        q.absolute_read_index += 1;
        q.relative_read_index = (q.relative_read_index + 1) % q.capacity;
        let next_offset = if q.queue_size > 0 {
            q.infos[q.relative_read_index].offset
        } else {
            q.infos[last_read].offset + q.infos[last_read].size as i64
        };
        q.release_bytes_before(next_offset);
        next_offset
    }

    /// Moves the read cursor forward to the latest sample at or before `time_us` whose flags
    /// include SYNC. Fails without modifying state if the time falls outside the queue or no
    /// preceding keyframe exists. Returns the new earliest byte offset needed.
    pub fn skip_to_keyframe_before(&self, time_us: i64) -> Option<i64> {
        let mut q = self.inner.lock();
        if q.queue_size == 0 || time_us < q.infos[q.relative_read_index].time_us {
            return None;
        }
        let last_time_us = q.infos[q.last_write_slot()].time_us;
        if time_us > last_time_us {
            return None;
        }

        let mut sample_count = 0usize;
        let mut samples_to_keyframe: Option<usize> = None;
        let mut search = q.relative_read_index;
        while search != q.relative_write_index {
            if q.infos[search].time_us > time_us {
                break;
            }
            if q.infos[search].flags & SAMPLE_FLAG_SYNC != 0 {
                samples_to_keyframe = Some(sample_count);
            }
            search = (search + 1) % q.capacity;
            sample_count += 1;
        }

        let skip = samples_to_keyframe?;
        q.queue_size -= skip;
        q.relative_read_index = (q.relative_read_index + skip) % q.capacity;
        q.absolute_read_index += skip as i32;
        let offset = q.infos[q.relative_read_index].offset;
        q.release_bytes_before(offset);
        Some(offset)
    }

    /// Drops committed samples from the write side, starting at `discard_from_index`. Used to
    /// prune the tail on a representation switch-down. Returns the new write watermark; any
    /// bytes beyond it are discarded as well.
    pub fn discard_upstream_samples(&self, discard_from_index: i32) -> i64 {
        let mut q = self.inner.lock();
        let discard_count = q.write_index() - discard_from_index;
        debug_assert!(discard_count >= 0 && discard_count as usize <= q.queue_size);
        if discard_count <= 0 {
            if q.absolute_read_index == 0 && q.queue_size == 0 {
                // Nothing was ever written.
                return 0;
            }
            return q.total_bytes_written;
        }

        q.queue_size -= discard_count as usize;
        q.relative_write_index =
            (q.relative_write_index + q.capacity - discard_count as usize) % q.capacity;
        let watermark = q.infos[q.relative_write_index].offset;
        let keep = (watermark - q.bytes_base_offset).clamp(0, q.bytes.len() as i64) as usize;
        q.bytes.truncate(keep);
        q.total_bytes_written = watermark;
        watermark
    }
}
