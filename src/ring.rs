//! Shared-memory friendly single-producer/single-consumer ring buffer.
//!
//! Cursors count samples modulo `slots * channels`. One slot is always left
//! empty so that `write == read` unambiguously means "empty", which makes the
//! usable capacity `slots - 1` frames.
use std::mem::size_of;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::{MmapMut, MmapOptions};
use once_cell::sync::Lazy;

#[cfg(target_os = "macos")]
use mach::mach_time::{mach_absolute_time, mach_timebase_info, mach_timebase_info_data_t};

/// Header stored at the front of a shared memory buffer so that peer processes can
/// inspect queue state without invoking Rust code.
#[repr(C, align(64))]
pub struct RingBufferHeader {
    slot_frames: u32,
    channels: u32,
    write_index: AtomicU64,
    read_index: AtomicU64,
    last_write_ns: AtomicU64,
    overflow_frames: AtomicU64,
    underflow_frames: AtomicU64,
}

impl RingBufferHeader {
    fn new(slot_frames: usize, channels: usize) -> Self {
        Self {
            slot_frames: slot_frames as u32,
            channels: channels as u32,
            write_index: AtomicU64::new(0),
            read_index: AtomicU64::new(0),
            last_write_ns: AtomicU64::new(0),
            overflow_frames: AtomicU64::new(0),
            underflow_frames: AtomicU64::new(0),
        }
    }
}

// Owners of the memory behind `RingBuffer::header`/`RingBuffer::data`.
enum RingStorage {
    Local {
        _header: Box<RingBufferHeader>,
        _samples: Vec<f32>,
    },
    Shared {
        _mmap: MmapMut,
    },
}

/// Lock-free ring buffer for interleaved `f32` audio data.
///
/// One producer may call [`push`](Self::push) while one consumer calls
/// [`pop`](Self::pop). [`reset`](Self::reset) must only run while neither side
/// is active.
pub struct RingBuffer {
    _storage: RingStorage,
    header: NonNull<RingBufferHeader>,
    data: NonNull<f32>,
    slot_frames: usize,
    channels: usize,
    size: usize,
}

unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

fn slot_count(capacity_frames: usize) -> usize {
    (capacity_frames.max(1) + 1).next_power_of_two()
}

impl RingBuffer {
    /// Create a heap backed ring holding at least `capacity_frames` frames.
    pub fn new_local(capacity_frames: usize, channels: usize) -> Self {
        init_clock();
        let channels = channels.max(1);
        let slot_frames = slot_count(capacity_frames);
        let mut samples = vec![0.0f32; slot_frames * channels];
        let header = Box::new(RingBufferHeader::new(slot_frames, channels));
        let header_ptr = NonNull::from(header.as_ref());
        let data_ptr = NonNull::new(samples.as_mut_ptr()).unwrap_or(NonNull::dangling());
        Self {
            _storage: RingStorage::Local {
                _header: header,
                _samples: samples,
            },
            header: header_ptr,
            data: data_ptr,
            slot_frames,
            channels,
            size: slot_frames * channels,
        }
    }

    /// Create an anonymous shared memory backed ring buffer using `mmap`.
    pub fn new_shared(capacity_frames: usize, channels: usize) -> std::io::Result<Self> {
        init_clock();
        let channels = channels.max(1);
        let slot_frames = slot_count(capacity_frames);
        let samples = slot_frames * channels;
        let bytes = size_of::<RingBufferHeader>() + size_of::<f32>() * samples;
        let mut mmap = MmapOptions::new().len(bytes).map_anon()?;
        let base = mmap.as_mut_ptr();
        let header_ptr = base as *mut RingBufferHeader;
        // Anonymous maps are zero filled, which is already silence.
        let data_ptr = unsafe {
            header_ptr.write(RingBufferHeader::new(slot_frames, channels));
            base.add(size_of::<RingBufferHeader>()) as *mut f32
        };
        Ok(Self {
            header: NonNull::new(header_ptr).ok_or_else(std::io::Error::last_os_error)?,
            data: NonNull::new(data_ptr).ok_or_else(std::io::Error::last_os_error)?,
            _storage: RingStorage::Shared { _mmap: mmap },
            slot_frames,
            channels,
            size: samples,
        })
    }

    fn header(&self) -> &RingBufferHeader {
        unsafe { self.header.as_ref() }
    }

    #[inline]
    fn wrap(&self, index: usize) -> usize {
        if self.size.is_power_of_two() {
            index & (self.size - 1)
        } else {
            index % self.size
        }
    }

    #[inline]
    fn used_samples(&self, write: usize, read: usize) -> usize {
        self.wrap(write + self.size - read)
    }

    /// Usable capacity in frames.
    pub fn capacity_frames(&self) -> usize {
        self.slot_frames - 1
    }

    /// Interleaved channel count.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Pointer to the shared header.
    pub fn raw_header_ptr(&self) -> *mut RingBufferHeader {
        self.header.as_ptr()
    }

    /// Write up to `frames.len() / channels` frames, returning frames written.
    ///
    /// Frames that do not fit are dropped and counted as overflow.
    pub fn push(&self, frames: &[f32], timestamp_ns: Option<u64>) -> usize {
        let header = self.header();
        let frames_count = frames.len() / self.channels;
        if frames_count == 0 {
            return 0;
        }

        let write = header.write_index.load(Ordering::Relaxed) as usize;
        let read = header.read_index.load(Ordering::Acquire) as usize;
        let free_samples = self.size - self.used_samples(write, read) - 1;
        let frames_to_write = frames_count.min(free_samples / self.channels);
        let dropped = frames_count - frames_to_write;
        if dropped > 0 {
            header
                .overflow_frames
                .fetch_add(dropped as u64, Ordering::Relaxed);
        }
        if frames_to_write == 0 {
            return 0;
        }

        let samples = frames_to_write * self.channels;
        let first = (self.size - write).min(samples);
        unsafe {
            let base = self.data.as_ptr();
            ptr::copy_nonoverlapping(frames.as_ptr(), base.add(write), first);
            if samples > first {
                ptr::copy_nonoverlapping(frames.as_ptr().add(first), base, samples - first);
            }
        }

        header
            .write_index
            .store(self.wrap(write + samples) as u64, Ordering::Release);
        let timestamp = timestamp_ns.unwrap_or_else(monotonic_timestamp_ns);
        header.last_write_ns.store(timestamp, Ordering::Relaxed);
        frames_to_write
    }

    /// Fill `out` completely, returning how many frames were real data.
    ///
    /// Any shortfall is written as silence and counted as underflow.
    pub fn pop(&self, out: &mut [f32]) -> usize {
        let header = self.header();
        let requested_frames = out.len() / self.channels;

        let read = header.read_index.load(Ordering::Relaxed) as usize;
        let write = header.write_index.load(Ordering::Acquire) as usize;
        let available_frames = self.used_samples(write, read) / self.channels;
        let frames_to_read = requested_frames.min(available_frames);
        let samples = frames_to_read * self.channels;

        if samples > 0 {
            let first = (self.size - read).min(samples);
            unsafe {
                let base = self.data.as_ptr();
                ptr::copy_nonoverlapping(base.add(read), out.as_mut_ptr(), first);
                if samples > first {
                    ptr::copy_nonoverlapping(base, out.as_mut_ptr().add(first), samples - first);
                }
            }
            header
                .read_index
                .store(self.wrap(read + samples) as u64, Ordering::Release);
        }

        out[samples..].fill(0.0);
        let missing = requested_frames - frames_to_read;
        if missing > 0 {
            header
                .underflow_frames
                .fetch_add(missing as u64, Ordering::Relaxed);
        }
        frames_to_read
    }

    /// Zero both cursors, the counters and the sample memory.
    ///
    /// Neither `push` nor `pop` may run concurrently with this call.
    pub fn reset(&self) {
        let header = self.header();
        header.write_index.store(0, Ordering::Relaxed);
        header.read_index.store(0, Ordering::Relaxed);
        header.overflow_frames.store(0, Ordering::Relaxed);
        header.underflow_frames.store(0, Ordering::Relaxed);
        header.last_write_ns.store(0, Ordering::Relaxed);
        unsafe {
            ptr::write_bytes(self.data.as_ptr(), 0, self.size);
        }
        std::sync::atomic::fence(Ordering::Release);
    }

    /// Frames ready for reading.
    pub fn available_read(&self) -> usize {
        let header = self.header();
        let write = header.write_index.load(Ordering::Acquire) as usize;
        let read = header.read_index.load(Ordering::Acquire) as usize;
        self.used_samples(write, read) / self.channels
    }

    /// Frames that can be written before the ring is full.
    pub fn available_write(&self) -> usize {
        self.capacity_frames() - self.available_read()
    }

    /// Frames dropped by `push` since the last reset.
    pub fn overflow_frames(&self) -> u64 {
        self.header().overflow_frames.load(Ordering::Relaxed)
    }

    /// Frames silence-filled by `pop` since the last reset.
    pub fn underflow_frames(&self) -> u64 {
        self.header().underflow_frames.load(Ordering::Relaxed)
    }

    /// Timestamp of the last write.
    pub fn last_write_ns(&self) -> u64 {
        self.header().last_write_ns.load(Ordering::Relaxed)
    }
}

#[cfg(target_os = "macos")]
static TIMEBASE: Lazy<(u64, u64)> = Lazy::new(|| unsafe {
    let mut info = mach_timebase_info_data_t::default();
    mach_timebase_info(&mut info);
    (info.numer as u64, info.denom as u64)
});

#[cfg(not(target_os = "macos"))]
static START: Lazy<std::time::Instant> = Lazy::new(std::time::Instant::now);

/// Force the clock statics so real-time writers never run their one-time init.
fn init_clock() {
    #[cfg(target_os = "macos")]
    Lazy::force(&TIMEBASE);
    #[cfg(not(target_os = "macos"))]
    Lazy::force(&START);
}

#[cfg(target_os = "macos")]
fn timebase() -> (u64, u64) {
    *TIMEBASE
}

/// Convert a mach host time tick count into nanoseconds.
pub fn host_time_to_ns(host_time: u64) -> u64 {
    #[cfg(target_os = "macos")]
    {
        if host_time == 0 {
            return 0;
        }
        let (numer, denom) = timebase();
        ((host_time as u128 * numer as u128) / denom as u128) as u64
    }
    #[cfg(not(target_os = "macos"))]
    {
        host_time
    }
}

/// Monotonic timestamp in nanoseconds.
pub fn monotonic_timestamp_ns() -> u64 {
    #[cfg(target_os = "macos")]
    {
        let host_time = unsafe { mach_absolute_time() };
        host_time_to_ns(host_time)
    }
    #[cfg(not(target_os = "macos"))]
    {
        START.elapsed().as_nanos() as u64
    }
}
