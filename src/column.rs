//! Typed, chunk-addressable column buffers with a progress cursor.
//!
//! A [`Column`] is one contiguous, cache-line-aligned allocation holding
//! `elements` values of a single [`DataType`]. Columns participate in a
//! single-producer / many-consumer streaming protocol:
//!
//! - the producing operator allocates the full buffer up front, then
//!   publishes data chunk by chunk via [`Column::append_chunk`] +
//!   [`Column::advance`];
//! - readers obtain a [`ChunkCursor`] whose `next()` blocks on the column's
//!   condition variable until the watermark has advanced past the chunk they
//!   need, or the column is complete.
//!
//! The watermark (`written` bytes) is monotone: it never moves backward and
//! never exceeds the buffer size. All byte writes performed before an
//! [`advance`](Column::advance) happen-before any reader that observes the
//! new watermark, because both sides go through the progress mutex.
//!
//! String columns (`DataType::StringEnc`) additionally carry a shared
//! [`Dictionary`](crate::dictionary::Dictionary) translating `u64` codes to
//! strings; see the `dictionary` module for its readiness protocol.

use crate::dictionary::Dictionary;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Cache-line alignment for column buffers.
const BUFFER_ALIGN: usize = 64;

/// The element type stored in a column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
    /// Nanoseconds since epoch, stored as `u64`.
    Timestamp,
    /// Row indices (`u64`), the output representation of filters and joins.
    PositionList,
    /// Packed selection bits. Carried for wire compatibility; no operator
    /// currently emits it.
    Bitmask,
    /// `u64` codes into a shared string dictionary.
    StringEnc,
    Unknown,
}

impl DataType {
    /// Bytes per element, or `None` for types without a fixed width.
    pub fn width(&self) -> Option<usize> {
        match self {
            DataType::Int8 | DataType::UInt8 => Some(1),
            DataType::Int16 | DataType::UInt16 => Some(2),
            DataType::Int32 | DataType::UInt32 | DataType::Float32 => Some(4),
            DataType::Int64
            | DataType::UInt64
            | DataType::Float64
            | DataType::Timestamp
            | DataType::PositionList
            | DataType::StringEnc => Some(8),
            DataType::Bitmask | DataType::Unknown => None,
        }
    }
}

/// Owned, aligned raw buffer. Deallocated with the column.
struct Buffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// The buffer itself is inert memory; all concurrent access is disciplined
// by the column's progress protocol.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// Watermark state guarded by the progress mutex.
struct Progress {
    /// Bytes readable from the start of the buffer. Monotone.
    written: usize,
    /// Set when the producer has published everything.
    complete: bool,
}

/// A single typed column.
pub struct Column {
    dtype: DataType,
    elements: usize,
    size_bytes: usize,
    /// Advisory placement tag; `None` means unbound.
    numa_node: Option<usize>,

    buf: Mutex<Option<Buffer>>,
    allocated: AtomicBool,
    allocated_cv: Condvar,
    allocated_mutex: Mutex<()>,

    progress: Mutex<Progress>,
    data_available: Condvar,

    dictionary: Mutex<Option<Arc<Dictionary>>>,
    dictionary_cv: Condvar,
    dictionary_initialized: AtomicBool,
}

impl Column {
    /// Describe a column without allocating its buffer yet.
    ///
    /// `complete` marks columns whose data is final at allocation time
    /// (base data from ingest); their watermark starts at `end`.
    pub fn new(dtype: DataType, elements: usize, complete: bool, numa_node: Option<usize>) -> Self {
        let width = dtype.width().unwrap_or(0);
        Self {
            dtype,
            elements,
            size_bytes: elements * width,
            numa_node,
            buf: Mutex::new(None),
            allocated: AtomicBool::new(false),
            allocated_cv: Condvar::new(),
            allocated_mutex: Mutex::new(()),
            progress: Mutex::new(Progress {
                written: 0,
                complete,
            }),
            data_available: Condvar::new(),
            dictionary: Mutex::new(None),
            dictionary_cv: Condvar::new(),
            dictionary_initialized: AtomicBool::new(false),
        }
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn elements(&self) -> usize {
        self.elements
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn numa_node(&self) -> Option<usize> {
        self.numa_node
    }

    /// Allocate the zeroed backing buffer. Allocating twice is a no-op with
    /// a warning.
    pub fn allocate(&self) {
        let mut buf = self.buf.lock();
        if buf.is_some() {
            warn!("column buffer was already allocated, ignoring");
            return;
        }
        if self.size_bytes == 0 {
            warn!(dtype = ?self.dtype, "allocating a zero-sized column");
        }
        let layout = Layout::from_size_align(self.size_bytes.max(BUFFER_ALIGN), BUFFER_ALIGN)
            .expect("column layout");
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).expect("column allocation failed");
        *buf = Some(Buffer { ptr, layout });
        drop(buf);

        {
            let mut progress = self.progress.lock();
            if progress.complete {
                progress.written = self.size_bytes;
            }
        }

        let _guard = self.allocated_mutex.lock();
        self.allocated.store(true, Ordering::Release);
        self.allocated_cv.notify_all();
        self.data_available.notify_all();
    }

    /// Block until the buffer has been allocated by the producer.
    pub fn wait_allocated(&self) {
        if self.allocated.load(Ordering::Acquire) {
            return;
        }
        let mut guard = self.allocated_mutex.lock();
        while !self.allocated.load(Ordering::Acquire) {
            self.allocated_cv.wait(&mut guard);
        }
    }

    fn data_ptr(&self) -> *mut u8 {
        self.buf
            .lock()
            .as_ref()
            .expect("column buffer not allocated")
            .ptr
            .as_ptr()
    }

    /// Copy `src` into the buffer at `offset` bytes. The region must not
    /// already be published to readers.
    pub fn append_chunk(&self, offset: usize, src: &[u8]) {
        assert!(
            offset + src.len() <= self.size_bytes,
            "chunk write past column end"
        );
        let dst = self.data_ptr();
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), dst.add(offset), src.len());
        }
    }

    /// Typed variant of [`append_chunk`](Self::append_chunk): write a slice
    /// of elements starting at element index `elem_offset`.
    pub fn write_slice<T: Copy>(&self, elem_offset: usize, src: &[T]) {
        let width = std::mem::size_of::<T>();
        let bytes =
            unsafe { std::slice::from_raw_parts(src.as_ptr() as *const u8, src.len() * width) };
        self.append_chunk(elem_offset * width, bytes);
    }

    /// Advance the watermark by `bytes` and wake blocked readers.
    ///
    /// The watermark never moves backward and never exceeds the buffer size;
    /// reaching the end marks the column complete.
    pub fn advance(&self, bytes: usize) {
        let mut progress = self.progress.lock();
        progress.written = (progress.written + bytes).min(self.size_bytes);
        if progress.written == self.size_bytes {
            progress.complete = true;
        }
        drop(progress);
        self.data_available.notify_all();
    }

    /// Mark the column complete regardless of the watermark position and
    /// wake all readers.
    pub fn mark_complete(&self) {
        let mut progress = self.progress.lock();
        progress.complete = true;
        drop(progress);
        self.data_available.notify_all();
    }

    /// Bytes currently readable.
    pub fn written_bytes(&self) -> usize {
        self.progress.lock().written
    }

    pub fn is_complete(&self) -> bool {
        let progress = self.progress.lock();
        progress.complete || progress.written == self.size_bytes
    }

    /// Block until at least `bytes` are readable or the column is complete.
    pub fn wait_readable(&self, bytes: usize) {
        self.wait_allocated();
        let mut progress = self.progress.lock();
        while !(progress.complete || progress.written >= bytes.min(self.size_bytes)) {
            self.data_available.wait(&mut progress);
        }
    }

    /// Full typed view of the column. Only valid once the column is
    /// complete; blocks until it is.
    pub fn as_slice<T: Copy>(&self) -> &[T] {
        self.wait_readable(self.size_bytes);
        let width = std::mem::size_of::<T>();
        debug_assert_eq!(Some(width), self.dtype.width());
        unsafe { std::slice::from_raw_parts(self.data_ptr() as *const T, self.elements) }
    }

    /// Full byte view of the column. Blocks until the column is complete.
    pub fn raw(&self) -> &[u8] {
        self.wait_readable(self.size_bytes);
        unsafe { std::slice::from_raw_parts(self.data_ptr(), self.size_bytes) }
    }

    /// Blocking cursor over chunks of `chunk_elements` values.
    pub fn chunks<T: Copy>(self: &Arc<Self>, chunk_elements: usize) -> ChunkCursor<T> {
        ChunkCursor::new(Arc::clone(self), chunk_elements)
    }

    /// Install a dictionary, or adopt an existing one (materialize and
    /// transfer outputs share the source dictionary rather than copying).
    /// Re-initializing with a second dictionary warns and keeps the first.
    pub fn init_dictionary(&self, encoding: Option<Arc<Dictionary>>) {
        let mut dict = self.dictionary.lock();
        if dict.is_none() {
            *dict = Some(encoding.unwrap_or_else(|| Arc::new(Dictionary::new())));
            self.dictionary_initialized.store(true, Ordering::Release);
            self.dictionary_cv.notify_all();
        } else if encoding.is_some() {
            warn!("tried to re-initialize an already initialized dictionary");
        }
    }

    /// The dictionary, if initialized.
    pub fn dictionary(&self) -> Option<Arc<Dictionary>> {
        self.dictionary.lock().clone()
    }

    /// Block until a dictionary pointer has been installed, then return it.
    pub fn wait_dictionary(&self) -> Arc<Dictionary> {
        let mut dict = self.dictionary.lock();
        while dict.is_none() {
            self.dictionary_cv.wait(&mut dict);
        }
        dict.clone().expect("dictionary installed")
    }
}

/// A blocking cursor over the chunks of a column.
///
/// Equivalent to an async stream of chunk slices, expressed as a blocking
/// iterator so operator loops stay straight-line. The last chunk holds
/// `elements % chunk_elements` values (or a full chunk when exact).
pub struct ChunkCursor<T> {
    column: Arc<Column>,
    chunk_elements: usize,
    pos: usize,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Copy> ChunkCursor<T> {
    fn new(column: Arc<Column>, chunk_elements: usize) -> Self {
        let chunk_elements = chunk_elements.max(1).min(column.elements.max(1));
        Self {
            column,
            chunk_elements,
            pos: 0,
            _marker: std::marker::PhantomData,
        }
    }

    /// Number of elements in the chunk starting at the current position.
    pub fn current_chunk_len(&self) -> usize {
        self.chunk_elements.min(self.column.elements - self.pos)
    }

    /// True when the current chunk reaches the end of the column.
    pub fn is_last_chunk(&self) -> bool {
        self.pos + self.chunk_elements >= self.column.elements
    }

    /// Element offset of the chunk that `next` will yield.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Yield the next chunk, blocking until the producer has published it.
    /// Returns `None` once the column is exhausted.
    pub fn next(&mut self) -> Option<&[T]> {
        if self.pos >= self.column.elements {
            return None;
        }
        let len = self.current_chunk_len();
        let width = std::mem::size_of::<T>();
        let needed = (self.pos + len) * width;
        self.column.wait_readable(needed);
        let slice = unsafe {
            std::slice::from_raw_parts((self.column.data_ptr() as *const T).add(self.pos), len)
        };
        self.pos += len;
        Some(slice)
    }

    /// Skip ahead by `n` chunks without reading them.
    pub fn advance_by(&mut self, n: usize) {
        self.pos = (self.pos + n * self.chunk_elements).min(self.column.elements);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn width_table_is_consistent() {
        assert_eq!(DataType::Int8.width(), Some(1));
        assert_eq!(DataType::Timestamp.width(), Some(8));
        assert_eq!(DataType::Bitmask.width(), None);
    }

    #[test]
    fn complete_column_is_immediately_readable() {
        let col = Arc::new(Column::new(DataType::UInt64, 4, true, None));
        col.allocate();
        col.write_slice(0, &[1u64, 2, 3, 4]);
        assert_eq!(col.as_slice::<u64>(), &[1, 2, 3, 4]);
    }

    #[test]
    fn watermark_is_clamped_to_end() {
        let col = Arc::new(Column::new(DataType::UInt64, 2, false, None));
        col.allocate();
        col.advance(1024);
        assert_eq!(col.written_bytes(), 16);
        assert!(col.is_complete());
    }
}
