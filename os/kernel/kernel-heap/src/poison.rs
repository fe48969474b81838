//! Guard bytes and caller records around poisoned allocations.
//!
//! ```text
//! raw                                             mem              mem+bytes
//! ┌──────────┬──────────────────┬────────────────┬────────────────┬────────┐
//! │ back ptr │ 0x5A guard bytes │ PoisonRecord   │ payload        │ 0x5A×16│
//! └──────────┴──────────────────┴────────────────┴────────────────┴────────┘
//! │◄──────────────── prefix_len ────────────────►│
//! ```

use core::panic::Location;
use core::ptr;
use log::warn;

/// Identifies a live poisoned allocation ("MGHP").
pub const POISON_MAGIC: u32 = 0x4d47_4850;

/// Minimum prefix in front of a poisoned payload; rounded up to the alignment.
pub const POISON_PREFIX_SIZE: usize = 48;

/// Guard bytes behind a poisoned payload.
pub const POISON_SUFFIX_SIZE: usize = 16;

/// Fill value of the guard bytes.
pub const POISON_BYTE: u8 = 0x5A;

const BACK_PTR_SIZE: usize = size_of::<*const PoisonRecord>();

/// Metadata right in front of a poisoned payload.
#[repr(C)]
pub(crate) struct PoisonRecord {
    pub magic: u32,
    pub prefix_len: u32,
    pub bytes: usize,
    pub caller: &'static Location<'static>,
}

const RECORD_SIZE: usize = size_of::<PoisonRecord>();

/// Prefix length for an allocation aligned to `alignment`.
pub(crate) const fn prefix_len(alignment: usize) -> usize {
    (POISON_PREFIX_SIZE + alignment - 1) & !(alignment - 1)
}

/// Fill the guard areas of the raw chunk and write the caller record.
///
/// # Safety
/// `raw` must be writable for `prefix_len + bytes + POISON_SUFFIX_SIZE` bytes
/// and aligned to at least 16.
pub(crate) unsafe fn poison_chunk(
    raw: usize,
    bytes: usize,
    prefix_len: usize,
    caller: &'static Location<'static>,
) -> usize {
    debug_assert!(prefix_len >= BACK_PTR_SIZE + RECORD_SIZE);
    let mem = raw + prefix_len;
    let record = (mem - RECORD_SIZE) as *mut PoisonRecord;
    unsafe {
        ptr::write_bytes(raw as *mut u8, POISON_BYTE, prefix_len);
        ptr::write(
            record,
            PoisonRecord {
                magic: POISON_MAGIC,
                #[allow(clippy::cast_possible_truncation)]
                prefix_len: prefix_len as u32,
                bytes,
                caller,
            },
        );
        ptr::write(raw as *mut *const PoisonRecord, record);
        ptr::write_bytes((mem + bytes) as *mut u8, POISON_BYTE, POISON_SUFFIX_SIZE);
    }
    mem
}

/// The record in front of the payload at `mem`.
///
/// # Safety
/// `mem` must be a payload of a live allocation of a poisoning heap.
pub(crate) unsafe fn record_of<'m>(mem: usize) -> &'m PoisonRecord {
    unsafe { &*((mem - RECORD_SIZE) as *const PoisonRecord) }
}

/// The record the back pointer at `raw` refers to, if it points inside the
/// chunk `[raw, raw + size)` and carries the magic.
///
/// # Safety
/// `raw` must be readable for `size` bytes.
pub(crate) unsafe fn record_at<'m>(raw: usize, size: usize) -> Option<&'m PoisonRecord> {
    if size < BACK_PTR_SIZE + RECORD_SIZE {
        return None;
    }
    let back = unsafe { ptr::read(raw as *const usize) };
    let inside = back >= raw + BACK_PTR_SIZE && back <= raw + size - RECORD_SIZE;
    if !inside || back % align_of::<PoisonRecord>() != 0 {
        return None;
    }
    let record = unsafe { &*(back as *const PoisonRecord) };
    (record.magic == POISON_MAGIC).then_some(record)
}

/// Verify the guard bytes of the raw chunk at `raw` holding `size` bytes.
///
/// # Panics
/// On any overwritten guard byte; the heap is corrupted beyond repair.
///
/// # Safety
/// `raw` must be the raw start of a live poisoned allocation, readable for
/// `size` bytes.
pub(crate) unsafe fn check_poisoned_chunk(heap: &str, raw: usize, size: usize) {
    let Some(record) = (unsafe { record_at(raw, size) }) else {
        unsafe { dump_chunk(raw, size.min(128)) };
        panic!("{heap}: poison record at {raw:#x} overwritten");
    };
    let prefix_len = record.prefix_len as usize;
    assert!(
        size >= prefix_len + record.bytes + POISON_SUFFIX_SIZE,
        "{heap}: chunk at {raw:#x} of {size} bytes too small for its record"
    );

    let record_addr = ptr::from_ref(record) as usize;
    for addr in raw + BACK_PTR_SIZE..record_addr {
        if unsafe { ptr::read(addr as *const u8) } != POISON_BYTE {
            unsafe { dump_chunk(raw, prefix_len) };
            panic!("{heap}: prefix poison overwritten: raw={raw:#x} size={size:#x}");
        }
    }
    let suffix = raw + prefix_len + record.bytes;
    for i in 0..POISON_SUFFIX_SIZE {
        if unsafe { ptr::read((suffix + i) as *const u8) } != POISON_BYTE {
            unsafe { dump_chunk(raw, prefix_len) };
            panic!("{heap}: suffix poison [{i}] overwritten: raw={raw:#x} size={size:#x}");
        }
    }
}

/// Log the first `len` bytes of a chunk, 16 per line.
unsafe fn dump_chunk(raw: usize, len: usize) {
    for line in (raw..raw + len).step_by(16) {
        let words: [u32; 4] =
            core::array::from_fn(|i| unsafe { ptr::read_unaligned((line + 4 * i) as *const u32) });
        warn!(
            "{line:#x}: {:#010x} {:#010x} {:#010x} {:#010x}",
            words[0], words[1], words[2], words[3]
        );
    }
}
