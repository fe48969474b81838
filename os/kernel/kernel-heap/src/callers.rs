use core::fmt;
use core::panic::Location;
use log::info;

/// Entries of the most-frequent-caller table.
pub const MAX_USERS_TO_DUMP: usize = 64;

#[derive(Debug, Copy, Clone, Default)]
pub(crate) struct CallerEntry {
    /// `None` marks an empty slot.
    pub caller: Option<&'static Location<'static>>,
    pub num: u32,
    /// Bytes of the last sampled call, or the sum of a dump.
    pub size: usize,
    /// One allocation made by this caller.
    pub ptr: usize,
}

impl CallerEntry {
    const EMPTY: Self = Self {
        caller: None,
        num: 0,
        size: 0,
        ptr: 0,
    };
}

/// Call sites responsible for heap usage.
///
/// Memory-pressure sampling keeps the most frequent callers; allocation
/// dumps aggregate the live bytes per caller.
#[derive(Clone)]
pub(crate) struct CallerTable {
    entries: [CallerEntry; MAX_USERS_TO_DUMP],
}

impl CallerTable {
    pub(crate) const fn new() -> Self {
        Self {
            entries: [CallerEntry::EMPTY; MAX_USERS_TO_DUMP],
        }
    }

    /// Hand out the current contents and start over.
    pub(crate) const fn take(&mut self) -> Self {
        core::mem::replace(self, Self::new())
    }

    /// Count a sampled call, evicting the least frequent caller if needed.
    pub(crate) fn sample(&mut self, caller: &'static Location<'static>, bytes: usize, ptr: usize) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.caller == Some(caller)) {
            entry.num += 1;
            entry.size = bytes;
            entry.ptr = ptr;
            return;
        }
        if let Some(entry) = self.entries.iter_mut().min_by_key(|e| e.num) {
            *entry = CallerEntry {
                caller: Some(caller),
                num: 1,
                size: bytes,
                ptr,
            };
        }
    }

    /// Add a live chunk to its caller's total.
    ///
    /// Returns `false` if the table is full and the caller has no entry.
    pub(crate) fn add_chunk(
        &mut self,
        caller: Option<&'static Location<'static>>,
        bytes: usize,
        ptr: usize,
    ) -> bool {
        for entry in &mut self.entries {
            if entry.num != 0 && entry.caller == caller {
                entry.size += bytes;
                entry.num += 1;
                return true;
            }
            if entry.num == 0 {
                *entry = CallerEntry {
                    caller,
                    num: 1,
                    size: bytes,
                    ptr,
                };
                return true;
            }
        }
        false
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &CallerEntry> {
        self.entries.iter().filter(|e| e.num != 0)
    }

    /// Log every used entry until `stop` says otherwise.
    pub(crate) fn log(&self, heap: &str, stop: impl Fn() -> bool) {
        for entry in self.iter() {
            if stop() {
                info!("{heap}: requested to stop logging");
                break;
            }
            log_user(heap, entry);
        }
    }
}

/// Displays a call site, or a placeholder for allocations without a record.
pub(crate) struct CallerName(pub Option<&'static Location<'static>>);

impl fmt::Display for CallerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(caller) => write!(f, "caller {caller}"),
            None => f.write_str("an unknown caller"),
        }
    }
}

pub(crate) fn log_user(heap: &str, entry: &CallerEntry) {
    info!(
        "{heap}: {} bytes (ptr={:#x}) allocated from {} in at least {} calls.",
        entry.size,
        entry.ptr,
        CallerName(entry.caller),
        entry.num
    );
}
