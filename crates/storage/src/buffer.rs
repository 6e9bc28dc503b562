use std::collections::{HashMap, HashSet};
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;
use thiserror::Error;

use crate::page::Page;
use crate::replacer::{FrameId, LRUReplacer, Replacer};
use crate::{DiskManager, INVALID_PAGE_ID, PageId};

/// Errors returned by the buffer pool manager.
#[derive(Debug, Error)]
pub enum BufferPoolError {
    /// The buffer pool latch was poisoned.
    #[error("buffer pool latch poisoned")]
    LockPoisoned,
    /// The underlying disk manager failed.
    #[error("disk manager error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias for buffer pool results.
pub type BufferPoolResult<T> = Result<T, BufferPoolError>;

/// Mapping from resident page identifiers to the frames holding them.
/// A page id is present iff exactly one frame currently holds that page.
/// Latched by the enclosing pool lock.
#[derive(Debug, Default)]
pub struct PageTable {
    slots: HashMap<PageId, FrameId>,
}

impl PageTable {
    /// Looks up the frame holding a page.
    pub fn find(&self, page_id: PageId) -> Option<FrameId> {
        self.slots.get(&page_id).copied()
    }

    /// Maps a page id to a frame.
    pub fn insert(&mut self, page_id: PageId, frame_id: FrameId) {
        self.slots.insert(page_id, frame_id);
    }

    /// Unmaps a page id, reporting whether it was present.
    pub fn remove(&mut self, page_id: PageId) -> bool {
        self.slots.remove(&page_id).is_some()
    }

    /// Number of resident pages.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Guard that provides access to a pinned page while holding the pool latch.
///
/// Dropping the guard releases the latch but not the pin; callers finish
/// the protocol with [`BufferPoolManager::unpin_page`].
pub struct PageGuard<'a> {
    state: MutexGuard<'a, BufferPoolState>,
    frame_id: FrameId,
    page_id: PageId,
}

impl PageGuard<'_> {
    /// Returns the frame id backing this guard.
    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    /// Returns the id of the pinned page.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }
}

impl Deref for PageGuard<'_> {
    type Target = Page;

    fn deref(&self) -> &Self::Target {
        &self.state.pages[self.frame_id]
    }
}

impl DerefMut for PageGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.state.pages[self.frame_id]
    }
}

struct BufferPoolState {
    disk_manager: DiskManager,
    pages: Vec<Page>,
    page_table: PageTable,
    free_list: Vec<FrameId>,
    dirty_pages: HashSet<PageId>,
}

impl Drop for BufferPoolState {
    // Write-back of surviving dirty pages when the last pool handle goes
    // away. Best effort: a destructor cannot surface errors.
    fn drop(&mut self) {
        let page_ids = self.dirty_pages.iter().copied().collect::<Vec<_>>();
        for page_id in page_ids {
            if let Some(frame_id) = self.page_table.find(page_id) {
                if self.pages[frame_id].is_dirty {
                    let _ = self
                        .disk_manager
                        .write_page(page_id, &self.pages[frame_id].data);
                }
            }
        }
        let _ = self.disk_manager.sync_data();
    }
}

#[derive(Default)]
struct BufferPoolMetrics {
    fetch_count: AtomicUsize,
}

/// Flush mode for buffer pool writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Leave the disk sync to the operating system (default behavior).
    Lazy,
    /// Force the written data to stable storage.
    Force,
}

/// Buffer pool manager caching a fixed number of page frames between disk
/// and memory.
///
/// A single latch serializes every public operation; disk I/O happens
/// while it is held. The handle is cheap to clone and share across
/// threads. Callers pin pages via [`fetch_page`](Self::fetch_page) or
/// [`new_page`](Self::new_page) and must balance every pin with an
/// [`unpin_page`](Self::unpin_page); a pinned frame is never evicted or
/// reassigned.
#[derive(Clone)]
pub struct BufferPoolManager {
    inner: Arc<Mutex<BufferPoolState>>,
    replacer: Arc<LRUReplacer>,
    metrics: Arc<BufferPoolMetrics>,
    pool_size: usize,
}

impl BufferPoolManager {
    /// Creates a buffer pool with a fixed number of frames over the given
    /// disk manager. Panics if `pool_size` is zero.
    pub fn new(disk_manager: DiskManager, pool_size: usize) -> Self {
        assert!(pool_size > 0, "buffer pool requires at least one frame");
        let pages = vec![Page::new(); pool_size];
        let free_list = (0..pool_size).rev().collect();
        let state = BufferPoolState {
            disk_manager,
            pages,
            page_table: PageTable::default(),
            free_list,
            dirty_pages: HashSet::new(),
        };
        Self {
            inner: Arc::new(Mutex::new(state)),
            replacer: Arc::new(LRUReplacer::new(pool_size)),
            metrics: Arc::new(BufferPoolMetrics::default()),
            pool_size,
        }
    }

    /// Opens the database file at `path` and builds a pool over it.
    pub fn open<P: AsRef<Path>>(path: P, pool_size: usize) -> BufferPoolResult<Self> {
        let disk_manager = DiskManager::open(path)?;
        Ok(Self::new(disk_manager, pool_size))
    }

    fn lock_state(&self) -> BufferPoolResult<MutexGuard<'_, BufferPoolState>> {
        self.inner.lock().map_err(|_| BufferPoolError::LockPoisoned)
    }

    /// Returns the number of page fetches since last reset.
    pub fn fetch_count(&self) -> usize {
        self.metrics.fetch_count.load(Ordering::Relaxed)
    }

    /// Resets the fetch counter to zero.
    pub fn reset_fetch_count(&self) {
        self.metrics.fetch_count.store(0, Ordering::Relaxed);
    }

    /// Number of frames owned by the pool.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Frames currently on the free list.
    pub fn free_frame_count(&self) -> BufferPoolResult<usize> {
        Ok(self.lock_state()?.free_list.len())
    }

    /// Frames currently eligible for eviction.
    pub fn evictable_count(&self) -> usize {
        self.replacer.size()
    }

    /// Resident pages currently marked dirty.
    pub fn dirty_page_count(&self) -> BufferPoolResult<usize> {
        Ok(self.lock_state()?.dirty_pages.len())
    }

    /// Reports whether a page is resident in the pool.
    pub fn contains_page(&self, page_id: PageId) -> BufferPoolResult<bool> {
        Ok(self.lock_state()?.page_table.find(page_id).is_some())
    }

    /// Pin count of a resident page, `None` if the page is not resident.
    pub fn pin_count(&self, page_id: PageId) -> BufferPoolResult<Option<u32>> {
        let state = self.lock_state()?;
        Ok(state
            .page_table
            .find(page_id)
            .map(|frame_id| state.pages[frame_id].pin_count))
    }

    /// Pulls a frame from the free list, falling back to a replacer
    /// victim. The bool reports which source supplied it.
    fn acquire_frame(&self, state: &mut BufferPoolState) -> Option<(FrameId, bool)> {
        if let Some(frame_id) = state.free_list.pop() {
            return Some((frame_id, true));
        }
        self.replacer.victim().map(|frame_id| (frame_id, false))
    }

    /// Undoes a frame acquisition after a failed operation.
    fn release_frame(&self, state: &mut BufferPoolState, frame_id: FrameId, from_free_list: bool) {
        if from_free_list {
            state.free_list.push(frame_id);
        } else {
            self.replacer.insert(frame_id);
        }
    }

    /// Unbinds a victim frame: writes it back if dirty, drops its page
    /// table and dirty set entries, and resets it. On a write error the
    /// frame keeps its page, flag, and mapping so the caller can put it
    /// back where it came from.
    fn evict_frame(&self, state: &mut BufferPoolState, frame_id: FrameId) -> BufferPoolResult<()> {
        let BufferPoolState {
            disk_manager,
            pages,
            page_table,
            dirty_pages,
            ..
        } = state;
        let page = &mut pages[frame_id];
        if let Some(old_page_id) = page.page_id {
            if page.is_dirty {
                disk_manager.write_page(old_page_id, &page.data)?;
                page.is_dirty = false;
                dirty_pages.remove(&old_page_id);
                debug!("wrote back dirty page {old_page_id} while evicting frame {frame_id}");
            }
            page_table.remove(old_page_id);
        }
        page.reset_memory();
        Ok(())
    }

    /// Allocates a new page on disk, pins it in a frame, and returns a
    /// guarded reference; the new id is read off the guard. Returns
    /// `Ok(None)` when every frame is pinned.
    pub fn new_page(&self) -> BufferPoolResult<Option<PageGuard<'_>>> {
        let mut state = self.lock_state()?;
        let Some((frame_id, from_free_list)) = self.acquire_frame(&mut state) else {
            return Ok(None);
        };
        if let Err(err) = self.evict_frame(&mut state, frame_id) {
            self.release_frame(&mut state, frame_id, from_free_list);
            return Err(err);
        }
        let page_id = match state.disk_manager.allocate_page() {
            Ok(page_id) => page_id,
            Err(err) => {
                // The frame is unbound after eviction.
                state.free_list.push(frame_id);
                return Err(err.into());
            }
        };
        {
            let page = &mut state.pages[frame_id];
            page.page_id = Some(page_id);
            page.pin_count = 1;
        }
        state.page_table.insert(page_id, frame_id);
        Ok(Some(PageGuard {
            state,
            frame_id,
            page_id,
        }))
    }

    /// Fetches a page into memory and pins it, returning a guarded
    /// reference. Returns `Ok(None)` for [`INVALID_PAGE_ID`] or when
    /// every frame is pinned.
    pub fn fetch_page(&self, page_id: PageId) -> BufferPoolResult<Option<PageGuard<'_>>> {
        if page_id == INVALID_PAGE_ID {
            return Ok(None);
        }
        self.metrics.fetch_count.fetch_add(1, Ordering::Relaxed);
        let mut state = self.lock_state()?;
        if let Some(frame_id) = state.page_table.find(page_id) {
            // A hit on an unpinned frame must leave the replacer before
            // the pin count rises; erasing is a no-op otherwise.
            self.replacer.erase(frame_id);
            state.pages[frame_id].pin_count += 1;
            return Ok(Some(PageGuard {
                state,
                frame_id,
                page_id,
            }));
        }

        let Some((frame_id, from_free_list)) = self.acquire_frame(&mut state) else {
            return Ok(None);
        };
        if let Err(err) = self.evict_frame(&mut state, frame_id) {
            self.release_frame(&mut state, frame_id, from_free_list);
            return Err(err);
        }
        {
            let state = &mut *state;
            let (disk_manager, pages) = (&mut state.disk_manager, &mut state.pages);
            let page = &mut pages[frame_id];
            if let Err(err) = disk_manager.read_page(page_id, page.data_mut()) {
                // The frame is unbound after eviction.
                state.free_list.push(frame_id);
                return Err(err.into());
            }
            page.page_id = Some(page_id);
            page.pin_count = 1;
        }
        state.page_table.insert(page_id, frame_id);
        Ok(Some(PageGuard {
            state,
            frame_id,
            page_id,
        }))
    }

    /// Unpins a page, optionally recording that the caller modified it.
    /// Returns `Ok(false)` if the page is not resident or its pin count
    /// is already zero.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> BufferPoolResult<bool> {
        let mut state = self.lock_state()?;
        let Some(frame_id) = state.page_table.find(page_id) else {
            return Ok(false);
        };
        let page = &mut state.pages[frame_id];
        if page.pin_count == 0 {
            return Ok(false);
        }
        if is_dirty {
            // Dirty is monotonic until flush, eviction, or delete; a
            // clean unpin never clears it.
            page.is_dirty = true;
        }
        page.pin_count -= 1;
        let evictable = page.pin_count == 0;
        if is_dirty {
            state.dirty_pages.insert(page_id);
        }
        if evictable {
            self.replacer.insert(frame_id);
        }
        Ok(true)
    }

    /// Flushes a page to disk if it is resident and dirty.
    pub fn flush_page(&self, page_id: PageId) -> BufferPoolResult<bool> {
        self.flush_page_with_mode(page_id, FlushMode::Lazy)
    }

    /// Flushes a page to disk if it is resident and dirty, reporting
    /// whether anything was written. [`FlushMode::Force`] additionally
    /// syncs file data to stable storage.
    pub fn flush_page_with_mode(&self, page_id: PageId, mode: FlushMode) -> BufferPoolResult<bool> {
        if page_id == INVALID_PAGE_ID {
            return Ok(false);
        }
        let mut state = self.lock_state()?;
        let Some(frame_id) = state.page_table.find(page_id) else {
            return Ok(false);
        };
        let state = &mut *state;
        let (disk_manager, pages, dirty_pages) = (
            &mut state.disk_manager,
            &mut state.pages,
            &mut state.dirty_pages,
        );
        let page = &mut pages[frame_id];
        if !page.is_dirty {
            return Ok(false);
        }
        disk_manager.write_page(page_id, &page.data)?;
        if mode == FlushMode::Force {
            disk_manager.sync_data()?;
        }
        page.is_dirty = false;
        dirty_pages.remove(&page_id);
        Ok(true)
    }

    /// Writes back every dirty page and clears the dirty set.
    pub fn flush_all_pages(&self) -> BufferPoolResult<()> {
        self.flush_all_pages_with_mode(FlushMode::Lazy)
    }

    /// Writes back every dirty page and clears the dirty set. Work is
    /// bounded by the dirty set; clean frames are not touched. On an I/O
    /// error the failed page keeps its flag and set entry.
    pub fn flush_all_pages_with_mode(&self, mode: FlushMode) -> BufferPoolResult<()> {
        let mut state = self.lock_state()?;
        let BufferPoolState {
            disk_manager,
            pages,
            page_table,
            dirty_pages,
            ..
        } = &mut *state;
        let page_ids = dirty_pages.iter().copied().collect::<Vec<_>>();
        let mut written = 0usize;
        for page_id in page_ids {
            let Some(frame_id) = page_table.find(page_id) else {
                dirty_pages.remove(&page_id);
                continue;
            };
            let page = &mut pages[frame_id];
            if !page.is_dirty {
                dirty_pages.remove(&page_id);
                continue;
            }
            disk_manager.write_page(page_id, &page.data)?;
            page.is_dirty = false;
            dirty_pages.remove(&page_id);
            written += 1;
        }
        if mode == FlushMode::Force {
            disk_manager.sync_data()?;
        }
        debug!("flushed {written} dirty pages");
        Ok(())
    }

    /// Deletes a resident, unpinned page: drops it from the pool,
    /// discards any dirty contents, deallocates the identifier, and
    /// returns the frame to the free list. Returns `Ok(false)` if the
    /// page is not resident or still pinned.
    pub fn delete_page(&self, page_id: PageId) -> BufferPoolResult<bool> {
        let mut state = self.lock_state()?;
        let Some(frame_id) = state.page_table.find(page_id) else {
            return Ok(false);
        };
        if state.pages[frame_id].pin_count > 0 {
            return Ok(false);
        }
        state.page_table.remove(page_id);
        self.replacer.erase(frame_id);
        // The page is being destroyed; dirty contents are discarded.
        state.dirty_pages.remove(&page_id);
        state.disk_manager.deallocate_page(page_id);
        state.pages[frame_id].reset_memory();
        state.free_list.push(frame_id);
        debug!("deleted page {page_id}, frame {frame_id} back on the free list");
        Ok(true)
    }
}
