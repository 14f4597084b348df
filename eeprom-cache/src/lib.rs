//! Write-back RAM cache for a slow, page-organized serial EEPROM.
//!
//! The whole device is mirrored into RAM by [`WriteBackCache::load`];
//! callers then read and write the RAM image freely. Every mutation
//! compares the new byte against the stored one and marks the owning
//! device page dirty only on an actual change, so device traffic is
//! bounded by real deltas. Dirty pages go back to the device either one
//! at a time from a poll loop ([`WriteBackCache::commit_one`], never
//! blocking, at most one device write in flight) or all at once at a sync
//! point ([`WriteBackCache::flush_all`]).

pub mod bitmap;


use std::mem;
use std::slice;

use log::{debug, info};
use unio::{Unio, PAGE_SIZE};

use crate::bitmap::DirtyBitmap;

pub struct WriteBackCache<U: Unio> {
    bus: U,
    // None when the configured capacity is zero; every operation checks
    // this state first and degrades to its neutral failure value.
    image: Option<Box<[u8]>>,
    dirty: DirtyBitmap,
    block_size: usize,
    write_page: usize,
}

fn page_count_for(size: usize) -> usize {
    (size + PAGE_SIZE - 1) / PAGE_SIZE
}

fn span_in(len: usize, address: usize, span: usize) -> bool {
    match address.checked_add(span) {
        Some(end) => end <= len,
        None => false,
    }
}

impl<U: Unio> WriteBackCache<U> {
    /// Cache over `bus` mirroring `size` bytes of device. `block_size` is
    /// the unit used by the block operations and is clamped to `size`.
    pub fn new(bus: U, size: usize, block_size: usize) -> WriteBackCache<U> {
        WriteBackCache {
            bus,
            image: if size == 0 {
                None
            } else {
                Some(vec![0; size].into_boxed_slice())
            },
            dirty: DirtyBitmap::new(page_count_for(size)),
            block_size: block_size.min(size),
            write_page: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.image.as_deref().map_or(0, |image| image.len())
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn page_count(&self) -> usize {
        page_count_for(self.size())
    }

    /// Page the next `commit_one` call will look at.
    pub fn write_cursor(&self) -> usize {
        self.write_page
    }

    pub fn reset_write_cursor(&mut self) {
        self.write_page = 0;
    }

    pub fn dirty_page_count(&self) -> usize {
        self.dirty.count()
    }

    /// The underlying device driver.
    pub fn bus(&self) -> &U {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut U {
        &mut self.bus
    }

    /// Populate the RAM image from the device. Leaves the dirty state
    /// untouched. A zero-capacity cache has nothing to do and reports
    /// success.
    pub fn load(&mut self) -> bool {
        let image = match self.image.as_deref_mut() {
            Some(image) => image,
            None => return true,
        };
        info!("loading {} bytes from device", image.len());
        self.bus.read(image, 0)
    }

    fn good_address(&self, address: usize, len: usize) -> bool {
        match self.image.as_deref() {
            Some(image) => span_in(image.len(), address, len),
            None => false,
        }
    }

    /// Byte at `address`, or 0 when out of range.
    pub fn read(&self, address: usize) -> u8 {
        match self.image.as_deref() {
            Some(image) if address < image.len() => image[address],
            _ => 0,
        }
    }

    /// Store `value` at `address`; out-of-range addresses are ignored.
    /// The owning page is marked dirty only if the byte actually changes.
    pub fn write(&mut self, address: usize, value: u8) {
        if self.good_address(address, 1) {
            self.store_span(address, &[value]);
        }
    }

    // Change-detecting byte store shared by the scalar, typed and block
    // write paths. The span must already be validated.
    fn store_span(&mut self, address: usize, data: &[u8]) {
        let image = match self.image.as_deref_mut() {
            Some(image) => image,
            None => return,
        };
        for (offset, &value) in data.iter().enumerate() {
            let at = address + offset;
            if image[at] != value {
                image[at] = value;
                self.dirty.set(at / PAGE_SIZE);
            }
        }
    }

    /// Typed read of a `T` spanning `[address, address + size_of::<T>())`.
    /// Returns `default` when any part of the span is out of range.
    ///
    /// # Safety
    /// `T` must be plain-old-data: any bit pattern found in the image must
    /// be a valid `T`.
    pub unsafe fn get<T>(&self, address: usize, default: T) -> T {
        match self.image.as_deref() {
            Some(image) if span_in(image.len(), address, mem::size_of::<T>()) => {
                (image.as_ptr().add(address) as *const T).read_unaligned()
            }
            _ => default,
        }
    }

    /// Typed write of `value` over `[address, address + size_of::<T>())`,
    /// dirtying only the pages where bytes actually change. The value is
    /// handed back; when the span is out of range it comes back unmodified
    /// and nothing is stored.
    ///
    /// # Safety
    /// `T` must be plain-old-data without padding, since its raw bytes are
    /// copied into the image.
    pub unsafe fn put<T>(&mut self, address: usize, value: T) -> T {
        if self.good_address(address, mem::size_of::<T>()) {
            let bytes =
                slice::from_raw_parts(&value as *const T as *const u8, mem::size_of::<T>());
            self.store_span(address, bytes);
        }
        value
    }

    /// Copy one block out of the RAM image into `out`. Fails without
    /// touching `out` when the block size is zero, `out` is smaller than a
    /// block, or the block's byte span is out of range.
    pub fn read_block(&self, block: usize, out: &mut [u8]) -> bool {
        if self.block_size == 0 || out.len() < self.block_size {
            return false;
        }
        let address = match block.checked_mul(self.block_size) {
            Some(address) => address,
            None => return false,
        };
        match self.image.as_deref() {
            Some(image) if span_in(image.len(), address, self.block_size) => {
                out[..self.block_size]
                    .copy_from_slice(&image[address..address + self.block_size]);
                true
            }
            _ => false,
        }
    }

    /// Store one block into the RAM image, with the same change-detecting
    /// dirty marking as `write`. Fails without mutating anything when the
    /// block size is zero, `data` is smaller than a block, or the block's
    /// byte span is out of range.
    pub fn write_block(&mut self, block: usize, data: &[u8]) -> bool {
        if self.block_size == 0 || data.len() < self.block_size {
            return false;
        }
        let address = match block.checked_mul(self.block_size) {
            Some(address) => address,
            None => return false,
        };
        if !self.good_address(address, self.block_size) {
            return false;
        }
        self.store_span(address, &data[..self.block_size]);
        true
    }

    /// Copy block `src` over block `dest` inside the RAM image. Inherits
    /// `write_block`'s checks for the destination.
    pub fn copy_block(&mut self, dest: usize, src: usize) -> bool {
        if self.block_size == 0 {
            return false;
        }
        let address = match src.checked_mul(self.block_size) {
            Some(address) => address,
            None => return false,
        };
        let staged = match self.image.as_deref() {
            Some(image) if span_in(image.len(), address, self.block_size) => {
                image[address..address + self.block_size].to_vec()
            }
            _ => return false,
        };
        self.write_block(dest, &staged)
    }

    /// Write back at most one dirty page, without blocking.
    ///
    /// Returns `true` when progress was made: either a page write was
    /// handed to the device, or the page under the cursor was clean and the
    /// cursor moved past it. The two cases are deliberately reported the
    /// same way; `true` does not mean a device write happened. Returns
    /// `false` when the cache has no buffer, the device is mid-write, or
    /// the device refuses the write; the page stays dirty and the cursor
    /// stays put, so the same page is retried on the next call.
    ///
    /// Calling this at least `page_count` times (absent failures) drains
    /// every page that was dirty at the start, one device write per dirty
    /// page.
    pub fn commit_one(&mut self) -> bool {
        let image = match self.image.as_deref() {
            Some(image) => image,
            None => return false,
        };
        if self.write_page >= page_count_for(image.len()) {
            self.write_page = 0;
        }
        if self.bus.is_writing() {
            return false;
        }
        if !self.dirty.test(self.write_page) {
            self.write_page += 1;
            return true;
        }
        if !self.bus.enable_write() {
            return false;
        }
        let start = self.write_page * PAGE_SIZE;
        let end = (start + PAGE_SIZE).min(image.len());
        debug!("committing page {} ({:#06x}..{:#06x})", self.write_page, start, end);
        if !self.bus.start_write(&image[start..end], start) {
            return false;
        }
        self.dirty.clear(self.write_page);
        self.write_page += 1;
        true
    }

    /// Blocking write-back of every dirty page. Waits for any in-flight
    /// write first, then walks all pages once. Meant for shutdown and
    /// explicit sync points, not the steady-state poll loop.
    ///
    /// A page whose blocking write fails keeps its dirty bit; the walk
    /// still visits the remaining pages and the call reports `false`.
    pub fn flush_all(&mut self) -> bool {
        let image = match self.image.as_deref() {
            Some(image) => image,
            None => return false,
        };
        info!("flushing {} dirty pages", self.dirty.count());
        self.bus.await_write_complete();
        let mut ok = true;
        for page in 0..page_count_for(image.len()) {
            if !self.dirty.test(page) {
                continue;
            }
            let start = page * PAGE_SIZE;
            let end = (start + PAGE_SIZE).min(image.len());
            if self.bus.simple_write(&image[start..end], start) {
                self.dirty.clear(page);
            } else {
                ok = false;
            }
        }
        ok
    }
}

impl<U: Unio> Drop for WriteBackCache<U> {
    fn drop(&mut self) {
        // Nothing a destructor can do about a failed flush; pending
        // modifications are written out on a best-effort basis.
        self.flush_all();
    }
}
