use log::{info, warn};

/// Size in bytes of one device page, the unit of a single write.
pub const PAGE_SIZE: usize = 16;

/// Driver contract for a UNIO-protocol serial EEPROM.
///
/// All calls return `true` for success and `false` for failure. The device
/// accepts one write at a time: `start_write` returns as soon as the data
/// has been handed over and the write proceeds in the background, so the
/// caller must poll `is_writing` before enabling the next write.
pub trait Unio {
    /// Synchronous bulk read of `dst.len()` bytes starting at `address`.
    /// On failure the destination may still have been partially overwritten.
    fn read(&mut self, dst: &mut [u8], address: usize) -> bool;

    /// Set the write-enable latch. Must be called before every write; the
    /// latch is consumed by the next `start_write`.
    fn enable_write(&mut self) -> bool;

    /// Begin a write of at most one page. The write must not cross a page
    /// boundary. Returns as soon as the transfer is accepted.
    fn start_write(&mut self, src: &[u8], address: usize) -> bool;

    /// Non-blocking poll: `true` while a previously started write has not
    /// completed.
    fn is_writing(&mut self) -> bool;

    /// Spin until no write is in progress.
    fn await_write_complete(&mut self) -> bool {
        while self.is_writing() {}
        true
    }

    /// Blocking convenience write: enable, start, wait for completion.
    fn simple_write(&mut self, src: &[u8], address: usize) -> bool {
        if !self.enable_write() {
            return false;
        }
        if !self.start_write(src, address) {
            return false;
        }
        self.await_write_complete()
    }
}

impl<U: Unio + ?Sized> Unio for &mut U {
    fn read(&mut self, dst: &mut [u8], address: usize) -> bool {
        (**self).read(dst, address)
    }

    fn enable_write(&mut self) -> bool {
        (**self).enable_write()
    }

    fn start_write(&mut self, src: &[u8], address: usize) -> bool {
        (**self).start_write(src, address)
    }

    fn is_writing(&mut self) -> bool {
        (**self).is_writing()
    }

    fn await_write_complete(&mut self) -> bool {
        (**self).await_write_complete()
    }

    fn simple_write(&mut self, src: &[u8], address: usize) -> bool {
        (**self).simple_write(src, address)
    }
}

/// Block-protect setting, as held in the device status register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    None,
    UpperQuarter,
    UpperHalf,
    All,
}

/// In-memory stand-in for the EEPROM with the timing quirks of the real
/// part: a write-enable latch consumed by every write, one background write
/// in flight at a time, and block protection.
///
/// A write started without the latch set, or overlapping a protected
/// region, reports success but leaves storage unchanged, matching the
/// hardware.
#[derive(Debug)]
pub struct SimEeprom {
    storage: Vec<u8>,
    write_enabled: bool,
    protection: Protection,
    busy_polls: u32,
    polls_left: u32,
    writes: usize,
    fail_enable_write: bool,
    fail_start_write: bool,
}

impl SimEeprom {
    /// Device with zero write latency: `is_writing` is never observed true.
    pub fn new(size: usize) -> SimEeprom {
        SimEeprom::with_busy_polls(size, 0)
    }

    /// Device on which every accepted write stays in flight for `busy_polls`
    /// calls to `is_writing`.
    pub fn with_busy_polls(size: usize, busy_polls: u32) -> SimEeprom {
        SimEeprom {
            storage: vec![0xFF; size],
            write_enabled: false,
            protection: Protection::None,
            busy_polls,
            polls_left: 0,
            writes: 0,
            fail_enable_write: false,
            fail_start_write: false,
        }
    }

    pub fn size(&self) -> usize {
        self.storage.len()
    }

    /// Raw device contents, for inspection.
    pub fn contents(&self) -> &[u8] {
        &self.storage
    }

    /// Number of page writes that reached storage.
    pub fn write_count(&self) -> usize {
        self.writes
    }

    pub fn set_protection(&mut self, protection: Protection) {
        self.protection = protection;
    }

    /// Make `enable_write` report failure until turned off again.
    pub fn fail_enable_write(&mut self, fail: bool) {
        self.fail_enable_write = fail;
    }

    /// Make `start_write` reject transfers until turned off again.
    pub fn fail_start_write(&mut self, fail: bool) {
        self.fail_start_write = fail;
    }

    /// Fill storage with `address & 0xFF` at every address.
    pub fn fill_increment_pattern(&mut self) {
        for (address, byte) in self.storage.iter_mut().enumerate() {
            *byte = address as u8;
        }
    }

    /// Reset storage to the erased state.
    pub fn clear(&mut self) {
        self.storage.fill(0xFF);
    }

    // First address covered by the current block-protect setting.
    fn protected_floor(&self) -> usize {
        let size = self.storage.len();
        match self.protection {
            Protection::None => size,
            Protection::UpperQuarter => size - size / 4,
            Protection::UpperHalf => size / 2,
            Protection::All => 0,
        }
    }

    fn in_range(&self, address: usize, len: usize) -> bool {
        match address.checked_add(len) {
            Some(end) => end <= self.storage.len(),
            None => false,
        }
    }
}

impl Unio for SimEeprom {
    fn read(&mut self, dst: &mut [u8], address: usize) -> bool {
        if !self.in_range(address, dst.len()) {
            return false;
        }
        info!("read {} bytes at {:#06x}", dst.len(), address);
        dst.copy_from_slice(&self.storage[address..address + dst.len()]);
        true
    }

    fn enable_write(&mut self) -> bool {
        if self.fail_enable_write {
            return false;
        }
        self.write_enabled = true;
        true
    }

    fn start_write(&mut self, src: &[u8], address: usize) -> bool {
        if self.fail_start_write {
            return false;
        }
        if self.polls_left > 0 {
            // Previous write still in flight.
            return false;
        }
        if !self.in_range(address, src.len()) {
            return false;
        }
        if (address % PAGE_SIZE) + src.len() > PAGE_SIZE {
            // The part cannot write across a page boundary.
            return false;
        }
        if !self.write_enabled {
            warn!("write of {} bytes at {:#06x} ignored: write enable not set", src.len(), address);
            return true;
        }
        self.write_enabled = false;
        if address + src.len() > self.protected_floor() {
            warn!("write of {} bytes at {:#06x} ignored: block protected", src.len(), address);
            return true;
        }
        info!("start write of {} bytes at {:#06x}", src.len(), address);
        self.storage[address..address + src.len()].copy_from_slice(src);
        self.polls_left = self.busy_polls;
        self.writes += 1;
        true
    }

    fn is_writing(&mut self) -> bool {
        if self.polls_left > 0 {
            self.polls_left -= 1;
            return true;
        }
        false
    }
}
