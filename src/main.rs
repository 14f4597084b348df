use eeprom_cache::WriteBackCache;
use log::info;
use unio::SimEeprom;

const EEPROM_SIZE: usize = 2048;
const BLOCK_SIZE: usize = 32;

fn main() {
    env_logger::init();

    // Stand-in for the real part; every page write stays in flight for a
    // few status polls, like the hardware does.
    let mut eeprom = SimEeprom::with_busy_polls(EEPROM_SIZE, 4);
    eeprom.fill_increment_pattern();

    let mut cache = WriteBackCache::new(&mut eeprom, EEPROM_SIZE, BLOCK_SIZE);
    cache.load();
    println!(
        "---- Cache loaded: {} bytes, {} pages, {}-byte blocks ----",
        cache.size(),
        cache.page_count(),
        cache.block_size()
    );

    // Scalar, typed and block traffic against the RAM image.
    cache.write(0, 0xAA);
    let boot_count = unsafe { cache.get(4, 0_u32) };
    unsafe { cache.put(4, boot_count.wrapping_add(1)) };
    info!("boot count was {:#010x}", boot_count);

    let mut block = [0_u8; BLOCK_SIZE];
    for (offset, byte) in block.iter_mut().enumerate() {
        *byte = offset as u8;
    }
    cache.write_block(3, &block);
    cache.copy_block(4, 3);

    // Steady state: one poll per tick, retrying while the device is busy.
    let mut ticks = 0;
    let mut busy_ticks = 0;
    while cache.dirty_page_count() > 0 {
        if !cache.commit_one() {
            busy_ticks += 1;
        }
        ticks += 1;
    }
    println!(
        "---- Incremental commit drained in {} ticks ({} busy) ----",
        ticks, busy_ticks
    );

    // Explicit sync point.
    cache.write(9, 0x55);
    if !cache.flush_all() {
        eprintln!("flush failed, {} dirty pages remain", cache.dirty_page_count());
    }
    println!("---- Flushed, {} dirty pages remain ----", cache.dirty_page_count());

    drop(cache);
    println!("---- Device saw {} page writes ----", eeprom.write_count());
}
