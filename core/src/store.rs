//! Emulated storage: the data array, the one-page staging cache, and the
//! cursor that addresses them
//!
//! Reads and programs always move whole, page-aligned pages between the
//! cache and the data array; the byte field of the cursor only selects a
//! position inside the cache. Erases always clear whole blocks.

use crate::cursor::Cursor;
use crate::geometry::{BLOCK_SIZE, DEVICE_SIZE, PAGE_SIZE};

pub struct Store {
    cursor: Cursor,
    cache: [u8; PAGE_SIZE],
    data: Vec<u8>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    /// A blank store: cursor, cache, and data all zeroed.
    pub fn new() -> Self {
        Self {
            cursor: Cursor::new(),
            cache: [0; PAGE_SIZE],
            data: vec![0; DEVICE_SIZE],
        }
    }

    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    pub fn cursor_mut(&mut self) -> &mut Cursor {
        &mut self.cursor
    }

    pub fn clear_cache(&mut self) {
        self.cache.fill(0);
    }

    pub fn clear_cursor(&mut self) {
        self.cursor.clear();
    }

    /// Copy the full page containing the cursor from storage into the
    /// cache. The copy is always page-aligned.
    pub fn copy_page_to_cache(&mut self) {
        let base = self.cursor.page_base();
        self.cache.copy_from_slice(&self.data[base..base + PAGE_SIZE]);
    }

    /// Commit the cache to the page containing the cursor. The entire
    /// page-aligned page gets overwritten.
    pub fn copy_page_from_cache(&mut self) {
        let base = self.cursor.page_base();
        self.data[base..base + PAGE_SIZE].copy_from_slice(&self.cache);
    }

    /// Read the cache byte addressed by the cursor's byte field.
    pub fn cache_byte(&self) -> u8 {
        self.cache[self.cursor.byte() as usize]
    }

    /// Store `byte` at the cache position addressed by the cursor's byte
    /// field.
    pub fn set_cache_byte(&mut self, byte: u8) {
        self.cache[self.cursor.byte() as usize] = byte;
    }

    /// Zero the entire block containing the cursor, ignoring its page and
    /// byte fields.
    pub fn erase_block(&mut self) {
        let base = self.cursor.block_base();
        self.data[base..base + BLOCK_SIZE].fill(0);
    }

    /// The raw storage contents, for inspection by tests and tooling.
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}
