//! Root directory cache.
//!
//! The directory is a flat list of fixed-size entries stored as the content
//! of the root inode. The cache mirrors every entry, tombstones included:
//! the entry count equals the root inode's size divided by the entry size.
//! Removed entries stay in place as tombstones and are reused before the
//! directory grows.

use crate::disk::Disk;
use crate::error::corrupt;
use crate::layout::BLOCK_SIZE;
use crate::layout::DATA_START;
use crate::layout::DIR_ENTRIES_PER_BLOCK;
use crate::layout::DIR_ENTRY_SIZE;
use crate::layout::DirEntry;
use crate::layout::Inode;
use crate::layout::MIN_DIR_CACHE_ENTRIES;
use crate::layout::NUM_DIRECT_PTRS;
use crate::layout::indirect_entry;
use std::io;

/// In-memory mirror of the root directory, plus the iteration cursor.
pub struct Directory {
	/// Every entry of the directory, tombstones included.
	entries: Vec<DirEntry>,
	/// Position of the directory iterator, in valid entries.
	cursor: usize,
}

impl Directory {
	/// Returns an empty directory cache.
	pub fn empty() -> Self {
		Self {
			entries: Vec::with_capacity(MIN_DIR_CACHE_ENTRIES),
			cursor: 0,
		}
	}

	/// Reads the directory content from `disk`, walking the root inode's
	/// direct pointers, then its indirect block.
	pub fn load(disk: &mut Disk, root: &Inode) -> io::Result<Self> {
		let total = root.size as usize / DIR_ENTRY_SIZE;
		let num_blocks = total.div_ceil(DIR_ENTRIES_PER_BLOCK);
		let mut entries = Vec::with_capacity(total.max(MIN_DIR_CACHE_ENTRIES));
		let indirect_blk = if num_blocks > NUM_DIRECT_PTRS {
			let ptr = root
				.indirect
				.ok_or_else(|| corrupt("root directory misses indirect block"))?;
			let mut buf = [0; BLOCK_SIZE];
			disk.read_block(DATA_START + ptr as usize, &mut buf)?;
			Some(buf)
		} else {
			None
		};
		let mut blk = [0; BLOCK_SIZE];
		for i in 0..num_blocks {
			let db = if i < NUM_DIRECT_PTRS {
				root.direct[i]
			} else {
				indirect_blk
					.as_ref()
					.and_then(|b| indirect_entry(b, i - NUM_DIRECT_PTRS))
			};
			let db = db.ok_or_else(|| corrupt("root directory misses a block pointer"))?;
			disk.read_block(DATA_START + db as usize, &mut blk)?;
			let in_block = (total - i * DIR_ENTRIES_PER_BLOCK).min(DIR_ENTRIES_PER_BLOCK);
			for rec in blk.chunks_exact(DIR_ENTRY_SIZE).take(in_block) {
				entries.push(DirEntry::decode(rec));
			}
		}
		Ok(Self {
			entries,
			cursor: 0,
		})
	}

	/// Returns the number of entries, tombstones included.
	pub fn total_entries(&self) -> usize {
		self.entries.len()
	}

	/// Returns the number of valid entries.
	pub fn valid_count(&self) -> usize {
		self.entries.iter().filter(|e| e.valid).count()
	}

	/// Looks `name` up among the valid entries.
	///
	/// Returns the entry's directory index and inode index.
	pub fn find(&self, name: &str) -> Option<(usize, u32)> {
		self.entries
			.iter()
			.enumerate()
			.find(|(_, e)| e.valid && e.name == name)
			.map(|(i, e)| (i, e.inode))
	}

	/// Returns the index of the first tombstone, if any.
	pub fn first_tombstone(&self) -> Option<usize> {
		self.entries.iter().position(|e| !e.valid)
	}

	/// Returns the entry at `index`, or an unused entry when the cache has
	/// not grown that far (the tail of a partially filled block).
	pub fn entry_or_empty(&self, index: usize) -> DirEntry {
		self.entries.get(index).cloned().unwrap_or_default()
	}

	/// Writes `entry` at `index`, growing the cache as needed.
	pub fn set(&mut self, index: usize, entry: DirEntry) {
		if index >= self.entries.len() {
			self.entries.resize(index + 1, DirEntry::default());
		}
		self.entries[index] = entry;
	}

	/// Tombstones the entry at `index`.
	pub fn invalidate(&mut self, index: usize) {
		self.entries[index].valid = false;
	}

	/// Returns the name of the next valid entry in index order and advances
	/// the iterator, or `None` once the directory is exhausted.
	///
	/// The cursor is only ever reset by a fresh mount or format; mutating
	/// the directory while iterating gives unspecified results.
	pub fn next_name(&mut self) -> Option<String> {
		let name = self
			.entries
			.iter()
			.filter(|e| e.valid)
			.nth(self.cursor)
			.map(|e| e.name.clone())?;
		self.cursor += 1;
		Some(name)
	}
}
