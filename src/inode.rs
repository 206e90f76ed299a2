//! Inode table cache.
//!
//! The table mirrors the 16 inode-table blocks of the disk and always holds
//! all 256 slots, each either valid or zeroed-invalid. Mutations are written
//! through one block at a time by the filesystem façade.

use crate::disk::Disk;
use crate::layout::BLOCK_SIZE;
use crate::layout::INODES_PER_BLOCK;
use crate::layout::INODE_SIZE;
use crate::layout::INODE_TABLE_BLOCKS;
use crate::layout::INODE_TABLE_START;
use crate::layout::Inode;
use crate::layout::MAX_INODES;
use std::io;

/// In-memory mirror of the on-disk inode table.
pub struct InodeTable {
	slots: Vec<Inode>,
}

impl InodeTable {
	/// Returns a table with every slot invalid.
	pub fn empty() -> Self {
		Self {
			slots: vec![Inode::empty(); MAX_INODES],
		}
	}

	/// Reads the whole inode table from `disk`.
	///
	/// Invalid slots are normalized to the empty inode: a freshly formatted
	/// disk only ever wrote the first table block, so later blocks decode
	/// from all-zero bytes whose pointer fields are not the proper `-1`.
	pub fn load(disk: &mut Disk) -> io::Result<Self> {
		let mut slots = Vec::with_capacity(MAX_INODES);
		let mut blk = [0; BLOCK_SIZE];
		for i in 0..INODE_TABLE_BLOCKS {
			disk.read_block(INODE_TABLE_START + i, &mut blk)?;
			for rec in blk.chunks_exact(INODE_SIZE) {
				let inode = Inode::decode(rec);
				slots.push(if inode.valid { inode } else { Inode::empty() });
			}
		}
		Ok(Self { slots })
	}

	/// Returns the inode at `index`.
	pub fn get(&self, index: usize) -> Inode {
		self.slots[index]
	}

	/// Replaces the inode at `index`.
	pub fn set(&mut self, index: usize, inode: Inode) {
		self.slots[index] = inode;
	}

	/// Returns the index of the first invalid slot.
	pub fn find_free(&self) -> Option<usize> {
		self.slots.iter().position(|inode| !inode.valid)
	}

	/// Returns the number of valid inodes.
	pub fn valid_count(&self) -> usize {
		self.slots.iter().filter(|inode| inode.valid).count()
	}

	/// Packs the `block`th table block from the cache into `blk`.
	pub fn encode_block(&self, block: usize, blk: &mut [u8]) {
		let first = block * INODES_PER_BLOCK;
		for i in 0..INODES_PER_BLOCK {
			let rec = &mut blk[i * INODE_SIZE..(i + 1) * INODE_SIZE];
			self.slots[first + i].encode(rec);
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn free_slot_scan() {
		let mut table = InodeTable::empty();
		assert_eq!(table.find_free(), Some(0));
		table.set(0, Inode::new_file());
		table.set(1, Inode::new_file());
		assert_eq!(table.find_free(), Some(2));
		assert_eq!(table.valid_count(), 2);
		table.set(0, Inode::empty());
		assert_eq!(table.find_free(), Some(0));
	}

	#[test]
	fn block_packing() {
		let mut table = InodeTable::empty();
		let mut inode = Inode::new_file();
		inode.size = 77;
		inode.direct[2] = Some(5);
		// Slot 17 lives in table block 1, record 1
		table.set(17, inode);
		let mut blk = [0; BLOCK_SIZE];
		table.encode_block(1, &mut blk);
		let decoded = Inode::decode(&blk[INODE_SIZE..2 * INODE_SIZE]);
		assert_eq!(decoded, inode);
		// Sibling records encode as proper empty inodes
		let sibling = Inode::decode(&blk[..INODE_SIZE]);
		assert_eq!(sibling, Inode::empty());
	}
}
