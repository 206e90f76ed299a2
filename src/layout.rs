//! On-disk layout of the filesystem's metadata structures.
//!
//! Every on-disk integer is a 32-bit value stored little-endian. The records
//! are packed and unpacked with explicit field codecs; the in-memory
//! representations never share their layout with the disk. Absent block
//! pointers are `None` in memory and the integer `-1` on disk.

use uuid::Uuid;

/// The size of a block in bytes.
pub const BLOCK_SIZE: usize = 1024;
/// The total number of blocks on the disk.
pub const NUM_BLOCKS: usize = 1024;

/// The index of the superblock.
pub const SUPERBLOCK_INDEX: usize = 0;
/// The index of the first inode-table block.
pub const INODE_TABLE_START: usize = 1;
/// The number of blocks occupied by the inode table.
pub const INODE_TABLE_BLOCKS: usize = 16;
/// The index of the first data block.
pub const DATA_START: usize = INODE_TABLE_START + INODE_TABLE_BLOCKS;
/// The number of blocks in the data region.
pub const NUM_DATA_BLOCKS: usize = NUM_BLOCKS - 2 - INODE_TABLE_BLOCKS;
/// The index of the free-bitmap block.
pub const BITMAP_INDEX: usize = NUM_BLOCKS - 1;

/// The size of an inode record in bytes.
pub const INODE_SIZE: usize = 64;
/// The number of inodes per inode-table block.
pub const INODES_PER_BLOCK: usize = BLOCK_SIZE / INODE_SIZE;
/// The total number of inode slots.
pub const MAX_INODES: usize = INODE_TABLE_BLOCKS * INODES_PER_BLOCK;
/// The number of direct block pointers in an inode.
pub const NUM_DIRECT_PTRS: usize = 12;
/// The number of pointer entries held by an indirect block.
pub const PTRS_PER_INDIRECT: usize = BLOCK_SIZE / 4;
/// The maximum number of data blocks a single file can span.
pub const MAX_FILE_BLOCKS: usize = NUM_DIRECT_PTRS + PTRS_PER_INDIRECT;
/// The maximum size of a file in bytes.
pub const MAX_FILE_SIZE: usize = MAX_FILE_BLOCKS * BLOCK_SIZE;

/// The size of a directory entry in bytes.
pub const DIR_ENTRY_SIZE: usize = 28;
/// The number of directory entries per block. Entries are never split across
/// blocks, leaving 16 bytes of slack at the end of each.
pub const DIR_ENTRIES_PER_BLOCK: usize = BLOCK_SIZE / DIR_ENTRY_SIZE;
/// The size of the on-disk filename field, including the NUL terminator.
pub const MAX_FILENAME: usize = 20;
/// The minimum number of directory entries the cache must accommodate.
pub const MIN_DIR_CACHE_ENTRIES: usize = 144;

/// The maximum number of simultaneously open files.
pub const MAX_OPEN_FILES: usize = 100;

/// The filesystem's signature.
pub const MAGIC: u32 = 0xACBD0005;
/// The inode holding the root directory.
pub const ROOT_DIR_INODE: usize = 0;

/// The offset of the volume id in the superblock, right after the
/// interchangeable prefix.
const VOLUME_ID_OFFSET: usize = 28;

/// Decodes a block pointer, mapping the on-disk `-1` to `None`.
pub fn decode_ptr(b: [u8; 4]) -> Option<u32> {
	let v = i32::from_le_bytes(b);
	(v >= 0).then_some(v as u32)
}

/// Encodes a block pointer, mapping `None` to the on-disk `-1`.
pub fn encode_ptr(p: Option<u32>) -> [u8; 4] {
	p.map(|v| v as i32).unwrap_or(-1).to_le_bytes()
}

/// Returns the `i`th pointer entry of the indirect block `blk`.
pub fn indirect_entry(blk: &[u8], i: usize) -> Option<u32> {
	let off = i * 4;
	decode_ptr(blk[off..off + 4].try_into().unwrap())
}

/// Sets the `i`th pointer entry of the indirect block `blk`.
pub fn set_indirect_entry(blk: &mut [u8], i: usize, ptr: u32) {
	let off = i * 4;
	blk[off..off + 4].copy_from_slice(&encode_ptr(Some(ptr)));
}

fn read_u32(b: &[u8], off: usize) -> u32 {
	u32::from_le_bytes(b[off..off + 4].try_into().unwrap())
}

fn write_u32(b: &mut [u8], off: usize, v: u32) {
	b[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

/// The superblock describes the filesystem's geometry and running counters.
///
/// Only a prefix of the block is meaningful to other implementations; the
/// volume id sits in the unspecified tail.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Superblock {
	/// The filesystem's signature.
	pub magic: u32,
	/// The size of a block in bytes.
	pub block_size: u32,
	/// The length of the filesystem in blocks.
	pub fs_len: u32,
	/// The size of an inode record in bytes.
	pub inode_len: u32,
	/// The inode index of the root directory.
	pub root_dir: u32,
	/// The number of currently valid inodes, root directory included.
	pub num_inodes: u32,
	/// The number of currently valid directory entries.
	pub dir_num_elements: u32,
	/// Identifier of the volume, stamped at format time.
	pub volume_id: Uuid,
}

impl Superblock {
	/// Creates the superblock of a freshly formatted filesystem.
	pub fn new(volume_id: Uuid) -> Self {
		Self {
			magic: MAGIC,
			block_size: BLOCK_SIZE as u32,
			fs_len: NUM_BLOCKS as u32,
			inode_len: INODE_SIZE as u32,
			root_dir: ROOT_DIR_INODE as u32,
			// The root directory's inode exists from the start
			num_inodes: 1,
			dir_num_elements: 0,
			volume_id,
		}
	}

	/// Unpacks the superblock from the block `blk`.
	pub fn decode(blk: &[u8]) -> Self {
		let mut id = [0; 16];
		id.copy_from_slice(&blk[VOLUME_ID_OFFSET..VOLUME_ID_OFFSET + 16]);
		Self {
			magic: read_u32(blk, 0),
			block_size: read_u32(blk, 4),
			fs_len: read_u32(blk, 8),
			inode_len: read_u32(blk, 12),
			root_dir: read_u32(blk, 16),
			num_inodes: read_u32(blk, 20),
			dir_num_elements: read_u32(blk, 24),
			volume_id: Uuid::from_bytes(id),
		}
	}

	/// Packs the superblock into the block `blk`.
	pub fn encode(&self, blk: &mut [u8]) {
		write_u32(blk, 0, self.magic);
		write_u32(blk, 4, self.block_size);
		write_u32(blk, 8, self.fs_len);
		write_u32(blk, 12, self.inode_len);
		write_u32(blk, 16, self.root_dir);
		write_u32(blk, 20, self.num_inodes);
		write_u32(blk, 24, self.dir_num_elements);
		blk[VOLUME_ID_OFFSET..VOLUME_ID_OFFSET + 16]
			.copy_from_slice(self.volume_id.as_bytes());
	}

	/// Tells whether the superblock describes a filesystem this library can
	/// mount.
	pub fn is_valid(&self) -> bool {
		self.magic == MAGIC
			&& self.block_size == BLOCK_SIZE as u32
			&& self.fs_len == NUM_BLOCKS as u32
			&& self.inode_len == INODE_SIZE as u32
			&& (self.root_dir as usize) < MAX_INODES
	}
}

/// An inode describes one file: its length and the data blocks holding its
/// content, 12 direct pointers followed by a single indirect block.
///
/// All block pointers are data-region-relative.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Inode {
	/// Whether the slot is allocated.
	pub valid: bool,
	/// The number of valid entries in the indirect block.
	pub num_indirect: u32,
	/// The length of the file's content in bytes.
	pub size: u32,
	/// Directly mapped data blocks.
	pub direct: [Option<u32>; NUM_DIRECT_PTRS],
	/// The block holding further pointer entries, if any.
	pub indirect: Option<u32>,
}

impl Inode {
	/// Returns an unallocated inode.
	pub const fn empty() -> Self {
		Self {
			valid: false,
			num_indirect: 0,
			size: 0,
			direct: [None; NUM_DIRECT_PTRS],
			indirect: None,
		}
	}

	/// Returns a freshly allocated, empty inode.
	pub const fn new_file() -> Self {
		Self {
			valid: true,
			num_indirect: 0,
			size: 0,
			direct: [None; NUM_DIRECT_PTRS],
			indirect: None,
		}
	}

	/// Unpacks the inode record starting at `rec`.
	pub fn decode(rec: &[u8]) -> Self {
		let mut direct = [None; NUM_DIRECT_PTRS];
		for (i, d) in direct.iter_mut().enumerate() {
			let off = 12 + i * 4;
			*d = decode_ptr(rec[off..off + 4].try_into().unwrap());
		}
		Self {
			valid: read_u32(rec, 0) != 0,
			num_indirect: read_u32(rec, 4),
			size: read_u32(rec, 8),
			direct,
			indirect: decode_ptr(rec[60..64].try_into().unwrap()),
		}
	}

	/// Packs the inode into the record starting at `rec`.
	pub fn encode(&self, rec: &mut [u8]) {
		write_u32(rec, 0, self.valid as u32);
		write_u32(rec, 4, self.num_indirect);
		write_u32(rec, 8, self.size);
		for (i, d) in self.direct.iter().enumerate() {
			let off = 12 + i * 4;
			rec[off..off + 4].copy_from_slice(&encode_ptr(*d));
		}
		rec[60..64].copy_from_slice(&encode_ptr(self.indirect));
	}
}

/// A directory entry binds a filename to an inode.
///
/// Tombstoned entries keep their slot and are reused by later insertions.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DirEntry {
	/// The entry's filename.
	pub name: String,
	/// Whether the entry is in use. A cleared flag marks a tombstone.
	pub valid: bool,
	/// The index of the file's inode.
	pub inode: u32,
}

impl DirEntry {
	/// Unpacks the directory entry starting at `rec`.
	pub fn decode(rec: &[u8]) -> Self {
		let name_field = &rec[..MAX_FILENAME];
		let len = name_field
			.iter()
			.position(|b| *b == 0)
			.unwrap_or(MAX_FILENAME);
		Self {
			name: String::from_utf8_lossy(&name_field[..len]).into_owned(),
			valid: read_u32(rec, 20) != 0,
			inode: read_u32(rec, 24),
		}
	}

	/// Packs the directory entry into the record starting at `rec`.
	///
	/// The name must fit the on-disk field with its NUL terminator.
	pub fn encode(&self, rec: &mut [u8]) {
		let name = self.name.as_bytes();
		debug_assert!(name.len() < MAX_FILENAME);
		rec[..MAX_FILENAME].fill(0);
		rec[..name.len()].copy_from_slice(name);
		write_u32(rec, 20, self.valid as u32);
		write_u32(rec, 24, self.inode);
	}
}
