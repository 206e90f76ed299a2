//! The filesystem façade.
//!
//! A [`SimpleFileSystem`] owns the block device and every in-memory cache
//! mirroring it: superblock, inode table, free bitmap, root directory and the
//! open-file table. Each operation mutates the caches first and writes the
//! touched blocks through to the disk before returning, so the image always
//! reflects the last completed call.

use crate::Result;
use crate::bitmap::FreeBitmap;
use crate::dir::Directory;
use crate::disk::Disk;
use crate::error::Error;
use crate::error::corrupt;
use crate::inode::InodeTable;
use crate::layout::BITMAP_INDEX;
use crate::layout::BLOCK_SIZE;
use crate::layout::DATA_START;
use crate::layout::DIR_ENTRIES_PER_BLOCK;
use crate::layout::DIR_ENTRY_SIZE;
use crate::layout::DirEntry;
use crate::layout::INODES_PER_BLOCK;
use crate::layout::INODE_TABLE_START;
use crate::layout::Inode;
use crate::layout::MAX_FILENAME;
use crate::layout::MAX_FILE_BLOCKS;
use crate::layout::MAX_INODES;
use crate::layout::MAX_OPEN_FILES;
use crate::layout::NUM_BLOCKS;
use crate::layout::NUM_DATA_BLOCKS;
use crate::layout::NUM_DIRECT_PTRS;
use crate::layout::PTRS_PER_INDIRECT;
use crate::layout::ROOT_DIR_INODE;
use crate::layout::SUPERBLOCK_INDEX;
use crate::layout::Superblock;
use crate::layout::indirect_entry;
use crate::layout::set_indirect_entry;
use log::debug;
use log::warn;
use rand_core::OsRng;
use rand_core::RngCore;
use std::path::Path;
use uuid::Uuid;

/// One slot of the open-file table.
#[derive(Clone, Copy)]
struct OpenFile {
	/// Whether the slot is in use.
	valid: bool,
	/// The read/write position in the file, in bytes.
	cursor: u32,
	/// The index of the open file's inode.
	inode: u32,
}

impl OpenFile {
	const CLOSED: Self = Self {
		valid: false,
		cursor: 0,
		inode: 0,
	};
}

/// A mounted simple filesystem.
///
/// The handle is single-threaded and single-process: mounting the same image
/// twice at once corrupts it.
pub struct SimpleFileSystem {
	disk: Disk,
	superblock: Superblock,
	inodes: InodeTable,
	bitmap: FreeBitmap,
	dir: Directory,
	fdt: Vec<OpenFile>,
}

impl SimpleFileSystem {
	/// Creates a fresh filesystem on a new image at `path`, replacing any
	/// previous image.
	pub fn format(path: &Path) -> Result<Self> {
		let mut disk = Disk::create(path, BLOCK_SIZE, NUM_BLOCKS)?;
		let superblock = Superblock::new(Uuid::new_v4());
		let mut blk = [0; BLOCK_SIZE];
		superblock.encode(&mut blk);
		disk.write_block(SUPERBLOCK_INDEX, &blk)?;
		// Only the first table block is written out: it carries the root
		// directory's inode. The rest of the table stays zeroed and its
		// blocks stay free until inodes land there.
		let mut inodes = InodeTable::empty();
		inodes.set(ROOT_DIR_INODE, Inode::new_file());
		let mut blk = [0; BLOCK_SIZE];
		inodes.encode_block(0, &mut blk);
		disk.write_block(INODE_TABLE_START, &blk)?;
		let mut bitmap = FreeBitmap::all_free();
		bitmap.set(SUPERBLOCK_INDEX, false);
		bitmap.set(INODE_TABLE_START, false);
		bitmap.set(BITMAP_INDEX, false);
		let mut blk = [0; BLOCK_SIZE];
		bitmap.encode(&mut blk);
		disk.write_block(BITMAP_INDEX, &blk)?;
		debug!(
			"formatted {} (volume id {})",
			path.display(),
			superblock.volume_id
		);
		Ok(Self {
			disk,
			superblock,
			inodes,
			bitmap,
			dir: Directory::empty(),
			fdt: vec![OpenFile::CLOSED; MAX_OPEN_FILES],
		})
	}

	/// Mounts the existing filesystem image at `path`, rebuilding every
	/// cache from the disk.
	pub fn mount(path: &Path) -> Result<Self> {
		let mut disk = Disk::open(path, BLOCK_SIZE, NUM_BLOCKS)?;
		let mut blk = [0; BLOCK_SIZE];
		disk.read_block(SUPERBLOCK_INDEX, &mut blk)?;
		let superblock = Superblock::decode(&blk);
		if !superblock.is_valid() {
			return Err(Error::BadMagic);
		}
		let inodes = InodeTable::load(&mut disk)?;
		disk.read_block(BITMAP_INDEX, &mut blk)?;
		let bitmap = FreeBitmap::decode(&blk);
		let root = inodes.get(superblock.root_dir as usize);
		let dir = Directory::load(&mut disk, &root)?;
		debug!(
			"mounted {} (volume id {}, {} inodes, {} files)",
			path.display(),
			superblock.volume_id,
			superblock.num_inodes,
			superblock.dir_num_elements
		);
		Ok(Self {
			disk,
			superblock,
			inodes,
			bitmap,
			dir,
			fdt: vec![OpenFile::CLOSED; MAX_OPEN_FILES],
		})
	}

	/// Returns the volume id stamped when the image was formatted.
	pub fn volume_id(&self) -> Uuid {
		self.superblock.volume_id
	}

	/// Opens the file called `name`, creating it if absent, and returns its
	/// handle.
	///
	/// The cursor starts at the end of the file. Opening a file that is
	/// already open returns the existing handle.
	pub fn open(&mut self, name: &str) -> Result<usize> {
		if name.len() >= MAX_FILENAME {
			return Err(Error::NameTooLong);
		}
		if name.bytes().any(|b| b == 0) {
			return Err(Error::InvalidArgument);
		}
		let inode_index = match self.dir.find(name) {
			Some((_, inode)) => inode,
			None => self.create(name)?,
		};
		if let Some(fd) = self
			.fdt
			.iter()
			.position(|e| e.valid && e.inode == inode_index)
		{
			return Ok(fd);
		}
		let fd = self
			.fdt
			.iter()
			.position(|e| !e.valid)
			.ok_or(Error::NoSpace)?;
		self.fdt[fd] = OpenFile {
			valid: true,
			cursor: self.inodes.get(inode_index as usize).size,
			inode: inode_index,
		};
		Ok(fd)
	}

	/// Closes the handle `fd`. Closing a handle twice is an error.
	pub fn close(&mut self, fd: usize) -> Result<()> {
		let entry = self.fdt.get_mut(fd).ok_or(Error::InvalidHandle)?;
		if !entry.valid {
			return Err(Error::InvalidHandle);
		}
		entry.valid = false;
		Ok(())
	}

	/// Moves the cursor of `fd` to the absolute offset `loc`, which must lie
	/// within `[0, size]`.
	pub fn seek(&mut self, fd: usize, loc: usize) -> Result<()> {
		let entry = self.fd_entry(fd)?;
		let size = self.inodes.get(entry.inode as usize).size as usize;
		if loc > size {
			return Err(Error::InvalidArgument);
		}
		self.fdt[fd].cursor = loc as u32;
		Ok(())
	}

	/// Writes `buf` at the cursor of `fd`, allocating data blocks on demand.
	///
	/// Returns the number of bytes written, which falls short of the buffer
	/// length when the disk fills up or the file reaches its maximum size.
	pub fn write(&mut self, fd: usize, buf: &[u8]) -> Result<usize> {
		let entry = self.fd_entry(fd)?;
		let inode_index = entry.inode as usize;
		let mut cursor = entry.cursor as usize;
		let mut logical = cursor / BLOCK_SIZE;
		let mut in_block = cursor % BLOCK_SIZE;
		if logical >= MAX_FILE_BLOCKS {
			return Ok(0);
		}
		let mut written = 0;
		let mut blk = [0; BLOCK_SIZE];
		while written < buf.len() {
			let db = match self.ensure_block(inode_index, logical) {
				Ok(db) => db,
				// Disk full or file at maximum length: report the short
				// transfer
				Err(Error::NoSpace) => break,
				Err(e) => return Err(e),
			};
			let chunk = (BLOCK_SIZE - in_block).min(buf.len() - written);
			self.disk.read_block(DATA_START + db as usize, &mut blk)?;
			blk[in_block..in_block + chunk].copy_from_slice(&buf[written..written + chunk]);
			self.disk.write_block(DATA_START + db as usize, &blk)?;
			cursor += chunk;
			written += chunk;
			let mut inode = self.inodes.get(inode_index);
			// Overwriting in place does not grow the file
			inode.size = inode.size.max(cursor as u32);
			self.inodes.set(inode_index, inode);
			in_block = 0;
			logical += 1;
		}
		self.save_inode(inode_index)?;
		self.fdt[fd].cursor = cursor as u32;
		Ok(written)
	}

	/// Reads from the cursor of `fd` into `buf`.
	///
	/// Returns the number of bytes read, clamped to the remaining file
	/// content.
	pub fn read(&mut self, fd: usize, buf: &mut [u8]) -> Result<usize> {
		let entry = self.fd_entry(fd)?;
		let inode = self.inodes.get(entry.inode as usize);
		let mut cursor = entry.cursor as usize;
		let mut remaining = buf
			.len()
			.min((inode.size as usize).saturating_sub(cursor));
		let mut logical = cursor / BLOCK_SIZE;
		let mut in_block = cursor % BLOCK_SIZE;
		let mut read = 0;
		let mut blk = [0; BLOCK_SIZE];
		let mut indirect_blk: Option<[u8; BLOCK_SIZE]> = None;
		while remaining > 0 {
			let in_indirect_range =
				logical >= NUM_DIRECT_PTRS && logical - NUM_DIRECT_PTRS < inode.num_indirect as usize;
			if in_indirect_range && indirect_blk.is_none() {
				let ptr = match inode.indirect {
					Some(ptr) => ptr,
					None => break,
				};
				let mut b = [0; BLOCK_SIZE];
				self.disk.read_block(DATA_START + ptr as usize, &mut b)?;
				indirect_blk = Some(b);
			}
			let db = if logical < NUM_DIRECT_PTRS {
				inode.direct[logical]
			} else if in_indirect_range {
				indirect_blk
					.as_ref()
					.and_then(|b| indirect_entry(b, logical - NUM_DIRECT_PTRS))
			} else {
				None
			};
			let db = match db {
				Some(db) => db,
				None => break,
			};
			let chunk = (BLOCK_SIZE - in_block).min(remaining);
			self.disk.read_block(DATA_START + db as usize, &mut blk)?;
			buf[read..read + chunk].copy_from_slice(&blk[in_block..in_block + chunk]);
			cursor += chunk;
			read += chunk;
			remaining -= chunk;
			in_block = 0;
			logical += 1;
		}
		self.fdt[fd].cursor = cursor as u32;
		Ok(read)
	}

	/// Deletes the file called `name`, releasing its inode and every data
	/// block it owns.
	pub fn remove(&mut self, name: &str) -> Result<()> {
		let (dir_index, inode_index) = self.dir.find(name).ok_or(Error::NotFound)?;
		let inode = self.inodes.get(inode_index as usize);
		for db in inode.direct.iter().flatten() {
			self.set_block_state(DATA_START + *db as usize, true)?;
		}
		if let Some(iblk) = inode.indirect {
			let mut blk = [0; BLOCK_SIZE];
			self.disk.read_block(DATA_START + iblk as usize, &mut blk)?;
			for i in 0..inode.num_indirect as usize {
				if let Some(db) = indirect_entry(&blk, i) {
					self.set_block_state(DATA_START + db as usize, true)?;
				}
			}
			self.set_block_state(DATA_START + iblk as usize, true)?;
		}
		self.inodes.set(inode_index as usize, Inode::empty());
		self.save_inode(inode_index as usize)?;
		self.dir.invalidate(dir_index);
		self.save_dir_block(dir_index)?;
		self.superblock.num_inodes -= 1;
		self.superblock.dir_num_elements -= 1;
		self.save_superblock()?;
		Ok(())
	}

	/// Returns the size in bytes of the file called `name`.
	pub fn file_size(&self, name: &str) -> Result<u32> {
		let (_, inode) = self.dir.find(name).ok_or(Error::NotFound)?;
		Ok(self.inodes.get(inode as usize).size)
	}

	/// Returns the name of the next file in directory order, or `None` once
	/// every file has been delivered.
	///
	/// The iterator only restarts on a fresh mount or format.
	pub fn next_file_name(&mut self) -> Option<String> {
		self.dir.next_name()
	}

	fn fd_entry(&self, fd: usize) -> Result<OpenFile> {
		self.fdt
			.get(fd)
			.filter(|e| e.valid)
			.copied()
			.ok_or(Error::InvalidHandle)
	}

	/// Allocates an inode and a directory entry for a new empty file.
	fn create(&mut self, name: &str) -> Result<u32> {
		if self.superblock.num_inodes as usize == MAX_INODES {
			warn!("cannot create `{name}`: inode table full");
			return Err(Error::NoSpace);
		}
		let slot = self.inodes.find_free().ok_or(Error::NoSpace)?;
		self.inodes.set(slot, Inode::new_file());
		self.save_inode(slot)?;
		self.superblock.num_inodes += 1;
		self.save_superblock()?;
		if let Err(e) = self.add_dir_entry(name, slot as u32) {
			// Release the inode again so the counters stay truthful
			self.inodes.set(slot, Inode::empty());
			self.save_inode(slot)?;
			self.superblock.num_inodes -= 1;
			self.save_superblock()?;
			return Err(e);
		}
		Ok(slot as u32)
	}

	/// Inserts a directory entry, reusing the first tombstone if there is
	/// one and appending otherwise.
	fn add_dir_entry(&mut self, name: &str, inode_index: u32) -> Result<()> {
		let total = self.dir.total_entries();
		let valid = self.superblock.dir_num_elements as usize;
		let reuse = if valid == total {
			None
		} else {
			self.dir.first_tombstone()
		};
		let dir_index = match reuse {
			Some(index) => index,
			None => {
				// Append: the directory grows by one entry
				let mut root = self.inodes.get(ROOT_DIR_INODE);
				root.size += DIR_ENTRY_SIZE as u32;
				self.inodes.set(ROOT_DIR_INODE, root);
				self.save_inode(ROOT_DIR_INODE)?;
				if total % DIR_ENTRIES_PER_BLOCK == 0 {
					// The new entry opens a fresh directory block
					if let Err(e) = self.grow_dir_block() {
						let mut root = self.inodes.get(ROOT_DIR_INODE);
						root.size -= DIR_ENTRY_SIZE as u32;
						self.inodes.set(ROOT_DIR_INODE, root);
						self.save_inode(ROOT_DIR_INODE)?;
						return Err(e);
					}
				}
				total
			}
		};
		self.dir.set(
			dir_index,
			DirEntry {
				name: name.to_owned(),
				valid: true,
				inode: inode_index,
			},
		);
		self.save_dir_block(dir_index)?;
		self.superblock.dir_num_elements += 1;
		self.save_superblock()?;
		Ok(())
	}

	/// Allocates a data block and attaches it to the root directory.
	fn grow_dir_block(&mut self) -> Result<()> {
		let db = self.alloc_data_block()?;
		if let Err(e) = self.attach_data_block(ROOT_DIR_INODE, db) {
			self.set_block_state(DATA_START + db as usize, true)?;
			return Err(e);
		}
		Ok(())
	}

	/// Returns the data block backing the file's `logical` block, allocating
	/// it (and the indirect block, if needed) on first write.
	fn ensure_block(&mut self, inode_index: usize, logical: usize) -> Result<u32> {
		let mut inode = self.inodes.get(inode_index);
		if logical < NUM_DIRECT_PTRS {
			if let Some(db) = inode.direct[logical] {
				return Ok(db);
			}
			let db = self.alloc_data_block()?;
			inode.direct[logical] = Some(db);
			self.inodes.set(inode_index, inode);
			self.save_inode(inode_index)?;
			return Ok(db);
		}
		let idx = logical - NUM_DIRECT_PTRS;
		if idx >= PTRS_PER_INDIRECT {
			return Err(Error::NoSpace);
		}
		match inode.indirect {
			None => {
				// First spill past the direct range: the pointer block and
				// the first pointed-to data block are allocated together
				let iblk = self.alloc_data_block()?;
				let db = match self.alloc_data_block() {
					Ok(db) => db,
					Err(e) => {
						// Give the pointer block back
						self.set_block_state(DATA_START + iblk as usize, true)?;
						return Err(e);
					}
				};
				let mut blk = [0xff; BLOCK_SIZE];
				set_indirect_entry(&mut blk, 0, db);
				self.disk.write_block(DATA_START + iblk as usize, &blk)?;
				inode.indirect = Some(iblk);
				inode.num_indirect = 1;
				self.inodes.set(inode_index, inode);
				self.save_inode(inode_index)?;
				Ok(db)
			}
			Some(iblk) => {
				let mut blk = [0; BLOCK_SIZE];
				self.disk.read_block(DATA_START + iblk as usize, &mut blk)?;
				if idx < inode.num_indirect as usize {
					return Ok(indirect_entry(&blk, idx)
						.ok_or_else(|| corrupt("indirect entry missing"))?);
				}
				if idx > inode.num_indirect as usize {
					return Err(Error::NoSpace);
				}
				let db = self.alloc_data_block()?;
				set_indirect_entry(&mut blk, idx, db);
				self.disk.write_block(DATA_START + iblk as usize, &blk)?;
				inode.num_indirect += 1;
				self.inodes.set(inode_index, inode);
				self.save_inode(inode_index)?;
				Ok(db)
			}
		}
	}

	/// Attaches an already allocated data block to the first free pointer
	/// slot of an inode, direct slots first.
	fn attach_data_block(&mut self, inode_index: usize, db: u32) -> Result<()> {
		let mut inode = self.inodes.get(inode_index);
		if !inode.valid {
			return Err(Error::InvalidArgument);
		}
		if let Some(slot) = inode.direct.iter().position(|p| p.is_none()) {
			inode.direct[slot] = Some(db);
			self.inodes.set(inode_index, inode);
			self.save_inode(inode_index)?;
			return Ok(());
		}
		match inode.indirect {
			None => {
				let iblk = self.alloc_data_block()?;
				let mut blk = [0xff; BLOCK_SIZE];
				set_indirect_entry(&mut blk, 0, db);
				self.disk.write_block(DATA_START + iblk as usize, &blk)?;
				inode.indirect = Some(iblk);
				inode.num_indirect = 1;
			}
			Some(iblk) => {
				if inode.num_indirect as usize >= PTRS_PER_INDIRECT {
					return Err(Error::NoSpace);
				}
				let mut blk = [0; BLOCK_SIZE];
				self.disk.read_block(DATA_START + iblk as usize, &mut blk)?;
				set_indirect_entry(&mut blk, inode.num_indirect as usize, db);
				self.disk.write_block(DATA_START + iblk as usize, &blk)?;
				inode.num_indirect += 1;
			}
		}
		self.inodes.set(inode_index, inode);
		self.save_inode(inode_index)
	}

	/// Picks a free data block, probing forward from a random start so
	/// consecutive allocations spread over the region.
	///
	/// The block is marked used and the bitmap written through. Returns the
	/// data-region-relative index.
	fn alloc_data_block(&mut self) -> Result<u32> {
		let start = OsRng.next_u32() as usize % NUM_DATA_BLOCKS;
		match self.bitmap.find_free(DATA_START, NUM_DATA_BLOCKS, start) {
			Some(index) => {
				self.set_block_state(DATA_START + index, false)?;
				Ok(index as u32)
			}
			None => {
				warn!("no free data block left");
				Err(Error::NoSpace)
			}
		}
	}

	/// Marks a whole-disk block free or used and writes the bitmap through.
	fn set_block_state(&mut self, index: usize, free: bool) -> Result<()> {
		if index >= NUM_BLOCKS {
			return Err(Error::InvalidArgument);
		}
		self.bitmap.set(index, free);
		self.save_bitmap()
	}

	fn save_bitmap(&mut self) -> Result<()> {
		let mut blk = [0; BLOCK_SIZE];
		self.bitmap.encode(&mut blk);
		self.disk.write_block(BITMAP_INDEX, &blk)?;
		Ok(())
	}

	fn save_superblock(&mut self) -> Result<()> {
		let mut blk = [0; BLOCK_SIZE];
		self.superblock.encode(&mut blk);
		self.disk.write_block(SUPERBLOCK_INDEX, &blk)?;
		Ok(())
	}

	/// Writes the inode-table block holding `inode_index` through.
	fn save_inode(&mut self, inode_index: usize) -> Result<()> {
		let table_block = inode_index / INODES_PER_BLOCK;
		let mut blk = [0; BLOCK_SIZE];
		self.inodes.encode_block(table_block, &mut blk);
		self.disk.write_block(INODE_TABLE_START + table_block, &blk)?;
		// A table block receiving inodes for the first time gets claimed
		if self.bitmap.is_free(INODE_TABLE_START + table_block) {
			self.set_block_state(INODE_TABLE_START + table_block, false)?;
		}
		Ok(())
	}

	/// Writes the directory block holding the entry `dir_index` through.
	///
	/// The block pointer is read back from the root inode, which is
	/// authoritative over whatever the caller allocated.
	fn save_dir_block(&mut self, dir_index: usize) -> Result<()> {
		let block_idx = dir_index / DIR_ENTRIES_PER_BLOCK;
		let mut blk = [0; BLOCK_SIZE];
		for i in 0..DIR_ENTRIES_PER_BLOCK {
			let entry = self.dir.entry_or_empty(block_idx * DIR_ENTRIES_PER_BLOCK + i);
			entry.encode(&mut blk[i * DIR_ENTRY_SIZE..(i + 1) * DIR_ENTRY_SIZE]);
		}
		let root = self.inodes.get(ROOT_DIR_INODE);
		let db = if block_idx < NUM_DIRECT_PTRS {
			root.direct[block_idx]
		} else {
			let ptr = root
				.indirect
				.ok_or_else(|| corrupt("root directory misses indirect block"))?;
			let mut iblk = [0; BLOCK_SIZE];
			self.disk.read_block(DATA_START + ptr as usize, &mut iblk)?;
			indirect_entry(&iblk, block_idx - NUM_DIRECT_PTRS)
		};
		let db = db.ok_or_else(|| corrupt("root directory misses a block pointer"))?;
		self.disk.write_block(DATA_START + db as usize, &blk)?;
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::layout::INODE_TABLE_BLOCKS;
	use crate::layout::MAX_FILE_SIZE;
	use std::collections::HashSet;
	use std::env;
	use std::path::PathBuf;

	/// Initializes test logging and returns a unique image path.
	fn setup(name: &str) -> PathBuf {
		let _ = env_logger::builder().is_test(true).try_init();
		env::temp_dir().join(format!("sfs_fs_{name}_{}", std::process::id()))
	}

	/// The superblock counters must match what the caches actually hold.
	fn check_counters(fs: &SimpleFileSystem) {
		assert_eq!(fs.superblock.num_inodes as usize, fs.inodes.valid_count());
		assert_eq!(fs.superblock.dir_num_elements as usize, fs.dir.valid_count());
	}

	#[test]
	fn write_then_size() {
		let path = setup("write_then_size");
		let mut fs = SimpleFileSystem::format(&path).unwrap();
		let fd = fs.open("a").unwrap();
		assert_eq!(fs.write(fd, b"hello").unwrap(), 5);
		fs.close(fd).unwrap();
		assert_eq!(fs.file_size("a").unwrap(), 5);
		check_counters(&fs);
		let _ = std::fs::remove_file(&path);
	}

	#[test]
	fn iterate_fifty_files() {
		let path = setup("iterate_fifty");
		let mut fs = SimpleFileSystem::format(&path).unwrap();
		for i in 0..50 {
			let name = format!("f{i}");
			let fd = fs.open(&name).unwrap();
			assert_eq!(fs.write(fd, b"xyz").unwrap(), 3);
			fs.close(fd).unwrap();
		}
		let mut names = HashSet::new();
		while let Some(name) = fs.next_file_name() {
			assert!(names.insert(name));
		}
		assert_eq!(names.len(), 50);
		for i in 0..50 {
			assert!(names.contains(&format!("f{i}")));
		}
		assert_eq!(fs.next_file_name(), None);
		check_counters(&fs);
		let _ = std::fs::remove_file(&path);
	}

	#[test]
	fn write_stops_at_max_file_size() {
		let path = setup("max_file_size");
		let mut fs = SimpleFileSystem::format(&path).unwrap();
		let fd = fs.open("big").unwrap();
		let payload = vec![0xaa; 300_000];
		let written = fs.write(fd, &payload).unwrap();
		assert_eq!(written, MAX_FILE_SIZE);
		assert_eq!(fs.file_size("big").unwrap() as usize, written);
		// The file cannot grow further
		assert_eq!(fs.write(fd, b"more").unwrap(), 0);
		check_counters(&fs);
		let _ = std::fs::remove_file(&path);
	}

	#[test]
	fn seek_and_read_back() {
		let path = setup("seek_read");
		let mut fs = SimpleFileSystem::format(&path).unwrap();
		let payload: Vec<u8> = (0..2048u32).map(|i| i as u8).collect();
		let fd = fs.open("a").unwrap();
		assert_eq!(fs.write(fd, &payload).unwrap(), 2048);
		fs.seek(fd, 1024).unwrap();
		let mut back = [0; 1024];
		assert_eq!(fs.read(fd, &mut back).unwrap(), 1024);
		assert_eq!(&back[..], &payload[1024..]);
		let _ = std::fs::remove_file(&path);
	}

	#[test]
	fn remount_preserves_file() {
		let path = setup("remount_file");
		{
			let mut fs = SimpleFileSystem::format(&path).unwrap();
			let fd = fs.open("a").unwrap();
			assert_eq!(fs.write(fd, b"hello").unwrap(), 5);
			fs.close(fd).unwrap();
		}
		let mut fs = SimpleFileSystem::mount(&path).unwrap();
		assert_eq!(fs.file_size("a").unwrap(), 5);
		let fd = fs.open("a").unwrap();
		fs.seek(fd, 0).unwrap();
		let mut back = [0; 5];
		assert_eq!(fs.read(fd, &mut back).unwrap(), 5);
		assert_eq!(&back, b"hello");
		check_counters(&fs);
		let _ = std::fs::remove_file(&path);
	}

	#[test]
	fn space_reclaimed_after_remove() {
		let path = setup("reclaim");
		let mut fs = SimpleFileSystem::format(&path).unwrap();
		let payload = vec![0x42; MAX_FILE_SIZE];
		let fd = fs.open("big").unwrap();
		assert_eq!(fs.write(fd, &payload).unwrap(), MAX_FILE_SIZE);
		fs.close(fd).unwrap();
		let free_after_write = fs.bitmap.free_count();
		fs.remove("big").unwrap();
		// 268 data blocks plus the indirect block came back
		assert_eq!(fs.bitmap.free_count(), free_after_write + 269);
		let fd = fs.open("big2").unwrap();
		assert_eq!(fs.write(fd, &payload).unwrap(), MAX_FILE_SIZE);
		check_counters(&fs);
		let _ = std::fs::remove_file(&path);
	}

	#[test]
	fn format_marks_three_blocks() {
		let path = setup("fresh_bitmap");
		let mut fs = SimpleFileSystem::format(&path).unwrap();
		assert_eq!(fs.bitmap.free_count(), NUM_BLOCKS - 3);
		// The on-disk bitmap says the same
		let mut blk = [0; BLOCK_SIZE];
		fs.disk.read_block(BITMAP_INDEX, &mut blk).unwrap();
		assert_eq!(blk.iter().filter(|b| **b == b'0').count(), 3);
		assert_eq!(blk[SUPERBLOCK_INDEX], b'0');
		assert_eq!(blk[INODE_TABLE_START], b'0');
		assert_eq!(blk[BITMAP_INDEX], b'0');
		let _ = std::fs::remove_file(&path);
	}

	#[test]
	fn double_close_and_double_remove() {
		let path = setup("idempotence");
		let mut fs = SimpleFileSystem::format(&path).unwrap();
		let fd = fs.open("a").unwrap();
		fs.close(fd).unwrap();
		assert!(matches!(fs.close(fd), Err(Error::InvalidHandle)));
		fs.remove("a").unwrap();
		assert!(matches!(fs.remove("a"), Err(Error::NotFound)));
		check_counters(&fs);
		let _ = std::fs::remove_file(&path);
	}

	#[test]
	fn remove_frees_data_blocks() {
		let path = setup("remove_frees");
		let mut fs = SimpleFileSystem::format(&path).unwrap();
		let fd = fs.open("f").unwrap();
		// 20 blocks: spills into the indirect range
		assert_eq!(fs.write(fd, &vec![7; 20_000]).unwrap(), 20_000);
		let (_, inode_index) = fs.dir.find("f").unwrap();
		let inode = fs.inodes.get(inode_index as usize);
		let mut blocks: Vec<u32> = inode.direct.iter().flatten().copied().collect();
		let iblk = inode.indirect.unwrap();
		let mut blk = [0; BLOCK_SIZE];
		fs.disk.read_block(DATA_START + iblk as usize, &mut blk).unwrap();
		for i in 0..inode.num_indirect as usize {
			blocks.push(indirect_entry(&blk, i).unwrap());
		}
		blocks.push(iblk);
		assert_eq!(blocks.len(), 21);
		fs.remove("f").unwrap();
		for db in blocks {
			assert!(fs.bitmap.is_free(DATA_START + db as usize));
		}
		check_counters(&fs);
		let _ = std::fs::remove_file(&path);
	}

	#[test]
	fn remount_reconstructs_state() {
		let path = setup("remount_state");
		let (superblock, inodes, bitmap_blk) = {
			let mut fs = SimpleFileSystem::format(&path).unwrap();
			for (name, payload) in [("a", &b"first"[..]), ("b", b"second"), ("c", b"third")] {
				let fd = fs.open(name).unwrap();
				assert_eq!(fs.write(fd, payload).unwrap(), payload.len());
				fs.close(fd).unwrap();
			}
			fs.remove("b").unwrap();
			let slots: Vec<Inode> = (0..MAX_INODES).map(|i| fs.inodes.get(i)).collect();
			let mut blk = [0; BLOCK_SIZE];
			fs.bitmap.encode(&mut blk);
			(fs.superblock.clone(), slots, blk)
		};
		let fs = SimpleFileSystem::mount(&path).unwrap();
		assert_eq!(fs.superblock, superblock);
		for (i, inode) in inodes.iter().enumerate() {
			assert_eq!(fs.inodes.get(i), *inode, "inode {i} differs");
		}
		let mut blk = [0; BLOCK_SIZE];
		fs.bitmap.encode(&mut blk);
		assert_eq!(blk[..], bitmap_blk[..]);
		assert!(fs.dir.find("a").is_some());
		assert!(fs.dir.find("b").is_none());
		assert!(fs.dir.find("c").is_some());
		check_counters(&fs);
		let _ = std::fs::remove_file(&path);
	}

	#[test]
	fn write_read_roundtrip_random() {
		let path = setup("roundtrip_random");
		let mut fs = SimpleFileSystem::format(&path).unwrap();
		let mut payload = vec![0; 70_000];
		rand::thread_rng().fill_bytes(&mut payload);
		let fd = fs.open("blob").unwrap();
		assert_eq!(fs.write(fd, &payload).unwrap(), payload.len());
		fs.seek(fd, 0).unwrap();
		let mut back = vec![0; payload.len()];
		assert_eq!(fs.read(fd, &mut back).unwrap(), payload.len());
		assert_eq!(back, payload);
		let _ = std::fs::remove_file(&path);
	}

	#[test]
	fn random_write_read_walk() {
		use rand::Rng;

		let path = setup("random_walk");
		let mut fs = SimpleFileSystem::format(&path).unwrap();
		let mut model = Vec::new();
		let fd = fs.open("walk").unwrap();
		let mut rng = rand::thread_rng();
		for _ in 0..40 {
			let pos = rng.gen_range(0..=model.len());
			fs.seek(fd, pos).unwrap();
			let len = rng.gen_range(1..3000);
			let mut chunk = vec![0; len];
			rng.fill_bytes(&mut chunk);
			assert_eq!(fs.write(fd, &chunk).unwrap(), len);
			if pos + len > model.len() {
				model.resize(pos + len, 0);
			}
			model[pos..pos + len].copy_from_slice(&chunk);
		}
		assert_eq!(fs.file_size("walk").unwrap() as usize, model.len());
		fs.seek(fd, 0).unwrap();
		let mut back = vec![0; model.len()];
		assert_eq!(fs.read(fd, &mut back).unwrap(), model.len());
		assert_eq!(back, model);
		check_counters(&fs);
		let _ = std::fs::remove_file(&path);
	}

	#[test]
	fn overwrite_in_place_keeps_size() {
		let path = setup("overwrite");
		let mut fs = SimpleFileSystem::format(&path).unwrap();
		let fd = fs.open("a").unwrap();
		assert_eq!(fs.write(fd, b"0123456789").unwrap(), 10);
		fs.seek(fd, 0).unwrap();
		assert_eq!(fs.write(fd, b"abcd").unwrap(), 4);
		assert_eq!(fs.file_size("a").unwrap(), 10);
		fs.seek(fd, 0).unwrap();
		let mut back = [0; 10];
		assert_eq!(fs.read(fd, &mut back).unwrap(), 10);
		assert_eq!(&back, b"abcd456789");
		let _ = std::fs::remove_file(&path);
	}

	#[test]
	fn read_clamped_at_end_of_file() {
		let path = setup("read_clamp");
		let mut fs = SimpleFileSystem::format(&path).unwrap();
		let fd = fs.open("a").unwrap();
		assert_eq!(fs.write(fd, b"0123456789").unwrap(), 10);
		fs.seek(fd, 6).unwrap();
		let mut back = [0; 100];
		assert_eq!(fs.read(fd, &mut back).unwrap(), 4);
		assert_eq!(&back[..4], b"6789");
		// At the end of the file there is nothing left to read
		assert_eq!(fs.read(fd, &mut back).unwrap(), 0);
		let _ = std::fs::remove_file(&path);
	}

	#[test]
	fn seek_bounds() {
		let path = setup("seek_bounds");
		let mut fs = SimpleFileSystem::format(&path).unwrap();
		let fd = fs.open("a").unwrap();
		assert_eq!(fs.write(fd, b"0123456789").unwrap(), 10);
		assert!(matches!(fs.seek(fd, 11), Err(Error::InvalidArgument)));
		// Seeking to the end itself is legal
		fs.seek(fd, 10).unwrap();
		fs.seek(fd, 2).unwrap();
		let mut back = [0; 2];
		assert_eq!(fs.read(fd, &mut back).unwrap(), 2);
		assert_eq!(&back, b"23");
		let _ = std::fs::remove_file(&path);
	}

	#[test]
	fn invalid_handles() {
		let path = setup("invalid_handles");
		let mut fs = SimpleFileSystem::format(&path).unwrap();
		assert!(matches!(fs.close(0), Err(Error::InvalidHandle)));
		assert!(matches!(fs.close(1000), Err(Error::InvalidHandle)));
		let fd = fs.open("a").unwrap();
		fs.close(fd).unwrap();
		assert!(matches!(fs.write(fd, b"x"), Err(Error::InvalidHandle)));
		assert!(matches!(fs.read(fd, &mut [0; 4]), Err(Error::InvalidHandle)));
		assert!(matches!(fs.seek(fd, 0), Err(Error::InvalidHandle)));
		let _ = std::fs::remove_file(&path);
	}

	#[test]
	fn filename_rules() {
		let path = setup("filename_rules");
		let mut fs = SimpleFileSystem::format(&path).unwrap();
		assert!(matches!(
			fs.open(&"a".repeat(MAX_FILENAME)),
			Err(Error::NameTooLong)
		));
		let longest = "a".repeat(MAX_FILENAME - 1);
		let fd = fs.open(&longest).unwrap();
		fs.close(fd).unwrap();
		assert_eq!(fs.file_size(&longest).unwrap(), 0);
		assert!(matches!(fs.open("bad\0name"), Err(Error::InvalidArgument)));
		// The empty name is legal
		let fd = fs.open("").unwrap();
		fs.close(fd).unwrap();
		assert_eq!(fs.file_size("").unwrap(), 0);
		let _ = std::fs::remove_file(&path);
	}

	#[test]
	fn tombstone_reused_before_growth() {
		let path = setup("tombstone");
		let mut fs = SimpleFileSystem::format(&path).unwrap();
		for name in ["a", "b", "c"] {
			let fd = fs.open(name).unwrap();
			fs.close(fd).unwrap();
		}
		fs.remove("b").unwrap();
		let fd = fs.open("d").unwrap();
		fs.close(fd).unwrap();
		// The new entry sits in the tombstoned slot; the directory kept its
		// size
		assert_eq!(fs.dir.find("d").unwrap().0, 1);
		assert_eq!(fs.dir.total_entries(), 3);
		check_counters(&fs);
		let _ = std::fs::remove_file(&path);
	}

	#[test]
	fn open_appends_and_dedupes() {
		let path = setup("open_append");
		let mut fs = SimpleFileSystem::format(&path).unwrap();
		let fd = fs.open("a").unwrap();
		assert_eq!(fs.write(fd, b"abc").unwrap(), 3);
		// A second open of the same file returns the same handle
		assert_eq!(fs.open("a").unwrap(), fd);
		fs.close(fd).unwrap();
		// Reopening starts at the end of the file
		let fd = fs.open("a").unwrap();
		assert_eq!(fs.write(fd, b"def").unwrap(), 3);
		assert_eq!(fs.file_size("a").unwrap(), 6);
		fs.seek(fd, 0).unwrap();
		let mut back = [0; 6];
		assert_eq!(fs.read(fd, &mut back).unwrap(), 6);
		assert_eq!(&back, b"abcdef");
		let _ = std::fs::remove_file(&path);
	}

	#[test]
	fn open_file_table_capacity() {
		let path = setup("fdt_capacity");
		let mut fs = SimpleFileSystem::format(&path).unwrap();
		let mut fds = Vec::new();
		for i in 0..MAX_OPEN_FILES {
			fds.push(fs.open(&format!("f{i}")).unwrap());
		}
		assert!(matches!(fs.open("overflow"), Err(Error::NoSpace)));
		fs.close(fds[0]).unwrap();
		fs.open("overflow").unwrap();
		check_counters(&fs);
		let _ = std::fs::remove_file(&path);
	}

	#[test]
	fn disk_fills_to_short_write() {
		let path = setup("disk_full");
		let mut fs = SimpleFileSystem::format(&path).unwrap();
		let payload = vec![0x11; MAX_FILE_SIZE];
		for name in ["f0", "f1", "f2"] {
			let fd = fs.open(name).unwrap();
			assert_eq!(fs.write(fd, &payload).unwrap(), MAX_FILE_SIZE);
			fs.close(fd).unwrap();
		}
		// The data region has 198 blocks left; one becomes the indirect block
		let fd = fs.open("f3").unwrap();
		assert_eq!(fs.write(fd, &payload).unwrap(), 197 * BLOCK_SIZE);
		// Only the untouched inode-table blocks stay free
		assert_eq!(fs.bitmap.free_count(), INODE_TABLE_BLOCKS - 1);
		assert_eq!(fs.write(fd, b"x").unwrap(), 0);
		check_counters(&fs);
		let _ = std::fs::remove_file(&path);
	}

	#[test]
	fn mount_rejects_foreign_image() {
		let path = setup("foreign");
		Disk::create(&path, BLOCK_SIZE, NUM_BLOCKS).unwrap();
		assert!(matches!(
			SimpleFileSystem::mount(&path),
			Err(Error::BadMagic)
		));
		let _ = std::fs::remove_file(&path);
	}
}

