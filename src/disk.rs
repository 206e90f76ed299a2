//! Emulated block device over a backing file.
//!
//! The device knows nothing about the filesystem stored on it: it only moves
//! whole blocks between a buffer and the backing file, which may be a regular
//! image file or a block device.

use libc::ioctl;
use log::debug;
use std::ffi::c_long;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::Error;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;

/// ioctl macro: Command.
macro_rules! ioc {
	($a:expr, $b:expr, $c:expr, $d:expr) => {
		(($a) << 30) | (($b) << 8) | ($c) | (($d) << 16)
	};
}

/// ioctl macro: Read command.
macro_rules! ior {
	($a:expr, $b:expr, $c:ty) => {
		ioc!(2, $a, $b, std::mem::size_of::<$c>() as c_long)
	};
}

/// ioctl command: Get size of disk in bytes.
const BLKGETSIZE64: c_long = ior!(0x12, 114, u64);

/// Returns the capacity of the backing device in bytes.
fn device_len(dev: &File) -> io::Result<u64> {
	let metadata = dev.metadata()?;
	let file_type = metadata.file_type();
	if file_type.is_block_device() || file_type.is_char_device() {
		let mut size: u64 = 0;
		let ret = unsafe { ioctl(dev.as_raw_fd(), BLKGETSIZE64 as _, &mut size) };
		if ret < 0 {
			return Err(Error::last_os_error());
		}
		Ok(size)
	} else {
		Ok(metadata.len())
	}
}

/// A block device emulated on top of a backing file.
pub struct Disk {
	/// The backing file.
	file: File,
	/// The size of a block in bytes.
	block_size: usize,
	/// The number of blocks on the device.
	num_blocks: usize,
}

impl Disk {
	/// Creates a zero-filled image at `path` and attaches to it.
	///
	/// An existing image at the same path is replaced.
	pub fn create(path: &Path, block_size: usize, num_blocks: usize) -> io::Result<Self> {
		let file = OpenOptions::new()
			.read(true)
			.write(true)
			.create(true)
			.truncate(true)
			.open(path)?;
		file.set_len((block_size * num_blocks) as u64)?;
		debug!(
			"created disk image {} ({num_blocks} blocks of {block_size} bytes)",
			path.display()
		);
		Ok(Self {
			file,
			block_size,
			num_blocks,
		})
	}

	/// Attaches to an existing image at `path`.
	///
	/// The backing file or device must hold at least `num_blocks` blocks of
	/// `block_size` bytes.
	pub fn open(path: &Path, block_size: usize, num_blocks: usize) -> io::Result<Self> {
		let file = OpenOptions::new().read(true).write(true).open(path)?;
		let len = device_len(&file)?;
		if len < (block_size * num_blocks) as u64 {
			return Err(Error::new(
				io::ErrorKind::InvalidInput,
				format!("backing device too small: {len} bytes"),
			));
		}
		Ok(Self {
			file,
			block_size,
			num_blocks,
		})
	}

	fn check(&self, index: usize, buf_len: usize) -> io::Result<()> {
		if index >= self.num_blocks || buf_len != self.block_size {
			return Err(Error::new(
				io::ErrorKind::InvalidInput,
				format!("block {index} out of range or bad buffer length {buf_len}"),
			));
		}
		Ok(())
	}

	/// Reads the block at `index` into `buf`, whose length must be exactly
	/// one block.
	pub fn read_block(&mut self, index: usize, buf: &mut [u8]) -> io::Result<()> {
		self.check(index, buf.len())?;
		self.file
			.seek(SeekFrom::Start((index * self.block_size) as u64))?;
		self.file.read_exact(buf)
	}

	/// Writes `buf`, whose length must be exactly one block, to the block at
	/// `index`.
	pub fn write_block(&mut self, index: usize, buf: &[u8]) -> io::Result<()> {
		self.check(index, buf.len())?;
		self.file
			.seek(SeekFrom::Start((index * self.block_size) as u64))?;
		self.file.write_all(buf)
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use std::env;
	use std::fs;
	use std::path::PathBuf;

	fn image(name: &str) -> PathBuf {
		env::temp_dir().join(format!("sfs_disk_{name}_{}", std::process::id()))
	}

	#[test]
	fn create_zeroed() {
		let path = image("create_zeroed");
		let mut disk = Disk::create(&path, 512, 8).unwrap();
		let mut buf = [0xaa; 512];
		disk.read_block(7, &mut buf).unwrap();
		assert_eq!(buf, [0; 512]);
		let _ = fs::remove_file(&path);
	}

	#[test]
	fn write_read_roundtrip() {
		let path = image("roundtrip");
		let mut disk = Disk::create(&path, 512, 8).unwrap();
		let block = [0x5a; 512];
		disk.write_block(3, &block).unwrap();
		let mut buf = [0; 512];
		disk.read_block(3, &mut buf).unwrap();
		assert_eq!(buf, block);
		// Neighbors untouched
		disk.read_block(2, &mut buf).unwrap();
		assert_eq!(buf, [0; 512]);
		let _ = fs::remove_file(&path);
	}

	#[test]
	fn out_of_range() {
		let path = image("out_of_range");
		let mut disk = Disk::create(&path, 512, 8).unwrap();
		let mut buf = [0; 512];
		assert!(disk.read_block(8, &mut buf).is_err());
		assert!(disk.write_block(8, &buf).is_err());
		// Wrong buffer length
		assert!(disk.read_block(0, &mut [0; 100]).is_err());
		let _ = fs::remove_file(&path);
	}

	#[test]
	fn open_requires_capacity() {
		let path = image("capacity");
		Disk::create(&path, 512, 8).unwrap();
		assert!(Disk::open(&path, 512, 8).is_ok());
		assert!(Disk::open(&path, 512, 9).is_err());
		let _ = fs::remove_file(&path);
	}

	#[test]
	fn reattach_preserves_content() {
		let path = image("reattach");
		let block = [7; 512];
		{
			let mut disk = Disk::create(&path, 512, 8).unwrap();
			disk.write_block(5, &block).unwrap();
		}
		let mut disk = Disk::open(&path, 512, 8).unwrap();
		let mut buf = [0; 512];
		disk.read_block(5, &mut buf).unwrap();
		assert_eq!(buf, block);
		let _ = fs::remove_file(&path);
	}
}
