//! Errors returned by filesystem operations.

use std::io;
use thiserror::Error;

/// An error produced by a filesystem operation.
///
/// Short transfers are not errors: `read` and `write` report them through
/// their return count.
#[derive(Debug, Error)]
pub enum Error {
	/// The named file does not exist in the directory.
	#[error("file not found")]
	NotFound,
	/// The file handle is out of range or not open.
	#[error("invalid file handle")]
	InvalidHandle,
	/// No free inode, no free data block, or the file is at its maximum
	/// length.
	#[error("no space left on device")]
	NoSpace,
	/// The filename does not fit in a directory entry.
	#[error("filename too long")]
	NameTooLong,
	/// An argument is outside its legal range.
	#[error("invalid argument")]
	InvalidArgument,
	/// The superblock does not describe a filesystem this library can read.
	#[error("bad superblock magic or geometry")]
	BadMagic,
	/// The block device failed.
	#[error(transparent)]
	Io(#[from] io::Error),
}

/// Returns the I/O error used when an on-disk structure is inconsistent.
pub(crate) fn corrupt(msg: &str) -> io::Error {
	io::Error::new(io::ErrorKind::InvalidData, msg.to_owned())
}
