//! JSON lines 记录读写。
//!
//! 每条记录一行，整行一次写出（可选 fsync）；写入失败时截断回写入前的长度，
//! 不留下会与下一条记录粘连的半行。
//! 读取时：末尾缺少换行符的残行视为写入中断（调用方从未收到成功返回），截断丢弃；
//! 其余任何无法解析的行都视为损坏，返回 `QueueError::Corruption`。

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::QueueError;

/// 读取结果。
#[derive(Debug)]
pub(crate) struct LoadedRecords<T> {
	pub records: Vec<T>,
	/// 每条记录在文件中的行号（从 1 开始，空行不计入记录但计入行号）。
	pub lines: Vec<usize>,
	/// 是否丢弃了末尾残行。
	pub torn_tail: bool,
}

/// append-only 记录文件写入器。
#[derive(Debug)]
pub(crate) struct RecordWriter {
	path: PathBuf,
	file: File,
	fsync: bool,
}

impl RecordWriter {
	/// 以 append 模式打开（不存在则创建）。
	pub fn open(path: impl AsRef<Path>, fsync: bool) -> Result<Self, QueueError> {
		let path = path.as_ref().to_path_buf();
		if let Some(parent) = path.parent() {
			if !parent.as_os_str().is_empty() {
				fs::create_dir_all(parent)?;
			}
		}
		let file = OpenOptions::new().create(true).append(true).open(&path)?;
		Ok(Self { path, file, fsync })
	}

	/// 追加一条记录，返回前保证已写出（fsync 开启时已落盘）。
	pub fn append<T: Serialize>(&mut self, record: &T) -> Result<(), QueueError> {
		self.append_with(record, |file, line| file.write_all(line))
	}

	fn append_with<T, W>(&mut self, record: &T, write: W) -> Result<(), QueueError>
	where
		T: Serialize,
		W: FnOnce(&mut File, &[u8]) -> std::io::Result<()>,
	{
		let mut line = serde_json::to_vec(record)?;
		line.push(b'\n');

		let start = self.file.metadata()?.len();
		let fsync = self.fsync;
		let result = write(&mut self.file, &line).and_then(|()| {
			if fsync {
				self.file.sync_data()
			} else {
				Ok(())
			}
		});

		if let Err(error) = result {
			if let Err(rollback) = self.file.set_len(start) {
				tracing::error!(
					path = %self.path.display(),
					%error,
					%rollback,
					"failed to roll back partial record"
				);
			} else {
				tracing::warn!(path = %self.path.display(), %error, "record write failed, partial bytes removed");
			}
			return Err(error.into());
		}
		Ok(())
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	pub fn fsync(&self) -> bool {
		self.fsync
	}
}

/// 顺序读取全部记录；文件不存在时返回空集合。
pub(crate) fn load_records<T: DeserializeOwned>(
	path: impl AsRef<Path>,
) -> Result<LoadedRecords<T>, QueueError> {
	let path = path.as_ref();
	let bytes = match fs::read(path) {
		Ok(bytes) => bytes,
		Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
			return Ok(LoadedRecords {
				records: Vec::new(),
				lines: Vec::new(),
				torn_tail: false,
			});
		}
		Err(error) => return Err(error.into()),
	};

	let complete_len = match bytes.iter().rposition(|b| *b == b'\n') {
		Some(pos) => pos + 1,
		None => 0,
	};
	let torn_tail = complete_len < bytes.len();
	if torn_tail {
		let file = OpenOptions::new().write(true).open(path)?;
		file.set_len(complete_len as u64)?;
		file.sync_data()?;
		tracing::warn!(
			path = %path.display(),
			discarded_bytes = bytes.len() - complete_len,
			"discarded unterminated tail record"
		);
	}

	let mut records = Vec::new();
	let mut lines = Vec::new();
	for (index, line) in bytes[..complete_len].split(|b| *b == b'\n').enumerate() {
		if line.iter().all(|b| b.is_ascii_whitespace()) {
			continue;
		}
		let record = serde_json::from_slice::<T>(line).map_err(|error| QueueError::Corruption {
			path: path.to_path_buf(),
			line: index + 1,
			reason: error.to_string(),
		})?;
		records.push(record);
		lines.push(index + 1);
	}

	Ok(LoadedRecords {
		records,
		lines,
		torn_tail,
	})
}

/// 以临时文件 + rename 的方式原子替换整个记录文件。
pub(crate) fn rewrite_records<'a, T, I>(path: &Path, records: I) -> Result<usize, QueueError>
where
	T: Serialize + 'a,
	I: IntoIterator<Item = &'a T>,
{
	let tmp = path.with_extension("tmp");
	let mut written = 0usize;
	{
		let file = File::create(&tmp)?;
		let mut writer = BufWriter::new(file);
		for record in records {
			serde_json::to_writer(&mut writer, record)?;
			writer.write_all(b"\n")?;
			written += 1;
		}
		writer.flush()?;
		writer.get_ref().sync_all()?;
	}
	fs::rename(&tmp, path)?;
	Ok(written)
}
