//! Append-only file byte stream with size-based splitting.
//!
//! Data goes to `path` until it would grow past `max_size`, then to
//! `path.1`, `path.2` and so on. Reads walk the splits in order from the
//! first one, so a reader sees exactly the concatenation of everything
//! written.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use super::{ByteConnector, ByteStream, Received, Result, Stream, StreamStats};

const READ_CHUNK: usize = 64 * 1024;

/// Path of split `index` (`0` is the base path itself).
pub fn split_path(base: &Path, index: u32) -> PathBuf {
    if index == 0 {
        return base.to_path_buf();
    }
    let mut name = OsString::from(base.as_os_str());
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

/// Every existing split of `base`, in order.
pub async fn existing_splits(base: &Path) -> Vec<PathBuf> {
    let mut splits = Vec::new();
    let mut index = 0;
    loop {
        let path = split_path(base, index);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return splits;
        }
        splits.push(path);
        index += 1;
    }
}

/// Delete `base` and all of its splits.
pub async fn remove_all(base: &Path) -> Result<()> {
    for path in existing_splits(base).await {
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

struct Writer {
    file: File,
    index: u32,
    size: u64,
}

struct Reader {
    file: File,
    index: u32,
}

pub struct FileStream {
    name: String,
    base: PathBuf,
    max_size: u64,
    writer: Option<Writer>,
    write_index: u32,
    reader: Option<Reader>,
    read_index: u32,
    buf: Vec<u8>,
    stats: StreamStats,
}

impl FileStream {
    /// Open the split set at `path`. `max_size == 0` disables splitting.
    ///
    /// Writes append to the last existing split; reads start at the first.
    pub async fn open(path: impl Into<PathBuf>, max_size: u64) -> Result<Self> {
        let base = path.into();
        if let Some(parent) = base.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let splits = existing_splits(&base).await;
        let write_index = splits.len().saturating_sub(1) as u32;
        let name = format!("file({})", base.display());
        debug!(path = %base.display(), splits = splits.len(), "Opened file stream");
        Ok(Self {
            stats: StreamStats::new(name.clone()),
            name,
            base,
            max_size,
            writer: None,
            write_index,
            reader: None,
            read_index: 0,
            buf: vec![0; READ_CHUNK],
        })
    }

    pub fn path(&self) -> &Path {
        &self.base
    }

    async fn open_writer(&mut self) -> Result<()> {
        let path = split_path(&self.base, self.write_index);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let size = file.metadata().await?.len();
        self.writer = Some(Writer {
            file,
            index: self.write_index,
            size,
        });
        Ok(())
    }

    async fn rotate(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.file.flush().await?;
            self.write_index = writer.index + 1;
        }
        info!(
            path = %self.base.display(),
            split = self.write_index,
            "Rotating to next file split"
        );
        self.open_writer().await
    }
}

#[async_trait]
impl Stream for FileStream {
    type Item = Bytes;

    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&mut self, _timeout: Duration) -> Result<Received<Bytes>> {
        loop {
            if self.reader.is_none() {
                let path = split_path(&self.base, self.read_index);
                match File::open(&path).await {
                    Ok(file) => {
                        self.reader = Some(Reader {
                            file,
                            index: self.read_index,
                        })
                    }
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        return Ok(Received::EndOfStream)
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            let Some(reader) = self.reader.as_mut() else {
                return Ok(Received::EndOfStream);
            };
            let n = reader.file.read(&mut self.buf).await?;
            if n > 0 {
                self.stats.record_in(n, 0);
                return Ok(Received::Item(Bytes::copy_from_slice(&self.buf[..n])));
            }
            // End of this split: move on only if a later one exists.
            let next = split_path(&self.base, reader.index + 1);
            if !fs::try_exists(&next).await.unwrap_or(false) {
                return Ok(Received::EndOfStream);
            }
            self.read_index = reader.index + 1;
            self.reader = None;
        }
    }

    async fn write(&mut self, item: Bytes) -> Result<()> {
        if self.writer.is_none() {
            self.open_writer().await?;
        }
        let needs_rotation = matches!(
            &self.writer,
            Some(w) if self.max_size > 0 && w.size > 0 && w.size + item.len() as u64 > self.max_size
        );
        if needs_rotation {
            self.rotate().await?;
        }
        if let Some(writer) = self.writer.as_mut() {
            writer.file.write_all(&item).await?;
            writer.size += item.len() as u64;
            self.stats.record_out(item.len(), 0);
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.file.flush().await?;
            writer.file.sync_data().await?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.flush().await?;
        self.writer = None;
        self.reader = None;
        Ok(())
    }

    fn statistics(&self) -> StreamStats {
        self.stats.clone()
    }
}

/// Opens the split set at a fixed path.
pub struct FileConnector {
    name: String,
    path: PathBuf,
    max_size: u64,
}

impl FileConnector {
    pub fn new(path: impl Into<PathBuf>, max_size: u64) -> Self {
        let path = path.into();
        Self {
            name: format!("file://{}", path.display()),
            path,
            max_size,
        }
    }
}

#[async_trait]
impl ByteConnector for FileConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self) -> Result<ByteStream> {
        Ok(Box::new(FileStream::open(&self.path, self.max_size).await?))
    }
}
