//! The line-oriented record format shared by manifests and the sparse index.
//!
//! Every record is a command byte, four upper-case hex digits giving the data
//! length, the data itself and a trailing newline.

use std::io;
use std::path::Path;

use async_compression::tokio::bufread::GzipDecoder;
use async_compression::tokio::write::GzipEncoder;
use futures_util::Stream;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::{Error, Result};

pub const MAX_RECORD_LEN: usize = 0xFFFF;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub cmd: u8,
    pub data: Vec<u8>,
}

impl Record {
    pub fn new(cmd: u8, data: impl Into<Vec<u8>>) -> Self {
        Self {
            cmd,
            data: data.into(),
        }
    }

    pub fn text(&self) -> Result<&str> {
        std::str::from_utf8(&self.data)
            .map_err(|_| Error::record(format!("record {:?} is not utf-8", self.cmd as char)))
    }
}

pub async fn write_record<W: AsyncWrite + Unpin>(writer: &mut W, cmd: u8, data: &[u8]) -> Result<()> {
    if data.len() > MAX_RECORD_LEN {
        return Err(Error::record(format!(
            "record {:?} is {} bytes long",
            cmd as char,
            data.len()
        )));
    }
    let header = format!("{}{:04X}", cmd as char, data.len());
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(data).await?;
    writer.write_all(b"\n").await?;
    Ok(())
}

/// Reads the next record, or `None` at a clean end of input.
pub async fn read_record<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Record>> {
    let cmd = match reader.read_u8().await {
        Ok(cmd) => cmd,
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    let mut len = [0; 4];
    reader.read_exact(&mut len).await?;
    let len = std::str::from_utf8(&len)
        .ok()
        .and_then(|len| usize::from_str_radix(len, 16).ok())
        .ok_or_else(|| Error::record(format!("bad length in record {:?}", cmd as char)))?;

    let mut data = vec![0; len];
    reader.read_exact(&mut data).await?;
    if reader.read_u8().await? != b'\n' {
        return Err(Error::record(format!(
            "record {:?} is not newline terminated",
            cmd as char
        )));
    }
    Ok(Some(Record { cmd, data }))
}

pub fn records<R: AsyncRead + Unpin>(mut reader: R) -> impl Stream<Item = Result<Record>> {
    async_stream::try_stream! {
        while let Some(record) = read_record(&mut reader).await? {
            yield record;
        }
    }
}

/// Opens a gzip-compressed record file, accepting concatenated gzip members.
pub async fn open_gzip(path: &Path) -> Result<BufReader<GzipDecoder<BufReader<File>>>> {
    let file = File::open(path).await?;
    let mut decoder = GzipDecoder::new(BufReader::new(file));
    decoder.multiple_members(true);
    Ok(BufReader::new(decoder))
}

/// Writes records into one gzip member.
pub struct GzipRecordWriter {
    encoder: GzipEncoder<File>,
}

impl GzipRecordWriter {
    pub async fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).await?;
        Ok(Self {
            encoder: GzipEncoder::new(file),
        })
    }

    /// Starts a new gzip member at the end of `path`.
    pub async fn append(path: &Path) -> Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            encoder: GzipEncoder::new(file),
        })
    }

    pub async fn write(&mut self, cmd: u8, data: &[u8]) -> Result<()> {
        write_record(&mut self.encoder, cmd, data).await
    }

    /// Finishes the gzip member and syncs the file to disk.
    pub async fn finish(mut self) -> Result<()> {
        self.encoder.shutdown().await?;
        self.encoder.into_inner().sync_all().await?;
        Ok(())
    }
}
