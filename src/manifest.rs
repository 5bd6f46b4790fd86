//! Backup manifests: one record per file start and per block, in stream order.

use std::path::{Path, PathBuf};

use futures_util::Stream;
use tracing::debug;

use crate::block::{Signature, StrongHash};
use crate::dpth::Location;
use crate::error::{Error, Result};
use crate::records::{open_gzip, records, GzipRecordWriter, Record};

const CMD_FILE: u8 = b'A';
const CMD_BLOCK: u8 = b'S';

pub const MANIFEST_NAME: &str = "manifest.gz";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestEntry {
    File {
        file_index: u64,
        path: String,
    },
    Block {
        sig: Signature,
        /// Empty blocks have no storage.
        location: Option<Location>,
    },
}

impl ManifestEntry {
    fn to_record(&self) -> Record {
        match self {
            Self::File { file_index, path } => {
                Record::new(CMD_FILE, format!("{file_index} {path}"))
            }
            Self::Block { sig, location } => {
                let mut data = format!(
                    "{:016X}{}{:08X}",
                    sig.fingerprint,
                    sig.strong.to_hex(),
                    sig.length
                );
                if let Some(location) = location {
                    data.push_str(&location.to_string());
                }
                Record::new(CMD_BLOCK, data)
            }
        }
    }

    fn from_record(record: &Record) -> Result<Self> {
        let text = record.text()?;
        match record.cmd {
            CMD_FILE => {
                let (file_index, path) = text
                    .split_once(' ')
                    .ok_or_else(|| Error::record(format!("bad file record {text:?}")))?;
                let file_index = file_index
                    .parse()
                    .map_err(|_| Error::record(format!("bad file index {file_index:?}")))?;
                Ok(Self::File {
                    file_index,
                    path: path.to_owned(),
                })
            }
            CMD_BLOCK => parse_block(text),
            cmd => Err(Error::record(format!(
                "unexpected manifest record {:?}",
                cmd as char
            ))),
        }
    }
}

fn parse_block(text: &str) -> Result<ManifestEntry> {
    let bad = || Error::record(format!("bad block record {text:?}"));
    if text.len() < 16 + 64 + 8 || !text.is_ascii() {
        return Err(bad());
    }
    let fingerprint = u64::from_str_radix(&text[..16], 16).map_err(|_| bad())?;
    let strong = StrongHash::from_hex(&text[16..80]).ok_or_else(bad)?;
    let length = u32::from_str_radix(&text[80..88], 16).map_err(|_| bad())?;
    let location = match &text[88..] {
        "" => None,
        location => Some(location.parse()?),
    };
    Ok(ManifestEntry::Block {
        sig: Signature {
            fingerprint,
            strong,
            length,
        },
        location,
    })
}

pub async fn entries(path: &Path) -> Result<impl Stream<Item = Result<ManifestEntry>>> {
    let reader = open_gzip(path).await?;
    let records = records(reader);
    Ok(async_stream::try_stream! {
        for await record in records {
            yield ManifestEntry::from_record(&record?)?;
        }
    })
}

/// Writes a manifest as the session flushes completed blocks.
pub struct ManifestWriter {
    path: PathBuf,
    writer: GzipRecordWriter,
    entries: u64,
}

impl ManifestWriter {
    pub async fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let writer = GzipRecordWriter::create(&path).await?;
        Ok(Self {
            path,
            writer,
            entries: 0,
        })
    }

    pub async fn write(&mut self, entry: &ManifestEntry) -> Result<()> {
        let record = entry.to_record();
        self.writer.write(record.cmd, &record.data).await?;
        self.entries += 1;
        Ok(())
    }

    pub fn entries(&self) -> u64 {
        self.entries
    }

    pub async fn finish(self) -> Result<PathBuf> {
        self.writer.finish().await?;
        debug!(path = ?self.path, entries = self.entries, "manifest finished");
        Ok(self.path)
    }
}

#[cfg(test)]
mod tests {
    use std::pin::pin;

    use futures_util::StreamExt;

    use super::*;

    #[tokio::test]
    async fn manifest_entries_read_back_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let written = vec![
            ManifestEntry::File {
                file_index: 3,
                path: "home/user/notes with spaces.txt".into(),
            },
            ManifestEntry::Block {
                sig: Signature::of(0xF00D_0000_0000_BEEF, b"block one"),
                location: Some(Location::new(0, 1, 2)),
            },
            ManifestEntry::Block {
                sig: Signature::of(0, b""),
                location: None,
            },
        ];

        let mut writer = ManifestWriter::create(dir.path().join(MANIFEST_NAME))
            .await
            .unwrap();
        for entry in &written {
            writer.write(entry).await.unwrap();
        }
        assert_eq!(writer.entries(), 3);
        let path = writer.finish().await.unwrap();

        let mut read = vec![];
        let mut stream = pin!(entries(&path).await.unwrap());
        while let Some(entry) = stream.next().await {
            read.push(entry.unwrap());
        }
        assert_eq!(read, written);
    }

    #[test]
    fn rejects_malformed_blocks() {
        let short = Record::new(CMD_BLOCK, "0123");
        assert!(ManifestEntry::from_record(&short).is_err());

        let mut data = format!("{:016X}{}{:08X}", 1, StrongHash::of(b"a").to_hex(), 1);
        data.push_str("nope");
        let bad_location = Record::new(CMD_BLOCK, data);
        assert!(ManifestEntry::from_record(&bad_location).is_err());

        let unknown = Record::new(b'?', "");
        assert!(ManifestEntry::from_record(&unknown).is_err());
    }
}
