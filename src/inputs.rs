//! Sources of raw records.
//!
//! A source yields opaque byte records in a fixed order, each with an
//! [`Offset`]. After a restart the pipeline seeks it to the offset
//! stored in the checkpoint it resumes from, so records at or after
//! that offset are read again.
//!
//! Provided sources read from memory, a channel, a newline-delimited
//! file, or one Kafka topic partition.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::sync::mpsc;

use crate::errors::SourceError;

mod kafka_input;
pub use self::kafka_input::{KafkaSource, KafkaSourceConfig};

/// Position of a record in the input sequence.
#[derive(
    Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Offset(pub u64);

impl Offset {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRecord {
    pub offset: Offset,
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait Source: Send {
    /// Skip ahead so the next record returned has `offset`.
    ///
    /// Called once, before the first [`Source::next`]. A source that
    /// can't reach the offset must fail here; that aborts startup.
    async fn seek(&mut self, offset: Offset) -> Result<(), SourceError>;

    /// The next record, or `None` once a finite source is exhausted.
    ///
    /// Must be cancel safe: the runtime drops this future whenever a
    /// checkpoint or shutdown needs attention first.
    async fn next(&mut self) -> Result<Option<SourceRecord>, SourceError>;
}

/// Records from a list held in memory.
pub struct TestingSource {
    records: Vec<Vec<u8>>,
    position: usize,
}

impl TestingSource {
    pub fn new<I, R>(records: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<Vec<u8>>,
    {
        Self {
            records: records.into_iter().map(Into::into).collect(),
            position: 0,
        }
    }
}

#[async_trait]
impl Source for TestingSource {
    async fn seek(&mut self, offset: Offset) -> Result<(), SourceError> {
        let target = offset.0 as usize;
        if target > self.records.len() {
            return Err(SourceError::Seek {
                offset: offset.0,
                reason: format!("only {} records", self.records.len()),
            });
        }
        self.position = target;
        Ok(())
    }

    async fn next(&mut self) -> Result<Option<SourceRecord>, SourceError> {
        let found = self.records.get(self.position).map(|bytes| SourceRecord {
            offset: Offset(self.position as u64),
            bytes: bytes.clone(),
        });
        if found.is_some() {
            self.position += 1;
        }
        Ok(found)
    }
}

/// Records pushed by another task.
///
/// Offsets count records received on the channel, so a producer that
/// resends from the start of its stream after a restart lines up with
/// checkpoint offsets. Records before the seek offset are skipped.
/// The source ends when every sender is dropped.
pub struct ChannelSource {
    rx: mpsc::Receiver<Vec<u8>>,
    next_offset: Offset,
    skip_until: Offset,
}

impl ChannelSource {
    pub fn new(rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            rx,
            next_offset: Offset::default(),
            skip_until: Offset::default(),
        }
    }

    /// A source and the sender that feeds it.
    pub fn channel(capacity: usize) -> (mpsc::Sender<Vec<u8>>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self::new(rx))
    }
}

#[async_trait]
impl Source for ChannelSource {
    async fn seek(&mut self, offset: Offset) -> Result<(), SourceError> {
        self.skip_until = offset;
        Ok(())
    }

    async fn next(&mut self) -> Result<Option<SourceRecord>, SourceError> {
        while let Some(bytes) = self.rx.recv().await {
            let offset = self.next_offset;
            self.next_offset = offset.next();
            if offset >= self.skip_until {
                return Ok(Some(SourceRecord { offset, bytes }));
            }
        }
        Ok(None)
    }
}

/// Newline-delimited records from a file. Each line is one record
/// and its zero-based line number is its offset.
pub struct FileSource {
    lines: Lines<BufReader<File>>,
    next_offset: Offset,
}

impl FileSource {
    pub async fn open(path: &Path) -> Result<Self, SourceError> {
        let file = File::open(path)
            .await
            .map_err(|err| SourceError::Unreachable(format!("{}: {err}", path.display())))?;
        Ok(Self {
            lines: BufReader::new(file).lines(),
            next_offset: Offset::default(),
        })
    }
}

#[async_trait]
impl Source for FileSource {
    async fn seek(&mut self, offset: Offset) -> Result<(), SourceError> {
        while self.next_offset < offset {
            if self.lines.next_line().await?.is_none() {
                return Err(SourceError::Seek {
                    offset: offset.0,
                    reason: format!("file ends at line {}", self.next_offset.0),
                });
            }
            self.next_offset = self.next_offset.next();
        }
        Ok(())
    }

    async fn next(&mut self) -> Result<Option<SourceRecord>, SourceError> {
        // `next_line` is cancel safe, and the offset only moves once a
        // whole line is in hand.
        while let Some(line) = self.lines.next_line().await? {
            let offset = self.next_offset;
            self.next_offset = offset.next();
            if !line.trim().is_empty() {
                return Ok(Some(SourceRecord {
                    offset,
                    bytes: line.into_bytes(),
                }));
            }
        }
        Ok(None)
    }
}

#[tokio::test]
async fn testing_source_seeks() {
    let mut source = TestingSource::new(["a", "b", "c"]);
    source.seek(Offset(1)).await.unwrap();
    let first = source.next().await.unwrap().unwrap();
    assert_eq!(first.offset, Offset(1));
    assert_eq!(first.bytes, b"b".to_vec());
    assert_eq!(source.next().await.unwrap().unwrap().offset, Offset(2));
    assert_eq!(source.next().await.unwrap(), None);

    let mut source = TestingSource::new(["a"]);
    assert!(matches!(
        source.seek(Offset(5)).await,
        Err(SourceError::Seek { offset: 5, .. })
    ));
}

#[tokio::test]
async fn channel_source_skips_before_offset() {
    let (tx, mut source) = ChannelSource::channel(8);
    for record in ["r0", "r1", "r2"] {
        tx.send(record.as_bytes().to_vec()).await.unwrap();
    }
    drop(tx);

    source.seek(Offset(2)).await.unwrap();
    let found = source.next().await.unwrap().unwrap();
    assert_eq!(found.offset, Offset(2));
    assert_eq!(found.bytes, b"r2".to_vec());
    assert_eq!(source.next().await.unwrap(), None);
}

#[tokio::test]
async fn file_source_reads_lines() {
    use std::io::Write;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "{{\"n\":0}}").unwrap();
    writeln!(file).unwrap();
    writeln!(file, "{{\"n\":2}}").unwrap();
    writeln!(file, "{{\"n\":3}}").unwrap();
    file.flush().unwrap();

    let mut source = FileSource::open(file.path()).await.unwrap();
    source.seek(Offset(1)).await.unwrap();
    let found = source.next().await.unwrap().unwrap();
    // The blank line still takes up an offset.
    assert_eq!(found.offset, Offset(2));
    assert_eq!(found.bytes, br#"{"n":2}"#.to_vec());
    assert_eq!(source.next().await.unwrap().unwrap().offset, Offset(3));
    assert_eq!(source.next().await.unwrap(), None);
}

#[tokio::test]
async fn file_source_missing_file_is_unreachable() {
    let found = FileSource::open(Path::new("/definitely/not/here.jsonl")).await;
    assert!(matches!(found, Err(SourceError::Unreachable(_))));
}
