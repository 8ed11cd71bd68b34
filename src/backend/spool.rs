//! On-disk spool holding batches that failed to flush remotely.
//!
//! One append-only file per backend, shared across databases. Each record is
//! self-describing so the drain worker can replay writes without re-parsing
//! the original request:
//!
//! ```text
//! [len: u32 BE, includes this field] [precision: u8] [db_len: u16 BE] [db] [payload]
//! ```
//!
//! A trailing record whose length exceeds the remaining bytes is a torn
//! write: it is ignored on read and truncated away by the next successful
//! drain pass.

use crate::line::Precision;
use crate::Result;
use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::warn;

const HEADER_LEN: usize = 4 + 1 + 2;

/// One spooled batch: the database it belongs to, the precision to replay
/// with, and the newline-separated payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpoolRecord {
    pub precision: Precision,
    pub db: String,
    pub payload: Bytes,
}

/// Encode a record into its on-disk form.
pub fn encode_record(record: &SpoolRecord) -> Bytes {
    let total = HEADER_LEN + record.db.len() + record.payload.len();
    let mut buf = BytesMut::with_capacity(total);
    buf.put_u32(total as u32);
    buf.put_u8(record.precision.tag());
    buf.put_u16(record.db.len() as u16);
    buf.put_slice(record.db.as_bytes());
    buf.put_slice(&record.payload);
    buf.freeze()
}

/// Decode one record from the head of `buf`, returning it with its encoded
/// length. `None` means the remaining bytes are a torn or corrupt tail.
pub fn decode_record(buf: &[u8]) -> Option<(SpoolRecord, usize)> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    let total = u32::from_be_bytes(buf[..4].try_into().ok()?) as usize;
    if total < HEADER_LEN || buf.len() < total {
        return None;
    }
    let precision = Precision::from_tag(buf[4])?;
    let db_len = u16::from_be_bytes(buf[5..7].try_into().ok()?) as usize;
    if HEADER_LEN + db_len > total {
        return None;
    }
    let db = std::str::from_utf8(&buf[HEADER_LEN..HEADER_LEN + db_len]).ok()?;
    let payload = Bytes::copy_from_slice(&buf[HEADER_LEN + db_len..total]);
    Some((
        SpoolRecord {
            precision,
            db: db.to_string(),
            payload,
        },
        total,
    ))
}

/// The spool file for one backend. All operations go through the owning
/// backend's spool lock, so the handle itself carries no state beyond the
/// path.
#[derive(Debug)]
pub struct Spool {
    path: PathBuf,
}

impl Spool {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Append one encoded record.
    pub async fn append(&self, record: &SpoolRecord) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&encode_record(record)).await?;
        file.flush().await?;
        Ok(())
    }

    /// Current file size in bytes; a missing file reads as empty.
    pub async fn size(&self) -> Result<u64> {
        match tokio::fs::metadata(&self.path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Read every well-formed record from the head of the file. A torn or
    /// corrupt tail ends the scan.
    pub async fn read_all(&self) -> Result<Vec<SpoolRecord>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();
        let mut offset = 0;
        while offset < bytes.len() {
            match decode_record(&bytes[offset..]) {
                Some((record, len)) => {
                    records.push(record);
                    offset += len;
                }
                None => {
                    warn!(
                        path = %self.path.display(),
                        records = records.len(),
                        "torn spool tail, ignoring remaining bytes"
                    );
                    break;
                }
            }
        }
        Ok(records)
    }

    /// Replace the file contents with the given records, dropping any torn
    /// tail in the process.
    pub async fn rewrite(&self, records: &[SpoolRecord]) -> Result<()> {
        let mut buf = BytesMut::new();
        for record in records {
            buf.put_slice(&encode_record(record));
        }
        tokio::fs::write(&self.path, &buf).await?;
        Ok(())
    }

    /// Truncate the file to zero length.
    pub async fn truncate(&self) -> Result<()> {
        tokio::fs::write(&self.path, b"").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(db: &str, payload: &str) -> SpoolRecord {
        SpoolRecord {
            precision: Precision::Ns,
            db: db.to_string(),
            payload: Bytes::copy_from_slice(payload.as_bytes()),
        }
    }

    #[test]
    fn encode_decode_roundtrip() {
        let original = record("metrics", "cpu value=1 1000000000\n");
        let encoded = encode_record(&original);
        let (decoded, len) = decode_record(&encoded).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(len, encoded.len());
        assert_eq!(encode_record(&decoded), encoded);
    }

    #[test]
    fn short_buffer_is_torn() {
        let encoded = encode_record(&record("db", "cpu value=1 1\n"));
        for cut in [0, 3, HEADER_LEN, encoded.len() - 1] {
            assert!(decode_record(&encoded[..cut]).is_none(), "cut at {cut}");
        }
    }

    #[test]
    fn unknown_precision_tag_is_corrupt() {
        let mut encoded = encode_record(&record("db", "cpu value=1 1\n")).to_vec();
        encoded[4] = 0xFF;
        assert!(decode_record(&encoded).is_none());
    }

    #[tokio::test]
    async fn append_then_read_preserves_fifo_order() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::new(dir.path().join("b1.dat"));

        let first = record("db", "cpu value=1 1\n");
        let second = record("db", "cpu value=2 2\n");
        spool.append(&first).await.unwrap();
        spool.append(&second).await.unwrap();

        let records = spool.read_all().await.unwrap();
        assert_eq!(records, vec![first, second]);
    }

    #[tokio::test]
    async fn torn_tail_is_ignored() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::new(dir.path().join("b1.dat"));

        let whole = record("db", "cpu value=1 1\n");
        spool.append(&whole).await.unwrap();

        // Simulate a crash mid-append: only half of the second record lands.
        let torn = encode_record(&record("db", "cpu value=2 2\n"));
        let mut bytes = tokio::fs::read(dir.path().join("b1.dat")).await.unwrap();
        bytes.extend_from_slice(&torn[..torn.len() / 2]);
        tokio::fs::write(dir.path().join("b1.dat"), &bytes).await.unwrap();

        let records = spool.read_all().await.unwrap();
        assert_eq!(records, vec![whole]);
    }

    #[tokio::test]
    async fn rewrite_drops_consumed_records() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::new(dir.path().join("b1.dat"));

        let first = record("db", "cpu value=1 1\n");
        let second = record("db", "cpu value=2 2\n");
        spool.append(&first).await.unwrap();
        spool.append(&second).await.unwrap();

        spool.rewrite(std::slice::from_ref(&second)).await.unwrap();
        assert_eq!(spool.read_all().await.unwrap(), vec![second]);

        spool.truncate().await.unwrap();
        assert_eq!(spool.size().await.unwrap(), 0);
        assert!(spool.read_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_file_reads_as_empty() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::new(dir.path().join("absent.dat"));
        assert_eq!(spool.size().await.unwrap(), 0);
        assert!(spool.read_all().await.unwrap().is_empty());
    }
}
