//! Bbox index files: one `(id, bounding box, size)` record per relation
//! batch, persisted in flush order.
//!
//! Queries test batch envelopes against these records before paying the
//! cost of opening batch contents.

use bytes::{BufMut, BytesMut};
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use geo::Rect;

use crate::error::{GeoshardError, Result};
use crate::spatial::rect;

/// One batch index record: the batch id (lowest relation id in the batch),
/// its envelope, and the approximate number of entities behind it.
#[derive(Debug, Clone, PartialEq)]
pub struct IdBboxEntry {
    pub id: i64,
    pub bbox: Rect,
    pub size: u64,
}

impl IdBboxEntry {
    pub fn new(id: i64, bbox: Rect, size: u64) -> Self {
        Self { id, bbox, size }
    }
}

/// Append-only writer for a bbox index file.
pub struct IdBboxWriter {
    writer: BufWriter<File>,
    scratch: BytesMut,
}

impl IdBboxWriter {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            scratch: BytesMut::with_capacity(64),
        })
    }

    pub fn write(&mut self, entry: &IdBboxEntry) -> Result<()> {
        self.scratch.clear();
        self.scratch.put_i64(entry.id);
        self.scratch.put_f64(entry.bbox.min().x);
        self.scratch.put_f64(entry.bbox.min().y);
        self.scratch.put_f64(entry.bbox.max().x);
        self.scratch.put_f64(entry.bbox.max().y);
        self.scratch.put_u64(entry.size);
        self.writer.write_all(&self.scratch)?;
        Ok(())
    }

    pub fn finish(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

impl Drop for IdBboxWriter {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}

/// Read all entries of a bbox index file, in the order they were written.
pub fn read_entries<P: AsRef<Path>>(path: P) -> Result<Vec<IdBboxEntry>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut entries = Vec::new();

    loop {
        let mut buf = [0u8; 8 * 6];
        match reader.read_exact(&mut buf) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }

        let id = i64::from_be_bytes(buf[0..8].try_into().map_err(|_| GeoshardError::InvalidFormat)?);
        let lon_min = f64::from_be_bytes(buf[8..16].try_into().map_err(|_| GeoshardError::InvalidFormat)?);
        let lat_min = f64::from_be_bytes(buf[16..24].try_into().map_err(|_| GeoshardError::InvalidFormat)?);
        let lon_max = f64::from_be_bytes(buf[24..32].try_into().map_err(|_| GeoshardError::InvalidFormat)?);
        let lat_max = f64::from_be_bytes(buf[32..40].try_into().map_err(|_| GeoshardError::InvalidFormat)?);
        let size = u64::from_be_bytes(buf[40..48].try_into().map_err(|_| GeoshardError::InvalidFormat)?);

        entries.push(IdBboxEntry::new(
            id,
            rect(lon_min, lat_min, lon_max, lat_max),
            size,
        ));
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_round_trip_preserves_order() {
        let tmp = NamedTempFile::new().unwrap();

        let entries = vec![
            IdBboxEntry::new(90, rect(0.0, 0.0, 2.0, 2.0), 140),
            IdBboxEntry::new(12, rect(-3.0, 1.0, 5.0, 4.0), 7),
        ];

        let mut writer = IdBboxWriter::create(tmp.path()).unwrap();
        for entry in &entries {
            writer.write(entry).unwrap();
        }
        writer.finish().unwrap();

        let read = read_entries(tmp.path()).unwrap();
        assert_eq!(read, entries);
    }

    #[test]
    fn test_empty_file() {
        let tmp = NamedTempFile::new().unwrap();
        IdBboxWriter::create(tmp.path()).unwrap().finish().unwrap();
        assert!(read_entries(tmp.path()).unwrap().is_empty());
    }
}
