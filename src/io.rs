//! Binary entity files: a forward-only read cursor and a streaming writer.
//!
//! Each record is a kind byte followed by a length-prefixed payload. All
//! integers are big-endian. A file ends cleanly at a record boundary; end of
//! input inside a record is a format error.

use bytes::{BufMut, BytesMut};
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use crate::error::{GeoshardError, Result};
use crate::model::{DataSet, Entity, EntityType, Member, Node, Relation, Way};

const RECORD_NODE: u8 = 0;
const RECORD_WAY: u8 = 1;
const RECORD_RELATION: u8 = 2;

const SCRATCH_INITIAL_CAPACITY: usize = 8 * 1024;
const SCRATCH_SHRINK_THRESHOLD: usize = 1 << 20;

/// Streaming entity writer.
///
/// Entities may be written in any order; the writer imposes none. Call
/// [`EntityWriter::finish`] to flush; dropping without finishing flushes on
/// a best-effort basis.
pub struct EntityWriter<W: Write> {
    writer: W,
    scratch: BytesMut,
    count: u64,
}

impl EntityWriter<BufWriter<File>> {
    /// Create an entity file at `path`, truncating any existing file.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> EntityWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            scratch: BytesMut::with_capacity(SCRATCH_INITIAL_CAPACITY),
            count: 0,
        }
    }

    /// Number of entities written so far.
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn write(&mut self, entity: &Entity) -> Result<()> {
        match entity {
            Entity::Node(n) => self.write_node(n),
            Entity::Way(w) => self.write_way(w),
            Entity::Relation(r) => self.write_relation(r),
        }
    }

    pub fn write_node(&mut self, node: &Node) -> Result<()> {
        self.scratch.clear();
        self.scratch.put_u8(RECORD_NODE);
        self.scratch.put_i64(node.id);
        self.scratch.put_f64(node.lon);
        self.scratch.put_f64(node.lat);
        put_tags(&mut self.scratch, &node.tags);
        self.flush_scratch()
    }

    pub fn write_way(&mut self, way: &Way) -> Result<()> {
        self.scratch.clear();
        self.scratch.put_u8(RECORD_WAY);
        self.scratch.put_i64(way.id);
        self.scratch.put_u32(way.node_refs.len() as u32);
        for id in &way.node_refs {
            self.scratch.put_i64(*id);
        }
        put_tags(&mut self.scratch, &way.tags);
        self.flush_scratch()
    }

    pub fn write_relation(&mut self, relation: &Relation) -> Result<()> {
        self.scratch.clear();
        self.scratch.put_u8(RECORD_RELATION);
        self.scratch.put_i64(relation.id);
        self.scratch.put_u32(relation.members.len() as u32);
        for member in &relation.members {
            self.scratch.put_u8(member.mtype.rank());
            self.scratch.put_i64(member.id);
            put_string(&mut self.scratch, &member.role);
        }
        put_tags(&mut self.scratch, &relation.tags);
        self.flush_scratch()
    }

    fn flush_scratch(&mut self) -> Result<()> {
        self.writer.write_all(&self.scratch)?;
        self.count += 1;

        if self.scratch.capacity() > SCRATCH_SHRINK_THRESHOLD
            && self.scratch.len() <= SCRATCH_INITIAL_CAPACITY
        {
            self.scratch = BytesMut::with_capacity(SCRATCH_INITIAL_CAPACITY);
        }
        Ok(())
    }

    /// Flush buffered records, completing the file.
    pub fn finish(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

impl<W: Write> Drop for EntityWriter<W> {
    fn drop(&mut self) {
        // Best effort flush on drop, ignore errors
        let _ = self.writer.flush();
    }
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put(s.as_bytes());
}

fn put_tags(buf: &mut BytesMut, tags: &[(String, String)]) {
    buf.put_u32(tags.len() as u32);
    for (key, value) in tags {
        put_string(buf, key);
        put_string(buf, value);
    }
}

/// Forward-only cursor over an entity file, yielding entities in file order.
pub struct EntityReader<R: Read> {
    reader: R,
}

impl EntityReader<BufReader<File>> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: Read> EntityReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// The next entity in file order, or `None` at a clean end of file.
    pub fn next_entity(&mut self) -> Result<Option<Entity>> {
        let mut kind = [0u8; 1];
        match self.reader.read_exact(&mut kind) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let entity = match kind[0] {
            RECORD_NODE => {
                let id = self.read_i64()?;
                let lon = self.read_f64()?;
                let lat = self.read_f64()?;
                let tags = self.read_tags()?;
                Entity::Node(Node { id, lon, lat, tags })
            }
            RECORD_WAY => {
                let id = self.read_i64()?;
                let n = self.read_u32()? as usize;
                let mut node_refs = Vec::with_capacity(n);
                for _ in 0..n {
                    node_refs.push(self.read_i64()?);
                }
                let tags = self.read_tags()?;
                Entity::Way(Way {
                    id,
                    node_refs,
                    tags,
                })
            }
            RECORD_RELATION => {
                let id = self.read_i64()?;
                let n = self.read_u32()? as usize;
                let mut members = Vec::with_capacity(n);
                for _ in 0..n {
                    let mtype = match self.read_u8()? {
                        0 => EntityType::Node,
                        1 => EntityType::Way,
                        2 => EntityType::Relation,
                        _ => return Err(GeoshardError::InvalidFormat),
                    };
                    let id = self.read_i64()?;
                    let role = self.read_string()?;
                    members.push(Member { mtype, id, role });
                }
                let tags = self.read_tags()?;
                Entity::Relation(Relation { id, members, tags })
            }
            _ => return Err(GeoshardError::InvalidFormat),
        };

        Ok(Some(entity))
    }

    fn read_exact_or_eof(&mut self, buf: &mut [u8]) -> Result<()> {
        self.reader.read_exact(buf).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                GeoshardError::UnexpectedEof
            } else {
                GeoshardError::from(e)
            }
        })
    }

    fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact_or_eof(&mut buf)?;
        Ok(buf[0])
    }

    fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact_or_eof(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    fn read_i64(&mut self) -> Result<i64> {
        let mut buf = [0u8; 8];
        self.read_exact_or_eof(&mut buf)?;
        Ok(i64::from_be_bytes(buf))
    }

    fn read_f64(&mut self) -> Result<f64> {
        let mut buf = [0u8; 8];
        self.read_exact_or_eof(&mut buf)?;
        Ok(f64::from_be_bytes(buf))
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let mut buf = vec![0u8; len];
        self.read_exact_or_eof(&mut buf)?;
        String::from_utf8(buf).map_err(|_| GeoshardError::InvalidFormat)
    }

    fn read_tags(&mut self) -> Result<Vec<(String, String)>> {
        let n = self.read_u32()? as usize;
        let mut tags = Vec::with_capacity(n);
        for _ in 0..n {
            let key = self.read_string()?;
            let value = self.read_string()?;
            tags.push((key, value));
        }
        Ok(tags)
    }
}

/// Load a full entity file into memory.
pub fn read_dataset<P: AsRef<Path>>(path: P) -> Result<DataSet> {
    let mut reader = EntityReader::open(path)?;
    DataSet::read_from(&mut reader)
}

/// Write a dataset to `path`, nodes then ways then relations, each kind in
/// ascending id order. This is the ordering contract the merge stage
/// requires of intermediate files.
pub fn write_dataset_sorted<P: AsRef<Path>>(path: P, data: &DataSet) -> Result<()> {
    let mut writer = EntityWriter::create(path)?;
    for node in data.nodes.values() {
        writer.write_node(node)?;
    }
    for way in data.ways.values() {
        writer.write_way(way)?;
    }
    for relation in data.relations.values() {
        writer.write_relation(relation)?;
    }
    writer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn tagged_node() -> Node {
        let mut node = Node::new(42, 13.377, 52.516);
        node.tags.push(("name".to_string(), "Brandenburg Gate".to_string()));
        node
    }

    #[test]
    fn test_write_read_all_kinds() {
        let tmp = NamedTempFile::new().unwrap();

        let mut writer = EntityWriter::create(tmp.path()).unwrap();
        writer.write_node(&tagged_node()).unwrap();
        writer.write_way(&Way::new(7, vec![42, 43, 42])).unwrap();
        writer
            .write_relation(&Relation::new(
                3,
                vec![
                    Member::new(EntityType::Way, 7, "outer"),
                    Member::new(EntityType::Relation, 9, "subarea"),
                ],
            ))
            .unwrap();
        writer.finish().unwrap();
        assert_eq!(writer.count(), 3);

        let mut reader = EntityReader::open(tmp.path()).unwrap();
        match reader.next_entity().unwrap().unwrap() {
            Entity::Node(n) => {
                assert_eq!(n.id, 42);
                assert_eq!(n.tags[0].1, "Brandenburg Gate");
            }
            other => panic!("expected node, got {other:?}"),
        }
        match reader.next_entity().unwrap().unwrap() {
            Entity::Way(w) => assert_eq!(w.node_refs, vec![42, 43, 42]),
            other => panic!("expected way, got {other:?}"),
        }
        match reader.next_entity().unwrap().unwrap() {
            Entity::Relation(r) => {
                assert_eq!(r.members.len(), 2);
                assert_eq!(r.members[1].mtype, EntityType::Relation);
            }
            other => panic!("expected relation, got {other:?}"),
        }
        assert!(reader.next_entity().unwrap().is_none());
    }

    #[test]
    fn test_truncated_record_is_an_error() {
        let tmp = NamedTempFile::new().unwrap();

        let mut writer = EntityWriter::create(tmp.path()).unwrap();
        writer.write_node(&tagged_node()).unwrap();
        writer.finish().unwrap();

        let len = std::fs::metadata(tmp.path()).unwrap().len();
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(tmp.path())
            .unwrap();
        file.set_len(len - 3).unwrap();

        let mut reader = EntityReader::open(tmp.path()).unwrap();
        match reader.next_entity() {
            Err(GeoshardError::UnexpectedEof) => {}
            other => panic!("expected UnexpectedEof, got {other:?}"),
        }
    }

    #[test]
    fn test_sorted_dataset_write() {
        let tmp = NamedTempFile::new().unwrap();

        let mut data = DataSet::new();
        data.insert(Entity::Way(Way::new(2, vec![1])));
        data.insert(Entity::Node(Node::new(9, 0.0, 0.0)));
        data.insert(Entity::Node(Node::new(1, 0.0, 0.0)));
        write_dataset_sorted(tmp.path(), &data).unwrap();

        let mut reader = EntityReader::open(tmp.path()).unwrap();
        let mut keys = Vec::new();
        while let Some(entity) = reader.next_entity().unwrap() {
            keys.push(entity.sort_key());
        }
        assert_eq!(keys, vec![(0, 1), (0, 9), (1, 2)]);
    }
}
