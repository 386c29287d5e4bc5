//! Path-entry streams: the ordered log of every non-deterministic decision
//! a state makes, the replay cursor that consumes it, and the test case
//! emitted when a state terminates.
//!
//! The wire format is little-endian, append-only, and round-trips through
//! replay byte-for-byte.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::trace;
use std::io::{self, Read, Write};
use std::rc::Rc;

const TAG_FORK: u8 = 0;
const TAG_INDIRECTBR: u8 = 1;
const TAG_SWITCH_CASE: u8 = 2;
const TAG_SWITCH_BLOCK: u8 = 3;
const TAG_SCHEDULE: u8 = 4;
const TAG_DATA_REC: u8 = 5;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PathEntry {
    /// Two-way branch decision.
    Fork { taken: bool },
    /// Index into the deduplicated successor list of an indirect branch.
    IndirectBr { target: u16 },
    /// Concrete switch landing on a specific case.
    SwitchCase { case: u16 },
    /// Symbolic switch narrowed to a successor block.
    SwitchBlock { block: u16 },
    /// Context switch to a thread.
    Schedule { thread: u64 },
    /// A concretized intermediate value, identified by its recording site.
    DataRec {
        id: String,
        width: u16,
        bytes: Vec<u8>,
    },
}

impl PathEntry {
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        match self {
            PathEntry::Fork { taken } => {
                w.write_u8(TAG_FORK)?;
                w.write_u8(u8::from(*taken))
            }
            PathEntry::IndirectBr { target } => {
                w.write_u8(TAG_INDIRECTBR)?;
                w.write_u16::<LittleEndian>(*target)
            }
            PathEntry::SwitchCase { case } => {
                w.write_u8(TAG_SWITCH_CASE)?;
                w.write_u16::<LittleEndian>(*case)
            }
            PathEntry::SwitchBlock { block } => {
                w.write_u8(TAG_SWITCH_BLOCK)?;
                w.write_u16::<LittleEndian>(*block)
            }
            PathEntry::Schedule { thread } => {
                w.write_u8(TAG_SCHEDULE)?;
                w.write_u64::<LittleEndian>(*thread)
            }
            PathEntry::DataRec { id, width, bytes } => {
                w.write_u8(TAG_DATA_REC)?;
                w.write_u16::<LittleEndian>(id.len() as u16)?;
                w.write_all(id.as_bytes())?;
                w.write_u16::<LittleEndian>(*width)?;
                w.write_u16::<LittleEndian>(bytes.len() as u16)?;
                w.write_all(bytes)
            }
        }
    }

    /// Reads one entry; `Ok(None)` on a clean end of stream.
    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Option<PathEntry>> {
        let tag = match r.read_u8() {
            Ok(t) => t,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        };
        let entry = match tag {
            TAG_FORK => PathEntry::Fork {
                taken: r.read_u8()? != 0,
            },
            TAG_INDIRECTBR => PathEntry::IndirectBr {
                target: r.read_u16::<LittleEndian>()?,
            },
            TAG_SWITCH_CASE => PathEntry::SwitchCase {
                case: r.read_u16::<LittleEndian>()?,
            },
            TAG_SWITCH_BLOCK => PathEntry::SwitchBlock {
                block: r.read_u16::<LittleEndian>()?,
            },
            TAG_SCHEDULE => PathEntry::Schedule {
                thread: r.read_u64::<LittleEndian>()?,
            },
            TAG_DATA_REC => {
                let id_len = r.read_u16::<LittleEndian>()? as usize;
                let mut id = vec![0; id_len];
                r.read_exact(&mut id)?;
                let width = r.read_u16::<LittleEndian>()?;
                let len = r.read_u16::<LittleEndian>()? as usize;
                let mut bytes = vec![0; len];
                r.read_exact(&mut bytes)?;
                PathEntry::DataRec {
                    id: String::from_utf8_lossy(&id).into_owned(),
                    width,
                    bytes,
                }
            }
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown path entry tag {}", other),
                ))
            }
        };
        Ok(Some(entry))
    }
}

/// Per-state append-only record stream.
#[derive(Clone, Default)]
pub struct PathRecorder {
    entries: Vec<PathEntry>,
}

impl PathRecorder {
    pub fn record(&mut self, entry: PathEntry) {
        trace!("path record: {:?}", entry);
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[PathEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for entry in &self.entries {
            entry.write_to(&mut out).expect("vector writes cannot fail");
        }
        out
    }
}

pub fn parse_stream(bytes: &[u8]) -> io::Result<Vec<PathEntry>> {
    let mut cursor = io::Cursor::new(bytes);
    let mut entries = Vec::new();
    while let Some(entry) = PathEntry::read_from(&mut cursor)? {
        entries.push(entry);
    }
    Ok(entries)
}

/// Shared, positioned view over a recorded stream.
#[derive(Clone)]
pub struct ReplayCursor {
    entries: Rc<Vec<PathEntry>>,
    position: usize,
}

impl ReplayCursor {
    pub fn new(entries: Vec<PathEntry>) -> Self {
        Self {
            entries: Rc::new(entries),
            position: 0,
        }
    }

    pub fn next(&mut self) -> Option<PathEntry> {
        let entry = self.entries.get(self.position)?.clone();
        self.position += 1;
        Some(entry)
    }

    pub fn remaining(&self) -> usize {
        self.entries.len() - self.position
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_round_trips_byte_for_byte() {
        let mut recorder = PathRecorder::default();
        recorder.record(PathEntry::Fork { taken: true });
        recorder.record(PathEntry::Schedule { thread: 2 });
        recorder.record(PathEntry::IndirectBr { target: 1 });
        recorder.record(PathEntry::SwitchCase { case: 3 });
        recorder.record(PathEntry::SwitchBlock { block: 7 });
        recorder.record(PathEntry::DataRec {
            id: "f0.b1.i2".into(),
            width: 32,
            bytes: vec![0xde, 0xad, 0xbe, 0xef],
        });
        recorder.record(PathEntry::Fork { taken: false });

        let bytes = recorder.serialize();
        let parsed = parse_stream(&bytes).unwrap();
        assert_eq!(parsed, recorder.entries());

        let mut again = PathRecorder::default();
        for entry in parsed {
            again.record(entry);
        }
        assert_eq!(again.serialize(), bytes);
    }

    #[test]
    fn truncated_streams_error() {
        let mut recorder = PathRecorder::default();
        recorder.record(PathEntry::Schedule { thread: 1 });
        let mut bytes = recorder.serialize();
        bytes.pop();
        assert!(parse_stream(&bytes).is_err());
    }
}
