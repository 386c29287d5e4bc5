//! Termination reasons and the test cases emitted for terminated states.

use crate::path::PathEntry;
use crate::state::StateId;
use byteorder::{LittleEndian, WriteBytesExt};
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use strum::{EnumString, IntoStaticStr, VariantNames};

/// Error classes carried in termination records.
#[derive(Clone, Copy, Debug, Eq, PartialEq, EnumString, IntoStaticStr, VariantNames)]
#[strum(serialize_all = "kebab-case")]
pub enum TerminationKind {
    /// The program executed an abort-like intrinsic.
    Abort,
    /// Assertion failure in the program.
    Assert,
    /// Out-of-bounds vector element access.
    BadVectorAccess,
    /// Unexecutable or unexpected instruction.
    Exec,
    /// Disallowed or failed external call.
    External,
    /// Invalid free.
    Free,
    /// The engine's modeling limit was reached.
    Model,
    /// Checked arithmetic overflowed.
    Overflow,
    /// Invalid pointer or out-of-bounds access.
    Ptr,
    /// Write to a read-only object.
    ReadOnly,
    /// Explicit program-level error report.
    ReportError,
    /// Misuse of an engine API from the program.
    User,
    /// Unmodeled feature.
    Unhandled,
    /// Replay diverged from the recorded stream.
    ReplayPath,
}

impl fmt::Display for TerminationKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s: &'static str = self.into();
        write!(f, "{}", s)
    }
}

#[derive(Clone, Debug)]
pub enum ExitReason {
    /// Normal program exit.
    Exit { code: u64 },
    /// Deliberate truncation of the path (halt, budget, timeout).
    Early(String),
    /// One of the taxonomy errors.
    Error {
        kind: TerminationKind,
        message: String,
    },
}

impl ExitReason {
    pub fn kind(&self) -> Option<TerminationKind> {
        match self {
            ExitReason::Error { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExitReason::Exit { code } => write!(f, "exit({})", code),
            ExitReason::Early(msg) => write!(f, "early: {}", msg),
            ExitReason::Error { kind, message } => write!(f, "{}: {}", kind, message),
        }
    }
}

/// Everything recorded for one terminated state: the solver witness per
/// symbolic object, the exit reason, and the per-state streams.
#[derive(Clone, Debug)]
pub struct TestCase {
    pub state_id: StateId,
    pub objects: Vec<(String, Vec<u8>)>,
    pub reason: ExitReason,
    pub path: Vec<PathEntry>,
    pub sym_path: String,
    pub stack_trace: String,
    pub constraints: String,
    pub stats: String,
}

impl TestCase {
    /// Serializes the witness objects: magic, object count, then
    /// length-prefixed name/byte pairs, little-endian throughout.
    pub fn serialize_objects(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"GTEST01");
        out.write_u32::<LittleEndian>(self.objects.len() as u32)
            .unwrap();
        for (name, bytes) in &self.objects {
            out.write_u16::<LittleEndian>(name.len() as u16).unwrap();
            out.extend_from_slice(name.as_bytes());
            out.write_u32::<LittleEndian>(bytes.len() as u32).unwrap();
            out.extend_from_slice(bytes);
        }
        out
    }

    /// Writes the test case and its streams under `dir` as
    /// `testNNNNNN.*` files.
    pub fn write_to_dir(&self, dir: &Path, index: usize) -> io::Result<()> {
        let base = dir.join(format!("test{:06}", index));
        let mut main = fs::File::create(base.with_extension("gt"))?;
        main.write_all(&self.serialize_objects())?;
        writeln!(main, "\nreason: {}", self.reason)?;

        let mut path_bytes = Vec::new();
        for entry in &self.path {
            entry.write_to(&mut path_bytes)?;
        }
        fs::write(base.with_extension("path"), path_bytes)?;
        fs::write(base.with_extension("sympath"), &self.sym_path)?;
        fs::write(base.with_extension("stack"), &self.stack_trace)?;
        fs::write(base.with_extension("constraints"), &self.constraints)?;
        fs::write(base.with_extension("stats"), &self.stats)?;
        Ok(())
    }
}
