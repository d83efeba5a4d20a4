//! Loaded G-code programs and run requests.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// An ordered, 0-indexed sequence of G-code lines
///
/// The line content is immutable once loaded; `breakpoints` may change
/// between runs.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Program {
    /// File identifier (usually the path it was loaded from)
    pub file_id: String,
    /// Content fingerprint, see [`Program::compute_fingerprint`]
    pub fingerprint: String,
    /// G-code lines
    pub lines: Vec<String>,
    /// Breakpoint line indices
    #[serde(default)]
    pub breakpoints: BTreeSet<usize>,
}

impl Program {
    /// Create a program from lines
    pub fn new(file_id: impl Into<String>, lines: Vec<String>) -> Self {
        let file_id = file_id.into();
        let fingerprint = Self::compute_fingerprint(&file_id, &lines);
        Self {
            file_id,
            fingerprint,
            lines,
            breakpoints: BTreeSet::new(),
        }
    }

    /// Split `text` into a program, one entry per line
    pub fn from_text(file_id: impl Into<String>, text: &str) -> Self {
        let lines = text.lines().map(|line| format!("{}\n", line)).collect();
        Self::new(file_id, lines)
    }

    /// Set breakpoints, dropping indices outside the program
    pub fn with_breakpoints(mut self, breakpoints: impl IntoIterator<Item = usize>) -> Self {
        let len = self.lines.len();
        self.breakpoints = breakpoints.into_iter().filter(|&bp| bp < len).collect();
        self
    }

    /// Number of lines
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// True if the program has no lines
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Line at `pc`
    pub fn line(&self, pc: usize) -> Option<&str> {
        self.lines.get(pc).map(String::as_str)
    }

    /// SHA-256 over the file id and every line, hex encoded
    ///
    /// Used to detect whether a program needs to be re-sent over a remote
    /// link, so it must be stable across processes.
    pub fn compute_fingerprint(file_id: &str, lines: &[String]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(file_id.as_bytes());
        hasher.update([0u8]);
        for line in lines {
            hasher.update(line.as_bytes());
            hasher.update([0u8]);
        }
        hasher
            .finalize()
            .iter()
            .map(|byte| format!("{:02x}", byte))
            .collect()
    }
}

/// Arguments of RUN and STEP
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunRequest {
    /// Fingerprint of the program the caller wants to run
    pub fingerprint: String,
    /// Program content; omitted when the receiver already holds this fingerprint
    pub program: Option<Program>,
    /// Starting PC; `None` continues from the current PC
    pub pc: Option<usize>,
    /// Breakpoint set for this run
    pub breakpoints: BTreeSet<usize>,
}

impl RunRequest {
    /// Request carrying the full program
    pub fn with_program(program: Program, pc: Option<usize>) -> Self {
        Self {
            fingerprint: program.fingerprint.clone(),
            breakpoints: program.breakpoints.clone(),
            program: Some(program),
            pc,
        }
    }

    /// Request without program content
    pub fn without_content(mut self) -> Self {
        self.program = None;
        self
    }
}
