//! Coverage bit vectors and the line-oriented `.tr` trace file.
//!
//! The file is text, one record type per line prefix:
//!
//! ```text
//! 3 <method_count> <object_type_code> <type_name_list>
//! 1 "<method_signature>" <highest_id>
//! 2 <hex_byte_pair> ... (20 pairs per line, continuations also begin "2 ")
//! ```
//!
//! The writer pads each bit vector up to a byte boundary; the reader ignores
//! the padding bits.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use thiserror::Error;

const PAIRS_PER_LINE: usize = 20;

#[derive(Debug, Error)]
pub enum TraceFileError {
    #[error("trace i/o on {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("malformed trace file at line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("coverage id {id} outside [1, {width}]")]
    IdOutOfRange { id: u32, width: u32 },
}

/// A method's coverage bits. Width is the highest entity id; only positions
/// `[1, width]` are legal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverageTrace {
    width: u32,
    bytes: Vec<u8>,
}

impl CoverageTrace {
    pub fn new(width: u32) -> Self {
        CoverageTrace {
            width,
            bytes: vec![0; width.div_ceil(8) as usize],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Set the bit for a 1-based entity id.
    pub fn set(&mut self, id: u32) -> Result<(), TraceFileError> {
        if id == 0 || id > self.width {
            return Err(TraceFileError::IdOutOfRange {
                id,
                width: self.width,
            });
        }
        let bit = id - 1;
        self.bytes[(bit / 8) as usize] |= 0x80 >> (bit % 8);
        Ok(())
    }

    pub fn get(&self, id: u32) -> bool {
        if id == 0 || id > self.width {
            return false;
        }
        let bit = id - 1;
        self.bytes[(bit / 8) as usize] & (0x80 >> (bit % 8)) != 0
    }

    pub fn count_set(&self) -> u32 {
        (1..=self.width).filter(|&id| self.get(id)).count() as u32
    }

    /// Bitwise-OR merge. Widths may disagree across appended runs; the wider
    /// one wins.
    pub fn merge(&mut self, other: &CoverageTrace) {
        if other.width > self.width {
            self.width = other.width;
            self.bytes.resize(other.bytes.len(), 0);
        }
        for (o, i) in self.bytes.iter_mut().zip(&other.bytes) {
            *o |= i;
        }
    }
}

/// A whole trace file: typed header plus one coverage trace per method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFile {
    pub object_type_code: i32,
    pub type_names: Vec<String>,
    pub methods: BTreeMap<String, CoverageTrace>,
}

impl TraceFile {
    pub fn new(object_type_code: i32, type_names: Vec<String>) -> Self {
        TraceFile {
            object_type_code,
            type_names,
            methods: BTreeMap::new(),
        }
    }

    /// The method's trace, created at `width` on first sight.
    pub fn trace_mut(&mut self, signature: &str, width: u32) -> &mut CoverageTrace {
        self.methods
            .entry(signature.to_owned())
            .or_insert_with(|| CoverageTrace::new(width))
    }

    /// OR-merge another file into this one (append mode).
    pub fn merge(&mut self, other: TraceFile) {
        for (signature, trace) in other.methods {
            match self.methods.get_mut(&signature) {
                Some(existing) => existing.merge(&trace),
                None => {
                    self.methods.insert(signature, trace);
                }
            }
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "3 {} {} {}",
            self.methods.len(),
            self.object_type_code,
            self.type_names.join(" ")
        );
        for (signature, trace) in &self.methods {
            let _ = writeln!(out, "1 \"{}\" {}", signature, trace.width());
            for chunk in trace.bytes().chunks(PAIRS_PER_LINE) {
                let pairs: Vec<String> = chunk.iter().map(|b| format!("{b:02X}")).collect();
                let _ = writeln!(out, "2 {}", pairs.join(" "));
            }
            if trace.bytes().is_empty() {
                let _ = writeln!(out, "2 ");
            }
        }
        out
    }

    pub fn parse(text: &str) -> Result<Self, TraceFileError> {
        let mut file: Option<TraceFile> = None;
        let mut current: Option<(String, u32, Vec<u8>)> = None;

        let commit = |file: &mut TraceFile, current: &mut Option<(String, u32, Vec<u8>)>| {
            if let Some((signature, width, mut bytes)) = current.take() {
                let mut trace = CoverageTrace::new(width);
                bytes.resize(trace.bytes.len(), 0);
                trace.bytes = bytes;
                mask_padding(&mut trace);
                file.methods.insert(signature, trace);
            }
        };

        for (idx, line) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            let (tag, rest) = line.split_at(1);
            let rest = rest.trim_start();
            match tag {
                "3" => {
                    let mut parts = rest.split_whitespace();
                    let _method_count = parts.next().ok_or_else(|| malformed(line_no, "missing method count"))?;
                    let object_type_code: i32 = parts
                        .next()
                        .and_then(|v| v.parse().ok())
                        .ok_or_else(|| malformed(line_no, "missing object type code"))?;
                    let type_names = parts.map(|s| s.to_owned()).collect();
                    file = Some(TraceFile::new(object_type_code, type_names));
                }
                "1" => {
                    let file = file
                        .as_mut()
                        .ok_or_else(|| malformed(line_no, "method record before header"))?;
                    commit(file, &mut current);
                    let open = rest
                        .find('"')
                        .ok_or_else(|| malformed(line_no, "missing opening quote"))?;
                    let close = rest[open + 1..]
                        .rfind('"')
                        .map(|p| p + open + 1)
                        .ok_or_else(|| malformed(line_no, "missing closing quote"))?;
                    let signature = rest[open + 1..close].to_owned();
                    let width: u32 = rest[close + 1..]
                        .trim()
                        .parse()
                        .map_err(|_| malformed(line_no, "bad highest id"))?;
                    current = Some((signature, width, Vec::new()));
                }
                "2" => {
                    let (_, _, bytes) = current
                        .as_mut()
                        .ok_or_else(|| malformed(line_no, "data record before method record"))?;
                    for pair in rest.split_whitespace() {
                        let byte = u8::from_str_radix(pair, 16)
                            .map_err(|_| malformed(line_no, "bad hex pair"))?;
                        bytes.push(byte);
                    }
                }
                _ => return Err(malformed(line_no, "unknown record tag")),
            }
        }
        let mut file = file.ok_or_else(|| malformed(0, "empty trace file"))?;
        commit(&mut file, &mut current);
        Ok(file)
    }

    pub fn read(path: &Path) -> Result<Self, TraceFileError> {
        let text = std::fs::read_to_string(path).map_err(|source| TraceFileError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn write(&self, path: &Path) -> Result<(), TraceFileError> {
        std::fs::write(path, self.render()).map_err(|source| TraceFileError::Io {
            path: path.display().to_string(),
            source,
        })
    }
}

/// Clear bits past the declared width; a writer may have padded them.
fn mask_padding(trace: &mut CoverageTrace) {
    let width = trace.width as usize;
    let used_in_last = width % 8;
    if used_in_last != 0 {
        if let Some(last) = trace.bytes.last_mut() {
            let mask = !(0xFFu8 >> used_in_last);
            *last &= mask;
        }
    }
}

fn malformed(line: usize, reason: &str) -> TraceFileError {
    TraceFileError::Malformed {
        line,
        reason: reason.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_blocks_render_as_e0() {
        let mut file = TraceFile::new(1, vec!["Basic".into()]);
        let trace = file.trace_mut("demo.Target.run()V", 3);
        trace.set(1).unwrap();
        trace.set(2).unwrap();
        trace.set(3).unwrap();
        let text = file.render();
        assert!(text.starts_with("3 1 1 Basic\n"));
        assert!(text.contains("1 \"demo.Target.run()V\" 3\n"));
        assert!(text.contains("2 E0\n"));
    }

    #[test]
    fn round_trip_preserves_the_trace_set() {
        let mut file = TraceFile::new(1, vec!["Basic".into(), "Exit".into()]);
        {
            let t = file.trace_mut("demo.A.f()V", 21);
            t.set(1).unwrap();
            t.set(9).unwrap();
            t.set(21).unwrap();
        }
        {
            let t = file.trace_mut("demo.B.g()V", 3);
            t.set(2).unwrap();
        }
        let parsed = TraceFile::parse(&file.render()).unwrap();
        assert_eq!(parsed, file);
    }

    #[test]
    fn set_rejects_out_of_range_ids() {
        let mut trace = CoverageTrace::new(4);
        assert!(trace.set(0).is_err());
        assert!(trace.set(5).is_err());
        trace.set(4).unwrap();
        assert!(trace.get(4));
        assert!(!trace.get(3));
    }

    #[test]
    fn merge_is_associative_and_commutative() {
        let mut a = CoverageTrace::new(10);
        a.set(1).unwrap();
        let mut b = CoverageTrace::new(10);
        b.set(5).unwrap();
        let mut c = CoverageTrace::new(10);
        c.set(10).unwrap();

        // merge(a, merge(b, c))
        let mut bc = b.clone();
        bc.merge(&c);
        let mut left = a.clone();
        left.merge(&bc);

        // merge(merge(a, b), c)
        let mut ab = a.clone();
        ab.merge(&b);
        let mut right = ab.clone();
        right.merge(&c);

        // merge(merge(a, c), b)
        let mut ac = a.clone();
        ac.merge(&c);
        let mut third = ac.clone();
        third.merge(&b);

        assert_eq!(left, right);
        assert_eq!(right, third);
        assert_eq!(left.count_set(), 3);
    }

    #[test]
    fn appended_runs_accumulate_bits() {
        let mut run_a = TraceFile::new(2, vec!["If".into()]);
        run_a.trace_mut("demo.A.f()V", 2).set(1).unwrap();
        let mut run_b = TraceFile::new(2, vec!["If".into()]);
        run_b.trace_mut("demo.A.f()V", 2).set(2).unwrap();
        run_a.merge(run_b);
        let trace = &run_a.methods["demo.A.f()V"];
        assert!(trace.get(1));
        assert!(trace.get(2));
    }

    #[test]
    fn reader_ignores_padding_bits() {
        // Width 3 but the writer padded the byte with a stray low bit.
        let text = "3 1 1 Basic\n1 \"demo.A.f()V\" 3\n2 E1\n";
        let parsed = TraceFile::parse(text).unwrap();
        let trace = &parsed.methods["demo.A.f()V"];
        assert!(trace.get(1) && trace.get(2) && trace.get(3));
        assert_eq!(trace.bytes()[0], 0xE0);
    }

    #[test]
    fn long_vectors_wrap_at_twenty_pairs() {
        let mut file = TraceFile::new(1, vec!["Basic".into()]);
        file.trace_mut("demo.Long.run()V", 400);
        let text = file.render();
        let data_lines: Vec<&str> = text.lines().filter(|l| l.starts_with("2 ")).collect();
        // 400 bits = 50 bytes = 20 + 20 + 10 pairs.
        assert_eq!(data_lines.len(), 3);
        assert_eq!(data_lines[0].split_whitespace().count(), 21);
        assert_eq!(data_lines[2].split_whitespace().count(), 11);
    }
}
