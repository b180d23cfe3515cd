use std::fmt;
use std::io::{self, BufRead};

fn strip_string(s: &mut String) {
    while s.ends_with(char::is_whitespace) {
        s.pop();
    }
}

#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Sequence {
    pub header: String, // header line, including @, but not newline
    pub seq: Vec<u8>,
    pub quals: Vec<u8>,
}

impl Sequence {
    pub fn new(header: &str, seq: &[u8], quals: &[u8]) -> Self {
        Self {
            header: header.to_string(),
            seq: seq.to_vec(),
            quals: quals.to_vec(),
        }
    }

    /// Read name: the header after `@`, up to the first space or tab.
    pub fn name(&self) -> &str {
        let body = self.header.strip_prefix('@').unwrap_or(&self.header);
        match body.find([' ', '\t']) {
            Some(end) => &body[..end],
            None => body,
        }
    }

    pub fn len(&self) -> usize {
        self.seq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seq.is_empty()
    }

    /// Truncates sequence and qualities to `len` bases.
    pub fn truncate(&mut self, len: usize) {
        self.seq.truncate(len);
        self.quals.truncate(len);
    }

    /// Appends the record in FASTQ form with `header` in place of its own.
    pub fn write_fastq(&self, header: &str, out: &mut String) {
        out.push_str(header);
        out.push('\n');
        out.push_str(&String::from_utf8_lossy(&self.seq));
        out.push_str("\n+\n");
        out.push_str(&String::from_utf8_lossy(&self.quals));
        out.push('\n');
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.header)?;
        writeln!(f, "{}", String::from_utf8_lossy(&self.seq))?;
        writeln!(f, "+")?;
        writeln!(f, "{}", String::from_utf8_lossy(&self.quals))
    }
}

/// Reads FASTQ records in batches.
pub struct BatchSequenceReader<R: BufRead> {
    reader: R,
    line: String,
    records_read: u64,
}

impl<R: BufRead> BatchSequenceReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::with_capacity(256),
            records_read: 0,
        }
    }

    pub fn records_read(&self) -> u64 {
        self.records_read
    }

    fn read_line(&mut self) -> io::Result<bool> {
        self.line.clear();
        if self.reader.read_line(&mut self.line)? == 0 {
            return Ok(false);
        }
        strip_string(&mut self.line);
        Ok(true)
    }

    fn malformed(&self, what: &str) -> io::Error {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("malformed FASTQ record {}: {}", self.records_read + 1, what),
        )
    }

    /// Reads the next record. `Ok(false)` at end of input.
    pub fn next_sequence(&mut self, sequence: &mut Sequence) -> io::Result<bool> {
        // Blank lines between records are tolerated.
        loop {
            if !self.read_line()? {
                return Ok(false);
            }
            if !self.line.is_empty() {
                break;
            }
        }
        if !self.line.starts_with('@') {
            return Err(self.malformed("header does not start with '@'"));
        }
        sequence.header.clear();
        sequence.header.push_str(&self.line);

        if !self.read_line()? {
            return Err(self.malformed("missing sequence line"));
        }
        sequence.seq.clear();
        sequence.seq.extend_from_slice(self.line.as_bytes());

        if !self.read_line()? || !self.line.starts_with('+') {
            return Err(self.malformed("missing '+' separator line"));
        }

        if !self.read_line()? {
            return Err(self.malformed("missing quality line"));
        }
        sequence.quals.clear();
        sequence.quals.extend_from_slice(self.line.as_bytes());

        self.records_read += 1;
        Ok(true)
    }

    /// Loads up to `record_count` records. An empty batch means end of input.
    pub fn load_batch(&mut self, record_count: usize) -> io::Result<Vec<Sequence>> {
        let mut batch = Vec::with_capacity(record_count.min(1 << 16));
        let mut sequence = Sequence::default();
        while batch.len() < record_count && self.next_sequence(&mut sequence)? {
            batch.push(std::mem::take(&mut sequence));
        }
        Ok(batch)
    }
}
