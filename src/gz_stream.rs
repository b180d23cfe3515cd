use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

/// Separator between several input files given as one argument.
pub const FILE_SEPARATOR: char = ',';

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Opens one file, decompressing it if it starts with the gzip magic.
pub fn open_maybe_gz(path: &Path) -> io::Result<Box<dyn BufRead + Send>> {
    let mut reader = BufReader::new(File::open(path)?);
    let is_gz = reader.fill_buf()?.starts_with(&GZIP_MAGIC);
    if is_gz {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(reader))))
    } else {
        Ok(Box::new(reader))
    }
}

/// Reads a list of plain or gzipped files back to back.
pub struct GzInputStream {
    /// Files not opened yet
    files: Vec<PathBuf>,
    /// Current file being read from
    current_file: Option<Box<dyn BufRead + Send>>,
}

impl GzInputStream {
    /// Create a new GzInputStream from a single file
    pub fn new_single(filename: &Path) -> io::Result<GzInputStream> {
        Self::new_multiple(vec![filename.to_path_buf()])
    }

    /// Create a new GzInputStream from multiple files
    pub fn new_multiple(filenames: Vec<PathBuf>) -> io::Result<GzInputStream> {
        // Fail early on any missing file rather than halfway through the run.
        for file in &filenames {
            if !file.is_file() {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("cannot open file {}", file.display()),
                ));
            }
        }
        let mut stream = GzInputStream {
            files: filenames,
            current_file: None,
        };
        stream.open_next()?;
        Ok(stream)
    }

    /// Splits a comma-separated argument into file names.
    pub fn from_arg(arg: &str) -> io::Result<GzInputStream> {
        let files = arg
            .split(FILE_SEPARATOR)
            .filter(|name| !name.is_empty())
            .map(PathBuf::from)
            .collect();
        Self::new_multiple(files)
    }

    fn open_next(&mut self) -> io::Result<bool> {
        if self.files.is_empty() {
            self.current_file = None;
            return Ok(false);
        }
        let next = self.files.remove(0);
        self.current_file = Some(open_maybe_gz(&next)?);
        Ok(true)
    }
}

impl Read for GzInputStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let Some(current) = self.current_file.as_mut() else {
                return Ok(0);
            };
            let n = current.read(buf)?;
            if n > 0 || buf.is_empty() {
                return Ok(n);
            }
            if !self.open_next()? {
                return Ok(0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    #[test]
    fn test_reads_plain_and_gz_back_to_back() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("a.fq");
        let gz = dir.path().join("b.fq.gz");
        std::fs::write(&plain, "@a\nA\n+\nI\n").unwrap();
        let mut encoder = GzEncoder::new(File::create(&gz).unwrap(), Compression::default());
        encoder.write_all(b"@b\nC\n+\nI\n").unwrap();
        encoder.finish().unwrap();

        let arg = format!("{},{}", plain.display(), gz.display());
        let mut stream = GzInputStream::from_arg(&arg).unwrap();
        let mut text = String::new();
        stream.read_to_string(&mut text).unwrap();
        assert_eq!(text, "@a\nA\n+\nI\n@b\nC\n+\nI\n");
    }

    #[test]
    fn test_missing_file() {
        let err = GzInputStream::new_single(Path::new("/nonexistent/reads.fq")).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
