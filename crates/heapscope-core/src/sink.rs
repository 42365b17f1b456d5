//! Output sinks for the log, profile and trace streams.
//!
//! The pseudo-names `stderr` and `stdout` route a stream to the standard
//! error and output streams, which are flushed but never closed.

use std::fs::File;
use std::io::{self, BufWriter, Write};

pub enum Sink {
    Stdout(io::Stdout),
    Stderr(io::Stderr),
    File(BufWriter<File>),
}

impl Sink {
    /// Opens a sink for `path`, honouring the pseudo-names.
    pub fn open(path: &str) -> io::Result<Sink> {
        match path {
            "stdout" => Ok(Sink::Stdout(io::stdout())),
            "stderr" => Ok(Sink::Stderr(io::stderr())),
            _ => Ok(Sink::File(BufWriter::new(File::create(path)?))),
        }
    }
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Sink::Stdout(s) => s.write(buf),
            Sink::Stderr(s) => s.write(buf),
            Sink::File(f) => f.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Sink::Stdout(s) => s.flush(),
            Sink::Stderr(s) => s.flush(),
            Sink::File(f) => f.flush(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pseudo_names() {
        assert!(matches!(Sink::open("stdout"), Ok(Sink::Stdout(_))));
        assert!(matches!(Sink::open("stderr"), Ok(Sink::Stderr(_))));
    }

    #[test]
    fn test_file_sink_writes() {
        let dir = std::env::temp_dir().join(format!("heapscope-sink-{}", std::process::id()));
        let path = dir.to_string_lossy().into_owned();
        let mut sink = Sink::open(&path).unwrap();
        sink.write_all(b"hello").unwrap();
        sink.flush().unwrap();
        assert_eq!(std::fs::read(&dir).unwrap(), b"hello");
        let _ = std::fs::remove_file(&dir);
    }
}
