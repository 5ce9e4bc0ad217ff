//! Append-only credential store.
//!
//! [`CredentialSink`] is the seam the drain loop writes through. [`CsvSink`]
//! is the file-backed implementation: comma delimited, `"` quoting with
//! doubled quotes, and `\` escaping backslashes inside quoted fields. Username
//! and password are attacker-controlled, so every field goes through
//! [`encode_row`] and the row structure cannot be broken from the outside.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::capture::CredentialRecord;
use crate::constants::CSV_HEADER;

/// Credential store errors.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed row {line}: {reason}")]
    Malformed { line: usize, reason: String },
}

impl SinkError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A batch that stopped partway. The first `written` records are owned by
/// the sink; the rest were not accepted.
#[derive(Debug, thiserror::Error)]
#[error("stored {written} records before failing: {source}")]
pub struct BatchError {
    pub written: usize,
    #[source]
    pub source: SinkError,
}

/// Destination for drained credential batches.
pub trait CredentialSink: Send + 'static {
    /// Accept one record. On error the record was not stored and no part of
    /// it will ever reach the backing store.
    fn write_record(&mut self, record: &CredentialRecord) -> Result<(), SinkError>;

    /// Push anything buffered down to the backing store.
    fn flush(&mut self) -> Result<(), SinkError>;

    /// Store `records` in order, stopping at the first failure.
    fn write_batch(&mut self, records: &[CredentialRecord]) -> Result<usize, BatchError> {
        for (written, record) in records.iter().enumerate() {
            self.write_record(record)
                .map_err(|source| BatchError { written, source })?;
        }
        Ok(records.len())
    }
}

/// CSV rows appended to a file behind a small write buffer.
///
/// Rows enter the buffer whole. When a write to the file comes up short, the
/// unwritten tail stays at the front of the buffer and goes out before
/// anything else, so the file never holds a torn row followed by another.
#[derive(Debug)]
pub struct CsvSink<W: Write = File> {
    path: PathBuf,
    out: W,
    pending: Vec<u8>,
    capacity: usize,
}

impl CsvSink<File> {
    /// Open `path` for appending. When the file did not exist yet the header
    /// row is written first. The returned flag tells whether it existed.
    pub fn open(path: impl AsRef<Path>, buffer_size: usize) -> Result<(Self, bool), SinkError> {
        let path = path.as_ref();
        let existed = path.exists();

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| SinkError::io(path, e))?;

        tracing::debug!("IO buffer set {}", buffer_size);
        let mut sink = Self::new(path, file, buffer_size);

        if !existed {
            tracing::info!("Output CSV {} doesn't exist, writing header", path.display());
            sink.push_row(&CSV_HEADER)?;
        }

        Ok((sink, existed))
    }
}

impl<W: Write> CsvSink<W> {
    /// Wrap an already open writer. `path` is only used in error messages.
    pub fn new(path: impl AsRef<Path>, out: W, buffer_size: usize) -> Self {
        let capacity = buffer_size.max(1);
        Self {
            path: path.as_ref().to_path_buf(),
            out,
            pending: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get_ref(&self) -> &W {
        &self.out
    }

    /// Bytes accepted but not yet handed to the writer.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Append one row. A full buffer is written out first; if that fails the
    /// row is not taken.
    fn push_row<S: AsRef<str>>(&mut self, fields: &[S]) -> Result<(), SinkError> {
        if self.pending.len() >= self.capacity {
            self.write_pending()?;
        }
        let mut line = String::new();
        encode_row(fields, &mut line);
        self.pending.extend_from_slice(line.as_bytes());
        Ok(())
    }

    fn write_pending(&mut self) -> Result<(), SinkError> {
        while !self.pending.is_empty() {
            match self.out.write(&self.pending) {
                Ok(0) => {
                    return Err(SinkError::io(
                        &self.path,
                        io::Error::from(io::ErrorKind::WriteZero),
                    ));
                }
                Ok(n) => {
                    self.pending.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(SinkError::io(&self.path, e)),
            }
        }
        Ok(())
    }
}

impl<W: Write + Send + 'static> CredentialSink for CsvSink<W> {
    fn write_record(&mut self, record: &CredentialRecord) -> Result<(), SinkError> {
        let timestamp = record.timestamp.to_string();
        self.push_row(&[
            timestamp.as_str(),
            record.remote_address.as_str(),
            record.username.as_str(),
            record.password.as_str(),
        ])
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.write_pending()?;
        self.out.flush().map_err(|e| SinkError::io(&self.path, e))
    }
}

impl<W: Write> Drop for CsvSink<W> {
    fn drop(&mut self) {
        if let Err(e) = self.write_pending() {
            tracing::error!("CSV writer: {} bytes lost on close: {}", self.pending.len(), e);
        }
    }
}

fn needs_quoting(field: &str) -> bool {
    field
        .chars()
        .any(|c| matches!(c, ',' | '"' | '\\' | '\r' | '\n'))
}

/// Append one CRLF-terminated row to `out`.
pub fn encode_row<S: AsRef<str>>(fields: &[S], out: &mut String) {
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        let field = field.as_ref();
        if !needs_quoting(field) {
            out.push_str(field);
            continue;
        }
        out.push('"');
        for c in field.chars() {
            match c {
                '"' => out.push_str("\"\""),
                '\\' => out.push_str("\\\\"),
                c => out.push(c),
            }
        }
        out.push('"');
    }
    out.push_str("\r\n");
}

/// Split CSV text into rows of fields.
///
/// Accepts both doubled quotes and backslash escapes inside quoted fields,
/// and either CRLF or LF line endings.
pub fn parse_rows(input: &str) -> Result<Vec<Vec<String>>, SinkError> {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut field = String::new();
    let mut line = 1;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if field.is_empty() => loop {
                match chars.next() {
                    Some('"') if chars.peek() == Some(&'"') => {
                        chars.next();
                        field.push('"');
                    }
                    Some('"') => break,
                    Some('\\') => match chars.next() {
                        Some(escaped) => field.push(escaped),
                        None => {
                            return Err(SinkError::Malformed {
                                line,
                                reason: "dangling escape".into(),
                            });
                        }
                    },
                    Some(c) => {
                        if c == '\n' {
                            line += 1;
                        }
                        field.push(c);
                    }
                    None => {
                        return Err(SinkError::Malformed {
                            line,
                            reason: "unterminated quoted field".into(),
                        });
                    }
                }
            },
            ',' => row.push(std::mem::take(&mut field)),
            '\r' | '\n' => {
                if c == '\r' && chars.peek() == Some(&'\n') {
                    chars.next();
                }
                row.push(std::mem::take(&mut field));
                rows.push(std::mem::take(&mut row));
                line += 1;
            }
            c => field.push(c),
        }
    }

    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        rows.push(row);
    }
    Ok(rows)
}

/// Read every record from a credential CSV written by [`CsvSink`].
pub fn read_records(path: impl AsRef<Path>) -> Result<Vec<CredentialRecord>, SinkError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|e| SinkError::io(path, e))?;
    let mut rows = parse_rows(&text)?.into_iter().enumerate();

    match rows.next() {
        Some((_, header)) if header == CSV_HEADER => {}
        Some(_) => {
            return Err(SinkError::Malformed {
                line: 1,
                reason: "missing header".into(),
            });
        }
        None => return Ok(Vec::new()),
    }

    rows.map(|(i, row)| {
        let line = i + 1;
        let [timestamp, remote_address, username, password]: [String; 4] =
            row.try_into().map_err(|row: Vec<String>| SinkError::Malformed {
                line,
                reason: format!("expected 4 fields, found {}", row.len()),
            })?;
        let timestamp = timestamp.parse::<i64>().map_err(|e| SinkError::Malformed {
            line,
            reason: format!("bad timestamp {timestamp:?}: {e}"),
        })?;
        Ok(CredentialRecord {
            timestamp,
            remote_address,
            username,
            password,
        })
    })
    .collect()
}
