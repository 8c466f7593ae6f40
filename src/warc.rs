//! WET (WARC Encoded Text) container parsing
//!
//! A WET file is a sequence of WARC/1.0 records, each made of a version line,
//! `Name: value` headers, a blank line and a `Content-Length` sized body.
//! Common Crawl ships them as multi-member gzip files.

use std::{
    fs::File,
    io::{self, BufRead, BufReader, Read},
    path::{Path, PathBuf},
};

use flate2::bufread::MultiGzDecoder;
use thiserror::Error;

const WARC_VERSION_PREFIX: &str = "WARC/";
const WARC_TYPE: &str = "WARC-Type";
const WARC_TARGET_URI: &str = "WARC-Target-URI";
const CONTENT_LENGTH: &str = "Content-Length";

/// A record that could not be decoded from its container
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("expected a `WARC/` version line, found {0:?}")]
    MissingVersion(String),
    #[error("malformed header line {0:?}")]
    BadHeader(String),
    #[error("end of input inside a header block")]
    UnterminatedHeaders,
    #[error("record has no `Content-Length` header")]
    MissingContentLength,
    #[error("invalid `Content-Length` value {0:?}")]
    BadContentLength(String),
    #[error("record body truncated, expected {expected} bytes")]
    Truncated { expected: usize },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// One archive entry, tagged by its `WARC-Type`
///
/// Only conversion records carry the extracted page text, every other
/// entry is acknowledged and skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Conversion { uri: Option<String>, body: String },
    Warcinfo,
    Response,
    Request,
    Metadata,
    Resource,
    Revisit,
    Continuation,
    Other(String),
}

impl Record {
    /// Build a record from its `WARC-Type` header value and raw body
    pub fn from_parts(warc_type: &str, uri: Option<String>, body: &[u8]) -> Self {
        match warc_type {
            "conversion" => Record::Conversion {
                uri,
                body: String::from_utf8_lossy(body).into_owned(),
            },
            "warcinfo" => Record::Warcinfo,
            "response" => Record::Response,
            "request" => Record::Request,
            "metadata" => Record::Metadata,
            "resource" => Record::Resource,
            "revisit" => Record::Revisit,
            "continuation" => Record::Continuation,
            other => Record::Other(other.to_string()),
        }
    }

    /// Shorthand for a conversion record without a target URI
    pub fn conversion(body: impl Into<String>) -> Self {
        Record::Conversion { uri: None, body: body.into() }
    }

    pub fn is_conversion(&self) -> bool {
        matches!(self, Record::Conversion { .. })
    }
}

/// Streams records out of a WARC container
///
/// The reader stops after the first malformed record, since the framing
/// can't be trusted past that point.
pub struct WetReader<R> {
    reader: R,
    line: String,
    done: bool,
}

impl<R: BufRead> WetReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader, line: String::new(), done: false }
    }

    /// Read the next line into the buffer, returns `false` on EOF
    fn read_line(&mut self) -> io::Result<bool> {
        self.line.clear();
        Ok(self.reader.read_line(&mut self.line)? != 0)
    }

    fn read_record(&mut self) -> Result<Option<Record>, RecordError> {
        // Skip the blank lines separating two records
        loop {
            if !self.read_line()? {
                return Ok(None);
            }
            if !self.line.trim().is_empty() {
                break;
            }
        }
        let version = self.line.trim_end();
        if !version.starts_with(WARC_VERSION_PREFIX) {
            return Err(RecordError::MissingVersion(version.to_string()));
        }

        let mut warc_type = None;
        let mut uri = None;
        let mut content_length = None;
        loop {
            if !self.read_line()? {
                return Err(RecordError::UnterminatedHeaders);
            }
            let header = self.line.trim_end_matches(['\r', '\n']);
            if header.is_empty() {
                break;
            }
            let (name, value) = header
                .split_once(':')
                .ok_or_else(|| RecordError::BadHeader(header.to_string()))?;
            let (name, value) = (name.trim(), value.trim());
            if name.eq_ignore_ascii_case(WARC_TYPE) {
                warc_type = Some(value.to_string());
            } else if name.eq_ignore_ascii_case(WARC_TARGET_URI) {
                uri = Some(value.to_string());
            } else if name.eq_ignore_ascii_case(CONTENT_LENGTH) {
                let length = value
                    .parse::<usize>()
                    .map_err(|_| RecordError::BadContentLength(value.to_string()))?;
                content_length = Some(length);
            }
        }

        let expected = content_length.ok_or(RecordError::MissingContentLength)?;
        // Grows with the bytes actually read, not with the declared length
        let mut body = Vec::new();
        self.reader.by_ref().take(expected as u64).read_to_end(&mut body)?;
        if body.len() < expected {
            return Err(RecordError::Truncated { expected });
        }

        Ok(Some(Record::from_parts(
            warc_type.as_deref().unwrap_or_default(),
            uri,
            &body,
        )))
    }
}

impl<R: BufRead> Iterator for WetReader<R> {
    type Item = Result<Record, RecordError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Open a WET segment, transparently decompressing `.gz` files
pub fn open_segment(path: &Path) -> io::Result<WetReader<Box<dyn BufRead + Send>>> {
    let file = BufReader::new(File::open(path)?);
    let reader: Box<dyn BufRead + Send> = if is_gzip(path) {
        Box::new(BufReader::new(MultiGzDecoder::new(file)))
    } else {
        Box::new(file)
    };
    Ok(WetReader::new(reader))
}

pub(crate) fn is_gzip(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "gz")
}

/// List every regular file under `input`, sorted, keeping at most `max_files`
///
/// Each listed file is one unit of parallel work for the job driver.
pub fn list_input_files(input: &Path, max_files: Option<usize>) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(input) {
        let entry = entry.map_err(io::Error::from)?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    files.sort();
    if let Some(max_files) = max_files {
        files.truncate(max_files);
    }
    Ok(files)
}
