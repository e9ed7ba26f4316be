//! Streaming reader for the zip-packaged OOXML worksheet.
//!
//! The worksheet part is read line by line straight out of the archive. Rows
//! appear either as an opening `<row r="N">` line followed by one line holding
//! all of that row's cells, or as a single line carrying both.

use std::borrow::Cow;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use aptdata_core::RawRow;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tracing::debug;
use zip::result::ZipError;
use zip::ZipArchive;

pub const DEFAULT_SHEET_PART: &str = "xl/worksheets/sheet1.xml";

/// Banner and header rows at the top of the export.
pub const HEADER_ROWS: u32 = 2;

/// Last worksheet column, `XFD`.
pub const MAX_COLUMN: usize = 16_383;

static CELL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<c\b([^>]*?)(?:/>|>(.*?)</c>)").expect("cell pattern"));
static REF_ATTR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\br="([^"]*)""#).expect("ref attribute pattern"));
static CELL_REF_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Z]+)([0-9]+)$").expect("cell reference pattern"));
static TEXT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<t(?:\s[^>]*)?>(.*?)</t>").expect("text pattern"));
static VALUE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<v(?:\s[^>]*)?>(.*?)</v>").expect("value pattern"));
static ROW_OPEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^<row\b([^>]*)>(.*)$").expect("row pattern"));

#[derive(Debug, Error)]
pub enum SheetError {
    #[error("reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{} is not a readable zip package: {source}", .path.display())]
    Zip {
        path: PathBuf,
        #[source]
        source: ZipError,
    },
    #[error("package has no part named {0}")]
    MissingPart(String),
}

/// Zero-based column index of a column-letter run: `A` -> 0, `Z` -> 25, `AA` -> 26.
/// Runs past `XFD` are rejected.
pub fn column_index(letters: &str) -> Option<usize> {
    if letters.is_empty() || letters.len() > 3 {
        return None;
    }
    let mut n: usize = 0;
    for ch in letters.chars() {
        if !ch.is_ascii_uppercase() {
            return None;
        }
        let digit = (ch as usize) - ('A' as usize) + 1;
        n = n * 26 + digit;
    }
    Some(n - 1).filter(|col| *col <= MAX_COLUMN)
}

/// Column index of a full cell reference such as `AN12`.
pub fn reference_column(reference: &str) -> Option<usize> {
    let caps = CELL_REF_RE.captures(reference)?;
    column_index(caps.get(1)?.as_str())
}

/// Decode `&#NNN;`, `&#xHH;` and the five predefined XML entities. Unknown
/// or malformed entities are kept verbatim.
pub fn decode_entities(input: &str) -> Cow<'_, str> {
    if !input.contains('&') {
        return Cow::Borrowed(input);
    }

    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let decoded = tail
            .find(';')
            .filter(|end| *end <= 12)
            .and_then(|end| decode_entity(&tail[1..end]).map(|ch| (ch, end)));
        match decoded {
            Some((ch, end)) => {
                out.push(ch);
                rest = &tail[end + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    Cow::Owned(out)
}

fn decode_entity(name: &str) -> Option<char> {
    match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        _ => {
            let code = if let Some(hex) = name.strip_prefix("#x").or_else(|| name.strip_prefix("#X")) {
                u32::from_str_radix(hex, 16).ok()?
            } else {
                name.strip_prefix('#')?.parse::<u32>().ok()?
            };
            char::from_u32(code)
        }
    }
}

fn cell_value(inner: &str) -> String {
    let mut texts = TEXT_RE.captures_iter(inner).peekable();
    if texts.peek().is_some() {
        // Rich text runs split one string over several <t> elements.
        return texts
            .filter_map(|caps| caps.get(1))
            .map(|m| decode_entities(m.as_str()).into_owned())
            .collect();
    }
    VALUE_RE
        .captures(inner)
        .and_then(|caps| caps.get(1))
        .map(|m| decode_entities(m.as_str().trim()).into_owned())
        .unwrap_or_default()
}

/// Decode one row's cell markup, returning the row and the number of cells
/// dropped for a missing or malformed reference.
pub fn decode_row_counted(markup: &str) -> (RawRow, usize) {
    let mut cells: Vec<(usize, String)> = Vec::new();
    let mut malformed = 0;

    for caps in CELL_RE.captures_iter(markup) {
        let attrs = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        let column = REF_ATTR_RE
            .captures(attrs)
            .and_then(|r| r.get(1))
            .and_then(|r| reference_column(r.as_str()));
        let Some(column) = column else {
            malformed += 1;
            continue;
        };
        let value = caps.get(2).map(|m| cell_value(m.as_str())).unwrap_or_default();
        cells.push((column, value));
    }

    let width = cells.iter().map(|(col, _)| col + 1).max().unwrap_or(0);
    let mut values = vec![String::new(); width];
    for (column, value) in cells {
        values[column] = value;
    }
    (RawRow::new(values), malformed)
}

pub fn decode_row(markup: &str) -> RawRow {
    decode_row_counted(markup).0
}

/// Keep only rows whose cell at `column` starts with `prefix`.
#[derive(Debug, Clone)]
pub struct RowFilter {
    pub column: usize,
    pub prefix: String,
}

impl RowFilter {
    pub fn leading(prefix: impl Into<String>) -> Self {
        Self {
            column: 0,
            prefix: prefix.into(),
        }
    }

    pub fn matches(&self, row: &RawRow) -> bool {
        row.get(self.column).trim().starts_with(&self.prefix)
    }
}

#[derive(Debug, Clone)]
pub struct ReaderOptions {
    pub header_rows: u32,
    pub filter: Option<RowFilter>,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            header_rows: HEADER_ROWS,
            filter: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SheetStats {
    pub rows_seen: u64,
    pub header_skipped: u64,
    pub filtered: u64,
    pub emitted: u64,
    pub malformed_cells: u64,
    pub malformed_rows: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRow {
    pub number: u32,
    pub row: RawRow,
}

/// Lazy row sequence over a worksheet line stream. Holds at most one pending
/// row number; nothing is read ahead of the row being yielded.
pub struct SheetRows<R> {
    reader: R,
    line: String,
    pending_row: Option<u32>,
    options: ReaderOptions,
    stats: SheetStats,
}

impl<R: BufRead> SheetRows<R> {
    pub fn new(reader: R, options: ReaderOptions) -> Self {
        Self {
            reader,
            line: String::new(),
            pending_row: None,
            options,
            stats: SheetStats::default(),
        }
    }

    pub fn stats(&self) -> SheetStats {
        self.stats
    }

    fn accept(&mut self, number: u32, content: &str) -> Option<SourceRow> {
        self.stats.rows_seen += 1;
        if number <= self.options.header_rows {
            self.stats.header_skipped += 1;
            return None;
        }

        let (row, malformed) = decode_row_counted(content);
        self.stats.malformed_cells += malformed as u64;

        if let Some(filter) = &self.options.filter {
            if !filter.matches(&row) {
                self.stats.filtered += 1;
                return None;
            }
        }
        self.stats.emitted += 1;
        Some(SourceRow { number, row })
    }
}

enum LineKind {
    /// `<row r="N">` with the cells still to come.
    Open(u32),
    /// `<row r="N">` followed by cells on the same line.
    Inline(u32, String),
    /// A row tag without a usable number, or an empty self-closed row.
    Ignored { malformed: bool },
    Content,
}

fn classify_line(line: &str) -> LineKind {
    let Some(caps) = ROW_OPEN_RE.captures(line) else {
        return LineKind::Content;
    };
    let attrs = caps.get(1).map(|m| m.as_str()).unwrap_or("");
    if attrs.trim_end().ends_with('/') {
        return LineKind::Ignored { malformed: false };
    }
    let number = REF_ATTR_RE
        .captures(attrs)
        .and_then(|r| r.get(1))
        .and_then(|r| r.as_str().parse::<u32>().ok());
    let Some(number) = number else {
        return LineKind::Ignored { malformed: true };
    };
    let rest = caps.get(2).map(|m| m.as_str()).unwrap_or("");
    if rest.contains("<c") {
        LineKind::Inline(number, rest.to_string())
    } else {
        LineKind::Open(number)
    }
}

impl<R: BufRead> Iterator for SheetRows<R> {
    type Item = io::Result<SourceRow>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.line.clear();
            match self.reader.read_line(&mut self.line) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(err) => return Some(Err(err)),
            }
            let line = std::mem::take(&mut self.line);
            let trimmed = line.trim();

            let accepted = match classify_line(trimmed) {
                LineKind::Open(number) => {
                    self.pending_row = Some(number);
                    None
                }
                LineKind::Inline(number, cells) => {
                    self.pending_row = None;
                    self.accept(number, &cells)
                }
                LineKind::Ignored { malformed } => {
                    self.pending_row = None;
                    if malformed {
                        self.stats.malformed_rows += 1;
                    }
                    None
                }
                LineKind::Content => match self.pending_row.take() {
                    Some(number) => self.accept(number, trimmed),
                    None => None,
                },
            };
            self.line = line;

            if let Some(row) = accepted {
                return Some(Ok(row));
            }
        }
    }
}

/// An opened xlsx package; worksheet parts are streamed out of it on demand.
pub struct SheetPackage {
    path: PathBuf,
    archive: ZipArchive<BufReader<File>>,
}

impl SheetPackage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SheetError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|source| SheetError::Io {
            path: path.clone(),
            source,
        })?;
        let archive = ZipArchive::new(BufReader::new(file)).map_err(|source| SheetError::Zip {
            path: path.clone(),
            source,
        })?;
        Ok(Self { path, archive })
    }

    /// Stream one internal part without extracting it.
    pub fn rows(
        &mut self,
        part: &str,
        options: ReaderOptions,
    ) -> Result<SheetRows<BufReader<impl Read + '_>>, SheetError> {
        let entry = match self.archive.by_name(part) {
            Ok(entry) => entry,
            Err(ZipError::FileNotFound) => return Err(SheetError::MissingPart(part.to_string())),
            Err(source) => {
                return Err(SheetError::Zip {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        debug!(part, compressed = entry.compressed_size(), size = entry.size(), "streaming worksheet part");
        Ok(SheetRows::new(BufReader::with_capacity(64 * 1024, entry), options))
    }
}
