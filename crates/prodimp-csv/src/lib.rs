//! Streaming CSV record parser + valid-row pre-counter.

use std::path::{Path, PathBuf};

use csv_async::{AsyncReader, AsyncReaderBuilder, ByteRecord};
use prodimp_core::{ProductRow, RowTotal};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncRead;
use tracing::warn;

pub const CRATE_NAME: &str = "prodimp-csv";

const FALSE_TOKENS: [&str; 4] = ["false", "0", "no", "inactive"];
const TRUE_TOKENS: [&str; 4] = ["true", "1", "yes", "active"];

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("opening {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("reading csv: {0}")]
    Csv(#[from] csv_async::Error),
}

/// Why a row was dropped without reaching the upsert engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// `sku` or `name` empty after trimming.
    MissingRequired,
    /// A mapped field is not valid UTF-8.
    Malformed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowOutcome {
    Valid(ProductRow),
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadStats {
    pub rows_read: u64,
    pub valid: u64,
    pub missing_required: u64,
    pub malformed: u64,
}

/// Maps `is_active` tokens to a flag. Unrecognized or absent values are active.
pub fn parse_active(value: Option<&str>) -> bool {
    let Some(raw) = value else {
        return true;
    };
    let normalized = raw.trim().to_lowercase();
    if FALSE_TOKENS.contains(&normalized.as_str()) {
        return false;
    }
    if TRUE_TOKENS.contains(&normalized.as_str()) {
        return true;
    }
    true
}

/// Applies the validity predicate and normalization to already-decoded fields.
pub fn normalize_record(
    sku: &str,
    name: &str,
    description: Option<&str>,
    is_active: Option<&str>,
) -> Option<ProductRow> {
    let sku = sku.trim();
    let name = name.trim();
    if sku.is_empty() || name.is_empty() {
        return None;
    }
    let description = description
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(ToString::to_string);
    Some(ProductRow {
        sku: sku.to_lowercase(),
        name: name.to_string(),
        description,
        is_active: parse_active(is_active),
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ColumnMap {
    sku: Option<usize>,
    name: Option<usize>,
    description: Option<usize>,
    is_active: Option<usize>,
}

impl ColumnMap {
    fn from_headers(headers: &ByteRecord) -> Self {
        let mut map = Self::default();
        for (idx, raw) in headers.iter().enumerate() {
            let header = String::from_utf8_lossy(raw);
            let header = header.trim_start_matches('\u{feff}').trim().to_lowercase();
            let slot = match header.as_str() {
                "sku" => &mut map.sku,
                "name" => &mut map.name,
                "description" => &mut map.description,
                "is_active" => &mut map.is_active,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(idx);
            }
        }
        map
    }

    fn classify(&self, record: &ByteRecord) -> RowOutcome {
        let field = |idx: Option<usize>| -> Result<Option<&str>, std::str::Utf8Error> {
            match idx.and_then(|i| record.get(i)) {
                Some(bytes) => std::str::from_utf8(bytes).map(Some),
                None => Ok(None),
            }
        };
        let (Ok(sku), Ok(name), Ok(description), Ok(is_active)) = (
            field(self.sku),
            field(self.name),
            field(self.description),
            field(self.is_active),
        ) else {
            return RowOutcome::Skipped(SkipReason::Malformed);
        };
        match normalize_record(
            sku.unwrap_or_default(),
            name.unwrap_or_default(),
            description,
            is_active,
        ) {
            Some(row) => RowOutcome::Valid(row),
            None => RowOutcome::Skipped(SkipReason::MissingRequired),
        }
    }
}

/// Single-pass reader over a header-led CSV source.
///
/// The reader never buffers more than one record; callers that need the file
/// twice (pre-count, then process) open it twice.
pub struct CsvRecordReader<R> {
    reader: AsyncReader<R>,
    columns: ColumnMap,
    record: ByteRecord,
    stats: ReadStats,
}

impl CsvRecordReader<File> {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, ParseError> {
        let path = path.as_ref();
        let file = File::open(path).await.map_err(|source| ParseError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_reader(file).await
    }
}

impl<R> CsvRecordReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub async fn from_reader(rdr: R) -> Result<Self, ParseError> {
        let mut reader = AsyncReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .create_reader(rdr);
        let columns = ColumnMap::from_headers(reader.byte_headers().await?);
        Ok(Self {
            reader,
            columns,
            record: ByteRecord::new(),
            stats: ReadStats::default(),
        })
    }

    /// Reads and classifies the next data row. `None` at end of input.
    pub async fn next_row(&mut self) -> Result<Option<RowOutcome>, ParseError> {
        if !self.reader.read_byte_record(&mut self.record).await? {
            return Ok(None);
        }
        self.stats.rows_read += 1;
        let outcome = self.columns.classify(&self.record);
        match &outcome {
            RowOutcome::Valid(_) => self.stats.valid += 1,
            RowOutcome::Skipped(SkipReason::MissingRequired) => self.stats.missing_required += 1,
            RowOutcome::Skipped(SkipReason::Malformed) => self.stats.malformed += 1,
        }
        Ok(Some(outcome))
    }

    /// Next valid row, silently counting and dropping invalid ones.
    pub async fn next_valid(&mut self) -> Result<Option<ProductRow>, ParseError> {
        while let Some(outcome) = self.next_row().await? {
            if let RowOutcome::Valid(row) = outcome {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    pub fn stats(&self) -> ReadStats {
        self.stats
    }
}

/// Counts rows passing the same predicate the parser applies.
pub async fn count_valid_rows(path: impl AsRef<Path>) -> Result<u64, ParseError> {
    let mut reader = CsvRecordReader::open(path).await?;
    while reader.next_row().await?.is_some() {}
    Ok(reader.stats().valid)
}

/// Progress denominator for a file; a failed scan yields `RowTotal::Unknown`.
pub async fn pre_count(path: impl AsRef<Path>) -> RowTotal {
    let path = path.as_ref();
    match count_valid_rows(path).await {
        Ok(total) => RowTotal::Counted(total),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "pre-count failed; total rows unknown");
            RowTotal::Unknown
        }
    }
}
