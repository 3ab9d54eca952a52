//! Archive files
//!
//! Text format shared with the restore tooling: the first line is a JSON
//! header `{version, created_at, options, tables[]}`; each table follows as
//! a `TABLE:<name>` line, a `COLUMNS:<json-array>` line, and one
//! `DATA:<json-array>` line per row. An optional gzip wrapper adds a `.gz`
//! suffix.
//!
//! `archive_audit_logs` moves audit rows older than a cutoff into such a
//! file, deletes them from the store, and records the run in
//! `data_archive_log`. The id gap this leaves in the audit sequence is
//! reported (and tolerated) by the integrity check.

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{AcsError, AcsResult};
use crate::persistence::rows::ArchiveLogRow;
use crate::persistence::store::RelationalStore;

/// Archive format version
pub const ARCHIVE_VERSION: u32 = 1;

/// Archive run options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveOptions {
    /// Wrap the file in gzip, adding the `.gz` suffix
    pub gzip: bool,
    /// Who triggered the archive
    pub created_by: String,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            gzip: false,
            created_by: "system".to_string(),
        }
    }
}

/// Header line of an archive file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveHeader {
    /// Format version
    pub version: u32,
    /// When the archive was written
    pub created_at: DateTime<Utc>,
    /// Options the archive was written with
    pub options: serde_json::Value,
    /// Table names in file order
    pub tables: Vec<String>,
}

/// One table inside an archive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveTable {
    /// Table name
    pub name: String,
    /// Column names
    pub columns: Vec<String>,
    /// Row values, one JSON array per row
    pub rows: Vec<Vec<serde_json::Value>>,
}

/// Result of a write
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveSummary {
    /// Path the file landed at (suffix included)
    pub path: PathBuf,
    /// Rows written across all tables
    pub records: u64,
    /// File size in bytes
    pub bytes: u64,
}

/// Write tables to an archive file
pub fn write_archive(
    path: &Path,
    tables: &[ArchiveTable],
    options: &ArchiveOptions,
) -> std::io::Result<ArchiveSummary> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let path = if options.gzip {
        let mut with_gz = path.as_os_str().to_owned();
        with_gz.push(".gz");
        PathBuf::from(with_gz)
    } else {
        path.to_path_buf()
    };

    let header = ArchiveHeader {
        version: ARCHIVE_VERSION,
        created_at: Utc::now(),
        options: serde_json::to_value(options)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?,
        tables: tables.iter().map(|t| t.name.clone()).collect(),
    };

    let mut text = serde_json::to_string(&header)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    text.push('\n');
    let mut records = 0u64;
    for table in tables {
        text.push_str(&format!("TABLE:{}\n", table.name));
        text.push_str(&format!(
            "COLUMNS:{}\n",
            serde_json::to_string(&table.columns)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?
        ));
        for row in &table.rows {
            text.push_str(&format!(
                "DATA:{}\n",
                serde_json::to_string(row)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?
            ));
            records += 1;
        }
    }

    if options.gzip {
        let file = std::fs::File::create(&path)?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(text.as_bytes())?;
        encoder.finish()?;
    } else {
        std::fs::write(&path, &text)?;
    }

    let bytes = std::fs::metadata(&path)?.len();
    Ok(ArchiveSummary {
        path,
        records,
        bytes,
    })
}

/// Read an archive file back into its header and tables
pub fn read_archive(path: &Path) -> std::io::Result<(ArchiveHeader, Vec<ArchiveTable>)> {
    let file = std::fs::File::open(path)?;
    let text = if path.extension().is_some_and(|ext| ext == "gz") {
        let mut decoder = GzDecoder::new(file);
        let mut buffer = String::new();
        decoder.read_to_string(&mut buffer)?;
        buffer
    } else {
        let mut buffer = String::new();
        BufReader::new(file).read_to_string(&mut buffer)?;
        buffer
    };

    let mut lines = text.lines();
    let header_line = lines
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "empty archive"))?;
    let header: ArchiveHeader = serde_json::from_str(header_line)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    let mut tables: Vec<ArchiveTable> = Vec::new();
    for line in lines {
        if let Some(name) = line.strip_prefix("TABLE:") {
            tables.push(ArchiveTable {
                name: name.to_string(),
                columns: Vec::new(),
                rows: Vec::new(),
            });
        } else if let Some(columns) = line.strip_prefix("COLUMNS:") {
            let table = tables.last_mut().ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, "COLUMNS before TABLE")
            })?;
            table.columns = serde_json::from_str(columns)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        } else if let Some(row) = line.strip_prefix("DATA:") {
            let table = tables.last_mut().ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, "DATA before TABLE")
            })?;
            table.rows.push(
                serde_json::from_str(row)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?,
            );
        } else if !line.trim().is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unexpected archive line: {line:.40}"),
            ));
        }
    }
    Ok((header, tables))
}

/// Column order used for archived audit rows
const AUDIT_COLUMNS: [&str; 8] = [
    "id",
    "entity_type",
    "entity_id",
    "change_type",
    "changed_by",
    "change_date",
    "change_details",
    "content_hash",
];

/// Archive audit rows older than the cutoff and delete them from the store
pub async fn archive_audit_logs(
    store: &Arc<dyn RelationalStore>,
    root: &Path,
    cutoff: DateTime<Utc>,
    options: &ArchiveOptions,
) -> AcsResult<ArchiveLogRow> {
    let rows = store.audit_before(cutoff).await?;
    let table = ArchiveTable {
        name: "audit_logs".to_string(),
        columns: AUDIT_COLUMNS.iter().map(|c| c.to_string()).collect(),
        rows: rows
            .iter()
            .map(|row| {
                vec![
                    serde_json::json!(row.id),
                    serde_json::json!(row.entity_type),
                    serde_json::json!(row.entity_id),
                    serde_json::json!(row.change_type),
                    serde_json::json!(row.changed_by),
                    serde_json::json!(row.change_date.to_rfc3339()),
                    serde_json::json!(row.change_details),
                    serde_json::json!(row.content_hash),
                ]
            })
            .collect(),
    };

    let file_name = format!("audit_logs_{}.acsarc", Utc::now().format("%Y%m%dT%H%M%SZ"));
    let summary = write_archive(&root.join(file_name), &[table], options)
        .map_err(|e| AcsError::Transient(format!("archive write failed: {e}")))?;

    let deleted = store.delete_audit_before(cutoff).await?;
    if deleted != summary.records {
        tracing::warn!(
            archived = summary.records,
            deleted,
            "audit rows changed between archive and delete"
        );
    }

    let mut row = ArchiveLogRow {
        archive_id: 0,
        archive_type: "audit_logs".to_string(),
        archive_date: Utc::now(),
        records_archived: summary.records as i64,
        archive_size: summary.bytes as i64,
        archive_path: summary.path.display().to_string(),
        status: "completed".to_string(),
        created_by: options.created_by.clone(),
        metadata: serde_json::json!({ "cutoff": cutoff.to_rfc3339(), "gzip": options.gzip })
            .to_string(),
    };
    row.archive_id = store.record_archive(&row).await?;
    tracing::info!(
        records = summary.records,
        path = %row.archive_path,
        "audit rows archived"
    );
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::writer::AuditWriter;
    use crate::audit::ChangeType;
    use crate::persistence::memory::MemoryStore;

    fn temp_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("acs-archive-{name}-{}", uuid::Uuid::new_v4()))
    }

    fn sample_table() -> ArchiveTable {
        ArchiveTable {
            name: "audit_logs".into(),
            columns: vec!["id".into(), "change_type".into()],
            rows: vec![
                vec![serde_json::json!(1), serde_json::json!("create")],
                vec![serde_json::json!(2), serde_json::json!("grant")],
            ],
        }
    }

    #[test]
    fn test_write_read_roundtrip_plain() {
        let dir = temp_dir("plain");
        let path = dir.join("sample.acsarc");
        let summary =
            write_archive(&path, &[sample_table()], &ArchiveOptions::default()).unwrap();
        assert_eq!(summary.records, 2);

        let (header, tables) = read_archive(&summary.path).unwrap();
        assert_eq!(header.version, ARCHIVE_VERSION);
        assert_eq!(header.tables, vec!["audit_logs"]);
        assert_eq!(tables, vec![sample_table()]);
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_gzip_roundtrip_adds_suffix() {
        let dir = temp_dir("gzip");
        let path = dir.join("sample.acsarc");
        let options = ArchiveOptions {
            gzip: true,
            ..Default::default()
        };
        let summary = write_archive(&path, &[sample_table()], &options).unwrap();
        assert!(summary.path.to_string_lossy().ends_with(".acsarc.gz"));

        let (_, tables) = read_archive(&summary.path).unwrap();
        assert_eq!(tables, vec![sample_table()]);
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn test_archive_audit_logs_moves_rows() {
        let dir = temp_dir("audit");
        let store: Arc<dyn RelationalStore> = Arc::new(MemoryStore::new());
        let health = Arc::new(crate::health::HealthMonitor::new("test"));
        let writer = AuditWriter::new(store.clone(), health).await;
        for i in 0..3 {
            writer
                .record("user", i, ChangeType::Create, "system", serde_json::json!({}))
                .await;
        }

        let cutoff = Utc::now() + chrono::Duration::seconds(1);
        let row = archive_audit_logs(&store, &dir, cutoff, &ArchiveOptions::default())
            .await
            .unwrap();
        assert_eq!(row.records_archived, 3);
        assert_eq!(row.status, "completed");
        assert!(row.archive_id > 0);

        // Rows are gone from the store but present in the file.
        assert_eq!(store.max_audit_id().await.unwrap(), 0);
        let (_, tables) = read_archive(Path::new(&row.archive_path)).unwrap();
        assert_eq!(tables[0].rows.len(), 3);
        std::fs::remove_dir_all(dir).ok();
    }
}
