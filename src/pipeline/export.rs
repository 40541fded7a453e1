//! Export files for a statistical package: CSV, Parquet and a JSON codebook.
//!
//! Files are rendered in memory on the blocking pool, then each one is
//! committed with an atomic write, so a crash never leaves a torn file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use arrow::array::{ArrayRef, Float64Builder, StringBuilder};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;

use crate::pipeline::stages::StatisticalPackage;
use crate::storage::{canonical_json_pretty, write_atomic};

/// Leading columns of every export row; framework names may not reuse them.
pub const ID_COLUMNS: [&str; 4] = ["document_id", "document_hash", "analysis_hash", "model_used"];

pub const CSV_FILE: &str = "data.csv";
pub const PARQUET_FILE: &str = "data.parquet";
pub const CODEBOOK_FILE: &str = "codebook.json";

/// Writes every export file for `package` into `dir`.
pub async fn write_package(package: StatisticalPackage, dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let rows = package.rows.len();
    let rendered = tokio::task::spawn_blocking(move || render_package(&package))
        .await
        .context("export renderer panicked")??;

    let mut written = Vec::with_capacity(rendered.len());
    for (name, bytes) in rendered {
        let path = dir.join(name);
        write_atomic(&path, &bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        written.push(path);
    }

    tracing::debug!(dir = %dir.display(), rows, "Export files written");
    Ok(written)
}

/// Renders every export file, keyed by file name.
pub fn render_package(package: &StatisticalPackage) -> anyhow::Result<Vec<(&'static str, Vec<u8>)>> {
    Ok(vec![
        (CSV_FILE, render_csv(package)?),
        (PARQUET_FILE, render_parquet(package)?),
        (CODEBOOK_FILE, canonical_json_pretty(&package.codebook)?),
    ])
}

/// One row per document; undefined values are empty cells.
pub fn render_csv(package: &StatisticalPackage) -> anyhow::Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(Vec::new());

    let header = ID_COLUMNS
        .iter()
        .map(|c| c.to_string())
        .chain(package.codebook.iter().map(|c| c.name.clone()));
    writer.write_record(header)?;

    for row in &package.rows {
        let mut record = vec![
            row.document_id.clone(),
            row.document_hash.to_string(),
            row.analysis_hash.to_string(),
            row.model_used.clone(),
        ];
        for column in &package.codebook {
            let cell = row
                .values
                .get(&column.name)
                .copied()
                .flatten()
                .map(|v| v.to_string())
                .unwrap_or_default();
            record.push(cell);
        }
        writer.write_record(&record)?;
    }

    writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("Failed to flush CSV: {}", e.error()))
}

/// Arrow schema of the dataset table.
pub fn dataset_schema(package: &StatisticalPackage) -> Schema {
    let ids = ID_COLUMNS.iter().map(|name| Field::new(*name, DataType::Utf8, false));
    let numeric = package
        .codebook
        .iter()
        .map(|c| Field::new(c.name.as_str(), DataType::Float64, true));
    Schema::new(ids.chain(numeric).collect::<Vec<_>>())
}

/// Converts the package rows into an Arrow RecordBatch.
pub fn package_to_record_batch(package: &StatisticalPackage) -> anyhow::Result<RecordBatch> {
    let schema = Arc::new(dataset_schema(package));

    let mut document_id = StringBuilder::new();
    let mut document_hash = StringBuilder::new();
    let mut analysis_hash = StringBuilder::new();
    let mut model_used = StringBuilder::new();
    let mut numeric: Vec<Float64Builder> = package.codebook.iter().map(|_| Float64Builder::new()).collect();

    for row in &package.rows {
        document_id.append_value(&row.document_id);
        document_hash.append_value(row.document_hash.as_str());
        analysis_hash.append_value(row.analysis_hash.as_str());
        model_used.append_value(&row.model_used);

        for (column, builder) in package.codebook.iter().zip(numeric.iter_mut()) {
            match row.values.get(&column.name).copied().flatten() {
                Some(v) => builder.append_value(v),
                None => builder.append_null(),
            }
        }
    }

    let mut columns: Vec<ArrayRef> = vec![
        Arc::new(document_id.finish()),
        Arc::new(document_hash.finish()),
        Arc::new(analysis_hash.finish()),
        Arc::new(model_used.finish()),
    ];
    columns.extend(numeric.into_iter().map(|mut b| Arc::new(b.finish()) as ArrayRef));

    RecordBatch::try_new(schema, columns).map_err(|e| anyhow::anyhow!("Failed to create RecordBatch: {}", e))
}

/// Renders the dataset as ZSTD-compressed Parquet.
pub fn render_parquet(package: &StatisticalPackage) -> anyhow::Result<Vec<u8>> {
    let batch = package_to_record_batch(package)?;
    let props = WriterProperties::builder()
        .set_compression(Compression::ZSTD(Default::default()))
        .build();

    let mut writer = ArrowWriter::try_new(Vec::new(), batch.schema(), Some(props))?;
    writer.write(&batch)?;
    Ok(writer.into_inner()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::stages::statistics::{CodebookEntry, ColumnKind, DatasetRow};
    use crate::storage::ContentHash;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn package() -> StatisticalPackage {
        let mut values = BTreeMap::new();
        values.insert("warmth".to_string(), Some(1.5));
        values.insert("ratio".to_string(), None);
        StatisticalPackage {
            experiment: "x".into(),
            framework: "tone".into(),
            framework_version: "1.0.0".into(),
            codebook: vec![
                CodebookEntry {
                    name: "warmth".into(),
                    kind: ColumnKind::Dimension,
                    source: "warmth".into(),
                    description: String::new(),
                },
                CodebookEntry {
                    name: "ratio".into(),
                    kind: ColumnKind::Derived,
                    source: "ratio(warmth, warmth)".into(),
                    description: String::new(),
                },
            ],
            rows: vec![DatasetRow {
                document_id: "a".into(),
                document_hash: ContentHash::of_bytes(b"a"),
                analysis_hash: ContentHash::of_bytes(b"x"),
                model_used: "m".into(),
                values,
            }],
            summaries: BTreeMap::new(),
            excluded_documents: Vec::new(),
            analysis_hashes: Vec::new(),
        }
    }

    #[test]
    fn test_csv_leaves_undefined_cells_empty() {
        let text = String::from_utf8(render_csv(&package()).unwrap()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "document_id,document_hash,analysis_hash,model_used,warmth,ratio");
        assert!(lines[1].starts_with("a,"));
        assert!(lines[1].ends_with(",m,1.5,"));
    }

    #[test]
    fn test_record_batch_shape() {
        let batch = package_to_record_batch(&package()).unwrap();
        assert_eq!(batch.num_rows(), 1);
        assert_eq!(batch.num_columns(), 6);
        assert_eq!(batch.column(5).null_count(), 1);
    }

    #[test]
    fn test_parquet_has_magic_footer() {
        let bytes = render_parquet(&package()).unwrap();
        assert!(bytes.starts_with(b"PAR1"));
        assert!(bytes.ends_with(b"PAR1"));
    }

    #[tokio::test]
    async fn test_write_package_replaces_torn_files() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("exports");
        std::fs::create_dir_all(&out).unwrap();
        std::fs::write(out.join(CSV_FILE), b"document_id,docu").unwrap();

        let files = write_package(package(), &out).await.unwrap();
        assert_eq!(files.len(), 3);
        assert!(files.iter().all(|f| f.exists()));

        let csv = std::fs::read(out.join(CSV_FILE)).unwrap();
        assert_eq!(csv, render_csv(&package()).unwrap());

        // Only the committed files remain; no temporary siblings.
        let mut names: Vec<String> = std::fs::read_dir(&out)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, [CODEBOOK_FILE, CSV_FILE, PARQUET_FILE]);
    }
}
