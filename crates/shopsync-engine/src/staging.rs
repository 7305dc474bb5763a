//! Staged batches and their on-disk handoff between extract-only and
//! load-only runs.
//!
//! Per dataset the staging directory holds `<dataset>.csv` (header row of
//! normalized column names, one row per record, null as an empty cell), one
//! `<dataset>.<suffix>.csv` per child table, and a
//! `<dataset>.manifest.json` sidecar with column types, the primary key and
//! the candidate watermark. The manifest is written last; a batch without
//! one is not staged.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shopsync_types::dataset::{ChildTableSpec, DatasetKind};
use shopsync_types::record::{FieldValue, NormalizedRecord, Record};
use shopsync_types::schema::TableSchema;
use shopsync_types::watermark::Watermark;

/// Normalized record set for one dataset, the handoff unit between the
/// extract and load phases.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedBatch {
    pub dataset: DatasetKind,
    pub table: String,
    pub schema: TableSchema,
    pub records: Vec<Record>,
    pub children: Vec<ChildBatch>,
    /// Highest cursor observed during extraction; committed after load.
    pub candidate_watermark: Watermark,
}

impl StagedBatch {
    #[must_use]
    pub fn rows(&self) -> Vec<NormalizedRecord> {
        self.records.iter().map(|r| r.row().clone()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Rows moved out of one array field into a child table.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildBatch {
    pub spec: ChildTableSpec,
    pub table: String,
    pub schema: TableSchema,
    pub rows: Vec<NormalizedRecord>,
}

#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    #[error("no staged batch for {dataset} at {}", .path.display())]
    NotFound { dataset: DatasetKind, path: PathBuf },
    #[error("staging i/o error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("staging csv error at {}: {source}", .path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("invalid staging manifest at {}: {source}", .path.display())]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("staged file {} does not match its manifest: {message}", .path.display())]
    Inconsistent { path: PathBuf, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StagingManifest {
    dataset: DatasetKind,
    table: String,
    schema: TableSchema,
    candidate_watermark: Watermark,
    row_count: usize,
    #[serde(default)]
    child_tables: Vec<ChildManifest>,
    staged_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ChildManifest {
    spec: ChildTableSpec,
    table: String,
    schema: TableSchema,
    row_count: usize,
}

/// Directory of staged batches. Blocking; async callers use
/// `spawn_blocking`.
#[derive(Debug, Clone)]
pub struct StagingArea {
    dir: PathBuf,
}

impl StagingArea {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn data_path(&self, dataset: DatasetKind) -> PathBuf {
        self.dir.join(format!("{dataset}.csv"))
    }

    #[must_use]
    pub fn manifest_path(&self, dataset: DatasetKind) -> PathBuf {
        self.dir.join(format!("{dataset}.manifest.json"))
    }

    fn child_path(&self, dataset: DatasetKind, spec: &ChildTableSpec) -> PathBuf {
        self.dir.join(format!("{dataset}.{}.csv", spec.table_suffix))
    }

    /// Whether a complete batch is staged for `dataset`.
    #[must_use]
    pub fn exists(&self, dataset: DatasetKind) -> bool {
        self.manifest_path(dataset).is_file() && self.data_path(dataset).is_file()
    }

    /// Persist a batch, replacing any batch already staged for its dataset.
    ///
    /// # Errors
    ///
    /// Returns a [`StagingError`] if any file cannot be written.
    pub fn write(&self, batch: &StagedBatch) -> Result<(), StagingError> {
        fs::create_dir_all(&self.dir).map_err(|source| StagingError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let manifest_path = self.manifest_path(batch.dataset);
        remove_if_present(&manifest_path)?;

        let mut child_tables = Vec::with_capacity(batch.children.len());
        for child in &batch.children {
            write_csv(
                &self.child_path(batch.dataset, &child.spec),
                &child.schema,
                child.rows.iter(),
            )?;
            child_tables.push(ChildManifest {
                spec: child.spec.clone(),
                table: child.table.clone(),
                schema: child.schema.clone(),
                row_count: child.rows.len(),
            });
        }
        write_csv(
            &self.data_path(batch.dataset),
            &batch.schema,
            batch.records.iter().map(Record::row),
        )?;

        let manifest = StagingManifest {
            dataset: batch.dataset,
            table: batch.table.clone(),
            schema: batch.schema.clone(),
            candidate_watermark: batch.candidate_watermark.clone(),
            row_count: batch.records.len(),
            child_tables,
            staged_at: Utc::now(),
        };
        let encoded =
            serde_json::to_vec_pretty(&manifest).map_err(|source| StagingError::Manifest {
                path: manifest_path.clone(),
                source,
            })?;
        write_atomic(&manifest_path, |file| {
            io::Write::write_all(file, &encoded).map_err(csv::Error::from)
        })
    }

    /// Read the batch staged for `dataset`.
    ///
    /// # Errors
    ///
    /// Returns [`StagingError::NotFound`] when no complete batch is staged,
    /// or another [`StagingError`] if the files cannot be decoded.
    pub fn read(&self, dataset: DatasetKind) -> Result<StagedBatch, StagingError> {
        let manifest_path = self.manifest_path(dataset);
        let raw = match fs::read(&manifest_path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StagingError::NotFound {
                    dataset,
                    path: manifest_path,
                })
            }
            Err(source) => {
                return Err(StagingError::Io {
                    path: manifest_path,
                    source,
                })
            }
        };
        let manifest: StagingManifest =
            serde_json::from_slice(&raw).map_err(|source| StagingError::Manifest {
                path: manifest_path.clone(),
                source,
            })?;
        if manifest.dataset != dataset {
            return Err(StagingError::Inconsistent {
                path: manifest_path,
                message: format!("manifest is for {}", manifest.dataset),
            });
        }

        let rows = read_csv(dataset, &self.data_path(dataset), &manifest.schema)?;
        if rows.len() != manifest.row_count {
            return Err(StagingError::Inconsistent {
                path: self.data_path(dataset),
                message: format!("expected {} rows, found {}", manifest.row_count, rows.len()),
            });
        }

        let mut children = Vec::with_capacity(manifest.child_tables.len());
        for child in manifest.child_tables {
            let path = self.child_path(dataset, &child.spec);
            let rows = read_csv(dataset, &path, &child.schema)?;
            children.push(ChildBatch {
                spec: child.spec,
                table: child.table,
                schema: child.schema,
                rows,
            });
        }

        Ok(StagedBatch {
            dataset,
            table: manifest.table,
            schema: manifest.schema,
            records: rows.into_iter().map(|row| Record::new(dataset, row)).collect(),
            children,
            candidate_watermark: manifest.candidate_watermark,
        })
    }

    /// Delete the batch staged for `dataset`. Missing files are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`StagingError::Io`] if a present file cannot be removed.
    pub fn remove(&self, dataset: DatasetKind) -> Result<(), StagingError> {
        let manifest_path = self.manifest_path(dataset);
        if let Ok(raw) = fs::read(&manifest_path) {
            if let Ok(manifest) = serde_json::from_slice::<StagingManifest>(&raw) {
                for child in &manifest.child_tables {
                    remove_if_present(&self.child_path(dataset, &child.spec))?;
                }
            }
        }
        remove_if_present(&manifest_path)?;
        remove_if_present(&self.data_path(dataset))
    }
}

fn remove_if_present(path: &Path) -> Result<(), StagingError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(StagingError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Write through a temp file in the same directory, then rename over `path`.
fn write_atomic(
    path: &Path,
    fill: impl FnOnce(&mut fs::File) -> Result<(), csv::Error>,
) -> Result<(), StagingError> {
    let mut tmp_name = path.file_name().map(ToOwned::to_owned).unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let io_err = |source: io::Error| StagingError::Io {
        path: tmp.clone(),
        source,
    };
    let mut file = fs::File::create(&tmp).map_err(io_err)?;
    if let Err(source) = fill(&mut file) {
        let _ = fs::remove_file(&tmp);
        return Err(StagingError::Csv { path: tmp, source });
    }
    file.sync_all().map_err(io_err)?;
    drop(file);
    fs::rename(&tmp, path).map_err(|source| StagingError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn write_csv<'a>(
    path: &Path,
    schema: &TableSchema,
    rows: impl Iterator<Item = &'a NormalizedRecord>,
) -> Result<(), StagingError> {
    write_atomic(path, |file| {
        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(schema.column_names())?;
        for row in rows {
            writer.write_record(schema.columns.iter().map(|column| {
                row.get(&column.name)
                    .map(FieldValue::to_cell)
                    .unwrap_or_default()
            }))?;
        }
        writer.flush()?;
        Ok(())
    })
}

fn read_csv(
    dataset: DatasetKind,
    path: &Path,
    schema: &TableSchema,
) -> Result<Vec<NormalizedRecord>, StagingError> {
    let csv_err = |source: csv::Error| StagingError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = match csv::Reader::from_path(path) {
        Ok(reader) => reader,
        Err(err) => {
            if let csv::ErrorKind::Io(io_err) = err.kind() {
                if io_err.kind() == io::ErrorKind::NotFound {
                    return Err(StagingError::NotFound {
                        dataset,
                        path: path.to_path_buf(),
                    });
                }
            }
            return Err(csv_err(err));
        }
    };

    let headers = reader.headers().map_err(csv_err)?.clone();
    let mut columns = Vec::with_capacity(headers.len());
    for header in &headers {
        let spec = schema
            .column(header)
            .ok_or_else(|| StagingError::Inconsistent {
                path: path.to_path_buf(),
                message: format!("column '{header}' is not in the manifest"),
            })?;
        columns.push((spec.name.clone(), spec.column_type));
    }

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(csv_err)?;
        rows.push(
            columns
                .iter()
                .zip(record.iter())
                .map(|((name, ty), cell)| (name.clone(), FieldValue::from_cell(*ty, cell)))
                .collect(),
        );
    }
    Ok(rows)
}
