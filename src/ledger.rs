use serde::Deserialize;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::hasher;
use crate::models::JobMetadata;

pub const FINGERPRINT_COLUMN: &str = "job_hash";
pub const RESUME_COLUMN: &str = "resume_content_md";
pub const COVER_LETTER_COLUMN: &str = "cover_letter_md";
pub const INITIAL_STATUS: &str = "Generated";

const LEGACY_ID_COLUMN: &str = "app_id";

pub const COLUMNS: [&str; 22] = [
    "job_hash",
    "date_generated",
    "company",
    "title",
    "salary",
    "country",
    "work_model",
    "apply_method",
    "url",
    "original_score",
    "tailored_score",
    "gaps",
    "mitigation_strategy",
    "resume_content_md",
    "cover_letter_md",
    "job_description_raw",
    "status",
    "applied_date",
    "contact_person",
    "interview_date",
    "next_steps",
    "notes",
];

/// One ledger line. The last five columns belong to the user and start out blank.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct LedgerRow {
    pub job_hash: String,
    pub date_generated: String,
    pub company: String,
    pub title: String,
    pub salary: String,
    pub country: String,
    pub work_model: String,
    pub apply_method: String,
    pub url: String,
    pub original_score: String,
    pub tailored_score: String,
    pub gaps: String,
    pub mitigation_strategy: String,
    pub resume_content_md: String,
    pub cover_letter_md: String,
    pub job_description_raw: String,
    pub status: String,
    pub applied_date: String,
    pub contact_person: String,
    pub interview_date: String,
    pub next_steps: String,
    pub notes: String,
}

fn score_text(score: Option<f64>) -> String {
    score.map(|s| s.to_string()).unwrap_or_default()
}

impl LedgerRow {
    pub fn from_metadata(metadata: &JobMetadata) -> Self {
        let info = &metadata.job_info;
        let evaluation = &metadata.evaluation;
        let content = &metadata.generated_content;

        Self {
            job_hash: metadata.application_meta.job_hash.clone(),
            date_generated: metadata.application_meta.timestamp.clone(),
            company: info.company.clone(),
            title: info.title.clone(),
            salary: info.salary.clone().unwrap_or_default(),
            country: info.country.clone().unwrap_or_default(),
            work_model: info.work_model.clone().unwrap_or_default(),
            apply_method: info.apply_method.clone().unwrap_or_default(),
            url: info.url.clone().unwrap_or_default(),
            original_score: score_text(evaluation.original_score),
            tailored_score: score_text(evaluation.tailored_score),
            gaps: evaluation.gaps.join("|"),
            mitigation_strategy: evaluation.mitigation_strategy.clone().unwrap_or_default(),
            resume_content_md: content.resume_markdown.clone().unwrap_or_default(),
            cover_letter_md: content.cover_letter_markdown.clone().unwrap_or_default(),
            job_description_raw: content.job_description_raw.clone().unwrap_or_default(),
            status: INITIAL_STATUS.to_string(),
            ..Default::default()
        }
    }

    fn value(&self, column: &str) -> &str {
        match column {
            "job_hash" => &self.job_hash,
            "date_generated" => &self.date_generated,
            "company" => &self.company,
            "title" => &self.title,
            "salary" => &self.salary,
            "country" => &self.country,
            "work_model" => &self.work_model,
            "apply_method" => &self.apply_method,
            "url" => &self.url,
            "original_score" => &self.original_score,
            "tailored_score" => &self.tailored_score,
            "gaps" => &self.gaps,
            "mitigation_strategy" => &self.mitigation_strategy,
            "resume_content_md" => &self.resume_content_md,
            "cover_letter_md" => &self.cover_letter_md,
            "job_description_raw" => &self.job_description_raw,
            "status" => &self.status,
            "applied_date" => &self.applied_date,
            "contact_person" => &self.contact_person,
            "interview_date" => &self.interview_date,
            "next_steps" => &self.next_steps,
            "notes" => &self.notes,
            _ => "",
        }
    }
}

/// The CSV master log. Single writer: this process.
#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
}

impl Ledger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn has_content(&self) -> bool {
        fs::metadata(&self.path).map(|m| m.len() > 0).unwrap_or(false)
    }

    fn reader(&self) -> Result<csv::Reader<File>> {
        Ok(csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(&self.path)?)
    }

    fn column(headers: &csv::StringRecord, name: &str) -> Option<usize> {
        headers.iter().position(|h| h.trim() == name)
    }

    /// Dedup gate lookup.
    pub fn contains(&self, fingerprint: &str) -> Result<bool> {
        if !self.has_content() {
            return Ok(false);
        }

        let mut reader = self.reader()?;
        let headers = reader.headers()?.clone();
        let Some(idx) = Self::column(&headers, FINGERPRINT_COLUMN) else {
            warn!(ledger = %self.path.display(), "Ledger has no '{}' column", FINGERPRINT_COLUMN);
            return Ok(false);
        };

        for record in reader.records() {
            let record = record?;
            if record.get(idx).map(str::trim) == Some(fingerprint) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Appends one row, writing the header first when the ledger is new.
    ///
    /// An existing ledger keeps its own column order; columns this crate does not know get blanks.
    pub fn append(&self, row: &LedgerRow) -> Result<()> {
        let existing = self.has_content();

        let header: Vec<String> = if existing {
            let mut reader = self.reader()?;
            reader.headers()?.iter().map(|h| h.trim().to_string()).collect()
        } else {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            COLUMNS.iter().map(|c| c.to_string()).collect()
        };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&self.path)?;

        if existing && !ends_with_newline(&mut file)? {
            file.write_all(b"\n")?;
        }

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);

        if !existing {
            writer.write_record(&header)?;
        }
        writer.write_record(header.iter().map(|column| row.value(column)))?;
        writer.flush()?;

        debug!(job_hash = %hasher::short(&row.job_hash), "Ledger row appended");
        Ok(())
    }

    /// Rewrites the two content columns of every row carrying `fingerprint`.
    ///
    /// Returns how many rows matched. Nothing else in the ledger changes.
    pub fn update_content(&self, fingerprint: &str, resume: &str, cover_letter: &str) -> Result<usize> {
        if !self.has_content() {
            return Ok(0);
        }

        let mut reader = self.reader()?;
        let headers = reader.headers()?.clone();
        let (Some(hash_idx), Some(resume_idx), Some(cover_idx)) = (
            Self::column(&headers, FINGERPRINT_COLUMN),
            Self::column(&headers, RESUME_COLUMN),
            Self::column(&headers, COVER_LETTER_COLUMN),
        ) else {
            warn!(ledger = %self.path.display(), "Ledger is missing fingerprint or content columns");
            return Ok(0);
        };

        let mut rows: Vec<Vec<String>> = Vec::new();
        let mut matched = 0;

        for record in reader.records() {
            let mut fields: Vec<String> = record?.iter().map(str::to_string).collect();
            if fields.get(hash_idx).map(|h| h.trim()) == Some(fingerprint) {
                let width = resume_idx.max(cover_idx) + 1;
                if fields.len() < width {
                    fields.resize(width, String::new());
                }
                fields[resume_idx] = resume.to_string();
                fields[cover_idx] = cover_letter.to_string();
                matched += 1;
            }
            rows.push(fields);
        }

        if matched > 0 {
            self.replace_all(&headers.iter().collect::<Vec<_>>(), &rows)?;
        }
        Ok(matched)
    }

    pub fn rows(&self) -> Result<Vec<LedgerRow>> {
        if !self.has_content() {
            return Ok(Vec::new());
        }
        let mut reader = self.reader()?;
        let mut rows = Vec::new();
        for row in reader.deserialize::<LedgerRow>() {
            rows.push(row?);
        }
        Ok(rows)
    }

    /// Recomputes the fingerprint of every row and moves it to the first column.
    ///
    /// The previous file is kept as `<ledger>.bak`. A legacy `app_id` column is dropped.
    pub fn rehash(&self) -> Result<usize> {
        let mut reader = self.reader()?;
        let headers = reader.headers()?.clone();

        let company_idx = Self::column(&headers, "company");
        let title_idx = Self::column(&headers, "title");
        let description_idx = Self::column(&headers, "job_description_raw")
            .or_else(|| Self::column(&headers, "job_description"));

        let kept: Vec<usize> = (0..headers.len())
            .filter(|&i| {
                let name = headers.get(i).unwrap_or("").trim();
                name != FINGERPRINT_COLUMN && name != LEGACY_ID_COLUMN
            })
            .collect();

        let mut new_headers = vec![FINGERPRINT_COLUMN];
        new_headers.extend(kept.iter().filter_map(|&i| headers.get(i)));

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            let field = |idx: Option<usize>| idx.and_then(|i| record.get(i));
            let fingerprint =
                hasher::fingerprint(field(company_idx), field(title_idx), field(description_idx));

            let mut fields = vec![fingerprint];
            fields.extend(kept.iter().map(|&i| record.get(i).unwrap_or("").to_string()));
            rows.push(fields);
        }

        let backup = backup_path(&self.path);
        fs::copy(&self.path, &backup)?;
        self.replace_all(&new_headers, &rows)?;

        info!(rows = rows.len(), backup = %backup.display(), "Ledger fingerprints recomputed");
        Ok(rows.len())
    }

    /// Writes a full ledger to a sibling temp file and swaps it in.
    fn replace_all(&self, headers: &[&str], rows: &[Vec<String>]) -> Result<()> {
        let tmp = self.path.with_extension("csv.tmp");
        {
            let mut writer = csv::WriterBuilder::new()
                .flexible(true)
                .from_path(&tmp)?;
            writer.write_record(headers)?;
            for row in rows {
                writer.write_record(row)?;
            }
            writer.flush()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".bak");
    PathBuf::from(name)
}

fn ends_with_newline(file: &mut File) -> std::io::Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}
