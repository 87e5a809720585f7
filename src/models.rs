use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// A posting as handed over by a source. Fields may be missing on malformed pages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobPosting {
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "url")]
    pub source_url: Option<String>,
}

impl JobPosting {
    #[cfg(test)]
    pub fn new(company: &str, title: &str, description: &str, source_url: &str) -> Self {
        Self {
            company: Some(company.to_string()),
            title: Some(title.to_string()),
            description: Some(description.to_string()),
            source_url: Some(source_url.to_string()),
        }
    }

    pub fn company_name(&self) -> &str {
        stored_text(self.company.as_deref())
    }

    pub fn title_text(&self) -> &str {
        stored_text(self.title.as_deref())
    }

    pub fn description_text(&self) -> &str {
        self.description.as_deref().unwrap_or("")
    }

    /// Empty descriptions and the scrapers' "unknown" marker both count as missing.
    pub fn has_description(&self) -> bool {
        let text = self.description_text().trim();
        !text.is_empty() && !text.eq_ignore_ascii_case("unknown")
    }

    pub fn fingerprint(&self) -> String {
        crate::hasher::fingerprint(
            self.company.as_deref(),
            self.title.as_deref(),
            self.description.as_deref(),
        )
    }
}

/// Missing and blank fields are stored as the same placeholder they hash as.
fn stored_text(field: Option<&str>) -> &str {
    match field {
        Some(text) if !text.trim().is_empty() => text,
        _ => crate::hasher::ABSENT_FIELD,
    }
}

// --- Generation result ---
//
// The backend is untrusted: every field is optional and decoded leniently. Accessors below are
// the one place that decides what a missing value means.

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    #[serde(default, deserialize_with = "lenient_section")]
    pub metadata: JobDetails,
    #[serde(default, deserialize_with = "lenient_section")]
    pub scores: Scores,
    #[serde(default, deserialize_with = "lenient_section")]
    pub analysis: Analysis,
    #[serde(default, deserialize_with = "lenient_section")]
    pub files: GeneratedFiles,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobDetails {
    #[serde(default, deserialize_with = "lenient_string")]
    pub salary: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub country: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub work_model: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub benefits: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub apply_instructions: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scores {
    #[serde(default, deserialize_with = "lenient_score")]
    pub original: Option<f64>,
    #[serde(default, deserialize_with = "lenient_score")]
    pub tailored: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    #[serde(default, deserialize_with = "lenient_string")]
    pub fit_report: Option<String>,
    #[serde(default, deserialize_with = "lenient_list")]
    pub gaps: Vec<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub mitigation_strategy: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeneratedFiles {
    #[serde(default, deserialize_with = "lenient_string")]
    pub tailored_resume_md: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub cover_letter_md: Option<String>,
}

impl GenerationResult {
    pub fn resume_markdown(&self) -> &str {
        self.files.tailored_resume_md.as_deref().unwrap_or("")
    }

    pub fn cover_letter_markdown(&self) -> &str {
        self.files.cover_letter_md.as_deref().unwrap_or("")
    }

    #[cfg(test)]
    pub fn original_score(&self) -> f64 {
        self.scores.original.unwrap_or(0.0)
    }

    #[cfg(test)]
    pub fn tailored_score(&self) -> f64 {
        self.scores.tailored.unwrap_or(0.0)
    }

    pub fn apply_instructions(&self) -> &str {
        self.metadata
            .apply_instructions
            .as_deref()
            .unwrap_or("Verify application link.")
    }

    pub fn fit_report(&self) -> &str {
        self.analysis.fit_report.as_deref().unwrap_or("")
    }

    pub fn mitigation_strategy(&self) -> &str {
        self.analysis.mitigation_strategy.as_deref().unwrap_or("")
    }
}

/// A section that is missing, `null` or not an object decodes as its default.
fn lenient_section<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(value @ Value::Object(_)) => serde_json::from_value(value).unwrap_or_default(),
        _ => T::default(),
    })
}

fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(value_text)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    }
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(value) => Some(value_text(&value)),
    })
}

fn lenient_score<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => {
            // "8", "8.5", "8/10"
            let head = s.split('/').next().unwrap_or("").trim();
            head.parse::<f64>().ok()
        }
        _ => None,
    })
}

fn lenient_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Array(items)) => items
            .iter()
            .map(value_text)
            .filter(|s| !s.trim().is_empty())
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s],
        _ => Vec::new(),
    })
}

// --- Persisted record (metadata.json) ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMetadata {
    pub application_meta: ApplicationMeta,
    pub job_info: JobInfo,
    pub evaluation: Evaluation,
    pub generated_content: GeneratedContent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationMeta {
    pub job_hash: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    pub company: String,
    pub title: String,
    pub salary: Option<String>,
    pub country: Option<String>,
    pub work_model: Option<String>,
    pub benefits: Option<String>,
    pub url: Option<String>,
    pub apply_method: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub original_score: Option<f64>,
    pub tailored_score: Option<f64>,
    pub gaps: Vec<String>,
    pub fit_analysis: Option<String>,
    pub mitigation_strategy: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedContent {
    pub resume_markdown: Option<String>,
    pub cover_letter_markdown: Option<String>,
    pub job_description_raw: Option<String>,
}

impl JobMetadata {
    pub fn build(
        posting: &JobPosting,
        result: &GenerationResult,
        fingerprint: &str,
        timestamp: String,
    ) -> Self {
        Self {
            application_meta: ApplicationMeta {
                job_hash: fingerprint.to_string(),
                timestamp,
            },
            job_info: JobInfo {
                company: posting.company_name().to_string(),
                title: posting.title_text().to_string(),
                salary: result.metadata.salary.clone(),
                country: result.metadata.country.clone(),
                work_model: result.metadata.work_model.clone(),
                benefits: result.metadata.benefits.clone(),
                url: posting.source_url.clone(),
                apply_method: result.metadata.apply_instructions.clone(),
            },
            evaluation: Evaluation {
                original_score: result.scores.original,
                tailored_score: result.scores.tailored,
                gaps: result.analysis.gaps.clone(),
                fit_analysis: result.analysis.fit_report.clone(),
                mitigation_strategy: result.analysis.mitigation_strategy.clone(),
            },
            generated_content: GeneratedContent {
                resume_markdown: result.files.tailored_resume_md.clone(),
                cover_letter_markdown: result.files.cover_letter_md.clone(),
                job_description_raw: posting.description.clone(),
            },
        }
    }
}
