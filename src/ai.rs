use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{PipelineError, Result};
use crate::keys::{ClientConfig, KeyRotationManager};
use crate::models::GenerationResult;

// --- Backend trait ---

pub trait GenerationBackend {
    /// Sends one prompt and returns the raw text of the reply, asking for a JSON body.
    fn generate(&self, config: &ClientConfig, prompt: &str) -> anyhow::Result<String>;
}

// --- Gemini backend ---

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

#[derive(Debug, Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    response_mime_type: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Deserialize)]
struct GeminiResponsePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponseContent {
    #[serde(default)]
    parts: Vec<GeminiResponsePart>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiResponseContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug)]
pub struct GeminiBackend {
    client: reqwest::blocking::Client,
}

impl GeminiBackend {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(180))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }
}

impl GenerationBackend for GeminiBackend {
    fn generate(&self, config: &ClientConfig, prompt: &str) -> anyhow::Result<String> {
        let request = GeminiRequest {
            contents: vec![GeminiContent {
                parts: vec![GeminiPart {
                    text: prompt.to_string(),
                }],
            }],
            generation_config: GeminiGenerationConfig {
                response_mime_type: "application/json".to_string(),
            },
        };

        let url = format!("{}/{}:generateContent", GEMINI_API_BASE, config.model);
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &config.api_key)
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .context("Failed to send request to Gemini API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().unwrap_or_default();
            return Err(anyhow!(
                "Gemini API request failed with status {}: {}",
                status,
                error_text
            ));
        }

        let api_response: GeminiResponse = response
            .json()
            .context("Failed to parse Gemini API response")?;

        let text = api_response
            .candidates
            .into_iter()
            .next()
            .and_then(|candidate| candidate.content)
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|part| part.text)
                    .collect::<String>()
            })
            .ok_or_else(|| anyhow!("No candidates in Gemini API response"))?;

        Ok(text)
    }
}

// --- Prompt ---

const PROMPT_TEMPLATE: &str = r#"Act as an expert ATS recruiter. Target Role: {job_title} at {company}.

Instructions below are incremental; apply all of them.
If the job description is written in a language other than the resume, mention it in the gaps and do not translate.

STEP 1: DATA EXTRACTION
Extract these fields from the job description. If not found, write "Not Listed".
- Salary: hourly or annual ranges.
- Country: the primary country of the role.
- Work Model: Remote, Hybrid, or On-Site.
- Benefits: key perks.
- Apply Instructions: how to apply (link, email, portal name, or "Easy Apply").

RESUME REWRITE RULES:
1. Keep every work experience. Condense older or less relevant roles instead of removing them.
2. Tailor through emphasis using the job description keywords, without inventing anything.
3. Keep titles, companies and dates exactly as in the resume.
4. Do not add new sections.

SCORING:
- 10/10 only when every required and preferred skill is met.
- 7/10 when all required skills are met but preferred ones are missing.
- 5/10 when key required skills are missing.

TASKS:
1. Rate the original resume (0-10).
2. Rewrite the resume to be as close as possible to a 10/10 match under the rules above.
3. Rate the tailored version (0-10).
4. List specific skill gaps and a mitigation strategy.
5. Write a cover letter in Markdown.
6. Write a brief fit analysis.

OUTPUT ONLY VALID JSON with this exact structure:
{
    "metadata": {"salary": "", "country": "", "work_model": "", "benefits": "", "apply_instructions": ""},
    "scores": {"original": 0, "tailored": 0},
    "analysis": {"fit_report": "", "gaps": [], "mitigation_strategy": ""},
    "files": {"tailored_resume_md": "", "cover_letter_md": ""}
}

JD: {job_description}
Resume: {resume_text}
"#;

/// Fills the template placeholders in a single pass, so braces inside the inserted values are
/// copied as they are.
pub fn build_prompt(title: &str, company: &str, description: &str, resume: &str) -> String {
    let mut prompt =
        String::with_capacity(PROMPT_TEMPLATE.len() + description.len() + resume.len());
    let mut rest = PROMPT_TEMPLATE;

    while let Some(open) = rest.find('{') {
        prompt.push_str(&rest[..open]);
        let tail = &rest[open + 1..];
        let value = tail.split_once('}').and_then(|(name, _)| {
            let value = match name {
                "job_title" => title,
                "company" => company,
                "job_description" => description,
                "resume_text" => resume,
                _ => return None,
            };
            Some((name.len(), value))
        });
        match value {
            Some((len, value)) => {
                prompt.push_str(value);
                rest = &tail[len + 1..];
            }
            None => {
                prompt.push('{');
                rest = tail;
            }
        }
    }
    prompt.push_str(rest);
    prompt
}

// --- Response handling ---

const QUOTA_MARKERS: [&str; 4] = ["429", "quota", "limit", "resource_exhausted"];

/// True when a backend failure looks like rate limiting or quota exhaustion.
pub fn is_quota_error(error: &anyhow::Error) -> bool {
    let message = format!("{:#}", error).to_lowercase();
    QUOTA_MARKERS.iter().any(|marker| message.contains(marker))
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let body = match rest.split_once('\n') {
        Some((_lang, body)) => body,
        None => rest.trim_start_matches(|c: char| c.is_ascii_alphanumeric()),
    };
    let body = body.trim_end();
    body.strip_suffix("```").unwrap_or(body).trim()
}

/// First balanced `{...}` span in `text`, honouring JSON string escapes.
fn find_json_object(text: &str) -> Option<&str> {
    for (start, _) in text.match_indices('{') {
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;

        for (offset, c) in text[start..].char_indices() {
            if in_string {
                match c {
                    _ if escaped => escaped = false,
                    '\\' => escaped = true,
                    '"' => in_string = false,
                    _ => {}
                }
                continue;
            }
            match c {
                '"' => in_string = true,
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(&text[start..start + offset + 1]);
                    }
                }
                _ => {}
            }
        }
    }
    None
}

fn preview(text: &str) -> String {
    let head: String = text.chars().take(120).collect();
    if head.len() < text.len() {
        format!("{}...", head)
    } else {
        head
    }
}

/// Decodes a backend reply, tolerating code fences and chatter around the JSON object.
pub fn parse_generation_response(raw: &str) -> Result<GenerationResult> {
    let cleaned = strip_code_fence(raw.trim());

    let direct = serde_json::from_str::<Value>(cleaned)
        .ok()
        .filter(Value::is_object);

    let value = match direct {
        Some(value) => value,
        None => {
            let span = find_json_object(raw).ok_or_else(|| {
                PipelineError::MalformedResponse(format!("no JSON object in: {}", preview(raw)))
            })?;
            debug!("Recovered JSON object from surrounding text");
            serde_json::from_str::<Value>(span)
                .map_err(|e| PipelineError::MalformedResponse(e.to_string()))?
        }
    };

    serde_json::from_value(value).map_err(|e| PipelineError::MalformedResponse(e.to_string()))
}

// --- Client ---

/// One generation call with key rotation on quota failures.
///
/// Owns its key pool; it is meant to live on the dedicated generation worker, which is the only
/// place the pool and the active config are mutated.
pub struct GenerationClient {
    backend: Box<dyn GenerationBackend + Send>,
    keys: KeyRotationManager,
    config: ClientConfig,
    resume_path: PathBuf,
}

impl GenerationClient {
    pub fn new(
        backend: Box<dyn GenerationBackend + Send>,
        keys: KeyRotationManager,
        model: &str,
        resume_path: PathBuf,
    ) -> Result<Self> {
        let config = keys.client_config(model)?;
        Ok(Self {
            backend,
            keys,
            config,
            resume_path,
        })
    }

    #[cfg(test)]
    pub fn active_config(&self) -> &ClientConfig {
        &self.config
    }

    #[cfg(test)]
    pub fn keys(&self) -> &KeyRotationManager {
        &self.keys
    }

    fn read_resume(&self) -> Result<String> {
        match fs::read_to_string(&self.resume_path) {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(PipelineError::MissingInput(self.resume_path.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn process(
        &mut self,
        description: &str,
        title: &str,
        company: &str,
    ) -> Result<GenerationResult> {
        let resume = self.read_resume()?;
        let prompt = build_prompt(title, company, description, &resume);

        loop {
            debug!(model = %self.config.model, key = self.keys.position() + 1, "Calling generation backend");
            match self.backend.generate(&self.config, &prompt) {
                Ok(raw) => return parse_generation_response(&raw),
                Err(err) if is_quota_error(&err) => {
                    if self.keys.rotate() {
                        self.config = self.keys.client_config(&self.config.model)?;
                        info!(key = self.keys.position() + 1, total = self.keys.len(), "Retrying with next API key");
                        continue;
                    }
                    return Err(PipelineError::QuotaExhausted(err));
                }
                Err(err) => return Err(PipelineError::Generation(err)),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    pub const VALID_RESPONSE: &str = r##"{
        "metadata": {"salary": "Not Listed", "country": "Canada", "work_model": "Remote",
                     "benefits": "Health", "apply_instructions": "Easy Apply"},
        "scores": {"original": 6, "tailored": 9},
        "analysis": {"fit_report": "Strong SQL background.", "gaps": ["Airflow", "dbt"],
                     "mitigation_strategy": "Highlight ETL work."},
        "files": {"tailored_resume_md": "# Resume\n\nSQL expert", "cover_letter_md": "Dear team,"}
    }"##;

    /// Replays scripted replies and records the key used for each call.
    pub struct ScriptedBackend {
        replies: Mutex<VecDeque<anyhow::Result<String>>>,
        pub keys_used: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedBackend {
        pub fn new(replies: Vec<anyhow::Result<String>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                keys_used: Arc::new(Mutex::new(Vec::new())),
            }
        }

        /// Always answers with a valid result.
        pub fn always_ok() -> Self {
            Self::new(Vec::new())
        }
    }

    impl GenerationBackend for ScriptedBackend {
        fn generate(&self, config: &ClientConfig, _prompt: &str) -> anyhow::Result<String> {
            self.keys_used.lock().unwrap().push(config.api_key.clone());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(VALID_RESPONSE.to_string()))
        }
    }

    fn resume_file() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resume.txt");
        fs::write(&path, "Jane Doe - Data Engineer, 10 years SQL").unwrap();
        (dir, path)
    }

    #[test]
    fn test_is_quota_error_markers() {
        assert!(is_quota_error(&anyhow!("Gemini API request failed with status 429 Too Many Requests")));
        assert!(is_quota_error(&anyhow!("You exceeded your current QUOTA")));
        assert!(is_quota_error(&anyhow!("Rate Limit reached")));
        assert!(is_quota_error(&anyhow!("outer").context("RESOURCE_EXHAUSTED")));
        assert!(!is_quota_error(&anyhow!("connection reset by peer")));
        assert!(!is_quota_error(&anyhow!("status 500 Internal Server Error")));
    }

    #[test]
    fn test_is_quota_error_sees_context_chain() {
        let err = anyhow!("status 429").context("Gemini call failed");
        assert!(is_quota_error(&err));
    }

    #[test]
    fn test_parse_fenced_matches_unfenced() {
        let plain = parse_generation_response(VALID_RESPONSE).unwrap();
        let fenced = parse_generation_response(&format!("```json\n{}\n```", VALID_RESPONSE)).unwrap();
        let bare_fence = parse_generation_response(&format!("  ```\n{}\n```  \n", VALID_RESPONSE)).unwrap();
        assert_eq!(plain, fenced);
        assert_eq!(plain, bare_fence);
        assert_eq!(plain.tailored_score(), 9.0);
        assert_eq!(plain.analysis.gaps, vec!["Airflow", "dbt"]);
    }

    #[test]
    fn test_parse_recovers_object_from_chatter() {
        let raw = format!("Sure! Here is the result:\n{}\nGood luck {{with}} it", VALID_RESPONSE);
        let parsed = parse_generation_response(&raw).unwrap();
        assert_eq!(parsed.metadata.country.as_deref(), Some("Canada"));
    }

    #[test]
    fn test_find_json_object_ignores_braces_in_strings() {
        let text = r#"note {"a": "}{", "b": {"c": "\"}"}} trailing"#;
        assert_eq!(find_json_object(text), Some(r#"{"a": "}{", "b": {"c": "\"}"}}"#));
        assert_eq!(find_json_object("no object here"), None);
        assert_eq!(find_json_object("{ never closed"), None);
    }

    #[test]
    fn test_parse_without_json_is_malformed() {
        let result = parse_generation_response("I cannot help with that.");
        assert!(matches!(result, Err(PipelineError::MalformedResponse(_))));

        let result = parse_generation_response("[1, 2, 3]");
        assert!(matches!(result, Err(PipelineError::MalformedResponse(_))));
    }

    #[test]
    fn test_parse_keeps_files_when_a_section_has_the_wrong_type() {
        let raw = r##"{"metadata": "Not Listed", "scores": {"original": 4, "tailored": 7},
                      "analysis": null, "files": {"tailored_resume_md": "# Resume"}}"##;
        let parsed = parse_generation_response(raw).unwrap();
        assert_eq!(parsed.metadata.country, None);
        assert_eq!(parsed.tailored_score(), 7.0);
        assert_eq!(parsed.resume_markdown(), "# Resume");
    }

    #[test]
    fn test_build_prompt_fills_all_placeholders() {
        let prompt = build_prompt("Data Engineer", "Acme", "Use {company} tools", "My resume");
        assert!(prompt.contains("Target Role: Data Engineer at Acme."));
        assert!(prompt.contains("JD: Use {company} tools"));
        assert!(prompt.contains("Resume: My resume"));
        assert!(!prompt.contains("{job_title}"));
    }

    #[test]
    fn test_build_prompt_keeps_braces_in_values() {
        let prompt = build_prompt(
            "{resume_text}",
            "{job_description}",
            "Use {company} and {job_title}",
            "Resume with {job_description} inside",
        );
        assert!(prompt.contains("Target Role: {resume_text} at {job_description}."));
        assert!(prompt.contains("JD: Use {company} and {job_title}\n"));
        assert!(prompt.contains("Resume: Resume with {job_description} inside\n"));
        assert!(prompt.contains(r#""scores": {"original": 0, "tailored": 0},"#));
    }

    #[test]
    fn test_process_rotates_on_quota_errors() {
        let (_dir, resume) = resume_file();
        let backend = ScriptedBackend::new(vec![
            Err(anyhow!("Gemini API request failed with status 429 Too Many Requests")),
            Err(anyhow!("Quota exceeded for project")),
        ]);
        let keys_used = Arc::clone(&backend.keys_used);
        let keys = KeyRotationManager::from_raw("key-1,key-2,key-3").unwrap();
        let mut client =
            GenerationClient::new(Box::new(backend), keys, "gemini-2.0-flash", resume).unwrap();

        let result = client.process("5 years SQL...", "Data Engineer", "Acme").unwrap();

        assert_eq!(result.resume_markdown(), "# Resume\n\nSQL expert");
        assert_eq!(*keys_used.lock().unwrap(), vec!["key-1", "key-2", "key-3"]);
        assert_eq!(client.active_config().api_key, "key-3");
    }

    #[test]
    fn test_process_reports_exhausted_pool() {
        let (_dir, resume) = resume_file();
        let backend = ScriptedBackend::new(vec![
            Err(anyhow!("status 429")),
            Err(anyhow!("status 429")),
        ]);
        let keys = KeyRotationManager::from_raw("key-1,key-2").unwrap();
        let mut client =
            GenerationClient::new(Box::new(backend), keys, "gemini-2.0-flash", resume).unwrap();

        let result = client.process("desc", "title", "company");
        match result {
            Err(PipelineError::QuotaExhausted(err)) => assert!(err.to_string().contains("429")),
            other => panic!("expected QuotaExhausted, got {:?}", other),
        }
        // The cursor stays on the last key, which later postings keep using
        assert!(matches!(
            client.process("desc", "title", "company"),
            Ok(_)
        ));
        assert_eq!(client.active_config().api_key, "key-2");
    }

    #[test]
    fn test_process_does_not_retry_other_errors() {
        let (_dir, resume) = resume_file();
        let backend = ScriptedBackend::new(vec![Err(anyhow!("connection refused"))]);
        let keys_used = Arc::clone(&backend.keys_used);
        let keys = KeyRotationManager::from_raw("key-1,key-2").unwrap();
        let mut client =
            GenerationClient::new(Box::new(backend), keys, "gemini-2.0-flash", resume).unwrap();

        let result = client.process("desc", "title", "company");

        assert!(matches!(result, Err(PipelineError::Generation(_))));
        assert_eq!(keys_used.lock().unwrap().len(), 1);
        assert_eq!(client.keys().position(), 0);
    }

    #[test]
    fn test_process_does_not_retry_malformed_response() {
        let (_dir, resume) = resume_file();
        let backend = ScriptedBackend::new(vec![Ok("not json at all".to_string())]);
        let keys_used = Arc::clone(&backend.keys_used);
        let keys = KeyRotationManager::from_raw("key-1,key-2").unwrap();
        let mut client =
            GenerationClient::new(Box::new(backend), keys, "gemini-2.0-flash", resume).unwrap();

        let result = client.process("desc", "title", "company");

        assert!(matches!(result, Err(PipelineError::MalformedResponse(_))));
        assert_eq!(keys_used.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_process_requires_resume() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("resume.txt");
        let keys = KeyRotationManager::from_raw("key-1").unwrap();
        let mut client = GenerationClient::new(
            Box::new(ScriptedBackend::always_ok()),
            keys,
            "gemini-2.0-flash",
            missing.clone(),
        )
        .unwrap();

        match client.process("desc", "title", "company") {
            Err(PipelineError::MissingInput(path)) => assert_eq!(path, missing),
            other => panic!("expected MissingInput, got {:?}", other),
        }
    }
}
