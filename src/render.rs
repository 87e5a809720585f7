use anyhow::{anyhow, Context};
use regex::Regex;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::LazyLock;

static ILLEGAL_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[\\/*?:"<>|]"#).expect("valid regex"));
static UNDERSCORE_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"_+").expect("valid regex"));

/// Turns Markdown into a PDF somewhere under `out_dir`.
pub trait Renderer {
    fn render(&self, markdown: &str, title: &str, out_dir: &Path) -> anyhow::Result<PathBuf>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Resume,
    CoverLetter,
}

impl DocumentKind {
    pub fn label(&self) -> &'static str {
        match self {
            DocumentKind::Resume => "Resume",
            DocumentKind::CoverLetter => "Cover_Letter",
        }
    }
}

/// Filename-safe form of a company, title or person name.
pub fn clean_name(text: &str) -> String {
    let text = ILLEGAL_CHARS.replace_all(text, "");
    let text = text
        .replace(" - ", "_")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .replace('-', "_");
    UNDERSCORE_RUNS
        .replace_all(&text, "_")
        .trim_matches('_')
        .to_string()
}

/// `Resume_Acme_Data_Engineer`, without repeating the company when the title already starts with it.
pub fn document_title(kind: DocumentKind, company: &str, title: &str) -> String {
    let company = clean_name(company);
    let mut job = clean_name(title);

    if !company.is_empty() {
        if let Some(rest) = job.get(company.len()..) {
            let whole_word = rest.is_empty() || rest.starts_with('_');
            if whole_word && job[..company.len()].to_lowercase() == company.to_lowercase() {
                job = rest.trim_matches('_').to_string();
            }
        }
    }

    [kind.label(), company.as_str(), job.as_str()]
        .iter()
        .filter(|part| !part.is_empty())
        .cloned()
        .collect::<Vec<_>>()
        .join("_")
}

/// Pipes Markdown into an external converter (pandoc by default).
#[derive(Debug, Clone)]
pub struct PandocRenderer {
    program: String,
    user_name: String,
}

impl PandocRenderer {
    pub fn new(program: &str, user_name: &str) -> Self {
        Self {
            program: program.to_string(),
            user_name: user_name.to_string(),
        }
    }

    pub fn output_path(&self, title: &str, out_dir: &Path) -> PathBuf {
        let filename = format!("{}_{}.pdf", clean_name(&self.user_name), clean_name(title));
        out_dir.join(filename)
    }
}

impl Renderer for PandocRenderer {
    fn render(&self, markdown: &str, title: &str, out_dir: &Path) -> anyhow::Result<PathBuf> {
        let output_path = self.output_path(title, out_dir);

        let mut child = Command::new(&self.program)
            .arg("--from")
            .arg("markdown")
            .arg("--output")
            .arg(&output_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to run '{}'. Install it or pass --no-pdf.", self.program))?;

        child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("Renderer stdin unavailable"))?
            .write_all(markdown.as_bytes())
            .context("Failed to send Markdown to renderer")?;

        let output = child
            .wait_with_output()
            .context("Failed to wait for renderer")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("{} failed: {}", self.program, stderr.trim()));
        }

        Ok(output_path)
    }
}
