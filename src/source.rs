use anyhow::{Context, Result};
use scraper::{ElementRef, Html, Selector};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use crate::models::JobPosting;

/// A JSON object per line: `{"company", "title", "description", "url"}`.
pub struct JsonLinesSource<R> {
    lines: Lines<R>,
    line_no: usize,
}

impl JsonLinesSource<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open postings file {}", path.display()))?;
        Ok(Self::from_reader(BufReader::new(file)))
    }
}

impl<R: BufRead> JsonLinesSource<R> {
    pub fn from_reader(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line_no: 0,
        }
    }
}

impl<R: BufRead> Iterator for JsonLinesSource<R> {
    type Item = Result<JobPosting>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = self.lines.next()?;
            self.line_no += 1;
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    let err = anyhow::Error::new(e).context(format!("Failed to read line {}", self.line_no));
                    return Some(Err(err));
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            return Some(
                serde_json::from_str::<JobPosting>(&line)
                    .with_context(|| format!("Invalid posting on line {}", self.line_no)),
            );
        }
    }
}

// Job-board top card first, generic markup last.
const TITLE_SELECTORS: &[&str] = &[
    ".job-details-jobs-unified-top-card__job-title",
    ".top-card-layout__title",
    ".topcard__title",
    "h1",
];

const COMPANY_SELECTORS: &[&str] = &[
    ".job-details-jobs-unified-top-card__company-name",
    ".topcard__org-name-link",
    ".top-card-layout__second-subline a",
];

const DESCRIPTION_SELECTORS: &[&str] = &[
    ".jobs-description__content",
    ".jobs-box__html-content",
    ".show-more-less-html__markup",
    ".description__text",
    "div.jobs-description-content__text",
    "#job-details",
    "article.jobs-description",
    "body",
];

fn compile(selectors: &[&str]) -> Vec<Selector> {
    selectors.iter().filter_map(|s| Selector::parse(s).ok()).collect()
}

static TITLE: LazyLock<Vec<Selector>> = LazyLock::new(|| compile(TITLE_SELECTORS));
static COMPANY: LazyLock<Vec<Selector>> = LazyLock::new(|| compile(COMPANY_SELECTORS));
static DESCRIPTION: LazyLock<Vec<Selector>> = LazyLock::new(|| compile(DESCRIPTION_SELECTORS));
static CANONICAL: LazyLock<Vec<(Selector, &'static str)>> = LazyLock::new(|| {
    [("link[rel='canonical']", "href"), ("meta[property='og:url']", "content")]
        .into_iter()
        .filter_map(|(s, attr)| Selector::parse(s).ok().map(|sel| (sel, attr)))
        .collect()
});

/// Saved job pages (`*.html`, `*.htm`) in a directory, parsed one at a time.
pub struct HtmlPageSource {
    pages: std::vec::IntoIter<PathBuf>,
}

impl HtmlPageSource {
    pub fn open(dir: &Path) -> Result<Self> {
        let mut pages = Vec::new();
        for entry in fs::read_dir(dir)
            .with_context(|| format!("Failed to read page directory {}", dir.display()))?
        {
            let path = entry?.path();
            let is_html = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("html") || e.eq_ignore_ascii_case("htm"));
            if is_html && path.is_file() {
                pages.push(path);
            }
        }
        pages.sort();
        Ok(Self {
            pages: pages.into_iter(),
        })
    }
}

impl Iterator for HtmlPageSource {
    type Item = Result<JobPosting>;

    fn next(&mut self) -> Option<Self::Item> {
        let path = self.pages.next()?;
        Some(
            fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))
                .map(|html| parse_page(&html)),
        )
    }
}

/// Visible text with blank lines dropped and each line trimmed.
fn element_text(element: ElementRef) -> String {
    element
        .text()
        .collect::<String>()
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn first_text(document: &Html, selectors: &[Selector]) -> Option<String> {
    selectors.iter().find_map(|selector| {
        document
            .select(selector)
            .map(element_text)
            .find(|text| !text.is_empty())
    })
}

pub fn parse_page(html: &str) -> JobPosting {
    let document = Html::parse_document(html);

    let source_url = CANONICAL.iter().find_map(|(selector, attr)| {
        document
            .select(selector)
            .filter_map(|el| el.value().attr(attr))
            .map(str::trim)
            .find(|url| !url.is_empty())
            .map(str::to_string)
    });

    JobPosting {
        company: first_text(&document, &COMPANY),
        title: first_text(&document, &TITLE),
        description: first_text(&document, &DESCRIPTION),
        source_url,
    }
}
