use quick_xml::events::Event;
use quick_xml::Reader;
use std::io::Read;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use tracing::{debug, warn};

/// Maximum text to keep (100KB) to avoid bloating the index.
pub const DEFAULT_MAX_TEXT_BYTES: usize = 102_400;

/// Extensions we try to pull text out of. Everything else is stored and
/// served but not searchable.
pub const PARSEABLE_EXTENSIONS: &[&str] = &[
    "pdf", "docx", "pptx", "txt", "md", "csv", "json", "html", "htm", "xml",
];

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{format} parsing failed: {cause}")]
    Format { format: &'static str, cause: String },
    #[error("no parser for extension '{0}'")]
    Unsupported(String),
    #[error("parser panicked: {0}")]
    Panicked(String),
}

/// Something that turns a document on disk into plain text.
pub trait TextParser: Send + Sync {
    fn extract_text(&self, path: &Path, extension: &str) -> Result<String, ExtractError>;
}

/// Parser for the formats in [`PARSEABLE_EXTENSIONS`].
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinParser;

impl TextParser for BuiltinParser {
    fn extract_text(&self, path: &Path, extension: &str) -> Result<String, ExtractError> {
        match extension {
            // Plain text types — direct UTF-8 decode
            "txt" | "md" | "csv" | "json" | "html" | "htm" | "xml" => {
                let data = read_all(path)?;
                Ok(String::from_utf8_lossy(&data).into_owned())
            }
            "docx" => extract_docx(path),
            "pptx" => extract_pptx(path),
            "pdf" => extract_pdf(path),
            other => Err(ExtractError::Unsupported(other.to_string())),
        }
    }
}

/// Outcome of one extraction attempt.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Extraction {
    pub text: String,
    /// False for extensions outside the allow-list.
    pub searchable: bool,
    /// True when a parseable file failed to extract and fell back to empty text.
    pub degraded: bool,
}

/// Runs a [`TextParser`] and contains every failure it can produce.
pub struct ContentExtractor {
    parser: Box<dyn TextParser>,
    max_text_bytes: usize,
}

impl Default for ContentExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TEXT_BYTES)
    }
}

impl ContentExtractor {
    pub fn new(max_text_bytes: usize) -> Self {
        Self::with_parser(Box::new(BuiltinParser), max_text_bytes)
    }

    pub fn with_parser(parser: Box<dyn TextParser>, max_text_bytes: usize) -> Self {
        Self {
            parser,
            max_text_bytes,
        }
    }

    pub fn is_parseable(extension: &str) -> bool {
        PARSEABLE_EXTENSIONS.contains(&extension)
    }

    /// Never fails: unsupported extensions and parser errors (including
    /// panics) both produce empty text.
    pub fn extract(&self, path: &Path, extension: &str) -> Extraction {
        if !Self::is_parseable(extension) {
            return Extraction::default();
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.parser.extract_text(path, extension)
        }))
        .unwrap_or_else(|payload| Err(ExtractError::Panicked(panic_message(payload.as_ref()))));

        match outcome {
            Ok(text) => {
                debug!(path = %path.display(), bytes = text.len(), "extracted text");
                Extraction {
                    text: truncate_text(text, self.max_text_bytes),
                    searchable: true,
                    degraded: false,
                }
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "text extraction failed, indexing without content");
                Extraction {
                    text: String::new(),
                    searchable: true,
                    degraded: true,
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn truncate_text(text: String, max: usize) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= max {
        return trimmed.to_string();
    }
    let mut end = max;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    trimmed[..end].to_string()
}

fn read_all(path: &Path) -> Result<Vec<u8>, ExtractError> {
    std::fs::read(path).map_err(|source| ExtractError::Io {
        path: path.display().to_string(),
        source,
    })
}

fn open_archive(path: &Path, format: &'static str) -> Result<zip::ZipArchive<std::fs::File>, ExtractError> {
    let file = std::fs::File::open(path).map_err(|source| ExtractError::Io {
        path: path.display().to_string(),
        source,
    })?;
    zip::ZipArchive::new(file).map_err(|e| ExtractError::Format {
        format,
        cause: e.to_string(),
    })
}

fn read_entry(
    archive: &mut zip::ZipArchive<std::fs::File>,
    name: &str,
    format: &'static str,
) -> Result<String, ExtractError> {
    let mut entry = archive.by_name(name).map_err(|e| ExtractError::Format {
        format,
        cause: format!("{name}: {e}"),
    })?;
    let mut xml = String::new();
    entry
        .read_to_string(&mut xml)
        .map_err(|e| ExtractError::Format {
            format,
            cause: format!("{name}: {e}"),
        })?;
    Ok(xml)
}

fn extract_docx(path: &Path) -> Result<String, ExtractError> {
    let mut archive = open_archive(path, "docx")?;
    let xml = read_entry(&mut archive, "word/document.xml", "docx")?;
    collect_xml_text(&xml, b"w:t", b"w:p", "docx")
}

fn extract_pptx(path: &Path) -> Result<String, ExtractError> {
    let mut archive = open_archive(path, "pptx")?;
    let mut slides: Vec<String> = archive
        .file_names()
        .filter(|name| name.starts_with("ppt/slides/slide") && name.ends_with(".xml"))
        .map(str::to_string)
        .collect();
    // slide10 must come after slide9
    slides.sort_by_key(|name| {
        name.trim_start_matches("ppt/slides/slide")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });

    let mut text = Vec::with_capacity(slides.len());
    for slide in slides {
        let xml = read_entry(&mut archive, &slide, "pptx")?;
        text.push(collect_xml_text(&xml, b"a:t", b"a:p", "pptx")?);
    }
    Ok(text.join("\n"))
}

/// Concatenates the text of every `text_tag` element, one line per
/// `paragraph_tag`.
fn collect_xml_text(
    xml: &str,
    text_tag: &[u8],
    paragraph_tag: &[u8],
    format: &'static str,
) -> Result<String, ExtractError> {
    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();
    let mut out = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.name().as_ref() == text_tag => in_text = true,
            Ok(Event::End(e)) if e.name().as_ref() == text_tag => in_text = false,
            Ok(Event::End(e)) if e.name().as_ref() == paragraph_tag => {
                if !out.is_empty() && !out.ends_with('\n') {
                    out.push('\n');
                }
            }
            Ok(Event::Text(e)) if in_text => {
                let text = e.unescape().map_err(|err| ExtractError::Format {
                    format,
                    cause: err.to_string(),
                })?;
                out.push_str(&text);
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(ExtractError::Format {
                    format,
                    cause: format!("xml error at {}: {e}", reader.buffer_position()),
                })
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(out)
}

fn extract_pdf(path: &Path) -> Result<String, ExtractError> {
    #[cfg(feature = "pdf")]
    {
        let data = read_all(path)?;
        pdf_extract::extract_text_from_mem(&data).map_err(|e| ExtractError::Format {
            format: "pdf",
            cause: e.to_string(),
        })
    }
    #[cfg(not(feature = "pdf"))]
    {
        let _ = path;
        Err(ExtractError::Unsupported(
            "pdf (built without the `pdf` feature)".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    struct PanickingParser;

    impl TextParser for PanickingParser {
        fn extract_text(&self, _path: &Path, _extension: &str) -> Result<String, ExtractError> {
            panic!("malformed cross-reference table");
        }
    }

    fn write_docx(path: &Path, paragraphs: &[&str]) {
        let file = std::fs::File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let body: String = paragraphs
            .iter()
            .map(|p| format!("<w:p><w:r><w:t>{p}</w:t></w:r></w:p>"))
            .collect();
        let xml = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?><w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body>{body}</w:body></w:document>"#
        );
        zip.start_file("word/document.xml", zip::write::SimpleFileOptions::default())
            .unwrap();
        zip.write_all(xml.as_bytes()).unwrap();
        zip.finish().unwrap();
    }

    #[test]
    fn plain_text_is_extracted() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("notes.txt");
        std::fs::write(&path, "  Eigenvalues and eigenvectors\n").unwrap();

        let out = ContentExtractor::default().extract(&path, "txt");
        assert_eq!(out.text, "Eigenvalues and eigenvectors");
        assert!(out.searchable);
        assert!(!out.degraded);
    }

    #[test]
    fn docx_paragraphs_become_lines() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("essay.docx");
        write_docx(&path, &["First &amp; foremost", "Second"]);

        let out = ContentExtractor::default().extract(&path, "docx");
        assert_eq!(out.text, "First & foremost\nSecond");
    }

    #[test]
    fn corrupted_docx_degrades_to_empty_text() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("broken.docx");
        std::fs::write(&path, b"this is not a zip archive").unwrap();

        let out = ContentExtractor::default().extract(&path, "docx");
        assert!(out.text.is_empty());
        assert!(out.searchable);
        assert!(out.degraded);
    }

    #[test]
    fn parser_panics_are_contained() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("paper.pdf");
        std::fs::write(&path, b"%PDF-1.4 garbage").unwrap();

        let extractor = ContentExtractor::with_parser(Box::new(PanickingParser), 1024);
        let out = extractor.extract(&path, "pdf");
        assert!(out.text.is_empty());
        assert!(out.degraded);
    }

    #[test]
    fn unlisted_extensions_are_not_searchable() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("diagram.png");
        std::fs::write(&path, b"\x89PNG").unwrap();

        let out = ContentExtractor::default().extract(&path, "png");
        assert_eq!(out, Extraction::default());
        assert!(!ContentExtractor::is_parseable("unknown"));
    }

    #[test]
    fn long_text_is_truncated_on_a_char_boundary() {
        let text = "é".repeat(10);
        let truncated = truncate_text(text, 5);
        assert_eq!(truncated, "éé");
    }
}
