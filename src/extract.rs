//! Multi-format text extraction for ingested documents.
//!
//! The pipeline hands this module raw bytes plus a detected format; it
//! returns plain UTF-8 text and whatever title the format surfaces.
//! Extraction never panics: malformed input returns an error and the
//! pipeline records the document as failed.

use std::io::Read;
use std::path::Path;

/// Formats accepted by the ingestion pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Text,
    Html,
    Json,
    Pdf,
    Docx,
}

impl SourceFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            SourceFormat::Text => "text/plain",
            SourceFormat::Html => "text/html",
            SourceFormat::Json => "application/json",
            SourceFormat::Pdf => "application/pdf",
            SourceFormat::Docx => {
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            }
        }
    }
}

/// Map a file extension to its format. Unknown extensions are unsupported,
/// not treated as plain text — silently embedding binary garbage poisons
/// the index.
pub fn detect_format(path: &Path) -> Option<SourceFormat> {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("txt") | Some("md") => Some(SourceFormat::Text),
        Some("html") | Some("htm") => Some(SourceFormat::Html),
        Some("json") => Some(SourceFormat::Json),
        Some("pdf") => Some(SourceFormat::Pdf),
        Some("docx") => Some(SourceFormat::Docx),
        _ => None,
    }
}

/// Extraction failure. The pipeline skips the document and keeps going.
#[derive(Debug)]
pub enum ExtractError {
    Unsupported(String),
    Pdf(String),
    Ooxml(String),
    Json(String),
    Io(String),
}

impl std::fmt::Display for ExtractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractError::Unsupported(ext) => write!(f, "unsupported source format: {}", ext),
            ExtractError::Pdf(e) => write!(f, "PDF extraction failed: {}", e),
            ExtractError::Ooxml(e) => write!(f, "OOXML extraction failed: {}", e),
            ExtractError::Json(e) => write!(f, "JSON extraction failed: {}", e),
            ExtractError::Io(e) => write!(f, "read failed: {}", e),
        }
    }
}

impl std::error::Error for ExtractError {}

/// Text pulled from a source document plus format-level metadata.
#[derive(Debug, Clone)]
pub struct Extracted {
    pub text: String,
    pub title: Option<String>,
    pub content_type: &'static str,
}

/// Extract text from a file on disk, dispatching on its extension.
pub fn extract_file(path: &Path) -> Result<Extracted, ExtractError> {
    let format = detect_format(path).ok_or_else(|| {
        ExtractError::Unsupported(
            path.extension()
                .and_then(|e| e.to_str())
                .unwrap_or("(none)")
                .to_string(),
        )
    })?;
    let bytes = std::fs::read(path).map_err(|e| ExtractError::Io(e.to_string()))?;
    extract_bytes(&bytes, format)
}

/// Extract text from in-memory bytes of a known format.
pub fn extract_bytes(bytes: &[u8], format: SourceFormat) -> Result<Extracted, ExtractError> {
    match format {
        SourceFormat::Text => extract_plain(bytes),
        SourceFormat::Html => Ok(extract_html(&String::from_utf8_lossy(bytes))),
        SourceFormat::Json => extract_json(bytes),
        SourceFormat::Pdf => extract_pdf(bytes),
        SourceFormat::Docx => extract_docx(bytes),
    }
}

// ============ Plain text ============

fn extract_plain(bytes: &[u8]) -> Result<Extracted, ExtractError> {
    let text = String::from_utf8_lossy(bytes).to_string();

    // Curated corpus files often lead with CASE:/TITLE: header lines.
    let mut title = None;
    for line in text.lines().take(10) {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("CASE:").or_else(|| line.strip_prefix("TITLE:")) {
            title = Some(rest.trim().to_string());
            break;
        }
    }

    Ok(Extracted {
        text,
        title,
        content_type: SourceFormat::Text.content_type(),
    })
}

// ============ HTML ============

/// Strip an HTML page down to its visible text.
///
/// Drops `<script>`, `<style>`, `<head>` and comment content, removes
/// remaining tags, and decodes the common entities. Good enough for the
/// mostly-textual pages on authorized legal sources; anything fancier
/// belongs upstream of ingestion.
pub fn extract_html(html: &str) -> Extracted {
    let title = find_tag_text(html, "title").map(|t| collapse_ws(&t));

    let mut cleaned = String::with_capacity(html.len());
    let mut rest = html;
    // Remove non-content blocks wholesale before tag stripping.
    'outer: while !rest.is_empty() {
        let lower = rest.to_ascii_lowercase();
        let mut earliest: Option<(usize, &str, &str)> = None;
        for (open, close) in [
            ("<script", "</script>"),
            ("<style", "</style>"),
            ("<head", "</head>"),
            ("<!--", "-->"),
        ] {
            if let Some(pos) = lower.find(open) {
                if earliest.map(|(p, _, _)| pos < p).unwrap_or(true) {
                    earliest = Some((pos, open, close));
                }
            }
        }
        match earliest {
            Some((pos, _, close)) => {
                cleaned.push_str(&rest[..pos]);
                let after = &rest[pos..];
                let after_lower = after.to_ascii_lowercase();
                match after_lower.find(close) {
                    Some(end) => rest = &after[end + close.len()..],
                    None => break 'outer,
                }
            }
            None => {
                cleaned.push_str(rest);
                break;
            }
        }
    }

    // Strip remaining tags; block-level closers become line breaks.
    let mut text = String::with_capacity(cleaned.len());
    let mut in_tag = false;
    let mut tag = String::new();
    for ch in cleaned.chars() {
        match ch {
            '<' => {
                in_tag = true;
                tag.clear();
            }
            '>' if in_tag => {
                in_tag = false;
                let t = tag.trim_start_matches('/').to_ascii_lowercase();
                if matches!(
                    t.split_whitespace().next().unwrap_or(""),
                    "p" | "div" | "br" | "li" | "tr" | "h1" | "h2" | "h3" | "h4" | "section"
                ) {
                    text.push('\n');
                }
            }
            _ if in_tag => tag.push(ch),
            _ => text.push(ch),
        }
    }

    let text = decode_entities(&text);
    let text = text
        .lines()
        .map(|l| collapse_ws(l))
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n");

    Extracted {
        text,
        title,
        content_type: SourceFormat::Html.content_type(),
    }
}

fn find_tag_text(html: &str, tag: &str) -> Option<String> {
    let lower = html.to_ascii_lowercase();
    let open = format!("<{}", tag);
    let close = format!("</{}>", tag);
    let start = lower.find(&open)?;
    let content_start = html[start..].find('>')? + start + 1;
    let end = lower[content_start..].find(&close)? + content_start;
    Some(html[content_start..end].to_string())
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&sect;", "\u{00a7}")
}

fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ============ JSON ============

fn extract_json(bytes: &[u8]) -> Result<Extracted, ExtractError> {
    let value: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|e| ExtractError::Json(e.to_string()))?;

    let obj = value
        .as_object()
        .ok_or_else(|| ExtractError::Json("top-level value is not an object".to_string()))?;

    let text = ["content", "text", "body", "document"]
        .iter()
        .find_map(|field| obj.get(*field).and_then(|v| v.as_str()))
        .ok_or_else(|| ExtractError::Json("no content/text/body/document field".to_string()))?
        .to_string();

    let title = obj
        .get("title")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    Ok(Extracted {
        text,
        title,
        content_type: SourceFormat::Json.content_type(),
    })
}

// ============ PDF ============

fn extract_pdf(bytes: &[u8]) -> Result<Extracted, ExtractError> {
    let text = pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| ExtractError::Pdf(e.to_string()))?;
    Ok(Extracted {
        text,
        title: None,
        content_type: SourceFormat::Pdf.content_type(),
    })
}

// ============ DOCX ============

/// Decompressed-size bound per ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

fn extract_docx(bytes: &[u8]) -> Result<Extracted, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    let mut doc_xml = Vec::new();
    let mut found = false;
    for i in 0..archive.len() {
        let entry = archive
            .by_index(i)
            .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
        if entry.name() == "word/document.xml" {
            entry
                .take(MAX_XML_ENTRY_BYTES)
                .read_to_end(&mut doc_xml)
                .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
            if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
                return Err(ExtractError::Ooxml(
                    "word/document.xml exceeds size limit".to_string(),
                ));
            }
            found = true;
            break;
        }
    }
    if !found {
        return Err(ExtractError::Ooxml(
            "word/document.xml not found".to_string(),
        ));
    }

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(doc_xml.as_slice());
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                let name = e.local_name();
                if name.as_ref() == b"t" {
                    if let Ok(quick_xml::events::Event::Text(te)) = reader.read_event_into(&mut buf)
                    {
                        out.push_str(te.unescape().unwrap_or_default().as_ref());
                    }
                } else if name.as_ref() == b"p" && !out.is_empty() {
                    out.push('\n');
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(Extracted {
        text: out,
        title: None,
        content_type: SourceFormat::Docx.content_type(),
    })
}
