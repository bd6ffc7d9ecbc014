//! Multi-format text extraction.
//!
//! The format is chosen by content inspection ([`FileKind::sniff`]): magic
//! bytes identify PDFs, OOXML containers and images; the extension only
//! decides between the plain-text flavours. An [`ExtractorRegistry`] then
//! hands the bytes to the first [`Extractor`] that declares the capability.
//!
//! Extraction never panics on bad input. Corrupt or unsupported content is an
//! [`ExtractError`]; only [`ExtractError::OcrUnavailable`] is worth retrying.

use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ParserConfig;
use crate::ocr::{self, OcrEngine};

/// Maximum sheets to process in an xlsx.
const XLSX_MAX_SHEETS: usize = 100;
/// Maximum cells to process per sheet (avoids unbounded memory).
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;
/// How many leading bytes are checked for NUL when guessing at text.
const BINARY_SNIFF_BYTES: usize = 8192;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("unsupported format: {0}")]
    Unsupported(String),
    #[error("invalid text encoding: {0}")]
    Encoding(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
    #[error("OCR failed: {0}")]
    Ocr(String),
    /// The OCR engine could not be run at all (missing binary, timeout).
    #[error("OCR engine unavailable: {0}")]
    OcrUnavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Text,
    Markdown,
    Json,
    Csv,
    Pdf,
    Docx,
    Pptx,
    Xlsx,
    Image,
    Unknown,
}

impl FileKind {
    /// Identify a file by its leading bytes, falling back to the extension
    /// for formats without a signature.
    pub fn sniff(path: &Path, bytes: &[u8]) -> FileKind {
        if bytes.starts_with(b"%PDF") {
            return FileKind::Pdf;
        }
        if bytes.starts_with(b"PK\x03\x04") {
            return sniff_zip(bytes);
        }
        if is_image(bytes) {
            return FileKind::Image;
        }

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "md" | "markdown" => FileKind::Markdown,
            "json" => FileKind::Json,
            "csv" => FileKind::Csv,
            "txt" | "text" | "log" | "rst" | "adoc" | "org" => FileKind::Text,
            _ if looks_like_text(bytes) => FileKind::Text,
            _ => FileKind::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Text => "text",
            FileKind::Markdown => "markdown",
            FileKind::Json => "json",
            FileKind::Csv => "csv",
            FileKind::Pdf => "pdf",
            FileKind::Docx => "docx",
            FileKind::Pptx => "pptx",
            FileKind::Xlsx => "xlsx",
            FileKind::Image => "image",
            FileKind::Unknown => "unknown",
        }
    }
}

fn sniff_zip(bytes: &[u8]) -> FileKind {
    let Ok(archive) = zip::ZipArchive::new(std::io::Cursor::new(bytes)) else {
        return FileKind::Unknown;
    };
    let mut kind = FileKind::Unknown;
    for name in archive.file_names() {
        if name == "word/document.xml" {
            kind = FileKind::Docx;
            break;
        } else if name.starts_with("ppt/slides/") {
            kind = FileKind::Pptx;
            break;
        } else if name.starts_with("xl/worksheets/") {
            kind = FileKind::Xlsx;
            break;
        }
    }
    kind
}

fn is_image(bytes: &[u8]) -> bool {
    bytes.starts_with(b"\x89PNG\r\n\x1a\n")
        || bytes.starts_with(&[0xFF, 0xD8, 0xFF])
        || bytes.starts_with(b"GIF87a")
        || bytes.starts_with(b"GIF89a")
        || bytes.starts_with(b"II*\0")
        || bytes.starts_with(b"MM\0*")
        || (bytes.len() > 14 && bytes.starts_with(b"BM") && bytes[6..10] == [0, 0, 0, 0])
}

fn looks_like_text(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(BINARY_SNIFF_BYTES)];
    !head.contains(&0)
}

/// Text pulled out of a document, before normalization.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub text: String,
    /// 1-based page numbers whose text came from OCR.
    pub ocr_pages: Vec<usize>,
}

impl Extraction {
    fn plain(text: String) -> Self {
        Self {
            text,
            ocr_pages: Vec::new(),
        }
    }
}

/// A format-specific extraction capability.
pub trait Extractor: Send + Sync {
    fn name(&self) -> &'static str;
    fn can_extract(&self, kind: FileKind) -> bool;
    fn extract(&self, bytes: &[u8], kind: FileKind) -> Result<Extraction, ExtractError>;
}

/// Ordered set of extractors; the first capable one wins.
pub struct ExtractorRegistry {
    extractors: Vec<Box<dyn Extractor>>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self {
            extractors: Vec::new(),
        }
    }

    /// The built-in extractors, with OCR configured from `[parser]`.
    pub fn from_config(config: &ParserConfig) -> Self {
        Self::with_ocr(ocr::create_engine(config), config.min_page_chars)
    }

    pub fn with_ocr(ocr: Arc<dyn OcrEngine>, min_page_chars: usize) -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(TextExtractor));
        registry.register(Box::new(PdfExtractor {
            ocr: ocr.clone(),
            min_page_chars,
        }));
        registry.register(Box::new(OoxmlExtractor));
        registry.register(Box::new(ImageExtractor { ocr }));
        registry
    }

    pub fn register(&mut self, extractor: Box<dyn Extractor>) {
        self.extractors.push(extractor);
    }

    pub fn extract(&self, path: &Path, bytes: &[u8]) -> Result<Extraction, ExtractError> {
        let kind = FileKind::sniff(path, bytes);
        let extractor = self
            .extractors
            .iter()
            .find(|e| e.can_extract(kind))
            .ok_or_else(|| {
                ExtractError::Unsupported(format!("{} ({})", path.display(), kind.as_str()))
            })?;
        debug!(path = %path.display(), kind = kind.as_str(), extractor = extractor.name(), "extracting");
        extractor.extract(bytes, kind)
    }
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============ Text formats ============

pub struct TextExtractor;

impl Extractor for TextExtractor {
    fn name(&self) -> &'static str {
        "text"
    }

    fn can_extract(&self, kind: FileKind) -> bool {
        matches!(
            kind,
            FileKind::Text | FileKind::Markdown | FileKind::Json | FileKind::Csv
        )
    }

    fn extract(&self, bytes: &[u8], kind: FileKind) -> Result<Extraction, ExtractError> {
        let text = decode_utf8(bytes)?;
        let text = match kind {
            FileKind::Json => pretty_json(&text)?,
            FileKind::Csv => flatten_csv(&text),
            _ => text,
        };
        Ok(Extraction::plain(text))
    }
}

fn decode_utf8(bytes: &[u8]) -> Result<String, ExtractError> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    String::from_utf8(bytes.to_vec()).map_err(|e| ExtractError::Encoding(e.to_string()))
}

fn pretty_json(text: &str) -> Result<String, ExtractError> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| ExtractError::Unsupported(format!("malformed JSON: {}", e)))?;
    serde_json::to_string_pretty(&value)
        .map_err(|e| ExtractError::Unsupported(format!("malformed JSON: {}", e)))
}

/// One line per data row: `Row N: Header: value; Header: value`.
fn flatten_csv(text: &str) -> String {
    let delimiter = if text.lines().next().is_some_and(|l| l.contains(';') && !l.contains(',')) {
        ';'
    } else {
        ','
    };
    flatten_rows(&parse_csv(text, delimiter), "Row")
}

/// Splits CSV text into records. Quoted fields may contain the delimiter,
/// doubled quotes and line breaks; a break inside a field becomes a space.
/// Blank records are dropped.
fn parse_csv(text: &str, delimiter: char) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    let mut end_record = |record: &mut Vec<String>, field: &mut String| {
        record.push(field.trim().to_string());
        field.clear();
        let row = std::mem::take(record);
        if row.iter().any(|f| !f.is_empty()) {
            rows.push(row);
        }
    };

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            '\r' if chars.peek() == Some(&'\n') => {}
            '\r' | '\n' if in_quotes => {
                if !field.ends_with(' ') {
                    field.push(' ');
                }
            }
            '\r' | '\n' => end_record(&mut record, &mut field),
            c if c == delimiter && !in_quotes => {
                record.push(field.trim().to_string());
                field.clear();
            }
            c => field.push(c),
        }
    }
    if !field.is_empty() || !record.is_empty() {
        end_record(&mut record, &mut field);
    }
    rows
}

/// Treats the first row as headers and renders each following row as
/// `"<label> N: Header: value; ..."`, skipping empty cells.
fn flatten_rows(rows: &[Vec<String>], label: &str) -> String {
    let Some((headers, data)) = rows.split_first() else {
        return String::new();
    };
    if data.is_empty() {
        return headers.join(", ");
    }
    let mut lines = Vec::with_capacity(data.len());
    for (i, row) in data.iter().enumerate() {
        let cells: Vec<String> = row
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_empty())
            .map(|(col, v)| match headers.get(col).filter(|h| !h.is_empty()) {
                Some(h) => format!("{}: {}", h, v),
                None => v.clone(),
            })
            .collect();
        if !cells.is_empty() {
            lines.push(format!("{} {}: {}", label, i + 1, cells.join("; ")));
        }
    }
    lines.join("\n")
}

// ============ PDF ============

/// Per-page PDF text with OCR for pages whose text layer is too short.
pub struct PdfExtractor {
    ocr: Arc<dyn OcrEngine>,
    min_page_chars: usize,
}

impl Extractor for PdfExtractor {
    fn name(&self) -> &'static str {
        "pdf"
    }

    fn can_extract(&self, kind: FileKind) -> bool {
        kind == FileKind::Pdf
    }

    fn extract(&self, bytes: &[u8], _kind: FileKind) -> Result<Extraction, ExtractError> {
        let pages = pdf_extract::extract_text_from_mem_by_pages(bytes)
            .map_err(|e| ExtractError::Pdf(e.to_string()))?;

        let mut out = Extraction::default();
        let mut texts = Vec::with_capacity(pages.len());
        let mut ocr_failure = None;

        for (idx, native) in pages.into_iter().enumerate() {
            let page = idx + 1;
            let native = native.trim().to_string();
            if native.chars().count() >= self.min_page_chars {
                texts.push(native);
                continue;
            }
            match self.ocr.recognize_pdf_page(bytes, page) {
                Ok(recognized) if recognized.trim().len() > native.len() => {
                    out.ocr_pages.push(page);
                    texts.push(recognized.trim().to_string());
                }
                Ok(_) => texts.push(native),
                Err(ExtractError::OcrUnavailable(msg)) => {
                    warn!(page, error = %msg, "OCR unavailable, keeping text layer");
                    ocr_failure = Some(msg);
                    texts.push(native);
                }
                Err(e) => {
                    warn!(page, error = %e, "OCR failed, keeping text layer");
                    texts.push(native);
                }
            }
        }

        out.text = texts
            .into_iter()
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\u{0c}");

        // A scanned document with no engine to read it must be retried, not
        // recorded as empty.
        if out.text.is_empty() {
            if let Some(msg) = ocr_failure {
                return Err(ExtractError::OcrUnavailable(msg));
            }
        }
        Ok(out)
    }
}

// ============ Images ============

pub struct ImageExtractor {
    ocr: Arc<dyn OcrEngine>,
}

impl Extractor for ImageExtractor {
    fn name(&self) -> &'static str {
        "image-ocr"
    }

    fn can_extract(&self, kind: FileKind) -> bool {
        kind == FileKind::Image
    }

    fn extract(&self, bytes: &[u8], _kind: FileKind) -> Result<Extraction, ExtractError> {
        let text = self.ocr.recognize_image(bytes)?;
        Ok(Extraction {
            text,
            ocr_pages: vec![1],
        })
    }
}

// ============ OOXML ============

pub struct OoxmlExtractor;

impl Extractor for OoxmlExtractor {
    fn name(&self) -> &'static str {
        "ooxml"
    }

    fn can_extract(&self, kind: FileKind) -> bool {
        matches!(kind, FileKind::Docx | FileKind::Pptx | FileKind::Xlsx)
    }

    fn extract(&self, bytes: &[u8], kind: FileKind) -> Result<Extraction, ExtractError> {
        let text = match kind {
            FileKind::Docx => extract_docx(bytes)?,
            FileKind::Pptx => extract_pptx(bytes)?,
            FileKind::Xlsx => extract_xlsx(bytes)?,
            other => return Err(ExtractError::Unsupported(other.as_str().to_string())),
        };
        Ok(Extraction::plain(text))
    }
}

type Archive<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

fn open_archive(bytes: &[u8]) -> Result<Archive<'_>, ExtractError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| ExtractError::Ooxml(e.to_string()))
}

fn read_zip_entry_bounded(
    archive: &mut Archive<'_>,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if out.len() as u64 >= max_bytes {
        return Err(ExtractError::Ooxml(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, max_bytes
        )));
    }
    Ok(out)
}

/// Entries named `<prefix><n>.xml`, ordered by `n`.
fn numbered_entries(archive: &Archive<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches(prefix)
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let xml = read_zip_entry_bounded(&mut archive, "word/document.xml", MAX_XML_ENTRY_BYTES)?;
    paragraphs_text(&xml)
}

fn extract_pptx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let mut slides = Vec::new();
    for (idx, name) in numbered_entries(&archive, "ppt/slides/slide")
        .into_iter()
        .enumerate()
    {
        let xml = read_zip_entry_bounded(&mut archive, &name, MAX_XML_ENTRY_BYTES)?;
        let text = paragraphs_text(&xml)?;
        if !text.trim().is_empty() {
            slides.push(format!("Slide {}:\n{}", idx + 1, text.trim_end()));
        }
    }
    Ok(slides.join("\n\n"))
}

/// Collects `<t>` runs, ending a line at every `<p>` (WordprocessingML and
/// DrawingML both use these local names).
fn paragraphs_text(xml: &[u8]) -> Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_t = true;
                }
            }
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"tab" => out.push('\t'),
                b"br" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Text(te)) if in_t => {
                out.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"p" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

fn extract_xlsx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let shared_strings = read_shared_strings(&mut archive)?;
    let mut sheets = Vec::new();
    for (idx, name) in numbered_entries(&archive, "xl/worksheets/sheet")
        .into_iter()
        .take(XLSX_MAX_SHEETS)
        .enumerate()
    {
        let xml = read_zip_entry_bounded(&mut archive, &name, MAX_XML_ENTRY_BYTES)?;
        let rows = sheet_rows(&xml, &shared_strings)?;
        let text = flatten_rows(&rows, &format!("Sheet {}, row", idx + 1));
        if !text.is_empty() {
            sheets.push(text);
        }
    }
    Ok(sheets.join("\n\n"))
}

fn read_shared_strings(archive: &mut Archive<'_>) -> Result<Vec<String>, ExtractError> {
    use quick_xml::events::Event;

    if archive.by_name("xl/sharedStrings.xml").is_err() {
        return Ok(Vec::new());
    }
    let xml = read_zip_entry_bounded(archive, "xl/sharedStrings.xml", MAX_XML_ENTRY_BYTES)?;
    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    let mut current: Option<String> = None;
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_t = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_t => {
                if let Some(s) = current.as_mut() {
                    s.push_str(te.unescape().unwrap_or_default().as_ref());
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"si" => strings.push(current.take().unwrap_or_default()),
                b"t" => in_t = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// Column index from a cell reference such as `"C7"`.
fn column_index(cell_ref: &[u8]) -> Option<usize> {
    let mut col = 0usize;
    let mut seen = false;
    for b in cell_ref.iter().take_while(|b| b.is_ascii_alphabetic()) {
        col = col * 26 + (b.to_ascii_uppercase() - b'A') as usize + 1;
        seen = true;
    }
    seen.then(|| col - 1)
}

fn sheet_rows(xml: &[u8], shared_strings: &[String]) -> Result<Vec<Vec<String>>, ExtractError> {
    use quick_xml::events::Event;

    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();

    let mut cell_type = Vec::new();
    let mut cell_col: Option<usize> = None;
    let mut value = String::new();
    let mut in_value = false;
    let mut cell_count = 0usize;

    loop {
        if cell_count >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"row" => row.clear(),
                b"c" => {
                    cell_type.clear();
                    cell_col = None;
                    value.clear();
                    for attr in e.attributes().flatten() {
                        match attr.key.as_ref() {
                            b"t" => cell_type = attr.value.to_vec(),
                            b"r" => cell_col = column_index(&attr.value),
                            _ => {}
                        }
                    }
                }
                b"v" | b"t" => in_value = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_value => {
                value.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => {
                    let raw = value.trim();
                    let resolved = if cell_type == b"s" {
                        raw.parse::<usize>()
                            .ok()
                            .and_then(|i| shared_strings.get(i).cloned())
                            .unwrap_or_default()
                    } else {
                        raw.to_string()
                    };
                    let col = cell_col.unwrap_or(row.len());
                    if row.len() <= col {
                        row.resize(col + 1, String::new());
                    }
                    row[col] = resolved;
                    cell_count += 1;
                }
                b"row" => {
                    if row.iter().any(|c| !c.is_empty()) {
                        rows.push(std::mem::take(&mut row));
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(rows)
}
