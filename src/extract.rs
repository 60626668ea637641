//! Text extraction for the formats the content store may hold.
//!
//! Plain text and markdown are decoded as UTF-8 (lossy). PDFs go through
//! `pdf-extract`; DOCX files are opened as ZIP archives and the `w:t` runs of
//! `word/document.xml` are collected, one paragraph per `w:p`.

use std::io::Read;

use thiserror::Error;

use crate::error::BotError;

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Text,
    Markdown,
    Pdf,
    Docx,
}

impl FileFormat {
    /// Map a file extension (without the dot, any case) to a format.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "txt" => Some(FileFormat::Text),
            "md" | "markdown" => Some(FileFormat::Markdown),
            "pdf" => Some(FileFormat::Pdf),
            "docx" => Some(FileFormat::Docx),
            _ => None,
        }
    }

    /// Whether extraction does enough CPU work to belong on a blocking thread.
    pub fn is_binary(self) -> bool {
        matches!(self, FileFormat::Pdf | FileFormat::Docx)
    }
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("DOCX extraction failed: {0}")]
    Docx(String),
}

impl From<ExtractError> for BotError {
    fn from(err: ExtractError) -> Self {
        BotError::Extraction(err.to_string())
    }
}

/// Extract plain UTF-8 text from file bytes. Never panics on bad input.
pub fn extract_text(bytes: &[u8], format: FileFormat) -> Result<String, ExtractError> {
    match format {
        FileFormat::Text | FileFormat::Markdown => Ok(String::from_utf8_lossy(bytes).into_owned()),
        FileFormat::Pdf => extract_pdf(bytes),
        FileFormat::Docx => extract_docx(bytes),
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Docx(e.to_string()))?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|_| ExtractError::Docx("word/document.xml not found".to_string()))?;

    let mut doc_xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut doc_xml)
        .map_err(|e| ExtractError::Docx(e.to_string()))?;
    if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Docx(
            "word/document.xml exceeds size limit".to_string(),
        ));
    }

    extract_paragraphs(&doc_xml)
}

fn extract_paragraphs(xml: &[u8]) -> Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut paragraphs: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_text = false;
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    let para = current.trim();
                    if !para.is_empty() {
                        paragraphs.push(para.to_string());
                    }
                    current.clear();
                }
                _ => {}
            },
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"tab" => current.push('\t'),
            Ok(Event::Text(te)) if in_text => {
                let text = te.unescape().map_err(|e| ExtractError::Docx(e.to_string()))?;
                current.push_str(&text);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Docx(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    let tail = current.trim();
    if !tail.is_empty() {
        paragraphs.push(tail.to_string());
    }

    Ok(paragraphs.join("\n\n"))
}
