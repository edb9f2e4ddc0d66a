//! Text extraction with page boundaries.
//!
//! PDFs keep their native pagination; Markdown and plain text are packed
//! into pseudo-pages of roughly [`MAX_CHARS_PER_PAGE`] characters, split on
//! paragraph boundaries. The chunker and the page-attachment step both work
//! against the same joined text, so [`PageMap`] is the single source of
//! truth for mapping character spans back to page numbers.

use std::path::Path;

use crate::error::ServiceError;

/// Pseudo-page size for non-paginated formats.
const MAX_CHARS_PER_PAGE: usize = 12_000;

/// Separator used when joining page texts into the full document text.
pub const PAGE_SEPARATOR: &str = "\n\n";

/// One page of extracted text. `page` is 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageText {
    pub page: u32,
    pub text: String,
}

/// Extracts page text from an uploaded file based on its content type.
/// `text/markdown` and `text/plain` (and `.md`/`.txt` suffixes) are read as
/// text; everything else is treated as PDF, matching the upload surface.
pub fn extract_pages(path: &Path, content_type: &str) -> Result<Vec<PageText>, ServiceError> {
    let is_text = matches!(content_type, "text/markdown" | "text/plain")
        || matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("md") | Some("txt")
        );

    let bytes = std::fs::read(path)
        .map_err(|e| ServiceError::Internal(format!("read {}: {}", path.display(), e)))?;

    if is_text {
        Ok(paginate_text(&String::from_utf8_lossy(&bytes)))
    } else {
        extract_pdf_pages(&bytes)
    }
}

fn extract_pdf_pages(bytes: &[u8]) -> Result<Vec<PageText>, ServiceError> {
    let pages = pdf_extract::extract_text_from_mem_by_pages(bytes)
        .map_err(|e| ServiceError::Validation(format!("PDF extraction failed: {}", e)))?;

    Ok(pages
        .into_iter()
        .enumerate()
        .filter(|(_, text)| !text.trim().is_empty())
        .map(|(idx, text)| PageText {
            page: idx as u32 + 1,
            text,
        })
        .collect())
}

/// Packs paragraphs into pseudo-pages so downstream windowing sees the same
/// shape for every format.
pub fn paginate_text(full_text: &str) -> Vec<PageText> {
    if full_text.trim().is_empty() {
        return Vec::new();
    }

    let mut pages = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_chars = 0usize;
    let mut page_num = 1u32;

    for para in split_paragraphs(full_text) {
        let para_len = para.len();
        if !current.is_empty() && current_chars + para_len > MAX_CHARS_PER_PAGE {
            pages.push(PageText {
                page: page_num,
                text: current.join("\n\n"),
            });
            page_num += 1;
            current.clear();
            current_chars = 0;
        }
        current.push(para);
        current_chars += para_len;
    }

    if !current.is_empty() {
        pages.push(PageText {
            page: page_num,
            text: current.join("\n\n"),
        });
    }

    pages
}

/// Splits on blank lines (possibly containing whitespace), like the
/// `\n\s*\n` convention used across text tooling.
fn split_paragraphs(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0usize;
    let bytes = text.as_bytes();
    let mut i = 0usize;

    while i < bytes.len() {
        if bytes[i] == b'\n' {
            // Look ahead over whitespace for a second newline.
            let mut j = i + 1;
            let mut saw_second = false;
            while j < bytes.len() && (bytes[j] as char).is_whitespace() {
                if bytes[j] == b'\n' {
                    saw_second = true;
                    j += 1;
                    break;
                }
                j += 1;
            }
            if saw_second {
                out.push(&text[start..i]);
                start = j;
                i = j;
                continue;
            }
        }
        i += 1;
    }
    if start < text.len() {
        out.push(&text[start..]);
    }
    out
}

/// Character offsets of each page within the joined document text.
#[derive(Debug, Clone)]
pub struct PageMap {
    /// `(page_number, start, end)` where `end` includes the trailing
    /// separator, so consecutive ranges tile the whole text.
    ranges: Vec<(u32, usize, usize)>,
}

impl PageMap {
    /// Joins pages with [`PAGE_SEPARATOR`] and records where each one lands.
    pub fn build(pages: &[PageText]) -> (String, PageMap) {
        let mut full_text = String::new();
        let mut ranges = Vec::with_capacity(pages.len());
        for (idx, page) in pages.iter().enumerate() {
            if idx > 0 {
                full_text.push_str(PAGE_SEPARATOR);
            }
            let page_start = full_text.len();
            full_text.push_str(&page.text);
            let page_end = full_text.len() + PAGE_SEPARATOR.len();
            ranges.push((page.page, page_start, page_end));
        }
        (full_text, PageMap { ranges })
    }

    /// Pages overlapped by `[start_char, end_char)`.
    pub fn pages_for_span(&self, start_char: usize, end_char: usize) -> Vec<u32> {
        self.ranges
            .iter()
            .filter(|(_, page_start, page_end)| start_char < *page_end && end_char > *page_start)
            .map(|(page, _, _)| *page)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_text_is_one_page() {
        let pages = paginate_text("Hello.\n\nWorld.");
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].page, 1);
        assert_eq!(pages[0].text, "Hello.\n\nWorld.");
    }

    #[test]
    fn empty_text_has_no_pages() {
        assert!(paginate_text("").is_empty());
        assert!(paginate_text("  \n \n ").is_empty());
    }

    #[test]
    fn long_text_splits_on_paragraphs() {
        let para = "x".repeat(5_000);
        let text = format!("{p}\n\n{p}\n\n{p}\n\n{p}", p = para);
        let pages = paginate_text(&text);
        assert!(pages.len() > 1);
        for (idx, page) in pages.iter().enumerate() {
            assert_eq!(page.page, idx as u32 + 1);
            assert!(page.text.len() <= MAX_CHARS_PER_PAGE + para.len());
        }
    }

    #[test]
    fn page_map_spans() {
        let pages = vec![
            PageText {
                page: 1,
                text: "aaaa".into(),
            },
            PageText {
                page: 2,
                text: "bbbb".into(),
            },
            PageText {
                page: 3,
                text: "cccc".into(),
            },
        ];
        let (full_text, map) = PageMap::build(&pages);
        assert_eq!(full_text, "aaaa\n\nbbbb\n\ncccc");

        assert_eq!(map.pages_for_span(0, 4), vec![1]);
        assert_eq!(map.pages_for_span(6, 10), vec![2]);
        // A span across the separator touches both pages.
        assert_eq!(map.pages_for_span(2, 8), vec![1, 2]);
        assert_eq!(map.pages_for_span(0, full_text.len()), vec![1, 2, 3]);
    }

    #[test]
    fn paragraph_split_handles_trailing_spaces() {
        let parts = split_paragraphs("one\n  \ntwo\n\nthree");
        assert_eq!(parts, vec!["one", "two", "three"]);
    }
}
