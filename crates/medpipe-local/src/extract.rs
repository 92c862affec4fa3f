use medpipe_core::FetchResponse;
use std::io::Cursor;

/// Extraction below this many chars is treated as "no retrievable text" and
/// the caller falls back to the search snippet.
pub const MIN_TEXT_CHARS: usize = 200;

/// Convert HTML to readable plain text.
///
/// Intentionally "good enough" and deterministic, not a full readability
/// engine. Callers apply their own output bounds.
pub fn html_to_text(html: &str, width: usize) -> String {
    html2text::from_read(Cursor::new(html.as_bytes()), width).unwrap_or_else(|_| html.to_string())
}

fn is_boilerplate_tag(name: &str) -> bool {
    matches!(
        name,
        "script" | "style" | "header" | "footer" | "nav" | "noscript" | "aside" | "form"
    )
}

/// DOM-walking fallback: drop script/style/nav-like subtrees, keep the rest
/// of the text. Used when the primary engine yields low signal.
pub fn strip_boilerplate(html: &str) -> String {
    let doc = scraper::Html::parse_document(html);
    let mut out = String::new();
    let mut stack: Vec<_> = doc.tree.root().children().collect();
    stack.reverse();
    while let Some(node) = stack.pop() {
        match node.value() {
            scraper::Node::Text(t) => {
                let s = t.trim();
                if !s.is_empty() {
                    out.push_str(s);
                    out.push('\n');
                }
            }
            scraper::Node::Element(el) => {
                if !is_boilerplate_tag(el.name()) {
                    let children: Vec<_> = node.children().collect();
                    for child in children.into_iter().rev() {
                        stack.push(child);
                    }
                }
            }
            _ => {}
        }
    }
    out
}

/// Extract text from an in-memory PDF body. Quality varies by PDF (text layer
/// vs scanned images); errors are stringified so callers can treat them as a
/// missing-text condition.
pub fn pdf_to_text(bytes: &[u8]) -> Result<String, String> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| e.to_string())
}

fn char_len(s: &str) -> usize {
    s.trim().chars().count()
}

/// Main readable text of a fetched page, or None when nothing usable was
/// extracted (caller then falls back to the search snippet).
///
/// Ladder: PDF text layer for PDF bodies; html2text for everything else, with
/// a DOM-stripping retry when the result is below `min_chars`.
pub fn readable_text(resp: &FetchResponse, width: usize, min_chars: usize) -> Option<String> {
    if resp.status >= 400 {
        return None;
    }
    if resp.is_pdf() {
        let text = pdf_to_text(&resp.bytes).ok()?;
        return (char_len(&text) >= min_chars).then(|| text.trim().to_string());
    }

    let html = resp.text_lossy();
    let primary = html_to_text(&html, width);
    if char_len(&primary) >= min_chars {
        return Some(primary.trim().to_string());
    }
    let stripped = strip_boilerplate(&html);
    (char_len(&stripped) >= min_chars).then(|| stripped.trim().to_string())
}
