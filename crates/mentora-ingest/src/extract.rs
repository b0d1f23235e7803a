use std::io::Read;

use anyhow::Result;

/// Extract UTF-8 text from an uploaded artifact. Unsupported MIME
/// types return an empty string, which the pipeline turns into a
/// `failed` status. CPU-bound; run it off the request path.
pub fn extract_text(bytes: &[u8], mime: &str) -> Result<String> {
    let mime = mime
        .split(';')
        .next()
        .unwrap_or(mime)
        .trim()
        .to_ascii_lowercase();

    match mime.as_str() {
        "application/pdf" => extract_pdf(bytes),
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => {
            extract_docx(bytes)
        }
        m if m.starts_with("text/") => Ok(String::from_utf8_lossy(bytes).into_owned()),
        "application/json" | "application/x-yaml" | "application/xml" => {
            Ok(String::from_utf8_lossy(bytes).into_owned())
        }
        // OCR stub: images are accepted but contribute no text yet.
        m if m.starts_with("image/") => Ok(String::new()),
        _ => Ok(String::new()),
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<String> {
    let doc = lopdf::Document::load_mem(bytes)?;
    let mut out = String::new();
    for page_number in doc.get_pages().keys() {
        match doc.extract_text(&[*page_number]) {
            Ok(text) => {
                if !text.trim().is_empty() {
                    if !out.is_empty() {
                        out.push('\n');
                    }
                    out.push_str(text.trim_end());
                }
            }
            Err(e) => {
                tracing::debug!(page = page_number, error = %e, "pdf page extraction failed");
            }
        }
    }
    Ok(out)
}

/// DOCX is a zip archive; the document body lives in
/// `word/document.xml`. Paragraph closes become newlines, everything
/// else is tag-stripped.
fn extract_docx(bytes: &[u8]) -> Result<String> {
    let cursor = std::io::Cursor::new(bytes);
    let mut archive = zip::ZipArchive::new(cursor)?;
    let mut xml = String::new();
    archive.by_name("word/document.xml")?.read_to_string(&mut xml)?;
    Ok(strip_document_xml(&xml))
}

fn strip_document_xml(xml: &str) -> String {
    let with_breaks = xml.replace("</w:p>", "\n");
    let mut out = String::with_capacity(with_breaks.len() / 2);
    let mut in_tag = false;
    for ch in with_breaks.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    // Collapse the whitespace runs tag stripping leaves behind.
    let lines: Vec<String> = out
        .lines()
        .map(|l| l.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|l| !l.is_empty())
        .collect();
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn plaintext_passes_through() {
        let out = extract_text(b"hello world", "text/plain").unwrap();
        assert_eq!(out, "hello world");
    }

    #[test]
    fn markdown_passes_through() {
        let out = extract_text(b"# Title\n\nbody", "text/markdown; charset=utf-8").unwrap();
        assert!(out.contains("# Title"));
    }

    #[test]
    fn unsupported_mime_yields_empty() {
        let out = extract_text(b"\x00\x01\x02", "application/octet-stream").unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn image_is_ocr_stub() {
        let out = extract_text(b"\x89PNG\r\n\x1a\n", "image/png").unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn invalid_utf8_is_lossy_not_fatal() {
        let out = extract_text(&[0x68, 0x69, 0xFF, 0x21], "text/plain").unwrap();
        assert!(out.starts_with("hi"));
    }

    #[test]
    fn docx_extraction_strips_tags() {
        let xml = r#"<?xml version="1.0"?>
<w:document><w:body>
<w:p><w:r><w:t>First paragraph.</w:t></w:r></w:p>
<w:p><w:r><w:t>Second</w:t></w:r><w:r><w:t> paragraph.</w:t></w:r></w:p>
</w:body></w:document>"#;

        let mut buf = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            writer
                .start_file("word/document.xml", zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(xml.as_bytes()).unwrap();
            writer.finish().unwrap();
        }

        let out = extract_text(
            &buf,
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        )
        .unwrap();
        assert!(out.contains("First paragraph."));
        assert!(out.contains("Second paragraph."));
    }

    #[test]
    fn corrupt_docx_errors() {
        let out = extract_text(
            b"not a zip",
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        );
        assert!(out.is_err());
    }

    #[test]
    fn strip_document_xml_collapses_whitespace() {
        let out = strip_document_xml("<w:p><w:t>a   b</w:t></w:p><w:p><w:t>  c </w:t></w:p>");
        assert_eq!(out, "a b\nc");
    }
}
