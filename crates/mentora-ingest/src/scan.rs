//! Upload validation: declared MIME vs magic bytes, executable and
//! dangerous-extension rejection.

use mentora_schema::AppError;

/// Where the upload is headed; knowledge bases are stricter than chat
/// attachments (video is rejected for KB uploads).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    KnowledgeDocument,
    ChatAttachment,
}

const DANGEROUS_EXTENSIONS: &[&str] = &[
    "exe", "dll", "so", "dylib", "sh", "bash", "bat", "cmd", "com", "scr", "msi", "jar", "ps1",
    "vbs", "apk",
];

/// Validate an upload before anything is persisted. Violations are
/// `BadRequest`; the caller returns them synchronously.
pub fn validate_upload(
    file_name: &str,
    mime: &str,
    bytes: &[u8],
    kind: UploadKind,
) -> Result<(), AppError> {
    let ext = file_name
        .rsplit('.')
        .next()
        .filter(|e| *e != file_name)
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    if DANGEROUS_EXTENSIONS.contains(&ext.as_str()) {
        return Err(AppError::bad_request(format!(
            "file type .{ext} is not allowed"
        )));
    }

    if looks_executable(bytes) {
        return Err(AppError::bad_request(
            "executable content is not allowed".to_string(),
        ));
    }

    let mime_main = mime.split(';').next().unwrap_or(mime).trim();
    if kind == UploadKind::KnowledgeDocument && mime_main.starts_with("video/") {
        return Err(AppError::bad_request(
            "video uploads are not allowed in knowledge bases".to_string(),
        ));
    }

    if let Some(expected) = expected_signature(mime_main) {
        if !bytes.is_empty() && !expected.iter().any(|sig| bytes.starts_with(sig)) {
            return Err(AppError::bad_request(format!(
                "file content does not match declared type {mime_main}"
            )));
        }
    }

    Ok(())
}

fn looks_executable(bytes: &[u8]) -> bool {
    const SIGNATURES: &[&[u8]] = &[
        b"MZ",                   // PE
        b"\x7fELF",              // ELF
        b"#!",                   // script shebang
        b"\xca\xfe\xba\xbe",     // Mach-O fat / Java class
        b"\xfe\xed\xfa\xce",     // Mach-O 32
        b"\xfe\xed\xfa\xcf",     // Mach-O 64
    ];
    SIGNATURES.iter().any(|sig| bytes.starts_with(sig))
}

/// Magic-byte prefixes for MIME types we can verify. Declared types
/// outside this table are not signature-checked.
fn expected_signature(mime: &str) -> Option<&'static [&'static [u8]]> {
    match mime {
        "application/pdf" => Some(&[b"%PDF"]),
        "image/png" => Some(&[b"\x89PNG"]),
        "image/jpeg" => Some(&[b"\xff\xd8\xff"]),
        "image/gif" => Some(&[b"GIF87a", b"GIF89a"]),
        // DOCX and friends are zip containers.
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => {
            Some(&[b"PK\x03\x04"])
        }
        _ => None,
    }
}
