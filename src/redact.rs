use std::io::{self, Write};

const PLACEHOLDER: &str = "[REDACTED]";

/// Wraps a `Write` sink and replaces every occurrence of a secret substring
/// with `[REDACTED]` before the bytes reach the inner writer. Used on every
/// log file and tail buffer that might otherwise echo a minted OAuth token.
pub struct RedactingWriter<W: Write> {
    inner: W,
    secret: Option<String>,
}

impl<W: Write> RedactingWriter<W> {
    pub fn new(inner: W, secret: Option<String>) -> Self {
        let secret = secret.filter(|s| !s.is_empty());
        Self { inner, secret }
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &self.secret {
            None => self.inner.write(buf),
            Some(secret) => {
                let text = String::from_utf8_lossy(buf);
                if text.contains(secret.as_str()) {
                    let redacted = text.replace(secret.as_str(), PLACEHOLDER);
                    self.inner.write_all(redacted.as_bytes())?;
                    Ok(buf.len())
                } else {
                    self.inner.write(buf)
                }
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// One-shot redaction for error messages and summaries that never pass
/// through a `Write` sink.
pub fn redact_str(text: &str, secret: Option<&str>) -> String {
    match secret {
        Some(secret) if !secret.is_empty() && text.contains(secret) => {
            text.replace(secret, PLACEHOLDER)
        }
        _ => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacting_writer_replaces_secret() {
        let mut buf = Vec::new();
        {
            let mut writer = RedactingWriter::new(&mut buf, Some("sekret-token".to_string()));
            writer
                .write_all(b"Authorization: Bearer sekret-token\n")
                .unwrap();
        }
        let text = String::from_utf8(buf).unwrap();
        assert!(!text.contains("sekret-token"));
        assert!(text.contains("[REDACTED]"));
    }

    #[test]
    fn redacting_writer_passes_through_without_secret() {
        let mut buf = Vec::new();
        {
            let mut writer = RedactingWriter::new(&mut buf, None);
            writer.write_all(b"plain output\n").unwrap();
        }
        assert_eq!(String::from_utf8(buf).unwrap(), "plain output\n");
    }

    #[test]
    fn redact_str_replaces_all_occurrences() {
        let out = redact_str("token=abc token=abc", Some("abc"));
        assert_eq!(out, "token=[REDACTED] token=[REDACTED]");
    }

    #[test]
    fn redact_str_empty_secret_is_noop() {
        let out = redact_str("hello", Some(""));
        assert_eq!(out, "hello");
    }
}
