use anyhow::{bail, Result};
use async_trait::async_trait;
use std::io::ErrorKind;

use super::{Contract, Shape, SkillKind, Transform};
use crate::config::{InvalidUtf8, ReaderParams, SkillDefinition, SkillParams};
use crate::error::StageError;
use crate::models::{Document, FileRef, Item};

/// Reads a scanned file into a [`Document`] whose id is the path relative
/// to the scan root.
pub struct FileReader {
    max_file_size: Option<u64>,
    on_invalid_utf8: InvalidUtf8,
}

pub fn build(def: &SkillDefinition) -> Result<SkillKind> {
    let SkillParams::Reader(params) = &def.params else {
        bail!("expected reader params");
    };
    Ok(SkillKind::transform(FileReader::new(params)))
}

impl FileReader {
    pub fn new(params: &ReaderParams) -> Self {
        Self {
            max_file_size: params.max_file_size,
            on_invalid_utf8: params.on_invalid_utf8,
        }
    }

    async fn read(&self, file: FileRef) -> Result<Document, StageError> {
        if let Some(max) = self.max_file_size {
            if file.size > max {
                return Err(StageError::permanent(format!(
                    "file is {} bytes, limit is {}",
                    file.size, max
                )));
            }
        }

        let bytes = tokio::fs::read(&file.path).await.map_err(|e| match e.kind() {
            ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut => {
                StageError::transient(format!("{}: {}", file.path.display(), e))
            }
            _ => StageError::permanent(format!("{}: {}", file.path.display(), e)),
        })?;

        let content = match String::from_utf8(bytes) {
            Ok(s) => s,
            Err(e) => match self.on_invalid_utf8 {
                InvalidUtf8::Fail => {
                    return Err(StageError::permanent(format!(
                        "{} is not valid UTF-8",
                        file.path.display()
                    )))
                }
                InvalidUtf8::Replace => String::from_utf8_lossy(e.as_bytes()).into_owned(),
            },
        };

        let file_name = file
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| file.id.clone());
        let extension = file
            .path
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_default();

        Ok(
            Document::new(file.id.clone(), format!("file://{}", file.path.display()), content)
                .with_metadata("file_name", file_name)
                .with_metadata("extension", extension)
                .with_metadata("size", file.size.to_string())
                .with_metadata("modified", file.modified.to_rfc3339()),
        )
    }
}

#[async_trait]
impl Transform for FileReader {
    fn contract(&self) -> Contract {
        Contract::transform(&[Shape::FileRef], Shape::Document)
    }

    async fn apply(&self, item: Item) -> Result<Vec<Item>, StageError> {
        match item {
            Item::File(file) => Ok(vec![Item::Document(self.read(file).await?)]),
            other => Err(StageError::permanent(format!(
                "file-reader cannot read a {}",
                other.kind()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn file_ref(tmp: &TempDir, name: &str, bytes: &[u8]) -> FileRef {
        let path = tmp.path().join(name);
        std::fs::write(&path, bytes).unwrap();
        FileRef {
            id: name.to_string(),
            path,
            size: bytes.len() as u64,
            modified: Utc::now(),
        }
    }

    #[tokio::test]
    async fn reads_file_into_document() {
        let tmp = TempDir::new().unwrap();
        let reader = FileReader::new(&ReaderParams::default());
        let out = reader
            .apply(Item::File(file_ref(&tmp, "notes.txt", b"hello")))
            .await
            .unwrap();
        let Item::Document(doc) = &out[0] else {
            panic!("expected a document");
        };
        assert_eq!(doc.id, "notes.txt");
        assert_eq!(doc.raw_content, "hello");
        assert_eq!(doc.metadata["file_name"], "notes.txt");
        assert_eq!(doc.metadata["extension"], "txt");
        assert!(doc.source_uri.starts_with("file://"));
    }

    #[tokio::test]
    async fn invalid_utf8_fails_or_is_replaced() {
        let tmp = TempDir::new().unwrap();
        let bad = file_ref(&tmp, "bad.bin", &[0x66, 0xff, 0x6f]);

        let strict = FileReader::new(&ReaderParams::default());
        assert!(matches!(
            strict.apply(Item::File(bad.clone())).await,
            Err(StageError::Permanent(_))
        ));

        let lenient = FileReader::new(&ReaderParams {
            max_file_size: None,
            on_invalid_utf8: InvalidUtf8::Replace,
        });
        let out = lenient.apply(Item::File(bad)).await.unwrap();
        let Item::Document(doc) = &out[0] else {
            panic!("expected a document");
        };
        assert_eq!(doc.raw_content, "f\u{fffd}o");
    }

    #[tokio::test]
    async fn oversized_and_missing_files_are_permanent() {
        let tmp = TempDir::new().unwrap();
        let reader = FileReader::new(&ReaderParams {
            max_file_size: Some(2),
            on_invalid_utf8: InvalidUtf8::Fail,
        });
        let big = file_ref(&tmp, "big.txt", b"too large");
        assert!(matches!(
            reader.apply(Item::File(big)).await,
            Err(StageError::Permanent(_))
        ));

        let mut gone = file_ref(&tmp, "gone.txt", b"x");
        std::fs::remove_file(&gone.path).unwrap();
        gone.size = 0;
        assert!(matches!(
            reader.apply(Item::File(gone)).await,
            Err(StageError::Permanent(_))
        ));
    }
}
