use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::pipeline::PipelineResult;

const FILE_NAME: &str = "last_result.json";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Keeps the most recent pipeline result on disk, one file, overwritten each run.
#[derive(Debug, Clone)]
pub struct LastResultStore {
    path: PathBuf,
}

impl LastResultStore {
    pub fn new(data_dir: &Path) -> Self {
        Self { path: data_dir.join(FILE_NAME) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write via a temp file in the same directory so readers never see a partial file.
    pub fn save(&self, result: &PipelineResult) -> Result<(), CacheError> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, result)?;
        tmp.flush()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        tracing::debug!("Saved last result to {}", self.path.display());
        Ok(())
    }

    pub fn load(&self) -> Result<Option<PipelineResult>, CacheError> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&data)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::PaperCandidate;
    use crate::pipeline::ProcessedPaper;
    use crate::scrape::{AbstractSource, ScrapeResult};

    #[test]
    fn test_load_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = LastResultStore::new(dir.path());
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = LastResultStore::new(&dir.path().join("nested"));

        let paper = ProcessedPaper::new(
            PaperCandidate::new("T", "https://arxiv.org/abs/1", "snip"),
            ScrapeResult {
                abstract_text: "snip".into(),
                source: AbstractSource::Snippet,
                success: false,
            },
        );
        let result = PipelineResult::new("transformers", vec![paper]);
        store.save(&result).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.query, "transformers");
        assert_eq!(loaded.papers.len(), 1);
        assert_eq!(loaded.papers[0].abstract_source, AbstractSource::Snippet);

        store.save(&PipelineResult::new("second", vec![])).unwrap();
        assert_eq!(store.load().unwrap().unwrap().query, "second");
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = LastResultStore::new(dir.path());
        std::fs::write(store.path(), "{not json").unwrap();
        assert!(matches!(store.load(), Err(CacheError::Json(_))));
    }
}
