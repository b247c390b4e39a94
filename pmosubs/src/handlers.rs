//! Pull sources for the subscription handler binaries.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use pmoproc::{HandlerError, PullSource};

const HTTP_FETCH_TIMEOUT: Duration = Duration::from_secs(20);

/// Reads a subscription document from a local file.
pub struct FilePullSource {
    path: PathBuf,
}

impl FilePullSource {
    pub fn new(path: PathBuf) -> FilePullSource {
        FilePullSource { path }
    }
}

#[async_trait]
impl PullSource for FilePullSource {
    async fn read(&mut self) -> Result<String, HandlerError> {
        tokio::fs::read_to_string(&self.path)
            .await
            .map(|text| text.trim().to_string())
            .map_err(|e| HandlerError::Read(format!("error reading path: {e}")))
    }
}

/// Fetches a subscription document over HTTP with a bounded timeout.
pub struct HttpPullSource {
    uri: String,
    agent: ureq::Agent,
}

impl HttpPullSource {
    pub fn new(uri: String) -> HttpPullSource {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(HTTP_FETCH_TIMEOUT))
            .build();
        HttpPullSource {
            uri,
            agent: config.into(),
        }
    }
}

#[async_trait]
impl PullSource for HttpPullSource {
    async fn read(&mut self) -> Result<String, HandlerError> {
        let agent = self.agent.clone();
        let uri = self.uri.clone();
        // ureq is blocking; keep the runtime responsive.
        tokio::task::spawn_blocking(move || {
            let mut response = agent
                .get(&uri)
                .call()
                .map_err(|e| HandlerError::Read(format!("error fetching {uri}: {e}")))?;
            response
                .body_mut()
                .read_to_string()
                .map_err(|e| HandlerError::Read(format!("error reading body of {uri}: {e}")))
        })
        .await
        .map_err(|e| HandlerError::Read(format!("fetch task failed: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_source_reads_and_trims() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("root.xml");
        std::fs::write(&path, "  <subscription-update uri='x'/>\n").unwrap();

        let mut source = FilePullSource::new(path);
        let text = source.read().await.unwrap();
        assert_eq!(text, "<subscription-update uri='x'/>");
    }

    #[tokio::test]
    async fn missing_file_is_a_read_error() {
        let mut source = FilePullSource::new(PathBuf::from("/does/not/exist.xml"));
        assert!(source.read().await.is_err());
    }
}
