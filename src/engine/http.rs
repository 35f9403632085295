// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use super::{DownloadEngine, EngineFactory, ProgressSink, TransferJob, TransferReport};
use crate::error::DownloadError;
use crate::http::HttpClient;
use crate::library::EpisodeRecord;

/// Engine that streams an episode over HTTP into its partial file.
///
/// A non-zero `resume_from` asks for a byte range; a 206 appends to the
/// partial file, a 200 restarts from zero.
#[derive(Clone)]
pub struct HttpEngine<C> {
    client: C,
}

impl<C: HttpClient> HttpEngine<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<C: HttpClient> DownloadEngine for HttpEngine<C> {
    async fn transfer(
        &self,
        job: TransferJob,
        mut progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<TransferReport, DownloadError> {
        let url = job.url.as_str();

        // Only trust the recorded offset if the partial file agrees with it
        let on_disk = partial_len(&job.partial_path).await;
        let requested = if job.resume_from > 0 && on_disk == job.resume_from {
            job.resume_from
        } else {
            0
        };

        let response = tokio::select! {
            () = cancel.cancelled() => return Err(DownloadError::Cancelled),
            response = self.client.get_stream(url, requested) => {
                response.map_err(|e| DownloadError::HttpFailed {
                    url: url.to_string(),
                    source: e,
                })?
            }
        };

        match response.status {
            401 | 407 => {
                return Err(DownloadError::AuthenticationRequired {
                    url: url.to_string(),
                    status: response.status,
                });
            }
            416 => {
                // Server no longer honours the range; start over next time
                let _ = tokio::fs::remove_file(&job.partial_path).await;
                return Err(DownloadError::HttpStatus {
                    url: url.to_string(),
                    status: response.status,
                });
            }
            status if status >= 400 => {
                return Err(DownloadError::HttpStatus {
                    url: url.to_string(),
                    status,
                });
            }
            _ => {}
        }

        let resumed_from = if requested > 0 && response.status == 206 {
            requested
        } else {
            0
        };

        if let Some(parent) = job.partial_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadError::FileCreateFailed {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }

        let opened = if resumed_from > 0 {
            OpenOptions::new()
                .append(true)
                .open(&job.partial_path)
                .await
        } else {
            File::create(&job.partial_path).await
        };
        let mut file = opened.map_err(|e| DownloadError::FileCreateFailed {
            path: job.partial_path.clone(),
            source: e,
        })?;

        let total_bytes = response.content_length.map(|len| len + resumed_from);
        let content_type = response.content_type;
        let mut bytes_downloaded: u64 = 0;
        let mut stream = response.body;

        progress.update(resumed_from, total_bytes);

        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => {
                    // Keep what we have for a later resume
                    let _ = file.flush().await;
                    return Err(DownloadError::Cancelled);
                }
                next = stream.next() => next,
            };

            let Some(chunk_result) = next else {
                break;
            };

            let chunk = chunk_result.map_err(|e| DownloadError::StreamFailed {
                url: url.to_string(),
                source: e,
            })?;

            file.write_all(&chunk)
                .await
                .map_err(|e| DownloadError::FileWriteFailed {
                    path: job.partial_path.clone(),
                    source: e,
                })?;

            bytes_downloaded += chunk.len() as u64;
            progress.update(resumed_from + bytes_downloaded, total_bytes);
        }

        file.flush()
            .await
            .map_err(|e| DownloadError::FileWriteFailed {
                path: job.partial_path.clone(),
                source: e,
            })?;
        drop(file);

        move_into_place(&job.partial_path, &job.destination).await?;
        progress.flush();

        Ok(TransferReport {
            bytes_downloaded,
            file_size: resumed_from + bytes_downloaded,
            resumed_from,
            content_type,
        })
    }
}

impl<C> EngineFactory for HttpEngine<C>
where
    C: HttpClient + Clone + 'static,
{
    fn new_engine(&self, _episode: &EpisodeRecord) -> Arc<dyn DownloadEngine> {
        Arc::new(self.clone())
    }
}

async fn partial_len(path: &Path) -> u64 {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.len())
        .unwrap_or(0)
}

/// Rename the partial file onto its destination, copying when the two
/// directories live on different filesystems
async fn move_into_place(partial: &Path, destination: &Path) -> Result<(), DownloadError> {
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| DownloadError::FileCreateFailed {
                path: parent.to_path_buf(),
                source: e,
            })?;
    }

    if tokio::fs::rename(partial, destination).await.is_ok() {
        return Ok(());
    }

    tokio::fs::copy(partial, destination)
        .await
        .map_err(|e| DownloadError::FileWriteFailed {
            path: destination.to_path_buf(),
            source: e,
        })?;
    if let Err(e) = tokio::fs::remove_file(partial).await {
        tracing::warn!(path = %partial.display(), error = %e, "Failed to remove partial file");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TransferProgress;
    use crate::http::{ByteStream, HttpResponse};
    use crate::progress::NoopReporter;
    use bytes::Bytes;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};
    use tokio::sync::watch;
    use url::Url;

    #[derive(Clone)]
    struct MockHttpClient {
        response_data: Vec<u8>,
        status: u16,
        content_type: Option<String>,
        offsets: Arc<Mutex<Vec<u64>>>,
    }

    impl MockHttpClient {
        fn new(data: &[u8], status: u16) -> Self {
            Self {
                response_data: data.to_vec(),
                status,
                content_type: Some("audio/mpeg".to_string()),
                offsets: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl HttpClient for MockHttpClient {
        async fn get_stream(&self, _url: &str, offset: u64) -> Result<HttpResponse, reqwest::Error> {
            self.offsets.lock().unwrap().push(offset);

            let data = self.response_data.clone();
            let len = data.len() as u64;
            let stream: ByteStream =
                Box::pin(futures::stream::once(async move { Ok(Bytes::from(data)) }));

            Ok(HttpResponse {
                status: self.status,
                content_length: Some(len),
                content_type: self.content_type.clone(),
                body: stream,
            })
        }
    }

    /// Client whose body never ends
    struct EndlessClient;

    #[async_trait]
    impl HttpClient for EndlessClient {
        async fn get_stream(&self, _url: &str, _offset: u64) -> Result<HttpResponse, reqwest::Error> {
            let first = futures::stream::once(async { Ok(Bytes::from_static(b"head")) });
            let body: ByteStream = Box::pin(first.chain(futures::stream::pending()));
            Ok(HttpResponse {
                status: 200,
                content_length: None,
                content_type: None,
                body,
            })
        }
    }

    fn make_job(dir: &TempDir, resume_from: u64) -> TransferJob {
        let mut episode = EpisodeRecord::new("ep-1", "Test Episode", "https://example.com/episode.mp3");
        episode.file_name = "episode.mp3".to_string();
        TransferJob {
            url: Url::parse(&episode.url).unwrap(),
            partial_path: dir.path().join("tmp/episode.mp3.partial"),
            destination: dir.path().join("dl/episode.mp3"),
            resume_from,
            episode,
        }
    }

    fn sink() -> (ProgressSink, watch::Receiver<TransferProgress>) {
        let (tx, rx) = watch::channel(TransferProgress::default());
        let sink = ProgressSink::new(
            "ep-1".into(),
            tx,
            NoopReporter::shared(),
            Duration::from_secs(1),
        );
        (sink, rx)
    }

    #[tokio::test]
    async fn transfer_writes_destination_and_removes_partial() {
        let dir = tempdir().unwrap();
        let engine = HttpEngine::new(MockHttpClient::new(b"test audio content", 200));
        let job = make_job(&dir, 0);
        let (progress, rx) = sink();

        let report = engine
            .transfer(job.clone(), progress, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.bytes_downloaded, 18);
        assert_eq!(report.file_size, 18);
        assert_eq!(report.content_type.as_deref(), Some("audio/mpeg"));
        assert_eq!(std::fs::read(&job.destination).unwrap(), b"test audio content");
        assert!(!job.partial_path.exists());
        assert_eq!(rx.borrow().bytes_downloaded, 18);
    }

    #[tokio::test]
    async fn partial_content_is_appended() {
        let dir = tempdir().unwrap();
        let job = make_job(&dir, 5);
        std::fs::create_dir_all(job.partial_path.parent().unwrap()).unwrap();
        std::fs::write(&job.partial_path, b"hello").unwrap();

        let client = MockHttpClient::new(b" world", 206);
        let offsets = client.offsets.clone();
        let engine = HttpEngine::new(client);
        let (progress, _rx) = sink();

        let report = engine
            .transfer(job.clone(), progress, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(*offsets.lock().unwrap(), vec![5]);
        assert_eq!(report.resumed_from, 5);
        assert_eq!(report.file_size, 11);
        assert_eq!(std::fs::read(&job.destination).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn full_response_to_range_request_restarts() {
        let dir = tempdir().unwrap();
        let job = make_job(&dir, 5);
        std::fs::create_dir_all(job.partial_path.parent().unwrap()).unwrap();
        std::fs::write(&job.partial_path, b"stale").unwrap();

        let engine = HttpEngine::new(MockHttpClient::new(b"fresh body", 200));
        let (progress, _rx) = sink();

        let report = engine
            .transfer(job.clone(), progress, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.resumed_from, 0);
        assert_eq!(std::fs::read(&job.destination).unwrap(), b"fresh body");
    }

    #[tokio::test]
    async fn mismatched_partial_is_not_resumed() {
        let dir = tempdir().unwrap();
        // Recorded offset says 50 bytes, but nothing is on disk
        let job = make_job(&dir, 50);

        let client = MockHttpClient::new(b"data", 200);
        let offsets = client.offsets.clone();
        let engine = HttpEngine::new(client);
        let (progress, _rx) = sink();

        engine
            .transfer(job, progress, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(*offsets.lock().unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn http_error_status_fails() {
        let dir = tempdir().unwrap();
        let engine = HttpEngine::new(MockHttpClient::new(b"Not Found", 404));
        let (progress, _rx) = sink();

        let result = engine
            .transfer(make_job(&dir, 0), progress, CancellationToken::new())
            .await;

        match result.unwrap_err() {
            DownloadError::HttpStatus { status, .. } => assert_eq!(status, 404),
            other => panic!("Expected HttpStatus error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unauthorized_is_not_resumable() {
        let dir = tempdir().unwrap();
        let engine = HttpEngine::new(MockHttpClient::new(b"", 401));
        let (progress, _rx) = sink();

        let err = engine
            .transfer(make_job(&dir, 0), progress, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::AuthenticationRequired { status: 401, .. }));
        assert!(!err.is_resumable());
    }

    #[tokio::test]
    async fn cancellation_keeps_partial_file() {
        let dir = tempdir().unwrap();
        let engine = HttpEngine::new(EndlessClient);
        let job = make_job(&dir, 0);
        let (progress, mut rx) = sink();
        let cancel = CancellationToken::new();

        let task = {
            let job = job.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { engine.transfer(job, progress, cancel).await })
        };

        // Wait until the first chunk landed
        rx.changed().await.unwrap();
        while rx.borrow().bytes_downloaded < 4 {
            rx.changed().await.unwrap();
        }
        cancel.cancel();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(DownloadError::Cancelled)));
        assert_eq!(std::fs::read(&job.partial_path).unwrap(), b"head");
        assert!(!job.destination.exists());
    }
}
