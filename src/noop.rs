//! A transport that does nothing but remember what it was asked, and an
//! in-memory file store. Used for dry runs and throughout the tests.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;

use crate::traits::{FileStore, Transport};

/// One recorded transport call.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCall {
    /// `upload_and_start(file_name)`; content is kept alongside.
    Upload {
        /// Upload name.
        file_name: String,
        /// Full uploaded content.
        content: String,
    },
    /// `run_sequence(name)`; gcode is kept alongside.
    Sequence {
        /// Sequence name.
        name: String,
        /// The G-code sent.
        gcode: String,
    },
    /// `pause()`.
    Pause,
    /// `resume()`.
    Resume,
    /// `stop()`.
    Stop,
}

#[derive(Default)]
struct Inner {
    calls: Vec<TransportCall>,
    failures: Vec<String>,
    stalls: Vec<String>,
}

/// A [Transport] that acknowledges everything instantly and records the
/// call sequence. Individual operations can be scripted to fail.
#[derive(Default)]
pub struct NoopTransport {
    inner: Mutex<Inner>,
}

impl NoopTransport {
    /// A transport where every call succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the named operation (`"upload"`, `"sequence"`, `"pause"`,
    /// `"resume"`, `"stop"`) to fail on its next invocation.
    pub fn fail_next(&self, op: &str) {
        self.inner.lock().expect("transport lock").failures.push(op.to_owned());
    }

    /// Script the named operation to hang on its next invocation instead
    /// of acknowledging. The call never records or completes; it only
    /// ends when its task is aborted.
    pub fn stall_next(&self, op: &str) {
        self.inner.lock().expect("transport lock").stalls.push(op.to_owned());
    }

    /// Everything the transport has been asked to do, in order.
    pub fn calls(&self) -> Vec<TransportCall> {
        self.inner.lock().expect("transport lock").calls.clone()
    }

    async fn stall_if_scripted(&self, op: &str) {
        let scripted = {
            let mut inner = self.inner.lock().expect("transport lock");
            match inner.stalls.iter().position(|s| s == op) {
                Some(pos) => {
                    inner.stalls.remove(pos);
                    true
                }
                None => false,
            }
        };
        if scripted {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        }
    }

    fn record(&self, op: &str, call: TransportCall) -> Result<()> {
        let mut inner = self.inner.lock().expect("transport lock");
        inner.calls.push(call);
        if let Some(pos) = inner.failures.iter().position(|f| f == op) {
            inner.failures.remove(pos);
            anyhow::bail!("scripted {} failure", op);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Transport for NoopTransport {
    async fn upload_and_start(&self, job_name: &str, content: &str) -> Result<()> {
        self.stall_if_scripted("upload").await;
        self.record(
            "upload",
            TransportCall::Upload {
                file_name: job_name.to_owned(),
                content: content.to_owned(),
            },
        )
    }

    async fn run_sequence(&self, name: &str, gcode: &str) -> Result<()> {
        self.stall_if_scripted("sequence").await;
        self.record(
            "sequence",
            TransportCall::Sequence {
                name: name.to_owned(),
                gcode: gcode.to_owned(),
            },
        )
    }

    async fn pause(&self) -> Result<()> {
        self.record("pause", TransportCall::Pause)
    }

    async fn resume(&self) -> Result<()> {
        self.record("resume", TransportCall::Resume)
    }

    async fn stop(&self) -> Result<()> {
        self.record("stop", TransportCall::Stop)
    }
}

/// A [FileStore] backed by a map.
#[derive(Default)]
pub struct InMemoryFileStore {
    files: Mutex<HashMap<String, String>>,
}

impl InMemoryFileStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a file.
    pub fn insert(&self, file_id: &str, content: &str) {
        self.files
            .lock()
            .expect("file store lock")
            .insert(file_id.to_owned(), content.to_owned());
    }
}

#[async_trait::async_trait]
impl FileStore for InMemoryFileStore {
    async fn fetch(&self, file_id: &str) -> Result<String> {
        self.files
            .lock()
            .expect("file store lock")
            .get(file_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no such file: {}", file_id))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn test_records_calls_in_order() {
        let transport = NoopTransport::new();
        transport.upload_and_start("a.gcode", "G28\n").await.unwrap();
        transport.pause().await.unwrap();
        transport.resume().await.unwrap();

        let calls = transport.calls();
        assert_eq!(calls.len(), 3);
        assert!(matches!(&calls[0], TransportCall::Upload { file_name, .. } if file_name == "a.gcode"));
        assert_eq!(calls[1], TransportCall::Pause);
        assert_eq!(calls[2], TransportCall::Resume);
    }

    #[tokio::test]
    async fn test_scripted_failure_fires_once() {
        let transport = NoopTransport::new();
        transport.fail_next("upload");
        assert!(transport.upload_and_start("a", "x").await.is_err());
        assert!(transport.upload_and_start("a", "x").await.is_ok());
    }

    #[tokio::test]
    async fn test_file_store_fetch() {
        let store = InMemoryFileStore::new();
        store.insert("bracket", "G28\n");
        assert_eq!(store.fetch("bracket").await.unwrap(), "G28\n");
        assert!(store.fetch("missing").await.is_err());
    }
}
