//! The seam between the control core and whatever wire protocol actually
//! talks to a device.

use anyhow::Result;

/// Transport for one device: move a prepared file onto it and drive its
/// execution. Implementations wrap a concrete protocol (MQTT+FTP on
/// current hardware); the core never sees the wire.
///
/// All operations are awaited by the owning controller, which applies its
/// own time boxes -- implementations should not retry internally.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Transfer a prepared file to the device and start executing it.
    /// Returning `Ok` means the device acknowledged the start, not that
    /// the job finished.
    async fn upload_and_start(&self, job_name: &str, content: &str) -> Result<()>;

    /// Run a standalone G-code sequence (e.g. a clearing motion) and wait
    /// for the device to acknowledge it.
    async fn run_sequence(&self, name: &str, gcode: &str) -> Result<()>;

    /// Pause the current job.
    async fn pause(&self) -> Result<()>;

    /// Resume the paused job.
    async fn resume(&self) -> Result<()>;

    /// Stop the current job. Used for operator cancels; the device is
    /// expected to return to idle on its own afterwards.
    async fn stop(&self) -> Result<()>;
}

#[async_trait::async_trait]
impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    async fn upload_and_start(&self, job_name: &str, content: &str) -> Result<()> {
        (**self).upload_and_start(job_name, content).await
    }

    async fn run_sequence(&self, name: &str, gcode: &str) -> Result<()> {
        (**self).run_sequence(name, gcode).await
    }

    async fn pause(&self) -> Result<()> {
        (**self).pause().await
    }

    async fn resume(&self) -> Result<()> {
        (**self).resume().await
    }

    async fn stop(&self) -> Result<()> {
        (**self).stop().await
    }
}

/// Where base printable files live. Jobs carry a `file_id`; the controller
/// fetches the content at upload time so the store stays the single source
/// of truth for file bytes.
#[async_trait::async_trait]
pub trait FileStore: Send + Sync {
    /// Fetch the content of a stored file.
    async fn fetch(&self, file_id: &str) -> Result<String>;
}
