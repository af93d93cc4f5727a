//! Background tasks for DFU operations.
//!
//! Each command runs the blocking engine on tokio's blocking pool and
//! forwards engine events to a progress callback on a separate thread.
//! The transport is handed back with the result so the caller can reuse
//! or reattach it.

use serde::Serialize;
use std::sync::mpsc;
use std::thread;

use crate::dfu::{
    CancelToken, ChannelObserver, DfuError, DfuEvent, DfuResult, DfuTransport, EngineConfig,
    EraseOutcome, FirmwareImage, Notifier, ProgramEngine,
};

/// Progress event handed to the caller during a DFU task.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DfuProgressEvent {
    /// Current stage name.
    pub stage: String,
    /// Blocks done (for writing and reading stages).
    pub done: Option<usize>,
    /// Total blocks (for writing and reading stages).
    pub total: Option<usize>,
    /// Progress percentage (0-100), -1 when not applicable.
    pub percent: f32,
    /// Human-readable message.
    pub message: String,
    /// RFC 3339 time the event was forwarded.
    pub timestamp: String,
}

impl From<DfuEvent> for DfuProgressEvent {
    fn from(event: DfuEvent) -> Self {
        let (stage_name, done, total) = match &event {
            DfuEvent::Connected { .. } => ("connected", None, None),
            DfuEvent::CheckingProtection => ("protection", None, None),
            DfuEvent::Erasing => ("erasing", None, None),
            DfuEvent::EraseComplete { .. } => ("erased", None, None),
            DfuEvent::ProtectionRemoved => ("unprotected", None, None),
            DfuEvent::Writing { written, total } => ("writing", Some(*written), Some(*total)),
            DfuEvent::ProgramComplete { .. } => ("programmed", None, None),
            DfuEvent::Reading { read, total } => ("reading", Some(*read), Some(*total)),
            DfuEvent::VerifyComplete { .. } => ("verified", None, None),
            DfuEvent::Failed { .. } => ("failed", None, None),
            DfuEvent::Log { .. } => ("log", None, None),
        };

        Self {
            stage: stage_name.to_string(),
            done,
            total,
            percent: event.percent(),
            message: event.message(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Transport returned from a finished task, with the operation's result.
#[derive(Debug)]
pub struct TaskOutcome<T, R> {
    pub transport: T,
    pub result: DfuResult<R>,
}

/// Erase all flash, or lift read protection on a protected device.
pub async fn erase_device<T, F>(
    transport: T,
    config: EngineConfig,
    progress: F,
) -> Result<TaskOutcome<T, EraseOutcome>, String>
where
    T: DfuTransport + 'static,
    F: Fn(DfuProgressEvent) + Send + 'static,
{
    run_engine(transport, config, CancelToken::new(), progress, |engine| {
        engine.mass_erase()
    })
    .await
}

/// Program an image, optionally reading it back afterwards.
///
/// A readback that differs from the image fails with `VerifyMismatch`.
pub async fn flash_firmware<T, F>(
    transport: T,
    config: EngineConfig,
    image: FirmwareImage,
    verify: bool,
    cancel: CancelToken,
    progress: F,
) -> Result<TaskOutcome<T, ()>, String>
where
    T: DfuTransport + 'static,
    F: Fn(DfuProgressEvent) + Send + 'static,
{
    run_engine(transport, config, cancel, progress, move |engine| {
        engine.program(&image)?;
        if verify && !engine.verify(&image)? {
            return Err(DfuError::VerifyMismatch);
        }
        Ok(())
    })
    .await
}

/// Compare device flash with an image.
pub async fn verify_firmware<T, F>(
    transport: T,
    config: EngineConfig,
    image: FirmwareImage,
    cancel: CancelToken,
    progress: F,
) -> Result<TaskOutcome<T, bool>, String>
where
    T: DfuTransport + 'static,
    F: Fn(DfuProgressEvent) + Send + 'static,
{
    run_engine(transport, config, cancel, progress, move |engine| {
        engine.verify(&image)
    })
    .await
}

/// Check whether read-out protection is active.
pub async fn check_protection<T, F>(
    transport: T,
    config: EngineConfig,
    progress: F,
) -> Result<TaskOutcome<T, bool>, String>
where
    T: DfuTransport + 'static,
    F: Fn(DfuProgressEvent) + Send + 'static,
{
    run_engine(transport, config, CancelToken::new(), progress, |engine| {
        engine.is_protected()
    })
    .await
}

/// Run one engine operation on the blocking pool.
///
/// The outer error only reports a panicked task.
async fn run_engine<T, R, F, Op>(
    transport: T,
    config: EngineConfig,
    cancel: CancelToken,
    progress: F,
    op: Op,
) -> Result<TaskOutcome<T, R>, String>
where
    T: DfuTransport + 'static,
    R: Send + 'static,
    F: Fn(DfuProgressEvent) + Send + 'static,
    Op: FnOnce(&mut ProgramEngine<T>) -> DfuResult<R> + Send + 'static,
{
    if let Err(e) = config.validate() {
        return Ok(TaskOutcome {
            transport,
            result: Err(e),
        });
    }

    // Create a channel for progress updates from the blocking thread
    let (tx, rx) = mpsc::channel::<DfuEvent>();

    // Spawn a thread to forward progress updates
    let progress_task = thread::spawn(move || {
        while let Ok(event) = rx.recv() {
            progress(DfuProgressEvent::from(event));
        }
    });

    // Run DFU in a blocking task; the notifier (and sender) drop with the engine
    let outcome = tokio::task::spawn_blocking(move || {
        let notifier = Notifier::new(vec![Box::new(ChannelObserver(tx))]);
        let mut engine =
            ProgramEngine::attach(transport, config, notifier).with_cancel_token(cancel);
        let result = op(&mut engine);
        TaskOutcome {
            transport: engine.into_transport(),
            result,
        }
    })
    .await
    .map_err(|e| format!("DFU task panicked: {}", e))?;

    // Wait for progress forwarding to complete
    let _ = progress_task.join();

    Ok(outcome)
}
