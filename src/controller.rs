//! One controller per device: a long-lived task owning the device's
//! lifecycle. It consumes a single serialized stream of scheduler claims,
//! operator commands, and telemetry reports, so no two transitions can
//! ever race on the same device, and no device's loop can block
//! another's.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use uuid::Uuid;

use crate::clearing;
use crate::config::{TimeoutConfig, WatchdogConfig};
use crate::hms::{self, FaultDisposition};
use crate::job::{Job, JobQueue};
use crate::kinematics;
use crate::machine::{AutomationConfig, MachineMakeModel, MachineSnapshot, MachineState};
use crate::prepare;
use crate::telemetry::{Report, ReportedState};
use crate::traits::{FileStore, Transport};

/// Operator verbs accepted by a controller. Processed in arrival order
/// with telemetry; `Cancel` and `ForceClear` additionally preempt an
/// in-flight upload or clearing motion rather than queueing behind it.
#[derive(Debug, Clone, Copy)]
pub enum OperatorCommand {
    /// Suspend the current print.
    Pause,
    /// Resume a paused print.
    Resume,
    /// Abort the current job; the job fails, the device heads to idle.
    Cancel,
    /// Acknowledge an error and return the device to idle.
    ClearError,
    /// Operator confirms the build surface is empty.
    ConfirmClearance,
    /// Override the automatic gate and reset to idle. Accepted only while
    /// idle, cooling down, or awaiting clearance.
    ForceClear,
    /// Replace the automation policy. Takes effect on the next relevant
    /// transition.
    SetAutomation(AutomationConfig),
}

/// Why a claim was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ClaimRefused {
    /// The device is not idle.
    #[error("device is not idle")]
    NotIdle,
    /// Scheduling to this device is disabled.
    #[error("queueing is disabled on this device")]
    QueueingDisabled,
}

enum Message {
    Claim {
        job: Job,
        reply: oneshot::Sender<Result<(), ClaimRefused>>,
    },
    Operator(OperatorCommand),
    Report(Report),
}

/// How a monitored transport operation ended.
enum WaitOutcome {
    /// The operation ran to its own conclusion (or hit its deadline).
    Settled(Result<()>),
    /// An operator command aborted it.
    Interrupted(OperatorCommand),
    /// The message channel closed underneath us.
    Shutdown,
}

/// Cheap, cloneable handle to a running controller.
#[derive(Clone)]
pub struct MachineHandle {
    serial: String,
    tx: mpsc::Sender<Message>,
    snapshot_rx: watch::Receiver<MachineSnapshot>,
}

impl MachineHandle {
    /// The device serial this handle points at.
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// The latest published snapshot.
    pub fn snapshot(&self) -> MachineSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Ask the controller to take a job. The reply arrives as soon as the
    /// claim is accepted or refused; the upload proceeds afterwards in
    /// the controller's own time.
    pub async fn claim(&self, job: Job) -> Result<(), ClaimRefused> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Message::Claim { job, reply }).await.is_err() {
            // Controller gone; treat like a device that is not idle.
            return Err(ClaimRefused::NotIdle);
        }
        rx.await.unwrap_or(Err(ClaimRefused::NotIdle))
    }

    /// Deliver an operator command.
    pub async fn command(&self, cmd: OperatorCommand) -> Result<()> {
        self.tx
            .send(Message::Operator(cmd))
            .await
            .map_err(|_| anyhow::anyhow!("controller for {} is gone", self.serial))
    }

    /// Feed one telemetry frame into the controller.
    pub async fn report(&self, report: Report) -> Result<()> {
        self.tx
            .send(Message::Report(report))
            .await
            .map_err(|_| anyhow::anyhow!("controller for {} is gone", self.serial))
    }

    /// Wait until the published snapshot satisfies a predicate. Test and
    /// shutdown helper.
    pub async fn wait_for(&self, mut predicate: impl FnMut(&MachineSnapshot) -> bool) -> Result<MachineSnapshot> {
        let mut rx = self.snapshot_rx.clone();
        loop {
            {
                let snap = rx.borrow_and_update();
                if predicate(&snap) {
                    return Ok(snap.clone());
                }
            }
            rx.changed().await?;
        }
    }
}

struct ActiveJob {
    id: Uuid,
    part_height_mm: f64,
}

/// The per-device control loop.
pub struct Controller {
    snapshot: MachineSnapshot,
    queue: Arc<JobQueue>,
    // Arc so long operations can run on their own task and be aborted
    // while the controller keeps draining its channel.
    transport: Arc<dyn Transport>,
    files: Arc<dyn FileStore>,
    timeouts: TimeoutConfig,
    watchdog: WatchdogConfig,

    rx: mpsc::Receiver<Message>,
    snapshot_tx: watch::Sender<MachineSnapshot>,

    active: Option<ActiveJob>,
    retries_used: u32,
    last_report: Instant,
}

impl Controller {
    /// Spawn a controller task for one device and return its handle.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        serial: &str,
        name: &str,
        make_model: MachineMakeModel,
        automation: AutomationConfig,
        queue: Arc<JobQueue>,
        transport: Box<dyn Transport>,
        files: Arc<dyn FileStore>,
        timeouts: TimeoutConfig,
        watchdog: WatchdogConfig,
    ) -> MachineHandle {
        let snapshot = MachineSnapshot::new(serial, name, make_model, automation);
        let (snapshot_tx, snapshot_rx) = watch::channel(snapshot.clone());
        let (tx, rx) = mpsc::channel(64);

        let controller = Controller {
            snapshot,
            queue,
            transport: Arc::from(transport),
            files,
            timeouts,
            watchdog,
            rx,
            snapshot_tx,
            active: None,
            retries_used: 0,
            last_report: Instant::now(),
        };

        let handle = MachineHandle {
            serial: serial.to_owned(),
            tx,
            snapshot_rx,
        };

        tokio::spawn(controller.run());

        handle
    }

    async fn run(mut self) {
        let offline_after = Duration::from_secs(self.timeouts.offline_secs);
        loop {
            let deadline = self.last_report + offline_after;
            tokio::select! {
                message = self.rx.recv() => {
                    let Some(message) = message else {
                        tracing::info!(serial = self.snapshot.serial, "controller channel closed, shutting down");
                        return;
                    };
                    self.dispatch(message).await;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    self.handle_silence();
                }
            }
        }
    }

    async fn dispatch(&mut self, message: Message) {
        match message {
            Message::Claim { job, reply } => {
                let _ = reply.send(self.check_claim());
                // Only an accepted claim proceeds to upload.
                if self.snapshot.state == MachineState::Uploading {
                    self.execute_upload(job).await;
                }
            }
            Message::Operator(cmd) => self.handle_command(cmd).await,
            Message::Report(report) => self.handle_report(report).await,
        }
    }

    /// Wait for a transport operation running on its own task, without
    /// going deaf: the message stream keeps draining the whole time.
    /// Operator commands matching `interrupts` abort the operation and
    /// are handed back; everything else is deferred for replay once the
    /// wait settles.
    async fn await_operation(
        &mut self,
        mut task: tokio::task::JoinHandle<Result<()>>,
        deadline: Instant,
        interrupts: fn(OperatorCommand) -> bool,
        deferred: &mut Vec<Message>,
    ) -> WaitOutcome {
        loop {
            tokio::select! {
                joined = &mut task => {
                    return WaitOutcome::Settled(match joined {
                        Ok(result) => result,
                        Err(e) => Err(anyhow::anyhow!("transport task failed: {}", e)),
                    });
                }
                _ = tokio::time::sleep_until(deadline) => {
                    task.abort();
                    return WaitOutcome::Settled(Err(anyhow::anyhow!("timed out")));
                }
                message = self.rx.recv() => match message {
                    None => {
                        task.abort();
                        return WaitOutcome::Shutdown;
                    }
                    Some(Message::Operator(cmd)) if interrupts(cmd) => {
                        task.abort();
                        return WaitOutcome::Interrupted(cmd);
                    }
                    Some(other) => deferred.push(other),
                },
            }
        }
    }

    /// Run messages deferred during a transport wait through the normal
    /// handlers, in arrival order.
    async fn replay(&mut self, deferred: Vec<Message>) {
        for message in deferred {
            Box::pin(self.dispatch(message)).await;
        }
    }

    fn publish(&self) {
        let _ = self.snapshot_tx.send(self.snapshot.clone());
    }

    fn set_state(&mut self, next: MachineState) {
        if self.snapshot.state != next {
            tracing::info!(
                serial = self.snapshot.serial,
                from = self.snapshot.state.to_string(),
                to = next.to_string(),
                "state transition"
            );
            self.snapshot.state = next;
        }
        self.publish();
    }

    // -- claims / upload ---------------------------------------------------

    fn check_claim(&mut self) -> Result<(), ClaimRefused> {
        if !self.snapshot.automation.queueing_enabled {
            return Err(ClaimRefused::QueueingDisabled);
        }
        if self.snapshot.state != MachineState::Idle {
            return Err(ClaimRefused::NotIdle);
        }
        // Reserve the device before replying; a racing tick now sees
        // Uploading and cannot double-claim.
        self.snapshot.state = MachineState::Uploading;
        self.publish();
        Ok(())
    }

    async fn execute_upload(&mut self, job: Job) {
        self.snapshot.current_job = Some(job.id);
        self.retries_used = 0;
        self.publish();

        let prepared = match self.files.fetch(&job.file_id).await {
            Ok(base) => prepare::prepare(&base, &job, &self.snapshot.automation),
            Err(e) => {
                tracing::error!(serial = self.snapshot.serial, job = job.id.to_string(), error = format!("{:?}", e), "file fetch failed");
                let _ = self.queue.mark_failed(job.id, &format!("upload failed: {}", e));
                self.snapshot.current_job = None;
                self.set_state(MachineState::Idle);
                return;
            }
        };

        let transport = self.transport.clone();
        let task = tokio::spawn(async move {
            transport.upload_and_start(&prepared.file_name, &prepared.content).await
        });
        let deadline = Instant::now() + Duration::from_secs(self.timeouts.upload_secs);
        let mut deferred = Vec::new();
        let outcome = self
            .await_operation(task, deadline, |cmd| matches!(cmd, OperatorCommand::Cancel), &mut deferred)
            .await;

        match outcome {
            WaitOutcome::Settled(Ok(())) => {
                if let Err(e) = self.queue.mark_printing(job.id) {
                    tracing::warn!(serial = self.snapshot.serial, error = e.to_string(), "job store refused printing mark");
                }
                self.active = Some(ActiveJob {
                    id: job.id,
                    part_height_mm: job.part_height_mm,
                });
                tracing::info!(serial = self.snapshot.serial, job = job.id.to_string(), "execution started");
                self.set_state(MachineState::Printing);
            }
            WaitOutcome::Settled(Err(e)) => {
                tracing::error!(serial = self.snapshot.serial, job = job.id.to_string(), error = format!("{:?}", e), "upload failed");
                let _ = self.queue.mark_failed(job.id, &format!("upload failed: {}", e));
                self.snapshot.current_job = None;
                self.active = None;
                self.set_state(MachineState::Idle);
            }
            WaitOutcome::Interrupted(_) => {
                tracing::warn!(serial = self.snapshot.serial, job = job.id.to_string(), "upload canceled by operator");
                let _ = self.transport.stop().await;
                self.fail_active_job("canceled by operator");
                self.set_state(MachineState::Idle);
            }
            WaitOutcome::Shutdown => return,
        }
        self.replay(deferred).await;
    }

    // -- operator commands -------------------------------------------------

    async fn handle_command(&mut self, cmd: OperatorCommand) {
        match cmd {
            OperatorCommand::Pause => {
                if self.snapshot.state == MachineState::Printing {
                    if let Err(e) = self.transport.pause().await {
                        tracing::error!(serial = self.snapshot.serial, error = format!("{:?}", e), "pause failed");
                        return;
                    }
                    self.set_state(MachineState::Paused);
                }
            }
            OperatorCommand::Resume => {
                if self.snapshot.state == MachineState::Paused {
                    if let Err(e) = self.transport.resume().await {
                        tracing::error!(serial = self.snapshot.serial, error = format!("{:?}", e), "resume failed");
                        return;
                    }
                    self.set_state(MachineState::Printing);
                }
            }
            OperatorCommand::Cancel => {
                if matches!(
                    self.snapshot.state,
                    MachineState::Uploading | MachineState::Printing | MachineState::Paused
                ) {
                    if let Err(e) = self.transport.stop().await {
                        tracing::error!(serial = self.snapshot.serial, error = format!("{:?}", e), "stop failed");
                    }
                    self.fail_active_job("canceled by operator");
                    self.set_state(MachineState::Idle);
                }
            }
            OperatorCommand::ClearError => match self.snapshot.state {
                MachineState::Error => {
                    self.snapshot.current_job = None;
                    self.active = None;
                    self.retries_used = 0;
                    self.set_state(MachineState::Idle);
                }
                MachineState::Paused => {
                    // Clearing a pause abandons the print.
                    let _ = self.transport.stop().await;
                    self.fail_active_job("cleared while paused");
                    self.set_state(MachineState::Idle);
                }
                _ => {}
            },
            OperatorCommand::ConfirmClearance => {
                if self.snapshot.state == MachineState::AwaitingClearance {
                    self.complete_active_job();
                    self.set_state(MachineState::Idle);
                }
            }
            OperatorCommand::ForceClear => {
                // The operator saying "the plate is empty" is accepted
                // without re-running the thermal gate, but never while a
                // job is actually printing.
                match self.snapshot.state {
                    MachineState::Idle => self.publish(),
                    MachineState::Cooldown | MachineState::AwaitingClearance => {
                        self.complete_active_job();
                        self.set_state(MachineState::Idle);
                    }
                    _ => {
                        tracing::warn!(
                            serial = self.snapshot.serial,
                            state = self.snapshot.state.to_string(),
                            "force-clear refused in this state"
                        );
                    }
                }
            }
            OperatorCommand::SetAutomation(automation) => {
                self.snapshot.automation = automation;
                self.publish();
            }
        }
    }

    fn fail_active_job(&mut self, reason: &str) {
        if let Some(active) = self.active.take() {
            let _ = self.queue.mark_failed(active.id, reason);
        } else if let Some(id) = self.snapshot.current_job {
            let _ = self.queue.mark_failed(id, reason);
        }
        self.snapshot.current_job = None;
    }

    fn complete_active_job(&mut self) {
        if let Some(active) = self.active.take() {
            if let Err(e) = self.queue.mark_completed(active.id) {
                tracing::warn!(serial = self.snapshot.serial, error = e.to_string(), "completion mark refused");
            }
        }
        self.snapshot.current_job = None;
    }

    // -- telemetry ---------------------------------------------------------

    async fn handle_report(&mut self, report: Report) {
        self.last_report = Instant::now();

        if let Some(temp) = report.bed_temp {
            self.snapshot.bed_temp = temp;
        }
        if let Some(temp) = report.nozzle_temp {
            self.snapshot.nozzle_temp = temp;
        }
        if let Some(progress) = report.progress {
            self.snapshot.progress = progress.min(100);
        }
        if let Some(remaining) = report.remaining_time_min {
            self.snapshot.remaining_time_min = remaining;
        }
        if let Some(readings) = &report.slots {
            self.snapshot.slots = readings.iter().map(|r| r.to_slot()).collect();
            self.snapshot.slots.sort_by_key(|s| (s.id.unit, s.id.slot));
        }

        if !report.hms.is_empty() {
            self.handle_faults(&report.hms).await;
        }

        if let Some(state) = report.state {
            self.handle_reported_state(state);
        }

        // The thermal gate: while cooling down, every frame carrying a
        // bed temperature is a poll. Frames without one never release the
        // gate; a stale reading is not evidence the bed is cold.
        if report.bed_temp.is_some()
            && self.snapshot.state == MachineState::Cooldown
            && clearing::thermally_released(self.snapshot.bed_temp, self.snapshot.automation.thermal_release_temp)
        {
            self.begin_clearing().await;
        }

        self.publish();
    }

    fn handle_reported_state(&mut self, reported: ReportedState) {
        match (self.snapshot.state, reported) {
            (MachineState::Printing, ReportedState::Finish) => self.handle_finish(),
            (MachineState::Printing, ReportedState::Pause) => {
                // Device-initiated pause (front panel, firmware).
                self.set_state(MachineState::Paused);
            }
            (MachineState::Paused, ReportedState::Running) => {
                self.set_state(MachineState::Printing);
            }
            (MachineState::Offline, ReportedState::Idle) => {
                // Back from the dead with nothing running. If we had a
                // job in flight its outcome is unknowable; fail it rather
                // than guess.
                if self.active.is_some() || self.snapshot.current_job.is_some() {
                    self.fail_active_job("connection lost during execution");
                }
                self.retries_used = 0;
                self.set_state(MachineState::Idle);
            }
            (MachineState::Offline, _) => {
                // Reachable again but mid-something; stay offline until
                // it reports idle.
            }
            (_, ReportedState::Offline) => {
                self.set_state(MachineState::Offline);
            }
            _ => {}
        }
    }

    /// Normal finish: the decision point between the automatic and manual
    /// clearing paths. Eligibility is evaluated here against the *current*
    /// automation config, not whatever was in effect at upload time.
    fn handle_finish(&mut self) {
        let Some(active) = &self.active else {
            tracing::warn!(serial = self.snapshot.serial, "finish reported with no active job");
            self.set_state(MachineState::AwaitingClearance);
            return;
        };

        if let Err(e) = self.queue.mark_finished(active.id) {
            tracing::warn!(serial = self.snapshot.serial, error = e.to_string(), "finish mark refused");
        }
        self.snapshot.progress = 100;
        self.snapshot.remaining_time_min = 0;
        self.retries_used = 0;

        match clearing::eject_eligibility(&self.snapshot.automation, active.part_height_mm) {
            Ok(()) => {
                tracing::info!(serial = self.snapshot.serial, "finish: cooling down for automatic clearing");
                self.set_state(MachineState::Cooldown);
            }
            Err(refusal) => {
                tracing::info!(
                    serial = self.snapshot.serial,
                    refusal = format!("{:?}", refusal),
                    "finish: manual clearance required"
                );
                self.set_state(MachineState::AwaitingClearance);
            }
        }
    }

    async fn begin_clearing(&mut self) {
        let Some(active) = &self.active else {
            self.set_state(MachineState::AwaitingClearance);
            return;
        };
        let job_id = active.id;
        let part_height_mm = active.part_height_mm;

        let Some(sequence) = kinematics::clearing_sequence(
            self.snapshot.automation.clearing_strategy,
            part_height_mm,
            self.snapshot.automation.thermal_release_temp,
        ) else {
            // Strategy flipped to manual during cooldown.
            self.set_state(MachineState::AwaitingClearance);
            return;
        };

        let _ = self.queue.mark_bed_clearing(job_id);
        self.set_state(MachineState::ClearingBed);

        let transport = self.transport.clone();
        let task = tokio::spawn(async move { transport.run_sequence("clear-plate", &sequence).await });
        let deadline = Instant::now() + Duration::from_secs(self.timeouts.clearing_secs);
        let mut deferred = Vec::new();
        let outcome = self
            .await_operation(
                task,
                deadline,
                |cmd| matches!(cmd, OperatorCommand::Cancel | OperatorCommand::ForceClear),
                &mut deferred,
            )
            .await;

        match outcome {
            WaitOutcome::Settled(Ok(())) => {
                tracing::info!(serial = self.snapshot.serial, job = job_id.to_string(), "plate cleared");
                self.complete_active_job();
                self.retries_used = 0;
                self.set_state(MachineState::Idle);
            }
            WaitOutcome::Settled(Err(e)) => {
                tracing::error!(
                    serial = self.snapshot.serial,
                    error = format!("{:?}", e),
                    "clearing motion failed, failing safe to manual"
                );
                self.set_state(MachineState::AwaitingClearance);
            }
            WaitOutcome::Interrupted(OperatorCommand::ForceClear) => {
                // The operator vouches for the plate; stop the motion and
                // move on.
                let _ = self.transport.stop().await;
                self.complete_active_job();
                self.retries_used = 0;
                self.set_state(MachineState::Idle);
            }
            WaitOutcome::Interrupted(_) => {
                // Canceled mid-motion: stop the device and let an operator
                // confirm the plate by hand.
                let _ = self.transport.stop().await;
                self.set_state(MachineState::AwaitingClearance);
            }
            WaitOutcome::Shutdown => return,
        }
        self.replay(deferred).await;
    }

    // -- watchdog ----------------------------------------------------------

    async fn handle_faults(&mut self, codes: &[String]) {
        let faults = hms::decode_all(codes);
        // Every fault is recorded, recovered or not.
        if let Some(worst) = hms::most_severe(&faults) {
            self.snapshot.last_fault = Some(worst.record());
        }

        let Some(worst) = hms::most_severe(&faults) else { return };
        let worst = worst.clone();

        match hms::disposition(&worst, self.snapshot.state) {
            FaultDisposition::Retry => {
                if self.retries_used < self.watchdog.retry_limit {
                    self.retries_used += 1;
                    tracing::warn!(
                        serial = self.snapshot.serial,
                        code = worst.code,
                        attempt = self.retries_used,
                        limit = self.watchdog.retry_limit,
                        "recoverable fault, retrying motion"
                    );
                    self.retry_motion().await;
                } else {
                    tracing::error!(
                        serial = self.snapshot.serial,
                        code = worst.code,
                        "retries exhausted, escalating"
                    );
                    self.fail_active_job(&format!("unrecovered fault: {}", worst.description));
                    self.set_state(MachineState::Error);
                }
            }
            FaultDisposition::Pause => {
                if self.snapshot.state == MachineState::Printing {
                    tracing::warn!(serial = self.snapshot.serial, code = worst.code, "fault suspends the print");
                    let _ = self.transport.pause().await;
                    self.set_state(MachineState::Paused);
                }
            }
            FaultDisposition::Fail => {
                tracing::error!(serial = self.snapshot.serial, code = worst.code, "fatal fault");
                self.fail_active_job(&format!("fatal fault: {}", worst.description));
                self.set_state(MachineState::Error);
            }
        }
    }

    /// Reissue the interrupted motion with raised motor current. For a
    /// clearing move that is the whole sequence again; for a print it is
    /// a resume after the firmware's own halt.
    async fn retry_motion(&mut self) {
        let result = match self.snapshot.state {
            MachineState::ClearingBed => {
                let part_height_mm = self.active.as_ref().map(|a| a.part_height_mm).unwrap_or(0.0);
                match kinematics::clearing_sequence(
                    self.snapshot.automation.clearing_strategy,
                    part_height_mm,
                    self.snapshot.automation.thermal_release_temp,
                ) {
                    Some(sequence) => {
                        let boosted = format!("{}{}", kinematics::RECOVERY_CURRENT_BOOST, sequence);
                        tokio::time::timeout(
                            Duration::from_secs(self.timeouts.clearing_secs),
                            self.transport.run_sequence("clear-plate-retry", &boosted),
                        )
                        .await
                        .map_err(|_| anyhow::anyhow!("retry timed out"))
                        .and_then(|r| r)
                    }
                    None => Err(anyhow::anyhow!("no clearing sequence for manual strategy")),
                }
            }
            _ => self.transport.resume().await,
        };

        if let Err(e) = result {
            tracing::error!(serial = self.snapshot.serial, error = format!("{:?}", e), "retry motion failed");
            self.fail_active_job("recovery motion failed");
            self.set_state(MachineState::Error);
        }
    }

    // -- connectivity ------------------------------------------------------

    fn handle_silence(&mut self) {
        self.last_report = Instant::now();
        if self.snapshot.state != MachineState::Offline {
            tracing::warn!(
                serial = self.snapshot.serial,
                silent_secs = self.timeouts.offline_secs,
                "no telemetry, marking offline"
            );
            self.set_state(MachineState::Offline);
        }
    }
}
