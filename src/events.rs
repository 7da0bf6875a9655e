//! Non-blocking notification bus for lifecycle transitions.
//!
//! Two typed channels: a Progress channel carrying structured snapshots and
//! an Event channel carrying lifecycle events. All sends use `try_send`; if
//! no receiver is ready the message is dropped, so a slow or absent consumer
//! can never stall the scheduler.

use crate::model::{Campaign, CampaignStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Lifecycle event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    PhaseStarted,
    PhaseCompleted,
    CheckpointFailed,
    ReplanTriggered,
    ReplanFailed,
    CompressionError,
    CampaignCompleted,
    CampaignBlocked,
    ToolGenerationRequested,
    NewRequirementReceived,
    NewRequirementIntegrated,
    NewRequirementFailed,
}

/// A lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Event {
    pub fn new(event_type: EventType, message: impl Into<String>) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            phase_id: None,
            task_id: None,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_phase(mut self, phase_id: &str) -> Self {
        self.phase_id = Some(phase_id.to_string());
        self
    }

    pub fn with_task(mut self, task_id: &str) -> Self {
        self.task_id = Some(task_id.to_string());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// A structured progress snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub campaign_id: String,
    pub title: String,
    pub status: CampaignStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<String>,
    pub completed_phases: usize,
    pub total_phases: usize,
    pub completed_tasks: u32,
    pub total_tasks: u32,
    pub active_workers: Vec<String>,
    /// Estimated context utilisation in `[0, 1]`.
    pub context_utilisation: f64,
    pub learnings: usize,
    pub replans: u32,
    pub timestamp: DateTime<Utc>,
}

impl ProgressSnapshot {
    /// Build a snapshot from the campaign plus scheduler-side live state.
    pub fn of(campaign: &Campaign, active_workers: Vec<String>, context_utilisation: f64) -> Self {
        Self {
            campaign_id: campaign.id.clone(),
            title: campaign.title.clone(),
            status: campaign.status,
            current_phase: campaign.current_phase().map(|p| p.name.clone()),
            completed_phases: campaign.completed_phases(),
            total_phases: campaign.total_phases(),
            completed_tasks: campaign.completed_tasks,
            total_tasks: campaign.total_tasks,
            active_workers,
            context_utilisation,
            learnings: campaign.learnings.len(),
            replans: campaign.revision,
            timestamp: Utc::now(),
        }
    }

    /// Task completion ratio in `[0, 1]`.
    pub fn task_ratio(&self) -> f64 {
        if self.total_tasks == 0 {
            return 0.0;
        }
        f64::from(self.completed_tasks) / f64::from(self.total_tasks)
    }
}

/// The non-blocking bus. Senders are behind mutexes so `close` can drop them
/// while readers drain.
#[derive(Default)]
pub struct EventBus {
    event_tx: Mutex<Option<mpsc::Sender<Event>>>,
    progress_tx: Mutex<Option<mpsc::Sender<ProgressSnapshot>>>,
}

impl EventBus {
    /// A bus with no attached receivers; every send is dropped.
    pub fn disconnected() -> Self {
        Self::default()
    }

    /// Attach an event receiver with the given buffer size.
    pub fn attach_events(&self, buffer: usize) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        *self.event_tx.lock().expect("event bus poisoned") = Some(tx);
        rx
    }

    /// Attach a progress receiver with the given buffer size.
    pub fn attach_progress(&self, buffer: usize) -> mpsc::Receiver<ProgressSnapshot> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        *self.progress_tx.lock().expect("event bus poisoned") = Some(tx);
        rx
    }

    /// Emit an event; dropped when no receiver is ready.
    pub fn emit(&self, event: Event) {
        if let Some(tx) = self.event_tx.lock().expect("event bus poisoned").as_ref() {
            let _ = tx.try_send(event);
        }
    }

    /// Emit a progress snapshot; dropped when no receiver is ready.
    pub fn emit_progress(&self, snapshot: ProgressSnapshot) {
        if let Some(tx) = self.progress_tx.lock().expect("event bus poisoned").as_ref() {
            let _ = tx.try_send(snapshot);
        }
    }

    /// Drop both senders, closing the channels for attached receivers.
    pub fn close(&self) {
        self.event_tx.lock().expect("event bus poisoned").take();
        self.progress_tx.lock().expect("event bus poisoned").take();
    }
}
