//! Registry - グループ単位でワーカーを管理する
//!
//! # 学習ポイント
//! - グローバル状態を持たず、明示的に渡す `Registry` にまとめる
//! - ロック中に `.await` しない（JoinHandle は取り出してから待つ）

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info};

use super::builder::StepBuilder;
use super::events::{EventBus, EventKind, StepEvent};
use super::settings::Settings;
use super::step::Step;
use super::worker::{Worker, WorkerMode};
use crate::error::SetupError;

const WAIT_TICK: Duration = Duration::from_millis(100);

struct WorkerSlot {
    worker: Arc<Worker>,
    handle: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Inner {
    steps: Vec<Arc<Step>>,
    groups: BTreeMap<String, Vec<WorkerSlot>>,
}

/// One row of the job table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobRow {
    pub group: String,
    pub step: String,
    pub workers: usize,
    pub mode: String,
    pub sources: Vec<String>,
}

pub struct Registry {
    settings: Settings,
    events: EventBus,
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::with_settings(Settings::default())
    }

    pub fn with_settings(settings: Settings) -> Self {
        Self {
            settings,
            events: EventBus::default(),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Builds the step and creates (but does not start) its workers.
    ///
    /// Dedicated mode gets `workers` loops per source broker; pooled mode
    /// gets one loop per source with a pool of `workers`.
    pub fn register(&self, builder: StepBuilder) -> Result<Arc<Step>, SetupError> {
        let mut inner = self.inner.lock();
        if inner
            .steps
            .iter()
            .any(|s| s.group() == builder.group_name() && s.name() == builder.name())
        {
            return Err(SetupError::DuplicateStep {
                name: builder.name().to_string(),
                group: builder.group_name().to_string(),
            });
        }

        let step = Arc::new(builder.finish(&self.settings, self.events.clone()));
        let slots = inner.groups.entry(step.group().to_string()).or_default();
        for broker in step.sources() {
            match step.mode() {
                WorkerMode::Dedicated => {
                    for _ in 0..step.workers() {
                        let worker = Worker::new(slots.len(), Arc::clone(&step), Arc::clone(broker));
                        slots.push(WorkerSlot::idle(worker));
                    }
                }
                WorkerMode::Pooled => {
                    let worker =
                        Worker::pooled(slots.len(), Arc::clone(&step), Arc::clone(broker), step.workers());
                    slots.push(WorkerSlot::idle(worker));
                }
            }
        }
        inner.steps.push(Arc::clone(&step));

        info!(
            step = %step.name(),
            group = %step.group(),
            workers = step.workers(),
            mode = ?step.mode(),
            sources = step.sources().len(),
            "step registered"
        );
        Ok(step)
    }

    pub fn steps(&self, group: Option<&str>) -> Vec<Arc<Step>> {
        self.inner
            .lock()
            .steps
            .iter()
            .filter(|s| in_group(group, s.group()))
            .cloned()
            .collect()
    }

    /// Spawns every worker of `group` (all groups when `None`) that is not
    /// running yet. Must be called inside a Tokio runtime.
    pub fn start(&self, group: Option<&str>) -> usize {
        let mut inner = self.inner.lock();
        let mut started = 0;
        for (name, slots) in inner.groups.iter_mut().filter(|(name, _)| in_group(group, name)) {
            for slot in slots.iter_mut().filter(|slot| slot.handle.is_none()) {
                slot.handle = Some(tokio::spawn(Arc::clone(&slot.worker).run()));
                started += 1;
            }
            info!(group = %name, workers = slots.len(), "group started");
            self.events.emit(StepEvent::new(EventKind::Started).group(name));
        }
        started
    }

    /// Signals every worker of `group` to stop. Returns immediately.
    pub fn shutdown(&self, group: Option<&str>) {
        let inner = self.inner.lock();
        for (name, slots) in inner.groups.iter().filter(|(name, _)| in_group(group, name)) {
            for slot in slots {
                slot.worker.shutdown();
            }
            info!(group = %name, "group shutdown requested");
            self.events.emit(StepEvent::new(EventKind::Stopped).group(name));
        }
    }

    /// True when every worker of `group` has been told to stop (or there are none).
    pub fn is_shutdown(&self, group: Option<&str>) -> bool {
        self.inner
            .lock()
            .groups
            .iter()
            .filter(|(name, _)| in_group(group, name))
            .flat_map(|(_, slots)| slots.iter())
            .all(|slot| slot.worker.is_shutdown())
    }

    /// Waits for the spawned workers of `group` to finish.
    pub async fn join(&self, group: Option<&str>) {
        let handles: Vec<(Arc<Worker>, JoinHandle<()>)> = {
            let mut inner = self.inner.lock();
            inner
                .groups
                .iter_mut()
                .filter(|(name, _)| in_group(group, name))
                .flat_map(|(_, slots)| slots.iter_mut())
                .filter_map(|slot| slot.handle.take().map(|h| (Arc::clone(&slot.worker), h)))
                .collect()
        };

        for (worker, handle) in handles {
            if let Err(e) = handle.await {
                error!(
                    step = %worker.step().name(),
                    broker = %worker.broker().name(),
                    worker = worker.id(),
                    error = %e,
                    "worker task failed"
                );
            }
        }
    }

    /// Starts `group` and blocks until all of its brokers have shut down
    /// (`once`, `cancel_consume` or an explicit [`Registry::shutdown`]).
    pub async fn wait(&self, group: Option<&str>) {
        self.start(group);
        let tick = self.settings.poll_interval().min(WAIT_TICK);
        while !self.is_shutdown(group) {
            sleep(tick).await;
        }
        self.join(group).await;
    }

    pub fn jobs(&self, group: Option<&str>) -> Vec<JobRow> {
        self.steps(group)
            .iter()
            .map(|step| JobRow {
                group: step.group().to_string(),
                step: step.name().to_string(),
                workers: step.workers(),
                mode: format!("{:?}", step.mode()).to_lowercase(),
                sources: step.sources().iter().map(|b| b.name().to_string()).collect(),
            })
            .collect()
    }

    /// Job table as aligned text.
    pub fn render_jobs(&self, group: Option<&str>) -> String {
        let rows: Vec<[String; 5]> = self
            .jobs(group)
            .into_iter()
            .map(|job| {
                [
                    job.group,
                    job.step,
                    job.workers.to_string(),
                    job.mode,
                    job.sources.join(", "),
                ]
            })
            .collect();

        let header = ["GROUP", "STEP", "WORKERS", "MODE", "SOURCES"];
        let mut widths = header.map(str::len);
        for row in &rows {
            for (width, cell) in widths.iter_mut().zip(row) {
                *width = (*width).max(cell.len());
            }
        }

        let mut out = String::new();
        push_row(&mut out, &header, &widths);
        for row in &rows {
            push_row(&mut out, row, &widths);
        }
        out
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerSlot {
    fn idle(worker: Worker) -> Self {
        Self {
            worker: Arc::new(worker),
            handle: None,
        }
    }
}

fn in_group(filter: Option<&str>, group: &str) -> bool {
    filter.is_none_or(|g| g == group)
}

fn push_row<S: AsRef<str>>(out: &mut String, cells: &[S], widths: &[usize]) {
    let line = cells
        .iter()
        .zip(widths)
        .map(|(cell, width)| format!("{:<width$}", cell.as_ref(), width = *width))
        .collect::<Vec<_>>()
        .join("  ");
    let _ = writeln!(out, "{}", line.trim_end());
}
