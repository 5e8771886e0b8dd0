//! Exporter sinks: observers for events, tensors, and schedule bundles.
//!
//! Exporters never influence scheduling; they are write-only taps resolved
//! from the context at construction. The built-ins are `empty` (discard) and
//! `json` (serialize through an export method: stderr-style trace or a file).
//! `dylib://` plugin exporters are a separate collaborator and reported as
//! unsupported here.

use crate::{ExecutionEvent, MemoryEvent, ScheduleEvents};
use core_config::{ContextError, ContextView};
use core_status::MemoryStatus;
use serde_json::json;
use std::fs::File;
use std::io::Write;
use std::sync::{Mutex, PoisonError};
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error("dynamic library exporter unsupported: {0}")]
    DynamicLibrary(String),
    #[error("export sink: {0}")]
    Io(String),
}

/// Where serialized messages go.
pub enum ExportMethod {
    /// Discard.
    Empty,
    /// Append lines to a file.
    File(Mutex<File>),
}

impl ExportMethod {
    /// Resolve from an exporter's context view (`method`, `method.filename`).
    pub fn from_view(view: &ContextView) -> Result<Self, ExportError> {
        match view.at("method")? {
            "empty" => Ok(ExportMethod::Empty),
            "file" => {
                let filename = view.view("method").at("filename")?;
                let file = File::create(filename)
                    .map_err(|e| ExportError::Io(format!("{filename}: {e}")))?;
                Ok(ExportMethod::File(Mutex::new(file)))
            }
            other => Err(ExportError::Context(ContextError::Invalid(format!(
                "export method {other}"
            )))),
        }
    }

    pub fn export_message(&self, message: &str) {
        match self {
            ExportMethod::Empty => {}
            ExportMethod::File(file) => {
                let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
                if let Err(error) = writeln!(file, "{message}") {
                    warn!(target: "events.export", %error, "export write failed");
                }
            }
        }
    }
}

pub trait EventsExporter: Send + Sync {
    fn on_memory_event(&self, _event: &MemoryEvent) {}
    fn on_execution_event(&self, _event: &ExecutionEvent) {}
}

pub trait TensorsExporter: Send + Sync {
    fn on_tensors(&self, _status: &MemoryStatus) {}
}

pub trait ScheduleExporter: Send + Sync {
    fn on_schedule_events(&self, _events: &ScheduleEvents) {}
}

/// Discarding defaults.
pub struct EmptyEventsExporter;
impl EventsExporter for EmptyEventsExporter {}

pub struct EmptyTensorsExporter;
impl TensorsExporter for EmptyTensorsExporter {}

pub struct EmptyScheduleExporter;
impl ScheduleExporter for EmptyScheduleExporter {}

pub struct JsonEventsExporter {
    method: ExportMethod,
}

impl EventsExporter for JsonEventsExporter {
    fn on_memory_event(&self, event: &MemoryEvent) {
        self.method.export_message(&json!(event).to_string());
    }

    fn on_execution_event(&self, event: &ExecutionEvent) {
        self.method.export_message(&json!(event).to_string());
    }
}

pub struct JsonTensorsExporter {
    method: ExportMethod,
}

impl TensorsExporter for JsonTensorsExporter {
    fn on_tensors(&self, status: &MemoryStatus) {
        let tensors: Vec<_> = status
            .tensor_names()
            .into_iter()
            .filter_map(|name| status.snapshot_tensor(&name).ok())
            .map(|tensor| {
                json!({
                    "name": tensor.name(),
                    "size": tensor.size(),
                    "type": tensor.kind().as_str(),
                    "persistent": tensor.is_persistent(),
                    "transient": tensor.is_transient(),
                })
            })
            .collect();
        let operators: Vec<_> = status
            .execution_order()
            .into_iter()
            .filter_map(|name| status.snapshot_operator(&name).ok())
            .map(|op| {
                json!({
                    "name": op.name(),
                    "tensors": op.tensors(),
                    "prevs": op.prevs(),
                    "posts": op.posts(),
                    "backward_propagation": op.is_backward_propagation(),
                })
            })
            .collect();
        let obj = json!({
            "tensors": tensors,
            "operators": operators,
            "entry": status.entry(),
        });
        self.method.export_message(&obj.to_string());
    }
}

pub struct JsonScheduleExporter {
    method: ExportMethod,
}

impl ScheduleExporter for JsonScheduleExporter {
    fn on_schedule_events(&self, events: &ScheduleEvents) {
        let obj = json!({
            "memory_map": {
                "regions": events.memory_map.regions_sorted(),
                "layers": events.memory_map.layers(),
            },
            "forward_schedule_events": {
                "execution": events.forward.execution,
                "timepoint": events.forward.timepoint,
            },
            "backward_schedule_events": {
                "execution": events.backward.execution,
                "timepoint": events.backward.timepoint,
            },
        });
        self.method.export_message(&serde_json::to_string_pretty(&obj).unwrap_or_default());
    }
}

fn resolve<T>(
    view: &ContextView,
    empty: impl FnOnce() -> T,
    jsonish: impl FnOnce(ExportMethod) -> T,
) -> Result<T, ExportError> {
    match view.value()? {
        "empty" => Ok(empty()),
        "json" => Ok(jsonish(ExportMethod::from_view(view)?)),
        other if other.starts_with("dylib://") => {
            Err(ExportError::DynamicLibrary(other.to_string()))
        }
        other => Err(ExportError::Context(ContextError::Invalid(format!(
            "exporter {other}"
        )))),
    }
}

pub fn make_events_exporter(
    view: &ContextView,
) -> Result<Box<dyn EventsExporter>, ExportError> {
    resolve(
        view,
        || Box::new(EmptyEventsExporter) as Box<dyn EventsExporter>,
        |method| Box::new(JsonEventsExporter { method }),
    )
}

pub fn make_tensors_exporter(
    view: &ContextView,
) -> Result<Box<dyn TensorsExporter>, ExportError> {
    resolve(
        view,
        || Box::new(EmptyTensorsExporter) as Box<dyn TensorsExporter>,
        |method| Box::new(JsonTensorsExporter { method }),
    )
}

pub fn make_schedule_exporter(
    view: &ContextView,
) -> Result<Box<dyn ScheduleExporter>, ExportError> {
    resolve(
        view,
        || Box::new(EmptyScheduleExporter) as Box<dyn ScheduleExporter>,
        |method| Box::new(JsonScheduleExporter { method }),
    )
}
