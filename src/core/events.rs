/*
 * The event bus connects the archiving engine with its observers (front ends, the report
 * collector, loggers). Topics form a closed set declared up front; publishing is a
 * synchronous fan-out to every subscriber of the event's topic in ascending priority,
 * and in subscription order within one priority.
 *
 * A single `EventBus` is created by whoever drives a run and shared (via `Arc`) with every
 * instrument and storage backend, instead of living in process-wide state.
 */
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

pub const DEFAULT_PRIORITY: i32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    OnResourceAdded,
    OnResourceRejected,
    OnTargetPathExists,
    OnTargetPathNotGiven,
    OnFileStorageCopied,
    OnSvnStoragePrepared,
    OnTransformAddFile,
    OnProgress,
    OnStopWrite,
    BeforeReadPackages,
    AfterReadPackages,
    BeforeTransformPackages,
    AfterTransformPackages,
    BeforeWritePackages,
    AfterWritePackages,
    Log,
}

impl Topic {
    pub const ALL: [Topic; 16] = [
        Topic::OnResourceAdded,
        Topic::OnResourceRejected,
        Topic::OnTargetPathExists,
        Topic::OnTargetPathNotGiven,
        Topic::OnFileStorageCopied,
        Topic::OnSvnStoragePrepared,
        Topic::OnTransformAddFile,
        Topic::OnProgress,
        Topic::OnStopWrite,
        Topic::BeforeReadPackages,
        Topic::AfterReadPackages,
        Topic::BeforeTransformPackages,
        Topic::AfterTransformPackages,
        Topic::BeforeWritePackages,
        Topic::AfterWritePackages,
        Topic::Log,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::OnResourceAdded => "on_resource_added",
            Topic::OnResourceRejected => "on_resource_rejected",
            Topic::OnTargetPathExists => "on_target_path_exists",
            Topic::OnTargetPathNotGiven => "on_target_path_not_given",
            Topic::OnFileStorageCopied => "on_file_storage_copied",
            Topic::OnSvnStoragePrepared => "on_svn_storage_prepared",
            Topic::OnTransformAddFile => "on_transform_add_file",
            Topic::OnProgress => "on_progress",
            Topic::OnStopWrite => "on_stop_write",
            Topic::BeforeReadPackages => "before_read_packages",
            Topic::AfterReadPackages => "after_read_packages",
            Topic::BeforeTransformPackages => "before_transform_packages",
            Topic::AfterTransformPackages => "after_transform_packages",
            Topic::BeforeWritePackages => "before_write_packages",
            Topic::AfterWritePackages => "after_write_packages",
            Topic::Log => "log",
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = EventError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Topic::ALL
            .iter()
            .copied()
            .find(|topic| topic.as_str() == name)
            .ok_or_else(|| EventError::UnknownTopic(name.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    UnknownTopic(String),
}

impl std::fmt::Display for EventError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventError::UnknownTopic(name) => write!(f, "Unknown event topic: {name}"),
        }
    }
}

impl std::error::Error for EventError {}

/*
 * Payload of a published event. The variant decides the topic, so a payload can never be
 * delivered on the wrong channel.
 */
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    ResourceAdded {
        instrument: String,
        resource: String,
        path: PathBuf,
    },
    ResourceRejected {
        instrument: String,
        path: PathBuf,
    },
    TargetPathExists {
        instrument: String,
        path: PathBuf,
    },
    TargetPathNotGiven {
        instrument: String,
        path: PathBuf,
    },
    FileStorageCopied {
        instrument: String,
        source_path: PathBuf,
        target_path: PathBuf,
        nr_files_total: usize,
        nr_files_copied: usize,
    },
    SvnStoragePrepared {
        instrument: String,
        source_path: PathBuf,
        target_path: PathBuf,
        nr_files_total: usize,
        nr_files_copied: usize,
    },
    TransformAddFile {
        instrument: String,
        resource: String,
        name: String,
    },
    Progress {
        instrument: String,
        msg: String,
        percentage: u8,
    },
    StopWrite {
        instrument: String,
    },
    BeforeReadPackages,
    AfterReadPackages,
    BeforeTransformPackages,
    AfterTransformPackages,
    BeforeWritePackages,
    AfterWritePackages,
    Log {
        msg: String,
    },
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Event::ResourceAdded { .. } => Topic::OnResourceAdded,
            Event::ResourceRejected { .. } => Topic::OnResourceRejected,
            Event::TargetPathExists { .. } => Topic::OnTargetPathExists,
            Event::TargetPathNotGiven { .. } => Topic::OnTargetPathNotGiven,
            Event::FileStorageCopied { .. } => Topic::OnFileStorageCopied,
            Event::SvnStoragePrepared { .. } => Topic::OnSvnStoragePrepared,
            Event::TransformAddFile { .. } => Topic::OnTransformAddFile,
            Event::Progress { .. } => Topic::OnProgress,
            Event::StopWrite { .. } => Topic::OnStopWrite,
            Event::BeforeReadPackages => Topic::BeforeReadPackages,
            Event::AfterReadPackages => Topic::AfterReadPackages,
            Event::BeforeTransformPackages => Topic::BeforeTransformPackages,
            Event::AfterTransformPackages => Topic::AfterTransformPackages,
            Event::BeforeWritePackages => Topic::BeforeWritePackages,
            Event::AfterWritePackages => Topic::AfterWritePackages,
            Event::Log { .. } => Topic::Log,
        }
    }

    /// Instrument name carried by the payload, if the topic has one.
    pub fn instrument(&self) -> Option<&str> {
        match self {
            Event::ResourceAdded { instrument, .. }
            | Event::ResourceRejected { instrument, .. }
            | Event::TargetPathExists { instrument, .. }
            | Event::TargetPathNotGiven { instrument, .. }
            | Event::FileStorageCopied { instrument, .. }
            | Event::SvnStoragePrepared { instrument, .. }
            | Event::TransformAddFile { instrument, .. }
            | Event::Progress { instrument, .. }
            | Event::StopWrite { instrument } => Some(instrument),
            _ => None,
        }
    }

    pub fn log(msg: impl Into<String>) -> Self {
        Event::Log { msg: msg.into() }
    }

    pub fn progress(instrument: &str, msg: impl Into<String>, done: usize, total: usize) -> Self {
        Event::Progress {
            instrument: instrument.to_string(),
            msg: msg.into(),
            percentage: percentage(done, total),
        }
    }
}

/// Integer percentage of `done` out of `total`, clamped to 0..=100.
pub fn percentage(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done.min(total) * 100) / total) as u8
}

pub type Subscriber = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<HashMap<Topic, BTreeMap<i32, Vec<Subscriber>>>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: BTreeMap<&'static str, usize> = match self.subscribers.lock() {
            Ok(table) => table
                .iter()
                .map(|(topic, tiers)| (topic.as_str(), tiers.values().map(Vec::len).sum()))
                .collect(),
            Err(_) => BTreeMap::new(),
        };
        f.debug_struct("EventBus").field("subscribers", &counts).finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn topics() -> &'static [Topic] {
        &Topic::ALL
    }

    pub fn subscribe<F>(&self, topic: Topic, priority: i32, callback: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let mut table = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        table
            .entry(topic)
            .or_default()
            .entry(priority)
            .or_default()
            .push(Arc::new(callback));
        log::trace!("EventBus: Subscribed to '{topic}' with priority {priority}.");
    }

    /*
     * Subscribes by topic name, for collaborators that are configured with strings. Names
     * outside the declared topic set are rejected.
     */
    pub fn subscribe_named<F>(
        &self,
        name: &str,
        priority: i32,
        callback: F,
    ) -> Result<(), EventError>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let topic = Topic::from_str(name)?;
        self.subscribe(topic, priority, callback);
        Ok(())
    }

    /*
     * Delivers `event` to every subscriber of its topic. The subscriber list is snapshotted
     * before dispatch so that callbacks may themselves publish or subscribe.
     */
    pub fn publish(&self, event: Event) {
        let topic = event.topic();
        let callbacks: Vec<Subscriber> = {
            let table = match self.subscribers.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            match table.get(&topic) {
                Some(tiers) => tiers.values().flatten().cloned().collect(),
                None => Vec::new(),
            }
        };
        for callback in callbacks {
            callback(&event);
        }
    }
}
