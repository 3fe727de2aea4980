/*
 * Collects per-run bookkeeping from the event bus and writes it as plain-text reports:
 * one directory per run, one file per category and instrument, one line per item. This is
 * the only state a run leaves behind apart from the archived files themselves.
 */
use crate::core::events::{DEFAULT_PRIORITY, Event, EventBus, Topic};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReportCategory {
    ResourcesAdded,
    ResourcesRejected,
    TargetPathExists,
    TransformAddedFiles,
    FilesCopied,
    SvnPrepared,
}

impl ReportCategory {
    pub const ALL: [ReportCategory; 6] = [
        ReportCategory::ResourcesAdded,
        ReportCategory::ResourcesRejected,
        ReportCategory::TargetPathExists,
        ReportCategory::TransformAddedFiles,
        ReportCategory::FilesCopied,
        ReportCategory::SvnPrepared,
    ];

    pub fn file_stem(&self) -> &'static str {
        match self {
            ReportCategory::ResourcesAdded => "resources_added",
            ReportCategory::ResourcesRejected => "resources_rejected",
            ReportCategory::TargetPathExists => "target_path_exists",
            ReportCategory::TransformAddedFiles => "transform_added_files",
            ReportCategory::FilesCopied => "files_copied",
            ReportCategory::SvnPrepared => "svn_prepared",
        }
    }

    fn from_event(event: &Event) -> Option<(ReportCategory, String)> {
        let item = match event {
            Event::ResourceAdded { path, .. } => {
                (ReportCategory::ResourcesAdded, path.display().to_string())
            }
            Event::ResourceRejected { path, .. } => {
                (ReportCategory::ResourcesRejected, path.display().to_string())
            }
            Event::TargetPathExists { path, .. } => {
                (ReportCategory::TargetPathExists, path.display().to_string())
            }
            Event::TransformAddFile { name, .. } => {
                (ReportCategory::TransformAddedFiles, name.clone())
            }
            Event::FileStorageCopied { target_path, .. } => {
                (ReportCategory::FilesCopied, target_path.display().to_string())
            }
            Event::SvnStoragePrepared { target_path, .. } => {
                (ReportCategory::SvnPrepared, target_path.display().to_string())
            }
            _ => return None,
        };
        Some(item)
    }
}

#[derive(Debug, Default)]
struct ReportState {
    items: BTreeMap<ReportCategory, BTreeMap<String, Vec<String>>>,
    log: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ReportCollector {
    state: Arc<Mutex<ReportState>>,
}

impl ReportCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes the collector to every topic it reports on.
    pub fn attach(&self, events: &EventBus) {
        let topics = [
            Topic::OnResourceAdded,
            Topic::OnResourceRejected,
            Topic::OnTargetPathExists,
            Topic::OnTransformAddFile,
            Topic::OnFileStorageCopied,
            Topic::OnSvnStoragePrepared,
            Topic::Log,
        ];
        for topic in topics {
            let collector = self.clone();
            events.subscribe(topic, DEFAULT_PRIORITY, move |event| collector.record(event));
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ReportState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn record(&self, event: &Event) {
        if let Event::Log { msg } = event {
            self.lock().log.push(msg.clone());
            return;
        }
        let (Some((category, item)), Some(instrument)) =
            (ReportCategory::from_event(event), event.instrument())
        else {
            return;
        };
        self.lock()
            .items
            .entry(category)
            .or_default()
            .entry(instrument.to_uppercase())
            .or_default()
            .push(item);
    }

    pub fn items(&self, category: ReportCategory, instrument: &str) -> Vec<String> {
        self.lock()
            .items
            .get(&category)
            .and_then(|per_instrument| per_instrument.get(&instrument.to_uppercase()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn count(&self, category: ReportCategory, instrument: &str) -> usize {
        self.items(category, instrument).len()
    }

    /// Item count per upper-cased instrument name.
    pub fn counts(&self, category: ReportCategory) -> BTreeMap<String, usize> {
        self.lock()
            .items
            .get(&category)
            .map(|per_instrument| {
                per_instrument
                    .iter()
                    .map(|(instrument, items)| (instrument.clone(), items.len()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn log_messages(&self) -> Vec<String> {
        self.lock().log.clone()
    }

    /// Writes the reports under `directory/<YYYYMMDD_HHMM>` and returns that directory.
    pub fn write_reports(&self, directory: &Path) -> io::Result<PathBuf> {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        let stamp = format!(
            "{:04}{:02}{:02}_{:02}{:02}",
            now.year(),
            u8::from(now.month()),
            now.day(),
            now.hour(),
            now.minute()
        );
        self.write_reports_to(&directory.join(stamp))
    }

    pub fn write_reports_to(&self, run_directory: &Path) -> io::Result<PathBuf> {
        fs::create_dir_all(run_directory)?;
        let state = self.lock();
        fs::write(run_directory.join("log.txt"), state.log.join("\n"))?;
        for (category, per_instrument) in &state.items {
            for (instrument, items) in per_instrument {
                let instrument_dir = run_directory.join(instrument);
                fs::create_dir_all(&instrument_dir)?;
                let file_name = format!("{}_{}_files.txt", category.file_stem(), items.len());
                fs::write(instrument_dir.join(file_name), items.join("\n"))?;
            }
        }
        log::info!("ReportCollector: Reports written to {run_directory:?}");
        Ok(run_directory.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_collects_per_upper_cased_instrument() {
        let bus = EventBus::new();
        let collector = ReportCollector::new();
        collector.attach(&bus);

        bus.publish(Event::ResourceAdded {
            instrument: "Ferrybox".to_string(),
            resource: "a.txt".to_string(),
            path: PathBuf::from("/src/a.txt"),
        });
        bus.publish(Event::ResourceRejected {
            instrument: "ferrybox".to_string(),
            path: PathBuf::from("/src/b.bin"),
        });
        bus.publish(Event::ResourceRejected {
            instrument: "FERRYBOX".to_string(),
            path: PathBuf::from("/src/c.bin"),
        });
        bus.publish(Event::log("Reading packages..."));
        bus.publish(Event::BeforeReadPackages);

        assert_eq!(collector.count(ReportCategory::ResourcesAdded, "ferrybox"), 1);
        assert_eq!(collector.count(ReportCategory::ResourcesRejected, "Ferrybox"), 2);
        assert_eq!(collector.count(ReportCategory::FilesCopied, "Ferrybox"), 0);
        assert_eq!(
            collector.counts(ReportCategory::ResourcesRejected).get("FERRYBOX"),
            Some(&2)
        );
        assert_eq!(collector.log_messages(), vec!["Reading packages..."]);
    }

    #[test]
    fn test_write_reports_layout() {
        let dir = tempdir().unwrap();
        let collector = ReportCollector::new();
        collector.record(&Event::TransformAddFile {
            instrument: "IFCB".to_string(),
            resource: "D20230615T120000_IFCB01.txt".to_string(),
            name: "D20230615T120000_IFCB01.txt".to_string(),
        });
        collector.record(&Event::FileStorageCopied {
            instrument: "IFCB".to_string(),
            source_path: PathBuf::from("/s/a"),
            target_path: PathBuf::from("/t/a"),
            nr_files_total: 2,
            nr_files_copied: 1,
        });
        collector.record(&Event::FileStorageCopied {
            instrument: "IFCB".to_string(),
            source_path: PathBuf::from("/s/b"),
            target_path: PathBuf::from("/t/b"),
            nr_files_total: 2,
            nr_files_copied: 2,
        });
        collector.record(&Event::log("done"));

        let run_dir = collector.write_reports(dir.path()).unwrap();
        assert!(run_dir.starts_with(dir.path()));
        let stamp = run_dir.file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(stamp.len(), "YYYYMMDD_HHMM".len());

        assert_eq!(fs::read_to_string(run_dir.join("log.txt")).unwrap(), "done");
        assert_eq!(
            fs::read_to_string(run_dir.join("IFCB/files_copied_2_files.txt")).unwrap(),
            "/t/a\n/t/b"
        );
        assert!(run_dir.join("IFCB/transform_added_files_1_files.txt").is_file());
    }
}
