/*
 * Version-control backend. The remote tree is modelled as the set of already versioned
 * paths, fetched once per write with a recursive listing. Every new file of a package is
 * scheduled into one `svnmucc` batch (`mkdir` for missing ancestors, then `put`) which is
 * committed atomically. A batch with nothing in it is never committed.
 *
 * Unlike the filesystem backend there is no partial success once the commit runs: a
 * non-zero exit from the tool is returned as `StorageError::Subversion` and aborts the
 * instrument's write phase.
 */
use crate::core::events::{Event, EventBus};
use crate::core::package::Package;
use crate::core::path_guard;
use crate::core::storage::{Result, Storage, StorageError, WriteReport};
use regex::Regex;
use std::collections::BTreeSet;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;

pub const COMMIT_MESSAGE_ATTRIBUTE: &str = "svn_commit_message";

/*
 * The two operations the backend needs from Subversion. Kept behind a trait so the
 * scheduling logic can be tested without a repository.
 */
pub trait SubversionClientOperations: Send + Sync {
    fn root_url(&self) -> &str;

    /// Every versioned file and directory below the root, as POSIX paths relative to it.
    fn list_versioned_paths(&self) -> Result<BTreeSet<String>>;

    /// Runs one `svnmucc` batch as a single commit.
    fn run_multi_command(&self, arguments: &[String], message: &str) -> Result<()>;
}

pub struct CoreSubversionClient {
    root_url: String,
    username: Option<String>,
    password: Option<String>,
    svn_exec: PathBuf,
    svnmucc_exec: PathBuf,
}

impl CoreSubversionClient {
    pub fn new(root_url: &str, username: Option<String>, password: Option<String>) -> Result<Self> {
        let svn_exec = which::which("svn")
            .map_err(|_| StorageError::MissingExecutable("svn".to_string()))?;
        let svnmucc_exec = which::which("svnmucc")
            .map_err(|_| StorageError::MissingExecutable("svnmucc".to_string()))?;
        log::debug!("CoreSubversionClient: Using {svn_exec:?} and {svnmucc_exec:?}.");
        Ok(CoreSubversionClient {
            root_url: root_url.to_string(),
            username,
            password,
            svn_exec,
            svnmucc_exec,
        })
    }

    fn command(&self, executable: &Path, args: &[&str]) -> (Command, String) {
        let mut command = Command::new(executable);
        command.arg("--non-interactive");
        let mut display = vec![executable.display().to_string(), "--non-interactive".to_string()];
        if let Some(username) = &self.username {
            command.args(["--username", username.as_str()]);
            display.extend(["--username".to_string(), username.clone()]);
        }
        if let Some(password) = &self.password {
            command.args(["--password", password.as_str()]);
            display.extend(["--password".to_string(), "***".to_string()]);
        }
        command.args(args);
        display.extend(args.iter().map(|a| a.to_string()));
        (command, display.join(" "))
    }
}

/*
 * Runs `command` to completion and returns its trimmed stdout. `input` is fed to stdin
 * from a separate thread while this one drains stdout and stderr, so a child that writes
 * output before it has read all of its input cannot block on a full pipe.
 */
fn run_command(mut command: Command, display: &str, input: Option<String>) -> Result<String> {
    log::debug!("CoreSubversionClient: Running {display}");
    command
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = command.spawn()?;
    let writer = match (input, child.stdin.take()) {
        (Some(input), Some(mut stdin)) => {
            Some(thread::spawn(move || stdin.write_all(input.as_bytes())))
        }
        _ => None,
    };
    let output = child.wait_with_output()?;
    let written = match writer.map(|handle| handle.join()) {
        Some(Ok(result)) => result,
        Some(Err(_)) => Err(io::Error::other("stdin writer thread panicked")),
        None => Ok(()),
    };
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        log::error!("CoreSubversionClient: {display} failed: {stderr}");
        return Err(StorageError::Subversion {
            command: display.to_string(),
            exit_code: output.status.code(),
            stderr,
        });
    }
    written?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

impl SubversionClientOperations for CoreSubversionClient {
    fn root_url(&self) -> &str {
        &self.root_url
    }

    fn list_versioned_paths(&self) -> Result<BTreeSet<String>> {
        let (command, display) = self.command(
            &self.svn_exec,
            &["list", "--depth", "infinity", "--xml", self.root_url.as_str()],
        );
        let xml = run_command(command, &display, None)?;
        parse_list_xml(&xml)
    }

    fn run_multi_command(&self, arguments: &[String], message: &str) -> Result<()> {
        let (command, display) = self.command(
            &self.svnmucc_exec,
            &["-U", self.root_url.as_str(), "-m", message, "-X", "-"],
        );
        run_command(command, &display, Some(arguments.join("\n")))?;
        Ok(())
    }
}

/*
 * Extracts the entry names of `svn list --xml` output. Names are XML-escaped text, and
 * directory entries appear without a trailing slash.
 */
pub fn parse_list_xml(xml: &str) -> Result<BTreeSet<String>> {
    if !xml.trim().is_empty() && !xml.contains("<lists") {
        return Err(StorageError::InvalidListing(
            "output is not an svn list document".to_string(),
        ));
    }
    let name = Regex::new(r"<name>([^<]*)</name>")
        .map_err(|e| StorageError::InvalidListing(e.to_string()))?;
    Ok(name
        .captures_iter(xml)
        .map(|c| unescape_xml(&c[1]))
        .collect())
}

fn unescape_xml(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

pub struct SubversionStorage {
    client: Box<dyn SubversionClientOperations>,
    events: Arc<EventBus>,
}

impl SubversionStorage {
    pub fn new(client: Box<dyn SubversionClientOperations>, events: Arc<EventBus>) -> Self {
        SubversionStorage { client, events }
    }

    fn commit_message(package: &Package, nr_files: usize) -> String {
        let messages: BTreeSet<&str> = package
            .resources()
            .iter()
            .filter_map(|r| r.attributes.get(COMMIT_MESSAGE_ATTRIBUTE))
            .filter(|m| !m.trim().is_empty())
            .collect();
        let base = format!("Add {nr_files} files for package {package}");
        if messages.is_empty() {
            base
        } else {
            let joined: Vec<&str> = messages.into_iter().collect();
            format!("{base}: {}", joined.join("; "))
        }
    }
}

impl Storage for SubversionStorage {
    fn description(&self) -> String {
        format!("subversion storage at {}", self.client.root_url())
    }

    fn write(&self, package: &Package, force: bool) -> Result<WriteReport> {
        let instrument = package.instrument();
        let existing = self.client.list_versioned_paths()?;
        let mut report = WriteReport::default();

        let nr_resources = package.resources().len();
        let mut files_to_add: Vec<(PathBuf, String)> = Vec::new();
        let mut claimed: BTreeSet<String> = BTreeSet::new();
        for (nr, resource) in package.resources().iter().enumerate() {
            let source = resource.absolute_source_path();
            let Some(target) = resource.target_path() else {
                log::info!(
                    "SubversionStorage: Will not write file. No target path given for {source:?}"
                );
                self.events.publish(Event::TargetPathNotGiven {
                    instrument: instrument.to_string(),
                    path: source.clone(),
                });
                report.skipped_no_target.push(source);
                continue;
            };
            let relative = path_guard::to_posix_string(target);
            self.events.publish(Event::progress(
                instrument,
                "Checking file existence in SVN",
                nr + 1,
                nr_resources,
            ));

            if claimed.contains(&relative) || (!force && existing.contains(&relative)) {
                log::warn!(
                    "SubversionStorage: Will not write file. Target {relative} already exists."
                );
                self.events.publish(Event::TargetPathExists {
                    instrument: instrument.to_string(),
                    path: PathBuf::from(&relative),
                });
                report.skipped_existing.push(PathBuf::from(&relative));
                continue;
            }
            claimed.insert(relative.clone());
            files_to_add.push((source, relative));
        }

        let mut arguments: Vec<String> = Vec::new();
        let mut scheduled: BTreeSet<String> = BTreeSet::new();
        let nr_files = files_to_add.len();
        for (nr, (source, target)) in files_to_add.into_iter().enumerate() {
            let parts: Vec<&str> = target.split('/').collect();
            let mut ancestor = String::new();
            for part in &parts[..parts.len().saturating_sub(1)] {
                if !ancestor.is_empty() {
                    ancestor.push('/');
                }
                ancestor.push_str(part);
                if !existing.contains(&ancestor) && !scheduled.contains(&ancestor) {
                    arguments.extend(["mkdir".to_string(), ancestor.clone()]);
                    scheduled.insert(ancestor.clone());
                }
            }
            arguments.extend([
                "put".to_string(),
                source.to_string_lossy().into_owned(),
                target.clone(),
            ]);
            scheduled.insert(target.clone());
            self.events.publish(Event::SvnStoragePrepared {
                instrument: instrument.to_string(),
                source_path: source,
                target_path: PathBuf::from(&target),
                nr_files_total: nr_files,
                nr_files_copied: nr + 1,
            });
            report.written.push(PathBuf::from(target));
        }

        if arguments.is_empty() {
            log::info!("SubversionStorage: No files prepared for package {package}, no commit.");
            return Ok(report);
        }

        let message = Self::commit_message(package, nr_files);
        self.events
            .publish(Event::progress(instrument, "Starting commit to SVN", 20, 100));
        self.client.run_multi_command(&arguments, &message)?;
        self.events.publish(Event::progress(
            instrument,
            format!("Commit to SVN finished with comment: {message}"),
            100,
            100,
        ));
        log::info!("SubversionStorage: Committed '{message}'.");
        report.committed = true;
        Ok(report)
    }

    fn delete(&self, package: &Package) -> Result<Vec<PathBuf>> {
        let existing = self.client.list_versioned_paths()?;
        let mut arguments = Vec::new();
        let mut removals = Vec::new();
        for resource in package.resources() {
            let Some(target) = resource.target_path() else {
                continue;
            };
            let relative = path_guard::to_posix_string(target);
            if existing.contains(&relative) {
                arguments.extend(["rm".to_string(), relative.clone()]);
                removals.push(PathBuf::from(relative));
            }
        }
        if arguments.is_empty() {
            log::info!("SubversionStorage: Nothing to remove for package {package}.");
            return Ok(removals);
        }
        self.client
            .run_multi_command(&arguments, &format!("Remove files for package {package}"))?;
        Ok(removals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::resource::{Attributes, Resource, ResourceKind};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockClient {
        versioned: BTreeSet<String>,
        commits: Mutex<Vec<(Vec<String>, String)>>,
        fail_with: Option<i32>,
    }

    impl SubversionClientOperations for Arc<MockClient> {
        fn root_url(&self) -> &str {
            "svn://example/repo"
        }

        fn list_versioned_paths(&self) -> Result<BTreeSet<String>> {
            Ok(self.versioned.clone())
        }

        fn run_multi_command(&self, arguments: &[String], message: &str) -> Result<()> {
            if let Some(code) = self.fail_with {
                return Err(StorageError::Subversion {
                    command: "svnmucc".to_string(),
                    exit_code: Some(code),
                    stderr: "E160020: path already exists".to_string(),
                });
            }
            self.commits
                .lock()
                .unwrap()
                .push((arguments.to_vec(), message.to_string()));
            Ok(())
        }
    }

    fn resource(name: &str, target: &str, message: Option<&str>) -> Resource {
        let mut attributes = Attributes::new();
        if let Some(m) = message {
            attributes.set(COMMIT_MESSAGE_ATTRIBUTE, m);
        }
        let mut r = Resource::new(
            Arc::from(Path::new("/src")),
            name,
            ResourceKind::Raw,
            attributes,
        )
        .unwrap();
        r.set_target_path(target).unwrap();
        r
    }

    fn package(resources: Vec<Resource>) -> Package {
        let mut p = Package::new("CTD_0745", "CTD").unwrap();
        for r in resources {
            p.add_resource(r).unwrap();
        }
        p
    }

    fn storage(client: &Arc<MockClient>) -> SubversionStorage {
        SubversionStorage::new(Box::new(Arc::clone(client)), Arc::new(EventBus::new()))
    }

    #[test]
    fn test_batch_schedules_missing_ancestors_once() {
        let client = Arc::new(MockClient {
            versioned: ["2022".to_string()].into_iter().collect(),
            ..MockClient::default()
        });
        let package = package(vec![
            resource("a.hex", "2022/raw/A.hex", None),
            resource("a.cnv", "2022/cnv/upcast/A.cnv", None),
            resource("b.hex", "2022/raw/B.hex", None),
        ]);

        let report = storage(&client).write(&package, false).unwrap();
        assert!(report.committed);
        assert_eq!(report.written.len(), 3);

        let commits = client.commits.lock().unwrap();
        assert_eq!(commits.len(), 1);
        let (args, message) = &commits[0];
        assert_eq!(
            args,
            &vec![
                "mkdir", "2022/raw",
                "put", "/src/a.hex", "2022/raw/A.hex",
                "mkdir", "2022/cnv",
                "mkdir", "2022/cnv/upcast",
                "put", "/src/a.cnv", "2022/cnv/upcast/A.cnv",
                "put", "/src/b.hex", "2022/raw/B.hex",
            ]
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>()
        );
        assert_eq!(message, "Add 3 files for package CTD_0745");
    }

    #[test]
    fn test_no_commit_when_everything_is_versioned() {
        let client = Arc::new(MockClient {
            versioned: ["x", "x/a.txt", "x/b.txt"]
                .into_iter()
                .map(String::from)
                .collect(),
            ..MockClient::default()
        });
        let package = package(vec![
            resource("a.txt", "x/a.txt", None),
            resource("b.txt", "x/b.txt", None),
        ]);

        let report = storage(&client).write(&package, false).unwrap();
        assert!(!report.committed);
        assert!(report.nothing_written());
        assert_eq!(report.skipped_existing.len(), 2);
        assert!(client.commits.lock().unwrap().is_empty());
    }

    #[test]
    fn test_commit_message_includes_deduplicated_custom_messages() {
        let client = Arc::new(MockClient::default());
        let package = package(vec![
            resource("a.txt", "a.txt", Some("new cast")),
            resource("b.txt", "b.txt", Some("calibrated")),
            resource("c.txt", "c.txt", Some("new cast")),
        ]);
        storage(&client).write(&package, false).unwrap();
        let commits = client.commits.lock().unwrap();
        assert_eq!(
            commits[0].1,
            "Add 3 files for package CTD_0745: calibrated; new cast"
        );
    }

    #[test]
    fn test_tool_failure_propagates() {
        let client = Arc::new(MockClient {
            fail_with: Some(1),
            ..MockClient::default()
        });
        let package = package(vec![resource("a.txt", "a.txt", None)]);
        let result = storage(&client).write(&package, false);
        match result {
            Err(StorageError::Subversion { exit_code, stderr, .. }) => {
                assert_eq!(exit_code, Some(1));
                assert!(stderr.contains("E160020"));
            }
            other => panic!("Expected subversion error, got {other:?}"),
        }
    }

    #[test]
    fn test_delete_only_removes_versioned_paths() {
        let client = Arc::new(MockClient {
            versioned: ["a.txt".to_string()].into_iter().collect(),
            ..MockClient::default()
        });
        let package = package(vec![
            resource("a.txt", "a.txt", None),
            resource("b.txt", "b.txt", None),
        ]);
        let removed = storage(&client).delete(&package).unwrap();
        assert_eq!(removed, vec![PathBuf::from("a.txt")]);
        let commits = client.commits.lock().unwrap();
        assert_eq!(commits[0].0, vec!["rm".to_string(), "a.txt".to_string()]);
        assert_eq!(commits[0].1, "Remove files for package CTD_0745");
    }

    #[test]
    fn test_delete_without_versioned_paths_skips_commit() {
        let client = Arc::new(MockClient::default());
        let package = package(vec![resource("a.txt", "a.txt", None)]);
        assert!(storage(&client).delete(&package).unwrap().is_empty());
        assert!(client.commits.lock().unwrap().is_empty());
    }

    #[test]
    fn test_parse_list_xml() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<lists>
<list path="svn://example/repo">
<entry kind="dir"><name>2022</name><commit revision="3"><author>x</author></commit></entry>
<entry kind="file"><name>2022/a &amp; b.txt</name><size>4</size></entry>
</list>
</lists>"#;
        let paths = parse_list_xml(xml).unwrap();
        assert!(paths.contains("2022"));
        assert!(paths.contains("2022/a & b.txt"));
        assert_eq!(paths.len(), 2);
        assert!(matches!(
            parse_list_xml("svn: E170000: oops"),
            Err(StorageError::InvalidListing(_))
        ));
        assert!(parse_list_xml("").unwrap().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_run_command_streams_large_input_through_echoing_child() {
        // Far larger than a pipe buffer; `cat` writes output before it has read everything.
        let input = "put a b\n".repeat(200_000);
        let output = run_command(Command::new("cat"), "cat", Some(input.clone())).unwrap();
        assert_eq!(output.len(), input.trim().len());
    }

    #[cfg(unix)]
    #[test]
    fn test_run_command_reports_exit_code_and_stderr() {
        let mut command = Command::new("sh");
        command.args(["-c", "echo refused >&2; exit 3"]);
        let result = run_command(command, "sh", Some("ignored".to_string()));
        match result {
            Err(StorageError::Subversion {
                exit_code, stderr, ..
            }) => {
                assert_eq!(exit_code, Some(3));
                assert_eq!(stderr, "refused");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
