// SPDX-License-Identifier: GPL-3.0-only

//! Filesystem recognition
//!
//! The sequencer walks an ordered list of candidates and asks each matching
//! plugin to recognize the volume. The first success wins.

use std::sync::Arc;

use arbiter_contracts::FilesystemPlugin;
use arbiter_types::{ArbiterError, DiskDescription, ErrorKind, ProbeOutcome};

/// Device properties a candidate requires before it is tried.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaMatcher {
    properties: Vec<(String, String)>,
}

impl MediaMatcher {
    /// Matches every device.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.push((key.into(), value.into()));
        self
    }

    pub fn matches(&self, description: &DiskDescription) -> bool {
        self.properties
            .iter()
            .all(|(key, value)| description.property(key).as_deref() == Some(value.as_str()))
    }
}

#[derive(Clone)]
pub struct ProbeCandidate {
    pub kind: String,
    /// Lower values are tried first
    pub priority: u32,
    pub matcher: MediaMatcher,
    pub suppress_automount: bool,
    pub plugin: Arc<dyn FilesystemPlugin>,
}

impl ProbeCandidate {
    pub fn new(plugin: Arc<dyn FilesystemPlugin>, priority: u32) -> Self {
        Self {
            kind: plugin.kind().to_string(),
            priority,
            matcher: MediaMatcher::any(),
            suppress_automount: false,
            plugin,
        }
    }

    pub fn with_matcher(mut self, matcher: MediaMatcher) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn suppressing_automount(mut self) -> Self {
        self.suppress_automount = true;
        self
    }
}

#[derive(Clone)]
pub enum ProbeVerdict {
    Recognized {
        plugin: Arc<dyn FilesystemPlugin>,
        outcome: ProbeOutcome,
    },
    /// No candidate knows the format
    Unrecognized,
    /// A candidate could not read the device
    Failed(ArbiterError),
}

impl ProbeVerdict {
    pub fn kind(&self) -> Option<&str> {
        match self {
            Self::Recognized { outcome, .. } => Some(&outcome.kind),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct ProbeReport {
    pub verdict: ProbeVerdict,
    pub suppress_automount: bool,
}

/// Ordered filesystem candidates. Cheap to clone onto worker threads.
#[derive(Clone, Default)]
pub struct ProbeSequencer {
    candidates: Arc<Vec<ProbeCandidate>>,
}

impl ProbeSequencer {
    pub fn new(mut candidates: Vec<ProbeCandidate>) -> Self {
        // Stable sort keeps registration order between equal priorities
        candidates.sort_by_key(|candidate| candidate.priority);
        Self {
            candidates: Arc::new(candidates),
        }
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Plugin able to mount volumes of `kind`.
    pub fn plugin_for(&self, kind: &str) -> Option<Arc<dyn FilesystemPlugin>> {
        self.candidates
            .iter()
            .find(|candidate| candidate.kind == kind)
            .map(|candidate| Arc::clone(&candidate.plugin))
    }

    /// Recognize the volume on `description`. Blocks; run on a worker.
    pub fn probe(&self, description: &DiskDescription) -> ProbeReport {
        if description.media_size == 0 {
            return ProbeReport {
                verdict: ProbeVerdict::Unrecognized,
                suppress_automount: false,
            };
        }

        let matching: Vec<&ProbeCandidate> = self
            .candidates
            .iter()
            .filter(|candidate| candidate.matcher.matches(description))
            .collect();
        let suppress_automount = matching.iter().any(|candidate| candidate.suppress_automount);

        let mut failure = None;
        for candidate in matching {
            match candidate.plugin.probe(&description.device_path) {
                Ok(mut outcome) => {
                    tracing::debug!(
                        "{} recognized {}",
                        candidate.kind,
                        description.device_path.display()
                    );
                    if !description.writable {
                        outcome.clean = true;
                    }
                    return ProbeReport {
                        verdict: ProbeVerdict::Recognized {
                            plugin: Arc::clone(&candidate.plugin),
                            outcome,
                        },
                        suppress_automount,
                    };
                }
                Err(e) if e.is(ErrorKind::UnsupportedOperation) => {}
                Err(e) => {
                    tracing::warn!(
                        "{} failed to probe {}: {}",
                        candidate.kind,
                        description.device_path.display(),
                        e
                    );
                    failure.get_or_insert(e);
                }
            }
        }

        ProbeReport {
            verdict: failure.map_or(ProbeVerdict::Unrecognized, ProbeVerdict::Failed),
            suppress_automount,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    use super::*;

    struct Scripted {
        kind: &'static str,
        result: Result<bool, ErrorKind>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(kind: &'static str, result: Result<bool, ErrorKind>) -> Arc<Self> {
            Arc::new(Self {
                kind,
                result,
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().expect("calls lock")
        }
    }

    impl FilesystemPlugin for Scripted {
        fn kind(&self) -> &str {
            self.kind
        }

        fn probe(&self, _device: &Path) -> Result<ProbeOutcome, ArbiterError> {
            *self.calls.lock().expect("calls lock") += 1;
            match self.result {
                Ok(clean) => Ok(ProbeOutcome {
                    kind: self.kind.to_string(),
                    name: Some("VOLUME".to_string()),
                    uuid: None,
                    clean,
                }),
                Err(kind) => Err(ArbiterError::new(kind, "scripted")),
            }
        }

        fn mount(&self, _: &Path, _: &Path, _: &[String]) -> Result<(), ArbiterError> {
            Ok(())
        }

        fn unmount(&self, _: &Path, _: bool) -> Result<(), ArbiterError> {
            Ok(())
        }
    }

    fn disk(size: u64, writable: bool) -> DiskDescription {
        DiskDescription {
            device_path: PathBuf::from("/dev/sdc1"),
            bus: Some("usb".to_string()),
            media_size: size,
            writable,
            ..Default::default()
        }
    }

    #[test]
    fn zero_size_media_is_never_probed() {
        let plugin = Scripted::new("vfat", Ok(true));
        let sequencer = ProbeSequencer::new(vec![ProbeCandidate::new(plugin.clone(), 0)]);
        let report = sequencer.probe(&disk(0, true));
        assert!(matches!(report.verdict, ProbeVerdict::Unrecognized));
        assert_eq!(plugin.calls(), 0);
    }

    #[test]
    fn failing_candidate_falls_through_to_next() {
        let broken = Scripted::new("hfs", Err(ErrorKind::Internal));
        let vfat = Scripted::new("vfat", Ok(true));
        let sequencer = ProbeSequencer::new(vec![
            ProbeCandidate::new(vfat.clone(), 20),
            ProbeCandidate::new(broken.clone(), 10),
        ]);

        let report = sequencer.probe(&disk(1 << 20, true));
        assert_eq!(report.verdict.kind(), Some("vfat"));
        assert_eq!(broken.calls(), 1);
    }

    #[test]
    fn read_failure_without_success_is_a_failed_verdict() {
        let broken = Scripted::new("hfs", Err(ErrorKind::Internal));
        let other = Scripted::new("ntfs", Err(ErrorKind::UnsupportedOperation));
        let sequencer = ProbeSequencer::new(vec![
            ProbeCandidate::new(broken, 0),
            ProbeCandidate::new(other, 1),
        ]);
        assert!(matches!(
            sequencer.probe(&disk(1 << 20, true)).verdict,
            ProbeVerdict::Failed(_)
        ));

        let unknown = ProbeSequencer::new(vec![ProbeCandidate::new(
            Scripted::new("ntfs", Err(ErrorKind::UnsupportedOperation)),
            0,
        )]);
        assert!(matches!(
            unknown.probe(&disk(1 << 20, true)).verdict,
            ProbeVerdict::Unrecognized
        ));
    }

    #[test]
    fn matcher_filters_and_may_suppress_automount() {
        let internal_only = Scripted::new("xfs", Ok(true));
        let vfat = Scripted::new("vfat", Ok(false));
        let sequencer = ProbeSequencer::new(vec![
            ProbeCandidate::new(internal_only.clone(), 0)
                .with_matcher(MediaMatcher::any().with_property("bus", "ata")),
            ProbeCandidate::new(vfat, 1)
                .with_matcher(MediaMatcher::any().with_property("bus", "usb"))
                .suppressing_automount(),
        ]);

        let report = sequencer.probe(&disk(1 << 20, true));
        assert_eq!(report.verdict.kind(), Some("vfat"));
        assert!(report.suppress_automount);
        assert_eq!(internal_only.calls(), 0);
    }

    #[test]
    fn read_only_media_are_reported_clean() {
        let dirty = Scripted::new("ext4", Ok(false));
        let sequencer = ProbeSequencer::new(vec![ProbeCandidate::new(dirty, 0)]);

        let ProbeVerdict::Recognized { outcome, .. } = sequencer.probe(&disk(1 << 20, false)).verdict
        else {
            panic!("expected recognition");
        };
        assert!(outcome.clean);

        let ProbeVerdict::Recognized { outcome, .. } = sequencer.probe(&disk(1 << 20, true)).verdict
        else {
            panic!("expected recognition");
        };
        assert!(!outcome.clean);
    }
}
