use crate::bus::packet::PACKET_LEN;
use crate::error::AppError;
use crate::sensor::{SensorDiscovery, SensorEvent, SensorLink, label_matches};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct LinkShared {
    pending: VecDeque<SensorEvent>,
    sent: Vec<[u8; PACKET_LEN]>,
    fail_reads: bool,
    fail_writes: bool,
}

/// Test-side handle onto an in-memory link: inject events, inspect frames.
#[derive(Debug, Clone, Default)]
pub struct MockLinkHandle {
    shared: Arc<Mutex<LinkShared>>,
}

impl MockLinkHandle {
    fn lock(&self) -> MutexGuard<'_, LinkShared> {
        match self.shared.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn push_events(&self, events: &[SensorEvent]) {
        self.lock().pending.extend(events.iter().copied());
    }

    pub fn sent(&self) -> Vec<[u8; PACKET_LEN]> {
        self.lock().sent.clone()
    }

    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.lock().fail_reads = fail;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }
}

#[derive(Debug)]
pub struct MockSensorLink {
    label: String,
    handle: MockLinkHandle,
}

impl MockSensorLink {
    pub fn new(label: &str) -> (Self, MockLinkHandle) {
        let handle = MockLinkHandle::default();
        let link = Self {
            label: label.to_string(),
            handle: handle.clone(),
        };
        (link, handle)
    }
}

impl SensorLink for MockSensorLink {
    fn label(&self) -> &str {
        &self.label
    }

    fn drain_events(&mut self) -> Result<Vec<SensorEvent>, AppError> {
        let mut shared = self.handle.lock();
        if shared.fail_reads {
            return Err(AppError::Serial {
                port: self.label.clone(),
                message: "mock read failed".to_string(),
            });
        }
        Ok(shared.pending.drain(..).collect())
    }

    fn send(&mut self, frame: &[u8; PACKET_LEN]) -> Result<(), AppError> {
        let mut shared = self.handle.lock();
        if shared.fail_writes {
            return Err(AppError::Serial {
                port: self.label.clone(),
                message: "mock write failed".to_string(),
            });
        }
        shared.sent.push(*frame);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    links: HashMap<String, MockLinkHandle>,
    opened: Vec<String>,
    scans: usize,
}

/// Records what a [`MockDiscovery`] opened; shared with the test.
#[derive(Debug, Clone, Default)]
pub struct MockRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl MockRegistry {
    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Handle for the device with `label`, created on first use.
    pub fn link(&self, label: &str) -> MockLinkHandle {
        self.lock()
            .links
            .entry(label.to_string())
            .or_default()
            .clone()
    }

    /// Labels in the order they were opened, including repeats.
    pub fn opened(&self) -> Vec<String> {
        self.lock().opened.clone()
    }

    pub fn scans(&self) -> usize {
        self.lock().scans
    }
}

/// Discovery over a scripted sequence of scans.
///
/// Each scan lists the device labels attached at that moment; once the
/// script runs out the last scan repeats.
#[derive(Debug)]
pub struct MockDiscovery {
    scans: VecDeque<Vec<String>>,
    last_scan: Vec<String>,
    registry: MockRegistry,
}

impl MockDiscovery {
    pub fn new(scans: Vec<Vec<&str>>) -> Self {
        Self {
            scans: scans
                .into_iter()
                .map(|scan| scan.into_iter().map(str::to_string).collect())
                .collect(),
            last_scan: Vec::new(),
            registry: MockRegistry::default(),
        }
    }

    pub fn registry(&self) -> MockRegistry {
        self.registry.clone()
    }
}

impl SensorDiscovery for MockDiscovery {
    type Link = MockSensorLink;

    fn discover(
        &mut self,
        pattern: &str,
        opened: &HashSet<String>,
    ) -> Result<Vec<MockSensorLink>, AppError> {
        if let Some(scan) = self.scans.pop_front() {
            self.last_scan = scan;
        }
        let mut registry = self.registry.lock();
        registry.scans += 1;

        let mut links = Vec::new();
        for label in &self.last_scan {
            if !label_matches(label, pattern) || opened.contains(label) {
                continue;
            }
            let handle = registry.links.entry(label.clone()).or_default().clone();
            registry.opened.push(label.clone());
            links.push(MockSensorLink {
                label: label.clone(),
                handle,
            });
        }
        Ok(links)
    }
}
