//! Launchers: the argument bundles of the issue surface.
//!
//! A launcher describes one operation the application wants issued; the
//! context validates it, builds the operation, and hands back a deferred
//! handle ([`PhysicalRegion`], [`crate::event::Future`], or an event).

use parking_lot::Mutex;
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::event::Event;
use crate::mapper::Placement;
use crate::op::FileMode;
use crate::predicate::Predicate;
use crate::types::{Domain, DomainPoint, FieldId, LogicalRegion, RegionRequirement};

struct PhysicalRegionInner {
    region: LogicalRegion,
    ready: Event,
    instance: Mutex<Option<Placement>>,
}

/// A handle to a mapped region returned from inline mapping or attach.
///
/// The handle is deferred: the instance is populated when the producing
/// operation maps, and the ready event fires at its completion.
#[derive(Clone)]
pub struct PhysicalRegion {
    inner: Arc<PhysicalRegionInner>,
}

impl PhysicalRegion {
    pub(crate) fn new(region: LogicalRegion, ready: Event) -> Self {
        Self {
            inner: Arc::new(PhysicalRegionInner {
                region,
                ready,
                instance: Mutex::new(None),
            }),
        }
    }

    /// The logical region this handle maps.
    #[must_use]
    pub fn region(&self) -> LogicalRegion {
        self.inner.region
    }

    /// Fires when the region contents are valid; poisoned if the producing
    /// operation was quashed.
    #[must_use]
    pub fn ready_event(&self) -> Event {
        self.inner.ready.clone()
    }

    /// The placement bound by the mapper, once mapping has run.
    #[must_use]
    pub fn instance(&self) -> Option<Placement> {
        *self.inner.instance.lock()
    }

    pub(crate) fn bind_instance(&self, placement: Placement) {
        *self.inner.instance.lock() = Some(placement);
    }
}

impl core::fmt::Debug for PhysicalRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "PhysicalRegion({:?}, mapped={})",
            self.inner.region,
            self.instance().is_some()
        )
    }
}

/// Launcher for an inline mapping.
#[derive(Debug, Clone)]
pub struct InlineLauncher {
    /// The region requirement to map.
    pub requirement: RegionRequirement,
}

impl InlineLauncher {
    /// Creates an inline launcher for `requirement`.
    #[must_use]
    pub fn new(requirement: RegionRequirement) -> Self {
        Self { requirement }
    }
}

/// Launcher for a region-to-region copy.
#[derive(Debug, Clone, Default)]
pub struct CopyLauncher {
    /// Source requirements.
    pub src_requirements: SmallVec<[RegionRequirement; 2]>,
    /// Destination requirements, pairwise with the sources.
    pub dst_requirements: SmallVec<[RegionRequirement; 2]>,
    /// Predicate gating the copy.
    pub predicate: Predicate,
}

impl CopyLauncher {
    /// Creates an empty copy launcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a source/destination requirement pair.
    #[must_use]
    pub fn add_copy(mut self, src: RegionRequirement, dst: RegionRequirement) -> Self {
        self.src_requirements.push(src);
        self.dst_requirements.push(dst);
        self
    }

    /// Gates the copy on a predicate.
    #[must_use]
    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = predicate;
        self
    }
}

/// Launcher for a fill.
#[derive(Debug, Clone)]
pub struct FillLauncher {
    /// The requirement naming the region and fields to fill.
    pub requirement: RegionRequirement,
    /// Immediate fill bytes; mutually exclusive with `future`.
    pub value: Option<Arc<[u8]>>,
    /// Deferred fill value; mutually exclusive with `value`.
    pub future: Option<crate::event::Future>,
    /// Predicate gating the fill.
    pub predicate: Predicate,
}

impl FillLauncher {
    /// Creates a fill of immediate bytes.
    #[must_use]
    pub fn from_bytes(requirement: RegionRequirement, value: &[u8]) -> Self {
        Self {
            requirement,
            value: Some(Arc::from(value)),
            future: None,
            predicate: Predicate::AlwaysTrue,
        }
    }

    /// Creates a fill whose value comes from a future.
    #[must_use]
    pub fn from_future(requirement: RegionRequirement, future: crate::event::Future) -> Self {
        Self {
            requirement,
            value: None,
            future: Some(future),
            predicate: Predicate::AlwaysTrue,
        }
    }

    /// Gates the fill on a predicate.
    #[must_use]
    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = predicate;
        self
    }
}

/// Launcher for a coherence acquire or release.
#[derive(Debug, Clone)]
pub struct CoherenceLauncher {
    /// The requirement naming the region and fields.
    pub requirement: RegionRequirement,
    /// Predicate gating the operation.
    pub predicate: Predicate,
}

impl CoherenceLauncher {
    /// Creates a coherence launcher for `requirement`.
    #[must_use]
    pub fn new(requirement: RegionRequirement) -> Self {
        Self {
            requirement,
            predicate: Predicate::AlwaysTrue,
        }
    }

    /// Gates the operation on a predicate.
    #[must_use]
    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = predicate;
        self
    }
}

/// Launcher for attaching an external file to a region.
#[derive(Debug, Clone)]
pub struct AttachLauncher {
    /// The requirement naming the region and fields backed by the file.
    pub requirement: RegionRequirement,
    /// Path of the external file.
    pub file_name: String,
    /// Field id → field name within the external file.
    pub field_map: BTreeMap<FieldId, String>,
    /// Access mode.
    pub mode: FileMode,
}

impl AttachLauncher {
    /// Creates an attach launcher.
    #[must_use]
    pub fn new(requirement: RegionRequirement, file_name: impl Into<String>, mode: FileMode) -> Self {
        Self {
            requirement,
            file_name: file_name.into(),
            field_map: BTreeMap::new(),
            mode,
        }
    }

    /// Binds a region field to a named field of the file.
    #[must_use]
    pub fn with_field(mut self, field: FieldId, file_field: impl Into<String>) -> Self {
        self.field_map.insert(field, file_field.into());
        self
    }
}

/// Launcher for a single task within a must-epoch.
#[derive(Debug, Clone)]
pub struct TaskLauncher {
    /// The task's region requirements.
    pub requirements: SmallVec<[RegionRequirement; 2]>,
    /// The point the task occupies.
    pub point: DomainPoint,
}

impl TaskLauncher {
    /// Creates a task launcher at the zero-dimensional point.
    #[must_use]
    pub fn new() -> Self {
        Self {
            requirements: SmallVec::new(),
            point: DomainPoint::ZERO_DIM,
        }
    }

    /// Places the task at a point.
    #[must_use]
    pub fn at_point(mut self, point: DomainPoint) -> Self {
        self.point = point;
        self
    }

    /// Adds a region requirement.
    #[must_use]
    pub fn add_requirement(mut self, req: RegionRequirement) -> Self {
        self.requirements.push(req);
        self
    }
}

impl Default for TaskLauncher {
    fn default() -> Self {
        Self::new()
    }
}

/// Launcher for an index task within a must-epoch: one task per domain
/// point.
#[derive(Debug, Clone)]
pub struct IndexTaskLauncher {
    /// Requirements shared by every point task.
    pub requirements: SmallVec<[RegionRequirement; 2]>,
    /// The launch domain.
    pub domain: Domain,
}

impl IndexTaskLauncher {
    /// Creates an index launcher over `domain`.
    #[must_use]
    pub fn new(domain: Domain) -> Self {
        Self {
            requirements: SmallVec::new(),
            domain,
        }
    }

    /// Adds a region requirement shared by all points.
    #[must_use]
    pub fn add_requirement(mut self, req: RegionRequirement) -> Self {
        self.requirements.push(req);
        self
    }
}

/// Launcher for a must-parallel epoch.
#[derive(Debug, Clone, Default)]
pub struct MustEpochLauncher {
    /// Individual tasks in the epoch.
    pub single_tasks: Vec<TaskLauncher>,
    /// Index tasks in the epoch; each expands to one task per point.
    pub index_tasks: Vec<IndexTaskLauncher>,
}

impl MustEpochLauncher {
    /// Creates an empty epoch launcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an individual task.
    #[must_use]
    pub fn add_single_task(mut self, task: TaskLauncher) -> Self {
        self.single_tasks.push(task);
        self
    }

    /// Adds an index task.
    #[must_use]
    pub fn add_index_task(mut self, task: IndexTaskLauncher) -> Self {
        self.index_tasks.push(task);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        FieldMask, FieldSpace, IndexSpace, PrivilegeMode, RegionTreeId,
    };

    fn req() -> RegionRequirement {
        RegionRequirement::new(
            LogicalRegion::new(RegionTreeId(0), IndexSpace(0), FieldSpace(0)),
            FieldMask::single(0),
            PrivilegeMode::ReadWrite,
        )
    }

    #[test]
    fn physical_region_binds_instance_once_mapped() {
        let region = PhysicalRegion::new(req().region, Event::completed());
        assert!(region.instance().is_none());
        region.bind_instance(Placement {
            memory: crate::mapper::MemoryId(0),
            instance: crate::mapper::InstanceId(3),
        });
        assert_eq!(region.instance().unwrap().instance.0, 3);
        assert!(region.ready_event().has_triggered());
    }

    #[test]
    fn copy_launcher_pairs_requirements() {
        let launcher = CopyLauncher::new().add_copy(req(), req()).add_copy(req(), req());
        assert_eq!(launcher.src_requirements.len(), 2);
        assert_eq!(launcher.dst_requirements.len(), 2);
    }

    #[test]
    fn epoch_launcher_collects_tasks() {
        let launcher = MustEpochLauncher::new()
            .add_single_task(TaskLauncher::new().add_requirement(req()))
            .add_index_task(IndexTaskLauncher::new(Domain::new(0, 3)).add_requirement(req()));
        assert_eq!(launcher.single_tasks.len(), 1);
        assert_eq!(launcher.index_tasks.len(), 1);
        assert_eq!(launcher.index_tasks[0].domain.volume(), 4);
    }

    #[test]
    fn attach_launcher_field_map() {
        let launcher = AttachLauncher::new(req(), "/tmp/data.h5", FileMode::ReadWrite)
            .with_field(0, "temperature");
        assert_eq!(launcher.field_map.get(&0).map(String::as_str), Some("temperature"));
    }
}
