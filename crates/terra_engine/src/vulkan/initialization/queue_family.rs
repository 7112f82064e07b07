//! Queue family resolution
//!
//! Maps the graphics, transfer and compute roles onto the queue families a
//! physical device exposes. Sharing a family between roles is preferred since
//! it removes cross-family ownership transfers; dedicated families are only
//! used when no combined family exists.

use ash::vk;
use std::fmt;

use super::context::{VulkanError, VulkanResult};

/// Logical queue role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueRole {
    /// Rendering and presentation
    Graphics,
    /// Host to device uploads
    Transfer,
    /// Compute dispatch
    Compute,
}

impl QueueRole {
    /// Every role, in resolution order
    pub const ALL: [Self; 3] = [Self::Graphics, Self::Transfer, Self::Compute];

    const fn index(self) -> usize {
        match self {
            Self::Graphics => 0,
            Self::Transfer => 1,
            Self::Compute => 2,
        }
    }
}

impl fmt::Display for QueueRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Graphics => "graphics",
            Self::Transfer => "transfer",
            Self::Compute => "compute",
        };
        f.write_str(name)
    }
}

/// Capabilities of one queue family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyCaps {
    /// Capability bits
    pub flags: vk::QueueFlags,
    /// Number of queues in the family
    pub queue_count: u32,
    /// Whether the family can present to the target surface
    pub present: bool,
}

impl QueueFamilyCaps {
    /// Describe a family from driver-reported properties
    pub const fn from_properties(properties: &vk::QueueFamilyProperties, present: bool) -> Self {
        Self {
            flags: properties.queue_flags,
            queue_count: properties.queue_count,
            present,
        }
    }

    fn has(&self, flags: vk::QueueFlags) -> bool {
        self.queue_count > 0 && self.flags.contains(flags)
    }

    fn has_only(&self, flag: vk::QueueFlags, excluded: vk::QueueFlags) -> bool {
        self.has(flag) && !self.flags.intersects(excluded)
    }
}

/// A queue within a family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueSlot {
    /// Family index
    pub family: u32,
    /// Queue index inside the family
    pub index: u32,
}

/// Resolved role → queue mapping, immutable once the device exists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueAssignment {
    slots: [QueueSlot; 3],
}

impl QueueAssignment {
    /// Resolve every role against `families`
    ///
    /// With `require_present`, the graphics family must also present; the
    /// swapchain relies on that.
    pub fn resolve(families: &[QueueFamilyCaps], require_present: bool) -> VulkanResult<Self> {
        let combined = vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE;
        let presentable = |caps: &QueueFamilyCaps| !require_present || caps.present;

        let graphics = first_family(families, |caps| caps.has(combined) && presentable(caps))
            .or_else(|| {
                first_family(families, |caps| caps.has(vk::QueueFlags::GRAPHICS) && presentable(caps))
            })
            .ok_or_else(|| {
                if require_present {
                    VulkanError::missing("graphics queue family with present support")
                } else {
                    VulkanError::missing("graphics queue family")
                }
            })?;
        let graphics_caps = families[graphics as usize];

        let compute = if graphics_caps.has(vk::QueueFlags::COMPUTE) {
            graphics
        } else {
            first_family(families, |caps| {
                caps.has_only(vk::QueueFlags::COMPUTE, vk::QueueFlags::GRAPHICS)
            })
            .or_else(|| first_family(families, |caps| caps.has(vk::QueueFlags::COMPUTE)))
            .ok_or_else(|| VulkanError::missing("compute queue family"))?
        };

        // Graphics and compute families implicitly support transfer
        let transfer = if graphics_caps.has(combined) {
            graphics
        } else {
            first_family(families, |caps| {
                caps.has_only(vk::QueueFlags::TRANSFER, combined)
            })
            .unwrap_or(graphics)
        };

        let mut used = vec![0_u32; families.len()];
        let mut slot_in = |family: u32| {
            let caps = families[family as usize];
            let next = &mut used[family as usize];
            let index = (*next).min(caps.queue_count - 1);
            *next += 1;
            QueueSlot { family, index }
        };

        let graphics_slot = slot_in(graphics);
        let compute_slot = slot_in(compute);
        let transfer_slot = slot_in(transfer);

        let mut slots = [graphics_slot; 3];
        slots[QueueRole::Compute.index()] = compute_slot;
        slots[QueueRole::Transfer.index()] = transfer_slot;
        Ok(Self { slots })
    }

    /// Queue assigned to `role`
    pub const fn slot(&self, role: QueueRole) -> QueueSlot {
        self.slots[role.index()]
    }

    /// Family assigned to `role`
    pub const fn family(&self, role: QueueRole) -> u32 {
        self.slots[role.index()].family
    }

    /// Whether two roles resolved to the same family
    pub const fn shares_family(&self, a: QueueRole, b: QueueRole) -> bool {
        self.family(a) == self.family(b)
    }

    /// Distinct families in use, ascending
    pub fn unique_families(&self) -> Vec<u32> {
        let families: Vec<u32> = self.slots.iter().map(|slot| slot.family).collect();
        resolve_queue_indices(&families)
    }

    /// `(family, queue count)` for every distinct family, as device creation needs
    pub fn queue_counts(&self) -> Vec<(u32, u32)> {
        self.unique_families()
            .into_iter()
            .map(|family| {
                let count = self
                    .slots
                    .iter()
                    .filter(|slot| slot.family == family)
                    .map(|slot| slot.index + 1)
                    .max()
                    .unwrap_or(1);
                (family, count)
            })
            .collect()
    }
}

/// Ordered set of unique family indices
///
/// Used for buffer sharing-mode declarations: `[1, 0]` and `[0, 1]` both give
/// `[0, 1]`, `[1, 1]` gives `[1]`.
pub fn resolve_queue_indices(families: &[u32]) -> Vec<u32> {
    let mut unique = families.to_vec();
    unique.sort_unstable();
    unique.dedup();
    unique
}

fn first_family(families: &[QueueFamilyCaps], predicate: impl Fn(&QueueFamilyCaps) -> bool) -> Option<u32> {
    families
        .iter()
        .position(predicate)
        .and_then(|index| u32::try_from(index).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags, queue_count: u32, present: bool) -> QueueFamilyCaps {
        QueueFamilyCaps {
            flags,
            queue_count,
            present,
        }
    }

    const GCT: vk::QueueFlags = vk::QueueFlags::from_raw(
        vk::QueueFlags::GRAPHICS.as_raw() | vk::QueueFlags::COMPUTE.as_raw() | vk::QueueFlags::TRANSFER.as_raw(),
    );
    const CT: vk::QueueFlags =
        vk::QueueFlags::from_raw(vk::QueueFlags::COMPUTE.as_raw() | vk::QueueFlags::TRANSFER.as_raw());

    #[test]
    fn test_resolve_queue_indices() {
        assert_eq!(resolve_queue_indices(&[1, 0]), vec![0, 1]);
        assert_eq!(resolve_queue_indices(&[0, 1]), vec![0, 1]);
        assert_eq!(resolve_queue_indices(&[1, 1]), vec![1]);
        assert_eq!(resolve_queue_indices(&[1, 0, 1]), vec![0, 1]);
        assert!(resolve_queue_indices(&[]).is_empty());
    }

    #[test]
    fn test_single_family_shared_by_all_roles() {
        let families = [family(GCT, 1, true)];
        let assignment = QueueAssignment::resolve(&families, true).unwrap();

        for role in QueueRole::ALL {
            assert_eq!(assignment.slot(role), QueueSlot { family: 0, index: 0 });
        }
        assert_eq!(assignment.unique_families(), vec![0]);
        assert_eq!(assignment.queue_counts(), vec![(0, 1)]);
    }

    #[test]
    fn test_spare_queues_get_distinct_indices() {
        let families = [family(GCT, 16, true), family(vk::QueueFlags::TRANSFER, 2, false)];
        let assignment = QueueAssignment::resolve(&families, true).unwrap();

        // The combined family is preferred over the dedicated transfer family
        assert!(assignment.shares_family(QueueRole::Graphics, QueueRole::Transfer));
        assert_eq!(assignment.slot(QueueRole::Graphics).index, 0);
        assert_eq!(assignment.slot(QueueRole::Compute).index, 1);
        assert_eq!(assignment.slot(QueueRole::Transfer).index, 2);
        assert_eq!(assignment.queue_counts(), vec![(0, 3)]);
    }

    #[test]
    fn test_fallback_to_dedicated_families() {
        let families = [
            family(vk::QueueFlags::TRANSFER, 1, false),
            family(CT, 1, false),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER, 1, true),
        ];
        let assignment = QueueAssignment::resolve(&families, true).unwrap();

        assert_eq!(assignment.family(QueueRole::Graphics), 2);
        assert_eq!(assignment.family(QueueRole::Compute), 1);
        assert_eq!(assignment.family(QueueRole::Transfer), 0);
        assert_eq!(assignment.unique_families(), vec![0, 1, 2]);
        assert!(!assignment.shares_family(QueueRole::Graphics, QueueRole::Transfer));
    }

    #[test]
    fn test_present_requirement() {
        let families = [family(GCT, 1, false), family(GCT, 1, true)];

        let with_present = QueueAssignment::resolve(&families, true).unwrap();
        assert_eq!(with_present.family(QueueRole::Graphics), 1);

        let without_present = QueueAssignment::resolve(&families, false).unwrap();
        assert_eq!(without_present.family(QueueRole::Graphics), 0);

        let no_present = [family(GCT, 1, false)];
        assert!(matches!(
            QueueAssignment::resolve(&no_present, true),
            Err(VulkanError::MissingCapability { .. })
        ));
    }

    #[test]
    fn test_missing_compute_reported() {
        let families = [family(vk::QueueFlags::GRAPHICS, 1, true)];
        let error = QueueAssignment::resolve(&families, true).unwrap_err();
        assert_eq!(error.to_string(), "Missing capability: compute queue family");
    }

    #[test]
    fn test_empty_families_are_skipped() {
        let families = [family(GCT, 0, true), family(GCT, 1, true)];
        let assignment = QueueAssignment::resolve(&families, true).unwrap();
        assert_eq!(assignment.unique_families(), vec![1]);
    }
}
