//! Decomposition of a work-item count into legal group sizes and counts.

use tracing::debug;

use crate::{DeviceCapability, WorkgroupPlan};

/// Packs `requested` work items into a plan, greedily along X, then Y, then Z.
///
/// This is a best-effort packer: the plan may execute fewer or more items
/// than requested when the remainder does not divide evenly. Callers must
/// normalise derived metrics with the returned executed count.
pub fn solve(requested: u64, capability: &DeviceCapability) -> (WorkgroupPlan, u64) {
    let requested = requested.max(1);

    let group_size_x = requested.min(capability.max_group_size_x as u64);
    let group_size_y = 1u64;
    let group_size_z = 1u64;
    let group_size = group_size_x * group_size_y * group_size_z;

    let group_count_x = (requested / group_size).min(capability.max_group_count_x as u64);
    let remaining = requested.saturating_sub(group_count_x * group_size);

    let group_count_y = (remaining / (group_count_x * group_size))
        .min(capability.max_group_count_y as u64)
        .max(1);
    let remaining = requested.saturating_sub(group_count_x * group_count_y * group_size);

    let group_count_z = (remaining / (group_count_x * group_count_y * group_size))
        .min(capability.max_group_count_z as u64)
        .max(1);

    let executed = group_count_x * group_count_y * group_count_z * group_size;

    debug!(
        requested,
        executed,
        group_size_x,
        group_count_x,
        group_count_y,
        group_count_z,
        "workgroups_solved"
    );

    let plan = WorkgroupPlan {
        group_size_x: group_size_x as u32,
        group_size_y: group_size_y as u32,
        group_size_z: group_size_z as u32,
        group_count_x: group_count_x as u32,
        group_count_y: group_count_y as u32,
        group_count_z: group_count_z as u32,
    };
    (plan, executed)
}

/// Work items the device can run at once with a single kernel enqueued.
pub fn max_work_items(capability: &DeviceCapability) -> u64 {
    capability.compute_units as u64 * capability.max_group_size_x as u64
}

/// Picks, per axis, the largest divisor of the global size that fits the axis
/// limit and what is left of the per-group invocation budget.
pub fn suggest_group_size(global: [u32; 3], max_size: [u32; 3], max_invocations: u32) -> [u32; 3] {
    let mut budget = max_invocations.max(1);
    let mut size = [1u32; 3];
    for axis in 0..3 {
        let cap = max_size[axis].min(budget).max(1);
        size[axis] = largest_divisor_at_most(global[axis].max(1), cap);
        budget /= size[axis];
    }
    size
}

fn largest_divisor_at_most(n: u32, cap: u32) -> u32 {
    (1..=cap.min(n)).rev().find(|d| n % d == 0).unwrap_or(1)
}
