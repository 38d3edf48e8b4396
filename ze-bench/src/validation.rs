use ze_types::DeviceCapability;
use crate::Error;

pub(crate) fn validate(cap: &DeviceCapability) -> Result<(), Error> {
    // Every limit the solver divides or clamps by must be at least one
    let limits = [
        ("max_group_size_x", cap.max_group_size_x),
        ("max_group_size_y", cap.max_group_size_y),
        ("max_group_size_z", cap.max_group_size_z),
        ("max_group_count_x", cap.max_group_count_x),
        ("max_group_count_y", cap.max_group_count_y),
        ("max_group_count_z", cap.max_group_count_z),
        ("max_invocations_per_group", cap.max_invocations_per_group),
        ("compute_units", cap.compute_units),
    ];
    for (name, value) in limits {
        if value == 0 {
            return Err(Error::InvalidConfig(format!(
                "{}: {} must be at least 1",
                cap.name, name
            )));
        }
    }

    if cap.max_alloc_size == 0 {
        return Err(Error::InvalidConfig(format!(
            "{}: max_alloc_size must be non-zero",
            cap.name
        )));
    }

    // Timestamp arithmetic
    if !(1..=64).contains(&cap.kernel_timestamp_valid_bits) {
        return Err(Error::InvalidConfig(format!(
            "{}: kernel_timestamp_valid_bits {} outside 1..=64",
            cap.name, cap.kernel_timestamp_valid_bits
        )));
    }
    if !(cap.timer_resolution_ns > 0.0) || !cap.timer_resolution_ns.is_finite() {
        return Err(Error::InvalidConfig(format!(
            "{}: timer resolution must be positive",
            cap.name
        )));
    }

    Ok(())
}
