//! MBR partition table creation

use crate::disk::layouts::PartitionPlan;
use crate::disk::loopback::partition_path;
use crate::utils::command::CommandRunner;
use crate::utils::error::{ImageError, Result};
use tracing::info;

/// Generate an sfdisk script for a partition plan
///
/// Each line names the partition's sub-device so unused slots stay empty
/// and the numbering follows the plan rather than line order.
pub fn generate_sfdisk_script(device: &str, plan: &PartitionPlan) -> String {
    let mut script = String::new();
    script.push_str("label: dos\n");
    script.push_str(&format!("device: {}\n", device));
    script.push_str("unit: sectors\n");
    script.push_str(&format!("sector-size: {}\n", plan.sector_size));
    script.push('\n');

    for range in &plan.ranges {
        script.push_str(&format!(
            "{} : start={}, size={}, type={:x}\n",
            partition_path(device, range.number),
            range.start_sector,
            range.sector_count(),
            range.type_code
        ));
    }

    script
}

/// Write the partition table for `plan` to `device`, then set every type byte
pub fn apply_partitions(cmd: &CommandRunner, device: &str, plan: &PartitionPlan) -> Result<()> {
    info!(
        "Writing MBR partition table with {} partitions to {}",
        plan.ranges.len(),
        device
    );

    let script = generate_sfdisk_script(device, plan);
    cmd.run_with_input("sfdisk", &["--wipe", "always", device], &script)
        .map_err(|e| ImageError::PartitionError(format!("sfdisk failed on {}: {}", device, e)))?;

    // Second pass: the type byte of every partition, explicitly
    for range in &plan.ranges {
        let number = range.number.to_string();
        let type_code = format!("{:x}", range.type_code);
        cmd.run("sfdisk", &["--part-type", device, &number, &type_code])
            .map_err(|e| {
                ImageError::PartitionError(format!(
                    "Failed to set type {:#04x} on partition {}: {}",
                    range.type_code, range.number, e
                ))
            })?;
    }

    info!("Partition table written to {}", device);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::layouts::{plan_layout, LayoutRequest, PartitionRequest, Region};

    #[test]
    fn script_uses_sector_counts_and_hex_types() {
        let request = LayoutRequest {
            loader: PartitionRequest::new(Region::Loader, 3, 16),
            fat32: PartitionRequest::new(Region::Fat32, 1, 100),
            rootfs: PartitionRequest::new(Region::Rootfs, 2, 0),
            image_size_mib: 2048,
            sector_size: 512,
        };
        let (_, plan) = plan_layout(&request).unwrap();
        let script = generate_sfdisk_script("/dev/loop0", &plan);

        assert!(script.starts_with("label: dos\n"));
        assert!(script.contains("sector-size: 512\n"));
        assert!(script.contains("/dev/loop0p1 : start=2048, size=204800, type=c\n"));
        assert!(script.contains("/dev/loop0p2 : start=206848, size=3954688, type=83\n"));
        assert!(script.contains("/dev/loop0p3 : start=4161536, size=32768, type=a2\n"));
    }

    #[test]
    fn skipped_slot_is_not_written() {
        let request = LayoutRequest {
            loader: PartitionRequest::new(Region::Loader, 4, 16),
            fat32: PartitionRequest::new(Region::Fat32, 1, 100),
            rootfs: PartitionRequest::new(Region::Rootfs, 2, 200),
            image_size_mib: 2048,
            sector_size: 4096,
        };
        let (_, plan) = plan_layout(&request).unwrap();
        let script = generate_sfdisk_script("/dev/loop7", &plan);

        assert!(!script.contains("/dev/loop7p3"));
        assert!(script.contains("/dev/loop7p4 : start=77056, size=4096, type=a2\n"));
    }

    #[test]
    fn dry_run_applies_nothing() {
        let request = LayoutRequest {
            loader: PartitionRequest::new(Region::Loader, 3, 16),
            fat32: PartitionRequest::new(Region::Fat32, 1, 100),
            rootfs: PartitionRequest::new(Region::Rootfs, 2, 0),
            image_size_mib: 2048,
            sector_size: 512,
        };
        let (_, plan) = plan_layout(&request).unwrap();
        apply_partitions(&CommandRunner::new(true), "/dev/loop0", &plan).unwrap();
    }
}
