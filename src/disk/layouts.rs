//! Partition layout planning and sizing calculations
//!
//! Turns the requested region sizes (MiB) and partition numbers into a
//! contiguous table of absolute sector ranges. Nothing in here touches the
//! host; the same request always yields the same plan.

use crate::utils::error::{ImageError, Result};
use colored::Colorize;
use serde::Serialize;

/// MBR partition type codes
pub mod partition_types {
    pub const FAT32_LBA: u8 = 0x0C;
    pub const LINUX: u8 = 0x83;
    /// Altera/Intel SoC FPGA preloader partition
    pub const LOADER: u8 = 0xA2;
}

pub const BYTES_PER_MIB: u64 = 1024 * 1024;

/// The first MiB holds the MBR and is never allocated
pub const RESERVED_MIB: u64 = 1;

/// MBR primary partition slots
pub const MAX_PARTITIONS: u8 = 4;

/// Supported device sector sizes in bytes
pub const SECTOR_SIZES: [u32; 5] = [512, 1024, 2048, 4096, 8192];

/// One of the three regions every image carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Region {
    Loader,
    Fat32,
    Rootfs,
}

impl Region {
    pub fn type_code(&self) -> u8 {
        match self {
            Self::Loader => partition_types::LOADER,
            Self::Fat32 => partition_types::FAT32_LBA,
            Self::Rootfs => partition_types::LINUX,
        }
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Loader => write!(f, "loader"),
            Self::Fat32 => write!(f, "fat32"),
            Self::Rootfs => write!(f, "rootfs"),
        }
    }
}

/// A requested partition: where it goes and how big it is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionRequest {
    pub region: Region,
    /// Slot on the disk (1-4)
    pub number: u8,
    /// Size in MiB (0 on the rootfs = fill the image)
    pub size_mib: u64,
}

impl PartitionRequest {
    pub fn new(region: Region, number: u8, size_mib: u64) -> Self {
        Self {
            region,
            number,
            size_mib,
        }
    }

    pub fn type_code(&self) -> u8 {
        self.region.type_code()
    }
}

/// Planner input: the three region requests plus the image geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutRequest {
    pub loader: PartitionRequest,
    pub fat32: PartitionRequest,
    pub rootfs: PartitionRequest,
    pub image_size_mib: u64,
    pub sector_size: u32,
}

/// Space accounting for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SizeBudget {
    /// Sum of the three partition sizes (after rootfs resolution)
    pub total_requested_mib: u64,
    /// Unallocated space at the end of the image; never negative
    pub slack_mib: i64,
    /// Rootfs size after resolving "fill remaining space"
    pub rootfs_mib: u64,
    pub reserved_mib: u64,
    pub image_size_mib: u64,
}

/// One planned partition, in sectors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PartitionRange {
    pub number: u8,
    pub region: Region,
    pub start_sector: u64,
    /// Offset of the last sector from `start_sector` (sector count minus one)
    pub span_sectors: u64,
    pub type_code: u8,
}

impl PartitionRange {
    /// Last sector of the partition, inclusive
    pub fn end_sector(&self) -> u64 {
        self.start_sector + self.span_sectors
    }

    pub fn sector_count(&self) -> u64 {
        self.span_sectors + 1
    }
}

/// Planner output, in disk order (ascending partition number)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionPlan {
    pub sector_size: u32,
    pub sectors_per_mib: u64,
    pub ranges: Vec<PartitionRange>,
}

impl PartitionPlan {
    /// The planned range for a region
    pub fn region(&self, region: Region) -> Option<&PartitionRange> {
        self.ranges.iter().find(|r| r.region == region)
    }

    /// First sector after the last partition
    pub fn end_sector(&self) -> u64 {
        self.ranges
            .last()
            .map(|r| r.end_sector() + 1)
            .unwrap_or(RESERVED_MIB * self.sectors_per_mib)
    }
}

/// Sectors in one MiB. Every supported sector size divides a MiB exactly.
pub fn sectors_per_mib(sector_size: u32) -> Result<u64> {
    if !SECTOR_SIZES.contains(&sector_size) {
        return Err(ImageError::InvalidSectorSize(sector_size));
    }
    Ok(BYTES_PER_MIB / sector_size as u64)
}

impl LayoutRequest {
    /// Requests in input order
    pub fn requests(&self) -> [PartitionRequest; 3] {
        [self.fat32, self.rootfs, self.loader]
    }

    /// Every partition number in 1..=4 and used only once
    pub fn check_numbers(&self) -> Result<()> {
        let mut owners: [Option<Region>; MAX_PARTITIONS as usize] = [None; MAX_PARTITIONS as usize];

        for req in self.requests() {
            if req.number == 0 || req.number > MAX_PARTITIONS {
                return Err(ImageError::InvalidPartitionNumber {
                    region: req.region.to_string(),
                    number: req.number,
                });
            }
            let slot = &mut owners[(req.number - 1) as usize];
            if let Some(first) = slot {
                return Err(ImageError::DuplicatePartitionNumber {
                    number: req.number,
                    first: first.to_string(),
                    second: req.region.to_string(),
                });
            }
            *slot = Some(req.region);
        }

        Ok(())
    }

    /// Copy of this request with the rootfs size taken from `budget`
    pub fn resolve(&self, budget: &SizeBudget) -> LayoutRequest {
        let mut resolved = *self;
        resolved.rootfs.size_mib = budget.rootfs_mib;
        resolved
    }
}

/// Work out how the image space is shared out.
///
/// A rootfs size of 0 takes whatever the other two regions and the reserved
/// head leave over. Fails with `InsufficientSpace` if the regions do not fit.
pub fn compute_size_budget(request: &LayoutRequest) -> Result<SizeBudget> {
    let image = request.image_size_mib as i64;
    let loader = request.loader.size_mib;
    let fat32 = request.fat32.size_mib;
    let mut rootfs = request.rootfs.size_mib;

    let mut total = loader + fat32 + rootfs;
    let mut slack = image - total as i64 - RESERVED_MIB as i64;

    if rootfs == 0 && slack > 0 {
        rootfs = slack as u64;
        total = loader + fat32 + rootfs;
        slack = 0;
    }

    if slack < 0 {
        return Err(ImageError::InsufficientSpace {
            image_mib: request.image_size_mib,
            requested_mib: total,
            reserved_mib: RESERVED_MIB,
            slack_mib: slack,
        });
    }

    Ok(SizeBudget {
        total_requested_mib: total,
        slack_mib: slack,
        rootfs_mib: rootfs,
        reserved_mib: RESERVED_MIB,
        image_size_mib: request.image_size_mib,
    })
}

/// Lay the partitions out back to back, lowest partition number first.
///
/// Expects a request already passed through [`LayoutRequest::resolve`].
/// Unused slots take no space, so three partitions numbered 1, 2 and 4 sit
/// exactly as tightly as 1, 2 and 3.
pub fn compute_partition_plan(request: &LayoutRequest) -> Result<PartitionPlan> {
    request.check_numbers()?;
    let spm = sectors_per_mib(request.sector_size)?;

    let requests = request.requests();
    if let Some(empty) = requests.iter().find(|r| r.size_mib == 0) {
        return Err(ImageError::EmptyPartition(empty.region.to_string()));
    }

    let mut ranges = Vec::with_capacity(requests.len());
    let mut cursor = RESERVED_MIB * spm;

    for slot in 1..=MAX_PARTITIONS {
        let Some(req) = requests.iter().find(|r| r.number == slot) else {
            continue;
        };
        let sectors = req.size_mib * spm;
        ranges.push(PartitionRange {
            number: req.number,
            region: req.region,
            start_sector: cursor,
            span_sectors: sectors - 1,
            type_code: req.type_code(),
        });
        cursor += sectors;
    }

    Ok(PartitionPlan {
        sector_size: request.sector_size,
        sectors_per_mib: spm,
        ranges,
    })
}

/// Budget then plan, the way a build needs them
pub fn plan_layout(request: &LayoutRequest) -> Result<(SizeBudget, PartitionPlan)> {
    let budget = compute_size_budget(request)?;
    let plan = compute_partition_plan(&request.resolve(&budget))?;
    Ok((budget, plan))
}

/// Print layout summary
pub fn print_layout_summary(request: &LayoutRequest, budget: &SizeBudget, plan: &PartitionPlan) {
    println!("\n{}", "Partition sizes:".bold());
    println!("  {:<10} {:>8} MiB", "FAT32", request.fat32.size_mib);
    println!("  {:<10} {:>8} MiB", "Loader", request.loader.size_mib);
    println!("  {:<10} {:>8} MiB", "RootFS", budget.rootfs_mib);
    println!("  {:<10} {:>8} MiB", "Total", budget.total_requested_mib);
    println!("  {:<10} {:>8} MiB", "Image", budget.image_size_mib);
    println!("  {:<10} {:>8} MiB", "Slack", budget.slack_mib);

    println!(
        "\n{:<6} {:<8} {:>12} {:>12} {:>12} {:>6}",
        "NUM", "REGION", "START", "SECTORS", "END", "TYPE"
    );
    println!("{}", "-".repeat(62));
    for range in &plan.ranges {
        println!(
            "{:<6} {:<8} {:>12} {:>12} {:>12} {:>#6x}",
            format!("p{}", range.number),
            range.region,
            range.start_sector,
            range.sector_count(),
            range.end_sector(),
            range.type_code
        );
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn request(
        (fat32_n, rootfs_n, loader_n): (u8, u8, u8),
        (fat32, rootfs, loader): (u64, u64, u64),
        image: u64,
        sector_size: u32,
    ) -> LayoutRequest {
        LayoutRequest {
            loader: PartitionRequest::new(Region::Loader, loader_n, loader),
            fat32: PartitionRequest::new(Region::Fat32, fat32_n, fat32),
            rootfs: PartitionRequest::new(Region::Rootfs, rootfs_n, rootfs),
            image_size_mib: image,
            sector_size,
        }
    }

    fn classic() -> LayoutRequest {
        request((1, 2, 3), (100, 0, 16), 2048, 512)
    }

    #[test]
    fn rootfs_fills_remaining_space() {
        let budget = compute_size_budget(&classic()).unwrap();
        assert_eq!(budget.rootfs_mib, 2048 - 16 - 100 - 1);
        assert_eq!(budget.slack_mib, 0);
        assert_eq!(budget.total_requested_mib, 2047);
    }

    #[test]
    fn classic_plan_sectors() {
        let (_, plan) = plan_layout(&classic()).unwrap();
        assert_eq!(plan.sectors_per_mib, 2048);

        let p: Vec<_> = plan
            .ranges
            .iter()
            .map(|r| (r.number, r.start_sector, r.span_sectors, r.type_code))
            .collect();
        assert_eq!(
            p,
            vec![
                (1, 2048, 204_799, 0x0C),
                (2, 206_848, 3_954_687, 0x83),
                (3, 4_161_536, 32_767, 0xA2),
            ]
        );
        // the loader ends on the image's last sector
        assert_eq!(plan.end_sector(), 2048 * 2048);
    }

    #[test]
    fn oversized_request_is_insufficient_space() {
        let req = request((1, 2, 3), (100, 10, 16), 100, 512);
        match compute_size_budget(&req) {
            Err(ImageError::InsufficientSpace {
                requested_mib,
                slack_mib,
                ..
            }) => {
                assert_eq!(requested_mib, 126);
                assert_eq!(slack_mib, -27);
            }
            other => panic!("expected InsufficientSpace, got {:?}", other),
        }
    }

    #[test]
    fn fixed_rootfs_keeps_slack() {
        let req = request((1, 2, 3), (100, 500, 16), 2048, 512);
        let budget = compute_size_budget(&req).unwrap();
        assert_eq!(budget.rootfs_mib, 500);
        assert_eq!(budget.slack_mib, 2048 - 616 - 1);
    }

    #[test]
    fn exactly_full_image_leaves_auto_rootfs_empty() {
        // no slack to hand out, so the auto-sized rootfs stays at 0
        let req = request((1, 2, 3), (100, 0, 16), 117, 512);
        let budget = compute_size_budget(&req).unwrap();
        assert_eq!(budget.rootfs_mib, 0);
        assert!(matches!(
            compute_partition_plan(&req.resolve(&budget)),
            Err(ImageError::EmptyPartition(r)) if r == "rootfs"
        ));
    }

    #[test]
    fn duplicate_number_is_rejected() {
        let req = request((1, 1, 3), (100, 200, 16), 2048, 512);
        assert!(matches!(
            compute_partition_plan(&req),
            Err(ImageError::DuplicatePartitionNumber { number: 1, .. })
        ));
    }

    #[test]
    fn out_of_range_number_is_rejected() {
        for bad in [0u8, 5] {
            let req = request((1, 2, bad), (100, 200, 16), 2048, 512);
            assert!(matches!(
                compute_partition_plan(&req),
                Err(ImageError::InvalidPartitionNumber { number, .. }) if number == bad
            ));
        }
    }

    #[test]
    fn gap_in_numbering_leaves_no_gap_on_disk() {
        let req = request((4, 1, 2), (100, 200, 16), 2048, 512);
        let (_, plan) = plan_layout(&req).unwrap();
        let numbers: Vec<u8> = plan.ranges.iter().map(|r| r.number).collect();
        assert_eq!(numbers, vec![1, 2, 4]);
        assert_eq!(plan.ranges[0].region, Region::Rootfs);
        assert_eq!(plan.ranges[1].region, Region::Loader);
        assert_eq!(plan.ranges[2].region, Region::Fat32);
        assert_eq!(plan.ranges[2].start_sector, 2048 + (200 + 16) * 2048);
    }

    #[test]
    fn large_sectors() {
        let req = request((1, 2, 3), (100, 0, 16), 2048, 8192);
        let (_, plan) = plan_layout(&req).unwrap();
        assert_eq!(plan.sectors_per_mib, 128);
        assert_eq!(plan.ranges[0].start_sector, 128);
        assert_eq!(plan.ranges[0].span_sectors, 100 * 128 - 1);
    }

    #[test]
    fn unsupported_sector_size() {
        let req = request((1, 2, 3), (100, 0, 16), 2048, 3000);
        assert!(matches!(
            plan_layout(&req),
            Err(ImageError::InvalidSectorSize(3000))
        ));
    }

    fn numbering() -> impl Strategy<Value = (u8, u8, u8)> {
        Just(vec![1u8, 2, 3, 4])
            .prop_shuffle()
            .prop_map(|v| (v[0], v[1], v[2]))
    }

    proptest! {
        #[test]
        fn budget_accounts_for_whole_image(
            fat32 in 1u64..512,
            rootfs in 0u64..4096,
            loader in 1u64..64,
            image in 1u64..8192,
        ) {
            let req = request((1, 2, 3), (fat32, rootfs, loader), image, 512);
            if let Ok(budget) = compute_size_budget(&req) {
                prop_assert!(budget.slack_mib >= 0);
                prop_assert_eq!(
                    budget.total_requested_mib as i64 + budget.slack_mib + RESERVED_MIB as i64,
                    image as i64
                );
                // resolving is stable: a resolved request budgets the same
                prop_assert_eq!(compute_size_budget(&req.resolve(&budget)).unwrap(), budget);
                prop_assert_eq!(compute_size_budget(&req).unwrap(), budget);
            }
        }

        #[test]
        fn ranges_are_contiguous(
            numbers in numbering(),
            fat32 in 1u64..512,
            rootfs in 1u64..2048,
            loader in 1u64..64,
            sector_idx in 0usize..5,
        ) {
            let sector_size = SECTOR_SIZES[sector_idx];
            let req = request(numbers, (fat32, rootfs, loader), 4096, sector_size);
            let plan = compute_partition_plan(&req).unwrap();

            prop_assert_eq!(plan.ranges.len(), 3);
            prop_assert_eq!(plan.ranges[0].start_sector, plan.sectors_per_mib);
            for pair in plan.ranges.windows(2) {
                prop_assert!(pair[0].number < pair[1].number);
                prop_assert_eq!(pair[1].start_sector, pair[0].end_sector() + 1);
            }
            for range in &plan.ranges {
                let mib = match range.region {
                    Region::Fat32 => fat32,
                    Region::Rootfs => rootfs,
                    Region::Loader => loader,
                };
                prop_assert_eq!(range.sector_count(), mib * plan.sectors_per_mib);
            }
        }

        #[test]
        fn plan_ignores_input_order(
            numbers in numbering(),
            sizes in (1u64..512, 1u64..512, 1u64..512),
        ) {
            let req = request(numbers, sizes, 4096, 512);
            let mut swapped = req;
            std::mem::swap(&mut swapped.fat32, &mut swapped.loader);
            std::mem::swap(&mut swapped.fat32, &mut swapped.rootfs);
            prop_assert_eq!(
                compute_partition_plan(&req).unwrap(),
                compute_partition_plan(&swapped).unwrap()
            );
        }
    }
}
