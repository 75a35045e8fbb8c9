//! Property-Based Tests for archstrap
//!
//! These tests verify:
//! - Enum string round-trips (parse → to_string → parse)
//! - Disk layout invariants (swap sizing, capacity accounting, home preservation)
//! - Idempotence of the system file edits made inside the installed root

use proptest::prelude::*;
use std::path::{Path, PathBuf};

use archstrap::config::{ConfigLayer, SwapSize};
use archstrap::engine::planner::{swap_size_gib, PartitionRole, GIB, GPT_RESERVED_BYTES, MIN_SWAP_GIB};
use archstrap::engine::{partition_path, plan, PlanRequest};
use archstrap::steps::{add_kernel_param, add_resume_hook, enable_locale};
use archstrap::types::{Bootloader, Filesystem, GpuDriver, HomeChoice};

// =============================================================================
// Enum Property Tests
// =============================================================================

fn filesystem_strategy() -> impl Strategy<Value = Filesystem> {
    prop_oneof![
        Just(Filesystem::Ext4),
        Just(Filesystem::Btrfs),
        Just(Filesystem::Xfs),
    ]
}

fn bootloader_strategy() -> impl Strategy<Value = Bootloader> {
    prop_oneof![Just(Bootloader::Grub), Just(Bootloader::SystemdBoot)]
}

fn gpu_strategy() -> impl Strategy<Value = GpuDriver> {
    prop_oneof![
        Just(GpuDriver::Auto),
        Just(GpuDriver::Nvidia),
        Just(GpuDriver::Amd),
        Just(GpuDriver::Intel),
        Just(GpuDriver::None),
    ]
}

proptest! {
    /// Filesystem: to_string → parse round-trip is identity
    #[test]
    fn filesystem_roundtrip(fs in filesystem_strategy()) {
        let parsed: Filesystem = fs.to_string().parse().expect("Should parse");
        prop_assert_eq!(fs, parsed);
    }

    /// Bootloader: parsing ignores case
    #[test]
    fn bootloader_parse_is_case_insensitive(bl in bootloader_strategy()) {
        let parsed: Bootloader = bl.to_string().to_uppercase().parse().expect("Should parse");
        prop_assert_eq!(bl, parsed);
    }

    /// GpuDriver: config file value reaches the layer unchanged
    #[test]
    fn gpu_from_config_file(gpu in gpu_strategy()) {
        let layer = ConfigLayer::from_kv_str(&format!("GPU={}\n", gpu)).expect("Should parse");
        prop_assert_eq!(layer.gpu, Some(gpu));
    }
}

// =============================================================================
// Disk Layout Property Tests
// =============================================================================

fn disk_strategy() -> impl Strategy<Value = PathBuf> {
    prop_oneof![
        "sd[a-z]".prop_map(|d| PathBuf::from(format!("/dev/{}", d))),
        "vd[a-z]".prop_map(|d| PathBuf::from(format!("/dev/{}", d))),
        (0u8..4).prop_map(|n| PathBuf::from(format!("/dev/nvme{}n1", n))),
        (0u8..2).prop_map(|n| PathBuf::from(format!("/dev/mmcblk{}", n))),
    ]
}

fn request(disk: PathBuf, ram_bytes: u64, efi_gib: u64, root_gib: u64, home: HomeChoice) -> PlanRequest {
    PlanRequest {
        disk,
        ram_bytes,
        efi_gib,
        root_gib,
        swap: SwapSize::Auto,
        filesystem: Filesystem::Ext4,
        existing_partition4: home.preserves(),
        home,
    }
}

proptest! {
    /// Automatic swap is RAM rounded up to whole GiB, never below the floor
    #[test]
    fn swap_covers_ram(ram_bytes in 1u64..(512 * GIB)) {
        let swap = swap_size_gib(ram_bytes, SwapSize::Auto);
        prop_assert!(swap * GIB >= ram_bytes);
        prop_assert!(swap >= MIN_SWAP_GIB);
        prop_assert_eq!(swap, ram_bytes.div_ceil(GIB).max(MIN_SWAP_GIB));
    }

    /// An explicit swap size wins over RAM
    #[test]
    fn swap_override_is_exact(ram_bytes in 1u64..(512 * GIB), gib in 1u64..256) {
        prop_assert_eq!(swap_size_gib(ram_bytes, SwapSize::Gib(gib)), gib);
    }

    /// Slot sizes account for the whole disk when it fits the fixed slots
    #[test]
    fn layout_fills_disk(
        ram_gib in 1u64..128,
        efi_gib in 1u64..4,
        root_gib in 16u64..256,
        spare in 0u64..(4096 * GIB),
    ) {
        let layout = plan(&request(PathBuf::from("/dev/sda"), ram_gib * GIB, efi_gib, root_gib, HomeChoice::Wipe))
            .expect("valid plan");
        let disk_bytes = layout.fixed_bytes() + GPT_RESERVED_BYTES + spare;

        let sizes = layout.resolved_sizes(disk_bytes);
        prop_assert_eq!(sizes.len(), 4);
        prop_assert_eq!(sizes.iter().sum::<u64>() + GPT_RESERVED_BYTES, disk_bytes);
        prop_assert_eq!(sizes[3], spare);
    }

    /// A kept home partition is never part of the mutation set
    #[test]
    fn keep_excludes_home(disk in disk_strategy(), ram_gib in 1u64..64) {
        let layout = plan(&request(disk, ram_gib * GIB, 1, 64, HomeChoice::Keep)).expect("valid plan");
        prop_assert!(layout.preserve_existing);
        prop_assert!(layout.mutated().all(|p| p.role != PartitionRole::Home));
        prop_assert_eq!(layout.mutated().count(), 3);
    }

    /// Keeping a home partition that does not exist is rejected
    #[test]
    fn keep_requires_existing_home(disk in disk_strategy()) {
        let mut req = request(disk, 8 * GIB, 1, 64, HomeChoice::Keep);
        req.existing_partition4 = false;
        prop_assert!(plan(&req).is_err());
    }

    /// Partition paths stay on the disk and use the kernel's naming
    #[test]
    fn partition_paths_follow_kernel_naming(disk in disk_strategy(), index in 1u32..5) {
        let part = partition_path(&disk, index);
        let disk_str = disk.display().to_string();
        let part_str = part.display().to_string();
        prop_assert!(part_str.starts_with(&disk_str));
        prop_assert!(part_str.ends_with(&index.to_string()));
        let infix = &part_str[disk_str.len()..part_str.len() - 1];
        let expected = if disk_str.ends_with(|c: char| c.is_ascii_digit()) { "p" } else { "" };
        prop_assert_eq!(infix, expected);
    }
}

#[test]
fn partition_path_examples() {
    assert_eq!(partition_path(Path::new("/dev/sda"), 2), PathBuf::from("/dev/sda2"));
    assert_eq!(partition_path(Path::new("/dev/nvme0n1"), 4), PathBuf::from("/dev/nvme0n1p4"));
}

// =============================================================================
// System File Edit Property Tests
// =============================================================================

fn uuid_strategy() -> impl Strategy<Value = String> {
    "[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}"
}

fn hooks_strategy() -> impl Strategy<Value = Vec<&'static str>> {
    proptest::sample::subsequence(
        vec!["base", "udev", "autodetect", "modconf", "kms", "keyboard", "block", "filesystems", "fsck"],
        0..=9,
    )
}

proptest! {
    /// Re-applying the resume parameter leaves exactly one, the newest
    #[test]
    fn kernel_param_is_replaced(old in uuid_strategy(), new in uuid_strategy()) {
        let start = "GRUB_TIMEOUT=5\nGRUB_CMDLINE_LINUX_DEFAULT=\"loglevel=3 quiet\"\n";
        let once = add_kernel_param(start, &format!("resume=UUID={}", old));
        let twice = add_kernel_param(&once, &format!("resume=UUID={}", new));

        prop_assert_eq!(twice.matches("resume=").count(), 1);
        let expected_param = format!("resume=UUID={}", new);
        prop_assert!(twice.contains(&expected_param));
        prop_assert!(twice.contains("loglevel=3 quiet"));
        prop_assert_eq!(add_kernel_param(&twice, &expected_param), twice);
    }

    /// The resume hook is added once, after filesystems when present
    #[test]
    fn resume_hook_is_idempotent(hooks in hooks_strategy()) {
        let conf = format!("MODULES=()\nHOOKS=({})\n", hooks.join(" "));
        let once = add_resume_hook(&conf);
        prop_assert_eq!(add_resume_hook(&once), once.clone());

        let line = once.lines().find(|l| l.starts_with("HOOKS=(")).expect("hooks line");
        let words: Vec<&str> = line
            .trim_start_matches("HOOKS=(")
            .trim_end_matches(')')
            .split_whitespace()
            .collect();
        prop_assert_eq!(words.iter().filter(|w| **w == "resume").count(), 1);
        if let Some(fs) = words.iter().position(|w| *w == "filesystems") {
            prop_assert_eq!(words[fs + 1], "resume");
        }
    }

    /// Enabling a locale twice is the same as enabling it once
    #[test]
    fn locale_enable_is_idempotent(lang in "[a-z]{2}_[A-Z]{2}", commented in any::<bool>()) {
        let locale = format!("{}.UTF-8", lang);
        let entry = format!("{} UTF-8", locale);
        let start = if commented { format!("# header\n#{}\n", entry) } else { "# header\n".to_string() };

        let once = enable_locale(&start, &locale);
        prop_assert_eq!(enable_locale(&once, &locale), once.clone());
        prop_assert_eq!(once.lines().filter(|l| *l == entry).count(), 1);
    }
}
