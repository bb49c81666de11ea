//! Benchmark for identity derivation and filter evaluation
//!
//! Both run for every device on every scan pass and on every uevent.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use node_disk_agent::hardware::discovery::{disk_guid, partition_guid, FilesystemInfo};
use node_disk_agent::hardware::filter::FilterConfig;
use node_disk_agent::{DiskInfo, PartitionInfo};

fn sample_disk(i: usize) -> DiskInfo {
    let name = format!("sd{}", (b'a' + (i % 26) as u8) as char);
    DiskInfo {
        dev_path: format!("/dev/{}", name),
        name,
        size_bytes: 4_000_787_030_016,
        physical_block_size_bytes: 4096,
        bus_path: format!("pci-0000:00:17.0-ata-{}", i),
        vendor: "ATA".to_string(),
        model: "ST4000NM0035".to_string(),
        serial_number: format!("ZC1{:05}", i),
        wwn: format!("0x5000c500{:08x}", i),
        partitions: (1..=4)
            .map(|p| PartitionInfo {
                name: format!("part{}", p),
                dev_path: format!("/dev/sd{}", p),
                part_uuid: format!("6f1c{:04x}-{:04x}", i, p),
                file_system: FilesystemInfo {
                    fs_type: "ext4".to_string(),
                    ..Default::default()
                },
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    }
}

fn bench_identity(c: &mut Criterion) {
    let mut group = c.benchmark_group("identity");
    let disks: Vec<DiskInfo> = (0..100).map(sample_disk).collect();
    group.throughput(Throughput::Elements(disks.len() as u64));

    group.bench_function("disk_guid", |b| {
        b.iter(|| {
            for disk in &disks {
                black_box(disk_guid(black_box("node-1"), disk));
            }
        });
    });

    group.bench_function("partition_guid", |b| {
        b.iter(|| {
            for part in disks.iter().flat_map(|d| d.partitions.iter()) {
                black_box(partition_guid(black_box("node-1"), part));
            }
        });
    });

    group.finish();
}

fn bench_filters(c: &mut Criterion) {
    let mut group = c.benchmark_group("filters");
    let disks: Vec<DiskInfo> = (0..100).map(sample_disk).collect();
    group.throughput(Throughput::Elements(disks.len() as u64));

    let config = FilterConfig {
        exclude_devices: vec!["/dev/sdz".to_string(), "/dev/nvme9*".to_string()],
        exclude_labels: vec!["COS_*".to_string(), "HARDDISK*".to_string()],
        auto_provision_devices: vec!["/dev/sd[a-m]".to_string()],
        ..Default::default()
    };
    let filters = config.filter_set();

    group.bench_function("exclude_disk", |b| {
        b.iter(|| {
            for disk in &disks {
                black_box(filters.apply_exclude_disk(disk));
            }
        });
    });

    group.bench_function("exclude_partition", |b| {
        b.iter(|| {
            for disk in &disks {
                for part in &disk.partitions {
                    black_box(filters.apply_exclude_partition(disk, part));
                }
            }
        });
    });

    group.bench_function("auto_provision", |b| {
        b.iter(|| {
            for disk in &disks {
                black_box(filters.apply_auto_provision(disk));
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_identity, bench_filters);
criterion_main!(benches);
