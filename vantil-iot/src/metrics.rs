use std::fs;
use std::path::Path;
use std::time::Duration;

use sysinfo::{Disks, System};
use tokio::time;

/// Window over which CPU load is measured on each pass.
const CPU_SAMPLE_WINDOW: Duration = Duration::from_secs(1);

const POWER_SUPPLY_DIR: &str = "/sys/class/power_supply";

#[derive(Clone, Debug, PartialEq)]
pub struct BatteryReading {
    pub percent: f64,
    pub plugged: bool,
}

/// One pass over the local system state.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricsSnapshot {
    pub cpu_usage_percent: f64,
    pub ram_usage_percent: f64,
    pub ram_used_mb: f64,
    pub disk_usage_percent: f64,
    pub battery: Option<BatteryReading>,
}

/// Samples CPU, memory, disk and battery state from the host.
pub struct MetricsSampler {
    system: System,
    disks: Disks,
}

impl MetricsSampler {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            disks: Disks::new_with_refreshed_list(),
        }
    }

    /// Take one snapshot of the host metrics.
    ///
    /// CPU load is measured between two refreshes a fixed window apart, so
    /// a call takes at least `CPU_SAMPLE_WINDOW` to complete.
    pub async fn sample(&mut self) -> MetricsSnapshot {
        self.system.refresh_cpu_usage();
        time::sleep(CPU_SAMPLE_WINDOW).await;
        self.system.refresh_cpu_usage();
        let cpu_usage_percent = round1(self.system.global_cpu_usage() as f64);

        self.system.refresh_memory();
        let used = self.system.used_memory();
        let total = self.system.total_memory();
        let ram_usage_percent = if total == 0 {
            0.0
        } else {
            round1(used as f64 / total as f64 * 100.0)
        };
        let ram_used_mb = round2(used as f64 / (1024.0 * 1024.0));

        self.disks.refresh(true);
        let disk_usage_percent = round1(root_disk_usage(&self.disks));

        let battery = read_battery(Path::new(POWER_SUPPLY_DIR));

        MetricsSnapshot {
            cpu_usage_percent,
            ram_usage_percent,
            ram_used_mb,
            disk_usage_percent,
            battery,
        }
    }
}

impl Default for MetricsSampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Usage of the disk mounted at `/`, falling back to the first listed disk
/// on hosts that don't expose a root mount.
fn root_disk_usage(disks: &Disks) -> f64 {
    let root = disks
        .list()
        .iter()
        .find(|disk| disk.mount_point() == Path::new("/"))
        .or_else(|| disks.list().first());

    match root {
        Some(disk) if disk.total_space() > 0 => {
            let used = disk.total_space() - disk.available_space();
            used as f64 / disk.total_space() as f64 * 100.0
        }
        _ => 0.0,
    }
}

/// Read charge state from the first battery supply under `dir`, if any.
fn read_battery(dir: &Path) -> Option<BatteryReading> {
    let entries = fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let supply = entry.path();
        let kind = fs::read_to_string(supply.join("type")).unwrap_or_default();
        if kind.trim() != "Battery" {
            continue;
        }

        let capacity = fs::read_to_string(supply.join("capacity")).ok()?;
        let percent = capacity.trim().parse::<f64>().ok()?;
        let status = fs::read_to_string(supply.join("status")).unwrap_or_default();

        return Some(BatteryReading {
            percent,
            plugged: plugged_from_status(status.trim()),
        });
    }
    None
}

/// Anything other than an active discharge counts as running on external
/// power.
fn plugged_from_status(status: &str) -> bool {
    status != "Discharging"
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_supply(dir: &Path, name: &str, kind: &str, files: &[(&str, &str)]) {
        let supply = dir.join(name);
        fs::create_dir_all(&supply).unwrap();
        fs::write(supply.join("type"), format!("{kind}\n")).unwrap();
        for (file, contents) in files {
            fs::write(supply.join(file), format!("{contents}\n")).unwrap();
        }
    }

    #[test]
    fn it_reads_a_discharging_battery() {
        let dir = tempfile::tempdir().unwrap();
        write_supply(
            dir.path(),
            "BAT0",
            "Battery",
            &[("capacity", "87"), ("status", "Discharging")],
        );

        let reading = read_battery(dir.path()).unwrap();
        assert_eq!(
            reading,
            BatteryReading {
                percent: 87.0,
                plugged: false
            }
        );
    }

    #[test]
    fn it_treats_a_full_battery_as_plugged() {
        let dir = tempfile::tempdir().unwrap();
        write_supply(
            dir.path(),
            "BAT0",
            "Battery",
            &[("capacity", "100"), ("status", "Full")],
        );

        let reading = read_battery(dir.path()).unwrap();
        assert!(reading.plugged);
    }

    #[test]
    fn it_skips_non_battery_supplies() {
        let dir = tempfile::tempdir().unwrap();
        write_supply(dir.path(), "AC", "Mains", &[("online", "1")]);

        assert_eq!(read_battery(dir.path()), None);
    }

    #[test]
    fn hosts_without_a_power_supply_have_no_battery() {
        let dir = tempfile::tempdir().unwrap();

        assert_eq!(read_battery(dir.path()), None);
    }

    #[test]
    fn charging_states_map_to_plugged() {
        assert!(plugged_from_status("Charging"));
        assert!(plugged_from_status("Not charging"));
        assert!(plugged_from_status("Full"));
        assert!(!plugged_from_status("Discharging"));
    }

    #[test]
    fn rounding_matches_the_wire_precision() {
        assert_eq!(round1(12.34), 12.3);
        assert_eq!(round1(55.049), 55.0);
        assert_eq!(round2(2048.0049), 2048.0);
        assert_eq!(round2(1023.999), 1024.0);
    }
}
