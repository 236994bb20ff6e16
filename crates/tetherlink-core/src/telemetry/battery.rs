//! sysfs 电量读取

use std::fs;
use std::path::{Path, PathBuf};

use log::debug;

use super::BatterySource;

const POWER_SUPPLY_ROOT: &str = "/sys/class/power_supply";

/// `/sys/class/power_supply` 下第一个 `type == Battery` 的设备
pub struct SysfsBattery {
    path: Option<PathBuf>,
}

impl SysfsBattery {
    pub fn new() -> Self {
        Self::with_root(POWER_SUPPLY_ROOT)
    }

    pub fn with_root(root: impl AsRef<Path>) -> Self {
        let path = find_battery(root.as_ref());
        debug!("Battery supply: {:?}", path);
        Self { path }
    }

    pub fn is_present(&self) -> bool {
        self.path.is_some()
    }
}

impl Default for SysfsBattery {
    fn default() -> Self {
        Self::new()
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

fn find_battery(root: &Path) -> Option<PathBuf> {
    let mut entries: Vec<PathBuf> = fs::read_dir(root)
        .ok()?
        .flatten()
        .map(|e| e.path())
        .collect();
    entries.sort();

    entries
        .into_iter()
        .find(|dir| read_trimmed(&dir.join("type")).as_deref() == Some("Battery"))
}

impl BatterySource for SysfsBattery {
    fn read_percent(&self) -> Option<i32> {
        let path = self.path.as_ref()?;
        read_trimmed(&path.join("capacity"))?.parse::<i32>().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_supply(root: &Path, name: &str, kind: &str, capacity: Option<&str>) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("type"), format!("{kind}\n")).unwrap();
        if let Some(cap) = capacity {
            fs::write(dir.join("capacity"), format!("{cap}\n")).unwrap();
        }
    }

    #[test]
    fn test_reads_battery_capacity() {
        let root = std::env::temp_dir().join(format!("tetherlink-ps-{}", uuid::Uuid::new_v4()));
        fake_supply(&root, "AC", "Mains", None);
        fake_supply(&root, "BAT0", "Battery", Some("87"));

        let battery = SysfsBattery::with_root(&root);
        assert!(battery.is_present());
        assert_eq!(battery.read_percent(), Some(87));

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn test_no_battery() {
        let root = std::env::temp_dir().join(format!("tetherlink-ps-{}", uuid::Uuid::new_v4()));
        fake_supply(&root, "AC", "Mains", None);

        let battery = SysfsBattery::with_root(&root);
        assert!(!battery.is_present());
        assert_eq!(battery.read_percent(), None);

        let _ = fs::remove_dir_all(root);
    }
}
