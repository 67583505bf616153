//! Persistent per-device volume/mute/soft-volume state, one JSON file per
//! `<adapter-addr>/<device-addr>`, written atomically (write to a temp file, `fsync`, rename)
//! so a crash mid-write never corrupts the last-known-good state.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::{pcm::ChannelVolume, Address, Result};

/// Volume state for one device, as persisted across daemon restarts.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct StoredVolume {
    pub channels: Vec<StoredChannelVolume>,
    pub soft_volume: bool,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct StoredChannelVolume {
    pub level_centidb: i16,
    pub muted: bool,
}

impl From<&[ChannelVolume]> for StoredVolume {
    fn from(channels: &[ChannelVolume]) -> Self {
        Self {
            channels: channels
                .iter()
                .map(|c| StoredChannelVolume { level_centidb: c.level_centidb, muted: c.muted })
                .collect(),
            soft_volume: false,
        }
    }
}

/// Converts a 0..=100 initial-volume percentage into centidecibels, per §8's boundary
/// requirement: 0 maps to the -96dB floor, 100 maps to the local maximum (clamped to +96dB).
pub fn percent_to_centidb(percent: u8) -> i16 {
    const FLOOR_CENTIDB: i32 = -9600;
    const CEIL_CENTIDB: i32 = 9600;
    if percent == 0 {
        return FLOOR_CENTIDB as i16;
    }
    let span = CEIL_CENTIDB - FLOOR_CENTIDB;
    (FLOOR_CENTIDB + (span * percent as i32) / 100).clamp(FLOOR_CENTIDB, CEIL_CENTIDB) as i16
}

/// Reads and writes [StoredVolume] files rooted under a state directory.
#[derive(Clone)]
pub struct VolumeStore {
    root: PathBuf,
}

impl VolumeStore {
    /// Creates a store rooted at `root` (typically `$STATE_DIRECTORY/bluealsa` or a compiled-in
    /// fallback path). The directory is created if missing.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, adapter_address: Address, device_address: Address) -> PathBuf {
        self.root.join(adapter_address.to_string()).join(device_address.to_string())
    }

    /// Loads the stored volume for a device, if one was ever persisted.
    pub async fn load(&self, adapter_address: Address, device_address: Address) -> Result<Option<StoredVolume>> {
        let path = self.path_for(adapter_address, device_address);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(|err| {
                crate::Error::with_message(
                    crate::ErrorKind::Internal(crate::InternalErrorKind::InvalidValue),
                    format!("malformed volume state at {}: {err}", path.display()),
                )
            })?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Persists `volume` for a device, replacing the file atomically.
    pub async fn store(&self, adapter_address: Address, device_address: Address, volume: &StoredVolume) -> Result<()> {
        let path = self.path_for(adapter_address, device_address);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        write_atomically(&path, &serde_json::to_vec_pretty(volume).expect("StoredVolume always serializes")).await
    }
}

async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        use tokio::io::AsyncWriteExt;
        file.write_all(bytes).await?;
        file.sync_all().await?;
    }
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_percent_is_the_floor() {
        assert_eq!(percent_to_centidb(0), -9600);
    }

    #[test]
    fn hundred_percent_is_the_ceiling() {
        assert_eq!(percent_to_centidb(100), 9600);
    }

    #[test]
    fn fifty_percent_is_roughly_midway() {
        let mid = percent_to_centidb(50);
        assert!(mid > -4800 && mid < 0, "expected {mid} to sit between floor and unity");
    }

    #[tokio::test]
    async fn round_trips_through_disk() {
        let dir = tempdir();
        let store = VolumeStore::new(dir.clone());
        let adapter = Address::new([0, 0, 0, 0, 0, 1]);
        let device = Address::new([0, 0, 0, 0, 0, 2]);
        let volume = StoredVolume {
            channels: vec![
                StoredChannelVolume { level_centidb: -2000, muted: false },
                StoredChannelVolume { level_centidb: -4000, muted: false },
            ],
            soft_volume: true,
        };
        store.store(adapter, device, &volume).await.unwrap();
        let loaded = store.load(adapter, device).await.unwrap();
        assert_eq!(loaded, Some(volume));
        let _ = tokio::fs::remove_dir_all(dir).await;
    }

    #[tokio::test]
    async fn missing_file_loads_as_none() {
        let dir = tempdir();
        let store = VolumeStore::new(dir.clone());
        let adapter = Address::new([0, 0, 0, 0, 0, 1]);
        let device = Address::new([0, 0, 0, 0, 0, 3]);
        assert_eq!(store.load(adapter, device).await.unwrap(), None);
        let _ = tokio::fs::remove_dir_all(dir).await;
    }

    fn tempdir() -> PathBuf {
        std::env::temp_dir().join(format!("bluealsa-test-{}", std::process::id()))
    }
}
