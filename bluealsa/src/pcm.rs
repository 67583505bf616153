//! A single PCM endpoint exposed by a Transport: the FIFO a local client reads or writes, the
//! format descriptor BlueZ/the codec negotiated, and per-channel volume/mute state.

use std::{
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};
use tokio::{fs::File, sync::Mutex};

use crate::{Error, ErrorKind, Result};

/// Direction of data flow through a PCM endpoint, from the local client's point of view.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PcmMode {
    /// Client writes PCM into the FIFO; BlueALSA encodes and sends it to the peer.
    Source,
    /// Client reads PCM from the FIFO; BlueALSA decoded it from the peer.
    Sink,
}

/// Sample format, packed the way BlueALSA's 16-bit format descriptor encodes it: signedness,
/// bit width, byte count and endianness.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Format {
    pub signed: bool,
    pub width_bits: u8,
    pub bytes: u8,
    pub big_endian: bool,
}

impl Format {
    /// Signed 16-bit little-endian, the only format BlueALSA's codecs currently produce/consume.
    pub const S16LE: Format = Format { signed: true, width_bits: 16, bytes: 2, big_endian: false };

    /// 16-bit descriptor matching the upstream `BA_FORMAT_` bit layout: bit 15 = signed,
    /// bits 14..=8 = width, bits 7..=4 = bytes, bit 3 = big-endian.
    pub fn descriptor(&self) -> u16 {
        ((self.signed as u16) << 15)
            | ((self.width_bits as u16 & 0x7f) << 8)
            | ((self.bytes as u16 & 0xf) << 4)
            | ((self.big_endian as u16) << 3)
    }
}

/// Per-channel volume: level in centidecibels below full scale (0 = full scale, negative =
/// attenuated) plus an independent mute flag.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ChannelVolume {
    pub level_centidb: i16,
    pub muted: bool,
}

/// Volume state for a PCM endpoint; mono endpoints only ever populate channel 0.
#[derive(Clone, Debug)]
pub struct Volume {
    pub channels: Vec<ChannelVolume>,
    /// Whether volume changes apply at the codec/mixer level (`true`) or are only mirrored from
    /// the peer's native volume control and not otherwise applied (`false`).
    pub soft: bool,
    /// Ceiling the Bluetooth-side 0..=15 gain is allowed to reach when mirroring in native mode.
    pub max_bt_volume: u8,
}

impl Volume {
    pub fn new(channels: usize, initial_level_centidb: i16, soft: bool) -> Self {
        Self {
            channels: vec![ChannelVolume { level_centidb: initial_level_centidb, muted: false }; channels],
            soft,
            max_bt_volume: 15,
        }
    }

    /// Converts a 0..=127 BlueALSA host volume level into the Bluetooth 0..=15 gain range used
    /// by `+VGM`/`+VGS` and AVRCP absolute volume.
    pub fn host_to_bt_gain(host_level: u8) -> u8 {
        ((host_level as u32 * 15 + 63) / 127) as u8
    }

    /// Converts a Bluetooth 0..=15 gain back into the 0..=127 host volume range.
    pub fn bt_gain_to_host(bt_gain: u8) -> u8 {
        ((bt_gain.min(15) as u32 * 127) / 15) as u8
    }
}

/// One PCM endpoint of a Transport: a FIFO plus its negotiated format and volume state.
pub struct PcmEndpoint {
    mode: PcmMode,
    format: Format,
    channels: u8,
    sample_rate: u32,
    delay_ds: u16,
    volume: Mutex<Volume>,
    fifo_path: Mutex<Option<PathBuf>>,
    active: Mutex<bool>,
}

impl PcmEndpoint {
    pub fn new(mode: PcmMode, format: Format, channels: u8, sample_rate: u32, initial_level_centidb: i16) -> Self {
        Self {
            mode,
            format,
            channels,
            sample_rate,
            delay_ds: 0,
            volume: Mutex::new(Volume::new(channels as usize, initial_level_centidb, false)),
            fifo_path: Mutex::new(None),
            active: Mutex::new(false),
        }
    }

    pub fn mode(&self) -> PcmMode {
        self.mode
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn delay_tenths_ms(&self) -> u16 {
        self.delay_ds
    }

    pub async fn volume(&self) -> Volume {
        self.volume.lock().await.clone()
    }

    pub async fn set_volume(&self, volume: Volume) {
        *self.volume.lock().await = volume;
    }

    pub async fn is_active(&self) -> bool {
        *self.active.lock().await
    }

    pub async fn set_active(&self, active: bool) {
        *self.active.lock().await = active;
    }

    /// Creates the FIFO special file at `path` with mode 0660, owned by `group` if given, and
    /// records it as this endpoint's attachment point. Fails if a client is already attached.
    pub async fn attach_fifo(&self, path: &Path, group_gid: Option<u32>) -> Result<()> {
        let mut fifo_path = self.fifo_path.lock().await;
        if fifo_path.is_some() {
            return Err(Error::new(ErrorKind::DeviceBusy));
        }
        let cpath = std::ffi::CString::new(path.as_os_str().to_string_lossy().as_bytes())
            .map_err(|_| Error::with_message(ErrorKind::Internal(crate::InternalErrorKind::InvalidValue), "path contains a NUL byte"))?;
        if unsafe { libc::mkfifo(cpath.as_ptr(), 0o660) } != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::AlreadyExists {
                return Err(err.into());
            }
        }
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660)).await?;
        if let Some(gid) = group_gid {
            let cpath = std::ffi::CString::new(path.as_os_str().to_string_lossy().as_bytes()).unwrap();
            unsafe { libc::chown(cpath.as_ptr(), u32::MAX, gid) };
        }
        *fifo_path = Some(path.to_path_buf());
        drop(fifo_path);
        *self.active.lock().await = true;
        Ok(())
    }

    /// Unlinks the FIFO and clears the attachment, making the endpoint available again.
    pub async fn detach_fifo(&self) -> Result<()> {
        let mut fifo_path = self.fifo_path.lock().await;
        if let Some(path) = fifo_path.take() {
            let _ = tokio::fs::remove_file(&path).await;
        }
        *self.active.lock().await = false;
        Ok(())
    }

    pub async fn fifo_path(&self) -> Option<PathBuf> {
        self.fifo_path.lock().await.clone()
    }

    /// Opens the attached FIFO for the direction implied by [PcmEndpoint::mode]: read for a
    /// client reading decoded PCM (our [PcmMode::Sink]), write for a client feeding PCM in
    /// (our [PcmMode::Source]). BlueALSA opens the opposite end from the client.
    pub async fn open_for_daemon(&self) -> Result<File> {
        let path = self.fifo_path.lock().await.clone().ok_or_else(|| Error::new(ErrorKind::DeviceNotFound))?;
        let file = match self.mode {
            PcmMode::Source => File::open(&path).await?,
            PcmMode::Sink => tokio::fs::OpenOptions::new().write(true).open(&path).await?,
        };
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_descriptor_matches_bit_layout() {
        let d = Format::S16LE.descriptor();
        assert_eq!(d & 0x8000, 0x8000, "signed bit");
        assert_eq!((d >> 8) & 0x7f, 16, "width bits");
        assert_eq!((d >> 4) & 0xf, 2, "byte count");
        assert_eq!((d >> 3) & 1, 0, "little endian");
    }

    #[test]
    fn bt_gain_round_trips_approximately() {
        for host in [0u8, 32, 64, 96, 127] {
            let bt = Volume::host_to_bt_gain(host);
            assert!(bt <= 15);
            let back = Volume::bt_gain_to_host(bt);
            assert!((back as i32 - host as i32).abs() <= 5, "host={host} bt={bt} back={back}");
        }
    }

    #[test]
    fn max_bt_gain_is_full_scale() {
        assert_eq!(Volume::host_to_bt_gain(127), 15);
        assert_eq!(Volume::bt_gain_to_host(15), 127);
    }
}
