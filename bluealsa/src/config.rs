//! Process-wide daemon configuration.
//!
//! A single [Config] is built once at startup (by the binary, from its CLI flags) and handed
//! down by reference to every component that needs it, rather than read back out of globals.

use std::{path::PathBuf, time::Duration};

/// Bluetooth profile this daemon should register and service.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Profile {
    /// A2DP Source (this host plays audio to a peer, e.g. a speaker or headset).
    A2dpSource,
    /// A2DP Sink (this host records audio from a peer, e.g. a phone).
    A2dpSink,
    /// Hands-Free Profile, Audio Gateway role.
    HfpAg,
    /// Hands-Free Profile, Hands-Free role.
    HfpHf,
    /// Headset Profile, Audio Gateway role.
    HspAg,
    /// Headset Profile, Headset role.
    HspHs,
    /// BLE-MIDI GATT service.
    Midi,
}

/// A2DP codec preference as given on the command line, most to least preferred.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum A2dpCodec {
    /// SBC, mandatory per the A2DP specification.
    Sbc,
    /// MPEG-2/4 AAC.
    Aac,
    /// Qualcomm aptX.
    Aptx,
    /// Sony LDAC.
    Ldac,
    /// LC3plus.
    Lc3plus,
}

/// Process-wide configuration, built once at startup from the command line.
#[derive(Clone, Debug)]
pub struct Config {
    /// D-Bus bus name suffix this daemon registers as (`org.bluealsa<suffix>`).
    pub dbus_suffix: String,
    /// Adapters to service; empty means "all adapters present at startup and hot-plugged later".
    pub adapters: Vec<String>,
    /// Profiles to register. Empty defaults to A2DP Source + HFP Audio Gateway.
    pub profiles: Vec<Profile>,
    /// A2DP codecs to offer, in preference order. Empty means "all supported, built-in order".
    pub a2dp_codecs: Vec<A2dpCodec>,
    /// Initial volume, in centidecibels, applied to PCMs with no stored volume. See
    /// [crate::storage::percent_to_centidb] for the CLI's 0-100% scale this is built from.
    pub initial_volume: i16,
    /// How long an A2DP source transport is kept alive with no PCM client connected before the
    /// underlying BlueZ transport is released. Zero releases immediately.
    pub keep_alive: Duration,
    /// Real-time scheduling priority for encoder/decoder worker tasks, if any (`SCHED_FIFO`).
    pub io_rt_priority: Option<i32>,
    /// Force A2DP Sink streams to be mixed down to mono.
    pub a2dp_force_mono: bool,
    /// Force the local A2DP Sink PCM format to 44100 Hz / 16-bit / stereo ("audio CD" format).
    pub a2dp_force_audio_cd: bool,
    /// SBC encoder quality, 0 (fastest) to 4 (best); maps to bitpool/subband/blocks selection.
    pub sbc_quality: u8,
    /// Work around `hci_conn` staying allocated after an RFCOMM link loss on some controllers
    /// by explicitly disconnecting the ACL link when the SLC drops unexpectedly.
    pub rfcomm_link_lost_quirk: bool,
    /// Directory PCM FIFOs are created under, conventionally `/var/run/bluealsa`.
    pub state_dir: PathBuf,
    /// Group id FIFOs are `chown`ed to, if any (typically the `audio` group).
    pub audio_group_gid: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dbus_suffix: String::new(),
            adapters: Vec::new(),
            profiles: vec![Profile::A2dpSource, Profile::HfpAg],
            a2dp_codecs: Vec::new(),
            initial_volume: crate::storage::percent_to_centidb(100),
            keep_alive: Duration::from_secs(5),
            io_rt_priority: None,
            a2dp_force_mono: false,
            a2dp_force_audio_cd: false,
            sbc_quality: 2,
            rfcomm_link_lost_quirk: true,
            state_dir: PathBuf::from("/var/run/bluealsa"),
            audio_group_gid: None,
        }
    }
}

impl Config {
    /// D-Bus service name this daemon will request (`org.bluealsa` or `org.bluealsa.<suffix>`).
    pub fn service_name(&self) -> String {
        if self.dbus_suffix.is_empty() {
            "org.bluealsa".to_string()
        } else {
            format!("org.bluealsa.{}", self.dbus_suffix)
        }
    }

    /// Whether the given adapter name should be serviced by this daemon instance.
    pub fn services_adapter(&self, name: &str) -> bool {
        self.adapters.is_empty() || self.adapters.iter().any(|a| a == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_adapter_list_services_everything() {
        let cfg = Config::default();
        assert!(cfg.services_adapter("hci0"));
        assert!(cfg.services_adapter("hci1"));
    }

    #[test]
    fn explicit_adapter_list_restricts() {
        let mut cfg = Config::default();
        cfg.adapters = vec!["hci0".to_string()];
        assert!(cfg.services_adapter("hci0"));
        assert!(!cfg.services_adapter("hci1"));
    }

    #[test]
    fn service_name_appends_suffix() {
        let mut cfg = Config::default();
        assert_eq!(cfg.service_name(), "org.bluealsa");
        cfg.dbus_suffix = "usb0".to_string();
        assert_eq!(cfg.service_name(), "org.bluealsa.usb0");
    }
}
