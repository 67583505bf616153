//! Registration of this daemon's BlueZ-facing endpoints: A2DP media endpoints, HSP/HFP RFCOMM
//! profiles, and the oFono hands-free audio agent.

pub mod hfp_profile;
pub mod media_endpoint;
pub mod ofono;

use uuid::Uuid;

use crate::{rfcomm::slc, transport::TransportKind};

/// A telephony profile/role pairing this daemon can register with BlueZ, and the UUID/channel
/// each one is conventionally assigned.
#[derive(Clone, Copy, Debug)]
pub struct TelephonyProfileDef {
    pub uuid: Uuid,
    pub name: &'static str,
    pub channel: u16,
    pub kind: TransportKind,
    pub role: slc::Role,
    pub profile: slc::Profile,
}

/// HFP Audio Gateway: this daemon answers as the car-kit/headset when a phone connects to it as
/// hands-free unit. UUID `0000111f-0000-1000-8000-00805f9b34fb`, channel 13.
pub const HFP_AG: TelephonyProfileDef = TelephonyProfileDef {
    uuid: Uuid::from_bytes([0x00, 0x00, 0x11, 0x1f, 0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0x80, 0x5f, 0x9b, 0x34, 0xfb]),
    name: "Hands-Free Audio Gateway",
    channel: 13,
    kind: TransportKind::HfpAg,
    role: slc::Role::AudioGateway,
    profile: slc::Profile::Hfp,
};

/// HFP Hands-Free: this daemon is the hands-free unit connecting to a phone's audio gateway.
/// UUID `0000111e-0000-1000-8000-00805f9b34fb`, channel 7.
pub const HFP_HF: TelephonyProfileDef = TelephonyProfileDef {
    uuid: Uuid::from_bytes([0x00, 0x00, 0x11, 0x1e, 0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0x80, 0x5f, 0x9b, 0x34, 0xfb]),
    name: "Hands-Free",
    channel: 7,
    kind: TransportKind::HfpHf,
    role: slc::Role::HandsFree,
    profile: slc::Profile::Hfp,
};

/// HSP Audio Gateway. UUID `00001112-0000-1000-8000-00805f9b34fb`, channel 12.
pub const HSP_AG: TelephonyProfileDef = TelephonyProfileDef {
    uuid: Uuid::from_bytes([0x00, 0x00, 0x11, 0x12, 0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0x80, 0x5f, 0x9b, 0x34, 0xfb]),
    name: "Headset Audio Gateway",
    channel: 12,
    kind: TransportKind::HspAg,
    role: slc::Role::AudioGateway,
    profile: slc::Profile::Hsp,
};

/// HSP Headset. UUID `00001108-0000-1000-8000-00805f9b34fb`, channel 6.
pub const HSP_HS: TelephonyProfileDef = TelephonyProfileDef {
    uuid: Uuid::from_bytes([0x00, 0x00, 0x11, 0x08, 0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0x80, 0x5f, 0x9b, 0x34, 0xfb]),
    name: "Headset",
    channel: 6,
    kind: TransportKind::HspHs,
    role: slc::Role::HandsFree,
    profile: slc::Profile::Hsp,
};
