//! # BlueALSA — transport runtime for Bluetooth audio and telephony
//!
//! This crate implements the object graph and I/O loops that bridge the
//! local audio stack to Bluetooth audio and telephony profiles: A2DP media
//! streaming, HSP/HFP telephony, and BLE-MIDI. It owns profile and media
//! endpoint registration with the system Bluetooth daemon (BlueZ), drives
//! the resulting transport sockets, performs codec encode/decode, paces
//! media frames in real time, and exposes per-device PCM streams to local
//! clients through a D-Bus manager object.
//!
//! The crate is organized around four tightly coupled pieces:
//!
//! * the [adapter](Adapter)/[device](Device) registry and the [Transport]
//!   lifecycle and thread manager (acquire/release of the Bluetooth
//!   socket, spawn/stop of encoder and decoder workers);
//! * the A2DP media I/O loop with [RTP](rtp) framing/pacing and codec
//!   negotiation through [media endpoints](profile::media_endpoint);
//! * the HFP service-level-connection state machine driven over
//!   [RFCOMM](rfcomm) and the associated SCO codec-selection procedure;
//! * the [controller] that exposes PCM and RFCOMM objects over D-Bus to
//!   local clients.
//!
//! This crate depends on the [tokio] asynchronous runtime and on a running
//! instance of the system Bluetooth daemon reachable over D-Bus.

#![warn(missing_docs)]

#[cfg(not(target_os = "linux"))]
compile_error!("BlueALSA only supports the Linux operating system.");

use dbus::{
    arg::{prop_cast, AppendAll, PropMap, RefArg, Variant},
    nonblock::{Proxy, SyncConnection},
    Path,
};
use dbus_crossroads::{Context, Crossroads};
use futures::Future;
use hex::FromHex;
use macaddr::MacAddr6;
use num_derive::FromPrimitive;
use std::{collections::HashMap, marker::PhantomData, sync::Arc, time::Duration};
use std::{
    convert::TryInto,
    fmt::{self, Debug, Display, Formatter},
    ops::{Deref, DerefMut},
    str::FromStr,
};
use strum::{Display, EnumString};
use tokio::task::JoinError;

pub(crate) const SERVICE_NAME: &str = "org.bluez";
pub(crate) const OFONO_SERVICE_NAME: &str = "org.ofono";
pub(crate) const ERR_PREFIX: &str = "org.bluez.Error.";
pub(crate) const TIMEOUT: Duration = Duration::from_secs(120);

/// Builds the D-Bus object path prefix under which this daemon instance publishes objects.
macro_rules! publish_path {
    ($path:expr) => {
        concat!("/org/bluealsa/", $path)
    };
}
pub(crate) use publish_path;

macro_rules! cr_property {
    ($ib:expr, $dbus_name:expr, $obj:ident => $get:block) => {
        $ib.property($dbus_name).get(|ctx, $obj| {
            let value = $get;
            log::trace!("{}: {}.{} = {:?}", ctx.path(), ctx.interface(), &$dbus_name, &value);
            match value {
                Some(v) => Ok(v),
                None => Err(dbus_crossroads::MethodErr::no_property($dbus_name)),
            }
        })
    };
}
pub(crate) use cr_property;

macro_rules! read_prop {
    ($dict:expr, $name:expr, $type:ty) => {
        dbus::arg::prop_cast::<$type>($dict, $name)
            .ok_or_else(|| dbus_crossroads::MethodErr::invalid_arg($name))?
            .to_owned()
    };
}
pub(crate) use read_prop;

macro_rules! read_opt_prop {
    ($dict:expr, $name:expr, $type:ty) => {
        dbus::arg::prop_cast::<$type>($dict, $name).cloned()
    };
}
pub(crate) use read_opt_prop;

pub mod adapter;
pub mod adv;
pub mod codec;
pub mod config;
pub mod controller;
pub mod device;
pub mod gatt;
pub mod mixer;
pub mod pcm;
pub mod profile;
pub mod registry;
pub mod rfcomm;
pub mod rtp;
mod session;
mod sock;
mod storage;
mod sys;
pub mod transport;

pub use crate::{
    adapter::Adapter, device::Device, registry::Registry, session::Session,
    storage::{percent_to_centidb, VolumeStore},
};
pub(crate) use crate::session::SessionInner;

#[doc(no_inline)]
pub use uuid::Uuid;

/// BlueALSA error.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Error {
    /// Error kind.
    pub kind: ErrorKind,
    /// Detailed error message, when available.
    pub message: String,
}

/// BlueALSA error kind.
///
/// Mirrors the error taxonomy of the transport runtime (semantic, not
/// syntactic): transient I/O is handled inline by the I/O loops and never
/// surfaces here; these are the conditions the controller and profile
/// callbacks must turn into a structured reply.
#[derive(Clone, Debug, displaydoc::Display, Eq, PartialEq, EnumString)]
#[non_exhaustive]
pub enum ErrorKind {
    /// requested PCM is already owned by another client
    DeviceBusy,
    /// requested device or transport does not exist
    DeviceNotFound,
    /// operation attempted by a client that does not own the PCM
    Forbidden,
    /// operation is not supported by this transport or codec
    NotSupported,
    /// the peer rejected the request
    Rejected,
    /// codec selection did not complete before the deadline
    CodecSelectionTimedOut,
    /// malformed protocol message: {0}
    #[strum(disabled)]
    Protocol(String),
    /// invalid Bluetooth address: {0}
    #[strum(disabled)]
    InvalidAddress(String),
    /// invalid Bluetooth adapter name: {0}
    #[strum(disabled)]
    InvalidName(String),
    /// the target object was either not present or removed
    #[strum(disabled)]
    NotFound,
    /// the well-known bus name is already owned by another process
    BusNameTaken,
    /// internal error: {0}
    #[strum(disabled)]
    Internal(InternalErrorKind),
}

/// Internal error kind.
///
/// Most likely caused by incompatibilities between this daemon and the
/// version of the Bluetooth daemon it talks to.
#[derive(Clone, Debug, displaydoc::Display, Eq, PartialEq)]
#[non_exhaustive]
pub enum InternalErrorKind {
    /// invalid UUID: {0}
    InvalidUuid(String),
    /// invalid value
    InvalidValue,
    /// key {0} is missing
    MissingKey(String),
    /// join error
    JoinError,
    /// IO error: {0}
    Io(std::io::ErrorKind),
    /// D-Bus error: {0}
    DBus(String),
    /// lost connection to D-Bus
    DBusConnectionLost,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self { kind, message: String::new() }
    }

    pub(crate) fn with_message(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", &self.kind)
        } else {
            write!(f, "{}: {}", &self.kind, &self.message)
        }
    }
}

impl std::error::Error for Error {}

impl From<dbus::Error> for Error {
    fn from(err: dbus::Error) -> Self {
        log::trace!("DBus error {}: {}", err.name().unwrap_or_default(), err.message().unwrap_or_default());
        if err.name() == Some("org.freedesktop.DBus.Error.UnknownObject") {
            return Self::new(ErrorKind::NotFound);
        }
        Self {
            kind: ErrorKind::Internal(InternalErrorKind::DBus(err.name().unwrap_or_default().to_string())),
            message: err.message().unwrap_or_default().to_string(),
        }
    }
}

impl From<JoinError> for Error {
    fn from(err: JoinError) -> Self {
        Self { kind: ErrorKind::Internal(InternalErrorKind::JoinError), message: err.to_string() }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self { kind: ErrorKind::Internal(InternalErrorKind::Io(err.kind())), message: err.to_string() }
    }
}

impl From<InvalidAddress> for Error {
    fn from(err: InvalidAddress) -> Self {
        Self::new(ErrorKind::InvalidAddress(err.0))
    }
}

impl From<Error> for dbus::MethodErr {
    fn from(err: Error) -> Self {
        let name = match &err.kind {
            ErrorKind::DeviceBusy => "DeviceBusy",
            ErrorKind::DeviceNotFound | ErrorKind::NotFound => "DeviceNotFound",
            ErrorKind::Forbidden => "Forbidden",
            ErrorKind::NotSupported => "NotSupported",
            ErrorKind::Rejected => "Rejected",
            ErrorKind::CodecSelectionTimedOut => "TimedOut",
            ErrorKind::Protocol(_) => "Protocol",
            ErrorKind::InvalidAddress(_) | ErrorKind::InvalidName(_) => "InvalidArguments",
            ErrorKind::BusNameTaken => "Failed",
            ErrorKind::Internal(_) => "Failed",
        };
        dbus::MethodErr::from((format!("org.bluealsa.Error.{name}"), &err.to_string()))
    }
}

/// BlueALSA result.
pub type Result<T> = std::result::Result<T, Error>;

/// Bluetooth address.
///
/// The serialized representation is a string in colon-hexadecimal notation.
#[derive(Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Address(pub [u8; 6]);

impl Address {
    /// Creates a new Bluetooth address with the specified value.
    pub const fn new(addr: [u8; 6]) -> Self {
        Self(addr)
    }

    /// Any Bluetooth address (`00:00:00:00:00:00`).
    pub const fn any() -> Self {
        Self([0; 6])
    }
}

impl Deref for Address {
    type Target = [u8; 6];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Address {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl From<sys::bdaddr_t> for Address {
    fn from(mut addr: sys::bdaddr_t) -> Self {
        addr.b.reverse();
        Self(addr.b)
    }
}

impl From<Address> for sys::bdaddr_t {
    fn from(mut addr: Address) -> Self {
        addr.0.reverse();
        sys::bdaddr_t { b: addr.0 }
    }
}

impl From<MacAddr6> for Address {
    fn from(addr: MacAddr6) -> Self {
        Self(addr.into_array())
    }
}

impl From<Address> for MacAddr6 {
    fn from(addr: Address) -> Self {
        addr.0.into()
    }
}

/// Invalid Bluetooth address error.
#[derive(Debug, Clone)]
pub struct InvalidAddress(pub String);

impl fmt::Display for InvalidAddress {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "invalid Bluetooth address: {}", &self.0)
    }
}

impl std::error::Error for InvalidAddress {}

impl FromStr for Address {
    type Err = InvalidAddress;
    fn from_str(s: &str) -> std::result::Result<Self, InvalidAddress> {
        let fields = s
            .split(':')
            .map(|s| u8::from_str_radix(s, 16).map_err(|_| InvalidAddress(s.to_string())))
            .collect::<std::result::Result<Vec<_>, InvalidAddress>>()?;
        Ok(Self(fields.try_into().map_err(|_| InvalidAddress(s.to_string()))?))
    }
}

impl From<[u8; 6]> for Address {
    fn from(addr: [u8; 6]) -> Self {
        Self(addr)
    }
}

impl From<Address> for [u8; 6] {
    fn from(addr: Address) -> Self {
        addr.0
    }
}

/// Hardware adapter feature bits relevant to transport selection.
///
/// Used to detect eSCO support, which in turn decides whether mSBC over
/// eSCO can be offered during HFP codec negotiation.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, FromPrimitive)]
#[repr(u32)]
pub enum AddressType {
    /// Classic Bluetooth (BR/EDR) address.
    #[default]
    BrEdr = 0x00,
    /// Bluetooth Low Energy (LE) public address.
    LePublic = 0x01,
    /// Bluetooth Low Energy (LE) random address.
    LeRandom = 0x02,
}

/// Gets all D-Bus objects managed by the given service.
pub(crate) async fn all_dbus_objects(
    connection: &SyncConnection, service: &str,
) -> Result<HashMap<Path<'static>, HashMap<String, PropMap>>> {
    let p = Proxy::new(service, "/", TIMEOUT, connection);
    use dbus::nonblock::stdintf::org_freedesktop_dbus::ObjectManager;
    Ok(p.get_managed_objects().await?)
}

/// Reads a mandatory value from a D-Bus property dictionary.
pub(crate) fn read_dict<'a, T: 'static>(
    dict: &'a HashMap<String, Variant<Box<dyn RefArg + 'static>>>, key: &str,
) -> Result<&'a T> {
    prop_cast(dict, key)
        .ok_or_else(|| Error::new(ErrorKind::Internal(InternalErrorKind::MissingKey(key.to_string()))))
}

/// Returns the parent path of the specified D-Bus path.
pub(crate) fn parent_path<'a>(path: &Path<'a>) -> Path<'a> {
    let mut comps: Vec<_> = path.split('/').collect();
    comps.pop();
    if comps.is_empty() {
        Path::new("/").unwrap()
    } else {
        Path::new(comps.join("/")).unwrap()
    }
}

/// Result of calling one of our D-Bus methods.
pub(crate) type DbusResult<T> = std::result::Result<T, dbus::MethodErr>;

/// Calls an async method handler bound to an `Arc<T>` registered object, logging request/reply at trace level.
pub(crate) fn method_call<
    T: Send + Sync + 'static,
    R: AppendAll + fmt::Debug,
    F: Future<Output = DbusResult<R>> + Send + 'static,
>(
    mut ctx: Context, cr: &mut Crossroads, f: impl FnOnce(Arc<T>) -> F,
) -> impl Future<Output = PhantomData<R>> {
    let data_ref: &mut Arc<T> = cr.data_mut(ctx.path()).unwrap();
    let data: Arc<T> = data_ref.clone();
    async move {
        if log::log_enabled!(log::Level::Trace) {
            let mut args = Vec::new();
            let mut arg_iter = ctx.message().iter_init();
            while let Some(value) = arg_iter.get_refarg() {
                args.push(format!("{value:?}"));
                arg_iter.next();
            }
            log::trace!(
                "{}: {}.{} ({})",
                ctx.path(),
                ctx.interface().map(|i| i.to_string()).unwrap_or_default(),
                ctx.method(),
                args.join(", ")
            );
        }
        let result = f(data).await;
        log::trace!(
            "{}: {}.{} (...) -> {:?}",
            ctx.path(),
            ctx.interface().map(|i| i.to_string()).unwrap_or_default(),
            ctx.method(),
            &result
        );
        ctx.reply(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_round_trips_through_display_and_from_str() {
        let a = Address::new([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        let s = a.to_string();
        assert_eq!(s, "00:11:22:33:44:55");
        assert_eq!(s.parse::<Address>().unwrap(), a);
    }

    #[test]
    fn invalid_address_is_rejected() {
        assert!("not-an-address".parse::<Address>().is_err());
    }
}
