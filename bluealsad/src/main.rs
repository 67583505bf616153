//! BlueALSA daemon entry point: CLI parsing, logging, bus-name ownership, profile/endpoint
//! registration and graceful shutdown on SIGINT/SIGTERM.

use clap::Parser;
use std::{path::PathBuf, process::ExitCode, time::Duration};

use bluealsa::{
    config::{A2dpCodec, Config, Profile},
    profile::{HFP_AG, HFP_HF, HSP_AG, HSP_HS},
    transport::TransportKind,
    Registry, Session,
};

/// Bridges the local audio stack to Bluetooth A2DP, HFP/HSP and BLE-MIDI.
#[derive(Parser)]
#[command(name = "bluealsa", version, about)]
struct Opt {
    /// Bus name suffix: this daemon registers as `org.bluealsa.SUFFIX` instead of `org.bluealsa`.
    #[arg(short = 'B', long = "dbus", default_value = "")]
    dbus_suffix: String,

    /// Adapter to service (e.g. `hci0`); repeatable. Unset services every present/hot-plugged adapter.
    #[arg(short = 'i', long = "device")]
    device: Vec<String>,

    /// Profile to enable: one of `a2dp-source`, `a2dp-sink`, `hfp-ag`, `hfp-hf`, `hsp-ag`,
    /// `hsp-hs`, `hfp-ofono`, `midi`, prefixed with `+`/`-` to toggle against the default set
    /// (`a2dp-source`, `hfp-ag`) rather than replacing it outright. Repeatable.
    #[arg(short = 'p', long = "profile")]
    profile: Vec<String>,

    /// A2DP codec to offer, in preference order; repeatable. Unset offers every codec built in.
    #[arg(short = 'c', long = "codec")]
    codec: Vec<CliCodec>,

    /// Initial volume (0-100 %) applied to PCMs with no stored volume.
    #[arg(long, default_value_t = 100)]
    initial_volume: u8,

    /// Seconds an idle A2DP source transport is kept alive before release. 0 releases immediately.
    #[arg(long, default_value_t = 5)]
    keep_alive: u64,

    /// Real-time (`SCHED_FIFO`) priority for encoder/decoder worker tasks.
    #[arg(long)]
    io_rt_priority: Option<i32>,

    /// Force A2DP Sink streams to be mixed down to mono.
    #[arg(long)]
    a2dp_force_mono: bool,

    /// Force the local A2DP Sink PCM format to 44100 Hz / 16-bit / stereo.
    #[arg(long)]
    a2dp_force_audio_cd: bool,

    /// SBC encoder quality.
    #[arg(long, default_value = "medium")]
    sbc_quality: SbcQuality,

    /// Directory PCM FIFOs, control sockets and persisted volume state are created under.
    #[arg(long, default_value = "/var/run/bluealsa")]
    state_dir: PathBuf,

    /// Minimum log level.
    #[arg(long, default_value = "info")]
    loglevel: LogLevel,

    /// Log to syslog instead of standard error.
    #[arg(long)]
    syslog: bool,
}

/// One `-p/--profile` token, parsed into the profile/flag it names and whether it was given a
/// `+`/`-` toggle prefix (`None` for a bare name, which replaces the default set on first use).
enum ProfileToken {
    Profile(Profile),
    /// `hfp-ofono`: not itself a [Profile], a modifier on the HFP Audio Gateway role.
    HfpOfono,
}

fn parse_profile_name(name: &str) -> Result<ProfileToken, String> {
    Ok(match name {
        "a2dp-source" => ProfileToken::Profile(Profile::A2dpSource),
        "a2dp-sink" => ProfileToken::Profile(Profile::A2dpSink),
        "hfp-ag" => ProfileToken::Profile(Profile::HfpAg),
        "hfp-hf" => ProfileToken::Profile(Profile::HfpHf),
        "hsp-ag" => ProfileToken::Profile(Profile::HspAg),
        "hsp-hs" => ProfileToken::Profile(Profile::HspHs),
        "midi" => ProfileToken::Profile(Profile::Midi),
        "hfp-ofono" => ProfileToken::HfpOfono,
        other => return Err(format!("unknown profile '{other}'")),
    })
}

/// Applies every `-p/--profile` token against the default profile set (`a2dp-source`, `hfp-ag`),
/// per the `+name`/`-name` toggle / bare-name-replaces convention described on [Opt::profile].
/// Returns the resulting profile set plus whether `hfp-ofono` mode was requested.
fn parse_profiles(raw: &[String]) -> Result<(Vec<Profile>, bool), String> {
    let mut profiles = vec![Profile::A2dpSource, Profile::HfpAg];
    let mut hfp_ofono = false;
    let mut replaced_defaults = false;

    for token in raw {
        let (toggle, name) = match token.strip_prefix('+') {
            Some(rest) => (Some(true), rest),
            None => match token.strip_prefix('-') {
                Some(rest) => (Some(false), rest),
                None => (None, token.as_str()),
            },
        };

        match (parse_profile_name(name)?, toggle) {
            (ProfileToken::HfpOfono, Some(false)) => hfp_ofono = false,
            (ProfileToken::HfpOfono, _) => hfp_ofono = true,
            (ProfileToken::Profile(profile), Some(true)) => {
                if !profiles.contains(&profile) {
                    profiles.push(profile);
                }
            }
            (ProfileToken::Profile(profile), Some(false)) => profiles.retain(|p| *p != profile),
            (ProfileToken::Profile(profile), None) => {
                if !replaced_defaults {
                    profiles.clear();
                    replaced_defaults = true;
                }
                profiles.push(profile);
            }
        }
    }

    Ok((profiles, hfp_ofono))
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum CliCodec {
    Sbc,
    Aac,
    Aptx,
    Ldac,
    Lc3plus,
}

impl From<CliCodec> for A2dpCodec {
    fn from(value: CliCodec) -> Self {
        match value {
            CliCodec::Sbc => A2dpCodec::Sbc,
            CliCodec::Aac => A2dpCodec::Aac,
            CliCodec::Aptx => A2dpCodec::Aptx,
            CliCodec::Ldac => A2dpCodec::Ldac,
            CliCodec::Lc3plus => A2dpCodec::Lc3plus,
        }
    }
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum SbcQuality {
    Low,
    Medium,
    High,
    Xq,
    #[value(name = "xq+")]
    XqPlus,
}

impl From<SbcQuality> for u8 {
    fn from(value: SbcQuality) -> Self {
        match value {
            SbcQuality::Low => 0,
            SbcQuality::Medium => 2,
            SbcQuality::High => 3,
            SbcQuality::Xq => 4,
            SbcQuality::XqPlus => 4,
        }
    }
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum LogLevel {
    Error,
    Warning,
    Info,
    Debug,
}

impl From<LogLevel> for log::LevelFilter {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warning => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
        }
    }
}

/// Builds the runtime [Config] plus the `hfp-ofono` flag (not itself part of [Config], since it
/// only chooses which registration path the HFP Audio Gateway role takes).
fn build_config(opt: &Opt) -> Result<(Config, bool), String> {
    let (profiles, hfp_ofono) = parse_profiles(&opt.profile)?;
    let config = Config {
        dbus_suffix: opt.dbus_suffix.clone(),
        adapters: opt.device.clone(),
        profiles,
        a2dp_codecs: opt.codec.iter().copied().map(Into::into).collect(),
        initial_volume: bluealsa::percent_to_centidb(opt.initial_volume.min(100)),
        keep_alive: Duration::from_secs(opt.keep_alive),
        io_rt_priority: opt.io_rt_priority,
        a2dp_force_mono: opt.a2dp_force_mono,
        a2dp_force_audio_cd: opt.a2dp_force_audio_cd,
        sbc_quality: opt.sbc_quality.into(),
        rfcomm_link_lost_quirk: true,
        state_dir: opt.state_dir.clone(),
        audio_group_gid: lookup_audio_group_gid(),
    };
    Ok((config, hfp_ofono))
}

fn lookup_audio_group_gid() -> Option<u32> {
    let name = std::ffi::CString::new("audio").ok()?;
    let group = unsafe { libc::getgrnam(name.as_ptr()) };
    if group.is_null() {
        None
    } else {
        Some(unsafe { (*group).gr_gid })
    }
}

fn init_logging(opt: &Opt) {
    let level: log::LevelFilter = opt.loglevel.into();
    if opt.syslog {
        let formatter = syslog::Formatter3164 {
            facility: syslog::Facility::LOG_DAEMON,
            hostname: None,
            process: "bluealsa".into(),
            pid: std::process::id(),
        };
        match syslog::unix(formatter) {
            Ok(logger) => {
                let _ = log::set_boxed_logger(Box::new(syslog::BasicLogger::new(logger)));
                log::set_max_level(level);
            }
            Err(err) => {
                eprintln!("Failed to connect to syslog, logging to stderr: {err}");
                env_logger::Builder::new().filter_level(level).init();
            }
        }
    } else {
        env_logger::Builder::new().filter_level(level).init();
    }
}

/// Registers every configured profile/endpoint on every adapter the registry currently services.
/// Returned handles must be kept alive for the registrations to stay in effect.
async fn enable_profiles(
    registry: &std::sync::Arc<Registry>, config: &Config, hfp_ofono: bool,
) -> bluealsa::Result<Vec<Box<dyn std::any::Any>>> {
    let mut handles: Vec<Box<dyn std::any::Any>> = Vec::new();

    if config.profiles.contains(&Profile::HfpAg) {
        if hfp_ofono {
            handles.push(Box::new(registry.enable_hfp_agent().await?));
        } else {
            handles.push(Box::new(registry.enable_hfp_profile(HFP_AG).await?));
        }
    }
    if config.profiles.contains(&Profile::HfpHf) {
        handles.push(Box::new(registry.enable_hfp_profile(HFP_HF).await?));
    }
    if config.profiles.contains(&Profile::HspAg) {
        handles.push(Box::new(registry.enable_hfp_profile(HSP_AG).await?));
    }
    if config.profiles.contains(&Profile::HspHs) {
        handles.push(Box::new(registry.enable_hfp_profile(HSP_HS).await?));
    }

    let adapters = registry.adapters().await;
    for adapter in &adapters {
        let name = adapter.name();
        if config.profiles.contains(&Profile::A2dpSource) {
            handles.push(Box::new(registry.enable_media_endpoint(name, TransportKind::A2dpSource).await?));
        }
        if config.profiles.contains(&Profile::A2dpSink) {
            handles.push(Box::new(registry.enable_media_endpoint(name, TransportKind::A2dpSink).await?));
        }
        if config.profiles.contains(&Profile::Midi) {
            handles.push(Box::new(registry.enable_midi(name).await?));
        }
    }

    Ok(handles)
}

async fn run(config: Config, hfp_ofono: bool) -> bluealsa::Result<()> {
    let config = std::sync::Arc::new(config);

    let session = Session::new().await?;
    session.request_name(&config.service_name()).await?;
    log::info!("Acquired bus name {}", config.service_name());

    let registry = Registry::new(session, config.clone()).await?;
    registry.spawn_watch();

    let _handles = enable_profiles(&registry, &config, hfp_ofono).await?;
    registry.serve_manager().await?;

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => log::info!("Received SIGINT, shutting down"),
        _ = sigterm.recv() => log::info!("Received SIGTERM, shutting down"),
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let opt = Opt::parse();
    init_logging(&opt);

    let (config, hfp_ofono) = match build_config(&opt) {
        Ok(result) => result,
        Err(err) => {
            log::error!("Configuration error: {err}");
            return ExitCode::FAILURE;
        }
    };

    match run(config, hfp_ofono).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("Fatal: {err}");
            ExitCode::FAILURE
        }
    }
}
