//! C ABI for the tun2socks bridge
//!
//! Exposes the relay session and the proxy engines to a host application.
//! All entry points share one process-wide bridge: a multi-threaded tokio
//! runtime, the [`Tun2Socks`] controller and the engine [`Supervisor`].
//! The bridge is created by [`t2s_init`] or, with default settings, by the
//! first entry point that needs it.
//!
//! ## Conventions
//!
//! - Strings are null-terminated UTF-8. A null or non-UTF-8 required
//!   argument returns [`T2S_ERROR_INVALID_ARG`] without touching any state;
//!   optional arguments treat null as empty.
//! - Starting something that is already running, and stopping something
//!   that is not, succeed without effect (the condition is logged).
//! - Strings returned by this library must be released with
//!   [`t2s_string_free`].
//!
//! ## Thread Safety
//!
//! Every function may be called from any host thread. `run_tun2socks`
//! blocks its caller for the lifetime of the session, so it is meant to be
//! called from a dedicated thread; `stop_tun2socks` from another one ends it.

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::{Once, OnceLock};

use tokio::runtime::Runtime;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use t2s_engine::{BridgeConfig, EngineKind, Error, ShadowsocksConfig, Supervisor, Transition, Tun2Socks};

/// Success, including "already in the requested state"
pub const T2S_OK: c_int = 0;
/// Generic failure
pub const T2S_ERROR: c_int = -1;
/// Null, non-UTF-8 or otherwise invalid argument or configuration
pub const T2S_ERROR_INVALID_ARG: c_int = -2;
/// The virtual interface could not be released; host networking may be
/// left in an inconsistent state
pub const T2S_ERROR_CLOSE_FAILED: c_int = -3;

/// Result of [`testV2rayGo`]
#[repr(C)]
pub struct V2rayTestResult {
    /// Whether the configuration is valid
    pub ok: bool,
    /// Diagnostics; release with [`t2s_string_free`]. May be null.
    pub message: *mut c_char,
}

struct Bridge {
    runtime: Runtime,
    config: BridgeConfig,
    tun2socks: Tun2Socks,
    supervisor: Supervisor,
}

impl Bridge {
    fn new(config: BridgeConfig) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("t2s-worker")
            .build()?;
        Ok(Self {
            runtime,
            tun2socks: Tun2Socks::system(&config),
            supervisor: Supervisor::system(&config),
            config,
        })
    }
}

static BRIDGE: OnceLock<Result<Bridge, String>> = OnceLock::new();

fn init_logging(level: &str) {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
        // The host may already have installed a subscriber
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init();
    });
}

fn bridge() -> Option<&'static Bridge> {
    let bridge = BRIDGE.get_or_init(|| {
        let config = BridgeConfig::default();
        init_logging(&config.log.level);
        Bridge::new(config).map_err(|e| e.to_string())
    });
    match bridge {
        Ok(bridge) => Some(bridge),
        Err(e) => {
            log::error!("tun2socks bridge unavailable: {}", e);
            None
        }
    }
}

/// Borrow a required string argument
///
/// # Safety
///
/// `ptr` must be null or point to a null-terminated string that outlives `'a`.
unsafe fn required<'a>(ptr: *const c_char, name: &str) -> Option<&'a str> {
    if ptr.is_null() {
        log::error!("{} is null", name);
        return None;
    }
    match CStr::from_ptr(ptr).to_str() {
        Ok(s) => Some(s),
        Err(_) => {
            log::error!("{} is not valid UTF-8", name);
            None
        }
    }
}

/// Borrow an optional string argument; null reads as empty
///
/// # Safety
///
/// Same as [`required`].
unsafe fn optional<'a>(ptr: *const c_char, name: &str) -> Option<&'a str> {
    if ptr.is_null() {
        return Some("");
    }
    required(ptr, name)
}

fn into_c_string(s: String) -> *mut c_char {
    // Interior NULs cannot cross the boundary; cut the string there
    let s = match CString::new(s) {
        Ok(s) => s,
        Err(e) => {
            let end = e.nul_position();
            let mut bytes = e.into_vec();
            bytes.truncate(end);
            match CString::new(bytes) {
                Ok(s) => s,
                Err(_) => return ptr::null_mut(),
            }
        }
    };
    s.into_raw()
}

fn error_code(err: &Error) -> c_int {
    if err.is_noop() {
        T2S_OK
    } else if err.is_fatal() {
        T2S_ERROR_CLOSE_FAILED
    } else if err.is_config_error() {
        T2S_ERROR_INVALID_ARG
    } else {
        T2S_ERROR
    }
}

fn engine_code(kind: EngineKind, res: t2s_engine::Result<Transition>) -> c_int {
    match res {
        Ok(_) => T2S_OK,
        Err(e) => {
            log::error!("{}: {}", kind, e);
            error_code(&e)
        }
    }
}

/// Initialize the bridge from a TOML configuration file
///
/// Must be called before any other entry point for the configuration to
/// take effect. A null `config_path` uses the defaults.
///
/// # Returns
///
/// `T2S_OK` on success, `T2S_ERROR_INVALID_ARG` if the file cannot be read
/// or parsed, `T2S_ERROR` if the bridge was already initialized.
///
/// # Safety
///
/// `config_path` must be null or a valid null-terminated string.
#[no_mangle]
pub unsafe extern "C" fn t2s_init(config_path: *const c_char) -> c_int {
    let config = if config_path.is_null() {
        BridgeConfig::default()
    } else {
        let Some(path) = required(config_path, "config_path") else {
            return T2S_ERROR_INVALID_ARG;
        };
        match BridgeConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                init_logging("info");
                log::error!("{}", e);
                return T2S_ERROR_INVALID_ARG;
            }
        }
    };

    init_logging(&config.log.level);

    let mut created = false;
    BRIDGE.get_or_init(|| {
        created = true;
        Bridge::new(config).map_err(|e| e.to_string())
    });

    match BRIDGE.get() {
        Some(Ok(_)) if created => {
            tracing::info!("tun2socks bridge initialized");
            T2S_OK
        }
        Some(Ok(_)) => {
            log::warn!("tun2socks bridge is already initialized, configuration ignored");
            T2S_ERROR
        }
        _ => {
            log::error!("failed to create the tun2socks runtime");
            T2S_ERROR
        }
    }
}

/// Run a tun2socks session, blocking until it is stopped
///
/// Opens the virtual interface `tun_name` with address `tun_addr` and
/// gateway `tun_gw` (`tun_dns` is a comma separated server list) and
/// relays its traffic to the SOCKS5 proxy `proxy_server` (`host:port`).
///
/// # Returns
///
/// `T2S_OK` once the session has been stopped; `T2S_ERROR_INVALID_ARG` for
/// bad parameters or an unresolvable proxy; `T2S_ERROR` if a session is
/// already running or the device cannot be opened; `T2S_ERROR_CLOSE_FAILED`
/// if the session ended on its own and the device could not be released.
///
/// # Safety
///
/// All arguments must be valid null-terminated strings (`tun_dns` may be null).
#[no_mangle]
pub unsafe extern "C" fn run_tun2socks(
    tun_name: *const c_char,
    tun_addr: *const c_char,
    tun_gw: *const c_char,
    tun_dns: *const c_char,
    proxy_server: *const c_char,
) -> c_int {
    let (Some(name), Some(addr), Some(gw), Some(dns), Some(proxy)) = (
        required(tun_name, "tun_name"),
        required(tun_addr, "tun_addr"),
        required(tun_gw, "tun_gw"),
        optional(tun_dns, "tun_dns"),
        required(proxy_server, "proxy_server"),
    ) else {
        return T2S_ERROR_INVALID_ARG;
    };

    let Some(bridge) = bridge() else {
        return T2S_ERROR;
    };

    let params = match bridge.config.tun_params(name, addr, gw, dns) {
        Ok(params) => params,
        Err(e) => {
            log::error!("Invalid tun parameters: {}", e);
            return T2S_ERROR_INVALID_ARG;
        }
    };

    let res = bridge.runtime.block_on(async {
        bridge.tun2socks.start(&params, proxy).await?;
        bridge.tun2socks.wait().await
    });

    match res {
        Ok(()) => T2S_OK,
        Err(Error::AlreadyRunning) => {
            log::error!("tun2socks is already running");
            T2S_ERROR
        }
        Err(e) => {
            log::error!("tun2socks: {}", e);
            error_code(&e)
        }
    }
}

/// Stop the running tun2socks session
///
/// # Returns
///
/// `T2S_OK` when stopped or when nothing was running,
/// `T2S_ERROR_CLOSE_FAILED` if the virtual interface could not be released.
#[no_mangle]
pub extern "C" fn stop_tun2socks() -> c_int {
    let Some(bridge) = bridge() else {
        return T2S_ERROR;
    };
    match bridge.runtime.block_on(bridge.tun2socks.stop()) {
        Ok(()) => T2S_OK,
        Err(e) => {
            if !e.is_noop() {
                log::error!("Failed to stop tun2socks: {}", e);
            }
            error_code(&e)
        }
    }
}

/// Whether a tun2socks session is running
#[no_mangle]
pub extern "C" fn is_tun2socks_running() -> bool {
    match BRIDGE.get() {
        Some(Ok(bridge)) => bridge.tun2socks.is_running(),
        _ => false,
    }
}

/// Start trojan-go with a JSON configuration file
///
/// # Safety
///
/// `filename` must be a valid null-terminated string.
#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn startTrojanGo(filename: *const c_char) -> c_int {
    let Some(path) = required(filename, "filename") else {
        return T2S_ERROR_INVALID_ARG;
    };
    let Some(bridge) = bridge() else {
        return T2S_ERROR;
    };
    engine_code(
        EngineKind::Trojan,
        bridge.runtime.block_on(bridge.supervisor.start_trojan(Path::new(path))),
    )
}

/// Stop trojan-go
#[allow(non_snake_case)]
#[no_mangle]
pub extern "C" fn stopTrojanGo() -> c_int {
    stop_engine(EngineKind::Trojan)
}

/// trojan-go version string; release with [`t2s_string_free`]
#[allow(non_snake_case)]
#[no_mangle]
pub extern "C" fn getTrojanGoVersion() -> *mut c_char {
    let Some(bridge) = bridge() else {
        return into_c_string("unknown".to_string());
    };
    into_c_string(bridge.runtime.block_on(bridge.supervisor.trojan_version()))
}

/// Start a shadowsocks client
///
/// `plugin`, `plugin_options` and `api_address` may be null.
///
/// # Safety
///
/// All non-null arguments must be valid null-terminated strings.
#[allow(non_snake_case, clippy::too_many_arguments)]
#[no_mangle]
pub unsafe extern "C" fn startShadowsocksGo(
    client_addr: *const c_char,
    server_addr: *const c_char,
    cipher: *const c_char,
    password: *const c_char,
    plugin: *const c_char,
    plugin_options: *const c_char,
    enable_api: bool,
    api_address: *const c_char,
) -> c_int {
    let (Some(client), Some(server), Some(cipher), Some(password), Some(plugin), Some(opts), Some(api)) = (
        required(client_addr, "client_addr"),
        required(server_addr, "server_addr"),
        required(cipher, "cipher"),
        required(password, "password"),
        optional(plugin, "plugin"),
        optional(plugin_options, "plugin_options"),
        optional(api_address, "api_address"),
    ) else {
        return T2S_ERROR_INVALID_ARG;
    };

    let config = match ShadowsocksConfig::from_parts(
        client, server, cipher, password, plugin, opts, enable_api, api,
    ) {
        Ok(config) => config,
        Err(e) => {
            log::error!("Invalid shadowsocks settings: {}", e);
            return T2S_ERROR_INVALID_ARG;
        }
    };

    let Some(bridge) = bridge() else {
        return T2S_ERROR;
    };
    engine_code(
        EngineKind::Shadowsocks,
        bridge.runtime.block_on(bridge.supervisor.start_shadowsocks(config)),
    )
}

/// Stop the shadowsocks client
#[allow(non_snake_case)]
#[no_mangle]
pub extern "C" fn stopShadowsocksGo() -> c_int {
    stop_engine(EngineKind::Shadowsocks)
}

/// Start v2ray with a JSON configuration file
///
/// # Safety
///
/// `config_file` must be a valid null-terminated string.
#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn startV2rayGo(config_file: *const c_char) -> c_int {
    let Some(path) = required(config_file, "config_file") else {
        return T2S_ERROR_INVALID_ARG;
    };
    let Some(bridge) = bridge() else {
        return T2S_ERROR;
    };
    engine_code(
        EngineKind::V2ray,
        bridge.runtime.block_on(bridge.supervisor.start_v2ray(Path::new(path))),
    )
}

/// Stop v2ray
#[allow(non_snake_case)]
#[no_mangle]
pub extern "C" fn stopV2rayGo() -> c_int {
    stop_engine(EngineKind::V2ray)
}

/// Check a v2ray configuration file without starting v2ray
///
/// # Safety
///
/// `config_file` must be a valid null-terminated string.
#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn testV2rayGo(config_file: *const c_char) -> V2rayTestResult {
    let (ok, message) = match (required(config_file, "config_file"), bridge()) {
        (None, _) => (false, "config_file is null or not UTF-8".to_string()),
        (_, None) => (false, "tun2socks bridge unavailable".to_string()),
        (Some(path), Some(bridge)) => {
            let path = PathBuf::from(path);
            bridge.runtime.block_on(bridge.supervisor.test_v2ray(&path))
        }
    };
    V2rayTestResult {
        ok,
        message: into_c_string(message),
    }
}

/// Start the snell client with a JSON configuration file
///
/// # Safety
///
/// `config_file` must be a valid null-terminated string.
#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn startSnellGo(config_file: *const c_char) -> c_int {
    let Some(path) = required(config_file, "config_file") else {
        return T2S_ERROR_INVALID_ARG;
    };
    let Some(bridge) = bridge() else {
        return T2S_ERROR;
    };
    engine_code(
        EngineKind::Snell,
        bridge.runtime.block_on(bridge.supervisor.start_snell(Path::new(path))),
    )
}

/// Stop the snell client
#[allow(non_snake_case)]
#[no_mangle]
pub extern "C" fn stopSnellGo() -> c_int {
    stop_engine(EngineKind::Snell)
}

fn stop_engine(kind: EngineKind) -> c_int {
    let Some(bridge) = bridge() else {
        return T2S_ERROR;
    };
    engine_code(kind, bridge.runtime.block_on(bridge.supervisor.stop(kind)))
}

/// Release a string returned by this library
///
/// # Safety
///
/// `s` must be null or a pointer returned by this library that has not
/// been freed yet.
#[no_mangle]
pub unsafe extern "C" fn t2s_string_free(s: *mut c_char) {
    if !s.is_null() {
        drop(CString::from_raw(s));
    }
}
