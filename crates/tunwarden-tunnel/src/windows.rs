//! Windows back-end
//!
//! Adapters are driven through `wireguard.dll` (wireguard-nt), loaded at
//! runtime. Addresses, routes, MTU and resolvers are set with `netsh`.
//! The command pipe is created with a DACL that lets any local user
//! connect.

use crate::driver::{
    AdapterState, DriverError, RawAdapter, TunnelDriver, ERROR_FILE_NOT_FOUND,
    ERROR_INVALID_PARAMETER,
};
use crate::error::{TunnelError, TunnelResult};
use crate::netops::NetworkOps;
use libloading::Library;
use std::ffi::{c_void, OsStr};
use std::io;
use std::iter::once;
use std::net::{IpAddr, Ipv4Addr};
use std::os::windows::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::ptr;
use tokio::net::windows::named_pipe::{NamedPipeServer, ServerOptions};
use tunwarden_protocol::Cidr;
use uuid::Uuid;
use windows_sys::core::GUID;
use windows_sys::Win32::Foundation::{LocalFree, ERROR_INSUFFICIENT_BUFFER, ERROR_MORE_DATA};
use windows_sys::Win32::Security::Authorization::{
    ConvertStringSecurityDescriptorToSecurityDescriptorW, SDDL_REVISION_1,
};
use windows_sys::Win32::Security::{PSECURITY_DESCRIPTOR, SECURITY_ATTRIBUTES};

/// Everyone: generic all
const PIPE_SDDL: &str = "D:(A;;GA;;;WD)";

type AdapterHandle = *mut c_void;

type CreateAdapterFn =
    unsafe extern "system" fn(*const u16, *const u16, *const GUID) -> AdapterHandle;
type OpenAdapterFn = unsafe extern "system" fn(*const u16) -> AdapterHandle;
type CloseAdapterFn = unsafe extern "system" fn(AdapterHandle);
type SetAdapterStateFn = unsafe extern "system" fn(AdapterHandle, u32) -> i32;
type GetAdapterStateFn = unsafe extern "system" fn(AdapterHandle, *mut u32) -> i32;
type SetConfigurationFn = unsafe extern "system" fn(AdapterHandle, *const c_void, u32) -> i32;
type GetConfigurationFn = unsafe extern "system" fn(AdapterHandle, *mut c_void, *mut u32) -> i32;
type GetRunningDriverVersionFn = unsafe extern "system" fn() -> u32;

fn wide(s: &str) -> Vec<u16> {
    OsStr::new(s).encode_wide().chain(once(0)).collect()
}

fn last_error(op: &'static str) -> DriverError {
    let err = io::Error::last_os_error();
    DriverError::new(op, err.raw_os_error().unwrap_or(0) as u32, err.to_string())
}

/// Copy a byte buffer into 8-byte aligned storage
fn aligned(bytes: &[u8]) -> Vec<u64> {
    bytes
        .chunks(8)
        .map(|chunk| {
            let mut word = [0u8; 8];
            word[..chunk.len()].copy_from_slice(chunk);
            u64::from_ne_bytes(word)
        })
        .collect()
}

/// Default location of `wireguard.dll`, next to the executable
pub fn default_driver_path() -> TunnelResult<PathBuf> {
    let arch = if cfg!(target_arch = "x86_64") {
        "amd64"
    } else if cfg!(target_arch = "aarch64") {
        "arm64"
    } else if cfg!(target_arch = "arm") {
        "arm"
    } else {
        "x86"
    };
    let exe = std::env::current_exe()?;
    let base = exe
        .parent()
        .ok_or_else(|| TunnelError::Config(format!("{} has no parent directory", exe.display())))?;
    Ok(base
        .join("Resources")
        .join("wireguard-nt")
        .join("bin")
        .join(arch)
        .join("wireguard.dll"))
}

/// Driver over wireguard-nt
pub struct WireGuardNtDriver {
    create: CreateAdapterFn,
    open: OpenAdapterFn,
    close: CloseAdapterFn,
    set_state: SetAdapterStateFn,
    get_state: GetAdapterStateFn,
    set_config: SetConfigurationFn,
    get_config: GetConfigurationFn,
    version: GetRunningDriverVersionFn,
    // Keeps the function pointers above valid
    _library: Library,
}

impl std::fmt::Debug for WireGuardNtDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireGuardNtDriver").finish_non_exhaustive()
    }
}

macro_rules! symbol {
    ($lib:expr, $ty:ty, $name:literal) => {
        // SAFETY: the type matches the exported wireguard-nt prototype
        *unsafe { $lib.get::<$ty>(concat!($name, "\0").as_bytes()) }.map_err(|e| {
            TunnelError::Adapter(DriverError::new(
                "load",
                ERROR_FILE_NOT_FOUND,
                format!("missing export {}: {}", $name, e),
            ))
        })?
    };
}

impl WireGuardNtDriver {
    /// Load the driver library from `path`
    pub fn load(path: &Path) -> TunnelResult<Self> {
        tracing::info!("Loading wireguard-nt from {}", path.display());

        // SAFETY: wireguard.dll has no initialisation side effects beyond
        // what its own DllMain does
        let library = unsafe { Library::new(path) }.map_err(|e| {
            TunnelError::Adapter(DriverError::new(
                "load",
                ERROR_FILE_NOT_FOUND,
                format!("cannot load {}: {}", path.display(), e),
            ))
        })?;

        // Each symbol borrow must end before the library moves into Self
        let create = symbol!(library, CreateAdapterFn, "WireGuardCreateAdapter");
        let open = symbol!(library, OpenAdapterFn, "WireGuardOpenAdapter");
        let close = symbol!(library, CloseAdapterFn, "WireGuardCloseAdapter");
        let set_state = symbol!(library, SetAdapterStateFn, "WireGuardSetAdapterState");
        let get_state = symbol!(library, GetAdapterStateFn, "WireGuardGetAdapterState");
        let set_config = symbol!(library, SetConfigurationFn, "WireGuardSetConfiguration");
        let get_config = symbol!(library, GetConfigurationFn, "WireGuardGetConfiguration");
        let version =
            symbol!(library, GetRunningDriverVersionFn, "WireGuardGetRunningDriverVersion");

        let driver = Self {
            create,
            open,
            close,
            set_state,
            get_state,
            set_config,
            get_config,
            version,
            _library: library,
        };
        Ok(driver)
    }

    /// Load from [`default_driver_path`]
    pub fn load_default() -> TunnelResult<Self> {
        Self::load(&default_driver_path()?)
    }
}

fn handle(adapter: RawAdapter) -> AdapterHandle {
    adapter.0 as AdapterHandle
}

impl TunnelDriver for WireGuardNtDriver {
    fn name(&self) -> &'static str {
        "wireguard-nt"
    }

    fn open_adapter(&self, name: &str) -> Result<Option<RawAdapter>, DriverError> {
        let name = wide(name);
        // SAFETY: `name` is NUL terminated and outlives the call
        let raw = unsafe { (self.open)(name.as_ptr()) };
        if raw.is_null() {
            let err = last_error("WireGuardOpenAdapter");
            if err.code == ERROR_FILE_NOT_FOUND {
                return Ok(None);
            }
            return Err(err);
        }
        Ok(Some(RawAdapter(raw as usize)))
    }

    fn create_adapter(
        &self,
        name: &str,
        tunnel_type: &str,
        guid: Uuid,
    ) -> Result<RawAdapter, DriverError> {
        let name = wide(name);
        let tunnel_type = wide(tunnel_type);
        let guid = GUID::from_u128(guid.as_u128());
        // SAFETY: all pointers reference live locals
        let raw = unsafe { (self.create)(name.as_ptr(), tunnel_type.as_ptr(), &guid) };
        if raw.is_null() {
            return Err(last_error("WireGuardCreateAdapter"));
        }
        Ok(RawAdapter(raw as usize))
    }

    fn close_adapter(&self, adapter: RawAdapter) -> Result<(), DriverError> {
        // SAFETY: the handle came from create/open and is closed once
        unsafe { (self.close)(handle(adapter)) };
        Ok(())
    }

    fn set_adapter_state(
        &self,
        adapter: RawAdapter,
        state: AdapterState,
    ) -> Result<(), DriverError> {
        let value = match state {
            AdapterState::Down => 0,
            AdapterState::Up => 1,
        };
        // SAFETY: valid handle
        if unsafe { (self.set_state)(handle(adapter), value) } == 0 {
            return Err(last_error("WireGuardSetAdapterState"));
        }
        Ok(())
    }

    fn get_adapter_state(&self, adapter: RawAdapter) -> Result<AdapterState, DriverError> {
        let mut value = 0u32;
        // SAFETY: valid handle, `value` is a live local
        if unsafe { (self.get_state)(handle(adapter), &mut value) } == 0 {
            return Err(last_error("WireGuardGetAdapterState"));
        }
        Ok(if value == 1 { AdapterState::Up } else { AdapterState::Down })
    }

    fn set_configuration(&self, adapter: RawAdapter, config: &[u8]) -> Result<(), DriverError> {
        let op = "WireGuardSetConfiguration";
        let len = u32::try_from(config.len())
            .map_err(|_| DriverError::new(op, ERROR_INVALID_PARAMETER, "configuration too large"))?;
        let buf = aligned(config);
        // SAFETY: `buf` holds at least `len` bytes
        if unsafe { (self.set_config)(handle(adapter), buf.as_ptr().cast(), len) } == 0 {
            return Err(last_error(op));
        }
        Ok(())
    }

    fn get_configuration(&self, adapter: RawAdapter) -> Result<Vec<u8>, DriverError> {
        let op = "WireGuardGetConfiguration";
        let mut size = 0u32;
        // The configuration may grow between the probe and the read
        for _ in 0..4 {
            let mut buf = vec![0u64; (size as usize).div_ceil(8)];
            let ptr = if buf.is_empty() {
                ptr::null_mut()
            } else {
                buf.as_mut_ptr().cast()
            };
            // SAFETY: `buf` holds `size` bytes and `size` is a live local
            if unsafe { (self.get_config)(handle(adapter), ptr, &mut size) } != 0 {
                return Ok(buf
                    .iter()
                    .flat_map(|w| w.to_ne_bytes())
                    .take(size as usize)
                    .collect());
            }
            let err = last_error(op);
            if err.code != ERROR_MORE_DATA && err.code != ERROR_INSUFFICIENT_BUFFER {
                return Err(err);
            }
        }
        Err(DriverError::new(op, ERROR_MORE_DATA, "configuration kept growing"))
    }

    fn driver_version(&self) -> Option<u32> {
        // SAFETY: no arguments
        match unsafe { (self.version)() } {
            0 => None,
            v => Some(v),
        }
    }
}

// ============================================================================
// netsh
// ============================================================================

fn run_netsh(args: &[&str]) -> TunnelResult<()> {
    tracing::debug!("exec: netsh {}", args.join(" "));
    let output = Command::new("netsh")
        .args(args)
        .output()
        .map_err(|e| TunnelError::Route(format!("failed to run netsh: {}", e)))?;
    if !output.status.success() {
        // netsh reports errors on stdout
        return Err(TunnelError::Route(format!(
            "netsh {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stdout).trim()
        )));
    }
    Ok(())
}

fn family(addr: &IpAddr) -> &'static str {
    match addr {
        IpAddr::V4(_) => "ipv4",
        IpAddr::V6(_) => "ipv6",
    }
}

/// Convert a CIDR prefix to an IPv4 subnet mask
fn prefix_to_mask_v4(prefix: u8) -> Ipv4Addr {
    let mask: u32 = if prefix == 0 {
        0
    } else {
        !0u32 << (32 - u32::from(prefix.min(32)))
    };
    Ipv4Addr::from(mask)
}

/// `netsh` based network configuration
#[derive(Debug, Default)]
pub struct WindowsNetwork;

impl WindowsNetwork {
    /// Create a network back-end
    pub fn new() -> Self {
        Self
    }
}

impl NetworkOps for WindowsNetwork {
    fn name(&self) -> &'static str {
        "netsh"
    }

    fn add_address(&self, iface: &str, addr: &Cidr) -> TunnelResult<()> {
        let name = format!("name={}", iface);
        match addr.addr {
            IpAddr::V4(a) => run_netsh(&[
                "interface",
                "ipv4",
                "add",
                "address",
                &name,
                &format!("address={}", a),
                &format!("mask={}", prefix_to_mask_v4(addr.prefix)),
            ]),
            IpAddr::V6(_) => run_netsh(&[
                "interface",
                "ipv6",
                "add",
                "address",
                &format!("interface={}", iface),
                &format!("address={}", addr),
            ]),
        }
    }

    fn remove_address(&self, iface: &str, addr: &Cidr) -> TunnelResult<()> {
        let target = match addr.addr {
            IpAddr::V4(_) => format!("name={}", iface),
            IpAddr::V6(_) => format!("interface={}", iface),
        };
        run_netsh(&[
            "interface",
            family(&addr.addr),
            "delete",
            "address",
            &target,
            &format!("address={}", addr.addr),
        ])
    }

    fn add_route(&self, iface: &str, dest: &Cidr) -> TunnelResult<()> {
        run_netsh(&[
            "interface",
            family(&dest.addr),
            "add",
            "route",
            &format!("prefix={}", dest),
            &format!("interface={}", iface),
            "metric=0",
            "store=active",
        ])
    }

    fn remove_route(&self, iface: &str, dest: &Cidr) -> TunnelResult<()> {
        run_netsh(&[
            "interface",
            family(&dest.addr),
            "delete",
            "route",
            &format!("prefix={}", dest),
            &format!("interface={}", iface),
            "store=active",
        ])
    }

    fn set_mtu(&self, iface: &str, mtu: u16) -> TunnelResult<()> {
        let mtu = format!("mtu={}", mtu);
        run_netsh(&["interface", "ipv4", "set", "subinterface", iface, &mtu, "store=active"])?;
        if let Err(e) =
            run_netsh(&["interface", "ipv6", "set", "subinterface", iface, &mtu, "store=active"])
        {
            tracing::warn!("IPv6 MTU not set on {}: {}", iface, e);
        }
        Ok(())
    }

    fn enable_forwarding(&self, iface: &str) -> TunnelResult<()> {
        run_netsh(&["interface", "ipv4", "set", "interface", iface, "forwarding=enabled"])
    }

    fn disable_forwarding(&self, iface: &str) -> TunnelResult<()> {
        run_netsh(&["interface", "ipv4", "set", "interface", iface, "forwarding=disabled"])
    }

    fn add_dns(&self, iface: &str, server: IpAddr) -> TunnelResult<()> {
        run_netsh(&[
            "interface",
            family(&server),
            "add",
            "dnsservers",
            &format!("name={}", iface),
            &format!("address={}", server),
            "validate=no",
        ])
    }

    fn remove_dns(&self, iface: &str, server: IpAddr) -> TunnelResult<()> {
        run_netsh(&[
            "interface",
            family(&server),
            "delete",
            "dnsservers",
            &format!("name={}", iface),
            &format!("address={}", server),
            "validate=no",
        ])
    }

    // wireguard-nt resolves endpoint routes with its own adapter excluded
    fn add_endpoint_route(&self, iface: &str, endpoint: IpAddr) -> TunnelResult<()> {
        tracing::debug!("Endpoint {} needs no pinned route off {}", endpoint, iface);
        Ok(())
    }

    fn remove_endpoint_route(&self, _iface: &str, _endpoint: IpAddr) -> TunnelResult<()> {
        Ok(())
    }
}

// ============================================================================
// Command pipe
// ============================================================================

/// Security descriptor allocated by the system, released with `LocalFree`
struct LocalDescriptor(PSECURITY_DESCRIPTOR);

impl LocalDescriptor {
    fn from_sddl(sddl: &str) -> io::Result<Self> {
        let sddl = wide(sddl);
        let mut descriptor: PSECURITY_DESCRIPTOR = ptr::null_mut();
        // SAFETY: `sddl` is NUL terminated and `descriptor` is a live local
        let ok = unsafe {
            ConvertStringSecurityDescriptorToSecurityDescriptorW(
                sddl.as_ptr(),
                SDDL_REVISION_1,
                &mut descriptor,
                ptr::null_mut(),
            )
        };
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self(descriptor))
    }
}

impl Drop for LocalDescriptor {
    fn drop(&mut self) {
        // SAFETY: allocated by ConvertStringSecurityDescriptorToSecurityDescriptorW
        unsafe { LocalFree(self.0) };
    }
}

/// Create one instance of the command pipe that any local user may open
pub fn create_pipe_instance(name: &str, first: bool) -> io::Result<NamedPipeServer> {
    let descriptor = LocalDescriptor::from_sddl(PIPE_SDDL)?;
    let mut attributes = SECURITY_ATTRIBUTES {
        nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
        lpSecurityDescriptor: descriptor.0,
        bInheritHandle: 0,
    };
    // SAFETY: `attributes` and the descriptor it points to outlive the call
    unsafe {
        ServerOptions::new()
            .first_pipe_instance(first)
            .create_with_security_attributes_raw(name, (&mut attributes as *mut SECURITY_ATTRIBUTES).cast())
    }
}
