//! Linux back-end
//!
//! Drives the in-kernel WireGuard link with `ip` and `wg`, and configures
//! addresses, routes and resolvers with `ip`, `/proc/sys` and `resolvectl`.
//! The driver speaks the same packed configuration buffer as every other
//! back-end; it is translated to and from `wg` text here.

use crate::driver::{AdapterState, DriverError, RawAdapter, TunnelDriver, ERROR_FILE_NOT_FOUND};
use crate::error::{TunnelError, TunnelResult};
use crate::netops::NetworkOps;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::io::Write as _;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::process::{Command, Stdio};
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use tunwarden_protocol::codec::{self, interface, peer, DeviceState, InterfaceRecord, PeerRecord};
use tunwarden_protocol::{decode_key, Cidr, PresharedKey, PrivateKey, PublicKey};

/// Exit status and stderr of a failed command
struct CommandFailure {
    code: u32,
    message: String,
}

fn run_cmd(program: &str, args: &[&str], stdin: Option<&[u8]>) -> Result<String, CommandFailure> {
    tracing::debug!("exec: {} {}", program, args.join(" "));

    let mut child = Command::new(program)
        .args(args)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| CommandFailure {
            code: e.raw_os_error().map_or(ERROR_FILE_NOT_FOUND, |c| c as u32),
            message: format!("failed to run {}: {}", program, e),
        })?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input).map_err(|e| CommandFailure {
            code: e.raw_os_error().unwrap_or(0) as u32,
            message: format!("failed to write to {}: {}", program, e),
        })?;
    }

    let output = child.wait_with_output().map_err(|e| CommandFailure {
        code: e.raw_os_error().unwrap_or(0) as u32,
        message: format!("failed to wait for {}: {}", program, e),
    })?;

    if !output.status.success() {
        return Err(CommandFailure {
            code: output.status.code().unwrap_or(-1) as u32,
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn run_ip_cmd(args: &[&str]) -> TunnelResult<()> {
    run_cmd("ip", args, None)
        .map(|_| ())
        .map_err(|f| TunnelError::Route(format!("ip {} failed: {}", args.join(" "), f.message)))
}

// ============================================================================
// Kernel WireGuard driver
// ============================================================================

/// Driver over the in-kernel WireGuard implementation
#[derive(Debug, Default)]
pub struct KernelWireGuardDriver {
    adapters: Mutex<HashMap<usize, String>>,
}

impl KernelWireGuardDriver {
    /// Create a driver
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<usize, String>> {
        self.adapters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, name: &str) -> RawAdapter {
        let mut adapters = self.lock();
        let id = adapters.keys().max().map_or(1, |m| m + 1);
        adapters.insert(id, name.to_string());
        RawAdapter(id)
    }

    fn ifname(&self, op: &'static str, adapter: RawAdapter) -> Result<String, DriverError> {
        self.lock().get(&adapter.0).cloned().ok_or_else(|| {
            DriverError::new(op, ERROR_FILE_NOT_FOUND, format!("no adapter with handle {}", adapter.0))
        })
    }
}

fn driver_err(op: &'static str) -> impl Fn(CommandFailure) -> DriverError {
    move |f| DriverError::new(op, f.code, f.message)
}

impl TunnelDriver for KernelWireGuardDriver {
    fn name(&self) -> &'static str {
        "kernel-wireguard"
    }

    fn open_adapter(&self, name: &str) -> Result<Option<RawAdapter>, DriverError> {
        match run_cmd("ip", &["-o", "link", "show", "dev", name], None) {
            Ok(_) => Ok(Some(self.register(name))),
            Err(_) => Ok(None),
        }
    }

    fn create_adapter(
        &self,
        name: &str,
        tunnel_type: &str,
        guid: Uuid,
    ) -> Result<RawAdapter, DriverError> {
        run_cmd("ip", &["link", "add", "dev", name, "type", "wireguard"], None)
            .map_err(driver_err("ip link add"))?;
        tracing::debug!("Created wireguard link {} ({}, {})", name, tunnel_type, guid);
        Ok(self.register(name))
    }

    fn close_adapter(&self, adapter: RawAdapter) -> Result<(), DriverError> {
        let name = self.ifname("ip link del", adapter)?;
        self.lock().remove(&adapter.0);
        run_cmd("ip", &["link", "del", "dev", &name], None).map_err(driver_err("ip link del"))?;
        Ok(())
    }

    fn set_adapter_state(
        &self,
        adapter: RawAdapter,
        state: AdapterState,
    ) -> Result<(), DriverError> {
        let name = self.ifname("ip link set", adapter)?;
        let word = match state {
            AdapterState::Up => "up",
            AdapterState::Down => "down",
        };
        run_cmd("ip", &["link", "set", "dev", &name, word], None)
            .map_err(driver_err("ip link set"))?;
        Ok(())
    }

    fn get_adapter_state(&self, adapter: RawAdapter) -> Result<AdapterState, DriverError> {
        let name = self.ifname("ip link show", adapter)?;
        let out = run_cmd("ip", &["-o", "link", "show", "dev", &name], None)
            .map_err(driver_err("ip link show"))?;
        Ok(parse_link_state(&out))
    }

    fn set_configuration(&self, adapter: RawAdapter, config: &[u8]) -> Result<(), DriverError> {
        let op = "wg setconf";
        let name = self.ifname(op, adapter)?;
        let state = codec::decode(config)
            .map_err(|e| DriverError::new(op, crate::driver::ERROR_INVALID_PARAMETER, e.to_string()))?;
        let text = render_setconf(&state);
        run_cmd("wg", &["setconf", &name, "/dev/stdin"], Some(text.as_bytes()))
            .map_err(driver_err(op))?;
        Ok(())
    }

    fn get_configuration(&self, adapter: RawAdapter) -> Result<Vec<u8>, DriverError> {
        let op = "wg show dump";
        let name = self.ifname(op, adapter)?;
        let dump = run_cmd("wg", &["show", &name, "dump"], None).map_err(driver_err(op))?;
        let Some(state) = parse_dump(&dump)
            .map_err(|e| DriverError::new(op, crate::driver::ERROR_INVALID_PARAMETER, e))?
        else {
            return Ok(Vec::new());
        };
        codec::encode(&state)
            .map(|b| b.to_vec())
            .map_err(|e| DriverError::new(op, crate::driver::ERROR_INVALID_PARAMETER, e.to_string()))
    }
}

/// Read the UP flag from `ip -o link show` output
fn parse_link_state(line: &str) -> AdapterState {
    let flags = line
        .split_once('<')
        .and_then(|(_, rest)| rest.split_once('>'))
        .map(|(flags, _)| flags)
        .unwrap_or("");
    if flags.split(',').any(|f| f == "UP") {
        AdapterState::Up
    } else {
        AdapterState::Down
    }
}

/// Render a device state as `wg setconf` input
fn render_setconf(state: &DeviceState) -> String {
    let mut out = String::from("[Interface]\n");
    if let Some(ref key) = state.interface.private_key {
        let _ = writeln!(out, "PrivateKey = {}", key.to_base64());
    }
    if let Some(port) = state.interface.listen_port {
        let _ = writeln!(out, "ListenPort = {}", port);
    }
    for p in &state.peers {
        let _ = writeln!(out, "\n[Peer]\nPublicKey = {}", p.public_key.to_base64());
        if let Some(ref psk) = p.preshared_key {
            let _ = writeln!(out, "PresharedKey = {}", psk.to_base64());
        }
        if let Some(endpoint) = p.endpoint {
            let _ = writeln!(out, "Endpoint = {}", endpoint);
        }
        if !p.allowed_ips.is_empty() {
            let list: Vec<String> = p.allowed_ips.iter().map(|c| c.to_string()).collect();
            let _ = writeln!(out, "AllowedIPs = {}", list.join(", "));
        }
        if p.persistent_keepalive > 0 {
            let _ = writeln!(out, "PersistentKeepalive = {}", p.persistent_keepalive);
        }
    }
    out
}

fn dump_field<'a>(fields: &[&'a str], i: usize) -> Result<&'a str, String> {
    fields
        .get(i)
        .copied()
        .ok_or_else(|| format!("dump line has {} fields, wanted at least {}", fields.len(), i + 1))
}

fn dump_key(value: &str) -> Result<Option<[u8; 32]>, String> {
    if value == "(none)" {
        return Ok(None);
    }
    decode_key(value).map(Some).map_err(|e| e.to_string())
}

fn dump_number(value: &str) -> Result<u64, String> {
    if value == "off" {
        return Ok(0);
    }
    value.parse().map_err(|_| format!("bad number '{}'", value))
}

/// Parse `wg show <if> dump`. Returns `None` when the interface has never
/// been given a key.
fn parse_dump(dump: &str) -> Result<Option<DeviceState>, String> {
    let mut lines = dump.lines().filter(|l| !l.trim().is_empty());
    let Some(first) = lines.next() else {
        return Ok(None);
    };

    let fields: Vec<&str> = first.split('\t').collect();
    let private_key = dump_key(dump_field(&fields, 0)?)?;
    let Some(private_key) = private_key else {
        return Ok(None);
    };
    let public_key = dump_key(dump_field(&fields, 1)?)?;
    let listen_port = dump_number(dump_field(&fields, 2)?)?;

    let mut flags = interface::HAS_PRIVATE_KEY;
    if public_key.is_some() {
        flags |= interface::HAS_PUBLIC_KEY;
    }
    if listen_port > 0 {
        flags |= interface::HAS_LISTEN_PORT;
    }
    let interface = InterfaceRecord {
        flags,
        listen_port: (listen_port > 0).then_some(listen_port as u16),
        private_key: Some(PrivateKey::from_bytes(private_key)),
        public_key: public_key.map(PublicKey::from_bytes),
    };

    let mut peers = Vec::new();
    for line in lines {
        let fields: Vec<&str> = line.split('\t').collect();
        let key_bytes = dump_key(dump_field(&fields, 0)?)?
            .ok_or_else(|| "peer without a public key".to_string())?;
        let mut record = PeerRecord::new(PublicKey::from_bytes(key_bytes));

        if let Some(psk) = dump_key(dump_field(&fields, 1)?)? {
            record.flags |= peer::HAS_PRESHARED_KEY;
            record.preshared_key = Some(PresharedKey::from_bytes(psk));
        }
        let endpoint = dump_field(&fields, 2)?;
        if endpoint != "(none)" {
            let addr: SocketAddr = endpoint
                .parse()
                .map_err(|_| format!("bad endpoint '{}'", endpoint))?;
            record.flags |= peer::HAS_ENDPOINT;
            record.endpoint = Some(addr);
        }
        let allowed = dump_field(&fields, 3)?;
        if allowed != "(none)" {
            for entry in allowed.split(',') {
                let cidr: Cidr = entry
                    .parse()
                    .map_err(|e| format!("bad allowed ip '{}': {}", entry, e))?;
                record.allowed_ips.push(cidr);
            }
        }
        record.last_handshake = dump_number(dump_field(&fields, 4)?)?;
        record.rx_bytes = dump_number(dump_field(&fields, 5)?)?;
        record.tx_bytes = dump_number(dump_field(&fields, 6)?)?;
        let keepalive = dump_number(dump_field(&fields, 7)?)?;
        if keepalive > 0 {
            record.flags |= peer::HAS_PERSISTENT_KEEPALIVE;
            record.persistent_keepalive = u16::try_from(keepalive).unwrap_or(u16::MAX);
        }
        peers.push(record);
    }

    Ok(Some(DeviceState { interface, peers }))
}

// ============================================================================
// Host network configuration
// ============================================================================

/// Split a default route into two half-space routes so the host's own
/// default route is neither replaced nor removed. Peer endpoints are kept
/// off the tunnel by their own host routes.
pub fn split_default(dest: &Cidr) -> Vec<Cidr> {
    if !dest.is_default() {
        return vec![*dest];
    }
    match dest.addr {
        IpAddr::V4(_) => vec![
            Cidr { addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED), prefix: 1 },
            Cidr { addr: IpAddr::V4(Ipv4Addr::new(128, 0, 0, 0)), prefix: 1 },
        ],
        IpAddr::V6(_) => vec![
            Cidr { addr: IpAddr::V6(Ipv6Addr::UNSPECIFIED), prefix: 1 },
            Cidr { addr: IpAddr::V6(Ipv6Addr::new(0x8000, 0, 0, 0, 0, 0, 0, 0)), prefix: 1 },
        ],
    }
}

/// Run `add` over `items` in order. If one fails, the ones already added are
/// undone before the error is returned.
fn add_all<T: std::fmt::Display>(
    items: &[T],
    mut add: impl FnMut(&T) -> TunnelResult<()>,
    mut undo: impl FnMut(&T) -> TunnelResult<()>,
) -> TunnelResult<()> {
    for (i, item) in items.iter().enumerate() {
        if let Err(e) = add(item) {
            for done in items[..i].iter().rev() {
                if let Err(undo_err) = undo(done) {
                    tracing::warn!("Could not undo {}: {}", done, undo_err);
                }
            }
            return Err(e);
        }
    }
    Ok(())
}

/// Gateway and device from `ip route get` output
fn parse_route_get(output: &str) -> Option<(Option<&str>, &str)> {
    let mut via = None;
    let mut dev = None;
    let mut words = output.split_whitespace();
    while let Some(word) = words.next() {
        match word {
            "via" => via = words.next(),
            "dev" => dev = words.next(),
            _ => {}
        }
    }
    dev.map(|d| (via, d))
}

fn family_flag(addr: &IpAddr) -> &'static str {
    match addr {
        IpAddr::V4(_) => "-4",
        IpAddr::V6(_) => "-6",
    }
}

/// `ip` / `resolvectl` based network configuration
#[derive(Debug, Default)]
pub struct LinuxNetwork {
    resolvers: Mutex<HashMap<String, Vec<IpAddr>>>,
}

impl LinuxNetwork {
    /// Create a network back-end
    pub fn new() -> Self {
        Self::default()
    }

    fn apply_resolvers(&self, iface: &str, servers: &[IpAddr]) -> TunnelResult<()> {
        let result = if servers.is_empty() {
            run_cmd("resolvectl", &["revert", iface], None)
        } else {
            let list: Vec<String> = servers.iter().map(|s| s.to_string()).collect();
            let mut args = vec!["dns", iface];
            args.extend(list.iter().map(String::as_str));
            run_cmd("resolvectl", &args, None)
        };
        result
            .map(|_| ())
            .map_err(|f| TunnelError::Route(format!("resolvectl failed: {}", f.message)))
    }

    fn write_forwarding(iface: &str, value: &str) -> TunnelResult<()> {
        let path = format!("/proc/sys/net/ipv4/conf/{}/forwarding", iface);
        std::fs::write(&path, value)
            .map_err(|e| TunnelError::Route(format!("cannot write {}: {}", path, e)))
    }
}

impl NetworkOps for LinuxNetwork {
    fn name(&self) -> &'static str {
        "linux"
    }

    fn add_address(&self, iface: &str, addr: &Cidr) -> TunnelResult<()> {
        run_ip_cmd(&["address", "add", &addr.to_string(), "dev", iface])
    }

    fn remove_address(&self, iface: &str, addr: &Cidr) -> TunnelResult<()> {
        run_ip_cmd(&["address", "del", &addr.to_string(), "dev", iface])
    }

    fn add_route(&self, iface: &str, dest: &Cidr) -> TunnelResult<()> {
        add_all(
            &split_default(dest),
            |half| run_ip_cmd(&[family_flag(&half.addr), "route", "add", &half.to_string(), "dev", iface]),
            |half| run_ip_cmd(&[family_flag(&half.addr), "route", "del", &half.to_string(), "dev", iface]),
        )
    }

    fn remove_route(&self, iface: &str, dest: &Cidr) -> TunnelResult<()> {
        let mut first_err = None;
        for half in split_default(dest) {
            if let Err(e) =
                run_ip_cmd(&[family_flag(&half.addr), "route", "del", &half.to_string(), "dev", iface])
            {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn set_mtu(&self, iface: &str, mtu: u16) -> TunnelResult<()> {
        run_ip_cmd(&["link", "set", "dev", iface, "mtu", &mtu.to_string()])
    }

    fn enable_forwarding(&self, iface: &str) -> TunnelResult<()> {
        Self::write_forwarding(iface, "1")
    }

    fn disable_forwarding(&self, iface: &str) -> TunnelResult<()> {
        Self::write_forwarding(iface, "0")
    }

    fn add_dns(&self, iface: &str, server: IpAddr) -> TunnelResult<()> {
        let mut resolvers = self.resolvers.lock().unwrap_or_else(PoisonError::into_inner);
        let list = resolvers.entry(iface.to_string()).or_default();
        list.push(server);
        if let Err(e) = self.apply_resolvers(iface, list) {
            list.pop();
            return Err(e);
        }
        Ok(())
    }

    fn remove_dns(&self, iface: &str, server: IpAddr) -> TunnelResult<()> {
        let mut resolvers = self.resolvers.lock().unwrap_or_else(PoisonError::into_inner);
        let list = resolvers.entry(iface.to_string()).or_default();
        list.retain(|s| *s != server);
        self.apply_resolvers(iface, list)
    }

    fn add_endpoint_route(&self, iface: &str, endpoint: IpAddr) -> TunnelResult<()> {
        let family = family_flag(&endpoint);
        let target = endpoint.to_string();
        let output = run_cmd("ip", &[family, "route", "get", &target], None).map_err(|f| {
            TunnelError::Route(format!("no route to endpoint {}: {}", endpoint, f.message))
        })?;
        let (via, dev) = parse_route_get(&output).ok_or_else(|| {
            TunnelError::Route(format!("cannot read route to {}: {}", endpoint, output.trim()))
        })?;
        if dev == iface {
            return Err(TunnelError::Route(format!(
                "endpoint {} already routes through {}",
                endpoint, iface
            )));
        }

        let host = Cidr::host(endpoint).to_string();
        let mut args = vec![family, "route", "add", host.as_str()];
        if let Some(gateway) = via {
            args.extend(["via", gateway]);
        }
        args.extend(["dev", dev]);
        run_ip_cmd(&args)
    }

    fn remove_endpoint_route(&self, _iface: &str, endpoint: IpAddr) -> TunnelResult<()> {
        let host = Cidr::host(endpoint).to_string();
        run_ip_cmd(&[family_flag(&endpoint), "route", "del", &host])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunwarden_protocol::encode_key;

    #[test]
    fn test_split_default() {
        let v4 = split_default(&"0.0.0.0/0".parse().unwrap());
        assert_eq!(v4.len(), 2);
        assert_eq!(v4[1].to_string(), "128.0.0.0/1");

        let v6 = split_default(&"::/0".parse().unwrap());
        assert_eq!(v6[1].to_string(), "8000::/1");

        let plain: Cidr = "10.0.0.0/8".parse().unwrap();
        assert_eq!(split_default(&plain), vec![plain]);
    }

    #[test]
    fn test_parse_link_state() {
        let up = "7: wg0: <POINTOPOINT,NOARP,UP,LOWER_UP> mtu 1420 qdisc noqueue state UNKNOWN";
        let down = "7: wg0: <POINTOPOINT,NOARP> mtu 1420 qdisc noop state DOWN";
        assert_eq!(parse_link_state(up), AdapterState::Up);
        assert_eq!(parse_link_state(down), AdapterState::Down);
    }

    #[test]
    fn test_parse_route_get() {
        let out = "203.0.113.5 via 192.168.1.1 dev eth0 src 192.168.1.20 uid 0 \n    cache \n";
        assert_eq!(parse_route_get(out), Some((Some("192.168.1.1"), "eth0")));

        let on_link = "192.168.1.7 dev eth0 src 192.168.1.20 uid 0 \n    cache \n";
        assert_eq!(parse_route_get(on_link), Some((None, "eth0")));

        assert_eq!(parse_route_get(""), None);
    }

    #[test]
    fn test_add_all_undoes_earlier_items() {
        let added = std::cell::RefCell::new(Vec::new());
        let halves = split_default(&"0.0.0.0/0".parse().unwrap());

        let result = add_all(
            &halves,
            |half| {
                if half.addr == IpAddr::V4(Ipv4Addr::new(128, 0, 0, 0)) {
                    return Err(TunnelError::Route("RTNETLINK answers: No buffer space".into()));
                }
                added.borrow_mut().push(*half);
                Ok(())
            },
            |half| {
                added.borrow_mut().retain(|c| c != half);
                Ok(())
            },
        );

        assert!(result.is_err());
        assert!(added.borrow().is_empty());
    }

    #[test]
    fn test_parse_dump() {
        let dump = format!(
            "{}\t{}\t51820\toff\n{}\t(none)\t203.0.113.5:51820\t0.0.0.0/0,::/0\t1700000000\t4096\t1024\t25\n",
            encode_key(&[1u8; 32]),
            encode_key(&[9u8; 32]),
            encode_key(&[2u8; 32]),
        );
        let state = parse_dump(&dump).unwrap().unwrap();

        assert_eq!(state.interface.listen_port, Some(51820));
        assert_eq!(state.peers.len(), 1);
        let p = &state.peers[0];
        assert_eq!(p.rx_bytes, 4096);
        assert_eq!(p.tx_bytes, 1024);
        assert_eq!(p.persistent_keepalive, 25);
        assert_eq!(p.allowed_ips.len(), 2);
        assert!(p.preshared_key.is_none());
        assert!(codec::encode(&state).is_ok());
    }

    #[test]
    fn test_parse_dump_unconfigured() {
        assert!(parse_dump("(none)\t(none)\t0\toff\n").unwrap().is_none());
        assert!(parse_dump("").unwrap().is_none());
    }

    #[test]
    fn test_render_setconf() {
        let config = tunwarden_protocol::TunnelConfig::new(PrivateKey::from_bytes([1u8; 32]))
            .with_peer(
                tunwarden_protocol::PeerConfig::new(PublicKey::from_bytes([2u8; 32]))
                    .with_endpoint("203.0.113.5:51820".parse().unwrap())
                    .with_allowed_ip("10.0.0.0/8".parse().unwrap())
                    .with_keepalive(25),
            );
        let text = render_setconf(&DeviceState::from_config(&config));
        assert!(text.contains("[Peer]"));
        assert!(text.contains("AllowedIPs = 10.0.0.0/8"));
        assert!(text.contains("PersistentKeepalive = 25"));
        assert!(!text.contains("Address"));
    }

    #[test]
    fn test_bad_dump_key_length() {
        let dump = format!(
            "{}\t(none)\t0\toff\nAAAA\t(none)\t(none)\t(none)\t0\t0\t0\toff\n",
            encode_key(&[1u8; 32])
        );
        assert!(parse_dump(&dump).is_err());
    }
}
