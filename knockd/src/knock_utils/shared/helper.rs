use std::net::IpAddr;

use pnet::datalink::{self, NetworkInterface};
use pnet::util::MacAddr;

use crate::knock_utils::shared::types_and_config::{KnockErr, KnockErrWithMsg};

pub fn find_interface_index_by_name(name: &str) -> Option<u32> {
    datalink::interfaces()
        .into_iter()
        .find(|iface| iface.name == name)
        .map(|iface| iface.index)
}

/// Resolves an empty interface name to the best guess on this host.
pub fn resolve_interface(name: &str) -> Result<String, KnockErrWithMsg> {
    if !name.is_empty() {
        return Ok(name.to_string());
    }
    let ifaces = datalink::interfaces();
    select_default_interface(&ifaces)
        .map(|iface| iface.name.clone())
        .ok_or(KnockErrWithMsg {
            err: KnockErr::Config,
            msg: String::from("this system has no network interfaces"),
        })
}

fn is_ethernet(iface: &NetworkInterface) -> bool {
    matches!(iface.mac, Some(mac) if mac != MacAddr::zero())
}

fn is_usable(iface: &NetworkInterface) -> bool {
    is_ethernet(iface) && iface.is_up() && iface.is_running() && !iface.is_loopback()
}

fn ipv4_addrs(iface: &NetworkInterface) -> impl Iterator<Item = std::net::Ipv4Addr> + '_ {
    iface.ips.iter().filter_map(|net| match net.ip() {
        IpAddr::V4(ip) => Some(ip),
        IpAddr::V6(_) => None,
    })
}

/// Each stage narrows the candidates, the first interface of the narrowest
/// non-empty stage wins: ethernet, up and not loopback, IPv4 assigned,
/// public IPv4 assigned.
pub fn select_default_interface(ifaces: &[NetworkInterface]) -> Option<&NetworkInterface> {
    let mut selected = ifaces.first()?;

    let ethernet: Vec<&NetworkInterface> = ifaces.iter().filter(|i| is_ethernet(i)).collect();
    let Some(first) = ethernet.first() else {
        return Some(selected);
    };
    selected = first;

    let usable: Vec<&NetworkInterface> = ethernet.into_iter().filter(|i| is_usable(i)).collect();
    let Some(first) = usable.first() else {
        return Some(selected);
    };
    selected = first;

    let with_v4: Vec<&NetworkInterface> = usable
        .into_iter()
        .filter(|i| ipv4_addrs(i).next().is_some())
        .collect();
    let Some(first) = with_v4.first() else {
        return Some(selected);
    };
    selected = first;

    if let Some(public) = with_v4
        .into_iter()
        .find(|i| ipv4_addrs(i).any(|ip| !ip.is_private() && !ip.is_link_local()))
    {
        selected = public;
    }
    Some(selected)
}

// Bump the memlock rlimit. This is needed for older kernels that don't use the
// new memcg based accounting, see https://lwn.net/Articles/837122/
pub fn raise_memlock_rlimit() {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        log::debug!("remove limit on locked memory failed, ret is: {ret}");
    }
}
