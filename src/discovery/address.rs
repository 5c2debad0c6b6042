//! 本机地址探测
//!
//! 没有显式配置 base URL 时，从网卡地址中挑选一个用于注册

use std::net::{IpAddr, Ipv6Addr};
use tracing::{debug, warn};

/// 地址优先级，数值越小越优先
fn rank(ip: &IpAddr) -> u8 {
    match ip {
        IpAddr::V4(v4) if !v4.is_loopback() => 0,
        IpAddr::V6(v6) if !v6.is_loopback() && !is_link_local(v6) => 1,
        IpAddr::V6(v6) if is_link_local(v6) => 2,
        IpAddr::V4(_) => 3,
        IpAddr::V6(_) => 4,
    }
}

fn is_link_local(v6: &Ipv6Addr) -> bool {
    (v6.segments()[0] & 0xffc0) == 0xfe80
}

/// 按优先级选出最合适的地址，优先级相同时保持枚举顺序
pub fn pick_address<I>(addrs: I) -> Option<IpAddr>
where
    I: IntoIterator<Item = IpAddr>,
{
    addrs
        .into_iter()
        .filter(|ip| !ip.is_unspecified())
        .enumerate()
        .min_by_key(|(position, ip)| (rank(ip), *position))
        .map(|(_, ip)| ip)
}

/// 格式化为 `http://a.b.c.d:port` 或 `http://[v6]:port`
pub fn format_base_url(ip: IpAddr, port: u16) -> String {
    match ip {
        IpAddr::V4(v4) => format!("http://{}:{}", v4, port),
        // Ipv6Addr 的 Display 不带 zone id
        IpAddr::V6(v6) => format!("http://[{}]:{}", v6, port),
    }
}

/// 探测本机的 base URL
pub fn detect_base_url(port: u16) -> Option<String> {
    let interfaces = match get_if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces,
        Err(e) => {
            warn!(error = %e, "⚠️ Failed to enumerate network interfaces");
            return None;
        }
    };

    let ip = pick_address(interfaces.iter().map(|iface| iface.ip()))?;
    let url = format_base_url(ip, port);
    debug!(url = %url, "Detected local base URL");
    Some(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn prefers_ipv4_non_loopback() {
        let picked = pick_address(vec![ip("127.0.0.1"), ip("::1"), ip("fe80::1"), ip("2001:db8::5"), ip("10.1.2.3")]);
        assert_eq!(picked, Some(ip("10.1.2.3")));
    }

    #[test]
    fn falls_back_through_priority_order() {
        assert_eq!(pick_address(vec![ip("127.0.0.1"), ip("fe80::1"), ip("2001:db8::5")]), Some(ip("2001:db8::5")));
        assert_eq!(pick_address(vec![ip("::1"), ip("127.0.0.1"), ip("fe80::1")]), Some(ip("fe80::1")));
        assert_eq!(pick_address(vec![ip("::1"), ip("127.0.0.1")]), Some(ip("127.0.0.1")));
        assert_eq!(pick_address(vec![ip("::1")]), Some(ip("::1")));
        assert_eq!(pick_address(Vec::<IpAddr>::new()), None);
    }

    #[test]
    fn ties_keep_enumeration_order() {
        assert_eq!(pick_address(vec![ip("10.0.0.2"), ip("10.0.0.1")]), Some(ip("10.0.0.2")));
    }

    #[test]
    fn formats_ipv6_in_brackets() {
        assert_eq!(format_base_url(ip("10.0.0.1"), 8080), "http://10.0.0.1:8080");
        assert_eq!(format_base_url(ip("2001:db8::5"), 80), "http://[2001:db8::5]:80");
    }
}
