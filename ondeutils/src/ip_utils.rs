use std::net::{IpAddr, Ipv4Addr, UdpSocket};

use get_if_addrs::get_if_addrs;

/// Devine l'adresse IP locale utilisée pour les connexions sortantes.
///
/// Crée un socket UDP lié à `0.0.0.0:0` et le "connecte" vers un serveur
/// public : le système choisit alors l'interface de sortie sans émettre le
/// moindre paquet. En cas d'échec, retourne `127.0.0.1`.
pub fn guess_local_ip() -> IpAddr {
    match UdpSocket::bind("0.0.0.0:0") {
        Ok(socket) => {
            if socket.connect("8.8.8.8:80").is_ok() {
                if let Ok(local_addr) = socket.local_addr() {
                    return local_addr.ip();
                }
            }
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
        Err(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
    }
}

/// Retourne la première adresse IPv4 de l'interface nommée `name`.
///
/// Utilisé par les sources et sinks UDP/RTP pour honorer le paramètre
/// d'URL `?if=eth0`. Les adresses de loopback ne sont pas filtrées : si
/// l'appelant demande `lo`, il obtient `127.0.0.1`.
pub fn interface_addr(name: &str) -> Option<Ipv4Addr> {
    let interfaces = get_if_addrs().ok()?;
    for iface in interfaces {
        if iface.name != name {
            continue;
        }
        if let IpAddr::V4(addr) = iface.ip() {
            return Some(addr);
        }
    }
    tracing::warn!("interface {} introuvable ou sans adresse IPv4", name);
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guess_local_ip_is_ipv4() {
        let ip = guess_local_ip();
        assert!(ip.is_ipv4());
    }

    #[test]
    fn test_unknown_interface_yields_none() {
        assert!(interface_addr("nope0").is_none());
    }
}
