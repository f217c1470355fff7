// SoundWatch - Broker Address Resolution
//
// DNS can hang for a long time on a flaky link. The lookup runs on a helper
// thread and reports back through a single-slot channel; if it has not
// answered in time, the configured fallback address is used instead.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use crate::config::STACK_RESOLVER;

/// Resolve `host` with the system resolver.
pub fn resolve_with_fallback(host: &str, port: u16, fallback: IpAddr, timeout: Duration) -> SocketAddr {
    resolve_via(
        |host, port| {
            (host, port)
                .to_socket_addrs()
                .ok()
                .and_then(|mut addrs| addrs.find(SocketAddr::is_ipv4))
        },
        host,
        port,
        fallback,
        timeout,
    )
}

/// Resolve `host` with `lookup`, giving up after `timeout`.
pub fn resolve_via<F>(lookup: F, host: &str, port: u16, fallback: IpAddr, timeout: Duration) -> SocketAddr
where
    F: FnOnce(&str, u16) -> Option<SocketAddr> + Send + 'static,
{
    let fallback = SocketAddr::new(fallback, port);

    if let Ok(ip) = host.parse::<IpAddr>() {
        return SocketAddr::new(ip, port);
    }

    let (tx, rx) = mpsc::sync_channel(1);
    let name = host.to_owned();
    let spawned = thread::Builder::new()
        .name("dns".into())
        .stack_size(STACK_RESOLVER)
        .spawn(move || {
            // The receiver may be gone if we answered too late.
            let _ = tx.send(lookup(&name, port));
        });

    if let Err(e) = spawned {
        log::warn!("Could not start resolver thread ({}), using {}", e, fallback);
        return fallback;
    }

    match rx.recv_timeout(timeout) {
        Ok(Some(addr)) => {
            log::info!("Resolved {} to {}", host, addr.ip());
            addr
        }
        Ok(None) => {
            log::warn!("DNS lookup for {} failed, using {}", host, fallback);
            fallback
        }
        Err(_) => {
            log::warn!("DNS lookup for {} timed out, using {}", host, fallback);
            fallback
        }
    }
}
