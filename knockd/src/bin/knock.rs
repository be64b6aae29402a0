use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::info;
use tokio::net::{UdpSocket, lookup_host};

#[derive(Parser, Debug)]
#[command(version, about = "Sends a port knock sequence", long_about = None)]
struct KnockArgs {
    /// Host name or IPv4 address of the knockd host
    host: String,

    /// Destination ports, knocked in the given order
    #[arg(required = true)]
    ports: Vec<u16>,

    /// Pause between two knocks in milliseconds
    #[arg(long, default_value_t = 200, value_parser = clap::value_parser!(u64).range(1..=1500))]
    jitter_ms: u64,
}

async fn resolve_ipv4(host: &str) -> Result<Ipv4Addr, anyhow::Error> {
    lookup_host((host, 0))
        .await
        .with_context(|| format!("failed to resolve {}", host))?
        .find_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(*v4.ip()),
            SocketAddr::V6(_) => None,
        })
        .with_context(|| format!("{} has no IPv4 address", host))
}

/// One empty datagram per port, so every knock is a minimal 42 byte frame.
async fn send_knocks(
    socket: &UdpSocket,
    target: Ipv4Addr,
    ports: &[u16],
    jitter: Duration,
) -> Result<(), anyhow::Error> {
    for (i, port) in ports.iter().enumerate() {
        if i > 0 {
            tokio::time::sleep(jitter).await;
        }
        socket
            .send_to(&[], (target, *port))
            .await
            .with_context(|| format!("failed to knock {}:{}", target, port))?;
        info!("knocked {}:{}", target, port);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = KnockArgs::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let target = resolve_ipv4(&args.host).await?;
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .await
        .context("failed to bind udp socket")?;

    info!("Transmitting knock sequence {:?} to {}", args.ports, target);
    send_knocks(
        &socket,
        target,
        &args.ports,
        Duration::from_millis(args.jitter_ms),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jitter_bounds() {
        let parse = |jitter: &str| {
            KnockArgs::try_parse_from(["knock", "10.0.0.1", "7000", "--jitter-ms", jitter])
        };
        assert!(parse("0").is_err());
        assert!(parse("1501").is_err());
        assert_eq!(parse("1").unwrap().jitter_ms, 1);
        assert_eq!(parse("1500").unwrap().jitter_ms, 1500);

        let defaults = KnockArgs::try_parse_from(["knock", "10.0.0.1", "7000", "8000"]).unwrap();
        assert_eq!(defaults.jitter_ms, 200);
        assert_eq!(defaults.ports, vec![7000, 8000]);
    }

    #[test]
    fn test_ports_required() {
        assert!(KnockArgs::try_parse_from(["knock", "10.0.0.1"]).is_err());
        assert!(KnockArgs::try_parse_from(["knock", "10.0.0.1", "70000"]).is_err());
    }

    #[tokio::test]
    async fn test_resolve_ipv4_literal() {
        assert_eq!(
            resolve_ipv4("127.0.0.1").await.unwrap(),
            Ipv4Addr::LOCALHOST
        );
    }

    #[tokio::test]
    async fn test_send_knocks_in_order() {
        let first = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let second = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let ports = [
            first.local_addr().unwrap().port(),
            second.local_addr().unwrap().port(),
        ];
        let client = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();

        send_knocks(&client, Ipv4Addr::LOCALHOST, &ports, Duration::from_millis(1))
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        for socket in [&first, &second] {
            let (len, from) = tokio::time::timeout(Duration::from_secs(1), socket.recv_from(&mut buf))
                .await
                .expect("knock must arrive")
                .unwrap();
            assert_eq!(len, 0);
            assert_eq!(from, client.local_addr().unwrap());
        }
    }
}
