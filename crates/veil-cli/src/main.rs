//! Veil CLI tools: key generation, validation, and a loopback self-test.

#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::io::BufRead;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, info};
use veil_common::{PeerConfig, TimerConfig, TunnelConfig};
use veil_core::MAX_PACKET_SIZE;
use veil_crypto::keys::{self, PublicKey, StaticSecret};
use veil_tunnel::{Action, Tunnel};

#[derive(Parser, Debug)]
#[command(name = "veil")]
#[command(about = "Veil tunnel tools")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Encoding {
    Base64,
    Hex,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a new private key
    Genkey {
        #[arg(short, long, value_enum, default_value = "base64")]
        encoding: Encoding,
    },

    /// Derive the public key of a private key read from stdin
    Pubkey {
        #[arg(short, long, value_enum, default_value = "base64")]
        encoding: Encoding,
    },

    /// Check that a key decodes to 32 usable bytes
    Check {
        key: String,
    },

    /// Re-encode a key as base64 or hex
    Convert {
        key: String,
        #[arg(short, long, value_enum)]
        to: Encoding,
    },

    /// Print a peer config with a fresh private key
    Config {
        /// The remote side's public key
        #[arg(short, long)]
        peer: String,
        #[arg(long, default_value_t = 0)]
        persistent_keepalive: u16,
    },

    /// Validate a peer config file and show the resulting public key
    CheckConfig {
        path: String,
    },

    /// Run two tunnels over loopback UDP and exchange packets
    SelfTest {
        #[arg(short, long, default_value_t = 16)]
        packets: usize,
        /// Give up after this many seconds
        #[arg(long, default_value_t = 5)]
        timeout: u64,
    },

    /// Show version information
    Version,
}

fn main() -> Result<()> {
    veil_common::init_tracing();

    let args = Args::parse();

    match args.command {
        Command::Genkey { encoding } => {
            let private = keys::generate();
            println!("{}", encode(private.as_bytes(), encoding));
        }
        Command::Pubkey { encoding } => {
            let mut line = String::new();
            std::io::stdin()
                .lock()
                .read_line(&mut line)
                .context("reading private key from stdin")?;
            let private = decode_private(line.trim())?;
            let public = keys::derive_public(&private);
            println!("{}", encode(public.as_bytes(), encoding));
        }
        Command::Check { key } => {
            if !keys::is_valid_encoded(&key) {
                let err = keys::decode_key(&key).err();
                bail!("invalid key: {}", err.map_or_else(String::new, |e| e.to_string()));
            }
            println!("valid");
        }
        Command::Convert { key, to } => {
            let bytes = keys::decode_key(&key)?;
            println!("{}", encode(&bytes, to));
        }
        Command::Config {
            peer,
            persistent_keepalive,
        } => {
            keys::decode_key(&peer).context("peer public key")?;
            let config = PeerConfig {
                private_key: keys::encode_base64(keys::generate().as_bytes()),
                peer_public_key: peer,
                preshared_key: None,
                tunnel: TunnelConfig {
                    persistent_keepalive_secs: persistent_keepalive,
                    ..TunnelConfig::default()
                },
            };
            println!("{}", config.to_json()?);
        }
        Command::CheckConfig { path } => {
            let public = check_config(&path)?;
            println!("{path}: ok");
            println!("public key: {}", keys::encode_base64(public.as_bytes()));
        }
        Command::SelfTest { packets, timeout } => {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            rt.block_on(self_test(packets, Duration::from_secs(timeout)))?;
        }
        Command::Version => {
            println!("veil {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

fn encode(key: &[u8; 32], encoding: Encoding) -> String {
    match encoding {
        Encoding::Base64 => keys::encode_base64(key),
        Encoding::Hex => keys::encode_hex(key),
    }
}

fn decode_private(encoded: &str) -> Result<StaticSecret> {
    Ok(StaticSecret::from(keys::decode_key(encoded)?))
}

fn config_key(field: &str, encoded: &str) -> veil_common::Result<[u8; 32]> {
    keys::decode_key(encoded).map_err(|e| veil_common::Error::key(format!("{field}: {e}")))
}

/// Load and validate a peer config, returning the local public key.
fn check_config(path: &str) -> veil_common::Result<PublicKey> {
    let config = PeerConfig::load(path)?;
    let private = StaticSecret::from(config_key("private_key", &config.private_key)?);
    config_key("peer_public_key", &config.peer_public_key)?;
    if let Some(psk) = &config.preshared_key {
        config_key("preshared_key", psk)?;
    }
    Ok(keys::derive_public(&private))
}

/// One side of the self-test: a tunnel bound to a connected socket.
struct Endpoint {
    name: &'static str,
    tunnel: Tunnel,
    socket: UdpSocket,
    delivered: usize,
    echo: bool,
}

impl Endpoint {
    async fn send(&self, bytes: &[u8]) -> Result<()> {
        self.socket.send(bytes).await?;
        Ok(())
    }

    /// Feed one datagram to the tunnel and act on the result, then drain
    /// anything queued behind a fresh session.
    async fn handle(&mut self, datagram: &[u8], out: &mut [u8], reply: &mut [u8]) -> Result<()> {
        match self.tunnel.read(datagram, out) {
            Action::WriteToNetwork(n) => self.send(&out[..n]).await?,
            Action::WriteToTunnel(n, family) => {
                self.delivered += 1;
                debug!(endpoint = self.name, len = n, ?family, "packet delivered");
                if self.echo {
                    match self.tunnel.write(&out[..n], reply) {
                        Action::WriteToNetwork(m) => self.send(&reply[..m]).await?,
                        Action::Error(e) => return Err(e.into()),
                        _ => {}
                    }
                }
            }
            Action::Done => {}
            Action::Error(e) => return Err(e.into()),
        }
        loop {
            match self.tunnel.read(&[], out) {
                Action::WriteToNetwork(n) => self.send(&out[..n]).await?,
                Action::Error(e) => return Err(e.into()),
                _ => break,
            }
        }
        Ok(())
    }

    async fn tick(&mut self, out: &mut [u8]) -> Result<()> {
        match self.tunnel.tick(out) {
            Action::WriteToNetwork(n) => self.send(&out[..n]).await,
            Action::Error(e) => Err(e.into()),
            _ => Ok(()),
        }
    }
}

async fn connected_pair() -> Result<(UdpSocket, UdpSocket)> {
    let a = UdpSocket::bind("127.0.0.1:0").await?;
    let b = UdpSocket::bind("127.0.0.1:0").await?;
    a.connect(b.local_addr()?).await?;
    b.connect(a.local_addr()?).await?;
    Ok((a, b))
}

/// An IPv4 header followed by its sequence number.
fn numbered_packet(seq: usize) -> Vec<u8> {
    let payload = (seq as u64).to_be_bytes();
    let mut packet = vec![0u8; 20];
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&((20 + payload.len()) as u16).to_be_bytes());
    packet[8] = 64;
    packet[12..16].copy_from_slice(&[10, 99, 0, 1]);
    packet[16..20].copy_from_slice(&[10, 99, 0, 2]);
    packet.extend_from_slice(&payload);
    packet
}

async fn self_test(packets: usize, limit: Duration) -> Result<()> {
    let a_private = keys::generate();
    let b_private = keys::generate();
    let a_public: PublicKey = keys::derive_public(&a_private);
    let b_public: PublicKey = keys::derive_public(&b_private);
    let (a_socket, b_socket) = connected_pair().await?;
    info!(
        a = %a_socket.local_addr()?,
        b = %b_socket.local_addr()?,
        "starting loopback self-test"
    );

    let responder = TunnelConfig {
        index_prefix: 0x0000B2,
        timers: TimerConfig {
            startup_grace_ms: 60_000,
            ..TimerConfig::default()
        },
        ..TunnelConfig::default()
    };
    let mut a = Endpoint {
        name: "a",
        tunnel: Tunnel::new(a_private, b_public, None, 0, 0x0000A1),
        socket: a_socket,
        delivered: 0,
        echo: false,
    };
    let mut b = Endpoint {
        name: "b",
        // B only answers; it never races A with its own startup handshake.
        tunnel: Tunnel::with_config(b_private, a_public, None, &responder)?,
        socket: b_socket,
        delivered: 0,
        echo: true,
    };

    let mut out = vec![0u8; MAX_PACKET_SIZE];
    let mut reply = vec![0u8; MAX_PACKET_SIZE];
    let mut rx_a = vec![0u8; MAX_PACKET_SIZE];
    let mut rx_b = vec![0u8; MAX_PACKET_SIZE];

    for seq in 0..packets {
        match a.tunnel.write(&numbered_packet(seq), &mut out) {
            Action::WriteToNetwork(n) => a.send(&out[..n]).await?,
            Action::Error(e) => return Err(e.into()),
            _ => {}
        }
    }

    let deadline = tokio::time::sleep(limit);
    tokio::pin!(deadline);
    let mut ticker = tokio::time::interval(Duration::from_millis(100));

    while a.delivered < packets {
        tokio::select! {
            received = a.socket.recv(&mut rx_a) => {
                let n = received?;
                a.handle(&rx_a[..n], &mut out, &mut reply).await?;
            }
            received = b.socket.recv(&mut rx_b) => {
                let n = received?;
                b.handle(&rx_b[..n], &mut out, &mut reply).await?;
            }
            _ = ticker.tick() => {
                a.tick(&mut out).await?;
                b.tick(&mut out).await?;
            }
            _ = &mut deadline => {
                bail!(
                    "self-test timed out: {} of {packets} echoes received",
                    a.delivered
                );
            }
        }
    }

    println!("{} packets echoed through the tunnel", a.delivered);
    println!("{}", serde_json::to_string_pretty(&a.tunnel.stats())?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from(["veil", "genkey", "--encoding", "hex"]).unwrap();
        assert!(matches!(
            args.command,
            Command::Genkey {
                encoding: Encoding::Hex
            }
        ));
        assert!(Args::try_parse_from(["veil", "convert", "abc"]).is_err());
    }

    #[test]
    fn test_encode_round_trips_through_decode() {
        let key = [3u8; 32];
        for encoding in [Encoding::Base64, Encoding::Hex] {
            assert_eq!(keys::decode_key(&encode(&key, encoding)).unwrap(), key);
        }
    }

    #[test]
    fn test_check_config_reports_bad_key() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("veil-check-config-{}.json", std::process::id()));
        let peer = keys::encode_base64(keys::derive_public(&keys::generate()).as_bytes());
        let private = keys::generate();
        let mut config = PeerConfig {
            private_key: keys::encode_hex(private.as_bytes()),
            peer_public_key: peer,
            preshared_key: Some("not a key".into()),
            tunnel: TunnelConfig::default(),
        };

        std::fs::write(&path, config.to_json().unwrap()).unwrap();
        let err = check_config(path.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, veil_common::Error::Key(m) if m.starts_with("preshared_key")));

        config.preshared_key = None;
        std::fs::write(&path, config.to_json().unwrap()).unwrap();
        let public = check_config(path.to_str().unwrap()).unwrap();
        assert_eq!(public.as_bytes(), keys::derive_public(&private).as_bytes());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_numbered_packet_is_valid_ipv4() {
        let packet = numbered_packet(7);
        assert_eq!(
            veil_core::ip::inspect(&packet),
            Some((veil_core::AddressFamily::V4, packet.len()))
        );
    }

    #[test]
    fn test_self_test_over_loopback() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(self_test(4, Duration::from_secs(5))).unwrap();
    }
}
