//! meshwire: a userspace L3 mesh forwarder.
//!
//! Each node owns a TUN device and a mesh of TCP links to its peers.
//! Packets read from TUN are forwarded to the peer owning the destination
//! address; bytes arriving from peers are reassembled into whole packets
//! and written back to TUN. A kernel ipset tracks the live peer set so the
//! packet filter only routes into TUN what the mesh can actually deliver.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn};

mod config;
mod endpoint;
mod engine;
mod framer;
mod peers;
mod poll;
mod reload;
mod ring;
mod routes;
mod stats;

use config::Config;

#[derive(Parser, Debug)]
#[command(author, version, about = "Userspace L3 mesh forwarder", long_about = None)]
struct Args {
    /// Path to the TOML config file
    #[arg(short = 'C', long)]
    config: Option<PathBuf>,
    /// Peer roster file, one host per line
    #[arg(long)]
    peers: Option<PathBuf>,
    /// TCP port every mesh node listens on and dials at
    #[arg(short, long)]
    port: Option<u16>,
    /// This node's IPv4 mesh address
    #[arg(long)]
    self_v4: Option<Ipv4Addr>,
    /// This node's IPv6 mesh address
    #[arg(long)]
    self_v6: Option<Ipv6Addr>,
    /// Kernel ipset mirroring the live peer set
    #[arg(long)]
    ipset: Option<String>,
    /// TUN interface name
    #[arg(long)]
    tun_name: Option<String>,
    /// TUN interface MTU
    #[arg(long)]
    mtu: Option<u16>,
}

extern "C" fn on_reload_signal(_: libc::c_int) {
    engine::request_reload();
}

extern "C" fn on_stop_signal(_: libc::c_int) {
    engine::request_stop();
}

fn install_signal_handlers() {
    let reload: extern "C" fn(libc::c_int) = on_reload_signal;
    let stop: extern "C" fn(libc::c_int) = on_stop_signal;
    unsafe {
        libc::signal(libc::SIGHUP, reload as libc::sighandler_t);
        libc::signal(libc::SIGINT, stop as libc::sighandler_t);
        libc::signal(libc::SIGTERM, stop as libc::sighandler_t);
        // Peer sockets use MSG_NOSIGNAL, but ipset subprocesses may not.
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut cfg = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default(),
    };
    if let Some(peers) = args.peers {
        cfg.node.peer_file = peers;
    }
    if let Some(port) = args.port {
        cfg.node.listen_port = port;
    }
    if let Some(addr) = args.self_v4 {
        cfg.node.self_v4 = Some(addr);
    }
    if let Some(addr) = args.self_v6 {
        cfg.node.self_v6 = Some(addr);
    }
    if let Some(ipset) = args.ipset {
        cfg.node.ipset = ipset;
    }
    if let Some(name) = args.tun_name {
        cfg.tun.name = name;
    }
    if let Some(mtu) = args.mtu {
        cfg.tun.mtu = mtu;
    }

    if cfg.node.self_v4.is_none() && cfg.node.self_v6.is_none() {
        bail!("at least one of --self-v4 / --self-v6 (or the config equivalents) is required");
    }
    if unsafe { libc::geteuid() } != 0 {
        warn!("not running as root; tun creation and ipset updates may fail");
    }

    let mut tun_cfg = tun2::Configuration::default();
    tun_cfg.tun_name(&cfg.tun.name).mtu(cfg.tun.mtu);
    if let Some(addr) = cfg.tun.address.or(cfg.node.self_v4) {
        tun_cfg.address(addr).netmask(cfg.tun.netmask);
    }
    tun_cfg.up();
    #[cfg(target_os = "linux")]
    tun_cfg.platform_config(|p| {
        p.packet_information(false);
    });
    let device = tun2::create(&tun_cfg)
        .with_context(|| format!("failed to create TUN interface {}", cfg.tun.name))?;
    info!("tun interface {} up (mtu {})", cfg.tun.name, cfg.tun.mtu);

    // The engine owns its copy of the fd; the device handle keeps the
    // interface alive until the loop exits.
    let dup = unsafe { libc::dup(device.as_raw_fd()) };
    if dup < 0 {
        return Err(std::io::Error::last_os_error()).context("could not dup tun fd");
    }
    let tun_fd = unsafe { OwnedFd::from_raw_fd(dup) };

    install_signal_handlers();

    info!(
        "starting mesh forwarder on port {} (peers from {})",
        cfg.node.listen_port,
        cfg.node.peer_file.display()
    );
    let stats = engine::run(
        tun_fd,
        &cfg.node.peer_file,
        cfg.node.self_v4,
        cfg.node.self_v6,
        cfg.node.listen_port,
        &cfg.node.ipset,
    )?;
    drop(device);

    print!("{}", stats.render());
    Ok(())
}
