//! Kernel route synchronization.
//!
//! The packet filter only steers traffic into the TUN device for addresses
//! present in a kernel ipset, so the set must mirror the live peer set:
//! added when a link comes up, removed when it goes down.

use std::net::IpAddr;
use std::process::Command;

use anyhow::{bail, Context, Result};
use log::{debug, warn};

/// Sink for peer-liveness route updates.
///
/// `add` failing aborts the endpoint being set up; `remove` failures are
/// logged and swallowed, since the endpoint is going away regardless.
pub trait RouteSink: Send {
    fn add(&mut self, addr: IpAddr) -> Result<()>;
    fn remove(&mut self, addr: IpAddr);
}

/// Maintains the set via the `ipset` command-line tool.
pub struct IpsetSink {
    set_name: String,
}

impl IpsetSink {
    pub fn new(set_name: impl Into<String>) -> Self {
        Self {
            set_name: set_name.into(),
        }
    }

    fn run(&self, op: &str, addr: IpAddr) -> Result<()> {
        let status = Command::new("ipset")
            .arg(op)
            .arg(&self.set_name)
            .arg(addr.to_string())
            .status()
            .with_context(|| format!("failed to spawn ipset {op}"))?;
        if !status.success() {
            bail!("ipset {op} {} {addr} exited with {status}", self.set_name);
        }
        Ok(())
    }
}

impl RouteSink for IpsetSink {
    fn add(&mut self, addr: IpAddr) -> Result<()> {
        debug!("ipset add {} {addr}", self.set_name);
        self.run("add", addr)
    }

    fn remove(&mut self, addr: IpAddr) {
        debug!("ipset del {} {addr}", self.set_name);
        if let Err(err) = self.run("del", addr) {
            warn!("could not drop route for {addr}: {err:#}");
        }
    }
}
