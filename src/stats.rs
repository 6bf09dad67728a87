use log::info;

/// One traffic direction: packets/bytes moved and packets/bytes dropped.
/// The engine is single-threaded, so plain integers suffice.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Counter {
    pub packets: u64,
    pub bytes: u64,
    pub drop_packets: u64,
    pub drop_bytes: u64,
}

impl Counter {
    pub fn account(&mut self, bytes: usize) {
        self.packets += 1;
        self.bytes += bytes as u64;
    }

    pub fn account_drop(&mut self, bytes: usize) {
        self.drop_packets += 1;
        self.drop_bytes += bytes as u64;
    }
}

/// Counters for the four directions: TUN reads (`tun_rx`), deliveries
/// toward TUN (`tun_tx`), packets framed out of peer streams (`world_rx`)
/// and packets sent toward peers (`world_tx`).
#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    pub tun_rx: Counter,
    pub tun_tx: Counter,
    pub world_rx: Counter,
    pub world_tx: Counter,
}

impl Stats {
    /// Format counters in Prometheus exposition format.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (name, c) in [
            ("tun_rx", &self.tun_rx),
            ("tun_tx", &self.tun_tx),
            ("world_rx", &self.world_rx),
            ("world_tx", &self.world_tx),
        ] {
            out.push_str(&format!(
                "# TYPE meshwire_{name}_packets_total counter\n\
                 meshwire_{name}_packets_total {}\n\
                 # TYPE meshwire_{name}_bytes_total counter\n\
                 meshwire_{name}_bytes_total {}\n\
                 # TYPE meshwire_{name}_drop_packets_total counter\n\
                 meshwire_{name}_drop_packets_total {}\n\
                 # TYPE meshwire_{name}_drop_bytes_total counter\n\
                 meshwire_{name}_drop_bytes_total {}\n",
                c.packets, c.bytes, c.drop_packets, c.drop_bytes,
            ));
        }
        out
    }

    pub fn log_summary(&self) {
        info!(
            "traffic: tun rx {}p/{}B tx {}p/{}B (dropped {}p), world rx {}p/{}B tx {}p/{}B (dropped {}p)",
            self.tun_rx.packets,
            self.tun_rx.bytes,
            self.tun_tx.packets,
            self.tun_tx.bytes,
            self.tun_tx.drop_packets,
            self.world_rx.packets,
            self.world_rx.bytes,
            self.world_tx.packets,
            self.world_tx.bytes,
            self.world_tx.drop_packets,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_tracks_packets_and_bytes() {
        let mut c = Counter::default();
        c.account(100);
        c.account(50);
        c.account_drop(1500);
        assert_eq!(c.packets, 2);
        assert_eq!(c.bytes, 150);
        assert_eq!(c.drop_packets, 1);
        assert_eq!(c.drop_bytes, 1500);
    }

    #[test]
    fn render_exposes_all_directions() {
        let mut stats = Stats::default();
        stats.world_tx.account_drop(1500);
        let text = stats.render();
        assert!(text.contains("meshwire_world_tx_drop_packets_total 1"));
        assert!(text.contains("meshwire_tun_rx_packets_total 0"));
    }
}
