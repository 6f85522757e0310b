use tracing::info;

/// Colored RTT bands for the client's ping indicator, preserved from the
/// original's classification thresholds. `Stale` covers disconnected or
/// long-overdue links.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingBand {
    LightGreen,
    Lime,
    Yellow,
    Amber,
    Orange,
    DeepOrange,
    RedAccent,
    Red,
    Stale,
}

impl PingBand {
    pub fn classify(rtt_ms: u64) -> Self {
        match rtt_ms {
            ms if ms < 30 => PingBand::LightGreen,
            ms if ms < 60 => PingBand::Lime,
            ms if ms < 120 => PingBand::Yellow,
            ms if ms < 160 => PingBand::Amber,
            ms if ms < 200 => PingBand::Orange,
            ms if ms < 300 => PingBand::DeepOrange,
            ms if ms < 400 => PingBand::RedAccent,
            _ => PingBand::Red,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            PingBand::LightGreen => "light-green",
            PingBand::Lime => "lime",
            PingBand::Yellow => "yellow",
            PingBand::Amber => "amber",
            PingBand::Orange => "orange",
            PingBand::DeepOrange => "deep-orange",
            PingBand::RedAccent => "red-accent",
            PingBand::Red => "red",
            PingBand::Stale => "grey",
        }
    }
}

/// High-level state a client session reports to its UI collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticating,
    Running,
    Closing,
    Reconnecting,
    Terminated,
}

/// The client-side UI collaborator contract (spec §6). A full GUI/TUI is
/// out of scope; this crate ships only the logging default so the
/// dataplane is runnable and observable headlessly.
pub trait ClientObserver: Send + Sync {
    fn on_public_address(&self, host: &str, port: u16) {
        let _ = (host, port);
    }
    fn on_log(&self, text: &str, level: tracing::Level) {
        let _ = (text, level);
    }
    fn on_traffic(&self, up_bytes: u64, down_bytes: u64) {
        let _ = (up_bytes, down_bytes);
    }
    fn on_ping(&self, rtt_ms: Option<u64>, band: PingBand) {
        let _ = (rtt_ms, band);
    }
    fn on_state(&self, state: SessionState) {
        let _ = state;
    }
}

/// Default observer: every event becomes a `tracing` log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl ClientObserver for LoggingObserver {
    fn on_public_address(&self, host: &str, port: u16) {
        info!(host, port, "assigned public address");
    }

    fn on_log(&self, text: &str, level: tracing::Level) {
        tracing::event!(target: "tunnel_core::observer", level, "{text}");
    }

    fn on_traffic(&self, up_bytes: u64, down_bytes: u64) {
        tracing::trace!(up_bytes, down_bytes, "traffic counters");
    }

    fn on_ping(&self, rtt_ms: Option<u64>, band: PingBand) {
        info!(rtt_ms, band = band.label(), "ping");
    }

    fn on_state(&self, state: SessionState) {
        info!(?state, "session state changed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_literal_band_thresholds() {
        assert_eq!(PingBand::classify(12), PingBand::LightGreen);
        assert_eq!(PingBand::classify(29), PingBand::LightGreen);
        assert_eq!(PingBand::classify(30), PingBand::Lime);
        assert_eq!(PingBand::classify(59), PingBand::Lime);
        assert_eq!(PingBand::classify(60), PingBand::Yellow);
        assert_eq!(PingBand::classify(119), PingBand::Yellow);
        assert_eq!(PingBand::classify(120), PingBand::Amber);
        assert_eq!(PingBand::classify(159), PingBand::Amber);
        assert_eq!(PingBand::classify(160), PingBand::Orange);
        assert_eq!(PingBand::classify(199), PingBand::Orange);
        assert_eq!(PingBand::classify(200), PingBand::DeepOrange);
        assert_eq!(PingBand::classify(299), PingBand::DeepOrange);
        assert_eq!(PingBand::classify(300), PingBand::RedAccent);
        assert_eq!(PingBand::classify(399), PingBand::RedAccent);
        assert_eq!(PingBand::classify(400), PingBand::Red);
        assert_eq!(PingBand::classify(10_000), PingBand::Red);
    }
}
