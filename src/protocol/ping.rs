use std::time::Instant;

const N: usize = 5;
pub(crate) const NONCE_LEN: usize = 8;

// Stores and calculates average of last N latencies
#[derive(Debug)]
pub(crate) struct PingStats {
    history: [Option<u16>; N],
    idx: usize,
    last_nonce: [u8; NONCE_LEN],
    last_ping: Instant,
}

impl PingStats {
    pub(crate) fn new() -> Self {
        Self {
            history: [None; N],
            idx: 0,
            last_nonce: [0; NONCE_LEN],
            last_ping: Instant::now(),
        }
    }

    /// Starts a new round trip and returns the nonce to send as the Ping payload.
    pub(crate) fn new_ping(&mut self) -> [u8; NONCE_LEN] {
        self.last_ping = Instant::now();
        rand::fill(&mut self.last_nonce);
        self.last_nonce
    }

    /// Records the latency if `payload` answers the last ping.
    pub(crate) fn on_pong(&mut self, payload: &[u8]) -> Result<u16, PongError> {
        if payload != self.last_nonce.as_slice() {
            return Err(PongError::Nonce);
        }
        let latency_ms = self.last_ping.elapsed().as_millis();
        let latency = u16::try_from(latency_ms).map_err(|_| PongError::Late(latency_ms))?;
        self.add(latency);
        Ok(latency)
    }

    pub(crate) fn add(&mut self, rtt: u16) {
        self.history[self.idx] = Some(rtt);
        self.idx = (self.idx + 1) % N;
    }

    pub(crate) fn average(&self) -> Option<u16> {
        let (sum, count) = self
            .history
            .iter()
            .flatten()
            .fold((0u32, 0u32), |(s, c), &v| (s + u32::from(v), c + 1));
        sum.checked_div(count).and_then(|avg| u16::try_from(avg).ok())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PongError {
    /// Unsolicited, or answering an older ping.
    Nonce,
    Late(u128),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_of_last_five() {
        let mut stats = PingStats::new();
        assert_eq!(stats.average(), None);
        for rtt in [100, 1, 2, 3, 4, 5] {
            stats.add(rtt);
        }
        assert_eq!(stats.average(), Some(3));
    }

    #[test]
    fn matching_nonce_records_latency() {
        let mut stats = PingStats::new();
        let nonce = stats.new_ping();
        assert_eq!(stats.on_pong(b"unsolicited"), Err(PongError::Nonce));
        assert!(stats.on_pong(&nonce).is_ok());
        assert!(stats.average().is_some());
    }
}
