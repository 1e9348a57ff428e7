use std::time::Duration;

pub const DEFAULT_RTO: Duration = Duration::from_millis(200);
pub const DEFAULT_RC: u16 = 7;
pub const DEFAULT_RM: u32 = 16;

/// Retransmission schedule of one transaction.
///
/// Over unreliable transports a request is sent `rc` times. The wait after
/// each transmission starts at `rto` and doubles, except the wait after the
/// last transmission which is `rto * rm`
/// ([RFC8489 section 6.2.1](https://datatracker.ietf.org/doc/html/rfc8489#section-6.2.1)).
/// Reliable transports send once and wait for the whole budget.
#[derive(Debug, Clone)]
pub struct RtoSchedule {
    rto: Duration,
    multiplier: u32,
    remaining: u16,
    last_multiplier: u32,
}

impl RtoSchedule {
    pub fn new(rto: Duration, rc: u16, rm: u32) -> Self {
        Self {
            rto,
            multiplier: 1,
            remaining: rc,
            last_multiplier: rm,
        }
    }

    pub fn reliable(rto: Duration, rc: u16, rm: u32) -> Self {
        Self {
            rto: RtoSchedule::new(rto, rc, rm).total(),
            multiplier: 1,
            remaining: 1,
            last_multiplier: 1,
        }
    }

    /// Returns how long to wait after the next transmission, or `None` when
    /// no transmission is left.
    pub fn next_rto(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }

        let multiplier = if self.remaining == 1 {
            self.last_multiplier
        } else {
            self.multiplier
        };
        // Saturates instead of panicking on absurdly large RTOs
        let wait = self.rto.checked_mul(multiplier).unwrap_or(Duration::MAX);

        self.multiplier = self.multiplier.saturating_mul(2);
        self.remaining -= 1;

        Some(wait)
    }

    /// Time between the first transmission and the transaction timing out.
    pub fn total(&self) -> Duration {
        let mut schedule = self.clone();
        let mut total = Duration::ZERO;
        while let Some(wait) = schedule.next_rto() {
            total = total.saturating_add(wait);
        }
        total
    }
}
