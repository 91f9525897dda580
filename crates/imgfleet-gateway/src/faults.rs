use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::GatewayError;

/// Countdown of injected `Unavailable` failures for the in-process backends.
#[derive(Debug, Default)]
pub(crate) struct Faults {
    remaining: AtomicU32,
}

impl Faults {
    pub(crate) fn arm(&self, count: u32) {
        self.remaining.store(count, Ordering::SeqCst);
    }

    /// Consume one injected failure, if any are armed.
    pub(crate) fn check(&self, service: &'static str) -> Result<(), GatewayError> {
        let taken = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match taken {
            Ok(_) => Err(GatewayError::unavailable(service, "injected failure")),
            Err(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn armed_failures_are_consumed_in_order() {
        let faults = Faults::default();
        assert!(faults.check("queue").is_ok());
        faults.arm(2);
        assert!(faults.check("queue").is_err());
        assert!(faults.check("queue").is_err());
        assert!(faults.check("queue").is_ok());
    }
}
