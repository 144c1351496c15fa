//! Splits `rx_fifo` into `decode_fifo` and `log_fifo`.
//!
//! Writes to `decode_fifo` always count drops. Writes to `log_fifo` only
//! count drops while `logging_running` is observed true — the Reader/Logger
//! cyclic "is it running" check in the source collapses to this one
//! lock-free boolean the Logger publishes and the Fan-out reads.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use canserver_core::{DropPolicyQueue, Frame};

const POP_TIMEOUT: Duration = Duration::from_secs(1);
const POP_MAX: usize = 256;

pub struct FanOut {
    rx_fifo: Arc<DropPolicyQueue<Frame>>,
    decode_fifo: Arc<DropPolicyQueue<Frame>>,
    log_fifo: Arc<DropPolicyQueue<Frame>>,
    logging_running: Arc<AtomicBool>,
}

impl FanOut {
    pub fn new(
        rx_fifo: Arc<DropPolicyQueue<Frame>>,
        decode_fifo: Arc<DropPolicyQueue<Frame>>,
        log_fifo: Arc<DropPolicyQueue<Frame>>,
        logging_running: Arc<AtomicBool>,
    ) -> Self {
        FanOut {
            rx_fifo,
            decode_fifo,
            log_fifo,
            logging_running,
        }
    }

    /// Drains one batch off `rx_fifo` and fans it out. Returns the number of
    /// frames pulled (0 on pop timeout).
    pub fn step(&self) -> usize {
        let batch = self.rx_fifo.pop_many(POP_MAX, POP_TIMEOUT);
        if batch.is_empty() {
            return 0;
        }
        let n = batch.len();
        self.decode_fifo.push_many(batch.clone());
        if self.logging_running.load(Ordering::Relaxed) {
            self.log_fifo.push_many(batch);
        }
        // When logging is off, log_fifo is simply not written to — no drop
        // is incurred and none is counted, matching the "silent while idle"
        // contract.
        n
    }

    /// Runs until `shutdown` is set.
    pub fn run(&self, shutdown: &AtomicBool) {
        while !shutdown.load(Ordering::Relaxed) {
            self.step();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(id: u32, ts: f64) -> Frame {
        Frame::new(0, id, false, true, &[0], ts)
    }

    #[test]
    fn fans_out_to_decode_always_and_log_when_running() {
        let rx = Arc::new(DropPolicyQueue::new(10));
        let decode = Arc::new(DropPolicyQueue::new(10));
        let log = Arc::new(DropPolicyQueue::new(10));
        let running = Arc::new(AtomicBool::new(false));
        rx.push(frame(0x132, 1.0));

        let fanout = FanOut::new(rx.clone(), decode.clone(), log.clone(), running.clone());
        fanout.step();

        assert_eq!(decode.len(), 1);
        assert_eq!(log.len(), 0);
    }

    #[test]
    fn fans_out_to_log_fifo_while_logging_running() {
        let rx = Arc::new(DropPolicyQueue::new(10));
        let decode = Arc::new(DropPolicyQueue::new(10));
        let log = Arc::new(DropPolicyQueue::new(10));
        let running = Arc::new(AtomicBool::new(true));
        rx.push(frame(0x132, 1.0));

        let fanout = FanOut::new(rx.clone(), decode.clone(), log.clone(), running);
        fanout.step();

        assert_eq!(decode.len(), 1);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn log_fifo_drops_count_only_while_running() {
        let rx = Arc::new(DropPolicyQueue::new(10));
        let decode = Arc::new(DropPolicyQueue::new(10));
        let log = Arc::new(DropPolicyQueue::new(1));
        let running = Arc::new(AtomicBool::new(true));
        for i in 0..3 {
            rx.push(frame(0x132, i as f64));
        }

        let fanout = FanOut::new(rx, decode, log.clone(), running);
        fanout.step();

        assert_eq!(log.dropped(), 2);
    }
}
