use crate::tilebuf::types::RequesterId;
use crate::timeq::Cycle;

#[derive(Debug, Default, Clone)]
pub struct PatternCheckpoint {
    pub requester: RequesterId,
    pub pattern_name: String,
    pub finished_cycle: Cycle,
}

pub struct TrafficLogger;

impl TrafficLogger {
    pub fn log_pattern_checkpoint(checkpoint: &PatternCheckpoint) {
        println!(
            "[TRAFFIC] requester {} {} finished at time {:>10}",
            checkpoint.requester, checkpoint.pattern_name, checkpoint.finished_cycle
        );
    }

    pub fn log_requester_done(requester: RequesterId) {
        println!("[TRAFFIC] requester {} all done!", requester);
    }
}
