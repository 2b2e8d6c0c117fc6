use crate::sinks::PolicyMetricsSink;
use std::time::Instant;

/// RAII timer recording the latency of one synchronous check call.
pub struct CheckTimer<'a> {
    sink: &'a dyn PolicyMetricsSink,
    start: Instant,
}

impl<'a> CheckTimer<'a> {
    pub fn new(sink: &'a dyn PolicyMetricsSink) -> Self {
        Self {
            sink,
            start: Instant::now(),
        }
    }
}

impl Drop for CheckTimer<'_> {
    fn drop(&mut self) {
        self.sink
            .observe_check_duration(self.start.elapsed().as_secs_f64());
    }
}
