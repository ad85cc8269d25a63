use std::time::Duration;

/// Lifetime counters accumulated by the cycle engine. Counts are per cycle
/// observation: a unit that survives several sweeps is counted once per
/// snapshot it appeared in.
#[derive(Clone, Copy, Default, Debug)]
pub struct GcStats {
    pub cycles_started: u64,
    pub cycles_completed: u64,
    pub total_cycle_time: Duration,
    pub total_stw_time: Duration,
    pub total_object_count: u64,
    pub total_object_size: usize,
    pub swept_object_count: u64,
    pub swept_object_size: usize,
    pub live_object_count: u64,
    pub live_object_size: usize,
}

/// Renders a byte count with a binary-magnitude suffix for reports and
/// driver logs.
pub(crate) fn human_bytes(size: usize) -> String {
    const SUFFIXES: [&str; 4] = ["B", "K", "M", "G"];
    let mut scaled = size as f64;
    let mut magnitude = 0;
    while scaled >= 1024.0 && magnitude + 1 < SUFFIXES.len() {
        scaled /= 1024.0;
        magnitude += 1;
    }
    if magnitude == 0 {
        format!("{}B", size)
    } else {
        format!("{:.1}{}", scaled, SUFFIXES[magnitude])
    }
}

impl std::fmt::Display for GcStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "GC statistics:")?;
        writeln!(
            f,
            "  Cycles: {} started, {} completed",
            self.cycles_started, self.cycles_completed
        )?;
        writeln!(
            f,
            "  Total cycle time: {:.3}ms ({:.3}ms stop-the-world)",
            self.total_cycle_time.as_secs_f64() * 1000.0,
            self.total_stw_time.as_secs_f64() * 1000.0
        )?;
        writeln!(
            f,
            "  Objects seen: {} ({})",
            self.total_object_count,
            human_bytes(self.total_object_size)
        )?;
        writeln!(
            f,
            "  Objects swept: {} ({})",
            self.swept_object_count,
            human_bytes(self.swept_object_size)
        )?;
        writeln!(
            f,
            "  Objects live: {} ({})",
            self.live_object_count,
            human_bytes(self.live_object_size)
        )?;
        Ok(())
    }
}
