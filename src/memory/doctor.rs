//! Memory Doctor
//!
//! Turns an overhead snapshot into a short plain-language diagnosis.
//! Each rule fires independently and appends one paragraph; a nearly
//! empty instance suppresses the rest because ratios computed over a few
//! megabytes mean nothing.

use super::MemoryOverhead;

/// Below this the instance counts as empty and only gets the notice.
const EMPTY_THRESHOLD: usize = 5 * 1024 * 1024;

/// Peak-to-current ratio that counts as a past memory spike.
const PEAK_RATIO: f64 = 1.5;

/// Fragmentation ratio considered problematic.
const FRAG_RATIO: f64 = 1.4;

/// Average per-client buffer bytes considered oversized.
const CLIENT_BUF_LIMIT: usize = 200 * 1024;

/// Average per-replica buffer bytes considered oversized.
const REPLICA_BUF_LIMIT: usize = 10 * 1024 * 1024;

/// Renders the doctor's report for an overhead snapshot.
pub fn doctor_report(mh: &MemoryOverhead) -> String {
    if mh.total_allocated < EMPTY_THRESHOLD {
        return "This instance is empty or holds very little data, so the memory issue \
                detector cannot run meaningfully. Add some data and ask again.\n"
            .to_string();
    }

    let mut findings = Vec::new();

    if mh.peak_allocated as f64 / mh.total_allocated as f64 > PEAK_RATIO {
        findings.push(
            " * Peak memory: this instance once used more than 150% of the memory it \
             holds now. Allocators rarely hand pages back after a spike, so a high \
             resident size after a peak is expected and mostly harmless. MEMORY PURGE \
             may reclaim some of it.\n",
        );
    }

    if mh.fragmentation > FRAG_RATIO {
        findings.push(
            " * High fragmentation: the resident set is well above the sum of live \
             allocations (ratio over 1.4). This usually follows a memory peak or a \
             workload with widely mixed allocation sizes.\n",
        );
    }

    if mh.normal_count > 0 && mh.clients_normal / mh.normal_count > CLIENT_BUF_LIMIT {
        findings.push(
            " * Big client buffers: connected clients average more than 200KB of buffer \
             space each. Slow readers or very large pipelines make reply data pile up \
             on the server side.\n",
        );
    }

    if mh.replica_count > 0 && mh.clients_replicas / mh.replica_count > REPLICA_BUF_LIMIT {
        findings.push(
            " * Big replica buffers: replica links average more than 10MB of pending \
             output each, which means at least one replica is not keeping up with the \
             write stream.\n",
        );
    }

    if findings.is_empty() {
        return "No memory issues detected in this instance.\n".to_string();
    }

    let mut report = String::from("Detected potential memory issues:\n\n");
    for f in findings {
        report.push_str(f);
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> MemoryOverhead {
        MemoryOverhead {
            total_allocated: 100 * 1024 * 1024,
            startup_allocated: 4 * 1024 * 1024,
            peak_allocated: 100 * 1024 * 1024,
            fragmentation: 1.0,
            repl_backlog: 0,
            clients_replicas: 0,
            replica_count: 0,
            clients_normal: 0,
            normal_count: 0,
            persist_buffer: 0,
            dbs: Vec::new(),
            total_keys: 1000,
            overhead_total: 10 * 1024 * 1024,
            dataset: 90 * 1024 * 1024,
            dataset_perc: 90.0,
            bytes_per_key: 1024,
            peak_perc: 100.0,
        }
    }

    #[test]
    fn test_healthy_instance_reports_no_issues() {
        let report = doctor_report(&base());
        assert!(report.contains("No memory issues"));
    }

    #[test]
    fn test_empty_instance_suppresses_other_rules() {
        let mut mh = base();
        mh.total_allocated = 1024 * 1024;
        // Would trip the peak rule if it were evaluated.
        mh.peak_allocated = 100 * 1024 * 1024;
        let report = doctor_report(&mh);
        assert!(report.contains("empty"));
        assert!(!report.contains("Peak memory"));
    }

    #[test]
    fn test_peak_rule() {
        let mut mh = base();
        mh.peak_allocated = 200 * 1024 * 1024;
        assert!(doctor_report(&mh).contains("Peak memory"));
    }

    #[test]
    fn test_fragmentation_rule() {
        let mut mh = base();
        mh.fragmentation = 1.8;
        assert!(doctor_report(&mh).contains("High fragmentation"));
    }

    #[test]
    fn test_client_buffer_rule() {
        let mut mh = base();
        mh.normal_count = 2;
        mh.clients_normal = 2 * 300 * 1024;
        assert!(doctor_report(&mh).contains("Big client buffers"));
    }

    #[test]
    fn test_replica_buffer_rule() {
        let mut mh = base();
        mh.replica_count = 1;
        mh.clients_replicas = 64 * 1024 * 1024;
        assert!(doctor_report(&mh).contains("Big replica buffers"));
    }

    #[test]
    fn test_multiple_rules_combine() {
        let mut mh = base();
        mh.peak_allocated = 300 * 1024 * 1024;
        mh.fragmentation = 2.0;
        let report = doctor_report(&mh);
        assert!(report.contains("Peak memory"));
        assert!(report.contains("High fragmentation"));
    }
}
