//! Prometheus text exposition for one replica.

use std::fmt::Write;

use flowgrid_state::Step;

use crate::counters::ReplicaCounters;

/// Render this replica's counters. The lead replica also reports the
/// step's replica count.
pub fn render_prometheus(step: &Step, counters: &ReplicaCounters, lead: bool) -> String {
    let mut out = String::new();
    let pipeline = step.pipeline_name();
    let name = &step.spec.name;
    let replica = counters.replica();

    if lead {
        out.push_str("# HELP flowgrid_replicas Current number of replicas of the step.\n");
        out.push_str("# TYPE flowgrid_replicas gauge\n");
        let _ = writeln!(
            out,
            "flowgrid_replicas{{pipeline=\"{pipeline}\",step=\"{name}\"}} {}",
            step.status.replicas
        );
    }

    let sources = counters.source_metrics();
    out.push_str("# HELP flowgrid_source_total Messages consumed from a source.\n");
    out.push_str("# TYPE flowgrid_source_total counter\n");
    for (source, m) in &sources {
        let _ = writeln!(
            out,
            "flowgrid_source_total{{pipeline=\"{pipeline}\",step=\"{name}\",replica=\"{replica}\",source=\"{source}\"}} {}",
            m.total
        );
    }

    out.push_str("# HELP flowgrid_source_pending Backlog of a source as last observed.\n");
    out.push_str("# TYPE flowgrid_source_pending gauge\n");
    for (source, m) in &sources {
        let _ = writeln!(
            out,
            "flowgrid_source_pending{{pipeline=\"{pipeline}\",step=\"{name}\",replica=\"{replica}\",source=\"{source}\"}} {}",
            m.pending
        );
    }

    out.push_str("# HELP flowgrid_sink_total Messages written to a sink.\n");
    out.push_str("# TYPE flowgrid_sink_total counter\n");
    for (sink, m) in &counters.sink_metrics() {
        let _ = writeln!(
            out,
            "flowgrid_sink_total{{pipeline=\"{pipeline}\",step=\"{name}\",replica=\"{replica}\",sink=\"{sink}\"}} {}",
            m.total
        );
    }

    out
}
