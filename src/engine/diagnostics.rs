use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::stack::Deployment;

/// Timing of one provider call.
#[derive(Debug, Clone)]
pub struct NodeExecution {
    pub start: Instant,
    pub duration: Duration,
}

/// Run diagnostics and performance metrics.
///
/// Returned as part of the [`RunReport`](crate::RunReport); contains the
/// start time and duration of every resource that actually reached the
/// provider. Resources restored from state or skipped have no entry.
#[derive(Debug, Default)]
pub struct Diagnostics {
    /// A map of logical resource names to their execution metrics.
    pub timings: BTreeMap<String, NodeExecution>,
}

impl Diagnostics {
    /// Renders the resource graph as a Mermaid diagram, color-coded by
    /// apply duration.
    ///
    /// * **Green**: Fast
    /// * **Yellow**: Moderate
    /// * **Red**: Slow
    /// * **Blue**: No provider call (unchanged, skipped or cancelled)
    pub fn render_mermaid(&self, deployment: &Deployment) -> String {
        use std::fmt::Write;

        let mut f = String::new();
        writeln!(f, "graph LR").unwrap();

        let times = &self.timings;
        let mut min_time = f64::MAX;
        let mut max_time = f64::MIN;

        for t in times.values() {
            let secs = t.duration.as_secs_f64();
            if secs < min_time {
                min_time = secs;
            }
            if secs > max_time {
                max_time = secs;
            }
        }

        if min_time > max_time {
            // Nothing reached the provider
            min_time = 0.0;
            max_time = 0.0;
        }

        // Avoid divide by zero if all calls took the same time
        if (max_time - min_time).abs() < f64::EPSILON {
            max_time = min_time + 1.0;
        }

        let graph = &deployment.graph.graph;

        for index in graph.node_indices() {
            let node = &graph[index];
            let name = node.name().replace('"', "\\\""); // Simple escape

            let (label_extra, color_code) = if let Some(exec) = times.get(node.name()) {
                let duration_str = format!("{:.2?}", exec.duration);

                // Color calculation (Green -> Yellow -> Red)
                let val = exec.duration.as_secs_f64();
                let t = (val - min_time) / (max_time - min_time);

                let (r, g, b) = if t < 0.5 {
                    // Green (0, 255, 0) to Yellow (255, 255, 0)
                    let t_scaled = t * 2.0;
                    let r = (255.0 * t_scaled) as u8;
                    (r, 255, 0)
                } else {
                    // Yellow (255, 255, 0) to Red (255, 0, 0)
                    let t_scaled = (t - 0.5) * 2.0;
                    let g = (255.0 * (1.0 - t_scaled)) as u8;
                    (255, g, 0)
                };

                (duration_str, format!("#{:02X}{:02X}{:02X}", r, g, b))
            } else {
                ("Unchanged".to_string(), "#ADD8E6".to_string()) // Light Blue
            };

            writeln!(f, "    {:?}[\"{}\\n{}\"]", index.index(), name, label_extra).unwrap();
            writeln!(f, "    style {:?} fill:{}", index.index(), color_code).unwrap();
        }

        for edge in graph.edge_indices() {
            let (source, target) = graph.edge_endpoints(edge).unwrap();
            writeln!(
                f,
                "    {:?} -- \"{}\" --> {:?}",
                source.index(),
                graph[source].kind(),
                target.index()
            )
            .unwrap();
        }

        f
    }
}
