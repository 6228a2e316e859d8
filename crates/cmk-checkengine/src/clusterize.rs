//! Aggregation of per-node check output for cluster services.

use crate::api::{CheckOutput, CheckResult, State};

const STATE_MARKERS: [&str; 3] = ["(!!)", "(!)", "(?)"];

/// Aggregated output of one node (or of several nodes combined).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDetails {
    pub state: State,
    pub text: String,
}

fn strip_marker(line: &str) -> &str {
    let line = line.trim_end();
    STATE_MARKERS
        .iter()
        .find_map(|marker| line.strip_suffix(marker))
        .map(str::trim_end)
        .unwrap_or(line)
}

/// Folds one node's check output into a worst state and a text block with
/// every line prefixed by `[node]`.
///
/// Metrics are dropped. A node whose remaining output holds anything but
/// results, or nothing at all, contributes nothing.
pub fn aggregate_node_details(node_name: &str, node_check_returns: &[CheckOutput]) -> Option<NodeDetails> {
    let mut results = Vec::new();
    for output in node_check_returns {
        match output {
            CheckOutput::Metric(_) => {}
            CheckOutput::Result(result) => results.push(result),
            CheckOutput::IgnoreResults(_) => {
                tracing::debug!(node = node_name, "node output ignored");
                return None;
            }
        }
    }
    if results.is_empty() {
        return None;
    }

    let state = State::worst(results.iter().map(|r| r.state));
    let lines: Vec<String> = results
        .iter()
        .flat_map(|result| {
            result.details().lines().map(move |line| {
                format!("[{}]: {}{}", node_name, strip_marker(line), result.state.marker())
            })
        })
        .collect();
    Some(NodeDetails {
        state,
        text: lines.join("\n"),
    })
}

/// One notice result carrying the node's aggregated details. With
/// `force_ok`, the node's state is not reflected in the notice.
pub fn make_node_notice_results(
    node_name: &str,
    node_check_returns: &[CheckOutput],
    force_ok: bool,
) -> Vec<CheckResult> {
    match aggregate_node_details(node_name, node_check_returns) {
        Some(details) if !details.text.is_empty() => {
            let state = if force_ok { State::Ok } else { details.state };
            vec![CheckResult::notice(state, details.text)]
        }
        _ => Vec::new(),
    }
}

/// Combines the aggregated details of all contributing nodes.
pub fn aggregate_cluster_details<'a, I>(nodes: I) -> Option<NodeDetails>
where
    I: IntoIterator<Item = (&'a str, &'a [CheckOutput])>,
{
    let per_node: Vec<NodeDetails> = nodes
        .into_iter()
        .filter_map(|(name, outputs)| aggregate_node_details(name, outputs))
        .collect();
    if per_node.is_empty() {
        return None;
    }
    Some(NodeDetails {
        state: State::worst(per_node.iter().map(|d| d.state)),
        text: per_node
            .iter()
            .map(|d| d.text.as_str())
            .collect::<Vec<_>>()
            .join("\n"),
    })
}
