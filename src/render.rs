//! Label-level graph rendering.
//!
//! Transfers are aggregated per ordered pair of labels in one pass. Every
//! transfer then becomes its own edge of a petgraph multigraph whose nodes
//! are labels, annotated with its pair's totals, and the graph is written
//! out as a standalone vis-network HTML page.

use crate::ethereum::{Address, HexPrefixConvention, LabelConvention};
use crate::schemas::{LabelMap, ReverseLabelMap, TransferRecord};
use petgraph::graph::{Graph, NodeIndex};
use petgraph::visit::EdgeRef;
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

pub const BLUE: &str = "#2d728f";
pub const YELLOW: &str = "#F5EE9E";
pub const RED: &str = "#AB3428";
pub const ORANGE: &str = "#F49E4C";
pub const LIGHT_BLUE: &str = "#3b8ea5";

const CONTRACT_SIZE: u32 = 15;
const WALLET_SIZE: u32 = 30;
const SYNTHETIC_SIZE: u32 = 10;
const MAX_EXTRA_WIDTH: f64 = 20.0;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Aggregate flow between two labels, seen from `from_label`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EdgeStats {
    pub from_label: String,
    pub to_label: String,
    /// Transfers in either direction
    pub n_transactions: usize,
    /// USD moved in either direction
    pub usd_vol: f64,
    /// USD sent from `from_label` minus USD received by it
    pub usd_net_vol_out: f64,
}

#[derive(Debug, Default, Clone, Copy)]
struct Flow {
    count: usize,
    usd: f64,
}

fn label_of(labels: &LabelMap, address: &Address) -> String {
    labels
        .get(address)
        .cloned()
        .unwrap_or_else(|| address.as_str().to_string())
}

/// Aggregate the dataset per ordered label pair.
///
/// One entry per pair that has at least one transfer, counting flow in both
/// directions. A pair whose two labels are equal is counted once, with zero
/// net volume. Missing USD amounts count as zero.
pub fn edge_stats(dataset: &[TransferRecord], labels: &LabelMap) -> Vec<EdgeStats> {
    let mut flows: HashMap<(String, String), Flow> = HashMap::new();

    for transfer in dataset {
        let key = (
            label_of(labels, &transfer.from_address),
            label_of(labels, &transfer.to_address),
        );
        let flow = flows.entry(key).or_default();
        flow.count += 1;
        flow.usd += transfer.amount_usd.unwrap_or(0.0);
    }

    let pairs: BTreeSet<&(String, String)> = flows.keys().collect();

    pairs
        .into_iter()
        .map(|(from, to)| {
            let out = flows[&(from.clone(), to.clone())];
            let inbound = if from == to {
                Flow::default()
            } else {
                flows
                    .get(&(to.clone(), from.clone()))
                    .copied()
                    .unwrap_or_default()
            };
            EdgeStats {
                from_label: from.clone(),
                to_label: to.clone(),
                n_transactions: out.count + inbound.count,
                usd_vol: out.usd + inbound.usd,
                usd_net_vol_out: out.usd - inbound.usd,
            }
        })
        .collect()
}

/// A label and every address carrying it
#[derive(Debug, Clone, PartialEq)]
pub struct LabelNode {
    pub label: String,
    pub addresses: BTreeSet<Address>,
    pub synthetic: bool,
    pub contract: bool,
}

/// One transfer, with the totals of its label pair
#[derive(Debug, Clone, PartialEq)]
pub struct TransferEdge {
    pub transfer: TransferRecord,
    pub stats: EdgeStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeShape {
    Dot,
    Square,
}

impl NodeShape {
    fn as_str(&self) -> &'static str {
        match self {
            NodeShape::Dot => "dot",
            NodeShape::Square => "square",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStyle {
    pub size: u32,
    pub color: &'static str,
    pub shape: NodeShape,
}

impl LabelNode {
    pub fn style(&self) -> NodeStyle {
        match (self.synthetic, self.contract) {
            (false, true) => NodeStyle {
                size: CONTRACT_SIZE,
                color: ORANGE,
                shape: NodeShape::Square,
            },
            (false, false) => NodeStyle {
                size: WALLET_SIZE,
                color: ORANGE,
                shape: NodeShape::Dot,
            },
            (true, contract) => NodeStyle {
                size: SYNTHETIC_SIZE,
                color: RED,
                shape: if contract { NodeShape::Square } else { NodeShape::Dot },
            },
        }
    }
}

/// Build the label multigraph, one edge per transfer in `dataset`
pub fn build_graph(
    dataset: &[TransferRecord],
    labels: &LabelMap,
    reverse_labels: &ReverseLabelMap,
    contracts: &BTreeSet<Address>,
    convention: &dyn LabelConvention,
) -> Graph<LabelNode, TransferEdge> {
    let stats: HashMap<(String, String), EdgeStats> = edge_stats(dataset, labels)
        .into_iter()
        .map(|s| ((s.from_label.clone(), s.to_label.clone()), s))
        .collect();

    let mut graph = Graph::new();
    let mut index: BTreeMap<String, NodeIndex> = BTreeMap::new();

    for transfer in dataset {
        let key = (
            label_of(labels, &transfer.from_address),
            label_of(labels, &transfer.to_address),
        );
        let Some(pair) = stats.get(&key) else {
            continue;
        };
        let from = node_for(&mut graph, &mut index, &key.0, labels, reverse_labels, contracts, convention);
        let to = node_for(&mut graph, &mut index, &key.1, labels, reverse_labels, contracts, convention);
        graph.add_edge(
            from,
            to,
            TransferEdge {
                transfer: transfer.clone(),
                stats: pair.clone(),
            },
        );
    }

    debug!(
        "Label graph has {} nodes and {} edges",
        graph.node_count(),
        graph.edge_count()
    );
    graph
}

fn node_for(
    graph: &mut Graph<LabelNode, TransferEdge>,
    index: &mut BTreeMap<String, NodeIndex>,
    label: &str,
    labels: &LabelMap,
    reverse_labels: &ReverseLabelMap,
    contracts: &BTreeSet<Address>,
    convention: &dyn LabelConvention,
) -> NodeIndex {
    if let Some(idx) = index.get(label) {
        return *idx;
    }

    let addresses = reverse_labels.get(label).cloned().unwrap_or_else(|| {
        labels
            .iter()
            .filter(|(_, l)| l.as_str() == label)
            .map(|(a, _)| a.clone())
            .collect()
    });
    let contract = addresses.iter().any(|a| contracts.contains(a));

    let idx = graph.add_node(LabelNode {
        label: label.to_string(),
        addresses,
        synthetic: convention.is_synthetic_label(label),
        contract,
    });
    index.insert(label.to_string(), idx);
    idx
}

/// `1234567.891` -> `1,234,567.89`
pub fn format_usd(value: f64) -> String {
    let fixed = format!("{:.2}", value.abs());
    let (int_part, frac_part) = fixed.split_once('.').unwrap_or((fixed.as_str(), "00"));

    let digits: Vec<char> = int_part.chars().collect();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.iter().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(*c);
    }

    let sign = if value < 0.0 && fixed != "0.00" { "-" } else { "" };
    format!("{}{}.{}", sign, grouped, frac_part)
}

/// Hover text for an edge
fn edge_title(stats: &EdgeStats) -> String {
    let direction = if stats.usd_net_vol_out >= 0.0 {
        format!("{}-->{}", stats.from_label, stats.to_label)
    } else {
        format!("{}-->{}", stats.to_label, stats.from_label)
    };
    format!(
        "Volume = ${}\nNet Volume = ${} ({})\nn_transactions = {}",
        format_usd(stats.usd_vol),
        format_usd(stats.usd_net_vol_out.abs()),
        direction,
        stats.n_transactions
    )
}

/// Hover text for a node
fn node_title(node: &LabelNode) -> String {
    let addresses: Vec<&str> = node.addresses.iter().map(Address::as_str).collect();
    format!("Addresses:\n{}", addresses.join("\n"))
}

/// Node and edge payloads for vis-network
pub fn to_vis_json(graph: &Graph<LabelNode, TransferEdge>) -> (serde_json::Value, serde_json::Value) {
    let max_vol = graph
        .edge_weights()
        .map(|e| e.stats.usd_vol)
        .fold(0.0_f64, f64::max);

    let nodes: Vec<serde_json::Value> = graph
        .node_indices()
        .map(|idx| {
            let node = &graph[idx];
            let style = node.style();
            json!({
                "id": idx.index(),
                "label": node.label,
                "title": node_title(node),
                "size": style.size,
                "color": style.color,
                "shape": style.shape.as_str(),
            })
        })
        .collect();

    let edges: Vec<serde_json::Value> = graph
        .edge_references()
        .map(|edge| {
            let TransferEdge { transfer, stats } = edge.weight();
            let width = if max_vol > 0.0 {
                1.0 + MAX_EXTRA_WIDTH * stats.usd_vol / max_vol
            } else {
                1.0
            };
            let both_synthetic =
                graph[edge.source()].synthetic && graph[edge.target()].synthetic;
            json!({
                "from": edge.source().index(),
                "to": edge.target().index(),
                "width": width,
                "color": if both_synthetic { RED } else { ORANGE },
                "title": edge_title(stats),
                "symbol": transfer.symbol,
                "amount": transfer.amount,
                "amount_usd": transfer.amount_usd,
                "tx_hash": transfer.tx_hash,
                "block_timestamp": transfer.block_timestamp.to_rfc3339(),
                "from_address": transfer.from_address.as_str(),
                "to_address": transfer.to_address.as_str(),
                "n_transactions": stats.n_transactions,
                "usd_vol": stats.usd_vol,
                "usd_net_vol_out": stats.usd_net_vol_out,
            })
        })
        .collect();

    (json!(nodes), json!(edges))
}

/// Standalone HTML page for the graph
pub fn to_html(graph: &Graph<LabelNode, TransferEdge>, title: &str) -> Result<String, RenderError> {
    let (nodes, edges) = to_vis_json(graph);
    // Labels are ledger-supplied; keep them from closing the script tag
    let nodes = serde_json::to_string(&nodes)?.replace("</", "<\\/");
    let edges = serde_json::to_string(&edges)?.replace("</", "<\\/");

    Ok(format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>{title}</title>
<script src="https://unpkg.com/vis-network/standalone/umd/vis-network.min.js"></script>
<style>
  body {{ margin: 0; background: {BLUE}; }}
  #graph {{ width: 100vw; height: 100vh; }}
</style>
</head>
<body>
<div id="graph"></div>
<script>
  const nodes = new vis.DataSet({nodes});
  const edges = new vis.DataSet({edges});
  const options = {{
    nodes: {{ font: {{ color: "{YELLOW}" }} }},
    edges: {{ arrows: "to", smooth: {{ type: "continuous" }}, color: {{ highlight: "{LIGHT_BLUE}" }} }},
    physics: {{ solver: "forceAtlas2Based", stabilization: {{ iterations: 200 }} }},
    interaction: {{ hover: true }}
  }};
  new vis.Network(document.getElementById("graph"), {{ nodes, edges }}, options);
</script>
</body>
</html>
"#,
        title = html_escape(title),
    ))
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Render the dataset as `<output_name>.html`, returning the written path
pub fn render(
    dataset: &[TransferRecord],
    labels: &LabelMap,
    reverse_labels: &ReverseLabelMap,
    contracts: &BTreeSet<Address>,
    output_name: &Path,
) -> Result<PathBuf, RenderError> {
    render_with_convention(
        dataset,
        labels,
        reverse_labels,
        contracts,
        output_name,
        &HexPrefixConvention::default(),
    )
}

/// [`render`] for ledgers whose unresolved addresses follow `convention`
pub fn render_with_convention(
    dataset: &[TransferRecord],
    labels: &LabelMap,
    reverse_labels: &ReverseLabelMap,
    contracts: &BTreeSet<Address>,
    output_name: &Path,
    convention: &dyn LabelConvention,
) -> Result<PathBuf, RenderError> {
    let graph = build_graph(dataset, labels, reverse_labels, contracts, convention);

    let title = output_name
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "graph".to_string());
    let html = to_html(&graph, &title)?;

    let mut path = output_name.as_os_str().to_owned();
    path.push(".html");
    let path = PathBuf::from(path);

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, html)?;

    info!(
        "Rendered {} labels and {} transfers to {:?}",
        graph.node_count(),
        graph.edge_count(),
        path
    );
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::reverse_labels;
    use chrono::Utc;

    const A: &str = "0xaaaa000000000000000000000000000000000001";
    const B: &str = "0xbbbb000000000000000000000000000000000002";
    const B2: &str = "0xbbbb000000000000000000000000000000000022";
    const K: &str = "0xcccc000000000000000000000000000000000003";

    fn transfer(hash: &str, from: &str, to: &str, usd: Option<f64>) -> TransferRecord {
        TransferRecord {
            symbol: Some("ETH".into()),
            decimals: Some(18),
            amount: Some(1.0),
            amount_usd: usd,
            tx_hash: hash.into(),
            from_address: Address::new(from),
            to_address: Address::new(to),
            block_timestamp: Utc::now(),
        }
    }

    fn labels() -> LabelMap {
        let mut labels = LabelMap::new();
        labels.insert(Address::new(A), "0xa001".into());
        labels.insert(Address::new(B), "Binance".into());
        labels.insert(Address::new(B2), "Binance".into());
        labels.insert(Address::new(K), "Uniswap".into());
        labels
    }

    fn graph_of(dataset: &[TransferRecord], contracts: &BTreeSet<Address>) -> Graph<LabelNode, TransferEdge> {
        let labels = labels();
        build_graph(
            dataset,
            &labels,
            &reverse_labels(&labels),
            contracts,
            &HexPrefixConvention::default(),
        )
    }

    fn find<'a>(stats: &'a [EdgeStats], from: &str, to: &str) -> &'a EdgeStats {
        stats
            .iter()
            .find(|s| s.from_label == from && s.to_label == to)
            .unwrap()
    }

    #[test]
    fn test_edge_stats_both_directions() {
        let dataset = vec![
            transfer("h1", A, B, Some(100.0)),
            transfer("h2", B2, A, Some(30.0)),
            transfer("h3", A, B, None),
        ];
        let stats = edge_stats(&dataset, &labels());
        assert_eq!(stats.len(), 2);

        let out = find(&stats, "0xa001", "Binance");
        assert_eq!(out.n_transactions, 3);
        assert_eq!(out.usd_vol, 130.0);
        assert_eq!(out.usd_net_vol_out, 70.0);

        let back = find(&stats, "Binance", "0xa001");
        assert_eq!(back.n_transactions, 3);
        assert_eq!(back.usd_net_vol_out, -70.0);
    }

    #[test]
    fn test_edge_stats_one_way_flow() {
        let dataset = vec![
            transfer("h1", A, B, Some(10.0)),
            transfer("h2", A, B2, Some(20.0)),
        ];
        let stats = edge_stats(&dataset, &labels());
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].n_transactions, 2);
        assert_eq!(stats[0].usd_net_vol_out, 30.0);
    }

    #[test]
    fn test_edge_stats_self_pair_counted_once() {
        let dataset = vec![transfer("h1", B, B2, Some(50.0))];
        let stats = edge_stats(&dataset, &labels());
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].n_transactions, 1);
        assert_eq!(stats[0].usd_vol, 50.0);
        assert_eq!(stats[0].usd_net_vol_out, 0.0);
    }

    #[test]
    fn test_one_edge_per_transfer() {
        let dataset = vec![
            transfer("h1", A, B, Some(1.0)),
            transfer("h2", A, B, Some(2.0)),
            transfer("h3", A, B2, Some(3.0)),
        ];
        let graph = graph_of(&dataset, &BTreeSet::new());
        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.edge_count(), 3);

        let mut hashes = Vec::new();
        for edge in graph.edge_references() {
            // Every edge runs in the direction of its transfer
            assert_eq!(graph[edge.source()].label, "0xa001");
            assert_eq!(graph[edge.target()].label, "Binance");
            assert_eq!(edge.weight().stats.n_transactions, 3);
            assert_eq!(edge.weight().stats.usd_vol, 6.0);
            hashes.push(edge.weight().transfer.tx_hash.clone());
        }
        hashes.sort();
        assert_eq!(hashes, vec!["h1", "h2", "h3"]);
    }

    #[test]
    fn test_node_styles() {
        let contracts: BTreeSet<Address> = [Address::new(K)].into_iter().collect();
        let dataset = vec![
            transfer("h1", A, B, Some(100.0)),
            transfer("h2", A, K, Some(10.0)),
        ];
        let graph = graph_of(&dataset, &contracts);
        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.edge_count(), 2);

        let style_of = |label: &str| {
            graph
                .node_weights()
                .find(|n| n.label == label)
                .map(LabelNode::style)
                .unwrap()
        };
        assert_eq!(style_of("Uniswap").shape, NodeShape::Square);
        assert_eq!(style_of("Uniswap").size, 15);
        assert_eq!(style_of("Binance").size, 30);
        assert_eq!(style_of("0xa001").color, RED);

        let binance = graph.node_weights().find(|n| n.label == "Binance").unwrap();
        assert_eq!(binance.addresses.len(), 2);
    }

    #[test]
    fn test_edge_width_scales_with_volume() {
        let dataset = vec![
            transfer("h1", A, B, Some(100.0)),
            transfer("h2", A, K, Some(0.0)),
        ];
        let graph = graph_of(&dataset, &BTreeSet::new());
        let (_, edges) = to_vis_json(&graph);
        let widths: Vec<f64> = edges
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["width"].as_f64().unwrap())
            .collect();
        assert!(widths.contains(&21.0));
        assert!(widths.contains(&1.0));
    }

    #[test]
    fn test_hover_text() {
        let dataset = vec![
            transfer("h1", A, B, Some(1234.5)),
            transfer("h2", B2, A, Some(2000.0)),
        ];
        let graph = graph_of(&dataset, &BTreeSet::new());
        let (nodes, edges) = to_vis_json(&graph);

        let binance = nodes
            .as_array()
            .unwrap()
            .iter()
            .find(|n| n["label"] == "Binance")
            .unwrap();
        assert!(binance["title"].as_str().unwrap().starts_with("Addresses:\n"));

        let edge = edges
            .as_array()
            .unwrap()
            .iter()
            .find(|e| e["tx_hash"] == "h1")
            .unwrap();
        assert_eq!(
            edge["title"],
            "Volume = $3,234.50\nNet Volume = $765.50 (Binance-->0xa001)\nn_transactions = 2"
        );
        assert_eq!(edge["from_address"], A);
        assert_eq!(edge["symbol"], "ETH");
    }

    #[test]
    fn test_format_usd() {
        assert_eq!(format_usd(0.0), "0.00");
        assert_eq!(format_usd(999.999), "1,000.00");
        assert_eq!(format_usd(1234567.891), "1,234,567.89");
        assert_eq!(format_usd(-1500.0), "-1,500.00");
    }

    #[test]
    fn test_render_writes_html() {
        let dir = tempfile::tempdir().unwrap();
        let labels = labels();
        let dataset = vec![transfer("h1", A, B, Some(100.0))];

        let path = render(
            &dataset,
            &labels,
            &reverse_labels(&labels),
            &BTreeSet::new(),
            &dir.path().join("graphs").join("binance"),
        )
        .unwrap();

        assert_eq!(path, dir.path().join("graphs").join("binance.html"));
        let html = std::fs::read_to_string(&path).unwrap();
        assert!(html.contains("vis-network"));
        assert!(html.contains("Binance"));
    }

    #[derive(Debug)]
    struct BracketConvention;

    impl LabelConvention for BracketConvention {
        fn is_synthetic_label(&self, label: &str) -> bool {
            label.starts_with('[')
        }

        fn short_label(&self, address: &Address) -> String {
            format!("[{}]", address.as_str())
        }
    }

    #[test]
    fn test_render_with_custom_convention() {
        let dir = tempfile::tempdir().unwrap();
        let mut labels = LabelMap::new();
        labels.insert(Address::new(A), "[a]".into());
        labels.insert(Address::new(B), "0xNamedWallet".into());
        let dataset = vec![transfer("h1", A, B, Some(5.0))];

        let graph = build_graph(
            &dataset,
            &labels,
            &reverse_labels(&labels),
            &BTreeSet::new(),
            &BracketConvention,
        );
        let named = graph.node_weights().find(|n| n.label == "0xNamedWallet").unwrap();
        assert!(!named.synthetic);
        assert_eq!(named.style().size, 30);

        let path = render_with_convention(
            &dataset,
            &labels,
            &reverse_labels(&labels),
            &BTreeSet::new(),
            &dir.path().join("custom"),
            &BracketConvention,
        )
        .unwrap();
        assert!(path.exists());
    }
}
