//! Routing graph listing: `conduit routes`.

use console::style;

use conduit::config::ConduitConfig;
use conduit::pipeline::RoutingGraph;

pub fn cmd_routes(config: &ConduitConfig) {
    let graph = RoutingGraph::with_overrides(&config.toml.pipeline.routes);

    println!();
    println!("Routing Graph");
    println!("=============");
    println!();
    for edge in graph.edges() {
        let condition = match &edge.issue {
            Some(issue) => style(format!("[{}]", issue)).yellow().to_string(),
            None => style("[default]").dim().to_string(),
        };
        println!(
            "  {:<15} {:<32} -> {}",
            edge.from,
            condition,
            edge.to.join(", ")
        );
    }
    println!();
    println!("Default path: {} stages", graph.default_path_len());
    let approvals = &config.toml.pipeline.approval_stages;
    if !approvals.is_empty() {
        println!("Approval required after: {}", approvals.join(", "));
    }
    println!();
}
