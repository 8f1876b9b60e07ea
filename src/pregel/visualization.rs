//! Mermaid diagram helpers
//!
//! Used by [`Graph::to_mermaid`](crate::workflow::graph::Graph::to_mermaid).
//!
//! # Node Shapes
//!
//! | NodeKind  | Shape             | Mermaid Syntax |
//! |-----------|-------------------|----------------|
//! | Function  | Rectangle         | `id[label]`    |
//! | Gate      | Diamond           | `id{label}`    |
//! | Interrupt | Hexagon           | `id{{label}}`  |
//! | Graph     | Subroutine        | `id[[label]]`  |
//! | END       | Stadium           | `id([label])`  |

use super::step::StepStatus;
use crate::workflow::node::NodeKind;

/// Sanitize a node name for use as a Mermaid node identifier.
///
/// Mermaid node IDs must be alphanumeric (plus underscores).
pub fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Render a node with the Mermaid shape of its kind
pub fn render_node(name: &str, kind: Option<&NodeKind>) -> String {
    let safe_id = sanitize_id(name);

    match kind {
        Some(NodeKind::Function) => format!("    {}[{}]", safe_id, name),
        Some(NodeKind::Gate(_)) => format!("    {}{{{}}}", safe_id, name),
        Some(NodeKind::Interrupt(_)) => format!("    {}{{{{{}}}}}", safe_id, name),
        Some(NodeKind::Graph) => format!("    {}[[{}]]", safe_id, name),
        None => format!("    {}([{}])", safe_id, name),
    }
}

/// Render a node with a class reflecting its latest step status
pub fn render_node_with_status(
    name: &str,
    kind: Option<&NodeKind>,
    status: Option<StepStatus>,
) -> String {
    let base = render_node(name, kind);
    match status {
        Some(StepStatus::Completed) => format!("{}:::completed", base),
        Some(StepStatus::Failed) => format!("{}:::failed", base),
        Some(StepStatus::Paused) => format!("{}:::paused", base),
        Some(StepStatus::Stopped) => format!("{}:::stopped", base),
        None => base,
    }
}

/// Render an edge.
///
/// - Data edges: solid arrow labelled with the value name
/// - Gate edges: dotted arrow
pub fn render_edge(from: &str, to: &str, label: Option<&str>, control: bool) -> String {
    let from_safe = sanitize_id(from);
    let to_safe = sanitize_id(to);

    match (control, label) {
        (true, _) => format!("    {} -.-> {}", from_safe, to_safe),
        (false, Some(label)) => format!("    {} -- \"{}\" --> {}", from_safe, label, to_safe),
        (false, None) => format!("    {} --> {}", from_safe, to_safe),
    }
}

/// CSS class definitions for step statuses
pub const STYLE_DEFS: &str = r#"
    classDef completed fill:#D3D3D3,stroke:#696969,stroke-width:1px
    classDef failed fill:#F4A6A6,stroke:#B22222,stroke-width:2px
    classDef paused fill:#FFE4B5,stroke:#FF8C00,stroke-width:2px
    classDef stopped fill:#E0E0FF,stroke:#4040A0,stroke-width:1px
"#;
