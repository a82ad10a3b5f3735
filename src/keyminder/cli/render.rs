use colored::Colorize;
use keyminder::model::{ATTR_QUICKLINK, ATTR_TEXT};
use keyminder::{Document, Node, NodeId};

const BRANCH: &str = "├── ";
const LAST_BRANCH: &str = "└── ";
const PIPE: &str = "│   ";
const SPACE: &str = "    ";

/// Renders the tree below the root, one node per line.
pub fn render_tree(doc: &Document, show_ids: bool) -> String {
    let mut out = String::new();
    if doc.is_empty() {
        out.push_str(&format!("{}\n", "(empty)".dimmed()));
        return out;
    }
    render_children(doc, NodeId::ROOT, "", show_ids, &mut out);
    out
}

fn render_children(doc: &Document, parent: NodeId, prefix: &str, show_ids: bool, out: &mut String) {
    let children: Vec<&Node> = doc.children(parent).collect();
    let count = children.len();
    for (i, node) in children.into_iter().enumerate() {
        let last = i + 1 == count;
        let branch = if last { LAST_BRANCH } else { BRANCH };
        out.push_str(prefix);
        out.push_str(branch);
        out.push_str(&node_label(node, show_ids));
        out.push('\n');

        let next = format!("{}{}", prefix, if last { SPACE } else { PIPE });
        render_children(doc, node.id(), &next, show_ids, out);
    }
}

fn node_label(node: &Node, show_ids: bool) -> String {
    let mut label = if node.has_children() {
        node.text().bold().to_string()
    } else {
        node.text().to_string()
    };
    if let Some(link) = node.attribute(ATTR_QUICKLINK) {
        label.push_str(&format!(" {}", format!("@{link}").yellow()));
    }
    if show_ids {
        label.push_str(&format!(" {}", format!("[{}]", node.id()).dimmed()));
    }
    label
}

/// Text first, then the remaining attributes sorted by key.
pub fn render_attributes(node: &Node) -> String {
    let mut keys: Vec<&String> = node.attributes().keys().collect();
    keys.sort();

    let mut out = format!("{} = {}\n", ATTR_TEXT.cyan(), node.text());
    for key in keys {
        if let Some(value) = node.attribute(key) {
            out.push_str(&format!("{} = {}\n", key.cyan(), value));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tree_uses_box_drawing_branches() {
        colored::control::set_override(false);
        let mut doc = Document::default();
        let a = doc.add_new(NodeId::ROOT, "Servers").unwrap();
        doc.add_new(a, "db01").unwrap();
        doc.add_new(NodeId::ROOT, "Mail").unwrap();

        let out = render_tree(&doc, false);
        assert_eq!(out, "├── Servers\n│   └── db01\n└── Mail\n");
    }

    #[test]
    fn attributes_list_text_first() {
        colored::control::set_override(false);
        let mut doc = Document::default();
        doc.set_timestamps(false);
        let a = doc.add_new(NodeId::ROOT, "Mail").unwrap();
        doc.set_attribute(a, "user", "alice").unwrap();
        doc.set_attribute(a, "host", "imap").unwrap();

        let out = render_attributes(doc.node(a).unwrap());
        assert_eq!(out, "text = Mail\nhost = imap\nuser = alice\n");
    }
}
