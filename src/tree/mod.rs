//! History tree of visited narrative nodes.
//!
//! Each node is one (name, entry variable state) pair reached from a given
//! parent. Nodes and the checkpoints saved within them share the checkpoint
//! region of the log.

mod nodes;

pub use nodes::NodeTree;
