//! Server topology handed to workers.
//!
//! The node-addressing service stays a collaborator; workers only need the
//! server node ids and the contiguous key partition they serve, frozen at
//! construction.

use dgt_core::range::{validate_partition, Range};
use dgt_core::types::NodeId;

/// One server: its node id and the key range it owns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServerSlot {
    pub node: NodeId,
    pub range: Range,
}

/// The worker-side view of the server group.
#[derive(Clone, Debug)]
pub struct ServerMap {
    my_node: NodeId,
    slots: Vec<ServerSlot>,
    ranges: Vec<Range>,
}

impl ServerMap {
    pub fn new(my_node: NodeId, slots: Vec<ServerSlot>) -> anyhow::Result<Self> {
        anyhow::ensure!(!slots.is_empty(), "server map needs at least one server");
        let ranges: Vec<Range> = slots.iter().map(|s| s.range).collect();
        validate_partition(&ranges)?;
        Ok(Self {
            my_node,
            slots,
            ranges,
        })
    }

    /// Convenience constructor: split `[0, u64::MAX)` evenly over `nodes`.
    pub fn even(my_node: NodeId, nodes: &[NodeId]) -> anyhow::Result<Self> {
        anyhow::ensure!(!nodes.is_empty(), "server map needs at least one server");
        let n = nodes.len() as u64;
        let step = u64::MAX / n;
        let slots = nodes
            .iter()
            .enumerate()
            .map(|(i, &node)| ServerSlot {
                node,
                range: Range::new(
                    i as u64 * step,
                    if i as u64 == n - 1 {
                        u64::MAX
                    } else {
                        (i as u64 + 1) * step
                    },
                ),
            })
            .collect();
        Self::new(my_node, slots)
    }

    pub fn my_node(&self) -> NodeId {
        self.my_node
    }

    pub fn num_servers(&self) -> usize {
        self.slots.len()
    }

    /// Key ranges in server-rank order.
    pub fn key_ranges(&self) -> &[Range] {
        &self.ranges
    }

    /// Node id of the server at `rank`.
    pub fn node_of(&self, rank: usize) -> NodeId {
        self.slots[rank].node
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn even_split_covers_key_space() {
        let map = ServerMap::even(1, &[8, 9, 10]).unwrap();
        assert_eq!(map.num_servers(), 3);
        assert_eq!(map.key_ranges()[0].begin, 0);
        assert_eq!(map.key_ranges()[2].end, u64::MAX);
        assert_eq!(map.node_of(1), 9);
        validate_partition(map.key_ranges()).unwrap();
    }

    #[test]
    fn rejects_non_contiguous_slots() {
        let slots = vec![
            ServerSlot {
                node: 8,
                range: Range::new(0, 10),
            },
            ServerSlot {
                node: 9,
                range: Range::new(11, 20),
            },
        ];
        assert!(ServerMap::new(1, slots).is_err());
    }
}
