//! Slot ownership map used to route keyspace subscriptions to the node
//! that emits their events.

use std::collections::BTreeSet;
use std::fmt;

use redis::Value;

use super::slot::SLOT_COUNT;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
    pub node: NodeAddress,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterTopology {
    ranges: Vec<SlotRange>,
}

impl ClusterTopology {
    /// Standalone deployments: one node owns every slot.
    pub fn single(node: NodeAddress) -> Self {
        Self {
            ranges: vec![SlotRange {
                start: 0,
                end: SLOT_COUNT - 1,
                node,
            }],
        }
    }

    pub fn from_ranges(mut ranges: Vec<SlotRange>) -> Self {
        ranges.sort_by_key(|r| r.start);
        Self { ranges }
    }

    pub fn node_for_slot(&self, slot: u16) -> Option<&NodeAddress> {
        let idx = self.ranges.partition_point(|r| r.end < slot);
        self.ranges
            .get(idx)
            .filter(|r| r.start <= slot)
            .map(|r| &r.node)
    }

    pub fn nodes(&self) -> BTreeSet<&NodeAddress> {
        self.ranges.iter().map(|r| &r.node).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Parse a `CLUSTER SLOTS` reply, keeping only each range's master.
    pub fn from_cluster_slots(reply: &Value) -> Result<Self, String> {
        let Value::Array(entries) = reply else {
            return Err(format!("expected array reply, got {:?}", reply));
        };

        let mut ranges = Vec::with_capacity(entries.len());
        for entry in entries {
            let Value::Array(fields) = entry else {
                return Err("slot range entry is not an array".to_string());
            };
            let (Some(start), Some(end), Some(master)) =
                (fields.first(), fields.get(1), fields.get(2))
            else {
                return Err("slot range entry is too short".to_string());
            };

            ranges.push(SlotRange {
                start: as_int(start)? as u16,
                end: as_int(end)? as u16,
                node: parse_node(master)?,
            });
        }

        Ok(Self::from_ranges(ranges))
    }
}

fn parse_node(value: &Value) -> Result<NodeAddress, String> {
    let Value::Array(fields) = value else {
        return Err("node entry is not an array".to_string());
    };
    let host = match fields.first() {
        Some(Value::BulkString(bytes)) => String::from_utf8_lossy(bytes).into_owned(),
        Some(Value::SimpleString(s)) => s.clone(),
        other => return Err(format!("unexpected node host {:?}", other)),
    };
    let port = fields
        .get(1)
        .ok_or_else(|| "node entry has no port".to_string())
        .and_then(as_int)?;
    Ok(NodeAddress::new(host, port as u16))
}

fn as_int(value: &Value) -> Result<i64, String> {
    match value {
        Value::Int(n) => Ok(*n),
        Value::BulkString(bytes) => String::from_utf8_lossy(bytes)
            .parse()
            .map_err(|e| format!("invalid integer: {}", e)),
        other => Err(format!("expected integer, got {:?}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_value(host: &str, port: i64) -> Value {
        Value::Array(vec![
            Value::BulkString(host.as_bytes().to_vec()),
            Value::Int(port),
            Value::BulkString(b"node-id".to_vec()),
        ])
    }

    #[test]
    fn test_single_node_owns_all_slots() {
        let topology = ClusterTopology::single(NodeAddress::new("localhost", 6379));
        assert_eq!(topology.node_for_slot(0).map(|n| n.port), Some(6379));
        assert_eq!(topology.node_for_slot(SLOT_COUNT - 1).map(|n| n.port), Some(6379));
        assert_eq!(topology.nodes().len(), 1);
    }

    #[test]
    fn test_parse_cluster_slots_reply() {
        let reply = Value::Array(vec![
            Value::Array(vec![
                Value::Int(8192),
                Value::Int(16383),
                node_value("10.0.0.2", 7001),
                node_value("10.0.0.4", 7003),
            ]),
            Value::Array(vec![
                Value::Int(0),
                Value::Int(8191),
                node_value("10.0.0.1", 7000),
            ]),
        ]);

        let topology = ClusterTopology::from_cluster_slots(&reply).unwrap();
        assert_eq!(
            topology.node_for_slot(100),
            Some(&NodeAddress::new("10.0.0.1", 7000))
        );
        assert_eq!(
            topology.node_for_slot(8192),
            Some(&NodeAddress::new("10.0.0.2", 7001))
        );
        assert_eq!(topology.nodes().len(), 2);
    }

    #[test]
    fn test_uncovered_slot_has_no_node() {
        let topology = ClusterTopology::from_ranges(vec![SlotRange {
            start: 10,
            end: 20,
            node: NodeAddress::new("a", 1),
        }]);
        assert!(topology.node_for_slot(5).is_none());
        assert!(topology.node_for_slot(21).is_none());
        assert!(topology.node_for_slot(15).is_some());
    }

    #[test]
    fn test_malformed_reply_is_rejected() {
        assert!(ClusterTopology::from_cluster_slots(&Value::Int(1)).is_err());
        let short = Value::Array(vec![Value::Array(vec![Value::Int(0)])]);
        assert!(ClusterTopology::from_cluster_slots(&short).is_err());
    }
}
