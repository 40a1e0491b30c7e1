//! Placement decision for newly admitted jobs.

/// Per-node load as read inside the admission transaction.
#[derive(Debug, Clone, Copy)]
pub struct NodeLoad {
    pub node: usize,
    pub projected_seconds: i64,
    pub reachable: bool,
}

/// Choose the target node: smallest projected queue time, ties broken by
/// lowest index. Quarantined nodes are only considered when no reachable
/// node exists, so placement always succeeds while the pool is non-empty.
pub fn choose(loads: &[NodeLoad]) -> Option<usize> {
    let pick = |candidates: &mut dyn Iterator<Item = &NodeLoad>| {
        candidates
            .min_by_key(|load| (load.projected_seconds, load.node))
            .map(|load| load.node)
    };
    pick(&mut loads.iter().filter(|load| load.reachable)).or_else(|| pick(&mut loads.iter()))
}
