use std::collections::{HashMap, HashSet};

use crate::types::TrxId;

pub(crate) struct WaitForGraph {
    // key: transaction id, value: the transactions that the key transaction is waiting for
    graph: HashMap<TrxId, HashSet<TrxId>>,
}

impl WaitForGraph {
    pub(crate) fn new() -> Self {
        Self {
            graph: HashMap::new(),
        }
    }

    pub(crate) fn add_edge(&mut self, from: TrxId, to: TrxId) {
        if from == to {
            return;
        }
        self.graph.entry(from).or_insert_with(HashSet::new).insert(to);
    }

    /// Forget what the transaction is waiting for.
    pub(crate) fn remove_waiter(&mut self, trx_id: TrxId) {
        self.graph.remove(&trx_id);
    }

    /// Remove the transaction from the graph entirely, both as waiter
    /// and as holder.
    pub(crate) fn remove_transaction(&mut self, trx_id: TrxId) {
        self.graph.remove(&trx_id);
        for holders in self.graph.values_mut() {
            holders.remove(&trx_id);
        }
    }

    pub(crate) fn waits_for(&self, trx_id: TrxId) -> Option<&HashSet<TrxId>> {
        self.graph.get(&trx_id)
    }

    /// Check if `start` is part of a cycle.
    pub(crate) fn exists_cycle_from(&self, start: TrxId) -> bool {
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        self.is_cyclic(start, &mut visited, &mut rec_stack)
    }

    /// Check if there is a cycle in the wait-for graph.
    pub(crate) fn exists_cycle(&self) -> bool {
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();

        for &tid in self.graph.keys() {
            if self.is_cyclic(tid, &mut visited, &mut rec_stack) {
                return true;
            }
        }

        false
    }

    fn is_cyclic(
        &self,
        tid: TrxId,
        visited: &mut HashSet<TrxId>,
        rec_stack: &mut HashSet<TrxId>,
    ) -> bool {
        if !visited.contains(&tid) {
            visited.insert(tid);
            rec_stack.insert(tid);

            if let Some(holders) = self.graph.get(&tid) {
                for &t in holders {
                    if !visited.contains(&t) && self.is_cyclic(t, visited, rec_stack) {
                        return true;
                    } else if rec_stack.contains(&t) {
                        return true;
                    }
                }
            }
        }

        rec_stack.remove(&tid);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle() {
        let mut g = WaitForGraph::new();
        g.add_edge(1, 2);
        g.add_edge(2, 3);
        assert!(!g.exists_cycle());
        g.add_edge(3, 1);
        assert!(g.exists_cycle());
        assert!(g.exists_cycle_from(2));

        g.remove_transaction(3);
        assert!(!g.exists_cycle());
        assert!(g.waits_for(2).map_or(true, |s| s.is_empty()));
    }
}
