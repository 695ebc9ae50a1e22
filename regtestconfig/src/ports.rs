//! Deterministic port layout.
//!
//! Every node gets a p2p and an rpc port derived from its index and a seed,
//! so that peers can be named in arguments before anything is listening, and
//! so that two runs with different seeds land on disjoint ranges.
use crate::MAX_NODES;

pub const PORT_MIN: u32 = 11000;
pub const PORT_RANGE: u32 = 5000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortSeed(u32);

impl PortSeed {
    pub fn new(seed: u32) -> Self {
        Self(seed)
    }

    /// Seeded with the process id, which is unique among concurrently
    /// running harnesses.
    pub fn from_process() -> Self {
        Self(std::process::id())
    }

    fn offset(&self) -> u32 {
        let max_nodes = MAX_NODES as u32;
        max_nodes.wrapping_mul(self.0) % (PORT_RANGE - 1 - max_nodes)
    }

    pub fn p2p_port(&self, index: usize) -> u16 {
        (PORT_MIN + index as u32 + self.offset()) as u16
    }

    pub fn rpc_port(&self, index: usize) -> u16 {
        (PORT_MIN + PORT_RANGE + index as u32 + self.offset()) as u16
    }
}

/// True when nothing is bound to `port` on loopback.
pub fn is_free(port: u16) -> bool {
    portpicker::is_free(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ports_stay_in_their_ranges() {
        for seed in [0, 1, 4242, u32::MAX] {
            let seed = PortSeed::new(seed);
            for index in 0..MAX_NODES {
                let p2p = seed.p2p_port(index) as u32;
                let rpc = seed.rpc_port(index) as u32;
                assert!((PORT_MIN..PORT_MIN + PORT_RANGE).contains(&p2p));
                assert!((PORT_MIN + PORT_RANGE..PORT_MIN + 2 * PORT_RANGE).contains(&rpc));
            }
        }
    }

    #[test]
    fn distinct_seeds_do_not_overlap() {
        let a = PortSeed::new(1);
        let b = PortSeed::new(2);
        let a_ports: Vec<u16> = (0..MAX_NODES).map(|i| a.rpc_port(i)).collect();
        assert!((0..MAX_NODES).all(|i| !a_ports.contains(&b.rpc_port(i))));
    }
}
